//! SQLite persistence for telemetry packets.
//!
//! The ingestor is the only writer; the viewer opens its own reader connection
//! and re-queries on every refresh.

use crate::model::Packet;
use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, types::Value, Connection, OpenFlags};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS telemetry_packets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        type TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        sender TEXT NOT NULL,
        endpoints TEXT NOT NULL, -- stored as JSON array string
        timestamp_ms INTEGER NOT NULL,
        received_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE TABLE IF NOT EXISTS telemetry_values (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        packet_id INTEGER NOT NULL,
        idx INTEGER NOT NULL,
        value REAL,
        FOREIGN KEY(packet_id) REFERENCES telemetry_packets(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_packets_type_sender
        ON telemetry_packets(type, sender);
    CREATE INDEX IF NOT EXISTS idx_values_packet
        ON telemetry_values(packet_id);
";

/// Format a host receive time the way it is stored in `received_at`.
pub fn format_received_at(t: OffsetDateTime) -> String {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]");
    let t = t.to_offset(time::UtcOffset::UTC);
    t.format(&fmt)
        .unwrap_or_else(|_| t.unix_timestamp().to_string())
}

/// Parse a stored `received_at`, with or without milliseconds.
pub fn parse_received_at(s: &str) -> Option<PrimitiveDateTime> {
    let with_ms = format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]");
    let whole = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let s = s.trim();
    PrimitiveDateTime::parse(s, &with_ms)
        .or_else(|_| PrimitiveDateTime::parse(s, &whole))
        .ok()
}

/// Query filter for joined packet/value rows.
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    pub packet_type: Option<String>,
    pub sender: Option<String>,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    /// Only the most recent N matching packets.
    pub max_packets: Option<usize>,
}

/// One joined packet/value row.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRow {
    pub packet_id: i64,
    pub packet_type: String,
    pub sender: String,
    pub endpoints: Vec<String>,
    pub timestamp_ms: i64,
    pub received_at: String,
    pub idx: i64,
    pub value: Option<f64>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open the database for writing and make sure the schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open database {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Open the database for a concurrent reader.
    ///
    /// WAL is requested so the reader does not block the ingestor; filesystems
    /// that cannot do WAL keep the default journal.
    pub fn open_reader(path: &Path) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("open database {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        if let Err(e) = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0)) {
            tracing::debug!(error = %e, "journal_mode=WAL not available");
        }
        Ok(Self { conn })
    }

    pub fn ensure_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .context("create telemetry schema")
    }

    /// Whether the telemetry tables exist yet (the reader may start first).
    pub fn has_schema(&self) -> Result<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type = 'table' AND name IN ('telemetry_packets', 'telemetry_values')",
            [],
            |row| row.get(0),
        )?;
        Ok(n == 2)
    }

    /// Insert a packet and its values atomically. Returns the packet id.
    pub fn insert_packet(&mut self, pkt: &Packet, received_at: &str) -> Result<i64> {
        let endpoints = serde_json::to_string(&pkt.endpoints)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO telemetry_packets(type, size_bytes, sender, endpoints, timestamp_ms, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                pkt.packet_type,
                pkt.size_bytes,
                pkt.sender,
                endpoints,
                pkt.timestamp_ms,
                received_at,
            ],
        )?;
        let packet_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO telemetry_values(packet_id, idx, value) VALUES (?1, ?2, ?3)",
            )?;
            for (i, v) in pkt.values.iter().enumerate() {
                stmt.execute(params![packet_id, i as i64, v])?;
            }
        }
        tx.commit().context("commit packet")?;
        Ok(packet_id)
    }

    /// Map of packet type to its sorted, distinct senders.
    pub fn list_types_and_senders(&self) -> Result<BTreeMap<String, Vec<String>>> {
        if !self.has_schema()? {
            return Ok(BTreeMap::new());
        }
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT type, sender FROM telemetry_packets")?;
        let pairs = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut mapping: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for pair in pairs {
            let (t, s) = pair?;
            mapping.entry(t).or_default().push(s);
        }
        for senders in mapping.values_mut() {
            senders.sort();
            senders.dedup();
        }
        Ok(mapping)
    }

    /// Joined packet/value rows ordered by receive time, then value index.
    pub fn fetch_rows(&self, filter: &RowFilter) -> Result<Vec<SampleRow>> {
        if !self.has_schema()? {
            return Ok(Vec::new());
        }

        let mut clauses = Vec::new();
        let mut args: Vec<Value> = Vec::new();
        if let Some(t) = &filter.packet_type {
            clauses.push("type = ?");
            args.push(Value::Text(t.clone()));
        }
        if let Some(s) = &filter.sender {
            clauses.push("sender = ?");
            args.push(Value::Text(s.clone()));
        }
        if let Some(start) = filter.start_ms {
            clauses.push("timestamp_ms >= ?");
            args.push(Value::Integer(start));
        }
        if let Some(end) = filter.end_ms {
            clauses.push("timestamp_ms <= ?");
            args.push(Value::Integer(end));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        // LIMIT -1 is "no limit" in SQLite.
        let limit = filter
            .max_packets
            .map(|n| i64::try_from(n).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        args.push(Value::Integer(limit));

        let sql = format!(
            "SELECT p.id, p.type, p.sender, p.endpoints, p.timestamp_ms, p.received_at, v.idx, v.value
             FROM telemetry_packets p
             JOIN telemetry_values v ON v.packet_id = p.id
             WHERE p.id IN (
                 SELECT id FROM telemetry_packets {where_sql}
                 ORDER BY id DESC LIMIT ?
             )
             ORDER BY p.received_at ASC, p.id ASC, v.idx ASC"
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            let endpoints_raw: String = row.get(3)?;
            Ok(SampleRow {
                packet_id: row.get(0)?,
                packet_type: row.get(1)?,
                sender: row.get(2)?,
                endpoints: decode_endpoints(&endpoints_raw),
                timestamp_ms: row.get(4)?,
                received_at: row.get(5)?,
                idx: row.get(6)?,
                value: row.get(7)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Endpoints are a JSON array string; anything else is kept as one opaque entry.
fn decode_endpoints(raw: &str) -> Vec<String> {
    if raw.starts_with('[') {
        if let Ok(v) = serde_json::from_str::<Vec<String>>(raw) {
            return v;
        }
    }
    if raw.is_empty() {
        Vec::new()
    } else {
        vec![raw.to_string()]
    }
}
