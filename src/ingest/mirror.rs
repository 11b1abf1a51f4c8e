//! Append-only file mirrors of parsed packets.

use crate::model::Packet;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;

fn iso_seconds(t: OffsetDateTime) -> String {
    let fmt = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    t.format(&fmt)
        .unwrap_or_else(|_| t.unix_timestamp().to_string())
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))
}

/// One JSON object per line.
pub struct JsonlMirror {
    path: PathBuf,
    file: File,
    flag: Option<String>,
}

#[derive(Serialize)]
struct JsonlRecord<'a> {
    #[serde(flatten)]
    packet: &'a Packet,
    received_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    flag: Option<&'a str>,
}

impl JsonlMirror {
    pub fn open(path: &Path, flag: Option<String>) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            file: open_append(path)?,
            flag,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, pkt: &Packet, received: OffsetDateTime) -> Result<()> {
        let record = JsonlRecord {
            packet: pkt,
            received_at: format!("{}Z", iso_seconds(received)),
            flag: self.flag.as_deref(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        // One write per record so a killed process leaves whole lines behind.
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("write {}", self.path.display()))
    }
}

/// Human-readable one-line-per-packet log.
pub struct TextMirror {
    path: PathBuf,
    file: File,
}

impl TextMirror {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            file: open_append(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, pkt: &Packet, received: OffsetDateTime) -> Result<()> {
        let line = format_text_line(pkt, received);
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("write {}", self.path.display()))
    }
}

pub fn format_text_line(pkt: &Packet, received: OffsetDateTime) -> String {
    let endpoints = pkt
        .endpoints
        .iter()
        .map(|e| format!("'{e}'"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "[{}] Type={} Sender={} Endpoints=[{}] Timestamp={} Timestamp Human={} Data={:?}\n",
        iso_seconds(received),
        pkt.packet_type,
        pkt.sender,
        endpoints,
        pkt.timestamp_ms,
        pkt.timestamp_human,
        pkt.values,
    )
}
