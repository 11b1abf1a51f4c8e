//! Serial port -> SQLite ingestion.
//!
//! Owns the reconnect loop and per-line dispatch. Reading is blocking and runs
//! on a dedicated blocking task; shutdown is a shared flag checked between
//! reads (the port has a short read timeout for exactly that reason).

mod mirror;
mod source;

use mirror::{JsonlMirror, TextMirror};
use source::{open_file, open_serial, LineSource, ReadOutcome};

use crate::model::Packet;
use crate::packet::{self, PacketError};
use crate::shutdown::ShutdownSignals;
use crate::storage::{self, Store};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const DEFAULT_PORT: &str = "/dev/tty.usbmodem207435A554301";
pub const DEFAULT_BAUD: u32 = 115_200;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(500);
const READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub port: String,
    pub baud: u32,
    pub db: PathBuf,
    pub no_db: bool,
    pub out_jsonl: Option<PathBuf>,
    pub file_flag: Option<String>,
    pub out_txt: Option<PathBuf>,
    /// Replay this file instead of reading the serial port.
    pub input: Option<PathBuf>,
    pub reconnect_delay: Duration,
}

/// What happened to one input line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    /// Not a telemetry line; discarded silently.
    Ignored,
    /// Telemetry prefix but unparsable.
    Skipped,
    Stored(Packet),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub lines: u64,
    pub packets: u64,
    pub skipped: u64,
}

/// Parses lines and fans packets out to the store and mirrors.
pub struct Ingestor {
    store: Option<Store>,
    text: Option<TextMirror>,
    jsonl: Option<JsonlMirror>,
    stats: IngestStats,
}

impl Ingestor {
    pub fn new(store: Option<Store>, text: Option<TextMirror>, jsonl: Option<JsonlMirror>) -> Self {
        Self {
            store,
            text,
            jsonl,
            stats: IngestStats::default(),
        }
    }

    /// Open every sink the config asks for.
    pub fn from_config(cfg: &IngestConfig) -> Result<Self> {
        let store = if cfg.no_db {
            None
        } else {
            Some(Store::open(&cfg.db)?)
        };
        let text = cfg.out_txt.as_deref().map(TextMirror::open).transpose()?;
        let jsonl = cfg
            .out_jsonl
            .as_deref()
            .map(|p| JsonlMirror::open(p, cfg.file_flag.clone()))
            .transpose()?;
        Ok(Self::new(store, text, jsonl))
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    pub fn handle_line(&mut self, line: &str) -> Result<LineOutcome> {
        self.handle_line_at(line, OffsetDateTime::now_utc())
    }

    /// Store errors are fatal; mirror errors are logged and the packet is kept.
    pub fn handle_line_at(&mut self, line: &str, received: OffsetDateTime) -> Result<LineOutcome> {
        self.stats.lines += 1;
        let pkt = match packet::parse_packet_line(line) {
            Ok(p) => p,
            Err(PacketError::NotTelemetry) => return Ok(LineOutcome::Ignored),
            Err(e) => {
                self.stats.skipped += 1;
                warn!(error = %e, line, "skipping unparsable line");
                return Ok(LineOutcome::Skipped);
            }
        };

        if let Some(store) = self.store.as_mut() {
            store
                .insert_packet(&pkt, &storage::format_received_at(received))
                .context("store packet")?;
        }
        if let Some(text) = self.text.as_mut() {
            if let Err(e) = text.append(&pkt, received) {
                warn!(path = %text.path().display(), error = %e, "text mirror write failed");
            }
        }
        if let Some(jsonl) = self.jsonl.as_mut() {
            if let Err(e) = jsonl.append(&pkt, received) {
                warn!(path = %jsonl.path().display(), error = %e, "jsonl mirror write failed");
            }
        }

        self.stats.packets += 1;
        debug!(
            packet_type = %pkt.packet_type,
            sender = %pkt.sender,
            values = pkt.values.len(),
            "packet stored"
        );
        Ok(LineOutcome::Stored(pkt))
    }
}

/// Why `pump` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    Stopped,
    Closed,
}

/// Feed lines from `source` into the ingestor until stop or end of input.
pub fn pump(
    source: &mut dyn LineSource,
    ingestor: &mut Ingestor,
    stop: &AtomicBool,
) -> Result<PumpEnd> {
    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(PumpEnd::Stopped);
        }
        match source.next_line().context("read line")? {
            ReadOutcome::Line(line) => {
                ingestor.handle_line(&line)?;
            }
            ReadOutcome::Idle => {}
            ReadOutcome::Closed => return Ok(PumpEnd::Closed),
        }
    }
}

/// Sleep in short slices so a stop request is honored promptly.
fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}

fn is_store_error(e: &anyhow::Error) -> bool {
    e.chain()
        .any(|c| c.downcast_ref::<rusqlite::Error>().is_some())
}

/// Blocking ingest loop. Returns once `stop` is set (or the replay file ends).
pub fn run_blocking(cfg: &IngestConfig, stop: &AtomicBool) -> Result<IngestStats> {
    let mut ingestor = Ingestor::from_config(cfg)?;

    let db = if cfg.no_db {
        "<disabled>".to_string()
    } else {
        cfg.db.display().to_string()
    };
    info!(
        db = %db,
        port = %cfg.port,
        baud = cfg.baud,
        "starting ingest"
    );
    if let Some(p) = &cfg.out_jsonl {
        info!(path = %p.display(), flag = ?cfg.file_flag, "JSONL mirror enabled");
    }
    if let Some(p) = &cfg.out_txt {
        info!(path = %p.display(), "text mirror enabled");
    }

    if let Some(input) = &cfg.input {
        let mut source =
            open_file(input).with_context(|| format!("open replay file {}", input.display()))?;
        info!(path = %input.display(), "replaying capture");
        pump(&mut source, &mut ingestor, stop)?;
    } else {
        while !stop.load(Ordering::Relaxed) {
            let mut source = match open_serial(&cfg.port, cfg.baud, READ_TIMEOUT) {
                Ok(s) => s,
                Err(e) => {
                    // Keep retrying until the USB serial shows up.
                    debug!(port = %cfg.port, error = %e, "serial port not available");
                    sleep_unless_stopped(cfg.reconnect_delay, stop);
                    continue;
                }
            };
            info!(port = %cfg.port, baud = cfg.baud, "connected");

            match pump(&mut source, &mut ingestor, stop) {
                Ok(PumpEnd::Stopped) => {}
                Ok(PumpEnd::Closed) => warn!(port = %cfg.port, "serial port closed, reconnecting"),
                Err(e) if is_store_error(&e) => return Err(e),
                Err(e) => warn!(error = %format!("{e:#}"), "serial error, reconnecting"),
            }
            drop(source);
            if !stop.load(Ordering::Relaxed) {
                sleep_unless_stopped(cfg.reconnect_delay, stop);
            }
        }
    }

    let stats = ingestor.stats();
    info!(
        lines = stats.lines,
        packets = stats.packets,
        skipped = stats.skipped,
        "clean exit"
    );
    Ok(stats)
}

/// Run the ingestor until SIGINT/SIGTERM (or end of a replay file).
pub async fn run(cfg: IngestConfig) -> Result<()> {
    let mut signals = ShutdownSignals::install()?;
    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = stop.clone();
    let mut worker = tokio::task::spawn_blocking(move || run_blocking(&cfg, &worker_stop));

    tokio::select! {
        res = &mut worker => {
            res.context("ingest worker panicked")??;
            return Ok(());
        }
        sig = signals.recv() => {
            info!(signal = ?sig, "stopping");
            stop.store(true, Ordering::Relaxed);
        }
    }

    worker.await.context("ingest worker panicked")??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::source::LineReader;
    use super::*;
    use crate::storage::RowFilter;
    use tempfile::TempDir;

    const BARO: &str = "on_radio_packet: {Type: BAROMETER_DATA, Size: 12, Sender: CrashNBurn, Endpoints: [SD_CARD, RADIO], Timestamp: 3076 (3s 076ms), Data: 100551.117187500000, 22.666557312012, -0.454471111298}";

    fn config(dir: &TempDir) -> IngestConfig {
        IngestConfig {
            port: "/dev/null-port".into(),
            baud: DEFAULT_BAUD,
            db: dir.path().join("telemetry.db"),
            no_db: false,
            out_jsonl: None,
            file_flag: None,
            out_txt: None,
            input: None,
            reconnect_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn dispatches_by_line_kind() {
        let dir = TempDir::new().unwrap();
        let mut ing = Ingestor::from_config(&config(&dir)).unwrap();
        assert_eq!(ing.handle_line("boot ok").unwrap(), LineOutcome::Ignored);
        assert_eq!(
            ing.handle_line("on_radio_packet: {garbage}").unwrap(),
            LineOutcome::Skipped
        );
        assert!(matches!(ing.handle_line(BARO).unwrap(), LineOutcome::Stored(_)));
        assert_eq!(
            ing.stats(),
            IngestStats {
                lines: 3,
                packets: 1,
                skipped: 1
            }
        );
    }

    #[test]
    fn no_db_writes_only_mirrors() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.no_db = true;
        cfg.out_txt = Some(dir.path().join("out/telemetry.txt"));
        cfg.out_jsonl = Some(dir.path().join("out/telemetry.jsonl"));
        let mut ing = Ingestor::from_config(&cfg).unwrap();
        ing.handle_line(BARO).unwrap();

        assert!(!cfg.db.exists());
        let txt = std::fs::read_to_string(cfg.out_txt.as_ref().unwrap()).unwrap();
        assert!(txt.contains("Type=BAROMETER_DATA Sender=CrashNBurn"));
        let jsonl = std::fs::read_to_string(cfg.out_jsonl.as_ref().unwrap()).unwrap();
        assert_eq!(jsonl.lines().count(), 1);
    }

    #[test]
    fn replay_file_ends_cleanly() {
        let dir = TempDir::new().unwrap();
        let capture = dir.path().join("capture.log");
        std::fs::write(
            &capture,
            format!("[boot] hello\r\n{BARO}\r\non_radio_packet: nope\r\n{BARO}"),
        )
        .unwrap();
        let mut cfg = config(&dir);
        cfg.input = Some(capture);

        let stop = AtomicBool::new(false);
        let stats = run_blocking(&cfg, &stop).unwrap();
        assert_eq!(stats.packets, 2);
        assert_eq!(stats.skipped, 1);

        let store = Store::open_reader(&cfg.db).unwrap();
        let rows = store.fetch_rows(&RowFilter::default()).unwrap();
        assert_eq!(rows.len(), 6);
    }

    #[test]
    fn stop_flag_ends_reconnect_loop() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let stop = AtomicBool::new(true);
        let stats = run_blocking(&cfg, &stop).unwrap();
        assert_eq!(stats.lines, 0);
    }

    #[test]
    fn pump_stops_on_flag_before_reading() {
        let dir = TempDir::new().unwrap();
        let mut ing = Ingestor::from_config(&config(&dir)).unwrap();
        let mut src = LineReader::new(BARO.as_bytes(), true);
        let stop = AtomicBool::new(true);
        assert_eq!(pump(&mut src, &mut ing, &stop).unwrap(), PumpEnd::Stopped);
        assert_eq!(ing.stats().lines, 0);
    }
}
