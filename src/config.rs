//! Optional TOML configuration.
//!
//! Looked up in this order: `--config <path>`, `./telemetry.toml`, then
//! `<config dir>/radio-telemetry/config.toml`. Every field is optional; command
//! line flags win over the file, and the file wins over built-in defaults.
//!
//! ```toml
//! [ingest]
//! port = "/dev/ttyACM0"
//! baud = 115200
//! out_jsonl = "logs/telemetry.jsonl"
//! reconnect_delay = "500ms"
//!
//! [view]
//! refresh_sec = 0.5
//! time_axis = "sent"
//!
//! [launch]
//! env_file = ".telemetry/env"
//! grace = "2s"
//! ```

use crate::model::TimeAxis;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const LOCAL_CONFIG: &str = "telemetry.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub ingest: IngestSection,
    #[serde(default)]
    pub view: ViewSection,
    #[serde(default)]
    pub launch: LaunchSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestSection {
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub db: Option<PathBuf>,
    pub out_jsonl: Option<PathBuf>,
    pub out_txt: Option<PathBuf>,
    pub file_flag: Option<String>,
    pub no_db: Option<bool>,
    #[serde(default, with = "humantime_serde")]
    pub reconnect_delay: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ViewSection {
    pub db: Option<PathBuf>,
    pub refresh_sec: Option<f64>,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    pub max_packets: Option<usize>,
    pub time_axis: Option<TimeAxis>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchSection {
    pub db: Option<PathBuf>,
    pub refresh_sec: Option<f64>,
    pub env_file: Option<PathBuf>,
    pub ingest_log: Option<PathBuf>,
    pub ingest_program: Option<PathBuf>,
    pub view_program: Option<PathBuf>,
    #[serde(default, with = "humantime_serde")]
    pub grace: Option<Duration>,
}

impl TelemetryConfig {
    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).context("parse telemetry config")
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Resolve and load the configuration; no file at all means defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load_file(p);
        }
        match Self::discover() {
            Some(p) => {
                tracing::debug!(path = %p.display(), "using config file");
                Self::load_file(&p)
            }
            None => Ok(Self::default()),
        }
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(LOCAL_CONFIG);
        if local.is_file() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|d| d.join("radio-telemetry").join("config.toml"))
            .filter(|p| p.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg = TelemetryConfig::from_toml("").unwrap();
        assert!(cfg.ingest.port.is_none());
        assert!(cfg.view.refresh_sec.is_none());
        assert!(cfg.launch.grace.is_none());
    }

    #[test]
    fn parses_every_section() {
        let cfg = TelemetryConfig::from_toml(
            r#"
            [ingest]
            port = "/dev/ttyACM0"
            baud = 57600
            reconnect_delay = "250ms"
            no_db = true

            [view]
            refresh_sec = 0.3
            time_axis = "sent"
            max_packets = 500

            [launch]
            env_file = "custom.env"
            grace = "5s"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.ingest.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(cfg.ingest.baud, Some(57600));
        assert_eq!(cfg.ingest.reconnect_delay, Some(Duration::from_millis(250)));
        assert_eq!(cfg.ingest.no_db, Some(true));
        assert_eq!(cfg.view.time_axis, Some(TimeAxis::Sent));
        assert_eq!(cfg.view.max_packets, Some(500));
        assert_eq!(cfg.launch.grace, Some(Duration::from_secs(5)));
        assert_eq!(cfg.launch.env_file, Some(PathBuf::from("custom.env")));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(TelemetryConfig::from_toml("[view]\nrefresh = 1").is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(TelemetryConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
