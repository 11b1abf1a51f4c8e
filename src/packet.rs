//! Parser for `on_radio_packet:` telemetry lines.
//!
//! Example line:
//!
//! ```text
//! on_radio_packet: {Type: BAROMETER_DATA, Size: 12, Sender: CrashNBurn, Endpoints: [SD_CARD, RADIO], Timestamp: 3076 (3s 076ms), Data: 100551.117187500000, 22.666557312012, -0.454471111298}
//! ```

use crate::model::Packet;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

pub const TELEM_PREFIX: &str = "on_radio_packet:";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("line does not start with `{TELEM_PREFIX}`")]
    NotTelemetry,
    #[error("unparsable telemetry line")]
    Malformed,
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
}

fn packet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)^on_radio_packet:\s*\{",
            r"\s*Type:\s*(?P<type>[A-Za-z0-9_-]+)\s*,\s*",
            r"Size:\s*(?P<size>\d+)\s*,\s*",
            r"Sender:\s*(?P<sender>[^,]+)\s*,\s*",
            r"Endpoints:\s*\[(?P<endpoints>[^\]]*)\]\s*,\s*",
            r"Timestamp:\s*(?P<ts_ms>\d+)\s*\((?P<ts_human>[^\)]*)\)\s*,\s*",
            r"Data:\s*(?P<data>.*)",
            r"\}\s*$",
        ))
        .expect("packet regex is valid")
    })
}

/// Split `"SD_CARD, RADIO"` into trimmed, non-empty names.
pub fn parse_endpoints(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `"1.5, 2, x, -3"` into floats; pieces that are not numbers are skipped.
pub fn parse_data_values(s: &str) -> Vec<f64> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter_map(|p| p.parse::<f64>().ok())
        .collect()
}

fn parse_int(field: &'static str, raw: &str) -> Result<i64, PacketError> {
    raw.parse::<i64>().map_err(|_| PacketError::OutOfRange {
        field,
        value: raw.to_string(),
    })
}

/// Parse one line read from the radio.
///
/// The prefix check is exact and runs on the line as received; the grammar
/// match runs on the trimmed line and accepts keys in any case.
pub fn parse_packet_line(line: &str) -> Result<Packet, PacketError> {
    if !line.starts_with(TELEM_PREFIX) {
        return Err(PacketError::NotTelemetry);
    }
    let caps = packet_re()
        .captures(line.trim())
        .ok_or(PacketError::Malformed)?;

    Ok(Packet {
        packet_type: caps["type"].to_uppercase(),
        size_bytes: parse_int("size", &caps["size"])?,
        sender: caps["sender"].trim().to_string(),
        endpoints: parse_endpoints(&caps["endpoints"]),
        timestamp_ms: parse_int("timestamp", &caps["ts_ms"])?,
        timestamp_human: caps["ts_human"].trim().to_string(),
        values: parse_data_values(&caps["data"]),
    })
}
