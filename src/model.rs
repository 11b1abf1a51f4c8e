use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One decoded `on_radio_packet:` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "type")]
    pub packet_type: String,
    pub size_bytes: i64,
    pub sender: String,
    pub endpoints: Vec<String>,
    pub timestamp_ms: i64,
    pub timestamp_human: String,
    pub values: Vec<f64>,
}

/// Which clock the viewer plots on the x-axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TimeAxis {
    /// Host receive time, seconds since the first packet in view.
    #[default]
    Received,
    /// Device timestamp in seconds.
    Sent,
}

impl TimeAxis {
    pub fn toggled(self) -> Self {
        match self {
            TimeAxis::Received => TimeAxis::Sent,
            TimeAxis::Sent => TimeAxis::Received,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TimeAxis::Received => "received",
            TimeAxis::Sent => "sent",
        }
    }
}

/// Summary statistics of one value index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesStats {
    pub latest: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

/// Plot data for one (type, sender) pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Panel {
    pub packet_type: String,
    pub sender: String,
    pub endpoints: Vec<String>,
    pub packets: usize,
    /// Value index -> (t seconds, value) points, oldest first.
    pub series: BTreeMap<i64, Vec<(f64, f64)>>,
    pub stats: BTreeMap<i64, SeriesStats>,
}

impl Panel {
    pub fn is_empty(&self) -> bool {
        self.series.values().all(|points| points.is_empty())
    }
}

/// Everything the viewer shows, loaded in one refresh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub refreshed_at_utc: String,
    pub time_axis: TimeAxis,
    /// type -> sender -> panel
    pub panels: BTreeMap<String, BTreeMap<String, Panel>>,
}

impl Snapshot {
    pub fn panel(&self, packet_type: &str, sender: &str) -> Option<&Panel> {
        self.panels.get(packet_type).and_then(|m| m.get(sender))
    }

    pub fn panel_count(&self) -> usize {
        self.panels.values().map(|m| m.len()).sum()
    }
}

/// Events emitted by the poller and consumed by the viewer.
#[derive(Debug, Clone)]
pub enum ViewEvent {
    Snapshot(Box<Snapshot>),
    Info(InfoEvent),
}

/// Structured info events for the viewer status line.
#[derive(Debug, Clone)]
pub enum InfoEvent {
    QueryFailed(String),
    Paused(bool),
    TimeAxisChanged(TimeAxis),
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::QueryFailed(err) => format!("Query failed: {err}"),
            InfoEvent::Paused(true) => "Paused".to_string(),
            InfoEvent::Paused(false) => "Resumed".to_string(),
            InfoEvent::TimeAxisChanged(axis) => format!("Time axis: {}", axis.label()),
        }
    }
}
