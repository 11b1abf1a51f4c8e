//! Text summary builder for CLI output.
//!
//! Formats a snapshot as human-readable lines for `summary` and for the
//! viewer when built without the TUI.

use crate::model::{Panel, Snapshot};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn panel_lines(panel: &Panel, lines: &mut Vec<String>) {
    let endpoints = if panel.endpoints.is_empty() {
        "-".to_string()
    } else {
        panel.endpoints.join(", ")
    };
    lines.push(format!(
        "== {} / {} == packets {} endpoints {}",
        panel.packet_type, panel.sender, panel.packets, endpoints
    ));
    if panel.stats.is_empty() {
        lines.push("  No data".to_string());
        return;
    }
    for (idx, s) in &panel.stats {
        let n = panel.series.get(idx).map(|p| p.len()).unwrap_or(0);
        lines.push(format!(
            "  Idx {idx}: latest {:.3} min {:.3} max {:.3} mean {:.3} ({n} samples)",
            s.latest, s.min, s.max, s.mean
        ));
    }
}

/// Build a text summary of every panel in the snapshot.
pub(crate) fn build_text_summary(snap: &Snapshot) -> TextSummary {
    let mut lines = vec![format!(
        "Refreshed {} UTC (time axis: {})",
        snap.refreshed_at_utc,
        snap.time_axis.label()
    )];

    if snap.panel_count() == 0 {
        lines.push("No telemetry yet.".to_string());
        return TextSummary { lines };
    }

    for by_sender in snap.panels.values() {
        for panel in by_sender.values() {
            panel_lines(panel, &mut lines);
        }
    }
    TextSummary { lines }
}
