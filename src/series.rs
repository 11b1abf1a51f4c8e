//! Turn stored rows into per-index time series for the viewer.

use crate::metrics;
use crate::model::{Panel, Snapshot, TimeAxis};
use crate::storage::{self, RowFilter, SampleRow, Store};
use anyhow::Result;
use std::collections::BTreeMap;

/// Query parameters shared by the viewer and `summary`.
#[derive(Debug, Clone, Default)]
pub struct SnapshotQuery {
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    pub max_packets: Option<usize>,
    pub time_axis: TimeAxis,
}

/// Group rows of one (type, sender) pair into `(t, value)` series per index.
///
/// On the received axis, `t` is seconds since the earliest receive time in the
/// row set; rows whose receive time cannot be parsed are left out of the plot.
pub fn build_panel(packet_type: &str, sender: &str, rows: &[SampleRow], axis: TimeAxis) -> Panel {
    let received: Vec<Option<i128>> = rows
        .iter()
        .map(|r| {
            storage::parse_received_at(&r.received_at)
                .map(|dt| dt.assume_utc().unix_timestamp_nanos())
        })
        .collect();
    let t0 = received.iter().flatten().copied().min().unwrap_or(0);

    let mut series: BTreeMap<i64, Vec<(f64, f64)>> = BTreeMap::new();
    let mut packet_ids = Vec::new();
    for (row, recv) in rows.iter().zip(&received) {
        if packet_ids.last() != Some(&row.packet_id) {
            packet_ids.push(row.packet_id);
        }
        let Some(value) = row.value else { continue };
        let t = match axis {
            TimeAxis::Received => match recv {
                Some(nanos) => (nanos - t0) as f64 / 1e9,
                None => continue,
            },
            TimeAxis::Sent => row.timestamp_ms as f64 / 1000.0,
        };
        series.entry(row.idx).or_default().push((t, value));
    }
    packet_ids.sort_unstable();
    packet_ids.dedup();

    // The sent axis can run backwards if the device rebooted; charts need x ascending.
    if axis == TimeAxis::Sent {
        for points in series.values_mut() {
            points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        }
    }

    let stats = series
        .iter()
        .filter_map(|(idx, points)| {
            let values: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
            metrics::compute_series_stats(&values).map(|s| (*idx, s))
        })
        .collect();

    Panel {
        packet_type: packet_type.to_string(),
        sender: sender.to_string(),
        endpoints: rows.last().map(|r| r.endpoints.clone()).unwrap_or_default(),
        packets: packet_ids.len(),
        series,
        stats,
    }
}

/// Load every (type, sender) panel in one pass.
pub fn load_snapshot(store: &Store, query: &SnapshotQuery) -> Result<Snapshot> {
    let mut panels: BTreeMap<String, BTreeMap<String, Panel>> = BTreeMap::new();
    for (packet_type, senders) in store.list_types_and_senders()? {
        let by_sender = panels.entry(packet_type.clone()).or_default();
        for sender in senders {
            let rows = store.fetch_rows(&RowFilter {
                packet_type: Some(packet_type.clone()),
                sender: Some(sender.clone()),
                start_ms: query.start_ms,
                end_ms: query.end_ms,
                max_packets: query.max_packets,
            })?;
            let panel = build_panel(&packet_type, &sender, &rows, query.time_axis);
            by_sender.insert(sender, panel);
        }
    }

    Ok(Snapshot {
        refreshed_at_utc: storage::format_received_at(time::OffsetDateTime::now_utc()),
        time_axis: query.time_axis,
        panels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Packet;
    use tempfile::TempDir;

    fn row(id: i64, ts: i64, recv: &str, idx: i64, value: Option<f64>) -> SampleRow {
        SampleRow {
            packet_id: id,
            packet_type: "BARO".into(),
            sender: "A".into(),
            endpoints: vec!["RADIO".into()],
            timestamp_ms: ts,
            received_at: recv.into(),
            idx,
            value,
        }
    }

    #[test]
    fn received_axis_is_relative_to_first_receive() {
        let rows = vec![
            row(1, 5000, "2024-01-01 00:00:10.000", 0, Some(1.0)),
            row(1, 5000, "2024-01-01 00:00:10.000", 1, Some(10.0)),
            row(2, 5300, "2024-01-01 00:00:10.300", 0, Some(2.0)),
            row(2, 5300, "2024-01-01 00:00:10.300", 1, Some(20.0)),
        ];
        let p = build_panel("BARO", "A", &rows, TimeAxis::Received);
        assert_eq!(p.packets, 2);
        assert_eq!(p.series.len(), 2);
        let idx0 = &p.series[&0];
        assert_eq!(idx0[0].0, 0.0);
        assert!((idx0[1].0 - 0.3).abs() < 1e-6);
        assert_eq!(p.stats[&1].latest, 20.0);
    }

    #[test]
    fn sent_axis_uses_device_seconds() {
        let rows = vec![
            row(1, 3076, "2024-01-01 00:00:00", 0, Some(1.0)),
            row(2, 1000, "2024-01-01 00:00:01", 0, Some(2.0)),
        ];
        let p = build_panel("BARO", "A", &rows, TimeAxis::Sent);
        assert_eq!(p.series[&0], vec![(1.0, 2.0), (3.076, 1.0)]);
    }

    #[test]
    fn null_values_and_bad_timestamps_are_dropped() {
        let rows = vec![
            row(1, 1, "garbage", 0, Some(1.0)),
            row(2, 2, "2024-01-01 00:00:00.000", 0, None),
            row(3, 3, "2024-01-01 00:00:01.000", 0, Some(3.0)),
        ];
        let p = build_panel("BARO", "A", &rows, TimeAxis::Received);
        // The null row still anchors the received clock.
        assert_eq!(p.series[&0], vec![(1.0, 3.0)]);
        assert_eq!(p.packets, 3);
    }

    #[test]
    fn empty_rows_give_empty_panel() {
        let p = build_panel("BARO", "A", &[], TimeAxis::Received);
        assert!(p.is_empty());
        assert!(p.stats.is_empty());
    }

    #[test]
    fn snapshot_has_one_panel_per_type_and_sender() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open(&dir.path().join("t.db")).unwrap();
        for (t, s) in [("BARO", "A"), ("BARO", "B"), ("GPS", "A")] {
            store
                .insert_packet(
                    &Packet {
                        packet_type: t.into(),
                        size_bytes: 8,
                        sender: s.into(),
                        endpoints: vec![],
                        timestamp_ms: 1,
                        timestamp_human: "0s 001ms".into(),
                        values: vec![1.0, 2.0],
                    },
                    "2024-01-01 00:00:00.000",
                )
                .unwrap();
        }
        let snap = load_snapshot(&store, &SnapshotQuery::default()).unwrap();
        assert_eq!(snap.panel_count(), 3);
        assert_eq!(snap.panel("BARO", "B").unwrap().series.len(), 2);
        assert!(snap.panel("GPS", "B").is_none());
    }

    #[test]
    fn reader_before_ingestor_sees_empty_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = Store::open_reader(&dir.path().join("fresh.db")).unwrap();
        let snap = load_snapshot(&store, &SnapshotQuery::default()).unwrap();
        assert_eq!(snap.panel_count(), 0);
    }
}
