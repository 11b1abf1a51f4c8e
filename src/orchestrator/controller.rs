//! Viewer refresh controller.
//!
//! Owns the reader connection and the refresh schedule, and emits snapshots for
//! presentation layers.

use crate::model::{InfoEvent, Snapshot, TimeAxis, ViewEvent};
use crate::series::{load_snapshot, SnapshotQuery};
use crate::storage::Store;
use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{Duration, MissedTickBehavior};

/// Shortest refresh period honored, whatever was asked for.
pub const MIN_REFRESH: Duration = Duration::from_millis(100);

/// Commands emitted by UI layers to steer polling.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum UiCommand {
    Pause(bool),
    Refresh,
    TimeAxis(TimeAxis),
    Quit,
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub db: PathBuf,
    pub refresh: Duration,
    pub query: SnapshotQuery,
}

/// Convert `--refresh-sec` into a period, clamped to [`MIN_REFRESH`].
pub fn refresh_period(refresh_sec: f64) -> Duration {
    if !refresh_sec.is_finite() || refresh_sec <= 0.0 {
        return MIN_REFRESH;
    }
    Duration::from_secs_f64(refresh_sec).max(MIN_REFRESH)
}

/// Run one query on the blocking pool. The store travels there and back so
/// only this task ever touches the connection.
async fn query_once(store: Store, query: SnapshotQuery) -> (Store, Result<Snapshot>) {
    let joined = tokio::task::spawn_blocking(move || {
        let res = load_snapshot(&store, &query);
        (store, res)
    })
    .await;
    match joined {
        Ok(pair) => pair,
        // Only a panic inside the query gets here; the connection went with it.
        Err(e) => std::panic::resume_unwind(e.into_panic()),
    }
}

/// Re-query the database on every tick and push snapshots to the UI.
pub(crate) async fn run_poller(
    cfg: PollConfig,
    event_tx: UnboundedSender<ViewEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    let db = cfg.db.clone();
    let store = tokio::task::spawn_blocking(move || Store::open_reader(&db))
        .await
        .context("open reader task")??;
    let mut store = Some(store);
    let mut query = cfg.query;
    let mut paused = false;

    let mut ticker = tokio::time::interval(cfg.refresh);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let mut refresh_now = false;
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UiCommand::Pause(p)) => {
                        paused = p;
                        let _ = event_tx.send(ViewEvent::Info(InfoEvent::Paused(p)));
                    }
                    Some(UiCommand::Refresh) => refresh_now = true,
                    Some(UiCommand::TimeAxis(axis)) => {
                        query.time_axis = axis;
                        let _ = event_tx.send(ViewEvent::Info(InfoEvent::TimeAxisChanged(axis)));
                        refresh_now = true;
                    }
                    Some(UiCommand::Quit) | None => break,
                }
            }
            _ = ticker.tick() => {
                refresh_now = !paused;
            }
        }

        if !refresh_now {
            continue;
        }
        let Some(s) = store.take() else {
            break;
        };
        let (s, res) = query_once(s, query.clone()).await;
        store = Some(s);
        let ev = match res {
            Ok(snap) => ViewEvent::Snapshot(Box::new(snap)),
            Err(e) => {
                tracing::debug!(error = %format!("{e:#}"), "snapshot query failed");
                ViewEvent::Info(InfoEvent::QueryFailed(format!("{e:#}")))
            }
        };
        if event_tx.send(ev).is_err() {
            // Nobody is listening anymore.
            break;
        }
    }

    Ok(())
}
