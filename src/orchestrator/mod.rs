//! Application-level orchestration for the viewer.
//!
//! This module owns the refresh schedule and the reader connection. UI/CLI
//! layers send commands in and receive snapshots back, so neither touches
//! SQLite directly.

mod controller;

pub(crate) use controller::{refresh_period, run_poller, PollConfig, UiCommand};
