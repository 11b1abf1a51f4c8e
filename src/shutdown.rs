//! Termination signals as values.
//!
//! Signals are turned into ordinary return values so that every exit path runs
//! the normal drop/cleanup code. Handlers are registered by `install`, before
//! any child process exists, so an early signal cannot kill us outright.

use anyhow::{Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Interrupt,
    Terminate,
    Hangup,
}

impl Shutdown {
    pub fn signal_number(self) -> i32 {
        match self {
            Shutdown::Hangup => 1,
            Shutdown::Interrupt => 2,
            Shutdown::Terminate => 15,
        }
    }

    /// Conventional shell exit status for a process ended by this signal.
    pub fn exit_code(self) -> i32 {
        128 + self.signal_number()
    }
}

#[cfg(unix)]
pub struct ShutdownSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    /// Must be called from within the tokio runtime.
    pub fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("install SIGINT handler")?,
            terminate: signal(SignalKind::terminate()).context("install SIGTERM handler")?,
            hangup: signal(SignalKind::hangup()).context("install SIGHUP handler")?,
        })
    }

    pub async fn recv(&mut self) -> Shutdown {
        tokio::select! {
            _ = self.interrupt.recv() => Shutdown::Interrupt,
            _ = self.terminate.recv() => Shutdown::Terminate,
            _ = self.hangup.recv() => Shutdown::Hangup,
        }
    }
}

#[cfg(not(unix))]
pub struct ShutdownSignals {
    ctrl_c: tokio::signal::windows::CtrlC,
}

#[cfg(not(unix))]
impl ShutdownSignals {
    pub fn install() -> Result<Self> {
        Ok(Self {
            ctrl_c: tokio::signal::windows::ctrl_c().context("install Ctrl-C handler")?,
        })
    }

    pub async fn recv(&mut self) -> Shutdown {
        self.ctrl_c.recv().await;
        Shutdown::Interrupt
    }
}
