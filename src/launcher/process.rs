//! Process spawning seam for the launcher.
//!
//! The real implementation uses `tokio::process`; tests substitute a recorder.

use futures::future::BoxFuture;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

/// A fully resolved command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    /// Send stdout and stderr here (appending) instead of inheriting them.
    pub log: Option<PathBuf>,
}

/// How a foreground process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ChildExit {
    #[cfg(test)]
    pub fn success() -> Self {
        Self {
            code: Some(0),
            signal: None,
        }
    }

    /// Shell convention: the exit code, or 128 + signal for a killed process.
    pub fn exit_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(c), _) => c,
            (None, Some(s)) => 128 + s,
            (None, None) => 1,
        }
    }
}

impl From<std::process::ExitStatus> for ChildExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// A running child the launcher can stop.
pub trait ChildProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Ask the process to terminate. Already-exited processes are not an error.
    fn request_stop(&mut self) -> io::Result<()>;

    /// Resolves to `true` if the process exited within `grace`.
    fn wait_exit(&mut self, grace: Duration) -> BoxFuture<'_, bool>;

    fn force_kill(&mut self);
}

/// The child that owns the terminal; its exit status becomes ours.
pub trait ForegroundProcess: ChildProcess {
    /// Wait for exit. Dropping the future leaves the process running.
    fn wait(&mut self) -> BoxFuture<'_, io::Result<ChildExit>>;
}

pub trait ProcessSpawner {
    type Background: ChildProcess;
    type Foreground: ForegroundProcess;

    fn spawn_background(&mut self, spec: &CommandSpec) -> io::Result<Self::Background>;

    /// Start the terminal-owning process. Dropping the handle kills it.
    fn run_foreground(&mut self, spec: &CommandSpec) -> io::Result<Self::Foreground>;
}

#[derive(Debug, Default)]
pub struct TokioSpawner;

pub struct TokioChild {
    child: tokio::process::Child,
    pid: Option<u32>,
}

impl TokioChild {
    fn new(child: tokio::process::Child) -> Self {
        let pid = child.id();
        Self { child, pid }
    }
}

fn build_command(spec: &CommandSpec) -> io::Result<tokio::process::Command> {
    let mut cmd = tokio::process::Command::new(&spec.program);
    cmd.args(&spec.args).envs(spec.envs.iter().cloned());
    if let Some(log) = &spec.log {
        if let Some(parent) = log.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let out = OpenOptions::new().create(true).append(true).open(log)?;
        let err = out.try_clone()?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err));
    }
    Ok(cmd)
}

impl ProcessSpawner for TokioSpawner {
    type Background = TokioChild;
    type Foreground = TokioChild;

    fn spawn_background(&mut self, spec: &CommandSpec) -> io::Result<TokioChild> {
        Ok(TokioChild::new(build_command(spec)?.spawn()?))
    }

    fn run_foreground(&mut self, spec: &CommandSpec) -> io::Result<TokioChild> {
        Ok(TokioChild::new(build_command(spec)?.kill_on_drop(true).spawn()?))
    }
}

impl ChildProcess for TokioChild {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn request_stop(&mut self) -> io::Result<()> {
        if let Ok(Some(_)) = self.child.try_wait() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                let status = std::process::Command::new("sh")
                    .arg("-c")
                    .arg(format!("kill -TERM {pid}"))
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()?;
                if status.success() {
                    return Ok(());
                }
                // "No such process": it exited between the check and the kill.
                if let Ok(Some(_)) = self.child.try_wait() {
                    return Ok(());
                }
                return Err(io::Error::other(format!("kill -TERM {pid} failed: {status}")));
            }
        }
        match self.child.start_kill() {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    fn wait_exit(&mut self, grace: Duration) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            matches!(
                tokio::time::timeout(grace, self.child.wait()).await,
                Ok(Ok(_))
            )
        })
    }

    fn force_kill(&mut self) {
        let _ = self.child.start_kill();
    }
}

impl ForegroundProcess for TokioChild {
    fn wait(&mut self) -> BoxFuture<'_, io::Result<ChildExit>> {
        Box::pin(async move { Ok(ChildExit::from(self.child.wait().await?)) })
    }
}
