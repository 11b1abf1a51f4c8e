//! Launcher: background ingestor plus foreground viewer.
//!
//! Activation happens before anything is spawned. The ingestor lives inside a
//! [`BackgroundGuard`] for the whole session so every exit path sends it a
//! termination request.

mod env;
mod process;

pub use env::{activate, Environment, ProgramRef};
pub use process::{
    ChildExit, ChildProcess, CommandSpec, ForegroundProcess, ProcessSpawner, TokioSpawner,
};

use crate::shutdown::Shutdown;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_INGEST_LOG: &str = "telemetry-ingest.log";
pub const DEFAULT_REFRESH_SEC: f64 = 0.3;
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("environment activation failed: {0}")]
    Activation(String),
    #[error("failed to start {role}: {source}")]
    Spawn {
        role: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("waiting for {role} failed: {source}")]
    Wait {
        role: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Resolved launcher settings (CLI merged over config).
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub db: PathBuf,
    pub refresh_sec: f64,
    /// Explicit env file; `None` uses `.telemetry/env` when it exists.
    pub env_file: Option<PathBuf>,
    pub ingest_log: PathBuf,
    pub ingest_program: Option<PathBuf>,
    pub view_program: Option<PathBuf>,
    pub grace: Duration,
    pub no_ingest: bool,
    /// Forwarded to children started from this executable.
    pub config: Option<PathBuf>,
    pub ingest_args: IngestPassthrough,
}

/// Ingest options handed through to the background process untouched.
#[derive(Debug, Clone, Default)]
pub struct IngestPassthrough {
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub out_jsonl: Option<PathBuf>,
    pub out_txt: Option<PathBuf>,
    pub file_flag: Option<String>,
}

impl IngestPassthrough {
    fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(p) = &self.port {
            args.extend(["--port".to_string(), p.clone()]);
        }
        if let Some(b) = self.baud {
            args.extend(["--baud".to_string(), b.to_string()]);
        }
        if let Some(p) = &self.out_jsonl {
            args.extend(["--out-jsonl".to_string(), p.display().to_string()]);
        }
        if let Some(p) = &self.out_txt {
            args.extend(["--out-txt".to_string(), p.display().to_string()]);
        }
        if let Some(f) = &self.file_flag {
            args.extend(["--file-flag".to_string(), f.clone()]);
        }
        args
    }
}

/// The two command lines of a session.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub ingest: Option<CommandSpec>,
    pub view: CommandSpec,
    pub grace: Duration,
}

fn base_args(program: &ProgramRef, config: Option<&PathBuf>) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(sub) = program.subcommand {
        if let Some(c) = config {
            args.extend(["--config".to_string(), c.display().to_string()]);
        }
        args.push(sub.to_string());
    }
    args
}

impl LaunchPlan {
    pub fn build(opts: &LaunchOptions, env: &Environment) -> Self {
        let db = opts.db.display().to_string();

        let ingest = (!opts.no_ingest).then(|| {
            let mut args = base_args(&env.ingest, opts.config.as_ref());
            args.extend(["--db".to_string(), db.clone()]);
            args.extend(opts.ingest_args.to_args());
            CommandSpec {
                program: env.ingest.path.clone(),
                args,
                envs: env.vars.clone(),
                log: Some(opts.ingest_log.clone()),
            }
        });

        let mut args = base_args(&env.view, opts.config.as_ref());
        args.extend([
            "--db".to_string(),
            db,
            "--refresh-sec".to_string(),
            format_refresh(opts.refresh_sec),
        ]);
        let view = CommandSpec {
            program: env.view.path.clone(),
            args,
            envs: env.vars.clone(),
            log: None,
        };

        Self {
            ingest,
            view,
            grace: opts.grace,
        }
    }
}

/// `0.3` stays `0.3`, `1.0` becomes `1`.
fn format_refresh(sec: f64) -> String {
    format!("{sec}")
}

/// Owns the background process; releasing it sends exactly one termination request.
pub struct BackgroundGuard<P: ChildProcess> {
    proc: Option<P>,
}

impl<P: ChildProcess> BackgroundGuard<P> {
    pub fn new(proc: P) -> Self {
        Self { proc: Some(proc) }
    }

    pub fn pid(&self) -> Option<u32> {
        self.proc.as_ref().and_then(|p| p.pid())
    }

    /// Request termination, wait up to `grace`, then force-kill.
    pub async fn shutdown(mut self, grace: Duration) {
        if let Some(mut p) = self.proc.take() {
            stop_within(&mut p, "ingestor", grace).await;
        }
    }
}

impl<P: ChildProcess> Drop for BackgroundGuard<P> {
    fn drop(&mut self) {
        if let Some(mut p) = self.proc.take() {
            request_stop(&mut p);
        }
    }
}

fn request_stop<P: ChildProcess>(p: &mut P) {
    match p.request_stop() {
        Ok(()) => debug!(pid = ?p.pid(), "termination requested"),
        Err(e) => debug!(pid = ?p.pid(), error = %e, "termination request failed"),
    }
}

async fn stop_within<P: ChildProcess>(p: &mut P, role: &str, grace: Duration) {
    request_stop(p);
    if !p.wait_exit(grace).await {
        warn!(pid = ?p.pid(), role, grace = ?grace, "did not exit in time, killing");
        p.force_kill();
    }
}

/// How the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    Exited(ChildExit),
    Interrupted(Shutdown),
}

impl LaunchOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchOutcome::Exited(e) => e.exit_code(),
            LaunchOutcome::Interrupted(s) => s.exit_code(),
        }
    }
}

/// Activate, then run one session.
pub async fn launch<S, F>(
    opts: &LaunchOptions,
    spawner: &mut S,
    shutdown: F,
) -> Result<LaunchOutcome, LaunchError>
where
    S: ProcessSpawner,
    F: Future<Output = Shutdown>,
{
    let env = activate(
        opts.env_file.as_deref(),
        opts.ingest_program.as_deref(),
        opts.view_program.as_deref(),
    )?;
    if !env.vars.is_empty() {
        debug!(count = env.vars.len(), "loaded environment variables");
    }
    let plan = LaunchPlan::build(opts, &env);
    run_session(&plan, spawner, shutdown).await
}

/// Start the ingestor, run the viewer in the foreground, then stop the ingestor.
pub async fn run_session<S, F>(
    plan: &LaunchPlan,
    spawner: &mut S,
    shutdown: F,
) -> Result<LaunchOutcome, LaunchError>
where
    S: ProcessSpawner,
    F: Future<Output = Shutdown>,
{
    let guard = match &plan.ingest {
        Some(spec) => {
            let bg = spawner
                .spawn_background(spec)
                .map_err(|source| LaunchError::Spawn {
                    role: "ingestor",
                    source,
                })?;
            let guard = BackgroundGuard::new(bg);
            info!(
                pid = ?guard.pid(),
                log = ?spec.log.as_ref().map(|p| p.display().to_string()),
                "ingestor started"
            );
            Some(guard)
        }
        None => None,
    };

    // Nothing may be logged to the terminal once the viewer owns it.
    info!(program = %plan.view.program.display(), "starting viewer");
    let mut viewer = spawner
        .run_foreground(&plan.view)
        .map_err(|source| LaunchError::Spawn {
            role: "viewer",
            source,
        })?;

    let ended = tokio::select! {
        res = viewer.wait() => Ok(res),
        sig = shutdown => Err(sig),
    };
    let outcome = match ended {
        Ok(res) => {
            let exit = res.map_err(|source| LaunchError::Wait {
                role: "viewer",
                source,
            })?;
            info!(code = exit.exit_code(), "viewer exited");
            LaunchOutcome::Exited(exit)
        }
        Err(sig) => {
            // Let the viewer restore the terminal before it goes away.
            stop_within(&mut viewer, "viewer", plan.grace).await;
            info!(signal = ?sig, "interrupted");
            LaunchOutcome::Interrupted(sig)
        }
    };

    if let Some(guard) = guard {
        guard.shutdown(plan.grace).await;
    }
    Ok(outcome)
}
