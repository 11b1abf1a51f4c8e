use crate::config::{IngestSection, LaunchSection, TelemetryConfig, ViewSection};
use crate::ingest::{self, IngestConfig};
use crate::launcher::{self, IngestPassthrough, LaunchOptions, TokioSpawner};
use crate::model::{TimeAxis, ViewEvent};
use crate::orchestrator::{self, PollConfig, UiCommand};
use crate::series::{self, SnapshotQuery};
use crate::shutdown::ShutdownSignals;
use crate::storage::Store;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const DEFAULT_DB: &str = "telemetry.db";
pub const DEFAULT_VIEW_REFRESH_SEC: f64 = 1.0;
pub const DEFAULT_MAX_PACKETS: usize = 2000;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser)]
#[command(
    name = "telemetry",
    version,
    about = "Radio telemetry ingest and live viewer",
    long_about = "Reads telemetry packets from a serial port into SQLite and plots them live.\n\
                  Without a subcommand, `launch` starts the ingestor in the background and the viewer in the foreground."
)]
pub struct Cli {
    /// Configuration file (default: ./telemetry.toml, then the user config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the ingestor in the background and the viewer in the foreground (default)
    Launch(LaunchArgs),
    /// Read telemetry from a serial port (or a capture file) into the database
    Ingest(IngestArgs),
    /// Live charts of the database
    View(ViewArgs),
    /// Print per-series statistics once and exit
    Summary(SummaryArgs),
}

#[derive(Debug, Args, Default)]
pub struct IngestArgs {
    /// Serial port device
    #[arg(long)]
    pub port: Option<String>,

    /// Baud rate
    #[arg(long)]
    pub baud: Option<u32>,

    /// SQLite database path
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Also append each packet as a JSON line to this file
    #[arg(long)]
    pub out_jsonl: Option<PathBuf>,

    /// Tag added to every JSONL record as "flag"
    #[arg(long)]
    pub file_flag: Option<String>,

    /// Also append a readable line per packet to this file
    #[arg(long)]
    pub out_txt: Option<PathBuf>,

    /// Do not write to the database (mirrors only)
    #[arg(long)]
    pub no_db: bool,

    /// Replay a captured log file instead of reading the serial port
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Wait between reconnect attempts
    #[arg(long)]
    pub reconnect_delay: Option<humantime::Duration>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct QueryArgs {
    /// SQLite database path
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Only packets with device timestamp >= this (ms)
    #[arg(long)]
    pub start_ms: Option<i64>,

    /// Only packets with device timestamp <= this (ms)
    #[arg(long)]
    pub end_ms: Option<i64>,

    /// Most recent packets per (type, sender)
    #[arg(long)]
    pub max_packets: Option<usize>,

    /// Clock used for the x axis
    #[arg(long, value_enum)]
    pub time_axis: Option<TimeAxis>,
}

#[derive(Debug, Args, Default)]
pub struct ViewArgs {
    #[command(flatten)]
    pub query: QueryArgs,

    /// Seconds between refreshes (fractions allowed, minimum 0.1)
    #[arg(long)]
    pub refresh_sec: Option<f64>,
}

#[derive(Debug, Args, Default)]
pub struct SummaryArgs {
    #[command(flatten)]
    pub query: QueryArgs,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args, Default)]
pub struct LaunchArgs {
    /// SQLite database path shared by both processes
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Viewer refresh in seconds
    #[arg(long)]
    pub refresh_sec: Option<f64>,

    /// Environment file loaded before starting anything
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Where the background ingestor's output goes
    #[arg(long)]
    pub ingest_log: Option<PathBuf>,

    /// Program to run as the ingestor (default: this executable)
    #[arg(long)]
    pub ingest_program: Option<PathBuf>,

    /// Program to run as the viewer (default: this executable)
    #[arg(long)]
    pub view_program: Option<PathBuf>,

    /// How long to wait for the ingestor to exit before killing it
    #[arg(long)]
    pub grace: Option<humantime::Duration>,

    /// Run only the viewer
    #[arg(long)]
    pub no_ingest: bool,

    /// Passed to the ingestor
    #[arg(long)]
    pub port: Option<String>,

    /// Passed to the ingestor
    #[arg(long)]
    pub baud: Option<u32>,

    /// Passed to the ingestor
    #[arg(long)]
    pub out_jsonl: Option<PathBuf>,

    /// Passed to the ingestor
    #[arg(long)]
    pub out_txt: Option<PathBuf>,

    /// Passed to the ingestor
    #[arg(long)]
    pub file_flag: Option<String>,
}

/// Run the selected subcommand and return the process exit code.
pub async fn run(args: Cli) -> Result<i32> {
    let command = args
        .command
        .unwrap_or_else(|| Command::Launch(LaunchArgs::default()));
    setup_logging(&command, args.verbose, args.quiet, args.log_file.as_deref())?;
    let file = TelemetryConfig::load(args.config.as_deref())?;

    match command {
        Command::Ingest(a) => {
            ingest::run(build_ingest_config(&a, &file.ingest)).await?;
            Ok(0)
        }
        Command::View(a) => {
            run_view(build_poll_config(&a, &file.view)).await?;
            Ok(0)
        }
        Command::Summary(a) => {
            run_summary(&a, &file.view).await?;
            Ok(0)
        }
        Command::Launch(a) => {
            let opts = build_launch_options(&a, &file.launch, args.config);
            // Handlers go in before any child exists.
            let mut signals = ShutdownSignals::install()?;
            let outcome = launcher::launch(&opts, &mut TokioSpawner, signals.recv())
                .await
                .context("launch failed")?;
            Ok(outcome.exit_code())
        }
    }
}

/// Default log level per subcommand, before -v/-q and `RUST_LOG`.
fn default_level(command: &Command) -> &'static str {
    match command {
        Command::Ingest(_) | Command::Launch(_) => "info",
        Command::View(_) | Command::Summary(_) => "warn",
    }
}

fn setup_logging(
    command: &Command,
    verbose: u8,
    quiet: bool,
    log_file: Option<&Path>,
) -> Result<()> {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => default_level(command),
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (stderr_layer, file_layer) = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            let ansi = file.is_terminal();
            (None, Some(log_layer(std::sync::Mutex::new(file), ansi)))
        }
        // The TUI owns the terminal; stderr output would tear the screen.
        None if cfg!(feature = "tui") && matches!(command, Command::View(_)) => (None, None),
        // The launcher points a background ingestor's stderr at a log file.
        None => (
            Some(log_layer(std::io::stderr, std::io::stderr().is_terminal())),
            None,
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("install log subscriber")?;
    Ok(())
}

/// A fmt layer that only colours its output when writing to a terminal.
fn log_layer<S, W>(
    writer: W,
    ansi: bool,
) -> fmt::Layer<S, fmt::format::DefaultFields, fmt::format::Format, W>
where
    W: for<'w> fmt::MakeWriter<'w> + 'static,
{
    fmt::layer().with_writer(writer).with_ansi(ansi)
}

/// Print a fatal error once and turn the result into a process exit code.
pub fn exit_code(result: Result<i32>, err: &mut impl Write) -> i32 {
    match result {
        Ok(code) => code,
        Err(e) => {
            let _ = writeln!(err, "Error: {e:#}");
            1
        }
    }
}

/// Build an `IngestConfig`: flags, then config file, then defaults.
pub fn build_ingest_config(args: &IngestArgs, file: &IngestSection) -> IngestConfig {
    IngestConfig {
        port: args
            .port
            .clone()
            .or_else(|| file.port.clone())
            .unwrap_or_else(|| ingest::DEFAULT_PORT.to_string()),
        baud: args.baud.or(file.baud).unwrap_or(ingest::DEFAULT_BAUD),
        db: args
            .db
            .clone()
            .or_else(|| file.db.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB)),
        no_db: args.no_db || file.no_db.unwrap_or(false),
        out_jsonl: args.out_jsonl.clone().or_else(|| file.out_jsonl.clone()),
        file_flag: args.file_flag.clone().or_else(|| file.file_flag.clone()),
        out_txt: args.out_txt.clone().or_else(|| file.out_txt.clone()),
        input: args.input.clone(),
        reconnect_delay: args
            .reconnect_delay
            .map(Duration::from)
            .or(file.reconnect_delay)
            .unwrap_or(ingest::DEFAULT_RECONNECT_DELAY),
    }
}

fn build_query(args: &QueryArgs, file: &ViewSection) -> (PathBuf, SnapshotQuery) {
    let db = args
        .db
        .clone()
        .or_else(|| file.db.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB));
    let query = SnapshotQuery {
        start_ms: args.start_ms.or(file.start_ms),
        end_ms: args.end_ms.or(file.end_ms),
        max_packets: Some(
            args.max_packets
                .or(file.max_packets)
                .unwrap_or(DEFAULT_MAX_PACKETS),
        ),
        time_axis: args.time_axis.or(file.time_axis).unwrap_or_default(),
    };
    (db, query)
}

pub fn build_poll_config(args: &ViewArgs, file: &ViewSection) -> PollConfig {
    let (db, query) = build_query(&args.query, file);
    let refresh_sec = args
        .refresh_sec
        .or(file.refresh_sec)
        .unwrap_or(DEFAULT_VIEW_REFRESH_SEC);
    PollConfig {
        db,
        refresh: orchestrator::refresh_period(refresh_sec),
        query,
    }
}

pub fn build_launch_options(
    args: &LaunchArgs,
    file: &LaunchSection,
    config: Option<PathBuf>,
) -> LaunchOptions {
    LaunchOptions {
        db: args
            .db
            .clone()
            .or_else(|| file.db.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB)),
        refresh_sec: args
            .refresh_sec
            .or(file.refresh_sec)
            .unwrap_or(launcher::DEFAULT_REFRESH_SEC),
        env_file: args.env_file.clone().or_else(|| file.env_file.clone()),
        ingest_log: args
            .ingest_log
            .clone()
            .or_else(|| file.ingest_log.clone())
            .unwrap_or_else(|| PathBuf::from(launcher::DEFAULT_INGEST_LOG)),
        ingest_program: args
            .ingest_program
            .clone()
            .or_else(|| file.ingest_program.clone()),
        view_program: args
            .view_program
            .clone()
            .or_else(|| file.view_program.clone()),
        grace: args
            .grace
            .map(Duration::from)
            .or(file.grace)
            .unwrap_or(launcher::DEFAULT_GRACE),
        no_ingest: args.no_ingest,
        config,
        ingest_args: IngestPassthrough {
            port: args.port.clone(),
            baud: args.baud,
            out_jsonl: args.out_jsonl.clone(),
            out_txt: args.out_txt.clone(),
            file_flag: args.file_flag.clone(),
        },
    }
}

async fn run_view(cfg: PollConfig) -> Result<()> {
    #[cfg(feature = "tui")]
    {
        crate::tui::run(cfg).await
    }
    #[cfg(not(feature = "tui"))]
    {
        // Fallback when built without TUI support.
        run_view_text(cfg).await
    }
}

/// Print a text summary on every refresh until interrupted.
#[cfg_attr(feature = "tui", allow(dead_code))]
async fn run_view_text(cfg: PollConfig) -> Result<()> {
    let mut signals = ShutdownSignals::install()?;
    let (out_tx, out_handle) = spawn_output_writer();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ViewEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let poller = tokio::spawn(orchestrator::run_poller(cfg, event_tx, cmd_rx));

    loop {
        tokio::select! {
            ev = event_rx.recv() => match ev {
                Some(ViewEvent::Snapshot(snap)) => {
                    for line in crate::text_summary::build_text_summary(&snap).lines {
                        let _ = out_tx.send(OutputLine::Stdout(line));
                    }
                    let _ = out_tx.send(OutputLine::Stdout(String::new()));
                }
                Some(ViewEvent::Info(info)) => {
                    let _ = out_tx.send(OutputLine::Stderr(info.to_message()));
                }
                None => break,
            },
            sig = signals.recv() => {
                tracing::info!(signal = ?sig, "viewer stopping");
                let _ = cmd_tx.send(UiCommand::Quit);
                break;
            }
        }
    }

    drop(cmd_tx);
    let res = poller.await.context("poller task failed")?;
    drop(out_tx);
    let _ = out_handle.await;
    res
}

async fn run_summary(args: &SummaryArgs, file: &ViewSection) -> Result<()> {
    let (db, query) = build_query(&args.query, file);
    if !db.exists() {
        anyhow::bail!("database not found: {}", db.display());
    }
    let snap = tokio::task::spawn_blocking(move || -> Result<_> {
        let store = Store::open_reader(&db)?;
        series::load_snapshot(&store, &query)
    })
    .await
    .context("summary task failed")??;

    let (out_tx, out_handle) = spawn_output_writer();
    if args.json {
        let out = serde_json::to_string_pretty(&snap)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else {
        for line in crate::text_summary::build_text_summary(&snap).lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_error_is_reported_once() {
        let mut err = Vec::new();
        let failed: Result<i32> = Err(anyhow::anyhow!("no such file")).context("open telemetry.db");
        assert_eq!(exit_code(failed, &mut err), 1);
        let text = String::from_utf8(err).unwrap();
        assert_eq!(text, "Error: open telemetry.db: no such file\n");

        let mut err = Vec::new();
        assert_eq!(exit_code(Ok(130), &mut err), 130);
        assert!(err.is_empty());
    }

    #[test]
    fn log_file_output_has_no_colour_codes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ingest.log");
        let file = std::fs::File::create(&path).unwrap();
        let ansi = file.is_terminal();
        assert!(!ansi);

        let subscriber =
            tracing_subscriber::registry().with(log_layer(std::sync::Mutex::new(file), ansi));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(port = "/dev/ttyACM0", "serial port opened");
        });

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("serial port opened"), "{text}");
        assert!(!text.contains('\x1b'), "{text:?}");
    }

    #[test]
    fn no_subcommand_means_launch() {
        let cli = Cli::try_parse_from(["telemetry"]).unwrap();
        assert!(cli.command.is_none());
        let cli = Cli::try_parse_from(["telemetry", "-v", "launch", "--no-ingest"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Launch(LaunchArgs { no_ingest: true, .. }))));
        assert_eq!(cli.verbose, 1);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "telemetry",
            "view",
            "--db",
            "x.db",
            "--refresh-sec",
            "0.3",
            "--config",
            "c.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("c.toml")));
        let Some(Command::View(v)) = cli.command else {
            panic!("expected view");
        };
        assert_eq!(v.refresh_sec, Some(0.3));
        assert_eq!(v.query.db, Some(PathBuf::from("x.db")));
    }

    #[test]
    fn ingest_flags_beat_file_beat_defaults() {
        let file = TelemetryConfig::from_toml(
            "[ingest]\nport = \"/dev/ttyUSB1\"\nbaud = 9600\nreconnect_delay = \"2s\"\n",
        )
        .unwrap();
        let args = IngestArgs {
            baud: Some(57600),
            ..Default::default()
        };
        let cfg = build_ingest_config(&args, &file.ingest);
        assert_eq!(cfg.port, "/dev/ttyUSB1");
        assert_eq!(cfg.baud, 57600);
        assert_eq!(cfg.db, PathBuf::from(DEFAULT_DB));
        assert_eq!(cfg.reconnect_delay, Duration::from_secs(2));
        assert!(!cfg.no_db);

        let defaults = build_ingest_config(&IngestArgs::default(), &IngestSection::default());
        assert_eq!(defaults.port, ingest::DEFAULT_PORT);
        assert_eq!(defaults.baud, 115_200);
        assert_eq!(defaults.reconnect_delay, Duration::from_millis(500));
    }

    #[test]
    fn view_defaults_and_clamp() {
        let cfg = build_poll_config(&ViewArgs::default(), &ViewSection::default());
        assert_eq!(cfg.db, PathBuf::from(DEFAULT_DB));
        assert_eq!(cfg.refresh, Duration::from_secs(1));
        assert_eq!(cfg.query.max_packets, Some(DEFAULT_MAX_PACKETS));
        assert_eq!(cfg.query.time_axis, TimeAxis::Received);

        let fast = ViewArgs {
            refresh_sec: Some(0.01),
            ..Default::default()
        };
        assert_eq!(
            build_poll_config(&fast, &ViewSection::default()).refresh,
            Duration::from_millis(100)
        );
    }

    #[test]
    fn launch_defaults() {
        let opts = build_launch_options(&LaunchArgs::default(), &LaunchSection::default(), None);
        assert_eq!(opts.db, PathBuf::from("telemetry.db"));
        assert_eq!(opts.refresh_sec, 0.3);
        assert_eq!(opts.grace, Duration::from_secs(2));
        assert_eq!(opts.ingest_log, PathBuf::from("telemetry-ingest.log"));
        assert!(opts.env_file.is_none());
        assert!(!opts.no_ingest);
    }

    #[test]
    fn launch_parses_durations_and_passthrough() {
        let cli = Cli::try_parse_from([
            "telemetry",
            "launch",
            "--grace",
            "500ms",
            "--port",
            "/dev/ttyACM0",
            "--refresh-sec",
            "0.5",
        ])
        .unwrap();
        let Some(Command::Launch(a)) = cli.command else {
            panic!("expected launch");
        };
        let opts = build_launch_options(&a, &LaunchSection::default(), None);
        assert_eq!(opts.grace, Duration::from_millis(500));
        assert_eq!(opts.refresh_sec, 0.5);
        assert_eq!(opts.ingest_args.port.as_deref(), Some("/dev/ttyACM0"));
    }

    #[test]
    fn log_levels_per_command() {
        assert_eq!(default_level(&Command::Ingest(IngestArgs::default())), "info");
        assert_eq!(default_level(&Command::Launch(LaunchArgs::default())), "info");
        assert_eq!(default_level(&Command::Summary(SummaryArgs::default())), "warn");
    }

    #[tokio::test]
    async fn summary_of_missing_db_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let args = SummaryArgs {
            query: QueryArgs {
                db: Some(dir.path().join("none.db")),
                ..Default::default()
            },
            json: false,
        };
        assert!(run_summary(&args, &ViewSection::default()).await.is_err());
    }
}
