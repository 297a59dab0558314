mod builder;
mod config;
mod orchestrator;
mod output;
mod platform;
mod signals;
mod supervisor;
mod watcher;

use builder::Builder;
use clap::Parser;
use config::{ConfigError, ReforgeConfig, WatchStrategy};
use orchestrator::{Exit, Orchestrator};
use output::OutputSink;
use std::path::PathBuf;
use std::process::ExitCode;
use supervisor::Supervisor;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;
use watcher::ChangeDetector;

/// Rebuild a program whenever its sources change and keep exactly one
/// instance of the fresh binary running, optionally under a debugger.
#[derive(Parser, Debug)]
#[command(name = "reforge", version, about)]
pub struct Cli {
    /// Config file path (default: reforge.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output binary path (default: ./bin/reforge-app)
    #[arg(short, long)]
    bin: Option<PathBuf>,

    /// Watched extensions, comma or | separated (default: .go)
    #[arg(short, long, value_delimiter = ',')]
    ext: Vec<String>,

    /// Root directory to watch (default: .)
    #[arg(short, long)]
    path: Option<PathBuf>,

    /// Source path to build (default: the watched root)
    #[arg(short = 'd', long = "build")]
    build: Option<PathBuf>,

    /// Directories to ignore (default: bin,.git,node_modules)
    #[arg(short = 'x', long = "exclude-dir", value_delimiter = ',')]
    exclude_dir: Vec<String>,

    /// Extra compiler argument (repeatable)
    #[arg(long = "build-arg", allow_hyphen_values = true)]
    build_arg: Vec<String>,

    /// Extra compiler arguments as one shell-quoted string, e.g. "-ldflags '-s -w'"
    #[arg(long = "build-args", allow_hyphen_values = true)]
    build_args_line: Option<String>,

    /// Program arguments as one shell-quoted string
    #[arg(long = "run-args", allow_hyphen_values = true)]
    run_args_line: Option<String>,

    /// Quiet window in milliseconds before a burst of changes triggers a rebuild (default: 200)
    #[arg(long)]
    delay: Option<u64>,

    /// How to detect changes (default: notify)
    #[arg(short, long, value_enum)]
    watcher: Option<WatchStrategy>,

    /// Polling interval in milliseconds (default: 500)
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Build with debug flags and attach a debugger to every run
    #[arg(long)]
    debug: bool,

    /// Debugger listen address (default: :2345)
    #[arg(long)]
    dlv_address: Option<String>,

    /// Log every watched directory or file
    #[arg(long = "show-watched-files", visible_alias = "swf")]
    show_watched_files: bool,

    /// Name shown in front of log lines
    #[arg(long, default_value = "reforge")]
    log_prefix: String,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (raw events, kill escalation)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Arguments passed to the program on every run (after --run-args)
    #[arg(last = true)]
    trailing_args: Vec<String>,
}

/// Split a shell-style argument string the way a POSIX shell would.
fn split_args(flag: &str, line: &str) -> Result<Vec<String>, ConfigError> {
    shell_words::split(line).map_err(|e| ConfigError::Invalid(format!("{flag}: {e}")))
}

/// Command-line values win over the config file.
fn apply_overrides(config: &mut ReforgeConfig, cli: &Cli) -> Result<(), ConfigError> {
    if let Some(bin) = &cli.bin {
        config.build.output = bin.clone();
    }
    if !cli.ext.is_empty() {
        config.watch.extensions = cli.ext.clone();
    }
    if let Some(path) = &cli.path {
        config.watch.root = path.clone();
    }
    if let Some(build) = &cli.build {
        config.build.source = Some(build.clone());
    }
    if !cli.exclude_dir.is_empty() {
        config.watch.exclude_dirs = cli.exclude_dir.clone();
    }
    if let Some(line) = &cli.build_args_line {
        config.build.args.extend(split_args("--build-args", line)?);
    }
    config.build.args.extend(cli.build_arg.iter().cloned());
    if let Some(delay) = cli.delay {
        config.watch.delay_ms = delay;
    }
    if let Some(strategy) = cli.watcher {
        config.watch.strategy = strategy;
    }
    if let Some(interval) = cli.poll_interval {
        config.watch.poll_interval_ms = interval;
    }
    if cli.debug {
        config.debugger.enabled = true;
    }
    if let Some(address) = &cli.dlv_address {
        config.debugger.listen = address.clone();
    }
    if cli.show_watched_files {
        config.watch.show_watched_files = true;
    }
    let mut run_args = match &cli.run_args_line {
        Some(line) => split_args("--run-args", line)?,
        None => Vec::new(),
    };
    run_args.extend(cli.trailing_args.iter().cloned());
    if !run_args.is_empty() {
        config.run.args = run_args;
    }
    Ok(())
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr; stdout belongs to the program and the compiler.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match config::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::from(2);
        }
    };
    if let Err(e) = apply_overrides(&mut config, &cli).and_then(|()| config.validate()) {
        tracing::error!(error = %e, "config validation failed");
        return ExitCode::from(2);
    }

    if cli.dry_run {
        match toml::to_string_pretty(&config) {
            Ok(resolved) => {
                println!("{resolved}");
                println!("Dry run: config validated, not running.");
                return ExitCode::SUCCESS;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to render config");
                return ExitCode::from(2);
            }
        }
    }

    let span = tracing::info_span!("app", prefix = %cli.log_prefix);
    run(config).instrument(span).await
}

async fn run(config: ReforgeConfig) -> ExitCode {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "reforge starting");

    let shutdown = match signals::listen() {
        Ok(shutdown) => shutdown,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    let (detector, changes) = match ChangeDetector::spawn(&config.watch) {
        Ok(spawned) => spawned,
        Err(e) => {
            tracing::error!(error = %e, "failed to start change detection");
            return ExitCode::FAILURE;
        }
    };

    let debug = config.debugger.enabled;
    let builder = match Builder::new(&config.build, config.build_source(), debug) {
        Ok(builder) => builder,
        Err(e) => {
            tracing::error!(error = %e, output = %config.build.output.display(), "cannot resolve output path");
            return ExitCode::FAILURE;
        }
    };
    let sink = OutputSink::stdout();
    let mut supervisor = Supervisor::new(builder.binary(), config.run.args.clone(), sink.clone())
        .with_grace(config.shutdown.grace());
    if debug {
        supervisor = supervisor.with_debugger(config.debugger.clone());
    }

    let mut orchestrator = Orchestrator::new(builder, supervisor, sink);
    let exit = orchestrator.run(changes, shutdown).await;
    detector.stop();

    match &exit {
        Exit::Interrupted => {
            tracing::info!(builds = orchestrator.cycles(), "stopped");
        }
        other => tracing::error!(error = %other, "exiting"),
    }
    ExitCode::from(u8::try_from(exit.exit_code()).unwrap_or(1))
}
