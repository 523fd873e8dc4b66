use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use flockd::config::DaemonConfig;
use flockd::rest;
use flockd::storage::Storage;
use flockd::AppContext;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "flockd",
    about = "Flock Host — browser-automation fleet scheduler daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// REST API port (overrides config.toml)
    #[arg(long, env = "FLOCKD_PORT")]
    port: Option<u16>,

    /// Data directory for config and the SQLite database
    #[arg(long, env = "FLOCKD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "FLOCKD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "FLOCKD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon server (default when no subcommand given).
    ///
    /// Runs flockd in the foreground: REST API plus the background
    /// lease reaper and task aggregate sweeper.
    ///
    /// Examples:
    ///   flockd serve
    ///   flockd
    Serve,
    /// Parse and validate config.toml, then print the effective config.
    ///
    /// Exit code 0 if the config is valid, 1 otherwise.
    ///
    /// Examples:
    ///   flockd config check
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run pending database migrations and exit.
    ///
    /// The server runs migrations on startup too; this exists for
    /// pre-deploy checks.
    ///
    /// Examples:
    ///   flockd migrate
    Migrate,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate config.toml and print the effective configuration.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Init once — must happen before any tracing calls.
    let log_level = args.log.as_deref().unwrap_or("info").to_owned();
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    let data_dir = resolve_data_dir(args.data_dir)?;

    match args.command {
        Some(Command::Config { action }) => match action {
            ConfigAction::Check => {
                let config = DaemonConfig::load_or_init(&data_dir).await?;
                println!("{}", toml::to_string_pretty(&config)?);
            }
        },
        Some(Command::Migrate) => {
            Storage::new(&data_dir).await?;
            println!("migrations applied in {}", data_dir.display());
        }
        None | Some(Command::Serve) => {
            run_serve(&data_dir, args.port).await?;
        }
    }

    Ok(())
}

fn resolve_data_dir(flag: Option<std::path::PathBuf>) -> Result<std::path::PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir);
    }
    let home = dirs_home().context("cannot determine home directory")?;
    Ok(home.join(".flockd"))
}

fn dirs_home() -> Option<std::path::PathBuf> {
    std::env::var_os("HOME").map(std::path::PathBuf::from)
}

async fn run_serve(data_dir: &std::path::Path, port_override: Option<u16>) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "flockd starting");

    let mut config = DaemonConfig::load_or_init(data_dir).await?;
    if let Some(port) = port_override {
        config.port = port;
    }
    config.validate()?;

    let storage = Storage::new(data_dir).await?;
    let ctx = AppContext::from_parts(config, storage, data_dir.to_path_buf());

    ctx.start_background_jobs();
    rest::start_rest_server(ctx).await
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("flockd.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(EnvFilter::new(log_level))
            .with(fmt::layer().compact())
            .with(fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}
