//! `prefstore` command-line driver.
//!
//! # Responsibility
//! - Open the configured store and drive `PreferencesService` commands.
//! - Report failures on stderr with a non-zero exit code, never by panicking.

mod repl;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use log::info;
use prefstore_core::{
    default_log_level, init_logging, ConfigError, ExclusiveRepository, LoggingError,
    PreferencesService, RepoError, StoreConfig,
};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "prefstore",
    version,
    about = "Inspect and update the persisted preferences record"
)]
struct Cli {
    /// SQLite database file. The in-memory store is used when neither this
    /// nor the config file names one.
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// JSON store configuration.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory for rolling log files. Logging stays off when absent.
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the committed counter.
    Get,
    /// Store a new counter value.
    Set { counter: u32 },
    /// Reset the record to its default value.
    Reset,
    /// Increment inside one atomic unit, pausing between read and write.
    Increment {
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
    /// Run concurrent transactional increments and verify none was lost.
    Race {
        #[arg(long, default_value_t = 2)]
        workers: u32,
        #[arg(long, default_value_t = 500)]
        delay_ms: u64,
    },
    /// Interactive session that prints change-stream updates as they arrive.
    Repl,
}

#[derive(Debug)]
enum CliError {
    Config(ConfigError),
    Logging(LoggingError),
    Repo(RepoError),
    Io(std::io::Error),
    LostUpdate { expected: u64, actual: u64 },
}

impl Display for CliError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(err) => write!(f, "{err}"),
            Self::Logging(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "i/o failure: {err}"),
            Self::LostUpdate { expected, actual } => write!(
                f,
                "lost update detected: expected counter {expected}, found {actual}"
            ),
        }
    }
}

impl Error for CliError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Logging(err) => Some(err),
            Self::Repo(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::LostUpdate { .. } => None,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<LoggingError> for CliError {
    fn from(value: LoggingError) -> Self {
        Self::Logging(value)
    }
}

impl From<RepoError> for CliError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<std::io::Error> for CliError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    if let Some(log_dir) = &cli.log_dir {
        let level = cli.log_level.as_deref().unwrap_or(default_log_level());
        init_logging(level, absolute(log_dir)?)?;
    }

    let config = resolve_config(cli.config.as_deref(), cli.db)?;
    let repo = ExclusiveRepository::open(&config).await?;
    info!(
        "event=cli_start module=cli status=ok backend={} command={:?}",
        repo.backend_kind(),
        cli.command
    );
    let service = Arc::new(PreferencesService::new(repo));

    match cli.command {
        Command::Get => {
            let value = service.get_current().await?;
            println!("counter={}", value.counter);
        }
        Command::Set { counter } => {
            service.set_counter(counter).await?;
            println!("counter={counter}");
        }
        Command::Reset => {
            service.reset().await?;
            println!("counter=0");
        }
        Command::Increment { delay_ms } => {
            let value = service
                .increment_in_transaction(Duration::from_millis(delay_ms))
                .await?;
            println!("counter={}", value.counter);
        }
        Command::Race { workers, delay_ms } => {
            race(&service, workers, Duration::from_millis(delay_ms)).await?;
        }
        Command::Repl => repl::run(service).await?,
    }
    Ok(())
}

/// Config file first, then `--db` on top.
fn resolve_config(file: Option<&Path>, db: Option<PathBuf>) -> Result<StoreConfig, CliError> {
    let mut config = match file {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::default(),
    };
    if let Some(db) = db {
        config.database_path = Some(db);
    }
    config.validate()?;
    Ok(config)
}

fn absolute(path: &Path) -> Result<PathBuf, CliError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

async fn race(
    service: &PreferencesService<ExclusiveRepository>,
    workers: u32,
    delay: Duration,
) -> Result<(), CliError> {
    let start = service.get_current().await?.counter;
    println!("start counter={start} workers={workers} delay_ms={}", delay.as_millis());

    let outcomes = join_all((0..workers).map(|_| service.increment_in_transaction(delay))).await;
    let mut committed: u64 = 0;
    for (worker, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(value) => {
                committed += 1;
                println!("worker={worker} committed counter={}", value.counter);
            }
            Err(err) => println!("worker={worker} failed error={err}"),
        }
    }

    let end = service.get_current().await?.counter;
    let expected = u64::from(start) + committed;
    if u64::from(end) != expected {
        return Err(CliError::LostUpdate {
            expected,
            actual: u64::from(end),
        });
    }
    println!("final counter={end}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{resolve_config, Cli, Command};
    use clap::Parser;
    use std::path::PathBuf;

    #[test]
    fn db_flag_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("prefstore.json");
        std::fs::write(
            &config_path,
            r#"{"database_path": "/tmp/from-file.db", "read_pool_size": 3}"#,
        )
        .unwrap();

        let config =
            resolve_config(Some(&config_path), Some(PathBuf::from("/tmp/from-flag.db"))).unwrap();
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/from-flag.db")));
        assert_eq!(config.read_pool_size, 3);
    }

    #[test]
    fn no_flags_select_in_memory_store() {
        let config = resolve_config(None, None).unwrap();
        assert_eq!(config.database_path, None);
    }

    #[test]
    fn race_arguments_parse_with_defaults() {
        let cli = Cli::try_parse_from(["prefstore", "--db", "prefs.db", "race"]).unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("prefs.db")));
        assert!(matches!(
            cli.command,
            Command::Race {
                workers: 2,
                delay_ms: 500
            }
        ));
    }

    #[test]
    fn negative_counter_is_rejected_by_parser() {
        assert!(Cli::try_parse_from(["prefstore", "set", "-1"]).is_err());
    }
}
