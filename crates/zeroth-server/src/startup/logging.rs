//! File-based logging with one rolling file per component.
//!
//! | Log File    | Component                        | Target Prefixes                          |
//! |-------------|----------------------------------|------------------------------------------|
//! | zeroth.log  | Root logger (all components)     | (all)                                    |
//! | group0.log  | Discovery and group 0 membership | zeroth_core                              |
//! | raft.log    | Consensus engine and registry    | zeroth_consistency, openraft             |
//! | remote.log  | Inter-node RPC                   | zeroth_api, zeroth_server::startup::http |
//!
//! Log files are stored in `~/zeroth/logs` by default.
//! Override with `ZEROTH_LOG_DIR` environment variable or `zeroth.logs.path` config.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::Filter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Internal definition for a component log file.
struct ComponentLogDef {
    file_name: &'static str,
    /// Target module prefixes routed to this file
    targets: &'static [&'static str],
}

const ROOT_LOG_FILE: &str = "zeroth.log";

const COMPONENT_LOGS: &[ComponentLogDef] = &[
    ComponentLogDef {
        file_name: "group0.log",
        targets: &["zeroth_core"],
    },
    ComponentLogDef {
        file_name: "raft.log",
        targets: &["zeroth_consistency", "openraft"],
    },
    ComponentLogDef {
        file_name: "remote.log",
        targets: &["zeroth_api", "zeroth_server::startup::http"],
    },
];

/// Log rotation policy
#[derive(Debug, Clone, Copy)]
pub enum LogRotation {
    Daily,
    Hourly,
    /// Single file
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Base log directory (default: `~/zeroth/logs`)
    pub log_dir: PathBuf,
    pub console_output: bool,
    pub console_level: Level,
    pub file_logging: bool,
    pub file_level: Level,
    pub rotation: LogRotation,
}

fn default_log_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(format!("{}/zeroth/logs", home))
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            console_output: true,
            console_level: Level::INFO,
            file_logging: true,
            file_level: Level::INFO,
            rotation: LogRotation::Daily,
        }
    }
}

impl LoggingConfig {
    /// Create from application configuration. `ZEROTH_LOG_DIR` wins over a
    /// missing `log_dir`.
    pub fn from_config(
        log_dir: Option<String>,
        console_output: bool,
        file_logging: bool,
        level: String,
    ) -> Self {
        let log_dir = log_dir
            .or_else(|| std::env::var("ZEROTH_LOG_DIR").ok())
            .map(PathBuf::from)
            .unwrap_or_else(default_log_dir);

        let level = level.parse().unwrap_or(Level::INFO);

        Self {
            log_dir,
            console_output,
            console_level: level,
            file_logging,
            file_level: level,
            rotation: LogRotation::Daily,
        }
    }
}

/// Keeps the file appender workers alive; dropping it flushes buffered output.
pub struct LoggingGuard {
    _file_guards: Vec<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Level filter honouring `RUST_LOG`, falling back to `level`
fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()))
}

/// Plain-text layer appending to `file_name` under the log directory
fn file_layer<F>(
    config: &LoggingConfig,
    file_name: &str,
    filter: F,
    guards: &mut Vec<WorkerGuard>,
) -> BoxedLayer
where
    F: Filter<Registry> + Send + Sync + 'static,
{
    let appender = RollingFileAppender::new(config.rotation.into(), &config.log_dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    guards.push(guard);

    Box::new(
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_thread_names(true)
            .with_filter(filter),
    )
}

/// Initialize console output, the root `zeroth.log` file and the component
/// files (see [`COMPONENT_LOGS`]).
///
/// `RUST_LOG` controls the console and root file levels. Component files use
/// per-layer [`Targets`] filters and capture everything from their targets.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, Box<dyn std::error::Error>> {
    let mut guards: Vec<WorkerGuard> = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.console_output {
        layers.push(Box::new(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_filter(env_filter(config.console_level)),
        ));
    }

    if config.file_logging {
        std::fs::create_dir_all(&config.log_dir)?;

        layers.push(file_layer(
            config,
            ROOT_LOG_FILE,
            env_filter(config.file_level),
            &mut guards,
        ));
        for component in COMPONENT_LOGS {
            let targets = component
                .targets
                .iter()
                .fold(Targets::new(), |targets, target| {
                    targets.with_target(*target, LevelFilter::TRACE)
                });
            layers.push(file_layer(config, component.file_name, targets, &mut guards));
        }
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| format!("Failed to initialize logging: {}", e))?;

    if config.file_logging {
        tracing::info!(
            log_dir = %config.log_dir.display(),
            "File logging initialized: {} (root) + {} component log files",
            ROOT_LOG_FILE,
            COMPONENT_LOGS.len()
        );
    }

    Ok(LoggingGuard {
        _file_guards: guards,
    })
}
