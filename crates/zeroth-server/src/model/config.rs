//! Configuration management for the Zeroth server
//!
//! Sources, lowest precedence first: `conf/application.yml`, `ZEROTH__*`
//! environment variables, then command line overrides.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use zeroth_common::{ServerInfo, local_ip};
use zeroth_consistency::FailureDetectorConfig;
use zeroth_consistency::raft::RaftConfig;

use crate::startup::LoggingConfig;

pub const DEFAULT_CONFIG_FILE: &str = "conf/application.yml";
pub const DEFAULT_SERVER_PORT: u16 = 7000;
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Command line arguments for the server
#[derive(Debug, Default, Parser)]
#[command(name = "zeroth-server", version, about)]
pub struct Cli {
    /// Address the RPC endpoint binds to, as host:port
    #[arg(short = 'l', long = "listen")]
    pub listen: Option<String>,
    /// Comma separated seed locations
    #[arg(short = 's', long = "seeds", value_delimiter = ',')]
    pub seeds: Vec<String>,
    #[arg(short = 'd', long = "data-dir", env = "ZEROTH_DATA_DIR")]
    pub data_dir: Option<String>,
    /// Enable or disable raft-based group 0
    #[arg(long = "raft")]
    pub raft: Option<bool>,
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_FILE)]
    pub config_file: String,
}

/// Application configuration loaded from config files and environment
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(args: Cli) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder()
            .add_source(File::with_name(&args.config_file).required(false))
            .add_source(
                Environment::with_prefix("ZEROTH")
                    .prefix_separator("__")
                    .separator("__")
                    .keep_prefix(true)
                    .try_parsing(true),
            );

        if let Some(listen) = args.listen {
            let (host, port) = split_host_port(&listen)?;
            config_builder = config_builder
                .set_override("zeroth.server.address", host)?
                .set_override("zeroth.server.port", i64::from(port))?;
        }
        if !args.seeds.is_empty() {
            config_builder = config_builder.set_override("zeroth.seeds", args.seeds)?;
        }
        if let Some(v) = args.data_dir {
            config_builder = config_builder.set_override("zeroth.data.dir", v)?;
        }
        if let Some(v) = args.raft {
            config_builder = config_builder.set_override("zeroth.raft.enabled", v)?;
        }

        Ok(Configuration {
            config: config_builder.build()?,
        })
    }

    // ========================================================================
    // Server Configuration
    // ========================================================================

    pub fn server_address(&self) -> String {
        self.config
            .get_string("zeroth.server.address")
            .unwrap_or("0.0.0.0".to_string())
    }

    pub fn server_port(&self) -> u16 {
        self.config
            .get_int("zeroth.server.port")
            .ok()
            .and_then(|port| u16::try_from(port).ok())
            .unwrap_or(DEFAULT_SERVER_PORT)
    }

    /// Location other nodes reach this node at.
    ///
    /// Falls back to the bind address, replacing a wildcard with the first
    /// non-loopback IPv4 address.
    pub fn broadcast_info(&self) -> ServerInfo {
        let host = self
            .config
            .get_string("zeroth.server.broadcast_address")
            .unwrap_or_else(|_| self.server_address());
        let host = if host == "0.0.0.0" { local_ip() } else { host };
        ServerInfo::from(format!("{}:{}", host, self.server_port()))
    }

    /// Seed locations; a node with no seeds seeds itself.
    pub fn seeds(&self) -> Vec<ServerInfo> {
        let seeds: Vec<String> = match self.config.get_array("zeroth.seeds") {
            Ok(values) => values
                .into_iter()
                .filter_map(|v| v.into_string().ok())
                .collect(),
            Err(_) => self
                .config
                .get_string("zeroth.seeds")
                .map(|s| s.split(',').map(|seed| seed.to_string()).collect())
                .unwrap_or_default(),
        };

        let seeds: Vec<ServerInfo> = seeds
            .iter()
            .map(|seed| seed.trim())
            .filter(|seed| !seed.is_empty())
            .map(ServerInfo::from)
            .collect();
        if seeds.is_empty() {
            vec![self.broadcast_info()]
        } else {
            seeds
        }
    }

    // ========================================================================
    // Storage Configuration
    // ========================================================================

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(
            self.config
                .get_string("zeroth.data.dir")
                .unwrap_or(DEFAULT_DATA_DIR.to_string()),
        )
    }

    pub fn system_keyspace_dir(&self) -> PathBuf {
        self.data_dir().join("system")
    }

    // ========================================================================
    // Raft Configuration
    // ========================================================================

    pub fn raft_enabled(&self) -> bool {
        self.config.get_bool("zeroth.raft.enabled").unwrap_or(true)
    }

    pub fn raft_config(&self) -> RaftConfig {
        let defaults = RaftConfig::default();
        let millis = |key: &str, default: u64| {
            self.config
                .get_int(key)
                .ok()
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(default)
        };

        RaftConfig {
            election_timeout_ms: millis(
                "zeroth.raft.election_timeout_ms",
                defaults.election_timeout_ms,
            ),
            heartbeat_interval_ms: millis(
                "zeroth.raft.heartbeat_interval_ms",
                defaults.heartbeat_interval_ms,
            ),
            tick_interval_ms: millis("zeroth.raft.tick_interval_ms", defaults.tick_interval_ms),
            snapshot_threshold: millis(
                "zeroth.raft.snapshot_threshold",
                defaults.snapshot_threshold,
            ),
            rpc_request_timeout_ms: millis(
                "zeroth.raft.rpc_request_timeout_ms",
                defaults.rpc_request_timeout_ms,
            ),
            max_payload_entries: millis(
                "zeroth.raft.max_payload_entries",
                defaults.max_payload_entries,
            ),
            data_dir: self.data_dir().join("raft"),
        }
    }

    pub fn fd_config(&self) -> FailureDetectorConfig {
        let defaults = FailureDetectorConfig::default();
        let millis = |key: &str, default: Duration| {
            self.config
                .get_int(key)
                .ok()
                .and_then(|v| u64::try_from(v).ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        FailureDetectorConfig {
            ping_interval: millis("zeroth.fd.ping_interval_ms", defaults.ping_interval),
            ping_timeout: millis("zeroth.fd.ping_timeout_ms", defaults.ping_timeout),
        }
    }

    // ========================================================================
    // Logging Configuration
    // ========================================================================

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig::from_config(
            self.config.get_string("zeroth.logs.path").ok(),
            self.config.get_bool("zeroth.logs.console").unwrap_or(true),
            self.config.get_bool("zeroth.logs.file").unwrap_or(true),
            self.config
                .get_string("zeroth.logs.level")
                .unwrap_or("info".to_string()),
        )
    }
}

fn split_host_port(listen: &str) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::Message(format!("invalid listen address: {}", listen));
    let (host, port) = listen.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}
