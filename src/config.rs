use clap::{Parser, Subcommand};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Config file picked up from the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "agent-feed.yaml";

/// Default log filter when neither `RUST_LOG` nor config sets one.
pub const DEFAULT_LOG_FILTER: &str = "info,agent_feed=debug";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "FEED_CONFIG_FILE", global = true)]
    pub config: Option<String>,

    /// Agent backend base URL
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Bearer token for the agent backend
    #[arg(long, env = "FEED_API_TOKEN", global = true, hide_env_values = true)]
    pub api_token: Option<String>,

    /// Enable trace polling
    #[arg(long, global = true)]
    pub polling_enabled: Option<bool>,

    /// Trace poll interval in milliseconds
    #[arg(long, global = true)]
    pub poll_interval_ms: Option<u64>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Fold a recorded feed (JSON lines) against an optional persisted
    /// snapshot and print the assembled conversation
    Replay {
        #[arg(long)]
        events: PathBuf,
        #[arg(long)]
        persisted: Option<PathBuf>,
    },
    /// Load a task and print the conversation on every trace refresh
    Watch {
        #[arg(long)]
        task: String,
    },
    /// Approve a pending approval request
    Approve {
        #[arg(long)]
        task: String,
        #[arg(long)]
        approval: String,
    },
    /// Deny a pending approval request
    Deny {
        #[arg(long)]
        task: String,
        #[arg(long)]
        approval: String,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub polling: PollingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub api_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl PollingConfig {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.interval_ms.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Self::from_cli(&cli)
    }

    /// Layer defaults, config file, `FEED_` environment and CLI flags, in
    /// that order of increasing precedence.
    pub fn from_cli(cli: &Cli) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder()
            .set_default("backend.base_url", "http://localhost:3000")?
            .set_default("backend.request_timeout_secs", 30)?
            .set_default("polling.enabled", true)?
            .set_default("polling.interval_ms", 5000)?
            .set_default("logging.filter", DEFAULT_LOG_FILTER)?
            .set_default("logging.json", false)?;

        match &cli.config {
            Some(path) => builder = builder.add_source(File::with_name(path).required(true)),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false));
            }
            None => {}
        }

        // E.g. FEED_BACKEND__BASE_URL=http://agents.internal:8080
        builder = builder.add_source(
            Environment::with_prefix("FEED")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(url) = &cli.base_url {
            builder = builder.set_override("backend.base_url", url.as_str())?;
        }
        if let Some(token) = &cli.api_token {
            builder = builder.set_override("backend.api_token", token.as_str())?;
        }
        if let Some(enabled) = cli.polling_enabled {
            builder = builder.set_override("polling.enabled", enabled)?;
        }
        if let Some(ms) = cli.poll_interval_ms {
            builder = builder.set_override("polling.interval_ms", ms)?;
        }
        if cli.json_logs {
            builder = builder.set_override("logging.json", true)?;
        }

        builder.build()?.try_deserialize()
    }
}
