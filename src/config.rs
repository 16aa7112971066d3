use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DbError, Result};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_BATCH_SIZE: usize = 64;
pub const DEFAULT_CURSOR_IDLE: Duration = Duration::from_secs(600);

/// Runtime configuration shared by the server, the demo driver and the CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Seed host the client connects to.
    pub host: String,
    pub port: u16,
    /// Directory stream module sources are loaded from.
    pub udf_dir: PathBuf,
    /// Sled directory of the record server.
    pub data_dir: PathBuf,
    /// Sleep between status polls while waiting on server-side tasks.
    pub poll_interval: Duration,
    /// Rows requested per cursor fetch.
    pub batch_size: usize,
    /// When set, the server also writes JSON logs to a daily file here.
    pub log_dir: Option<PathBuf>,
    /// Server side: cursors not fetched from for this long are closed.
    pub cursor_idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "P3".to_string(),
            port: DEFAULT_PORT,
            udf_dir: PathBuf::from("udf"),
            data_dir: PathBuf::from("profiledb_data"),
            poll_interval: Duration::from_millis(1000),
            batch_size: DEFAULT_BATCH_SIZE,
            log_dir: None,
            cursor_idle_timeout: DEFAULT_CURSOR_IDLE,
        }
    }
}

impl Config {
    /// Defaults overridden by `PROFILEDB_*` variables, after loading `.env`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        if let Some(host) = lookup("PROFILEDB_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("PROFILEDB_PORT") {
            config.port = parse_var("PROFILEDB_PORT", &port)?;
        }
        if let Some(dir) = lookup("PROFILEDB_UDF_DIR") {
            config.udf_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("PROFILEDB_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(ms) = lookup("PROFILEDB_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(parse_var("PROFILEDB_POLL_INTERVAL_MS", &ms)?);
        }
        if let Some(size) = lookup("PROFILEDB_BATCH_SIZE") {
            config.batch_size = parse_var("PROFILEDB_BATCH_SIZE", &size)?;
            if config.batch_size == 0 {
                return Err(DbError::InvalidConfig("PROFILEDB_BATCH_SIZE must be positive".into()));
            }
        }
        if let Some(dir) = lookup("PROFILEDB_LOG_DIR") {
            config.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(secs) = lookup("PROFILEDB_CURSOR_IDLE_SECS") {
            let secs: u64 = parse_var("PROFILEDB_CURSOR_IDLE_SECS", &secs)?;
            if secs == 0 {
                return Err(DbError::InvalidConfig("PROFILEDB_CURSOR_IDLE_SECS must be positive".into()));
            }
            config.cursor_idle_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    /// Base URL of the record server's HTTP API.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| DbError::InvalidConfig(format!("{name}={raw:?} is not valid")))
}
