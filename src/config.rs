use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Server settings, read from `GEARBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// JSON equipment catalog. Without one, nothing is reservable.
    pub catalog: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub max_connections: usize,
    /// Compact the WAL once this many appends accumulate.
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5480,
            data_dir: PathBuf::from("./data"),
            catalog: None,
            metrics_port: None,
            max_connections: 256,
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(
            var: &'static str,
            raw: Option<String>,
        ) -> Result<Option<T>, ConfigError> {
            raw.map(|v| {
                v.trim().parse().map_err(|_| ConfigError::Invalid { var, value: v.clone() })
            })
            .transpose()
        }

        let d = Self::default();
        Ok(Self {
            bind: get("GEARBOOK_BIND").unwrap_or(d.bind),
            port: parse("GEARBOOK_PORT", get("GEARBOOK_PORT"))?.unwrap_or(d.port),
            data_dir: get("GEARBOOK_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            catalog: get("GEARBOOK_CATALOG").map(PathBuf::from),
            metrics_port: parse("GEARBOOK_METRICS_PORT", get("GEARBOOK_METRICS_PORT"))?,
            max_connections: parse("GEARBOOK_MAX_CONNECTIONS", get("GEARBOOK_MAX_CONNECTIONS"))?
                .unwrap_or(d.max_connections),
            compact_threshold: parse(
                "GEARBOOK_COMPACT_THRESHOLD",
                get("GEARBOOK_COMPACT_THRESHOLD"),
            )?
            .unwrap_or(d.compact_threshold),
            sweep_interval: parse::<u64>(
                "GEARBOOK_SWEEP_INTERVAL_SECS",
                get("GEARBOOK_SWEEP_INTERVAL_SECS"),
            )?
            .map_or(d.sweep_interval, Duration::from_secs),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("gearbook.wal")
    }
}
