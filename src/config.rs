//! Sink configuration
//!
//! The configuration is read from:
//! 1. `PROM_SINK_CONFIG` environment variable (path to TOML file)
//! 2. `./prometheus-sink.toml` in current directory
//! 3. Default configuration
//!
//! `PROM_SINK_LISTEN_ADDRESS`, `PROM_SINK_PORT`, `PROM_SINK_SOURCE` and
//! `PROM_SINK_DELAY_BEFORE_START_MS` override the loaded values.
//!
//! # Example
//!
//! ```toml
//! listen_address = "127.0.0.1"
//! port = 9102
//! source = "/var/run/operations.jsonl"
//!
//! [instruments]
//! histogram_buckets = [0.01, 0.1, 1.0, 10.0]
//! summary_max_age_secs = 300
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use prometheus::core::Desc;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::exporter::dispatch_stat_names;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "PROM_SINK_CONFIG";

/// Config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "prometheus-sink.toml";

/// Source value meaning standard input
pub const STDIN_SOURCE: &str = "-";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SinkConfig {
    /// Address the metrics endpoint binds to
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Port of the metrics endpoint
    #[serde(default = "default_port")]
    pub port: u16,

    /// Sleep before connecting to the source
    #[serde(default)]
    pub delay_before_start_ms: u64,

    /// Operation source: a file path, or `-` for stdin
    #[serde(default = "default_source")]
    pub source: String,

    /// Register CPU/memory/fd metrics of this process
    #[serde(default = "default_true")]
    pub collect_process_metrics: bool,

    /// Prefix of the sink's own operation counters
    #[serde(default = "default_metric_prefix")]
    pub metric_prefix: String,

    /// Bucket and quantile settings
    #[serde(default)]
    pub instruments: InstrumentsConfig,
}

/// `[instruments]` table
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InstrumentsConfig {
    /// Histogram bucket upper bounds (None = client defaults)
    #[serde(default)]
    pub histogram_buckets: Option<Vec<f64>>,

    /// Summary quantiles (None = defaults)
    #[serde(default)]
    pub summary_quantiles: Option<Vec<f64>>,

    /// Age of the summary sliding window in seconds
    #[serde(default = "default_summary_max_age_secs")]
    pub summary_max_age_secs: u64,

    /// Observations kept per summary series
    #[serde(default = "default_summary_max_samples")]
    pub summary_max_samples: usize,
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9102
}

fn default_source() -> String {
    STDIN_SOURCE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_metric_prefix() -> String {
    "prometheus_sink".to_string()
}

fn default_summary_max_age_secs() -> u64 {
    600
}

fn default_summary_max_samples() -> usize {
    1024
}

impl Default for InstrumentsConfig {
    fn default() -> Self {
        Self {
            histogram_buckets: None,
            summary_quantiles: None,
            summary_max_age_secs: default_summary_max_age_secs(),
            summary_max_samples: default_summary_max_samples(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            port: default_port(),
            delay_before_start_ms: 0,
            source: default_source(),
            collect_process_metrics: true,
            metric_prefix: default_metric_prefix(),
            instruments: InstrumentsConfig::default(),
        }
    }
}

impl SinkConfig {
    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Read and parse a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Endpoint bind address
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.listen_address.parse().map_err(|_| {
            Error::Configuration(format!("Invalid listen address: {}", self.listen_address))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Delay before the source is opened
    pub fn delay_before_start(&self) -> Duration {
        Duration::from_millis(self.delay_before_start_ms)
    }

    /// Whether the source is standard input
    pub fn reads_stdin(&self) -> bool {
        self.source == STDIN_SOURCE
    }

    /// Apply `PROM_SINK_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup("PROM_SINK_LISTEN_ADDRESS") {
            self.listen_address = address;
        }
        if let Some(port) = lookup("PROM_SINK_PORT") {
            self.port = port
                .parse()
                .map_err(|_| Error::Configuration(format!("Invalid PROM_SINK_PORT: {}", port)))?;
        }
        if let Some(source) = lookup("PROM_SINK_SOURCE") {
            self.source = source;
        }
        if let Some(delay) = lookup("PROM_SINK_DELAY_BEFORE_START_MS") {
            self.delay_before_start_ms = delay.parse().map_err(|_| {
                Error::Configuration(format!("Invalid PROM_SINK_DELAY_BEFORE_START_MS: {}", delay))
            })?;
        }
        Ok(())
    }

    /// Reject values that would only fail later at bind or render time
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;
        if self.source.is_empty() {
            return Err(Error::Configuration("source must not be empty".to_string()));
        }
        if self.metric_prefix.is_empty() {
            return Err(Error::Configuration(
                "metric_prefix must not be empty".to_string(),
            ));
        }
        for name in dispatch_stat_names(&self.metric_prefix) {
            Desc::new(name, "dispatch counter".to_string(), Vec::new(), HashMap::new()).map_err(
                |e| {
                    Error::Configuration(format!(
                        "metric_prefix {:?} is not a valid metric name prefix: {}",
                        self.metric_prefix, e
                    ))
                },
            )?;
        }
        Ok(())
    }
}

/// Load configuration from file or environment
pub fn load_config() -> Result<SinkConfig> {
    let mut config = load_file_config();
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn load_file_config() -> SinkConfig {
    // Check environment variable first
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        match SinkConfig::from_file(&path) {
            Ok(config) => {
                info!(path = %path, "Loaded configuration from file");
                return config;
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to load config file, using defaults");
            }
        }
    }

    // Check default config file
    if Path::new(DEFAULT_CONFIG_FILE).exists() {
        match SinkConfig::from_file(DEFAULT_CONFIG_FILE) {
            Ok(config) => {
                info!("Loaded configuration from {}", DEFAULT_CONFIG_FILE);
                return config;
            }
            Err(e) => {
                warn!(error = %e, "Failed to load {}, using defaults", DEFAULT_CONFIG_FILE);
            }
        }
    }

    info!("Using default configuration");
    SinkConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SinkConfig::default();
        assert_eq!(config.listen_address, "0.0.0.0");
        assert_eq!(config.port, 9102);
        assert!(config.reads_stdin());
        assert!(config.collect_process_metrics);
        assert_eq!(config.instruments.summary_max_samples, 1024);
        assert_eq!(
            config.socket_addr().unwrap(),
            "0.0.0.0:9102".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(SinkConfig::from_toml("").unwrap(), SinkConfig::default());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
listen_address = "127.0.0.1"
port = 9200
source = "/tmp/ops.jsonl"

[instruments]
histogram_buckets = [0.5, 1.0, 5.0]
summary_max_age_secs = 30
"#
        )
        .unwrap();

        let config = SinkConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, 9200);
        assert_eq!(config.source, "/tmp/ops.jsonl");
        assert_eq!(
            config.instruments.histogram_buckets,
            Some(vec![0.5, 1.0, 5.0])
        );
        assert_eq!(config.instruments.summary_max_age_secs, 30);
        assert_eq!(config.instruments.summary_max_samples, 1024);
        assert!(!config.reads_stdin());
    }

    #[test]
    fn test_invalid_toml_is_configuration_error() {
        assert!(matches!(
            SinkConfig::from_toml("port = \"not a number\""),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SinkConfig::from_file(dir.path().join("missing.toml")),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("PROM_SINK_LISTEN_ADDRESS", "127.0.0.1"),
            ("PROM_SINK_PORT", "9300"),
            ("PROM_SINK_DELAY_BEFORE_START_MS", "250"),
        ]
        .into_iter()
        .collect();

        let mut config = SinkConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.socket_addr().unwrap().to_string(), "127.0.0.1:9300");
        assert_eq!(config.delay_before_start(), Duration::from_millis(250));
        assert!(config.reads_stdin());
    }

    #[test]
    fn test_invalid_override_rejected() {
        let mut config = SinkConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "PROM_SINK_PORT").then(|| "70000".to_string())
        });
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_bad_address() {
        let config = SinkConfig {
            listen_address: "not-an-ip".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_invalid_metric_prefix() {
        for prefix in ["my-sink", "9sink", "sink prefix"] {
            let config = SinkConfig {
                metric_prefix: prefix.to_string(),
                ..Default::default()
            };
            let err = config.validate().unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{}", prefix);
            assert!(err.to_string().contains(prefix));
        }

        let config = SinkConfig {
            metric_prefix: "my_sink:v2".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
