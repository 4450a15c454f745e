use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tally_cluster::{DispatchConfig, NodeAddress};
use tally_common::retry::RetryConfig;
use tally_log::LogConfig;
use tally_metrics::{AggregatorConfig, Granularity, HashAlgorithm};

/// The file name of the configuration within the config directory.
const CONFIG_FILE_NAME: &str = "config.yml";

/// Defines the source of a config error.
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
}

impl fmt::Display for ConfigErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErrorSource::None => Ok(()),
            ConfigErrorSource::File(file_name) => {
                write!(f, " (file {})", file_name.display())
            }
        }
    }
}

/// The kind of a [`ConfigError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// A value is out of its permitted range.
    #[error("invalid config value")]
    InvalidValue,
}

/// Indicates config related errors.
#[derive(Debug, thiserror::Error)]
#[error("{kind}{origin}")]
pub struct ConfigError {
    kind: ConfigErrorKind,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    origin: ConfigErrorSource,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            kind,
            cause: None,
            origin: ConfigErrorSource::None,
        }
    }

    #[inline]
    fn wrap<E>(cause: E, kind: ConfigErrorKind) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            cause: Some(Box::new(cause)),
            ..Self::new(kind)
        }
    }

    #[inline]
    fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.origin = ConfigErrorSource::File(path.as_ref().to_path_buf());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

/// An invalid value in an otherwise well-formed configuration.
#[derive(Debug, thiserror::Error)]
#[error("{field}: {message}")]
struct InvalidValue {
    field: &'static str,
    message: &'static str,
}

fn default_node_address() -> String {
    "127.0.0.1:11800".to_owned()
}

/// Identity of this node within the cluster.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
struct Node {
    /// The address under which peers reach this node.
    ///
    /// Must match this node's entry in `cluster.members`. Defaults to `127.0.0.1:11800`.
    address: String,
    /// Maximum time in seconds to wait for pending flushes on shutdown.
    ///
    /// Defaults to `10` seconds.
    shutdown_timeout: u64,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            address: default_node_address(),
            shutdown_timeout: 10,
        }
    }
}

/// Controls internal reporting to a statsd server.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
struct Metrics {
    /// Hostname and port of the statsd server.
    ///
    /// Defaults to `None`, which disables internal metrics.
    statsd: Option<String>,
    /// Common prefix that should be added to all metrics.
    ///
    /// Defaults to `"tally"`.
    prefix: String,
    /// Default tags to apply to all metrics.
    default_tags: BTreeMap<String, String>,
    /// Emitted metrics will be buffered to optimize performance.
    ///
    /// Defaults to `true`.
    buffering: bool,
    /// Global sample rate for all emitted metrics between `0.0` and `1.0`.
    ///
    /// Defaults to `1.0` (100%).
    sample_rate: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: None,
            prefix: "tally".to_owned(),
            default_tags: BTreeMap::new(),
            buffering: true,
            sample_rate: 1.0,
        }
    }
}

/// Aggregator parameters for each granularity.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
struct Aggregators {
    minute: AggregatorConfig,
    hour: AggregatorConfig,
    day: AggregatorConfig,
    month: AggregatorConfig,
}

impl Default for Aggregators {
    fn default() -> Self {
        Self {
            minute: AggregatorConfig::for_granularity(Granularity::Minute),
            hour: AggregatorConfig::for_granularity(Granularity::Hour),
            day: AggregatorConfig::for_granularity(Granularity::Day),
            month: AggregatorConfig::for_granularity(Granularity::Month),
        }
    }
}

/// Membership and shard assignment.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct Cluster {
    /// Static list of cluster members, including this node.
    ///
    /// An empty list runs the node standalone. Members can be updated at runtime through the
    /// membership feed.
    members: Vec<String>,
    /// Hash function used to assign metrics to members.
    ///
    /// Defaults to `fnv`. All members must use the same algorithm.
    hash_algorithm: HashAlgorithm,
}

/// Retention of persisted metrics per granularity, in days.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
struct Retention {
    minute: u32,
    hour: u32,
    day: u32,
    month: u32,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            minute: 2,
            hour: 14,
            day: 90,
            month: 730,
        }
    }
}

/// Parameters of the persistence dispatcher.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct Persistence {
    /// Retries of failed storage writes.
    retry: RetryConfig,
    /// History retention per granularity.
    retention: Retention,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct ConfigValues {
    node: Node,
    logging: LogConfig,
    metrics: Metrics,
    aggregator: Aggregators,
    cluster: Cluster,
    dispatch: DispatchConfig,
    persistence: Persistence,
}

impl ConfigValues {
    fn validate(&self) -> Result<(), InvalidValue> {
        if self.node.address.is_empty() {
            return Err(InvalidValue {
                field: "node.address",
                message: "must not be empty",
            });
        }

        if !(0.0..=1.0).contains(&self.metrics.sample_rate) {
            return Err(InvalidValue {
                field: "metrics.sample_rate",
                message: "must be between 0 and 1",
            });
        }

        if self.dispatch.max_batch_size == 0 {
            return Err(InvalidValue {
                field: "dispatch.max_batch_size",
                message: "must be positive",
            });
        }

        if self.dispatch.retry.max_attempts == 0 || self.persistence.retry.max_attempts == 0 {
            return Err(InvalidValue {
                field: "retry.max_attempts",
                message: "must be positive",
            });
        }

        Ok(())
    }
}

/// Configuration of a Tally node.
#[derive(Debug, Default)]
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl Config {
    /// Loads a config from the `config.yml` file within the given directory.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = std::env::current_dir()
            .map(|dir| dir.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let file = path.join(CONFIG_FILE_NAME);
        let f = fs::File::open(&file).map_err(|e| {
            ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&file)
        })?;

        let values: ConfigValues = serde_yaml::from_reader(io::BufReader::new(f))
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&file))?;

        values
            .validate()
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::InvalidValue).file(&file))?;

        Ok(Config { values, path })
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        let values: ConfigValues = serde_json::from_value(value)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadJson))?;

        values
            .validate()
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::InvalidValue))?;

        Ok(Config {
            values,
            path: PathBuf::new(),
        })
    }

    /// Returns the directory the config was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dumps the effective configuration as YAML.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml))
    }

    /// Returns the address of this node.
    pub fn node_address(&self) -> NodeAddress {
        NodeAddress::from(self.values.node.address.as_str())
    }

    /// Returns the maximum time to wait for pending work on shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.values.node.shutdown_timeout)
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Returns the statsd server address, if internal metrics are enabled.
    pub fn statsd_addr(&self) -> Option<&str> {
        self.values.metrics.statsd.as_deref()
    }

    /// Returns the prefix of internal metrics.
    pub fn metrics_prefix(&self) -> &str {
        &self.values.metrics.prefix
    }

    /// Returns the default tags of internal metrics.
    pub fn metrics_default_tags(&self) -> &BTreeMap<String, String> {
        &self.values.metrics.default_tags
    }

    /// Returns `true` if internal metrics are buffered.
    pub fn metrics_buffering(&self) -> bool {
        self.values.metrics.buffering
    }

    /// Returns the global sample rate of internal metrics.
    pub fn metrics_sample_rate(&self) -> f64 {
        self.values.metrics.sample_rate
    }

    /// Returns the aggregator configuration for the given granularity.
    pub fn aggregator_config(&self, granularity: Granularity) -> &AggregatorConfig {
        let aggregators = &self.values.aggregator;
        match granularity {
            Granularity::Minute => &aggregators.minute,
            Granularity::Hour => &aggregators.hour,
            Granularity::Day => &aggregators.day,
            Granularity::Month => &aggregators.month,
        }
    }

    /// Returns the statically configured cluster members.
    pub fn cluster_members(&self) -> Vec<NodeAddress> {
        self.values
            .cluster
            .members
            .iter()
            .map(|member| NodeAddress::from(member.as_str()))
            .collect()
    }

    /// Returns the hash function used for shard assignment.
    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.values.cluster.hash_algorithm
    }

    /// Returns the configuration of the remote dispatcher.
    pub fn dispatch_config(&self) -> &DispatchConfig {
        &self.values.dispatch
    }

    /// Returns the retry parameters of storage writes.
    pub fn persistence_retry(&self) -> &RetryConfig {
        &self.values.persistence.retry
    }

    /// Returns how long persisted metrics of the given granularity are kept.
    pub fn retention(&self, granularity: Granularity) -> Duration {
        let retention = &self.values.persistence.retention;
        let days = match granularity {
            Granularity::Minute => retention.minute,
            Granularity::Hour => retention.hour,
            Granularity::Day => retention.day,
            Granularity::Month => retention.month,
        };

        Duration::from_secs(u64::from(days) * 24 * 3600)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_json_value(serde_json::json!({})).unwrap();

        assert_eq!(config.node_address().as_str(), "127.0.0.1:11800");
        assert!(config.cluster_members().is_empty());
        assert_eq!(config.hash_algorithm(), HashAlgorithm::Fnv);
        assert_eq!(
            config.aggregator_config(Granularity::Hour).flush_interval(),
            Duration::from_secs(60)
        );
        assert_eq!(
            config.retention(Granularity::Minute),
            Duration::from_secs(2 * 24 * 3600)
        );
        assert_eq!(config.dispatch_config(), &DispatchConfig::default());
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join(CONFIG_FILE_NAME)).unwrap();
        writeln!(
            file,
            r#"
node:
  address: "10.0.0.2:11800"
cluster:
  members: ["10.0.0.1:11800", "10.0.0.2:11800"]
  hash_algorithm: murmur3
aggregator:
  minute:
    flush_interval: 10
    max_total_entries: 100000
dispatch:
  max_batch_size: 200
  retry:
    max_attempts: 3
persistence:
  retention:
    minute: 1
"#
        )
        .unwrap();

        let config = Config::from_path(dir.path()).unwrap();
        assert_eq!(config.node_address().as_str(), "10.0.0.2:11800");
        assert_eq!(config.cluster_members().len(), 2);
        assert_eq!(config.hash_algorithm(), HashAlgorithm::Murmur3);

        let minute = config.aggregator_config(Granularity::Minute);
        assert_eq!(minute.flush_interval, 10);
        assert_eq!(minute.max_total_entries, Some(100000));
        // Sections that are not mentioned keep their per-granularity defaults.
        assert_eq!(config.aggregator_config(Granularity::Month).flush_interval, 300);

        assert_eq!(config.dispatch_config().max_batch_size, 200);
        assert_eq!(config.dispatch_config().retry.max_attempts, 3);
        assert_eq!(config.dispatch_config().retry.initial_interval_ms, 500);
        assert_eq!(
            config.retention(Granularity::Minute),
            Duration::from_secs(24 * 3600)
        );
        assert_eq!(
            config.retention(Granularity::Day),
            Duration::from_secs(90 * 24 * 3600)
        );
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let error = Config::from_path(dir.path()).unwrap_err();

        assert_eq!(error.kind(), ConfigErrorKind::CouldNotOpenFile);
        assert!(error.to_string().starts_with("could not open config file (file "));
    }

    #[test]
    fn test_invalid_values() {
        let error = Config::from_json_value(serde_json::json!({
            "dispatch": {"max_batch_size": 0}
        }))
        .unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::InvalidValue);

        let error = Config::from_json_value(serde_json::json!({
            "cluster": {"hash_algorithm": "crc32"}
        }))
        .unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::BadJson);
    }

    #[test]
    fn test_dump_defaults() {
        let config = Config::from_json_value(serde_json::json!({})).unwrap();
        let yaml = config.to_yaml_string().unwrap();
        assert!(yaml.contains("hash_algorithm: fnv"));

        insta::assert_json_snapshot!(config.values, @r###"
        {
          "node": {
            "address": "127.0.0.1:11800",
            "shutdown_timeout": 10
          },
          "logging": {
            "level": "info",
            "format": "auto",
            "enable_backtraces": false
          },
          "metrics": {
            "statsd": null,
            "prefix": "tally",
            "default_tags": {},
            "buffering": true,
            "sample_rate": 1.0
          },
          "aggregator": {
            "minute": {
              "flush_interval": 25,
              "shards": 64,
              "max_total_entries": null,
              "max_entries_per_metric": null
            },
            "hour": {
              "flush_interval": 60,
              "shards": 64,
              "max_total_entries": null,
              "max_entries_per_metric": null
            },
            "day": {
              "flush_interval": 120,
              "shards": 64,
              "max_total_entries": null,
              "max_entries_per_metric": null
            },
            "month": {
              "flush_interval": 300,
              "shards": 64,
              "max_total_entries": null,
              "max_entries_per_metric": null
            }
          },
          "cluster": {
            "members": [],
            "hash_algorithm": "fnv"
          },
          "dispatch": {
            "batch_interval_ms": 100,
            "max_batch_size": 500,
            "max_queue_size": 10000,
            "retry": {
              "max_attempts": 5,
              "initial_interval_ms": 500,
              "max_interval_ms": 10000,
              "attempt_timeout_ms": 5000
            }
          },
          "persistence": {
            "retry": {
              "max_attempts": 5,
              "initial_interval_ms": 500,
              "max_interval_ms": 10000,
              "attempt_timeout_ms": 5000
            },
            "retention": {
              "minute": 2,
              "hour": 14,
              "day": 90,
              "month": 730
            }
          }
        }
        "###);
    }
}
