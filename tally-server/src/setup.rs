//! Process setup shared by embedders of the pipeline.

use std::io;

use tally_config::Config;
use tally_statsd::MetricsClientConfig;

/// Initializes logging from the `logging` section of the config.
pub fn init_logging(config: &Config) {
    tally_log::init(config.logging());
}

/// Initializes internal statsd metrics.
///
/// Does nothing if no statsd address is configured.
pub fn init_metrics(config: &Config) -> io::Result<()> {
    let Some(host) = config.statsd_addr() else {
        return Ok(());
    };

    tally_statsd::init(MetricsClientConfig {
        prefix: config.metrics_prefix(),
        host,
        default_tags: config.metrics_default_tags().clone(),
        default_sample_rate: config.metrics_sample_rate().into(),
        buffered: config.metrics_buffering(),
    })
}

/// Prints startup information to the log.
pub fn dump_spawn_infos(config: &Config) {
    if config.path().as_os_str().is_empty() {
        tally_log::info!("launching tally without config folder");
    } else {
        tally_log::info!(
            "launching tally from config folder {}",
            config.path().display()
        );
    }

    tally_log::info!("  node address: {}", config.node_address());
    tally_log::info!("  cluster members: {}", config.cluster_members().len());
    tally_log::info!("  log level: {}", config.logging().level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_disabled_without_statsd() {
        init_metrics(&Config::default()).unwrap();
    }

    #[test]
    fn test_unresolvable_statsd_host() {
        let config = Config::from_json_value(serde_json::json!({
            "metrics": {"statsd": "not a socket address"}
        }))
        .unwrap();

        assert!(init_metrics(&config).is_err());
    }
}
