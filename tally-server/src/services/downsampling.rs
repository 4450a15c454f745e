use tally_metrics::{Granularity, Metric};

use crate::services::aggregator::WorkerHandle;

/// Forwards finalized metrics to the worker of the next coarser granularity.
///
/// The downsampling chain is minute, hour, day, month. Every worker except the month worker has
/// a downsampler pointing at its successor. Forwarded metrics keep their name, entity and raw
/// payload, only the time bucket is truncated.
#[derive(Clone, Debug)]
pub struct Downsampler {
    next: Option<WorkerHandle>,
}

impl Downsampler {
    /// Creates a downsampler feeding `next`, or a terminal one if `next` is `None`.
    pub fn new(next: Option<WorkerHandle>) -> Self {
        Self { next }
    }

    /// Returns the granularity metrics are downsampled to.
    pub fn target(&self) -> Option<Granularity> {
        self.next.as_ref().map(WorkerHandle::granularity)
    }

    /// Returns the worker receiving downsampled metrics.
    pub fn next(&self) -> Option<&WorkerHandle> {
        self.next.as_ref()
    }

    /// Downsamples every metric and accepts it into the next worker.
    ///
    /// Returns the number of forwarded metrics.
    pub fn forward(&self, metrics: &[Metric]) -> usize {
        let Some(next) = &self.next else {
            return 0;
        };

        let mut forwarded = 0;
        for metric in metrics {
            match metric.downsample(next.granularity()) {
                Ok(downsampled) => {
                    next.accept(downsampled);
                    forwarded += 1;
                }
                Err(error) => {
                    tally_log::error!(
                        error = &error as &dyn std::error::Error,
                        metric = %metric.id(),
                        "failed to downsample metric"
                    );
                }
            }
        }

        forwarded
    }
}

#[cfg(test)]
mod tests {
    use tally_common::time::UnixTimestamp;
    use tally_config::Config;
    use tally_metrics::{EntityId, MetricName, Observation};
    use tally_system::Addr;

    use super::*;

    fn worker(granularity: Granularity, next: Option<WorkerHandle>) -> WorkerHandle {
        let config = Config::default();
        WorkerHandle::new(
            granularity,
            config.aggregator_config(granularity).clone(),
            Addr::dummy(),
            Downsampler::new(next),
        )
    }

    fn cpm(minute: u64) -> Metric {
        Metric::from_observation(
            MetricName::new("service_cpm").unwrap(),
            EntityId::from("1"),
            // 2024-02-29 10:00:00 UTC
            UnixTimestamp::from_secs(1709200800 + minute * 60),
            Observation::Cpm(1),
        )
        .unwrap()
    }

    #[test]
    fn test_forward_truncates_buckets() {
        let hour = worker(Granularity::Hour, None);
        let downsampler = Downsampler::new(Some(hour.clone()));
        assert_eq!(downsampler.target(), Some(Granularity::Hour));

        let metrics: Vec<_> = (0..120).map(cpm).collect();
        assert_eq!(downsampler.forward(&metrics), 120);

        // 120 minutes over two hours collapse into two hour entities.
        let drained = hour.aggregator().drain(UnixTimestamp::from_secs(0));
        let mut buckets: Vec<_> = drained.iter().map(|m| m.time_bucket().as_u64()).collect();
        buckets.sort();
        assert_eq!(buckets, [2024022910, 2024022911]);
    }

    #[test]
    fn test_terminal_downsampler() {
        let downsampler = Downsampler::new(None);
        assert_eq!(downsampler.target(), None);
        assert_eq!(downsampler.forward(&[cpm(0)]), 0);
    }
}
