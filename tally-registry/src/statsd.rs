use tally_statsd::{CounterMetric, TimerMetric};

/// Counter metrics for the identity registry.
pub enum RegistryCounters {
    /// Number of lookups that missed the cache and enqueued a creation request.
    ///
    /// This metric is tagged with:
    ///  - `scope`: `service`, `instance` or `endpoint`.
    CacheMiss,

    /// Number of identities confirmed by the sink and added to the cache.
    ///
    /// This metric is tagged with:
    ///  - `scope`: `service`, `instance` or `endpoint`.
    IdentityCached,

    /// Number of creation requests skipped because the key was cached in the meantime.
    DuplicateSkipped,

    /// Number of failed sink operations.
    ///
    /// This metric is tagged with:
    ///  - `operation`: `create`, `heartbeat` or `set_property`.
    SinkFailed,
}

impl CounterMetric for RegistryCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::CacheMiss => "registry.cache.miss",
            Self::IdentityCached => "registry.cache.insert",
            Self::DuplicateSkipped => "registry.create.duplicate",
            Self::SinkFailed => "registry.sink.failed",
        }
    }
}

/// Timer metrics for the identity registry.
pub enum RegistryTimers {
    /// Time spent in a single sink operation.
    ///
    /// This metric is tagged with:
    ///  - `operation`: `create`, `heartbeat` or `set_property`.
    SinkDuration,
}

impl TimerMetric for RegistryTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::SinkDuration => "registry.sink.duration",
        }
    }
}
