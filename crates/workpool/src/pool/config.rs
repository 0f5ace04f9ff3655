//! Pool configuration

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PoolError;
use crate::observer::Observer;
use crate::scope::Clock;

/// Worker pool configuration
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use workpool::PoolConfig;
///
/// let config = PoolConfig::new(8, 32)
///     .with_name("importer")
///     .with_shutdown_grace(Duration::from_secs(2));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Name used in log lines and events
    pub name: String,

    /// Number of long-lived workers
    pub worker_count: usize,

    /// Jobs that may wait in the queue before `submit` blocks
    pub queue_capacity: usize,

    /// Results buffered for the stream before workers block on delivery
    pub result_capacity: usize,

    /// How long forced shutdown waits for workers before abandoning them, and
    /// how long any shutdown lets workers wait on a full result stream
    #[serde(with = "duration_millis")]
    pub shutdown_grace: Duration,

    /// Attach a [`TracingObserver`](crate::TracingObserver) automatically
    pub log_events: bool,

    #[serde(skip)]
    observers: Vec<Arc<dyn Observer>>,

    #[serde(skip)]
    clock: Option<Arc<dyn Clock>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: format!("pool-{}", Uuid::now_v7()),
            worker_count: 4,
            queue_capacity: 64,
            result_capacity: 1024,
            shutdown_grace: Duration::from_secs(5),
            log_events: true,
            observers: Vec::new(),
            clock: None,
        }
    }
}

impl PoolConfig {
    /// Configuration for `worker_count` workers and a queue of `queue_capacity`
    pub fn new(worker_count: usize, queue_capacity: usize) -> Self {
        Self {
            worker_count,
            queue_capacity,
            ..Default::default()
        }
    }

    /// Load configuration from `WORKPOOL_*` environment variables
    ///
    /// Unset variables keep their defaults; unparsable ones are an error.
    pub fn from_env() -> Result<Self, PoolError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PoolError> {
        let mut config = Self::default();

        if let Some(name) = lookup("WORKPOOL_NAME") {
            config.name = name;
        }
        if let Some(workers) = parse_var(&lookup, "WORKPOOL_WORKERS")? {
            config.worker_count = workers;
        }
        if let Some(capacity) = parse_var(&lookup, "WORKPOOL_QUEUE_CAPACITY")? {
            config.queue_capacity = capacity;
        }
        if let Some(capacity) = parse_var(&lookup, "WORKPOOL_RESULT_CAPACITY")? {
            config.result_capacity = capacity;
        }
        if let Some(millis) = parse_var::<u64>(&lookup, "WORKPOOL_SHUTDOWN_GRACE_MS")? {
            config.shutdown_grace = Duration::from_millis(millis);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_result_capacity(mut self, capacity: usize) -> Self {
        self.result_capacity = capacity;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Turn the built-in tracing observer on or off
    pub fn with_log_events(mut self, enabled: bool) -> Self {
        self.log_events = enabled;
        self
    }

    /// Register an observer for pool events
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Drive deadlines and durations from `clock` instead of tokio time
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Reject configurations the pool cannot run with
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.name.trim().is_empty() {
            return Err(PoolError::InvalidConfig("name must not be empty".into()));
        }
        if self.worker_count == 0 {
            return Err(PoolError::InvalidConfig(
                "worker_count must be at least 1".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(PoolError::InvalidConfig(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.result_capacity == 0 {
            return Err(PoolError::InvalidConfig(
                "result_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn observers(&self) -> &[Arc<dyn Observer>] {
        &self.observers
    }

    pub(crate) fn clock(&self) -> Option<Arc<dyn Clock>> {
        self.clock.clone()
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("name", &self.name)
            .field("worker_count", &self.worker_count)
            .field("queue_capacity", &self.queue_capacity)
            .field("result_capacity", &self.result_capacity)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("log_events", &self.log_events)
            .field("observers", &self.observers.len())
            .field("clock", &self.clock)
            .finish()
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, PoolError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PoolError::InvalidConfig(format!("{key}: cannot parse {raw:?}"))),
    }
}

/// Serde helper for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert!(config.name.starts_with("pool-"));
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.result_capacity, 1024);
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert!(config.log_events);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        assert!(matches!(
            PoolConfig::new(0, 4).validate(),
            Err(PoolError::InvalidConfig(_))
        ));
        assert!(matches!(
            PoolConfig::new(2, 0).validate(),
            Err(PoolError::InvalidConfig(_))
        ));
        assert!(PoolConfig::new(1, 1)
            .with_result_capacity(0)
            .validate()
            .is_err());
        assert!(PoolConfig::new(1, 1).with_name("  ").validate().is_err());
    }

    #[test]
    fn test_from_lookup_overrides_defaults() {
        let config = PoolConfig::from_lookup(lookup(&[
            ("WORKPOOL_NAME", "ingest"),
            ("WORKPOOL_WORKERS", "12"),
            ("WORKPOOL_QUEUE_CAPACITY", " 256 "),
            ("WORKPOOL_SHUTDOWN_GRACE_MS", "750"),
        ]))
        .unwrap();

        assert_eq!(config.name, "ingest");
        assert_eq!(config.worker_count, 12);
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.result_capacity, 1024);
        assert_eq!(config.shutdown_grace, Duration::from_millis(750));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = PoolConfig::from_lookup(lookup(&[("WORKPOOL_WORKERS", "many")])).unwrap_err();
        assert!(err.to_string().contains("WORKPOOL_WORKERS"));

        let err = PoolConfig::from_lookup(lookup(&[("WORKPOOL_WORKERS", "0")])).unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_serde_roundtrip_skips_collaborators() {
        let config = PoolConfig::new(3, 9).with_shutdown_grace(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["shutdown_grace"], 1500);
        assert!(json.get("observers").is_none());

        let parsed: PoolConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.worker_count, 3);
        assert_eq!(parsed.shutdown_grace, Duration::from_millis(1500));
    }
}
