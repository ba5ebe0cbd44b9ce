use std::time::Duration;

use rand::Rng;

use crate::domain::WorkerError;

/// Coordination store endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    /// Per-request timeout for writes (watches are long-lived and exempt).
    pub request_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 4001,
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl StoreConfig {
    pub fn endpoint(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// Broker-side settings for the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Jobs processed at the same time by this worker.
    pub concurrency: usize,
    /// How long a lease stays locked without renewal.
    pub lock_duration: Duration,
    /// How often expired locks are looked for.
    pub stalled_interval: Duration,
    /// Redeliveries allowed for a stalled job before it is failed.
    pub max_stalled_count: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            lock_duration: Duration::from_secs(30),
            stalled_interval: Duration::from_secs(30),
            max_stalled_count: 1,
        }
    }
}

/// Completion timer policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerPolicy {
    /// Always wait this long; zero resolves immediately.
    Fixed(Duration),
    /// Uniformly random in `[min, max]`.
    Random { min: Duration, max: Duration },
}

impl Default for TimerPolicy {
    fn default() -> Self {
        TimerPolicy::Fixed(Duration::from_millis(100))
    }
}

impl TimerPolicy {
    pub fn next_delay(&self) -> Duration {
        match self {
            TimerPolicy::Fixed(delay) => *delay,
            TimerPolicy::Random { min, max } if max > min => {
                let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
                Duration::from_millis(millis as u64)
            }
            TimerPolicy::Random { min, .. } => *min,
        }
    }
}

/// Decision policy for jobs without embedded code.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyConfig {
    /// Succeed with the first input while it is `<= threshold`.
    Threshold { threshold: f64 },
    /// Random value in 1..=10, succeeding with `success_rate` probability.
    Random { success_rate: f64 },
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig::Threshold { threshold: 10.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Wall-clock limit for one evaluation; `None` disables it.
    pub timeout: Option<Duration>,
    /// QuickJS heap limit in bytes.
    pub memory_limit: Option<usize>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            memory_limit: Some(64 * 1024 * 1024),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub service_name: String,
    /// Re-publish period for the liveness record.
    pub interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_name: "worker-stub".to_string(),
            interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Job type this worker consumes; also published as `algorithmName`.
    pub algorithm: String,
    pub store: StoreConfig,
    pub queue: QueueSettings,
    pub timer: TimerPolicy,
    pub policy: PolicyConfig,
    pub sandbox: SandboxConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            algorithm: "green-alg".to_string(),
            store: StoreConfig::default(),
            queue: QueueSettings::default(),
            timer: TimerPolicy::default(),
            policy: PolicyConfig::default(),
            sandbox: SandboxConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(algorithm: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            ..Default::default()
        }
    }

    pub fn with_timer(mut self, timer: TimerPolicy) -> Self {
        self.timer = timer;
        self
    }

    pub fn with_policy(mut self, policy: PolicyConfig) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_queue(mut self, queue: QueueSettings) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    /// Reject settings the worker cannot run with.
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.algorithm.trim().is_empty() {
            return Err(WorkerError::Config("algorithm must not be empty".to_string()));
        }
        if self.queue.concurrency == 0 {
            return Err(WorkerError::Config("queue concurrency must be at least 1".to_string()));
        }
        if self.queue.lock_duration.is_zero() || self.queue.stalled_interval.is_zero() {
            return Err(WorkerError::Config(
                "lock duration and stalled interval must be positive".to_string(),
            ));
        }
        if let TimerPolicy::Random { min, max } = &self.timer
            && min > max
        {
            return Err(WorkerError::Config(format!(
                "random timer min {min:?} is greater than max {max:?}"
            )));
        }
        match self.policy {
            PolicyConfig::Threshold { threshold } if !threshold.is_finite() => {
                return Err(WorkerError::Config("threshold must be finite".to_string()));
            }
            PolicyConfig::Random { success_rate } if !(0.0..=1.0).contains(&success_rate) => {
                return Err(WorkerError::Config(format!(
                    "success rate {success_rate} is outside 0..=1"
                )));
            }
            _ => {}
        }
        if self.discovery.interval.is_zero() {
            return Err(WorkerError::Config("discovery interval must be positive".to_string()));
        }
        Ok(())
    }
}
