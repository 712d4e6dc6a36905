use crate::core::{BridgeError, PhilosophicalActor, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a mutation path coordinates with concurrent writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStrategy {
    /// Version-gated compare-and-swap, falling back to a lock under starvation.
    Optimistic,
    /// Exclusive per-id lock for the whole read/modify/write.
    Pessimistic,
}

impl Default for LockStrategy {
    fn default() -> Self {
        Self::Optimistic
    }
}

/// What a pipeline run does when a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Abort on the first failing stage and surface its error.
    FailFast,
    /// Mark the intent `FAILED` and keep running the remaining stages.
    Continue,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::FailFast
    }
}

/// Concurrency knobs shared by the store, the correction service and the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Deadlock retries after the first attempt.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Upper bound of the uniform random delay added to each backoff.
    pub retry_jitter_ms: u64,
    pub lock_timeout_ms: u64,
    /// How often a blocked lock waiter checks the wait graph for cycles.
    pub deadlock_check_interval_ms: u64,
    /// CAS attempts before a correction falls back to the pessimistic path.
    pub optimistic_attempts: u32,
    pub reevaluate_strategy: LockStrategy,
    pub execution_mode: ExecutionMode,
    pub lock_shards: usize,
    pub authorized_sources: Vec<PhilosophicalActor>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 2_000,
            retry_jitter_ms: 50,
            lock_timeout_ms: 5_000,
            deadlock_check_interval_ms: 10,
            optimistic_attempts: 3,
            reevaluate_strategy: LockStrategy::Optimistic,
            execution_mode: ExecutionMode::FailFast,
            lock_shards: 16,
            authorized_sources: vec![PhilosophicalActor::Yuno, PhilosophicalActor::Kana],
        }
    }
}

impl ConcurrencyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| BridgeError::Config(format!("parse concurrency config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.optimistic_attempts == 0 {
            return Err(BridgeError::Config(
                "optimistic_attempts must be at least 1".to_string(),
            ));
        }
        if self.lock_shards == 0 {
            return Err(BridgeError::Config("lock_shards must be at least 1".to_string()));
        }
        if self.lock_timeout_ms == 0 {
            return Err(BridgeError::Config("lock_timeout_ms must be positive".to_string()));
        }
        if self.deadlock_check_interval_ms == 0 {
            return Err(BridgeError::Config(
                "deadlock_check_interval_ms must be positive".to_string(),
            ));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(BridgeError::Config(format!(
                "retry_max_delay_ms ({}) is below retry_base_delay_ms ({})",
                self.retry_max_delay_ms, self.retry_base_delay_ms
            )));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn deadlock_check_interval(&self) -> Duration {
        Duration::from_millis(self.deadlock_check_interval_ms)
    }

    pub fn is_authorized(&self, source: PhilosophicalActor) -> bool {
        self.authorized_sources.contains(&source)
    }

    /// Set deadlock retries
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set backoff base, cap and jitter in one go
    pub fn retry_backoff(mut self, base: Duration, max: Duration, jitter: Duration) -> Self {
        self.retry_base_delay_ms = base.as_millis() as u64;
        self.retry_max_delay_ms = max.as_millis() as u64;
        self.retry_jitter_ms = jitter.as_millis() as u64;
        self
    }

    /// Set lock acquisition timeout
    pub fn lock_timeout_after(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn deadlock_check_every(mut self, interval: Duration) -> Self {
        self.deadlock_check_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    /// Set optimistic attempts before the pessimistic fallback
    pub fn optimistic_attempts(mut self, attempts: u32) -> Self {
        self.optimistic_attempts = attempts;
        self
    }

    pub fn reevaluate_strategy(mut self, strategy: LockStrategy) -> Self {
        self.reevaluate_strategy = strategy;
        self
    }

    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Set number of lock table shards
    pub fn lock_shards(mut self, shards: usize) -> Self {
        self.lock_shards = shards;
        self
    }

    pub fn authorized_sources(mut self, sources: Vec<PhilosophicalActor>) -> Self {
        self.authorized_sources = sources;
        self
    }
}
