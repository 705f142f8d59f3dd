//! Execution engine configuration.

/// Configuration for pipeline execution.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Maximum node executions running concurrently within one pipeline.
    ///
    /// Higher values increase throughput at the cost of memory; set to 1
    /// for sequential execution when debugging.
    pub max_concurrent_nodes: usize,
    /// Overall deadline for one pipeline execution, in milliseconds.
    pub deadline_ms: u64,
    /// Upper bound on the total number of shards a request may fan out
    /// into across nested demultiplexers.
    pub max_total_shards: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: 16,
            deadline_ms: 30_000,
            max_total_shards: 10_000,
        }
    }
}

impl ExecutionConfig {
    /// Create configuration from environment variables.
    ///
    /// Reads `DAGSERVE_MAX_CONCURRENT_NODES`, `DAGSERVE_DEADLINE_MS` and
    /// `DAGSERVE_MAX_TOTAL_SHARDS`, falling back to the defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_nodes: env_usize("DAGSERVE_MAX_CONCURRENT_NODES")
                .unwrap_or(defaults.max_concurrent_nodes)
                .max(1),
            deadline_ms: env_u64("DAGSERVE_DEADLINE_MS").unwrap_or(defaults.deadline_ms),
            max_total_shards: env_u64("DAGSERVE_MAX_TOTAL_SHARDS")
                .unwrap_or(defaults.max_total_shards),
        }
    }

    /// Set the concurrent node limit.
    #[must_use]
    pub fn with_max_concurrent_nodes(mut self, max: usize) -> Self {
        self.max_concurrent_nodes = max.max(1);
        self
    }

    /// Set the execution deadline.
    #[must_use]
    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = deadline_ms;
        self
    }

    /// Set the total shard bound.
    #[must_use]
    pub fn with_max_total_shards(mut self, max: u64) -> Self {
        self.max_total_shards = max;
        self
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}
