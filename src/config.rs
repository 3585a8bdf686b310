use crate::error::{Error, Result};
use crate::pool::SchedulingMode;
use crate::worker::PanicStrategy;
use std::time::Duration;

const MAX_POOL_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub pool_size: Option<usize>,
    /// Start pools in parallel mode with this batch size.
    pub parallel_batch: Option<usize>,
    /// Queued tasks allowed in asynchronous mode before `submit` blocks.
    pub backlog_capacity: usize,
    pub cancel_grace: Duration,
    pub stack_size: Option<usize>,
    pub thread_name_prefix: String,
    pub panic_strategy: PanicStrategy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_size: None,
            parallel_batch: None,
            backlog_capacity: 1024,
            cancel_grace: Duration::from_secs(5),
            stack_size: Some(2 * 1024 * 1024),
            thread_name_prefix: "weft-worker".to_string(),
            panic_strategy: PanicStrategy::default(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(n) = self.pool_size {
            if n == 0 {
                return Err(Error::config("pool_size must be > 0"));
            }
            if n > MAX_POOL_SIZE {
                return Err(Error::config(format!(
                    "pool_size too large (max {})",
                    MAX_POOL_SIZE
                )));
            }
        }

        if let Some(p) = self.parallel_batch {
            if p == 0 {
                return Err(Error::config("parallel_batch must be > 0"));
            }
            if p > self.worker_count() {
                return Err(Error::config("parallel_batch cannot exceed pool_size"));
            }
        }

        if self.backlog_capacity == 0 {
            return Err(Error::config("backlog_capacity must be > 0"));
        }

        if self.cancel_grace.is_zero() {
            return Err(Error::config("cancel_grace must be > 0"));
        }

        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.pool_size
            .unwrap_or_else(|| num_cpus::get().min(MAX_POOL_SIZE))
    }

    pub fn initial_mode(&self) -> SchedulingMode {
        match self.parallel_batch {
            Some(batch) => SchedulingMode::Parallel { batch },
            None => SchedulingMode::Async,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn pool_size(mut self, n: usize) -> Self {
        self.config.pool_size = Some(n);
        self
    }

    pub fn parallel_batch(mut self, n: usize) -> Self {
        self.config.parallel_batch = Some(n);
        self
    }

    pub fn backlog_capacity(mut self, n: usize) -> Self {
        self.config.backlog_capacity = n;
        self
    }

    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.config.cancel_grace = grace;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn panic_strategy(mut self, strategy: PanicStrategy) -> Self {
        self.config.panic_strategy = strategy;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
