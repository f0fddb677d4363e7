use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub worker_pool_size: usize,
    pub request_timeout: Duration,
    pub max_queue_depth: usize,
    pub sweep_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            request_timeout: Duration::from_secs(5),
            max_queue_depth: 64,
            sweep_interval: Duration::from_millis(25),
        }
    }
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_pool_size == 0 {
            return Err(ConfigError::NotPositive("worker_pool_size"));
        }
        if self.max_queue_depth == 0 {
            return Err(ConfigError::NotPositive("max_queue_depth"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::NotPositive("request_timeout"));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::NotPositive("sweep_interval"));
        }
        Ok(())
    }
}
