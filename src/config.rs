use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    dispatch::DispatchConfig,
    errors::{ConfigError, CourierError},
    runtime::{millis_from_env, positive_from_env},
    transport::{Endpoint, TransportConfig},
    DEFAULT_TIMEOUT,
};

pub const WORKER_POOL_SIZE_ENV: &str = "COURIER_WORKER_POOL_SIZE";
pub const LOCAL_WORKERS_ENV: &str = "COURIER_LOCAL_WORKERS";
pub const REQUEST_TIMEOUT_ENV: &str = "COURIER_REQUEST_TIMEOUT_MS";
pub const MAX_QUEUE_DEPTH_ENV: &str = "COURIER_MAX_QUEUE_DEPTH";
pub const SWEEP_INTERVAL_ENV: &str = "COURIER_SWEEP_INTERVAL_MS";
pub const SUBSCRIBER_BUFFER_DEPTH_ENV: &str = "COURIER_SUBSCRIBER_BUFFER_DEPTH";
pub const PUBLISH_INTERVAL_ENV: &str = "COURIER_PUBLISH_INTERVAL_MS";
pub const CLIENT_TIMEOUT_ENV: &str = "COURIER_CLIENT_TIMEOUT_MS";
pub const FRONTEND_ENV: &str = "COURIER_FRONTEND";
pub const BACKEND_ENV: &str = "COURIER_BACKEND";
pub const PUBLISH_ENV: &str = "COURIER_PUBLISH";

/// Settings for a whole courier process: broker, publisher, and the
/// transport they share.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierConfig {
    pub dispatch: DispatchConfig,

    /// Pool slots served in-process; the remainder wait for remote workers.
    pub local_workers: usize,

    pub subscriber_buffer_depth: usize,

    pub publish_interval: Duration,

    pub client_timeout: Duration,

    pub frontend: Endpoint,

    pub backend: Endpoint,

    pub publish: Endpoint,

    pub transport: TransportConfig,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            local_workers: 2,
            subscriber_buffer_depth: 128,
            publish_interval: Duration::from_millis(100),
            client_timeout: DEFAULT_TIMEOUT,
            frontend: Endpoint::tcp("*", 5555),
            backend: Endpoint::tcp("*", 5560),
            publish: Endpoint::tcp("*", 5556),
            transport: TransportConfig::default(),
        }
    }
}

impl CourierConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_local_workers(mut self, workers: usize) -> Self {
        self.local_workers = workers;
        self
    }

    pub fn with_subscriber_buffer_depth(mut self, depth: usize) -> Self {
        self.subscriber_buffer_depth = depth;
        self
    }

    pub fn with_publish_interval(mut self, interval: Duration) -> Self {
        self.publish_interval = interval;
        self
    }

    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    pub fn with_frontend(mut self, endpoint: Endpoint) -> Self {
        self.frontend = endpoint;
        self
    }

    pub fn with_backend(mut self, endpoint: Endpoint) -> Self {
        self.backend = endpoint;
        self
    }

    pub fn with_publish(mut self, endpoint: Endpoint) -> Self {
        self.publish = endpoint;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Defaults overlaid with whatever `COURIER_*` variables are set.
    pub fn from_env() -> Result<Self, CourierError> {
        Self::default().apply_env()
    }

    pub fn apply_env(mut self) -> Result<Self, CourierError> {
        if let Some(size) = positive_from_env(WORKER_POOL_SIZE_ENV)? {
            self.dispatch.worker_pool_size = size;
        }
        if let Some(depth) = positive_from_env(MAX_QUEUE_DEPTH_ENV)? {
            self.dispatch.max_queue_depth = depth;
        }
        if let Some(timeout) = millis_from_env(REQUEST_TIMEOUT_ENV)? {
            self.dispatch.request_timeout = timeout;
        }
        if let Some(interval) = millis_from_env(SWEEP_INTERVAL_ENV)? {
            self.dispatch.sweep_interval = interval;
        }
        // zero local workers is a valid setup, so this one is read by hand
        if let Ok(raw) = std::env::var(LOCAL_WORKERS_ENV) {
            self.local_workers = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: LOCAL_WORKERS_ENV.to_string(),
                value: raw.clone(),
            })?;
        }
        if let Some(depth) = positive_from_env(SUBSCRIBER_BUFFER_DEPTH_ENV)? {
            self.subscriber_buffer_depth = depth;
        }
        if let Some(interval) = millis_from_env(PUBLISH_INTERVAL_ENV)? {
            self.publish_interval = interval;
        }
        if let Some(timeout) = millis_from_env(CLIENT_TIMEOUT_ENV)? {
            self.client_timeout = timeout;
        }
        for (key, slot) in [
            (FRONTEND_ENV, &mut self.frontend),
            (BACKEND_ENV, &mut self.backend),
            (PUBLISH_ENV, &mut self.publish),
        ] {
            if let Ok(raw) = std::env::var(key) {
                *slot = Endpoint::parse(&raw)?;
            }
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dispatch.validate()?;
        if self.local_workers > self.dispatch.worker_pool_size {
            return Err(ConfigError::InvalidValue {
                key: "local_workers".to_string(),
                value: self.local_workers.to_string(),
            });
        }
        if self.subscriber_buffer_depth == 0 {
            return Err(ConfigError::NotPositive("subscriber_buffer_depth"));
        }
        if self.publish_interval.is_zero() {
            return Err(ConfigError::NotPositive("publish_interval"));
        }
        if self.client_timeout.is_zero() {
            return Err(ConfigError::NotPositive("client_timeout"));
        }
        Ok(())
    }
}
