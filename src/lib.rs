use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use tokio::time::Instant;

pub mod runtime {
    //! Helpers for configuring Tokio runtimes and reading `COURIER_*`
    //! environment overrides.
    use std::{env, thread, time::Duration};

    use crate::errors::ConfigError;

    /// Environment variable that controls the number of server worker threads.
    pub const SERVER_THREADS_ENV: &str = "COURIER_SERVER_THREADS";

    /// Returns the worker thread count derived from [`SERVER_THREADS_ENV`],
    /// falling back to the number of available CPU threads.
    pub fn server_worker_threads() -> usize {
        threads_from_env(SERVER_THREADS_ENV).unwrap_or_else(default_worker_threads)
    }

    /// Parses an environment variable as a positive worker-thread count.
    pub fn threads_from_env(key: &str) -> Option<usize> {
        let raw = env::var(key).ok()?;
        parse_positive(&raw)
    }

    /// Reads a positive integer override. Unset is `Ok(None)`, anything
    /// unparsable or zero is an error rather than a silent default.
    pub fn positive_from_env(key: &str) -> Result<Option<usize>, ConfigError> {
        match env::var(key) {
            Ok(raw) => parse_positive(&raw)
                .map(Some)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw,
                }),
            Err(_) => Ok(None),
        }
    }

    /// Reads a duration override expressed in milliseconds.
    pub fn millis_from_env(key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(positive_from_env(key)?.map(|ms| Duration::from_millis(ms as u64)))
    }

    fn default_worker_threads() -> usize {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    fn parse_positive(raw: &str) -> Option<usize> {
        let value = raw.trim().parse::<usize>().ok()?;
        (value > 0).then_some(value)
    }

}

pub mod broadcast;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod transport;
pub mod wire;

pub use broadcast::{
    spawn_periodic, Broadcaster, Event, PeriodicPublisher, PublishReport, PublishServer,
    RemoteSubscriber, SubscriberId, Subscription, WeatherReport,
};
pub use config::CourierConfig;
pub use dispatch::{
    Broker, CancelOutcome, Client, DispatchConfig, Dispatcher, PendingReply, PoolStats,
    RemoteWorker, RequestState, Submission, TimeoutSweeper, Worker, WorkerPool, WorkerState,
};
pub use errors::{
    ClientError, ConfigError, CourierError, DispatchError, TransportError, WireError,
};
pub use transport::{Connection, Endpoint, Link, Listener, TransportConfig};
pub use wire::{Frame, FrameCodec, MessageKind, Status};

/// How long a [`Client`] waits for a reply unless told otherwise.
#[cfg(not(test))]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(test)]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    id: RequestId,
    correlation: u64,
    payload: Bytes,
    received_at: Instant,
}

impl Request {
    pub fn new(id: RequestId, correlation: u64, payload: Bytes, received_at: Instant) -> Self {
        Self {
            id,
            correlation,
            payload,
            received_at,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Token chosen by the originator, echoed back with the outcome.
    pub fn correlation(&self) -> u64 {
        self.correlation
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    request_id: RequestId,
    payload: Bytes,
    worker_id: WorkerId,
}

impl Reply {
    pub fn new(request_id: RequestId, worker_id: WorkerId, payload: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            payload: payload.into(),
            worker_id,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_accessors() {
        let now = Instant::now();
        let request = Request::new(RequestId(3), 17, Bytes::from_static(b"Hello"), now);
        assert_eq!(request.id(), RequestId(3));
        assert_eq!(request.correlation(), 17);
        assert_eq!(request.payload(), &Bytes::from_static(b"Hello"));
        assert_eq!(request.received_at(), now);
    }

    #[test]
    fn reply_accessors() {
        let reply = Reply::new(RequestId(3), WorkerId(1), &b"World"[..]);
        assert_eq!(reply.request_id(), RequestId(3));
        assert_eq!(reply.worker_id(), WorkerId(1));
        assert_eq!(reply.into_payload(), Bytes::from_static(b"World"));
    }

    #[test]
    fn ids_display() {
        assert_eq!(RequestId(12).to_string(), "#12");
        assert_eq!(WorkerId(0).to_string(), "worker-0");
    }

    #[test]
    fn test_default_timeout_constant() {
        assert_eq!(DEFAULT_TIMEOUT, Duration::from_secs(2));
    }
}
