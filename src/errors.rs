use std::time::Duration;
use thiserror::Error;

use crate::RequestId;

// Socket-level failures, surfaced to whoever called send/receive/bind/connect.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Address already in use: {0}")]
    AddressInUse(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out after {0:?}")]
    TimeoutError(Duration),

    #[error("Malformed frame: {0}")]
    Wire(#[from] WireError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("Frame too short: {0} bytes")]
    Truncated(usize),

    #[error("Unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("Unknown status code: {0}")]
    UnknownStatus(u8),

    #[error("Topic length {topic_len} exceeds frame body of {body_len} bytes")]
    TopicOverflow { topic_len: usize, body_len: usize },

    #[error("Topic of {0} bytes does not fit the header")]
    TopicTooLong(usize),

    #[error("Topic is not valid UTF-8")]
    InvalidTopic,

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLong { len: usize, max: usize },
}

// Request lifecycle errors. QueueFull is synchronous; RequestTimedOut and
// Cancelled reach the requester in place of a reply.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Request queue is full ({depth}/{max})")]
    QueueFull { depth: usize, max: usize },

    #[error("Unknown request: {0}")]
    UnknownRequest(RequestId),

    #[error("Request {id} timed out after {after:?}")]
    RequestTimedOut { id: RequestId, after: Duration },

    #[error("Request {0} was cancelled")]
    Cancelled(RequestId),

    #[error("All {0} worker slots are attached")]
    PoolExhausted(usize),

    #[error("Dispatcher is shut down")]
    ShutDown,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Request {0} timed out on the dispatcher")]
    RequestTimedOut(u64),

    #[error("Dispatcher queue full, request {0} rejected")]
    QueueFull(u64),

    #[error("Request {0} was cancelled")]
    Cancelled(u64),

    #[error("Request {id} rejected: {reason}")]
    Rejected { id: u64, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be a positive integer")]
    NotPositive(&'static str),

    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Error)]
pub enum CourierError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formats() {
        let err = DispatchError::QueueFull { depth: 3, max: 3 };
        assert_eq!(err.to_string(), "Request queue is full (3/3)");

        let err = DispatchError::UnknownRequest(RequestId(9));
        assert_eq!(err.to_string(), "Unknown request: #9");

        let err = ClientError::RequestTimedOut(4);
        assert_eq!(err.to_string(), "Request 4 timed out on the dispatcher");

        let err = TransportError::from(WireError::FrameTooLong { len: 40, max: 32 });
        assert_eq!(
            err.to_string(),
            "Malformed frame: Frame of 40 bytes exceeds the 32 byte limit"
        );
    }
}
