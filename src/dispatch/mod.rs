//! Request/reply dispatch over a fixed pool of workers.

pub mod broker;
pub mod client;
pub mod config;
pub mod pool;
pub mod remote;
pub mod sweeper;
pub mod worker;

pub use broker::Broker;
pub use client::{Client, PendingReply};
pub use config::DispatchConfig;
pub use pool::{
    Assignments, CancelOutcome, Delivery, Outcome, PoolStats, ReplyRoute, RequestState,
    Submission, Worker, WorkerPool, WorkerState,
};
pub use remote::RemoteWorker;
pub use sweeper::TimeoutSweeper;
pub use worker::{handler, typed_handler, Dispatcher, HandlerFn};
