use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, info};

use super::worker::HandlerFn;
use crate::{
    errors::TransportError,
    transport::{Endpoint, Greeting, Link, TransportConfig},
    wire::{Frame, MessageKind, Status},
    Request, RequestId,
};

/// Worker process attached to a broker backend.
///
/// Announces itself with `Ready` on every (re)connect and serves one
/// request at a time.
pub struct RemoteWorker {
    link: Link,
    handler: HandlerFn,
    served: Arc<AtomicU64>,
    send_timeout: Duration,
}

impl RemoteWorker {
    pub fn connect(
        endpoint: &Endpoint,
        config: TransportConfig,
        handler: HandlerFn,
    ) -> Result<Self, TransportError> {
        let send_timeout = config.send_timeout;
        let link = Link::connect_with_greeting(endpoint, config, Greeting::new(vec![Frame::ready()]))?;
        Ok(Self {
            link,
            handler,
            served: Arc::new(AtomicU64::new(0)),
            send_timeout,
        })
    }

    /// Requests answered so far.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Shared handle on the served count, readable after `run` consumes the worker.
    pub fn served_counter(&self) -> Arc<AtomicU64> {
        self.served.clone()
    }

    /// Serves until the link gives up, which is reported as `ConnectionClosed`.
    pub async fn run(mut self) -> Result<(), TransportError> {
        info!("worker serving {}", self.link.endpoint());

        while let Some(frame) = self.link.next().await {
            if frame.kind != MessageKind::Request {
                debug!("worker ignoring {:?} frame", frame.kind);
                continue;
            }

            let id = frame.id;
            let request = Request::new(RequestId(id), id, frame.payload, Instant::now());
            let payload = (self.handler)(request).await;
            let total = self.served.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("served {total} request(s)");

            self.link
                .send(Frame::reply(id, Status::Ok, payload), self.send_timeout)
                .await?;
        }

        Err(TransportError::ConnectionClosed)
    }
}
