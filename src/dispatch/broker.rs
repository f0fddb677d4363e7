//! Network face of a [`WorkerPool`].
//!
//! Requesters connect to the frontend and send `Request` frames; remote
//! workers connect to the backend, announce themselves with `Ready`, and
//! answer the `Request` frames they are handed with `Reply` frames.

use bytes::Bytes;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::pool::{Delivery, WorkerPool};
use crate::{
    errors::{DispatchError, TransportError},
    transport::{Connection, Endpoint, Listener, TransportConfig},
    wire::{Frame, MessageKind, Status},
    Reply, RequestId,
};

pub struct Broker {
    pool: Arc<WorkerPool>,
    frontend: Listener,
    backend: Listener,
    send_timeout: Duration,
}

impl Broker {
    pub async fn bind(
        frontend: &Endpoint,
        backend: &Endpoint,
        pool: Arc<WorkerPool>,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let send_timeout = config.send_timeout;
        let frontend = Listener::bind(frontend, config.clone()).await?;
        let backend = Listener::bind(backend, config).await?;
        Ok(Self {
            pool,
            frontend,
            backend,
            send_timeout,
        })
    }

    /// Where requesters on this host should connect.
    pub fn frontend_endpoint(&self) -> Endpoint {
        self.frontend.dial_endpoint()
    }

    /// Where workers on this host should connect.
    pub fn backend_endpoint(&self) -> Endpoint {
        self.backend.dial_endpoint()
    }

    /// Accepts requesters and workers until the task is dropped.
    pub async fn run(self) -> Result<(), TransportError> {
        info!(
            "broker routing {} -> {}",
            self.frontend.endpoint(),
            self.backend.endpoint()
        );

        loop {
            tokio::select! {
                conn = self.frontend.accept() => match conn {
                    Ok(conn) => {
                        tokio::spawn(serve_requester(self.pool.clone(), conn, self.send_timeout));
                    }
                    Err(e) => warn!("frontend accept failed: {e}"),
                },
                conn = self.backend.accept() => match conn {
                    Ok(conn) => {
                        tokio::spawn(serve_worker(self.pool.clone(), conn, self.send_timeout));
                    }
                    Err(e) => warn!("backend accept failed: {e}"),
                },
            }
        }
    }
}

fn reply_frame(delivery: Delivery) -> Frame {
    let correlation = delivery.correlation;
    match delivery.outcome {
        Ok(reply) => Frame::reply(correlation, Status::Ok, reply.into_payload()),
        Err(DispatchError::RequestTimedOut { .. }) => {
            Frame::reply(correlation, Status::TimedOut, Bytes::new())
        }
        Err(DispatchError::Cancelled(_)) => {
            Frame::reply(correlation, Status::Cancelled, Bytes::new())
        }
        Err(DispatchError::QueueFull { .. }) => {
            Frame::reply(correlation, Status::QueueFull, Bytes::new())
        }
        Err(DispatchError::UnknownRequest(_)) => {
            Frame::reply(correlation, Status::UnknownRequest, Bytes::new())
        }
        Err(other) => Frame::reply(correlation, Status::Failed, other.to_string()),
    }
}

async fn serve_requester(pool: Arc<WorkerPool>, conn: Connection, send_timeout: Duration) {
    let peer = conn.peer_addr();
    let (sender, mut receiver) = conn.split();
    let (route, mut deliveries) = mpsc::unbounded_channel::<Delivery>();
    let mut in_flight: HashMap<u64, RequestId> = HashMap::new();

    debug!("requester {peer} connected");
    loop {
        tokio::select! {
            frame = receiver.next() => {
                let Some(frame) = frame else { break };
                match frame.kind {
                    MessageKind::Request => {
                        match pool.submit_routed(frame.id, frame.payload, route.clone()) {
                            Ok(id) => {
                                in_flight.insert(frame.id, id);
                            }
                            Err(e) => {
                                debug!("rejecting request {} from {peer}: {e}", frame.id);
                                let rejection = reply_frame(Delivery {
                                    request_id: RequestId(0),
                                    correlation: frame.id,
                                    outcome: Err(e),
                                });
                                if let Err(e) = sender.send(rejection, send_timeout).await {
                                    warn!("requester {peer} unreachable: {e}");
                                    break;
                                }
                            }
                        }
                    }
                    MessageKind::Cancel => match in_flight.get(&frame.id) {
                        Some(id) => {
                            if let Err(e) = pool.cancel(*id) {
                                debug!("cancel from {peer} ignored: {e}");
                            }
                        }
                        None => debug!("cancel for unknown request {} from {peer}", frame.id),
                    },
                    other => warn!("unexpected {other:?} frame from requester {peer}"),
                }
            }
            Some(delivery) = deliveries.recv() => {
                in_flight.remove(&delivery.correlation);
                if let Err(e) = sender.send(reply_frame(delivery), send_timeout).await {
                    warn!("requester {peer} unreachable: {e}");
                    break;
                }
            }
        }
    }

    // nobody is left to read these outcomes
    for id in in_flight.into_values() {
        let _ = pool.cancel(id);
    }
    debug!("requester {peer} disconnected");
}

async fn serve_worker(pool: Arc<WorkerPool>, conn: Connection, send_timeout: Duration) {
    let peer = conn.peer_addr();
    let (sender, mut receiver) = conn.split();

    match receiver.receive(send_timeout).await {
        Ok(frame) if frame.kind == MessageKind::Ready => {}
        Ok(frame) => {
            warn!("worker {peer} sent {:?} before Ready, closing", frame.kind);
            return;
        }
        Err(e) => {
            debug!("worker {peer} never announced itself: {e}");
            return;
        }
    }

    let (worker, mut assignments) = match pool.attach() {
        Ok(attached) => attached,
        Err(e) => {
            warn!("turning away worker {peer}: {e}");
            return;
        }
    };
    info!("{worker} attached from {peer}");

    loop {
        tokio::select! {
            request = assignments.recv() => {
                let Some(request) = request else { break };
                let frame = Frame::request(request.id().0, request.into_payload());
                if let Err(e) = sender.send(frame, send_timeout).await {
                    warn!("{worker} at {peer} unreachable: {e}");
                    break;
                }
            }
            frame = receiver.next() => {
                let Some(frame) = frame else { break };
                match frame.kind {
                    MessageKind::Reply => {
                        let reply = Reply::new(RequestId(frame.id), worker, frame.payload);
                        if let Err(e) = pool.complete(reply) {
                            debug!("{worker} replied late: {e}");
                        }
                    }
                    MessageKind::Ready => {}
                    other => warn!("unexpected {other:?} frame from {worker}"),
                }
            }
        }
    }

    pool.detach(worker);
    info!("{worker} at {peer} detached");
}
