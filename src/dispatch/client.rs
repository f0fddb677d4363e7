use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, trace};

use crate::{
    config::CourierConfig,
    errors::{ClientError, TransportError},
    transport::{Endpoint, FrameSender, Link, TransportConfig},
    wire::{Frame, MessageKind, Status},
    DEFAULT_TIMEOUT,
};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Frame>>>>;

fn lock(pending: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Frame>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Requester connected to a broker frontend.
///
/// Requests are pipelined over one link and matched to replies by id.
pub struct Client {
    sender: FrameSender,
    pending: PendingMap,
    next_id: AtomicU64,
    timeout: Duration,
    send_timeout: Duration,
    reader: JoinHandle<()>,
}

impl Client {
    /// Returns immediately; requests sent before the broker is reachable
    /// wait in the outbound buffer.
    pub fn connect(endpoint: &Endpoint, config: TransportConfig) -> Result<Self, TransportError> {
        let send_timeout = config.send_timeout;
        let (sender, mut receiver) = Link::connect(endpoint, config)?.split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let table = pending.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = receiver.next().await {
                if frame.kind != MessageKind::Reply {
                    debug!("ignoring {:?} frame on client link", frame.kind);
                    continue;
                }
                match lock(&table).remove(&frame.id) {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => trace!("reply for abandoned request {}", frame.id),
                }
            }
            // wake every waiter with ConnectionClosed
            lock(&table).clear();
        });

        Ok(Self {
            sender,
            pending,
            next_id: AtomicU64::new(1),
            timeout: DEFAULT_TIMEOUT,
            send_timeout,
            reader,
        })
    }

    /// Connects with the shared transport settings and `client_timeout`.
    pub fn from_config(endpoint: &Endpoint, config: &CourierConfig) -> Result<Self, TransportError> {
        Ok(Self::connect(endpoint, config.transport.clone())?.with_timeout(config.client_timeout))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends a request without waiting for its reply.
    pub async fn send_request(&self, payload: impl Into<Bytes>) -> Result<PendingReply, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        if let Err(e) = self
            .sender
            .send(Frame::request(id, payload), self.send_timeout)
            .await
        {
            lock(&self.pending).remove(&id);
            return Err(e.into());
        }

        Ok(PendingReply {
            id,
            rx,
            pending: self.pending.clone(),
        })
    }

    pub async fn request(&self, payload: impl Into<Bytes>) -> Result<Bytes, ClientError> {
        self.send_request(payload).await?.wait(self.timeout).await
    }

    pub async fn request_typed<Req, Resp>(&self, request: &Req) -> Result<Resp, ClientError>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let payload = bincode::serialize(request)?;
        let reply = self.request(payload).await?;
        Ok(bincode::deserialize(&reply)?)
    }

    /// Asks the broker to withdraw request `id`. The request's own waiter
    /// then resolves to `Cancelled`, unless the reply won the race.
    pub async fn cancel(&self, id: u64) -> Result<(), ClientError> {
        self.sender
            .send(Frame::cancel(id), self.send_timeout)
            .await?;
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// A request that has been sent and awaits its reply.
pub struct PendingReply {
    id: u64,
    rx: oneshot::Receiver<Frame>,
    pending: PendingMap,
}

impl PendingReply {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn wait(self, wait: Duration) -> Result<Bytes, ClientError> {
        let id = self.id;
        match tokio::time::timeout(wait, self.rx).await {
            Ok(Ok(frame)) => frame_outcome(frame),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed.into()),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(TransportError::TimeoutError(wait).into())
            }
        }
    }
}

fn frame_outcome(frame: Frame) -> Result<Bytes, ClientError> {
    let id = frame.id;
    match frame.status {
        Status::Ok => Ok(frame.payload),
        Status::TimedOut => Err(ClientError::RequestTimedOut(id)),
        Status::QueueFull => Err(ClientError::QueueFull(id)),
        Status::Cancelled => Err(ClientError::Cancelled(id)),
        Status::UnknownRequest | Status::Failed => Err(ClientError::Rejected {
            id,
            reason: String::from_utf8_lossy(&frame.payload).into_owned(),
        }),
    }
}
