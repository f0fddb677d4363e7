use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use super::broadcaster::{Broadcaster, Subscription};
use crate::{
    errors::TransportError,
    transport::{Connection, Endpoint, Listener, TransportConfig},
    wire::{Frame, MessageKind},
};

/// Serves a [`Broadcaster`] on a publish endpoint.
///
/// Every connection gets its own registration; a forwarder drains that
/// registration's bounded buffer into the socket, so a peer that reads
/// slowly only ever loses its own events.
pub struct PublishServer {
    broadcaster: Arc<Broadcaster>,
    listener: Listener,
    send_timeout: Duration,
}

impl PublishServer {
    pub async fn bind(
        endpoint: &Endpoint,
        broadcaster: Arc<Broadcaster>,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let send_timeout = config.send_timeout;
        let listener = Listener::bind(endpoint, config).await?;
        Ok(Self {
            broadcaster,
            listener,
            send_timeout,
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        self.listener.dial_endpoint()
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub async fn run(self) -> Result<(), TransportError> {
        info!("publishing on {}", self.listener.endpoint());
        loop {
            match self.listener.accept().await {
                Ok(conn) => {
                    let subscription = self.broadcaster.subscribe(Vec::<String>::new());
                    tokio::spawn(forward(
                        self.broadcaster.clone(),
                        subscription,
                        conn,
                        self.send_timeout,
                    ));
                }
                Err(e) => warn!("publish accept failed: {e}"),
            }
        }
    }
}

async fn forward(
    broadcaster: Arc<Broadcaster>,
    mut subscription: Subscription,
    conn: Connection,
    send_timeout: Duration,
) {
    let peer = conn.peer_addr();
    let id = subscription.id();
    let (sender, mut receiver) = conn.split();
    debug!("{id} connected from {peer}");

    loop {
        tokio::select! {
            frame = receiver.next() => {
                let Some(frame) = frame else { break };
                match frame.kind {
                    MessageKind::Subscribe => {
                        debug!("{id} subscribes to {:?}", frame.topic());
                        broadcaster.add_filter(id, frame.topic());
                    }
                    MessageKind::Unsubscribe => {
                        broadcaster.remove_filter(id, frame.topic());
                    }
                    other => warn!("unexpected {other:?} frame from subscriber {peer}"),
                }
            }
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let frame = Frame::event(event.topic(), event.sequence(), event.body().clone());
                match sender.send(frame, send_timeout).await {
                    Ok(()) => {}
                    Err(TransportError::TimeoutError(_)) => {
                        let total = subscription.record_drop();
                        debug!(
                            "{id} socket stalled, dropped {}#{} ({total} total)",
                            event.topic(),
                            event.sequence()
                        );
                    }
                    Err(TransportError::Wire(e)) => {
                        subscription.record_drop();
                        warn!("{id} cannot carry {}#{}: {e}", event.topic(), event.sequence());
                    }
                    Err(e) => {
                        debug!("{id} gone: {e}");
                        break;
                    }
                }
            }
        }
    }

    broadcaster.unsubscribe(id);
    debug!("{id} from {peer} disconnected");
}
