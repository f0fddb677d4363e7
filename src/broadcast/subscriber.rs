use futures_util::Stream;
use std::{collections::HashMap, time::Duration};
use tracing::{debug, trace};

use super::broadcaster::Event;
use crate::{
    errors::TransportError,
    transport::{Endpoint, Greeting, Link, TransportConfig},
    wire::{Frame, MessageKind},
};

/// Subscriber connected to a [`PublishServer`](super::PublishServer).
///
/// Filters are replayed whenever the link reconnects. Sequence numbers are
/// tracked per topic so that events lost to drops or reconnects show up in
/// [`gaps`](Self::gaps).
pub struct RemoteSubscriber {
    link: Link,
    send_timeout: Duration,
    sequences: SequenceTracker,
}

#[derive(Debug, Default)]
struct SequenceTracker {
    last_seen: HashMap<String, u64>,
    gaps: u64,
}

impl SequenceTracker {
    fn observe(&mut self, topic: &str, sequence: u64) {
        match self.last_seen.get_mut(topic) {
            Some(last) => {
                if sequence > *last + 1 {
                    let missed = sequence - *last - 1;
                    self.gaps += missed;
                    trace!("missed {missed} event(s) on {topic}");
                }
                *last = (*last).max(sequence);
            }
            None => {
                self.last_seen.insert(topic.to_string(), sequence);
            }
        }
    }
}

impl RemoteSubscriber {
    pub fn connect<I, S>(
        endpoint: &Endpoint,
        filters: I,
        config: TransportConfig,
    ) -> Result<Self, TransportError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let greeting = Greeting::new(
            filters
                .into_iter()
                .map(|filter| Frame::subscribe(filter.as_ref()))
                .collect(),
        );
        let send_timeout = config.send_timeout;
        let link = Link::connect_with_greeting(endpoint, config, greeting)?;
        Ok(Self {
            link,
            send_timeout,
            sequences: SequenceTracker::default(),
        })
    }

    pub async fn subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        self.link.greeting().push(Frame::subscribe(filter));
        self.link
            .send(Frame::subscribe(filter), self.send_timeout)
            .await
    }

    pub async fn unsubscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        self.link
            .greeting()
            .retain(|frame| !(frame.kind == MessageKind::Subscribe && frame.topic() == filter));
        self.link
            .send(Frame::unsubscribe(filter), self.send_timeout)
            .await
    }

    pub async fn wait_connected(&self, wait: Duration) -> Result<(), TransportError> {
        self.link.wait_connected(wait).await
    }

    /// Next event, or `TimeoutError` if none arrives within `wait`.
    pub async fn recv(&mut self, wait: Duration) -> Result<Event, TransportError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let frame = match self.link.receive(remaining).await {
                Err(TransportError::TimeoutError(_)) => {
                    return Err(TransportError::TimeoutError(wait))
                }
                other => other?,
            };
            if frame.kind != MessageKind::Event {
                debug!("subscriber ignoring {:?} frame", frame.kind);
                continue;
            }

            let topic = frame.topic().to_string();
            self.sequences.observe(&topic, frame.sequence);
            return Ok(Event::new(topic, frame.sequence, frame.payload));
        }
    }

    /// Endless stream of events; ends once the link gives up.
    pub fn into_stream(mut self) -> impl Stream<Item = Event> {
        async_stream::stream! {
            while let Some(frame) = self.link.next().await {
                if frame.kind != MessageKind::Event {
                    continue;
                }
                let topic = frame.topic().to_string();
                self.sequences.observe(&topic, frame.sequence);
                yield Event::new(topic, frame.sequence, frame.payload);
            }
        }
    }

    /// Events skipped between consecutive receptions on the same topic.
    pub fn gaps(&self) -> u64 {
        self.sequences.gaps
    }

    pub fn last_sequence(&self, topic: &str) -> Option<u64> {
        self.sequences.last_seen.get(topic).copied()
    }
}
