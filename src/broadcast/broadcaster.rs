use bytes::Bytes;
use dashmap::DashMap;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};

pub const DEFAULT_BUFFER_DEPTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    topic: String,
    sequence: u64,
    body: Bytes,
}

impl Event {
    pub fn new(topic: impl Into<String>, sequence: u64, body: Bytes) -> Self {
        Self {
            topic: topic.into(),
            sequence,
            body,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Position of this event in its topic, starting at 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub sequence: u64,
    /// Matching subscribers an enqueue was tried for.
    pub attempted: usize,
    pub delivered: usize,
    pub dropped: usize,
}

struct Registration {
    filters: HashSet<String>,
    tx: mpsc::Sender<Arc<Event>>,
    drops: Arc<AtomicU64>,
}

impl Registration {
    fn matches(&self, topic: &str) -> bool {
        self.filters.iter().any(|filter| topic.starts_with(filter.as_str()))
    }
}

/// Topic fan-out with one bounded buffer per subscriber.
///
/// A subscriber whose buffer is full misses the new event (drop-newest) and
/// has its drop counter bumped; nobody else is affected and `publish` never
/// waits.
pub struct Broadcaster {
    registrations: RwLock<HashMap<SubscriberId, Registration>>,
    sequences: DashMap<String, Arc<Mutex<u64>>>,
    buffer_depth: usize,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl Broadcaster {
    pub fn new(buffer_depth: usize) -> Self {
        Self {
            registrations: RwLock::new(HashMap::new()),
            sequences: DashMap::new(),
            buffer_depth: buffer_depth.max(1),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
        }
    }

    pub fn with_default_depth() -> Self {
        Self::new(DEFAULT_BUFFER_DEPTH)
    }

    pub fn buffer_depth(&self) -> usize {
        self.buffer_depth
    }

    /// Registers a subscriber. Filters are topic prefixes; `""` matches
    /// everything and an empty set matches nothing until a filter is added.
    pub fn subscribe<I, S>(&self, filters: I) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::channel(self.buffer_depth);
        let drops = Arc::new(AtomicU64::new(0));
        let registration = Registration {
            filters: filters.into_iter().map(Into::into).collect(),
            tx,
            drops: drops.clone(),
        };

        self.registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, registration);
        debug!("{id} registered");

        Subscription { id, rx, drops }
    }

    pub fn add_filter(&self, id: SubscriberId, filter: impl Into<String>) -> bool {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match registrations.get_mut(&id) {
            Some(registration) => {
                registration.filters.insert(filter.into());
                true
            }
            None => false,
        }
    }

    pub fn remove_filter(&self, id: SubscriberId, filter: &str) -> bool {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        registrations
            .get_mut(&id)
            .map(|registration| registration.filters.remove(filter))
            .unwrap_or(false)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            debug!("{id} unregistered");
        }
        removed
    }

    /// Stamps the event with the topic's next sequence number and offers it
    /// to every matching subscriber without blocking.
    pub fn publish(&self, topic: &str, body: impl Into<Bytes>) -> PublishReport {
        let sequencer = self
            .sequences
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .clone();

        // held through fan-out so that enqueue order follows sequence order
        let mut last = sequencer.lock().unwrap_or_else(PoisonError::into_inner);
        *last += 1;
        let event = Arc::new(Event::new(topic, *last, body.into()));

        let mut report = PublishReport {
            sequence: event.sequence,
            ..PublishReport::default()
        };
        let mut closed = Vec::new();
        {
            let registrations = self
                .registrations
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for (id, registration) in registrations.iter() {
                if !registration.matches(topic) {
                    continue;
                }
                report.attempted += 1;
                match registration.tx.try_send(event.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        let total = registration.drops.fetch_add(1, Ordering::Relaxed) + 1;
                        report.dropped += 1;
                        trace!("{id} is full, dropped {topic}#{} ({total} total)", event.sequence);
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        drop(last);

        if !closed.is_empty() {
            let mut registrations = self
                .registrations
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for id in closed {
                registrations.remove(&id);
                debug!("{id} went away, unregistered");
            }
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        report
    }

    /// Events dropped for `id`, whether its buffer was full or its socket
    /// stalled.
    pub fn drops(&self, id: SubscriberId) -> Option<u64> {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|registration| registration.drops.load(Ordering::Relaxed))
    }

    /// Last sequence number handed out for `topic`, 0 if never published.
    pub fn last_sequence(&self, topic: &str) -> u64 {
        self.sequences
            .get(topic)
            .map(|sequencer| {
                let last = *sequencer.lock().unwrap_or_else(PoisonError::into_inner);
                last
            })
            .unwrap_or(0)
    }

    /// Subscribers whose filters currently match `topic`.
    pub fn interested(&self, topic: &str) -> usize {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|registration| registration.matches(topic))
            .count()
    }

    pub fn subscriber_ids(&self) -> Vec<SubscriberId> {
        let mut ids: Vec<SubscriberId> = self
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    pub fn subscriber_count(&self) -> usize {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::with_default_depth()
    }
}

/// Receiving end of one registration. Dropping it unregisters the
/// subscriber on the next matching publish.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Arc<Event>>,
    drops: Arc<AtomicU64>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.rx.try_recv().ok()
    }

    pub fn dropped(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Counts an event lost after it left the buffer.
    pub(crate) fn record_drop(&self) -> u64 {
        self.drops.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn into_stream(self) -> ReceiverStream<Arc<Event>> {
        ReceiverStream::new(self.rx)
    }
}
