//! Request lifecycle and worker bookkeeping.
//!
//! All state lives behind one mutex so that the queue, the pending table and
//! the worker slots always agree. Nothing awaits while the lock is held;
//! outcomes are collected under the lock and pushed to their routes after it
//! is released.

use bytes::Bytes;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, warn};

use super::config::DispatchConfig;
use crate::{errors::DispatchError, Reply, Request, RequestId, WorkerId};

pub type Outcome = Result<Reply, DispatchError>;

/// Final word on a request, sent exactly once to the route it arrived on.
#[derive(Debug)]
pub struct Delivery {
    pub request_id: RequestId,
    pub correlation: u64,
    pub outcome: Outcome,
}

pub type ReplyRoute = mpsc::UnboundedSender<Delivery>;

/// Stream of requests assigned to one attached worker.
pub type Assignments = mpsc::UnboundedReceiver<Request>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    /// Slot with nobody behind it. Never selected for assignment.
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    pub id: WorkerId,
    pub state: WorkerState,
    pub current_request: Option<RequestId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Assigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The request was still queued and is gone.
    Removed,
    /// A worker already has it; its reply will be discarded.
    Advisory,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub submitted: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub rejected: u64,
    /// Replies to requests cancelled while assigned.
    pub discarded: u64,
    /// Replies for ids not assigned to the replying worker: late, duplicate
    /// or bogus.
    pub unmatched: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
    discarded: AtomicU64,
    unmatched: AtomicU64,
}

struct Slot {
    worker: Worker,
    assignments: Option<mpsc::UnboundedSender<Request>>,
}

struct Pending {
    request: Request,
    state: RequestState,
    // None once the requester has been told the request was cancelled
    route: Option<ReplyRoute>,
    worker: Option<WorkerId>,
    deadline: Option<Instant>,
}

struct PoolState {
    slots: Vec<Slot>,
    queue: VecDeque<RequestId>,
    pending: HashMap<RequestId, Pending>,
    cursor: usize,
    next_id: u64,
    shut_down: bool,
}

type Outbox = Vec<(ReplyRoute, Delivery)>;

impl PoolState {
    fn next_idle(&mut self) -> Option<usize> {
        let n = self.slots.len();
        for offset in 0..n {
            let idx = (self.cursor + offset) % n;
            let slot = &mut self.slots[idx];
            if slot.worker.state != WorkerState::Idle {
                continue;
            }
            if slot.assignments.as_ref().map_or(true, |tx| tx.is_closed()) {
                debug!("{} went away without detaching", slot.worker.id);
                slot.worker.state = WorkerState::Detached;
                slot.assignments = None;
                continue;
            }
            self.cursor = (idx + 1) % n;
            return Some(idx);
        }
        None
    }

    fn assign(&mut self, slot_idx: usize, id: RequestId, now: Instant, timeout: Duration) {
        let Some(pending) = self.pending.get_mut(&id) else {
            return;
        };
        let slot = &mut self.slots[slot_idx];

        pending.state = RequestState::Assigned;
        pending.worker = Some(slot.worker.id);
        pending.deadline = Some(now + timeout);
        slot.worker.state = WorkerState::Busy;
        slot.worker.current_request = Some(id);

        let delivered = slot
            .assignments
            .as_ref()
            .map(|tx| tx.send(pending.request.clone()).is_ok())
            .unwrap_or(false);
        if !delivered {
            // the worker went away without detaching; the request will time out
            warn!("{} stopped taking work, detaching", slot.worker.id);
            slot.worker.state = WorkerState::Detached;
            slot.worker.current_request = None;
            slot.assignments = None;
        }
    }

    /// Frees `worker` if it is still working on `id`, then hands it the head
    /// of the queue.
    fn release(&mut self, worker: WorkerId, id: RequestId, now: Instant, timeout: Duration) {
        let Some(slot) = self.slots.get_mut(worker.0) else {
            return;
        };
        if slot.worker.current_request != Some(id) {
            return;
        }
        slot.worker.current_request = None;
        if slot.worker.state == WorkerState::Busy {
            slot.worker.state = WorkerState::Idle;
            self.drain_into(worker.0, now, timeout);
        }
    }

    fn drain_into(&mut self, slot_idx: usize, now: Instant, timeout: Duration) {
        if self.slots[slot_idx].worker.state != WorkerState::Idle {
            return;
        }
        if let Some(next) = self.queue.pop_front() {
            self.assign(slot_idx, next, now, timeout);
        }
    }
}

/// Fixed set of worker slots fed from a bounded FIFO queue.
///
/// Every accepted request ends in exactly one [`Delivery`] on the route it
/// was submitted with: a reply, `RequestTimedOut`, `Cancelled`, or
/// `ShutDown`.
pub struct WorkerPool {
    config: DispatchConfig,
    state: Mutex<PoolState>,
    counters: Counters,
}

impl WorkerPool {
    /// Creates a pool whose slots all start out detached.
    pub fn new(config: DispatchConfig) -> Self {
        let slots = (0..config.worker_pool_size)
            .map(|idx| Slot {
                worker: Worker {
                    id: WorkerId(idx),
                    state: WorkerState::Detached,
                    current_request: None,
                },
                assignments: None,
            })
            .collect();

        Self {
            state: Mutex::new(PoolState {
                slots,
                queue: VecDeque::with_capacity(config.max_queue_depth),
                pending: HashMap::new(),
                cursor: 0,
                next_id: 1,
                shut_down: false,
            }),
            config,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(outbox: Outbox) {
        for (route, delivery) in outbox {
            let id = delivery.request_id;
            if route.send(delivery).is_err() {
                debug!("requester for {id} is gone, dropping outcome");
            }
        }
    }

    /// Accepts a request whose outcome goes to `route`.
    ///
    /// Assigns it to the next idle worker in round-robin order, or queues it.
    /// Fails synchronously with `QueueFull` when no worker is idle and the
    /// queue is at `max_queue_depth`.
    pub fn submit_routed(
        &self,
        correlation: u64,
        payload: Bytes,
        route: ReplyRoute,
    ) -> Result<RequestId, DispatchError> {
        let now = Instant::now();
        let timeout = self.config.request_timeout;
        let mut state = self.lock();

        if state.shut_down {
            return Err(DispatchError::ShutDown);
        }

        let idle = state.next_idle();
        if idle.is_none() && state.queue.len() >= self.config.max_queue_depth {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(DispatchError::QueueFull {
                depth: state.queue.len(),
                max: self.config.max_queue_depth,
            });
        }

        let id = RequestId(state.next_id);
        state.next_id += 1;
        state.pending.insert(
            id,
            Pending {
                request: Request::new(id, correlation, payload, now),
                state: RequestState::Received,
                route: Some(route),
                worker: None,
                deadline: None,
            },
        );

        match idle {
            Some(slot) => state.assign(slot, id, now, timeout),
            None => state.queue.push_back(id),
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Accepts a request and returns a handle that resolves to its outcome.
    pub fn submit(&self, payload: Bytes) -> Result<Submission, DispatchError> {
        let (route, rx) = mpsc::unbounded_channel();
        let id = self.submit_routed(0, payload, route)?;
        Ok(Submission { id, rx })
    }

    /// Records a worker's reply and releases the worker.
    ///
    /// `UnknownRequest` when the request already reached a terminal state
    /// (completed, timed out, removed) or was never assigned to this worker.
    pub fn complete(&self, reply: Reply) -> Result<(), DispatchError> {
        let now = Instant::now();
        let timeout = self.config.request_timeout;
        let id = reply.request_id();
        let mut outbox = Outbox::new();

        {
            let mut state = self.lock();
            let owned = matches!(
                state.pending.get(&id),
                Some(p) if p.state == RequestState::Assigned && p.worker == Some(reply.worker_id())
            );
            if !owned {
                drop(state);
                self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
                debug!("ignoring reply for {id} from {}: not assigned to it", reply.worker_id());
                return Err(DispatchError::UnknownRequest(id));
            }

            let Some(pending) = state.pending.remove(&id) else {
                return Err(DispatchError::UnknownRequest(id));
            };
            state.release(reply.worker_id(), id, now, timeout);

            match pending.route {
                Some(route) => {
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    outbox.push((
                        route,
                        Delivery {
                            request_id: id,
                            correlation: pending.request.correlation(),
                            outcome: Ok(reply),
                        },
                    ));
                }
                None => {
                    self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    debug!("discarding reply for cancelled request {id}");
                }
            }
        }

        Self::flush(outbox);
        Ok(())
    }

    /// Withdraws a request on behalf of its requester.
    ///
    /// A queued request is removed outright. An assigned one cannot be
    /// recalled from its worker: the requester is told `Cancelled` now and
    /// the worker's eventual reply is discarded.
    pub fn cancel(&self, id: RequestId) -> Result<CancelOutcome, DispatchError> {
        let mut outbox = Outbox::new();
        let result = {
            let mut state = self.lock();
            let Some(pending) = state.pending.get_mut(&id) else {
                return Err(DispatchError::UnknownRequest(id));
            };

            let request_state = pending.state;
            match request_state {
                RequestState::Received => {
                    let correlation = pending.request.correlation();
                    let route = pending.route.take();
                    state.pending.remove(&id);
                    state.queue.retain(|queued| *queued != id);
                    if let Some(route) = route {
                        outbox.push((route, cancelled(id, correlation)));
                    }
                    CancelOutcome::Removed
                }
                RequestState::Assigned => match pending.route.take() {
                    Some(route) => {
                        outbox.push((route, cancelled(id, pending.request.correlation())));
                        CancelOutcome::Advisory
                    }
                    None => return Err(DispatchError::UnknownRequest(id)),
                },
            }
        };

        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        debug!("cancelled {id} ({result:?})");
        Self::flush(outbox);
        Ok(result)
    }

    /// Fails every assigned request whose deadline is at or before `now`,
    /// frees its worker, and returns how many expired.
    pub fn sweep(&self, now: Instant) -> usize {
        let timeout = self.config.request_timeout;
        let mut outbox = Outbox::new();

        let expired = {
            let mut state = self.lock();
            let expired: Vec<RequestId> = state
                .pending
                .iter()
                .filter(|(_, p)| {
                    p.state == RequestState::Assigned && p.deadline.is_some_and(|d| d <= now)
                })
                .map(|(id, _)| *id)
                .collect();

            for id in &expired {
                let Some(pending) = state.pending.remove(id) else {
                    continue;
                };
                if let Some(worker) = pending.worker {
                    state.release(worker, *id, now, timeout);
                }
                if let Some(route) = pending.route {
                    outbox.push((
                        route,
                        Delivery {
                            request_id: *id,
                            correlation: pending.request.correlation(),
                            outcome: Err(DispatchError::RequestTimedOut {
                                id: *id,
                                after: timeout,
                            }),
                        },
                    ));
                }
            }
            expired.len()
        };

        if expired > 0 {
            self.counters
                .timed_out
                .fetch_add(expired as u64, Ordering::Relaxed);
            warn!("{expired} request(s) timed out after {timeout:?}");
        }
        Self::flush(outbox);
        expired
    }

    /// Claims a detached slot. The returned receiver yields the requests
    /// assigned to it; dropping it makes the slot unusable until detached.
    pub fn attach(&self) -> Result<(WorkerId, Assignments), DispatchError> {
        let now = Instant::now();
        let timeout = self.config.request_timeout;
        let mut state = self.lock();
        if state.shut_down {
            return Err(DispatchError::ShutDown);
        }

        let Some(idx) = state
            .slots
            .iter()
            .position(|slot| slot.worker.state == WorkerState::Detached)
        else {
            return Err(DispatchError::PoolExhausted(state.slots.len()));
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let slot = &mut state.slots[idx];
        slot.assignments = Some(tx);
        slot.worker.state = WorkerState::Idle;
        slot.worker.current_request = None;
        let id = slot.worker.id;

        state.drain_into(idx, now, timeout);
        debug!("{id} attached");
        Ok((id, rx))
    }

    /// Returns a slot to the detached state. Its in-flight request, if any,
    /// stays assigned and is resolved by the timeout sweep.
    pub fn detach(&self, worker: WorkerId) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(worker.0) {
            slot.worker.state = WorkerState::Detached;
            slot.worker.current_request = None;
            slot.assignments = None;
            debug!("{worker} detached");
        }
    }

    /// Stops accepting work, detaches every slot and fails whatever is still
    /// outstanding with `ShutDown`.
    pub fn shutdown(&self) {
        let mut outbox = Outbox::new();
        {
            let mut state = self.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.queue.clear();
            for slot in state.slots.iter_mut() {
                slot.worker.state = WorkerState::Detached;
                slot.worker.current_request = None;
                slot.assignments = None;
            }
            for (id, pending) in state.pending.drain() {
                if let Some(route) = pending.route {
                    outbox.push((
                        route,
                        Delivery {
                            request_id: id,
                            correlation: pending.request.correlation(),
                            outcome: Err(DispatchError::ShutDown),
                        },
                    ));
                }
            }
        }
        Self::flush(outbox);
    }

    pub fn workers(&self) -> Vec<Worker> {
        self.lock()
            .slots
            .iter()
            .map(|slot| slot.worker.clone())
            .collect()
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn request_state(&self, id: RequestId) -> Option<RequestState> {
        self.lock().pending.get(&id).map(|p| p.state)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
        }
    }
}

fn cancelled(id: RequestId, correlation: u64) -> Delivery {
    Delivery {
        request_id: id,
        correlation,
        outcome: Err(DispatchError::Cancelled(id)),
    }
}

/// Handle for a request submitted in-process.
#[derive(Debug)]
pub struct Submission {
    id: RequestId,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Submission {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Waits for the request's single outcome.
    pub async fn outcome(mut self) -> Outcome {
        match self.rx.recv().await {
            Some(delivery) => delivery.outcome,
            None => Err(DispatchError::ShutDown),
        }
    }

    /// Outcome if it has already arrived.
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        self.rx.try_recv().ok().map(|delivery| delivery.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool(workers: usize, depth: usize) -> WorkerPool {
        WorkerPool::new(
            DispatchConfig::new()
                .with_worker_pool_size(workers)
                .with_max_queue_depth(depth)
                .with_request_timeout(Duration::from_millis(200)),
        )
    }

    fn hello() -> Bytes {
        Bytes::from_static(b"Hello")
    }

    #[test]
    fn submit_assigns_idle_worker_first() {
        let pool = pool(2, 4);
        let (w0, mut a0) = pool.attach().unwrap();
        let (_w1, _a1) = pool.attach().unwrap();

        let sub = pool.submit(hello()).unwrap();
        let assigned = a0.try_recv().unwrap();
        assert_eq!(assigned.id(), sub.id());
        assert_eq!(pool.request_state(sub.id()), Some(RequestState::Assigned));

        let workers = pool.workers();
        assert_eq!(workers[w0.0].state, WorkerState::Busy);
        assert_eq!(workers[w0.0].current_request, Some(sub.id()));
        assert_eq!(pool.queue_len(), 0);
    }

    #[test]
    fn idle_workers_are_chosen_round_robin() {
        let pool = pool(3, 4);
        let mut assignments: Vec<_> = (0..3).map(|_| pool.attach().unwrap()).collect();

        let mut order = Vec::new();
        for _ in 0..3 {
            let _sub = pool.submit(hello()).unwrap();
            let (worker, request) = assignments
                .iter_mut()
                .find_map(|(worker, rx)| rx.try_recv().ok().map(|r| (*worker, r)))
                .unwrap();
            order.push(worker);
            pool.complete(Reply::new(request.id(), worker, Bytes::new()))
                .unwrap();
        }

        assert_eq!(order, vec![WorkerId(0), WorkerId(1), WorkerId(2)]);
    }

    #[test]
    fn queue_is_fifo_and_bounded() {
        let pool = pool(1, 2);
        let (worker, mut rx) = pool.attach().unwrap();

        let first = pool.submit(hello()).unwrap();
        let second = pool.submit(hello()).unwrap();
        let third = pool.submit(hello()).unwrap();
        assert_eq!(pool.queue_len(), 2);

        let err = pool.submit(hello()).unwrap_err();
        assert_eq!(err, DispatchError::QueueFull { depth: 2, max: 2 });
        assert_eq!(pool.stats().rejected, 1);

        for expected in [first.id(), second.id(), third.id()] {
            let request = rx.try_recv().unwrap();
            assert_eq!(request.id(), expected);
            pool.complete(Reply::new(request.id(), worker, Bytes::new()))
                .unwrap();
        }
        assert_eq!(pool.queue_len(), 0);
        assert_eq!(pool.workers()[0].state, WorkerState::Idle);
    }

    #[test]
    fn completing_twice_is_unknown() {
        let pool = pool(1, 1);
        let (worker, mut rx) = pool.attach().unwrap();
        let mut sub = pool.submit(hello()).unwrap();
        let request = rx.try_recv().unwrap();

        pool.complete(Reply::new(request.id(), worker, &b"World"[..]))
            .unwrap();
        let again = pool.complete(Reply::new(request.id(), worker, &b"World"[..]));
        assert_eq!(again, Err(DispatchError::UnknownRequest(request.id())));

        let outcome = sub.try_outcome().unwrap().unwrap();
        assert_eq!(outcome.payload(), &Bytes::from_static(b"World"));
        assert!(sub.try_outcome().is_none());
    }

    #[test]
    fn sweep_times_out_and_frees_the_worker() {
        let pool = pool(1, 4);
        let (worker, mut rx) = pool.attach().unwrap();
        let mut slow = pool.submit(hello()).unwrap();
        let queued = pool.submit(hello()).unwrap();
        let slow_request = rx.try_recv().unwrap();

        assert_eq!(pool.sweep(Instant::now()), 0);
        let later = Instant::now() + Duration::from_millis(250);
        assert_eq!(pool.sweep(later), 1);

        match slow.try_outcome() {
            Some(Err(DispatchError::RequestTimedOut { id, after })) => {
                assert_eq!(id, slow.id());
                assert_eq!(after, Duration::from_millis(200));
            }
            other => panic!("expected timeout, got {other:?}"),
        }

        // freed worker picked up the queued request
        let next = rx.try_recv().unwrap();
        assert_eq!(next.id(), queued.id());
        assert_eq!(pool.workers()[0].current_request, Some(queued.id()));

        // the late reply no longer matches anything
        let late = pool.complete(Reply::new(slow_request.id(), worker, Bytes::new()));
        assert_eq!(late, Err(DispatchError::UnknownRequest(slow_request.id())));
        assert_eq!(pool.stats().timed_out, 1);
        assert_eq!(pool.stats().unmatched, 1);
        assert_eq!(pool.stats().discarded, 0);
    }

    #[test]
    fn queued_requests_do_not_time_out() {
        let pool = pool(1, 4);
        let (_worker, _rx) = pool.attach().unwrap();
        let _busy = pool.submit(hello()).unwrap();
        let queued = pool.submit(hello()).unwrap();

        let later = Instant::now() + Duration::from_secs(10);
        assert_eq!(pool.sweep(later), 1);
        // the queued request was assigned at sweep time and gets a fresh deadline
        assert_eq!(pool.request_state(queued.id()), Some(RequestState::Assigned));
        assert_eq!(pool.sweep(later), 0);
    }

    #[test]
    fn cancel_removes_queued_request() {
        let pool = pool(1, 4);
        let (_worker, _rx) = pool.attach().unwrap();
        let _busy = pool.submit(hello()).unwrap();
        let mut queued = pool.submit(hello()).unwrap();

        assert_eq!(pool.cancel(queued.id()), Ok(CancelOutcome::Removed));
        assert_eq!(pool.queue_len(), 0);
        assert_eq!(
            queued.try_outcome(),
            Some(Err(DispatchError::Cancelled(queued.id())))
        );
        assert_eq!(
            pool.cancel(queued.id()),
            Err(DispatchError::UnknownRequest(queued.id()))
        );
    }

    #[test]
    fn cancel_of_assigned_request_is_advisory() {
        let pool = pool(1, 4);
        let (worker, mut rx) = pool.attach().unwrap();
        let mut sub = pool.submit(hello()).unwrap();
        let request = rx.try_recv().unwrap();

        assert_eq!(pool.cancel(sub.id()), Ok(CancelOutcome::Advisory));
        assert_eq!(sub.try_outcome(), Some(Err(DispatchError::Cancelled(sub.id()))));
        assert_eq!(pool.workers()[0].state, WorkerState::Busy);

        // worker finishes anyway: released, reply dropped, nothing else delivered
        pool.complete(Reply::new(request.id(), worker, Bytes::new()))
            .unwrap();
        assert_eq!(pool.workers()[0].state, WorkerState::Idle);
        assert!(sub.try_outcome().is_none());
        assert_eq!(pool.stats().discarded, 1);
        assert_eq!(pool.stats().unmatched, 0);
    }

    #[test]
    fn cancel_unknown_request() {
        let pool = pool(1, 1);
        assert_eq!(
            pool.cancel(RequestId(42)),
            Err(DispatchError::UnknownRequest(RequestId(42)))
        );
    }

    #[test]
    fn reply_from_another_worker_is_rejected() {
        let pool = pool(2, 1);
        let (_w0, mut rx0) = pool.attach().unwrap();
        let (w1, _rx1) = pool.attach().unwrap();
        let _sub = pool.submit(hello()).unwrap();
        let request = rx0.try_recv().unwrap();

        let result = pool.complete(Reply::new(request.id(), w1, Bytes::new()));
        assert_eq!(result, Err(DispatchError::UnknownRequest(request.id())));
        assert_eq!(pool.request_state(request.id()), Some(RequestState::Assigned));
        assert_eq!(pool.stats().unmatched, 1);
        assert_eq!(pool.stats().discarded, 0);
    }

    #[test]
    fn made_up_and_repeated_replies_are_unmatched() {
        let pool = pool(1, 1);
        let (worker, mut rx) = pool.attach().unwrap();
        let mut sub = pool.submit(hello()).unwrap();
        let request = rx.try_recv().unwrap();

        let bogus = pool.complete(Reply::new(RequestId(999), worker, Bytes::new()));
        assert_eq!(bogus, Err(DispatchError::UnknownRequest(RequestId(999))));

        pool.complete(Reply::new(request.id(), worker, Bytes::from_static(b"World")))
            .unwrap();
        assert!(matches!(sub.try_outcome(), Some(Ok(_))));
        let again = pool.complete(Reply::new(request.id(), worker, Bytes::new()));
        assert_eq!(again, Err(DispatchError::UnknownRequest(request.id())));

        let stats = pool.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.unmatched, 2);
        assert_eq!(stats.discarded, 0);
    }

    #[test]
    fn attach_is_bounded_by_pool_size() {
        let pool = pool(1, 1);
        let (worker, _rx) = pool.attach().unwrap();
        assert_eq!(pool.attach().unwrap_err(), DispatchError::PoolExhausted(1));

        pool.detach(worker);
        assert_eq!(pool.workers()[0].state, WorkerState::Detached);
        assert!(pool.attach().is_ok());
    }

    #[test]
    fn requests_wait_for_a_worker_to_attach() {
        let pool = pool(1, 4);
        let sub = pool.submit(hello()).unwrap();
        assert_eq!(pool.request_state(sub.id()), Some(RequestState::Received));

        let (_worker, mut rx) = pool.attach().unwrap();
        assert_eq!(rx.try_recv().unwrap().id(), sub.id());
    }

    #[test]
    fn dropped_assignment_channel_detaches_worker() {
        let pool = pool(2, 4);
        let (_w0, rx0) = pool.attach().unwrap();
        let (_w1, mut rx1) = pool.attach().unwrap();
        drop(rx0);

        let first = pool.submit(hello()).unwrap();
        assert_eq!(pool.workers()[0].state, WorkerState::Detached);
        assert_eq!(rx1.try_recv().unwrap().id(), first.id());
    }

    #[tokio::test]
    async fn shutdown_fails_outstanding_requests() {
        let pool = pool(1, 4);
        let (_worker, _rx) = pool.attach().unwrap();
        let busy = pool.submit(hello()).unwrap();
        let queued = pool.submit(hello()).unwrap();

        pool.shutdown();
        assert_eq!(busy.outcome().await, Err(DispatchError::ShutDown));
        assert_eq!(queued.outcome().await, Err(DispatchError::ShutDown));
        assert_eq!(pool.submit(hello()).unwrap_err(), DispatchError::ShutDown);
        assert_eq!(pool.pending_len(), 0);
    }
}
