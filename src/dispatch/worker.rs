use bytes::Bytes;
use std::{future::Future, pin::Pin, sync::Arc};
use tokio::{task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};

use super::{
    config::DispatchConfig,
    pool::{Assignments, Submission, WorkerPool},
    sweeper::TimeoutSweeper,
};
use crate::{
    errors::{ConfigError, CourierError, DispatchError},
    Reply, Request, WorkerId,
};

/// Request handler run by local and remote workers.
pub type HandlerFn = Arc<dyn Fn(Request) -> Pin<Box<dyn Future<Output = Bytes> + Send>> + Send + Sync>;

pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Bytes> + Send + 'static,
{
    Arc::new(move |request: Request| Box::pin(f(request)) as Pin<Box<dyn Future<Output = Bytes> + Send>>)
}

/// Handler over bincode-encoded payloads. A payload that does not decode as
/// `Req` gets an empty reply.
pub fn typed_handler<Req, Resp, F, Fut>(f: F) -> HandlerFn
where
    Req: serde::de::DeserializeOwned + Send + 'static,
    Resp: serde::Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Resp> + Send + 'static,
{
    let f = Arc::new(f);
    handler(move |request: Request| {
        let f = f.clone();
        async move {
            let id = request.id();
            let req: Req = match bincode::deserialize(request.payload()) {
                Ok(req) => req,
                Err(e) => {
                    warn!("failed to decode payload of {id}: {e}");
                    return Bytes::new();
                }
            };
            match bincode::serialize(&f(req).await) {
                Ok(bytes) => Bytes::from(bytes),
                Err(e) => {
                    warn!("failed to encode reply for {id}: {e}");
                    Bytes::new()
                }
            }
        }
    })
}

async fn run_local_worker(
    pool: Arc<WorkerPool>,
    id: WorkerId,
    mut assignments: Assignments,
    handler: HandlerFn,
) {
    let limit = pool.config().request_timeout;
    while let Some(request) = assignments.recv().await {
        let request_id = request.id();
        // past the deadline the sweeper has already failed the request
        let payload = match timeout(limit, handler(request)).await {
            Ok(payload) => payload,
            Err(_) => {
                debug!("{id} abandoned {request_id} after {limit:?}");
                continue;
            }
        };
        if let Err(e) = pool.complete(Reply::new(request_id, id, payload)) {
            debug!("{id} finished {request_id} too late: {e}");
        }
    }
    debug!("{id} stopped");
}

/// A [`WorkerPool`] with its timeout sweeper running and, optionally,
/// in-process workers attached to some of its slots.
///
/// Must be created inside a Tokio runtime.
pub struct Dispatcher {
    pool: Arc<WorkerPool>,
    sweeper: Arc<TimeoutSweeper>,
    tasks: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Pool with every slot left free for remote workers.
    pub fn new(config: DispatchConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let pool = Arc::new(WorkerPool::new(config));
        let sweeper = Arc::new(TimeoutSweeper::new(
            pool.clone(),
            pool.config().sweep_interval,
        ));

        let background = sweeper.clone();
        let sweep_task = tokio::spawn(async move { background.start().await });

        Ok(Self {
            pool,
            sweeper,
            tasks: vec![sweep_task],
        })
    }

    /// Pool with every slot served by `handler`.
    pub fn start<F, Fut>(config: DispatchConfig, handler_fn: F) -> Result<Self, CourierError>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Bytes> + Send + 'static,
    {
        let workers = config.worker_pool_size;
        Self::start_with(config, workers, handler(handler_fn))
    }

    /// Pool with `local` slots served by `handler`; the rest stay free for
    /// remote workers.
    pub fn start_with(
        config: DispatchConfig,
        local: usize,
        handler: HandlerFn,
    ) -> Result<Self, CourierError> {
        let mut dispatcher = Self::new(config)?;
        for _ in 0..local {
            dispatcher.spawn_worker(handler.clone())?;
        }
        info!(
            "dispatcher started with {local} local worker(s), {} slot(s)",
            dispatcher.pool.config().worker_pool_size
        );
        Ok(dispatcher)
    }

    /// Attaches one more in-process worker.
    pub fn spawn_worker(&mut self, handler: HandlerFn) -> Result<WorkerId, DispatchError> {
        let (id, assignments) = self.pool.attach()?;
        let pool = self.pool.clone();
        self.tasks
            .push(tokio::spawn(run_local_worker(pool, id, assignments, handler)));
        Ok(id)
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn submit(&self, payload: impl Into<Bytes>) -> Result<Submission, DispatchError> {
        self.pool.submit(payload.into())
    }

    /// Fails outstanding requests with `ShutDown` and stops every task.
    pub async fn shutdown(mut self) {
        self.sweeper.stop();
        self.pool.shutdown();
        for task in std::mem::take(&mut self.tasks) {
            task.abort();
            let _ = task.await;
        }
        info!("dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.sweeper.stop();
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    fn world() -> Bytes {
        Bytes::from_static(b"World")
    }

    #[tokio::test]
    async fn test_local_workers_reply() {
        let dispatcher = Dispatcher::start(DispatchConfig::default(), |_req| async { world() })
            .unwrap();

        let reply = dispatcher.submit("Hello").unwrap().outcome().await.unwrap();
        assert_eq!(reply.payload(), &world());
        assert_eq!(dispatcher.pool().stats().completed, 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_two_workers_drain_five_jobs_in_three_rounds() {
        let config = DispatchConfig::new().with_worker_pool_size(2);
        let dispatcher = Dispatcher::start(config, |req| async move {
            sleep(Duration::from_millis(100)).await;
            req.into_payload()
        })
        .unwrap();

        let started = Instant::now();
        let submissions: Vec<_> = (0..5)
            .map(|i| dispatcher.submit(format!("job-{i}")).unwrap())
            .collect();
        assert_eq!(dispatcher.pool().queue_len(), 3);

        for (i, submission) in submissions.into_iter().enumerate() {
            let reply = submission.outcome().await.unwrap();
            assert_eq!(reply.payload(), &Bytes::from(format!("job-{i}")));
        }

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(290), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "{elapsed:?}");
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_worker_times_out_and_is_reused() {
        let config = DispatchConfig::new()
            .with_worker_pool_size(1)
            .with_request_timeout(Duration::from_millis(200));
        let dispatcher = Dispatcher::start(config, |req| async move {
            if req.payload().as_ref() == b"slow" {
                sleep(Duration::from_secs(1)).await;
            }
            world()
        })
        .unwrap();

        let started = Instant::now();
        let slow = dispatcher.submit("slow").unwrap();
        let id = slow.id();
        match slow.outcome().await {
            Err(DispatchError::RequestTimedOut { id: timed_out, .. }) => assert_eq!(timed_out, id),
            other => panic!("expected timeout, got {other:?}"),
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");

        // the worker gave up on the slow job and takes new work
        sleep(Duration::from_millis(50)).await;
        let reply = dispatcher.submit("fast").unwrap().outcome().await.unwrap();
        assert_eq!(reply.payload(), &world());
        assert!(started.elapsed() < Duration::from_millis(700));
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_slots_stay_free() {
        let config = DispatchConfig::new().with_worker_pool_size(3);
        let dispatcher = Dispatcher::start_with(config, 1, handler(|_req| async { world() })).unwrap();
        let free = dispatcher
            .pool()
            .workers()
            .iter()
            .filter(|w| w.state == crate::dispatch::WorkerState::Detached)
            .count();
        assert_eq!(free, 2);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_typed_handler_round_trip() {
        let dispatcher = Dispatcher::start_with(
            DispatchConfig::default(),
            1,
            typed_handler(|n: u32| async move { n * 2 }),
        )
        .unwrap();

        let payload = bincode::serialize(&21u32).unwrap();
        let reply = dispatcher.submit(payload).unwrap().outcome().await.unwrap();
        let doubled: u32 = bincode::deserialize(reply.payload()).unwrap();
        assert_eq!(doubled, 42);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let result = Dispatcher::new(DispatchConfig::new().with_worker_pool_size(0));
        assert!(matches!(result, Err(ConfigError::NotPositive("worker_pool_size"))));
    }
}
