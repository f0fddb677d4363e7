use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::trace;

use super::pool::WorkerPool;

/// Background loop that expires overdue requests.
pub struct TimeoutSweeper {
    pool: Arc<WorkerPool>,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl TimeoutSweeper {
    pub fn new(pool: Arc<WorkerPool>, interval: Duration) -> Self {
        Self {
            pool,
            interval,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn start(&self) {
        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            self.sweep_once();
            sleep(self.interval).await;
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn sweep_once(&self) -> usize {
        let expired = self.pool.sweep(Instant::now());
        trace!("sweep expired {expired} request(s)");
        expired
    }
}
