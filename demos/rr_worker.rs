//! Worker for a broker's backend endpoint: answers every request with
//! "World" and keeps count.
//!
//! Start `courier` first (its backend listens on tcp://*:5560), then any
//! number of these.

use anyhow::Result;
use bytes::Bytes;
use courier::{dispatch::handler, Endpoint, RemoteWorker, TransportConfig};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let total = Arc::new(AtomicU64::new(0));
    let counter = total.clone();
    let worker = RemoteWorker::connect(
        &Endpoint::parse("tcp://localhost:5560")?,
        TransportConfig::default(),
        handler(move |request| {
            let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
            info!("Received request # {n}: {:?}", request.payload());
            async { Bytes::from_static(b"World") }
        }),
    )?;

    worker.run().await?;
    Ok(())
}
