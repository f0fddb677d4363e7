//! Request/reply server: every "Hello" is answered with "World" after a
//! second of simulated work.
//!
//! Run with `cargo run --example hello_server`, then start `hello_client`.

use anyhow::Result;
use bytes::Bytes;
use courier::{Broker, DispatchConfig, Dispatcher, Endpoint, TransportConfig};
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = DispatchConfig::new().with_worker_pool_size(1);
    let dispatcher = Dispatcher::start(config, |request| async move {
        info!("Received request: {:?}", request.payload());
        sleep(Duration::from_secs(1)).await;
        Bytes::from_static(b"World")
    })?;

    let broker = Broker::bind(
        &Endpoint::parse("tcp://*:5555")?,
        &Endpoint::parse("tcp://127.0.0.1:0")?,
        dispatcher.pool().clone(),
        TransportConfig::default(),
    )
    .await?;

    tokio::select! {
        result = broker.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    dispatcher.shutdown().await;
    Ok(())
}
