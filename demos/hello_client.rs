//! Sends ten "Hello" requests, one after another, and prints each reply.

use anyhow::Result;
use courier::{Client, CourierConfig, Endpoint};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Connecting to hello world server...");
    let config = CourierConfig::from_env()?;
    let endpoint = Endpoint::tcp("localhost", config.frontend.port());
    let client = Client::from_config(&endpoint, &config)?;

    for request in 0..10 {
        info!("Sending request {request} ...");
        let reply = client.request("Hello").await?;
        info!("Received reply {request} [ {} ]", String::from_utf8_lossy(&reply));
    }
    Ok(())
}
