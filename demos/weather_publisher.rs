//! Weather feed on tcp://*:5556: random "<zipcode> <temperature>
//! <relhumidity>" readings on the `weather` topic.

use anyhow::Result;
use courier::{spawn_periodic, Broadcaster, Endpoint, PublishServer, TransportConfig, WeatherReport};
use std::{sync::Arc, time::Duration};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let broadcaster = Arc::new(Broadcaster::with_default_depth());
    let server = PublishServer::bind(
        &Endpoint::parse("tcp://*:5556")?,
        broadcaster.clone(),
        TransportConfig::default(),
    )
    .await?;

    let feed = spawn_periodic(broadcaster.clone(), "weather", Duration::from_millis(1), || {
        WeatherReport::random().to_bytes()
    });

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {}
    }
    feed.stop();
    info!("published {} reports", broadcaster.published());
    Ok(())
}
