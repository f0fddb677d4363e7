use bytes::Bytes;
use courier::{
    dispatch::handler, runtime, spawn_periodic, Broadcaster, Broker, CourierConfig, CourierError,
    Dispatcher, PublishServer, WeatherReport,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const WEATHER_TOPIC: &str = "weather";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("courier=info")),
        )
        .init();

    if let Err(e) = run() {
        error!("courier failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CourierError> {
    let config = CourierConfig::from_env()?;
    config.validate()?;

    let threads = runtime::server_worker_threads();
    info!("starting runtime with {threads} worker thread(s)");
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()?
        .block_on(serve(config))
}

async fn serve(config: CourierConfig) -> Result<(), CourierError> {
    let dispatcher = Dispatcher::start_with(
        config.dispatch.clone(),
        config.local_workers,
        handler(|_request| async { Bytes::from_static(b"World") }),
    )?;

    let broker = Broker::bind(
        &config.frontend,
        &config.backend,
        dispatcher.pool().clone(),
        config.transport.clone(),
    )
    .await?;

    let broadcaster = Arc::new(Broadcaster::new(config.subscriber_buffer_depth));
    let publisher = PublishServer::bind(&config.publish, broadcaster.clone(), config.transport.clone()).await?;
    let feed = spawn_periodic(broadcaster, WEATHER_TOPIC, config.publish_interval, || {
        WeatherReport::random().to_bytes()
    });

    let result = tokio::select! {
        result = broker.run() => result.map_err(CourierError::from),
        result = publisher.run() => result.map_err(CourierError::from),
        signal = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            signal.map_err(CourierError::from)
        }
    };

    feed.stop();
    let stats = dispatcher.pool().stats();
    info!(
        "served {} request(s): {} timed out, {} cancelled, {} rejected, {} unmatched replies",
        stats.completed, stats.timed_out, stats.cancelled, stats.rejected, stats.unmatched
    );
    dispatcher.shutdown().await;
    result
}
