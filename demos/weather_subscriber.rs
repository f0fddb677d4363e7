//! Collects weather reports and prints the average temperature.
//!
//! `cargo run --example weather_subscriber -- 100` samples 100 reports.

use anyhow::{Context, Result};
use courier::{Endpoint, RemoteSubscriber, TransportConfig, WeatherReport};
use futures_util::{pin_mut, StreamExt};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let samples: usize = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("sample count must be a number")?,
        None => 100,
    };

    info!("Collecting updates from weather server...");
    let subscriber = RemoteSubscriber::connect(
        &Endpoint::parse("tcp://localhost:5556")?,
        ["weather"],
        TransportConfig::default(),
    )?;

    let events = subscriber.into_stream().take(samples);
    pin_mut!(events);

    let mut total_temp: i64 = 0;
    let mut received = 0usize;
    while let Some(event) = events.next().await {
        match std::str::from_utf8(event.body()).map(str::parse::<WeatherReport>) {
            Ok(Ok(report)) => {
                total_temp += i64::from(report.temperature);
                received += 1;
            }
            _ => warn!("malformed report #{}", event.sequence()),
        }
    }

    if received > 0 {
        info!(
            "Average temperature over {received} reports was {:.1}F",
            total_temp as f64 / received as f64
        );
    }
    Ok(())
}
