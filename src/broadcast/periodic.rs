use bytes::Bytes;
use rand::Rng;
use std::{fmt, str::FromStr, sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, trace};

use super::broadcaster::Broadcaster;

/// Background task publishing a generated body on a fixed period.
pub struct PeriodicPublisher {
    topic: String,
    handle: JoinHandle<()>,
}

impl PeriodicPublisher {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn stop(&self) {
        self.handle.abort();
        debug!("stopped periodic publisher for {}", self.topic);
    }
}

impl Drop for PeriodicPublisher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn spawn_periodic<F>(
    broadcaster: Arc<Broadcaster>,
    topic: impl Into<String>,
    period: Duration,
    mut generate: F,
) -> PeriodicPublisher
where
    F: FnMut() -> Bytes + Send + 'static,
{
    let topic = topic.into();
    let task_topic = topic.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let report = broadcaster.publish(&task_topic, generate());
            trace!(
                "published {}#{} to {}/{} subscriber(s)",
                task_topic,
                report.sequence,
                report.delivered,
                report.attempted
            );
        }
    });

    PeriodicPublisher { topic, handle }
}

/// One reading of the weather feed: `"<zipcode> <temperature> <relhumidity>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeatherReport {
    pub zipcode: u32,
    pub temperature: i32,
    pub relhumidity: u32,
}

impl WeatherReport {
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            zipcode: rng.gen_range(1..100_000),
            temperature: rng.gen_range(-80..135),
            relhumidity: rng.gen_range(10..60),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl fmt::Display for WeatherReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.zipcode, self.temperature, self.relhumidity)
    }
}

impl FromStr for WeatherReport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split_whitespace();
        let mut next = |name: &str| {
            fields
                .next()
                .ok_or_else(|| format!("missing {name} in {s:?}"))
        };
        let zipcode = next("zipcode")?;
        let temperature = next("temperature")?;
        let relhumidity = next("relhumidity")?;

        Ok(Self {
            zipcode: zipcode.parse().map_err(|e| format!("bad zipcode {zipcode:?}: {e}"))?,
            temperature: temperature
                .parse()
                .map_err(|e| format!("bad temperature {temperature:?}: {e}"))?,
            relhumidity: relhumidity
                .parse()
                .map_err(|e| format!("bad relhumidity {relhumidity:?}: {e}"))?,
        })
    }
}
