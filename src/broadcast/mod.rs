//! Topic publish/subscribe with per-subscriber bounded buffers.

pub mod broadcaster;
pub mod periodic;
pub mod server;
pub mod subscriber;

pub use broadcaster::{Broadcaster, Event, PublishReport, SubscriberId, Subscription};
pub use periodic::{spawn_periodic, PeriodicPublisher, WeatherReport};
pub use server::PublishServer;
pub use subscriber::RemoteSubscriber;
