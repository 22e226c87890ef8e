//! NATS integration: task consumption and result storage.

mod results;
mod subscriber;

pub use results::{ResultStore, StatusSink};
pub use subscriber::NatsSubscriber;
