pub mod presence;
pub mod tag;
mod worker;

use std::{future::Future, pin::Pin};

pub use presence::{classify, PresenceCallback, PresenceEvent, PresencePoller, PresenceThresholds};
pub use tag::{TagCallback, TagPoller, TagRead};
pub use worker::PendingStop;

/// Future returned by poller callbacks.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
