pub mod controller;
pub mod observer;
pub mod policy;
pub mod state;

pub use controller::{StageController, StageTimings};
pub use observer::{BroadcastObserver, LogObserver, StageObserver};
pub use policy::PresencePolicy;
pub use state::{StageName, StageSnapshot};
