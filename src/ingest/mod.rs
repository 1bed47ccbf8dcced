//! Everything between the broker and the sample manager: keeping a local
//! broker alive, the MQTT client, and per-message validation and routing.

pub mod broker;
pub mod client;
pub mod error;
pub mod router;

pub use broker::{BrokerProcess, BrokerSupervisor, SystemBrokerProcess};
pub use client::Ingestion;
pub use error::{IngestError, IngestResult};
pub use router::{Delivery, MessageRouter, Route};
