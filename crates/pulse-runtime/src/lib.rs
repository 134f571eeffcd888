//! Runtime layer for OS-Pulse.
//!
//! Drives the instrumentation engine: the Monitoring Control Relay turns
//! session commands into directives, and the Instrumentation Event Router
//! classifies each message an attached target emits and forwards a
//! normalized copy to ingestion.

pub mod bridge;
pub mod engine;
pub mod forwarder;
pub mod processes;
pub mod relay;
pub mod router;

pub use engine::{Attachment, InstrumentationEngine};
pub use forwarder::{Forwarder, Outbound};
pub use relay::MonitoringControlRelay;
pub use router::EventRouter;

pub use pulse_core as core;
pub use pulse_store as store;
