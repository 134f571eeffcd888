//! SQLite-backed persistence for OS-Pulse.
//!
//! Owns the session and event tables and exposes the three store-facing
//! components: the Session Registry, the Event Ingestion Service and the
//! Event Delivery Queue. Uploaded artifacts live on disk next to the
//! database, managed by [`artifacts::ArtifactStore`].

pub mod artifacts;
pub mod db;
pub mod delivery;
pub mod ingest;
pub mod registry;

pub use artifacts::ArtifactStore;
pub use db::Database;
pub use delivery::EventDeliveryQueue;
pub use ingest::EventIngestionService;
pub use registry::SessionRegistry;

pub use pulse_core as core;
