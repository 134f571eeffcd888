//! Core types for OS-Pulse.
//!
//! Data model, event taxonomy and decoding, the error enum, settings,
//! timestamp handling and operator rendering helpers shared by the store,
//! the runtime and the server binary.

pub mod error;
pub mod events;
pub mod formatting;
pub mod models;
pub mod settings;
pub mod time_utils;

pub use error::{ErrorClass, PulseError, Result};
