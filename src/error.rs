//! Error types for the `podlink` crate.
//!
//! One crate-level enum covers transport, lifecycle and configuration
//! faults; the codec modules define their own error enums which nest into
//! it via `#[from]`.

use thiserror::Error;

use crate::{aap::AapError, proximity::ProximityError};

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum PodLinkError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Invalid device address: {0}")]
   InvalidAddress(String),

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Connection lost")]
   ConnectionLost,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Short write: {wrote}/{expected} bytes")]
   ShortWrite { expected: usize, wrote: usize },

   #[error("Session is closed")]
   SessionClosed,

   #[error("Session is not active")]
   SessionNotActive,

   #[error("No active AAP session")]
   NoAapSession,

   #[error("Coordinator has been shut down")]
   CoordinatorShutdown,

   #[error("Proximity codec error: {0}")]
   Proximity(#[from] ProximityError),

   #[error("AAP codec error: {0}")]
   Aap(#[from] AapError),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with `PodLinkError`.
pub type Result<T> = std::result::Result<T, PodLinkError>;
