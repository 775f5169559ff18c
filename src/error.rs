//! Error types for the handoff service.
//!
//! This module defines the errors that can occur while talking to the
//! accessory, arbitrating ownership and serving the host surface.

use thiserror::Error;

use crate::airpods::parser::ProtoError;

/// Main error type for the handoff service.
#[derive(Error, Debug)]
pub enum HandoffError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Protocol error: {0}")]
   Proto(#[from] ProtoError),

   #[error("No accessory configured")]
   NoAccessoryConfigured,

   #[error("Invalid address: {0}")]
   InvalidAddress(String),

   #[error("Device not connected")]
   DeviceNotConnected,

   #[error("Connection lost")]
   ConnectionLost,

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Controller has been shut down")]
   ControllerShutdown,
}

/// Convenience type alias for Results with `HandoffError`.
pub type Result<T> = std::result::Result<T, HandoffError>;
