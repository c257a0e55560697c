//! Error types for the hub service.
//!
//! This module defines all error types that can occur during the operation
//! of the service, including Bluetooth, D-Bus, I/O, and protocol errors.

use bluer::Address;
use thiserror::Error;

/// Main error type for the hub service.
#[derive(Error, Debug)]
pub enum HubError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Device scan failed: {0}")]
   Scan(#[source] Box<HubError>),

   #[error("Hub {0} not found")]
   DeviceNotFound(Address),

   #[error("Connecting to hub failed: {0}")]
   Connect(#[source] Box<HubError>),

   #[error("Not connected to a hub")]
   NotConnected,

   #[error("Already connected to a hub")]
   AlreadyConnected,

   #[error("A script is already running")]
   ScriptInProgress,

   #[error("Script run failed: {0}")]
   Run(#[source] Box<HubError>),

   #[error("Program too large: {size} bytes (hub limit is {max})")]
   ProgramTooLarge { size: usize, max: usize },

   #[error("Pybricks GATT service not found on device")]
   ServiceNotFound,

   #[error("Invalid packet: {0}")]
   InvalidPacket(String),

   #[error("Connection lost")]
   ConnectionLost,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `HubError`.
pub type Result<T> = std::result::Result<T, HubError>;
