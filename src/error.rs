//! Error types for every layer of the ingestion pipeline.
//!
//! | Type | Raised by | Policy |
//! |---|---|---|
//! | [`DecodeError`] | [`crate::parse`] | logged by the router; the packet is dropped |
//! | [`TransportError`] | [`crate::transport`] | surfaced to the session, which keeps its prior state |
//! | [`SessionError`] | [`crate::session`] | logged and reported as [`crate::types::SessionEvent::Rejected`] |
//! | [`ConfigError`] | [`crate::config`] | returned to the binary at startup |
//! | [`ExportError`] | [`crate::export`] | returned when the exporter starts or finishes |

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::parse::PacketLayout;

/// A notification that does not match the layout expected for its characteristic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed {layout} packet: expected {expected} bytes, got {actual}")]
    MalformedPacket {
        layout: PacketLayout,
        expected: usize,
        actual: usize,
    },

    #[error("malformed combined packet: slot {slot} carries unknown channel tag {tag}")]
    UnknownChannelTag { slot: usize, tag: u8 },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no Bluetooth adapter found")]
    NoAdapter,

    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("{operation} timed out after {secs} s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("not connected")]
    NotConnected,

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    /// `stop_notify` on a subscription or connection that is already gone.
    /// The desired end state is reached, so callers treat this as success.
    #[error("notifications on {0} already stopped")]
    AlreadyUnsubscribed(Uuid),

    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    /// Unknown command name, bad payload, or a command that is not valid in
    /// the current state.
    #[error("invalid command {command}: {reason}")]
    InvalidCommand { command: String, reason: String },

    /// The requested session cannot start, e.g. no channel is enabled.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl SessionError {
    pub(crate) fn invalid(command: impl Into<String>, reason: impl Into<String>) -> Self {
        SessionError::InvalidCommand {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config value {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("export I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write record: {0}")]
    Csv(#[from] csv::Error),

    #[error("export writer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
