//! Error surfaced to callers through `ConnectionState::Disconnected`

use crate::config::ConfigError;
use crate::connection::initialization::InitializationError;
use crate::connection::pairing::PairingError;
use crate::dispatch::CommandError;
use crate::transport::PeripheralId;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TagError {
    #[error("Pairing failed: {0}")]
    Pairing(#[from] PairingError),
    #[error("Initialization failed: {0}")]
    Initialization(#[from] InitializationError),
    #[error("Startup command failed: {0}")]
    StartupCommand(#[from] CommandError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Link lost: {}", .0.as_deref().unwrap_or("no reason reported"))]
    LinkLost(Option<String>),
    #[error("Connection timed out")]
    ConnectionTimeout,
    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(PeripheralId),
    #[error("Platform bridge error: {0}")]
    PlatformBridgeError(String),
    #[error("Tag connection shut down")]
    ShutDown,
}

impl TagError {
    /// Whether this error ended the connection cycle for good
    pub fn is_timeout(&self) -> bool {
        matches!(self, TagError::ConnectionTimeout)
    }
}
