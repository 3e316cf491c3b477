//! SDK configuration
//!
//! Timeouts, retry policy, GATT layout and handshake parameters. Every knob
//! has a default matching the production tag firmware.

use crate::protocol::Request;
use crate::transport::ble::{TagCharacteristics, TAG_SERVICE_UUID};
use crate::transport::fragmenter::MIN_MTU;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Configuration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid MTU: {0}")]
    InvalidMtu(u16),
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(&'static str),
    #[error("Invalid protocol range {0}..={1}")]
    InvalidProtocolRange(u32, u32),
    #[error("Invalid capacity: {0}")]
    InvalidCapacity(&'static str),
    #[error("Characteristic UUIDs must be distinct")]
    DuplicateCharacteristic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    /// Protocol service UUID
    pub service_uuid: Uuid,
    /// Command/response/notify characteristic UUIDs
    pub characteristics: TagCharacteristics,
    /// MTU assumed when the platform reports none (default 23)
    pub default_mtu: u16,
    /// Time allowed from PreparingToConnect to Connected (default 60s)
    pub connection_timeout_secs: u64,
    /// Per-attempt command response timeout (default 8000ms)
    pub command_timeout_ms: u64,
    /// Resends after the first attempt (default 2)
    pub command_retries: u32,
    /// Base reconnect delay, doubled per failed attempt (default 1000ms)
    pub reconnect_interval_ms: u64,
    /// Reconnect delay cap (default 30000ms)
    pub max_reconnect_interval_ms: u64,
    /// Lowest protocol version the SDK speaks
    pub protocol_min: u32,
    /// Highest protocol version the SDK speaks
    pub protocol_max: u32,
    /// Notification queue depth requested in the begin request
    pub notification_queue_depth: u32,
    /// Notifications held before `subscriptions_ready` (default 64)
    pub notification_buffer_limit: usize,
    /// Connection state broadcast capacity per observer (default 64)
    pub state_channel_capacity: usize,
    /// Requests sent while configuring, before the tag is reported connected
    pub startup_commands: Vec<Request>,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            service_uuid: TAG_SERVICE_UUID,
            characteristics: TagCharacteristics::default(),
            default_mtu: MIN_MTU,
            connection_timeout_secs: 60,
            command_timeout_ms: 8000,
            command_retries: 2,
            reconnect_interval_ms: 1000,
            max_reconnect_interval_ms: 30_000,
            protocol_min: 2,
            protocol_max: 2,
            notification_queue_depth: 14,
            notification_buffer_limit: 64,
            state_channel_capacity: 64,
            startup_commands: Vec::new(),
        }
    }
}

impl SdkConfig {
    /// Set the connection timeout in seconds
    pub fn with_connection_timeout(mut self, secs: u64) -> Self {
        self.connection_timeout_secs = secs;
        self
    }

    /// Set the default command timeout and retry count
    pub fn with_command_policy(mut self, timeout_ms: u64, retries: u32) -> Self {
        self.command_timeout_ms = timeout_ms;
        self.command_retries = retries;
        self
    }

    /// Set the reconnect backoff bounds
    pub fn with_reconnect_interval(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.reconnect_interval_ms = base_ms;
        self.max_reconnect_interval_ms = max_ms;
        self
    }

    /// Set the supported protocol range
    pub fn with_protocol_range(mut self, min: u32, max: u32) -> Self {
        self.protocol_min = min;
        self.protocol_max = max;
        self
    }

    /// Add a request issued while configuring
    pub fn with_startup_command(mut self, request: Request) -> Self {
        self.startup_commands.push(request);
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Delay before reconnect attempt number `attempt` (0-based)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let backoff_ms = self
            .reconnect_interval_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(16)));
        Duration::from_millis(backoff_ms.min(self.max_reconnect_interval_ms))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_mtu < MIN_MTU {
            return Err(ConfigError::InvalidMtu(self.default_mtu));
        }
        if self.connection_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("connection_timeout_secs"));
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("command_timeout_ms"));
        }
        if self.max_reconnect_interval_ms < self.reconnect_interval_ms {
            return Err(ConfigError::InvalidTimeout("max_reconnect_interval_ms"));
        }
        if self.protocol_min > self.protocol_max {
            return Err(ConfigError::InvalidProtocolRange(
                self.protocol_min,
                self.protocol_max,
            ));
        }
        if self.notification_buffer_limit == 0 {
            return Err(ConfigError::InvalidCapacity("notification_buffer_limit"));
        }
        if self.state_channel_capacity == 0 {
            return Err(ConfigError::InvalidCapacity("state_channel_capacity"));
        }
        let chars = &self.characteristics;
        if chars.command == chars.response
            || chars.command == chars.notify
            || chars.response == chars.notify
        {
            return Err(ConfigError::DuplicateCharacteristic);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Domain;

    #[test]
    fn test_default_config_is_valid() {
        let config = SdkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection_timeout(), Duration::from_secs(60));
        assert_eq!(config.command_retries, 2);
    }

    #[test]
    fn test_builder() {
        let config = SdkConfig::default()
            .with_connection_timeout(5)
            .with_command_policy(250, 4)
            .with_startup_command(Request::new(Domain::Base, 9, vec![]));

        assert_eq!(config.connection_timeout_secs, 5);
        assert_eq!(config.command_timeout(), Duration::from_millis(250));
        assert_eq!(config.command_retries, 4);
        assert_eq!(config.startup_commands.len(), 1);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert_eq!(
            SdkConfig { default_mtu: 20, ..Default::default() }.validate(),
            Err(ConfigError::InvalidMtu(20))
        );
        assert!(SdkConfig::default().with_connection_timeout(0).validate().is_err());
        assert!(SdkConfig::default().with_protocol_range(3, 2).validate().is_err());

        let mut config = SdkConfig::default();
        config.characteristics.notify = config.characteristics.response;
        assert_eq!(config.validate(), Err(ConfigError::DuplicateCharacteristic));
    }

    #[test]
    fn test_reconnect_backoff_is_capped() {
        let config = SdkConfig::default().with_reconnect_interval(1000, 30_000);
        assert_eq!(config.reconnect_delay(0), Duration::from_millis(1000));
        assert_eq!(config.reconnect_delay(2), Duration::from_millis(4000));
        assert_eq!(config.reconnect_delay(10), Duration::from_millis(30_000));
    }

    #[test]
    fn test_json_roundtrip_with_missing_fields() {
        let config: SdkConfig =
            serde_json::from_str(r#"{ "command_retries": 5 }"#).expect("partial config");
        assert_eq!(config.command_retries, 5);
        assert_eq!(config.connection_timeout_secs, 60);
    }
}
