//! Platform boundary for BLE central operations
//!
//! The SDK never talks to a Bluetooth stack directly. The host application
//! implements [`CentralBridge`] over CoreBluetooth, Android BLE or a desktop
//! stack, and reports every asynchronous callback back as a [`BleEvent`].
//! Bridge calls only *issue* an operation; the outcome always arrives later
//! as an event.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Platform identifier of a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralId(Uuid);

impl PeripheralId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for PeripheralId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// GATT write mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteType {
    /// Acknowledged write, reported through [`BleEvent::DidWriteValue`]
    WithResponse,
    /// Unacknowledged write, no completion event
    WithoutResponse,
}

/// Operations the SDK issues against the platform Bluetooth stack.
///
/// Every method returns immediately. An `Err` means the platform refused to
/// even issue the operation.
#[cfg_attr(test, mockall::automock)]
pub trait CentralBridge: Send + Sync {
    fn connect(&self, peripheral: &PeripheralId) -> Result<(), String>;
    fn cancel_connection(&self, peripheral: &PeripheralId) -> Result<(), String>;
    fn discover_services(&self, peripheral: &PeripheralId) -> Result<(), String>;
    fn discover_characteristics(&self, peripheral: &PeripheralId, service: &Uuid) -> Result<(), String>;
    fn write_value(
        &self,
        peripheral: &PeripheralId,
        data: &[u8],
        characteristic: &Uuid,
        write_type: WriteType,
    ) -> Result<(), String>;
    fn set_notify_enabled(
        &self,
        peripheral: &PeripheralId,
        enabled: bool,
        characteristic: &Uuid,
    ) -> Result<(), String>;
}

/// Callbacks from the platform Bluetooth stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BleEvent {
    /// Physical link established with the negotiated ATT MTU
    DidConnect { mtu: u16 },
    DidFailToConnect { error: Option<String> },
    DidDisconnect { error: Option<String> },
    DidDiscoverServices {
        services: Vec<Uuid>,
        error: Option<String>,
    },
    DidDiscoverCharacteristics {
        service: Uuid,
        characteristics: Vec<Uuid>,
        error: Option<String>,
    },
    /// A notification or read result on `characteristic`
    DidUpdateValue {
        characteristic: Uuid,
        value: Vec<u8>,
        error: Option<String>,
    },
    DidWriteValue {
        characteristic: Uuid,
        error: Option<String>,
    },
    DidUpdateNotificationState {
        characteristic: Uuid,
        enabled: bool,
        error: Option<String>,
    },
}

impl fmt::Display for BleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BleEvent::DidConnect { mtu } => write!(f, "DidConnect {{ mtu: {} }}", mtu),
            BleEvent::DidFailToConnect { error } => write!(f, "DidFailToConnect {{ error: {:?} }}", error),
            BleEvent::DidDisconnect { error } => write!(f, "DidDisconnect {{ error: {:?} }}", error),
            BleEvent::DidDiscoverServices { services, error } => write!(
                f,
                "DidDiscoverServices {{ count: {}, error: {:?} }}",
                services.len(),
                error
            ),
            BleEvent::DidDiscoverCharacteristics {
                service,
                characteristics,
                error,
            } => write!(
                f,
                "DidDiscoverCharacteristics {{ service: {}, count: {}, error: {:?} }}",
                service,
                characteristics.len(),
                error
            ),
            BleEvent::DidUpdateValue {
                characteristic,
                value,
                error,
            } => write!(
                f,
                "DidUpdateValue {{ characteristic: {}, len: {}, error: {:?} }}",
                characteristic,
                value.len(),
                error
            ),
            BleEvent::DidWriteValue {
                characteristic,
                error,
            } => write!(
                f,
                "DidWriteValue {{ characteristic: {}, error: {:?} }}",
                characteristic, error
            ),
            BleEvent::DidUpdateNotificationState {
                characteristic,
                enabled,
                error,
            } => write!(
                f,
                "DidUpdateNotificationState {{ characteristic: {}, enabled: {}, error: {:?} }}",
                characteristic, enabled, error
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peripheral_id_display() {
        let uuid = Uuid::parse_str("0f1e2d3c-4b5a-6978-8796-a5b4c3d2e1f0").expect("uuid");
        let id = PeripheralId::from(uuid);
        assert_eq!(id.to_string(), "0f1e2d3c-4b5a-6978-8796-a5b4c3d2e1f0");
        assert_eq!(id.uuid(), uuid);
    }

    #[test]
    fn test_event_display_hides_payload() {
        let event = BleEvent::DidUpdateValue {
            characteristic: Uuid::nil(),
            value: vec![1, 2, 3],
            error: None,
        };
        assert!(event.to_string().contains("len: 3"));
    }
}
