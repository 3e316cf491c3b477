//! BLE pairing state machine
//!
//! Drives a freshly connected link through service discovery, characteristic
//! discovery and notification enablement. The machine issues bridge calls as
//! it advances and reports every transition to its owner.

use crate::config::SdkConfig;
use crate::transport::ble::{BleEvent, CentralBridge, PeripheralId, TagCharacteristic, TagCharacteristics};
use crate::transport::fragmenter::MIN_MTU;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("Protocol service not found")]
    ServiceNotFound,
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),
    #[error("Enabling notifications failed: {0}")]
    NotifyEnableFailed(String),
    #[error("Bridge error: {0}")]
    Bridge(String),
}

/// A link with every protocol characteristic discovered and notifying
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedTag {
    pub peripheral: PeripheralId,
    /// Negotiated ATT MTU
    pub mtu: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingState {
    Disconnected,
    BluetoothConnected,
    ServicesDiscovered,
    AwaitingNotificationUpdates,
    TagPaired(PairedTag),
    Error(PairingError),
}

impl PairingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PairingState::TagPaired(_) | PairingState::Error(_))
    }
}

pub struct PairingStateMachine {
    bridge: Arc<dyn CentralBridge>,
    peripheral: PeripheralId,
    service: Uuid,
    characteristics: TagCharacteristics,
    default_mtu: u16,
    mtu: u16,
    awaiting_notify: HashSet<Uuid>,
    state: PairingState,
}

impl PairingStateMachine {
    pub fn new(bridge: Arc<dyn CentralBridge>, peripheral: PeripheralId, config: &SdkConfig) -> Self {
        Self {
            bridge,
            peripheral,
            service: config.service_uuid,
            characteristics: config.characteristics,
            default_mtu: config.default_mtu,
            mtu: config.default_mtu,
            awaiting_notify: HashSet::new(),
            state: PairingState::Disconnected,
        }
    }

    pub fn state(&self) -> &PairingState {
        &self.state
    }

    /// Feed one BLE callback. Returns the new state when a transition happened.
    pub fn handle(&mut self, peripheral: &PeripheralId, event: &BleEvent) -> Option<PairingState> {
        if *peripheral != self.peripheral {
            error!(
                "Pairing for {} received {} from {}",
                self.peripheral, event, peripheral
            );
            return None;
        }
        if self.state.is_terminal() {
            debug!("Pairing finished, ignoring {}", event);
            return None;
        }

        let next = match (self.state.clone(), event) {
            (PairingState::Disconnected, BleEvent::DidConnect { mtu }) => {
                self.mtu = if *mtu < MIN_MTU { self.default_mtu } else { *mtu };
                match self.bridge.discover_services(&self.peripheral) {
                    Ok(()) => PairingState::BluetoothConnected,
                    Err(e) => PairingState::Error(PairingError::Bridge(e)),
                }
            }
            (PairingState::Disconnected, BleEvent::DidFailToConnect { error }) => {
                PairingState::Error(PairingError::ConnectFailed(
                    error.clone().unwrap_or_else(|| "unknown".to_string()),
                ))
            }
            (PairingState::BluetoothConnected, BleEvent::DidDiscoverServices { services, error }) => {
                self.on_services(services, error.as_deref())
            }
            (
                PairingState::ServicesDiscovered,
                BleEvent::DidDiscoverCharacteristics {
                    service,
                    characteristics,
                    error,
                },
            ) => {
                if *service != self.service {
                    debug!("Ignoring characteristics of service {}", service);
                    return None;
                }
                self.on_characteristics(characteristics, error.as_deref())
            }
            (
                PairingState::AwaitingNotificationUpdates,
                BleEvent::DidUpdateNotificationState {
                    characteristic,
                    enabled,
                    error,
                },
            ) => self.on_notification_state(characteristic, *enabled, error.as_deref())?,
            (state, event) => {
                debug!("Pairing in {:?} ignoring {}", state, event);
                return None;
            }
        };

        debug!("Pairing {} -> {:?}", self.peripheral, next);
        self.state = next.clone();
        Some(next)
    }

    fn on_services(&mut self, services: &[Uuid], error: Option<&str>) -> PairingState {
        if let Some(error) = error {
            return PairingState::Error(PairingError::DiscoveryFailed(error.to_string()));
        }
        if !services.contains(&self.service) {
            return PairingState::Error(PairingError::ServiceNotFound);
        }
        match self.bridge.discover_characteristics(&self.peripheral, &self.service) {
            Ok(()) => PairingState::ServicesDiscovered,
            Err(e) => PairingState::Error(PairingError::Bridge(e)),
        }
    }

    fn on_characteristics(&mut self, found: &[Uuid], error: Option<&str>) -> PairingState {
        if let Some(error) = error {
            return PairingState::Error(PairingError::DiscoveryFailed(error.to_string()));
        }
        if let Some(missing) = TagCharacteristic::ALL
            .into_iter()
            .map(|role| self.characteristics.uuid(role))
            .find(|uuid| !found.contains(uuid))
        {
            return PairingState::Error(PairingError::CharacteristicNotFound(missing));
        }

        for role in TagCharacteristic::ALL.into_iter().filter(|r| r.requires_notify()) {
            let uuid = self.characteristics.uuid(role);
            if let Err(e) = self.bridge.set_notify_enabled(&self.peripheral, true, &uuid) {
                return PairingState::Error(PairingError::Bridge(e));
            }
            self.awaiting_notify.insert(uuid);
        }
        PairingState::AwaitingNotificationUpdates
    }

    fn on_notification_state(
        &mut self,
        characteristic: &Uuid,
        enabled: bool,
        error: Option<&str>,
    ) -> Option<PairingState> {
        if let Some(error) = error {
            return Some(PairingState::Error(PairingError::NotifyEnableFailed(
                error.to_string(),
            )));
        }
        if !enabled {
            return Some(PairingState::Error(PairingError::NotifyEnableFailed(format!(
                "notifications disabled on {}",
                characteristic
            ))));
        }
        if !self.awaiting_notify.remove(characteristic) {
            debug!("Unexpected notification state for {}", characteristic);
            return None;
        }
        if !self.awaiting_notify.is_empty() {
            return None;
        }
        Some(PairingState::TagPaired(PairedTag {
            peripheral: self.peripheral,
            mtu: self.mtu,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ble::{
        MockCentralBridge, COMMAND_CHAR_UUID, NOTIFY_CHAR_UUID, RESPONSE_CHAR_UUID, TAG_SERVICE_UUID,
    };

    fn peripheral() -> PeripheralId {
        PeripheralId::new(Uuid::from_u128(0xA1))
    }

    fn cooperative_bridge() -> MockCentralBridge {
        let mut bridge = MockCentralBridge::new();
        bridge.expect_discover_services().times(1).returning(|_| Ok(()));
        bridge
            .expect_discover_characteristics()
            .times(1)
            .returning(|_, _| Ok(()));
        bridge
            .expect_set_notify_enabled()
            .times(2)
            .returning(|_, _, _| Ok(()));
        bridge
    }

    fn machine(bridge: MockCentralBridge) -> PairingStateMachine {
        PairingStateMachine::new(Arc::new(bridge), peripheral(), &SdkConfig::default())
    }

    fn all_characteristics() -> BleEvent {
        BleEvent::DidDiscoverCharacteristics {
            service: TAG_SERVICE_UUID,
            characteristics: vec![COMMAND_CHAR_UUID, RESPONSE_CHAR_UUID, NOTIFY_CHAR_UUID],
            error: None,
        }
    }

    fn notify_enabled(characteristic: Uuid) -> BleEvent {
        BleEvent::DidUpdateNotificationState {
            characteristic,
            enabled: true,
            error: None,
        }
    }

    fn services(services: Vec<Uuid>) -> BleEvent {
        BleEvent::DidDiscoverServices {
            services,
            error: None,
        }
    }

    #[test]
    fn test_happy_path() {
        let mut sm = machine(cooperative_bridge());
        let id = peripheral();

        assert_eq!(
            sm.handle(&id, &BleEvent::DidConnect { mtu: 185 }),
            Some(PairingState::BluetoothConnected)
        );
        assert_eq!(
            sm.handle(&id, &services(vec![Uuid::nil(), TAG_SERVICE_UUID])),
            Some(PairingState::ServicesDiscovered)
        );
        assert_eq!(
            sm.handle(&id, &all_characteristics()),
            Some(PairingState::AwaitingNotificationUpdates)
        );
        assert_eq!(sm.handle(&id, &notify_enabled(RESPONSE_CHAR_UUID)), None);
        assert_eq!(
            sm.handle(&id, &notify_enabled(NOTIFY_CHAR_UUID)),
            Some(PairingState::TagPaired(PairedTag {
                peripheral: id,
                mtu: 185
            }))
        );
    }

    #[test]
    fn test_unreported_mtu_falls_back_to_default() {
        let mut sm = machine(cooperative_bridge());
        let id = peripheral();
        sm.handle(&id, &BleEvent::DidConnect { mtu: 0 });
        sm.handle(&id, &services(vec![TAG_SERVICE_UUID]));
        sm.handle(&id, &all_characteristics());
        sm.handle(&id, &notify_enabled(RESPONSE_CHAR_UUID));
        match sm.handle(&id, &notify_enabled(NOTIFY_CHAR_UUID)) {
            Some(PairingState::TagPaired(tag)) => assert_eq!(tag.mtu, MIN_MTU),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_missing_service() {
        let mut bridge = MockCentralBridge::new();
        bridge.expect_discover_services().returning(|_| Ok(()));
        bridge.expect_discover_characteristics().never();
        let mut sm = machine(bridge);
        let id = peripheral();

        sm.handle(&id, &BleEvent::DidConnect { mtu: 23 });
        assert_eq!(
            sm.handle(&id, &services(vec![Uuid::nil()])),
            Some(PairingState::Error(PairingError::ServiceNotFound))
        );
    }

    #[test]
    fn test_missing_characteristic() {
        let mut bridge = MockCentralBridge::new();
        bridge.expect_discover_services().returning(|_| Ok(()));
        bridge.expect_discover_characteristics().returning(|_, _| Ok(()));
        bridge.expect_set_notify_enabled().never();
        let mut sm = machine(bridge);
        let id = peripheral();

        sm.handle(&id, &BleEvent::DidConnect { mtu: 23 });
        sm.handle(&id, &services(vec![TAG_SERVICE_UUID]));
        let state = sm.handle(
            &id,
            &BleEvent::DidDiscoverCharacteristics {
                service: TAG_SERVICE_UUID,
                characteristics: vec![COMMAND_CHAR_UUID, RESPONSE_CHAR_UUID],
                error: None,
            },
        );
        assert_eq!(
            state,
            Some(PairingState::Error(PairingError::CharacteristicNotFound(
                NOTIFY_CHAR_UUID
            )))
        );
    }

    #[test]
    fn test_notify_enable_failure() {
        let mut sm = machine(cooperative_bridge());
        let id = peripheral();
        sm.handle(&id, &BleEvent::DidConnect { mtu: 23 });
        sm.handle(&id, &services(vec![TAG_SERVICE_UUID]));
        sm.handle(&id, &all_characteristics());

        let state = sm.handle(
            &id,
            &BleEvent::DidUpdateNotificationState {
                characteristic: RESPONSE_CHAR_UUID,
                enabled: false,
                error: Some("insufficient authentication".to_string()),
            },
        );
        assert!(matches!(
            state,
            Some(PairingState::Error(PairingError::NotifyEnableFailed(_)))
        ));
    }

    #[test]
    fn test_connect_failure() {
        let mut sm = machine(MockCentralBridge::new());
        let state = sm.handle(
            &peripheral(),
            &BleEvent::DidFailToConnect {
                error: Some("out of range".to_string()),
            },
        );
        assert_eq!(
            state,
            Some(PairingState::Error(PairingError::ConnectFailed(
                "out of range".to_string()
            )))
        );
    }

    #[test]
    fn test_bridge_error_is_terminal() {
        let mut bridge = MockCentralBridge::new();
        bridge
            .expect_discover_services()
            .returning(|_| Err("powered off".to_string()));
        let mut sm = machine(bridge);
        assert_eq!(
            sm.handle(&peripheral(), &BleEvent::DidConnect { mtu: 23 }),
            Some(PairingState::Error(PairingError::Bridge("powered off".to_string())))
        );
    }

    #[test]
    fn test_terminal_states_ignore_events() {
        let mut sm = machine(MockCentralBridge::new());
        let id = peripheral();
        sm.handle(&id, &BleEvent::DidFailToConnect { error: None });
        assert!(sm.state().is_terminal());

        // no bridge expectations: a second connect must not call discover_services
        assert_eq!(sm.handle(&id, &BleEvent::DidConnect { mtu: 23 }), None);
        assert!(matches!(sm.state(), PairingState::Error(_)));
    }

    #[test]
    fn test_foreign_peripheral_is_ignored() {
        let mut sm = machine(MockCentralBridge::new());
        let other = PeripheralId::new(Uuid::from_u128(0xB2));
        assert_eq!(sm.handle(&other, &BleEvent::DidConnect { mtu: 23 }), None);
        assert_eq!(sm.state(), &PairingState::Disconnected);
    }

    #[test]
    fn test_out_of_order_event_is_ignored() {
        let mut sm = machine(MockCentralBridge::new());
        assert_eq!(sm.handle(&peripheral(), &all_characteristics()), None);
        assert_eq!(sm.state(), &PairingState::Disconnected);
    }
}
