//! Tag manager: top-level entry point
//!
//! Owns the registry mapping each peripheral to its orchestrator. There is at
//! most one orchestrator per peripheral; it is created on the first
//! `connect` and lives until `remove` or until the manager is dropped.

use super::orchestrator::OrchestratorHandle;
use super::state::{ConnectionState, ConnectionStateStream};
use crate::config::{ConfigError, SdkConfig};
use crate::error::TagError;
use crate::tag::ConnectedTag;
use crate::transport::ble::{BleEvent, CentralBridge, PeripheralId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

type Registry = Arc<Mutex<HashMap<PeripheralId, OrchestratorHandle>>>;

/// Where the platform delivers BLE callbacks.
///
/// Cheap to clone; hand one to the platform's central delegate.
#[derive(Clone)]
pub struct BleEventSink {
    registry: Registry,
}

impl BleEventSink {
    /// Route one callback to the peripheral's orchestrator
    pub fn handle_event(&self, peripheral: PeripheralId, event: BleEvent) {
        let handle = self.registry.lock().get(&peripheral).cloned();
        match handle {
            Some(handle) => {
                if !handle.post(peripheral, event) {
                    warn!("Orchestrator for {} has stopped, dropping callback", peripheral);
                }
            }
            None => warn!("Dropping {} for unknown peripheral {}", event, peripheral),
        }
    }
}

pub struct TagManager {
    bridge: Arc<dyn CentralBridge>,
    config: Arc<SdkConfig>,
    registry: Registry,
}

impl TagManager {
    pub fn new(bridge: Arc<dyn CentralBridge>, config: SdkConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            bridge,
            config: Arc::new(config),
            registry: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &SdkConfig {
        &self.config
    }

    pub fn event_sink(&self) -> BleEventSink {
        BleEventSink {
            registry: self.registry.clone(),
        }
    }

    /// Connect to `peripheral`.
    ///
    /// Starts a connection cycle when the peripheral is idle; the stream then
    /// begins with `PreparingToConnect`. When a cycle is already running the
    /// stream replays the latest state first.
    pub async fn connect(&self, peripheral: PeripheralId) -> Result<ConnectionStateStream, TagError> {
        let handle = self.handle_for(peripheral);
        handle.connect().await
    }

    pub async fn disconnect(&self, tag: &ConnectedTag) -> Result<ConnectionStateStream, TagError> {
        self.disconnect_peripheral(tag.peripheral()).await
    }

    /// Disconnect and suppress reconnection until the next `connect`
    pub async fn disconnect_peripheral(
        &self,
        peripheral: PeripheralId,
    ) -> Result<ConnectionStateStream, TagError> {
        let handle = self.existing(peripheral)?;
        handle.disconnect().await
    }

    /// States of `peripheral`, starting with the latest
    pub fn observe(&self, peripheral: PeripheralId) -> Result<ConnectionStateStream, TagError> {
        Ok(self.existing(peripheral)?.observe())
    }

    pub fn state(&self, peripheral: PeripheralId) -> Option<ConnectionState> {
        self.registry.lock().get(&peripheral).map(OrchestratorHandle::latest)
    }

    /// Tear down the orchestrator: pending commands fail, the link is cancelled
    pub fn remove(&self, peripheral: PeripheralId) -> bool {
        let removed = self.registry.lock().remove(&peripheral);
        match removed {
            Some(handle) => {
                info!("Removing tag {}", peripheral);
                handle.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn connected_peripherals(&self) -> Vec<PeripheralId> {
        let mut connected: Vec<PeripheralId> = self
            .registry
            .lock()
            .iter()
            .filter(|(_, handle)| handle.latest().is_connected())
            .map(|(id, _)| *id)
            .collect();
        connected.sort();
        connected
    }

    fn handle_for(&self, peripheral: PeripheralId) -> OrchestratorHandle {
        self.registry
            .lock()
            .entry(peripheral)
            .or_insert_with(|| {
                debug!("Creating orchestrator for {}", peripheral);
                OrchestratorHandle::spawn(peripheral, self.bridge.clone(), self.config.clone())
            })
            .clone()
    }

    fn existing(&self, peripheral: PeripheralId) -> Result<OrchestratorHandle, TagError> {
        self.registry
            .lock()
            .get(&peripheral)
            .cloned()
            .ok_or(TagError::UnknownPeripheral(peripheral))
    }
}

impl Drop for TagManager {
    fn drop(&mut self) {
        for (_, handle) in self.registry.lock().drain() {
            handle.shutdown();
        }
    }
}
