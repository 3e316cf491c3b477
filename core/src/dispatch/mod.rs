//! Command/notification dispatcher
//!
//! Owned by the orchestrator of one link. Commands are correlated with
//! their responses by request id and notifications are fanned out to every
//! matching subscription. Everything is resolved with
//! [`CommandError::Disconnected`] when the link is torn down.

pub mod commands;
pub mod notifications;

pub use commands::{CommandDispatcher, Responder};
pub use notifications::{NotificationHub, NotificationSender};

use crate::protocol::{Notification, NotificationKind, Request, Status};
use crate::transport::ble::{BleEvent, CentralBridge, PeripheralId, TagCharacteristics};
use crate::transport::fragmenter::FragmentError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Command timed out")]
    Timeout,
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Tag returned status {0}")]
    Status(Status),
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Tag disconnected")]
    Disconnected,
}

/// Item delivered to a notification subscription
pub type NotificationItem = Result<Notification, CommandError>;

/// Command and notification plumbing for one live link
pub struct Dispatcher {
    characteristics: TagCharacteristics,
    commands: CommandDispatcher,
    notifications: NotificationHub,
}

impl Dispatcher {
    pub fn new(
        bridge: Arc<dyn CentralBridge>,
        peripheral: PeripheralId,
        characteristics: TagCharacteristics,
        mtu: u16,
        buffer_limit: usize,
    ) -> Result<Self, FragmentError> {
        Ok(Self {
            characteristics,
            commands: CommandDispatcher::new(bridge, peripheral, characteristics, mtu)?,
            notifications: NotificationHub::new(mtu, buffer_limit)?,
        })
    }

    /// Route a BLE callback to the command or notification side
    pub fn handle_event(&mut self, event: &BleEvent, now: Instant) {
        match event {
            BleEvent::DidUpdateValue {
                characteristic,
                value,
                error,
            } => {
                if let Some(error) = error {
                    tracing::warn!("Read error on {}: {}", characteristic, error);
                } else if *characteristic == self.characteristics.response {
                    self.commands.handle_response_fragment(value);
                } else if *characteristic == self.characteristics.notify {
                    self.notifications.handle_fragment(value);
                } else {
                    debug!("Value on unknown characteristic {}", characteristic);
                }
            }
            BleEvent::DidWriteValue {
                characteristic,
                error,
            } if *characteristic == self.characteristics.command => {
                self.commands.handle_write_result(error.as_deref(), now);
            }
            other => debug!("Dispatcher ignoring {}", other),
        }
    }

    /// Notification fragment received while the handshake is still running
    pub fn handle_notification_fragment(&mut self, value: &[u8]) {
        self.notifications.handle_fragment(value);
    }

    pub fn enqueue(
        &mut self,
        request: Request,
        retries: u32,
        timeout: Duration,
        responder: Responder,
        now: Instant,
    ) {
        self.commands.enqueue(request, retries, timeout, responder, now);
    }

    pub fn subscribe(&mut self, kind: Option<NotificationKind>, sender: NotificationSender) {
        self.notifications.subscribe(kind, sender);
    }

    pub fn subscriptions_ready(&mut self) {
        self.notifications.subscriptions_ready();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.commands.next_deadline()
    }

    pub fn poll_timeouts(&mut self, now: Instant) {
        self.commands.poll_timeouts(now);
    }

    pub fn pending_commands(&self) -> usize {
        self.commands.pending_count()
    }

    /// Resolve everything outstanding with `Disconnected`
    pub fn shutdown(&mut self) {
        self.commands.shutdown();
        self.notifications.shutdown();
    }
}
