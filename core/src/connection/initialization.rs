//! Protocol initialization state machine
//!
//! Runs the hello/begin handshake on a paired link. Handshake steps are never
//! retried in place; a failure is terminal and the orchestrator decides
//! whether to restart the whole connection.

use super::pairing::PairedTag;
use crate::config::SdkConfig;
use crate::protocol::handshake::{
    begin_request, hello_request, negotiate_protocol, BEGIN_REQUEST_ID, HELLO_REQUEST_ID,
};
use crate::protocol::{
    decode_payload, decode_response, encode_request, BeginRequest, BeginResponse, HelloResponse,
    ProtocolError, Request, Response, Status,
};
use crate::tag::TagMetadata;
use crate::transport::ble::{BleEvent, CentralBridge, TagCharacteristics, WriteType};
use crate::transport::fragmenter::{FragmentError, Fragmenter};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InitializationError {
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Read failed: {0}")]
    ReadFailed(String),
    #[error("Bridge error: {0}")]
    Bridge(String),
    #[error("Unexpected response id {0}")]
    UnexpectedResponse(u32),
    #[error("Handshake rejected with status {0}")]
    Status(Status),
    #[error("Malformed handshake response: {0}")]
    MalformedResponse(String),
    #[error("No common protocol version (ours {ours_min}..={ours_max}, tag {tag_min}..={tag_max})")]
    UnsupportedProtocol {
        ours_min: u32,
        ours_max: u32,
        tag_min: u32,
        tag_max: u32,
    },
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Fragment error: {0}")]
    Fragment(#[from] FragmentError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitializationState {
    Paired,
    HelloSent,
    HelloAcked(HelloResponse),
    BeginSent,
    BeginAcked(BeginResponse),
    CreatingTagInstance,
    TagInitialized(TagMetadata),
    Error(InitializationError),
}

impl InitializationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InitializationState::TagInitialized(_) | InitializationState::Error(_)
        )
    }
}

pub struct InitializationStateMachine {
    bridge: Arc<dyn CentralBridge>,
    paired: PairedTag,
    characteristics: TagCharacteristics,
    protocol_range: (u32, u32),
    notification_queue_depth: u32,
    fragmenter: Fragmenter,
    hello: Option<HelloResponse>,
    protocol: u32,
    /// Acknowledged writes whose `DidWriteValue` has not arrived yet
    unacknowledged_writes: usize,
    state: InitializationState,
}

impl InitializationStateMachine {
    pub fn new(
        bridge: Arc<dyn CentralBridge>,
        paired: PairedTag,
        config: &SdkConfig,
    ) -> Result<Self, InitializationError> {
        let fragmenter = Fragmenter::new(paired.mtu)?;
        Ok(Self {
            bridge,
            paired,
            characteristics: config.characteristics,
            protocol_range: (config.protocol_min, config.protocol_max),
            notification_queue_depth: config.notification_queue_depth,
            fragmenter,
            hello: None,
            protocol: 0,
            unacknowledged_writes: 0,
            state: InitializationState::Paired,
        })
    }

    pub fn state(&self) -> &InitializationState {
        &self.state
    }

    /// Handshake writes still waiting for their acknowledgement.
    ///
    /// A response can overtake the ack of its own request, so acks may still
    /// be in flight once the handshake has finished.
    pub fn unacknowledged_writes(&self) -> usize {
        self.unacknowledged_writes
    }

    /// Send the hello request
    pub fn start(&mut self) -> Vec<InitializationState> {
        if self.state != InitializationState::Paired {
            return Vec::new();
        }
        let mut transitions = Vec::new();
        match self.write_request(&hello_request()) {
            Ok(()) => self.advance(InitializationState::HelloSent, &mut transitions),
            Err(e) => self.advance(InitializationState::Error(e), &mut transitions),
        }
        transitions
    }

    /// Feed one BLE callback, returning every transition it caused in order
    pub fn handle(&mut self, event: &BleEvent) -> Vec<InitializationState> {
        let mut transitions = Vec::new();
        if self.state.is_terminal() {
            debug!("Initialization finished, ignoring {}", event);
            return transitions;
        }

        match event {
            BleEvent::DidWriteValue {
                characteristic,
                error,
            } if *characteristic == self.characteristics.command => {
                self.unacknowledged_writes = self.unacknowledged_writes.saturating_sub(1);
                if let Some(error) = error {
                    self.advance(
                        InitializationState::Error(InitializationError::WriteFailed(error.clone())),
                        &mut transitions,
                    );
                }
            }
            BleEvent::DidUpdateValue {
                characteristic,
                value,
                error,
            } if *characteristic == self.characteristics.response => {
                if let Some(error) = error {
                    self.advance(
                        InitializationState::Error(InitializationError::ReadFailed(error.clone())),
                        &mut transitions,
                    );
                } else if let Some(packet) = self.fragmenter.add_fragment(value) {
                    self.on_packet(&packet, &mut transitions);
                }
            }
            _ => debug!("Initialization ignoring {}", event),
        }
        transitions
    }

    fn on_packet(&mut self, packet: &[u8], transitions: &mut Vec<InitializationState>) {
        let result = decode_response(packet)
            .map_err(|e| InitializationError::MalformedResponse(e.to_string()))
            .and_then(|response| match self.state {
                InitializationState::HelloSent => self.on_hello(&response, transitions),
                InitializationState::BeginSent => self.on_begin(&response, transitions),
                _ => Err(InitializationError::UnexpectedResponse(response.id)),
            });
        if let Err(e) = result {
            warn!("Handshake with {} failed: {}", self.paired.peripheral, e);
            self.advance(InitializationState::Error(e), transitions);
        }
    }

    fn on_hello(
        &mut self,
        response: &Response,
        transitions: &mut Vec<InitializationState>,
    ) -> Result<(), InitializationError> {
        let hello: HelloResponse = Self::check_response(response, HELLO_REQUEST_ID)?;
        let protocol = negotiate_protocol(self.protocol_range, (hello.protocol_min, hello.protocol_max))
            .ok_or(InitializationError::UnsupportedProtocol {
                ours_min: self.protocol_range.0,
                ours_max: self.protocol_range.1,
                tag_min: hello.protocol_min,
                tag_max: hello.protocol_max,
            })?;
        debug!(
            "Tag {} firmware {} speaks protocol {}..={}, using {}",
            hello.name, hello.firmware_version, hello.protocol_min, hello.protocol_max, protocol
        );
        self.protocol = protocol;
        self.hello = Some(hello.clone());
        self.advance(InitializationState::HelloAcked(hello), transitions);

        let begin = begin_request(&BeginRequest {
            protocol,
            notification_queue_depth: self.notification_queue_depth,
        })?;
        self.write_request(&begin)?;
        self.advance(InitializationState::BeginSent, transitions);
        Ok(())
    }

    fn on_begin(
        &mut self,
        response: &Response,
        transitions: &mut Vec<InitializationState>,
    ) -> Result<(), InitializationError> {
        let begin: BeginResponse = Self::check_response(response, BEGIN_REQUEST_ID)?;
        self.advance(InitializationState::BeginAcked(begin), transitions);
        self.advance(InitializationState::CreatingTagInstance, transitions);

        let hello = self
            .hello
            .clone()
            .ok_or(InitializationError::UnexpectedResponse(response.id))?;
        let metadata = TagMetadata {
            peripheral: self.paired.peripheral,
            name: hello.name,
            vendor_id: hello.vendor_id,
            product_id: hello.product_id,
            firmware_version: hello.firmware_version,
            protocol: self.protocol,
            notification_queue_depth: begin.notification_queue_depth,
            mtu: self.paired.mtu,
        };
        self.advance(InitializationState::TagInitialized(metadata), transitions);
        Ok(())
    }

    fn check_response<T: serde::de::DeserializeOwned>(
        response: &Response,
        expected_id: u32,
    ) -> Result<T, InitializationError> {
        if response.id != expected_id {
            return Err(InitializationError::UnexpectedResponse(response.id));
        }
        if !response.status.is_ok() {
            return Err(InitializationError::Status(response.status));
        }
        decode_payload(&response.payload)
            .map_err(|e| InitializationError::MalformedResponse(e.to_string()))
    }

    fn write_request(&mut self, request: &Request) -> Result<(), InitializationError> {
        let packet = encode_request(request)?;
        for fragment in self.fragmenter.fragments(&packet)? {
            self.bridge
                .write_value(
                    &self.paired.peripheral,
                    &fragment,
                    &self.characteristics.command,
                    WriteType::WithResponse,
                )
                .map_err(InitializationError::Bridge)?;
            self.unacknowledged_writes += 1;
        }
        Ok(())
    }

    fn advance(&mut self, next: InitializationState, transitions: &mut Vec<InitializationState>) {
        debug!("Initialization {} -> {:?}", self.paired.peripheral, next);
        self.state = next.clone();
        transitions.push(next);
    }
}
