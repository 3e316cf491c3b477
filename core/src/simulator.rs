//! In-process simulated tag
//!
//! `SimulatedTag` implements [`CentralBridge`] by emulating the tag firmware:
//! it answers discovery, reassembles written requests, runs the hello/begin
//! handshake and hands other requests to a pluggable command handler. Every
//! outcome is posted back through the attached [`BleEventSink`] from inside
//! the bridge call, the way a real platform delegate would.

use crate::connection::BleEventSink;
use crate::protocol::handshake::{BEGIN_OPCODE, HELLO_OPCODE};
use crate::protocol::{
    decode_payload, decode_request, encode_notification, encode_payload, encode_response,
    BeginRequest, BeginResponse, Domain, FirmwareVersion, HelloResponse, Notification, Request,
    Response, Status,
};
use crate::transport::ble::{
    BleEvent, CentralBridge, PeripheralId, TagCharacteristics, WriteType, TAG_SERVICE_UUID,
};
use crate::transport::fragmenter::Fragmenter;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Answers a non-handshake request; `None` sends no response
pub type CommandHandler = Arc<dyn Fn(&Request) -> Option<Response> + Send + Sync>;

struct Behavior {
    mtu: u16,
    services: Vec<Uuid>,
    characteristics: Vec<Uuid>,
    connect_error: Option<String>,
    notify_error: Option<String>,
    write_error: Option<String>,
    failing_writes: usize,
    /// Writes left until the one that fails
    fail_at: Option<usize>,
    deferred_acks: bool,
    hello: Option<HelloResponse>,
    begin_status: Status,
    handler: CommandHandler,
}

#[derive(Default)]
struct Link {
    connected: bool,
    reassembly: Option<Fragmenter>,
    connects: usize,
    cancels: usize,
    requests: Vec<Request>,
}

pub struct SimulatedTag {
    peripheral: PeripheralId,
    layout: TagCharacteristics,
    sink: Mutex<Option<BleEventSink>>,
    behavior: Mutex<Behavior>,
    link: Mutex<Link>,
}

impl SimulatedTag {
    pub fn new(peripheral: PeripheralId) -> Self {
        let layout = TagCharacteristics::default();
        Self {
            peripheral,
            layout,
            sink: Mutex::new(None),
            behavior: Mutex::new(Behavior {
                mtu: 185,
                services: vec![TAG_SERVICE_UUID],
                characteristics: vec![layout.command, layout.response, layout.notify],
                connect_error: None,
                notify_error: None,
                write_error: None,
                failing_writes: 0,
                fail_at: None,
                deferred_acks: false,
                hello: Some(Self::default_hello()),
                begin_status: Status::Ok,
                handler: Arc::new(|request| Some(Response::ok(request.id, Vec::new()))),
            }),
            link: Mutex::new(Link::default()),
        }
    }

    pub fn default_hello() -> HelloResponse {
        HelloResponse {
            protocol_min: 2,
            protocol_max: 2,
            vendor_id: 0x0042,
            product_id: 0x0101,
            firmware_version: FirmwareVersion {
                major: 1,
                minor: 0,
                micro: 0,
            },
            name: "Simulated Tag".to_string(),
        }
    }

    pub fn with_mtu(self, mtu: u16) -> Self {
        self.behavior.lock().mtu = mtu;
        self
    }

    pub fn with_services(self, services: Vec<Uuid>) -> Self {
        self.behavior.lock().services = services;
        self
    }

    pub fn with_characteristics(self, characteristics: Vec<Uuid>) -> Self {
        self.behavior.lock().characteristics = characteristics;
        self
    }

    pub fn with_connect_error(self, error: &str) -> Self {
        self.behavior.lock().connect_error = Some(error.to_string());
        self
    }

    pub fn with_notify_error(self, error: &str) -> Self {
        self.behavior.lock().notify_error = Some(error.to_string());
        self
    }

    /// `None` leaves the hello request unanswered
    pub fn with_hello(self, hello: Option<HelloResponse>) -> Self {
        self.behavior.lock().hello = hello;
        self
    }

    /// Acknowledge a write that completes a request only after its response
    pub fn with_deferred_write_acks(self) -> Self {
        self.behavior.lock().deferred_acks = true;
        self
    }

    pub fn with_begin_status(self, status: Status) -> Self {
        self.behavior.lock().begin_status = status;
        self
    }

    pub fn with_command_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&Request) -> Option<Response> + Send + Sync + 'static,
    {
        self.set_command_handler(handler);
        self
    }

    pub fn set_command_handler<F>(&self, handler: F)
    where
        F: Fn(&Request) -> Option<Response> + Send + Sync + 'static,
    {
        self.behavior.lock().handler = Arc::new(handler);
    }

    pub fn set_connect_error(&self, error: Option<String>) {
        self.behavior.lock().connect_error = error;
    }

    /// Fail every acknowledged write with `error`
    pub fn set_write_error(&self, error: Option<String>) {
        self.behavior.lock().write_error = error;
    }

    /// Fail the next `count` acknowledged writes
    pub fn fail_next_writes(&self, count: usize) {
        self.behavior.lock().failing_writes = count;
    }

    /// Fail only the `n`-th write from now, counting from 1
    pub fn fail_write_at(&self, n: usize) {
        self.behavior.lock().fail_at = Some(n);
    }

    /// Route callbacks into the SDK
    pub fn attach(&self, sink: BleEventSink) {
        *self.sink.lock() = Some(sink);
    }

    pub fn peripheral(&self) -> PeripheralId {
        self.peripheral
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().connected
    }

    pub fn connect_count(&self) -> usize {
        self.link.lock().connects
    }

    pub fn cancel_count(&self) -> usize {
        self.link.lock().cancels
    }

    /// Every complete request received, handshake included
    pub fn received_requests(&self) -> Vec<Request> {
        self.link.lock().requests.clone()
    }

    /// Requests received with the given domain and opcode
    pub fn requests_for(&self, domain: Domain, opcode: u32) -> usize {
        self.link
            .lock()
            .requests
            .iter()
            .filter(|r| r.domain == domain && r.opcode == opcode)
            .count()
    }

    /// Emit a notification on the notify characteristic
    pub fn push_notification(&self, notification: &Notification) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mtu = self.behavior.lock().mtu;
        match encode_notification(notification) {
            Ok(packet) => {
                self.post_packet(self.layout.notify, &packet, mtu);
                true
            }
            Err(e) => {
                warn!("Simulated notification not encodable: {}", e);
                false
            }
        }
    }

    /// Drop the link as if the tag walked out of range
    pub fn drop_link(&self) {
        let was_connected = {
            let mut link = self.link.lock();
            link.reassembly = None;
            std::mem::replace(&mut link.connected, false)
        };
        if was_connected {
            self.post(BleEvent::DidDisconnect {
                error: Some("supervision timeout".to_string()),
            });
        }
    }

    fn post(&self, event: BleEvent) {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => sink.handle_event(self.peripheral, event),
            None => warn!("Simulated tag has no sink, dropping {}", event),
        }
    }

    fn post_packet(&self, characteristic: Uuid, packet: &[u8], mtu: u16) {
        let fragments = match Fragmenter::new(mtu).and_then(|f| f.fragments(packet)) {
            Ok(fragments) => fragments,
            Err(e) => {
                warn!("Simulated packet not framable: {}", e);
                return;
            }
        };
        for value in fragments {
            self.post(BleEvent::DidUpdateValue {
                characteristic,
                value,
                error: None,
            });
        }
    }

    fn check_peripheral(&self, peripheral: &PeripheralId) -> Result<(), String> {
        if *peripheral == self.peripheral {
            Ok(())
        } else {
            Err(format!("unknown peripheral {}", peripheral))
        }
    }

    fn post_write_ack(&self, characteristic: &Uuid) {
        self.post(BleEvent::DidWriteValue {
            characteristic: *characteristic,
            error: None,
        });
    }

    /// Decode a reassembled request and post its response
    fn handle_packet(&self, packet: &[u8], mtu: u16) {
        let request = match decode_request(packet) {
            Ok(request) => request,
            Err(e) => {
                warn!("Simulated tag received undecodable request: {}", e);
                return;
            }
        };
        debug!("Simulated tag received request {} ({}/{})", request.id, request.domain, request.opcode);
        self.link.lock().requests.push(request.clone());

        if let Some(response) = self.respond(&request) {
            match encode_response(&response) {
                Ok(packet) => self.post_packet(self.layout.response, &packet, mtu),
                Err(e) => warn!("Simulated response not encodable: {}", e),
            }
        }
    }

    fn respond(&self, request: &Request) -> Option<Response> {
        let behavior = self.behavior.lock();
        if request.domain != Domain::Base {
            let handler = behavior.handler.clone();
            drop(behavior);
            return handler(request);
        }
        match request.opcode {
            HELLO_OPCODE => {
                let hello = behavior.hello.as_ref()?;
                encode_payload(hello)
                    .ok()
                    .map(|payload| Response::ok(request.id, payload))
            }
            BEGIN_OPCODE => {
                let begin: BeginRequest = decode_payload(&request.payload).ok()?;
                let status = behavior.begin_status;
                let payload = encode_payload(&BeginResponse {
                    protocol: begin.protocol,
                    notification_queue_depth: begin.notification_queue_depth,
                })
                .ok()?;
                Some(Response {
                    id: request.id,
                    status,
                    payload,
                })
            }
            _ => {
                let handler = behavior.handler.clone();
                drop(behavior);
                handler(request)
            }
        }
    }
}

impl CentralBridge for SimulatedTag {
    fn connect(&self, peripheral: &PeripheralId) -> Result<(), String> {
        self.check_peripheral(peripheral)?;
        let (connect_error, mtu) = {
            let behavior = self.behavior.lock();
            (behavior.connect_error.clone(), behavior.mtu)
        };
        {
            let mut link = self.link.lock();
            link.connects += 1;
            if connect_error.is_none() {
                link.connected = true;
                link.reassembly = Fragmenter::new(mtu).ok();
            }
        }
        match connect_error {
            Some(error) => self.post(BleEvent::DidFailToConnect { error: Some(error) }),
            None => self.post(BleEvent::DidConnect { mtu }),
        }
        Ok(())
    }

    fn cancel_connection(&self, peripheral: &PeripheralId) -> Result<(), String> {
        self.check_peripheral(peripheral)?;
        let was_connected = {
            let mut link = self.link.lock();
            link.cancels += 1;
            link.reassembly = None;
            std::mem::replace(&mut link.connected, false)
        };
        if was_connected {
            self.post(BleEvent::DidDisconnect { error: None });
        }
        Ok(())
    }

    fn discover_services(&self, peripheral: &PeripheralId) -> Result<(), String> {
        self.check_peripheral(peripheral)?;
        let services = self.behavior.lock().services.clone();
        self.post(BleEvent::DidDiscoverServices {
            services,
            error: None,
        });
        Ok(())
    }

    fn discover_characteristics(&self, peripheral: &PeripheralId, service: &Uuid) -> Result<(), String> {
        self.check_peripheral(peripheral)?;
        let characteristics = self.behavior.lock().characteristics.clone();
        self.post(BleEvent::DidDiscoverCharacteristics {
            service: *service,
            characteristics,
            error: None,
        });
        Ok(())
    }

    fn write_value(
        &self,
        peripheral: &PeripheralId,
        data: &[u8],
        characteristic: &Uuid,
        write_type: WriteType,
    ) -> Result<(), String> {
        self.check_peripheral(peripheral)?;
        if *characteristic != self.layout.command {
            return Err(format!("characteristic {} is not writable", characteristic));
        }
        if !self.is_connected() {
            return Err("not connected".to_string());
        }
        let (write_error, mtu, deferred_acks) = {
            let mut behavior = self.behavior.lock();
            let scheduled = match behavior.fail_at {
                Some(n) if n <= 1 => {
                    behavior.fail_at = None;
                    true
                }
                Some(n) => {
                    behavior.fail_at = Some(n - 1);
                    false
                }
                None => false,
            };
            let error = if behavior.failing_writes > 0 {
                behavior.failing_writes -= 1;
                Some("simulated write failure".to_string())
            } else if scheduled {
                Some("simulated write failure".to_string())
            } else {
                behavior.write_error.clone()
            };
            (error, behavior.mtu, behavior.deferred_acks)
        };
        let acknowledged = write_type == WriteType::WithResponse;

        if let Some(error) = write_error {
            if acknowledged {
                self.post(BleEvent::DidWriteValue {
                    characteristic: *characteristic,
                    error: Some(error),
                });
            }
            return Ok(());
        }

        let packet = self
            .link
            .lock()
            .reassembly
            .as_mut()
            .and_then(|f| f.add_fragment(data));
        let defer_ack = acknowledged && deferred_acks && packet.is_some();
        if acknowledged && !defer_ack {
            self.post_write_ack(characteristic);
        }
        if let Some(packet) = packet {
            self.handle_packet(&packet, mtu);
        }
        if defer_ack {
            self.post_write_ack(characteristic);
        }
        Ok(())
    }

    fn set_notify_enabled(
        &self,
        peripheral: &PeripheralId,
        enabled: bool,
        characteristic: &Uuid,
    ) -> Result<(), String> {
        self.check_peripheral(peripheral)?;
        let error = self.behavior.lock().notify_error.clone();
        self.post(BleEvent::DidUpdateNotificationState {
            characteristic: *characteristic,
            enabled: enabled && error.is_none(),
            error,
        });
        Ok(())
    }
}
