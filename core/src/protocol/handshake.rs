// Handshake payloads: hello and begin exchanged right after pairing

use super::codec::{encode_payload, ProtocolError};
use super::types::{Domain, Request};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Base domain opcode of the hello request
pub const HELLO_OPCODE: u32 = 1;

/// Base domain opcode of the begin request
pub const BEGIN_OPCODE: u32 = 2;

/// Request id used by the hello request
pub const HELLO_REQUEST_ID: u32 = 1;

/// Request id used by the begin request
pub const BEGIN_REQUEST_ID: u32 = 2;

/// Firmware version reported by the tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

/// Payload of the hello response: who the tag is and what it speaks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloResponse {
    pub protocol_min: u32,
    pub protocol_max: u32,
    pub vendor_id: u32,
    pub product_id: u32,
    pub firmware_version: FirmwareVersion,
    /// Advertised tag name
    pub name: String,
}

/// Payload of the begin request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginRequest {
    pub protocol: u32,
    pub notification_queue_depth: u32,
}

/// Payload of the begin response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginResponse {
    pub protocol: u32,
    /// Queue depth the tag actually applied
    pub notification_queue_depth: u32,
}

/// Pick the highest protocol version both sides support
pub fn negotiate_protocol(ours: (u32, u32), theirs: (u32, u32)) -> Option<u32> {
    let low = ours.0.max(theirs.0);
    let high = ours.1.min(theirs.1);
    (low <= high).then_some(high)
}

/// Build the hello request
pub fn hello_request() -> Request {
    Request::new(Domain::Base, HELLO_OPCODE, Vec::new()).with_id(HELLO_REQUEST_ID)
}

/// Build the begin request
pub fn begin_request(begin: &BeginRequest) -> Result<Request, ProtocolError> {
    Ok(Request::new(Domain::Base, BEGIN_OPCODE, encode_payload(begin)?).with_id(BEGIN_REQUEST_ID))
}
