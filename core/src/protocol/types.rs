// Protocol types: the envelopes every packet on the link carries

use serde::{Deserialize, Serialize};
use std::fmt;

/// Functional area a request or notification belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    /// Link management (hello, begin, battery, config)
    Base,
    /// Attached gear (snap tag accessories)
    Gear,
    /// Firmware update transfer
    Dfu,
    /// Raw sensor streaming
    Imu,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Base => write!(f, "Base"),
            Domain::Gear => write!(f, "Gear"),
            Domain::Dfu => write!(f, "Dfu"),
            Domain::Imu => write!(f, "Imu"),
        }
    }
}

/// Status code embedded in every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Unsupported,
    BadParam,
    Battery,
    Hardware,
    Auth,
    DeviceType,
    InvalidState,
    FlashAccess,
    Checksum,
    Busy,
    GenericError,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A request sent to the tag.
///
/// `id` is assigned by the dispatcher when the request is enqueued; any value
/// set by the caller is overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u32,
    pub domain: Domain,
    pub opcode: u32,
    /// Command specific payload
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(domain: Domain, opcode: u32, payload: Vec<u8>) -> Self {
        Self {
            id: 0,
            domain,
            opcode,
            payload,
        }
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }
}

/// The tag's answer to one request, correlated by `id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: u32,
    pub status: Status,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn ok(id: u32, payload: Vec<u8>) -> Self {
        Self {
            id,
            status: Status::Ok,
            payload,
        }
    }

    pub fn error(id: u32, status: Status) -> Self {
        Self {
            id,
            status,
            payload: Vec::new(),
        }
    }
}

/// An unsolicited message from the tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub domain: Domain,
    pub opcode: u32,
    pub payload: Vec<u8>,
}

impl Notification {
    pub fn new(domain: Domain, opcode: u32, payload: Vec<u8>) -> Self {
        Self {
            domain,
            opcode,
            payload,
        }
    }

    pub fn kind(&self) -> NotificationKind {
        NotificationKind {
            domain: self.domain,
            opcode: self.opcode,
        }
    }
}

/// Identifies one type of notification for subscription filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationKind {
    pub domain: Domain,
    pub opcode: u32,
}

impl NotificationKind {
    pub const fn new(domain: Domain, opcode: u32) -> Self {
        Self { domain, opcode }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.opcode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_builder() {
        let request = Request::new(Domain::Base, 7, vec![1]).with_id(42);
        assert_eq!(request.id, 42);
        assert_eq!(request.opcode, 7);
    }

    #[test]
    fn test_status_is_ok() {
        assert!(Status::Ok.is_ok());
        assert!(!Status::Busy.is_ok());
        assert_eq!(Response::error(3, Status::Checksum).status, Status::Checksum);
    }

    #[test]
    fn test_notification_kind() {
        let notification = Notification::new(Domain::Gear, 3, vec![]);
        assert_eq!(notification.kind(), NotificationKind::new(Domain::Gear, 3));
        assert_eq!(notification.kind().to_string(), "Gear/3");
    }
}
