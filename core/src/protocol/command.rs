// Typed commands and notifications layered over the raw envelopes

use super::codec::{decode_payload, ProtocolError};
use super::types::{Domain, Notification, NotificationKind, Request, Response};
use serde::de::DeserializeOwned;

/// A request with a typed response.
///
/// Feature layers (battery, haptics, gear) implement this for each command
/// they send.
pub trait Command {
    type Response;

    const DOMAIN: Domain;
    const OPCODE: u32;

    /// Serialized command arguments
    fn payload(&self) -> Result<Vec<u8>, ProtocolError>;

    /// Decode the payload of a successful response
    fn parse_response(response: &Response) -> Result<Self::Response, ProtocolError>;

    fn to_request(&self) -> Result<Request, ProtocolError> {
        Ok(Request::new(Self::DOMAIN, Self::OPCODE, self.payload()?))
    }
}

/// A notification with a typed payload
pub trait TagNotification: Sized {
    const KIND: NotificationKind;

    fn parse(notification: &Notification) -> Result<Self, ProtocolError>;
}

/// Decode a notification payload with the bincode codec
pub fn parse_notification_payload<T: DeserializeOwned>(
    notification: &Notification,
) -> Result<T, ProtocolError> {
    decode_payload(&notification.payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::encode_payload;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize)]
    struct SetBrightness {
        level: u8,
    }

    #[derive(Debug, PartialEq, Deserialize)]
    struct Applied {
        level: u8,
    }

    impl Command for SetBrightness {
        type Response = Applied;
        const DOMAIN: Domain = Domain::Gear;
        const OPCODE: u32 = 40;

        fn payload(&self) -> Result<Vec<u8>, ProtocolError> {
            encode_payload(self)
        }

        fn parse_response(response: &Response) -> Result<Applied, ProtocolError> {
            decode_payload(&response.payload)
        }
    }

    #[test]
    fn test_command_to_request() {
        let request = SetBrightness { level: 3 }.to_request().expect("request");
        assert_eq!(request.domain, Domain::Gear);
        assert_eq!(request.opcode, 40);
        assert_eq!(request.payload, vec![3]);
    }

    #[test]
    fn test_command_parse_response() {
        let response = Response::ok(9, vec![5]);
        assert_eq!(
            SetBrightness::parse_response(&response).expect("parse"),
            Applied { level: 5 }
        );
    }
}
