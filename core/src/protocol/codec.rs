// Protocol codec: bincode serialization bounded by the packet size limit

use super::types::{Notification, Request, Response};
use crate::transport::fragmenter::MAX_PACKET_SIZE;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Protocol serialization errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Encoded packet too large: {0} bytes")]
    PacketTooLarge(usize),
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let bytes =
        bincode::serialize(value).map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(ProtocolError::PacketTooLarge(bytes.len()));
    }
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(ProtocolError::PacketTooLarge(bytes.len()));
    }
    bincode::deserialize(bytes).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
}

/// Serialize a Request into one packet
pub fn encode_request(request: &Request) -> Result<Vec<u8>, ProtocolError> {
    encode(request)
}

/// Deserialize a packet into a Request
pub fn decode_request(bytes: &[u8]) -> Result<Request, ProtocolError> {
    decode(bytes)
}

/// Serialize a Response into one packet
pub fn encode_response(response: &Response) -> Result<Vec<u8>, ProtocolError> {
    encode(response)
}

/// Deserialize a packet into a Response
pub fn decode_response(bytes: &[u8]) -> Result<Response, ProtocolError> {
    decode(bytes)
}

/// Serialize a Notification into one packet
pub fn encode_notification(notification: &Notification) -> Result<Vec<u8>, ProtocolError> {
    encode(notification)
}

/// Deserialize a packet into a Notification
pub fn decode_notification(bytes: &[u8]) -> Result<Notification, ProtocolError> {
    decode(bytes)
}

/// Serialize a command or notification specific payload
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>, ProtocolError> {
    encode(payload)
}

/// Deserialize a command or notification specific payload
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{Domain, Status};

    #[test]
    fn test_request_roundtrip() {
        let request = Request::new(Domain::Gear, 12, vec![9, 8, 7]).with_id(5);
        let bytes = encode_request(&request).expect("encode");
        assert_eq!(decode_request(&bytes).expect("decode"), request);
    }

    #[test]
    fn test_response_status_survives() {
        let response = Response::error(77, Status::Busy);
        let bytes = encode_response(&response).expect("encode");
        let restored = decode_response(&bytes).expect("decode");
        assert_eq!(restored.id, 77);
        assert_eq!(restored.status, Status::Busy);
    }

    #[test]
    fn test_reject_oversized_request() {
        let request = Request::new(Domain::Dfu, 1, vec![0u8; MAX_PACKET_SIZE]);
        assert!(matches!(
            encode_request(&request),
            Err(ProtocolError::PacketTooLarge(_))
        ));
    }

    #[test]
    fn test_reject_garbage() {
        assert!(matches!(
            decode_response(&[0xFF]),
            Err(ProtocolError::DeserializationError(_))
        ));
    }
}
