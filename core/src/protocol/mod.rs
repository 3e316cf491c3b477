// Protocol module: envelopes, handshake payloads and serialization

pub mod codec;
pub mod command;
pub mod handshake;
pub mod types;

pub use codec::{
    decode_notification, decode_payload, decode_request, decode_response, encode_notification,
    encode_payload, encode_request, encode_response, ProtocolError,
};
pub use command::{parse_notification_payload, Command, TagNotification};
pub use handshake::{BeginRequest, BeginResponse, FirmwareVersion, HelloResponse};
pub use types::{Domain, Notification, NotificationKind, Request, Response, Status};
