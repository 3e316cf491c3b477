// Jacquard Core: connection stack for Jacquard BLE tags
//
// Fragmentation, pairing, the hello/begin handshake, reconnection and
// command/notification dispatch, independent of any Bluetooth stack. The
// host platform implements `CentralBridge` and feeds callbacks into the
// `BleEventSink` returned by `TagManager::event_sink`.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod simulator;
pub mod tag;
pub mod transport;

pub use config::{ConfigError, SdkConfig};
pub use connection::{BleEventSink, ConnectionState, ConnectionStateStream, TagManager};
pub use dispatch::CommandError;
pub use error::TagError;
pub use protocol::{
    Command, Domain, Notification, NotificationKind, Request, Response, Status, TagNotification,
};
pub use simulator::SimulatedTag;
pub use tag::{ConnectedTag, NotificationStream, TagMetadata, TypedNotificationStream};
pub use transport::{BleEvent, CentralBridge, PeripheralId, WriteType};
