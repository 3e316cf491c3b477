// Connection module: pairing, handshake and the per-tag orchestrator

pub mod initialization;
pub mod manager;
pub mod orchestrator;
pub mod pairing;
pub mod state;

pub use initialization::{InitializationError, InitializationState, InitializationStateMachine};
pub use manager::{BleEventSink, TagManager};
pub use pairing::{PairedTag, PairingError, PairingState, PairingStateMachine};
pub use state::{ConnectionState, ConnectionStateStream};
