/// BLE (Bluetooth Low Energy) boundary
///
/// This module provides the protocol-level view of the tag's BLE link:
///
/// - **bridge**: the `CentralBridge` trait the platform implements and the
///   `BleEvent` callbacks it reports back
/// - **gatt**: the tag's service and characteristic layout
///
/// The platform-specific code (Swift/Kotlin/desktop) only handles the actual
/// radio operations. Everything here is testable without BLE hardware.

pub mod bridge;
pub mod gatt;

pub use bridge::{BleEvent, CentralBridge, PeripheralId, WriteType};
pub use gatt::{
    TagCharacteristic, TagCharacteristics, COMMAND_CHAR_UUID, NOTIFY_CHAR_UUID,
    RESPONSE_CHAR_UUID, TAG_SERVICE_UUID,
};

#[cfg(test)]
pub use bridge::MockCentralBridge;
