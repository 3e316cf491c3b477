// Transport module: BLE boundary and packet framing

pub mod ble;
pub mod fragmenter;

pub use ble::{BleEvent, CentralBridge, PeripheralId, TagCharacteristic, TagCharacteristics, WriteType};
pub use fragmenter::{
    decode_varint, encode_varint, FragmentError, Fragmenter, MAX_PACKET_SIZE, MIN_MTU,
};
