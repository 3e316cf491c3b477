/// Packet fragmentation and reassembly for the tag's GATT characteristics
///
/// Every protocol packet travels as one or more characteristic-sized fragments.
///
/// Fragment format:
///
/// ```text
/// [header: 1 byte][length varint: first fragment only][payload...]
///
/// header bit 7 (0x80): first fragment
/// header bit 6 (0x40): last fragment
/// header bits 5-0    : rolling sequence counter (wraps after 63)
/// ```
///
/// A fragment is at most `mtu - 3` bytes including its header.

use thiserror::Error;
use tracing::{debug, warn};

/// Largest packet the protocol allows
pub const MAX_PACKET_SIZE: usize = 1024;

/// Smallest ATT MTU a BLE link can negotiate
pub const MIN_MTU: u16 = 23;

/// ATT opcode and handle overhead subtracted from the MTU
pub const ATT_OVERHEAD: usize = 3;

const FIRST_FRAGMENT: u8 = 0x80;
const LAST_FRAGMENT: u8 = 0x40;
const COUNTER_MASK: u8 = 0x3F;
const MAX_VARINT_LEN: usize = 10;

/// Errors for fragmentation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FragmentError {
    #[error("Packet of {0} bytes exceeds the 1024 byte limit")]
    PacketTooLarge(usize),
    #[error("Invalid MTU: {0}")]
    InvalidMtu(u16),
}

/// Append `value` to `out` as a protobuf base-128 varint
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Decode a protobuf varint, returning the value and the number of bytes consumed
pub fn decode_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in bytes.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Splits outbound packets and reassembles inbound fragments for one characteristic
#[derive(Debug)]
pub struct Fragmenter {
    mtu: u16,
    incoming_data: Vec<u8>,
    data_length: Option<usize>,
    fragment_counter: u8,
}

impl Fragmenter {
    /// Create a fragmenter for a link with the given negotiated MTU
    pub fn new(mtu: u16) -> Result<Self, FragmentError> {
        if mtu < MIN_MTU {
            return Err(FragmentError::InvalidMtu(mtu));
        }
        Ok(Self {
            mtu,
            incoming_data: Vec::new(),
            data_length: None,
            fragment_counter: 0,
        })
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Maximum fragment size in bytes, header included
    pub fn max_fragment_size(&self) -> usize {
        self.mtu as usize - ATT_OVERHEAD
    }

    /// True while a packet is partially reassembled
    pub fn is_assembling(&self) -> bool {
        self.data_length.is_some()
    }

    /// Split a packet into fragments
    pub fn fragments(&self, packet: &[u8]) -> Result<Vec<Vec<u8>>, FragmentError> {
        if packet.len() > MAX_PACKET_SIZE {
            return Err(FragmentError::PacketTooLarge(packet.len()));
        }

        let max_fragment = self.max_fragment_size();
        let mut fragments = Vec::new();
        let mut counter = 0u8;
        let mut offset = 0usize;

        loop {
            let mut fragment = Vec::with_capacity(max_fragment);
            let is_first = offset == 0;
            let flags = if is_first { FIRST_FRAGMENT } else { 0 };
            fragment.push(flags | counter);
            if is_first {
                encode_varint(packet.len() as u64, &mut fragment);
            }

            let room = max_fragment - fragment.len();
            let end = usize::min(offset + room, packet.len());
            fragment.extend_from_slice(&packet[offset..end]);
            offset = end;

            let is_last = offset == packet.len();
            if is_last {
                fragment[0] |= LAST_FRAGMENT;
            }
            fragments.push(fragment);
            counter = (counter + 1) & COUNTER_MASK;

            if is_last {
                break;
            }
        }

        debug!(
            "Fragmented {} byte packet into {} fragments (mtu {})",
            packet.len(),
            fragments.len(),
            self.mtu
        );
        Ok(fragments)
    }

    /// Feed one inbound fragment; returns a packet once its last fragment arrives
    pub fn add_fragment(&mut self, fragment: &[u8]) -> Option<Vec<u8>> {
        let Some((&header, body)) = fragment.split_first() else {
            warn!("Dropping empty fragment");
            return None;
        };
        let counter = header & COUNTER_MASK;

        if header & FIRST_FRAGMENT != 0 {
            if self.is_assembling() {
                warn!(
                    "First fragment while {} of {:?} bytes pending, discarding partial packet",
                    self.incoming_data.len(),
                    self.data_length
                );
                self.reset();
            }

            let Some((length, consumed)) = decode_varint(body) else {
                warn!("Dropping first fragment with malformed length");
                return None;
            };
            let length = length as usize;
            if length > MAX_PACKET_SIZE {
                warn!("Dropping first fragment declaring {} bytes", length);
                return None;
            }

            self.data_length = Some(length);
            self.incoming_data.extend_from_slice(&body[consumed..]);
        } else {
            if !self.is_assembling() {
                warn!("Dropping continuation fragment {} with no packet pending", counter);
                return None;
            }
            if counter != self.fragment_counter {
                warn!(
                    "Fragment counter mismatch: expected {}, got {}",
                    self.fragment_counter, counter
                );
                self.reset();
                return None;
            }
            self.incoming_data.extend_from_slice(body);
        }
        self.fragment_counter = (counter + 1) & COUNTER_MASK;

        let expected = self.data_length.unwrap_or_default();
        if header & LAST_FRAGMENT != 0 {
            if self.incoming_data.len() != expected {
                warn!(
                    "Length mismatch on last fragment: declared {}, received {}",
                    expected,
                    self.incoming_data.len()
                );
                self.reset();
                return None;
            }
            let packet = std::mem::take(&mut self.incoming_data);
            self.reset();
            return Some(packet);
        }

        if self.incoming_data.len() > expected {
            warn!(
                "Packet overflow: declared {}, received {} before last fragment",
                expected,
                self.incoming_data.len()
            );
            self.reset();
        }
        None
    }

    /// Drop any partially reassembled packet
    pub fn reset(&mut self) {
        self.incoming_data.clear();
        self.data_length = None;
        self.fragment_counter = 0;
    }
}
