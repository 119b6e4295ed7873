use thiserror::Error;

use super::{Layout, FIELDS_LEN, FLAG_CHARGING, FLAG_FULL, FLAG_PLUGGED, MAGIC};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload too short: {0} bytes")]
    TooShort(usize),
}

/// A frame as seen by a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub layout: Layout,
    pub device_id: u16,
    pub percent: u8,
    pub flags: u8,
    pub temperature_deci_c: i16,
    pub voltage_mv: u16,
    pub sequence: u8,
}

impl DecodedFrame {
    pub fn charging(&self) -> bool {
        self.flags & FLAG_CHARGING != 0
    }

    pub fn full(&self) -> bool {
        self.flags & FLAG_FULL != 0
    }

    pub fn plugged(&self) -> bool {
        self.flags & FLAG_PLUGGED != 0
    }

    pub fn temperature_c(&self) -> f64 {
        self.temperature_deci_c as f64 / 10.0
    }

    /// e.g. `0x05 (C=1 F=0 P=1)`
    pub fn flags_text(&self) -> String {
        format!(
            "0x{:02X} (C={} F={} P={})",
            self.flags,
            self.charging() as u8,
            self.full() as u8,
            self.plugged() as u8
        )
    }
}

/// Decode manufacturer data received from a broadcaster.
///
/// An 11 byte payload starting with the magic is the versioned layout.
/// Anything else at least 9 bytes long is read as the legacy layout from its first 9 bytes.
pub fn decode(payload: &[u8]) -> Result<DecodedFrame, DecodeError> {
    let magic = MAGIC.to_le_bytes();
    if payload.len() == Layout::Versioned.len() && payload[0..2] == magic {
        return Ok(decode_fields(Layout::Versioned, &payload[2..]));
    }
    if payload.len() < FIELDS_LEN {
        return Err(DecodeError::TooShort(payload.len()));
    }
    Ok(decode_fields(Layout::Legacy, &payload[..FIELDS_LEN]))
}

fn decode_fields(layout: Layout, b: &[u8]) -> DecodedFrame {
    DecodedFrame {
        layout,
        device_id: u16::from_le_bytes([b[0], b[1]]),
        percent: b[2],
        flags: b[3],
        temperature_deci_c: i16::from_le_bytes([b[4], b[5]]),
        voltage_mv: u16::from_le_bytes([b[6], b[7]]),
        sequence: b[8],
    }
}

#[test]
fn test_decode_legacy() {
    let payload = hex::decode("01004d05d7001b1005").unwrap();
    let frame = decode(&payload).unwrap();
    assert_eq!(
        frame,
        DecodedFrame {
            layout: Layout::Legacy,
            device_id: 1,
            percent: 77,
            flags: 0x05,
            temperature_deci_c: 215,
            voltage_mv: 4123,
            sequence: 5,
        }
    );
    assert!(frame.charging());
    assert!(!frame.full());
    assert!(frame.plugged());
    assert_eq!(frame.flags_text(), "0x05 (C=1 F=0 P=1)");
    assert_eq!(frame.temperature_c(), 21.5);
}

#[test]
fn test_decode_versioned() {
    let payload = hex::decode("bbaa3412320290fff40efe").unwrap();
    let frame = decode(&payload).unwrap();
    assert_eq!(frame.layout, Layout::Versioned);
    assert_eq!(frame.device_id, 0x1234);
    assert_eq!(frame.percent, 50);
    assert_eq!(frame.flags, FLAG_FULL);
    assert_eq!(frame.temperature_deci_c, -112);
    assert_eq!(frame.voltage_mv, 3828);
    assert_eq!(frame.sequence, 0xFE);
}

#[test]
fn test_decode_eleven_bytes_without_magic_is_legacy() {
    let payload = hex::decode("01004d05d7001b10050000").unwrap();
    let frame = decode(&payload).unwrap();
    assert_eq!(frame.layout, Layout::Legacy);
    assert_eq!(frame.sequence, 5);
}

#[test]
fn test_decode_too_short() {
    assert_eq!(decode(&[0x01, 0x00, 0x4d]), Err(DecodeError::TooShort(3)));
    assert_eq!(decode(&[]), Err(DecodeError::TooShort(0)));
}
