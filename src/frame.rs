//! The broadcast wire format.
//!
//! A frame is carried as manufacturer specific data (company id [`MANUFACTURER_ID`]).
//! All multi byte fields are little endian.
//!
//! Legacy layout, 9 bytes:
//!
//! Offset | Size | Field
//! -------|------|----------------------------------------------
//! 0      | 2    | device id (u16)
//! 2      | 1    | battery % (u8, 0-100)
//! 3      | 1    | flags: bit0 charging, bit1 full, bit2 plugged
//! 4      | 2    | temperature (i16, tenths of °C)
//! 6      | 2    | voltage (u16, mV)
//! 8      | 1    | sequence (u8, wraps)
//!
//! The versioned layout is 11 bytes: the same fields prefixed with [`MAGIC`].

mod decode;

use std::fmt;

pub use decode::{decode, DecodeError, DecodedFrame};

use crate::telemetry::TelemetrySnapshot;

/// Company id the frame is advertised under.
pub const MANUFACTURER_ID: u16 = 0xFFFF;
/// Prefix of the versioned layout. On the wire: `BB AA`.
pub const MAGIC: u16 = 0xAABB;

pub const FLAG_CHARGING: u8 = 0x01;
pub const FLAG_FULL: u8 = 0x02;
pub const FLAG_PLUGGED: u8 = 0x04;

const FIELDS_LEN: usize = 9;

/// Which wire layout a broadcaster emits. Fixed for the lifetime of a broadcaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    Legacy,
    #[default]
    Versioned,
}

impl Layout {
    pub const fn len(&self) -> usize {
        match self {
            Layout::Legacy => FIELDS_LEN,
            Layout::Versioned => FIELDS_LEN + 2,
        }
    }
}

/// An encoded frame, ready to advertise.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Legacy([u8; 9]),
    Versioned([u8; 11]),
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Legacy(bytes) => bytes,
            Frame::Versioned(bytes) => bytes,
        }
    }

    pub fn layout(&self) -> Layout {
        match self {
            Frame::Legacy(_) => Layout::Legacy,
            Frame::Versioned(_) => Layout::Versioned,
        }
    }

    /// The sequence byte carried by the frame
    pub fn sequence(&self) -> u8 {
        let bytes = self.as_bytes();
        bytes[bytes.len() - 1]
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame::{:?}({})", self.layout(), hex::encode(self.as_bytes()))
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Encode a snapshot.
///
/// Never fails: the device id is masked to 16 bits, the sequence to 8 bits,
/// and every telemetry value is clamped into the range of its field.
pub fn encode(device_id: u32, snapshot: &TelemetrySnapshot, sequence: u32, layout: Layout) -> Frame {
    let fields = encode_fields(device_id, snapshot, sequence);
    match layout {
        Layout::Legacy => Frame::Legacy(fields),
        Layout::Versioned => {
            let mut bytes = [0u8; 11];
            bytes[0..2].copy_from_slice(&MAGIC.to_le_bytes());
            bytes[2..].copy_from_slice(&fields);
            Frame::Versioned(bytes)
        }
    }
}

pub fn flags(snapshot: &TelemetrySnapshot) -> u8 {
    let mut flags = 0;
    if snapshot.charging {
        flags |= FLAG_CHARGING;
    }
    if snapshot.full {
        flags |= FLAG_FULL;
    }
    if snapshot.plugged {
        flags |= FLAG_PLUGGED;
    }
    flags
}

fn encode_fields(device_id: u32, snapshot: &TelemetrySnapshot, sequence: u32) -> [u8; FIELDS_LEN] {
    let device_id = (device_id & 0xFFFF) as u16;
    let percent = snapshot.percent.clamp(0, 100) as u8;
    let temperature = snapshot.temperature_deci_c.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    let voltage = snapshot.voltage_mv.clamp(0, u16::MAX as i32) as u16;
    let sequence = (sequence & 0xFF) as u8;

    let mut bytes = [0u8; FIELDS_LEN];
    bytes[0..2].copy_from_slice(&device_id.to_le_bytes());
    bytes[2] = percent;
    bytes[3] = flags(snapshot);
    bytes[4..6].copy_from_slice(&temperature.to_le_bytes());
    bytes[6..8].copy_from_slice(&voltage.to_le_bytes());
    bytes[8] = sequence;
    bytes
}

#[cfg(test)]
fn snapshot(percent: i32, temperature_deci_c: i32, voltage_mv: i32) -> TelemetrySnapshot {
    TelemetrySnapshot {
        percent,
        charge_state: crate::telemetry::ChargeState::Charging,
        charging: true,
        full: false,
        plugged: true,
        temperature_deci_c,
        voltage_mv,
        captured_at_ms: 0,
    }
}

#[test]
fn test_encode_legacy_known_bytes() {
    let frame = encode(1, &snapshot(77, 215, 4123), 5, Layout::Legacy);
    // 4123 mV = 0x101B
    let expected = hex::decode("01004d05d7001b1005").unwrap();
    assert_eq!(frame.as_bytes(), &expected[..]);
    assert_eq!(frame.sequence(), 5);
}

#[test]
fn test_encode_versioned_prefixes_magic() {
    let legacy = encode(0x1234, &snapshot(50, -45, 3700), 200, Layout::Legacy);
    let versioned = encode(0x1234, &snapshot(50, -45, 3700), 200, Layout::Versioned);
    assert_eq!(&versioned.as_bytes()[..2], &[0xBB, 0xAA]);
    assert_eq!(&versioned.as_bytes()[2..], legacy.as_bytes());
    assert_eq!(versioned.layout(), Layout::Versioned);
}

#[test]
fn test_encode_length_is_fixed() {
    let extremes = [
        snapshot(i32::MIN, i32::MIN, i32::MIN),
        snapshot(i32::MAX, i32::MAX, i32::MAX),
        snapshot(0, 0, 0),
    ];
    for s in extremes.iter() {
        for layout in [Layout::Legacy, Layout::Versioned] {
            let frame = encode(u32::MAX, s, u32::MAX, layout);
            assert_eq!(frame.as_bytes().len(), layout.len());
            assert_eq!(frame, encode(u32::MAX, s, u32::MAX, layout));
        }
    }
}

#[test]
fn test_encode_clamps_percent() {
    assert_eq!(encode(1, &snapshot(-20, 0, 0), 0, Layout::Legacy).as_bytes()[2], 0);
    assert_eq!(encode(1, &snapshot(100, 0, 0), 0, Layout::Legacy).as_bytes()[2], 100);
    assert_eq!(encode(1, &snapshot(180, 0, 0), 0, Layout::Legacy).as_bytes()[2], 100);
}

#[test]
fn test_encode_clamps_temperature() {
    let hot = encode(1, &snapshot(0, 40_000, 0), 0, Layout::Legacy);
    assert_eq!(&hot.as_bytes()[4..6], &i16::MAX.to_le_bytes());
    let cold = encode(1, &snapshot(0, -40_000, 0), 0, Layout::Legacy);
    assert_eq!(&cold.as_bytes()[4..6], &i16::MIN.to_le_bytes());
    let freezing = encode(1, &snapshot(0, -55, 0), 0, Layout::Legacy);
    assert_eq!(&freezing.as_bytes()[4..6], &[0xC9, 0xFF]);
}

#[test]
fn test_encode_clamps_voltage() {
    let negative = encode(1, &snapshot(0, 0, -1), 0, Layout::Legacy);
    assert_eq!(&negative.as_bytes()[6..8], &[0x00, 0x00]);
    let huge = encode(1, &snapshot(0, 0, 70_000), 0, Layout::Legacy);
    assert_eq!(&huge.as_bytes()[6..8], &[0xFF, 0xFF]);
}

#[test]
fn test_encode_masks_device_id_and_sequence() {
    let frame = encode(0x0001_0203, &snapshot(0, 0, 0), 0x1FF, Layout::Legacy);
    assert_eq!(&frame.as_bytes()[0..2], &[0x03, 0x02]);
    assert_eq!(frame.sequence(), 0xFF);
}

#[test]
fn test_flags_are_independent() {
    let mut s = snapshot(0, 0, 0);
    s.charging = true;
    s.full = true;
    s.plugged = true;
    assert_eq!(flags(&s), 0x07);
    s.charging = false;
    assert_eq!(flags(&s), FLAG_FULL | FLAG_PLUGGED);
}
