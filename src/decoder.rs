//! Notification decoding
//!
//! Pure functions that turn raw characteristic values delivered by the
//! Bluetooth stack into heart rate readings and device metadata. Nothing here
//! holds state or touches I/O.

use crate::error::SyncError;
use crate::types::{BodyLocation, HeartRateMeasurement, SensorContact};

/// Heart Rate Measurement characteristic (notify)
pub const HEART_RATE_MEASUREMENT: u16 = 0x2A37;
/// Body Sensor Location characteristic (read)
pub const BODY_SENSOR_LOCATION: u16 = 0x2A38;
/// Manufacturer Name String characteristic (read)
pub const MANUFACTURER_NAME: u16 = 0x2A29;

/// Manufacturer name used when the characteristic is absent or unreadable
pub const UNKNOWN_MANUFACTURER: &str = "Unknown";

const FLAG_VALUE_16BIT: u8 = 0x01;
const FLAG_CONTACT_SUPPORTED: u8 = 0x04;
const FLAG_CONTACT_DETECTED: u8 = 0x02;

/// Decode a Heart Rate Measurement notification.
///
/// Byte 0 carries the flags. Bit 0 selects the value width: clear means the
/// bpm is the single byte at offset 1, set means bytes 1-2 hold a
/// little-endian `u16`. Trailing fields (energy expended, RR intervals) are
/// ignored.
pub fn decode_heart_rate(payload: &[u8]) -> Result<HeartRateMeasurement, SyncError> {
    let Some(&flags) = payload.first() else {
        return Err(SyncError::MalformedPayload(
            "empty heart rate notification".to_string(),
        ));
    };

    let wide_format = flags & FLAG_VALUE_16BIT != 0;
    let required = if wide_format { 3 } else { 2 };
    if payload.len() < required {
        return Err(SyncError::MalformedPayload(format!(
            "expected at least {required} bytes for {} bpm, got {}",
            if wide_format { "16-bit" } else { "8-bit" },
            payload.len()
        )));
    }

    let bpm = if wide_format {
        u16::from_le_bytes([payload[1], payload[2]])
    } else {
        u16::from(payload[1])
    };

    Ok(HeartRateMeasurement {
        bpm,
        wide_format,
        sensor_contact: sensor_contact(flags),
    })
}

/// Decode only the bpm value of a measurement notification
pub fn decode_bpm(payload: &[u8]) -> Result<u16, SyncError> {
    decode_heart_rate(payload).map(|m| m.bpm)
}

fn sensor_contact(flags: u8) -> SensorContact {
    match (
        flags & FLAG_CONTACT_SUPPORTED != 0,
        flags & FLAG_CONTACT_DETECTED != 0,
    ) {
        (false, _) => SensorContact::NotSupported,
        (true, false) => SensorContact::NotDetected,
        (true, true) => SensorContact::Detected,
    }
}

/// Decode the Body Sensor Location characteristic.
///
/// `None` or an empty value means the sensor did not provide one.
pub fn decode_body_location(payload: Option<&[u8]>) -> BodyLocation {
    match payload.and_then(|bytes| bytes.first()) {
        None => BodyLocation::NotAvailable,
        Some(1) => BodyLocation::Chest,
        Some(_) => BodyLocation::Undefined,
    }
}

/// Decode the Manufacturer Name String characteristic.
///
/// Falls back to [`UNKNOWN_MANUFACTURER`] for absent, empty or non UTF-8 values.
pub fn decode_manufacturer_name(payload: Option<&[u8]>) -> String {
    payload
        .and_then(|bytes| std::str::from_utf8(bytes).ok())
        .map(|name| name.trim_end_matches('\0'))
        .filter(|name| !name.is_empty())
        .map_or_else(|| UNKNOWN_MANUFACTURER.to_string(), str::to_string)
}
