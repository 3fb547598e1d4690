//! Assigned numbers and value formats of the standard Heart Rate and Battery
//! services.

use bytes::Buf;
use enumflags2::{bitflags, BitFlags};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use uuid::Uuid;

use crate::result::{Error, Result};
use crate::util::uuid_from_u16;

pub const HEART_RATE_SERVICE_UUID: Uuid = uuid_from_u16(0x180d);
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = uuid_from_u16(0x2a37);
pub const BODY_SENSOR_LOCATION_UUID: Uuid = uuid_from_u16(0x2a38);
pub const HEART_RATE_CONTROL_POINT_UUID: Uuid = uuid_from_u16(0x2a39);

pub const BATTERY_SERVICE_UUID: Uuid = uuid_from_u16(0x180f);
pub const BATTERY_LEVEL_UUID: Uuid = uuid_from_u16(0x2a19);

/// Written to the heart rate control point to reset the energy expended.
pub const RESET_ENERGY_EXPENDED: u8 = 0x01;

#[bitflags]
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MeasurementFlag {
    /// The heart rate is a u16 instead of a u8.
    WideHeartRate = 1 << 0,
    SensorContactDetected = 1 << 1,
    SensorContactSupported = 1 << 2,
    EnergyExpended = 1 << 3,
    RrIntervals = 1 << 4,
}

/// A decoded Heart Rate Measurement notification.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HeartRateMeasurement {
    pub bpm: u16,
    /// `None` when the sensor cannot tell whether it touches the skin.
    pub sensor_contact: Option<bool>,
    /// Kilojoules since the last reset.
    pub energy_expended: Option<u16>,
    /// Beat-to-beat intervals in 1/1024 s.
    pub rr_intervals: Vec<u16>,
}

impl HeartRateMeasurement {
    pub fn parse(value: &[u8]) -> Result<Self> {
        let mut buf = value;
        let malformed = |reason: &str| Error::MalformedValue {
            uuid: HEART_RATE_MEASUREMENT_UUID,
            reason: reason.to_owned(),
        };

        if !buf.has_remaining() {
            return Err(malformed("empty value"));
        }
        let flags = BitFlags::<MeasurementFlag>::from_bits_truncate(buf.get_u8());

        let bpm = if flags.contains(MeasurementFlag::WideHeartRate) {
            if buf.remaining() < 2 {
                return Err(malformed("truncated heart rate"));
            }
            buf.get_u16_le()
        } else {
            if !buf.has_remaining() {
                return Err(malformed("truncated heart rate"));
            }
            u16::from(buf.get_u8())
        };

        let sensor_contact = if flags.contains(MeasurementFlag::SensorContactSupported) {
            Some(flags.contains(MeasurementFlag::SensorContactDetected))
        } else {
            None
        };

        let energy_expended = if flags.contains(MeasurementFlag::EnergyExpended) {
            if buf.remaining() < 2 {
                return Err(malformed("truncated energy expended"));
            }
            Some(buf.get_u16_le())
        } else {
            None
        };

        let mut rr_intervals = Vec::new();
        if flags.contains(MeasurementFlag::RrIntervals) {
            if buf.remaining() % 2 != 0 {
                return Err(malformed("odd length of RR intervals"));
            }
            while buf.has_remaining() {
                rr_intervals.push(buf.get_u16_le());
            }
        }

        Ok(HeartRateMeasurement {
            bpm,
            sensor_contact,
            energy_expended,
            rr_intervals,
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromPrimitive)]
pub enum BodySensorLocation {
    Other = 0,
    Chest = 1,
    Wrist = 2,
    Finger = 3,
    Hand = 4,
    EarLobe = 5,
    Foot = 6,
}

impl BodySensorLocation {
    pub fn parse(value: &[u8]) -> Result<Self> {
        let code = *value.first().ok_or_else(|| Error::MalformedValue {
            uuid: BODY_SENSOR_LOCATION_UUID,
            reason: "empty value".to_owned(),
        })?;

        FromPrimitive::from_u8(code).ok_or_else(|| Error::MalformedValue {
            uuid: BODY_SENSOR_LOCATION_UUID,
            reason: format!("unknown location {}", code),
        })
    }
}

/// Battery charge in percent.
pub fn parse_battery_level(value: &[u8]) -> Result<u8> {
    match value.first() {
        Some(level) if *level <= 100 => Ok(*level),
        Some(level) => Err(Error::MalformedValue {
            uuid: BATTERY_LEVEL_UUID,
            reason: format!("{}% is out of range", level),
        }),
        None => Err(Error::MalformedValue {
            uuid: BATTERY_LEVEL_UUID,
            reason: "empty value".to_owned(),
        }),
    }
}
