//! I/O-free building blocks: reading values, connection state,
//! calibration and decoding.

pub mod calibration;
pub mod modbus;
pub mod text;

pub use self::calibration::{CalibrationCurve, CalibrationError, CalibrationPoint};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecodeError {
    InsufficientInput,
    InvalidInput,
    InvalidData,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use DecodeError::*;
        match self {
            InsufficientInput => write!(f, "Insufficient input"),
            InvalidInput => write!(f, "Invalid input"),
            InvalidData => write!(f, "Invalid data"),
        }
    }
}

impl std::error::Error for DecodeError {}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Connection state of a single physical link.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceConnectionState {
    /// Rest state before the first attempt or after an explicit close.
    #[default]
    Disconnected,
    Connected,
    /// The link failed mid-read and must be closed before it is retried.
    Faulted,
}

/// Connection state plus the time of the most recent fault.
///
/// Every channel owns exactly one of these for its physical handle.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ConnectionHealth {
    state: DeviceConnectionState,
    last_fault: Option<DateTime<Utc>>,
}

impl ConnectionHealth {
    pub const fn state(&self) -> DeviceConnectionState {
        self.state
    }

    pub const fn last_fault(&self) -> Option<DateTime<Utc>> {
        self.last_fault
    }

    pub fn is_connected(&self) -> bool {
        self.state == DeviceConnectionState::Connected
    }

    pub fn connected(&mut self) {
        self.state = DeviceConnectionState::Connected;
    }

    pub fn disconnected(&mut self) {
        self.state = DeviceConnectionState::Disconnected;
    }

    pub fn faulted(&mut self) {
        self.state = DeviceConnectionState::Faulted;
        self.last_fault = Some(Utc::now());
    }
}

/// Why a reading carries no value.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingFault {
    /// The device answered with something that is not a measurement.
    Decode,
    /// The register bus exchange failed.
    Bus,
    /// The link dropped or could not be reopened.
    Offline,
}

impl fmt::Display for ReadingFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ReadingFault::*;
        match self {
            Decode => write!(f, "decode error"),
            Bus => write!(f, "bus error"),
            Offline => write!(f, "offline"),
        }
    }
}

/// The value part of a reading.
///
/// A legitimate `0.0` is a `Value`; it is never used to stand in for
/// missing or broken data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reading {
    #[default]
    NoData,
    Value(f64),
    Error(ReadingFault),
}

impl Reading {
    pub const fn value(self) -> Option<f64> {
        match self {
            Reading::Value(value) => Some(value),
            _ => None,
        }
    }

    pub const fn is_error(self) -> bool {
        matches!(self, Reading::Error(_))
    }
}

/// The latest reading of one tag.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SensorReading {
    pub tag: String,
    pub reading: Reading,
    pub observed_at: DateTime<Utc>,
}

impl SensorReading {
    pub fn new(tag: impl Into<String>, reading: Reading) -> Self {
        Self {
            tag: tag.into(),
            reading,
            observed_at: Utc::now(),
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.reading.value()
    }
}
