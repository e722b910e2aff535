use super::*;

pub mod rtu;

use serde::Deserialize;

/// Register table addressed by a read request.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    #[default]
    Input,
    Holding,
}

/// A contiguous block of registers on one addressed device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegisterRequest {
    pub kind: RegisterKind,
    pub slave: u8,
    pub start: u16,
    pub count: u16,
}

impl RegisterRequest {
    pub const fn input(slave: u8, start: u16, count: u16) -> Self {
        Self {
            kind: RegisterKind::Input,
            slave,
            start,
            count,
        }
    }

    pub const fn holding(slave: u8, start: u16, count: u16) -> Self {
        Self {
            kind: RegisterKind::Holding,
            slave,
            start,
            count,
        }
    }
}

/// Dissolved-oxygen transducer: loop current in µA in a single input register.
pub const OXYGEN_SLAVE_ADDR: u8 = 0x05;
pub const OXYGEN_REG_START: u16 = 0x0007;
pub const OXYGEN_REG_COUNT: u16 = 0x0001;

/// Converts the raw register (µA) into mA.
pub const OXYGEN_SCALE: f64 = 0.001;

/// Field calibration of the oxygen transducer: mA to percent saturation.
pub const OXYGEN_CALIBRATION: [(f64, f64); 3] = [(1.592, 0.0), (5.425, 10.475), (8.34, 20.95)];

pub const OXYGEN_REQUEST: RegisterRequest =
    RegisterRequest::input(OXYGEN_SLAVE_ADDR, OXYGEN_REG_START, OXYGEN_REG_COUNT);

/// Decode the leading register of a block as an unsigned value times `scale`.
pub fn decode_scaled_from_registers(input: &[u16], scale: f64) -> DecodeResult<f64> {
    let raw = input.first().ok_or(DecodeError::InsufficientInput)?;
    let value = f64::from(*raw) * scale;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(DecodeError::InvalidData)
    }
}
