use serde::Deserialize;
use serialport::{DataBits, FlowControl, Parity, StopBits};

pub const BAUD_RATE: u32 = 9600;
pub const DATA_BITS: DataBits = DataBits::Eight;
pub const STOP_BITS: StopBits = StopBits::One;
pub const PARITY: Parity = Parity::None;
pub const FLOW_CONTROL: FlowControl = FlowControl::None;

/// Byte framing of an RTU serial line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Framing {
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for Framing {
    fn default() -> Self {
        Self {
            data_bits: DATA_BITS,
            parity: PARITY,
            stop_bits: STOP_BITS,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParitySetting {
    #[default]
    None,
    Even,
    Odd,
}

impl From<ParitySetting> for Parity {
    fn from(from: ParitySetting) -> Self {
        match from {
            ParitySetting::None => Parity::None,
            ParitySetting::Even => Parity::Even,
            ParitySetting::Odd => Parity::Odd,
        }
    }
}

pub fn data_bits_from_u8(bits: u8) -> Option<DataBits> {
    match bits {
        5 => Some(DataBits::Five),
        6 => Some(DataBits::Six),
        7 => Some(DataBits::Seven),
        8 => Some(DataBits::Eight),
        _ => None,
    }
}

pub fn stop_bits_from_u8(bits: u8) -> Option<StopBits> {
    match bits {
        1 => Some(StopBits::One),
        2 => Some(StopBits::Two),
        _ => None,
    }
}
