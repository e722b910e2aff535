//! Decoding of ASCII measurement lines.

use super::{DecodeError, DecodeResult};

/// Parse a single numeric measurement from a line of text.
///
/// Surrounding whitespace and line terminators are ignored. Anything that
/// is not a finite number is rejected, an empty line included.
pub fn decode_measurement_line(line: &str) -> DecodeResult<f64> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::InsufficientInput);
    }
    let value = trimmed
        .parse::<f64>()
        .map_err(|_| DecodeError::InvalidInput)?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(DecodeError::InvalidData)
    }
}
