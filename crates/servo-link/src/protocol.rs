//! Host/device wire format.
//!
//! Host sends [`BEGIN_EXCHANGE`], waits for the device's [`READY_BANNER`]
//! line, then sends gain and setpoint as decimal text fields. The device
//! answers a completed run with one `"<elapsed_ms>,<position>"` line per tick.

use servo_core::ControlSample;
use thiserror::Error;

/// Control byte that opens a parameter exchange.
pub const BEGIN_EXCHANGE: u8 = 0x04;
/// Line the device sends once it has seen [`BEGIN_EXCHANGE`]. Contains no
/// separator, so it is never mistaken for a telemetry record.
pub const READY_BANNER: &str = "READY";
/// Longest accepted parameter field, terminator excluded.
pub const MAX_FIELD_LEN: usize = 10;
pub const FIELD_TERMINATOR: u8 = b'\n';
pub const RECORD_SEPARATOR: char = ',';
pub const DEFAULT_BAUD: u32 = 115_200;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("field is not valid UTF-8")]
    Encoding,
    #[error("field is empty")]
    Empty,
    #[error("field is {len} bytes, limit is {}", MAX_FIELD_LEN)]
    TooLong { len: usize },
    #[error("'{text}' is not a decimal number")]
    InvalidNumber { text: String },
    #[error("'{text}' is not a finite number")]
    NonFinite { text: String },
    #[error("record '{line}' has no '{}' separator", RECORD_SEPARATOR)]
    MissingSeparator { line: String },
    #[error("record '{line}' has an invalid {field} field")]
    InvalidField { line: String, field: &'static str },
}

/// Decode one parameter field as sent by the host: UTF-8, surrounding
/// whitespace ignored, finite decimal number.
pub fn parse_parameter(field: &[u8]) -> Result<f64, ProtocolError> {
    if field.len() > MAX_FIELD_LEN {
        return Err(ProtocolError::TooLong { len: field.len() });
    }
    let text = std::str::from_utf8(field).map_err(|_| ProtocolError::Encoding)?;
    let text = text.trim();
    if text.is_empty() {
        return Err(ProtocolError::Empty);
    }
    let value: f64 = text.parse().map_err(|_| ProtocolError::InvalidNumber {
        text: text.to_string(),
    })?;
    if !value.is_finite() {
        return Err(ProtocolError::NonFinite {
            text: text.to_string(),
        });
    }
    Ok(value)
}

/// Encode a parameter as a terminated field, refusing values whose text
/// would not fit the device's field limit.
pub fn encode_parameter(value: f64) -> Result<Vec<u8>, ProtocolError> {
    let text = format_decimal(value);
    if !value.is_finite() {
        return Err(ProtocolError::NonFinite { text });
    }
    if text.len() > MAX_FIELD_LEN {
        return Err(ProtocolError::TooLong { len: text.len() });
    }
    let mut field = text.into_bytes();
    field.push(FIELD_TERMINATOR);
    Ok(field)
}

/// Shortest text that parses back to `value`, always with a fractional part
/// for integral values: `120.0`, not `120`.
pub fn format_decimal(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

/// Telemetry record text, without line terminator.
pub fn format_sample(sample: &ControlSample) -> String {
    format!(
        "{}{}{}",
        format_decimal(sample.elapsed_time),
        RECORD_SEPARATOR,
        format_decimal(sample.position)
    )
}

pub fn parse_sample(line: &str) -> Result<ControlSample, ProtocolError> {
    let line = line.trim();
    let (time, position) =
        line.split_once(RECORD_SEPARATOR)
            .ok_or_else(|| ProtocolError::MissingSeparator {
                line: line.to_string(),
            })?;
    let field = |text: &str, name: &'static str| -> Result<f64, ProtocolError> {
        text.trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ProtocolError::InvalidField {
                line: line.to_string(),
                field: name,
            })
    };
    Ok(ControlSample {
        elapsed_time: field(time, "time")?,
        position: field(position, "position")?,
    })
}
