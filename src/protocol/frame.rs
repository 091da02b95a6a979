//! Frame decoding for the scale wire protocol
//!
//! A scale emits line-delimited ASCII frames of the form
//! `<prefix><sign?><digits>[.<digits>]kg`, e.g. `wn0012.34kg` on the serial
//! models and `sg0012.34kg` on the radio models. Anything else on the wire is
//! a decode failure for that one frame, never a fault.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;

/// Unit tag every valid frame ends with.
pub const UNIT_SUFFIX: &str = "kg";

/// Frame prefix emitted by serial-attached scales.
pub const SERIAL_PREFIX: &str = "wn";

/// Frame prefix emitted by radio-attached scales.
pub const RADIO_PREFIX: &str = "sg";

/// A decoded, validated weight value with its acquisition time.
///
/// Values are exact decimals: `wn0003.50kg` decodes to `3.50`, not to the
/// nearest binary float, and keeps its scale when re-rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub value: Decimal,
    pub unit: String,
    pub acquired_at: DateTime<Utc>,
}

/// Decode failures for a single frame
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("frame contains non-ASCII bytes")]
    NonAscii,
    #[error("frame missing expected prefix '{expected}': '{frame}'")]
    MissingPrefix { expected: String, frame: String },
    #[error("frame missing unit suffix '{UNIT_SUFFIX}': '{0}'")]
    MissingSuffix(String),
    #[error("frame magnitude is empty")]
    EmptyMagnitude,
    #[error("frame magnitude is not a plain decimal: '{0}'")]
    BadMagnitude(String),
}

/// Decoder for one scale model's frame dialect.
///
/// The prefix is fixed per device family, so a decoder is constructed once
/// with the prefix it expects and rejects everything else.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    prefix: String,
}

impl FrameDecoder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Decoder for the serial scale dialect (`wn...kg`).
    pub fn serial() -> Self {
        Self::new(SERIAL_PREFIX)
    }

    /// Decoder for the radio scale dialect (`sg...kg`).
    pub fn radio() -> Self {
        Self::new(RADIO_PREFIX)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Decode one raw frame into a [`Reading`].
    ///
    /// Trailing line terminators and surrounding whitespace are ignored.
    /// Total over arbitrary bytes: every malformed input maps to a
    /// [`DecodeError`] variant.
    pub fn decode(&self, frame: &[u8]) -> Result<Reading, DecodeError> {
        let text = std::str::from_utf8(frame).map_err(|_| DecodeError::NonAscii)?;
        if !text.is_ascii() {
            return Err(DecodeError::NonAscii);
        }

        let text = text.trim();
        if text.is_empty() {
            return Err(DecodeError::EmptyFrame);
        }

        let body = text
            .strip_prefix(self.prefix.as_str())
            .ok_or_else(|| DecodeError::MissingPrefix {
                expected: self.prefix.clone(),
                frame: text.to_string(),
            })?;

        let magnitude = body
            .strip_suffix(UNIT_SUFFIX)
            .ok_or_else(|| DecodeError::MissingSuffix(text.to_string()))?;

        let (negative, digits) = match magnitude.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, magnitude),
        };

        if digits.is_empty() {
            return Err(DecodeError::EmptyMagnitude);
        }

        if !is_plain_decimal(digits) {
            return Err(DecodeError::BadMagnitude(digits.to_string()));
        }

        let mut value = Decimal::from_str(digits)
            .map_err(|_| DecodeError::BadMagnitude(digits.to_string()))?;
        if negative {
            value = -value;
        }

        Ok(Reading {
            value,
            unit: UNIT_SUFFIX.to_string(),
            acquired_at: Utc::now(),
        })
    }
}

/// Strict `<digits>[.<digits>]` check: no exponent, no sign, no grouping,
/// no bare or dangling decimal point.
fn is_plain_decimal(s: &str) -> bool {
    let mut parts = s.splitn(2, '.');
    let int_part = parts.next().unwrap_or("");
    let frac_part = parts.next();

    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    match frac_part {
        None => true,
        Some(frac) => !frac.is_empty() && frac.bytes().all(|b| b.is_ascii_digit()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decode_serial(frame: &[u8]) -> Result<Reading, DecodeError> {
        FrameDecoder::serial().decode(frame)
    }

    #[test]
    fn decodes_positive_weight_exactly() {
        let reading = decode_serial(b"wn0012.34kg").unwrap();
        assert_eq!(reading.value.to_string(), "12.34");
        assert_eq!(reading.unit, "kg");
    }

    #[test]
    fn decodes_negative_weight_and_keeps_scale() {
        let reading = decode_serial(b"wn-0003.50kg").unwrap();
        // Trailing zero survives: no binary float round-trip in the path.
        assert_eq!(reading.value.to_string(), "-3.50");
    }

    #[test]
    fn decodes_exact_zero() {
        let reading = decode_serial(b"wn0000.00kg").unwrap();
        assert!(reading.value.is_zero());
        assert_eq!(reading.value.to_string(), "0.00");
    }

    #[test]
    fn decodes_integer_magnitude_without_fraction() {
        let reading = decode_serial(b"wn0050kg").unwrap();
        assert_eq!(reading.value.to_string(), "50");
    }

    #[test]
    fn trims_line_terminators_and_padding() {
        let reading = decode_serial(b"  wn0012.34kg\r\n").unwrap();
        assert_eq!(reading.value.to_string(), "12.34");
    }

    #[test]
    fn rejects_wrong_prefix() {
        let err = decode_serial(b"xx0012.34kg").unwrap_err();
        assert!(matches!(err, DecodeError::MissingPrefix { .. }));
    }

    #[test]
    fn rejects_missing_unit_suffix() {
        let err = decode_serial(b"wn0012.34").unwrap_err();
        assert!(matches!(err, DecodeError::MissingSuffix(_)));
    }

    #[test]
    fn rejects_non_numeric_magnitude() {
        let err = decode_serial(b"wn00AB.00kg").unwrap_err();
        assert!(matches!(err, DecodeError::BadMagnitude(_)));
    }

    #[test]
    fn rejects_empty_magnitude() {
        assert_eq!(decode_serial(b"wnkg"), Err(DecodeError::EmptyMagnitude));
        assert_eq!(decode_serial(b"wn-kg"), Err(DecodeError::EmptyMagnitude));
    }

    #[test]
    fn rejects_dangling_decimal_point() {
        assert!(matches!(
            decode_serial(b"wn12.kg"),
            Err(DecodeError::BadMagnitude(_))
        ));
        assert!(matches!(
            decode_serial(b"wn.34kg"),
            Err(DecodeError::BadMagnitude(_))
        ));
    }

    #[test]
    fn rejects_exponent_and_plus_sign_forms() {
        assert!(decode_serial(b"wn1e2kg").is_err());
        assert!(decode_serial(b"wn+12.34kg").is_err());
    }

    #[test]
    fn rejects_empty_and_blank_frames() {
        assert_eq!(decode_serial(b""), Err(DecodeError::EmptyFrame));
        assert_eq!(decode_serial(b"\r\n"), Err(DecodeError::EmptyFrame));
    }

    #[test]
    fn rejects_non_ascii_bytes() {
        assert_eq!(
            decode_serial(&[0xff, 0xfe, 0x01]),
            Err(DecodeError::NonAscii)
        );
        assert_eq!(
            decode_serial("wn12.34kg™".as_bytes()),
            Err(DecodeError::NonAscii)
        );
    }

    #[test]
    fn radio_decoder_uses_sg_prefix() {
        let decoder = FrameDecoder::radio();
        assert_eq!(decoder.decode(b"sg0001.25kg").unwrap().value.to_string(), "1.25");
        assert!(matches!(
            decoder.decode(b"wn0001.25kg"),
            Err(DecodeError::MissingPrefix { .. })
        ));
    }

    proptest! {
        #[test]
        fn decode_never_panics(frame in proptest::collection::vec(any::<u8>(), 0..64)) {
            // Total function: arbitrary bytes only ever produce Ok or Err.
            let _ = decode_serial(&frame);
        }

        #[test]
        fn valid_frames_decode_to_the_exact_decimal(
            int_part in "[0-9]{1,6}",
            frac_part in "[0-9]{1,4}",
        ) {
            let frame = format!("wn{int_part}.{frac_part}kg");
            let reading = decode_serial(frame.as_bytes()).unwrap();
            let expected = Decimal::from_str(&format!("{int_part}.{frac_part}")).unwrap();
            prop_assert_eq!(reading.value, expected);
        }

        #[test]
        fn leading_minus_negates_the_magnitude(
            int_part in "[0-9]{1,6}",
            frac_part in "[0-9]{1,4}",
        ) {
            let positive = decode_serial(format!("wn{int_part}.{frac_part}kg").as_bytes()).unwrap();
            let negative = decode_serial(format!("wn-{int_part}.{frac_part}kg").as_bytes()).unwrap();
            prop_assert_eq!(negative.value, -positive.value);
        }
    }
}
