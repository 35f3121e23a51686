//! Notification payload parsing.
//!
//! The peripheral sends plain text of the form `"<label>: <number>"` with no
//! length prefix or checksum. The value starts two characters after the first
//! colon; anything after the numeric prefix is ignored.

use crate::error::ParseError;

/// Label/value separator in a payload.
pub const MARKER: char = ':';

/// Decode raw notification bytes into text.
///
/// Payloads are treated as C strings: content ends at the first NUL byte.
/// Invalid UTF-8 is replaced rather than rejected.
pub fn decode_payload(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Extract the numeric value from a `"<label>: <number>"` payload.
///
/// Skips the first `:` and exactly one following character, then parses the
/// longest numeric prefix of what remains.
///
/// # Example
///
/// ```
/// use ble_sample_monitor::protocol::extract_value;
///
/// assert_eq!(extract_value("Temp: 23.5"), Ok(23.5));
/// assert_eq!(extract_value("Temp: 23.5 C"), Ok(23.5));
/// assert!(extract_value("no colon here").is_err());
/// ```
pub fn extract_value(payload: &str) -> Result<f64, ParseError> {
    let index = payload.find(MARKER).ok_or(ParseError::NoMarkerFound)?;

    let mut rest = payload[index + MARKER.len_utf8()..].chars();
    rest.next();

    parse_leading_float(rest.as_str()).ok_or(ParseError::NumberUnparsable)
}

/// Parse the longest floating-point prefix of `text`.
///
/// Accepts leading ASCII whitespace, an optional sign, digits with an optional
/// fractional part, an optional exponent, and `inf`/`infinity`/`nan` in any
/// case. Returns `None` when no digits are found.
pub fn parse_leading_float(text: &str) -> Option<f64> {
    let text = text.trim_start_matches(|c: char| c.is_ascii_whitespace());
    let bytes = text.as_bytes();
    let mut end = 0;

    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end += 1;
    }

    if let Some(special) = parse_special(&text[end..]) {
        return Some(if bytes.first() == Some(&b'-') {
            -special
        } else {
            special
        });
    }

    let int_digits = count_digits(&bytes[end..]);
    end += int_digits;

    let mut frac_digits = 0;
    if bytes.get(end) == Some(&b'.') {
        frac_digits = count_digits(&bytes[end + 1..]);
        if int_digits > 0 || frac_digits > 0 {
            end += 1 + frac_digits;
        }
    }

    if int_digits == 0 && frac_digits == 0 {
        return None;
    }

    // Exponent only counts when at least one digit follows it.
    if matches!(bytes.get(end), Some(b'e') | Some(b'E')) {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+') | Some(b'-')) {
            exp_end += 1;
        }
        let exp_digits = count_digits(&bytes[exp_end.min(bytes.len())..]);
        if exp_digits > 0 {
            end = exp_end + exp_digits;
        }
    }

    text[..end].parse::<f64>().ok()
}

fn count_digits(bytes: &[u8]) -> usize {
    bytes.iter().take_while(|b| b.is_ascii_digit()).count()
}

fn parse_special(text: &str) -> Option<f64> {
    let lower: String = text
        .chars()
        .take(8)
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if lower.starts_with("inf") {
        Some(f64::INFINITY)
    } else if lower.starts_with("nan") {
        Some(f64::NAN)
    } else {
        None
    }
}
