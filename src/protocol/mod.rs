//! Notification payload protocol.
//!
//! Text payload decoding and value extraction.

pub mod payload;

pub use payload::{decode_payload, extract_value, parse_leading_float, MARKER};
