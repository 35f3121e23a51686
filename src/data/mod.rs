//! Data structures for received samples.
//!
//! This module contains the parsed sample type, the report emitted for
//! each sample, and the running extrema.

pub mod extrema;
pub mod sample;

pub use extrema::Extrema;
pub use sample::{Sample, SampleReport};
