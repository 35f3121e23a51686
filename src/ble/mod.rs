//! BLE communication module.
//!
//! This module wraps the platform BLE stack: scanning for the sensor,
//! connecting to it, and subscribing to its sample characteristic.

pub mod connection;
pub mod peripheral;
pub mod scanner;
pub mod uuids;

pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, StateTracker};
pub use peripheral::{GattPeripheral, NotificationStream};
pub use scanner::{BleScanner, DiscoveryEvent, ScanCandidate};
pub use uuids::*;
