//! Error types for the ble-sample-monitor crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// No advertising device matched the scan filter before the scan ended.
    #[error("No device advertising {service} was found")]
    DeviceNotFound {
        /// The service UUID that was scanned for.
        service: String,
    },

    /// Operation requires a connection but the peripheral is not connected.
    #[error("Peripheral not connected")]
    NotConnected,

    /// Failed to establish a connection to the peripheral.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The connection to the peripheral was lost.
    #[error("Connection lost")]
    ConnectionLost,

    /// A notification payload could not be turned into a sample.
    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] ParseError),

    /// A scan or connect did not complete in time.
    #[error("Operation timed out")]
    Timeout,

    /// The requested operation is not supported by the peripheral.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },
}

/// Why a notification payload did not yield a number.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ParseError {
    /// The payload has no `:` separating the label from the value.
    #[error("no ':' marker in payload")]
    NoMarkerFound,

    /// A marker was found but the text after it does not start with a number.
    #[error("value after ':' is not a number")]
    NumberUnparsable,
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
