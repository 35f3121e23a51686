// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-sample-monitor
//!
//! A Bluetooth Low Energy central that finds a peripheral advertising a known
//! sensor service, subscribes to its sample characteristic, and turns every
//! `"<label>: <number>"` notification into a sample while tracking the running
//! minimum and maximum.
//!
//! ## Features
//!
//! - **Discovery**: scan for the service UUID with a configurable selection
//!   policy (first match, strongest signal, or allow-list)
//! - **Subscription**: connect, resolve the characteristic, read it once, and
//!   subscribe to notifications
//! - **Sample processing**: permissive numeric parsing with explicit
//!   [`ParseError`]s and a policy for malformed payloads
//! - **Running extrema**: lock-guarded min/max shared with report subscribers
//! - **Reconnection**: optional retry with exponential backoff
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_sample_monitor::{ClientConfig, Result, SampleClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = SampleClient::new(ClientConfig::default()).await?;
//!
//!     let _handle = client.processor().on_report(|report| {
//!         println!("{}", report);
//!     });
//!
//!     client.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data and config types

// Public modules
pub mod ble;
pub mod client;
pub mod config;
pub mod data;
pub mod error;
pub mod processor;
pub mod protocol;

// Re-exports for convenience
pub use client::{NotificationEvent, SampleClient, SessionEnd};
pub use config::{ClientConfig, DeviceSelection, ReconnectPolicy};
pub use error::{Error, ParseError, Result};
pub use processor::{CallbackHandle, MalformedPayloadPolicy, SampleProcessor};

pub use ble::connection::ConnectionState;
pub use ble::uuids::{CHARACTERISTIC_UUID, SERVICE_UUID};
pub use data::{Extrema, Sample, SampleReport};
