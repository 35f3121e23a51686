//! Client configuration.
//!
//! Everything is fixed at build time through [`ClientConfig::default`]; the
//! `with_*` methods exist so embedders and tests can tune a copy.

use std::time::Duration;
use uuid::Uuid;

use crate::ble::uuids::{CHARACTERISTIC_UUID, PREFERRED_MTU, SERVICE_UUID};
use crate::error::{Error, Result};
use crate::processor::MalformedPayloadPolicy;

/// How to choose among peripherals advertising the target service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceSelection {
    /// Take the first matching advertisement.
    #[default]
    FirstMatch,
    /// Listen for `window`, then take the candidate with the highest RSSI.
    StrongestSignal {
        /// How long to collect candidates after the first one appears.
        window: Duration,
    },
    /// Take the first candidate whose identifier is listed (case-insensitive).
    AllowList(Vec<String>),
}

/// Whether and how to start over after a failed connect or a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReconnectPolicy {
    /// Consecutive attempts allowed after a failure. Zero disables reconnection.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub backoff: Duration,
    /// Upper bound for the doubled delay.
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    /// Never reconnect.
    pub const fn disabled() -> Self {
        Self {
            max_attempts: 0,
            backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(1),
        }
    }

    /// Retry up to `max_attempts` times, doubling `backoff` up to 30 seconds.
    pub const fn with_attempts(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Check if any retry is allowed.
    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Delay before retry number `attempt` (1-based), or `None` once exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let delay = self.backoff.saturating_mul(factor);
        Some(delay.min(self.max_backoff.max(self.backoff)))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Configuration for [`SampleClient`](crate::SampleClient).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientConfig {
    /// Service the peripheral must advertise.
    pub service_uuid: Uuid,
    /// Characteristic to subscribe to within that service.
    pub characteristic_uuid: Uuid,
    /// MTU to request after connecting.
    pub preferred_mtu: u16,
    /// Candidate selection when scanning.
    pub selection: DeviceSelection,
    /// Give up scanning after this long. `None` scans until a match appears.
    pub scan_timeout: Option<Duration>,
    /// Give up connecting after this long. `None` leaves it to the platform.
    pub connect_timeout: Option<Duration>,
    /// Reconnection after failure or disconnect.
    pub reconnect: ReconnectPolicy,
    /// Reseed the extrema at the start of every session after the first.
    pub reset_extrema_on_reconnect: bool,
    /// Handling of payloads without a number.
    pub malformed_payload: MalformedPayloadPolicy,
}

impl ClientConfig {
    /// Smallest MTU allowed by the ATT protocol.
    pub const MIN_MTU: u16 = 23;

    /// Set the target service and characteristic.
    pub fn with_target(mut self, service_uuid: Uuid, characteristic_uuid: Uuid) -> Self {
        self.service_uuid = service_uuid;
        self.characteristic_uuid = characteristic_uuid;
        self
    }

    /// Set the device selection policy.
    pub fn with_selection(mut self, selection: DeviceSelection) -> Self {
        self.selection = selection;
        self
    }

    /// Set the scan timeout.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = Some(timeout);
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the reconnect policy.
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Reseed the extrema whenever a new session starts.
    pub fn with_reset_extrema_on_reconnect(mut self, reset: bool) -> Self {
        self.reset_extrema_on_reconnect = reset;
        self
    }

    /// Check if the extrema should be reseeded when session `session`
    /// (1-based) starts.
    pub fn resets_extrema_for(&self, session: u64) -> bool {
        session > 1 && self.reset_extrema_on_reconnect
    }

    /// Set the malformed-payload policy.
    pub fn with_malformed_payload(mut self, policy: MalformedPayloadPolicy) -> Self {
        self.malformed_payload = policy;
        self
    }

    /// Check the configuration for values the workflow cannot use.
    pub fn validate(&self) -> Result<()> {
        if self.service_uuid.is_nil() {
            return Err(invalid("service_uuid", self.service_uuid));
        }
        if self.characteristic_uuid.is_nil() {
            return Err(invalid("characteristic_uuid", self.characteristic_uuid));
        }
        if self.preferred_mtu < Self::MIN_MTU || self.preferred_mtu > PREFERRED_MTU {
            return Err(invalid("preferred_mtu", self.preferred_mtu));
        }
        if self.scan_timeout == Some(Duration::ZERO) {
            return Err(invalid("scan_timeout", "0s"));
        }
        if self.connect_timeout == Some(Duration::ZERO) {
            return Err(invalid("connect_timeout", "0s"));
        }
        match &self.selection {
            DeviceSelection::StrongestSignal { window } if window.is_zero() => {
                return Err(invalid("selection.window", "0s"));
            }
            DeviceSelection::AllowList(list) if list.is_empty() => {
                return Err(invalid("selection.allow_list", "[]"));
            }
            _ => {}
        }
        if self.reconnect.is_enabled() && self.reconnect.backoff.is_zero() {
            return Err(invalid("reconnect.backoff", "0s"));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID,
            characteristic_uuid: CHARACTERISTIC_UUID,
            preferred_mtu: PREFERRED_MTU,
            selection: DeviceSelection::default(),
            scan_timeout: None,
            connect_timeout: None,
            reconnect: ReconnectPolicy::default(),
            reset_extrema_on_reconnect: false,
            malformed_payload: MalformedPayloadPolicy::default(),
        }
    }
}

fn invalid(name: &str, value: impl ToString) -> Error {
    Error::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}
