//! Sample processor.
//!
//! Turns notification payloads into samples, keeps the running extrema, and
//! publishes a report for every recorded sample.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::data::{Extrema, Sample, SampleReport};
use crate::error::ParseError;
use crate::protocol::{decode_payload, extract_value};

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// What to do with a payload that does not contain a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MalformedPayloadPolicy {
    /// Record the payload as a `0.0` sample.
    #[default]
    RecordZero,
    /// Drop the payload and leave the extrema untouched.
    Skip,
}

/// Parses payloads and tracks running extrema.
pub struct SampleProcessor {
    /// Running extrema, shared with report consumers.
    extrema: Arc<RwLock<Extrema>>,
    /// Handling of malformed payloads.
    policy: MalformedPayloadPolicy,
    /// Report channel.
    report_tx: broadcast::Sender<SampleReport>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
}

impl SampleProcessor {
    /// Create a new processor with the given malformed-payload policy.
    pub fn new(policy: MalformedPayloadPolicy) -> Self {
        let (report_tx, _) = broadcast::channel(64);

        Self {
            extrema: Arc::new(RwLock::new(Extrema::new())),
            policy,
            report_tx,
            callback_counter: AtomicU64::new(0),
        }
    }

    /// Get the malformed-payload policy.
    pub fn policy(&self) -> MalformedPayloadPolicy {
        self.policy
    }

    /// Decode raw notification bytes and record the sample they carry.
    pub fn process_notification(&self, data: &[u8]) -> Result<Sample, ParseError> {
        debug!("Notification of {} bytes", data.len());
        self.parse_and_record(&decode_payload(data))
    }

    /// Parse a payload, update the extrema, and publish a report.
    ///
    /// Under [`MalformedPayloadPolicy::RecordZero`] a malformed payload is
    /// recorded as `0.0` and returned as a sample with `fault` set. Under
    /// [`MalformedPayloadPolicy::Skip`] the parse error is returned and the
    /// extrema are left untouched.
    pub fn parse_and_record(&self, payload: &str) -> Result<Sample, ParseError> {
        let sample = match extract_value(payload) {
            Ok(value) => Sample::new(payload, value),
            Err(e) => match self.policy {
                MalformedPayloadPolicy::RecordZero => {
                    warn!("Malformed payload {:?} ({}), recording 0.0", payload, e);
                    Sample::zeroed(payload, e)
                }
                MalformedPayloadPolicy::Skip => {
                    warn!("Malformed payload {:?} ({}), skipping", payload, e);
                    return Err(e);
                }
            },
        };

        let extrema = {
            let mut extrema = self.extrema.write();
            extrema.record(sample.value);
            *extrema
        };

        info!(
            raw = %sample.raw,
            value = sample.value,
            max = extrema.maximum,
            min = extrema.minimum,
            "Sample recorded"
        );

        let _ = self.report_tx.send(SampleReport {
            sample: sample.clone(),
            extrema,
        });

        Ok(sample)
    }

    /// Get a snapshot of the running extrema.
    pub fn extrema(&self) -> Extrema {
        *self.extrema.read()
    }

    /// Reseed the extrema to their opposite extremes.
    pub fn reset(&self) {
        *self.extrema.write() = Extrema::new();
        debug!("Extrema reset");
    }

    /// Subscribe to sample reports.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<SampleReport> {
        self.report_tx.subscribe()
    }

    /// Register a callback for sample reports.
    ///
    /// Must be called from within a tokio runtime.
    pub fn on_report<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&SampleReport) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.report_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(report) => callback(&report),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Report callback lagged, {} reports dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }
}

impl Default for SampleProcessor {
    fn default() -> Self {
        Self::new(MalformedPayloadPolicy::default())
    }
}

impl std::fmt::Debug for SampleProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleProcessor")
            .field("policy", &self.policy)
            .field("extrema", &self.extrema())
            .finish()
    }
}
