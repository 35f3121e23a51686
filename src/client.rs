//! Client workflow.
//!
//! Owns the scan → connect → subscribe → stream loop. Discovery results,
//! notifications, disconnects and shutdown requests all arrive as channel or
//! stream events consumed by this one loop, so no state is shared through
//! ad-hoc flags.

use btleplug::api::{Central as _, CentralEvent, Peripheral as _, ValueNotification};
use btleplug::platform::PeripheralId;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, Stream, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ble::connection::{ConnectionEvent, ConnectionManager, ConnectionState, StateTracker};
use crate::ble::peripheral::{GattPeripheral, NotificationStream};
use crate::ble::scanner::BleScanner;
use crate::config::{ClientConfig, ReconnectPolicy};
use crate::error::Result;
use crate::processor::SampleProcessor;

/// Raw notification as received from the peripheral.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    /// UUID of the characteristic that sent the notification.
    pub characteristic_uuid: Uuid,
    /// The notification data.
    pub data: Bytes,
    /// Time of receipt.
    pub received_at: DateTime<Utc>,
}

/// Why a streaming session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The transport reported a disconnect.
    Disconnected,
    /// The notification stream closed.
    StreamEnded,
    /// Shutdown was requested.
    Shutdown,
}

/// Scans for the sensor, keeps one subscription alive, and feeds every
/// notification to a [`SampleProcessor`].
pub struct SampleClient {
    /// Workflow configuration.
    config: ClientConfig,
    /// BLE scanner.
    scanner: Arc<BleScanner>,
    /// Sample processor.
    processor: Arc<SampleProcessor>,
    /// Shared workflow state.
    state: StateTracker,
    /// Raw notification channel.
    notification_tx: broadcast::Sender<NotificationEvent>,
    /// Shutdown signal.
    shutdown_tx: watch::Sender<bool>,
    /// Number of sessions that reached `Subscribed`.
    sessions: AtomicU64,
}

impl SampleClient {
    /// Create a client on the first available Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or Bluetooth is not
    /// available.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let scanner = BleScanner::new().await?;
        Self::with_scanner(scanner, config)
    }

    /// Create a client around an existing scanner.
    pub fn with_scanner(scanner: BleScanner, config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let (notification_tx, _) = broadcast::channel(256);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            processor: Arc::new(SampleProcessor::new(config.malformed_payload)),
            config,
            scanner: Arc::new(scanner),
            state: StateTracker::new(),
            notification_tx,
            shutdown_tx,
            sessions: AtomicU64::new(0),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Get the sample processor.
    pub fn processor(&self) -> &Arc<SampleProcessor> {
        &self.processor
    }

    /// Get the current workflow state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Check if notifications are flowing.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to workflow state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.state.subscribe()
    }

    /// Subscribe to raw notifications.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<NotificationEvent> {
        self.notification_tx.subscribe()
    }

    /// Get the number of sessions that reached `Subscribed`.
    pub fn session_count(&self) -> u64 {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Run the workflow until shutdown or until the reconnect policy gives up.
    ///
    /// Failures are logged and never end the process; when the policy is
    /// exhausted the client is left idle and this returns `Ok(())`.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut retries = RetrySchedule::new(self.config.reconnect);

        loop {
            let subscribed = match self.run_once(&mut shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(end) => {
                    info!("Session ended: {:?}", end);
                    true
                }
                Err(e) => {
                    error!("Connect workflow failed: {}", e);
                    false
                }
            };

            let delay = match retries.after_run(subscribed) {
                Some(delay) => delay,
                None => {
                    info!("Not reconnecting; there is nothing more we will do");
                    break;
                }
            };

            info!(
                "Retrying in {:?} (attempt {} of {})",
                delay,
                retries.attempt(),
                self.config.reconnect.max_attempts
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        debug!("Workflow loop ended in state {}", self.state());
        Ok(())
    }

    /// Ask the workflow loop to stop and stop any scan in progress.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down sample client");

        self.shutdown_tx.send_replace(true);
        self.scanner.stop_scanning().await
    }

    /// One scan, connect and session.
    ///
    /// `Ok` means the subscription was established and the session ran.
    async fn run_once(&self, shutdown: &mut watch::Receiver<bool>) -> Result<SessionEnd> {
        self.state.set(ConnectionState::Scanning);

        let found = tokio::select! {
            found = self.scanner.find_device(&self.config) => found,
            _ = wait_for_shutdown(shutdown) => {
                self.state.set(ConnectionState::Idle);
                return Ok(SessionEnd::Shutdown);
            }
        };

        let event = found.map_err(|e| {
            self.state.set(ConnectionState::Idle);
            e
        })?;

        let peripheral_id = event.peripheral.id();
        let central_events = self.scanner.adapter().events().await.map_err(|e| {
            self.state.set(ConnectionState::Idle);
            e
        })?;

        let manager = ConnectionManager::new(event.peripheral, &self.config, self.state.clone());
        let notifications = match connect_unless_shutdown(&manager, shutdown).await? {
            Some(notifications) => notifications,
            None => return Ok(SessionEnd::Shutdown),
        };

        let sessions = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        info!("We are now connected to the BLE server (session {})", sessions);

        if self.config.resets_extrema_for(sessions) {
            info!("Resetting extrema for new session");
            self.processor.reset();
        }

        let end = run_session(
            notifications,
            disconnected(central_events, peripheral_id),
            shutdown,
            &self.processor,
            &self.notification_tx,
        )
        .await;

        match end {
            SessionEnd::Shutdown => {
                if let Err(e) = manager.disconnect().await {
                    warn!("Disconnect on shutdown failed: {}", e);
                }
            }
            SessionEnd::Disconnected | SessionEnd::StreamEnded => manager.handle_disconnection(),
        }

        Ok(end)
    }
}

impl std::fmt::Debug for SampleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleClient")
            .field("state", &self.state())
            .field("sessions", &self.session_count())
            .field("processor", &self.processor)
            .finish()
    }
}

/// Retry bookkeeping for [`SampleClient::run`].
#[derive(Debug, Clone)]
struct RetrySchedule {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl RetrySchedule {
    fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next run, or `None` once the policy is exhausted.
    ///
    /// A run that reached `Subscribed` starts the count over.
    fn after_run(&mut self, subscribed: bool) -> Option<Duration> {
        if subscribed {
            self.attempt = 0;
        }
        self.attempt = self.attempt.saturating_add(1);
        self.policy.delay_for(self.attempt)
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Connect and subscribe, giving up if shutdown is requested first.
///
/// Returns `Ok(None)` when shutdown won; the peripheral is then disconnected
/// and the state is `Idle`.
async fn connect_unless_shutdown<P: GattPeripheral>(
    manager: &ConnectionManager<P>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<NotificationStream>> {
    tokio::select! {
        result = manager.connect_and_subscribe() => result.map(Some),
        _ = wait_for_shutdown(shutdown) => {
            info!("Shutdown requested while connecting");
            if let Err(e) = manager.disconnect().await {
                warn!("Disconnect on shutdown failed: {}", e);
            }
            Ok(None)
        }
    }
}

/// Feed notifications to the processor until the session ends.
///
/// Each notification is broadcast raw on `notification_tx` and then parsed.
pub async fn run_session<S, D>(
    mut notifications: S,
    disconnected: D,
    shutdown: &mut watch::Receiver<bool>,
    processor: &SampleProcessor,
    notification_tx: &broadcast::Sender<NotificationEvent>,
) -> SessionEnd
where
    S: Stream<Item = ValueNotification> + Unpin,
    D: Future<Output = ()>,
{
    tokio::pin!(disconnected);

    loop {
        tokio::select! {
            notification = notifications.next() => {
                let notification = match notification {
                    Some(notification) => notification,
                    None => return SessionEnd::StreamEnded,
                };

                let data = Bytes::from(notification.value);
                debug!(
                    "Notify callback for characteristic {} of data length {}",
                    notification.uuid,
                    data.len()
                );

                let _ = notification_tx.send(NotificationEvent {
                    characteristic_uuid: notification.uuid,
                    data: data.clone(),
                    received_at: Utc::now(),
                });

                if let Err(e) = processor.process_notification(&data) {
                    debug!("Notification skipped: {}", e);
                }
            }
            _ = &mut disconnected => return SessionEnd::Disconnected,
            _ = wait_for_shutdown(shutdown) => return SessionEnd::Shutdown,
        }
    }
}

/// Resolve once shutdown has been requested.
///
/// Never resolves if the sender is gone without having requested shutdown.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let requested = *shutdown.borrow();
        if requested {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Resolve when the adapter reports `id` as disconnected.
async fn disconnected(mut events: BoxStream<'static, CentralEvent>, id: PeripheralId) {
    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDisconnected(disconnected_id) = event {
            if disconnected_id == id {
                return;
            }
        }
    }

    warn!("Adapter event stream ended; disconnects will surface as stream end");
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::peripheral::testing::StalledPeripheral;
    use crate::ble::uuids::CHARACTERISTIC_UUID;
    use pretty_assertions::assert_eq;
    use tokio_test::{assert_pending, assert_ready};

    fn notification(value: &[u8]) -> ValueNotification {
        ValueNotification {
            uuid: CHARACTERISTIC_UUID,
            value: value.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_session_processes_until_stream_ends() {
        let processor = SampleProcessor::default();
        let (notification_tx, mut raw_rx) = broadcast::channel(16);
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let stream = futures::stream::iter(vec![
            notification(b"Temp: 23.5"),
            notification(b"Temp: 19.1"),
            notification(b"Temp: 30.0"),
        ]);

        let end = run_session(
            stream,
            std::future::pending::<()>(),
            &mut shutdown_rx,
            &processor,
            &notification_tx,
        )
        .await;

        assert_eq!(end, SessionEnd::StreamEnded);
        assert_eq!(processor.extrema().bounds(), Some((19.1, 30.0)));
        assert_eq!(processor.extrema().count, 3);

        let first = raw_rx.try_recv().unwrap();
        assert_eq!(first.characteristic_uuid, CHARACTERISTIC_UUID);
        assert_eq!(&first.data[..], b"Temp: 23.5");
    }

    #[tokio::test]
    async fn test_session_ends_on_disconnect() {
        let processor = SampleProcessor::default();
        let (notification_tx, _) = broadcast::channel(16);
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let end = run_session(
            futures::stream::pending::<ValueNotification>(),
            std::future::ready(()),
            &mut shutdown_rx,
            &processor,
            &notification_tx,
        )
        .await;

        assert_eq!(end, SessionEnd::Disconnected);
        assert!(processor.extrema().is_empty());
    }

    #[tokio::test]
    async fn test_session_ends_on_shutdown() {
        let processor = SampleProcessor::default();
        let (notification_tx, _) = broadcast::channel(16);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        shutdown_tx.send_replace(true);

        let end = run_session(
            futures::stream::pending::<ValueNotification>(),
            std::future::pending::<()>(),
            &mut shutdown_rx,
            &processor,
            &notification_tx,
        )
        .await;

        assert_eq!(end, SessionEnd::Shutdown);
    }

    #[tokio::test]
    async fn test_session_survives_malformed_payloads() {
        let processor = SampleProcessor::new(crate::MalformedPayloadPolicy::Skip);
        let (notification_tx, _) = broadcast::channel(16);
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let stream = futures::stream::iter(vec![
            notification(b"garbage"),
            notification(b"Temp: 4.0"),
        ]);

        let end = run_session(
            stream,
            std::future::pending::<()>(),
            &mut shutdown_rx,
            &processor,
            &notification_tx,
        )
        .await;

        assert_eq!(end, SessionEnd::StreamEnded);
        assert_eq!(processor.extrema().bounds(), Some((4.0, 4.0)));
    }

    #[test]
    fn test_wait_for_shutdown_wakes_on_signal() {
        let (tx, mut rx) = watch::channel(false);
        let mut waiter = tokio_test::task::spawn(wait_for_shutdown(&mut rx));

        assert_pending!(waiter.poll());
        tx.send_replace(true);
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
    }

    #[test]
    fn test_wait_for_shutdown_pends_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);

        let mut waiter = tokio_test::task::spawn(wait_for_shutdown(&mut rx));
        assert_pending!(waiter.poll());
    }

    #[test]
    fn test_default_policy_stops_after_first_failure() {
        let mut retries = RetrySchedule::new(ReconnectPolicy::default());
        assert_eq!(retries.after_run(false), None);
    }

    #[test]
    fn test_default_policy_stops_after_session_ends() {
        let mut retries = RetrySchedule::new(ReconnectPolicy::default());
        assert_eq!(retries.after_run(true), None);
    }

    #[test]
    fn test_two_retries_give_three_attempts() {
        let policy = ReconnectPolicy::with_attempts(2, Duration::from_secs(1));
        let mut retries = RetrySchedule::new(policy);

        // First attempt has already run when after_run is called.
        assert_eq!(retries.after_run(false), Some(Duration::from_secs(1)));
        assert_eq!(retries.after_run(false), Some(Duration::from_secs(2)));
        assert_eq!(retries.after_run(false), None);
    }

    #[test]
    fn test_successful_session_resets_attempts() {
        let policy = ReconnectPolicy::with_attempts(2, Duration::from_secs(1));
        let mut retries = RetrySchedule::new(policy);

        retries.after_run(false);
        retries.after_run(false);
        assert_eq!(retries.attempt(), 2);

        assert_eq!(retries.after_run(true), Some(Duration::from_secs(1)));
        assert_eq!(retries.attempt(), 1);
        assert_eq!(retries.after_run(false), Some(Duration::from_secs(2)));
        assert_eq!(retries.after_run(false), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_stalled_connect() {
        let state = StateTracker::new();
        let manager = ConnectionManager::new(
            StalledPeripheral::default(),
            &ClientConfig::default(),
            state.clone(),
        );
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let connect = connect_unless_shutdown(&manager, &mut shutdown_rx);
        tokio::pin!(connect);

        assert!(tokio::time::timeout(Duration::from_secs(60), &mut connect)
            .await
            .is_err());
        assert_eq!(state.get(), ConnectionState::Connecting);

        shutdown_tx.send_replace(true);
        let result = connect.await.unwrap();

        assert!(result.is_none());
        assert_eq!(state.get(), ConnectionState::Idle);
        assert_eq!(manager.peripheral().disconnect_count(), 1);
    }
}
