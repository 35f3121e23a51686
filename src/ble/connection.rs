//! BLE connection management.
//!
//! Connects to the chosen peripheral, resolves the sample characteristic,
//! and subscribes to its notifications.

use btleplug::api::{CharPropFlags, Characteristic};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ble::peripheral::{GattPeripheral, NotificationStream};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::decode_payload;

/// Workflow state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Nothing in progress.
    #[default]
    Idle,
    /// Looking for a peripheral advertising the service.
    Scanning,
    /// Connecting and resolving the characteristic.
    Connecting,
    /// Notifications are flowing.
    Subscribed,
    /// The last connect attempt failed.
    Failed,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Subscribed)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Scanning | Self::Connecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Subscribed => write!(f, "Subscribed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    /// Previous state.
    pub from: ConnectionState,
    /// The new connection state.
    pub state: ConnectionState,
}

/// Shared, lock-guarded connection state with change notifications.
#[derive(Debug, Clone)]
pub struct StateTracker {
    state: Arc<RwLock<ConnectionState>>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl StateTracker {
    /// Create a tracker in the `Idle` state.
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(16);

        Self {
            state: Arc::new(RwLock::new(ConnectionState::Idle)),
            event_tx,
        }
    }

    /// Get the current state.
    pub fn get(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Update the state and emit an event if it changed.
    pub fn set(&self, new_state: ConnectionState) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };

        if old_state != new_state {
            debug!("Connection state changed: {} -> {}", old_state, new_state);

            let _ = self.event_tx.send(ConnectionEvent {
                from: old_state,
                state: new_state,
            });
        }
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives one connect-and-subscribe attempt against a peripheral.
pub struct ConnectionManager<P: GattPeripheral> {
    /// The peripheral to manage.
    peripheral: P,
    /// Service to resolve.
    service_uuid: Uuid,
    /// Characteristic to subscribe to.
    characteristic_uuid: Uuid,
    /// MTU requested after connecting.
    preferred_mtu: u16,
    /// Optional bound on the transport connect.
    connect_timeout: Option<Duration>,
    /// Shared workflow state.
    state: StateTracker,
    /// The characteristic once resolved.
    characteristic: RwLock<Option<Characteristic>>,
}

impl<P: GattPeripheral> ConnectionManager<P> {
    /// Create a new connection manager for a peripheral.
    pub fn new(peripheral: P, config: &ClientConfig, state: StateTracker) -> Self {
        Self {
            peripheral,
            service_uuid: config.service_uuid,
            characteristic_uuid: config.characteristic_uuid,
            preferred_mtu: config.preferred_mtu,
            connect_timeout: config.connect_timeout,
            state,
            characteristic: RwLock::new(None),
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Check if notifications are flowing.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Get the peripheral.
    pub fn peripheral(&self) -> &P {
        &self.peripheral
    }

    /// Get the resolved characteristic, if any.
    pub fn characteristic(&self) -> Option<Characteristic> {
        self.characteristic.read().clone()
    }

    /// Connect, resolve the characteristic, and subscribe to it.
    ///
    /// On success the returned stream yields notifications from the target
    /// characteristic only. On failure the peripheral is disconnected, the
    /// state is `Failed`, and nothing is retried here.
    pub async fn connect_and_subscribe(&self) -> Result<NotificationStream> {
        if self.state().is_connected() {
            return Err(Error::ConnectionFailed {
                reason: "Already subscribed".to_string(),
            });
        }

        self.state.set(ConnectionState::Connecting);
        info!("Forming a connection to {}", self.peripheral.identifier());

        if let Err(e) = self.connect_transport().await {
            error!("Connection to {} failed: {}", self.peripheral.identifier(), e);
            self.state.set(ConnectionState::Failed);
            return Err(e);
        }
        debug!("Connected to {}", self.peripheral.identifier());

        match self.resolve_and_subscribe().await {
            Ok(stream) => {
                self.state.set(ConnectionState::Subscribed);
                info!(
                    "Subscribed to {} on {}",
                    self.characteristic_uuid,
                    self.peripheral.identifier()
                );
                Ok(stream)
            }
            Err(e) => {
                error!("{}; disconnecting", e);
                if let Err(disconnect_err) = self.peripheral.disconnect().await {
                    warn!("Disconnect after failure also failed: {}", disconnect_err);
                }
                *self.characteristic.write() = None;
                self.state.set(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    /// Disconnect from the peripheral.
    pub async fn disconnect(&self) -> Result<()> {
        *self.characteristic.write() = None;

        let result = self.peripheral.disconnect().await;
        self.state.set(ConnectionState::Idle);

        match result {
            Ok(()) => {
                info!("Disconnected from {}", self.peripheral.identifier());
                Ok(())
            }
            Err(e) => {
                error!("Failed to disconnect: {}", e);
                Err(e)
            }
        }
    }

    /// Handle a disconnection reported by the transport.
    pub fn handle_disconnection(&self) {
        *self.characteristic.write() = None;
        self.state.set(ConnectionState::Idle);
        warn!(
            "{}: {}",
            Error::ConnectionLost,
            self.peripheral.identifier()
        );
    }

    async fn connect_transport(&self) -> Result<()> {
        let connect = self.peripheral.connect();

        let result = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| Error::Timeout)?,
            None => connect.await,
        };

        result.map_err(|e| match e {
            Error::Timeout => Error::Timeout,
            other => Error::ConnectionFailed {
                reason: other.to_string(),
            },
        })
    }

    async fn resolve_and_subscribe(&self) -> Result<NotificationStream> {
        // MTU exchange is performed by the platform stack during connection.
        debug!("Requesting MTU {}", self.preferred_mtu);

        self.peripheral.discover_services().await?;

        let characteristic = self.find_characteristic()?;
        debug!(
            "Found characteristic {}, properties: {:?}",
            characteristic.uuid, characteristic.properties
        );

        if characteristic.properties.contains(CharPropFlags::READ) {
            match self.peripheral.read(&characteristic).await {
                Ok(value) => info!(
                    "The characteristic value was: {}",
                    decode_payload(&value)
                ),
                Err(e) => warn!("Initial read of {} failed: {}", characteristic.uuid, e),
            }
        }

        if !characteristic
            .properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
        {
            return Err(Error::NotSupported {
                operation: format!("notifications on {}", characteristic.uuid),
            });
        }

        self.peripheral.subscribe(&characteristic).await?;
        let notifications = self.peripheral.notifications().await?;

        let uuid = characteristic.uuid;
        *self.characteristic.write() = Some(characteristic);

        Ok(notifications
            .filter(move |notification| futures::future::ready(notification.uuid == uuid))
            .boxed())
    }

    fn find_characteristic(&self) -> Result<Characteristic> {
        let services = self.peripheral.services();

        let service = services
            .iter()
            .find(|service| service.uuid == self.service_uuid)
            .ok_or_else(|| Error::ServiceNotFound {
                uuid: self.service_uuid.to_string(),
            })?;
        debug!("Found service {}", service.uuid);

        service
            .characteristics
            .iter()
            .find(|characteristic| characteristic.uuid == self.characteristic_uuid)
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: self.characteristic_uuid.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::peripheral::testing::StalledPeripheral;
    use crate::ble::peripheral::MockGattPeripheral;
    use crate::ble::uuids::{CHARACTERISTIC_UUID, SERVICE_UUID};
    use btleplug::api::{Service, ValueNotification};
    use std::collections::BTreeSet;

    fn characteristic(uuid: Uuid, properties: CharPropFlags) -> Characteristic {
        Characteristic {
            uuid,
            service_uuid: SERVICE_UUID,
            properties,
            descriptors: BTreeSet::new(),
        }
    }

    fn service(uuid: Uuid, characteristics: Vec<Characteristic>) -> Service {
        Service {
            uuid,
            primary: true,
            characteristics: characteristics.into_iter().collect(),
        }
    }

    fn notification(uuid: Uuid, value: &[u8]) -> ValueNotification {
        ValueNotification {
            uuid,
            value: value.to_vec(),
        }
    }

    fn mock_with_services(services: Vec<Service>) -> MockGattPeripheral {
        let mut mock = MockGattPeripheral::new();
        mock.expect_identifier()
            .returning(|| "AA:BB:CC:DD:EE:FF".to_string());
        mock.expect_connect().times(1).returning(|| Ok(()));
        mock.expect_discover_services().returning(|| Ok(()));
        mock.expect_services().returning(move || services.clone());
        mock
    }

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Idle.is_connected());
        assert!(ConnectionState::Subscribed.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Failed.is_connected());

        assert!(ConnectionState::Scanning.is_transitioning());
        assert!(ConnectionState::Connecting.is_transitioning());
        assert!(!ConnectionState::Subscribed.is_transitioning());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Subscribed), "Subscribed");
        assert_eq!(format!("{}", ConnectionState::Idle), "Idle");
    }

    #[test]
    fn test_state_tracker_emits_only_changes() {
        let tracker = StateTracker::new();
        let mut rx = tracker.subscribe();

        tracker.set(ConnectionState::Scanning);
        tracker.set(ConnectionState::Scanning);
        tracker.set(ConnectionState::Connecting);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.from, ConnectionState::Idle);
        assert_eq!(first.state, ConnectionState::Scanning);
        assert_eq!(rx.try_recv().unwrap().state, ConnectionState::Connecting);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_service_fails_and_disconnects() {
        let mut mock = mock_with_services(vec![service(Uuid::from_u128(0x180a), vec![])]);
        mock.expect_disconnect().times(1).returning(|| Ok(()));
        mock.expect_subscribe().never();

        let manager = ConnectionManager::new(mock, &ClientConfig::default(), StateTracker::new());
        let result = manager.connect_and_subscribe().await;

        assert!(matches!(result, Err(Error::ServiceNotFound { .. })));
        assert!(!manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(manager.characteristic().is_none());
    }

    #[tokio::test]
    async fn test_missing_characteristic_fails_and_disconnects() {
        let other = characteristic(Uuid::from_u128(0x2a37), CharPropFlags::NOTIFY);
        let mut mock = mock_with_services(vec![service(SERVICE_UUID, vec![other])]);
        mock.expect_disconnect().times(1).returning(|| Ok(()));

        let manager = ConnectionManager::new(mock, &ClientConfig::default(), StateTracker::new());
        let result = manager.connect_and_subscribe().await;

        assert!(matches!(result, Err(Error::CharacteristicNotFound { .. })));
        assert!(!manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_transport_failure_is_reported() {
        let mut mock = MockGattPeripheral::new();
        mock.expect_identifier()
            .returning(|| "AA:BB:CC:DD:EE:FF".to_string());
        mock.expect_connect().returning(|| Err(Error::NotConnected));
        mock.expect_discover_services().never();

        let manager = ConnectionManager::new(mock, &ClientConfig::default(), StateTracker::new());
        let result = manager.connect_and_subscribe().await;

        assert!(matches!(result, Err(Error::ConnectionFailed { .. })));
        assert_eq!(manager.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_characteristic_without_notify_is_rejected() {
        let target = characteristic(CHARACTERISTIC_UUID, CharPropFlags::READ);
        let mut mock = mock_with_services(vec![service(SERVICE_UUID, vec![target])]);
        mock.expect_read()
            .returning(|_| Ok(b"Temp: 20.0".to_vec()));
        mock.expect_disconnect().times(1).returning(|| Ok(()));
        mock.expect_subscribe().never();

        let manager = ConnectionManager::new(mock, &ClientConfig::default(), StateTracker::new());
        let result = manager.connect_and_subscribe().await;

        assert!(matches!(result, Err(Error::NotSupported { .. })));
        assert_eq!(manager.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_subscribe_filters_to_target_characteristic() {
        let target = characteristic(
            CHARACTERISTIC_UUID,
            CharPropFlags::READ | CharPropFlags::NOTIFY,
        );
        let mut mock = mock_with_services(vec![service(SERVICE_UUID, vec![target])]);
        mock.expect_read()
            .times(1)
            .returning(|_| Ok(b"Temp: 20.0".to_vec()));
        mock.expect_subscribe()
            .withf(|c| c.uuid == CHARACTERISTIC_UUID)
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_notifications().times(1).returning(|| {
            Ok(futures::stream::iter(vec![
                notification(CHARACTERISTIC_UUID, b"Temp: 1.0"),
                notification(Uuid::from_u128(0x2a19), b"\x64"),
                notification(CHARACTERISTIC_UUID, b"Temp: 2.0"),
            ])
            .boxed())
        });

        let tracker = StateTracker::new();
        let manager = ConnectionManager::new(mock, &ClientConfig::default(), tracker.clone());
        let stream = manager.connect_and_subscribe().await.unwrap();

        assert!(manager.is_connected());
        assert_eq!(tracker.get(), ConnectionState::Subscribed);
        assert_eq!(
            manager.characteristic().map(|c| c.uuid),
            Some(CHARACTERISTIC_UUID)
        );

        let values: Vec<Vec<u8>> = stream.map(|n| n.value).collect().await;
        assert_eq!(values, vec![b"Temp: 1.0".to_vec(), b"Temp: 2.0".to_vec()]);
    }

    #[tokio::test]
    async fn test_failed_initial_read_is_not_fatal() {
        let target = characteristic(
            CHARACTERISTIC_UUID,
            CharPropFlags::READ | CharPropFlags::INDICATE,
        );
        let mut mock = mock_with_services(vec![service(SERVICE_UUID, vec![target])]);
        mock.expect_read().returning(|_| Err(Error::NotConnected));
        mock.expect_subscribe().returning(|_| Ok(()));
        mock.expect_notifications()
            .returning(|| Ok(futures::stream::empty().boxed()));

        let manager = ConnectionManager::new(mock, &ClientConfig::default(), StateTracker::new());
        assert!(manager.connect_and_subscribe().await.is_ok());
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn test_disconnection_returns_to_idle() {
        let target = characteristic(CHARACTERISTIC_UUID, CharPropFlags::NOTIFY);
        let mut mock = mock_with_services(vec![service(SERVICE_UUID, vec![target])]);
        mock.expect_subscribe().returning(|_| Ok(()));
        mock.expect_notifications()
            .returning(|| Ok(futures::stream::empty().boxed()));

        let manager = ConnectionManager::new(mock, &ClientConfig::default(), StateTracker::new());
        manager.connect_and_subscribe().await.unwrap();
        assert!(manager.is_connected());

        manager.handle_disconnection();
        assert!(!manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(manager.characteristic().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let config = ClientConfig::default().with_connect_timeout(Duration::from_secs(5));
        let manager = ConnectionManager::new(StalledPeripheral::default(), &config, StateTracker::new());

        assert!(matches!(
            manager.connect_and_subscribe().await,
            Err(Error::Timeout)
        ));
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(manager.characteristic().is_none());
    }

    #[tokio::test]
    async fn test_transport_timeout_is_not_rewrapped() {
        let mut mock = MockGattPeripheral::new();
        mock.expect_identifier()
            .returning(|| "AA:BB:CC:DD:EE:FF".to_string());
        mock.expect_connect().returning(|| Err(Error::Timeout));

        let manager = ConnectionManager::new(mock, &ClientConfig::default(), StateTracker::new());

        assert!(matches!(
            manager.connect_and_subscribe().await,
            Err(Error::Timeout)
        ));
        assert_eq!(manager.state(), ConnectionState::Failed);
    }
}
