//! BLE scanning functionality.
//!
//! Provides the scanner for discovering peripherals that advertise the
//! sensor service, and the policy for choosing one of them.

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::uuids::advertises_service;
use crate::config::{ClientConfig, DeviceSelection};
use crate::error::{Error, Result};

/// Event emitted when a matching peripheral is discovered or updated.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    /// The BLE peripheral identifier.
    pub identifier: String,
    /// The peripheral handle.
    pub peripheral: Peripheral,
    /// Advertised local name, if any.
    pub local_name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

/// The parts of an advertisement that device selection looks at.
pub trait ScanCandidate {
    /// Identifier used for allow-listing and de-duplication.
    fn identifier(&self) -> &str;

    /// Signal strength in dBm.
    fn rssi(&self) -> Option<i16>;
}

impl ScanCandidate for DiscoveryEvent {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn rssi(&self) -> Option<i16> {
        self.rssi
    }
}

impl DeviceSelection {
    /// Check if a candidate may be chosen at all.
    pub fn accepts(&self, identifier: &str) -> bool {
        match self {
            Self::AllowList(allowed) => allowed
                .iter()
                .any(|entry| entry.eq_ignore_ascii_case(identifier)),
            Self::FirstMatch | Self::StrongestSignal { .. } => true,
        }
    }

    /// Pick the preferred candidate among those collected.
    ///
    /// Ties in signal strength go to the earliest candidate; a missing RSSI
    /// ranks below any reported one.
    pub fn choose<'a, C: ScanCandidate>(&self, candidates: &'a [C]) -> Option<&'a C> {
        let mut accepted = candidates.iter().filter(|c| self.accepts(c.identifier()));

        match self {
            Self::FirstMatch | Self::AllowList(_) => accepted.next(),
            Self::StrongestSignal { .. } => accepted.fold(None::<&C>, |best, c| match best {
                Some(b) if b.rssi().unwrap_or(i16::MIN) >= c.rssi().unwrap_or(i16::MIN) => {
                    Some(b)
                }
                _ => Some(c),
            }),
        }
    }
}

/// Wait on a discovery channel until the selection policy settles on a candidate.
pub async fn select_candidate<C>(
    rx: &mut broadcast::Receiver<C>,
    selection: &DeviceSelection,
) -> Result<C>
where
    C: ScanCandidate + Clone,
{
    let first = loop {
        let candidate = recv_candidate(rx).await?;
        if selection.accepts(candidate.identifier()) {
            break candidate;
        }
        trace!("Ignoring {} (not allowed)", candidate.identifier());
    };

    let window = match selection {
        DeviceSelection::StrongestSignal { window } => *window,
        DeviceSelection::FirstMatch | DeviceSelection::AllowList(_) => return Ok(first),
    };

    debug!(
        "First candidate {}, collecting for {:?}",
        first.identifier(),
        window
    );

    let mut order = vec![first.identifier().to_string()];
    let mut latest: HashMap<String, C> = HashMap::new();
    latest.insert(first.identifier().to_string(), first);

    let deadline = tokio::time::Instant::now() + window;
    loop {
        tokio::select! {
            received = recv_candidate(rx) => {
                let candidate = received?;
                let id = candidate.identifier().to_string();
                if !latest.contains_key(&id) {
                    order.push(id.clone());
                }
                latest.insert(id, candidate);
            }
            _ = tokio::time::sleep_until(deadline) => break,
        }
    }

    let candidates: Vec<C> = order
        .iter()
        .filter_map(|id| latest.remove(id))
        .collect();

    selection
        .choose(&candidates)
        .cloned()
        .ok_or_else(|| Error::Internal("no candidate survived selection".to_string()))
}

async fn recv_candidate<C: Clone>(rx: &mut broadcast::Receiver<C>) -> Result<C> {
    loop {
        match rx.recv().await {
            Ok(candidate) => return Ok(candidate),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Discovery receiver lagged by {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(Error::Internal("discovery channel closed".to_string()));
            }
        }
    }
}

/// Bound a device search by `scan_timeout`.
///
/// A search that outlives the timeout reports the service as not found.
async fn search_within<T, F>(
    search: F,
    scan_timeout: Option<Duration>,
    service_uuid: Uuid,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match scan_timeout {
        Some(timeout) => tokio::time::timeout(timeout, search)
            .await
            .unwrap_or_else(|_| {
                debug!("No matching device within {:?}", timeout);
                Err(Error::DeviceNotFound {
                    service: service_uuid.to_string(),
                })
            }),
        None => search.await,
    }
}

/// BLE scanner for discovering the sensor peripheral.
pub struct BleScanner {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Whether scanning is currently active.
    is_scanning: Arc<RwLock<bool>>,
    /// Channel for discovery events.
    event_tx: broadcast::Sender<DiscoveryEvent>,
    /// Handle to the scanning task.
    scan_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl BleScanner {
    /// Create a new BLE scanner on the first available adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a new BLE scanner with a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            adapter,
            is_scanning: Arc::new(RwLock::new(false)),
            event_tx,
            scan_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Start scanning for peripherals advertising `service_uuid`.
    ///
    /// # Errors
    ///
    /// Returns an error if scanning cannot be started.
    pub async fn start_scanning(&self, service_uuid: Uuid) -> Result<()> {
        if *self.is_scanning.read() {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        info!("Starting BLE scan for service {}", service_uuid);

        // Subscribe before the scan starts so no early advertisement is missed.
        let mut events = self.adapter.events().await.map_err(Error::Bluetooth)?;

        self.adapter
            .start_scan(ScanFilter {
                services: vec![service_uuid],
            })
            .await
            .map_err(Error::Bluetooth)?;

        *self.is_scanning.write() = true;

        let adapter = self.adapter.clone();
        let is_scanning = self.is_scanning.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            while *is_scanning.read() {
                tokio::select! {
                    event = events.next() => {
                        match event {
                            Some(event) => {
                                Self::handle_event(event, &adapter, service_uuid, &event_tx).await;
                            }
                            None => {
                                error!("Adapter event stream ended");
                                break;
                            }
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {
                        if !*is_scanning.read() {
                            break;
                        }
                    }
                }
            }

            debug!("Scan event loop ended");
        });

        *self.scan_handle.write() = Some(handle);

        Ok(())
    }

    /// Stop scanning.
    pub async fn stop_scanning(&self) -> Result<()> {
        if !*self.is_scanning.read() {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");

        *self.is_scanning.write() = false;

        self.adapter.stop_scan().await.map_err(Error::Bluetooth)?;

        let handle = self.scan_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        Ok(())
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        *self.is_scanning.read()
    }

    /// Subscribe to discovery events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.event_tx.subscribe()
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Scan until the configured selection policy picks a peripheral.
    ///
    /// Scanning stops as soon as a peripheral is chosen, or when
    /// `scan_timeout` elapses ([`Error::DeviceNotFound`]).
    pub async fn find_device(&self, config: &ClientConfig) -> Result<DiscoveryEvent> {
        let mut rx = self.subscribe();
        self.start_scanning(config.service_uuid).await?;

        let result = search_within(
            select_candidate(&mut rx, &config.selection),
            config.scan_timeout,
            config.service_uuid,
        )
        .await;

        if let Err(e) = self.stop_scanning().await {
            warn!("Failed to stop scan: {}", e);
        }

        let event = result?;
        info!(
            "Advertised device found: {} ({}), RSSI {:?}",
            event.identifier,
            event.local_name.as_deref().unwrap_or("unnamed"),
            event.rssi
        );
        Ok(event)
    }

    /// Handle a BLE central event.
    async fn handle_event(
        event: CentralEvent,
        adapter: &Adapter,
        service_uuid: Uuid,
        event_tx: &broadcast::Sender<DiscoveryEvent>,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                Self::process_peripheral(adapter, id, service_uuid, event_tx).await;
            }
            CentralEvent::ServicesAdvertisement { id, services } => {
                if advertises_service(&services, &service_uuid) {
                    Self::process_peripheral(adapter, id, service_uuid, event_tx).await;
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
            }
            _ => {}
        }
    }

    /// Process a discovered peripheral.
    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        service_uuid: Uuid,
        event_tx: &broadcast::Sender<DiscoveryEvent>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        trace!(
            "BLE advertised device found: {} {:?} services={:?}",
            properties.address,
            properties.local_name,
            properties.services
        );

        if !advertises_service(&properties.services, &service_uuid) {
            return;
        }

        let event = DiscoveryEvent {
            identifier: properties.address.to_string(),
            peripheral,
            local_name: properties.local_name,
            rssi: properties.rssi,
            services: properties.services,
        };

        let _ = event_tx.send(event);
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        *self.is_scanning.write() = false;
    }
}
