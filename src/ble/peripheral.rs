//! GATT peripheral abstraction.
//!
//! The connection workflow talks to the platform BLE stack only through
//! [`GattPeripheral`], which is implemented for btleplug's platform
//! peripheral and mocked in tests.

use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, Service, ValueNotification};
use btleplug::platform::Peripheral;
use futures::stream::BoxStream;

use crate::error::Result;

/// Stream of notifications from a subscribed peripheral.
pub type NotificationStream = BoxStream<'static, ValueNotification>;

/// The GATT client operations used by the connection workflow.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GattPeripheral: Send + Sync {
    /// Human-readable identifier (address or platform ID).
    fn identifier(&self) -> String;

    /// Establish the transport connection.
    async fn connect(&self) -> Result<()>;

    /// Tear down the transport connection.
    async fn disconnect(&self) -> Result<()>;

    /// Run GATT service discovery.
    async fn discover_services(&self) -> Result<()>;

    /// Services found by the last discovery.
    fn services(&self) -> Vec<Service>;

    /// Read a characteristic value.
    async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>>;

    /// Enable notifications or indications on a characteristic.
    async fn subscribe(&self, characteristic: &Characteristic) -> Result<()>;

    /// Stream of every notification received from this peripheral.
    async fn notifications(&self) -> Result<NotificationStream>;
}

#[async_trait]
impl GattPeripheral for Peripheral {
    fn identifier(&self) -> String {
        self.address().to_string()
    }

    async fn connect(&self) -> Result<()> {
        btleplug::api::Peripheral::connect(self).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        btleplug::api::Peripheral::disconnect(self).await?;
        Ok(())
    }

    async fn discover_services(&self) -> Result<()> {
        btleplug::api::Peripheral::discover_services(self).await?;
        Ok(())
    }

    fn services(&self) -> Vec<Service> {
        btleplug::api::Peripheral::services(self).into_iter().collect()
    }

    async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>> {
        Ok(btleplug::api::Peripheral::read(self, characteristic).await?)
    }

    async fn subscribe(&self, characteristic: &Characteristic) -> Result<()> {
        btleplug::api::Peripheral::subscribe(self, characteristic).await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        Ok(btleplug::api::Peripheral::notifications(self).await?)
    }
}
