//! BLE Service and Characteristic UUIDs.
//!
//! The sensor peripheral exposes one custom service with a single
//! text-valued characteristic that it reads and notifies.

use uuid::Uuid;

/// Sensor service UUID advertised by the peripheral.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x9091_5b90_f8e9_45c1_a3eb_eba254edced9);

/// Sample characteristic UUID (Read, Notify).
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xde94_a198_f148_449f_ba18_d7bb2c6ccf91);

/// Largest ATT MTU a central may request.
pub const PREFERRED_MTU: u16 = 517;

/// Check if an advertised service list includes the given service.
pub fn advertises_service(services: &[Uuid], target: &Uuid) -> bool {
    services.iter().any(|uuid| uuid == target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "90915b90-f8e9-45c1-a3eb-eba254edced9"
        );
        assert_eq!(
            CHARACTERISTIC_UUID.to_string(),
            "de94a198-f148-449f-ba18-d7bb2c6ccf91"
        );
    }

    #[test]
    fn test_advertises_service() {
        assert!(advertises_service(
            &[CHARACTERISTIC_UUID, SERVICE_UUID],
            &SERVICE_UUID
        ));
        assert!(!advertises_service(&[CHARACTERISTIC_UUID], &SERVICE_UUID));
        assert!(!advertises_service(&[], &SERVICE_UUID));
    }
}
