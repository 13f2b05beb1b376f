//! GATT identifiers of the voltage monitor service.
//!
//! The device assigns 16 bit ids inside a fixed 128 bit base pattern,
//! `de0eXXXX-f0af-4d38-9a1a-33e88519d3b2`, where `XXXX` is replaced by the
//! id of the service or characteristic. Standard descriptors use the
//! Bluetooth SIG base pattern the same way.

use bluest::Uuid;

use crate::task::HistoryBucket;

/// Most significant 64 bits of the monitor's base UUID.
pub const BASE_UUID_MSB: u64 = 0xde0e_0000_f0af_4d38;
/// Least significant 64 bits of the monitor's base UUID.
pub const BASE_UUID_LSB: u64 = 0x9a1a_33e8_8519_d3b2;

/// Bluetooth SIG base UUID, used to extend standard 16 bit ids.
pub const STANDARD_BASE_UUID_MSB: u64 = 0x0000_0000_0000_1000;
pub const STANDARD_BASE_UUID_LSB: u64 = 0x8000_0080_5f9b_34fb;

/// 16 bit id of the voltage monitor service.
pub const SERVICE_ID: u16 = 0x0001;
/// 16 bit id of the current voltage characteristic.
pub const CHARACTERISTIC_ID_CURRENT_VOLTAGE: u16 = 0x0100;
/// 16 bit id of the minutely history characteristic.
pub const CHARACTERISTIC_ID_MINUTELY_HISTORY: u16 = 0x0200;
/// 16 bit id of the hourly history characteristic.
pub const CHARACTERISTIC_ID_HOURLY_HISTORY: u16 = 0x0300;
/// 16 bit id of the daily history characteristic.
pub const CHARACTERISTIC_ID_DAILY_HISTORY: u16 = 0x0400;
/// 16 bit id of the client characteristic configuration descriptor.
pub const CLIENT_CHARACTERISTIC_CONFIGURATION_ID: u16 = 0x2902;

/// Builds the 128 bit UUID of a service or characteristic from a 128 bit
/// base pattern and its 16 bit id.
///
/// The 32 bit field at bit offset 32 of the most significant half is cleared
/// and the id is OR-ed into it. For example, base
/// `550eXXXX-e29b-11d4-a716-446655440000` and id `0x1234` yield
/// `550e1234-e29b-11d4-a716-446655440000`.
pub fn derive_uuid(base_msb: u64, base_lsb: u64, id: u16) -> Uuid {
    let msb = (base_msb & 0xffff_0000_ffff_ffff) | (u64::from(id) << 32);
    Uuid::from_u64_pair(msb, base_lsb)
}

/// UUID of the voltage monitor service.
pub fn service_uuid() -> Uuid {
    derive_uuid(BASE_UUID_MSB, BASE_UUID_LSB, SERVICE_ID)
}

/// UUID of the current voltage characteristic.
pub fn current_voltage_uuid() -> Uuid {
    derive_uuid(BASE_UUID_MSB, BASE_UUID_LSB, CHARACTERISTIC_ID_CURRENT_VOLTAGE)
}

/// UUID of the history characteristic for the given bucket.
pub fn history_uuid(bucket: HistoryBucket) -> Uuid {
    let id = match bucket {
        HistoryBucket::Minute => CHARACTERISTIC_ID_MINUTELY_HISTORY,
        HistoryBucket::Hour => CHARACTERISTIC_ID_HOURLY_HISTORY,
        HistoryBucket::Day => CHARACTERISTIC_ID_DAILY_HISTORY,
    };
    derive_uuid(BASE_UUID_MSB, BASE_UUID_LSB, id)
}

/// UUID of the client characteristic configuration descriptor.
pub fn client_characteristic_configuration_uuid() -> Uuid {
    derive_uuid(
        STANDARD_BASE_UUID_MSB,
        STANDARD_BASE_UUID_LSB,
        CLIENT_CHARACTERISTIC_CONFIGURATION_ID,
    )
}
