//! Central-side provisioning of tab peripherals over BLE.
//!
//! A tab exposes one GATT service with two text characteristics, the admin
//! key and the search text. This crate scans for tabs, keeps a session with
//! one of them, mirrors both values into a local store and can query the
//! patient lookup service with the stored pair.

pub mod domain;
pub mod infrastructure;
