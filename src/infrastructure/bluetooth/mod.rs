//! Bluetooth Module
//!
//! Provides the BLE central side of the tablet provisioning link.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │   (actor - applies commands and link events in order)    │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┐
//!         │             │              │
//!         ▼             ▼              ▼
//! ┌───────────┐  ┌─────────────┐  ┌──────────┐
//! │  Scanner  │  │ GattSession │  │ Protocol │
//! │           │  │             │  │          │
//! │ - timed   │  │ - states    │  │ - UUIDs  │
//! │   scans   │  │ - Sequencer │  │ - codec  │
//! └─────┬─────┘  └──────┬──────┘  └──────────┘
//!       │               │
//!       ▼               ▼
//! ┌─────────────────────────────┐
//! │  btleplug backend / link    │
//! └─────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Service and characteristic UUIDs, value codec
//! - [`scanner`] - Timed, de-duplicated peripheral discovery
//! - [`events`] - Events reported to the service owner
//! - [`link`] - Transport seam the session drives
//! - [`sequencer`] - One-at-a-time GATT chains
//! - [`session`] - Connection state machine
//! - [`btleplug_backend`] - Scan backend and link over btleplug
//! - [`service`] - Main service coordinator

pub mod btleplug_backend;
pub mod error;
pub mod events;
pub mod link;
pub mod protocol;
pub mod scanner;
pub mod sequencer;
pub mod service;
pub mod session;

pub use error::BleError;
pub use events::{AppEvent, MessageSeverity, StatusMessage};
pub use service::{BluetoothCommand, BluetoothService, ServiceHandle};
