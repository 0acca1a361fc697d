//! # BLE Serial Host Library
//!
//! Turns an Ambiq AMDTP data-transfer service into a reliable, blocking
//! byte stream with a serial-port contract: `open`, `close`, `write`,
//! `read`, `in_waiting`, `reset_input_buffer`.
//!
//! ## Threading Model
//!
//! ```text
//! ┌──────────────────────────────┐      ┌─────────────────────────────────────┐
//! │  caller threads              │      │  "ble-serial-io" (tokio, 1 thread)  │
//! │                              │      │                                     │
//! │  BleSerial::write ───────────┼─────►│  Writer     (send state machine)    │
//! │  BleSerial::read  ◄──────────┼──────│  Dispatcher (receive state machine) │
//! │  BleSerial::open/close ──────┼─────►│  Transport  (BLE central)           │
//! └──────────────────────────────┘      └─────────────────────────────────────┘
//! ```
//!
//! All link state is owned by tasks on the I/O thread; callers only ever
//! exchange messages with them. Any [`Transport`] can sit underneath: the
//! in-memory [`Loopback`] device, or `BtleTransport` with the `btleplug`
//! feature.

pub mod bridge;
pub mod config;
pub mod error;
pub mod loopback;
pub mod serial;
pub mod stats;
pub mod transport;

#[cfg(feature = "btleplug")]
pub mod btle;

mod channel;
mod dispatcher;
mod fault;

pub use config::SerialConfig;
pub use error::{Result, SerialError};
pub use loopback::{FaultPlan, Loopback};
pub use serial::{BleSerial, WriteHandle};
pub use stats::{LinkStats, StatsSnapshot};
pub use transport::{Notification, NotificationSink, Transport};

#[cfg(feature = "btleplug")]
pub use btle::BtleTransport;

/// Protocol crate, re-exported for frame-level access
pub use amdtp_protocol as protocol;
