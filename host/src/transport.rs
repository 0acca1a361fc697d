//! # Transport Boundary
//!
//! What the link layer needs from a BLE central stack. The device exposes
//! three characteristics; the host sees them as two [`Path`]s:
//!
//! ```text
//!   Path::Data        write  ──► DATA_WRITE_UUID   (host → device)
//!                     notify ◄── DATA_NOTIFY_UUID  (device → host)
//!   Path::AckControl  write  ──► ACK_CONTROL_UUID
//!                     notify ◄── ACK_CONTROL_UUID
//! ```
//!
//! Implementations push every notification into the sink handed to
//! [`Transport::connect`] and must tolerate concurrent writes on both paths.

use std::future::Future;
use std::time::Duration;

use amdtp_protocol::Path;
use tokio::sync::mpsc;

use crate::error::Result;

/// Raw bytes received on one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub path: Path,
    pub bytes: Vec<u8>,
}

/// Where a transport delivers notifications
pub type NotificationSink = mpsc::UnboundedSender<Notification>;

/// A BLE central connection to one AMDTP device
pub trait Transport: Send + Sync + 'static {
    /// Find the device at `address`, connect, and enable notifications on
    /// both notify-capable characteristics.
    ///
    /// Discovery gives up with `DeviceNotFound` once `timeout` elapses.
    fn connect(
        &self,
        address: &str,
        timeout: Duration,
        sink: NotificationSink,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Write one frame without response
    fn write(&self, path: Path, bytes: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Link MTU in bytes
    fn mtu(&self) -> usize;

    /// Disable notifications and disconnect
    fn disconnect(&self) -> impl Future<Output = Result<()>> + Send;
}
