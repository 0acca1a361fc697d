//! # btleplug Transport
//!
//! [`Transport`] over the platform BLE central stack via `btleplug`.
//!
//! btleplug does not report the negotiated ATT MTU, so the link MTU is
//! configured; [`gatt::DEFAULT_MTU`] matches what common phones and USB
//! dongles negotiate with Ambiq parts.

use std::time::Duration;

use amdtp_protocol::{gatt, Path};
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::error::{Result, SerialError};
use crate::transport::{Notification, NotificationSink, Transport};

const SCAN_POLL: Duration = Duration::from_millis(100);

fn transport_error(e: btleplug::Error) -> SerialError {
    SerialError::Transport(e.to_string())
}

struct Link {
    peripheral: Peripheral,
    data_write: Characteristic,
    data_notify: Characteristic,
    ack_control: Characteristic,
    forwarder: JoinHandle<()>,
}

/// BLE central transport for one AMDTP peripheral
pub struct BtleTransport {
    mtu: usize,
    link: Mutex<Option<Link>>,
}

impl Default for BtleTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl BtleTransport {
    pub fn new() -> Self {
        Self::with_mtu(gatt::DEFAULT_MTU)
    }

    pub fn with_mtu(mtu: usize) -> Self {
        Self {
            mtu,
            link: Mutex::new(None),
        }
    }
}

async fn first_adapter() -> Result<Adapter> {
    let manager = Manager::new().await.map_err(transport_error)?;
    manager
        .adapters()
        .await
        .map_err(transport_error)?
        .into_iter()
        .next()
        .ok_or_else(|| SerialError::ConnectionFailed("no Bluetooth adapter".to_string()))
}

async fn find_peripheral(adapter: &Adapter, address: &str, timeout: Duration) -> Result<Peripheral> {
    let deadline = Instant::now() + timeout;
    loop {
        for peripheral in adapter.peripherals().await.map_err(transport_error)? {
            if peripheral.address().to_string().eq_ignore_ascii_case(address) {
                return Ok(peripheral);
            }
        }
        if Instant::now() >= deadline {
            return Err(SerialError::DeviceNotFound(address.to_string()));
        }
        sleep(SCAN_POLL).await;
    }
}

fn characteristic(peripheral: &Peripheral, uuid: u128) -> Result<Characteristic> {
    let uuid = Uuid::from_u128(uuid);
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| SerialError::ConnectionFailed(format!("characteristic {} not found", uuid)))
}

impl Transport for BtleTransport {
    async fn connect(&self, address: &str, timeout: Duration, sink: NotificationSink) -> Result<()> {
        let adapter = first_adapter().await?;

        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(transport_error)?;
        let found = find_peripheral(&adapter, address, timeout).await;
        if let Err(e) = adapter.stop_scan().await {
            debug!("Stopping scan failed: {}", e);
        }
        let peripheral = found?;
        info!("Found device {}", address);

        peripheral
            .connect()
            .await
            .map_err(|e| SerialError::ConnectionFailed(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(transport_error)?;
        for service in peripheral.services() {
            debug!("Service {} ({} characteristics)", service.uuid, service.characteristics.len());
        }

        let data_write = characteristic(&peripheral, gatt::DATA_WRITE_UUID)?;
        let data_notify = characteristic(&peripheral, gatt::DATA_NOTIFY_UUID)?;
        let ack_control = characteristic(&peripheral, gatt::ACK_CONTROL_UUID)?;

        let mut notifications = peripheral.notifications().await.map_err(transport_error)?;
        peripheral.subscribe(&data_notify).await.map_err(transport_error)?;
        peripheral.subscribe(&ack_control).await.map_err(transport_error)?;
        info!("Notifications enabled");

        let (notify_uuid, ack_uuid) = (data_notify.uuid, ack_control.uuid);
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let path = if notification.uuid == notify_uuid {
                    Path::Data
                } else if notification.uuid == ack_uuid {
                    Path::AckControl
                } else {
                    debug!("Ignoring notification from {}", notification.uuid);
                    continue;
                };
                let forwarded = sink.send(Notification {
                    path,
                    bytes: notification.value,
                });
                if forwarded.is_err() {
                    break;
                }
            }
        });

        *self.link.lock().await = Some(Link {
            peripheral,
            data_write,
            data_notify,
            ack_control,
            forwarder,
        });
        Ok(())
    }

    async fn write(&self, path: Path, bytes: &[u8]) -> Result<()> {
        let (peripheral, characteristic) = {
            let link = self.link.lock().await;
            let link = link.as_ref().ok_or(SerialError::NotConnected)?;
            let characteristic = match path {
                Path::Data => link.data_write.clone(),
                Path::AckControl => link.ack_control.clone(),
            };
            (link.peripheral.clone(), characteristic)
        };

        peripheral
            .write(&characteristic, bytes, WriteType::WithoutResponse)
            .await
            .map_err(transport_error)
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(link) = self.link.lock().await.take() else {
            return Ok(());
        };
        link.forwarder.abort();

        for characteristic in [&link.data_notify, &link.ack_control] {
            if let Err(e) = link.peripheral.unsubscribe(characteristic).await {
                warn!("Disabling notifications on {} failed: {}", characteristic.uuid, e);
            }
        }
        info!("Notifications disabled");

        link.peripheral.disconnect().await.map_err(transport_error)
    }
}
