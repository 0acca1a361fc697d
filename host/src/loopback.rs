//! # Loopback Device
//!
//! In-memory [`Transport`] that plays the device end of the link with the
//! same state machines the host uses. A [`FaultPlan`] scripts lost and
//! corrupted frames so every recovery path can be exercised without radio
//! hardware.
//!
//! Counting for the fault plan is zero-based and spans the whole lifetime
//! of the loopback: `drop_data: vec![0]` loses the first DATA frame the host
//! ever writes, whichever chunk or retransmission it is.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use amdtp_protocol::{
    gatt, protocol, Frame, FrameType, Path, ReceiveState, SendAction, SendState, Status,
};
use log::{debug, info, trace, warn};

use crate::error::{Result, SerialError};
use crate::transport::{Notification, NotificationSink, Transport};

/// Scripted link faults, by zero-based frame index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Host DATA frames that never reach the device
    pub drop_data: Vec<usize>,
    /// Host DATA frames that arrive with a flipped CRC bit
    pub corrupt_data: Vec<usize>,
    /// Device ACK frames that never reach the host
    pub drop_acks: Vec<usize>,
    /// Answer every host DATA frame with this status instead of the verdict
    pub reject_with: Option<Status>,
}

#[derive(Default)]
struct Device {
    sink: Option<NotificationSink>,
    receive: ReceiveState,
    send: SendState,
    faults: FaultPlan,
    data_count: usize,
    ack_count: usize,
    received: Vec<u8>,
    host_data: Vec<Vec<u8>>,
    host_control: Vec<Vec<u8>>,
    host_acks: Vec<u8>,
}

impl Device {
    fn notify(&self, path: Path, bytes: &[u8]) -> Result<()> {
        let sink = self.sink.as_ref().ok_or(SerialError::NotConnected)?;
        trace!("loopback tx {:?}: {:02x?}", path, bytes);
        sink.send(Notification {
            path,
            bytes: bytes.to_vec(),
        })
        .map_err(|_| SerialError::Transport("host stopped listening".to_string()))
    }

    fn reply(&mut self, status: Status) -> Result<()> {
        let index = self.ack_count;
        self.ack_count += 1;
        if self.faults.drop_acks.contains(&index) {
            debug!("loopback: dropping ACK #{} ({:?})", index, status);
            return Ok(());
        }
        let frame = protocol::ack(status)?;
        self.notify(Path::AckControl, &frame)
    }

    fn on_host_data(&mut self, bytes: &[u8]) -> Result<()> {
        let index = self.data_count;
        self.data_count += 1;
        self.host_data.push(bytes.to_vec());

        if self.faults.drop_data.contains(&index) {
            debug!("loopback: dropping DATA #{}", index);
            return Ok(());
        }

        let mut bytes = bytes.to_vec();
        if self.faults.corrupt_data.contains(&index) {
            debug!("loopback: corrupting DATA #{}", index);
            if let Some(last) = bytes.last_mut() {
                *last ^= 0x01;
            }
        }

        let status = match self.receive.on_data(&bytes) {
            Ok(received) => {
                if let Some(payload) = received.payload {
                    self.received.extend_from_slice(payload);
                }
                received.status
            }
            Err(violation) => {
                warn!("loopback: {}", violation);
                return Ok(());
            }
        };

        self.reply(self.faults.reject_with.unwrap_or(status))
    }

    fn on_host_ack_control(&mut self, bytes: &[u8]) -> Result<()> {
        let frame = match Frame::decode(bytes) {
            Ok(frame) if frame.is_intact() => frame,
            Ok(_) => {
                warn!("loopback: ack/control frame with bad CRC");
                return Ok(());
            }
            Err(e) => {
                warn!("loopback: {}", e);
                return Ok(());
            }
        };

        match frame.header.frame_type {
            FrameType::Control => {
                self.host_control.push(bytes.to_vec());
                match self.receive.on_control(&frame) {
                    Ok(status) => self.reply(status),
                    Err(violation) => {
                        warn!("loopback: {}", violation);
                        Ok(())
                    }
                }
            }
            FrameType::Ack => {
                let Some(&raw) = frame.payload.first() else {
                    return Ok(());
                };
                self.host_acks.push(raw);
                self.on_ack(raw)
            }
            FrameType::Data => {
                warn!("loopback: DATA frame on ack/control path");
                Ok(())
            }
        }
    }

    /// Advance or retransmit the device's own pending DATA frame
    fn on_ack(&mut self, raw: u8) -> Result<()> {
        if self.send.pending().is_none() {
            return Ok(());
        }
        match self.send.on_ack(raw) {
            Ok(SendAction::Advance) => Ok(()),
            Ok(SendAction::Retransmit) => {
                let frame = self.send.pending().map(<[u8]>::to_vec).unwrap_or_default();
                self.notify(Path::Data, &frame)
            }
            Err(violation) => {
                warn!("loopback: {}", violation);
                Ok(())
            }
        }
    }
}

/// In-memory AMDTP device
pub struct Loopback {
    mtu: usize,
    device: Mutex<Device>,
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new()
    }
}

impl Loopback {
    /// Fault-free device with the default BLE MTU
    pub fn new() -> Self {
        Self::with_faults(gatt::DEFAULT_MTU, FaultPlan::default())
    }

    pub fn with_mtu(mtu: usize) -> Self {
        Self::with_faults(mtu, FaultPlan::default())
    }

    pub fn with_faults(mtu: usize, faults: FaultPlan) -> Self {
        Self {
            mtu,
            device: Mutex::new(Device {
                faults,
                ..Device::default()
            }),
        }
    }

    fn device(&self) -> MutexGuard<'_, Device> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `payload` to the host as one DATA frame
    pub fn push_data(&self, payload: &[u8]) -> Result<()> {
        let mut device = self.device();
        let frame = device.send.load(payload)?.to_vec();
        device.notify(Path::Data, &frame)
    }

    /// Send arbitrary bytes to the host on `path`
    pub fn push_raw(&self, path: Path, bytes: &[u8]) -> Result<()> {
        self.device().notify(path, bytes)
    }

    /// Payload bytes the device accepted, in order
    pub fn received(&self) -> Vec<u8> {
        self.device().received.clone()
    }

    /// Every DATA frame the host wrote, as written
    pub fn data_frames(&self) -> Vec<Vec<u8>> {
        self.device().host_data.clone()
    }

    /// Every CONTROL frame the host wrote
    pub fn control_frames(&self) -> Vec<Vec<u8>> {
        self.device().host_control.clone()
    }

    /// Status bytes of every ACK the host wrote
    pub fn host_acks(&self) -> Vec<u8> {
        self.device().host_acks.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.device().sink.is_some()
    }
}

impl Transport for Loopback {
    async fn connect(&self, address: &str, _timeout: Duration, sink: NotificationSink) -> Result<()> {
        let mut device = self.device();
        device.sink = Some(sink);
        device.receive = ReceiveState::new();
        device.send = SendState::new();
        info!("loopback: connected as {}", address);
        Ok(())
    }

    async fn write(&self, path: Path, bytes: &[u8]) -> Result<()> {
        let mut device = self.device();
        if device.sink.is_none() {
            return Err(SerialError::NotConnected);
        }
        match path {
            Path::Data => device.on_host_data(bytes),
            Path::AckControl => device.on_host_ack_control(bytes),
        }
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn disconnect(&self) -> Result<()> {
        self.device().sink = None;
        info!("loopback: disconnected");
        Ok(())
    }
}
