//! # BLE Serial Port
//!
//! [`BleSerial`] presents an AMDTP link as a blocking, serial-port-like
//! byte stream. Each open connection runs two tasks on the bridge runtime:
//!
//! ```text
//!  write() ──► one-slot request queue ──► Writer ──► transport
//!                                           ▲
//!                          reply queue (ACK)│
//!  transport ──► notifications ──► Dispatcher
//!                                      │
//!  read() ◄── byte buffer ◄── inbound queue
//! ```
//!
//! Sequence state lives in those tasks and is created fresh by every
//! [`BleSerial::open`].

use std::collections::VecDeque;
use std::io;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use amdtp_protocol::{max_payload_for_mtu, ProtocolViolation};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bridge::{lock, Bridge};
use crate::channel::{WriteRequest, Writer, WriterTiming};
use crate::config::SerialConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Result, SerialError};
use crate::fault::FaultLatch;
use crate::stats::{LinkStats, StatsSnapshot};
use crate::transport::Transport;

/// Name of the background runtime thread
pub const IO_THREAD_NAME: &str = "ble-serial-io";

struct Session {
    requests: mpsc::Sender<WriteRequest>,
    fault: FaultLatch,
    stats: Arc<LinkStats>,
    tasks: Vec<JoinHandle<()>>,
    mtu: usize,
}

#[derive(Default)]
struct ReadState {
    inbound: Option<std_mpsc::Receiver<Vec<u8>>>,
    buffer: VecDeque<u8>,
}

impl ReadState {
    fn drain_queue(&mut self) {
        if let Some(inbound) = &self.inbound {
            while let Ok(chunk) = inbound.try_recv() {
                self.buffer.extend(chunk);
            }
        }
    }
}

/// Blocking byte stream over a BLE transport
///
/// # Example
///
/// ```no_run
/// use ble_serial::{BleSerial, Loopback, SerialConfig};
///
/// let port = BleSerial::new(Loopback::new(), SerialConfig::new("C0:FF:EE:00:00:01"))?;
/// port.open()?;
/// port.write(b"status\n")?;
/// let reply = port.read(64)?;
/// port.close();
/// # Ok::<(), ble_serial::SerialError>(())
/// ```
pub struct BleSerial<T: Transport> {
    transport: Arc<T>,
    config: SerialConfig,
    bridge: Bridge,
    session: Mutex<Option<Session>>,
    reader: Mutex<ReadState>,
}

impl<T: Transport> BleSerial<T> {
    /// Create a closed port; the background runtime starts immediately
    pub fn new(transport: T, config: SerialConfig) -> Result<Self> {
        Ok(Self {
            transport: Arc::new(transport),
            config,
            bridge: Bridge::start(IO_THREAD_NAME)?,
            session: Mutex::new(None),
            reader: Mutex::new(ReadState::default()),
        })
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Connect to the device and start the link tasks.
    ///
    /// Opening an open port does nothing; opening a closed one fails with
    /// [`SerialError::RuntimeStopped`].
    pub fn open(&self) -> Result<()> {
        let mut session = lock(&self.session);
        if session.is_some() {
            return Ok(());
        }

        let timeout = self.config.timeout();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let transport = Arc::clone(&self.transport);
        let address = self.config.address.clone();

        info!("Connecting to {}", address);
        // Discovery may use the whole timeout; connecting gets as long again
        self.bridge.run(
            async move { transport.connect(&address, timeout, notify_tx).await },
            timeout * 2,
        )??;

        let mtu = self.config.mtu_override.unwrap_or_else(|| self.transport.mtu());
        let max_payload = max_payload_for_mtu(mtu);
        info!("Connected, MTU {} (max payload {})", mtu, max_payload);

        if max_payload == 0 {
            self.disconnect();
            return Err(SerialError::InvalidInput("link MTU leaves no room for payload"));
        }

        let fault = FaultLatch::new();
        let stats = Arc::new(LinkStats::new());
        let (inbound_tx, inbound_rx) = std_mpsc::channel();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::channel(1);

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.transport),
            inbound_tx,
            replies_tx,
            fault.clone(),
            Arc::clone(&stats),
        );
        let writer = Writer::new(
            Arc::clone(&self.transport),
            replies_rx,
            fault.clone(),
            Arc::clone(&stats),
            max_payload,
            WriterTiming {
                timeout,
                packet_timeout: self.config.packet_timeout(),
            },
        );

        let tasks = vec![
            self.bridge.spawn(dispatcher.run(notify_rx))?,
            self.bridge.spawn(writer.run(requests_rx))?,
        ];

        {
            let mut reader = lock(&self.reader);
            reader.inbound = Some(inbound_rx);
            reader.buffer.clear();
        }

        *session = Some(Session {
            requests: requests_tx,
            fault,
            stats,
            tasks,
            mtu,
        });

        Ok(())
    }

    /// Disconnect and stop the background runtime.
    ///
    /// In-flight writes are abandoned. A failed disconnect is logged, not
    /// returned. Idempotent; the port cannot be reopened afterwards.
    pub fn close(&self) {
        if let Some(session) = lock(&self.session).take() {
            for task in &session.tasks {
                task.abort();
            }
            self.disconnect();
        }

        lock(&self.reader).inbound = None;

        if self.bridge.is_running() {
            self.bridge.shutdown();
            debug!("Background runtime stopped");
        }
    }

    fn disconnect(&self) {
        let transport = Arc::clone(&self.transport);
        match self
            .bridge
            .run(async move { transport.disconnect().await }, self.config.timeout())
        {
            Ok(Ok(())) => info!("Disconnected from {}", self.config.address),
            Ok(Err(e)) | Err(e) => warn!("Disconnect from {} failed: {}", self.config.address, e),
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.session).is_some()
    }

    /// MTU of the open link
    pub fn mtu(&self) -> Option<usize> {
        lock(&self.session).as_ref().map(|s| s.mtu)
    }

    /// Protocol violation that has stopped the link, if any
    pub fn fault(&self) -> Option<ProtocolViolation> {
        lock(&self.session).as_ref().and_then(|s| s.fault.get())
    }

    /// Write `data`, blocking until every chunk is acknowledged or the
    /// overall timeout passes.
    ///
    /// Returns the number of bytes the device acknowledged, which is short
    /// of `data.len()` only on timeout. Must not be called from inside an
    /// async runtime; see [`BleSerial::write_nonblocking`].
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.write_nonblocking(data)?.wait()
    }

    /// Queue `data` for writing and return without waiting for the device.
    ///
    /// Blocks only while an earlier write is still waiting for its turn.
    ///
    /// # Errors
    ///
    /// Fails with [`SerialError::InvalidInput`] when called from inside an
    /// async runtime, where blocking would stall its worker thread.
    pub fn write_nonblocking(&self, data: &[u8]) -> Result<WriteHandle> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(SerialError::InvalidInput(
                "blocking write called from inside an async runtime",
            ));
        }

        let requests = {
            let session = lock(&self.session);
            let session = session.as_ref().ok_or(SerialError::NotConnected)?;
            session.fault.check()?;
            session.requests.clone()
        };

        let (done, result) = std_mpsc::sync_channel(1);
        requests
            .blocking_send(WriteRequest {
                data: data.to_vec(),
                done,
            })
            .map_err(|_| SerialError::RuntimeStopped)?;

        // Covers one earlier write still in flight
        let bound = (self.config.timeout() + self.config.packet_timeout()) * 2;
        Ok(WriteHandle {
            result: Some(result),
            bound,
        })
    }

    /// Read up to `size` bytes.
    ///
    /// Waits until `size` bytes are buffered or the overall timeout passes,
    /// then returns what is available. A short read is not an error; unread
    /// bytes stay buffered for the next call.
    pub fn read(&self, size: usize) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }

        let stats = {
            let session = lock(&self.session);
            let session = session.as_ref().ok_or(SerialError::NotConnected)?;
            session.fault.check()?;
            Arc::clone(&session.stats)
        };

        let deadline = Instant::now() + self.config.timeout();
        loop {
            // Held for one poll at most
            let mut guard = lock(&self.reader);
            let reader = &mut *guard;
            reader.drain_queue();

            let now = Instant::now();
            let waiting = reader.buffer.len() < size && now < deadline;
            let open = match (&reader.inbound, waiting) {
                (Some(inbound), true) => {
                    match inbound.recv_timeout(self.config.read_poll().min(deadline - now)) {
                        Ok(chunk) => {
                            reader.buffer.extend(chunk);
                            true
                        }
                        Err(std_mpsc::RecvTimeoutError::Timeout) => true,
                        Err(std_mpsc::RecvTimeoutError::Disconnected) => false,
                    }
                }
                _ => false,
            };

            if !open {
                let count = size.min(reader.buffer.len());
                let bytes: Vec<u8> = reader.buffer.drain(..count).collect();
                stats.read(count);
                return Ok(bytes);
            }
        }
    }

    /// Bytes buffered and ready to read
    pub fn in_waiting(&self) -> usize {
        let mut reader = lock(&self.reader);
        reader.drain_queue();
        reader.buffer.len()
    }

    /// Discard every buffered byte, including those still queued
    pub fn reset_input_buffer(&self) {
        let mut reader = lock(&self.reader);
        reader.drain_queue();
        reader.buffer.clear();
    }

    /// Counters for the open link
    pub fn stats(&self) -> Option<StatsSnapshot> {
        lock(&self.session).as_ref().map(|s| s.stats.snapshot())
    }

    /// [`BleSerial::stats`] as JSON
    pub fn stats_json(&self) -> Result<String> {
        let snapshot = self.stats().ok_or(SerialError::NotConnected)?;
        serde_json::to_string(&snapshot)
            .map_err(|e| SerialError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
    }
}

impl<T: Transport> Drop for BleSerial<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pending result of [`BleSerial::write_nonblocking`]
#[derive(Debug)]
pub struct WriteHandle {
    result: Option<std_mpsc::Receiver<Result<usize>>>,
    bound: Duration,
}

impl WriteHandle {
    /// Block until the write finishes
    pub fn wait(mut self) -> Result<usize> {
        let Some(result) = self.result.take() else {
            return Err(SerialError::InvalidInput("write result already taken"));
        };
        match result.recv_timeout(self.bound) {
            Ok(outcome) => outcome,
            Err(std_mpsc::RecvTimeoutError::Timeout) => Err(SerialError::Timeout(self.bound)),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(SerialError::RuntimeStopped),
        }
    }

    /// Poll without blocking; `None` while the write is in flight.
    ///
    /// The result is handed out once.
    pub fn try_result(&mut self) -> Option<Result<usize>> {
        let outcome = match self.result.as_ref()?.try_recv() {
            Ok(outcome) => outcome,
            Err(std_mpsc::TryRecvError::Empty) => return None,
            Err(std_mpsc::TryRecvError::Disconnected) => Err(SerialError::RuntimeStopped),
        };
        self.result = None;
        Some(outcome)
    }
}

impl<T: Transport> io::Read for &BleSerial<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let bytes = BleSerial::read(*self, buf.len())?;
        // Ok(0) would read as end of stream
        if bytes.is_empty() && !buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no bytes received"));
        }
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }
}

impl<T: Transport> io::Write for &BleSerial<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = BleSerial::write(*self, buf)?;
        if written == 0 && !buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no bytes acknowledged"));
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: Transport> io::Read for BleSerial<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }
}

impl<T: Transport> io::Write for BleSerial<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
