//! # Reliable Channel Writer
//!
//! Background task owning the send side of the link. Write requests arrive
//! through a one-slot queue, so exactly one multi-chunk write is in flight
//! and later callers wait their turn.
//!
//! ## Per-chunk Loop
//!
//! ```text
//!   load chunk ──► DATA(sn) ──► wait ACK (packet timeout)
//!                     ▲            │
//!                     │            ├─ SUCCESS ──────────────► next chunk
//!                     └────────────┼─ CRC / LENGTH / RESEND_REPLY
//!                                  ├─ timeout ──► CONTROL RESEND_REQ(sn), wait again
//!                                  └─ anything else ──► abort (protocol violation)
//! ```
//!
//! Every frame sent (DATA or RESEND_REQ) is owed exactly one ACK. ACKs carry
//! no sequence number, so the writer counts what is owed: answers to older
//! copies of the current frame can only advance it, never trigger another
//! retransmission, and answers owed by the previous chunk are waited out
//! before the next DATA goes out.
//!
//! The whole write is bounded by the overall timeout; running out of time
//! returns the bytes acknowledged so far.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use amdtp_protocol::{Path, SendAction, SendState, MIN_FRAME_SIZE};
use log::{debug, error, trace, warn};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use crate::dispatcher::Reply;
use crate::error::{Result, SerialError};
use crate::fault::FaultLatch;
use crate::stats::LinkStats;
use crate::transport::Transport;

/// Packet timeouts granted to each owed ACK before the next chunk goes out
const SETTLE_WINDOW_FACTOR: u32 = 2;

/// One caller's write, answered with the acknowledged byte count
pub(crate) struct WriteRequest {
    pub data: Vec<u8>,
    pub done: std_mpsc::SyncSender<Result<usize>>,
}

/// Timing of the send loop
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriterTiming {
    pub timeout: Duration,
    pub packet_timeout: Duration,
}

pub(crate) struct Writer<T> {
    transport: Arc<T>,
    send: SendState,
    replies: mpsc::UnboundedReceiver<Reply>,
    fault: FaultLatch,
    stats: Arc<LinkStats>,
    max_payload: usize,
    timing: WriterTiming,
    /// Frames sent (DATA or resend request) whose ACK has not arrived
    unanswered: usize,
}

/// How a single chunk ended
enum ChunkOutcome {
    Acknowledged,
    OutOfTime,
}

impl<T: Transport> Writer<T> {
    pub fn new(
        transport: Arc<T>,
        replies: mpsc::UnboundedReceiver<Reply>,
        fault: FaultLatch,
        stats: Arc<LinkStats>,
        max_payload: usize,
        timing: WriterTiming,
    ) -> Self {
        Self {
            transport,
            send: SendState::new(),
            replies,
            fault,
            stats,
            max_payload,
            timing,
            unanswered: 0,
        }
    }

    pub async fn run(mut self, mut requests: mpsc::Receiver<WriteRequest>) {
        while let Some(request) = requests.recv().await {
            let result = self.write_all(&request.data).await;

            if let Err(e) = &result {
                error!("Write of {} bytes failed: {}", request.data.len(), e);
                if let SerialError::Protocol(violation) = e {
                    self.fault.trip(*violation);
                }
            }

            // The caller may have given up waiting
            let _ = request.done.send(result);
        }

        debug!("Write queue closed");
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<usize> {
        self.fault.check()?;

        if self.max_payload == 0 {
            return Err(SerialError::InvalidInput("link MTU leaves no room for payload"));
        }
        if data.is_empty() {
            return Ok(0);
        }

        let deadline = Instant::now() + self.timing.timeout;
        let mut written = 0;

        for chunk in data.chunks(self.max_payload) {
            match self.send_chunk(chunk, deadline).await? {
                ChunkOutcome::Acknowledged => {
                    written += chunk.len();
                    self.stats.written(chunk.len());
                }
                ChunkOutcome::OutOfTime => {
                    warn!(
                        "Write timed out after {} of {} bytes",
                        written,
                        data.len()
                    );
                    break;
                }
            }
        }

        Ok(written)
    }

    async fn send_chunk(&mut self, chunk: &[u8], deadline: Instant) -> Result<ChunkOutcome> {
        self.settle(deadline).await?;

        let frame = self.send.load(chunk)?.to_vec();
        let mut retransmission = false;

        loop {
            if Instant::now() >= deadline {
                return Ok(ChunkOutcome::OutOfTime);
            }

            // Answers still owed here belong to earlier copies of this frame
            let mut outdated = self.unanswered;
            self.transmit(Path::Data, &frame).await?;
            self.unanswered += 1;
            self.stats.data_sent(retransmission);

            loop {
                let Some(raw) = self.await_ack(deadline).await? else {
                    return Ok(ChunkOutcome::OutOfTime);
                };
                let stale = outdated > 0;
                outdated = outdated.saturating_sub(1);

                match self.send.on_ack(raw)? {
                    SendAction::Advance => return Ok(ChunkOutcome::Acknowledged),
                    SendAction::Retransmit if stale => trace!(
                        "Ignoring status {} for an earlier copy of sequence {}",
                        raw,
                        self.send.sequence()
                    ),
                    SendAction::Retransmit => break,
                }
            }

            debug!("Retransmitting sequence {}", self.send.sequence());
            retransmission = true;
        }
    }

    /// Wait for the next ACK status, asking the peer to resend its verdict
    /// every time the packet timeout passes in silence.
    ///
    /// Returns `None` once the deadline passes.
    async fn await_ack(&mut self, deadline: Instant) -> Result<Option<u8>> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            match timeout(self.timing.packet_timeout.min(remaining), self.replies.recv()).await {
                Ok(Some(Reply::Ack(raw))) => {
                    self.unanswered = self.unanswered.saturating_sub(1);
                    return Ok(Some(raw));
                }
                Ok(Some(Reply::Fault(violation))) => return Err(violation.into()),
                Ok(None) => return Err(SerialError::NotConnected),
                Err(_) => {
                    let request = self.send.resend_request()?;
                    debug!("No ACK for sequence {}, sending resend request", self.send.sequence());
                    self.transmit(Path::AckControl, &request).await?;
                    self.unanswered += 1;
                    self.stats.resend_request_sent();
                }
            }
        }
    }

    /// Swallow the answers still owed for frames of the previous chunk, so a
    /// late SUCCESS cannot acknowledge the next one.
    ///
    /// Each owed answer gets [`SETTLE_WINDOW_FACTOR`] packet timeouts to
    /// arrive; after that the rest are counted as lost.
    async fn settle(&mut self, deadline: Instant) -> Result<()> {
        while self.unanswered > 0 {
            let window = (self.timing.packet_timeout * SETTLE_WINDOW_FACTOR)
                .min(deadline.saturating_duration_since(Instant::now()));

            match timeout(window, self.replies.recv()).await {
                Ok(Some(Reply::Ack(raw))) => {
                    self.unanswered -= 1;
                    debug!("Discarding late ACK status {}", raw);
                }
                Ok(Some(Reply::Fault(violation))) => return Err(violation.into()),
                Ok(None) => return Err(SerialError::NotConnected),
                Err(_) => {
                    debug!("{} ACKs never arrived", self.unanswered);
                    self.unanswered = 0;
                }
            }
        }

        self.discard_stale_replies()
    }

    /// Drop ACKs nothing is waiting for.
    fn discard_stale_replies(&mut self) -> Result<()> {
        loop {
            match self.replies.try_recv() {
                Ok(Reply::Ack(raw)) => warn!("Discarding stale ACK status {}", raw),
                Ok(Reply::Fault(violation)) => return Err(violation.into()),
                Err(_) => return Ok(()),
            }
        }
    }

    async fn transmit(&mut self, path: Path, frame: &[u8]) -> Result<()> {
        if frame.len() < MIN_FRAME_SIZE {
            return Err(SerialError::InvalidInput("frame shorter than minimum frame size"));
        }
        trace!("tx {:?}: {:02x?}", path, frame);
        self.transport.write(path, frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use amdtp_protocol::{
        protocol, ControlCode, Frame, FrameType, ProtocolViolation, ReceiveState, Status,
    };

    use crate::transport::NotificationSink;

    /// Answers each write with the next scripted status; `None` stays silent
    struct Scripted {
        script: Mutex<Vec<Option<Status>>>,
        replies: mpsc::UnboundedSender<Reply>,
        writes: Mutex<Vec<(Path, Vec<u8>)>>,
    }

    impl Transport for Scripted {
        async fn connect(&self, _: &str, _: Duration, _: NotificationSink) -> Result<()> {
            Ok(())
        }

        async fn write(&self, path: Path, bytes: &[u8]) -> Result<()> {
            self.writes.lock().unwrap().push((path, bytes.to_vec()));
            let mut script = self.script.lock().unwrap();
            if !script.is_empty() {
                if let Some(status) = script.remove(0) {
                    let _ = self.replies.send(Reply::Ack(status as u8));
                }
            }
            Ok(())
        }

        fn mtu(&self) -> usize {
            16
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct SlowDevice {
        receive: ReceiveState,
        data_frames: usize,
        delivered: Vec<u8>,
    }

    /// Real receive state with every ACK delayed; DATA frame `lost` vanishes
    struct Slow {
        delay: Duration,
        lost: usize,
        replies: mpsc::UnboundedSender<Reply>,
        device: Mutex<SlowDevice>,
    }

    impl Transport for Slow {
        async fn connect(&self, _: &str, _: Duration, _: NotificationSink) -> Result<()> {
            Ok(())
        }

        async fn write(&self, path: Path, bytes: &[u8]) -> Result<()> {
            let status = {
                let mut device = self.device.lock().unwrap();
                match path {
                    Path::Data => {
                        let index = device.data_frames;
                        device.data_frames += 1;
                        if index == self.lost {
                            return Ok(());
                        }
                        let received = device.receive.on_data(bytes).unwrap();
                        if let Some(payload) = received.payload {
                            device.delivered.extend_from_slice(payload);
                        }
                        received.status
                    }
                    Path::AckControl => {
                        let frame = Frame::decode(bytes).unwrap();
                        device.receive.on_control(&frame).unwrap()
                    }
                }
            };

            let replies = self.replies.clone();
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = replies.send(Reply::Ack(status as u8));
            });
            Ok(())
        }

        fn mtu(&self) -> usize {
            16
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    fn writer(script: Vec<Option<Status>>, packet_timeout_ms: u64) -> (Writer<Scripted>, Arc<Scripted>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Scripted {
            script: Mutex::new(script),
            replies: tx,
            writes: Mutex::new(Vec::new()),
        });
        let writer = Writer::new(
            Arc::clone(&transport),
            rx,
            FaultLatch::new(),
            Arc::new(LinkStats::new()),
            5,
            WriterTiming {
                timeout: Duration::from_secs(2),
                packet_timeout: Duration::from_millis(packet_timeout_ms),
            },
        );
        (writer, transport)
    }

    fn decoded(transport: &Scripted) -> Vec<(Path, FrameType, u8, Vec<u8>)> {
        transport
            .writes
            .lock()
            .unwrap()
            .iter()
            .map(|(path, bytes)| {
                let frame = Frame::decode(bytes).unwrap();
                (*path, frame.header.frame_type, frame.header.sequence, frame.payload.to_vec())
            })
            .collect()
    }

    #[tokio::test]
    async fn test_chunks_in_sequence() {
        let (mut writer, transport) = writer(vec![Some(Status::Success); 3], 100);

        assert_eq!(writer.write_all(b"HELLO WORLD").await.unwrap(), 11);

        let frames = decoded(&transport);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].2, 0);
        assert_eq!(frames[0].3, b"HELLO");
        assert_eq!(frames[1].2, 1);
        assert_eq!(frames[1].3, b" WORL");
        assert_eq!(frames[2].2, 2);
        assert_eq!(frames[2].3, b"D");
        assert_eq!(writer.send.sequence(), 3);
    }

    #[tokio::test]
    async fn test_crc_errors_retransmit_identical_frame() {
        let k = 3;
        let mut script = vec![Some(Status::CrcError); k];
        script.push(Some(Status::Success));
        let (mut writer, transport) = writer(script, 100);

        assert_eq!(writer.write_all(b"abc").await.unwrap(), 3);

        let writes = transport.writes.lock().unwrap();
        assert_eq!(writes.len(), k + 1);
        assert!(writes.iter().all(|w| *w == writes[0]));
        assert_eq!(writer.send.sequence(), 1);
    }

    #[tokio::test]
    async fn test_silence_sends_resend_request() {
        // DATA is met with silence; the resend request gets SUCCESS
        let (mut writer, transport) = writer(vec![None, Some(Status::Success)], 20);

        assert_eq!(writer.write_all(b"abc").await.unwrap(), 3);

        let frames = decoded(&transport);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0, Path::Data);
        assert_eq!(frames[1].0, Path::AckControl);
        assert_eq!(frames[1].1, FrameType::Control);
        assert_eq!(frames[1].3, [ControlCode::ResendRequest as u8, 0]);
    }

    #[tokio::test]
    async fn test_insufficient_buffer_aborts() {
        let (mut writer, _transport) = writer(vec![Some(Status::InsufficientBuffer)], 100);

        assert!(matches!(
            writer.write_all(b"abcdefgh").await,
            Err(SerialError::Protocol(ProtocolViolation::InsufficientBuffer))
        ));
    }

    #[tokio::test]
    async fn test_timeout_returns_partial_count() {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Scripted {
            script: Mutex::new(vec![Some(Status::Success)]),
            replies: tx,
            writes: Mutex::new(Vec::new()),
        });
        let mut writer = Writer::new(
            Arc::clone(&transport),
            rx,
            FaultLatch::new(),
            Arc::new(LinkStats::new()),
            5,
            WriterTiming {
                timeout: Duration::from_millis(150),
                packet_timeout: Duration::from_millis(40),
            },
        );

        assert_eq!(writer.write_all(b"0123456789").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_stale_ack_discarded() {
        let (mut writer, _transport) = writer(vec![Some(Status::Success)], 100);
        let _ = writer.transport.replies.send(Reply::Ack(Status::CrcError as u8));

        assert_eq!(writer.write_all(b"abc").await.unwrap(), 3);
        assert_eq!(writer.stats.snapshot().retransmissions, 0);
    }

    #[tokio::test]
    async fn test_late_acks_never_acknowledge_the_next_chunk() {
        // Every ACK takes 1.5 packet timeouts, so each chunk also draws a
        // resend request whose answer lands after the chunk has advanced
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Slow {
            delay: Duration::from_millis(30),
            lost: 1,
            replies: tx,
            device: Mutex::new(SlowDevice::default()),
        });
        let mut writer = Writer::new(
            Arc::clone(&transport),
            rx,
            FaultLatch::new(),
            Arc::new(LinkStats::new()),
            5,
            WriterTiming {
                timeout: Duration::from_secs(2),
                packet_timeout: Duration::from_millis(20),
            },
        );

        assert_eq!(writer.write_all(b"0123456789").await.unwrap(), 10);
        assert_eq!(transport.device.lock().unwrap().delivered, b"0123456789");

        assert_eq!(writer.write_all(b"abcde").await.unwrap(), 5);
        assert_eq!(transport.device.lock().unwrap().delivered, b"0123456789abcde");
        assert!(writer.stats.snapshot().retransmissions >= 1);
    }

    #[tokio::test]
    async fn test_empty_write() {
        let (mut writer, transport) = writer(vec![], 100);
        assert_eq!(writer.write_all(b"").await.unwrap(), 0);
        assert!(transport.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_short_frame_rejected() {
        let (mut writer, transport) = writer(vec![], 100);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let result = runtime.block_on(writer.transmit(Path::Data, &protocol::data(0, b"").unwrap()[..7]));
        assert!(matches!(result, Err(SerialError::InvalidInput(_))));
        assert!(transport.writes.lock().unwrap().is_empty());
    }
}
