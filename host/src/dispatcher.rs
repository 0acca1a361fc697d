//! # Notification Dispatcher
//!
//! Background task that consumes every notification the transport delivers
//! and routes it by path:
//!
//! ```text
//!                 ┌─► DATA ──► ReceiveState ──► inbound queue ──► read()
//!  notification ──┤              └─► ACK(verdict) ──► transport
//!                 │
//!                 └─► ACK ──────► reply queue ──► writer task
//!                     CONTROL ──► ReceiveState ──► ACK(SUCCESS | RESEND_REPLY)
//! ```
//!
//! CONTROL frames are answered here and never reach the reply queue, so the
//! writer only ever sees ACKs.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use amdtp_protocol::{
    protocol, Frame, FrameType, FramingError, Path, ProtocolViolation, ReceiveState, Status,
};
use log::{debug, error, trace, warn};
use tokio::sync::mpsc;

use crate::error::{Result, SerialError};
use crate::fault::FaultLatch;
use crate::stats::LinkStats;
use crate::transport::{Notification, Transport};

/// What the writer task receives from the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reply {
    /// Raw status byte of an intact ACK frame
    Ack(u8),
    /// The link hit a protocol violation; abort
    Fault(ProtocolViolation),
}

pub(crate) struct Dispatcher<T> {
    transport: Arc<T>,
    receive: ReceiveState,
    inbound: std_mpsc::Sender<Vec<u8>>,
    replies: mpsc::UnboundedSender<Reply>,
    fault: FaultLatch,
    stats: Arc<LinkStats>,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(
        transport: Arc<T>,
        inbound: std_mpsc::Sender<Vec<u8>>,
        replies: mpsc::UnboundedSender<Reply>,
        fault: FaultLatch,
        stats: Arc<LinkStats>,
    ) -> Self {
        Self {
            transport,
            receive: ReceiveState::new(),
            inbound,
            replies,
            fault,
            stats,
        }
    }

    /// Process notifications until the transport drops its sink or the
    /// link hits a protocol violation.
    pub async fn run(mut self, mut notifications: mpsc::UnboundedReceiver<Notification>) {
        while let Some(notification) = notifications.recv().await {
            trace!(
                "rx {:?}: {:02x?}",
                notification.path,
                notification.bytes.as_slice()
            );

            let result = match notification.path {
                Path::Data => self.on_data(&notification.bytes).await,
                Path::AckControl => self.on_ack_control(&notification.bytes).await,
            };

            match result {
                Ok(()) => {}
                Err(SerialError::Protocol(violation)) => {
                    error!("Protocol violation: {}", violation);
                    self.fault.trip(violation);
                    let _ = self.replies.send(Reply::Fault(violation));
                    return;
                }
                // A lost ACK is recovered by the peer's resend request
                Err(e) => warn!("Failed to answer {:?} frame: {}", notification.path, e),
            }
        }

        debug!("Notification stream closed");
    }

    async fn on_data(&mut self, bytes: &[u8]) -> Result<()> {
        let received = self.receive.on_data(bytes)?;
        self.stats.data_received(received.status);

        match received.payload {
            Some(payload) => {
                debug!("Accepted {} bytes", payload.len());
                if self.inbound.send(payload.to_vec()).is_err() {
                    debug!("Inbound queue closed, payload discarded");
                }
            }
            None => debug!("Rejected DATA frame: {:?}", received.status),
        }

        self.send_ack(received.status).await
    }

    async fn on_ack_control(&mut self, bytes: &[u8]) -> Result<()> {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(FramingError::UnknownFrameType(raw)) => {
                return Err(ProtocolViolation::UnknownFrameType {
                    path: Path::AckControl,
                    raw,
                }
                .into());
            }
            Err(e) => {
                warn!("Dropping malformed ack/control frame: {}", e);
                return Ok(());
            }
        };

        if !frame.is_intact() {
            warn!("Dropping ack/control frame with bad CRC");
            return Ok(());
        }

        match frame.header.frame_type {
            FrameType::Ack => {
                let &[status, ..] = frame.payload else {
                    return Err(ProtocolViolation::MalformedPayload {
                        frame_type: FrameType::Ack,
                        len: frame.payload.len(),
                    }
                    .into());
                };
                self.stats.ack_received(status);
                let _ = self.replies.send(Reply::Ack(status));
                Ok(())
            }
            FrameType::Control => {
                let status = self.receive.on_control(&frame)?;
                debug!("Answering resend request with {:?}", status);
                self.send_ack(status).await
            }
            found @ FrameType::Data => Err(ProtocolViolation::UnexpectedFrameType {
                path: Path::AckControl,
                found,
            }
            .into()),
        }
    }

    async fn send_ack(&self, status: Status) -> Result<()> {
        let frame = protocol::ack(status)?;
        trace!("tx {:?}: {:02x?}", Path::AckControl, frame.as_slice());
        self.transport.write(Path::AckControl, &frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amdtp_protocol::ControlCode;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::transport::NotificationSink;

    #[derive(Default)]
    struct Recorder {
        writes: Mutex<Vec<(Path, Vec<u8>)>>,
    }

    impl Transport for Recorder {
        async fn connect(&self, _: &str, _: Duration, _: NotificationSink) -> Result<()> {
            Ok(())
        }

        async fn write(&self, path: Path, bytes: &[u8]) -> Result<()> {
            self.writes.lock().unwrap().push((path, bytes.to_vec()));
            Ok(())
        }

        fn mtu(&self) -> usize {
            23
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        transport: Arc<Recorder>,
        notify: mpsc::UnboundedSender<Notification>,
        inbound: std_mpsc::Receiver<Vec<u8>>,
        replies: mpsc::UnboundedReceiver<Reply>,
        fault: FaultLatch,
        task: tokio::task::JoinHandle<()>,
    }

    fn start() -> Harness {
        let transport = Arc::new(Recorder::default());
        let (inbound_tx, inbound) = std_mpsc::channel();
        let (replies_tx, replies) = mpsc::unbounded_channel();
        let (notify, notifications) = mpsc::unbounded_channel();
        let fault = FaultLatch::new();

        let dispatcher = Dispatcher::new(
            Arc::clone(&transport),
            inbound_tx,
            replies_tx,
            fault.clone(),
            Arc::new(LinkStats::new()),
        );
        let task = tokio::spawn(dispatcher.run(notifications));

        Harness {
            transport,
            notify,
            inbound,
            replies,
            fault,
            task,
        }
    }

    fn push(harness: &Harness, path: Path, bytes: &[u8]) {
        harness
            .notify
            .send(Notification {
                path,
                bytes: bytes.to_vec(),
            })
            .unwrap();
    }

    fn acks_written(harness: &Harness) -> Vec<u8> {
        harness
            .transport
            .writes
            .lock()
            .unwrap()
            .iter()
            .map(|(path, bytes)| {
                assert_eq!(*path, Path::AckControl);
                let frame = Frame::decode(bytes).unwrap();
                assert_eq!(frame.header.frame_type, FrameType::Ack);
                frame.payload[0]
            })
            .collect()
    }

    #[tokio::test]
    async fn test_data_is_queued_and_acked() {
        let harness = start();

        push(&harness, Path::Data, &protocol::data(0, b"abc").unwrap());
        let mut corrupt = protocol::data(1, b"def").unwrap();
        corrupt[4] ^= 0x80;
        push(&harness, Path::Data, &corrupt);
        push(&harness, Path::Data, &[0x01, 0x00, 0x00]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(harness.inbound.try_recv().unwrap(), b"abc");
        assert!(harness.inbound.try_recv().is_err());
        assert_eq!(
            acks_written(&harness),
            [
                Status::Success as u8,
                Status::CrcError as u8,
                Status::InvalidPktLength as u8
            ]
        );
    }

    #[tokio::test]
    async fn test_acks_reach_writer_and_control_does_not() {
        let mut harness = start();

        push(&harness, Path::Data, &protocol::data(6, b"x").unwrap());
        push(
            &harness,
            Path::AckControl,
            &protocol::control(ControlCode::ResendRequest, 6).unwrap(),
        );
        push(
            &harness,
            Path::AckControl,
            &protocol::ack(Status::ResendReply).unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            harness.replies.try_recv(),
            Ok(Reply::Ack(Status::ResendReply as u8))
        );
        assert!(harness.replies.try_recv().is_err());
        assert_eq!(
            acks_written(&harness),
            [Status::Success as u8, Status::Success as u8]
        );
    }

    #[tokio::test]
    async fn test_corrupt_ack_is_dropped() {
        let mut harness = start();

        let mut corrupt = protocol::ack(Status::Success).unwrap();
        corrupt[4] ^= 0x01;
        push(&harness, Path::AckControl, &corrupt);
        push(&harness, Path::AckControl, &[0x02]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(harness.replies.try_recv().is_err());
        assert!(harness.fault.get().is_none());
    }

    #[tokio::test]
    async fn test_violation_is_sticky_and_stops_dispatch() {
        let mut harness = start();

        push(&harness, Path::Data, &protocol::ack(Status::Success).unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let violation = ProtocolViolation::UnexpectedFrameType {
            path: Path::Data,
            found: FrameType::Ack,
        };
        assert_eq!(harness.replies.try_recv(), Ok(Reply::Fault(violation)));
        assert_eq!(harness.fault.get(), Some(violation));
        assert!(harness.task.is_finished());
        assert!(acks_written(&harness).is_empty());
    }

    #[tokio::test]
    async fn test_data_on_ack_path_is_violation() {
        let harness = start();

        push(&harness, Path::AckControl, &protocol::data(0, b"x").unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            harness.fault.get(),
            Some(ProtocolViolation::UnexpectedFrameType {
                path: Path::AckControl,
                found: FrameType::Data
            })
        );
    }
}
