//! # Link-Layer State Machines
//!
//! Sequence and acknowledgment state for one direction of an AMDTP link.
//! Both types only decide; the caller owns the transport and performs every
//! write these decisions call for.
//!
//! ```text
//!   sender                                   receiver
//!   ──────                                   ────────
//!   SendState::load ── DATA(sn) ───────────► ReceiveState::on_data
//!                   ◄──────────── ACK(verdict)
//!   SendState::on_ack
//!
//!   (no ACK in time)
//!   SendState::resend_request ── CONTROL ──► ReceiveState::on_control
//!                   ◄──────── ACK(SUCCESS | RESEND_REPLY)
//! ```
//!
//! At most one DATA frame per direction is unacknowledged at any time.

use crate::protocol::{
    self, ControlCode, EncodeError, EncodedFrame, Frame, FrameType, FramingError, Status,
};

/// Sequence numbers count modulo 16 (four header bits)
pub const SEQUENCE_MODULUS: u8 = 16;

/// The sequence number that follows `sequence`
#[inline]
pub const fn next_sequence(sequence: u8) -> u8 {
    (sequence + 1) % SEQUENCE_MODULUS
}

/// The two logical paths of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Path {
    /// DATA frames (write characteristic one way, notify characteristic the other)
    Data,
    /// ACK and CONTROL frames
    AckControl,
}

/// Peer or implementation bugs. None of these is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolViolation {
    /// A valid frame type arrived on a path that never carries it
    UnexpectedFrameType { path: Path, found: FrameType },
    /// The header named a frame type that does not exist
    UnknownFrameType { path: Path, raw: u8 },
    /// CONTROL frame with a control code this side does not implement
    UnsupportedControl(u8),
    /// ACK status the sender has no handling for
    UnhandledStatus(Status),
    /// ACK byte that is not a status at all
    UnknownStatus(u8),
    /// Peer ran out of receive buffer; no recovery is defined for this
    InsufficientBuffer,
    /// ACK or CONTROL payload too short to carry its fields
    MalformedPayload { frame_type: FrameType, len: usize },
}

impl core::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ProtocolViolation::UnexpectedFrameType { path, found } => {
                write!(f, "unexpected {found:?} frame on {path:?} path")
            }
            ProtocolViolation::UnknownFrameType { path, raw } => {
                write!(f, "unknown frame type {raw} on {path:?} path")
            }
            ProtocolViolation::UnsupportedControl(code) => {
                write!(f, "unsupported control code {code}")
            }
            ProtocolViolation::UnhandledStatus(status) => {
                write!(f, "unhandled ack status {status:?}")
            }
            ProtocolViolation::UnknownStatus(raw) => write!(f, "unknown ack status {raw}"),
            ProtocolViolation::InsufficientBuffer => {
                write!(f, "peer reported insufficient buffer")
            }
            ProtocolViolation::MalformedPayload { frame_type, len } => {
                write!(f, "{frame_type:?} frame with {len}-byte payload")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ProtocolViolation {}

/// What the sender does after an ACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendAction {
    /// Frame accepted; sequence advanced, move to the next chunk
    Advance,
    /// Frame not accepted; transmit the pending frame again, unchanged
    Retransmit,
}

/// Send-side state: the next sequence number and the frame awaiting an ACK
#[derive(Debug, Default)]
pub struct SendState {
    sequence: u8,
    pending: Option<EncodedFrame>,
}

impl SendState {
    pub const fn new() -> Self {
        Self {
            sequence: 0,
            pending: None,
        }
    }

    /// Sequence number the pending (or next) DATA frame carries
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Frame retained until acknowledged
    pub fn pending(&self) -> Option<&[u8]> {
        self.pending.as_deref()
    }

    /// Encode `chunk` as the pending DATA frame and return its bytes.
    ///
    /// Replaces any frame still pending from an abandoned send.
    pub fn load(&mut self, chunk: &[u8]) -> Result<&[u8], EncodeError> {
        let frame = protocol::data(self.sequence, chunk)?;
        Ok(self.pending.insert(frame).as_slice())
    }

    /// CONTROL frame asking the peer whether the pending sequence was accepted
    pub fn resend_request(&self) -> Result<EncodedFrame, EncodeError> {
        protocol::control(ControlCode::ResendRequest, self.sequence)
    }

    /// Apply an ACK status byte
    pub fn on_ack(&mut self, raw: u8) -> Result<SendAction, ProtocolViolation> {
        let status = Status::try_from(raw).map_err(ProtocolViolation::UnknownStatus)?;

        match status {
            Status::Success => {
                self.sequence = next_sequence(self.sequence);
                self.pending = None;
                Ok(SendAction::Advance)
            }
            Status::CrcError | Status::InvalidPktLength | Status::ResendReply => {
                Ok(SendAction::Retransmit)
            }
            Status::InsufficientBuffer => Err(ProtocolViolation::InsufficientBuffer),
            Status::InvalidMetadataInfo
            | Status::UnknownError
            | Status::Busy
            | Status::TxNotReady
            | Status::ReceiveContinue
            | Status::ReceiveDone => Err(ProtocolViolation::UnhandledStatus(status)),
        }
    }
}

/// Outcome of receiving one DATA-path frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received<'a> {
    /// Verdict to send back in the ACK
    pub status: Status,
    /// Accepted payload, present only on success
    pub payload: Option<&'a [u8]>,
}

/// Receive-side state: the last sequence number accepted
#[derive(Debug, Default, Clone, Copy)]
pub struct ReceiveState {
    last_accepted: Option<u8>,
}

impl ReceiveState {
    pub const fn new() -> Self {
        Self {
            last_accepted: None,
        }
    }

    /// Sequence number of the last accepted DATA frame, if any
    pub fn last_accepted(&self) -> Option<u8> {
        self.last_accepted
    }

    /// Validate a frame that arrived on the data path.
    ///
    /// CRC and length failures are verdicts, not errors: they are reported
    /// back in the ACK and recovery is left to the sender. A length failure
    /// hides the frame type, so no type check is possible for it.
    pub fn on_data<'a>(&mut self, bytes: &'a [u8]) -> Result<Received<'a>, ProtocolViolation> {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(FramingError::TooShort { .. }) | Err(FramingError::LengthMismatch { .. }) => {
                return Ok(Received {
                    status: Status::InvalidPktLength,
                    payload: None,
                });
            }
            Err(FramingError::UnknownFrameType(raw)) => {
                return Err(ProtocolViolation::UnknownFrameType {
                    path: Path::Data,
                    raw,
                });
            }
        };

        match frame.header.frame_type {
            FrameType::Data => {}
            found @ (FrameType::Ack | FrameType::Control) => {
                return Err(ProtocolViolation::UnexpectedFrameType {
                    path: Path::Data,
                    found,
                });
            }
        }

        match frame.verdict() {
            Status::Success => {
                self.last_accepted = Some(frame.header.sequence);
                Ok(Received {
                    status: Status::Success,
                    payload: Some(frame.payload),
                })
            }
            status => Ok(Received {
                status,
                payload: None,
            }),
        }
    }

    /// Answer a resend request for `sequence`.
    ///
    /// `Success` tells the peer its frame was accepted and only the ACK was
    /// lost; `ResendReply` makes it retransmit.
    pub fn on_resend_request(&self, sequence: u8) -> Status {
        if self.last_accepted == Some(sequence) {
            Status::Success
        } else {
            Status::ResendReply
        }
    }

    /// Answer an intact CONTROL frame
    pub fn on_control(&self, frame: &Frame<'_>) -> Result<Status, ProtocolViolation> {
        let &[code, sequence, ..] = frame.payload else {
            return Err(ProtocolViolation::MalformedPayload {
                frame_type: FrameType::Control,
                len: frame.payload.len(),
            });
        };

        match ControlCode::try_from(code).map_err(ProtocolViolation::UnsupportedControl)? {
            ControlCode::ResendRequest => Ok(self.on_resend_request(sequence)),
        }
    }
}
