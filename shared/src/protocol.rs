//! # AMDTP Frame Format
//!
//! This module defines the wire format of the Ambiq Micro Data Transfer
//! Protocol. It is pure data transformation: no I/O, no state.
//!
//! ## Frame Layout
//!
//! ```text
//! ┌──────────┬──────────┬──────────────────┬──────────┐
//! │  Length  │  Header  │     Payload      │  CRC-32  │
//! │ 2 bytes  │ 2 bytes  │  Variable size   │ 4 bytes  │
//! └──────────┴──────────┴──────────────────┴──────────┘
//! ```
//!
//! All multi-byte fields are little-endian. `Length` counts the bytes that
//! follow it (header + payload + CRC). The CRC covers the payload only.
//!
//! ## Header Bits
//!
//! ```text
//!  15    12 11     8   7     6    5        0
//! ┌────────┬────────┬─────┬─────┬──────────┐
//! │  type  │   SN   │ enc │ ack │ reserved │
//! └────────┴────────┴─────┴─────┴──────────┘
//! ```
//!
//! ## Payloads
//!
//! - **Data**: an application chunk
//! - **Ack**: one status byte
//! - **Control**: control code followed by a sequence number

use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::{ATT_MAX_MTU, MTU_OVERHEAD};

/// Size of the length prefix
pub const LENGTH_SIZE: usize = 2;

/// Size of the bit-packed header
pub const HEADER_SIZE: usize = 2;

/// Size of the trailing CRC-32
pub const CRC_SIZE: usize = 4;

/// Bytes a frame adds around its payload
pub const FRAME_OVERHEAD: usize = LENGTH_SIZE + HEADER_SIZE + CRC_SIZE;

/// Smallest well-formed frame (empty payload)
pub const MIN_FRAME_SIZE: usize = FRAME_OVERHEAD;

/// Largest payload any link can carry (ATT maximum MTU minus overhead)
pub const MAX_PAYLOAD_SIZE: usize = ATT_MAX_MTU - MTU_OVERHEAD;

/// Largest encoded frame
pub const MAX_FRAME_SIZE: usize = MAX_PAYLOAD_SIZE + FRAME_OVERHEAD;

/// An encoded frame, ready for a characteristic write
pub type EncodedFrame = Vec<u8, MAX_FRAME_SIZE>;

const ENABLE_ACK_OFFSET: u16 = 6;
const ENCRYPTION_OFFSET: u16 = 7;
const SN_OFFSET: u16 = 8;
const TYPE_OFFSET: u16 = 12;

const FLAG_MASK: u16 = 0b1;
const SN_MASK: u16 = 0b1111;
const TYPE_MASK: u16 = 0b1111;

/// Frame types carried in the header's top nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FrameType {
    /// Application payload chunk
    Data = 1,
    /// Receiver verdict for the last data or control frame
    Ack = 2,
    /// Control request (resend request)
    Control = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Data),
            2 => Ok(Self::Ack),
            3 => Ok(Self::Control),
            other => Err(other),
        }
    }
}

/// Receiver verdicts, sent as the single payload byte of an ACK frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Status {
    Success = 0,
    CrcError = 1,
    InvalidMetadataInfo = 2,
    InvalidPktLength = 3,
    InsufficientBuffer = 4,
    UnknownError = 5,
    Busy = 6,
    /// No connection, or transmitter busy
    TxNotReady = 7,
    /// Answer to a resend request: the referenced frame was not accepted
    ResendReply = 8,
    ReceiveContinue = 9,
    ReceiveDone = 10,
}

impl TryFrom<u8> for Status {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Success),
            1 => Ok(Self::CrcError),
            2 => Ok(Self::InvalidMetadataInfo),
            3 => Ok(Self::InvalidPktLength),
            4 => Ok(Self::InsufficientBuffer),
            5 => Ok(Self::UnknownError),
            6 => Ok(Self::Busy),
            7 => Ok(Self::TxNotReady),
            8 => Ok(Self::ResendReply),
            9 => Ok(Self::ReceiveContinue),
            10 => Ok(Self::ReceiveDone),
            other => Err(other),
        }
    }
}

/// Control codes carried in the first payload byte of a CONTROL frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ControlCode {
    /// "What is the last sequence number you accepted?"
    ResendRequest = 0,
}

impl TryFrom<u8> for ControlCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::ResendRequest),
            other => Err(other),
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Header {
    /// Ack-enable flag (never set by this implementation)
    pub ack_enabled: bool,
    /// Encryption flag (reserved, always clear)
    pub encrypted: bool,
    /// Sequence number, 0..=15
    pub sequence: u8,
    /// Frame type
    pub frame_type: FrameType,
}

impl Header {
    /// Create a plain header for the given type and sequence number
    pub const fn new(frame_type: FrameType, sequence: u8) -> Self {
        Self {
            ack_enabled: false,
            encrypted: false,
            sequence,
            frame_type,
        }
    }

    /// Pack into the on-wire 16-bit representation
    pub fn to_bits(&self) -> u16 {
        let mut bits = 0u16;
        bits |= (self.ack_enabled as u16 & FLAG_MASK) << ENABLE_ACK_OFFSET;
        bits |= (self.encrypted as u16 & FLAG_MASK) << ENCRYPTION_OFFSET;
        bits |= (self.sequence as u16 & SN_MASK) << SN_OFFSET;
        bits |= (self.frame_type as u16 & TYPE_MASK) << TYPE_OFFSET;
        bits
    }

    /// Unpack from the on-wire 16-bit representation
    pub fn from_bits(bits: u16) -> Result<Self, FramingError> {
        let raw_type = ((bits >> TYPE_OFFSET) & TYPE_MASK) as u8;
        let frame_type =
            FrameType::try_from(raw_type).map_err(FramingError::UnknownFrameType)?;

        Ok(Self {
            ack_enabled: (bits >> ENABLE_ACK_OFFSET) & FLAG_MASK == 1,
            encrypted: (bits >> ENCRYPTION_OFFSET) & FLAG_MASK == 1,
            sequence: ((bits >> SN_OFFSET) & SN_MASK) as u8,
            frame_type,
        })
    }
}

/// A decoded frame borrowing its payload from the received bytes
///
/// A CRC mismatch does not prevent decoding: the structural fields are
/// returned and [`Frame::verdict`] reports [`Status::CrcError`]. Whether to
/// trust the payload is the caller's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub header: Header,
    pub payload: &'a [u8],
    /// CRC as carried on the wire
    pub crc: u32,
    crc_valid: bool,
}

impl<'a> Frame<'a> {
    /// Parse a frame.
    ///
    /// The length prefix is validated before anything else; a mismatch is
    /// rejected without looking at the CRC.
    pub fn decode(bytes: &'a [u8]) -> Result<Self, FramingError> {
        if bytes.len() < MIN_FRAME_SIZE {
            return Err(FramingError::TooShort { len: bytes.len() });
        }

        let declared = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        let actual = bytes.len() - LENGTH_SIZE;
        if declared != actual {
            return Err(FramingError::LengthMismatch { declared, actual });
        }

        let header = Header::from_bits(u16::from_le_bytes([bytes[2], bytes[3]]))?;

        let crc_start = bytes.len() - CRC_SIZE;
        let payload = &bytes[LENGTH_SIZE + HEADER_SIZE..crc_start];
        let crc = u32::from_le_bytes([
            bytes[crc_start],
            bytes[crc_start + 1],
            bytes[crc_start + 2],
            bytes[crc_start + 3],
        ]);

        Ok(Self {
            header,
            payload,
            crc,
            crc_valid: crc32fast::hash(payload) == crc,
        })
    }

    /// `true` when the payload matched its CRC
    pub fn is_intact(&self) -> bool {
        self.crc_valid
    }

    /// Receiver verdict for this frame
    pub fn verdict(&self) -> Status {
        if self.crc_valid {
            Status::Success
        } else {
            Status::CrcError
        }
    }
}

/// Encode a frame into `buffer`.
///
/// Returns the number of bytes written.
pub fn encode_into(header: Header, payload: &[u8], buffer: &mut [u8]) -> Result<usize, EncodeError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(EncodeError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let total = payload.len() + FRAME_OVERHEAD;
    if buffer.len() < total {
        return Err(EncodeError::BufferTooSmall {
            needed: total,
            available: buffer.len(),
        });
    }

    let length = (HEADER_SIZE + payload.len() + CRC_SIZE) as u16;
    buffer[0..LENGTH_SIZE].copy_from_slice(&length.to_le_bytes());
    buffer[LENGTH_SIZE..LENGTH_SIZE + HEADER_SIZE].copy_from_slice(&header.to_bits().to_le_bytes());

    let payload_start = LENGTH_SIZE + HEADER_SIZE;
    let crc_start = payload_start + payload.len();
    buffer[payload_start..crc_start].copy_from_slice(payload);
    buffer[crc_start..total].copy_from_slice(&crc32fast::hash(payload).to_le_bytes());

    Ok(total)
}

/// Encode a frame into an owned buffer
pub fn encode(header: Header, payload: &[u8]) -> Result<EncodedFrame, EncodeError> {
    let mut scratch = [0u8; MAX_FRAME_SIZE];
    let len = encode_into(header, payload, &mut scratch)?;

    Vec::from_slice(&scratch[..len]).map_err(|_| EncodeError::BufferTooSmall {
        needed: len,
        available: MAX_FRAME_SIZE,
    })
}

/// Encode a DATA frame
pub fn data(sequence: u8, payload: &[u8]) -> Result<EncodedFrame, EncodeError> {
    encode(Header::new(FrameType::Data, sequence), payload)
}

/// Encode an ACK frame carrying `status`
pub fn ack(status: Status) -> Result<EncodedFrame, EncodeError> {
    encode(Header::new(FrameType::Ack, 0), &[status as u8])
}

/// Encode a CONTROL frame.
///
/// The header sequence stays zero; `sequence` travels in the payload.
pub fn control(code: ControlCode, sequence: u8) -> Result<EncodedFrame, EncodeError> {
    encode(Header::new(FrameType::Control, 0), &[code as u8, sequence])
}

/// Errors while parsing a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FramingError {
    /// Fewer bytes than the smallest possible frame
    TooShort { len: usize },
    /// Length prefix disagrees with the bytes that follow it
    LengthMismatch { declared: usize, actual: usize },
    /// Header type nibble is not a known frame type
    UnknownFrameType(u8),
}

impl FramingError {
    /// The verdict a receiver reports for this error, if it is a wire verdict
    pub fn status(&self) -> Option<Status> {
        match self {
            FramingError::TooShort { .. } | FramingError::LengthMismatch { .. } => {
                Some(Status::InvalidPktLength)
            }
            FramingError::UnknownFrameType(_) => None,
        }
    }
}

impl core::fmt::Display for FramingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FramingError::TooShort { len } => {
                write!(f, "frame of {len} bytes is shorter than {MIN_FRAME_SIZE}")
            }
            FramingError::LengthMismatch { declared, actual } => {
                write!(f, "length field says {declared} bytes, frame carries {actual}")
            }
            FramingError::UnknownFrameType(raw) => write!(f, "unknown frame type {raw}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FramingError {}

/// Errors while building a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EncodeError {
    /// Payload exceeds the largest payload a link can carry
    PayloadTooLarge { len: usize, max: usize },
    /// Output buffer cannot hold the frame
    BufferTooSmall { needed: usize, available: usize },
}

impl core::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EncodeError::PayloadTooLarge { len, max } => {
                write!(f, "payload of {len} bytes exceeds maximum {max}")
            }
            EncodeError::BufferTooSmall { needed, available } => {
                write!(f, "frame needs {needed} bytes, buffer holds {available}")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EncodeError {}
