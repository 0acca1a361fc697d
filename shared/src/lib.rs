//! # AMDTP Protocol Library
//!
//! This crate provides the link layer of the Ambiq Micro Data Transfer
//! Protocol (AMDTP), used to move a byte stream over a BLE GATT service:
//!
//! - **Frame Codec**: length-prefixed, CRC-32 protected frames ([`protocol`])
//! - **Link State Machines**: sequence numbering, ACK handling and resend
//!   recovery for one direction of the link ([`link`])
//! - **Link Constants**: MTU overhead and the service's characteristic UUIDs
//!
//! ## Architecture
//!
//! ```text
//! Host byte stream ──► SendState ──► DATA ──► write characteristic ──► Device
//!                          ▲
//!                          └──── ACK ◄──── ack/control characteristic ◄──┘
//!
//! Device ──► notify characteristic ──► DATA ──► ReceiveState ──► byte stream
//!                                                    │
//!                        ack/control characteristic ◄┘ ACK
//! ```
//!
//! Nothing here performs I/O, so the same code runs on the host and on the
//! device firmware.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod link;
pub mod protocol;

// Re-export main types for convenience
pub use link::{
    next_sequence, Path, ProtocolViolation, ReceiveState, Received, SendAction, SendState,
    SEQUENCE_MODULUS,
};
pub use protocol::{
    ControlCode, EncodeError, EncodedFrame, Frame, FrameType, FramingError, Header, Status,
    MAX_PAYLOAD_SIZE, MIN_FRAME_SIZE,
};

/// Library version for protocol compatibility checks
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest ATT MTU the Bluetooth core specification allows
pub const ATT_MAX_MTU: usize = 517;

/// ATT write/notify PDU header: 1-byte opcode plus 2-byte attribute handle
pub const ATT_HEADER_SIZE: usize = 3;

/// Bytes of every MTU not available to payload: the ATT header plus the
/// frame's length, header and CRC fields
pub const MTU_OVERHEAD: usize = ATT_HEADER_SIZE + protocol::FRAME_OVERHEAD;

const _: () = assert!(MTU_OVERHEAD == 11);

/// Largest DATA payload for a link with the given MTU.
///
/// Zero means the MTU cannot carry any payload.
pub const fn max_payload_for_mtu(mtu: usize) -> usize {
    let mtu = if mtu > ATT_MAX_MTU { ATT_MAX_MTU } else { mtu };
    mtu.saturating_sub(MTU_OVERHEAD)
}

/// GATT layout of the AMDTP service
pub mod gatt {
    /// Host → device DATA frames (write without response)
    pub const DATA_WRITE_UUID: u128 = 0x00002760_08c2_11e1_9073_0e8ac72e0011;

    /// Device → host DATA frames (notify)
    pub const DATA_NOTIFY_UUID: u128 = 0x00002760_08c2_11e1_9073_0e8ac72e0012;

    /// ACK and CONTROL frames, both directions (write without response + notify)
    pub const ACK_CONTROL_UUID: u128 = 0x00002760_08c2_11e1_9073_0e8ac72e0013;

    /// MTU assumed when the stack does not report the negotiated value
    pub const DEFAULT_MTU: usize = 247;
}
