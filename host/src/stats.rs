//! Per-connection link counters

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use amdtp_protocol::Status;
use serde::Serialize;

const NO_STATUS: u8 = u8::MAX;

/// Lock-free counters updated by the background tasks
#[derive(Debug)]
pub struct LinkStats {
    data_frames_sent: AtomicU64,
    retransmissions: AtomicU64,
    resend_requests: AtomicU64,
    acks_received: AtomicU64,
    data_frames_received: AtomicU64,
    crc_errors: AtomicU64,
    length_errors: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    last_ack_status: AtomicU8,
}

/// Point-in-time copy of [`LinkStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub data_frames_sent: u64,
    pub retransmissions: u64,
    pub resend_requests: u64,
    pub acks_received: u64,
    pub data_frames_received: u64,
    pub crc_errors: u64,
    pub length_errors: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub last_ack_status: Option<Status>,
}

impl Default for LinkStats {
    fn default() -> Self {
        Self {
            data_frames_sent: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            resend_requests: AtomicU64::new(0),
            acks_received: AtomicU64::new(0),
            data_frames_received: AtomicU64::new(0),
            crc_errors: AtomicU64::new(0),
            length_errors: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            last_ack_status: AtomicU8::new(NO_STATUS),
        }
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl LinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn data_sent(&self, retransmission: bool) {
        bump(&self.data_frames_sent, 1);
        if retransmission {
            bump(&self.retransmissions, 1);
        }
    }

    pub(crate) fn resend_request_sent(&self) {
        bump(&self.resend_requests, 1);
    }

    pub(crate) fn ack_received(&self, raw: u8) {
        bump(&self.acks_received, 1);
        self.last_ack_status.store(raw, Ordering::Relaxed);
    }

    pub(crate) fn data_received(&self, status: Status) {
        bump(&self.data_frames_received, 1);
        match status {
            Status::CrcError => bump(&self.crc_errors, 1),
            Status::InvalidPktLength => bump(&self.length_errors, 1),
            _ => {}
        }
    }

    pub(crate) fn written(&self, bytes: usize) {
        bump(&self.bytes_written, bytes as u64);
    }

    pub(crate) fn read(&self, bytes: usize) {
        bump(&self.bytes_read, bytes as u64);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            data_frames_sent: load(&self.data_frames_sent),
            retransmissions: load(&self.retransmissions),
            resend_requests: load(&self.resend_requests),
            acks_received: load(&self.acks_received),
            data_frames_received: load(&self.data_frames_received),
            crc_errors: load(&self.crc_errors),
            length_errors: load(&self.length_errors),
            bytes_written: load(&self.bytes_written),
            bytes_read: load(&self.bytes_read),
            last_ack_status: Status::try_from(self.last_ack_status.load(Ordering::Relaxed)).ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let stats = LinkStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());

        stats.data_sent(false);
        stats.data_sent(true);
        stats.ack_received(Status::CrcError as u8);
        stats.ack_received(Status::Success as u8);
        stats.data_received(Status::CrcError);
        stats.data_received(Status::Success);
        stats.written(11);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.data_frames_sent, 2);
        assert_eq!(snapshot.retransmissions, 1);
        assert_eq!(snapshot.acks_received, 2);
        assert_eq!(snapshot.last_ack_status, Some(Status::Success));
        assert_eq!(snapshot.data_frames_received, 2);
        assert_eq!(snapshot.crc_errors, 1);
        assert_eq!(snapshot.bytes_written, 11);
    }

    #[test]
    fn test_unknown_last_status() {
        let stats = LinkStats::new();
        stats.ack_received(200);
        assert_eq!(stats.snapshot().last_ack_status, None);
        assert_eq!(stats.snapshot().acks_received, 1);
    }
}
