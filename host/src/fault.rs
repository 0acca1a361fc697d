//! Sticky protocol-violation latch shared by the background tasks

use std::sync::Arc;

use amdtp_protocol::ProtocolViolation;
use tokio::sync::watch;

use crate::error::{Result, SerialError};

/// Holds the first protocol violation seen on a connection.
///
/// Once tripped it stays tripped until the connection is dropped.
#[derive(Debug, Clone)]
pub(crate) struct FaultLatch(Arc<watch::Sender<Option<ProtocolViolation>>>);

impl FaultLatch {
    pub fn new() -> Self {
        Self(Arc::new(watch::Sender::new(None)))
    }

    /// Record `violation`; returns `false` if an earlier one is already held
    pub fn trip(&self, violation: ProtocolViolation) -> bool {
        self.0.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(violation);
            true
        })
    }

    pub fn get(&self) -> Option<ProtocolViolation> {
        *self.0.borrow()
    }

    pub fn check(&self) -> Result<()> {
        match self.get() {
            Some(violation) => Err(SerialError::Protocol(violation)),
            None => Ok(()),
        }
    }
}
