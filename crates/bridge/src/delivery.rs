//! Delivery acknowledgment tracking
//!
//! Correlates outbound sends with the backend's `delivered` events by
//! message id. Every tracked send resolves exactly once: with the ack, or
//! as timed out once its deadline passes. A late ack racing the timeout is
//! a logged no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::error::Error;

/// Terminal state of one tracked send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    Failed(String),
    TimedOut,
}

/// Tracks in-flight sends awaiting acknowledgment
#[derive(Clone, Default)]
pub struct DeliveryTracker {
    pending: Arc<Mutex<HashMap<Uuid, oneshot::Sender<DeliveryStatus>>>>,
}

/// Handle that resolves exactly once with the outcome of a tracked send
pub struct DeliveryReceipt {
    message_id: Uuid,
    rx: oneshot::Receiver<DeliveryStatus>,
}

impl std::fmt::Debug for DeliveryReceipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryReceipt")
            .field("message_id", &self.message_id)
            .finish()
    }
}

impl DeliveryReceipt {
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Wait for the delivery outcome
    pub async fn wait(self) -> Result<(), Error> {
        match self.rx.await {
            Ok(DeliveryStatus::Delivered) => Ok(()),
            Ok(DeliveryStatus::Failed(reason)) => Err(Error::DeliveryFailed(reason)),
            Ok(DeliveryStatus::TimedOut) => Err(Error::DeliveryTimeout),
            Err(_) => Err(Error::Shutdown),
        }
    }
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending send and arm its deadline.
    ///
    /// Must be called before the corresponding frame is written, so an ack
    /// racing the write still finds its entry. The deadline task removes
    /// the entry even when nobody awaits the receipt.
    pub fn track(&self, message_id: Uuid, deadline: Duration) -> DeliveryReceipt {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(message_id, tx);

        let tracker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if tracker.resolve(message_id, DeliveryStatus::TimedOut) {
                debug!(message_id = %message_id, "Delivery deadline passed");
            }
        });

        DeliveryReceipt { message_id, rx }
    }

    /// Resolve a pending send.
    ///
    /// Idempotent: an id with no entry (already resolved, or never tracked)
    /// returns `false` and changes nothing.
    pub fn resolve(&self, message_id: Uuid, status: DeliveryStatus) -> bool {
        let sender = self.pending.lock().unwrap().remove(&message_id);
        match sender {
            Some(tx) => {
                // The receiver may be gone if the caller dropped the receipt
                let _ = tx.send(status);
                true
            }
            None => {
                debug!(message_id = %message_id, "Ignoring resolution for unknown message");
                false
            }
        }
    }

    /// Number of sends still awaiting resolution
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
