// src/core/flow.rs

//! The acknowledgment-window primitive shared by subscriptions and query
//! executions.
//!
//! Delivery pumps account every frame they push into the window and pause
//! once the outstanding unacknowledged byte count reaches the configured
//! ceiling. Client acknowledgments shrink the window and wake any paused
//! pump. The count never goes negative: over-acknowledgment saturates at
//! zero.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

#[derive(Debug)]
pub struct AckWindow {
    ceiling: u64,
    unacked: AtomicU64,
    notify: Notify,
}

impl AckWindow {
    pub fn new(ceiling: u64) -> Self {
        Self {
            ceiling,
            unacked: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Records `bytes` as delivered but not yet acknowledged.
    pub fn add(&self, bytes: u64) {
        self.unacked.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Records `bytes` as acknowledged by the client, saturating at zero,
    /// and wakes any pump waiting for capacity.
    pub fn ack(&self, bytes: u64) {
        self.unacked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            })
            .ok();
        self.notify.notify_waiters();
    }

    pub fn unacked(&self) -> u64 {
        self.unacked.load(Ordering::Acquire)
    }

    pub fn has_capacity(&self) -> bool {
        self.unacked() < self.ceiling
    }

    /// Waits until the outstanding count is below the ceiling. The notified
    /// future is registered before the capacity check so an ack racing in
    /// between cannot be missed.
    pub async fn wait_capacity(&self) {
        loop {
            let notified = self.notify.notified();
            if self.has_capacity() {
                return;
            }
            notified.await;
        }
    }
}
