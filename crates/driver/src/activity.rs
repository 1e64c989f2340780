//! Power-aware I/O gate
//!
//! Before every transmit the data path asks the [`ActivityTracker`] whether
//! the device may be touched. When the device is runtime-suspended the first
//! caller wins a compare-and-set on `is_active` and schedules a wake on the
//! work queue; everyone, winner included, has to hold on to their payload
//! and retry once the wake callback fires.

use crate::transport::{PowerState, Transport};
use common::WorkQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Outcome of [`ActivityTracker::begin_io`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoGate {
    /// Go ahead and submit
    Ready,
    /// Device suspended; this call scheduled the wake
    DeferWithWake,
    /// Device not ready; a wake is already under way
    WakePending,
}

impl IoGate {
    pub fn is_ready(&self) -> bool {
        *self == IoGate::Ready
    }
}

/// Outcome of [`ActivityTracker::end_io`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoRelease {
    Settled,
    /// The wake reference is being dropped asynchronously
    StillBusy,
}

pub struct ActivityTracker {
    is_active: Arc<AtomicBool>,
    transport: Arc<dyn Transport>,
    work: Arc<dyn WorkQueue>,
}

impl ActivityTracker {
    pub fn new(transport: Arc<dyn Transport>, work: Arc<dyn WorkQueue>) -> Self {
        Self {
            is_active: Arc::new(AtomicBool::new(false)),
            transport,
            work,
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    /// Check whether I/O may start now
    ///
    /// `on_wake` runs on the work queue after the device was woken, and only
    /// when this call returned [`IoGate::DeferWithWake`].
    pub fn begin_io(&self, on_wake: impl FnOnce() + Send + 'static) -> IoGate {
        match self.transport.power_state() {
            PowerState::Active => IoGate::Ready,
            PowerState::Resuming => IoGate::WakePending,
            PowerState::Suspended => {
                if self
                    .is_active
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return IoGate::WakePending;
                }

                let transport = self.transport.clone();
                let is_active = self.is_active.clone();
                let scheduled = self.work.schedule(Box::new(move || {
                    match transport.power_get() {
                        Ok(()) => {
                            debug!("Device woken for pending I/O");
                            on_wake();
                        }
                        Err(e) => {
                            warn!("Failed to wake device: {}", e);
                            // Let the next attempt try again
                            is_active.store(false, Ordering::Release);
                        }
                    }
                }));

                if let Err(e) = scheduled {
                    warn!("Failed to schedule device wake: {}", e);
                    self.is_active.store(false, Ordering::Release);
                }
                IoGate::DeferWithWake
            }
        }
    }

    /// Note that a transfer finished
    pub fn end_io(&self) -> IoRelease {
        if self.transport.power_state() != PowerState::Suspended
            && self
                .is_active
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let transport = self.transport.clone();
            let scheduled = self.work.schedule(Box::new(move || transport.power_put()));
            if let Err(e) = scheduled {
                warn!("Failed to schedule power release: {}", e);
            }
            return IoRelease::StillBusy;
        }

        self.is_active.store(false, Ordering::Release);
        IoRelease::Settled
    }
}
