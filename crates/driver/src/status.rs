//! Modem line status
//!
//! The dedicated modem port has an interrupt endpoint delivering serial
//! state notifications. Every edge of a line bumps a counter; readers can
//! block until a counter they care about moves.

use crate::descriptor::EndpointDescriptor;
use crate::device::Device;
use crate::pool::TransferPool;
use crate::transport::{Completion, ErrorClass, TransferError, TransferRequest, TransferTag};
use protocol::{SerialStateNotification, UartState, notification::NOTIFICATION_LEN};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Line-event counters exposed to the application
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineCounters {
    pub overrun: u32,
    pub parity: u32,
    pub frame: u32,
    pub rng: u32,
    pub brk: u32,
    pub dsr: u32,
    pub dcd: u32,
}

/// Lines a status waiter can select
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineMask(pub u8);

impl LineMask {
    pub const RING: LineMask = LineMask(1 << 0);
    pub const DSR: LineMask = LineMask(1 << 1);
    pub const DCD: LineMask = LineMask(1 << 2);
    pub const ALL: LineMask = LineMask(0b111);

    pub fn contains(&self, other: LineMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for LineMask {
    type Output = LineMask;

    fn bitor(self, rhs: LineMask) -> LineMask {
        LineMask(self.0 | rhs.0)
    }
}

impl LineCounters {
    fn differs(&self, other: &LineCounters, mask: LineMask) -> bool {
        (mask.contains(LineMask::RING) && self.rng != other.rng)
            || (mask.contains(LineMask::DSR) && self.dsr != other.dsr)
            || (mask.contains(LineMask::DCD) && self.dcd != other.dcd)
    }
}

/// Result of [`ModemStatus::wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWait {
    Changed(LineCounters),
    TimedOut,
    /// The port stopped while waiting
    Stopped,
}

struct StatusState {
    pool: TransferPool,
    prev: UartState,
    counters: LineCounters,
    running: bool,
}

pub struct ModemStatus {
    endpoint: EndpointDescriptor,
    state: Mutex<StatusState>,
    changed: Condvar,
}

impl ModemStatus {
    pub fn new(endpoint: EndpointDescriptor) -> Self {
        Self {
            endpoint,
            state: Mutex::new(StatusState {
                pool: TransferPool::new(1, NOTIFICATION_LEN),
                prev: UartState::default(),
                counters: LineCounters::default(),
                running: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn start(&self, dev: &Device) -> Result<(), TransferError> {
        let mut state = self.lock();
        state.running = true;
        if state.pool.is_idle(0) {
            self.submit(dev, &mut state)?;
        }
        Ok(())
    }

    pub fn stop(&self, dev: &Device) {
        let ids = {
            let mut state = self.lock();
            state.running = false;
            state.pool.in_flight()
        };
        self.changed.notify_all();
        for id in ids {
            dev.transport.cancel(id);
        }
    }

    fn submit(&self, dev: &Device, state: &mut StatusState) -> Result<(), TransferError> {
        let endpoint = self.endpoint.address;
        let interval = self.endpoint.interval;
        state
            .pool
            .submit(0, dev.transport.as_ref(), dev.handler(), TransferTag::Notify, |buf| {
                TransferRequest::interrupt(endpoint, interval, buf, NOTIFICATION_LEN)
            })
            .map(|_| ())
    }

    pub(crate) fn complete(&self, dev: &Device, completion: Completion) {
        let mut state = self.lock();
        match state.pool.complete(0, completion) {
            Err(e) => {
                let class = dev.handle_transfer_error("modem status", &e);
                if class == ErrorClass::Transient && state.running && !dev.is_gone() {
                    if let Err(e) = self.submit(dev, &mut state) {
                        warn!("Failed to resubmit status read: {}", e);
                    }
                }
                return;
            }
            Ok(len) => trace!("Status notification of {} bytes", len),
        }

        let decoded = state
            .pool
            .filled(0)
            .map(|data| SerialStateNotification::decode(data, dev.interface()));
        state.pool.release(0);

        match decoded {
            Some(Ok(notification)) => {
                Self::count_edges(&mut state, notification.state);
                self.changed.notify_all();
            }
            Some(Err(e)) => warn!("Discarding serial state notification: {}", e),
            None => {}
        }

        if state.running && !dev.is_gone() {
            if let Err(e) = self.submit(dev, &mut state) {
                warn!("Failed to resubmit status read: {}", e);
            }
        }
    }

    fn count_edges(state: &mut StatusState, now: UartState) {
        let changed = now.changed(state.prev);
        let counters = &mut state.counters;

        if changed.overrun() {
            counters.overrun += 1;
        }
        if changed.parity() {
            counters.parity += 1;
        }
        if changed.framing() {
            counters.frame += 1;
        }
        if now.ring() && !state.prev.ring() {
            counters.rng += 1;
        }
        if changed.brk() {
            counters.brk += 1;
        }
        if changed.dsr() {
            counters.dsr += 1;
        }
        if changed.dcd() {
            counters.dcd += 1;
        }

        debug!("Serial state {:#06x} -> {:#06x}", state.prev.0, now.0);
        state.prev = now;
    }

    /// State carried by the last valid notification
    pub fn lines(&self) -> UartState {
        self.lock().prev
    }

    pub fn counters(&self) -> LineCounters {
        self.lock().counters
    }

    /// Block until a counter selected by `mask` changes
    pub fn wait(&self, mask: LineMask, timeout: Duration) -> StatusWait {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        let start = state.counters;

        loop {
            if !state.running {
                return StatusWait::Stopped;
            }
            if state.counters.differs(&start, mask) {
                return StatusWait::Changed(state.counters);
            }
            let now = Instant::now();
            if now >= deadline {
                return StatusWait::TimedOut;
            }
            state = match self.changed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> StatusState {
        StatusState {
            pool: TransferPool::new(1, NOTIFICATION_LEN),
            prev: UartState::default(),
            counters: LineCounters::default(),
            running: true,
        }
    }

    #[test]
    fn test_ring_counts_rising_edges_only() {
        let mut s = state();
        ModemStatus::count_edges(&mut s, UartState(UartState::RING));
        ModemStatus::count_edges(&mut s, UartState(0));
        ModemStatus::count_edges(&mut s, UartState(UartState::RING));
        assert_eq!(s.counters.rng, 2);
    }

    #[test]
    fn test_both_edges_counted_for_carrier() {
        let mut s = state();
        ModemStatus::count_edges(&mut s, UartState(UartState::RX_CARRIER));
        ModemStatus::count_edges(&mut s, UartState(0));
        assert_eq!(s.counters.dcd, 2);
        assert_eq!(s.counters.dsr, 0);
    }

    #[test]
    fn test_overrun_has_its_own_counter() {
        let mut s = state();
        ModemStatus::count_edges(&mut s, UartState(UartState::OVERRUN));
        assert_eq!(s.counters.overrun, 1);
        assert_eq!(s.counters.parity, 0);
    }

    #[test]
    fn test_mask() {
        let mask = LineMask::RING | LineMask::DCD;
        assert!(mask.contains(LineMask::RING));
        assert!(!mask.contains(LineMask::DSR));
        assert!(LineMask::ALL.contains(mask));
    }
}
