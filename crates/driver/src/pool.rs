//! Fixed-capacity pool of reusable transfer slots
//!
//! Each slot owns one buffer which cycles between three states:
//!
//! ```text
//!   Idle(buffer) ──submit──► InFlight(id) ──complete ok──► Filled(buffer, len)
//!        ▲                        │                              │
//!        └──── complete err ──────┘◄───────── release ───────────┘
//! ```
//!
//! The pool itself is not synchronized; it lives inside its owner's state
//! mutex and [`TransferPool::submit`] must be called with that mutex held so
//! a completion can never observe a slot before its id is recorded.

use crate::transport::{
    Completion, CompletionHandler, TransferError, TransferId, TransferRequest, TransferTag,
    Transport,
};
use std::sync::Weak;
use tracing::{trace, warn};

#[derive(Debug)]
enum Slot {
    Idle(Vec<u8>),
    InFlight(TransferId),
    Filled { buffer: Vec<u8>, len: usize },
}

#[derive(Debug)]
pub struct TransferPool {
    slots: Vec<Slot>,
    buffer_size: usize,
}

impl TransferPool {
    /// Allocate `slots` buffers of `buffer_size` bytes
    pub fn new(slots: usize, buffer_size: usize) -> Self {
        Self {
            slots: (0..slots).map(|_| Slot::Idle(vec![0u8; buffer_size])).collect(),
            buffer_size,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn is_idle(&self, idx: usize) -> bool {
        matches!(self.slots.get(idx), Some(Slot::Idle(_)))
    }

    pub fn is_filled(&self, idx: usize) -> bool {
        matches!(self.slots.get(idx), Some(Slot::Filled { .. }))
    }

    pub fn is_in_flight(&self, idx: usize) -> bool {
        matches!(self.slots.get(idx), Some(Slot::InFlight(_)))
    }

    /// Submit slot `idx` with a request built around its buffer
    ///
    /// A refused submission leaves the slot idle.
    pub fn submit(
        &mut self,
        idx: usize,
        transport: &dyn Transport,
        handler: Weak<dyn CompletionHandler>,
        tag: TransferTag,
        build: impl FnOnce(Vec<u8>) -> TransferRequest,
    ) -> Result<TransferId, TransferError> {
        let slot = self
            .slots
            .get_mut(idx)
            .ok_or_else(|| TransferError::Internal(format!("no slot {}", idx)))?;

        let buffer = match std::mem::replace(slot, Slot::InFlight(TransferId(0))) {
            Slot::Idle(buffer) => buffer,
            other => {
                *slot = other;
                return Err(TransferError::Internal(format!("slot {} not idle", idx)));
            }
        };

        match transport.submit(build(buffer), handler, tag) {
            Ok(id) => {
                trace!("Slot {} submitted as {}", idx, id);
                *slot = Slot::InFlight(id);
                Ok(id)
            }
            Err(rejected) => {
                *slot = Slot::Idle(rejected.buffer);
                Err(rejected.error)
            }
        }
    }

    /// Take a completion back into slot `idx`
    ///
    /// Success leaves the slot filled with the transferred bytes; failure
    /// returns it to idle.
    pub fn complete(
        &mut self,
        idx: usize,
        completion: Completion,
    ) -> Result<usize, TransferError> {
        let Some(slot) = self.slots.get_mut(idx) else {
            return Err(TransferError::Internal(format!("no slot {}", idx)));
        };
        if !matches!(slot, Slot::InFlight(_)) {
            warn!("Completion for slot {} which is not in flight", idx);
        }

        let Completion {
            result,
            buffer,
            actual_length,
        } = completion;
        match result {
            Ok(()) => {
                let len = actual_length.min(buffer.len());
                *slot = Slot::Filled { buffer, len };
                Ok(len)
            }
            Err(e) => {
                *slot = Slot::Idle(buffer);
                Err(e)
            }
        }
    }

    /// Received bytes of a filled slot
    pub fn filled(&self, idx: usize) -> Option<&[u8]> {
        match self.slots.get(idx) {
            Some(Slot::Filled { buffer, len }) => Some(&buffer[..*len]),
            _ => None,
        }
    }

    /// Mark a filled slot consumed
    pub fn release(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx)
            && let Slot::Filled { buffer, .. } = slot
        {
            let buffer = std::mem::take(buffer);
            *slot = Slot::Idle(buffer);
        }
    }

    /// Fill an idle slot with zero bytes so it keeps its place in line
    pub fn fill_empty(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx)
            && let Slot::Idle(buffer) = slot
        {
            let buffer = std::mem::take(buffer);
            *slot = Slot::Filled { buffer, len: 0 };
        }
    }

    /// Drop every undelivered payload
    pub fn reset_filled(&mut self) {
        for idx in 0..self.slots.len() {
            self.release(idx);
        }
    }

    pub fn any_filled(&self) -> bool {
        self.slots.iter().any(|s| matches!(s, Slot::Filled { .. }))
    }

    /// Ids of every transfer currently on the wire
    pub fn in_flight(&self) -> Vec<TransferId> {
        self.slots
            .iter()
            .filter_map(|s| match s {
                Slot::InFlight(id) => Some(*id),
                _ => None,
            })
            .collect()
    }
}
