//! Shared sub-channel demultiplexer
//!
//! All mux serial ports of one interface share a single interrupt endpoint.
//! Each completion carries a one-byte bitmap where bit *i* announces pending
//! data on sub-channel *i*; the demux forwards the signal to the matching
//! channel and resubmits itself for as long as any channel is open.

use crate::descriptor::EndpointDescriptor;
use crate::device::Device;
use crate::pool::TransferPool;
use crate::transport::{
    Completion, CompletionHandler, ErrorClass, TransferError, TransferRequest, TransferTag,
    Transport, handle_transfer_error,
};
use protocol::PortKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, trace, warn};

/// The interrupt payload is a single bitmap byte
const BITMAP_LEN: usize = 1;

struct DemuxState {
    use_count: usize,
    pool: TransferPool,
}

pub struct SharedSubchannelDemux {
    this: Weak<SharedSubchannelDemux>,
    transport: Arc<dyn Transport>,
    interface: u8,
    endpoint: EndpointDescriptor,
    state: Mutex<DemuxState>,
    channels: Mutex<Vec<(PortKind, Weak<Device>)>>,
    gone: AtomicBool,
}

impl SharedSubchannelDemux {
    pub fn new(
        transport: Arc<dyn Transport>,
        interface: u8,
        endpoint: EndpointDescriptor,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            transport,
            interface,
            endpoint,
            state: Mutex::new(DemuxState {
                use_count: 0,
                pool: TransferPool::new(1, BITMAP_LEN),
            }),
            channels: Mutex::new(Vec::new()),
            gone: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, DemuxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the channel serving `port`
    pub fn attach(&self, port: PortKind, device: Weak<Device>) {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((port, device));
    }

    /// Channel device for `port`, if it is still alive
    pub fn channel(&self, port: PortKind) -> Option<Arc<Device>> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(p, _)| *p == port)
            .and_then(|(_, dev)| dev.upgrade())
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    pub fn use_count(&self) -> usize {
        self.lock().use_count
    }

    /// Whether the interrupt transfer is on the wire
    pub fn is_armed(&self) -> bool {
        !self.lock().pool.in_flight().is_empty()
    }

    /// Take one use; the first use submits the interrupt transfer
    ///
    /// The use is counted even when the submission fails, so a caller that
    /// gets an error still owes a [`SharedSubchannelDemux::disarm`].
    pub fn arm(&self) -> Result<(), TransferError> {
        let mut state = self.lock();
        let mut result = Ok(());
        if state.use_count == 0 && state.pool.is_idle(0) && !self.is_gone() {
            result = self.submit(&mut state);
        }
        state.use_count += 1;
        debug!(
            "Mux interface {} armed, use count {}",
            self.interface, state.use_count
        );
        result
    }

    /// Drop one use; the last one cancels the interrupt transfer
    pub fn disarm(&self) {
        let ids = {
            let mut state = self.lock();
            state.use_count = state.use_count.saturating_sub(1);
            debug!(
                "Mux interface {} disarmed, use count {}",
                self.interface, state.use_count
            );
            if state.use_count == 0 {
                state.pool.in_flight()
            } else {
                Vec::new()
            }
        };
        for id in ids {
            self.transport.cancel(id);
        }
    }

    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }

    /// Stop for good after removal
    pub fn shutdown(&self) {
        self.gone.store(true, Ordering::Release);
        let ids = self.lock().pool.in_flight();
        for id in ids {
            self.transport.cancel(id);
        }
    }

    fn submit(&self, state: &mut DemuxState) -> Result<(), TransferError> {
        let endpoint = self.endpoint.address;
        let interval = self.endpoint.interval;
        let this: Weak<dyn CompletionHandler> = self.this.clone();
        state
            .pool
            .submit(0, self.transport.as_ref(), this, TransferTag::Read(0), |buf| {
                TransferRequest::interrupt(endpoint, interval, buf, BITMAP_LEN)
            })
            .map(|_| ())
    }

    /// Forward each announced sub-channel to its channel
    pub fn on_completion(&self, bitmap: u8) {
        trace!("Mux interface {} bitmap {:#04x}", self.interface, bitmap);

        let targets: Vec<Arc<Device>> = (0..8)
            .map(|bit| 1u8 << bit)
            .filter(|mask| bitmap & mask != 0)
            .filter_map(|mask| match PortKind::from_mux_bit(mask) {
                Some(port) => self.channel(port),
                None => {
                    trace!("Ignoring unmapped mux bit {:#04x}", mask);
                    None
                }
            })
            .collect();

        for device in targets {
            if let Some(port) = device.serial() {
                port.on_mux_signal(&device);
            }
        }
    }
}

impl CompletionHandler for SharedSubchannelDemux {
    fn complete(&self, _tag: TransferTag, completion: Completion) {
        let bitmap = {
            let mut state = self.lock();
            match state.pool.complete(0, completion) {
                Ok(_) => {
                    let bitmap = state.pool.filled(0).and_then(|d| d.first().copied());
                    state.pool.release(0);
                    bitmap.unwrap_or(0)
                }
                Err(e) => {
                    let class =
                        handle_transfer_error(self.transport.as_ref(), "mux interrupt", &e);
                    if class == ErrorClass::Transient && state.use_count > 0 && !self.is_gone() {
                        if let Err(e) = self.submit(&mut state) {
                            warn!("Mux interrupt resubmission failed: {}", e);
                        }
                    }
                    return;
                }
            }
        };

        self.on_completion(bitmap);

        // A failed resubmission leaves the demux unarmed until use_count
        // falls to zero and the next open arms it again
        let mut state = self.lock();
        if state.use_count > 0 && !self.is_gone() && state.pool.is_idle(0) {
            if let Err(e) = self.submit(&mut state) {
                warn!("Mux interrupt resubmission failed, not retrying: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{RxState, SerialHandle};
    use crate::test_utils::{MUX_INTERRUPT_EP, RecordingConsumer, TestRig};
    use protocol::SetupPacket;

    fn signal(rig: &TestRig, bitmap: u8) {
        let interrupt = rig.transport.pending_on(MUX_INTERRUPT_EP);
        assert_eq!(interrupt.len(), 1, "interrupt transfer not armed");
        rig.transport.complete(interrupt[0].id, &[bitmap]);
    }

    fn reads_for(rig: &TestRig, port: PortKind) -> usize {
        rig.transport
            .pending_control()
            .iter()
            .filter(|s| s.setup() == Some(SetupPacket::mux_read(port, 1024)))
            .count()
    }

    #[test]
    fn test_arm_submits_once() {
        let rig = TestRig::new();
        let (demux, _devices) = rig.mux_ports(&[PortKind::Control, PortKind::App]);

        demux.arm().unwrap();
        demux.arm().unwrap();
        assert_eq!(demux.use_count(), 2);
        assert_eq!(rig.transport.pending_on(MUX_INTERRUPT_EP).len(), 1);

        demux.disarm();
        assert!(demux.is_armed());
        demux.disarm();
        assert!(!demux.is_armed());
        assert_eq!(rig.transport.pending_count(), 0);
    }

    #[test]
    fn test_failed_arm_still_counts() {
        let rig = TestRig::new();
        let (demux, _devices) = rig.mux_ports(&[PortKind::Control]);
        rig.transport.reject_next(TransferError::Stall);

        assert!(demux.arm().is_err());
        assert_eq!(demux.use_count(), 1);
        demux.disarm();
        assert_eq!(demux.use_count(), 0);
    }

    #[test]
    fn test_signal_issues_single_read() {
        let rig = TestRig::new();
        let (_demux, devices) = rig.mux_ports(&[PortKind::Control, PortKind::App]);
        let consumer = RecordingConsumer::new();
        let _handle = SerialHandle::open(devices[0].clone(), consumer.clone()).unwrap();

        signal(&rig, 0x01);
        assert_eq!(reads_for(&rig, PortKind::Control), 1);
        assert_eq!(devices[0].serial().unwrap().rx_state(), RxState::RequestSent);
        // The interrupt transfer is back on the wire
        assert_eq!(rig.transport.pending_on(MUX_INTERRUPT_EP).len(), 1);

        // Already outstanding: no second read
        signal(&rig, 0x01);
        assert_eq!(reads_for(&rig, PortKind::Control), 1);

        // App is closed, 0x80 maps to nothing
        signal(&rig, 0x82);
        assert_eq!(reads_for(&rig, PortKind::App), 0);
        assert_eq!(rig.transport.pending_control().len(), 1);
    }

    #[test]
    fn test_read_chain_ends_on_empty_response() {
        let rig = TestRig::new();
        let (_demux, devices) = rig.mux_ports(&[PortKind::Control]);
        let consumer = RecordingConsumer::new();
        let _handle = SerialHandle::open(devices[0].clone(), consumer.clone()).unwrap();

        signal(&rig, 0x01);
        let read = rig.transport.pending_control()[0].id;
        rig.transport.complete(read, b"OK\r\n");
        assert_eq!(consumer.data(), b"OK\r\n");

        // More data may follow a non-empty response
        let read = rig.transport.pending_control()[0].id;
        rig.transport.complete(read, b"");
        assert!(rig.transport.pending_control().is_empty());
        assert_eq!(devices[0].serial().unwrap().rx_state(), RxState::Idle);
    }

    #[test]
    fn test_signal_while_undelivered_is_remembered() {
        let rig = TestRig::new();
        let (_demux, devices) = rig.mux_ports(&[PortKind::Control]);
        let port = devices[0].serial().unwrap();
        let consumer = RecordingConsumer::new();
        let handle = SerialHandle::open(devices[0].clone(), consumer.clone()).unwrap();
        consumer.set_throttled(true);

        signal(&rig, 0x01);
        let read = rig.transport.pending_control()[0].id;
        rig.transport.complete(read, b"");
        assert!(port.is_slot_filled(0));
        assert_eq!(port.rx_state(), RxState::Idle);

        signal(&rig, 0x01);
        assert_eq!(port.rx_state(), RxState::RequestPending);
        assert!(rig.transport.pending_control().is_empty());

        consumer.set_throttled(false);
        handle.unthrottle().unwrap();
        rig.work.run_all();
        assert_eq!(reads_for(&rig, PortKind::Control), 1);
        assert_eq!(port.rx_state(), RxState::RequestSent);
    }

    #[test]
    fn test_close_disarms() {
        let rig = TestRig::new();
        let (demux, devices) = rig.mux_ports(&[PortKind::Control, PortKind::App]);
        let consumer = RecordingConsumer::new();
        let control = SerialHandle::open(devices[0].clone(), consumer.clone()).unwrap();
        let app = SerialHandle::open(devices[1].clone(), consumer.clone()).unwrap();
        assert_eq!(demux.use_count(), 2);

        drop(control);
        assert!(demux.is_armed());
        drop(app);
        assert_eq!(demux.use_count(), 0);
        assert_eq!(rig.transport.pending_count(), 0);
    }

    #[test]
    fn test_shutdown_stops_resubmission() {
        let rig = TestRig::new();
        let (demux, _devices) = rig.mux_ports(&[PortKind::Control]);
        demux.arm().unwrap();

        demux.shutdown();
        assert!(demux.is_gone());
        assert_eq!(rig.transport.pending_count(), 0);
        assert!(demux.arm().is_ok());
        assert!(!demux.is_armed());
    }
}
