//! Shared interrupt demux and mux channel tests

use driver::config::DriverConfig;
use driver::serial::RxState;
use driver::test_utils::{MUX_INTERRUPT_EP, RecordingConsumer, TestRig, mux_interface};
use driver::transport::TransferError;
use driver::{InterfaceBinding, ModemDriver, SerialHandle};
use proptest::prelude::*;
use protocol::{PortKind, SetupPacket};
use std::sync::Arc;

const VID: u16 = 0x0af0;
const PID: u16 = 0x6711;

struct MuxRig {
    rig: TestRig,
    driver: ModemDriver,
    binding: InterfaceBinding,
}

impl MuxRig {
    fn new(mask: u8) -> Self {
        let rig = TestRig::new();
        let mut config = DriverConfig::default();
        config.driver.disable_net = true;
        let driver = rig.driver(config);
        let binding = driver
            .probe(rig.transport_dyn(), VID, PID, &mux_interface(0, mask))
            .unwrap();
        Self {
            rig,
            driver,
            binding,
        }
    }

    fn open(&self, port: PortKind) -> (Arc<RecordingConsumer>, SerialHandle) {
        let consumer = RecordingConsumer::new();
        let handle = self
            .driver
            .open_serial(self.driver.find(port).unwrap(), consumer.clone())
            .unwrap();
        (consumer, handle)
    }

    /// Deliver a bitmap on the interrupt endpoint; false if it was not armed
    fn signal(&self, bitmap: u8) -> bool {
        match self.rig.transport.pending_on(MUX_INTERRUPT_EP).first() {
            Some(interrupt) => self.rig.transport.complete(interrupt.id, &[bitmap]),
            None => false,
        }
    }

    fn reads(&self, port: PortKind) -> Vec<driver::test_utils::Submission> {
        self.rig
            .transport
            .pending_control()
            .into_iter()
            .filter(|s| {
                s.setup()
                    .is_some_and(|setup| setup.is_in() && setup.index == port.mux_index())
            })
            .collect()
    }

    fn rx_state(&self, port: PortKind) -> RxState {
        self.binding
            .devices()
            .iter()
            .find(|d| d.spec().port == port)
            .and_then(|d| d.serial())
            .map(|s| s.rx_state())
            .unwrap()
    }
}

#[test]
fn test_pending_signal_issues_one_read() {
    let mux = MuxRig::new(0x01);
    let (_consumer, _handle) = mux.open(PortKind::Control);
    assert_eq!(mux.rx_state(PortKind::Control), RxState::Idle);

    assert!(mux.signal(0x01));
    let reads = mux.reads(PortKind::Control);
    assert_eq!(reads.len(), 1);
    assert_eq!(
        reads[0].setup(),
        Some(SetupPacket::mux_read(PortKind::Control, 1024))
    );
    assert_eq!(mux.rx_state(PortKind::Control), RxState::RequestSent);
}

#[test]
fn test_bitmap_fans_out_to_open_channels() {
    let mux = MuxRig::new(0x1F);
    let (_c1, _control) = mux.open(PortKind::Control);
    let (_c2, _gps) = mux.open(PortKind::Gps);
    assert_eq!(mux.binding.demux().unwrap().use_count(), 2);
    assert_eq!(mux.rig.transport.pending_on(MUX_INTERRUPT_EP).len(), 1);

    mux.signal(0x1F);
    assert_eq!(mux.reads(PortKind::Control).len(), 1);
    assert_eq!(mux.reads(PortKind::Gps).len(), 1);
    assert!(mux.reads(PortKind::App).is_empty());
    assert!(mux.reads(PortKind::Pcsc).is_empty());
}

#[test]
fn test_responses_reach_their_channel() {
    let mux = MuxRig::new(0x03);
    let (control, _h1) = mux.open(PortKind::Control);
    let (app, _h2) = mux.open(PortKind::App);

    mux.signal(0x03);
    let control_read = mux.reads(PortKind::Control)[0].id;
    let app_read = mux.reads(PortKind::App)[0].id;
    mux.rig.transport.complete(app_read, b"+CREG: 1\r\n");
    mux.rig.transport.complete(control_read, b"OK\r\n");

    assert_eq!(control.data(), b"OK\r\n");
    assert_eq!(app.data(), b"+CREG: 1\r\n");
}

#[test]
fn test_failed_interrupt_resubmission_waits_for_next_arm() {
    let mux = MuxRig::new(0x01);
    let (_consumer, handle) = mux.open(PortKind::Control);

    mux.rig.transport.reject_next(TransferError::Bandwidth);
    mux.signal(0x00);
    assert!(!mux.binding.demux().unwrap().is_armed());

    // Reopening the only user re-arms it
    drop(handle);
    let (_consumer, _handle) = mux.open(PortKind::Control);
    assert!(mux.binding.demux().unwrap().is_armed());
}

#[derive(Debug, Clone)]
enum Event {
    Signal(u8),
    Respond(usize),
    Fail,
    Throttle(bool),
    Unthrottle,
}

fn event() -> impl Strategy<Value = Event> {
    prop_oneof![
        4 => any::<u8>().prop_map(Event::Signal),
        4 => (0usize..6).prop_map(Event::Respond),
        1 => Just(Event::Fail),
        1 => any::<bool>().prop_map(Event::Throttle),
        1 => Just(Event::Unthrottle),
    ]
}

proptest! {
    #[test]
    fn prop_at_most_one_read_outstanding(events in prop::collection::vec(event(), 1..60)) {
        let mux = MuxRig::new(0x03);
        let (consumer, handle) = mux.open(PortKind::Control);
        let mut expected = Vec::new();

        for event in events {
            match event {
                Event::Signal(bitmap) => {
                    mux.signal(bitmap);
                }
                Event::Respond(len) => {
                    if let Some(read) = mux.reads(PortKind::Control).first() {
                        let data = vec![len as u8; len];
                        mux.rig.transport.complete(read.id, &data);
                        expected.extend(data);
                    }
                }
                Event::Fail => {
                    if let Some(read) = mux.reads(PortKind::Control).first() {
                        mux.rig.transport.fail(read.id, TransferError::Stall);
                    }
                }
                Event::Throttle(on) => consumer.set_throttled(on),
                Event::Unthrottle => {
                    consumer.set_throttled(false);
                    handle.unthrottle().unwrap();
                    mux.rig.work.run_all();
                }
            }
            prop_assert!(mux.reads(PortKind::Control).len() <= 1);
        }

        consumer.set_throttled(false);
        handle.unthrottle().unwrap();
        mux.rig.work.run_all();
        prop_assert_eq!(consumer.data(), expected);
    }
}
