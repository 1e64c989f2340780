//! In-memory doubles for exercising the driver without hardware
//!
//! [`MockTransport`] records every submission and lets a test decide when,
//! and how, each transfer completes. Completion handlers are always called
//! with the mock unlocked, from the test's own stack.

use crate::config::DriverConfig;
use crate::descriptor::{EndpointDescriptor, EndpointType, InterfaceDescriptor};
use crate::device::{Device, DeviceKind, Endpoints};
use crate::modem::ModemDriver;
use crate::mux::SharedSubchannelDemux;
use crate::net::{NetPort, PacketSink};
use crate::serial::{ByteConsumer, SerialPort};
use crate::status::ModemStatus;
use crate::transport::{
    Completion, CompletionHandler, PowerState, Rejected, TransferError, TransferId, TransferKind,
    TransferRequest, TransferTag, Transport,
};
use bytes::Bytes;
use common::{Job, WorkQueue};
use protocol::{InterfaceKind, PortKind, PortSpec, SetupPacket};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

/// A transfer the mock accepted
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: TransferId,
    pub tag: TransferTag,
    pub kind: TransferKind,
    pub length: usize,
    pub zero_packet: bool,
    /// Payload of an OUT transfer
    pub data: Vec<u8>,
}

impl Submission {
    pub fn is_in(&self) -> bool {
        match self.kind {
            TransferKind::Bulk { endpoint } | TransferKind::Interrupt { endpoint, .. } => {
                endpoint & 0x80 != 0
            }
            TransferKind::Control { setup } => setup.is_in(),
        }
    }

    pub fn setup(&self) -> Option<SetupPacket> {
        match self.kind {
            TransferKind::Control { setup } => Some(setup),
            _ => None,
        }
    }

    pub fn endpoint(&self) -> Option<u8> {
        match self.kind {
            TransferKind::Bulk { endpoint } | TransferKind::Interrupt { endpoint, .. } => {
                Some(endpoint)
            }
            TransferKind::Control { .. } => None,
        }
    }
}

struct InFlight {
    submission: Submission,
    buffer: Vec<u8>,
    handler: Weak<dyn CompletionHandler>,
}

struct MockState {
    next_id: u64,
    pending: Vec<InFlight>,
    history: Vec<Submission>,
    reject: VecDeque<TransferError>,
    power_state: PowerState,
    fail_power_get: bool,
    control_responses: VecDeque<Result<Vec<u8>, TransferError>>,
    control_log: Vec<(SetupPacket, Vec<u8>)>,
}

pub struct MockTransport {
    state: Mutex<MockState>,
    power_gets: AtomicUsize,
    power_puts: AtomicUsize,
    resets: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_id: 1,
                pending: Vec::new(),
                history: Vec::new(),
                reject: VecDeque::new(),
                power_state: PowerState::Active,
                fail_power_get: false,
                control_responses: VecDeque::new(),
                control_log: Vec::new(),
            }),
            power_gets: AtomicUsize::new(0),
            power_puts: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every transfer ever accepted, in submission order
    pub fn submissions(&self) -> Vec<Submission> {
        self.lock().history.clone()
    }

    /// Transfers not completed yet, in submission order
    pub fn pending(&self) -> Vec<Submission> {
        self.lock()
            .pending
            .iter()
            .map(|p| p.submission.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Pending transfers carrying `tag`
    pub fn pending_tagged(&self, tag: TransferTag) -> Vec<Submission> {
        self.pending().into_iter().filter(|s| s.tag == tag).collect()
    }

    /// Pending transfers on `endpoint`
    pub fn pending_on(&self, endpoint: u8) -> Vec<Submission> {
        self.pending()
            .into_iter()
            .filter(|s| s.endpoint() == Some(endpoint))
            .collect()
    }

    /// Pending control transfers
    pub fn pending_control(&self) -> Vec<Submission> {
        self.pending()
            .into_iter()
            .filter(|s| s.setup().is_some())
            .collect()
    }

    fn take(&self, id: TransferId) -> Option<InFlight> {
        let mut state = self.lock();
        let pos = state.pending.iter().position(|p| p.submission.id == id)?;
        Some(state.pending.remove(pos))
    }

    fn finish(&self, id: TransferId, build: impl FnOnce(Vec<u8>, usize) -> Completion) -> bool {
        let Some(entry) = self.take(id) else {
            return false;
        };
        let completion = build(entry.buffer, entry.submission.length);
        if let Some(handler) = entry.handler.upgrade() {
            handler.complete(entry.submission.tag, completion);
        }
        true
    }

    /// Complete an IN transfer with `data`, truncated to the request length
    pub fn complete(&self, id: TransferId, data: &[u8]) -> bool {
        self.finish(id, |mut buffer, length| {
            let n = data.len().min(length).min(buffer.len());
            buffer[..n].copy_from_slice(&data[..n]);
            Completion::ok(buffer, n)
        })
    }

    /// Complete an OUT transfer as fully sent
    pub fn complete_out(&self, id: TransferId) -> bool {
        self.finish(id, Completion::ok)
    }

    pub fn fail(&self, id: TransferId, error: TransferError) -> bool {
        self.finish(id, |buffer, _| Completion::failed(buffer, error))
    }

    /// Refuse the next submission with `error`
    pub fn reject_next(&self, error: TransferError) {
        self.lock().reject.push_back(error);
    }

    pub fn set_power_state(&self, power: PowerState) {
        self.lock().power_state = power;
    }

    pub fn fail_power_get(&self, fail: bool) {
        self.lock().fail_power_get = fail;
    }

    pub fn power_gets(&self) -> usize {
        self.power_gets.load(Ordering::SeqCst)
    }

    pub fn power_puts(&self) -> usize {
        self.power_puts.load(Ordering::SeqCst)
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// Queue the answer of the next blocking control read
    pub fn push_control_response(&self, response: Result<Vec<u8>, TransferError>) {
        self.lock().control_responses.push_back(response);
    }

    /// Blocking control writes seen so far
    pub fn control_log(&self) -> Vec<(SetupPacket, Vec<u8>)> {
        self.lock().control_log.clone()
    }
}

impl Transport for MockTransport {
    fn submit(
        &self,
        request: TransferRequest,
        handler: Weak<dyn CompletionHandler>,
        tag: TransferTag,
    ) -> Result<TransferId, Rejected> {
        let mut state = self.lock();
        if let Some(error) = state.reject.pop_front() {
            return Err(Rejected {
                error,
                buffer: request.buffer,
            });
        }

        let id = TransferId(state.next_id);
        state.next_id += 1;

        let data = if request.is_in() {
            Vec::new()
        } else {
            request.buffer[..request.length.min(request.buffer.len())].to_vec()
        };
        let submission = Submission {
            id,
            tag,
            kind: request.kind,
            length: request.length,
            zero_packet: request.zero_packet,
            data,
        };
        state.history.push(submission.clone());
        state.pending.push(InFlight {
            submission,
            buffer: request.buffer,
            handler,
        });
        Ok(id)
    }

    fn cancel(&self, id: TransferId) {
        self.finish(id, |buffer, _| Completion::failed(buffer, TransferError::Cancelled));
    }

    fn control_in(&self, setup: SetupPacket) -> Result<Vec<u8>, TransferError> {
        let mut state = self.lock();
        state.control_log.push((setup, Vec::new()));
        state
            .control_responses
            .pop_front()
            .unwrap_or(Err(TransferError::Stall))
    }

    fn control_out(&self, setup: SetupPacket, data: &[u8]) -> Result<(), TransferError> {
        self.lock().control_log.push((setup, data.to_vec()));
        Ok(())
    }

    fn power_state(&self) -> PowerState {
        self.lock().power_state
    }

    fn power_get(&self) -> Result<(), TransferError> {
        self.power_gets.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if state.fail_power_get {
            return Err(TransferError::Suspended);
        }
        state.power_state = PowerState::Active;
        Ok(())
    }

    fn power_put(&self) {
        self.power_puts.fetch_add(1, Ordering::SeqCst);
    }

    fn queue_reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Work queue that only runs jobs when told to
#[derive(Default)]
pub struct ManualWorkQueue {
    jobs: Mutex<VecDeque<Job>>,
}

impl ManualWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Run queued jobs, including ones they queue, until none are left
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self
                .jobs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl WorkQueue for ManualWorkQueue {
    fn schedule(&self, job: Job) -> common::Result<()> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(job);
        Ok(())
    }
}

/// Consumer that keeps everything it receives
#[derive(Default)]
pub struct RecordingConsumer {
    throttled: AtomicBool,
    room: Mutex<Option<usize>>,
    data: Mutex<Vec<u8>>,
    chunks: AtomicUsize,
    wakeups: AtomicUsize,
    hangups: AtomicUsize,
}

impl RecordingConsumer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_throttled(&self, throttled: bool) {
        self.throttled.store(throttled, Ordering::SeqCst);
    }

    /// Accept at most `room` more bytes; `None` is unlimited
    pub fn set_room(&self, room: Option<usize>) {
        *self.room.lock().unwrap_or_else(|e| e.into_inner()) = room;
    }

    pub fn data(&self) -> Vec<u8> {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of `push` calls that delivered bytes
    pub fn chunks(&self) -> usize {
        self.chunks.load(Ordering::SeqCst)
    }

    pub fn wakeups(&self) -> usize {
        self.wakeups.load(Ordering::SeqCst)
    }

    pub fn hangups(&self) -> usize {
        self.hangups.load(Ordering::SeqCst)
    }
}

impl ByteConsumer for RecordingConsumer {
    fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::SeqCst)
    }

    fn push(&self, data: &[u8]) -> usize {
        let mut room = self.room.lock().unwrap_or_else(|e| e.into_inner());
        let n = room.map_or(data.len(), |r| r.min(data.len()));
        if let Some(r) = room.as_mut() {
            *r -= n;
        }
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(&data[..n]);
        self.chunks.fetch_add(1, Ordering::SeqCst);
        n
    }

    fn write_wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::SeqCst);
    }

    fn hangup(&self) {
        self.hangups.fetch_add(1, Ordering::SeqCst);
    }
}

/// Network sink that keeps delivered packets and queue transitions
#[derive(Default)]
pub struct RecordingSink {
    packets: Mutex<Vec<Bytes>>,
    stopped: AtomicBool,
    wakes: AtomicUsize,
    stops: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn packets(&self) -> Vec<Bytes> {
        self.packets.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn wakes(&self) -> usize {
        self.wakes.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl PacketSink for RecordingSink {
    fn deliver(&self, packet: Bytes) {
        self.packets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(packet);
    }

    fn wake_queue(&self) {
        self.stopped.store(false, Ordering::SeqCst);
        self.wakes.fetch_add(1, Ordering::SeqCst);
    }

    fn stop_queue(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

// ---- descriptor builders ----

pub const BULK_IN_EP: u8 = 0x81;
pub const BULK_OUT_EP: u8 = 0x02;
pub const INTERRUPT_EP: u8 = 0x83;
pub const MUX_INTERRUPT_EP: u8 = 0x85;

pub fn bulk_in(address: u8, max_packet_size: u16) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        transfer_type: EndpointType::Bulk,
        max_packet_size,
        interval: 0,
        extra: Vec::new(),
    }
}

pub fn bulk_out(address: u8, max_packet_size: u16) -> EndpointDescriptor {
    bulk_in(address, max_packet_size)
}

pub fn interrupt_in(address: u8, max_packet_size: u16, interval: u8) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        transfer_type: EndpointType::Interrupt,
        max_packet_size,
        interval,
        extra: Vec::new(),
    }
}

/// Mux interface advertising the sub-channels in `mask`, with bulk
/// endpoints for the network function
pub fn mux_interface(number: u8, mask: u8) -> InterfaceDescriptor {
    let mut interrupt = interrupt_in(MUX_INTERRUPT_EP, 8, 10);
    interrupt.extra = vec![3, 0x24, mask];
    InterfaceDescriptor {
        number,
        class: protocol::VENDOR_SPECIFIC_CLASS,
        alt_settings: 1,
        endpoints: vec![bulk_in(BULK_IN_EP, 512), bulk_out(BULK_OUT_EP, 512), interrupt],
        extra: Vec::new(),
    }
}

/// Dedicated bulk interface, optionally with a status endpoint
pub fn bulk_interface(number: u8, with_interrupt: bool) -> InterfaceDescriptor {
    let mut endpoints = vec![bulk_in(BULK_IN_EP, 512), bulk_out(BULK_OUT_EP, 512)];
    if with_interrupt {
        endpoints.push(interrupt_in(INTERRUPT_EP, 16, 32));
    }
    InterfaceDescriptor {
        number,
        class: protocol::VENDOR_SPECIFIC_CLASS,
        alt_settings: 1,
        endpoints,
        extra: Vec::new(),
    }
}

fn bulk_endpoints(with_interrupt: bool) -> Endpoints {
    Endpoints {
        bulk_in: Some(bulk_in(BULK_IN_EP, 512)),
        bulk_out: Some(bulk_out(BULK_OUT_EP, 512)),
        interrupt_in: with_interrupt.then(|| interrupt_in(INTERRUPT_EP, 16, 32)),
    }
}

/// A mock transport and a manual work queue wired together
pub struct TestRig {
    pub transport: Arc<MockTransport>,
    pub work: Arc<ManualWorkQueue>,
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRig {
    pub fn new() -> Self {
        Self {
            transport: Arc::new(MockTransport::new()),
            work: Arc::new(ManualWorkQueue::new()),
        }
    }

    /// Unregistered serial port on a dedicated bulk interface
    pub fn bulk_serial(&self, port: PortKind) -> Arc<Device> {
        self.bulk_serial_with(PortSpec::new(InterfaceKind::Bulk, port), 2, false)
    }

    /// Bulk serial port with an explicit spec, slot count and status endpoint
    pub fn bulk_serial_with(&self, spec: PortSpec, rx_slots: usize, status: bool) -> Arc<Device> {
        let endpoints = bulk_endpoints(status);
        let modem_status = endpoints.interrupt_in.clone().map(ModemStatus::new);
        Device::new(
            spec,
            1,
            endpoints,
            self.transport.clone(),
            self.work.clone(),
            DeviceKind::Serial(SerialPort::bulk(spec.port, rx_slots, modem_status)),
        )
    }

    /// Demux plus one mux serial port per entry of `ports`
    pub fn mux_ports(&self, ports: &[PortKind]) -> (Arc<SharedSubchannelDemux>, Vec<Arc<Device>>) {
        let demux = SharedSubchannelDemux::new(
            self.transport.clone(),
            0,
            interrupt_in(MUX_INTERRUPT_EP, 8, 10),
        );
        let devices = ports
            .iter()
            .map(|&port| {
                let device = Device::new(
                    PortSpec::new(InterfaceKind::Mux, port),
                    0,
                    Endpoints::default(),
                    self.transport.clone(),
                    self.work.clone(),
                    DeviceKind::Serial(SerialPort::mux(port, demux.clone())),
                );
                demux.attach(port, Arc::downgrade(&device));
                device
            })
            .collect();
        (demux, devices)
    }

    /// Unregistered network function
    pub fn net_device(&self, rx_slots: usize, tx_timeout: Duration) -> Arc<Device> {
        Device::new(
            PortSpec::new(InterfaceKind::Bulk, PortKind::Network),
            0,
            bulk_endpoints(false),
            self.transport.clone(),
            self.work.clone(),
            DeviceKind::Network(NetPort::new(rx_slots, tx_timeout)),
        )
    }

    /// Driver sharing this rig's work queue
    pub fn driver(&self, config: DriverConfig) -> ModemDriver {
        ModemDriver::new(config, self.work.clone())
    }

    pub fn transport_dyn(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }
}
