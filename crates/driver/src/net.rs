//! Network function
//!
//! Receive keeps every slot on the wire and feeds completed transfers to the
//! [`Reassembler`]; transmit sends one packet at a time, remembering a
//! packet that had to wait for a device wake-up as "lingering" until the
//! wake or the next resume.

use crate::device::Device;
use crate::error::{DriverError, Result};
use crate::pool::TransferPool;
use crate::reassembler::Reassembler;
use crate::registry::PortIndex;
use crate::transport::{
    Completion, ErrorClass, TransferError, TransferId, TransferRequest, TransferTag,
};
use bytes::Bytes;
use protocol::{MAX_FRAME_SIZE, SetupPacket, fix_crc_trailer, needs_zero_packet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Receive buffer of each network slot
pub const NET_RX_BUFFER_SIZE: usize = 2048;
/// MTU advertised to the network stack
pub const NET_MTU: usize = 1486;

/// Hand-off to the host network stack
///
/// Called with the function's state locked; must not call back into it.
pub trait PacketSink: Send + Sync {
    fn deliver(&self, packet: Bytes);

    /// The transmit path can take another packet
    fn wake_queue(&self) {}

    /// The transmit path is busy
    fn stop_queue(&self) {}
}

/// Interface statistics
#[derive(Debug, Default)]
pub struct NetStats {
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_errors: AtomicU64,
    pub rx_dropped: AtomicU64,
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub tx_errors: AtomicU64,
}

/// Point-in-time copy of [`NetStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetStatsSnapshot {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_errors: u64,
    pub rx_dropped: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_errors: u64,
}

impl NetStats {
    pub fn snapshot(&self) -> NetStatsSnapshot {
        NetStatsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_errors: self.rx_errors.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
        }
    }

    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// What happened to a transmitted packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Sent,
    /// Held until the device is awake
    Deferred,
}

struct NetState {
    rx: TransferPool,
    reassembler: Reassembler,
    sink: Option<Arc<dyn PacketSink>>,
    tx_spare: Option<Vec<u8>>,
    tx_in_flight: Option<(TransferId, Instant)>,
    lingering: Option<Bytes>,
}

pub struct NetPort {
    state: Mutex<NetState>,
    running: AtomicBool,
    stats: NetStats,
    tx_timeout: Duration,
}

impl NetPort {
    pub fn new(rx_slots: usize, tx_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(NetState {
                rx: TransferPool::new(rx_slots.max(1), NET_RX_BUFFER_SIZE),
                reassembler: Reassembler::new(),
                sink: None,
                tx_spare: Some(Vec::with_capacity(MAX_FRAME_SIZE)),
                tx_in_flight: None,
                lingering: None,
            }),
            running: AtomicBool::new(false),
            stats: NetStats::default(),
            tx_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> NetStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn has_lingering(&self) -> bool {
        self.lock().lingering.is_some()
    }

    pub fn mtu(&self) -> usize {
        NET_MTU
    }

    // ---- lifecycle ----

    pub(crate) fn open(&self, dev: &Device, sink: Arc<dyn PacketSink>) -> Result<()> {
        let _guard = dev.lock();
        if dev.is_gone() {
            return Err(DriverError::Gone);
        }
        if self.is_running() {
            return Err(DriverError::Busy);
        }

        {
            let mut state = self.lock();
            state.reassembler.reset();
            state.sink = Some(sink.clone());
        }
        self.running.store(true, Ordering::Release);

        if let Err(e) = self.start(dev) {
            warn!("Failed to start network receive: {}", e);
            self.running.store(false, Ordering::Release);
            self.stop(dev);
            self.lock().sink = None;
            return Err(e.into());
        }
        sink.wake_queue();
        info!("Network function on interface {} up", dev.interface());
        Ok(())
    }

    pub(crate) fn close(&self, dev: &Device) {
        let _guard = dev.lock();
        let sink = self.lock().sink.clone();
        if let Some(sink) = &sink {
            sink.stop_queue();
        }
        self.running.store(false, Ordering::Release);
        if !dev.is_gone() {
            self.stop(dev);
        }
        self.lock().sink = None;
        info!("Network function on interface {} down", dev.interface());
    }

    /// Put every receive slot on the wire
    pub(crate) fn start(&self, dev: &Device) -> std::result::Result<(), TransferError> {
        let mut state = self.lock();
        for idx in 0..state.rx.len() {
            if state.rx.is_idle(idx) {
                Self::submit_read(dev, &mut state, idx)?;
            }
        }
        Ok(())
    }

    /// Cancel receive and transmit
    pub(crate) fn stop(&self, dev: &Device) {
        let ids = {
            let state = self.lock();
            let mut ids = state.rx.in_flight();
            ids.extend(state.tx_in_flight.map(|(id, _)| id));
            ids
        };
        for id in ids {
            dev.transport.cancel(id);
        }
        self.lock().rx.reset_filled();
    }

    /// Cancel everything after removal
    pub(crate) fn shutdown(&self, dev: &Device) {
        let sink = self.lock().sink.clone();
        if let Some(sink) = sink {
            sink.stop_queue();
        }
        self.running.store(false, Ordering::Release);
        self.stop(dev);
    }

    fn submit_read(
        dev: &Device,
        state: &mut NetState,
        idx: usize,
    ) -> std::result::Result<(), TransferError> {
        let endpoint = dev
            .endpoints()
            .bulk_in
            .as_ref()
            .map(|ep| ep.address)
            .ok_or_else(|| TransferError::Internal("no bulk IN endpoint".into()))?;
        state
            .rx
            .submit(
                idx,
                dev.transport.as_ref(),
                dev.handler(),
                TransferTag::Read(idx),
                |buf| {
                    let length = buf.len();
                    TransferRequest::bulk(endpoint, buf, length)
                },
            )
            .map(|_| ())
    }

    // ---- transmit ----

    /// Send one packet
    ///
    /// Only one packet is on the wire at a time; the sink's queue is stopped
    /// until it comes back.
    pub(crate) fn transmit(&self, dev: &Device, packet: Bytes) -> Result<TxOutcome> {
        if dev.is_gone() {
            return Err(DriverError::Gone);
        }
        if !self.is_running() {
            return Err(DriverError::NotRunning);
        }
        if packet.len() > MAX_FRAME_SIZE {
            return Err(DriverError::Invalid(format!(
                "packet of {} bytes exceeds {}",
                packet.len(),
                MAX_FRAME_SIZE
            )));
        }

        let mut state = self.lock();
        if state.tx_in_flight.is_some() || state.lingering.is_some() {
            return Err(DriverError::Busy);
        }
        if let Some(sink) = &state.sink {
            sink.stop_queue();
        }
        self.start_xmit(dev, &mut state, packet)
    }

    fn start_xmit(&self, dev: &Device, state: &mut NetState, packet: Bytes) -> Result<TxOutcome> {
        let weak = dev.weak();
        let gate = dev.activity.begin_io(move || {
            if let Some(dev) = weak.upgrade()
                && let Some(net) = dev.net()
            {
                net.flush_lingering(&dev);
            }
        });
        if !gate.is_ready() {
            debug!("Network transmit deferred ({:?})", gate);
            state.lingering = Some(packet);
            return Ok(TxOutcome::Deferred);
        }

        let out = dev
            .endpoints()
            .bulk_out
            .clone()
            .ok_or(DriverError::NotSupported("no bulk OUT endpoint"))?;

        let mut buffer = state
            .tx_spare
            .take()
            .unwrap_or_else(|| Vec::with_capacity(MAX_FRAME_SIZE));
        buffer.clear();
        buffer.extend_from_slice(&packet);
        let length = buffer.len();
        let zero_packet = needs_zero_packet(length, out.max_packet());

        let request =
            TransferRequest::bulk(out.address, buffer, length).with_zero_packet(zero_packet);
        match dev.transport.submit(request, dev.handler(), TransferTag::Write) {
            Ok(id) => {
                trace!("Sending {} byte packet as {}", length, id);
                state.tx_in_flight = Some((id, Instant::now()));
                NetStats::add(&self.stats.tx_packets, 1);
                NetStats::add(&self.stats.tx_bytes, length as u64);
                Ok(TxOutcome::Sent)
            }
            Err(rejected) => {
                warn!("Network transmit failed: {}", rejected.error);
                state.tx_spare = Some(rejected.buffer);
                NetStats::add(&self.stats.tx_errors, 1);
                dev.activity.end_io();
                if let Some(sink) = &state.sink {
                    sink.wake_queue();
                }
                Err(rejected.error.into())
            }
        }
    }

    /// Send the packet that waited for a wake-up
    pub(crate) fn flush_lingering(&self, dev: &Device) {
        let mut state = self.lock();
        if state.tx_in_flight.is_some() || !self.is_running() || dev.is_gone() {
            return;
        }
        if let Some(packet) = state.lingering.take() {
            debug!("Sending lingering {} byte packet", packet.len());
            if let Err(e) = self.start_xmit(dev, &mut state, packet) {
                warn!("Lingering packet lost: {}", e);
            }
        }
    }

    fn write_done(&self, dev: &Device, completion: Completion) {
        let Completion { result, buffer, .. } = completion;
        let sink = {
            let mut state = self.lock();
            state.tx_in_flight = None;
            state.tx_spare = Some(buffer);
            state.sink.clone()
        };
        dev.activity.end_io();

        if !self.is_running() {
            return;
        }
        if let Err(e) = result
            && dev.handle_transfer_error("network write", &e) != ErrorClass::Cancelled
        {
            NetStats::add(&self.stats.tx_errors, 1);
        }
        if let Some(sink) = sink {
            sink.wake_queue();
        }
    }

    /// Cancel a transmit stuck longer than the watchdog period
    pub(crate) fn check_tx_timeout(&self, dev: &Device) -> Result<()> {
        let stuck = self
            .lock()
            .tx_in_flight
            .filter(|(_, since)| since.elapsed() >= self.tx_timeout)
            .map(|(id, _)| id);

        if let Some(id) = stuck {
            warn!("Network transmit timed out, cancelling {}", id);
            dev.transport.cancel(id);
            NetStats::add(&self.stats.tx_errors, 1);
            return Err(DriverError::Unresponsive(self.tx_timeout));
        }
        Ok(())
    }

    // ---- receive ----

    fn read_done(&self, dev: &Device, idx: usize, mut completion: Completion) {
        if dev.spec().crc_quirk
            && completion.result.is_ok()
            && let Some(ep) = &dev.endpoints().bulk_in
        {
            completion.actual_length =
                fix_crc_trailer(&completion.buffer, completion.actual_length, ep.max_packet());
        }

        let mut guard = self.lock();
        let state = &mut *guard;
        match state.rx.complete(idx, completion) {
            Ok(_) if !self.is_running() => {
                state.rx.release(idx);
                return;
            }
            Ok(len) => {
                if let Some(data) = state.rx.filled(idx)
                    && len > 0
                {
                    let end_of_transfer = state.rx.buffer_size() > len;
                    let sink = state.sink.clone();
                    let stats = &self.stats;
                    let report = state.reassembler.feed(data, end_of_transfer, |packet| {
                        NetStats::add(&stats.rx_packets, 1);
                        NetStats::add(&stats.rx_bytes, packet.len() as u64);
                        if let Some(sink) = &sink {
                            sink.deliver(packet);
                        }
                    });
                    NetStats::add(&stats.rx_errors, report.length_errors as u64);
                    NetStats::add(&stats.rx_dropped, report.dropped as u64);
                }
                state.rx.release(idx);
            }
            Err(e) => {
                if dev.handle_transfer_error("network read", &e) != ErrorClass::Transient {
                    return;
                }
            }
        }

        if self.is_running()
            && !dev.is_gone()
            && let Err(e) = Self::submit_read(dev, state, idx)
        {
            warn!("Failed to resubmit network read {}: {}", idx, e);
        }
    }

    pub(crate) fn complete(&self, dev: &Device, tag: TransferTag, completion: Completion) {
        match tag {
            TransferTag::Read(idx) => self.read_done(dev, idx, completion),
            TransferTag::Write => self.write_done(dev, completion),
            TransferTag::Notify => warn!("Unexpected status completion on network function"),
        }
    }

    // ---- radio ----

    pub(crate) fn radio(&self, dev: &Device, on: bool) -> Result<()> {
        if dev.is_gone() {
            debug!("Device gone, skipping radio {}", if on { "on" } else { "off" });
            return Ok(());
        }
        dev.transport.control_out(SetupPacket::radio_power(on), &[])?;
        Ok(())
    }
}

/// An open network function
///
/// Dropping the handle takes the interface down.
pub struct NetHandle {
    device: Arc<Device>,
}

impl NetHandle {
    pub(crate) fn open(device: Arc<Device>, sink: Arc<dyn PacketSink>) -> Result<Self> {
        let net = device
            .net()
            .ok_or(DriverError::NotSupported("not a network function"))?;
        net.open(&device, sink)?;
        Ok(Self { device })
    }

    fn net(&self) -> Result<&NetPort> {
        self.device
            .net()
            .ok_or(DriverError::NotSupported("not a network function"))
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn index(&self) -> Option<PortIndex> {
        self.device.index()
    }

    pub fn transmit(&self, packet: Bytes) -> Result<TxOutcome> {
        self.net()?.transmit(&self.device, packet)
    }

    pub fn check_tx_timeout(&self) -> Result<()> {
        self.net()?.check_tx_timeout(&self.device)
    }

    pub fn stats(&self) -> NetStatsSnapshot {
        self.net().map(NetPort::stats).unwrap_or_default()
    }

    pub fn set_radio(&self, on: bool) -> Result<()> {
        self.net()?.radio(&self.device, on)
    }
}

impl Drop for NetHandle {
    fn drop(&mut self) {
        if let Some(net) = self.device.net() {
            net.close(&self.device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, Endpoints};
    use crate::test_utils::{
        BULK_IN_EP, BULK_OUT_EP, RecordingSink, TestRig, bulk_in, bulk_out,
    };
    use crate::transport::PowerState;
    use protocol::{CRC_SENTINEL, InterfaceKind, PortKind, PortSpec};

    fn frame(total: usize, fill: u8) -> Vec<u8> {
        let mut f = vec![fill; total];
        f[0] = 0x45;
        f[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        f
    }

    fn read_id(rig: &TestRig, idx: usize) -> TransferId {
        rig.transport.pending_tagged(TransferTag::Read(idx))[0].id
    }

    fn open(rig: &TestRig, rx_slots: usize, timeout: Duration) -> (Arc<RecordingSink>, NetHandle) {
        let device = rig.net_device(rx_slots, timeout);
        let sink = RecordingSink::new();
        let handle = NetHandle::open(device, sink.clone()).unwrap();
        (sink, handle)
    }

    #[test]
    fn test_frame_spanning_two_reads() {
        let rig = TestRig::new();
        let (sink, handle) = open(&rig, 2, Duration::from_secs(10));
        assert_eq!(rig.transport.pending_on(BULK_IN_EP).len(), 2);

        let f = frame(2020, 0x5A);
        rig.transport.complete(read_id(&rig, 0), &f[..1024]);
        assert!(sink.packets().is_empty());
        rig.transport.complete(read_id(&rig, 1), &f[1024..]);

        let packets = sink.packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0][..], &f[..]);

        let stats = handle.stats();
        assert_eq!(stats.rx_packets, 1);
        assert_eq!(stats.rx_bytes, 2020);
        assert_eq!(rig.transport.pending_on(BULK_IN_EP).len(), 2);
    }

    #[test]
    fn test_bad_length_counts_error_and_resyncs() {
        let rig = TestRig::new();
        let (sink, handle) = open(&rig, 1, Duration::from_secs(10));

        let mut bad = frame(100, 1);
        bad[2..4].copy_from_slice(&4000u16.to_be_bytes());
        rig.transport.complete(read_id(&rig, 0), &bad);
        assert_eq!(handle.stats().rx_errors, 1);

        rig.transport.complete(read_id(&rig, 0), &frame(64, 2));
        assert_eq!(sink.packets().len(), 1);
        assert_eq!(sink.packets()[0].len(), 64);
    }

    #[test]
    fn test_crc_trailer_stripped() {
        let rig = TestRig::new();
        let device = Device::new(
            PortSpec::new(InterfaceKind::Bulk, PortKind::Network).with_crc_quirk(true),
            0,
            Endpoints {
                bulk_in: Some(bulk_in(BULK_IN_EP, 512)),
                bulk_out: Some(bulk_out(BULK_OUT_EP, 512)),
                interrupt_in: None,
            },
            rig.transport.clone(),
            rig.work.clone(),
            DeviceKind::Network(NetPort::new(1, Duration::from_secs(10))),
        );
        let sink = RecordingSink::new();
        let _handle = NetHandle::open(device, sink.clone()).unwrap();

        // 2 * 512 + 5 bytes on the wire, the last 4 of them the sentinel
        let mut transfer = frame(1025, 3);
        transfer.extend_from_slice(&CRC_SENTINEL);
        rig.transport.complete(read_id(&rig, 0), &transfer);
        rig.transport.complete(read_id(&rig, 0), &frame(40, 4));

        let packets = sink.packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].len(), 1025);
        assert_eq!(packets[1].len(), 40);
    }

    #[test]
    fn test_transmit_one_at_a_time() {
        let rig = TestRig::new();
        let (sink, handle) = open(&rig, 1, Duration::from_secs(10));

        assert_eq!(handle.transmit(Bytes::from(vec![1u8; 512])).unwrap(), TxOutcome::Sent);
        assert!(sink.is_stopped());
        assert!(matches!(
            handle.transmit(Bytes::from_static(b"next")),
            Err(DriverError::Busy)
        ));

        let sent = rig.transport.pending_tagged(TransferTag::Write);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].endpoint(), Some(BULK_OUT_EP));
        // Exact multiple of the packet size: end marked with a ZLP
        assert!(sent[0].zero_packet);

        rig.transport.complete_out(sent[0].id);
        assert!(!sink.is_stopped());

        handle.transmit(Bytes::from(vec![2u8; 100])).unwrap();
        let sent = rig.transport.pending_tagged(TransferTag::Write);
        assert!(!sent[0].zero_packet);
        assert_eq!(sent[0].data, vec![2u8; 100]);

        let stats = handle.stats();
        assert_eq!(stats.tx_packets, 2);
        assert_eq!(stats.tx_bytes, 612);
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let rig = TestRig::new();
        let (_sink, handle) = open(&rig, 1, Duration::from_secs(10));
        assert!(matches!(
            handle.transmit(Bytes::from(vec![0u8; MAX_FRAME_SIZE + 1])),
            Err(DriverError::Invalid(_))
        ));
    }

    #[test]
    fn test_transmit_requires_open() {
        let rig = TestRig::new();
        let device = rig.net_device(1, Duration::from_secs(10));
        let net = device.net().unwrap();
        assert!(matches!(
            net.transmit(&device, Bytes::from_static(b"x")),
            Err(DriverError::NotRunning)
        ));
    }

    #[test]
    fn test_suspended_transmit_lingers_until_wake() {
        let rig = TestRig::new();
        let (_sink, handle) = open(&rig, 1, Duration::from_secs(10));
        rig.transport.set_power_state(PowerState::Suspended);

        let outcome = handle.transmit(Bytes::from_static(b"queued")).unwrap();
        assert_eq!(outcome, TxOutcome::Deferred);
        assert!(handle.device().net().unwrap().has_lingering());
        assert!(matches!(
            handle.transmit(Bytes::from_static(b"more")),
            Err(DriverError::Busy)
        ));
        assert!(rig.transport.pending_tagged(TransferTag::Write).is_empty());

        rig.work.run_all();
        assert_eq!(rig.transport.power_gets(), 1);
        let sent = rig.transport.pending_tagged(TransferTag::Write);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data, b"queued");
        assert!(!handle.device().net().unwrap().has_lingering());

        rig.transport.complete_out(sent[0].id);
        rig.work.run_all();
        assert_eq!(rig.transport.power_puts(), 1);
    }

    #[test]
    fn test_stuck_transmit_times_out() {
        let rig = TestRig::new();
        let (sink, handle) = open(&rig, 1, Duration::ZERO);

        handle.transmit(Bytes::from_static(b"stuck")).unwrap();
        assert!(matches!(
            handle.check_tx_timeout(),
            Err(DriverError::Unresponsive(_))
        ));
        assert!(rig.transport.pending_tagged(TransferTag::Write).is_empty());
        assert_eq!(handle.stats().tx_errors, 1);
        assert!(!sink.is_stopped());

        assert!(handle.check_tx_timeout().is_ok());
        assert_eq!(
            handle.transmit(Bytes::from_static(b"again")).unwrap(),
            TxOutcome::Sent
        );
    }

    #[test]
    fn test_second_open_is_busy() {
        let rig = TestRig::new();
        let device = rig.net_device(1, Duration::from_secs(10));
        let _first = NetHandle::open(device.clone(), RecordingSink::new()).unwrap();
        assert!(matches!(
            NetHandle::open(device, RecordingSink::new()),
            Err(DriverError::Busy)
        ));
    }

    #[test]
    fn test_failed_start_leaves_function_down() {
        let rig = TestRig::new();
        let device = rig.net_device(2, Duration::from_secs(10));
        rig.transport.reject_next(TransferError::Bandwidth);

        let sink = RecordingSink::new();
        assert!(matches!(
            NetHandle::open(device.clone(), sink.clone()),
            Err(DriverError::Transfer(TransferError::Bandwidth))
        ));
        assert!(!device.net().unwrap().is_running());
        assert_eq!(rig.transport.pending_count(), 0);

        let _handle = NetHandle::open(device, RecordingSink::new()).unwrap();
        assert_eq!(rig.transport.pending_count(), 2);
    }

    #[test]
    fn test_close_stops_everything() {
        let rig = TestRig::new();
        let (sink, handle) = open(&rig, 2, Duration::from_secs(10));
        handle.transmit(Bytes::from_static(b"bye")).unwrap();
        let device = handle.device().clone();

        drop(handle);
        assert_eq!(rig.transport.pending_count(), 0);
        assert!(!device.net().unwrap().is_running());
        assert!(sink.is_stopped());
    }

    #[test]
    fn test_radio_switch() {
        let rig = TestRig::new();
        let (_sink, handle) = open(&rig, 1, Duration::from_secs(10));
        handle.set_radio(true).unwrap();
        handle.set_radio(false).unwrap();

        let log: Vec<_> = rig.transport.control_log().into_iter().map(|(s, _)| s).collect();
        assert_eq!(
            log,
            vec![SetupPacket::radio_power(true), SetupPacket::radio_power(false)]
        );
    }
}
