//! Serial channels
//!
//! Two flavours share one state machine:
//!
//! - **mux** ports live on the shared interface. Data is fetched with one
//!   control read per "pending" signal from the demux, so at most one read
//!   is outstanding and `rx_state` tracks it.
//! - **bulk** ports own an endpoint pair and keep every receive slot on the
//!   wire. Completions may arrive in any order; delivery follows the
//!   `curr_rx_idx` cursor so the byte stream keeps submission order.
//!
//! Transmit is double buffered: writers fill one buffer while the other is
//! in flight, and the two are swapped when the in-flight one comes back.

use crate::device::Device;
use crate::error::{DriverError, Result};
use crate::mux::SharedSubchannelDemux;
use crate::pool::TransferPool;
use crate::registry::PortIndex;
use crate::status::{LineCounters, LineMask, ModemStatus, StatusWait};
use crate::transport::{
    Completion, ErrorClass, TransferError, TransferId, TransferRequest, TransferTag,
};
use protocol::{PortKind, SetupPacket, fix_crc_trailer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Receive buffer of a mux port
pub const MUX_RX_BUFFER_SIZE: usize = 1024;
/// Transmit capacity of a mux port
pub const MUX_TX_CAPACITY: usize = 64;
/// Receive buffer of each bulk slot
pub const BULK_RX_BUFFER_SIZE: usize = 4096;
/// Transmit capacity of a bulk port
pub const BULK_TX_CAPACITY: usize = 8192;

/// Downstream receiver of serial bytes (the terminal layer)
///
/// `push` runs with the port's state locked and must not call back into the
/// port; resuming a throttled consumer goes through
/// [`SerialHandle::unthrottle`], which defers the work.
pub trait ByteConsumer: Send + Sync {
    fn is_throttled(&self) -> bool;

    /// Accept received bytes; returns how many were taken
    fn push(&self, data: &[u8]) -> usize;

    /// Room was freed in the transmit buffer
    fn write_wakeup(&self) {}

    /// The device went away
    fn hangup(&self) {}
}

/// State of the single outstanding mux read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Idle,
    RequestSent,
    /// Data was signalled while the receive slot was still undelivered
    RequestPending,
}

/// Modem control lines as seen by the application
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModemLines {
    pub dtr: bool,
    pub rts: bool,
    pub ring: bool,
    pub dcd: bool,
    pub dsr: bool,
}

struct TxBuffers {
    fill: Vec<u8>,
    spare: Option<Vec<u8>>,
    in_flight: Option<TransferId>,
    capacity: usize,
}

struct SerialState {
    open_count: u32,
    running: bool,
    holds_mux: bool,
    rx_state: RxState,
    rx: TransferPool,
    curr_rx_idx: usize,
    last_rx_len: usize,
    tx: TxBuffers,
    consumer: Option<Arc<dyn ByteConsumer>>,
    dtr: bool,
    rts: bool,
}

pub struct SerialPort {
    port: PortKind,
    demux: Option<Arc<SharedSubchannelDemux>>,
    status: Option<ModemStatus>,
    state: Mutex<SerialState>,
    unthrottle_pending: AtomicBool,
}

impl SerialPort {
    /// Port on the shared mux interface
    pub fn mux(port: PortKind, demux: Arc<SharedSubchannelDemux>) -> Self {
        Self::new(port, Some(demux), None, 1, MUX_RX_BUFFER_SIZE, MUX_TX_CAPACITY)
    }

    /// Port on a dedicated bulk interface
    pub fn bulk(port: PortKind, rx_slots: usize, status: Option<ModemStatus>) -> Self {
        Self::new(
            port,
            None,
            status,
            rx_slots.max(1),
            BULK_RX_BUFFER_SIZE,
            BULK_TX_CAPACITY,
        )
    }

    fn new(
        port: PortKind,
        demux: Option<Arc<SharedSubchannelDemux>>,
        status: Option<ModemStatus>,
        rx_slots: usize,
        rx_size: usize,
        tx_capacity: usize,
    ) -> Self {
        Self {
            port,
            demux,
            status,
            state: Mutex::new(SerialState {
                open_count: 0,
                running: false,
                holds_mux: false,
                rx_state: RxState::Idle,
                rx: TransferPool::new(rx_slots, rx_size),
                curr_rx_idx: 0,
                last_rx_len: 0,
                tx: TxBuffers {
                    fill: Vec::with_capacity(tx_capacity),
                    spare: Some(Vec::with_capacity(tx_capacity)),
                    in_flight: None,
                    capacity: tx_capacity,
                },
                consumer: None,
                dtr: false,
                rts: false,
            }),
            unthrottle_pending: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SerialState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn port(&self) -> PortKind {
        self.port
    }

    pub fn is_mux(&self) -> bool {
        self.demux.is_some()
    }

    pub fn has_status(&self) -> bool {
        self.status.is_some()
    }

    pub fn open_count(&self) -> u32 {
        self.lock().open_count
    }

    pub fn rx_state(&self) -> RxState {
        self.lock().rx_state
    }

    pub fn is_slot_filled(&self, idx: usize) -> bool {
        self.lock().rx.is_filled(idx)
    }

    pub fn write_room(&self) -> usize {
        let state = self.lock();
        state.tx.capacity - state.tx.fill.len()
    }

    pub fn chars_in_buffer(&self) -> usize {
        self.lock().tx.fill.len()
    }

    // ---- lifecycle ----

    pub(crate) fn open(&self, dev: &Device, consumer: Arc<dyn ByteConsumer>) -> Result<()> {
        let _guard = dev.lock();
        if dev.is_gone() {
            return Err(DriverError::Gone);
        }

        dev.transport.power_get()?;
        let result = self.open_locked(dev, consumer);
        dev.transport.power_put();
        result
    }

    fn open_locked(&self, dev: &Device, consumer: Arc<dyn ByteConsumer>) -> Result<()> {
        {
            let mut state = self.lock();
            state.open_count += 1;
            if state.open_count > 1 {
                debug!("{} opened again, count {}", self.port, state.open_count);
                return Ok(());
            }
            state.consumer = Some(consumer);
            state.rx_state = RxState::Idle;
        }

        if let Err(e) = self.start(dev) {
            warn!("Failed to start {} port: {}", self.port, e);
            self.stop(dev);
            let mut state = self.lock();
            state.open_count -= 1;
            state.consumer = None;
            return Err(e.into());
        }

        if self.port == PortKind::Modem
            && let Err(e) = self.set_lines(dev, Some(true), Some(true))
        {
            warn!("Failed to raise DTR/RTS: {}", e);
        }
        debug!("{} opened", self.port);
        Ok(())
    }

    pub(crate) fn close(&self, dev: &Device) {
        let _guard = dev.lock();
        let gone = dev.is_gone();
        let powered = !gone && dev.transport.power_get().is_ok();

        let last = {
            let mut state = self.lock();
            if state.open_count == 0 {
                warn!("{} closed more often than opened", self.port);
                false
            } else {
                state.open_count -= 1;
                if state.open_count == 0 {
                    state.consumer = None;
                }
                state.open_count == 0
            }
        };

        if last && !gone {
            self.stop(dev);
        }
        if powered {
            dev.transport.power_put();
        }
        debug!("{} closed (last: {})", self.port, last);
    }

    /// Put the receive path (and modem status) on the wire
    pub(crate) fn start(&self, dev: &Device) -> std::result::Result<(), TransferError> {
        {
            let mut state = self.lock();
            state.running = true;
            if let Some(demux) = &self.demux {
                state.holds_mux = true;
                drop(state);
                demux.arm()?;
            } else {
                for idx in 0..state.rx.len() {
                    if state.rx.is_idle(idx) {
                        self.submit_bulk_read(dev, &mut state, idx)?;
                    }
                }
            }
        }

        if let Some(status) = &self.status {
            status.start(dev)?;
        }
        Ok(())
    }

    /// Cancel all I/O and drop undelivered data
    pub(crate) fn stop(&self, dev: &Device) {
        let (ids, holds_mux) = {
            let mut state = self.lock();
            state.running = false;
            let mut ids = state.rx.in_flight();
            ids.extend(state.tx.in_flight);
            (ids, std::mem::take(&mut state.holds_mux))
        };

        for id in ids {
            dev.transport.cancel(id);
        }

        {
            let mut state = self.lock();
            state.rx.reset_filled();
            state.curr_rx_idx = 0;
            state.rx_state = RxState::Idle;
        }

        if holds_mux && let Some(demux) = &self.demux {
            demux.disarm();
        }
        if let Some(status) = &self.status {
            status.stop(dev);
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.lock().open_count > 0
    }

    /// Tell the consumer the device is gone
    pub(crate) fn hangup(&self) {
        let consumer = self.lock().consumer.clone();
        if let Some(consumer) = consumer {
            consumer.hangup();
        }
    }

    // ---- receive ----

    /// The demux saw data pending for this sub-channel
    pub(crate) fn on_mux_signal(&self, dev: &Device) {
        let mut state = self.lock();
        if state.rx_state != RxState::Idle || state.open_count == 0 || !state.running {
            trace!("{} signalled with read outstanding or port closed", self.port);
            return;
        }

        if state.rx.is_filled(0) {
            state.rx_state = RxState::RequestPending;
        } else {
            self.issue_mux_read(dev, &mut state);
        }
    }

    fn issue_mux_read(&self, dev: &Device, state: &mut SerialState) {
        let port = self.port;
        state.rx_state = RxState::RequestSent;
        let result = state.rx.submit(
            0,
            dev.transport.as_ref(),
            dev.handler(),
            TransferTag::Read(0),
            |buf| {
                let length = buf.len() as u16;
                TransferRequest::control(SetupPacket::mux_read(port, length), buf)
            },
        );
        if let Err(e) = result {
            warn!("{}: failed to request mux response: {}", port, e);
            state.rx_state = RxState::Idle;
        }
    }

    fn submit_bulk_read(
        &self,
        dev: &Device,
        state: &mut SerialState,
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

    fn mux_read_done(&self, dev: &Device, completion: Completion) {
        let mut state = self.lock();
        match state.rx.complete(0, completion) {
            Ok(len) => {
                state.last_rx_len = len;
                self.drain_mux(dev, &mut state);
            }
            Err(e) => {
                let class = dev.handle_transfer_error("mux read", &e);
                if class == ErrorClass::Transient
                    && state.open_count > 0
                    && state.running
                    && !dev.is_gone()
                {
                    self.issue_mux_read(dev, &mut state);
                } else {
                    state.rx_state = RxState::Idle;
                }
            }
        }
    }

    fn bulk_read_done(&self, dev: &Device, idx: usize, mut completion: Completion) {
        if dev.spec().crc_quirk
            && completion.result.is_ok()
            && let Some(ep) = &dev.endpoints().bulk_in
        {
            completion.actual_length =
                fix_crc_trailer(&completion.buffer, completion.actual_length, ep.max_packet());
        }

        let mut state = self.lock();
        match state.rx.complete(idx, completion) {
            Ok(_) if !state.running || state.open_count == 0 => state.rx.release(idx),
            Ok(_) => self.drain_bulk(dev, &mut state),
            Err(e) => {
                let class = dev.handle_transfer_error("bulk read", &e);
                if class == ErrorClass::Transient
                    && state.running
                    && state.open_count > 0
                    && !dev.is_gone()
                {
                    // Resubmitted from the drain once the cursor reaches it
                    state.rx.fill_empty(idx);
                    self.drain_bulk(dev, &mut state);
                }
            }
        }
    }

    /// Hand one filled slot to the consumer
    ///
    /// Returns false when the consumer is throttled; the slot stays filled.
    fn deliver(&self, state: &mut SerialState, idx: usize) -> bool {
        let Some(consumer) = state.consumer.clone() else {
            state.rx.release(idx);
            return true;
        };
        if consumer.is_throttled() {
            trace!("{}: consumer throttled, holding slot {}", self.port, idx);
            return false;
        }

        if let Some(data) = state.rx.filled(idx)
            && !data.is_empty()
        {
            let pushed = consumer.push(data);
            if pushed < data.len() {
                warn!(
                    "{}: consumer out of room, dropping {} bytes",
                    self.port,
                    data.len() - pushed
                );
            }
        }
        state.rx.release(idx);
        true
    }

    fn drain_mux(&self, dev: &Device, state: &mut SerialState) {
        if !state.rx.is_filled(0) {
            return;
        }
        if state.open_count == 0 || !state.running {
            state.rx.release(0);
            state.rx_state = RxState::Idle;
            return;
        }
        if !self.deliver(state, 0) {
            // The read is over; further signals only mark data as pending
            if state.rx_state == RxState::RequestSent {
                state.rx_state = RxState::Idle;
            }
            return;
        }

        if state.last_rx_len != 0 || state.rx_state == RxState::RequestPending {
            self.issue_mux_read(dev, state);
        } else {
            state.rx_state = RxState::Idle;
        }
    }

    fn drain_bulk(&self, dev: &Device, state: &mut SerialState) {
        while state.rx.is_filled(state.curr_rx_idx) {
            let idx = state.curr_rx_idx;
            if !self.deliver(state, idx) {
                return;
            }
            if state.running
                && !dev.is_gone()
                && let Err(e) = self.submit_bulk_read(dev, state, idx)
            {
                warn!("{}: failed to resubmit slot {}: {}", self.port, idx, e);
            }
            state.curr_rx_idx = (idx + 1) % state.rx.len();
        }
    }

    fn drain(&self, dev: &Device) {
        let mut state = self.lock();
        if state.open_count == 0 {
            return;
        }
        if self.is_mux() {
            self.drain_mux(dev, &mut state);
        } else {
            self.drain_bulk(dev, &mut state);
        }
    }

    /// Resume delivery after the consumer was throttled
    ///
    /// The drain runs later on the work queue, never on the caller's stack.
    pub(crate) fn unthrottle(&self, dev: &Device) -> Result<()> {
        if self.unthrottle_pending.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let weak = dev.weak();
        let scheduled = dev.work.schedule(Box::new(move || {
            if let Some(dev) = weak.upgrade()
                && let Some(port) = dev.serial()
            {
                port.unthrottle_pending.store(false, Ordering::Release);
                port.drain(&dev);
            }
        }));

        if let Err(e) = scheduled {
            self.unthrottle_pending.store(false, Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }

    // ---- transmit ----

    /// Queue as much of `data` as fits; returns the accepted count
    pub(crate) fn write(&self, dev: &Device, data: &[u8]) -> Result<usize> {
        if dev.is_gone() {
            return Err(DriverError::Gone);
        }

        let accepted = {
            let mut state = self.lock();
            let room = state.tx.capacity - state.tx.fill.len();
            let accepted = room.min(data.len());
            state.tx.fill.extend_from_slice(&data[..accepted]);
            accepted
        };

        self.kick_transmit(dev);
        Ok(accepted)
    }

    /// Send the fill buffer if nothing is in flight and the device is awake
    pub(crate) fn kick_transmit(&self, dev: &Device) {
        let mut state = self.lock();
        if state.tx.fill.is_empty()
            || state.tx.in_flight.is_some()
            || !state.running
            || dev.is_gone()
        {
            return;
        }

        let bulk_out = dev.endpoints().bulk_out.as_ref().map(|ep| ep.address);
        if !self.is_mux() && bulk_out.is_none() {
            warn!("{}: no bulk OUT endpoint", self.port);
            return;
        }

        let weak = dev.weak();
        let gate = dev.activity.begin_io(move || {
            if let Some(dev) = weak.upgrade()
                && let Some(port) = dev.serial()
            {
                port.kick_transmit(&dev);
            }
        });
        if !gate.is_ready() {
            debug!("{}: transmit deferred ({:?})", self.port, gate);
            return;
        }

        let capacity = state.tx.capacity;
        let next = state
            .tx
            .spare
            .take()
            .unwrap_or_else(|| Vec::with_capacity(capacity));
        let buffer = std::mem::replace(&mut state.tx.fill, next);
        let length = buffer.len();

        let request = match bulk_out {
            Some(endpoint) if !self.is_mux() => TransferRequest::bulk(endpoint, buffer, length),
            _ => TransferRequest::control(SetupPacket::mux_write(self.port, length as u16), buffer),
        };

        match dev.transport.submit(request, dev.handler(), TransferTag::Write) {
            Ok(id) => {
                trace!("{}: sending {} bytes as {}", self.port, length, id);
                state.tx.in_flight = Some(id);
            }
            Err(rejected) => {
                warn!(
                    "{}: write of {} bytes failed, dropping: {}",
                    self.port, length, rejected.error
                );
                let mut buffer = rejected.buffer;
                buffer.clear();
                state.tx.spare = Some(buffer);
                dev.activity.end_io();
            }
        }
    }

    fn write_done(&self, dev: &Device, completion: Completion) {
        let Completion { result, buffer, .. } = completion;
        let consumer = {
            let mut state = self.lock();
            state.tx.in_flight = None;
            let mut buffer = buffer;
            buffer.clear();
            state.tx.spare = Some(buffer);
            state.consumer.clone()
        };
        dev.activity.end_io();

        if let Err(e) = result {
            dev.handle_transfer_error("serial write", &e);
            return;
        }

        if let Some(consumer) = consumer {
            consumer.write_wakeup();
        }
        self.kick_transmit(dev);
    }

    pub(crate) fn complete(&self, dev: &Device, tag: TransferTag, completion: Completion) {
        match tag {
            TransferTag::Read(_) if self.is_mux() => self.mux_read_done(dev, completion),
            TransferTag::Read(idx) => self.bulk_read_done(dev, idx, completion),
            TransferTag::Write => self.write_done(dev, completion),
            TransferTag::Notify => match &self.status {
                Some(status) => status.complete(dev, completion),
                None => warn!("{}: unexpected status completion", self.port),
            },
        }
    }

    /// Cancel everything after removal; the port stays open until closed
    pub(crate) fn shutdown(&self, dev: &Device) {
        let ids = {
            let mut state = self.lock();
            state.running = false;
            let mut ids = state.rx.in_flight();
            ids.extend(state.tx.in_flight);
            ids
        };
        for id in ids {
            dev.transport.cancel(id);
        }
        self.lock().rx.reset_filled();
        if let Some(status) = &self.status {
            status.stop(dev);
        }
    }

    // ---- modem control ----

    fn set_lines(&self, dev: &Device, dtr: Option<bool>, rts: Option<bool>) -> Result<()> {
        if self.port != PortKind::Modem {
            return Err(DriverError::NotSupported(
                "line control is only available on the modem port",
            ));
        }
        if dev.is_gone() {
            return Err(DriverError::Gone);
        }

        let (dtr, rts) = {
            let mut state = self.lock();
            if let Some(dtr) = dtr {
                state.dtr = dtr;
            }
            if let Some(rts) = rts {
                state.rts = rts;
            }
            (state.dtr, state.rts)
        };

        dev.transport
            .control_out(SetupPacket::line_control(dev.interface(), dtr, rts), &[])?;
        Ok(())
    }

    fn lines(&self) -> ModemLines {
        let (dtr, rts) = {
            let state = self.lock();
            (state.dtr, state.rts)
        };
        let uart = self.status.as_ref().map(|s| s.lines()).unwrap_or_default();
        ModemLines {
            dtr,
            rts,
            ring: uart.ring(),
            dcd: uart.dcd(),
            dsr: uart.dsr(),
        }
    }

    fn status(&self) -> Result<&ModemStatus> {
        self.status
            .as_ref()
            .ok_or(DriverError::NotSupported("port has no status endpoint"))
    }
}

/// An open serial port
///
/// Dropping the handle closes the port.
pub struct SerialHandle {
    device: Arc<Device>,
}

impl SerialHandle {
    pub(crate) fn open(device: Arc<Device>, consumer: Arc<dyn ByteConsumer>) -> Result<Self> {
        let port = device
            .serial()
            .ok_or(DriverError::NotSupported("not a serial port"))?;
        port.open(&device, consumer)?;
        Ok(Self { device })
    }

    fn port(&self) -> Result<&SerialPort> {
        self.device
            .serial()
            .ok_or(DriverError::NotSupported("not a serial port"))
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn index(&self) -> Option<PortIndex> {
        self.device.index()
    }

    pub fn port_type(&self) -> &'static str {
        self.device.port_type()
    }

    /// Queue bytes for transmission; short writes are normal
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.port()?.write(&self.device, data)
    }

    pub fn write_room(&self) -> usize {
        self.port().map(SerialPort::write_room).unwrap_or(0)
    }

    pub fn chars_in_buffer(&self) -> usize {
        self.port().map(SerialPort::chars_in_buffer).unwrap_or(0)
    }

    pub fn unthrottle(&self) -> Result<()> {
        self.port()?.unthrottle(&self.device)
    }

    pub fn tiocmget(&self) -> Result<ModemLines> {
        Ok(self.port()?.lines())
    }

    /// Change DTR and/or RTS; `None` leaves a line as it is
    pub fn tiocmset(&self, dtr: Option<bool>, rts: Option<bool>) -> Result<()> {
        self.port()?.set_lines(&self.device, dtr, rts)
    }

    pub fn icount(&self) -> Result<LineCounters> {
        Ok(self.port()?.status()?.counters())
    }

    /// Block until a line selected by `mask` changes state
    pub fn wait_modem_status(&self, mask: LineMask, timeout: Duration) -> Result<StatusWait> {
        Ok(self.port()?.status()?.wait(mask, timeout))
    }
}

impl Drop for SerialHandle {
    fn drop(&mut self) {
        if let Some(port) = self.device.serial() {
            port.close(&self.device);
        }
    }
}
