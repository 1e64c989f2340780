//! rusb-backed transport
//!
//! libusb's synchronous API is driven from one lane thread per endpoint
//! (plus one for endpoint 0). A lane executes its transfers strictly in
//! submission order, which is what the receive cursors of the serial ports
//! rely on. IN polls use short timeouts so a cancellation is noticed
//! quickly; a poll that times out without data is simply retried.
//!
//! The device handle sits behind a read/write lock: transfers take the read
//! side, a queued reset takes the write side between polls.

use crate::transport::{
    Completion, CompletionHandler, PowerState, Rejected, TransferError, TransferId, TransferKind,
    TransferRequest, TransferTag, Transport,
};
use common::{EventSender, create_event_bridge};
use protocol::SetupPacket;
use rusb::{Context, DeviceHandle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Poll interval of IN transfers
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// Timeout of OUT and control transfers
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Queued transfers per lane
const LANE_DEPTH: usize = 64;
/// Lane key of endpoint 0
const CONTROL_LANE: u8 = 0x00;

type SharedHandle = Arc<RwLock<DeviceHandle<Context>>>;

/// Cancellation and completion tracking of one submitted transfer
#[derive(Default)]
struct Ticket {
    cancelled: AtomicBool,
    done: Mutex<bool>,
    finished: Condvar,
}

impl Ticket {
    fn finish(&self) {
        *self.done.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.finished.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = match self.finished.wait(done) {
                Ok(guard) => guard,
                Err(e) => e.into_inner(),
            };
        }
    }
}

/// Where a completion goes
struct Reply {
    handler: Weak<dyn CompletionHandler>,
    tag: TransferTag,
}

impl Reply {
    fn send(self, completion: Completion) {
        if let Some(handler) = self.handler.upgrade() {
            handler.complete(self.tag, completion);
        }
    }
}

struct Job {
    request: TransferRequest,
    reply: Reply,
}

/// A submitted transfer; `job` is taken by whoever runs or cancels it first
struct Entry {
    ticket: Arc<Ticket>,
    job: Option<Job>,
}

enum LaneEvent {
    Transfer(TransferId),
    Reset,
}

struct Shared {
    handle: SharedHandle,
    entries: Mutex<HashMap<TransferId, Entry>>,
    closed: AtomicBool,
}

impl Shared {
    fn handle(&self) -> RwLockReadGuard<'_, DeviceHandle<Context>> {
        self.handle.read().unwrap_or_else(|e| e.into_inner())
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<TransferId, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Lane {
    tx: EventSender<LaneEvent>,
    thread: Option<JoinHandle<()>>,
}

/// [`Transport`] over a claimed rusb device handle
pub struct UsbTransport {
    shared: Arc<Shared>,
    lanes: Mutex<HashMap<u8, Lane>>,
    next_id: AtomicU64,
}

impl UsbTransport {
    pub fn new(handle: SharedHandle) -> Self {
        Self {
            shared: Arc::new(Shared {
                handle,
                entries: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
            lanes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<u8, Lane>> {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an event on the lane of `key`, spawning the lane on first use
    fn post(&self, key: u8, event: LaneEvent) -> Result<(), (LaneEvent, TransferError)> {
        let mut lanes = self.lanes();
        if !lanes.contains_key(&key) {
            match spawn_lane(key, self.shared.clone()) {
                Ok(lane) => {
                    lanes.insert(key, lane);
                }
                Err(e) => {
                    return Err((event, TransferError::Internal(e.to_string())));
                }
            }
        }
        let Some(lane) = lanes.get(&key) else {
            return Err((event, TransferError::Internal("lane missing".into())));
        };
        lane.tx.try_send(event).map_err(|event| {
            (
                event,
                TransferError::Internal(format!("transfer queue of {:#04x} full", key)),
            )
        })
    }

    /// Stop accepting transfers and let the lanes drain and exit
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let threads: Vec<_> = self
            .lanes()
            .drain()
            .filter_map(|(_, mut lane)| {
                lane.tx.close();
                lane.thread.take()
            })
            .collect();
        let current = std::thread::current().id();
        for thread in threads {
            // A lane may drop the last reference to its own transport
            if thread.thread().id() == current {
                continue;
            }
            if thread.join().is_err() {
                warn!("USB lane thread panicked");
            }
        }
        debug!("USB transport closed");
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn lane_key(kind: &TransferKind) -> u8 {
    match kind {
        TransferKind::Bulk { endpoint } | TransferKind::Interrupt { endpoint, .. } => *endpoint,
        TransferKind::Control { .. } => CONTROL_LANE,
    }
}

fn spawn_lane(key: u8, shared: Arc<Shared>) -> std::io::Result<Lane> {
    let (tx, rx) = create_event_bridge::<LaneEvent>(LANE_DEPTH);
    let thread = std::thread::Builder::new()
        .name(format!("hso-ep{:02x}", key))
        .spawn(move || {
            trace!("Lane {:#04x} started", key);
            while let Ok(event) = rx.recv_blocking() {
                match event {
                    LaneEvent::Transfer(id) => run_job(&shared, id),
                    LaneEvent::Reset => reset_device(&shared),
                }
            }
            trace!("Lane {:#04x} exiting", key);
        })?;
    Ok(Lane {
        tx,
        thread: Some(thread),
    })
}

fn run_job(shared: &Shared, id: TransferId) {
    let (job, ticket) = {
        let mut entries = shared.entries();
        let Some(entry) = entries.get_mut(&id) else {
            return;
        };
        match entry.job.take() {
            Some(job) => (job, entry.ticket.clone()),
            // Cancelled before it reached the head of the lane
            None => return,
        }
    };

    let Job { request, reply } = job;
    let completion = if shared.closed.load(Ordering::Acquire) {
        Completion::failed(request.buffer, TransferError::Shutdown)
    } else {
        execute(shared, request, &ticket)
    };

    match &completion.result {
        Ok(()) => trace!("{} finished: {} bytes", id, completion.actual_length),
        Err(e) => trace!("{} finished: {}", id, e),
    }

    reply.send(completion);
    shared.entries().remove(&id);
    ticket.finish();
}

fn execute(shared: &Shared, request: TransferRequest, ticket: &Ticket) -> Completion {
    let TransferRequest {
        kind,
        mut buffer,
        length,
        zero_packet,
    } = request;
    let length = length.min(buffer.len());

    let result = match kind {
        TransferKind::Control { setup } => control(shared, setup, &mut buffer[..length]),
        TransferKind::Bulk { endpoint } | TransferKind::Interrupt { endpoint, .. }
            if endpoint & 0x80 != 0 =>
        {
            let interrupt = matches!(kind, TransferKind::Interrupt { .. });
            poll_in(shared, endpoint, interrupt, &mut buffer[..length], ticket)
        }
        TransferKind::Bulk { endpoint } => {
            write_bulk(shared, endpoint, &buffer[..length], zero_packet)
        }
        TransferKind::Interrupt { endpoint, .. } => shared
            .handle()
            .write_interrupt(endpoint, &buffer[..length], DEFAULT_TIMEOUT)
            .map_err(map_rusb_error),
    };

    match result {
        Ok(n) => Completion::ok(buffer, n),
        Err(e) => Completion::failed(buffer, e),
    }
}

/// Read until data arrives, an error occurs or the transfer is cancelled
fn poll_in(
    shared: &Shared,
    endpoint: u8,
    interrupt: bool,
    buf: &mut [u8],
    ticket: &Ticket,
) -> Result<usize, TransferError> {
    loop {
        if ticket.cancelled.load(Ordering::Acquire) {
            return Err(TransferError::Cancelled);
        }
        if shared.closed.load(Ordering::Acquire) {
            return Err(TransferError::Shutdown);
        }

        let handle = shared.handle();
        let result = if interrupt {
            handle.read_interrupt(endpoint, buf, POLL_TIMEOUT)
        } else {
            handle.read_bulk(endpoint, buf, POLL_TIMEOUT)
        };
        drop(handle);

        match result {
            Ok(n) => return Ok(n),
            Err(rusb::Error::Timeout) => continue,
            Err(e) => return Err(map_rusb_error(e)),
        }
    }
}

fn write_bulk(
    shared: &Shared,
    endpoint: u8,
    data: &[u8],
    zero_packet: bool,
) -> Result<usize, TransferError> {
    let handle = shared.handle();
    let written = handle
        .write_bulk(endpoint, data, DEFAULT_TIMEOUT)
        .map_err(map_rusb_error)?;
    if zero_packet {
        trace!("Terminating {} byte write on {:#04x} with ZLP", written, endpoint);
        handle
            .write_bulk(endpoint, &[], DEFAULT_TIMEOUT)
            .map_err(map_rusb_error)?;
    }
    Ok(written)
}

fn control(shared: &Shared, setup: SetupPacket, buf: &mut [u8]) -> Result<usize, TransferError> {
    let handle = shared.handle();
    let result = if setup.is_in() {
        handle.read_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            buf,
            DEFAULT_TIMEOUT,
        )
    } else {
        handle.write_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            buf,
            DEFAULT_TIMEOUT,
        )
    };
    result.map_err(map_rusb_error)
}

fn reset_device(shared: &Shared) {
    if shared.closed.load(Ordering::Acquire) {
        return;
    }
    info!("Resetting device");
    let mut handle = shared.handle.write().unwrap_or_else(|e| e.into_inner());
    if let Err(e) = handle.reset() {
        warn!("Device reset failed: {}", e);
    }
}

/// Map a rusb error onto a transfer status
pub fn map_rusb_error(err: rusb::Error) -> TransferError {
    match err {
        rusb::Error::Timeout => TransferError::Timeout,
        rusb::Error::Pipe => TransferError::Stall,
        rusb::Error::NoDevice | rusb::Error::NotFound => TransferError::NoDevice,
        rusb::Error::Overflow => TransferError::Overflow,
        rusb::Error::Io => TransferError::Protocol,
        rusb::Error::Interrupted => TransferError::Cancelled,
        rusb::Error::NoMem => TransferError::Internal(err.to_string()),
        _ => TransferError::Other(err.to_string()),
    }
}

impl Transport for UsbTransport {
    fn submit(
        &self,
        request: TransferRequest,
        handler: Weak<dyn CompletionHandler>,
        tag: TransferTag,
    ) -> Result<TransferId, Rejected> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Rejected {
                error: TransferError::Shutdown,
                buffer: request.buffer,
            });
        }

        let id = TransferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let key = lane_key(&request.kind);
        self.shared.entries().insert(
            id,
            Entry {
                ticket: Arc::new(Ticket::default()),
                job: Some(Job {
                    request,
                    reply: Reply { handler, tag },
                }),
            },
        );

        match self.post(key, LaneEvent::Transfer(id)) {
            Ok(()) => {
                trace!("{} queued on lane {:#04x}", id, key);
                Ok(id)
            }
            Err((_, error)) => {
                let buffer = self
                    .shared
                    .entries()
                    .remove(&id)
                    .and_then(|entry| entry.job)
                    .map(|job| job.request.buffer)
                    .unwrap_or_default();
                Err(Rejected { error, buffer })
            }
        }
    }

    fn cancel(&self, id: TransferId) {
        let (queued, running) = {
            let mut entries = self.shared.entries();
            let Some(entry) = entries.get_mut(&id) else {
                return;
            };
            match entry.job.take() {
                Some(job) => {
                    entries.remove(&id);
                    (Some(job), None)
                }
                None => {
                    entry.ticket.cancelled.store(true, Ordering::Release);
                    (None, Some(entry.ticket.clone()))
                }
            }
        };

        if let Some(Job { request, reply }) = queued {
            trace!("{} cancelled before it started", id);
            reply.send(Completion::failed(request.buffer, TransferError::Cancelled));
        }
        if let Some(ticket) = running {
            trace!("Waiting for {} to be cancelled", id);
            ticket.wait();
        }
    }

    fn control_in(&self, setup: SetupPacket) -> Result<Vec<u8>, TransferError> {
        let mut buf = vec![0u8; setup.length as usize];
        let n = control(&self.shared, setup, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn control_out(&self, setup: SetupPacket, data: &[u8]) -> Result<(), TransferError> {
        let mut buf = data.to_vec();
        control(&self.shared, setup, &mut buf).map(|_| ())
    }

    fn power_state(&self) -> PowerState {
        // libusb gives userspace no runtime-PM control; the device stays up
        PowerState::Active
    }

    fn power_get(&self) -> Result<(), TransferError> {
        Ok(())
    }

    fn power_put(&self) {}

    fn queue_reset(&self) {
        if let Err((_, e)) = self.post(CONTROL_LANE, LaneEvent::Reset) {
            warn!("Could not queue device reset: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), TransferError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), TransferError::Stall);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), TransferError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::Io), TransferError::Protocol);
        assert!(matches!(
            map_rusb_error(rusb::Error::Access),
            TransferError::Other(_)
        ));
    }

    #[test]
    fn test_lane_keys() {
        assert_eq!(lane_key(&TransferKind::Bulk { endpoint: 0x81 }), 0x81);
        assert_eq!(
            lane_key(&TransferKind::Interrupt {
                endpoint: 0x85,
                interval: 10
            }),
            0x85
        );
        let setup = SetupPacket::radio_power(true);
        assert_eq!(lane_key(&TransferKind::Control { setup }), CONTROL_LANE);
    }

    #[test]
    fn test_ticket_wait_returns_after_finish() {
        let ticket = Arc::new(Ticket::default());
        let waiter = {
            let ticket = ticket.clone();
            std::thread::spawn(move || ticket.wait())
        };
        ticket.finish();
        waiter.join().unwrap();
        assert!(*ticket.done.lock().unwrap());
    }
}
