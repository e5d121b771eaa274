//! The transfer engine (C4): transfer allocation, the timeout-ordered
//! in-flight set, submission, and the cancellation/completion handshake.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::backend::{Backend, CompletionSink, ReapOutcome};
use crate::handle::Handle;
use crate::{Error, Result};

bitflags! {
    /// Per-transfer behavior flags, set by the caller before submission.
    pub struct TransferFlags: u8 {
        /// Treat a short transfer as an error instead of a success.
        const SHORT_NOT_OK = 1 << 0;
        /// Drop the engine's retained handle to the transfer once its
        /// completion callback has run.
        const FREE_TRANSFER = 1 << 1;
        /// Buffer-ownership flag: since `Transfer`'s buffer is an owned
        /// `Vec<u8>` dropped along with the rest of `TransferInner`, this
        /// doesn't drive a second, separate free the way a raw-pointer
        /// buffer would; kept so callers porting flag bitmasks don't need
        /// a special case for it.
        const FREE_BUFFER = 1 << 2;
        const ADD_ZERO_PACKET = 1 << 3;
    }
}

bitflags! {
    /// Engine-private bookkeeping, never exposed to the backend.
    struct EngineFlags: u8 {
        const TIMED_OUT = 1 << 0;
        const SYNC_CANCELLED = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Terminal status a transfer's completion callback observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferState {
    Idle,
    InFlight,
    Cancelling,
}

/// Absolute point in time a transfer must complete by, or the sentinel
/// "never" for a zero-timeout submission.
#[derive(Debug, Clone, Copy)]
enum Deadline {
    Finite(Instant),
    Infinite,
}

/// Key type for the in-flight `BTreeMap`.
///
/// Orders entries by ascending deadline, with infinite-deadline entries at
/// the tail and ties broken by arrival order, as a total order over safe,
/// ownable keys instead of an intrusively linked list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FlightKey {
    infinite: bool,
    deadline: Option<Instant>,
    seq: u64,
}

impl PartialOrd for FlightKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlightKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.infinite
            .cmp(&other.infinite)
            .then_with(|| match (self.deadline, other.deadline) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => std::cmp::Ordering::Equal,
            })
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

pub(crate) struct TransferInner {
    handle: Handle,
    endpoint: u8,
    endpoint_type: EndpointType,
    flags: TransferFlags,
    timeout_ms: u32,
    buffer: Mutex<Vec<u8>>,
    expected_length: usize,
    actual_length: AtomicU64,
    status: Mutex<Option<TransferStatus>>,
    state: Mutex<TransferState>,
    engine_flags: Mutex<EngineFlags>,
    deadline: Mutex<Deadline>,
    backend_data: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    callback: Mutex<Option<Box<dyn Fn(&Transfer) + Send + Sync>>>,
}

/// A single asynchronous USB transfer.
///
/// Created idle via [`TransferEngine::alloc`]; submitted, possibly
/// cancelled, and eventually completed through [`TransferEngine`]. Cheap to
/// clone — clones share the same underlying state.
#[derive(Clone)]
pub struct Transfer(pub(crate) Arc<TransferInner>);

impl Transfer {
    pub fn handle(&self) -> &Handle {
        &self.0.handle
    }

    pub fn endpoint(&self) -> u8 {
        self.0.endpoint
    }

    pub fn endpoint_type(&self) -> EndpointType {
        self.0.endpoint_type
    }

    pub fn flags(&self) -> TransferFlags {
        self.0.flags
    }

    pub fn timeout_ms(&self) -> u32 {
        self.0.timeout_ms
    }

    pub fn buffer(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.0.buffer.lock().unwrap()
    }

    pub fn actual_length(&self) -> usize {
        self.0.actual_length.load(Ordering::SeqCst) as usize
    }

    /// Record how many bytes the backend actually transferred. Called by a
    /// `Backend` impl while reaping, before handing the transfer to the
    /// completion sink.
    pub fn set_actual_length(&self, actual_length: usize) {
        self.0.actual_length.store(actual_length as u64, Ordering::SeqCst);
    }

    pub fn expected_length(&self) -> usize {
        self.0.expected_length
    }

    pub fn status(&self) -> Option<TransferStatus> {
        *self.0.status.lock().unwrap()
    }

    pub fn set_callback(&self, cb: impl Fn(&Transfer) + Send + Sync + 'static) {
        *self.0.callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn with_backend_data<T, R>(
        &self,
        default: impl FnOnce() -> T,
        f: impl FnOnce(&mut T) -> R,
    ) -> R
    where
        T: Any + Send + Sync,
    {
        let mut guard = self.0.backend_data.lock().unwrap();
        if guard.is_none() {
            *guard = Some(Box::new(default()));
        }
        let data = guard
            .as_mut()
            .unwrap()
            .downcast_mut::<T>()
            .expect("backend private data type mismatch");
        f(data)
    }

    fn key(&self, seq: u64) -> FlightKey {
        match *self.0.deadline.lock().unwrap() {
            Deadline::Finite(at) => FlightKey {
                infinite: false,
                deadline: Some(at),
                seq,
            },
            Deadline::Infinite => FlightKey {
                infinite: true,
                deadline: None,
                seq,
            },
        }
    }
}

/// Informational size of a transfer's backing allocation. `Transfer` is an
/// `Arc`-managed value with no fixed, preallocated layout, so this is
/// advisory only, not anything the engine itself relies on.
pub(crate) fn alloc_size() -> usize {
    std::mem::size_of::<TransferInner>()
}

/// Owns the timeout-ordered in-flight set and drives submission,
/// cancellation, and completion for every [`Transfer`] belonging to one
/// [`crate::Context`].
pub struct TransferEngine {
    backend: Arc<dyn Backend>,
    in_flight: Mutex<BTreeMap<FlightKey, Transfer>>,
    seq: AtomicU64,
}

impl TransferEngine {
    pub(crate) fn new(backend: Arc<dyn Backend>) -> Self {
        TransferEngine {
            backend,
            in_flight: Mutex::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Allocate an idle transfer over `buffer`, addressed to `endpoint` on
    /// `handle`.
    pub fn alloc(
        &self,
        handle: &Handle,
        endpoint: u8,
        endpoint_type: EndpointType,
        buffer: Vec<u8>,
        flags: TransferFlags,
        timeout_ms: u32,
    ) -> Transfer {
        let expected_length = buffer.len();
        Transfer(Arc::new(TransferInner {
            handle: handle.clone(),
            endpoint,
            endpoint_type,
            flags,
            timeout_ms,
            buffer: Mutex::new(buffer),
            expected_length,
            actual_length: AtomicU64::new(0),
            status: Mutex::new(None),
            state: Mutex::new(TransferState::Idle),
            engine_flags: Mutex::new(EngineFlags::empty()),
            deadline: Mutex::new(Deadline::Infinite),
            backend_data: Mutex::new(None),
            callback: Mutex::new(None),
        }))
    }

    /// Re-zero a previously-used `transfer` so it can be submitted again.
    /// `Transfer` never needs a fresh allocation to be reused, so this only
    /// resets the mutable state `submit` would otherwise leave behind from
    /// the transfer's last trip (status, actual length, callback,
    /// backend-private data); it refuses to touch a transfer that's still
    /// in flight.
    pub fn reinit(&self, transfer: &Transfer) -> Result<()> {
        let state = transfer.0.state.lock().unwrap();
        if *state != TransferState::Idle {
            return Err(Error::Busy);
        }
        drop(state);

        transfer.0.actual_length.store(0, Ordering::SeqCst);
        transfer.0.status.lock().unwrap().take();
        transfer.0.engine_flags.lock().unwrap().remove(EngineFlags::all());
        *transfer.0.deadline.lock().unwrap() = Deadline::Infinite;
        transfer.0.backend_data.lock().unwrap().take();
        transfer.0.callback.lock().unwrap().take();
        Ok(())
    }

    /// Submit `transfer` to the backend and, on success, insert it into the
    /// in-flight set at its ordering-correct position.
    pub fn submit(&self, transfer: &Transfer) -> Result<()> {
        {
            let mut state = transfer.0.state.lock().unwrap();
            if *state != TransferState::Idle {
                return Err(Error::Busy);
            }
            *state = TransferState::InFlight;
        }

        transfer.0.actual_length.store(0, Ordering::SeqCst);
        transfer.0.status.lock().unwrap().take();
        transfer
            .0
            .engine_flags
            .lock()
            .unwrap()
            .remove(EngineFlags::TIMED_OUT | EngineFlags::SYNC_CANCELLED);

        let deadline = if transfer.0.timeout_ms == 0 {
            Deadline::Infinite
        } else {
            Deadline::Finite(Instant::now() + Duration::from_millis(transfer.0.timeout_ms as u64))
        };
        *transfer.0.deadline.lock().unwrap() = deadline;

        if transfer.0.endpoint_type == EndpointType::Control {
            swap_setup_to_bus_endian(&mut transfer.0.buffer.lock().unwrap());
        }

        if let Err(e) = self.backend.submit_transfer(transfer) {
            *transfer.0.state.lock().unwrap() = TransferState::Idle;
            return Err(e);
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let key = transfer.key(seq);
        self.in_flight.lock().unwrap().insert(key, transfer.clone());
        Ok(())
    }

    /// Request asynchronous cancellation. Completion still arrives later,
    /// through the event loop.
    pub fn cancel(&self, transfer: &Transfer) -> Result<()> {
        {
            let state = transfer.0.state.lock().unwrap();
            if *state != TransferState::InFlight {
                return Err(Error::NotFound);
            }
        }
        *transfer.0.state.lock().unwrap() = TransferState::Cancelling;
        self.backend.cancel_transfer(transfer)
    }

    /// Sets `SYNC_CANCELLED`, then pumps `pump` (the event loop, supplied by
    /// `Context`) in bounded slices until the flag clears, i.e. until the
    /// cancellation has actually been reaped.
    pub fn cancel_sync(&self, transfer: &Transfer, mut pump: impl FnMut() -> Result<()>) -> Result<()> {
        self.cancel(transfer)?;
        transfer
            .0
            .engine_flags
            .lock()
            .unwrap()
            .insert(EngineFlags::SYNC_CANCELLED);
        loop {
            if !transfer
                .0
                .engine_flags
                .lock()
                .unwrap()
                .contains(EngineFlags::SYNC_CANCELLED)
            {
                return Ok(());
            }
            pump()?;
        }
    }

    /// Scan the in-flight set from the earliest deadline, marking every
    /// expired, not-yet-processed entry `TIMED_OUT` and async-cancelling it.
    /// Stops at the first non-expired or infinite-deadline entry.
    pub fn handle_timeouts(&self) {
        let now = Instant::now();
        let expired: Vec<Transfer> = {
            let in_flight = self.in_flight.lock().unwrap();
            let mut out = Vec::new();
            for (key, transfer) in in_flight.iter() {
                if key.infinite {
                    break;
                }
                match key.deadline {
                    Some(d) if d <= now => out.push(transfer.clone()),
                    _ => break,
                }
            }
            out
        };
        for transfer in expired {
            let already_cancelling = {
                let mut state = transfer.0.state.lock().unwrap();
                if *state != TransferState::InFlight {
                    true
                } else {
                    *state = TransferState::Cancelling;
                    false
                }
            };
            if already_cancelling {
                continue;
            }
            transfer
                .0
                .engine_flags
                .lock()
                .unwrap()
                .insert(EngineFlags::TIMED_OUT);
            if let Err(e) = self.backend.cancel_transfer(&transfer) {
                log::error!("failed to cancel timed-out transfer: {}", e);
            }
        }
    }

    /// The wait bound for the next event-loop tick driven by the in-flight
    /// set alone: `None` if no finite-deadline entry exists.
    ///
    /// Skips entries already flagged `TIMED_OUT`: their once-only timeout
    /// processing has already run (an async cancel is in flight for them),
    /// so they must not keep pinning the computed deadline to "now" forever
    /// while the cancellation makes its way back through the backend.
    pub fn next_timeout(&self) -> Option<Duration> {
        let in_flight = self.in_flight.lock().unwrap();
        for (key, transfer) in in_flight.iter() {
            if key.infinite {
                return None;
            }
            let already_timed_out = transfer
                .0
                .engine_flags
                .lock()
                .unwrap()
                .contains(EngineFlags::TIMED_OUT);
            if already_timed_out {
                continue;
            }
            return match key.deadline {
                Some(at) => {
                    let now = Instant::now();
                    Some(if at > now { at - now } else { Duration::ZERO })
                }
                None => None,
            };
        }
        None
    }

    fn remove_from_flight(&self, transfer: &Transfer) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let to_remove = in_flight
            .iter()
            .find(|(_, t)| Arc::ptr_eq(&t.0, &transfer.0))
            .map(|(k, _)| *k);
        if let Some(key) = to_remove {
            in_flight.remove(&key);
        }
    }

    fn finalize(&self, transfer: &Transfer, status: TransferStatus) {
        self.remove_from_flight(transfer);
        *transfer.0.state.lock().unwrap() = TransferState::Idle;
        *transfer.0.status.lock().unwrap() = Some(status);
        if let Some(cb) = transfer.0.callback.lock().unwrap().as_ref() {
            cb(transfer);
        }
    }
}

impl CompletionSink for TransferEngine {
    fn reap(&self, transfer: &Transfer, outcome: ReapOutcome) {
        match outcome {
            ReapOutcome::Completed(status) => {
                let sync_cancelled = {
                    let mut flags = transfer.0.engine_flags.lock().unwrap();
                    let was = flags.contains(EngineFlags::SYNC_CANCELLED);
                    flags.remove(EngineFlags::SYNC_CANCELLED);
                    was
                };
                if sync_cancelled {
                    self.remove_from_flight(transfer);
                    *transfer.0.state.lock().unwrap() = TransferState::Idle;
                    return;
                }

                let transferred = transfer.0.actual_length.load(Ordering::SeqCst) as usize;
                let control_header = if transfer.0.endpoint_type == EndpointType::Control {
                    8
                } else {
                    0
                };
                let short = transferred + control_header < transfer.0.expected_length;
                let final_status = if status == TransferStatus::Completed
                    && short
                    && transfer.0.flags.contains(TransferFlags::SHORT_NOT_OK)
                {
                    TransferStatus::Error
                } else {
                    status
                };
                self.finalize(transfer, final_status);
            }
            ReapOutcome::Cancelled => {
                let (sync_cancelled, timed_out) = {
                    let mut flags = transfer.0.engine_flags.lock().unwrap();
                    let sync = flags.contains(EngineFlags::SYNC_CANCELLED);
                    let timeout = flags.contains(EngineFlags::TIMED_OUT);
                    flags.remove(EngineFlags::SYNC_CANCELLED | EngineFlags::TIMED_OUT);
                    (sync, timeout)
                };
                if sync_cancelled {
                    self.remove_from_flight(transfer);
                    *transfer.0.state.lock().unwrap() = TransferState::Idle;
                } else if timed_out {
                    self.finalize(transfer, TransferStatus::TimedOut);
                } else {
                    self.finalize(transfer, TransferStatus::Cancelled);
                }
            }
        }
    }
}

/// Byte-swap `wValue`/`wIndex`/`wLength` of the setup packet at the head of
/// a control transfer's buffer into bus (little) endian, in place.
///
/// Operates on the raw bytes directly rather than going through
/// [`Setup`]'s typed conversion, since the buffer here is an opaque
/// `Vec<u8>` rather than a `Setup<NativeEndian>` value.
fn swap_setup_to_bus_endian(buffer: &mut [u8]) {
    if buffer.len() < 8 {
        return;
    }
    for offset in [2usize, 4, 6] {
        let native = u16::from_ne_bytes([buffer[offset], buffer[offset + 1]]);
        buffer[offset..offset + 2].copy_from_slice(&native.to_le_bytes());
    }
}
