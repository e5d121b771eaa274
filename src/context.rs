//! `Context`: process-wide USB core state scoped to one value, wiring the
//! registry, handle manager, transfer engine, and poll-fd set together
//! behind one handle applications hold and pass by reference.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::{Backend, CompletionSink, PollFdSink};
use crate::device::{Device, DeviceList, Registry};
use crate::handle::{Handle, OpenHandles};
use crate::pollfd::{PollEvents, PollFd, PollFdSet};
use crate::transfer::{EndpointType, Transfer, TransferEngine, TransferFlags};
use crate::{Error, Result};

/// Default wait bound for [`Context::poll`]'s two-second default
/// event-loop tick.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// The core's process-(per-instance)-wide state: a device registry, an
/// open-handle set, a transfer engine, and a poll-fd set, all built on one
/// shared [`Backend`].
///
/// Every other operation in this crate takes a `&Context` (or is a method
/// on it); there is no process-global mutable state anywhere else.
pub struct Context {
    backend: Arc<dyn Backend>,
    registry: Registry,
    handles: OpenHandles,
    transfers: TransferEngine,
    pollfds: PollFdSet,
}

impl Context {
    /// Create a new context over `backend`. Calls the backend's `init` hook
    /// once, giving it the chance to register any persistent fds (e.g. a
    /// hotplug notification socket) with the poll-fd set.
    pub fn new(backend: Arc<dyn Backend>) -> Result<Context> {
        let pollfds = PollFdSet::new();
        backend.init(&pollfds)?;
        Ok(Context {
            registry: Registry::new(backend.clone()),
            handles: OpenHandles::new(backend.clone()),
            transfers: TransferEngine::new(backend.clone()),
            pollfds,
            backend,
        })
    }

    /// Forcibly close any handles the application left open (logging a
    /// warning for each), then drop this context.
    pub fn shutdown(&self) {
        let open = self.handles.snapshot();
        if !open.is_empty() {
            log::warn!(
                "context shutdown with {} handle(s) still open; force-closing",
                open.len()
            );
        }
        for handle in open {
            self.handles.close(&handle, &self.pollfds);
        }
    }

    // ---- C2: device registry -------------------------------------------

    /// Enumerate every device currently attached. Each entry in the
    /// returned list holds one reference on top of whatever the registry
    /// itself retains.
    pub fn get_device_list(&self) -> Result<DeviceList> {
        let discovered = self.backend.get_device_list(&self.registry)?;
        for device in &discovered {
            if let Err(e) = self.registry.sanitize(device) {
                log::error!(
                    "device {}.{} failed sanitization: {}",
                    device.bus_number(),
                    device.device_address(),
                    e
                );
            }
        }
        // `discovered` already holds one reference per device (the
        // registry's `allocate` only ever hands out ref'd `Device`s); the
        // public list takes ownership of exactly that reference without a
        // second explicit ref step.
        Ok(DeviceList(discovered))
    }

    /// Convenience lookup: enumerate, find the first device whose
    /// descriptor matches `vid`/`pid`, open it, and release the rest of the
    /// list. Returns `Ok(None)` if no match is found. Not suitable when more
    /// than one matching device may be attached.
    pub fn open_device_with_vid_pid(&self, vid: u16, pid: u16) -> Result<Option<Handle>> {
        let list = self.get_device_list()?;
        let mut found = None;
        for device in list.iter() {
            let (raw, _host_endian) = self.backend.get_device_descriptor(device)?;
            if raw.len() < 18 {
                continue;
            }
            let id_vendor = u16::from_le_bytes([raw[8], raw[9]]);
            let id_product = u16::from_le_bytes([raw[10], raw[11]]);
            if id_vendor == vid && id_product == pid {
                found = Some(device.clone());
                break;
            }
        }
        match found {
            Some(device) => Ok(Some(self.open(&device)?)),
            None => Ok(None),
        }
    }

    /// Walk the active configuration descriptor's interfaces, alt-settings,
    /// and endpoints for the first endpoint matching `endpoint`, returning
    /// its `wMaxPacketSize`. Scans every alt-setting, not only the active
    /// one.
    pub fn get_max_packet_size(&self, device: &Device, endpoint: u8) -> Result<u16> {
        let config = self.backend.get_active_config_descriptor(device)?;
        crate::descriptors::find_max_packet_size(&config, endpoint).ok_or(Error::NotFound)
    }

    // ---- C3: handle manager ---------------------------------------------

    pub fn open(&self, device: &Device) -> Result<Handle> {
        self.handles.open(device, &self.pollfds)
    }

    pub fn close(&self, handle: &Handle) {
        self.handles.close(handle, &self.pollfds)
    }

    pub fn claim_interface(&self, handle: &Handle, iface: u8) -> Result<()> {
        self.handles.claim_interface(handle, iface)
    }

    pub fn release_interface(&self, handle: &Handle, iface: u8) -> Result<()> {
        self.handles.release_interface(handle, iface)
    }

    pub fn set_interface_alt_setting(&self, handle: &Handle, iface: u8, alt: u8) -> Result<()> {
        self.handles.set_interface_alt_setting(handle, iface, alt)
    }

    pub fn set_configuration(&self, handle: &Handle, value: i32) -> Result<()> {
        self.backend.set_configuration(handle, value)
    }

    pub fn clear_halt(&self, handle: &Handle, endpoint: u8) -> Result<()> {
        self.backend.clear_halt(handle, endpoint)
    }

    pub fn reset_device(&self, handle: &Handle) -> Result<()> {
        self.backend.reset_device(handle)
    }

    pub fn kernel_driver_active(&self, handle: &Handle, iface: u8) -> Result<bool> {
        self.backend
            .kernel_driver_active(handle, iface)
            .unwrap_or(Err(Error::NotSupported))
    }

    pub fn detach_kernel_driver(&self, handle: &Handle, iface: u8) -> Result<()> {
        self.backend
            .detach_kernel_driver(handle, iface)
            .unwrap_or(Err(Error::NotSupported))
    }

    // ---- C4: transfer engine --------------------------------------------

    /// Allocate an idle transfer over `buffer`. Kept as its own step even
    /// though there's no fixed-size preallocation to size here, so callers
    /// can build up a transfer before deciding whether to submit it.
    pub fn alloc_transfer(
        &self,
        handle: &Handle,
        endpoint: u8,
        endpoint_type: EndpointType,
        buffer: Vec<u8>,
        flags: TransferFlags,
        timeout_ms: u32,
    ) -> Transfer {
        self.transfers
            .alloc(handle, endpoint, endpoint_type, buffer, flags, timeout_ms)
    }

    /// Re-zero `transfer`'s state so it can be submitted again without
    /// allocating a fresh [`Transfer`]. Errors with [`Error::Busy`] if
    /// `transfer` is still in flight.
    pub fn init_transfer(&self, transfer: &Transfer) -> Result<()> {
        self.transfers.reinit(transfer)
    }

    /// Informational size of a transfer's backing allocation. `Transfer` is
    /// `Arc`-managed, so the number has no bearing on how transfers are
    /// actually allocated; it exists for callers that want to size a pool
    /// of buffers up front.
    pub fn get_transfer_alloc_size(&self) -> usize {
        crate::transfer::alloc_size()
    }

    pub fn submit_transfer(&self, transfer: &Transfer) -> Result<()> {
        self.transfers.submit(transfer)
    }

    pub fn cancel_transfer(&self, transfer: &Transfer) -> Result<()> {
        self.transfers.cancel(transfer)
    }

    /// Cancel `transfer` and pump the event loop (2-second slices) until
    /// the cancellation has been reaped.
    pub fn cancel_transfer_sync(&self, transfer: &Transfer) -> Result<()> {
        self.transfers
            .cancel_sync(transfer, || self.poll_timeout(DEFAULT_POLL_TIMEOUT))
    }

    // ---- C5: event loop & poll-fd set ------------------------------------

    pub fn get_pollfds(&self) -> Vec<PollFd> {
        self.pollfds.snapshot()
    }

    pub fn set_pollfd_notifiers(
        &self,
        added: Option<Box<dyn Fn(RawFd, PollEvents) + Send + Sync>>,
        removed: Option<Box<dyn Fn(RawFd) + Send + Sync>>,
    ) {
        self.pollfds.set_notifiers(added, removed);
    }

    /// The wait bound the event loop would use on its own: `None` if no
    /// finite-deadline transfer is in flight.
    pub fn get_next_timeout(&self) -> Option<Duration> {
        self.transfers.next_timeout()
    }

    /// Run one tick of the event loop with the default two-second bound.
    pub fn poll(&self) -> Result<()> {
        self.poll_timeout(DEFAULT_POLL_TIMEOUT)
    }

    /// Run one tick of the event loop, waiting at most `tv` (clamped
    /// further by the nearest transfer deadline).
    pub fn poll_timeout(&self, tv: Duration) -> Result<()> {
        if let Some(next) = self.transfers.next_timeout() {
            if next.is_zero() {
                self.transfers.handle_timeouts();
                return Ok(());
            }
        }

        let wait = match self.transfers.next_timeout() {
            Some(next) => tv.min(next),
            None => tv,
        };

        let fds = self.pollfds.snapshot();
        let mut pollfds: Vec<libc::pollfd> = fds
            .iter()
            .map(|p| libc::pollfd {
                fd: p.fd,
                events: p.events.bits(),
                revents: 0,
            })
            .collect();

        let start = Instant::now();
        let ready = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                wait.as_millis() as libc::c_int,
            )
        };

        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(Error::from(err));
        }

        if ready == 0 {
            self.transfers.handle_timeouts();
            let _ = start.elapsed();
            return Ok(());
        }

        let readable: Vec<RawFd> = pollfds
            .iter()
            .filter(|p| p.revents & libc::POLLIN != 0)
            .map(|p| p.fd)
            .collect();
        let writable: Vec<RawFd> = pollfds
            .iter()
            .filter(|p| p.revents & libc::POLLOUT != 0)
            .map(|p| p.fd)
            .collect();

        self.backend
            .handle_events(&readable, &writable, &self.transfers as &dyn CompletionSink)?;
        self.transfers.handle_timeouts();
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.shutdown();
    }
}
