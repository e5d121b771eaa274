//! The handle manager (C3): open-handle set, per-handle interface-claim
//! bitmap, and the open/close/claim/release/altsetting gating logic.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::backend::Backend;
use crate::device::Device;
use crate::pollfd::PollFdSet;
use crate::{Error, Result};

/// Width of the claimed-interface bitmap, fixed at 64 so `claim_interface`'s
/// range check doesn't vary by target word size.
pub const MAX_INTERFACES: u8 = 64;

pub(crate) struct HandleInner {
    device: Device,
    /// Claimed-interface bitmap. Guarded by a real mutex, not an atomic,
    /// so `claim_interface`/`release_interface` can check-then-call-backend-
    /// then-set as one serialized critical section rather than racing two
    /// concurrent callers past the same unclaimed bit.
    claimed: Mutex<u64>,
    backend_data: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    backend: Arc<dyn Backend>,
}

/// A reference to an opened device.
///
/// Unlike [`Device`], a `Handle`'s lifetime is managed explicitly by
/// [`Context::close`](crate::Context::close) rather than by dropping the last
/// clone: closing performs real teardown (bus traffic-free, but OS-visible)
/// that must happen exactly once at a caller-chosen time, so this type
/// intentionally has no `Drop` impl that does that work.
#[derive(Clone)]
pub struct Handle(pub(crate) Arc<HandleInner>);

impl Handle {
    pub fn device(&self) -> &Device {
        &self.0.device
    }

    pub fn is_interface_claimed(&self, iface: u8) -> bool {
        if iface >= MAX_INTERFACES {
            return false;
        }
        *self.0.claimed.lock().unwrap() & (1 << iface) != 0
    }

    fn claimed_mask(&self) -> u64 {
        *self.0.claimed.lock().unwrap()
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

    /// Remove and return the backend-private slot, if one was ever set.
    /// Used at `close` time so a backend can let its private state (e.g. an
    /// open file descriptor) drop normally instead of reaching back in
    /// through `with_backend_data`.
    pub fn take_backend_data<T>(&self) -> Option<T>
    where
        T: Any + Send + Sync,
    {
        self.0
            .backend_data
            .lock()
            .unwrap()
            .take()
            .and_then(|boxed| boxed.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("device", &self.0.device)
            .field("claimed", &format!("{:#x}", self.claimed_mask()))
            .finish()
    }
}

/// The set of handles currently open on a `Context`, kept as a distinct
/// type so `Context` doesn't need to reach into a private field to
/// force-close everything at shutdown.
pub(crate) struct OpenHandles {
    handles: Mutex<Vec<Handle>>,
    backend: Arc<dyn Backend>,
}

impl OpenHandles {
    pub(crate) fn new(backend: Arc<dyn Backend>) -> Self {
        OpenHandles {
            handles: Mutex::new(Vec::new()),
            backend,
        }
    }

    /// Open a handle on `device`, registering it in the open-handles set.
    ///
    /// Takes its own reference on `device` independent of the caller's, so
    /// the handle keeps the device alive even if the caller's `Device` value
    /// is dropped first.
    pub fn open(&self, device: &Device, pollfds: &PollFdSet) -> Result<Handle> {
        let inner = Arc::new(HandleInner {
            device: device.clone(),
            claimed: Mutex::new(0),
            backend_data: Mutex::new(None),
            backend: self.backend.clone(),
        });
        let handle = Handle(inner);
        if let Err(e) = self.backend.open(&handle, pollfds) {
            // device reference held by `handle` is dropped here along with
            // `handle` itself; no separate unref step needed.
            return Err(e);
        }
        self.handles.lock().unwrap().push(handle.clone());
        Ok(handle)
    }

    /// Remove `handle` from the open set and tear it down. No-op (after
    /// logging) if the handle isn't actually registered, which can't happen
    /// through the public API but guards against double-close.
    pub fn close(&self, handle: &Handle, pollfds: &PollFdSet) {
        let mut handles = self.handles.lock().unwrap();
        let pos = match handles.iter().position(|h| Arc::ptr_eq(&h.0, &handle.0)) {
            Some(pos) => pos,
            None => {
                log::error!("close() called on a handle that isn't open");
                return;
            }
        };
        let removed = handles.remove(pos);
        drop(handles);

        if removed.claimed_mask() != 0 {
            log::warn!(
                "application left interfaces claimed (mask {:#x}) at close",
                removed.claimed_mask()
            );
        }
        self.backend.close(&removed, pollfds);
        // `removed`'s own device reference is dropped here.
    }

    pub fn snapshot(&self) -> Vec<Handle> {
        self.handles.lock().unwrap().clone()
    }

    /// Under the handle's mutex for the whole check-backend-set sequence,
    /// so two concurrent callers can't both observe the bit clear and both
    /// call into the backend.
    pub fn claim_interface(&self, handle: &Handle, iface: u8) -> Result<()> {
        if iface >= MAX_INTERFACES {
            return Err(Error::InvalidParam);
        }
        let mut claimed = handle.0.claimed.lock().unwrap();
        if *claimed & (1 << iface) != 0 {
            return Ok(());
        }
        self.backend.claim_interface(handle, iface)?;
        *claimed |= 1 << iface;
        Ok(())
    }

    /// Symmetric with `claim_interface`: the check, backend call, and bit
    /// clear all happen under the same mutex acquisition.
    pub fn release_interface(&self, handle: &Handle, iface: u8) -> Result<()> {
        if iface >= MAX_INTERFACES {
            return Err(Error::NotFound);
        }
        let mut claimed = handle.0.claimed.lock().unwrap();
        if *claimed & (1 << iface) == 0 {
            return Err(Error::NotFound);
        }
        self.backend.release_interface(handle, iface)?;
        *claimed &= !(1 << iface);
        Ok(())
    }

    /// Checks the bit is set under the handle mutex, then calls the
    /// backend outside the lock (the alt-setting change itself doesn't
    /// touch the claim bitmap).
    pub fn set_interface_alt_setting(&self, handle: &Handle, iface: u8, alt: u8) -> Result<()> {
        if iface >= MAX_INTERFACES {
            return Err(Error::NotFound);
        }
        {
            let claimed = handle.0.claimed.lock().unwrap();
            if *claimed & (1 << iface) == 0 {
                return Err(Error::NotFound);
            }
        }
        self.backend.set_interface_alt_setting(handle, iface, alt)
    }
}
