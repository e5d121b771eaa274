//! The capability set an OS-specific USB adapter must implement.
//!
//! Everything this crate knows about actually talking to a kernel USB
//! character device lives behind [`Backend`]. The core (registry, handle
//! manager, transfer engine, event loop) is written entirely in terms of
//! this trait and never assumes anything about how `submit_transfer` or
//! `get_device_list` are actually carried out.

use std::any::Any;
use std::os::unix::io::RawFd;

use crate::device::{Device, Registry};
use crate::handle::Handle;
use crate::pollfd::PollEvents;
use crate::transfer::{Transfer, TransferStatus};
use crate::Result;

/// Handed to backend methods that may need to register or unregister file
/// descriptors with the event loop. Kept as a trait object rather than a
/// field on `Backend` impls so that a backend never needs a back-reference
/// to the `Context` that owns it.
pub trait PollFdSink: Send + Sync {
    fn add(&self, fd: RawFd, events: PollEvents);
    fn remove(&self, fd: RawFd);
}

/// What happened to a URB the backend reaped.
///
/// Distinguishing `Cancelled` from `Completed` here, rather than folding it
/// into `TransferStatus` directly, is what lets the engine apply the
/// sync-cancel/timeout disambiguation in [`crate::transfer::TransferEngine`]
/// before a status ever reaches the user's callback.
pub enum ReapOutcome {
    /// The transfer ran to completion (possibly a short or stalled one).
    Completed(TransferStatus),
    /// The URB was aborted, whether by [`Backend::cancel_transfer`] or by
    /// the device disappearing mid-flight.
    Cancelled,
}

/// Handed to [`Backend::handle_events`] so it can report completions back
/// into the transfer engine without holding a reference to it.
pub trait CompletionSink: Send + Sync {
    fn reap(&self, transfer: &Transfer, outcome: ReapOutcome);
}

/// The OS-specific adapter a [`crate::Context`] is built around.
///
/// Optional capabilities (`kernel_driver_active`, `detach_kernel_driver`,
/// `destroy_device`) default to "not supported" / a no-op so that a backend
/// which can't offer them doesn't need to spell that out explicitly.
pub trait Backend: Send + Sync + 'static {
    /// Called once by [`crate::Context::new`]. Backends that need to open a
    /// persistent fd (e.g. a netlink or inotify socket for enumeration)
    /// register it with `pollfds` here.
    fn init(&self, pollfds: &dyn PollFdSink) -> Result<()> {
        let _ = pollfds;
        Ok(())
    }

    /// Populate the registry with every device currently attached, and
    /// return the batch, each entry already holding one reference.
    fn get_device_list(&self, registry: &Registry) -> Result<Vec<Device>>;

    fn open(&self, handle: &Handle, pollfds: &dyn PollFdSink) -> Result<()>;
    fn close(&self, handle: &Handle, pollfds: &dyn PollFdSink);

    /// Returns the raw (possibly bus-endian) device descriptor bytes and
    /// whether they are already in host-native endianness.
    fn get_device_descriptor(&self, device: &Device) -> Result<(Vec<u8>, bool)>;
    fn get_active_config_descriptor(&self, device: &Device) -> Result<Vec<u8>>;

    fn set_configuration(&self, handle: &Handle, value: i32) -> Result<()>;
    fn claim_interface(&self, handle: &Handle, iface: u8) -> Result<()>;
    fn release_interface(&self, handle: &Handle, iface: u8) -> Result<()>;
    fn set_interface_alt_setting(&self, handle: &Handle, iface: u8, alt: u8) -> Result<()>;
    fn clear_halt(&self, handle: &Handle, endpoint: u8) -> Result<()>;
    fn reset_device(&self, handle: &Handle) -> Result<()>;

    fn submit_transfer(&self, transfer: &Transfer) -> Result<()>;
    fn cancel_transfer(&self, transfer: &Transfer) -> Result<()>;

    /// Reap whatever URBs are ready given the fds that `poll` reported
    /// readable/writable, reporting each through `sink`.
    fn handle_events(
        &self,
        readable: &[RawFd],
        writable: &[RawFd],
        sink: &dyn CompletionSink,
    ) -> Result<()>;

    fn kernel_driver_active(&self, handle: &Handle, iface: u8) -> Option<Result<bool>> {
        let _ = (handle, iface);
        None
    }

    fn detach_kernel_driver(&self, handle: &Handle, iface: u8) -> Option<Result<()>> {
        let _ = (handle, iface);
        None
    }

    /// Release any backend-private state before a zero-refcount `Device` is
    /// dropped. Takes ownership of the private slot rather than borrowing
    /// the (by then half-torn-down) `Device`.
    fn destroy_device(&self, backend_data: Option<Box<dyn Any + Send + Sync>>) {
        let _ = backend_data;
    }
}
