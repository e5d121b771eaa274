//! A userspace core for talking to USB peripherals without a kernel driver.
//!
//! This crate provides the device registry, handle manager, asynchronous
//! transfer engine, and poll-fd event loop that make up a libusb-style USB
//! host stack, written against an abstract [`Backend`](backend::Backend)
//! trait rather than any one operating system's USB character device. A
//! reference implementation of that trait for Linux's `usbfs` ships by
//! default (see [`platform::linux_usbfs`]) so the crate is runnable
//! end-to-end, but applications (or other backend crates) are free to
//! supply their own.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use usbcore::platform::LinuxUsbfs;
//! use usbcore::Context;
//!
//! # fn main() -> usbcore::Result<()> {
//! let ctx = Context::new(Arc::new(LinuxUsbfs::new()))?;
//! let devices = ctx.get_device_list()?;
//! for device in &devices {
//!     println!("{:?}", device);
//! }
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate bitflags;

#[cfg(all(feature = "linux_usbfs", target_os = "linux"))]
#[macro_use]
extern crate nix;

mod backend;
mod context;
mod descriptors;
mod device;
mod error;
mod handle;
mod pollfd;
mod transfer;

#[cfg(all(feature = "linux_usbfs", target_os = "linux"))]
pub mod platform;

pub use backend::{Backend, CompletionSink, PollFdSink, ReapOutcome};
pub use context::Context;
pub use device::{
    free_device_list, ref_device, unref_device, Device, DeviceList, DiscoveredDevs, Registry,
    USB_MAXCONFIG,
};
pub use error::{Error, Result};
pub use handle::{Handle, MAX_INTERFACES};
pub use pollfd::{PollEvents, PollFd};
pub use transfer::{EndpointType, Transfer, TransferFlags, TransferStatus};
