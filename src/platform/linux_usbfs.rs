//! Concrete [`Backend`] over Linux's `usbfs` character devices and the
//! `sysfs` USB topology tree.
//!
//! This is the crate's one bundled, default-enabled adapter; it carries no
//! core semantics of its own; every policy decision (timeouts, in-flight
//! ordering, cancellation handshake) lives in [`crate::transfer`] and calls
//! down into the handful of methods below.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use crate::backend::{Backend, CompletionSink, PollFdSink, ReapOutcome};
use crate::device::{Device, Registry};
use crate::handle::Handle;
use crate::platform::devfs::{self, CtrlTransfer, SetInterface, Urb, UrbFlags, UrbType};
use crate::platform::deviceinfo::{self, DeviceInfo};
use crate::transfer::{EndpointType, Transfer, TransferStatus};
use crate::{Error, Result};

/// Backend-private state stashed on a [`Device`]: enough to reopen its
/// `usbfs` node and to re-derive its session id on the next enumeration.
struct DeviceRecord {
    info: DeviceInfo,
}

/// Backend-private state stashed on a [`Handle`]: the open file descriptor
/// for the device node.
struct HandleRecord {
    file: File,
}

struct PendingUrb {
    transfer: Transfer,
    urb: Box<Urb>,
}

/// The reference `usbfs` backend.
pub struct LinuxUsbfs {
    pending: Mutex<HashMap<usize, PendingUrb>>,
}

impl LinuxUsbfs {
    pub fn new() -> LinuxUsbfs {
        LinuxUsbfs {
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn handle_file<'a>(&self, handle: &'a Handle) -> RawFd {
        handle.with_backend_data(
            || panic!("handle has no open usbfs file"),
            |rec: &mut HandleRecord| rec.file.as_raw_fd(),
        )
    }
}

impl Default for LinuxUsbfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for LinuxUsbfs {
    fn get_device_list(&self, registry: &Registry) -> Result<Vec<Device>> {
        let mut devices = Vec::new();
        for info in deviceinfo::enumerate() {
            let (bus, addr) = match (info.busnum(), info.devnum()) {
                (Ok(b), Ok(a)) => (b, a),
                _ => continue,
            };
            let session_id = (bus as u64) << 8 | addr as u64;
            // Reuse the existing registry entry if this physical device was
            // already seen on a prior scan (same bus/address pair, hence
            // same session id), rather than minting a second `Device` for
            // it; this is what makes the session id "stable across
            // rescans" in practice instead of just in name.
            let device = match registry.find_by_session_id(session_id) {
                Some(existing) => existing,
                None => {
                    let device = registry.allocate(session_id, bus, addr);
                    device.with_backend_data(|| DeviceRecord { info: info.clone() }, |_| {});
                    device
                }
            };
            devices.push(device);
        }
        Ok(devices)
    }

    fn open(&self, handle: &Handle, _pollfds: &dyn PollFdSink) -> Result<()> {
        let device = handle.device();
        let path = device.with_backend_data(
            || panic!("device has no usbfs info"),
            |rec: &mut DeviceRecord| rec.info.devnode(),
        )?;
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        handle.with_backend_data(|| HandleRecord { file }, |_| {});
        Ok(())
    }

    fn close(&self, handle: &Handle, _pollfds: &dyn PollFdSink) {
        // Dropping the stashed `File` closes the fd; nothing else to do.
        let _: Option<HandleRecord> = handle.take_backend_data();
    }

    fn get_device_descriptor(&self, device: &Device) -> Result<(Vec<u8>, bool)> {
        let raw = device.with_backend_data(
            || panic!("device has no usbfs info"),
            |rec: &mut DeviceRecord| rec.info.raw_descriptors(),
        )?;
        if raw.len() < 18 {
            return Err(Error::Io);
        }
        Ok((raw[..18].to_vec(), false))
    }

    fn get_active_config_descriptor(&self, device: &Device) -> Result<Vec<u8>> {
        let raw = device.with_backend_data(
            || panic!("device has no usbfs info"),
            |rec: &mut DeviceRecord| rec.info.raw_descriptors(),
        )?;
        if raw.len() <= 18 {
            return Err(Error::NotFound);
        }
        // `descriptors` concatenates every configuration; this backend does
        // not distinguish which one is active and simply hands back
        // everything past the device descriptor; `get_max_packet_size`
        // tolerates that by scanning every endpoint it finds.
        Ok(raw[18..].to_vec())
    }

    fn set_configuration(&self, handle: &Handle, value: i32) -> Result<()> {
        let fd = self.handle_file(handle);
        let value = value as devfs::c_uint;
        unsafe {
            devfs::nix_result_to_io_result(devfs::setconfiguration(fd, &value))?;
        }
        Ok(())
    }

    fn claim_interface(&self, handle: &Handle, iface: u8) -> Result<()> {
        let fd = self.handle_file(handle);
        let iface = iface as devfs::c_uint;
        unsafe {
            devfs::nix_result_to_io_result(devfs::claiminterface(fd, &iface))?;
        }
        Ok(())
    }

    fn release_interface(&self, handle: &Handle, iface: u8) -> Result<()> {
        let fd = self.handle_file(handle);
        let iface = iface as devfs::c_uint;
        unsafe {
            devfs::nix_result_to_io_result(devfs::releaseinterface(fd, &iface))?;
        }
        Ok(())
    }

    fn set_interface_alt_setting(&self, handle: &Handle, iface: u8, alt: u8) -> Result<()> {
        let fd = self.handle_file(handle);
        let req = SetInterface {
            interface: iface as devfs::c_uint,
            altsetting: alt as devfs::c_uint,
        };
        unsafe {
            devfs::nix_result_to_io_result(devfs::setinterface(fd, &req))?;
        }
        Ok(())
    }

    fn clear_halt(&self, handle: &Handle, endpoint: u8) -> Result<()> {
        let fd = self.handle_file(handle);
        let endpoint = endpoint as devfs::c_uint;
        unsafe {
            devfs::nix_result_to_io_result(devfs::clearhalt(fd, &endpoint))?;
        }
        Ok(())
    }

    fn reset_device(&self, handle: &Handle) -> Result<()> {
        let fd = self.handle_file(handle);
        unsafe {
            devfs::nix_result_to_io_result(devfs::reset(fd))?;
        }
        Ok(())
    }

    fn submit_transfer(&self, transfer: &Transfer) -> Result<()> {
        let fd = self.handle_file(transfer.handle());
        let urbtype = match transfer.endpoint_type() {
            EndpointType::Control => UrbType::Control,
            EndpointType::Bulk => UrbType::Bulk,
            EndpointType::Interrupt => UrbType::Interrupt,
            EndpointType::Isochronous => UrbType::Iso,
        };

        let mut buffer = transfer.buffer();
        let ptr = buffer.as_mut_ptr();
        let len = buffer.len();
        drop(buffer);

        let mut urb = Box::new(Urb::new(urbtype, transfer.endpoint(), UrbFlags::empty()));
        urb.buffer = ptr;
        urb.buffer_length = len as i32;

        let urb_ptr: *mut Urb = &mut *urb;
        match unsafe { devfs::nix_result_to_io_result(devfs::submiturb(fd, urb_ptr)) } {
            Ok(_) => {
                self.pending.lock().unwrap().insert(
                    urb_ptr as usize,
                    PendingUrb {
                        transfer: transfer.clone(),
                        urb,
                    },
                );
                Ok(())
            }
            Err(e) => Err(Error::from(e)),
        }
    }

    fn cancel_transfer(&self, transfer: &Transfer) -> Result<()> {
        let fd = self.handle_file(transfer.handle());
        let urb_ptr = {
            let pending = self.pending.lock().unwrap();
            pending
                .iter()
                .find(|(_, p)| Arc::ptr_eq(&p.transfer.0, &transfer.0))
                .map(|(&key, _)| key as *mut Urb)
        };
        // If the URB has already been reaped (or was never found, e.g. a
        // race with completion), there is nothing left to discard; the
        // completion the caller is waiting for is already on its way
        // through the ordinary reap path.
        if let Some(urb_ptr) = urb_ptr {
            match unsafe { devfs::nix_result_to_io_result(devfs::discardurb(fd, urb_ptr)) } {
                Ok(_) => {}
                // ENODEV/EINVAL here just mean the kernel already reaped or
                // never accepted it; the reap path will report the outcome.
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {}
                Err(e) => return Err(Error::from(e)),
            }
        }
        Ok(())
    }

    fn handle_events(
        &self,
        readable: &[RawFd],
        writable: &[RawFd],
        sink: &dyn CompletionSink,
    ) -> Result<()> {
        for &fd in readable.iter().chain(writable.iter()) {
            loop {
                let mut urb_ptr: *mut Urb = std::ptr::null_mut();
                match unsafe { devfs::reapurbndelay(fd, &mut urb_ptr) } {
                    Ok(_) => {
                        let pending = self.pending.lock().unwrap().remove(&(urb_ptr as usize));
                        let pending = match pending {
                            Some(p) => p,
                            None => continue,
                        };
                        let transfer = pending.transfer;
                        transfer.set_actual_length(pending.urb.actual_length.max(0) as usize);
                        let outcome = match pending.urb.status {
                            0 => ReapOutcome::Completed(TransferStatus::Completed),
                            libc::ECONNRESET | libc::ENOENT => ReapOutcome::Cancelled,
                            libc::EPIPE => ReapOutcome::Completed(TransferStatus::Stall),
                            libc::ENODEV | libc::ESHUTDOWN => {
                                ReapOutcome::Completed(TransferStatus::NoDevice)
                            }
                            libc::EOVERFLOW => ReapOutcome::Completed(TransferStatus::Overflow),
                            _ => ReapOutcome::Completed(TransferStatus::Error),
                        };
                        sink.reap(&transfer, outcome);
                    }
                    Err(nix::errno::Errno::EAGAIN) => break,
                    Err(e) => {
                        log::error!("reapurbndelay failed: {}", io::Error::from(e));
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn kernel_driver_active(&self, _handle: &Handle, _iface: u8) -> Option<Result<bool>> {
        None
    }

    fn detach_kernel_driver(&self, _handle: &Handle, _iface: u8) -> Option<Result<()>> {
        None
    }
}

/// Issue a control transfer synchronously through `USBDEVFS_CONTROL`.
/// Not part of the `Backend` trait (control transfers go through the
/// ordinary async submit/reap path like any other endpoint); kept as a
/// direct helper for callers that want libusb's old synchronous shortcut.
pub fn control_transfer_sync(
    handle: &Handle,
    bm_request_type: u8,
    b_request: u8,
    w_value: u16,
    w_index: u16,
    buffer: &mut [u8],
    timeout_ms: u32,
) -> Result<usize> {
    let fd = handle.with_backend_data(
        || panic!("handle has no open usbfs file"),
        |rec: &mut HandleRecord| rec.file.as_raw_fd(),
    );
    let mut xfer = CtrlTransfer {
        bmRequestType: bm_request_type,
        bRequest: b_request,
        wValue: w_value,
        wIndex: w_index,
        wLength: buffer.len() as u16,
        timeout: timeout_ms,
        data: buffer.as_mut_ptr(),
    };
    let n = unsafe { devfs::nix_result_to_io_result(devfs::control(fd, &mut xfer)) }?;
    Ok(n as usize)
}
