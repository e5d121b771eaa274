//! Raw `usbfs` ioctl definitions and wire structures: the `USBDEVFS_*` ioctl
//! numbers and the `Urb`/`UrbFlags`/`CtrlTransfer` layouts the kernel expects
//! on the wire, trimmed to the set the reference backend actually issues
//! (streams, disconnect-claim, and capability-query ioctls are left out).

use std::io;
use std::mem::size_of;

pub use libc::{c_int, c_uint};

#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct CtrlTransfer {
    pub bmRequestType: u8,
    pub bRequest: u8,
    pub wValue: u16,
    pub wIndex: u16,
    pub wLength: u16,
    pub timeout: u32,
    pub data: *mut u8,
}

bitflags! {
    #[repr(C)]
    pub struct UrbFlags: u32 {
        const URB_SHORT_NOT_OK      = 0x01;
        const URB_ISO_ASAP          = 0x02;
        const URB_BULK_CONTINUATION = 0x04;
        const URB_NO_FSBR           = 0x20;
        const URB_ZERO_PACKET       = 0x40;
        const URB_NO_INTERRUPT      = 0x80;
    }
}

#[derive(Debug, Copy, Clone)]
pub enum UrbType {
    Iso = 0,
    Interrupt = 1,
    Control = 2,
    Bulk = 3,
}

#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct Urb {
    pub urbtype: u8,
    pub endpoint: u8,
    pub status: i32,
    pub flags: UrbFlags,
    pub buffer: *mut u8,
    pub buffer_length: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
    pub signr: u32,
    pub usercontext: usize,
}

impl Urb {
    pub fn new(urbtype: UrbType, endpoint: u8, flags: UrbFlags) -> Urb {
        Urb {
            urbtype: urbtype as u8,
            endpoint,
            status: -22,
            flags,
            buffer: std::ptr::null_mut(),
            buffer_length: 0,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            signr: 0,
            usercontext: 0,
        }
    }
}

#[derive(Debug)]
#[repr(C)]
pub struct SetInterface {
    pub interface: c_uint,
    pub altsetting: c_uint,
}

ioctl_readwrite!(control, b'U', 0, CtrlTransfer);
ioctl_write_ptr_bad!(
    setinterface,
    request_code_read!('U', 4, size_of::<SetInterface>()),
    SetInterface
);
ioctl_write_ptr_bad!(setconfiguration, request_code_read!('U', 5, size_of::<c_uint>()), c_uint);
ioctl_write_ptr_bad!(submiturb, request_code_read!(b'U', 10, size_of::<Urb>()), Urb);
ioctl_read_bad!(reapurb, request_code_write!(b'U', 12, size_of::<*mut Urb>()), *mut Urb);
ioctl_read_bad!(
    reapurbndelay,
    request_code_write!(b'U', 13, size_of::<*mut Urb>()),
    *mut Urb
);
ioctl_write_ptr_bad!(
    claiminterface,
    request_code_read!('U', 15, size_of::<c_uint>()),
    c_uint
);
ioctl_write_ptr_bad!(
    releaseinterface,
    request_code_read!('U', 16, size_of::<c_uint>()),
    c_uint
);
ioctl_write_ptr_bad!(clearhalt, request_code_read!('U', 21, size_of::<c_uint>()), c_uint);
ioctl_none_bad!(reset, request_code_none!(b'U', 20));

// The kernel header defines `USBDEVFS_DISCARDURB` as `_IO('U', 11)` (no
// declared data direction) even though the call still takes the pointer to
// the URB being cancelled as its third argument; usbfs matches the pending
// URB by that pointer value rather than copying anything through it. Nix's
// "_bad" ioctl macros only use the supplied command number to pick a
// calling convention, so declaring this one as a write-ptr call with the
// real `_IO` command still produces the right `ioctl()` invocation.
ioctl_write_ptr_bad!(discardurb, request_code_none!(b'U', 11), Urb);

fn nix_err_to_io_err(err: nix::Error) -> io::Error {
    io::Error::from(err)
}

pub fn nix_result_to_io_result<T>(res: nix::Result<T>) -> io::Result<T> {
    res.map_err(nix_err_to_io_err)
}
