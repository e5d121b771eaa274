//! Sysfs-based device enumeration: bus/device-number lookup and raw
//! descriptor bytes, read straight out of `/sys/bus/usb/devices`. Descriptor
//! parsing itself lives in [`crate::descriptors`], which walks the returned
//! bytes safely rather than overlaying a `#[repr(C)]` struct onto them.

use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};

const SYSFS_DEVICE_PATH: &str = "/sys/bus/usb/devices";

/// One entry under `/sys/bus/usb/devices`, identifying a USB device by its
/// topology directory name (e.g. `"1-2"`, `"usb1"`).
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    dir: OsString,
}

impl DeviceInfo {
    pub fn dir(&self) -> &OsString {
        &self.dir
    }

    /// The device descriptor followed by every configuration descriptor,
    /// concatenated exactly as the kernel exposes them in `descriptors`.
    pub fn raw_descriptors(&self) -> io::Result<Vec<u8>> {
        let path = format!(
            "{}/{}/descriptors",
            SYSFS_DEVICE_PATH,
            self.dir.to_string_lossy()
        );
        let mut buf = Vec::new();
        fs::File::open(path)?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn busnum(&self) -> io::Result<u8> {
        read_sysfs_num(&self.dir, "busnum")
    }

    pub fn devnum(&self) -> io::Result<u8> {
        read_sysfs_num(&self.dir, "devnum")
    }

    /// Device node path under `/dev/bus/usb`, used by [`super::linux_usbfs`]
    /// to `open()` the device.
    pub fn devnode(&self) -> io::Result<String> {
        Ok(format!(
            "/dev/bus/usb/{:03}/{:03}",
            self.busnum()?,
            self.devnum()?
        ))
    }
}

fn read_sysfs_num(dir: &OsString, attr: &str) -> io::Result<u8> {
    let path = format!("{}/{}/{}", SYSFS_DEVICE_PATH, dir.to_string_lossy(), attr);
    let mut buf = String::new();
    fs::File::open(path)?.read_to_string(&mut buf)?;
    buf.trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed sysfs attribute"))
}

/// Every USB device currently attached, as reported by sysfs. Root hubs
/// (`usbN`) and interface association entries (containing `:`) are
/// filtered out.
pub fn enumerate() -> impl Iterator<Item = DeviceInfo> {
    fs::read_dir(SYSFS_DEVICE_PATH)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name())
        .filter(is_device_dirname)
        .map(|dir| DeviceInfo { dir })
}

fn is_device_dirname(dirname: &OsString) -> bool {
    match dirname.to_str() {
        Some(name) => !name.starts_with("usb") && !name.contains(':'),
        None => false,
    }
}
