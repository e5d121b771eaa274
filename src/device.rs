//! The device registry (C2): the set of every `Device` this `Context` has
//! ever discovered, reference-counted, keyed by the backend's session id.

use std::any::Any;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::backend::Backend;
use crate::{Error, Result};

/// The largest `bNumConfigurations` a device may report; matches the USB
/// spec's own `USB_MAXCONFIG`.
pub const USB_MAXCONFIG: u8 = 8;

pub(crate) struct DeviceInner {
    bus_number: u8,
    device_address: u8,
    session_id: u64,
    num_configurations: AtomicU8,
    backend_data: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    backend: Arc<dyn Backend>,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        log::debug!(
            "destroy device {}.{}",
            self.bus_number,
            self.device_address
        );
        let data = self.backend_data.lock().unwrap().take();
        self.backend.destroy_device(data);
    }
}

/// A USB device the registry has observed.
///
/// `Device` is a cheaply-cloned handle over a shared, reference-counted
/// record. Rather than track a parallel refcount field, `Arc`'s own strong
/// count *is* the reference count: [`ref_device`] is `Clone::clone`,
/// [`unref_device`] is `Drop::drop`, and a device becomes unreachable
/// through the registry (see [`Registry::find_by_session_id`]) at the same
/// instant its last `Device` value is dropped.
#[derive(Clone)]
pub struct Device(pub(crate) Arc<DeviceInner>);

impl Device {
    pub fn bus_number(&self) -> u8 {
        self.0.bus_number
    }

    pub fn device_address(&self) -> u8 {
        self.0.device_address
    }

    pub fn session_id(&self) -> u64 {
        self.0.session_id
    }

    pub fn num_configurations(&self) -> u8 {
        self.0.num_configurations.load(Ordering::SeqCst)
    }

    /// Number of live references to this device, including the one behind
    /// this `Device` value itself.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Run `f` against the backend-private slot, initializing it with
    /// `default` on first access.
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
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("bus_number", &self.bus_number())
            .field("device_address", &self.device_address())
            .field("session_id", &self.session_id())
            .finish()
    }
}

/// Increment the reference count of a device and return a new handle to it.
///
/// Exposed as an explicit function, exactly `device.clone()`, so callers
/// used to a libusb-style `ref`/`unref` pair have a matching entry point.
pub fn ref_device(device: &Device) -> Device {
    device.clone()
}

/// Decrement the reference count of a device. If this was the last
/// reference, the device is unlinked from the registry and its backend
/// private state released.
///
/// Exactly `drop(device)`; exposed as its own function for API symmetry
/// with [`ref_device`].
pub fn unref_device(device: Device) {
    drop(device)
}

/// A transient, growable batch of freshly-discovered devices, each already
/// holding one reference. The backend populates this during
/// [`Backend::get_device_list`]; the core converts it into the public
/// [`DeviceList`] and drops the batch.
pub type DiscoveredDevs = Vec<Device>;

/// The public result of an enumeration: one reference per device, on top of
/// whatever the registry itself holds.
pub struct DeviceList(pub(crate) Vec<Device>);

impl DeviceList {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Device> {
        self.0.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Device> {
        self.0.get(index)
    }
}

impl IntoIterator for DeviceList {
    type Item = Device;
    type IntoIter = std::vec::IntoIter<Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a DeviceList {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Free a device list, optionally unreferencing each contained device.
///
/// When `unref_devices` is `false` the list's references must survive this
/// call (the caller is taking ownership of them), so each `Device` is
/// `mem::forget`-ten rather than dropped: simply letting the `Vec<Device>`
/// fall out of scope would run every element's `Drop` and silently release
/// the exact references this flag is supposed to retain.
pub fn free_device_list(list: DeviceList, unref_devices: bool) {
    for dev in list.0 {
        if unref_devices {
            unref_device(dev);
        } else {
            std::mem::forget(dev);
        }
    }
}

/// The per-`Context` set of known devices, keyed by session id. Holds only
/// `Weak` references: once every `Device` handle referring to an entry is
/// dropped, the entry becomes unreachable on its own, without the registry
/// needing to be told.
pub struct Registry {
    devices: Mutex<Vec<Weak<DeviceInner>>>,
    backend: Arc<dyn Backend>,
}

impl Registry {
    pub(crate) fn new(backend: Arc<dyn Backend>) -> Self {
        Registry {
            devices: Mutex::new(Vec::new()),
            backend,
        }
    }

    /// Create a device with refcount 1 and insert it into the registry.
    pub fn allocate(&self, session_id: u64, bus_number: u8, device_address: u8) -> Device {
        let inner = Arc::new(DeviceInner {
            bus_number,
            device_address,
            session_id,
            num_configurations: AtomicU8::new(0),
            backend_data: Mutex::new(None),
            backend: self.backend.clone(),
        });
        let mut devices = self.devices.lock().unwrap();
        prune(&mut devices);
        devices.push(Arc::downgrade(&inner));
        Device(inner)
    }

    /// Linear scan under the registry lock for a device with this session
    /// id. Returns an already-referenced `Device`: there is no way in safe
    /// Rust to hand back a reference that outlives the lock without the
    /// caller owning a clone.
    pub fn find_by_session_id(&self, session_id: u64) -> Option<Device> {
        let mut devices = self.devices.lock().unwrap();
        prune(&mut devices);
        devices
            .iter()
            .filter_map(|weak| weak.upgrade())
            .find(|inner| inner.session_id == session_id)
            .map(Device)
    }

    /// Every currently-live device, each ref'd once.
    pub fn snapshot(&self) -> Vec<Device> {
        let mut devices = self.devices.lock().unwrap();
        prune(&mut devices);
        devices
            .iter()
            .filter_map(|w| w.upgrade().map(Device))
            .collect()
    }

    /// Final validation after the backend has populated descriptors: reads
    /// the raw device descriptor and checks `bNumConfigurations`.
    pub fn sanitize(&self, device: &Device) -> Result<()> {
        let (raw, host_endian) = self.backend.get_device_descriptor(device)?;
        if raw.len() < 18 {
            return Err(Error::Io);
        }
        // bNumConfigurations is the last byte of the 18-byte device
        // descriptor; being a single byte, it needs no endian conversion
        // regardless of `host_endian`.
        let _ = host_endian;
        let num_configurations = raw[17];
        if num_configurations < 1 || num_configurations > USB_MAXCONFIG {
            log::error!(
                "device {}.{} reports {} configurations",
                device.bus_number(),
                device.device_address(),
                num_configurations
            );
            return Err(Error::Io);
        }
        device
            .0
            .num_configurations
            .store(num_configurations, Ordering::SeqCst);
        Ok(())
    }
}

fn prune(devices: &mut Vec<Weak<DeviceInner>>) {
    devices.retain(|w| w.strong_count() > 0);
}
