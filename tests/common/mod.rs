//! A fully in-process [`Backend`] for exercising the engine's race-sensitive
//! properties without real hardware.
//!
//! Completions are scheduled by the test at an arbitrary wall-clock offset
//! after submission and only actually delivered once the event loop wakes
//! up and calls [`Backend::handle_events`]. Wakeups are driven by a
//! self-pipe: scheduling a completion writes a byte, which makes the
//! pipe's read end go readable and the event loop's `poll` return.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use usbcore::{
    Backend, CompletionSink, Device, Handle, PollEvents, PollFdSink, ReapOutcome, Registry,
    Result, Transfer,
};

struct Scheduled {
    at: Instant,
    transfer: Transfer,
    outcome: ReapOutcome,
}

/// A device the test wants `get_device_list` to report, along with the
/// 18-byte device descriptor the mock hands back for it.
pub struct FakeDevice {
    pub session_id: u64,
    pub bus_number: u8,
    pub device_address: u8,
    pub descriptor: Vec<u8>,
}

impl FakeDevice {
    pub fn new(session_id: u64, vendor: u16, product: u16) -> FakeDevice {
        let mut descriptor = vec![0u8; 18];
        descriptor[0] = 18;
        descriptor[1] = 0x01;
        descriptor[8..10].copy_from_slice(&vendor.to_le_bytes());
        descriptor[10..12].copy_from_slice(&product.to_le_bytes());
        descriptor[17] = 1; // bNumConfigurations
        FakeDevice {
            session_id,
            bus_number: 1,
            device_address: (session_id & 0xff) as u8,
            descriptor,
        }
    }
}

pub struct MockBackend {
    devices: Mutex<Vec<FakeDevice>>,
    scheduled: Mutex<Vec<Scheduled>>,
    pipe_read: Mutex<Option<RawFd>>,
    pipe_write: Mutex<Option<RawFd>>,
    cancels_seen: AtomicU64,
    submit_fail: Mutex<HashMap<u8, ()>>,
}

impl MockBackend {
    pub fn new() -> MockBackend {
        MockBackend {
            devices: Mutex::new(Vec::new()),
            scheduled: Mutex::new(Vec::new()),
            pipe_read: Mutex::new(None),
            pipe_write: Mutex::new(None),
            cancels_seen: AtomicU64::new(0),
            submit_fail: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_device(&self, device: FakeDevice) {
        self.devices.lock().unwrap().push(device);
    }

    pub fn cancels_seen(&self) -> u64 {
        self.cancels_seen.load(Ordering::SeqCst)
    }

    /// Make the next (and every subsequent) `claim_interface(iface)` call
    /// fail with `Busy`, to exercise the handle manager's error path without
    /// real hardware.
    pub fn fail_claim(&self, iface: u8) {
        self.submit_fail.lock().unwrap().insert(iface, ());
    }

    /// Schedule `transfer` to be reaped with `outcome` once `after` has
    /// elapsed, and nudge the event loop awake immediately.
    pub fn schedule_completion(&self, transfer: &Transfer, after: Duration, outcome: ReapOutcome) {
        self.scheduled.lock().unwrap().push(Scheduled {
            at: Instant::now() + after,
            transfer: transfer.clone(),
            outcome,
        });
        self.nudge();
    }

    fn nudge(&self) {
        if let Some(fd) = *self.pipe_write.lock().unwrap() {
            let _ = nix::unistd::write(fd, &[1u8]);
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MockBackend {
    fn init(&self, pollfds: &dyn PollFdSink) -> Result<()> {
        // Both ends non-blocking: `handle_events` drains the read end in a
        // loop until `EAGAIN`, which would block forever on a blocking pipe
        // once the nudge byte(s) already written have been consumed.
        let (read_fd, write_fd) = nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK)
            .map_err(std::io::Error::from)?;
        *self.pipe_read.lock().unwrap() = Some(read_fd);
        *self.pipe_write.lock().unwrap() = Some(write_fd);
        pollfds.add(read_fd, PollEvents::READABLE);
        Ok(())
    }

    fn get_device_list(&self, registry: &Registry) -> Result<Vec<Device>> {
        let devices = self.devices.lock().unwrap();
        Ok(devices
            .iter()
            .map(|d| {
                registry
                    .find_by_session_id(d.session_id)
                    .unwrap_or_else(|| registry.allocate(d.session_id, d.bus_number, d.device_address))
            })
            .collect())
    }

    fn open(&self, _handle: &usbcore::Handle, _pollfds: &dyn PollFdSink) -> Result<()> {
        Ok(())
    }

    fn close(&self, _handle: &usbcore::Handle, _pollfds: &dyn PollFdSink) {}

    fn get_device_descriptor(&self, device: &Device) -> Result<(Vec<u8>, bool)> {
        let devices = self.devices.lock().unwrap();
        devices
            .iter()
            .find(|d| d.session_id == device.session_id())
            .map(|d| (d.descriptor.clone(), true))
            .ok_or(usbcore::Error::NotFound)
    }

    fn get_active_config_descriptor(&self, _device: &Device) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn set_configuration(&self, _handle: &usbcore::Handle, _value: i32) -> Result<()> {
        Ok(())
    }

    fn claim_interface(&self, _handle: &usbcore::Handle, iface: u8) -> Result<()> {
        if self.submit_fail.lock().unwrap().contains_key(&iface) {
            return Err(usbcore::Error::Busy);
        }
        Ok(())
    }

    fn release_interface(&self, _handle: &usbcore::Handle, _iface: u8) -> Result<()> {
        Ok(())
    }

    fn set_interface_alt_setting(&self, _handle: &usbcore::Handle, _iface: u8, _alt: u8) -> Result<()> {
        Ok(())
    }

    fn clear_halt(&self, _handle: &usbcore::Handle, _endpoint: u8) -> Result<()> {
        Ok(())
    }

    fn reset_device(&self, _handle: &usbcore::Handle) -> Result<()> {
        Ok(())
    }

    fn submit_transfer(&self, _transfer: &Transfer) -> Result<()> {
        Ok(())
    }

    fn cancel_transfer(&self, transfer: &Transfer) -> Result<()> {
        self.cancels_seen.fetch_add(1, Ordering::SeqCst);
        self.schedule_completion(transfer, Duration::from_millis(1), ReapOutcome::Cancelled);
        Ok(())
    }

    fn handle_events(
        &self,
        readable: &[RawFd],
        _writable: &[RawFd],
        sink: &dyn CompletionSink,
    ) -> Result<()> {
        if let Some(read_fd) = *self.pipe_read.lock().unwrap() {
            if readable.contains(&read_fd) {
                let mut buf = [0u8; 64];
                loop {
                    match nix::unistd::read(read_fd, &mut buf) {
                        Ok(0) => break,
                        Ok(_) => continue,
                        Err(nix::errno::Errno::EAGAIN) => break,
                        Err(nix::errno::Errno::EINTR) => continue,
                        Err(_) => break,
                    }
                }
            }
        }

        let now = Instant::now();
        let mut scheduled = self.scheduled.lock().unwrap();
        let (due, pending): (Vec<_>, Vec<_>) = scheduled.drain(..).partition(|s| s.at <= now);
        *scheduled = pending;
        drop(scheduled);

        for s in due {
            sink.reap(&s.transfer, s.outcome);
        }
        Ok(())
    }
}
