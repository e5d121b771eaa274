//! `cancel_transfer_sync` must never invoke the user callback, and must
//! return only once the mock backend has actually reaped the cancellation.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{FakeDevice, MockBackend};
use usbcore::{Context, EndpointType, TransferFlags};

#[test]
fn sync_cancel_never_invokes_callback() {
    let backend = Arc::new(MockBackend::new());
    backend.add_device(FakeDevice::new(1, 0x1, 0x1));
    let ctx = Context::new(backend.clone()).unwrap();
    let dev = ctx.get_device_list().unwrap().get(0).unwrap().clone();
    let handle = ctx.open(&dev).unwrap();

    // timeout=0 => infinite deadline; only an explicit cancel will resolve
    // this transfer.
    let transfer = ctx.alloc_transfer(
        &handle,
        0x81,
        EndpointType::Bulk,
        vec![0u8; 16],
        TransferFlags::empty(),
        0,
    );

    let callback_ran = Arc::new(AtomicBool::new(false));
    let callback_ran2 = callback_ran.clone();
    transfer.set_callback(move |_| callback_ran2.store(true, Ordering::SeqCst));

    ctx.submit_transfer(&transfer).unwrap();
    assert_eq!(backend.cancels_seen(), 0);

    ctx.cancel_transfer_sync(&transfer).unwrap();

    assert_eq!(backend.cancels_seen(), 1);
    assert!(!callback_ran.load(Ordering::SeqCst));
    // The transfer has no terminal status set either: a sync-cancelled
    // transfer's completion is "silent" by design.
    assert!(transfer.status().is_none());
}

#[test]
fn async_cancel_is_observed_through_the_callback() {
    let backend = Arc::new(MockBackend::new());
    backend.add_device(FakeDevice::new(1, 0x1, 0x1));
    let ctx = Context::new(backend.clone()).unwrap();
    let dev = ctx.get_device_list().unwrap().get(0).unwrap().clone();
    let handle = ctx.open(&dev).unwrap();

    let transfer = ctx.alloc_transfer(
        &handle,
        0x81,
        EndpointType::Bulk,
        vec![0u8; 16],
        TransferFlags::empty(),
        0,
    );

    let callback_ran = Arc::new(AtomicBool::new(false));
    let callback_ran2 = callback_ran.clone();
    transfer.set_callback(move |t| {
        assert_eq!(t.status(), Some(usbcore::TransferStatus::Cancelled));
        callback_ran2.store(true, Ordering::SeqCst);
    });

    ctx.submit_transfer(&transfer).unwrap();
    ctx.cancel_transfer(&transfer).unwrap();

    for _ in 0..200 {
        if callback_ran.load(Ordering::SeqCst) {
            break;
        }
        ctx.poll_timeout(std::time::Duration::from_millis(20)).unwrap();
    }
    assert!(callback_ran.load(Ordering::SeqCst));
}
