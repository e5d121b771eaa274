//! Empty enumeration, and the ref/unref lifecycle across a
//! `free_device_list`.

mod common;

use std::sync::Arc;

use common::{FakeDevice, MockBackend};
use usbcore::{free_device_list, Context};

#[test]
fn empty_enumeration_returns_empty_list() {
    let ctx = Context::new(Arc::new(MockBackend::new())).unwrap();
    let list = ctx.get_device_list().unwrap();
    assert!(list.is_empty());
    assert_eq!(list.len(), 0);
}

#[test]
fn ref_unref_lifecycle_across_free_device_list() {
    let backend = Arc::new(MockBackend::new());
    backend.add_device(FakeDevice::new(1, 0x1234, 0x0001));
    backend.add_device(FakeDevice::new(2, 0x1234, 0x0002));
    backend.add_device(FakeDevice::new(3, 0x1234, 0x0003));
    let ctx = Context::new(backend).unwrap();

    let list = ctx.get_device_list().unwrap();
    assert_eq!(list.len(), 3);

    let dev1 = list.get(1).unwrap().clone();
    let handle = ctx.open(&dev1).unwrap();

    // Every element in `list` holds one reference beyond whatever the
    // registry itself keeps; opening device #1 adds a second.
    assert_eq!(dev1.reference_count(), 3); // list entry + our clone + handle

    free_device_list(list, true);

    // Device #1 survives (the handle still holds a reference); #0 and #2
    // are gone the moment their last `Device` value was dropped.
    assert_eq!(dev1.reference_count(), 2); // our clone + handle

    ctx.close(&handle);
    assert_eq!(dev1.reference_count(), 1); // just our clone

    drop(dev1);
}

#[test]
fn free_device_list_without_unref_leaves_references_intact() {
    let backend = Arc::new(MockBackend::new());
    backend.add_device(FakeDevice::new(10, 0xaaaa, 0x0001));
    let ctx = Context::new(backend).unwrap();

    let list = ctx.get_device_list().unwrap();
    let dev = list.get(0).unwrap().clone();
    assert_eq!(dev.reference_count(), 2); // list entry + our clone

    free_device_list(list, false);

    // The list's own references are still outstanding (leaked to the
    // caller, per the documented `unref_devices = false` contract); only
    // our clone and the leaked-but-uncounted list entries remain reachable
    // through `dev`.
    assert_eq!(dev.reference_count(), 2);
    drop(dev);
}

#[test]
fn registry_consistency_tracks_live_devices() {
    let backend = Arc::new(MockBackend::new());
    backend.add_device(FakeDevice::new(42, 0x1111, 0x2222));
    let ctx = Context::new(backend).unwrap();

    let list = ctx.get_device_list().unwrap();
    let dev = list.get(0).unwrap().clone();
    free_device_list(list, true);

    // `dev` is the sole remaining reference; a fresh enumeration should
    // still find it (same session id => same registry entry).
    let second = ctx.get_device_list().unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second.get(0).unwrap().session_id(), dev.session_id());

    free_device_list(second, true);
    drop(dev);

    let third = ctx.get_device_list().unwrap();
    assert_eq!(third.len(), 1); // the mock backend still reports it attached
    free_device_list(third, true);
}
