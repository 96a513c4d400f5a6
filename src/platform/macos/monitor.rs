//! macOS enumeration and hot-plug notification through IOKit service
//! matching.
//!
//! Grounded on `_macos/macosregistry.py`'s `MacosDeviceRegistry`:
//! `IOServiceAddMatchingNotification` is armed for both first-match and
//! termination *before* the initial enumeration runs — draining the
//! first-match iterator it hands back is itself the enumeration, so no
//! device that appears while the notification is being set up is missed —
//! then the thread parks in `CFRunLoopRun()` to deliver later events from
//! its callbacks.

use std::ffi::{c_void, CString};

use core_foundation::base::TCFType;
use core_foundation::string::CFString;
use core_foundation_sys::base::CFRelease;
use core_foundation_sys::runloop::{kCFRunLoopDefaultMode, CFRunLoopAddSource, CFRunLoopGetCurrent, CFRunLoopRun};
use core_foundation_sys::uuid::CFUUIDCreateFromUUIDBytes;
use io_kit_sys::types::io_object_t;

use crate::registry::Registry;

use super::device::Device;
use super::ffi::{
    self, IOUSBDeviceInterfacePtr, IOUSBInterfaceInterfacePtr, K_IOCF_PLUGIN_INTERFACE_ID,
    K_IOUSB_DEVICE_INTERFACE_ID_187, K_IOUSB_DEVICE_USER_CLIENT_TYPE_ID, K_IOUSB_INTERFACE_INTERFACE_ID_190,
    K_IOUSB_INTERFACE_USER_CLIENT_TYPE_ID,
};

const IO_USB_DEVICE_CLASS_NAME: &str = "IOUSBDevice";
const K_IO_FIRST_MATCH_NOTIFICATION: &str = "IOServiceFirstMatch";
const K_IO_TERMINATED_NOTIFICATION: &str = "IOServiceTerminate";

unsafe fn create_uuid(bytes: [u8; 16]) -> *const c_void {
    // `CFUUIDBytes` is sixteen plain `u8` fields with no padding; a `[u8;
    // 16]` has the identical layout.
    let cf_bytes = std::mem::transmute::<[u8; 16], core_foundation_sys::uuid::CFUUIDBytes>(bytes);
    CFUUIDCreateFromUUIDBytes(std::ptr::null(), cf_bytes) as *const c_void
}

/// Query a service for one of its IOKit plug-in COM interfaces.
unsafe fn plugin_interface<T>(service: io_object_t, plugin_type: [u8; 16], interface_id: [u8; 16]) -> Option<*mut *mut T> {
    let plugin_type_ref = create_uuid(plugin_type);
    let iocf_plugin_ref = create_uuid(K_IOCF_PLUGIN_INTERFACE_ID);

    let mut plug: *mut c_void = std::ptr::null_mut();
    let mut score: i32 = 0;
    let result =
        ffi::IOCreatePlugInInterfaceForService(service, plugin_type_ref, iocf_plugin_ref, &mut plug, &mut score);
    CFRelease(plugin_type_ref as _);
    CFRelease(iocf_plugin_ref as _);
    if result != 0 || plug.is_null() {
        return None;
    }
    let plug = plug as *mut *mut super::ffi::IUnknownVtbl;

    let interface_id_ref = create_uuid(interface_id);
    let iid = core_foundation_sys::uuid::CFUUIDGetUUIDBytes(interface_id_ref as _);
    CFRelease(interface_id_ref as _);

    let mut intf: *mut *mut T = std::ptr::null_mut();
    let qi_result = ((**plug).QueryInterface)(plug, iid, &mut intf as *mut _ as *mut *mut c_void);
    ((**plug).Release)(plug);

    if qi_result == 0 && !intf.is_null() {
        Some(intf)
    } else {
        None
    }
}

/// Consume an IOKit interface-matching iterator (from
/// `CreateInterfaceIterator`), returning the retained interface whose
/// `bInterfaceNumber` matches, if any. Every non-matching candidate is
/// released along the way, and the iterator itself is always released.
pub(crate) unsafe fn find_matching_interface(iterator: io_object_t, number: u8) -> Option<IOUSBInterfaceInterfacePtr> {
    let mut found = None;
    loop {
        let service = ffi::IOIteratorNext(iterator);
        if service == 0 {
            break;
        }
        let handle: Option<IOUSBInterfaceInterfacePtr> =
            plugin_interface(service, K_IOUSB_INTERFACE_USER_CLIENT_TYPE_ID, K_IOUSB_INTERFACE_INTERFACE_ID_190);
        ffi::IOObjectRelease(service);

        let Some(handle) = handle else { continue };
        if found.is_some() {
            let _ = ((**handle).Release)(handle);
            continue;
        }
        let mut intf_number: u8 = 0;
        let result = ((**handle).GetInterfaceNumber)(handle, &mut intf_number);
        if result == 0 && intf_number == number {
            found = Some(handle);
        } else {
            let _ = ((**handle).Release)(handle);
        }
    }
    ffi::IOObjectRelease(iterator);
    found
}

unsafe fn registry_string_property(service: io_object_t, key: &str) -> Option<String> {
    let cf_key = CFString::new(key);
    let value =
        ffi::IORegistryEntryCreateCFProperty(service, cf_key.as_concrete_TypeRef() as *const c_void, std::ptr::null(), 0);
    if value.is_null() {
        return None;
    }
    let cf_string =
        CFString::wrap_under_create_rule(value as core_foundation_sys::string::CFStringRef);
    Some(cf_string.to_string())
}

unsafe fn registry_entry_id(service: io_object_t) -> u64 {
    let mut id: u64 = 0;
    ffi::IORegistryEntryGetRegistryEntryID(service, &mut id);
    id
}

unsafe fn discover_one(service: io_object_t) -> Option<Device> {
    let handle: IOUSBDeviceInterfacePtr =
        plugin_interface(service, K_IOUSB_DEVICE_USER_CLIENT_TYPE_ID, K_IOUSB_DEVICE_INTERFACE_ID_187)?;
    let identifier = format!("iokit:{:016x}", registry_entry_id(service));
    match Device::from_interface(handle, identifier) {
        Ok(device) => {
            let (vid, pid) = device.raw_vid_pid();
            device.set_identity(
                vid,
                pid,
                registry_string_property(service, "kUSBVendorString"),
                registry_string_property(service, "kUSBProductString"),
                registry_string_property(service, "kUSBSerialNumberString"),
            );
            Some(device)
        }
        Err(_) => {
            ((**handle).Release)(handle);
            None
        }
    }
}

/// Drain a first-match/enumeration iterator into discovered devices.
unsafe fn drain_devices(iterator: io_object_t) -> Vec<Device> {
    let mut devices = Vec::new();
    loop {
        let service = ffi::IOIteratorNext(iterator);
        if service == 0 {
            break;
        }
        if let Some(device) = discover_one(service) {
            devices.push(device);
        }
        ffi::IOObjectRelease(service);
    }
    devices
}

/// Drain a termination iterator, removing each device from the registry.
unsafe fn drain_terminations(iterator: io_object_t, registry: &Registry) {
    loop {
        let service = ffi::IOIteratorNext(iterator);
        if service == 0 {
            break;
        }
        let id = registry_entry_id(service);
        registry.close_and_remove_device(&format!("iokit:{id:016x}"));
        ffi::IOObjectRelease(service);
    }
}

struct Callbacks {
    registry: Registry,
}

extern "C" fn on_matched(refcon: *mut c_void, iterator: io_object_t) {
    let callbacks = unsafe { &*(refcon as *const Callbacks) };
    for device in unsafe { drain_devices(iterator) } {
        callbacks.registry.add_device(device);
    }
}

extern "C" fn on_terminated(refcon: *mut c_void, iterator: io_object_t) {
    let callbacks = unsafe { &*(refcon as *const Callbacks) };
    unsafe { drain_terminations(iterator, &callbacks.registry) };
}

unsafe fn add_matching_notification(
    notify_port: *mut c_void,
    notification_type: &str,
    callback: extern "C" fn(*mut c_void, io_object_t),
    refcon: *mut c_void,
) -> io_object_t {
    let matching = ffi::IOServiceMatching(CString::new(IO_USB_DEVICE_CLASS_NAME).unwrap().as_ptr());
    let notification_type = CString::new(notification_type).unwrap();
    let mut notification: io_object_t = 0;
    ffi::IOServiceAddMatchingNotification(
        notify_port,
        notification_type.as_ptr(),
        matching,
        callback,
        refcon,
        &mut notification,
    );
    notification
}

/// Entry point run on the registry's background monitor thread.
///
/// Blocks forever in `CFRunLoopRun()` under normal operation, delivering
/// connect/disconnect events to `on_matched`/`on_terminated` as they
/// arrive; only a fatal setup failure, or the run loop unexpectedly
/// running dry (every source removed, which this monitor never does),
/// falls through.
pub(crate) fn run(registry: Registry) -> ! {
    unsafe {
        let notify_port = ffi::IONotificationPortCreate(ffi::kIOMasterPortDefault);
        if notify_port.is_null() {
            registry.notify_enumeration_failed("IONotificationPortCreate failed".to_string());
            loop {
                std::thread::park();
            }
        }

        let run_loop_source = ffi::IONotificationPortGetRunLoopSource(notify_port);
        CFRunLoopAddSource(CFRunLoopGetCurrent(), run_loop_source as _, kCFRunLoopDefaultMode);

        let callbacks: &'static Callbacks = Box::leak(Box::new(Callbacks { registry: registry.clone() }));
        let refcon = callbacks as *const Callbacks as *mut c_void;

        let added_iter = add_matching_notification(notify_port, K_IO_FIRST_MATCH_NOTIFICATION, on_matched, refcon);
        let removed_iter = add_matching_notification(notify_port, K_IO_TERMINATED_NOTIFICATION, on_terminated, refcon);

        // Draining these iterators here both arms the notifications (an
        // unconsumed iterator never fires again) and performs the initial
        // enumeration the registry is waiting on.
        let devices = drain_devices(added_iter);
        drain_terminations(removed_iter, &registry);
        registry.notify_enumeration_complete(devices);

        CFRunLoopRun();

        registry.notify_enumeration_failed("macOS USB monitor run loop exited unexpectedly".to_string());
        loop {
            std::thread::park();
        }
    }
}
