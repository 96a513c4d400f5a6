//! The slice of the IOKit USB plug-in COM interfaces this driver calls.
//!
//! IOKit's plug-in interfaces are stable C ABI vtables (`IUnknown`-style:
//! a function-pointer struct reached through a pointer-to-pointer), not a
//! Rust-native API; `io-kit-sys` supplies the scalar types and return
//! codes, and the vtable layouts themselves are declared here exactly as
//! `<IOKit/usb/IOUSBLib.h>` and `_macos/iokit.py`'s `ctypes` structures lay
//! them out.

#![allow(non_snake_case, non_camel_case_types)]

use std::ffi::c_void;
use std::os::raw::{c_char, c_uchar, c_ulong, c_ushort};

use core_foundation_sys::uuid::CFUUIDBytes;
use io_kit_sys::ret::IOReturn;
use io_kit_sys::types::io_object_t;

pub(crate) type MachPortT = u32;
pub(crate) type KernReturnT = i32;

/// `CFUUIDCreateFromUUIDBytes`/`QueryInterface` identify plug-in and
/// interface types by 16-byte UUID, hard-coded in `<IOKit/usb/IOUSBLib.h>`
/// the same way `_macos/iokit.py` hard-codes them for `ctypes`.
pub(crate) const K_IOUSB_DEVICE_USER_CLIENT_TYPE_ID: [u8; 16] = [
    0x9d, 0xc7, 0xb7, 0x80, 0x9e, 0xc0, 0x11, 0xD4, 0xa5, 0x4f, 0x00, 0x0a, 0x27, 0x05, 0x28, 0x61,
];
pub(crate) const K_IOUSB_INTERFACE_USER_CLIENT_TYPE_ID: [u8; 16] = [
    0x2d, 0x97, 0x86, 0xc6, 0x9e, 0xf3, 0x11, 0xD4, 0xad, 0x51, 0x00, 0x0a, 0x27, 0x05, 0x28, 0x61,
];
pub(crate) const K_IOUSB_DEVICE_INTERFACE_ID_187: [u8; 16] = [
    0x3C, 0x9E, 0xE1, 0xEB, 0x24, 0x02, 0x11, 0xB2, 0x8E, 0x7E, 0x00, 0x0A, 0x27, 0x80, 0x1E, 0x86,
];
pub(crate) const K_IOUSB_INTERFACE_INTERFACE_ID_190: [u8; 16] = [
    0x8f, 0xdb, 0x84, 0x55, 0x74, 0xa6, 0x11, 0xD6, 0x97, 0xb1, 0x00, 0x30, 0x65, 0xd3, 0x60, 0x8e,
];
pub(crate) const K_IOCF_PLUGIN_INTERFACE_ID: [u8; 16] = [
    0xC2, 0x44, 0xE8, 0x58, 0x10, 0x9C, 0x11, 0xD4, 0x91, 0xD4, 0x00, 0x50, 0xE4, 0xC6, 0x42, 0x6F,
];

#[link(name = "IOKit", kind = "framework")]
extern "C" {
    pub(crate) static kIOMasterPortDefault: MachPortT;

    pub(crate) fn IOServiceMatching(name: *const c_char) -> *mut c_void;
    pub(crate) fn IOServiceGetMatchingServices(
        master_port: MachPortT,
        matching: *mut c_void,
        existing: *mut io_object_t,
    ) -> KernReturnT;
    pub(crate) fn IOIteratorNext(iterator: io_object_t) -> io_object_t;
    pub(crate) fn IOObjectRelease(object: io_object_t) -> KernReturnT;
    pub(crate) fn IORegistryEntryGetRegistryEntryID(entry: io_object_t, entry_id: *mut u64) -> KernReturnT;
    pub(crate) fn IORegistryEntryCreateCFProperty(
        entry: io_object_t,
        key: *const c_void,
        allocator: *const c_void,
        options: u32,
    ) -> *const c_void;
    pub(crate) fn IOCreatePlugInInterfaceForService(
        service: io_object_t,
        plugin_type: *const c_void,
        interface_id: *const c_void,
        the_interface: *mut *mut c_void,
        the_score: *mut i32,
    ) -> KernReturnT;
    pub(crate) fn IONotificationPortCreate(master_port: MachPortT) -> *mut c_void;
    pub(crate) fn IONotificationPortGetRunLoopSource(notify: *mut c_void) -> *mut c_void;
    pub(crate) fn IOServiceAddMatchingNotification(
        notify_port: *mut c_void,
        notification_type: *const c_char,
        matching: *mut c_void,
        callback: extern "C" fn(*mut c_void, io_object_t),
        refcon: *mut c_void,
        notification: *mut io_object_t,
    ) -> KernReturnT;
}

pub(crate) const K_IO_RETURN_EXCLUSIVE_ACCESS: IOReturn = -536870203; // 0xE00002C5
pub(crate) const K_IO_RETURN_ABORTED: IOReturn = -536870165; // 0xE00002EB
pub(crate) const K_IOUSB_PIPE_STALLED: IOReturn = -536854449; // 0xE000404F
pub(crate) const K_IOUSB_TRANSACTION_TIMEOUT: IOReturn = -536854447; // 0xE0004051
pub(crate) const K_USB_REENUMERATE_CAPTURE_DEVICE_MASK: u32 = 1 << 30;
pub(crate) const K_USB_REENUMERATE_RELEASE_DEVICE_MASK: u32 = 1 << 29;
pub(crate) const K_IOUSB_FIND_INTERFACE_DONT_CARE: u16 = 0xffff;

#[repr(C)]
pub(crate) struct IOUSBFindInterfaceRequest {
    pub bInterfaceClass: c_ushort,
    pub bInterfaceSubClass: c_ushort,
    pub bInterfaceProtocol: c_ushort,
    pub bAlternateSetting: c_ushort,
}

#[repr(C)]
pub(crate) struct IOUSBDevRequest {
    pub bmRequestType: c_uchar,
    pub bRequest: c_uchar,
    pub wValue: c_ushort,
    pub wIndex: c_ushort,
    pub wLength: c_ushort,
    pub pData: *mut c_void,
    pub wLenDone: u32,
}

#[repr(C)]
pub(crate) struct USBConfigurationDescriptor {
    pub bLength: c_uchar,
    pub bDescriptorType: c_uchar,
    pub wTotalLength: c_ushort,
    pub bNumInterfaces: c_uchar,
    pub bConfigurationValue: c_uchar,
    pub iConfiguration: c_uchar,
    pub bmAttributes: c_uchar,
    pub maxPower: c_uchar,
}

type IUnknownPtr = *mut *mut IUnknownVtbl;

#[repr(C)]
pub(crate) struct IUnknownVtbl {
    pub _reserved: *mut c_void,
    pub QueryInterface: unsafe extern "C" fn(this: IUnknownPtr, iid: CFUUIDBytes, ppv: *mut *mut c_void) -> c_ulong,
    pub AddRef: unsafe extern "C" fn(this: IUnknownPtr) -> c_ulong,
    pub Release: unsafe extern "C" fn(this: IUnknownPtr) -> c_ulong,
}

pub(crate) type IOUSBDeviceInterfacePtr = *mut *mut IOUSBDeviceInterface187;

#[repr(C)]
pub(crate) struct IOUSBDeviceInterface187 {
    pub _reserved: *mut c_void,
    pub QueryInterface:
        unsafe extern "C" fn(this: IOUSBDeviceInterfacePtr, iid: CFUUIDBytes, ppv: *mut *mut c_void) -> c_ulong,
    pub AddRef: unsafe extern "C" fn(this: IOUSBDeviceInterfacePtr) -> c_ulong,
    pub Release: unsafe extern "C" fn(this: IOUSBDeviceInterfacePtr) -> c_ulong,
    _reserved1: *mut c_void,
    _reserved2: *mut c_void,
    _reserved3: *mut c_void,
    _reserved4: *mut c_void,
    _reserved5: *mut c_void,
    pub USBDeviceClose: unsafe extern "C" fn(this: IOUSBDeviceInterfacePtr) -> IOReturn,
    _reserved7: *mut c_void,
    _reserved8: *mut c_void,
    _reserved9: *mut c_void,
    _reserved10: *mut c_void,
    _reserved11: *mut c_void,
    _reserved12: *mut c_void,
    _reserved13: *mut c_void,
    _reserved14: *mut c_void,
    _reserved15: *mut c_void,
    _reserved16: *mut c_void,
    _reserved17: *mut c_void,
    pub GetConfigurationDescriptorPtr: unsafe extern "C" fn(
        this: IOUSBDeviceInterfacePtr,
        config_index: u8,
        desc: *mut *mut USBConfigurationDescriptor,
    ) -> IOReturn,
    _reserved19: *mut c_void,
    pub SetConfiguration: unsafe extern "C" fn(this: IOUSBDeviceInterfacePtr, config_value: u8) -> IOReturn,
    _reserved21: *mut c_void,
    _reserved22: *mut c_void,
    pub DeviceRequest: unsafe extern "C" fn(this: IOUSBDeviceInterfacePtr, req: *mut IOUSBDevRequest) -> IOReturn,
    _reserved24: *mut c_void,
    pub CreateInterfaceIterator: unsafe extern "C" fn(
        this: IOUSBDeviceInterfacePtr,
        request: *mut IOUSBFindInterfaceRequest,
        iterator: *mut io_object_t,
    ) -> IOReturn,
    pub USBDeviceOpenSeize: unsafe extern "C" fn(this: IOUSBDeviceInterfacePtr) -> IOReturn,
    _reserved27: *mut c_void,
    _reserved28: *mut c_void,
    _reserved29: *mut c_void,
    _reserved30: *mut c_void,
    _reserved31: *mut c_void,
    _reserved32: *mut c_void,
    _reserved33: *mut c_void,
    pub USBDeviceReEnumerate: unsafe extern "C" fn(this: IOUSBDeviceInterfacePtr, options: u32) -> IOReturn,
}

pub(crate) type IOUSBInterfaceInterfacePtr = *mut *mut IOUSBInterfaceInterface190;

#[repr(C)]
pub(crate) struct IOUSBInterfaceInterface190 {
    pub _reserved: *mut c_void,
    pub QueryInterface:
        unsafe extern "C" fn(this: IOUSBInterfaceInterfacePtr, iid: CFUUIDBytes, ppv: *mut *mut c_void) -> c_ulong,
    pub AddRef: unsafe extern "C" fn(this: IOUSBInterfaceInterfacePtr) -> c_ulong,
    pub Release: unsafe extern "C" fn(this: IOUSBInterfaceInterfacePtr) -> c_ulong,
    _reserved1: *mut c_void,
    _reserved2: *mut c_void,
    _reserved3: *mut c_void,
    _reserved4: *mut c_void,
    _reserved5: *mut c_void,
    _reserved6: *mut c_void,
    pub USBInterfaceOpenSeize: unsafe extern "C" fn(this: IOUSBInterfaceInterfacePtr) -> IOReturn,
    pub USBInterfaceClose: unsafe extern "C" fn(this: IOUSBInterfaceInterfacePtr) -> IOReturn,
    pub GetInterfaceNumber: unsafe extern "C" fn(this: IOUSBInterfaceInterfacePtr, intf_number: *mut u8) -> IOReturn,
    _reserved10: *mut c_void,
    _reserved11: *mut c_void,
    _reserved12: *mut c_void,
    _reserved13: *mut c_void,
    pub GetNumEndpoints: unsafe extern "C" fn(this: IOUSBInterfaceInterfacePtr, num_endpoints: *mut u8) -> IOReturn,
    _reserved15: *mut c_void,
    pub SetAlternateInterface:
        unsafe extern "C" fn(this: IOUSBInterfaceInterfacePtr, alt_setting: u8) -> IOReturn,
    _reserved17: *mut c_void,
    pub GetPipeProperties: unsafe extern "C" fn(
        this: IOUSBInterfaceInterfacePtr,
        pipe_ref: u8,
        direction: *mut u8,
        number: *mut u8,
        transfer_type: *mut u8,
        max_packet_size: *mut u16,
        interval: *mut u8,
    ) -> IOReturn,
    _reserved19: *mut c_void,
    pub ReadPipe:
        unsafe extern "C" fn(this: IOUSBInterfaceInterfacePtr, pipe_ref: u8, buf: *mut c_void, size: *mut u32) -> IOReturn,
    pub WritePipe:
        unsafe extern "C" fn(this: IOUSBInterfaceInterfacePtr, pipe_ref: u8, buf: *mut c_void, size: u32) -> IOReturn,
    _reserved22: *mut c_void,
    _reserved23: *mut c_void,
    pub AbortPipe: unsafe extern "C" fn(this: IOUSBInterfaceInterfacePtr, pipe_ref: u8) -> IOReturn,
    pub ResetPipe: unsafe extern "C" fn(this: IOUSBInterfaceInterfacePtr, pipe_ref: u8) -> IOReturn,
    pub ClearPipeStall: unsafe extern "C" fn(this: IOUSBInterfaceInterfacePtr, pipe_ref: u8) -> IOReturn,
    _reserved27: *mut c_void,
    _reserved28: *mut c_void,
    _reserved29: *mut c_void,
    pub ReadPipeTO: unsafe extern "C" fn(
        this: IOUSBInterfaceInterfacePtr,
        pipe_ref: u8,
        buf: *mut c_void,
        size: *mut u32,
        noDataTimeout: u32,
        completionTimeout: u32,
    ) -> IOReturn,
    pub WritePipeTO: unsafe extern "C" fn(
        this: IOUSBInterfaceInterfacePtr,
        pipe_ref: u8,
        buf: *mut c_void,
        size: u32,
        noDataTimeout: u32,
        completionTimeout: u32,
    ) -> IOReturn,
    _reserved32: *mut c_void,
    _reserved33: *mut c_void,
    _reserved34: *mut c_void,
    pub ClearPipeStallBothEnds: unsafe extern "C" fn(this: IOUSBInterfaceInterfacePtr, pipe_ref: u8) -> IOReturn,
}
