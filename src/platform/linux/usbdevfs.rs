//! `usbfs` (`/dev/bus/usb/BBB/DDD`) wire structures and request codes.
//!
//! Mirrors `_linux/usbdevfs.py`'s `ctypes` structures field-for-field so the
//! kernel sees the exact same layout.

use std::ffi::c_void;

use super::ioctl::{io, ior, iow, iowr};

pub(crate) const USBDEVFS_MAXDRIVERNAME: usize = 255;

#[repr(C)]
pub(crate) struct CtrlTransfer {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
    pub timeout: u32,
    pub data: *mut c_void,
}

#[repr(C)]
pub(crate) struct SetInterface {
    pub interface: u32,
    pub altsetting: u32,
}

#[repr(C)]
pub(crate) struct DisconnectClaim {
    pub interface: u32,
    pub flags: u32,
    pub driver: [u8; USBDEVFS_MAXDRIVERNAME],
}

#[repr(C)]
pub(crate) struct Urb {
    pub kind: u8,
    pub endpoint: u8,
    pub status: i32,
    pub flags: u32,
    pub buffer: *mut c_void,
    pub buffer_length: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
    pub signr: u32,
    pub usercontext: *mut c_void,
}

#[repr(C)]
pub(crate) struct IoCtl {
    pub ifno: u32,
    pub ioctl_code: u32,
    pub data: *mut c_void,
}

pub(crate) const USBDEVFS_URB_TYPE_ISO: u8 = 0;
pub(crate) const USBDEVFS_URB_TYPE_INTERRUPT: u8 = 1;
pub(crate) const USBDEVFS_URB_TYPE_CONTROL: u8 = 2;
pub(crate) const USBDEVFS_URB_TYPE_BULK: u8 = 3;

pub(crate) const USBDEVFS_DISCONNECT_CLAIM_EXCEPT_DRIVER: u32 = 0x02;

pub(crate) fn usbdevfs_control() -> u32 {
    iowr(b'U', 0, std::mem::size_of::<CtrlTransfer>())
}

pub(crate) fn usbdevfs_setinterface() -> u32 {
    ior(b'U', 4, std::mem::size_of::<SetInterface>())
}

pub(crate) fn usbdevfs_submiturb() -> u32 {
    ior(b'U', 10, std::mem::size_of::<Urb>())
}

pub(crate) fn usbdevfs_discardurb() -> u32 {
    io(b'U', 11)
}

pub(crate) fn usbdevfs_reapurbndelay() -> u32 {
    iow(b'U', 13, std::mem::size_of::<*mut c_void>())
}

pub(crate) fn usbdevfs_claiminterface() -> u32 {
    ior(b'U', 15, std::mem::size_of::<u32>())
}

pub(crate) fn usbdevfs_releaseinterface() -> u32 {
    ior(b'U', 16, std::mem::size_of::<u32>())
}

pub(crate) fn usbdevfs_ioctl() -> u32 {
    iowr(b'U', 18, std::mem::size_of::<IoCtl>())
}

pub(crate) fn usbdevfs_clear_halt() -> u32 {
    ior(b'U', 21, std::mem::size_of::<u32>())
}

pub(crate) fn usbdevfs_connect() -> u32 {
    io(b'U', 23)
}

pub(crate) fn usbdevfs_disconnect_claim() -> u32 {
    ior(b'U', 27, std::mem::size_of::<DisconnectClaim>())
}
