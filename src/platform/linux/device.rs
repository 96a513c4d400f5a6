//! The Linux `usbfs` device driver.
//!
//! Grounded on `_linux/linuxdevice.py`'s `LinuxDevice`: one open file
//! descriptor on `/dev/bus/usb/BBB/DDD`, synchronous `ioctl`s for control
//! transfers and interface management, and bulk/interrupt transfers
//! dispatched through [`super::dispatcher`].

use std::ffi::c_void;
use std::fs;
use std::os::fd::RawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::sync::Mutex;
use std::time::Duration;

use crate::common::DeviceState;
use crate::device::UsbDevice;
use crate::error::{Error, Result};
use crate::model::{Configuration, ControlTransfer, Endpoint, Interface, RequestType, TransferDirection, TransferType};

use super::dispatcher;
use super::usbdevfs::{
    self, CtrlTransfer, DisconnectClaim, IoCtl, SetInterface, USBDEVFS_DISCONNECT_CLAIM_EXCEPT_DRIVER,
    USBDEVFS_MAXDRIVERNAME,
};

fn bm_request_type(transfer: &ControlTransfer, direction: TransferDirection) -> u8 {
    let dir_bit = if direction == TransferDirection::In { 0x80 } else { 0x00 };
    let type_bits = match transfer.request_type {
        RequestType::Standard => 0x00,
        RequestType::Class => 0x20,
        RequestType::Vendor => 0x40,
    };
    let recipient_bits = match transfer.recipient {
        crate::model::Recipient::Device => 0,
        crate::model::Recipient::Interface => 1,
        crate::model::Recipient::Endpoint => 2,
        crate::model::Recipient::Other => 3,
    };
    dir_bit | type_bits | recipient_bits
}

fn os_error(err: std::io::Error, operation: &str) -> Error {
    match err.raw_os_error() {
        Some(libc::ETIMEDOUT) => Error::timeout(format!("{operation} timed out")),
        Some(libc::EPIPE) => Error::stall(format!("{operation} stalled")),
        Some(libc::ENODEV) => Error::NotConnected,
        _ => Error::usb(format!("{operation} failed - {err}")),
    }
}

struct Inner {
    state: DeviceState,
    device_fd: RawFd,
    detach_drivers: bool,
}

/// A USB device reachable through Linux's `usbfs`.
pub struct Device {
    inner: Mutex<Inner>,
}

impl Device {
    /// Open `path` (e.g. `/dev/bus/usb/001/004`) just long enough to read
    /// its device and configuration descriptors, the way every platform
    /// monitor does at discovery time.
    pub(crate) fn discover(path: &str) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| os_error(e, &format!("reading descriptors for {path}")))?;
        if bytes.len() < 18 {
            return Err(Error::usb(format!("{path}: device descriptor truncated")));
        }
        let device_descriptor = bytes[..18].to_vec();
        let configuration_descriptor = bytes[18..].to_vec();
        let state = DeviceState::from_descriptors(path.to_string(), device_descriptor, configuration_descriptor)?;
        Ok(Device {
            inner: Mutex::new(Inner {
                state,
                device_fd: -1,
                detach_drivers: false,
            }),
        })
    }

    pub(crate) fn set_identity(&self, vid: u16, pid: u16, manufacturer: Option<String>, product: Option<String>, serial: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.state.vid = vid;
        inner.state.pid = pid;
        inner.state.manufacturer = manufacturer;
        inner.state.product = product;
        inner.state.serial = serial;
    }
}

impl UsbDevice for Device {
    fn identifier(&self) -> String {
        self.inner.lock().unwrap().state.identifier.clone()
    }

    fn vid(&self) -> u16 {
        self.inner.lock().unwrap().state.vid
    }

    fn pid(&self) -> u16 {
        self.inner.lock().unwrap().state.pid
    }

    fn manufacturer(&self) -> Option<String> {
        self.inner.lock().unwrap().state.manufacturer.clone()
    }

    fn product(&self) -> Option<String> {
        self.inner.lock().unwrap().state.product.clone()
    }

    fn serial(&self) -> Option<String> {
        self.inner.lock().unwrap().state.serial.clone()
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().state.is_connected
    }

    fn is_open(&self) -> bool {
        self.inner.lock().unwrap().state.is_open
    }

    fn configuration(&self) -> Configuration {
        self.inner.lock().unwrap().state.configuration.clone()
    }

    fn get_interface(&self, number: u8) -> Option<Interface> {
        self.inner.lock().unwrap().state.get_interface(number).cloned()
    }

    fn get_endpoint(&self, number: u8, direction: TransferDirection) -> Option<Endpoint> {
        self.inner.lock().unwrap().state.get_endpoint(number, direction).cloned()
    }

    fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.check_is_closed_and_connected()?;
        let path = inner.state.identifier.clone();
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)
            .map_err(|e| os_error(e, &format!("opening device {path}")))?;
        let fd = file.into_raw_fd();
        inner.device_fd = fd;
        inner.state.is_open = true;
        dispatcher::Dispatcher::global().add_device(fd);
        Ok(())
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.is_open {
            return;
        }
        dispatcher::Dispatcher::global().remove_device(inner.device_fd);
        unsafe {
            libc::close(inner.device_fd);
        }
        inner.state.is_open = false;
        inner.device_fd = -1;
        inner.state.release_all_interfaces();
    }

    fn claim_interface(&self, number: u8) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.check_is_open()?;
        inner.state.check_interface(number, false)?;

        let fd = inner.device_fd;
        let res = if inner.detach_drivers {
            let mut driver = [0u8; USBDEVFS_MAXDRIVERNAME];
            driver[..b"usbfs".len()].copy_from_slice(b"usbfs");
            let mut disconnect_claim = DisconnectClaim {
                interface: number as u32,
                flags: USBDEVFS_DISCONNECT_CLAIM_EXCEPT_DRIVER,
                driver,
            };
            unsafe {
                libc::ioctl(
                    fd,
                    usbdevfs::usbdevfs_disconnect_claim() as _,
                    &mut disconnect_claim as *mut DisconnectClaim,
                )
            }
        } else {
            let mut intf_number: u32 = number as u32;
            unsafe { libc::ioctl(fd, usbdevfs::usbdevfs_claiminterface() as _, &mut intf_number as *mut u32) }
        };
        if res != 0 {
            return Err(os_error(std::io::Error::last_os_error(), &format!("claiming interface {number}")));
        }

        inner.state.set_claimed(number, true);
        Ok(())
    }

    fn release_interface(&self, number: u8) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.check_is_open()?;
        inner.state.check_interface(number, true)?;

        let fd = inner.device_fd;
        let mut intf_number: u32 = number as u32;
        let res = unsafe { libc::ioctl(fd, usbdevfs::usbdevfs_releaseinterface() as _, &mut intf_number as *mut u32) };
        if res != 0 {
            return Err(os_error(std::io::Error::last_os_error(), &format!("releasing interface {number}")));
        }
        inner.state.set_claimed(number, false);

        if inner.detach_drivers {
            let mut cmd = IoCtl {
                ifno: number as u32,
                ioctl_code: usbdevfs::usbdevfs_connect(),
                data: std::ptr::null_mut(),
            };
            let res = unsafe { libc::ioctl(fd, usbdevfs::usbdevfs_ioctl() as _, &mut cmd as *mut IoCtl) };
            if res != 0 {
                return Err(os_error(
                    std::io::Error::last_os_error(),
                    &format!("connecting standard driver to interface {number}"),
                ));
            }
        }
        Ok(())
    }

    fn select_alternate(&self, interface_number: u8, alternate_number: u8) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.check_alternate(interface_number, alternate_number)?;

        let fd = inner.device_fd;
        let mut set_interface = SetInterface {
            interface: interface_number as u32,
            altsetting: alternate_number as u32,
        };
        let res = unsafe { libc::ioctl(fd, usbdevfs::usbdevfs_setinterface() as _, &mut set_interface as *mut SetInterface) };
        if res != 0 {
            return Err(os_error(
                std::io::Error::last_os_error(),
                &format!("setting interface {interface_number} to alternate {alternate_number}"),
            ));
        }
        inner.state.set_current_alternate(interface_number, alternate_number);
        Ok(())
    }

    fn control_transfer_in(&self, transfer: ControlTransfer, length: u16) -> Result<Vec<u8>> {
        let fd = {
            let inner = self.inner.lock().unwrap();
            inner.state.check_control_transfer(&transfer)?;
            inner.device_fd
        };

        let mut buffer = vec![0u8; length as usize];
        let mut ctrl = CtrlTransfer {
            bm_request_type: bm_request_type(&transfer, TransferDirection::In),
            b_request: transfer.request,
            w_value: transfer.value,
            w_index: transfer.index,
            w_length: length,
            timeout: 0,
            data: buffer.as_mut_ptr() as *mut c_void,
        };
        let transferred = unsafe { libc::ioctl(fd, usbdevfs::usbdevfs_control() as _, &mut ctrl as *mut CtrlTransfer) };
        if transferred < 0 {
            return Err(os_error(std::io::Error::last_os_error(), "control transfer IN"));
        }
        buffer.truncate(transferred as usize);
        Ok(buffer)
    }

    fn control_transfer_out(&self, transfer: ControlTransfer, data: Option<&[u8]>) -> Result<()> {
        let fd = {
            let inner = self.inner.lock().unwrap();
            inner.state.check_control_transfer(&transfer)?;
            inner.device_fd
        };

        let mut owned = data.map(|d| d.to_vec());
        let mut ctrl = CtrlTransfer {
            bm_request_type: bm_request_type(&transfer, TransferDirection::Out),
            b_request: transfer.request,
            w_value: transfer.value,
            w_index: transfer.index,
            w_length: owned.as_ref().map_or(0, |d| d.len() as u16),
            timeout: 0,
            data: owned.as_mut().map_or(std::ptr::null_mut(), |d| d.as_mut_ptr() as *mut c_void),
        };
        let res = unsafe { libc::ioctl(fd, usbdevfs::usbdevfs_control() as _, &mut ctrl as *mut CtrlTransfer) };
        if res < 0 {
            return Err(os_error(std::io::Error::last_os_error(), "control transfer OUT"));
        }
        Ok(())
    }

    fn transfer_in(&self, endpoint_number: u8, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let (fd, max_packet_size) = {
            let inner = self.inner.lock().unwrap();
            inner.state.check_is_open()?;
            let (endpoint, _) = inner.state.check_transfer_endpoint(endpoint_number, TransferDirection::In)?;
            (inner.device_fd, endpoint.max_packet_size)
        };

        let buffer = vec![0u8; max_packet_size as usize];
        let handle = dispatcher::submit_bulk_or_interrupt(
            fd,
            endpoint_number,
            TransferDirection::In,
            TransferType::Bulk,
            buffer,
        )?;
        match timeout {
            None => handle.wait(),
            Some(d) => handle.wait_timeout(d),
        }
    }

    fn transfer_out(&self, endpoint_number: u8, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        let fd = {
            let inner = self.inner.lock().unwrap();
            inner.state.check_is_open()?;
            inner.state.check_transfer_endpoint(endpoint_number, TransferDirection::Out)?;
            inner.device_fd
        };

        let handle = dispatcher::submit_bulk_or_interrupt(
            fd,
            endpoint_number,
            TransferDirection::Out,
            TransferType::Bulk,
            data.to_vec(),
        )?;
        match timeout {
            None => handle.wait().map(|_| ()),
            Some(d) => handle.wait_timeout(d).map(|_| ()),
        }
    }

    fn clear_halt(&self, number: u8, direction: TransferDirection) -> Result<()> {
        let fd = {
            let inner = self.inner.lock().unwrap();
            inner.state.check_is_open()?;
            inner
                .state
                .get_endpoint(number, direction)
                .ok_or_else(|| Error::usb(format!("device has no matching endpoint {number}")))?;
            inner.device_fd
        };
        let mut address: u32 = Endpoint::get_address(number, direction) as u32;
        let res = unsafe { libc::ioctl(fd, usbdevfs::usbdevfs_clear_halt() as _, &mut address as *mut u32) };
        if res != 0 {
            return Err(os_error(
                std::io::Error::last_os_error(),
                &format!("clearing halt for endpoint {number}/{direction:?}"),
            ));
        }
        Ok(())
    }

    fn abort_transfers(&self, number: u8, direction: TransferDirection) -> Result<()> {
        let fd = {
            let inner = self.inner.lock().unwrap();
            inner.state.check_is_open()?;
            inner
                .state
                .get_endpoint(number, direction)
                .ok_or_else(|| Error::usb(format!("device has no matching endpoint {number}")))?;
            inner.device_fd
        };
        let address = Endpoint::get_address(number, direction);
        dispatcher::Dispatcher::global().abort(fd, address);
        Ok(())
    }

    fn detach_standard_drivers(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.check_is_closed_and_connected()?;
        inner.detach_drivers = true;
        Ok(())
    }

    fn attach_standard_drivers(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.check_is_closed_and_connected()?;
        inner.detach_drivers = false;
        Ok(())
    }

    fn mark_disconnected(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state.is_connected = false;
    }
}

impl Device {
    pub(crate) fn fd(&self) -> RawFd {
        self.inner.lock().unwrap().device_fd
    }
}

impl AsRawFd for Device {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}
