//! The Windows WinUSB device driver.
//!
//! Grounded on `_windows/windevice.py`'s `WindowsDevice`: one `CreateFileW`
//! handle and one `WinUsb_Initialize` handle per composite function, shared
//! across the function's interfaces via `WinUsb_GetAssociatedInterface`,
//! refcounted so the underlying device handle closes only when every
//! interface of that function has been released.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use windows_sys::Win32::Devices::Properties::{DEVPKEY_Device_Children, DEVPKEY_Device_HardwareIds};
use windows_sys::Win32::Devices::Usb::{
    WinUsb_AbortPipe, WinUsb_ControlTransfer, WinUsb_Free, WinUsb_GetAssociatedInterface, WinUsb_Initialize,
    WinUsb_ReadPipe, WinUsb_ResetPipe, WinUsb_SetCurrentAlternateSetting, WinUsb_SetPipePolicy, WinUsb_WritePipe,
    PIPE_TRANSFER_TIMEOUT, WINUSB_SETUP_PACKET,
};
use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, ERROR_GEN_FAILURE, ERROR_SEM_TIMEOUT, HANDLE};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_FLAG_OVERLAPPED, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};

use crate::common::DeviceState;
use crate::device::UsbDevice;
use crate::error::{Error, Result};
use crate::model::{Configuration, ControlTransfer, Endpoint, Interface, Recipient, TransferDirection};

use super::deviceinfo::DeviceInfoSet;

const GENERIC_READ: u32 = 0x8000_0000;
const GENERIC_WRITE: u32 = 0x4000_0000;
const INVALID_HANDLE: HANDLE = -1;

fn last_error(context: &str) -> Error {
    let code = unsafe { GetLastError() };
    match code {
        ERROR_SEM_TIMEOUT => Error::timeout(format!("{context} timed out")),
        ERROR_GEN_FAILURE => Error::stall(format!("{context} stalled")),
        _ => Error::usb(format!("{context} (Windows error {code})")),
    }
}

fn bm_request_type(transfer: &ControlTransfer, direction: TransferDirection) -> u8 {
    let dir_bit = if direction == TransferDirection::In { 0x80 } else { 0x00 };
    let type_bits = (transfer.request_type as u8) << 5;
    let recipient_bits = match transfer.recipient {
        Recipient::Device => 0,
        Recipient::Interface => 1,
        Recipient::Endpoint => 2,
        Recipient::Other => 3,
    };
    dir_bit | type_bits | recipient_bits
}

/// One composite function's (or the whole device's, if non-composite)
/// open `CreateFileW`/`WinUsb_Initialize` pair.
struct FunctionHandle {
    device_handle: HANDLE,
    winusb_handle: *mut core::ffi::c_void,
    open_count: u32,
}

struct InterfaceHandle {
    number: u8,
    first_number: u8,
    winusb_handle: Option<*mut core::ffi::c_void>,
}

struct Inner {
    state: DeviceState,
    is_composite: bool,
    functions: HashMap<u8, FunctionHandle>,
    interfaces: Vec<InterfaceHandle>,
    device_paths: HashMap<u8, String>,
}

/// A USB device reachable through Windows' WinUSB driver.
pub struct Device {
    inner: Mutex<Inner>,
}

// Every WinUSB/Win32 handle access is serialized through `inner`'s mutex;
// the handles themselves are not otherwise shared.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

impl Device {
    pub(crate) fn new(device_path: String, is_composite: bool, device_descriptor: Vec<u8>, configuration_descriptor: Vec<u8>) -> Result<Self> {
        let state = DeviceState::from_descriptors(device_path.to_lowercase(), device_descriptor, configuration_descriptor)?;
        let interfaces = state
            .configuration
            .interfaces
            .iter()
            .map(|intf| {
                let first_number = state
                    .configuration
                    .get_function(intf.number)
                    .map(|f| f.first_intf_number)
                    .unwrap_or(intf.number);
                InterfaceHandle { number: intf.number, first_number, winusb_handle: None }
            })
            .collect();

        Ok(Device {
            inner: Mutex::new(Inner {
                state,
                is_composite,
                functions: HashMap::new(),
                interfaces,
                device_paths: HashMap::new(),
            }),
        })
    }

    /// A single byte of the raw device descriptor, used by the monitor to
    /// read the manufacturer/product/serial string indices (offsets 14-16)
    /// before a human-readable string has been resolved for them.
    pub(crate) fn raw_device_descriptor_byte(&self, offset: usize) -> u8 {
        self.inner.lock().unwrap().state.device_descriptor[offset]
    }

    pub(crate) fn set_identity(&self, vid: u16, pid: u16, manufacturer: Option<String>, product: Option<String>, serial: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.state.vid = vid;
        inner.state.pid = pid;
        inner.state.manufacturer = manufacturer;
        inner.state.product = product;
        inner.state.serial = serial;
    }

    fn cached_interface_device_path(inner: &Inner, number: u8) -> Option<String> {
        if !inner.is_composite {
            return Some(inner.state.identifier.clone());
        }
        inner.device_paths.get(&number).cloned()
    }

    /// Resolve (and cache) the device path of the Windows device node for
    /// interface `number`, by walking the parent's `Device_Children`
    /// property and matching the `MI_XX` suffix in each child's hardware
    /// IDs, as `get_interface_device_path`/`get_child_device_path` do.
    fn interface_device_path(inner: &mut Inner, number: u8) -> Option<String> {
        if let Some(path) = Self::cached_interface_device_path(inner, number) {
            return Some(path);
        }

        let parent_path = inner.state.identifier.clone();
        let info = DeviceInfoSet::of_path(&parent_path).ok()?;
        let children = info.string_list_property(&DEVPKEY_Device_Children).ok()??;

        for instance_id in children {
            let child = DeviceInfoSet::of_instance(&instance_id).ok()?;
            let hardware_ids = child.string_list_property(&DEVPKEY_Device_HardwareIds).ok()??;
            let Some(intf_number) = extract_interface_number(&hardware_ids) else { continue };
            if intf_number != number {
                continue;
            }
            let path = DeviceInfoSet::device_path_by_guid(&instance_id)?;
            inner.device_paths.insert(number, path.clone());
            return Some(path);
        }
        None
    }

    fn find_interface(inner: &Inner, number: u8) -> Result<usize> {
        inner
            .interfaces
            .iter()
            .position(|i| i.number == number)
            .ok_or_else(|| Error::usb(format!("device has no interface {number}")))
    }

    /// Attempt to claim `number`; returns `Ok(false)` when the composite
    /// child device path is not yet available and the caller should retry.
    fn try_claim_interface(&self, number: u8) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.check_is_open()?;
        inner.state.check_interface(number, false)?;

        let idx = Self::find_interface(&inner, number)?;
        let first_number = inner.interfaces[idx].first_number;

        if !inner.functions.contains_key(&first_number) {
            let Some(device_path) = Self::interface_device_path(&mut inner, first_number) else {
                return Ok(false);
            };
            let wide: Vec<u16> = device_path.encode_utf16().chain(std::iter::once(0)).collect();
            let handle = unsafe {
                CreateFileW(
                    wide.as_ptr(),
                    GENERIC_WRITE | GENERIC_READ,
                    FILE_SHARE_WRITE | FILE_SHARE_READ,
                    std::ptr::null(),
                    OPEN_EXISTING,
                    FILE_ATTRIBUTE_NORMAL | FILE_FLAG_OVERLAPPED,
                    0,
                )
            };
            if handle == INVALID_HANDLE {
                return Err(last_error(&format!("claiming interface failed (opening USB device {device_path})")));
            }

            let mut winusb_handle: *mut core::ffi::c_void = std::ptr::null_mut();
            if unsafe { WinUsb_Initialize(handle, &mut winusb_handle) } == 0 {
                unsafe { CloseHandle(handle) };
                return Err(last_error("claiming interface failed"));
            }
            inner.functions.insert(first_number, FunctionHandle { device_handle: handle, winusb_handle, open_count: 0 });
        }

        let winusb_handle = if number == first_number {
            inner.functions.get(&first_number).unwrap().winusb_handle
        } else {
            let first_handle = inner.functions.get(&first_number).unwrap().winusb_handle;
            let mut associated: *mut core::ffi::c_void = std::ptr::null_mut();
            if unsafe { WinUsb_GetAssociatedInterface(first_handle, number - first_number - 1, &mut associated) } == 0 {
                return Err(last_error("claiming (associated) interface failed"));
            }
            associated
        };

        inner.interfaces[idx].winusb_handle = Some(winusb_handle);
        inner.functions.get_mut(&first_number).unwrap().open_count += 1;
        inner.state.set_claimed(number, true);
        Ok(true)
    }

    fn winusb_handle_for(&self, inner: &Inner, number: u8) -> Result<*mut core::ffi::c_void> {
        let idx = Self::find_interface(inner, number)?;
        inner.interfaces[idx]
            .winusb_handle
            .ok_or_else(|| Error::usb(format!("interface {number} is not claimed by this process")))
    }

    fn winusb_handle_for_recipient(inner: &Inner, transfer: &ControlTransfer) -> Result<*mut core::ffi::c_void> {
        match transfer.recipient {
            Recipient::Interface => Self::winusb_handle_for(inner, (transfer.index & 0xff) as u8),
            Recipient::Endpoint => {
                let address = (transfer.index & 0xff) as u8;
                let (_, intf) = inner
                    .state
                    .get_endpoint_and_interface(Endpoint::get_number(address), Endpoint::get_direction(address))
                    .ok_or_else(|| Error::usb("endpoint (lower byte of index) does not exist"))?;
                Self::winusb_handle_for(inner, intf.number)
            }
            Recipient::Device | Recipient::Other => inner
                .interfaces
                .iter()
                .find_map(|i| i.winusb_handle)
                .ok_or_else(|| Error::usb("control transfer to device not possible: no interface has been claimed")),
        }
    }
}

fn extract_interface_number(hardware_ids: &[String]) -> Option<u8> {
    for id in hardware_ids {
        let upper = id.to_uppercase();
        if let Some(pos) = upper.find("&MI_") {
            let digits = &upper[pos + 4..];
            if digits.len() >= 2 {
                if let Ok(n) = u8::from_str_radix(&digits[..2], 16) {
                    return Some(n);
                }
            }
        }
    }
    None
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
        inner.state.is_open = true;
        Ok(())
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state.is_open = false;
        for intf in &mut inner.interfaces {
            if let Some(handle) = intf.winusb_handle.take() {
                unsafe {
                    WinUsb_Free(handle);
                }
                let number = intf.number;
                inner.state.set_claimed(number, false);
            }
        }
        for (_, function) in inner.functions.drain() {
            unsafe {
                WinUsb_Free(function.winusb_handle);
                CloseHandle(function.device_handle);
            }
        }
    }

    fn claim_interface(&self, number: u8) -> Result<()> {
        // Composite functions can register with a short delay after the
        // parent device's arrival notification.
        for _ in 0..30 {
            if self.try_claim_interface(number)? {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        Err(Error::usb(
            "claiming interface failed (function has no device path / interface GUID, might be missing WinUSB driver)",
        ))
    }

    fn release_interface(&self, number: u8) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.check_is_open()?;
        inner.state.check_interface(number, true)?;

        let idx = Self::find_interface(&inner, number)?;
        let first_number = inner.interfaces[idx].first_number;
        let handle = inner.interfaces[idx].winusb_handle.take();

        if number != first_number {
            if let Some(handle) = handle {
                unsafe {
                    WinUsb_Free(handle);
                }
            }
        }

        if let Some(function) = inner.functions.get_mut(&first_number) {
            function.open_count -= 1;
            if function.open_count == 0 {
                let function = inner.functions.remove(&first_number).unwrap();
                unsafe {
                    WinUsb_Free(function.winusb_handle);
                    CloseHandle(function.device_handle);
                }
            }
        }

        inner.state.set_claimed(number, false);
        Ok(())
    }

    fn select_alternate(&self, interface_number: u8, alternate_number: u8) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.check_alternate(interface_number, alternate_number)?;
        let handle = self.winusb_handle_for(&inner, interface_number)?;
        if unsafe { WinUsb_SetCurrentAlternateSetting(handle, alternate_number) } == 0 {
            return Err(last_error(&format!(
                "failed to set interface {interface_number} to alternate {alternate_number}"
            )));
        }
        inner.state.set_current_alternate(interface_number, alternate_number);
        Ok(())
    }

    fn control_transfer_in(&self, transfer: ControlTransfer, length: u16) -> Result<Vec<u8>> {
        let handle = {
            let inner = self.inner.lock().unwrap();
            inner.state.check_control_transfer(&transfer)?;
            Self::winusb_handle_for_recipient(&inner, &transfer)?
        };

        let setup_packet = WINUSB_SETUP_PACKET {
            RequestType: bm_request_type(&transfer, TransferDirection::In),
            Request: transfer.request,
            Value: transfer.value,
            Index: transfer.index,
            Length: length,
        };
        let mut buffer = vec![0u8; length as usize];
        let mut transferred: u32 = 0;
        if unsafe {
            WinUsb_ControlTransfer(handle, setup_packet, buffer.as_mut_ptr(), length as u32, &mut transferred, std::ptr::null_mut())
        } == 0
        {
            return Err(last_error("control transfer IN failed"));
        }
        buffer.truncate(transferred as usize);
        Ok(buffer)
    }

    fn control_transfer_out(&self, transfer: ControlTransfer, data: Option<&[u8]>) -> Result<()> {
        let handle = {
            let inner = self.inner.lock().unwrap();
            inner.state.check_control_transfer(&transfer)?;
            Self::winusb_handle_for_recipient(&inner, &transfer)?
        };

        let setup_packet = WINUSB_SETUP_PACKET {
            RequestType: bm_request_type(&transfer, TransferDirection::Out),
            Request: transfer.request,
            Value: transfer.value,
            Index: transfer.index,
            Length: data.map_or(0, |d| d.len() as u16),
        };
        let mut owned = data.map(|d| d.to_vec()).unwrap_or_default();
        let mut transferred: u32 = 0;
        if unsafe {
            WinUsb_ControlTransfer(
                handle,
                setup_packet,
                owned.as_mut_ptr(),
                owned.len() as u32,
                &mut transferred,
                std::ptr::null_mut(),
            )
        } == 0
        {
            return Err(last_error("control transfer OUT failed"));
        }
        Ok(())
    }

    fn transfer_in(&self, endpoint_number: u8, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let (handle, max_packet_size) = {
            let inner = self.inner.lock().unwrap();
            let (endpoint, intf_number) = inner.state.check_transfer_endpoint(endpoint_number, TransferDirection::In)?;
            (self.winusb_handle_for(&inner, intf_number)?, endpoint.max_packet_size)
        };
        let address = Endpoint::get_address(endpoint_number, TransferDirection::In);
        set_pipe_timeout(handle, address, timeout)?;

        let mut buffer = vec![0u8; max_packet_size as usize];
        let mut transferred: u32 = 0;
        if unsafe { WinUsb_ReadPipe(handle, address, buffer.as_mut_ptr(), buffer.len() as u32, &mut transferred, std::ptr::null_mut()) } == 0 {
            return Err(last_error(&format!("transfer IN from endpoint {endpoint_number} failed")));
        }
        buffer.truncate(transferred as usize);
        Ok(buffer)
    }

    fn transfer_out(&self, endpoint_number: u8, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        let handle = {
            let inner = self.inner.lock().unwrap();
            let (_, intf_number) = inner.state.check_transfer_endpoint(endpoint_number, TransferDirection::Out)?;
            self.winusb_handle_for(&inner, intf_number)?
        };
        let address = Endpoint::get_address(endpoint_number, TransferDirection::Out);
        set_pipe_timeout(handle, address, timeout)?;

        let mut owned = data.to_vec();
        let mut transferred: u32 = 0;
        if unsafe { WinUsb_WritePipe(handle, address, owned.as_mut_ptr(), owned.len() as u32, &mut transferred, std::ptr::null_mut()) } == 0 {
            return Err(last_error(&format!("transfer OUT to endpoint {endpoint_number} failed")));
        }
        Ok(())
    }

    fn clear_halt(&self, number: u8, direction: TransferDirection) -> Result<()> {
        let handle = {
            let inner = self.inner.lock().unwrap();
            inner.state.check_is_open()?;
            let (_, intf) = inner
                .state
                .get_endpoint_and_interface(number, direction)
                .ok_or_else(|| Error::usb(format!("device has no matching endpoint {number}")))?;
            self.winusb_handle_for(&inner, intf.number)?
        };
        let address = Endpoint::get_address(number, direction);
        if unsafe { WinUsb_ResetPipe(handle, address) } == 0 {
            return Err(last_error(&format!("internal error: unable to clear halt of endpoint {number} {direction:?}")));
        }
        Ok(())
    }

    fn abort_transfers(&self, number: u8, direction: TransferDirection) -> Result<()> {
        let intf_number = {
            let inner = self.inner.lock().unwrap();
            inner.state.check_is_open()?;
            let (_, intf) = inner
                .state
                .get_endpoint_and_interface(number, direction)
                .ok_or_else(|| Error::usb(format!("device has no matching endpoint {number}")))?;
            intf.number
        };
        let handle = {
            let inner = self.inner.lock().unwrap();
            self.winusb_handle_for(&inner, intf_number)?
        };
        let address = Endpoint::get_address(number, direction);
        if unsafe { WinUsb_AbortPipe(handle, address) } == 0 {
            return Err(last_error(&format!("internal error: unable to abort transfer from/to endpoint {number} {direction:?}")));
        }
        Ok(())
    }

    fn detach_standard_drivers(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        inner.state.check_is_closed_and_connected()
    }

    fn attach_standard_drivers(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        inner.state.check_is_closed_and_connected()
    }

    fn mark_disconnected(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state.is_connected = false;
    }
}

fn set_pipe_timeout(handle: *mut core::ffi::c_void, pipe: u8, timeout: Option<Duration>) -> Result<()> {
    let mut millis: u32 = timeout.map_or(0, |d| d.as_millis() as u32);
    if unsafe {
        WinUsb_SetPipePolicy(
            handle,
            pipe,
            PIPE_TRANSFER_TIMEOUT,
            std::mem::size_of::<u32>() as u32,
            &mut millis as *mut u32 as *mut core::ffi::c_void,
        )
    } == 0
    {
        return Err(last_error(&format!("internal error: unable to set pipe policy for endpoint {pipe:#x}")));
    }
    Ok(())
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}
