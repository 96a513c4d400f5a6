//! The macOS IOKit device driver.
//!
//! Grounded on `_macos/macosdevice.py`'s `MacosDevice`: one retained
//! `IOUSBDeviceInterface187` pointer, one retained
//! `IOUSBInterfaceInterface190` pointer per claimed interface, and a
//! pipe-index table rebuilt after every claim/release/alternate change
//! (`update_endpoint_info`) because IOKit renumbers pipes per active
//! alternate setting.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::common::DeviceState;
use crate::device::UsbDevice;
use crate::error::{Error, Result};
use crate::model::{
    Configuration, ControlTransfer, Endpoint, Interface, Recipient, RequestType, TransferDirection, TransferType,
};

use super::ffi::{
    IOUSBDeviceInterfacePtr, IOUSBDevRequest, IOUSBFindInterfaceRequest, IOUSBInterfaceInterfacePtr,
    USBConfigurationDescriptor, K_IOUSB_FIND_INTERFACE_DONT_CARE, K_IOUSB_PIPE_STALLED, K_IOUSB_TRANSACTION_TIMEOUT,
    K_IO_RETURN_ABORTED, K_IO_RETURN_EXCLUSIVE_ACCESS, K_USB_REENUMERATE_CAPTURE_DEVICE_MASK,
    K_USB_REENUMERATE_RELEASE_DEVICE_MASK,
};

fn check_result(result: i32, context: &str) -> Result<()> {
    if result == 0 {
        return Ok(());
    }
    if result == K_IO_RETURN_EXCLUSIVE_ACCESS {
        return Err(Error::usb(format!("{context}: device already open")));
    }
    Err(Error::usb(format!("{context}: IOReturn {result:#x}")))
}

/// Map a pipe-transfer `IOReturn` to the crate's error taxonomy.
///
/// `kIOReturnAborted` is reported as a plain USB error here: it's what an
/// explicit `abort_transfers` call produces. A timed INTERRUPT transfer's
/// own timer checks for `kIOReturnAborted` itself, before this function
/// ever sees the result, so it can tell its own abort apart from one.
fn transfer_result(result: i32, context: &str) -> Result<()> {
    if result == 0 {
        return Ok(());
    }
    if result == K_IOUSB_PIPE_STALLED {
        return Err(Error::stall(format!("{context} stalled")));
    }
    if result == K_IOUSB_TRANSACTION_TIMEOUT {
        return Err(Error::timeout(format!("{context} timed out")));
    }
    Err(Error::usb(format!("{context} failed: IOReturn {result:#x}")))
}

/// A one-shot timer bounding an INTERRUPT transfer, which IOKit's
/// `ReadPipeTO`/`WritePipeTO` cannot do themselves (those only accept
/// BULK pipes). Grounded on `_macos/transfertimeout.py`'s `TransferTimeout`,
/// a `threading.Timer` that calls `AbortPipe` after `timeout_ms` unless
/// cancelled first.
struct InterruptTimeoutGuard {
    state: Arc<(Mutex<TimerState>, Condvar)>,
    thread: Option<std::thread::JoinHandle<()>>,
}

#[derive(Default)]
struct TimerState {
    cancelled: bool,
    fired: bool,
}

impl InterruptTimeoutGuard {
    fn start(handle: IOUSBInterfaceInterfacePtr, pipe_index: u8, timeout: Duration) -> Self {
        let state = Arc::new((Mutex::new(TimerState::default()), Condvar::new()));
        let thread_state = Arc::clone(&state);
        // IOUSBInterfaceInterfacePtr is a raw pointer and so isn't Send;
        // round-trip it through usize the way `Device` asserts Send for
        // the same reason (IOKit's COM interfaces are thread-safe).
        let handle_addr = handle as usize;
        let thread = std::thread::spawn(move || {
            let (lock, cvar) = &*thread_state;
            let guard = lock.lock().unwrap();
            let (mut guard, timeout_result) = cvar.wait_timeout_while(guard, timeout, |s| !s.cancelled).unwrap();
            if timeout_result.timed_out() && !guard.cancelled {
                guard.fired = true;
                drop(guard);
                let handle = handle_addr as IOUSBInterfaceInterfacePtr;
                unsafe {
                    (intf_vtbl(handle).AbortPipe)(handle, pipe_index);
                }
            }
        });
        InterruptTimeoutGuard {
            state,
            thread: Some(thread),
        }
    }

    /// Cancel the timer, wait for it to settle, and report whether it
    /// fired (i.e. whether it is the one that aborted the pipe).
    fn finish(mut self) -> bool {
        {
            let (lock, cvar) = &*self.state;
            lock.lock().unwrap().cancelled = true;
            cvar.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.state.0.lock().unwrap().fired
    }
}

fn transfer_type_from_macos(value: u8) -> TransferType {
    match value {
        1 => TransferType::Isochronous,
        2 => TransferType::Bulk,
        3 => TransferType::Interrupt,
        _ => TransferType::Control,
    }
}

fn bm_request_type(transfer: &ControlTransfer, direction: TransferDirection) -> u8 {
    let dir_bit = if direction == TransferDirection::In { 0x80 } else { 0x00 };
    let type_bits = match transfer.request_type {
        RequestType::Standard => 0x00,
        RequestType::Class => 0x20,
        RequestType::Vendor => 0x40,
    };
    let recipient_bits = match transfer.recipient {
        Recipient::Device => 0,
        Recipient::Interface => 1,
        Recipient::Endpoint => 2,
        Recipient::Other => 3,
    };
    dir_bit | type_bits | recipient_bits
}

struct ClaimedInterface {
    number: u8,
    handle: IOUSBInterfaceInterfacePtr,
}

#[derive(Clone, Copy)]
struct EndpointInfo {
    handle: IOUSBInterfaceInterfacePtr,
    pipe_index: u8,
    transfer_type: TransferType,
}

struct Inner {
    state: DeviceState,
    device_handle: IOUSBDeviceInterfacePtr,
    discovered_at: Instant,
    claimed: Vec<ClaimedInterface>,
    endpoints: HashMap<u8, EndpointInfo>,
}

/// A USB device reachable through IOKit's USB plug-in interfaces.
pub struct Device {
    inner: Mutex<Inner>,
}

// The IOKit COM pointers are reference-counted and IOKit itself is safe
// to call from any thread; every access here goes through `inner`'s mutex.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

unsafe fn device_vtbl(handle: IOUSBDeviceInterfacePtr) -> &'static super::ffi::IOUSBDeviceInterface187 {
    &**handle
}

unsafe fn intf_vtbl(handle: IOUSBInterfaceInterfacePtr) -> &'static super::ffi::IOUSBInterfaceInterface190 {
    &**handle
}

impl Device {
    /// Take ownership of an already-retained device interface and load
    /// its descriptors, exactly as the IOKit monitor does at discovery
    /// time.
    pub(crate) fn from_interface(handle: IOUSBDeviceInterfacePtr, identifier: String) -> Result<Self> {
        let device_descriptor = unsafe { Self::load_device_descriptor(handle)? };
        let configuration_descriptor = unsafe { Self::load_configuration_descriptor(handle)? };
        let state = DeviceState::from_descriptors(identifier, device_descriptor, configuration_descriptor)?;

        Ok(Device {
            inner: Mutex::new(Inner {
                state,
                device_handle: handle,
                discovered_at: Instant::now(),
                claimed: Vec::new(),
                endpoints: HashMap::new(),
            }),
        })
    }

    unsafe fn load_device_descriptor(handle: IOUSBDeviceInterfacePtr) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; 255];
        let mut request = IOUSBDevRequest {
            bmRequestType: 0x80,
            bRequest: 6, // GET_DESCRIPTOR
            wValue: 0x01 << 8,
            wIndex: 0,
            wLength: buffer.len() as u16,
            pData: buffer.as_mut_ptr() as *mut c_void,
            wLenDone: 0,
        };
        let result = (device_vtbl(handle).DeviceRequest)(handle, &mut request);
        check_result(result, "loading device descriptor")?;
        buffer.truncate(request.wLenDone as usize);
        Ok(buffer)
    }

    unsafe fn load_configuration_descriptor(handle: IOUSBDeviceInterfacePtr) -> Result<Vec<u8>> {
        let mut desc_ptr: *mut USBConfigurationDescriptor = std::ptr::null_mut();
        let result = (device_vtbl(handle).GetConfigurationDescriptorPtr)(handle, 0, &mut desc_ptr);
        check_result(result, "loading configuration descriptor")?;
        let total_length = (*desc_ptr).wTotalLength as usize;
        let bytes = std::slice::from_raw_parts(desc_ptr as *const u8, total_length);
        Ok(bytes.to_vec())
    }

    /// Vendor/product ID as encoded in the already-fetched device
    /// descriptor, before the monitor overwrites them with the values
    /// IOKit reports through the registry.
    pub(crate) fn raw_vid_pid(&self) -> (u16, u16) {
        let inner = self.inner.lock().unwrap();
        let d = &inner.state.device_descriptor;
        (u16::from_le_bytes([d[8], d[9]]), u16::from_le_bytes([d[10], d[11]]))
    }

    pub(crate) fn set_identity(&self, vid: u16, pid: u16, manufacturer: Option<String>, product: Option<String>, serial: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.state.vid = vid;
        inner.state.pid = pid;
        inner.state.manufacturer = manufacturer;
        inner.state.product = product;
        inner.state.serial = serial;
    }

    fn find_interface_handle(&self, inner: &Inner, number: u8) -> Option<IOUSBInterfaceInterfacePtr> {
        inner.claimed.iter().find(|c| c.number == number).map(|c| c.handle)
    }

    /// Rebuild the pipe-index table for every claimed interface; IOKit
    /// numbers pipes 1..=N per interface, independent of endpoint number.
    fn refresh_endpoint_info(&self, inner: &mut Inner) -> Result<()> {
        let mut endpoints = HashMap::new();
        for claimed in &inner.claimed {
            let handle = claimed.handle;
            let mut num_endpoints: u8 = 0;
            unsafe {
                check_result((intf_vtbl(handle).GetNumEndpoints)(handle, &mut num_endpoints), "getting endpoint count")?;
            }
            for pipe_index in 1..=num_endpoints {
                let (mut direction, mut number, mut transfer_type, mut max_packet_size, mut interval) =
                    (0u8, 0u8, 0u8, 0u16, 0u8);
                unsafe {
                    check_result(
                        (intf_vtbl(handle).GetPipeProperties)(
                            handle,
                            pipe_index,
                            &mut direction,
                            &mut number,
                            &mut transfer_type,
                            &mut max_packet_size,
                            &mut interval,
                        ),
                        "getting endpoint properties",
                    )?;
                }
                let address = (direction << 7) | number;
                endpoints.insert(
                    address,
                    EndpointInfo {
                        handle,
                        pipe_index,
                        transfer_type: transfer_type_from_macos(transfer_type),
                    },
                );
            }
        }
        inner.endpoints = endpoints;
        Ok(())
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

        // A device discovered moments ago may still be settling; retry
        // USBDeviceOpenSeize until it stops reporting exclusive access,
        // as the original implementation does.
        let elapsed = inner.discovered_at.elapsed().as_secs_f64();
        let mut tries = (((1.0 - elapsed) / 0.09).max(1.0)) as u32;
        let handle = inner.device_handle;
        let mut result;
        loop {
            result = unsafe { (device_vtbl(handle).USBDeviceOpenSeize)(handle) };
            tries = tries.saturating_sub(1);
            if result != K_IO_RETURN_EXCLUSIVE_ACCESS || tries == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(90));
        }
        check_result(result, "opening device")?;

        inner.state.is_open = true;
        inner.claimed.clear();
        inner.endpoints.clear();

        let configuration_value = inner.state.configuration_value;
        let result = unsafe { (device_vtbl(handle).SetConfiguration)(handle, configuration_value) };
        check_result(result, "setting device configuration")
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.is_open {
            return;
        }
        for claimed in inner.claimed.drain(..) {
            unsafe {
                let _ = (intf_vtbl(claimed.handle).USBInterfaceClose)(claimed.handle);
                (intf_vtbl(claimed.handle).Release)(claimed.handle);
            }
            inner.state.set_claimed(claimed.number, false);
        }
        inner.endpoints.clear();
        inner.state.is_open = false;
        let handle = inner.device_handle;
        unsafe {
            (device_vtbl(handle).USBDeviceClose)(handle);
        }
    }

    fn claim_interface(&self, number: u8) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.check_is_open()?;
        inner.state.check_interface(number, false)?;

        let device_handle = inner.device_handle;
        let mut request = IOUSBFindInterfaceRequest {
            bInterfaceClass: K_IOUSB_FIND_INTERFACE_DONT_CARE,
            bInterfaceSubClass: K_IOUSB_FIND_INTERFACE_DONT_CARE,
            bInterfaceProtocol: K_IOUSB_FIND_INTERFACE_DONT_CARE,
            bAlternateSetting: K_IOUSB_FIND_INTERFACE_DONT_CARE,
        };
        let mut iterator: io_kit_sys::types::io_object_t = 0;
        let result =
            unsafe { (device_vtbl(device_handle).CreateInterfaceIterator)(device_handle, &mut request, &mut iterator) };
        check_result(result, "enumerating interfaces")?;

        let handle = unsafe { super::monitor::find_matching_interface(iterator, number) }
            .ok_or_else(|| Error::usb(format!("interface {number} not found in IOKit registry")))?;

        let result = unsafe { (intf_vtbl(handle).USBInterfaceOpenSeize)(handle) };
        if result != 0 {
            unsafe {
                (intf_vtbl(handle).Release)(handle);
            }
            return Err(Error::usb(format!("claiming interface {number}: IOReturn {result:#x}")));
        }

        inner.claimed.push(ClaimedInterface { number, handle });
        inner.state.set_claimed(number, true);
        self.refresh_endpoint_info(&mut inner)
    }

    fn release_interface(&self, number: u8) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.check_is_open()?;
        inner.state.check_interface(number, true)?;

        let Some(pos) = inner.claimed.iter().position(|c| c.number == number) else {
            return Err(Error::usb(format!("interface {number} is not claimed by this process")));
        };
        let claimed = inner.claimed.remove(pos);
        let result = unsafe { (intf_vtbl(claimed.handle).USBInterfaceClose)(claimed.handle) };
        unsafe {
            (intf_vtbl(claimed.handle).Release)(claimed.handle);
        }
        check_result(result, "releasing interface")?;

        inner.state.set_claimed(number, false);
        self.refresh_endpoint_info(&mut inner)
    }

    fn select_alternate(&self, interface_number: u8, alternate_number: u8) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.check_alternate(interface_number, alternate_number)?;

        let Some(handle) = self.find_interface_handle(&inner, interface_number) else {
            return Err(Error::usb(format!("interface {interface_number} is not claimed by this process")));
        };
        let result = unsafe { (intf_vtbl(handle).SetAlternateInterface)(handle, alternate_number) };
        check_result(result, "setting alternate interface")?;

        inner.state.set_current_alternate(interface_number, alternate_number);
        self.refresh_endpoint_info(&mut inner)
    }

    fn control_transfer_in(&self, transfer: ControlTransfer, length: u16) -> Result<Vec<u8>> {
        let handle = {
            let inner = self.inner.lock().unwrap();
            inner.state.check_control_transfer(&transfer)?;
            inner.device_handle
        };

        let mut buffer = vec![0u8; length as usize];
        let mut request = IOUSBDevRequest {
            bmRequestType: bm_request_type(&transfer, TransferDirection::In),
            bRequest: transfer.request,
            wValue: transfer.value,
            wIndex: transfer.index,
            wLength: length,
            pData: buffer.as_mut_ptr() as *mut c_void,
            wLenDone: 0,
        };
        let result = unsafe { (device_vtbl(handle).DeviceRequest)(handle, &mut request) };
        transfer_result(result, "control transfer IN")?;
        buffer.truncate(request.wLenDone as usize);
        Ok(buffer)
    }

    fn control_transfer_out(&self, transfer: ControlTransfer, data: Option<&[u8]>) -> Result<()> {
        let handle = {
            let inner = self.inner.lock().unwrap();
            inner.state.check_control_transfer(&transfer)?;
            inner.device_handle
        };

        let mut owned = data.map(|d| d.to_vec());
        let mut request = IOUSBDevRequest {
            bmRequestType: bm_request_type(&transfer, TransferDirection::Out),
            bRequest: transfer.request,
            wValue: transfer.value,
            wIndex: transfer.index,
            wLength: owned.as_ref().map_or(0, |d| d.len() as u16),
            pData: owned.as_mut().map_or(std::ptr::null_mut(), |d| d.as_mut_ptr() as *mut c_void),
            wLenDone: 0,
        };
        let result = unsafe { (device_vtbl(handle).DeviceRequest)(handle, &mut request) };
        transfer_result(result, "control transfer OUT")
    }

    fn transfer_in(&self, endpoint_number: u8, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let (info, max_packet_size) = {
            let inner = self.inner.lock().unwrap();
            inner.state.check_is_open()?;
            let (endpoint, _) = inner.state.check_transfer_endpoint(endpoint_number, TransferDirection::In)?;
            let address = Endpoint::get_address(endpoint_number, TransferDirection::In);
            let info = *inner
                .endpoints
                .get(&address)
                .ok_or_else(|| Error::usb(format!("endpoint {endpoint_number} has no active pipe")))?;
            (info, endpoint.max_packet_size)
        };

        let mut buffer = vec![0u8; max_packet_size as usize];
        let mut size = buffer.len() as u32;
        match (timeout, info.transfer_type) {
            (None, _) => {
                let result = unsafe {
                    (intf_vtbl(info.handle).ReadPipe)(info.handle, info.pipe_index, buffer.as_mut_ptr() as *mut c_void, &mut size)
                };
                transfer_result(result, &format!("transfer IN from endpoint {endpoint_number}"))?;
            }
            (Some(d), TransferType::Bulk) => {
                let ms = d.as_millis() as u32;
                let result = unsafe {
                    (intf_vtbl(info.handle).ReadPipeTO)(info.handle, info.pipe_index, buffer.as_mut_ptr() as *mut c_void, &mut size, ms, ms)
                };
                transfer_result(result, &format!("transfer IN from endpoint {endpoint_number}"))?;
            }
            (Some(d), _) => {
                // Interrupt pipes have no TO variant; bound the transfer
                // with a one-shot timer that aborts the pipe on expiry.
                let timer = InterruptTimeoutGuard::start(info.handle, info.pipe_index, d);
                let result = unsafe {
                    (intf_vtbl(info.handle).ReadPipe)(info.handle, info.pipe_index, buffer.as_mut_ptr() as *mut c_void, &mut size)
                };
                let timer_fired = timer.finish();
                if result == K_IO_RETURN_ABORTED && timer_fired {
                    return Err(Error::timeout(format!("transfer IN from endpoint {endpoint_number} timed out")));
                }
                transfer_result(result, &format!("transfer IN from endpoint {endpoint_number}"))?;
            }
        }
        buffer.truncate(size as usize);
        Ok(buffer)
    }

    fn transfer_out(&self, endpoint_number: u8, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        let info = {
            let inner = self.inner.lock().unwrap();
            inner.state.check_is_open()?;
            inner.state.check_transfer_endpoint(endpoint_number, TransferDirection::Out)?;
            let address = Endpoint::get_address(endpoint_number, TransferDirection::Out);
            *inner
                .endpoints
                .get(&address)
                .ok_or_else(|| Error::usb(format!("endpoint {endpoint_number} has no active pipe")))?
        };

        let mut owned = data.to_vec();
        match (timeout, info.transfer_type) {
            (None, _) => {
                let result = unsafe {
                    (intf_vtbl(info.handle).WritePipe)(info.handle, info.pipe_index, owned.as_mut_ptr() as *mut c_void, owned.len() as u32)
                };
                transfer_result(result, &format!("transfer OUT to endpoint {endpoint_number}"))
            }
            (Some(d), TransferType::Bulk) => {
                let ms = d.as_millis() as u32;
                let result = unsafe {
                    (intf_vtbl(info.handle).WritePipeTO)(info.handle, info.pipe_index, owned.as_mut_ptr() as *mut c_void, owned.len() as u32, ms, ms)
                };
                transfer_result(result, &format!("transfer OUT to endpoint {endpoint_number}"))
            }
            (Some(d), _) => {
                let timer = InterruptTimeoutGuard::start(info.handle, info.pipe_index, d);
                let result = unsafe {
                    (intf_vtbl(info.handle).WritePipe)(info.handle, info.pipe_index, owned.as_mut_ptr() as *mut c_void, owned.len() as u32)
                };
                let timer_fired = timer.finish();
                if result == K_IO_RETURN_ABORTED && timer_fired {
                    return Err(Error::timeout(format!("transfer OUT to endpoint {endpoint_number} timed out")));
                }
                transfer_result(result, &format!("transfer OUT to endpoint {endpoint_number}"))
            }
        }
    }

    fn clear_halt(&self, number: u8, direction: TransferDirection) -> Result<()> {
        let info = {
            let inner = self.inner.lock().unwrap();
            inner.state.check_is_open()?;
            inner
                .state
                .get_endpoint(number, direction)
                .ok_or_else(|| Error::usb(format!("device has no matching endpoint {number}")))?;
            let address = Endpoint::get_address(number, direction);
            *inner
                .endpoints
                .get(&address)
                .ok_or_else(|| Error::usb(format!("endpoint {number} has no active pipe")))?
        };
        let result = unsafe { (intf_vtbl(info.handle).ClearPipeStallBothEnds)(info.handle, info.pipe_index) };
        check_result(result, "clearing halt condition")
    }

    fn abort_transfers(&self, number: u8, direction: TransferDirection) -> Result<()> {
        let info = {
            let inner = self.inner.lock().unwrap();
            inner.state.check_is_open()?;
            inner
                .state
                .get_endpoint(number, direction)
                .ok_or_else(|| Error::usb(format!("device has no matching endpoint {number}")))?;
            let address = Endpoint::get_address(number, direction);
            *inner
                .endpoints
                .get(&address)
                .ok_or_else(|| Error::usb(format!("endpoint {number} has no active pipe")))?
        };
        let result = unsafe { (intf_vtbl(info.handle).AbortPipe)(info.handle, info.pipe_index) };
        check_result(result, "aborting endpoint transfers")
    }

    fn detach_standard_drivers(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.check_is_closed_and_connected()?;
        let handle = inner.device_handle;
        let result = unsafe { (device_vtbl(handle).USBDeviceReEnumerate)(handle, K_USB_REENUMERATE_CAPTURE_DEVICE_MASK) };
        check_result(result, "detaching standard drivers")
    }

    fn attach_standard_drivers(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.check_is_closed_and_connected()?;
        let handle = inner.device_handle;
        let result = unsafe { (device_vtbl(handle).USBDeviceReEnumerate)(handle, K_USB_REENUMERATE_RELEASE_DEVICE_MASK) };
        check_result(result, "attaching standard drivers")
    }

    fn mark_disconnected(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state.is_connected = false;
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        let handle = inner.device_handle;
        unsafe {
            (device_vtbl(handle).Release)(handle);
        }
    }
}
