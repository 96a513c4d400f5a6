//! Windows enumeration and hot-plug notification through a hidden
//! message-only window, grounded on `_windows/winregistry.py`'s
//! `WindowsDeviceRegistry`.
//!
//! `RegisterDeviceNotificationW`/`DEV_BROADCAST_DEVICEINTERFACE_W` are not
//! part of the win32metadata surface windows-sys generates from, so (as
//! with the macOS IOKit plug-in interfaces) the pieces this crate needs
//! are hand-declared here against `user32.dll`.

use std::collections::HashMap;
use std::ffi::c_void;

use windows_sys::core::GUID;
use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, HANDLE, HWND, LPARAM, LRESULT, WPARAM};
use windows_sys::Win32::Storage::FileSystem::{CreateFileW, FILE_SHARE_WRITE, OPEN_EXISTING};
use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;
use windows_sys::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DispatchMessageW, GetMessageW, GetWindowLongPtrW, RegisterClassExW,
    SetWindowLongPtrW, TranslateMessage, GWLP_USERDATA, MSG, WM_DEVICECHANGE, WNDCLASSEXW, WS_EX_LEFT,
};

use crate::registry::Registry;

use super::device::Device;
use super::deviceinfo::DeviceInfoSet;
use super::hubioctl::{self, GUID_DEVINTERFACE_USB_DEVICE, GUID_DEVINTERFACE_USB_HUB};

const GENERIC_WRITE: u32 = 0x4000_0000;
const HWND_MESSAGE: HWND = -3isize as HWND;
const DBT_DEVTYP_DEVICEINTERFACE: u32 = 5;
const DEVICE_NOTIFY_WINDOW_HANDLE: u32 = 0;
const DBT_DEVICEARRIVAL: usize = 0x8000;
const DBT_DEVICEREMOVECOMPLETE: usize = 0x8004;
const WINDOW_CLASS_NAME: &str = "usb_host USB_MONITOR";

#[repr(C)]
struct DevBroadcastDeviceInterfaceW {
    dbcc_size: u32,
    dbcc_devicetype: u32,
    dbcc_reserved: u32,
    dbcc_classguid: GUID,
    dbcc_name: [u16; 1],
}

const DBCC_NAME_OFFSET: usize = 4 + 4 + 4 + 16;

#[link(name = "user32")]
extern "system" {
    fn RegisterDeviceNotificationW(recipient: HANDLE, filter: *const c_void, flags: u32) -> HANDLE;
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn device_path_from_lparam(lparam: LPARAM) -> String {
    let ptr = (lparam as *const u8).wrapping_add(DBCC_NAME_OFFSET) as *const u16;
    let mut len = 0usize;
    while unsafe { *ptr.add(len) } != 0 {
        len += 1;
    }
    let slice = unsafe { std::slice::from_raw_parts(ptr, len) };
    String::from_utf16_lossy(slice)
}

extern "system" fn window_proc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    if msg == WM_DEVICECHANGE && (wparam == DBT_DEVICEARRIVAL || wparam == DBT_DEVICEREMOVECOMPLETE) {
        let registry_ptr = unsafe { GetWindowLongPtrW(hwnd, GWLP_USERDATA) } as *const Registry;
        if !registry_ptr.is_null() {
            let registry = unsafe { &*registry_ptr };
            let device_path = device_path_from_lparam(lparam);
            if wparam == DBT_DEVICEARRIVAL {
                on_device_connected(registry, &device_path);
            } else {
                registry.close_and_remove_device(&device_path.to_lowercase());
            }
        }
        return 0;
    }
    unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) }
}

fn open_hub_handle(hub_handles: &mut HashMap<String, HANDLE>, hub_path: &str) -> Option<HANDLE> {
    if let Some(&handle) = hub_handles.get(hub_path) {
        return Some(handle);
    }
    let wide = to_wide(hub_path);
    let handle = unsafe { CreateFileW(wide.as_ptr(), GENERIC_WRITE, FILE_SHARE_WRITE, std::ptr::null(), OPEN_EXISTING, 0, 0) };
    if handle == -1 {
        return None;
    }
    hub_handles.insert(hub_path.to_string(), handle);
    Some(handle)
}

fn build_device(
    device_path: String,
    is_composite: bool,
    hub_handle: HANDLE,
    port: u32,
) -> crate::error::Result<Device> {
    let info = hubioctl::node_connection_info(hub_handle, port)?;
    let config_desc = hubioctl::get_descriptor(hub_handle, port, 2, 0, 0)?;

    let device = Device::new(device_path, is_composite, info.device_descriptor, config_desc)?;
    let languages = hubioctl::get_languages(hub_handle, port);

    // String indices live at fixed offsets in every USB device descriptor.
    let manufacturer_index = device.raw_device_descriptor_byte(14);
    let product_index = device.raw_device_descriptor_byte(15);
    let serial_index = device.raw_device_descriptor_byte(16);

    let manufacturer = hubioctl::get_string_descriptor(hub_handle, port, manufacturer_index, &languages);
    let product = hubioctl::get_string_descriptor(hub_handle, port, product_index, &languages);
    let serial = hubioctl::get_string_descriptor(hub_handle, port, serial_index, &languages);
    device.set_identity(info.vid, info.pid, manufacturer, product, serial);
    Ok(device)
}

fn create_device_from_info(info: &DeviceInfoSet, device_path: &str, hub_handles: &mut HashMap<String, HANDLE>) -> crate::error::Result<Device> {
    let port = info.int_property(&super::deviceinfo::DEVPKEY_DEVICE_ADDRESS)?;
    let parent_instance = info.string_property(&super::deviceinfo::DEVPKEY_DEVICE_PARENT)?;
    let hub_path = DeviceInfoSet::device_path_for_instance(&parent_instance, &GUID_DEVINTERFACE_USB_HUB)?;

    let hub_handle = open_hub_handle(hub_handles, &hub_path)
        .ok_or_else(|| super::device_ioctl_error("internal error (opening hub device)"))?;
    build_device(device_path.to_string(), info.is_composite(), hub_handle, port)
}

fn on_device_connected(registry: &Registry, device_path: &str) {
    let mut hub_handles = HashMap::new();
    let result = DeviceInfoSet::of_path(device_path)
        .and_then(|info| create_device_from_info(&info, device_path, &mut hub_handles));
    match result {
        Ok(device) => registry.add_device(device),
        Err(err) => eprintln!("usb-host: failed to retrieve information about device {device_path} - ignoring device ({err})"),
    }
    for handle in hub_handles.into_values() {
        unsafe {
            CloseHandle(handle);
        }
    }
}

fn enumerate_present_devices() -> crate::error::Result<Vec<Device>> {
    let mut devices = Vec::new();
    let mut hub_handles = HashMap::new();
    let mut info = DeviceInfoSet::present(&GUID_DEVINTERFACE_USB_DEVICE)?;
    while info.next() {
        let instance_id = match info.string_property(&super::deviceinfo::DEVPKEY_DEVICE_INSTANCE_ID) {
            Ok(id) => id,
            Err(_) => continue,
        };
        let device_path = match DeviceInfoSet::device_path_for_instance(&instance_id, &GUID_DEVINTERFACE_USB_DEVICE) {
            Ok(path) => path,
            Err(_) => continue,
        };
        match create_device_from_info(&info, &device_path, &mut hub_handles) {
            Ok(device) => devices.push(device),
            Err(err) => eprintln!(
                "usb-host: failed to retrieve information about device with instance ID {instance_id} - ignoring device ({err})"
            ),
        }
    }
    for handle in hub_handles.into_values() {
        unsafe {
            CloseHandle(handle);
        }
    }
    Ok(devices)
}

/// Entry point run on the registry's background monitor thread.
pub(crate) fn run(registry: Registry) -> ! {
    unsafe {
        let instance = GetModuleHandleW(std::ptr::null());
        let class_name = to_wide(WINDOW_CLASS_NAME);

        let mut wx: WNDCLASSEXW = std::mem::zeroed();
        wx.cbSize = std::mem::size_of::<WNDCLASSEXW>() as u32;
        wx.lpfnWndProc = Some(window_proc);
        wx.hInstance = instance;
        wx.lpszClassName = class_name.as_ptr();

        if RegisterClassExW(&wx) == 0 {
            registry.notify_enumeration_failed(format!("internal error (RegisterClassExW, Windows error {})", GetLastError()));
            loop {
                std::thread::park();
            }
        }

        let title = to_wide("usb-host device monitor");
        let hwnd = CreateWindowExW(
            WS_EX_LEFT,
            class_name.as_ptr(),
            title.as_ptr(),
            0,
            0,
            0,
            0,
            0,
            HWND_MESSAGE,
            0,
            instance,
            std::ptr::null(),
        );
        if hwnd == 0 {
            registry.notify_enumeration_failed(format!("internal error (CreateWindowExW, Windows error {})", GetLastError()));
            loop {
                std::thread::park();
            }
        }

        let registry_box: &'static Registry = Box::leak(Box::new(registry.clone()));
        SetWindowLongPtrW(hwnd, GWLP_USERDATA, registry_box as *const Registry as isize);

        let mut filter: DevBroadcastDeviceInterfaceW = std::mem::zeroed();
        filter.dbcc_size = std::mem::size_of::<DevBroadcastDeviceInterfaceW>() as u32;
        filter.dbcc_devicetype = DBT_DEVTYP_DEVICEINTERFACE;
        filter.dbcc_classguid = GUID_DEVINTERFACE_USB_DEVICE;
        if RegisterDeviceNotificationW(hwnd, &filter as *const _ as *const c_void, DEVICE_NOTIFY_WINDOW_HANDLE) == 0 {
            registry.notify_enumeration_failed(format!(
                "internal error (RegisterDeviceNotificationW, Windows error {})",
                GetLastError()
            ));
            loop {
                std::thread::park();
            }
        }

        match enumerate_present_devices() {
            Ok(devices) => registry.notify_enumeration_complete(devices),
            Err(err) => {
                registry.notify_enumeration_failed(err.to_string());
                loop {
                    std::thread::park();
                }
            }
        }

        let mut msg: MSG = std::mem::zeroed();
        loop {
            let result = GetMessageW(&mut msg, 0, 0, 0);
            if result <= 0 {
                break;
            }
            TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }

        registry.notify_enumeration_failed("Windows USB monitor message loop exited unexpectedly".to_string());
        loop {
            std::thread::park();
        }
    }
}
