//! A thin wrapper around the SetupAPI device information set, grounded on
//! `_windows/deviceinfoset.py`'s `DeviceInfoSet`.

use windows_sys::core::GUID;
use windows_sys::Win32::Devices::DeviceAndDriverInstallation::{
    SetupDiCreateDeviceInfoList, SetupDiDestroyDeviceInfoList, SetupDiEnumDeviceInfo, SetupDiEnumDeviceInterfaces,
    SetupDiGetClassDevsW, SetupDiGetDeviceInterfaceDetailW, SetupDiGetDevicePropertyW, SetupDiOpenDevRegKey,
    SetupDiOpenDeviceInfoW, SetupDiOpenDeviceInterfaceW, DICS_FLAG_GLOBAL, DIGCF_DEVICEINTERFACE, DIGCF_PRESENT,
    DIREG_DEV, HDEVINFO, SP_DEVICE_INTERFACE_DATA, SP_DEVICE_INTERFACE_DETAIL_DATA_W, SP_DEVINFO_DATA,
};
use windows_sys::Win32::Devices::Properties::{
    DEVPKEY_Device_Address, DEVPKEY_Device_InstanceId, DEVPKEY_Device_Parent, DEVPKEY_Device_Service, DEVPROPKEY,
    DEVPROPTYPE, DEVPROP_TYPEMOD_LIST, DEVPROP_TYPE_STRING, DEVPROP_TYPE_UINT32,
};

pub(crate) const DEVPKEY_DEVICE_ADDRESS: DEVPROPKEY = DEVPKEY_Device_Address;
pub(crate) const DEVPKEY_DEVICE_PARENT: DEVPROPKEY = DEVPKEY_Device_Parent;
pub(crate) const DEVPKEY_DEVICE_INSTANCE_ID: DEVPROPKEY = DEVPKEY_Device_InstanceId;
use windows_sys::Win32::Foundation::{
    GetLastError, ERROR_INSUFFICIENT_BUFFER, ERROR_NOT_FOUND, ERROR_NO_MORE_ITEMS, ERROR_SUCCESS,
};
use windows_sys::Win32::System::Com::CLSIDFromString;
use windows_sys::Win32::System::Registry::{RegCloseKey, RegQueryValueExW, HKEY, KEY_READ, REG_MULTI_SZ};

use crate::error::{Error, Result};

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn from_wide(s: &[u16]) -> String {
    let end = s.iter().position(|&c| c == 0).unwrap_or(s.len());
    String::from_utf16_lossy(&s[..end])
}

fn last_error_err(context: &str) -> Error {
    Error::usb(format!("{context} (Windows error {})", unsafe { GetLastError() }))
}

/// Owns a SetupAPI `HDEVINFO` handle and, optionally, a selected device
/// interface within it.
pub(crate) struct DeviceInfoSet {
    handle: HDEVINFO,
    info_data: SP_DEVINFO_DATA,
    intf_data: Option<SP_DEVICE_INTERFACE_DATA>,
    iteration_index: u32,
}

impl DeviceInfoSet {
    fn wrap(handle: HDEVINFO) -> Result<Self> {
        if handle.is_null() || handle as isize == -1 {
            return Err(last_error_err("internal error (creating device info set)"));
        }
        let mut info_data: SP_DEVINFO_DATA = unsafe { std::mem::zeroed() };
        info_data.cbSize = std::mem::size_of::<SP_DEVINFO_DATA>() as u32;
        Ok(DeviceInfoSet { handle, info_data, intf_data: None, iteration_index: 0 })
    }

    /// All currently-present devices exposing `interface_guid`.
    pub(crate) fn present(interface_guid: &GUID) -> Result<Self> {
        let handle =
            unsafe { SetupDiGetClassDevsW(interface_guid, std::ptr::null(), 0, DIGCF_PRESENT | DIGCF_DEVICEINTERFACE) };
        Self::wrap(handle)
    }

    /// Populated from a known device interface path.
    pub(crate) fn of_path(device_path: &str) -> Result<Self> {
        let mut set = Self::wrap(unsafe { SetupDiCreateDeviceInfoList(std::ptr::null(), 0) })?;
        let wide_path = to_wide(device_path);
        let mut intf_data: SP_DEVICE_INTERFACE_DATA = unsafe { std::mem::zeroed() };
        intf_data.cbSize = std::mem::size_of::<SP_DEVICE_INTERFACE_DATA>() as u32;
        if unsafe { SetupDiOpenDeviceInterfaceW(set.handle, wide_path.as_ptr(), 0, &mut intf_data) } == 0 {
            return Err(last_error_err("internal error (SetupDiOpenDeviceInterfaceW)"));
        }
        set.intf_data = Some(intf_data);

        let ok = unsafe {
            SetupDiGetDeviceInterfaceDetailW(set.handle, &intf_data, std::ptr::null_mut(), 0, std::ptr::null_mut(), &mut set.info_data)
        };
        if ok == 0 && unsafe { GetLastError() } != ERROR_INSUFFICIENT_BUFFER {
            return Err(last_error_err("internal error (SetupDiGetDeviceInterfaceDetailW)"));
        }
        Ok(set)
    }

    /// Populated from a device instance ID (no device interface selected).
    pub(crate) fn of_instance(instance_id: &str) -> Result<Self> {
        let mut set = Self::wrap(unsafe { SetupDiCreateDeviceInfoList(std::ptr::null(), 0) })?;
        let wide_id = to_wide(instance_id);
        if unsafe { SetupDiOpenDeviceInfoW(set.handle, wide_id.as_ptr(), 0, 0, &mut set.info_data) } == 0 {
            return Err(last_error_err("internal error (SetupDiOpenDeviceInfoW)"));
        }
        Ok(set)
    }

    /// Advance to the next element of a `present()` set.
    pub(crate) fn next(&mut self) -> bool {
        let index = self.iteration_index;
        self.iteration_index += 1;
        unsafe { SetupDiEnumDeviceInfo(self.handle, index, &mut self.info_data) != 0 }
    }

    /// The device interface path of the current element for `interface_guid`.
    pub(crate) fn device_interface_path(&mut self, interface_guid: &GUID) -> Result<String> {
        let mut intf_data: SP_DEVICE_INTERFACE_DATA = unsafe { std::mem::zeroed() };
        intf_data.cbSize = std::mem::size_of::<SP_DEVICE_INTERFACE_DATA>() as u32;
        if unsafe { SetupDiEnumDeviceInterfaces(self.handle, std::ptr::null(), interface_guid, 0, &mut intf_data) } == 0 {
            return Err(last_error_err("internal error (SetupDiEnumDeviceInterfaces)"));
        }
        self.intf_data = Some(intf_data);

        // `SP_DEVICE_INTERFACE_DETAIL_DATA_W` has a flexible-array tail; the
        // bindings model it with a single trailing `u16`, so the buffer is
        // hand-sized here and `cbSize` is hardcoded to 8 regardless of
        // pointer width, matching what Windows expects for this struct.
        const MAX_PATH_CHARS: usize = 260;
        let buf_size = 4 + MAX_PATH_CHARS * 2;
        let mut buffer = vec![0u8; buf_size];
        buffer[0..4].copy_from_slice(&8u32.to_ne_bytes());
        let detail_ptr = buffer.as_mut_ptr() as *mut SP_DEVICE_INTERFACE_DETAIL_DATA_W;
        if unsafe {
            SetupDiGetDeviceInterfaceDetailW(self.handle, &intf_data, detail_ptr, buf_size as u32, std::ptr::null_mut(), std::ptr::null_mut())
        } == 0
        {
            return Err(last_error_err("internal error (SetupDiGetDeviceInterfaceDetailW)"));
        }
        let path_ptr = unsafe { buffer.as_ptr().add(4) } as *const u16;
        let mut len = 0;
        while len < MAX_PATH_CHARS && unsafe { *path_ptr.add(len) } != 0 {
            len += 1;
        }
        let wide = unsafe { std::slice::from_raw_parts(path_ptr, len) };
        Ok(String::from_utf16_lossy(wide))
    }

    /// The device interface path for `instance_id` exposing `interface_guid`.
    pub(crate) fn device_path_for_instance(instance_id: &str, interface_guid: &GUID) -> Result<String> {
        let wide_id = to_wide(instance_id);
        let handle =
            unsafe { SetupDiGetClassDevsW(interface_guid, wide_id.as_ptr(), 0, DIGCF_PRESENT | DIGCF_DEVICEINTERFACE) };
        let mut set = Self::wrap(handle)?;
        set.device_interface_path(interface_guid)
    }

    fn variable_length_property(&self, key: &DEVPROPKEY, expected_type: DEVPROPTYPE) -> Result<Option<Vec<u8>>> {
        let mut actual_type: DEVPROPTYPE = 0;
        let mut required_size: u32 = 0;
        let ok = unsafe {
            SetupDiGetDevicePropertyW(
                self.handle,
                &self.info_data,
                key,
                &mut actual_type,
                std::ptr::null_mut(),
                0,
                &mut required_size,
                0,
            )
        };
        if ok == 0 {
            let err = unsafe { GetLastError() };
            if err == ERROR_NOT_FOUND {
                return Ok(None);
            }
            if err != ERROR_INSUFFICIENT_BUFFER {
                return Err(last_error_err("internal error (SetupDiGetDevicePropertyW)"));
            }
        }
        if actual_type != expected_type {
            return Err(Error::usb("internal error (unexpected device property type)"));
        }

        let mut buffer = vec![0u8; required_size as usize];
        if unsafe {
            SetupDiGetDevicePropertyW(
                self.handle,
                &self.info_data,
                key,
                &mut actual_type,
                buffer.as_mut_ptr(),
                required_size,
                std::ptr::null_mut(),
                0,
            )
        } == 0
        {
            return Err(last_error_err("internal error (SetupDiGetDevicePropertyW)"));
        }
        Ok(Some(buffer))
    }

    pub(crate) fn string_property(&self, key: &DEVPROPKEY) -> Result<String> {
        let bytes = self
            .variable_length_property(key, DEVPROP_TYPE_STRING)?
            .ok_or_else(|| Error::usb("internal error (missing device property)"))?;
        let wide: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_ne_bytes([c[0], c[1]])).collect();
        Ok(from_wide(&wide))
    }

    pub(crate) fn string_list_property(&self, key: &DEVPROPKEY) -> Result<Option<Vec<String>>> {
        let Some(bytes) = self.variable_length_property(key, DEVPROP_TYPE_STRING | DEVPROP_TYPEMOD_LIST)? else {
            return Ok(None);
        };
        let wide: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_ne_bytes([c[0], c[1]])).collect();
        Ok(Some(multi_sz_to_strings(&wide)))
    }

    pub(crate) fn int_property(&self, key: &DEVPROPKEY) -> Result<u32> {
        let bytes = self
            .variable_length_property(key, DEVPROP_TYPE_UINT32)?
            .ok_or_else(|| Error::usb("internal error (missing device property)"))?;
        Ok(u32::from_ne_bytes(bytes[..4].try_into().unwrap()))
    }

    pub(crate) fn is_composite(&self) -> bool {
        self.string_property(&DEVPKEY_Device_Service)
            .map(|s| s.eq_ignore_ascii_case("usbccgp"))
            .unwrap_or(false)
    }

    /// Device-interface GUID strings registered for this device's driver
    /// key (the `DeviceInterfaceGUIDs` multi-string registry value).
    pub(crate) fn device_interface_guids(&self) -> Vec<GUID> {
        let key = unsafe { SetupDiOpenDevRegKey(self.handle, &self.info_data, DICS_FLAG_GLOBAL, 0, DIREG_DEV, KEY_READ) };
        if key == 0 || key == -1 {
            return Vec::new();
        }
        let guids = read_multi_sz_value(key, "DeviceInterfaceGUIDs")
            .unwrap_or_default()
            .iter()
            .filter_map(|s| parse_clsid(s))
            .collect();
        unsafe {
            RegCloseKey(key);
        }
        guids
    }

    /// The device interface path for `instance_id`, discovered by parsing
    /// the child device's own registered interface GUIDs (used when the
    /// caller does not already know which interface class the child
    /// exposes).
    pub(crate) fn device_path_by_guid(instance_id: &str) -> Option<String> {
        let set = Self::of_instance(instance_id).ok()?;
        for guid in set.device_interface_guids() {
            if let Ok(path) = Self::device_path_for_instance(instance_id, &guid) {
                return Some(path);
            }
        }
        None
    }
}

impl Drop for DeviceInfoSet {
    fn drop(&mut self) {
        unsafe {
            SetupDiDestroyDeviceInfoList(self.handle);
        }
    }
}

fn multi_sz_to_strings(wide: &[u16]) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0;
    for i in 0..wide.len() {
        if wide[i] == 0 {
            if i > start {
                out.push(from_wide(&wide[start..i]));
            }
            start = i + 1;
        }
    }
    out
}

fn read_multi_sz_value(key: HKEY, name: &str) -> Option<Vec<String>> {
    let wide_name = to_wide(name);
    let mut value_type: u32 = 0;
    let mut size: u32 = 0;
    let status =
        unsafe { RegQueryValueExW(key, wide_name.as_ptr(), std::ptr::null_mut(), &mut value_type, std::ptr::null_mut(), &mut size) };
    if status != ERROR_SUCCESS || value_type != REG_MULTI_SZ || size == 0 {
        return None;
    }
    let mut buffer = vec![0u16; size as usize / 2];
    let status = unsafe {
        RegQueryValueExW(
            key,
            wide_name.as_ptr(),
            std::ptr::null_mut(),
            &mut value_type,
            buffer.as_mut_ptr() as *mut u8,
            &mut size,
        )
    };
    if status != ERROR_SUCCESS {
        return None;
    }
    Some(multi_sz_to_strings(&buffer))
}

fn parse_clsid(guid_str: &str) -> Option<GUID> {
    let wide = to_wide(guid_str);
    let mut guid: GUID = unsafe { std::mem::zeroed() };
    let hr = unsafe { CLSIDFromString(wide.as_ptr(), &mut guid) };
    if hr < 0 {
        None
    } else {
        Some(guid)
    }
}
