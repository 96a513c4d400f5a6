//! The USB hub node IOCTLs used to read descriptors directly from a
//! device's parent hub, grounded on `_windows/kernel32.py` and
//! `_windows/winregistry.py`'s `get_descriptor`.
//!
//! These structures and IOCTL codes come from the Windows Driver Kit's
//! `usbioctl.h`, which windows-sys does not expose (it is not part of the
//! win32metadata surface), so they are hand-declared here the same way
//! the macOS backend hand-declares its IOKit plug-in interfaces.

use windows_sys::core::GUID;
use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::System::IO::DeviceIoControl;

use crate::error::{Error, Result};

pub(crate) const GUID_DEVINTERFACE_USB_DEVICE: GUID =
    GUID::from_u128(0xa5dcbf10_6530_11d2_901f_00c04fb951ed);
pub(crate) const GUID_DEVINTERFACE_USB_HUB: GUID = GUID::from_u128(0xf18a0e88_c30c_11d0_8815_00a0c906bed8);

const IOCTL_USB_GET_NODE_CONNECTION_INFORMATION_EX: u32 = 0x0022_0448;
const IOCTL_USB_GET_DESCRIPTOR_FROM_NODE_CONNECTION: u32 = 0x0022_0410;

#[repr(C)]
#[derive(Clone, Copy)]
struct UsbDeviceDescriptor {
    length: u8,
    descriptor_type: u8,
    bcd_usb: u16,
    device_class: u8,
    device_subclass: u8,
    device_protocol: u8,
    max_packet_size0: u8,
    id_vendor: u16,
    id_product: u16,
    bcd_device: u16,
    i_manufacturer: u8,
    i_product: u8,
    i_serial_number: u8,
    num_configurations: u8,
}

#[repr(C)]
struct UsbNodeConnectionInformationEx {
    connection_index: u32,
    device_descriptor: UsbDeviceDescriptor,
    current_configuration_value: u8,
    speed: u8,
    device_is_hub: u8,
    device_address: u16,
    number_of_open_pipes: u32,
    connection_status: u32,
}

/// Device descriptor bytes and vid/pid as read through
/// `IOCTL_USB_GET_NODE_CONNECTION_INFORMATION_EX`.
pub(crate) struct NodeConnectionInfo {
    pub device_descriptor: Vec<u8>,
    pub vid: u16,
    pub pid: u16,
}

pub(crate) fn node_connection_info(hub_handle: HANDLE, port: u32) -> Result<NodeConnectionInfo> {
    let mut info = UsbNodeConnectionInformationEx {
        connection_index: port,
        device_descriptor: unsafe { std::mem::zeroed() },
        current_configuration_value: 0,
        speed: 0,
        device_is_hub: 0,
        device_address: 0,
        number_of_open_pipes: 0,
        connection_status: 0,
    };
    let size = std::mem::size_of::<UsbNodeConnectionInformationEx>() as u32;
    let mut returned: u32 = 0;
    let ok = unsafe {
        DeviceIoControl(
            hub_handle,
            IOCTL_USB_GET_NODE_CONNECTION_INFORMATION_EX,
            &mut info as *mut _ as *mut core::ffi::c_void,
            size,
            &mut info as *mut _ as *mut core::ffi::c_void,
            size,
            &mut returned,
            std::ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(super::device_ioctl_error("getting device descriptor failed"));
    }

    let desc = info.device_descriptor;
    let device_descriptor = vec![
        desc.length,
        desc.descriptor_type,
        desc.bcd_usb as u8,
        (desc.bcd_usb >> 8) as u8,
        desc.device_class,
        desc.device_subclass,
        desc.device_protocol,
        desc.max_packet_size0,
        desc.id_vendor as u8,
        (desc.id_vendor >> 8) as u8,
        desc.id_product as u8,
        (desc.id_product >> 8) as u8,
        desc.bcd_device as u8,
        (desc.bcd_device >> 8) as u8,
        desc.i_manufacturer,
        desc.i_product,
        desc.i_serial_number,
        desc.num_configurations,
    ];

    Ok(NodeConnectionInfo { device_descriptor, vid: desc.id_vendor, pid: desc.id_product })
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct SetupPacket {
    bm_request: u8,
    b_request: u8,
    w_value: u16,
    w_index: u16,
    w_length: u16,
}

/// Fetch a standard descriptor (device/configuration/string) from the
/// given downstream port of a hub, growing the request buffer if the
/// descriptor turns out larger than first guessed (a configuration
/// descriptor's true length is only known after its first two bytes
/// are read).
pub(crate) fn get_descriptor(
    hub_handle: HANDLE,
    port: u32,
    descriptor_type: u8,
    index: u8,
    language_id: u16,
) -> Result<Vec<u8>> {
    get_descriptor_sized(hub_handle, port, descriptor_type, index, language_id, 0)
}

fn get_descriptor_sized(
    hub_handle: HANDLE,
    port: u32,
    descriptor_type: u8,
    index: u8,
    language_id: u16,
    descriptor_size: usize,
) -> Result<Vec<u8>> {
    const HEADER_SIZE: usize = std::mem::size_of::<u32>() + std::mem::size_of::<SetupPacket>();
    let initial_descriptor_size = if descriptor_size != 0 { descriptor_size } else { 256 };
    let buf_size = HEADER_SIZE + initial_descriptor_size;

    let mut buffer = vec![0u8; buf_size];
    buffer[0..4].copy_from_slice(&(port as u32).to_ne_bytes());
    let setup = SetupPacket {
        bm_request: 0x80,
        b_request: 6,
        w_value: ((descriptor_type as u16) << 8) | index as u16,
        w_index: language_id,
        w_length: initial_descriptor_size as u16,
    };
    unsafe {
        std::ptr::copy_nonoverlapping(
            &setup as *const SetupPacket as *const u8,
            buffer.as_mut_ptr().add(4),
            std::mem::size_of::<SetupPacket>(),
        );
    }

    let mut returned: u32 = 0;
    let ok = unsafe {
        DeviceIoControl(
            hub_handle,
            IOCTL_USB_GET_DESCRIPTOR_FROM_NODE_CONNECTION,
            buffer.as_mut_ptr() as *mut core::ffi::c_void,
            buf_size as u32,
            buffer.as_mut_ptr() as *mut core::ffi::c_void,
            buf_size as u32,
            &mut returned,
            std::ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(super::device_ioctl_error(&format!("retrieving descriptor {index} failed")));
    }

    let data = &buffer[HEADER_SIZE..];
    let expected_size = if descriptor_type == 2 {
        data[2] as usize + 256 * data[3] as usize
    } else {
        data[0] as usize
    };

    if returned as usize - HEADER_SIZE != expected_size {
        if descriptor_size != 0 {
            return Err(Error::usb("internal error (unexpected descriptor size)"));
        }
        return get_descriptor_sized(hub_handle, port, descriptor_type, index, language_id, expected_size);
    }

    Ok(data[..expected_size].to_vec())
}

/// Supported language IDs, from the device's string descriptor zero.
/// Falls back to US English if it cannot be read.
pub(crate) fn get_languages(hub_handle: HANDLE, port: u32) -> Vec<u16> {
    match get_descriptor(hub_handle, port, 3, 0, 0) {
        Ok(langs) if langs.len() >= 2 => langs[2..].chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect(),
        _ => vec![0x0409],
    }
}

pub(crate) fn get_string_descriptor(hub_handle: HANDLE, port: u32, index: u8, languages: &[u16]) -> Option<String> {
    if index == 0 {
        return None;
    }
    for &lang in languages {
        if let Ok(desc) = get_descriptor(hub_handle, port, 3, index, lang) {
            if desc.len() < 2 {
                continue;
            }
            let byte_end = (desc.len() - 2) / 2 * 2 + 2;
            let wide: Vec<u16> = desc[2..byte_end].chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
            return Some(String::from_utf16_lossy(&wide));
        }
    }
    None
}
