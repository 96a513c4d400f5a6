//! Windows backend: WinUSB transfers, SetupAPI enumeration, `WM_DEVICECHANGE`
//! hot-plug.

mod device;
mod deviceinfo;
mod hubioctl;
pub(crate) mod monitor;

pub use device::Device;

use windows_sys::Win32::Foundation::GetLastError;

use crate::error::Error;

fn device_ioctl_error(context: &str) -> Error {
    Error::usb(format!("{context} (Windows error {})", unsafe { GetLastError() }))
}
