//! Linux backend: `usbfs` transfers, sysfs enumeration, netlink hot-plug.

mod device;
mod dispatcher;
mod ioctl;
pub(crate) mod monitor;
mod usbdevfs;

pub use device::Device;
