//! Cross-platform user-space USB host library.
//!
//! `usb-host` enumerates connected USB devices, watches for hot-plug
//! events, and drives control/bulk/interrupt transfers, without any
//! kernel-mode driver of its own — it talks to each operating system's
//! existing USB stack (`usbfs` on Linux, IOKit on macOS, WinUSB on
//! Windows).
//!
//! ```no_run
//! use usb_host::{Registry, UsbDevice};
//!
//! let registry = Registry::global();
//! let devices = registry.get_devices()?;
//! for device in &devices {
//!     println!("{:04x}:{:04x} {:?}", device.vid(), device.pid(), device.product());
//! }
//! # Ok::<(), usb_host::Error>(())
//! ```
//!
//! A single [`UsbDevice`] trait is implemented by exactly one concrete
//! type per platform, selected at compile time by [`platform`] — callers
//! never see a trait object or branch on the host OS themselves.

mod common;
mod descriptor;
mod device;
mod error;
mod model;
mod platform;
mod registry;

pub use device::UsbDevice;
pub use error::{Error, Result};
pub use model::{
    AlternateInterface, CompositeFunction, Configuration, ControlTransfer, Endpoint, Interface, Recipient,
    RequestType, TransferDirection, TransferType, Version,
};
pub use platform::Device;
pub use registry::{DeviceFilter, Registry};
