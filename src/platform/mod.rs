//! Compile-time platform selection (`spec.md` §6, design note 9).
//!
//! Exactly one of these modules is compiled in, chosen by `#[cfg(target_os)]`
//! — there is no runtime dynamic dispatch between drivers. Each platform
//! module exports a concrete `Device` type implementing [`crate::device::UsbDevice`]
//! and a `monitor` submodule with a `run(Registry) -> !`-shaped entry point
//! that the registry spawns its background thread with.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::Device;
#[cfg(target_os = "linux")]
pub use linux::monitor;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use macos::Device;
#[cfg(target_os = "macos")]
pub use macos::monitor;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use windows::Device;
#[cfg(target_os = "windows")]
pub use windows::monitor;

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
compile_error!("usb-host supports Linux, macOS and Windows only");
