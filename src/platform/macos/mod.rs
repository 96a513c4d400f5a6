//! macOS backend: IOKit device/interface plug-in interfaces.

mod device;
pub(crate) mod monitor;

pub use device::Device;
