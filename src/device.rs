//! The common device contract (`spec.md` §4.4).
//!
//! Every platform provides exactly one concrete `Device` type, selected at
//! compile time by [`crate::platform`] — there is no trait object or
//! runtime type test involved in dispatch. This trait exists purely so the
//! contract is documented and checked once, in one place, rather than
//! three times.

use crate::error::Result;
use crate::model::{Configuration, Endpoint, Interface, TransferDirection};

/// Operations every platform's `Device` implements.
///
/// All operations fail with [`crate::Error::NotConnected`] once the
/// device has been physically disconnected, regardless of their other
/// preconditions.
pub trait UsbDevice {
    /// Opaque, platform-derived identifier. Stable for the device's
    /// connected lifetime; see `spec.md` §3.
    fn identifier(&self) -> String;

    fn vid(&self) -> u16;
    fn pid(&self) -> u16;
    fn manufacturer(&self) -> Option<String>;
    fn product(&self) -> Option<String>;
    fn serial(&self) -> Option<String>;
    fn is_connected(&self) -> bool;
    fn is_open(&self) -> bool;
    fn configuration(&self) -> Configuration;
    fn get_interface(&self, number: u8) -> Option<Interface>;
    fn get_endpoint(&self, number: u8, direction: TransferDirection) -> Option<Endpoint>;

    /// Open the device for communication. Requires closed + connected.
    fn open(&self) -> Result<()>;
    /// Close the device. Idempotent; releases all claimed interfaces.
    fn close(&self);

    /// Claim an interface for exclusive use.
    fn claim_interface(&self, number: u8) -> Result<()>;
    /// Release a previously claimed interface.
    fn release_interface(&self, number: u8) -> Result<()>;
    /// Select an alternate setting on a claimed interface.
    fn select_alternate(&self, interface_number: u8, alternate_number: u8) -> Result<()>;

    /// Control transfer with a Data-In stage; returns up to `length` bytes.
    fn control_transfer_in(
        &self,
        transfer: crate::model::ControlTransfer,
        length: u16,
    ) -> Result<Vec<u8>>;
    /// Control transfer with no data stage or a Data-Out stage.
    fn control_transfer_out(
        &self,
        transfer: crate::model::ControlTransfer,
        data: Option<&[u8]>,
    ) -> Result<()>;

    /// Receive one transfer's payload from a BULK/INTERRUPT IN endpoint.
    /// May return an empty vector (a zero-length packet).
    fn transfer_in(&self, endpoint_number: u8, timeout: Option<std::time::Duration>) -> Result<Vec<u8>>;
    /// Send data to a BULK/INTERRUPT OUT endpoint.
    fn transfer_out(
        &self,
        endpoint_number: u8,
        data: &[u8],
        timeout: Option<std::time::Duration>,
    ) -> Result<()>;

    /// Clear a device-side halt/stall condition.
    fn clear_halt(&self, number: u8, direction: TransferDirection) -> Result<()>;
    /// Unblock any in-flight or pending transfers on an endpoint.
    fn abort_transfers(&self, number: u8, direction: TransferDirection) -> Result<()>;

    /// Detach the operating system's standard drivers (HID/CDC/MSC, etc.)
    /// so the application can claim the device's interfaces itself.
    fn detach_standard_drivers(&self) -> Result<()>;
    /// Reverse [`UsbDevice::detach_standard_drivers`].
    fn attach_standard_drivers(&self) -> Result<()>;

    /// Mark the device as physically disconnected. Called only by the
    /// registry, once per device, when the platform monitor reports
    /// removal; every subsequent operation then fails with
    /// [`crate::Error::NotConnected`].
    fn mark_disconnected(&self);
}
