//! Shared device state and validation shared by every platform driver.
//!
//! Each platform's `Device` wraps one [`DeviceState`] behind a mutex (the
//! "device-local mutex" of `spec.md` §4.4/§5) together with its own
//! platform handles. The checks here mirror `_common/devicebase.py`'s
//! `DeviceBase` so that all three drivers reject the same malformed calls
//! with the same messages.

use crate::descriptor::{self, DeviceDescriptorFields};
use crate::error::{Error, Result};
use crate::model::{
    Configuration, ControlTransfer, Endpoint, Interface, Recipient, TransferDirection, TransferType,
    Version,
};

/// Descriptive and live state common to every platform's device object.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub identifier: String,
    pub vid: u16,
    pub pid: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub device_descriptor: Vec<u8>,
    pub configuration_descriptor: Vec<u8>,
    pub class_code: u8,
    pub subclass_code: u8,
    pub protocol_code: u8,
    pub device_version: Version,
    pub usb_version: Version,
    pub max_packet_size: u8,
    pub is_connected: bool,
    pub is_open: bool,
    pub configuration_value: u8,
    pub configuration: Configuration,
}

impl DeviceState {
    /// Build the state from a device descriptor and a configuration
    /// descriptor, exactly as every platform monitor does at discovery
    /// time (`set_descriptors` in the original implementation).
    pub fn from_descriptors(
        identifier: String,
        device_descriptor: Vec<u8>,
        configuration_descriptor: Vec<u8>,
    ) -> Result<Self> {
        let DeviceDescriptorFields {
            usb_version,
            class_code,
            subclass_code,
            protocol_code,
            max_packet_size0,
            device_version,
        } = descriptor::parse_device_descriptor(&device_descriptor)?;

        let configuration = descriptor::parse_configuration(&configuration_descriptor)?;
        let configuration_value = configuration.configuration_value;

        Ok(DeviceState {
            identifier,
            vid: 0,
            pid: 0,
            manufacturer: None,
            product: None,
            serial: None,
            device_descriptor,
            configuration_descriptor,
            class_code,
            subclass_code,
            protocol_code,
            device_version: Version(device_version),
            usb_version: Version(usb_version),
            max_packet_size: max_packet_size0,
            is_connected: true,
            is_open: false,
            configuration_value,
            configuration,
        })
    }

    pub fn get_interface(&self, number: u8) -> Option<&Interface> {
        self.configuration.get_interface(number)
    }

    /// Find the endpoint (of the currently active alternate setting) with
    /// the given number and direction, together with its owning interface.
    pub fn get_endpoint_and_interface(
        &self,
        number: u8,
        direction: TransferDirection,
    ) -> Option<(&Endpoint, &Interface)> {
        for intf in &self.configuration.interfaces {
            for ep in &intf.current_alternate().endpoints {
                if ep.number == number && ep.direction == direction {
                    return Some((ep, intf));
                }
            }
        }
        None
    }

    pub fn get_endpoint(&self, number: u8, direction: TransferDirection) -> Option<&Endpoint> {
        self.get_endpoint_and_interface(number, direction).map(|(ep, _)| ep)
    }

    pub fn check_is_open(&self) -> Result<()> {
        if !self.is_connected {
            return Err(Error::NotConnected);
        }
        if !self.is_open {
            return Err(Error::usb("device must be opened first"));
        }
        Ok(())
    }

    pub fn check_is_closed_and_connected(&self) -> Result<()> {
        if self.is_open {
            return Err(Error::usb("device cannot be open for this operation"));
        }
        if !self.is_connected {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    /// Check an interface exists and has the expected claim state.
    pub fn check_interface(&self, number: u8, expect_claimed: bool) -> Result<()> {
        let intf = self
            .get_interface(number)
            .ok_or_else(|| Error::usb(format!("interface {number} does not exist")))?;
        if expect_claimed && !intf.is_claimed() {
            return Err(Error::usb(format!("interface {number} must be claimed first")));
        }
        if !expect_claimed && intf.is_claimed() {
            return Err(Error::usb(format!("interface {number} has already been claimed")));
        }
        Ok(())
    }

    pub fn check_alternate(&self, interface_number: u8, alternate_number: u8) -> Result<()> {
        self.check_is_open()?;
        self.check_interface(interface_number, true)?;
        let intf = self.get_interface(interface_number).unwrap();
        if intf.get_alternate(alternate_number).is_none() {
            return Err(Error::usb(format!(
                "interface {interface_number} has no alternate setting {alternate_number}"
            )));
        }
        Ok(())
    }

    /// Validate a control transfer: device open, and for INTERFACE/ENDPOINT
    /// recipients, that the lower byte of `index` names a claimed interface.
    pub fn check_control_transfer(&self, transfer: &ControlTransfer) -> Result<()> {
        self.check_is_open()?;
        match transfer.recipient {
            Recipient::Interface => {
                self.check_interface((transfer.index & 0xff) as u8, true)?;
            }
            Recipient::Endpoint => {
                let address = (transfer.index & 0xff) as u8;
                let number = Endpoint::get_number(address);
                let direction = Endpoint::get_direction(address);
                let (_, intf) = self.get_endpoint_and_interface(number, direction).ok_or_else(|| {
                    Error::usb(format!(
                        "endpoint {address:02x} (lower byte of index) does not exist"
                    ))
                })?;
                self.check_interface(intf.number, true)?;
            }
            Recipient::Device | Recipient::Other => {}
        }
        Ok(())
    }

    /// Validate and return the endpoint/interface for a bulk/interrupt
    /// transfer: not endpoint 0, exists, BULK or INTERRUPT, and its
    /// interface is claimed.
    pub fn check_transfer_endpoint(
        &self,
        number: u8,
        direction: TransferDirection,
    ) -> Result<(Endpoint, u8)> {
        if number == 0 {
            return Err(Error::usb("control endpoint 0 supports control transfers only"));
        }
        let (endpoint, intf) = self
            .get_endpoint_and_interface(number, direction)
            .ok_or_else(|| Error::usb(format!("device has no matching endpoint {number}")))?;
        if !matches!(endpoint.transfer_type, TransferType::Bulk | TransferType::Interrupt) {
            return Err(Error::usb(format!(
                "transfer requires a BULK or INTERRUPT endpoint (endpoint {number} is {:?})",
                endpoint.transfer_type
            )));
        }
        if !intf.is_claimed() {
            return Err(Error::usb(format!(
                "interface {} must be claimed for transfer",
                intf.number
            )));
        }
        Ok((endpoint.clone(), intf.number))
    }

    pub fn set_claimed(&mut self, number: u8, claimed: bool) {
        if let Some(intf) = self.configuration.get_interface_mut(number) {
            intf.set_claimed(claimed);
        }
    }

    pub fn set_current_alternate(&mut self, interface_number: u8, alternate_number: u8) {
        if let Some(intf) = self.configuration.get_interface_mut(interface_number) {
            intf.set_current_alternate(alternate_number);
        }
    }

    /// Release every claimed interface; called by every driver's `close`.
    pub fn release_all_interfaces(&mut self) {
        for intf in &mut self.configuration.interfaces {
            intf.set_claimed(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Recipient;

    fn device_descriptor() -> Vec<u8> {
        let mut raw = vec![18u8, 0x01, 0x00, 0x02, 0xff, 0, 0, 64];
        raw.extend([0, 0, 0, 0]); // idVendor, idProduct
        raw.extend([0, 1]); // bcdDevice
        raw.extend([0, 0, 0, 1]); // iManufacturer, iProduct, iSerial, bNumConfigurations
        raw
    }

    fn interface_descriptor(number: u8, num_eps: u8) -> Vec<u8> {
        vec![9, 0x04, number, 0, num_eps, 0xff, 0, 0, 0]
    }

    fn endpoint_descriptor(address: u8, attributes: u8) -> Vec<u8> {
        vec![7, 0x05, address, attributes, 64, 0, 1]
    }

    fn test_state() -> DeviceState {
        let mut body = Vec::new();
        body.extend(interface_descriptor(0, 2));
        body.extend(endpoint_descriptor(0x81, 0x02)); // bulk in, endpoint 1
        body.extend(endpoint_descriptor(0x83, 0x01)); // isochronous in, endpoint 3
        body.extend(interface_descriptor(1, 0));

        let total_length = 9 + body.len();
        let mut bytes = vec![
            9,
            0x02,
            (total_length & 0xff) as u8,
            (total_length >> 8) as u8,
            2,
            1,
            0,
            0x80,
            0x32,
        ];
        bytes.extend(body);

        DeviceState::from_descriptors("test-device".into(), device_descriptor(), bytes).unwrap()
    }

    #[test]
    fn transfer_on_endpoint_zero_fails() {
        let state = test_state();
        let err = state.check_transfer_endpoint(0, TransferDirection::In).unwrap_err();
        assert!(matches!(err, Error::Usb(_)));
    }

    #[test]
    fn transfer_on_isochronous_endpoint_fails() {
        let mut state = test_state();
        state.set_claimed(0, true);
        let err = state.check_transfer_endpoint(3, TransferDirection::In).unwrap_err();
        assert!(matches!(err, Error::Usb(_)));
    }

    #[test]
    fn transfer_requires_claimed_interface() {
        let mut state = test_state();
        assert!(state.check_transfer_endpoint(1, TransferDirection::In).is_err());
        state.set_claimed(0, true);
        let (endpoint, intf_number) = state.check_transfer_endpoint(1, TransferDirection::In).unwrap();
        assert_eq!(endpoint.number, 1);
        assert_eq!(intf_number, 0);
    }

    #[test]
    fn control_transfer_interface_recipient_requires_claim() {
        let mut state = test_state();
        state.is_open = true;
        let transfer = ControlTransfer {
            request_type: crate::model::RequestType::Class,
            recipient: Recipient::Interface,
            request: 0,
            value: 0,
            index: 0,
        };
        assert!(state.check_control_transfer(&transfer).is_err());
        state.set_claimed(0, true);
        assert!(state.check_control_transfer(&transfer).is_ok());
    }

    #[test]
    fn release_all_interfaces_clears_every_claim() {
        let mut state = test_state();
        state.set_claimed(0, true);
        state.set_claimed(1, true);
        state.release_all_interfaces();
        assert!(state.check_interface(0, false).is_ok());
        assert!(state.check_interface(1, false).is_ok());
    }

    #[test]
    fn check_is_open_requires_connected_and_open() {
        let mut state = test_state();
        assert!(state.check_is_open().is_err());
        state.is_open = true;
        assert!(state.check_is_open().is_ok());
        state.is_connected = false;
        assert!(matches!(state.check_is_open().unwrap_err(), Error::NotConnected));
    }
}
