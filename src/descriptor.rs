//! Pure parser from a raw USB configuration-descriptor byte buffer to a
//! [`Configuration`] object graph.
//!
//! Grounded on the original implementation's `confparser.py`: the buffer
//! must begin with a 9-byte `CONFIGURATION` descriptor whose `wTotalLength`
//! equals the buffer length, followed by a flat sequence of TLV
//! sub-descriptors (each one's own first byte is its length).

use crate::error::{Error, Result};
use crate::model::{AlternateInterface, CompositeFunction, Configuration, Endpoint, Interface};

const CONFIGURATION_DESCRIPTOR_TYPE: u8 = 0x02;
const INTERFACE_DESCRIPTOR_TYPE: u8 = 0x04;
const ENDPOINT_DESCRIPTOR_TYPE: u8 = 0x05;
const INTERFACE_ASSOCIATION_DESCRIPTOR_TYPE: u8 = 0x0b;

/// Parse a configuration descriptor buffer (header + TLV chain) into a
/// [`Configuration`].
pub fn parse_configuration(buffer: &[u8]) -> Result<Configuration> {
    let mut configuration = parse_header(buffer)?;

    let mut last_alternate_key: Option<(u8, u8)> = None; // (interface number, alternate number)
    let mut offset = buffer[0] as usize; // length of the header we just consumed

    while offset < buffer.len() {
        let desc_length = peek_desc_length(buffer, offset);
        let desc_type = peek_desc_type(buffer, offset)?;

        if offset + desc_length > buffer.len() {
            return Err(Error::usb(format!(
                "invalid USB configuration descriptor at pos {offset}"
            )));
        }

        match desc_type {
            INTERFACE_DESCRIPTOR_TYPE => {
                let (number, alternate) = parse_interface(buffer, offset)?;
                let alt_number = alternate.number;
                add_interface(&mut configuration, number, alternate);
                last_alternate_key = Some((number, alt_number));
            }
            ENDPOINT_DESCRIPTOR_TYPE => {
                let endpoint = parse_endpoint(buffer, offset)?;
                if let Some((intf_number, alt_number)) = last_alternate_key {
                    if let Some(intf) = configuration.get_interface_mut(intf_number) {
                        // Find the matching alternate; `current_alternate`
                        // may differ from the one being built during parsing
                        // when an interface reappears, so look it up by
                        // number rather than assuming it's "current".
                        if let Some(alt) = intf
                            .alternates_mut()
                            .iter_mut()
                            .find(|a| a.number == alt_number)
                        {
                            alt.endpoints.push(endpoint);
                        }
                    }
                }
                // If no alternate precedes it, the endpoint is silently skipped.
            }
            INTERFACE_ASSOCIATION_DESCRIPTOR_TYPE => {
                configuration.functions.push(parse_iad(buffer, offset)?);
            }
            _ => {
                // Class- or vendor-specific: skip without interpretation.
            }
        }

        offset += desc_length;
    }

    Ok(configuration)
}

fn add_interface(configuration: &mut Configuration, number: u8, alternate: AlternateInterface) {
    let class_code = alternate.class_code;
    let subclass_code = alternate.subclass_code;
    let protocol_code = alternate.protocol_code;

    if let Some(existing) = configuration.get_interface_mut(number) {
        existing.push_alternate(alternate);
    } else {
        configuration
            .interfaces
            .push(Interface::new(number, alternate));
    }

    if configuration.get_function(number).is_none() {
        configuration.functions.push(CompositeFunction {
            first_intf_number: number,
            interface_count: 1,
            class_code,
            subclass_code,
            protocol_code,
        });
    }
}

fn parse_header(buffer: &[u8]) -> Result<Configuration> {
    if buffer.len() < 9 {
        return Err(Error::usb("invalid USB configuration descriptor (too short)"));
    }
    if buffer[0] != 9 {
        return Err(Error::usb("invalid USB configuration descriptor at pos 0"));
    }
    if buffer[1] != CONFIGURATION_DESCRIPTOR_TYPE {
        return Err(Error::usb("invalid USB configuration descriptor at pos 1"));
    }

    let total_length = u16::from_le_bytes([buffer[2], buffer[3]]) as usize;
    if total_length != buffer.len() {
        return Err(Error::usb(
            "invalid USB configuration descriptor (invalid total length)",
        ));
    }

    Ok(Configuration {
        configuration_value: buffer[5],
        attributes: buffer[7],
        max_power: buffer[8],
        interfaces: Vec::new(),
        functions: Vec::new(),
    })
}

fn parse_interface(buffer: &[u8], offset: usize) -> Result<(u8, AlternateInterface)> {
    require_len(buffer, offset, 9)?;
    let number = buffer[offset + 2];
    let alternate = AlternateInterface::new(
        buffer[offset + 3],
        buffer[offset + 5],
        buffer[offset + 6],
        buffer[offset + 7],
    );
    Ok((number, alternate))
}

fn parse_endpoint(buffer: &[u8], offset: usize) -> Result<Endpoint> {
    require_len(buffer, offset, 7)?;
    let max_packet_size = u16::from_le_bytes([buffer[offset + 4], buffer[offset + 5]]);
    Ok(Endpoint::from_descriptor(
        buffer[offset + 2],
        buffer[offset + 3],
        max_packet_size,
    ))
}

fn parse_iad(buffer: &[u8], offset: usize) -> Result<CompositeFunction> {
    require_len(buffer, offset, 8)?;
    Ok(CompositeFunction {
        first_intf_number: buffer[offset + 2],
        interface_count: buffer[offset + 3],
        class_code: buffer[offset + 4],
        subclass_code: buffer[offset + 5],
        protocol_code: buffer[offset + 6],
    })
}

fn require_len(buffer: &[u8], offset: usize, needed: usize) -> Result<()> {
    if buffer.len() < offset + needed {
        return Err(Error::usb(format!(
            "truncated USB sub-descriptor at pos {offset}"
        )));
    }
    Ok(())
}

fn peek_desc_length(buffer: &[u8], offset: usize) -> usize {
    buffer[offset] as usize
}

fn peek_desc_type(buffer: &[u8], offset: usize) -> Result<u8> {
    if offset + 1 >= buffer.len() {
        return Err(Error::usb(format!(
            "truncated USB sub-descriptor at pos {offset}"
        )));
    }
    Ok(buffer[offset + 1])
}

/// The fixed fields of an 18-byte USB device descriptor that the driver
/// layer needs: `bcdUSB`, class triple, `bMaxPacketSize0`, `bcdDevice`.
pub struct DeviceDescriptorFields {
    pub usb_version: u16,
    pub class_code: u8,
    pub subclass_code: u8,
    pub protocol_code: u8,
    pub max_packet_size0: u8,
    pub device_version: u16,
}

/// Parse the fixed fields out of the 18-byte device descriptor.
pub fn parse_device_descriptor(buffer: &[u8]) -> Result<DeviceDescriptorFields> {
    if buffer.len() < 18 {
        return Err(Error::usb("invalid USB device descriptor (too short)"));
    }
    Ok(DeviceDescriptorFields {
        usb_version: u16::from_le_bytes([buffer[2], buffer[3]]),
        class_code: buffer[4],
        subclass_code: buffer[5],
        protocol_code: buffer[6],
        max_packet_size0: buffer[7],
        device_version: u16::from_le_bytes([buffer[12], buffer[13]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_header(total_length: u16, configuration_value: u8, attributes: u8, max_power: u8) -> Vec<u8> {
        vec![
            9,
            0x02,
            (total_length & 0xff) as u8,
            (total_length >> 8) as u8,
            1, // bNumInterfaces, unused by the parser
            configuration_value,
            0, // iConfiguration
            attributes,
            max_power,
        ]
    }

    fn interface_descriptor(number: u8, alt: u8, num_eps: u8, class: u8, sub: u8, proto: u8) -> Vec<u8> {
        vec![9, 0x04, number, alt, num_eps, class, sub, proto, 0]
    }

    fn endpoint_descriptor(address: u8, attributes: u8, max_packet_size: u16) -> Vec<u8> {
        vec![
            7,
            0x05,
            address,
            attributes,
            (max_packet_size & 0xff) as u8,
            (max_packet_size >> 8) as u8,
            1, // bInterval
        ]
    }

    fn iad(first_intf: u8, count: u8, class: u8, sub: u8, proto: u8) -> Vec<u8> {
        vec![8, 0x0b, first_intf, count, class, sub, proto, 0]
    }

    // Scenario 1 from spec.md §8: simple single interface, no endpoints,
    // a synthesized composite function.
    #[test]
    fn parse_simple() {
        let mut bytes = config_header(18, 1, 0x34, 0x64);
        bytes.extend(interface_descriptor(0, 0, 0, 0xff, 0xdd, 0xcc));

        let config = parse_configuration(&bytes).unwrap();
        assert_eq!(config.configuration_value, 1);
        assert_eq!(config.attributes, 0x34);
        assert_eq!(config.max_power, 0x64);
        assert_eq!(config.interfaces.len(), 1);

        let intf = &config.interfaces[0];
        assert_eq!(intf.number, 0);
        assert_eq!(intf.alternates().len(), 1);
        assert_eq!(intf.current_alternate().endpoints.len(), 0);
        assert_eq!(intf.current_alternate().class_code, 0xff);
        assert_eq!(intf.current_alternate().subclass_code, 0xdd);
        assert_eq!(intf.current_alternate().protocol_code, 0xcc);

        assert_eq!(config.functions.len(), 1);
        let func = config.get_function(0).unwrap();
        assert_eq!(func.first_intf_number, 0);
        assert_eq!(func.interface_count, 1);
    }

    // Scenario 2 from spec.md §8: composite device with two IADs, four
    // interfaces, interleaved endpoints.
    #[test]
    fn parse_composite_with_iad() {
        let mut bytes = config_header(9999, 1, 0x80, 0x32);
        let mut body = Vec::new();
        body.extend(iad(0, 3, 0xe0, 1, 1));
        body.extend(interface_descriptor(0, 0, 1, 0xe0, 1, 1));
        body.extend(endpoint_descriptor(0x81, 0x03, 16));
        body.extend(interface_descriptor(1, 0, 0, 0xe0, 1, 1));
        body.extend(interface_descriptor(2, 0, 1, 0xe0, 1, 1));
        body.extend(endpoint_descriptor(0x02, 0x02, 64));
        body.extend(iad(3, 1, 0x08, 6, 0x50));
        body.extend(interface_descriptor(3, 0, 2, 0x08, 6, 0x50));
        body.extend(endpoint_descriptor(0x83, 0x02, 512));
        body.extend(endpoint_descriptor(0x04, 0x02, 512));

        let total_length = 9 + body.len();
        bytes[2] = (total_length & 0xff) as u8;
        bytes[3] = (total_length >> 8) as u8;
        bytes.extend(body);

        let config = parse_configuration(&bytes).unwrap();
        assert_eq!(config.functions.len(), 2);
        assert_eq!(config.interfaces.len(), 4);

        let f0 = config.get_function(0).unwrap();
        assert_eq!(f0.first_intf_number, 0);
        assert_eq!(f0.interface_count, 3);

        let f1 = config.get_function(3).unwrap();
        assert_eq!(f1.first_intf_number, 3);
        assert_eq!(f1.interface_count, 1);

        assert_eq!(config.get_interface(0).unwrap().current_alternate().endpoints.len(), 1);
        assert_eq!(config.get_interface(1).unwrap().current_alternate().endpoints.len(), 0);
        assert_eq!(config.get_interface(2).unwrap().current_alternate().endpoints.len(), 1);
        assert_eq!(config.get_interface(3).unwrap().current_alternate().endpoints.len(), 2);
    }

    #[test]
    fn rejects_length_mismatch() {
        let bytes = config_header(100, 1, 0, 0);
        let err = parse_configuration(&bytes).unwrap_err();
        assert!(matches!(err, Error::Usb(_)));
    }

    #[test]
    fn rejects_wrong_descriptor_type() {
        let mut bytes = config_header(9, 1, 0, 0);
        bytes[1] = 0x01; // DEVICE, not CONFIGURATION
        let err = parse_configuration(&bytes).unwrap_err();
        assert!(matches!(err, Error::Usb(_)));
    }

    #[test]
    fn endpoint_before_any_interface_is_skipped() {
        let mut bytes = config_header(9 + 7, 1, 0, 0);
        bytes.extend(endpoint_descriptor(0x81, 0x02, 64));
        let config = parse_configuration(&bytes).unwrap();
        assert!(config.interfaces.is_empty());
    }

    #[test]
    fn additional_alternate_setting_is_appended() {
        let mut bytes = config_header(999, 1, 0, 0);
        let mut body = Vec::new();
        body.extend(interface_descriptor(0, 0, 0, 8, 6, 0x50));
        body.extend(interface_descriptor(0, 1, 1, 8, 6, 0x62));
        body.extend(endpoint_descriptor(0x81, 0x02, 512));
        let total_length = 9 + body.len();
        bytes[2] = (total_length & 0xff) as u8;
        bytes[3] = (total_length >> 8) as u8;
        bytes.extend(body);

        let config = parse_configuration(&bytes).unwrap();
        assert_eq!(config.interfaces.len(), 1);
        let intf = &config.interfaces[0];
        assert_eq!(intf.alternates().len(), 2);
        assert_eq!(intf.get_alternate(1).unwrap().endpoints.len(), 1);
        assert_eq!(intf.get_alternate(0).unwrap().endpoints.len(), 0);
    }

    #[test]
    fn device_descriptor_fields() {
        let mut raw = vec![18u8, 0x01];
        raw.extend([0x10, 0x02]); // bcdUSB 2.10
        raw.extend([0xef, 0x02, 0x01]); // class, subclass, protocol
        raw.push(64); // bMaxPacketSize0
        raw.extend([0x34, 0x12]); // idVendor (ignored)
        raw.extend([0x78, 0x56]); // idProduct (ignored)
        raw.extend([0x21, 0x03]); // bcdDevice 3.2.1
        raw.extend([0, 0, 0, 1]); // iManufacturer, iProduct, iSerial, bNumConfigurations
        let fields = parse_device_descriptor(&raw).unwrap();
        assert_eq!(fields.usb_version, 0x0210);
        assert_eq!(fields.class_code, 0xef);
        assert_eq!(fields.max_packet_size0, 64);
        assert_eq!(fields.device_version, 0x0321);
    }
}
