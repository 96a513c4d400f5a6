//! The platform-independent device model.
//!
//! Children are plain values owned by their parent (`Configuration` owns
//! `Interface`s, `Interface` owns `AlternateInterface`s, and so on); there
//! are no back-pointers. Lookups that would otherwise need a parent
//! pointer (`Interface::get_alternate`, `Configuration::get_function`)
//! are plain search methods instead, which keeps the graph acyclic and
//! trivially safe under the borrow checker.

/// USB transfer type (`bmAttributes` bits 0-1 of an endpoint descriptor).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    /// Extract the transfer type from an endpoint descriptor's `bmAttributes`.
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

/// USB transfer direction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferDirection {
    Out,
    In,
}

impl TransferDirection {
    /// Extract the direction from an endpoint address (bit 7).
    pub fn from_address(address: u8) -> Self {
        if address & 0x80 == 0 {
            TransferDirection::Out
        } else {
            TransferDirection::In
        }
    }
}

/// USB control request type (bits 5-6 of `bmRequestType`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
}

/// USB control request recipient (bits 0-4 of `bmRequestType`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// A USB control transfer request.
#[derive(Debug, Clone, Copy)]
pub struct ControlTransfer {
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// A BCD version number, as found in `bcdUSB` and `bcdDevice`.
///
/// The high byte is the major version; the low byte splits into a high
/// nibble (minor) and low nibble (subminor). `Version(0x0321)` is 3.2.1.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Version(pub u16);

impl Version {
    pub fn major(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn minor(&self) -> u8 {
        ((self.0 >> 4) & 0x0f) as u8
    }

    pub fn subminor(&self) -> u8 {
        (self.0 & 0x0f) as u8
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.subminor())
    }
}

/// A USB endpoint, decomposed from its descriptor.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub number: u8,
    pub direction: TransferDirection,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
}

impl Endpoint {
    pub(crate) fn from_descriptor(address: u8, attributes: u8, max_packet_size: u16) -> Self {
        Endpoint {
            number: Self::get_number(address),
            direction: Self::get_direction(address),
            transfer_type: TransferType::from_attributes(attributes),
            max_packet_size,
        }
    }

    /// Endpoint number (0-127), stripped of the direction bit.
    pub fn get_number(address: u8) -> u8 {
        address & 0x7f
    }

    /// Transfer direction encoded in bit 7 of the address.
    pub fn get_direction(address: u8) -> TransferDirection {
        TransferDirection::from_address(address)
    }

    /// Reconstruct an endpoint address from number and direction.
    pub fn get_address(number: u8, direction: TransferDirection) -> u8 {
        match direction {
            TransferDirection::Out => number,
            TransferDirection::In => number | 0x80,
        }
    }
}

/// One alternate setting of an `Interface`.
#[derive(Debug, Clone)]
pub struct AlternateInterface {
    pub number: u8,
    pub class_code: u8,
    pub subclass_code: u8,
    pub protocol_code: u8,
    pub endpoints: Vec<Endpoint>,
}

impl AlternateInterface {
    pub(crate) fn new(number: u8, class_code: u8, subclass_code: u8, protocol_code: u8) -> Self {
        AlternateInterface {
            number,
            class_code,
            subclass_code,
            protocol_code,
            endpoints: Vec::new(),
        }
    }
}

/// A USB interface: a number and a set of alternate settings, exactly one
/// of which is active.
#[derive(Debug, Clone)]
pub struct Interface {
    pub number: u8,
    alternates: Vec<AlternateInterface>,
    current_alternate: u8,
    is_claimed: bool,
}

impl Interface {
    pub(crate) fn new(number: u8, first_alternate: AlternateInterface) -> Self {
        let current_alternate = first_alternate.number;
        Interface {
            number,
            alternates: vec![first_alternate],
            current_alternate,
            is_claimed: false,
        }
    }

    pub(crate) fn push_alternate(&mut self, alternate: AlternateInterface) {
        self.alternates.push(alternate);
    }

    /// All alternate settings of this interface (at least one).
    pub fn alternates(&self) -> &[AlternateInterface] {
        &self.alternates
    }

    pub(crate) fn alternates_mut(&mut self) -> &mut [AlternateInterface] {
        &mut self.alternates
    }

    /// Look up an alternate setting by number.
    pub fn get_alternate(&self, number: u8) -> Option<&AlternateInterface> {
        self.alternates.iter().find(|a| a.number == number)
    }

    /// The currently active alternate setting.
    pub fn current_alternate(&self) -> &AlternateInterface {
        self.get_alternate(self.current_alternate)
            .expect("current_alternate always names a member of alternates")
    }

    /// Whether the interface is currently claimed for exclusive use.
    pub fn is_claimed(&self) -> bool {
        self.is_claimed
    }

    pub(crate) fn set_claimed(&mut self, claimed: bool) {
        self.is_claimed = claimed;
    }

    pub(crate) fn set_current_alternate(&mut self, number: u8) {
        debug_assert!(self.get_alternate(number).is_some());
        self.current_alternate = number;
    }
}

/// A composite-device function: a consecutive run of interface numbers
/// that together implement one device function.
#[derive(Debug, Clone)]
pub struct CompositeFunction {
    pub first_intf_number: u8,
    pub interface_count: u8,
    pub class_code: u8,
    pub subclass_code: u8,
    pub protocol_code: u8,
}

impl CompositeFunction {
    /// Whether the given interface number falls in this function's span.
    pub fn contains(&self, interface_number: u8) -> bool {
        let first = self.first_intf_number;
        let last = first + self.interface_count;
        interface_number >= first && interface_number < last
    }
}

/// Parsed USB configuration: the root of the descriptor object graph.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    pub configuration_value: u8,
    pub attributes: u8,
    pub max_power: u8,
    pub interfaces: Vec<Interface>,
    pub functions: Vec<CompositeFunction>,
}

impl Configuration {
    /// Look up an interface by number.
    pub fn get_interface(&self, number: u8) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.number == number)
    }

    pub(crate) fn get_interface_mut(&mut self, number: u8) -> Option<&mut Interface> {
        self.interfaces.iter_mut().find(|i| i.number == number)
    }

    /// Find the composite function that owns the given interface number.
    pub fn get_function(&self, number: u8) -> Option<&CompositeFunction> {
        self.functions.iter().find(|f| f.contains(number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_decodes_bcd() {
        let v = Version(0x0321);
        assert_eq!(v.major(), 3);
        assert_eq!(v.minor(), 2);
        assert_eq!(v.subminor(), 1);
        assert_eq!(v.to_string(), "3.2.1");
    }

    #[test]
    fn endpoint_address_round_trips() {
        for a in 0u16..=255 {
            let a = a as u8;
            let number = Endpoint::get_number(a);
            let direction = Endpoint::get_direction(a);
            assert_eq!(Endpoint::get_address(number, direction), a);
        }
    }

    #[test]
    fn endpoints_with_same_number_differ_by_direction() {
        let out = Endpoint::get_address(3, TransferDirection::Out);
        let inp = Endpoint::get_address(3, TransferDirection::In);
        assert_ne!(out, inp);
        assert_eq!(Endpoint::get_number(out), Endpoint::get_number(inp));
    }

    #[test]
    fn composite_function_span() {
        let f = CompositeFunction {
            first_intf_number: 2,
            interface_count: 2,
            class_code: 0,
            subclass_code: 0,
            protocol_code: 0,
        };
        assert!(!f.contains(1));
        assert!(f.contains(2));
        assert!(f.contains(3));
        assert!(!f.contains(4));
    }
}
