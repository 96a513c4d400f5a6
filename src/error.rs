//! The error taxonomy for all USB operations.
//!
//! The original implementation this crate is modelled on used an
//! exception hierarchy (`USBError`, with `StallError` and
//! `TransferTimeoutError` as subclasses). Rust has no exception
//! hierarchy, so the three collapse into one `#[non_exhaustive] enum`
//! with predicate methods, the way `cotton-ssdp`'s `udp::error::Error`
//! folds several failure sources into one type.

use std::fmt;

/// Failure of a USB operation.
#[non_exhaustive]
#[derive(Debug)]
pub enum Error {
    /// General USB failure, with a human-readable description.
    Usb(String),
    /// An endpoint stalled (halted). Clear the halt before retrying.
    Stall(String),
    /// A bounded transfer did not complete within its timeout.
    Timeout(String),
    /// The device has been physically disconnected.
    NotConnected,
}

impl Error {
    pub(crate) fn usb(msg: impl Into<String>) -> Self {
        Error::Usb(msg.into())
    }

    pub(crate) fn stall(msg: impl Into<String>) -> Self {
        Error::Stall(msg.into())
    }

    pub(crate) fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    /// True if this is a stall/halt condition.
    pub fn is_stall(&self) -> bool {
        matches!(self, Error::Stall(_))
    }

    /// True if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// True if the device was no longer connected when the operation ran.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Error::NotConnected)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Usb(msg) => write!(f, "USB error: {msg}"),
            Error::Stall(msg) => write!(f, "USB endpoint stalled: {msg}"),
            Error::Timeout(msg) => write!(f, "USB transfer timed out: {msg}"),
            Error::NotConnected => f.write_str("device is no longer connected"),
        }
    }
}

impl std::error::Error for Error {}

/// Shorthand used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates() {
        assert!(Error::stall("halted").is_stall());
        assert!(Error::timeout("slow").is_timeout());
        assert!(Error::NotConnected.is_not_connected());
        assert!(!Error::usb("other").is_stall());
    }

    #[test]
    fn display_not_connected() {
        assert_eq!(
            Error::NotConnected.to_string(),
            "device is no longer connected"
        );
    }
}
