//! PCI function address type with validation.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Full PCI function address: domain, bus, device, function.
static PCI_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-1][0-9a-fA-F]\.[0-7]$")
        .expect("Invalid PCI address regex")
});

/// Error returned when a string is not a PCI function address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid PCI address '{0}' (expected DDDD:BB:DD.F, e.g. 0000:01:00.0)")]
pub struct PciAddressError(pub String);

/// A PCI function address such as `0000:01:00.0`.
///
/// Addresses are normalized to lowercase so they compare equal to the
/// names the kernel uses under `/sys/bus/pci/devices`.
///
/// # Examples
///
/// ```
/// use vfd_common::PciAddress;
///
/// let addr: PciAddress = "0000:3B:00.1".parse().unwrap();
/// assert_eq!(addr.as_str(), "0000:3b:00.1");
///
/// assert!("3b:00.1".parse::<PciAddress>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PciAddress(String);

impl PciAddress {
    /// Returns the normalized address string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Returns true if `s` looks like a full PCI function address.
pub fn is_valid_pci_address(s: &str) -> bool {
    PCI_ADDRESS_RE.is_match(s)
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PciAddress {
    type Err = PciAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if !is_valid_pci_address(s) {
            return Err(PciAddressError(s.to_string()));
        }
        Ok(PciAddress(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for PciAddress {
    type Error = PciAddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PciAddress> for String {
    fn from(addr: PciAddress) -> Self {
        addr.0
    }
}

impl AsRef<str> for PciAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_addresses() {
        assert!(is_valid_pci_address("0000:01:00.0"));
        assert!(is_valid_pci_address("0000:ff:1f.7"));
        assert!(is_valid_pci_address("ABCD:12:0a.5"));
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(!is_valid_pci_address("01:00.0")); // missing domain
        assert!(!is_valid_pci_address("0000:01:00")); // missing function
        assert!(!is_valid_pci_address("0000:01:00.8")); // function is 0-7
        assert!(!is_valid_pci_address("0000:01:20.0")); // device is 0x00-0x1f
        assert!(!is_valid_pci_address("eth0"));
    }

    #[test]
    fn test_parse_normalizes_case() {
        let addr: PciAddress = " 0000:3B:02.3".parse().unwrap();
        assert_eq!(addr.as_str(), "0000:3b:02.3");
        assert!("0000:3B:02.F".parse::<PciAddress>().is_err());
    }

    #[test]
    fn test_serde_round_trip_rejects_garbage() {
        let ok: PciAddress = serde_json::from_str("\"0000:01:00.1\"").unwrap();
        assert_eq!(ok.to_string(), "0000:01:00.1");
        assert!(serde_json::from_str::<PciAddress>("\"not-a-pci-id\"").is_err());
    }
}
