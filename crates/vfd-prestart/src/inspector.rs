//! Driver attachment queries
//!
//! Attachment is read from an `lspci -k -s <id>` style report:
//!
//! ```text
//! 01:00.0 Ethernet controller: Intel Corporation 82599ES 10-Gigabit SFI/SFP+ (rev 01)
//!         Subsystem: Intel Corporation Ethernet Server Adapter X520-2
//!         Kernel driver in use: ixgbe
//!         Kernel modules: ixgbe
//! ```
//!
//! A report without the device header, or with an empty driver line, cannot
//! be trusted. Such devices are reported as [`DriverState::Unknown`] and
//! callers treat them as needing a rebind.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use vfd_common::{PciHost, VfdError, VfdResult};

use crate::types::{DeviceKind, PciDevice};

static DRIVER_IN_USE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*Kernel driver in use:(.*)$").expect("Invalid driver line regex")
});

/// Driver attachment of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverState {
    Bound(String),
    Unbound,
    Unknown,
}

impl DriverState {
    pub fn is_bound_to(&self, driver: &str) -> bool {
        matches!(self, DriverState::Bound(d) if d == driver)
    }

    pub fn driver(&self) -> Option<&str> {
        match self {
            DriverState::Bound(d) => Some(d),
            _ => None,
        }
    }
}

/// Address as `lspci` prints it: without the domain when it is `0000`.
fn lspci_address(id: &str) -> &str {
    id.strip_prefix("0000:").unwrap_or(id)
}

/// Parses a driver report for `id`.
///
/// Returns `Ok(None)` for an unbound device and a [`VfdError::DriverQuery`]
/// when the report cannot be interpreted.
pub fn parse_driver_report(id: &str, report: &str) -> VfdResult<Option<String>> {
    let mut lines = report.lines().filter(|l| !l.trim().is_empty());

    let header = lines
        .next()
        .ok_or_else(|| VfdError::driver_query(id, "empty report"))?;
    let short = lspci_address(id);
    if !(header.starts_with(short) || header.starts_with(id)) {
        return Err(VfdError::driver_query(
            id,
            format!("unexpected report header: {}", header.trim()),
        ));
    }

    for line in lines {
        if let Some(caps) = DRIVER_IN_USE_RE.captures(line) {
            let driver = caps.get(1).map_or("", |m| m.as_str().trim());
            if driver.is_empty() {
                return Err(VfdError::driver_query(id, "driver line has no driver name"));
            }
            return Ok(Some(driver.to_string()));
        }
    }
    Ok(None)
}

/// Typed driver queries against a host.
pub struct DriverStateInspector<'a> {
    host: &'a dyn PciHost,
}

impl<'a> DriverStateInspector<'a> {
    pub fn new(host: &'a dyn PciHost) -> Self {
        Self { host }
    }

    /// Returns the driver attachment of `id`.
    ///
    /// Query and parse failures are recovered here as [`DriverState::Unknown`].
    pub async fn inspect(&self, id: &str) -> DriverState {
        let parsed = match self.host.driver_report(id).await {
            Ok(report) => parse_driver_report(id, &report),
            Err(e) => Err(VfdError::driver_query(id, e.to_string())),
        };
        match parsed {
            Ok(Some(driver)) => DriverState::Bound(driver),
            Ok(None) => DriverState::Unbound,
            Err(e) => {
                warn!(device = %id, error = %e, "Driver state unknown, device will be rebound");
                DriverState::Unknown
            }
        }
    }

    /// Returns `(bound, queryable)`: whether `id` is bound to `target`, and
    /// whether its attachment could be determined at all.
    pub async fn attachment(&self, id: &str, target: &str) -> (bool, bool) {
        match self.inspect(id).await {
            DriverState::Bound(driver) => (driver == target, true),
            DriverState::Unbound => (false, true),
            DriverState::Unknown => (false, false),
        }
    }

    /// Observes identity and attachment of `id`.
    pub async fn observe(&self, id: &str, kind: DeviceKind) -> VfdResult<PciDevice> {
        let vendor = self.host.vendor_id(id).await?;
        let bound_driver = self.inspect(id).await.driver().map(str::to_string);
        Ok(PciDevice {
            id: id.to_string(),
            kind,
            vendor,
            bound_driver,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vfd_test::{SimDevice, SimHost};

    const REPORT: &str = "01:00.0 Ethernet controller: Intel Corporation 82599ES (rev 01)\n\
        \tSubsystem: Intel Corporation Ethernet Server Adapter X520-2\n\
        \tKernel driver in use: ixgbe\n\
        \tKernel modules: ixgbe\n";

    #[test]
    fn test_parse_bound() {
        assert_eq!(
            parse_driver_report("0000:01:00.0", REPORT).unwrap().as_deref(),
            Some("ixgbe")
        );
    }

    #[test]
    fn test_parse_unbound() {
        let report = "01:00.0 Ethernet controller: Intel Corporation 82599ES (rev 01)\n\
            \tKernel modules: ixgbe\n";
        assert_eq!(parse_driver_report("0000:01:00.0", report).unwrap(), None);
    }

    #[test]
    fn test_parse_non_zero_domain() {
        let report = "0001:3b:00.0 Ethernet controller: Mellanox\n\tKernel driver in use: mlx5_core";
        assert_eq!(
            parse_driver_report("0001:3b:00.0", report).unwrap().as_deref(),
            Some("mlx5_core")
        );
    }

    #[test]
    fn test_parse_unusable() {
        assert!(parse_driver_report("0000:01:00.0", "").is_err());
        assert!(parse_driver_report("0000:01:00.0", "garbage\n\tKernel driver in use: x").is_err());
        let empty_driver = "01:00.0 Ethernet controller\n\tKernel driver in use:   ";
        let err = parse_driver_report("0000:01:00.0", empty_driver).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_attachment_pairs() {
        let host = SimHost::new()
            .with_device(SimDevice::new("0000:01:00.0").driver("vfio-pci"))
            .with_device(SimDevice::new("0000:01:00.1"))
            .with_device(SimDevice::new("0000:02:00.0").report("??"));
        let inspector = DriverStateInspector::new(&host);

        assert_eq!(inspector.attachment("0000:01:00.0", "vfio-pci").await, (true, true));
        assert_eq!(inspector.attachment("0000:01:00.0", "igb_uio").await, (false, true));
        assert_eq!(inspector.attachment("0000:01:00.1", "vfio-pci").await, (false, true));
        assert_eq!(inspector.attachment("0000:02:00.0", "vfio-pci").await, (false, false));
        assert_eq!(inspector.inspect("0000:02:00.0").await, DriverState::Unknown);
    }

    #[tokio::test]
    async fn test_observe() {
        let host = SimHost::new().with_device(
            SimDevice::new("0000:3b:00.0").vendor("15b3").driver("mlx5_core"),
        );
        let dev = DriverStateInspector::new(&host)
            .observe("0000:3b:00.0", DeviceKind::Pf)
            .await
            .unwrap();
        assert_eq!(dev.vendor, "15b3");
        assert_eq!(dev.bound_driver.as_deref(), Some("mlx5_core"));
    }
}
