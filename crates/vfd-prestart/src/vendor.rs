//! Vendor allow-list check

use tracing::{error, info};

use vfd_common::{PciHost, VfdError, VfdResult};

use crate::inspector::DriverStateInspector;
use crate::types::{DeviceKind, PciDevice};

/// Intel, Mellanox and Broadcom: the adapter families the VF daemon drives.
pub const DEFAULT_ALLOWED_VENDORS: &[&str] = &["8086", "15b3", "14e4"];

/// Normalizes a vendor id to four lowercase hex digits without `0x`.
pub fn normalize_vendor(vendor: &str) -> String {
    vendor.trim().trim_start_matches("0x").to_ascii_lowercase()
}

/// Returns true if `vendor` is a 16-bit hex vendor id.
pub fn is_valid_vendor(vendor: &str) -> bool {
    let v = normalize_vendor(vendor);
    v.len() == 4 && v.chars().all(|c| c.is_ascii_hexdigit())
}

/// Rejects runs that would touch devices from vendors outside the allow-list.
#[derive(Debug, Clone)]
pub struct VendorGate {
    allowed: Vec<String>,
}

impl Default for VendorGate {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_VENDORS.iter().copied())
    }
}

impl VendorGate {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: allowed
                .into_iter()
                .map(|v| normalize_vendor(v.as_ref()))
                .collect(),
        }
    }

    pub fn allows(&self, vendor: &str) -> bool {
        let vendor = normalize_vendor(vendor);
        self.allowed.iter().any(|a| *a == vendor)
    }

    /// Returns every device whose vendor is not allowed, in input order.
    pub async fn failing(
        &self,
        host: &dyn PciHost,
        devices: &[(String, DeviceKind)],
    ) -> VfdResult<Vec<PciDevice>> {
        let inspector = DriverStateInspector::new(host);
        let mut failing = Vec::new();
        for (id, kind) in devices {
            let vendor = host.vendor_id(id).await?;
            if !self.allows(&vendor) {
                failing.push(inspector.observe(id, *kind).await?);
            }
        }
        Ok(failing)
    }

    /// Fails with the first unsupported device, if any.
    pub async fn check(&self, host: &dyn PciHost, devices: &[(String, DeviceKind)]) -> VfdResult<()> {
        let failing = self.failing(host, devices).await?;
        for dev in &failing {
            error!(
                device = %dev.id,
                kind = %dev.kind,
                vendor = %dev.vendor,
                driver = dev.bound_driver.as_deref().unwrap_or("none"),
                "Unsupported vendor"
            );
        }
        if let Some(first) = failing.into_iter().next() {
            return Err(VfdError::UnsupportedVendor {
                device: first.id,
                vendor: first.vendor,
            });
        }
        info!(devices = devices.len(), "Vendor check passed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vfd_test::{SimDevice, SimHost};

    #[test]
    fn test_allows() {
        let gate = VendorGate::default();
        assert!(gate.allows("8086"));
        assert!(gate.allows("0x15B3"));
        assert!(!gate.allows("1af4"));

        let custom = VendorGate::new(["1AF4"]);
        assert!(custom.allows("0x1af4"));
        assert!(!custom.allows("8086"));
    }

    #[test]
    fn test_vendor_validation() {
        assert!(is_valid_vendor("8086"));
        assert!(is_valid_vendor("0x14E4"));
        assert!(!is_valid_vendor("808"));
        assert!(!is_valid_vendor("zzzz"));
    }

    #[tokio::test]
    async fn test_check_reports_first_failure() {
        let host = SimHost::new()
            .with_device(SimDevice::new("0000:01:00.0"))
            .with_device(SimDevice::new("0000:05:00.0").vendor("1af4").driver("virtio-pci"))
            .with_device(SimDevice::new("0000:06:00.0").vendor("1d0f"));
        let devices = vec![
            ("0000:01:00.0".to_string(), DeviceKind::Pf),
            ("0000:05:00.0".to_string(), DeviceKind::Pf),
            ("0000:06:00.0".to_string(), DeviceKind::Pf),
        ];

        let gate = VendorGate::default();
        let failing = gate.failing(&host, &devices).await.unwrap();
        assert_eq!(failing.len(), 2);
        assert_eq!(failing[0].bound_driver.as_deref(), Some("virtio-pci"));

        let err = gate.check(&host, &devices).await.unwrap_err();
        assert_eq!(err.device(), Some("0000:05:00.0"));
        assert!(err.is_fatal());
    }
}
