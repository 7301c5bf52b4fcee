//! Verification helpers for reconciler tests
//!
//! Provides assertion helpers over the final device state and the recorded
//! operation log of a [`SimHost`]

use crate::sim_host::{HostOp, SimHost, BRIDGE_CLASS};
use thiserror::Error;

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Driver mismatch for {device}: expected {expected:?}, got {actual:?}")]
    DriverMismatch {
        device: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("Expected {expected} VFs on {pf}, found {actual}")]
    VfCountMismatch {
        pf: String,
        expected: usize,
        actual: usize,
    },

    #[error("Expected no device mutations, found {0:?}")]
    UnexpectedMutations(Vec<HostOp>),

    #[error("Operation {0:?} was not recorded")]
    OpMissing(HostOp),

    #[error("Operation {first:?} did not happen before {second:?}")]
    OrderViolation { first: HostOp, second: HostOp },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Device state verification helper
pub struct HostVerifier<'a> {
    host: &'a SimHost,
}

impl<'a> HostVerifier<'a> {
    /// Create a new verifier
    pub fn new(host: &'a SimHost) -> Self {
        Self { host }
    }

    /// Verify the driver a device is bound to (`None` for unbound)
    pub fn assert_driver(&self, device: &str, expected: Option<&str>) -> VerifyResult<()> {
        let actual = self.host.driver_of(device);
        if actual.as_deref() != expected {
            return Err(VerificationError::DriverMismatch {
                device: device.to_string(),
                expected: expected.map(str::to_string),
                actual,
            });
        }
        Ok(())
    }

    /// Verify every listed device is bound to `driver`
    pub fn assert_all_bound<S: AsRef<str>>(&self, devices: &[S], driver: &str) -> VerifyResult<()> {
        for device in devices {
            self.assert_driver(device.as_ref(), Some(driver))?;
        }
        Ok(())
    }

    /// Verify every non-bridge member of `group` is bound to `driver`
    pub fn assert_group_closed(&self, group: &str, driver: &str) -> VerifyResult<()> {
        let members: Vec<String> = self
            .host
            .members_of(group)
            .into_iter()
            .filter(|d| self.host.class_of(d).as_deref() != Some(BRIDGE_CLASS))
            .collect();
        self.assert_all_bound(&members, driver)
    }

    /// Verify the number of VFs a PF currently exposes
    pub fn assert_vf_count(&self, pf: &str, expected: usize) -> VerifyResult<()> {
        let actual = self.host.vfs_of(pf).len();
        if actual != expected {
            return Err(VerificationError::VfCountMismatch {
                pf: pf.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Verify nothing was unbound, bound or resized
    pub fn assert_no_device_mutations(&self) -> VerifyResult<()> {
        let ops = self.host.device_mutations();
        if !ops.is_empty() {
            return Err(VerificationError::UnexpectedMutations(ops));
        }
        Ok(())
    }

    /// Position of the first occurrence of `op` in the log
    pub fn position(&self, op: &HostOp) -> VerifyResult<usize> {
        self.host
            .log()
            .iter()
            .position(|o| o == op)
            .ok_or_else(|| VerificationError::OpMissing(op.clone()))
    }

    /// Verify `first` was recorded before `second`
    pub fn assert_before(&self, first: &HostOp, second: &HostOp) -> VerifyResult<()> {
        if self.position(first)? >= self.position(second)? {
            return Err(VerificationError::OrderViolation {
                first: first.clone(),
                second: second.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{dual_port_shared_group, INTEL_GROUP, INTEL_PF0, INTEL_PF1};
    use vfd_common::PciHost;

    #[test]
    fn test_group_closure_ignores_bridge() {
        let host = dual_port_shared_group();
        host.force_driver(INTEL_PF0, Some("vfio-pci"));
        host.force_driver(INTEL_PF1, Some("vfio-pci"));

        let verifier = HostVerifier::new(&host);
        verifier.assert_group_closed(INTEL_GROUP, "vfio-pci").unwrap();
        assert!(verifier.assert_driver(INTEL_PF0, None).is_err());
    }

    #[test]
    fn test_order_assertions() {
        let host = dual_port_shared_group();
        tokio_test::block_on(async {
            host.unbind(INTEL_PF0).await.unwrap();
            host.load_module("vfio-pci").await.unwrap();
            host.bind(INTEL_PF0, "vfio-pci").await.unwrap();
        });

        let verifier = HostVerifier::new(&host);
        let unbind = HostOp::Unbind(INTEL_PF0.to_string());
        let bind = HostOp::bind(INTEL_PF0, "vfio-pci");
        verifier.assert_before(&unbind, &bind).unwrap();
        assert!(verifier.assert_before(&bind, &unbind).is_err());
        assert!(verifier.assert_no_device_mutations().is_err());
        assert!(verifier
            .position(&HostOp::Unbind(INTEL_PF1.to_string()))
            .is_err());
    }
}
