//! Test fixtures for common adapter topologies
//!
//! Provides reusable simulated hosts and `vfd.cfg` builders

use crate::sim_host::{SimDevice, SimHost};

/// First port of the Intel dual-port adapter.
pub const INTEL_PF0: &str = "0000:01:00.0";
/// Second port of the Intel dual-port adapter.
pub const INTEL_PF1: &str = "0000:01:00.1";
/// Upstream bridge sharing the adapter's IOMMU group.
pub const UPSTREAM_BRIDGE: &str = "0000:00:01.0";
/// IOMMU group of the Intel adapter.
pub const INTEL_GROUP: &str = "20";
/// Mellanox ConnectX port.
pub const MLX_PF: &str = "0000:3b:00.0";
/// A virtio function from a vendor outside the allow-list.
pub const VIRTIO_DEV: &str = "0000:05:00.0";

/// One `pciids` entry of a `vfd.cfg` file.
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    /// PF address
    pub id: String,
    /// Driver for the PF and its group peers
    pub pf_driver: String,
    /// Driver for the VFs
    pub vf_driver: String,
    /// Number of VFs
    pub vfs_count: u32,
}

impl ConfigEntry {
    /// Create an entry binding everything to `vfio-pci`
    pub fn vfio(id: impl Into<String>, vfs_count: u32) -> Self {
        Self {
            id: id.into(),
            pf_driver: "vfio-pci".to_string(),
            vf_driver: "vfio-pci".to_string(),
            vfs_count,
        }
    }

    /// Override the PF driver
    pub fn with_pf_driver(mut self, driver: impl Into<String>) -> Self {
        self.pf_driver = driver.into();
        self
    }

    /// Override the VF driver
    pub fn with_vf_driver(mut self, driver: impl Into<String>) -> Self {
        self.vf_driver = driver.into();
        self
    }

    fn to_json(&self) -> String {
        format!(
            r#"{{"id": "{}", "pf_driver": "{}", "vf_driver": "{}", "vfs_count": {}}}"#,
            self.id, self.pf_driver, self.vf_driver, self.vfs_count
        )
    }
}

/// Render a `vfd.cfg` document with the given entries and the unrelated
/// keys VFd itself keeps in the same file.
pub fn vfd_config(entries: &[ConfigEntry]) -> String {
    let ids: Vec<String> = entries.iter().map(ConfigEntry::to_json).collect();
    format!(
        "{{\n  \"log_dir\": \"/var/log/vfd\",\n  \"log_keep\": 60,\n  \"pciids\": [\n    {}\n  ]\n}}\n",
        ids.join(",\n    ")
    )
}

/// Single Intel PF bound to its kernel driver, no VFs, `ixgbevf` loaded
/// and claiming any VF that appears.
pub fn kernel_bound_pf() -> SimHost {
    SimHost::new()
        .with_device(
            SimDevice::new(INTEL_PF0)
                .group(INTEL_GROUP)
                .driver("ixgbe")
                .sriov(32),
        )
        .with_loaded_module("ixgbe")
        .with_loaded_module("ixgbevf")
        .with_vf_autoprobe("ixgbevf")
        .with_loadable_module("vfio-pci")
        .with_loadable_module("uio")
        .with_loadable_module("igb_uio")
        .with_loadable_module("pci-stub")
}

/// Dual-port Intel adapter whose ports share one IOMMU group with an
/// upstream bridge.
pub fn dual_port_shared_group() -> SimHost {
    SimHost::new()
        .with_device(
            SimDevice::new(INTEL_PF0)
                .group(INTEL_GROUP)
                .driver("ixgbe")
                .sriov(32),
        )
        .with_device(
            SimDevice::new(INTEL_PF1)
                .group(INTEL_GROUP)
                .driver("ixgbe")
                .sriov(32),
        )
        .with_device(
            SimDevice::new(UPSTREAM_BRIDGE)
                .group(INTEL_GROUP)
                .bridge()
                .driver("pcieport"),
        )
        .with_loaded_module("ixgbe")
        .with_loadable_module("vfio-pci")
        .with_loadable_module("uio")
        .with_loadable_module("igb_uio")
}

/// Mellanox port on `mlx5_core`; the module is loaded only when
/// `preloaded` is set.
pub fn mellanox_pf(preloaded: bool) -> SimHost {
    let host = SimHost::new()
        .with_device(
            SimDevice::new(MLX_PF)
                .vendor("15b3")
                .group("40")
                .driver("mlx5_core")
                .sriov(16),
        )
        .with_loadable_module("vfio-pci");
    if preloaded {
        host.with_loaded_module("mlx5_core")
    } else {
        host
    }
}

/// Virtio function whose vendor is not on the allow-list.
pub fn unsupported_vendor() -> SimHost {
    SimHost::new()
        .with_device(
            SimDevice::new(VIRTIO_DEV)
                .vendor("1af4")
                .group("7")
                .driver("virtio-pci")
                .sriov(8),
        )
        .with_loadable_module("vfio-pci")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vfd_config_lists_entries() {
        let cfg = vfd_config(&[
            ConfigEntry::vfio(INTEL_PF0, 4),
            ConfigEntry::vfio(INTEL_PF1, 0).with_pf_driver("igb_uio"),
        ]);
        assert!(cfg.contains(r#""id": "0000:01:00.0""#));
        assert!(cfg.contains(r#""pf_driver": "igb_uio""#));
        assert!(cfg.contains(r#""vfs_count": 4"#));
    }

    #[test]
    fn test_dual_port_group_members() {
        let host = dual_port_shared_group();
        assert_eq!(
            host.members_of(INTEL_GROUP),
            vec![UPSTREAM_BRIDGE, INTEL_PF0, INTEL_PF1]
        );
    }
}
