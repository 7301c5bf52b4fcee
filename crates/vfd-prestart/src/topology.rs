//! IOMMU group and VF discovery

use std::collections::HashSet;

use tracing::{debug, warn};

use vfd_common::{PciHost, VfdError, VfdResult};

use crate::types::{DeviceKind, DeviceSpec, IommuGroup};

/// PCI class prefix of a PCI-to-PCI bridge.
const BRIDGE_CLASS_PREFIX: &str = "0604";

/// Returns true if a sysfs class code (`0x060400`) names a PCI bridge.
pub fn is_bridge_class(class: &str) -> bool {
    class
        .trim()
        .trim_start_matches("0x")
        .to_ascii_lowercase()
        .starts_with(BRIDGE_CLASS_PREFIX)
}

/// A group member that is neither declared nor a VF of a declared PF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPeer {
    pub id: String,
    pub group_id: String,
    /// `pf_driver` of the first declared PF sharing the group
    pub driver: String,
}

/// Every device a run touches.
#[derive(Debug, Clone, Default)]
pub struct EffectiveSet {
    pub pfs: Vec<String>,
    pub vfs: Vec<String>,
    pub peers: Vec<GroupPeer>,
}

impl EffectiveSet {
    pub fn devices(&self) -> Vec<(String, DeviceKind)> {
        let pfs = self.pfs.iter().map(|id| (id.clone(), DeviceKind::Pf));
        let vfs = self.vfs.iter().map(|id| (id.clone(), DeviceKind::Vf));
        let peers = self.peers.iter().map(|p| (p.id.clone(), DeviceKind::Pf));
        pfs.chain(vfs).chain(peers).collect()
    }
}

pub struct TopologyDiscovery<'a> {
    host: &'a dyn PciHost,
}

impl<'a> TopologyDiscovery<'a> {
    pub fn new(host: &'a dyn PciHost) -> Self {
        Self { host }
    }

    async fn ensure_present(&self, id: &str) -> VfdResult<()> {
        if !self.host.device_exists(id).await? {
            return Err(VfdError::discovery(id, "not present in the device tree"));
        }
        Ok(())
    }

    /// Returns the IOMMU group of `pf` with all its members.
    pub async fn group_of(&self, pf: &str) -> VfdResult<IommuGroup> {
        self.ensure_present(pf).await?;
        let group_id = self.host.iommu_group(pf).await?.ok_or_else(|| {
            VfdError::discovery(pf, "device has no IOMMU group; is the IOMMU enabled?")
        })?;
        let members = self.host.group_members(&group_id).await?;
        Ok(IommuGroup { group_id, members })
    }

    /// Returns the current VFs of `pf` in `virtfnN` order.
    pub async fn vfs_of(&self, pf: &str) -> VfdResult<Vec<String>> {
        self.ensure_present(pf).await?;
        self.host.virtual_functions(pf).await
    }

    /// Reads group membership afresh and returns the peers that must follow
    /// their declared PF's driver.
    pub async fn peers(&self, specs: &[DeviceSpec]) -> VfdResult<Vec<GroupPeer>> {
        let declared: HashSet<&str> = specs.iter().map(DeviceSpec::id).collect();

        let mut vfs = HashSet::new();
        for spec in specs {
            vfs.extend(self.vfs_of(spec.id()).await?);
        }

        let mut seen = HashSet::new();
        let mut peers = Vec::new();
        for spec in specs {
            let group = self.group_of(spec.id()).await?;
            for member in group.members {
                if declared.contains(member.as_str()) || vfs.contains(&member) {
                    continue;
                }
                // first declared PF in config order wins
                if !seen.insert(member.clone()) {
                    continue;
                }
                let class = self.host.class_code(&member).await?;
                if is_bridge_class(&class) {
                    warn!(
                        device = %member,
                        group = %group.group_id,
                        "Skipping PCI bridge sharing an IOMMU group with a declared device"
                    );
                    continue;
                }
                debug!(device = %member, group = %group.group_id, driver = %spec.pf_driver, "Group peer");
                peers.push(GroupPeer {
                    id: member,
                    group_id: group.group_id.clone(),
                    driver: spec.pf_driver.clone(),
                });
            }
        }
        Ok(peers)
    }

    /// Declared PFs, their VFs and their group peers.
    pub async fn effective_set(&self, specs: &[DeviceSpec]) -> VfdResult<EffectiveSet> {
        let mut set = EffectiveSet::default();
        for spec in specs {
            set.pfs.push(spec.id().to_string());
            set.vfs.extend(self.vfs_of(spec.id()).await?);
        }
        set.peers = self.peers(specs).await?;
        Ok(set)
    }
}
