//! Kernel module readiness for the declared drivers

use tracing::{debug, info};

use vfd_common::{PciHost, VfdError, VfdResult};

use crate::commands::module_key;
use crate::types::{Action, DeviceSpec, RunSummary};

/// Host-side VF network drivers that would claim freshly created VFs.
pub const CONFLICTING_VF_DRIVERS: &[&str] = &["ixgbevf", "iavf", "i40evf"];

/// Drivers that hand devices to userspace.
pub const USERSPACE_DRIVERS: &[&str] = &["vfio-pci", "igb_uio", "uio_pci_generic", "pci-stub"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModulePolicy {
    /// Loaded on demand with `modprobe <load_name>`.
    Loadable,
    /// Vendor management module this tool never loads itself.
    Preloaded,
}

/// One kernel module a driver needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleRequirement {
    /// `lsmod` name
    pub module: &'static str,
    /// `modprobe` name
    pub load_name: &'static str,
    pub policy: ModulePolicy,
}

impl ModuleRequirement {
    const fn loadable(module: &'static str, load_name: &'static str) -> Self {
        Self {
            module,
            load_name,
            policy: ModulePolicy::Loadable,
        }
    }

    const fn preloaded(module: &'static str) -> Self {
        Self {
            module,
            load_name: module,
            policy: ModulePolicy::Preloaded,
        }
    }
}

/// Modules a driver needs, in load order. Unknown drivers need none.
pub fn modules_for_driver(driver: &str) -> Vec<ModuleRequirement> {
    match module_key(driver).as_str() {
        "igb_uio" => vec![
            ModuleRequirement::loadable("uio", "uio"),
            ModuleRequirement::loadable("igb_uio", "igb_uio"),
        ],
        "vfio_pci" => vec![ModuleRequirement::loadable("vfio_pci", "vfio-pci")],
        "pci_stub" => vec![ModuleRequirement::loadable("pci_stub", "pci-stub")],
        "uio_pci_generic" => vec![
            ModuleRequirement::loadable("uio", "uio"),
            ModuleRequirement::loadable("uio_pci_generic", "uio_pci_generic"),
        ],
        "mlx5_core" => vec![ModuleRequirement::preloaded("mlx5_core")],
        _ => Vec::new(),
    }
}

/// Distinct driver names of a configuration, PF drivers first, in order.
pub fn declared_drivers(specs: &[DeviceSpec]) -> Vec<String> {
    let mut drivers: Vec<String> = Vec::new();
    let names = specs
        .iter()
        .map(|s| &s.pf_driver)
        .chain(specs.iter().map(|s| &s.vf_driver));
    for name in names {
        if !drivers.contains(name) {
            drivers.push(name.clone());
        }
    }
    drivers
}

pub struct ModuleEnsurer<'a> {
    host: &'a dyn PciHost,
}

impl<'a> ModuleEnsurer<'a> {
    pub fn new(host: &'a dyn PciHost) -> Self {
        Self { host }
    }

    /// Makes every module the configuration needs available and unloads
    /// conflicting VF drivers.
    ///
    /// Missing preloaded modules are reported before anything is loaded.
    pub async fn ensure(&self, specs: &[DeviceSpec], summary: &mut RunSummary) -> VfdResult<()> {
        let mut plan: Vec<(String, ModuleRequirement)> = Vec::new();
        for driver in declared_drivers(specs) {
            let reqs = modules_for_driver(&driver);
            if reqs.is_empty() {
                debug!(driver = %driver, "No module management for driver");
            }
            for req in reqs {
                if !plan.iter().any(|(_, r)| r.module == req.module) {
                    plan.push((driver.clone(), req));
                }
            }
        }

        let mut missing = Vec::new();
        for (driver, req) in &plan {
            if self.host.is_module_loaded(req.module).await? {
                debug!(module = req.module, driver = %driver, "Module already loaded");
                continue;
            }
            if req.policy == ModulePolicy::Preloaded {
                return Err(VfdError::ModuleNotPreloaded {
                    module: req.module.to_string(),
                    driver: driver.clone(),
                });
            }
            missing.push(*req);
        }

        for req in missing {
            info!(module = req.load_name, "Loading kernel module");
            self.host
                .load_module(req.load_name)
                .await
                .map_err(|e| {
                    e.rewrap(|message| VfdError::ModuleLoad {
                        module: req.load_name.to_string(),
                        operation: "loaded".to_string(),
                        message,
                    })
                })?;
            summary.record(Action::LoadModule {
                module: req.load_name.to_string(),
            });
        }

        self.unload_conflicting(specs, summary).await
    }

    async fn unload_conflicting(&self, specs: &[DeviceSpec], summary: &mut RunSummary) -> VfdResult<()> {
        let userspace_vfs = specs.iter().any(|s| {
            USERSPACE_DRIVERS
                .iter()
                .any(|d| module_key(d) == module_key(&s.vf_driver))
        });
        if !userspace_vfs {
            return Ok(());
        }

        let declared: Vec<String> = declared_drivers(specs)
            .iter()
            .map(|d| module_key(d))
            .collect();
        for module in CONFLICTING_VF_DRIVERS {
            if declared.iter().any(|d| d == module) {
                continue;
            }
            if !self.host.is_module_loaded(module).await? {
                continue;
            }
            info!(module = %module, "Unloading conflicting VF driver");
            self.host
                .unload_module(module)
                .await
                .map_err(|e| {
                    e.rewrap(|message| VfdError::ModuleLoad {
                        module: module.to_string(),
                        operation: "unloaded".to_string(),
                        message,
                    })
                })?;
            summary.record(Action::UnloadModule {
                module: module.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vfd_common::PciAddress;
    use vfd_test::fixtures::{kernel_bound_pf, mellanox_pf, INTEL_PF0, MLX_PF};
    use vfd_test::{HostOp, SimHost};

    fn spec(id: &str, pf: &str, vf: &str) -> DeviceSpec {
        DeviceSpec::new(id.parse::<PciAddress>().unwrap(), pf, vf, 2)
    }

    #[test]
    fn test_modules_for_driver() {
        let igb: Vec<_> = modules_for_driver("igb_uio").iter().map(|r| r.module).collect();
        assert_eq!(igb, vec!["uio", "igb_uio"]);

        let vfio = modules_for_driver("vfio-pci");
        assert_eq!(vfio[0].module, "vfio_pci");
        assert_eq!(vfio[0].load_name, "vfio-pci");

        assert_eq!(modules_for_driver("mlx5_core")[0].policy, ModulePolicy::Preloaded);
        assert!(modules_for_driver("ixgbe").is_empty());
    }

    #[test]
    fn test_declared_drivers_dedup() {
        let specs = [
            spec(INTEL_PF0, "vfio-pci", "vfio-pci"),
            spec("0000:01:00.1", "igb_uio", "vfio-pci"),
        ];
        assert_eq!(declared_drivers(&specs), vec!["vfio-pci", "igb_uio"]);
    }

    #[tokio::test]
    async fn test_loads_missing_and_unloads_conflicts() {
        let host = kernel_bound_pf();
        let mut summary = RunSummary::default();
        ModuleEnsurer::new(&host)
            .ensure(&[spec(INTEL_PF0, "igb_uio", "vfio-pci")], &mut summary)
            .await
            .unwrap();

        assert_eq!(
            host.log(),
            vec![
                HostOp::LoadModule("uio".to_string()),
                HostOp::LoadModule("igb_uio".to_string()),
                HostOp::LoadModule("vfio-pci".to_string()),
                HostOp::UnloadModule("ixgbevf".to_string()),
            ]
        );
        assert_eq!(summary.actions.len(), 4);
        assert!(host.module_loaded("vfio_pci"));
        assert!(!host.module_loaded("ixgbevf"));
    }

    #[tokio::test]
    async fn test_declared_vf_driver_is_kept() {
        let host = kernel_bound_pf();
        let mut summary = RunSummary::default();
        ModuleEnsurer::new(&host)
            .ensure(&[spec(INTEL_PF0, "ixgbe", "ixgbevf")], &mut summary)
            .await
            .unwrap();
        assert!(host.module_loaded("ixgbevf"));
        assert!(summary.is_noop());
    }

    #[tokio::test]
    async fn test_preloaded_module_missing() {
        let host = mellanox_pf(false);
        let mut summary = RunSummary::default();
        let err = ModuleEnsurer::new(&host)
            .ensure(&[spec(MLX_PF, "mlx5_core", "vfio-pci")], &mut summary)
            .await
            .unwrap_err();
        assert!(matches!(err, VfdError::ModuleNotPreloaded { .. }));
        assert!(err.to_string().contains("must be preloaded"));
        assert!(host.log().is_empty());
    }

    #[tokio::test]
    async fn test_load_failure() {
        let host = SimHost::new();
        let mut summary = RunSummary::default();
        let err = ModuleEnsurer::new(&host)
            .ensure(&[spec(INTEL_PF0, "vfio-pci", "vfio-pci")], &mut summary)
            .await
            .unwrap_err();
        assert!(matches!(err, VfdError::ModuleLoad { .. }));
        assert_eq!(err.action(), "ensure module");
    }
}
