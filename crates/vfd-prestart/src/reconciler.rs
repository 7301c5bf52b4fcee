//! Per-PF binding state machine
//!
//! A run validates vendors and module readiness for the whole declared set
//! once, then walks each declared PF in configuration order:
//!
//! 1. Bind the PF to its `pf_driver`, unbinding a known other driver first
//! 2. Bring its VF count to `vfs_count` (reset to zero, then create)
//! 3. Unbind every VF held by another driver, then bind every VF not yet
//!    on `vf_driver`, each step as a bounded-concurrency batch
//!
//! IOMMU group peers that were not declared follow afterwards with only the
//! driver step, taking the `pf_driver` of the first declared PF in their
//! group. Nothing is rolled back on failure: the run stops at the first
//! fatal error and a later run resumes from whatever state the host is in.

use std::collections::HashSet;

use tracing::{error, info, instrument, warn};

use vfd_common::{PciHost, VfdResult};

use crate::executor::{bind_device, unbind_device, BatchAction, BindExecutor, DEFAULT_BIND_CONCURRENCY};
use crate::inspector::{DriverState, DriverStateInspector};
use crate::modules::ModuleEnsurer;
use crate::topology::{GroupPeer, TopologyDiscovery};
use crate::types::{Action, DeviceKind, DeviceMachine, DeviceSpec, ReconcileState, RunSummary};
use crate::vendor::{VendorGate, DEFAULT_ALLOWED_VENDORS};
use crate::vf_lifecycle::VfLifecycle;

/// Tuning for a run.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// VF operations in flight per batch
    pub bind_concurrency: usize,
    /// Allowed PCI vendor ids
    pub allowed_vendors: Vec<String>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            bind_concurrency: DEFAULT_BIND_CONCURRENCY,
            allowed_vendors: DEFAULT_ALLOWED_VENDORS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// What driving a device to its driver did.
enum DriverStep {
    AlreadyBound,
    Rebound,
}

/// Whose driver is being driven, for the actions it records.
#[derive(Clone, Copy)]
enum Role {
    Pf,
    Peer,
}

impl Role {
    fn unbind(self, id: &str) -> Action {
        let device = id.to_string();
        match self {
            Role::Pf => Action::UnbindPf { device },
            Role::Peer => Action::UnbindPeer { device },
        }
    }

    fn bind(self, id: &str, driver: &str) -> Action {
        let device = id.to_string();
        let driver = driver.to_string();
        match self {
            Role::Pf => Action::BindPf { device, driver },
            Role::Peer => Action::BindPeer { device, driver },
        }
    }
}

pub struct Reconciler<'a> {
    host: &'a dyn PciHost,
    config: ReconcilerConfig,
}

impl<'a> Reconciler<'a> {
    pub fn new(host: &'a dyn PciHost, config: ReconcilerConfig) -> Self {
        Self { host, config }
    }

    /// Drives the host to the declared state.
    ///
    /// On failure the actions applied before the abort are logged at warn.
    pub async fn run(&self, specs: &[DeviceSpec]) -> VfdResult<RunSummary> {
        let mut summary = RunSummary::default();
        match self.reconcile(specs, &mut summary).await {
            Ok(()) => {
                info!(
                    actions = summary.actions.len(),
                    devices = summary.devices.len(),
                    "Reconciliation complete"
                );
                for action in &summary.actions {
                    info!(action = %action, "Summary");
                }
                Ok(summary)
            }
            Err(e) => {
                if !summary.actions.is_empty() {
                    warn!(
                        actions = summary.actions.len(),
                        "Run aborted after partial changes; no rollback performed"
                    );
                    for action in &summary.actions {
                        warn!(action = %action, "Applied before abort");
                    }
                }
                Err(e)
            }
        }
    }

    /// Drives the host to the declared state, recording into `summary` every
    /// mutation as soon as it has been applied. After an error `summary`
    /// holds exactly what was changed before the abort.
    pub async fn reconcile(&self, specs: &[DeviceSpec], summary: &mut RunSummary) -> VfdResult<()> {
        let topology = TopologyDiscovery::new(self.host);
        let gate = VendorGate::new(&self.config.allowed_vendors);

        let effective = topology.effective_set(specs).await?;
        info!(
            pfs = effective.pfs.len(),
            vfs = effective.vfs.len(),
            peers = effective.peers.len(),
            "Discovered effective device set"
        );

        gate.check(self.host, &effective.devices()).await?;
        ModuleEnsurer::new(self.host).ensure(specs, summary).await?;

        for spec in specs {
            let mut machine = DeviceMachine::new(spec.id());
            machine.advance(ReconcileState::Validated);
            machine.advance(ReconcileState::ModulesReady);
            let result = self.reconcile_pf(spec, &mut machine, summary).await;
            if result.is_err() {
                machine.abort();
            }
            summary.devices.push(machine);
            result?;
        }

        // membership may have shifted while VFs were recreated
        let peers = topology.peers(specs).await?;
        let checked: HashSet<&str> = effective.peers.iter().map(|p| p.id.as_str()).collect();
        let unchecked: Vec<(String, DeviceKind)> = peers
            .iter()
            .filter(|p| !checked.contains(p.id.as_str()))
            .map(|p| (p.id.clone(), DeviceKind::Pf))
            .collect();
        if !unchecked.is_empty() {
            warn!(devices = unchecked.len(), "Group peers appeared during the run");
            gate.check(self.host, &unchecked).await?;
        }

        for peer in &peers {
            let mut machine = DeviceMachine::new(peer.id.clone());
            let result = self.reconcile_peer(peer, &mut machine, summary).await;
            if result.is_err() {
                machine.abort();
            }
            summary.devices.push(machine);
            result?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(device = %spec.id))]
    async fn reconcile_pf(
        &self,
        spec: &DeviceSpec,
        machine: &mut DeviceMachine,
        summary: &mut RunSummary,
    ) -> VfdResult<()> {
        let pf = spec.id();

        if let DriverStep::AlreadyBound = self
            .ensure_driver(pf, &spec.pf_driver, Role::Pf, summary)
            .await?
        {
            info!(driver = %spec.pf_driver, "PF already bound");
        }
        machine.advance(ReconcileState::PfBound);

        let vfs = VfLifecycle::new(self.host)
            .reconcile(pf, spec.vfs_count, summary)
            .await?;
        machine.advance(ReconcileState::VfCountOk);

        self.bind_vfs(pf, &vfs, &spec.vf_driver, summary).await?;
        machine.advance(ReconcileState::VfBound);
        machine.advance(ReconcileState::Done);
        Ok(())
    }

    #[instrument(skip_all, fields(device = %peer.id, group = %peer.group_id))]
    async fn reconcile_peer(
        &self,
        peer: &GroupPeer,
        machine: &mut DeviceMachine,
        summary: &mut RunSummary,
    ) -> VfdResult<()> {
        self.ensure_driver(&peer.id, &peer.driver, Role::Peer, summary)
            .await?;
        machine.advance(ReconcileState::PfBound);
        machine.advance(ReconcileState::Done);
        Ok(())
    }

    /// Binds `id` to `driver` unless it already is.
    ///
    /// The current driver is unbound only when it is known; a device whose
    /// state could not be read goes straight to the forced bind.
    async fn ensure_driver(
        &self,
        id: &str,
        driver: &str,
        role: Role,
        summary: &mut RunSummary,
    ) -> VfdResult<DriverStep> {
        let state = DriverStateInspector::new(self.host).inspect(id).await;
        if state.is_bound_to(driver) {
            return Ok(DriverStep::AlreadyBound);
        }

        if let DriverState::Bound(current) = &state {
            info!(device = %id, from = %current, "Unbinding");
            if let Err(e) = unbind_device(self.host, id).await {
                error!(device = %id, error = %e, "Unbind failed");
                return Err(e);
            }
            summary.record(role.unbind(id));
        }

        info!(device = %id, driver = %driver, "Binding");
        bind_device(self.host, id, driver).await?;
        summary.record(role.bind(id, driver));
        Ok(DriverStep::Rebound)
    }

    async fn bind_vfs(
        &self,
        pf: &str,
        vfs: &[String],
        driver: &str,
        summary: &mut RunSummary,
    ) -> VfdResult<()> {
        let inspector = DriverStateInspector::new(self.host);
        let mut to_unbind = Vec::new();
        let mut to_bind = Vec::new();
        for vf in vfs {
            match inspector.inspect(vf).await {
                DriverState::Bound(current) if current == driver => {}
                DriverState::Bound(_) => {
                    to_unbind.push(vf.clone());
                    to_bind.push(vf.clone());
                }
                DriverState::Unbound | DriverState::Unknown => to_bind.push(vf.clone()),
            }
        }
        if to_bind.is_empty() {
            info!(vfs = vfs.len(), driver = %driver, "All VFs already bound");
            return Ok(());
        }

        let executor = BindExecutor::new(self.host, self.config.bind_concurrency);

        let mut unbound = executor.run(pf, &to_unbind, &BatchAction::Unbind).await;
        if !unbound.applied.is_empty() {
            summary.record(Action::UnbindVfs {
                pf: pf.to_string(),
                vfs: std::mem::take(&mut unbound.applied),
            });
        }
        unbound.into_result()?;

        let mut bound = executor
            .run(pf, &to_bind, &BatchAction::Bind(driver.to_string()))
            .await;
        if !bound.applied.is_empty() {
            summary.record(Action::BindVfs {
                pf: pf.to_string(),
                driver: driver.to_string(),
                vfs: std::mem::take(&mut bound.applied),
            });
        }
        bound.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vfd_common::{PciAddress, VfdError};
    use vfd_test::fixtures::{
        dual_port_shared_group, kernel_bound_pf, INTEL_GROUP, INTEL_PF0, INTEL_PF1,
    };
    use vfd_test::{HostOp, HostVerifier, SimDevice};

    fn spec(id: &str, pf: &str, vf: &str, count: u32) -> DeviceSpec {
        DeviceSpec::new(id.parse::<PciAddress>().unwrap(), pf, vf, count)
    }

    #[tokio::test]
    async fn test_pf_walks_full_state_path() {
        let host = kernel_bound_pf();
        let summary = Reconciler::new(&host, ReconcilerConfig::default())
            .run(&[spec(INTEL_PF0, "vfio-pci", "vfio-pci", 2)])
            .await
            .unwrap();

        let machine = &summary.devices[0];
        assert_eq!(
            machine.history(),
            &[
                ReconcileState::Unknown,
                ReconcileState::Validated,
                ReconcileState::ModulesReady,
                ReconcileState::PfBound,
                ReconcileState::VfCountOk,
                ReconcileState::VfBound,
                ReconcileState::Done,
            ]
        );
        assert!(summary
            .actions
            .contains(&Action::UnbindPf { device: INTEL_PF0.to_string() }));
    }

    #[tokio::test]
    async fn test_peer_takes_reduced_path() {
        let host = dual_port_shared_group();
        let summary = Reconciler::new(&host, ReconcilerConfig::default())
            .run(&[spec(INTEL_PF0, "vfio-pci", "vfio-pci", 0)])
            .await
            .unwrap();

        assert_eq!(summary.state_of(INTEL_PF1), Some(ReconcileState::Done));
        let peer = summary.devices.iter().find(|m| m.device() == INTEL_PF1).unwrap();
        assert_eq!(
            peer.history(),
            &[ReconcileState::Unknown, ReconcileState::PfBound, ReconcileState::Done]
        );
        HostVerifier::new(&host).assert_driver(INTEL_PF1, Some("vfio-pci")).unwrap();
    }

    #[tokio::test]
    async fn test_unknown_state_skips_unbind() {
        let host = kernel_bound_pf();
        host.set_report(INTEL_PF0, Some("lspci: -s: Invalid slot number"));
        Reconciler::new(&host, ReconcilerConfig::default())
            .run(&[spec(INTEL_PF0, "vfio-pci", "vfio-pci", 0)])
            .await
            .unwrap();

        let log = host.device_mutations();
        assert!(!log.contains(&HostOp::Unbind(INTEL_PF0.to_string())));
        assert!(log.contains(&HostOp::bind(INTEL_PF0, "vfio-pci")));
    }

    #[tokio::test]
    async fn test_in_use_pf_stops_run() {
        let host = kernel_bound_pf().with_in_use(INTEL_PF0);
        let err = Reconciler::new(&host, ReconcilerConfig::default())
            .run(&[spec(INTEL_PF0, "vfio-pci", "vfio-pci", 2)])
            .await
            .unwrap_err();
        assert!(matches!(err, VfdError::InUse { .. }));
        assert!(host.device_mutations().is_empty());
    }

    #[tokio::test]
    async fn test_failed_pf_bind_keeps_applied_unbind() {
        let host = kernel_bound_pf().with_failing_bind(INTEL_PF0);
        let mut summary = RunSummary::default();
        let err = Reconciler::new(&host, ReconcilerConfig::default())
            .reconcile(&[spec(INTEL_PF0, "vfio-pci", "vfio-pci", 2)], &mut summary)
            .await
            .unwrap_err();

        assert!(matches!(err, VfdError::Bind { .. }));
        assert_eq!(
            summary.actions.last(),
            Some(&Action::UnbindPf { device: INTEL_PF0.to_string() })
        );
        assert!(!summary
            .actions
            .iter()
            .any(|a| matches!(a, Action::BindPf { .. })));
        assert_eq!(summary.state_of(INTEL_PF0), Some(ReconcileState::Aborted));
        assert!(host.log().contains(&HostOp::Unbind(INTEL_PF0.to_string())));
    }

    #[tokio::test]
    async fn test_partial_vf_batch_is_recorded() {
        let host = kernel_bound_pf()
            .with_loaded_module("vfio-pci")
            .with_vfs(INTEL_PF0, 3, None)
            .with_failing_bind("0000:01:10.1");
        let mut summary = RunSummary::default();
        let err = Reconciler::new(&host, ReconcilerConfig::default())
            .reconcile(&[spec(INTEL_PF0, "ixgbe", "vfio-pci", 3)], &mut summary)
            .await
            .unwrap_err();

        assert!(matches!(err, VfdError::BatchFailed { .. }));
        assert_eq!(
            summary.actions.last(),
            Some(&Action::BindVfs {
                pf: INTEL_PF0.to_string(),
                driver: "vfio-pci".to_string(),
                vfs: vec!["0000:01:10.0".to_string(), "0000:01:10.2".to_string()],
            })
        );
    }

    #[tokio::test]
    async fn test_peer_appearing_mid_run_is_vendor_checked() {
        let host = kernel_bound_pf().with_hotplug_on_bind(
            INTEL_PF0,
            SimDevice::new("0000:01:00.3")
                .vendor("1af4")
                .group(INTEL_GROUP)
                .driver("virtio-pci"),
        );
        let err = Reconciler::new(&host, ReconcilerConfig::default())
            .run(&[spec(INTEL_PF0, "vfio-pci", "vfio-pci", 0)])
            .await
            .unwrap_err();

        assert!(matches!(err, VfdError::UnsupportedVendor { .. }));
        assert_eq!(err.device(), Some("0000:01:00.3"));
        HostVerifier::new(&host)
            .assert_driver("0000:01:00.3", Some("virtio-pci"))
            .unwrap();
    }

    #[tokio::test]
    async fn test_allowed_peer_appearing_mid_run_is_bound() {
        let host = kernel_bound_pf().with_hotplug_on_bind(
            INTEL_PF0,
            SimDevice::new("0000:01:00.3").group(INTEL_GROUP).driver("ixgbe"),
        );
        let summary = Reconciler::new(&host, ReconcilerConfig::default())
            .run(&[spec(INTEL_PF0, "vfio-pci", "vfio-pci", 0)])
            .await
            .unwrap();

        assert_eq!(summary.state_of("0000:01:00.3"), Some(ReconcileState::Done));
        HostVerifier::new(&host)
            .assert_group_closed(INTEL_GROUP, "vfio-pci")
            .unwrap();
    }
}
