//! VF count reconciliation

use tracing::{debug, info};

use vfd_common::{PciHost, VfdError, VfdResult};

use crate::types::{Action, RunSummary};

/// Brings a PF's VF count to its declared value.
pub struct VfLifecycle<'a> {
    host: &'a dyn PciHost,
}

impl<'a> VfLifecycle<'a> {
    pub fn new(host: &'a dyn PciHost) -> Self {
        Self { host }
    }

    /// Returns the VF ids of `pf` once it exposes exactly `target` VFs.
    ///
    /// A count change always goes through zero: the kernel refuses to
    /// resize a nonzero VF set in place. Every VF existing before the reset
    /// is destroyed along with its driver state.
    pub async fn reconcile(
        &self,
        pf: &str,
        target: u32,
        summary: &mut RunSummary,
    ) -> VfdResult<Vec<String>> {
        let current = self.host.virtual_functions(pf).await?;
        if current.len() == target as usize {
            debug!(device = %pf, vfs = current.len(), "VF count already matches");
            return Ok(current);
        }

        info!(device = %pf, current = current.len(), target = target, "Resetting VFs");
        self.write(pf, 0).await?;
        summary.record(Action::ResetVfs { pf: pf.to_string() });

        if target > 0 {
            self.write(pf, target).await?;
            summary.record(Action::CreateVfs {
                pf: pf.to_string(),
                count: target,
            });
        }

        let created = self.host.virtual_functions(pf).await?;
        if created.len() != target as usize {
            return Err(VfdError::vf_count(
                pf,
                target,
                format!("{} VFs present after the write", created.len()),
            ));
        }
        Ok(created)
    }

    async fn write(&self, pf: &str, count: u32) -> VfdResult<()> {
        self.host
            .set_num_vfs(pf, count)
            .await
            .map_err(|e| e.rewrap(|message| VfdError::vf_count(pf, count, message)))
    }
}
