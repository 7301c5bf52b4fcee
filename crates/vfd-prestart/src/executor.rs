//! Bounded-concurrency VF unbind and bind batches

use std::collections::HashSet;
use std::fmt;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use vfd_common::{BatchFailure, PciHost, VfdError, VfdResult};

use crate::commands::is_in_use_output;

/// Default number of VF operations in flight.
pub const DEFAULT_BIND_CONCURRENCY: usize = 8;

/// What a batch does to each member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchAction {
    Unbind,
    Bind(String),
}

impl fmt::Display for BatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchAction::Unbind => write!(f, "unbind"),
            BatchAction::Bind(_) => write!(f, "bind"),
        }
    }
}

/// Unbinds `id`, distinguishing a refusal on a routed interface.
pub async fn unbind_device(host: &dyn PciHost, id: &str) -> VfdResult<()> {
    match host.unbind(id).await {
        Ok(output) if is_in_use_output(&output) => Err(VfdError::InUse {
            device: id.to_string(),
            output,
        }),
        Ok(_) => Ok(()),
        Err(VfdError::ShellCommandFailed { output, .. }) if is_in_use_output(&output) => {
            Err(VfdError::InUse {
                device: id.to_string(),
                output,
            })
        }
        Err(e) => Err(e.rewrap(|message| VfdError::unbind(id, message))),
    }
}

/// Binds `id` to `driver`.
pub async fn bind_device(host: &dyn PciHost, id: &str, driver: &str) -> VfdResult<()> {
    host.bind(id, driver)
        .await
        .map_err(|e| e.rewrap(|message| VfdError::bind(id, driver, message)))
}

/// Result of one batch: the members that went through and those that did not.
#[derive(Debug)]
pub struct BatchOutcome {
    pub pf: String,
    pub action: BatchAction,
    /// Members the action was applied to, in request order
    pub applied: Vec<String>,
    /// Failed members, sorted by device id
    pub failures: Vec<BatchFailure>,
}

impl BatchOutcome {
    /// Fails with [`VfdError::BatchFailed`] if any member failed.
    pub fn into_result(self) -> VfdResult<()> {
        if self.failures.is_empty() {
            return Ok(());
        }
        Err(VfdError::BatchFailed {
            device: self.pf,
            action: self.action.to_string(),
            failures: self.failures,
        })
    }
}

pub struct BindExecutor<'a> {
    host: &'a dyn PciHost,
    concurrency: usize,
}

impl<'a> BindExecutor<'a> {
    pub fn new(host: &'a dyn PciHost, concurrency: usize) -> Self {
        Self {
            host,
            concurrency: concurrency.max(1),
        }
    }

    /// Applies `action` to every VF of `pf` in `vfs` with at most
    /// `concurrency` operations in flight, and waits for all of them.
    ///
    /// Members are not retried. The outcome reports the members that were
    /// changed even when others failed.
    pub async fn run(&self, pf: &str, vfs: &[String], action: &BatchAction) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            pf: pf.to_string(),
            action: action.clone(),
            applied: Vec::new(),
            failures: Vec::new(),
        };
        if vfs.is_empty() {
            return outcome;
        }
        info!(device = %pf, action = %action, vfs = vfs.len(), concurrency = self.concurrency, "Running VF batch");

        let host = self.host;
        let results: Vec<(String, VfdResult<()>)> = stream::iter(vfs.iter().cloned())
            .map(|vf| async move {
                let result = match action {
                    BatchAction::Unbind => unbind_device(host, &vf).await,
                    BatchAction::Bind(driver) => bind_device(host, &vf, driver).await,
                };
                (vf, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut succeeded = HashSet::new();
        for (device, result) in results {
            match result {
                Ok(()) => {
                    debug!(device = %device, action = %action, "VF done");
                    succeeded.insert(device);
                }
                Err(e) => {
                    warn!(device = %device, action = %action, error = %e, "VF failed");
                    outcome.failures.push(BatchFailure {
                        device,
                        reason: e.to_string(),
                    });
                }
            }
        }
        outcome.applied = vfs
            .iter()
            .filter(|vf| succeeded.contains(*vf))
            .cloned()
            .collect();
        outcome.failures.sort_by(|a, b| a.device.cmp(&b.device));
        outcome
    }
}
