//! Type definitions for binding reconciliation

use std::fmt;

use vfd_common::PciAddress;

/// One declared PF and the driver state it and its VFs should end up in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    /// PF address
    pub id: PciAddress,
    /// Driver for the PF and any group-only peers
    pub pf_driver: String,
    /// Driver for every VF of the PF
    pub vf_driver: String,
    /// Number of VFs the PF should expose
    pub vfs_count: u32,
}

impl DeviceSpec {
    /// Creates a declaration for the PF at `id`.
    pub fn new(
        id: PciAddress,
        pf_driver: impl Into<String>,
        vf_driver: impl Into<String>,
        vfs_count: u32,
    ) -> Self {
        Self {
            id,
            pf_driver: pf_driver.into(),
            vf_driver: vf_driver.into(),
            vfs_count,
        }
    }

    /// PF address as the kernel names it.
    pub fn id(&self) -> &str {
        self.id.as_str()
    }
}

/// Physical or virtual function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Pf,
    Vf,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Pf => write!(f, "PF"),
            DeviceKind::Vf => write!(f, "VF"),
        }
    }
}

/// Live observation of a PCI function. Never cached across a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDevice {
    pub id: String,
    pub kind: DeviceKind,
    pub vendor: String,
    pub bound_driver: Option<String>,
}

/// An IOMMU group and its member functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IommuGroup {
    pub group_id: String,
    /// Every function in the group, sorted
    pub members: Vec<String>,
}

/// A mutating action issued during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    LoadModule { module: String },
    UnloadModule { module: String },
    UnbindPf { device: String },
    BindPf { device: String, driver: String },
    ResetVfs { pf: String },
    CreateVfs { pf: String, count: u32 },
    UnbindVfs { pf: String, vfs: Vec<String> },
    BindVfs { pf: String, driver: String, vfs: Vec<String> },
    UnbindPeer { device: String },
    BindPeer { device: String, driver: String },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::LoadModule { module } => write!(f, "load module {}", module),
            Action::UnloadModule { module } => write!(f, "unload module {}", module),
            Action::UnbindPf { device } => write!(f, "unbind PF {}", device),
            Action::BindPf { device, driver } => write!(f, "bind PF {} to {}", device, driver),
            Action::ResetVfs { pf } => write!(f, "reset VFs of {}", pf),
            Action::CreateVfs { pf, count } => write!(f, "create {} VFs on {}", count, pf),
            Action::UnbindVfs { pf, vfs } => {
                write!(f, "unbind {} VFs of {}", vfs.len(), pf)
            }
            Action::BindVfs { pf, driver, vfs } => {
                write!(f, "bind {} VFs of {} to {}", vfs.len(), pf, driver)
            }
            Action::UnbindPeer { device } => write!(f, "unbind group peer {}", device),
            Action::BindPeer { device, driver } => {
                write!(f, "bind group peer {} to {}", device, driver)
            }
        }
    }
}

/// Reconciliation state of one declared PF or group peer.
///
/// PFs walk `Unknown -> Validated -> ModulesReady -> PfBound -> VfCountOk ->
/// VfBound -> Done`; group peers take the reduced path
/// `Unknown -> PfBound -> Done`. Any state except `Done` may abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    Unknown,
    Validated,
    ModulesReady,
    PfBound,
    VfCountOk,
    VfBound,
    Done,
    Aborted,
}

impl ReconcileState {
    /// Returns true if `next` is a legal successor of this state.
    pub fn can_advance_to(self, next: ReconcileState) -> bool {
        use ReconcileState::*;
        match (self, next) {
            (Done, _) | (Aborted, _) => false,
            (_, Aborted) => true,
            (Unknown, Validated)
            | (Validated, ModulesReady)
            | (ModulesReady, PfBound)
            | (PfBound, VfCountOk)
            | (VfCountOk, VfBound)
            | (VfBound, Done) => true,
            // group peers
            (Unknown, PfBound) | (PfBound, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcileState::Unknown => "unknown",
            ReconcileState::Validated => "validated",
            ReconcileState::ModulesReady => "modules-ready",
            ReconcileState::PfBound => "pf-bound",
            ReconcileState::VfCountOk => "vf-count-ok",
            ReconcileState::VfBound => "vf-bound",
            ReconcileState::Done => "done",
            ReconcileState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Tracks the state of one device through a run.
#[derive(Debug, Clone)]
pub struct DeviceMachine {
    device: String,
    state: ReconcileState,
    history: Vec<ReconcileState>,
}

impl DeviceMachine {
    /// Starts tracking `device` in [`ReconcileState::Unknown`].
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            state: ReconcileState::Unknown,
            history: vec![ReconcileState::Unknown],
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Current state.
    pub fn state(&self) -> ReconcileState {
        self.state
    }

    /// Every state visited so far, starting with `Unknown`.
    pub fn history(&self) -> &[ReconcileState] {
        &self.history
    }

    /// Moves to `next`. Illegal transitions are a programming error.
    pub fn advance(&mut self, next: ReconcileState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {} -> {} for {}",
            self.state,
            next,
            self.device
        );
        tracing::debug!(device = %self.device, from = %self.state, to = %next, "State transition");
        self.state = next;
        self.history.push(next);
    }

    /// Moves to [`ReconcileState::Aborted`] unless the device already
    /// finished or aborted.
    pub fn abort(&mut self) {
        if self.state.can_advance_to(ReconcileState::Aborted) {
            self.advance(ReconcileState::Aborted);
        }
    }
}

/// What a run did.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Mutating actions in issue order
    pub actions: Vec<Action>,
    /// Final state of every declared PF and group peer
    pub devices: Vec<DeviceMachine>,
}

impl RunSummary {
    /// Appends an applied action and logs it.
    pub fn record(&mut self, action: Action) {
        tracing::info!(action = %action, "Action issued");
        self.actions.push(action);
    }

    /// Returns true if the run changed nothing.
    pub fn is_noop(&self) -> bool {
        self.actions.is_empty()
    }

    /// Final state of `device`, if the run reached it.
    pub fn state_of(&self, device: &str) -> Option<ReconcileState> {
        self.devices
            .iter()
            .find(|m| m.device() == device)
            .map(DeviceMachine::state)
    }
}
