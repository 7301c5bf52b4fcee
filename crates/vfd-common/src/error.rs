//! Error types for binding reconciliation.
//!
//! Every variant except [`VfdError::DriverQuery`] is fatal for the run. The
//! reconciler recovers driver query failures locally by treating the device
//! as needing a rebind.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for reconciliation operations.
pub type VfdResult<T> = Result<T, VfdError>;

/// One failed member of a VF unbind/bind batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    /// The VF that failed.
    pub device: String,
    /// Rendered cause.
    pub reason: String,
}

impl std::fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.device, self.reason)
    }
}

/// Errors that can occur while reconciling device bindings.
#[derive(Debug, Error)]
pub enum VfdError {
    /// The declared device configuration is missing or invalid.
    #[error("Invalid configuration for {field}: {message}")]
    Config {
        /// The offending field or entry.
        field: String,
        /// Error message.
        message: String,
    },

    /// Device or IOMMU group not present in the device tree.
    #[error("Device '{device}' not found: {message}")]
    Discovery {
        /// The device or group identifier.
        device: String,
        /// Error message.
        message: String,
    },

    /// Device vendor is not in the allow-list.
    #[error("Device '{device}' has unsupported vendor '{vendor}'")]
    UnsupportedVendor {
        /// The device identifier.
        device: String,
        /// The vendor id read from the device.
        vendor: String,
    },

    /// A loadable kernel module could not be loaded or unloaded.
    #[error("Kernel module '{module}' could not be {operation}: {message}")]
    ModuleLoad {
        /// The module name.
        module: String,
        /// "loaded" or "unloaded".
        operation: String,
        /// Error message.
        message: String,
    },

    /// A module that this tool never loads itself is absent.
    #[error("Kernel module '{module}' required by driver '{driver}' is not loaded; driver must be preloaded")]
    ModuleNotPreloaded {
        /// The module name.
        module: String,
        /// The configured driver that needs it.
        driver: String,
    },

    /// Driver attachment could not be determined.
    #[error("Driver state of '{device}' could not be determined: {message}")]
    DriverQuery {
        /// The device identifier.
        device: String,
        /// Error message.
        message: String,
    },

    /// Binding a device to a driver failed.
    #[error("Failed to bind '{device}' to '{driver}': {message}")]
    Bind {
        /// The device identifier.
        device: String,
        /// The target driver.
        driver: String,
        /// Error message.
        message: String,
    },

    /// Unbinding a device from its driver failed.
    #[error("Failed to unbind '{device}': {message}")]
    Unbind {
        /// The device identifier.
        device: String,
        /// Error message.
        message: String,
    },

    /// Unbind refused because the device carries live routes.
    #[error("Device '{device}' is in active use and was not unbound: {output}")]
    InUse {
        /// The device identifier.
        device: String,
        /// Output of the unbind tool.
        output: String,
    },

    /// Resetting or creating VFs failed.
    #[error("Failed to set VF count of '{device}' to {requested}: {message}")]
    VfCount {
        /// The PF identifier.
        device: String,
        /// The count being written.
        requested: u32,
        /// Error message.
        message: String,
    },

    /// One or more members of a VF batch failed.
    #[error("{action} batch for VFs of '{device}' failed for {} device(s): {}", .failures.len(), format_failures(.failures))]
    BatchFailed {
        /// The owning PF.
        device: String,
        /// "unbind" or "bind".
        action: String,
        /// Every failed member.
        failures: Vec<BatchFailure>,
    },

    /// Failed to spawn an external command.
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// External command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// External command exceeded the call timeout.
    #[error("Shell command timed out after {timeout:?}: '{command}'")]
    Timeout {
        /// The command that hung.
        command: String,
        /// The configured limit.
        timeout: Duration,
    },

    /// Reading or writing a sysfs attribute failed.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// The attribute path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },
}

fn format_failures(failures: &[BatchFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl VfdError {
    /// Creates a configuration error.
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a discovery error.
    pub fn discovery(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Discovery {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Creates a driver query error.
    pub fn driver_query(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DriverQuery {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Creates a bind error.
    pub fn bind(
        device: impl Into<String>,
        driver: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Bind {
            device: device.into(),
            driver: driver.into(),
            message: message.into(),
        }
    }

    /// Creates an unbind error.
    pub fn unbind(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unbind {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Creates a VF count error.
    pub fn vf_count(device: impl Into<String>, requested: u32, message: impl Into<String>) -> Self {
        Self::VfCount {
            device: device.into(),
            requested,
            message: message.into(),
        }
    }

    /// Creates an I/O error for a sysfs path.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns the device (or module/field) the error is about, if any.
    pub fn device(&self) -> Option<&str> {
        match self {
            VfdError::Discovery { device, .. }
            | VfdError::UnsupportedVendor { device, .. }
            | VfdError::DriverQuery { device, .. }
            | VfdError::Bind { device, .. }
            | VfdError::Unbind { device, .. }
            | VfdError::InUse { device, .. }
            | VfdError::VfCount { device, .. }
            | VfdError::BatchFailed { device, .. } => Some(device),
            VfdError::ModuleLoad { module, .. } | VfdError::ModuleNotPreloaded { module, .. } => {
                Some(module)
            }
            VfdError::Config { field, .. } => Some(field),
            VfdError::ShellExec { .. }
            | VfdError::ShellCommandFailed { .. }
            | VfdError::Timeout { .. }
            | VfdError::Io { .. } => None,
        }
    }

    /// Returns the action that was being attempted.
    pub fn action(&self) -> &str {
        match self {
            VfdError::Config { .. } => "load config",
            VfdError::Discovery { .. } => "discover",
            VfdError::UnsupportedVendor { .. } => "vendor check",
            VfdError::ModuleLoad { .. } | VfdError::ModuleNotPreloaded { .. } => "ensure module",
            VfdError::DriverQuery { .. } => "query driver",
            VfdError::Bind { .. } => "bind",
            VfdError::Unbind { .. } | VfdError::InUse { .. } => "unbind",
            VfdError::VfCount { .. } => "set vf count",
            VfdError::BatchFailed { action, .. } => action,
            VfdError::ShellExec { .. }
            | VfdError::ShellCommandFailed { .. }
            | VfdError::Timeout { .. } => "exec",
            VfdError::Io { .. } => "sysfs access",
        }
    }

    /// Rewraps a host error as a domain error built from its message.
    /// Timeouts pass through unchanged so the hung command stays named.
    pub fn rewrap(self, wrap: impl FnOnce(String) -> VfdError) -> VfdError {
        match self {
            VfdError::Timeout { .. } => self,
            other => wrap(other.to_string()),
        }
    }

    /// Returns true if the run must abort on this error.
    ///
    /// Only driver query failures are recovered (as "needs rebind").
    pub fn is_fatal(&self) -> bool {
        !matches!(self, VfdError::DriverQuery { .. })
    }
}
