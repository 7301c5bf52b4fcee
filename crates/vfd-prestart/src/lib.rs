//! vfd-prestart - SR-IOV device-to-driver binding reconciler
//!
//! Runs once before the VF daemon starts. Reads the declared PFs from
//! `vfd.cfg`, then binds each PF, its IOMMU group peers and its VFs to the
//! declared drivers, recreating VFs when the declared count differs from
//! the live one. Safe to re-run: a host already in the declared state sees
//! no changes.

pub mod commands;
pub mod config;
pub mod executor;
pub mod inspector;
pub mod modules;
pub mod reconciler;
pub mod sysfs;
pub mod topology;
pub mod types;
pub mod vendor;
pub mod vf_lifecycle;

pub use config::{load_config, parse_config, DEFAULT_CONFIG_PATH};
pub use executor::{BatchAction, BatchOutcome, BindExecutor, DEFAULT_BIND_CONCURRENCY};
pub use inspector::{DriverState, DriverStateInspector};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use sysfs::{SysfsHost, DEFAULT_CALL_TIMEOUT};
pub use types::*;
pub use vendor::{VendorGate, DEFAULT_ALLOWED_VENDORS};
