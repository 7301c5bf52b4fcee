//! Common infrastructure for the VFd pre-start tooling.
//!
//! This crate provides the pieces shared by the binding reconciler and its
//! test harness:
//!
//! - [`shell`]: External command execution with quoting and call timeouts
//! - [`PciHost`]: The query/mutation surface of a host's PCI and driver state
//! - [`PciAddress`]: Validated PCI function addresses (`DDDD:BB:DD.F`)
//! - [`error`]: Error taxonomy for reconciliation runs
//!
//! # Architecture
//!
//! The reconciler never touches sysfs or spawns tools directly. Every read
//! and write goes through a [`PciHost`] implementation:
//!
//! 1. Query topology (IOMMU groups, `virtfnN` links) and identity (vendor, class)
//! 2. Query driver attachment (`lspci -k` style report)
//! 3. Load/unload kernel modules
//! 4. Unbind/bind devices and write `sriov_numvfs`
//!
//! # Example
//!
//! ```ignore
//! use vfd_common::{PciHost, VfdResult};
//!
//! async fn ensure_vfio(host: &dyn PciHost, id: &str) -> VfdResult<()> {
//!     if !host.is_module_loaded("vfio_pci").await? {
//!         host.load_module("vfio-pci").await?;
//!     }
//!     host.bind(id, "vfio-pci").await
//! }
//! ```

pub mod error;
pub mod host;
pub mod pci;
pub mod shell;

// Re-export commonly used items at crate root
pub use error::{BatchFailure, VfdError, VfdResult};
pub use host::PciHost;
pub use pci::PciAddress;
