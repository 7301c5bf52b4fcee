//! Host abstraction over PCI topology, driver state and kernel modules.
//!
//! [`PciHost`] is the only way the reconciler observes or changes the live
//! system. Observations are never cached by implementations: every call
//! reflects the system at the time it is made, so a read issued after a
//! mutation sees the mutation's effect.

use async_trait::async_trait;

use crate::error::VfdResult;

/// Query and mutation surface of a host's PCI devices.
///
/// Device identifiers are PCI function addresses as the kernel names them
/// (`0000:01:00.0`). Module names for [`is_module_loaded`](Self::is_module_loaded)
/// use the `lsmod` spelling (`vfio_pci`), module names for
/// [`load_module`](Self::load_module) use the `modprobe` spelling (`vfio-pci`).
#[async_trait]
pub trait PciHost: Send + Sync {
    /// Returns true if the device exists in the device tree.
    async fn device_exists(&self, id: &str) -> VfdResult<bool>;

    /// Returns the PCI vendor id as four lowercase hex digits (`8086`).
    async fn vendor_id(&self, id: &str) -> VfdResult<String>;

    /// Returns the PCI class code as read from sysfs (`0x020000`).
    async fn class_code(&self, id: &str) -> VfdResult<String>;

    /// Returns the IOMMU group id of the device, or `None` when the device
    /// has no group (IOMMU disabled).
    async fn iommu_group(&self, id: &str) -> VfdResult<Option<String>>;

    /// Returns every device id in an IOMMU group, sorted.
    async fn group_members(&self, group: &str) -> VfdResult<Vec<String>>;

    /// Returns the VF ids of a PF ordered by VF index; empty if none exist.
    async fn virtual_functions(&self, pf: &str) -> VfdResult<Vec<String>>;

    /// Returns the raw driver attachment report for a device, in the
    /// line-oriented format of `lspci -k -s <id>`.
    async fn driver_report(&self, id: &str) -> VfdResult<String>;

    /// Returns true if a kernel module is currently loaded.
    async fn is_module_loaded(&self, module: &str) -> VfdResult<bool>;

    /// Loads a kernel module. Succeeds if it is already loaded.
    async fn load_module(&self, module: &str) -> VfdResult<()>;

    /// Unloads a kernel module.
    async fn unload_module(&self, module: &str) -> VfdResult<()>;

    /// Unbinds a device from its current driver and returns the tool output.
    ///
    /// A no-op if the device is unbound. The caller inspects the output for
    /// an "in active use" refusal.
    async fn unbind(&self, id: &str) -> VfdResult<String>;

    /// Binds a device to `driver`.
    async fn bind(&self, id: &str, driver: &str) -> VfdResult<()>;

    /// Writes the VF count of a PF (`sriov_numvfs`).
    async fn set_num_vfs(&self, pf: &str, count: u32) -> VfdResult<()>;
}
