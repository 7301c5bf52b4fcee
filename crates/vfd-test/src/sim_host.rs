//! In-memory PCI host for reconciler tests.
//!
//! `SimHost` models the parts of the kernel the reconciler talks to: device
//! identity, IOMMU groups, SR-IOV VF creation through `sriov_numvfs`, driver
//! binding and module loading. Every successful mutating call is appended to
//! an operation log so tests can assert ordering and idempotence.

use std::collections::{BTreeMap, BTreeSet};
use std::io;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use vfd_common::{PciHost, VfdError, VfdResult};

/// Output of the bind tool when it refuses to unbind a routed interface.
pub const ROUTING_REFUSAL: &str = "Warning: routing table indicates that interface is active. Not modifying";

/// Class code of a PCI-to-PCI bridge.
pub const BRIDGE_CLASS: &str = "0x060400";

/// Class code of an Ethernet controller.
pub const ETHERNET_CLASS: &str = "0x020000";

/// A mutating call recorded by [`SimHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOp {
    /// `modprobe <module>` that actually loaded something.
    LoadModule(String),
    /// `rmmod <module>`.
    UnloadModule(String),
    /// Unbind of a device.
    Unbind(String),
    /// Bind of a device to a driver.
    Bind {
        /// The device id.
        device: String,
        /// The driver.
        driver: String,
    },
    /// Write to a PF's `sriov_numvfs`.
    SetNumVfs {
        /// The PF id.
        pf: String,
        /// The count written.
        count: u32,
    },
}

impl HostOp {
    /// Creates a bind operation.
    pub fn bind(device: impl Into<String>, driver: impl Into<String>) -> Self {
        HostOp::Bind {
            device: device.into(),
            driver: driver.into(),
        }
    }

    /// Creates a VF count write operation.
    pub fn set_num_vfs(pf: impl Into<String>, count: u32) -> Self {
        HostOp::SetNumVfs {
            pf: pf.into(),
            count,
        }
    }

    /// Returns true for unbind, bind and VF count writes.
    pub fn is_device_mutation(&self) -> bool {
        matches!(
            self,
            HostOp::Unbind(_) | HostOp::Bind { .. } | HostOp::SetNumVfs { .. }
        )
    }

    /// Returns the device the operation touched, if any.
    pub fn device(&self) -> Option<&str> {
        match self {
            HostOp::Unbind(device) | HostOp::Bind { device, .. } => Some(device),
            HostOp::SetNumVfs { pf, .. } => Some(pf),
            HostOp::LoadModule(_) | HostOp::UnloadModule(_) => None,
        }
    }
}

/// A simulated PCI function.
#[derive(Debug, Clone)]
pub struct SimDevice {
    id: String,
    vendor: String,
    class: String,
    group: Option<String>,
    driver: Option<String>,
    max_vfs: Option<u32>,
    physfn: Option<String>,
    vf_index: u32,
    report_override: Option<String>,
}

impl SimDevice {
    /// Creates an Intel Ethernet function with no group and no driver.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            vendor: "8086".to_string(),
            class: ETHERNET_CLASS.to_string(),
            group: None,
            driver: None,
            max_vfs: None,
            physfn: None,
            vf_index: 0,
            report_override: None,
        }
    }

    /// Sets the vendor id.
    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self
    }

    /// Sets the class code.
    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }

    /// Marks the function as a PCI bridge.
    pub fn bridge(self) -> Self {
        self.class(BRIDGE_CLASS)
    }

    /// Places the function in an IOMMU group.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Binds the function to a driver.
    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    /// Makes the function an SR-IOV capable PF.
    pub fn sriov(mut self, max_vfs: u32) -> Self {
        self.max_vfs = Some(max_vfs);
        self
    }

    /// Replaces the driver report with fixed text.
    pub fn report(mut self, text: impl Into<String>) -> Self {
        self.report_override = Some(text.into());
        self
    }
}

#[derive(Debug, Default)]
struct SimState {
    devices: BTreeMap<String, SimDevice>,
    loaded_modules: BTreeSet<String>,
    loadable_modules: BTreeSet<String>,
    failing_binds: BTreeSet<String>,
    in_use: BTreeSet<String>,
    failing_vf_writes: BTreeSet<String>,
    vf_autoprobe: Option<String>,
    hotplug: BTreeMap<String, SimDevice>,
    next_group: u32,
    log: Vec<HostOp>,
}

/// Simulated PCI host.
#[derive(Debug)]
pub struct SimHost {
    state: Mutex<SimState>,
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new()
    }
}

/// `lsmod` spelling of a module or driver name.
fn module_key(name: &str) -> String {
    name.replace('-', "_")
}

/// Address of VF `index` of `pf`, laid out the way ixgbe/i40e place them:
/// same bus, device 0x10 upwards, four device slots per PF function.
fn vf_address(pf: &str, index: u32) -> String {
    let (prefix, func) = pf.rsplit_once('.').unwrap_or((pf, "0"));
    let domain_bus = prefix.rsplit_once(':').map(|(db, _)| db).unwrap_or(prefix);
    let pf_func: u32 = func.parse().unwrap_or(0);
    let device = 0x10 + pf_func * 4 + index / 8;
    format!("{}:{:02x}.{}", domain_bus, device, index % 8)
}

fn sysfs_error(path: String, kind: io::ErrorKind, msg: &str) -> VfdError {
    VfdError::io(path, io::Error::new(kind, msg.to_string()))
}

fn tool_error(command: String, output: impl Into<String>) -> VfdError {
    VfdError::ShellCommandFailed {
        command,
        exit_code: 1,
        output: output.into(),
    }
}

impl SimState {
    fn device(&self, id: &str) -> VfdResult<&SimDevice> {
        self.devices
            .get(id)
            .ok_or_else(|| VfdError::discovery(id, "no such device in simulated host"))
    }

    fn create_vfs(&mut self, pf: &str, count: u32) {
        let Some(parent) = self.devices.get(pf).cloned() else {
            return;
        };
        let autoprobe = self
            .vf_autoprobe
            .clone()
            .filter(|d| self.loaded_modules.contains(&module_key(d)));

        for index in 0..count {
            self.next_group += 1;
            let id = vf_address(pf, index);
            let vf = SimDevice {
                id: id.clone(),
                vendor: parent.vendor.clone(),
                class: parent.class.clone(),
                group: Some(format!("{}", 1000 + self.next_group)),
                driver: autoprobe.clone(),
                max_vfs: None,
                physfn: Some(pf.to_string()),
                vf_index: index,
                report_override: None,
            };
            self.devices.insert(id, vf);
        }
    }

    fn remove_vfs(&mut self, pf: &str) {
        self.devices
            .retain(|_, d| d.physfn.as_deref() != Some(pf));
    }

    fn vfs_of(&self, pf: &str) -> Vec<String> {
        let mut vfs: Vec<&SimDevice> = self
            .devices
            .values()
            .filter(|d| d.physfn.as_deref() == Some(pf))
            .collect();
        vfs.sort_by_key(|d| d.vf_index);
        vfs.into_iter().map(|d| d.id.clone()).collect()
    }
}

impl SimHost {
    /// Creates an empty host with no devices and no modules.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
        }
    }

    /// Adds a device.
    pub fn with_device(mut self, device: SimDevice) -> Self {
        let state = self.state.get_mut();
        state.devices.insert(device.id.clone(), device);
        self
    }

    /// Marks a module as already loaded.
    pub fn with_loaded_module(mut self, module: &str) -> Self {
        self.state.get_mut().loaded_modules.insert(module_key(module));
        self
    }

    /// Makes a module loadable by `modprobe`.
    pub fn with_loadable_module(mut self, module: &str) -> Self {
        self.state
            .get_mut()
            .loadable_modules
            .insert(module_key(module));
        self
    }

    /// Creates `count` VFs on `pf`, bound to `driver`, without logging.
    pub fn with_vfs(mut self, pf: &str, count: u32, driver: Option<&str>) -> Self {
        let state = self.state.get_mut();
        state.create_vfs(pf, count);
        for id in state.vfs_of(pf) {
            if let Some(vf) = state.devices.get_mut(&id) {
                vf.driver = driver.map(str::to_string);
            }
        }
        self
    }

    /// Newly created VFs are claimed by `driver` while its module is loaded.
    pub fn with_vf_autoprobe(mut self, driver: &str) -> Self {
        self.state.get_mut().vf_autoprobe = Some(driver.to_string());
        self
    }

    /// Adds `device` to the host as soon as `trigger` is bound to a driver.
    pub fn with_hotplug_on_bind(mut self, trigger: &str, device: SimDevice) -> Self {
        self.state.get_mut().hotplug.insert(trigger.to_string(), device);
        self
    }

    /// Makes every bind of `id` fail.
    pub fn with_failing_bind(mut self, id: &str) -> Self {
        self.state.get_mut().failing_binds.insert(id.to_string());
        self
    }

    /// Makes `id` refuse unbinding because it carries routes.
    pub fn with_in_use(mut self, id: &str) -> Self {
        self.state.get_mut().in_use.insert(id.to_string());
        self
    }

    /// Makes every `sriov_numvfs` write on `pf` fail.
    pub fn with_failing_vf_count(mut self, pf: &str) -> Self {
        self.state.get_mut().failing_vf_writes.insert(pf.to_string());
        self
    }

    /// Returns every recorded operation in call order.
    pub fn log(&self) -> Vec<HostOp> {
        self.state.lock().log.clone()
    }

    /// Returns only unbind, bind and VF count operations.
    pub fn device_mutations(&self) -> Vec<HostOp> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|op| op.is_device_mutation())
            .cloned()
            .collect()
    }

    /// Clears the operation log.
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Returns the driver currently bound to `id`.
    pub fn driver_of(&self, id: &str) -> Option<String> {
        self.state
            .lock()
            .devices
            .get(id)
            .and_then(|d| d.driver.clone())
    }

    /// Returns the current VF ids of `pf`.
    pub fn vfs_of(&self, pf: &str) -> Vec<String> {
        self.state.lock().vfs_of(pf)
    }

    /// Returns every device id in `group`.
    pub fn members_of(&self, group: &str) -> Vec<String> {
        self.state
            .lock()
            .devices
            .values()
            .filter(|d| d.group.as_deref() == Some(group))
            .map(|d| d.id.clone())
            .collect()
    }

    /// Returns the class code of `id`.
    pub fn class_of(&self, id: &str) -> Option<String> {
        self.state.lock().devices.get(id).map(|d| d.class.clone())
    }

    /// Returns true if `module` is loaded.
    pub fn module_loaded(&self, module: &str) -> bool {
        self.state.lock().loaded_modules.contains(&module_key(module))
    }

    /// Replaces the driver report of `id` at runtime.
    pub fn set_report(&self, id: &str, text: Option<&str>) {
        if let Some(dev) = self.state.lock().devices.get_mut(id) {
            dev.report_override = text.map(str::to_string);
        }
    }

    /// Forces a device's driver at runtime, bypassing the log.
    pub fn force_driver(&self, id: &str, driver: Option<&str>) {
        if let Some(dev) = self.state.lock().devices.get_mut(id) {
            dev.driver = driver.map(str::to_string);
        }
    }
}

/// Renders an `lspci -k -s` style report.
fn render_report(dev: &SimDevice) -> String {
    let short = dev.id.strip_prefix("0000:").unwrap_or(&dev.id);
    let kind = if dev.class.starts_with("0x0604") {
        "PCI bridge"
    } else if dev.physfn.is_some() {
        "Ethernet controller: Virtual Function"
    } else {
        "Ethernet controller"
    };
    let mut out = format!(
        "{} {}: Vendor {} Device 0000 (rev 01)\n\tSubsystem: Vendor {} Device 0000",
        short, kind, dev.vendor, dev.vendor
    );
    if let Some(driver) = &dev.driver {
        out.push_str(&format!("\n\tKernel driver in use: {}", driver));
    }
    out
}

#[async_trait]
impl PciHost for SimHost {
    async fn device_exists(&self, id: &str) -> VfdResult<bool> {
        Ok(self.state.lock().devices.contains_key(id))
    }

    async fn vendor_id(&self, id: &str) -> VfdResult<String> {
        Ok(self.state.lock().device(id)?.vendor.clone())
    }

    async fn class_code(&self, id: &str) -> VfdResult<String> {
        Ok(self.state.lock().device(id)?.class.clone())
    }

    async fn iommu_group(&self, id: &str) -> VfdResult<Option<String>> {
        Ok(self.state.lock().device(id)?.group.clone())
    }

    async fn group_members(&self, group: &str) -> VfdResult<Vec<String>> {
        let members = self.members_of(group);
        if members.is_empty() {
            return Err(VfdError::discovery(
                format!("iommu_group {}", group),
                "group has no devices",
            ));
        }
        Ok(members)
    }

    async fn virtual_functions(&self, pf: &str) -> VfdResult<Vec<String>> {
        let state = self.state.lock();
        state.device(pf)?;
        Ok(state.vfs_of(pf))
    }

    async fn driver_report(&self, id: &str) -> VfdResult<String> {
        let state = self.state.lock();
        Ok(match state.devices.get(id) {
            Some(dev) => dev
                .report_override
                .clone()
                .unwrap_or_else(|| render_report(dev)),
            None => String::new(),
        })
    }

    async fn is_module_loaded(&self, module: &str) -> VfdResult<bool> {
        Ok(self.module_loaded(module))
    }

    async fn load_module(&self, module: &str) -> VfdResult<()> {
        let key = module_key(module);
        let mut state = self.state.lock();
        if state.loaded_modules.contains(&key) {
            return Ok(());
        }
        if !state.loadable_modules.contains(&key) {
            return Err(tool_error(
                format!("modprobe {}", module),
                format!("modprobe: FATAL: Module {} not found", module),
            ));
        }
        debug!(module = %module, "sim: module loaded");
        state.loaded_modules.insert(key);
        state.log.push(HostOp::LoadModule(module.to_string()));
        Ok(())
    }

    async fn unload_module(&self, module: &str) -> VfdResult<()> {
        let key = module_key(module);
        let mut state = self.state.lock();
        if !state.loaded_modules.remove(&key) {
            return Err(tool_error(
                format!("rmmod {}", module),
                format!("rmmod: ERROR: Module {} is not currently loaded", module),
            ));
        }
        for dev in state.devices.values_mut() {
            if dev.driver.as_deref().map(module_key) == Some(key.clone()) {
                dev.driver = None;
            }
        }
        state.log.push(HostOp::UnloadModule(module.to_string()));
        Ok(())
    }

    async fn unbind(&self, id: &str) -> VfdResult<String> {
        let mut state = self.state.lock();
        if !state.devices.contains_key(id) {
            return Err(tool_error(
                format!("dpdk-devbind -u --force {}", id),
                format!("Error: Unknown device: {}", id),
            ));
        }
        if state.in_use.contains(id) {
            return Ok(ROUTING_REFUSAL.to_string());
        }
        if let Some(dev) = state.devices.get_mut(id) {
            dev.driver = None;
        }
        state.log.push(HostOp::Unbind(id.to_string()));
        Ok(String::new())
    }

    async fn bind(&self, id: &str, driver: &str) -> VfdResult<()> {
        let command = format!("dpdk-devbind -b {} --force {}", driver, id);
        let mut state = self.state.lock();
        if !state.devices.contains_key(id) {
            return Err(tool_error(command, format!("Error: Unknown device: {}", id)));
        }
        if state.failing_binds.contains(id) {
            return Err(tool_error(command, "Error: bind failed: No such device"));
        }
        if !state.loaded_modules.contains(&module_key(driver)) {
            return Err(tool_error(
                command,
                format!("Error: Driver '{}' is not loaded.", driver),
            ));
        }
        if let Some(dev) = state.devices.get_mut(id) {
            dev.driver = Some(driver.to_string());
        }
        state.log.push(HostOp::bind(id, driver));
        if let Some(plugged) = state.hotplug.remove(id) {
            state.devices.insert(plugged.id.clone(), plugged);
        }
        Ok(())
    }

    async fn set_num_vfs(&self, pf: &str, count: u32) -> VfdResult<()> {
        let path = format!("/sys/bus/pci/devices/{}/sriov_numvfs", pf);
        let mut state = self.state.lock();
        let max_vfs = match state.devices.get(pf) {
            Some(dev) => dev.max_vfs,
            None => return Err(sysfs_error(path, io::ErrorKind::NotFound, "No such file or directory")),
        };
        let Some(max_vfs) = max_vfs else {
            return Err(sysfs_error(path, io::ErrorKind::NotFound, "No such file or directory"));
        };
        if state.failing_vf_writes.contains(pf) {
            return Err(sysfs_error(path, io::ErrorKind::Other, "Input/output error"));
        }
        if count > max_vfs {
            return Err(sysfs_error(path, io::ErrorKind::InvalidInput, "Numerical result out of range"));
        }
        let current = state.vfs_of(pf).len();
        if current > 0 && count > 0 {
            return Err(sysfs_error(path, io::ErrorKind::Other, "Device or resource busy"));
        }

        state.remove_vfs(pf);
        state.create_vfs(pf, count);
        state.log.push(HostOp::set_num_vfs(pf, count));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pf_host() -> SimHost {
        SimHost::new()
            .with_device(SimDevice::new("0000:01:00.0").group("1").sriov(16))
            .with_loadable_module("vfio-pci")
    }

    #[test]
    fn test_vf_address_layout() {
        assert_eq!(vf_address("0000:01:00.0", 0), "0000:01:10.0");
        assert_eq!(vf_address("0000:01:00.0", 9), "0000:01:11.1");
        assert_eq!(vf_address("0000:01:00.1", 0), "0000:01:14.0");
    }

    #[tokio::test]
    async fn test_numvfs_requires_reset_before_resize() {
        let host = pf_host();
        host.set_num_vfs("0000:01:00.0", 4).await.unwrap();
        assert_eq!(host.vfs_of("0000:01:00.0").len(), 4);

        assert!(host.set_num_vfs("0000:01:00.0", 8).await.is_err());

        host.set_num_vfs("0000:01:00.0", 0).await.unwrap();
        host.set_num_vfs("0000:01:00.0", 8).await.unwrap();
        assert_eq!(host.vfs_of("0000:01:00.0").len(), 8);
    }

    #[tokio::test]
    async fn test_bind_requires_loaded_module() {
        let host = pf_host();
        assert!(host.bind("0000:01:00.0", "vfio-pci").await.is_err());

        host.load_module("vfio-pci").await.unwrap();
        host.bind("0000:01:00.0", "vfio-pci").await.unwrap();
        assert_eq!(host.driver_of("0000:01:00.0").as_deref(), Some("vfio-pci"));
        assert_eq!(
            host.log(),
            vec![
                HostOp::LoadModule("vfio-pci".to_string()),
                HostOp::bind("0000:01:00.0", "vfio-pci"),
            ]
        );
    }

    #[tokio::test]
    async fn test_report_format() {
        let host = SimHost::new().with_device(SimDevice::new("0000:01:00.0").driver("ixgbe"));
        let report = host.driver_report("0000:01:00.0").await.unwrap();
        assert!(report.starts_with("01:00.0 Ethernet controller"));
        assert!(report.contains("Kernel driver in use: ixgbe"));
        assert_eq!(host.driver_report("0000:09:00.0").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_in_use_unbind_is_refused() {
        let host = SimHost::new()
            .with_device(SimDevice::new("0000:01:00.0").driver("ixgbe"))
            .with_in_use("0000:01:00.0");
        let out = host.unbind("0000:01:00.0").await.unwrap();
        assert!(out.contains("routing table"));
        assert_eq!(host.driver_of("0000:01:00.0").as_deref(), Some("ixgbe"));
        assert!(host.log().is_empty());
    }

    #[tokio::test]
    async fn test_unload_releases_bound_devices() {
        let host = SimHost::new()
            .with_device(SimDevice::new("0000:01:00.0").sriov(4))
            .with_loaded_module("ixgbevf")
            .with_vf_autoprobe("ixgbevf");
        host.set_num_vfs("0000:01:00.0", 2).await.unwrap();
        assert_eq!(host.driver_of("0000:01:10.0").as_deref(), Some("ixgbevf"));

        host.unload_module("ixgbevf").await.unwrap();
        assert_eq!(host.driver_of("0000:01:10.0"), None);
    }

    #[tokio::test]
    async fn test_hotplug_joins_group_after_trigger_bind() {
        let host = pf_host()
            .with_loaded_module("vfio-pci")
            .with_hotplug_on_bind("0000:01:00.0", SimDevice::new("0000:01:00.2").group("1"));
        assert_eq!(host.members_of("1"), vec!["0000:01:00.0"]);

        host.bind("0000:01:00.0", "vfio-pci").await.unwrap();
        assert_eq!(host.members_of("1"), vec!["0000:01:00.0", "0000:01:00.2"]);
    }
}
