//! Live host backed by sysfs and the external device tools.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use vfd_common::shell::{self, DPDK_DEVBIND_CMD};
use vfd_common::{PciHost, VfdError, VfdResult};

use crate::commands::{
    build_bind_cmd, build_lsmod_cmd, build_lspci_cmd, build_modprobe_cmd, build_rmmod_cmd,
    build_unbind_cmd, lsmod_lists,
};

/// Default per-call limit for external tools.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// [`PciHost`] over `/sys` and `lspci`/`lsmod`/`modprobe`/`rmmod`/`dpdk-devbind`.
#[derive(Debug, Clone)]
pub struct SysfsHost {
    sysfs_root: PathBuf,
    devbind: String,
    timeout: Option<Duration>,
}

impl Default for SysfsHost {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl SysfsHost {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            devbind: DPDK_DEVBIND_CMD.to_string(),
            timeout: Some(DEFAULT_CALL_TIMEOUT),
        }
    }

    /// Uses a different bind tool (`dpdk_nic_bind`, `dpdk-devbind.py`).
    pub fn with_devbind(mut self, devbind: impl Into<String>) -> Self {
        self.devbind = devbind.into();
        self
    }

    /// Sets the per-call timeout; `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn device_dir(&self, id: &str) -> PathBuf {
        self.sysfs_root.join("bus/pci/devices").join(id)
    }

    fn group_dir(&self, group: &str) -> PathBuf {
        self.sysfs_root
            .join("kernel/iommu_groups")
            .join(group)
            .join("devices")
    }

    async fn read_attr(&self, id: &str, attr: &str) -> VfdResult<String> {
        let path = self.device_dir(id).join(attr);
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(value.trim().to_string()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(VfdError::discovery(
                id,
                format!("{} not present in the device tree", path.display()),
            )),
            Err(e) => Err(VfdError::io(path, e)),
        }
    }

    async fn run(&self, cmd: &str) -> VfdResult<String> {
        shell::exec_or_throw(cmd, self.timeout).await
    }
}

/// Last path component of a symlink target.
async fn link_name(path: &Path) -> io::Result<String> {
    let target = tokio::fs::read_link(path).await?;
    target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "link has no final component"))
}

#[async_trait]
impl PciHost for SysfsHost {
    async fn device_exists(&self, id: &str) -> VfdResult<bool> {
        let path = self.device_dir(id);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| VfdError::io(path, e))
    }

    async fn vendor_id(&self, id: &str) -> VfdResult<String> {
        let raw = self.read_attr(id, "vendor").await?;
        Ok(raw.trim_start_matches("0x").to_ascii_lowercase())
    }

    async fn class_code(&self, id: &str) -> VfdResult<String> {
        self.read_attr(id, "class").await
    }

    async fn iommu_group(&self, id: &str) -> VfdResult<Option<String>> {
        let path = self.device_dir(id).join("iommu_group");
        match link_name(&path).await {
            Ok(group) => Ok(Some(group)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(VfdError::io(path, e)),
        }
    }

    async fn group_members(&self, group: &str) -> VfdResult<Vec<String>> {
        let dir = self.group_dir(group);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(VfdError::discovery(
                    format!("iommu_group {}", group),
                    format!("{} does not exist", dir.display()),
                ))
            }
            Err(e) => return Err(VfdError::io(dir, e)),
        };

        let mut members = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| VfdError::io(dir.clone(), e))?
        {
            members.push(entry.file_name().to_string_lossy().into_owned());
        }
        members.sort();
        Ok(members)
    }

    async fn virtual_functions(&self, pf: &str) -> VfdResult<Vec<String>> {
        let dir = self.device_dir(pf);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| VfdError::io(dir.clone(), e))?;

        let mut vfs: Vec<(u32, String)> = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| VfdError::io(dir.clone(), e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(index) = name
                .strip_prefix("virtfn")
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            let path = entry.path();
            let vf = link_name(&path)
                .await
                .map_err(|e| VfdError::io(path.clone(), e))?;
            vfs.push((index, vf));
        }
        vfs.sort_by_key(|(index, _)| *index);
        Ok(vfs.into_iter().map(|(_, vf)| vf).collect())
    }

    async fn driver_report(&self, id: &str) -> VfdResult<String> {
        self.run(&build_lspci_cmd(id)).await
    }

    async fn is_module_loaded(&self, module: &str) -> VfdResult<bool> {
        let output = self.run(&build_lsmod_cmd()).await?;
        Ok(lsmod_lists(&output, module))
    }

    async fn load_module(&self, module: &str) -> VfdResult<()> {
        self.run(&build_modprobe_cmd(module)).await.map(|_| ())
    }

    async fn unload_module(&self, module: &str) -> VfdResult<()> {
        self.run(&build_rmmod_cmd(module)).await.map(|_| ())
    }

    async fn unbind(&self, id: &str) -> VfdResult<String> {
        let cmd = build_unbind_cmd(&self.devbind, id);
        let result = shell::exec_timeout(&cmd, self.timeout).await?;
        if !result.success() {
            return Err(VfdError::ShellCommandFailed {
                command: cmd,
                exit_code: result.exit_code,
                output: result.combined_output(),
            });
        }
        Ok(result.combined_output())
    }

    async fn bind(&self, id: &str, driver: &str) -> VfdResult<()> {
        self.run(&build_bind_cmd(&self.devbind, driver, id))
            .await
            .map(|_| ())
    }

    async fn set_num_vfs(&self, pf: &str, count: u32) -> VfdResult<()> {
        let path = self.device_dir(pf).join("sriov_numvfs");
        debug!(device = %pf, count = count, "Writing sriov_numvfs");
        tokio::fs::write(&path, format!("{}\n", count))
            .await
            .map_err(|e| VfdError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    const PF: &str = "0000:01:00.0";

    /// Lays out a PF with two VFs in group 20 under a temporary sysfs root.
    fn fake_sysfs() -> TempDir {
        let root = TempDir::new().unwrap();
        let devices = root.path().join("bus/pci/devices");
        let group = root.path().join("kernel/iommu_groups/20/devices");
        fs::create_dir_all(&group).unwrap();

        for id in [PF, "0000:01:10.0", "0000:01:10.2"] {
            let dir = devices.join(id);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("vendor"), "0x8086\n").unwrap();
            fs::write(dir.join("class"), "0x020000\n").unwrap();
        }
        let pf_dir = devices.join(PF);
        fs::write(pf_dir.join("sriov_numvfs"), "2\n").unwrap();
        symlink(root.path().join("kernel/iommu_groups/20"), pf_dir.join("iommu_group")).unwrap();
        symlink("../0000:01:10.2", pf_dir.join("virtfn1")).unwrap();
        symlink("../0000:01:10.0", pf_dir.join("virtfn0")).unwrap();
        fs::write(group.join(PF), "").unwrap();
        fs::write(group.join("0000:00:01.0"), "").unwrap();
        root
    }

    #[tokio::test]
    async fn test_identity_and_topology() {
        let root = fake_sysfs();
        let host = SysfsHost::new(root.path());

        assert!(host.device_exists(PF).await.unwrap());
        assert!(!host.device_exists("0000:09:00.0").await.unwrap());
        assert_eq!(host.vendor_id(PF).await.unwrap(), "8086");
        assert_eq!(host.class_code(PF).await.unwrap(), "0x020000");
        assert_eq!(host.iommu_group(PF).await.unwrap().as_deref(), Some("20"));
        assert_eq!(host.iommu_group("0000:01:10.0").await.unwrap(), None);
        assert_eq!(
            host.group_members("20").await.unwrap(),
            vec!["0000:00:01.0", PF]
        );
        assert_eq!(
            host.virtual_functions(PF).await.unwrap(),
            vec!["0000:01:10.0", "0000:01:10.2"]
        );
    }

    #[tokio::test]
    async fn test_missing_group_and_attribute() {
        let root = fake_sysfs();
        let host = SysfsHost::new(root.path());

        let err = host.group_members("99").await.unwrap_err();
        assert!(matches!(err, VfdError::Discovery { .. }));

        let err = host.vendor_id("0000:09:00.0").await.unwrap_err();
        assert_eq!(err.device(), Some("0000:09:00.0"));
    }

    #[tokio::test]
    async fn test_set_num_vfs_writes_attribute() {
        let root = fake_sysfs();
        let host = SysfsHost::new(root.path());

        host.set_num_vfs(PF, 0).await.unwrap();
        let attr = root.path().join("bus/pci/devices").join(PF).join("sriov_numvfs");
        let written = fs::read_to_string(attr).unwrap();
        assert_eq!(written, "0\n");

        assert!(host.set_num_vfs("0000:09:00.0", 4).await.is_err());
    }

    #[tokio::test]
    async fn test_unbind_tool_failure() {
        let host = SysfsHost::new("/nonexistent").with_devbind("/bin/false");
        let err = host.unbind(PF).await.unwrap_err();
        assert!(matches!(err, VfdError::ShellCommandFailed { .. }));

        let host = SysfsHost::new("/nonexistent").with_devbind("/bin/echo");
        let output = host.unbind(PF).await.unwrap();
        assert!(output.contains("-u --force"));
    }
}
