//! Shell command builders for device and module operations

use vfd_common::shell::{self, shellquote};

/// Marker printed by the bind tool when it refuses to unbind an interface
/// that still carries routes.
pub const IN_USE_MARKER: &str = "routing table indicates";

/// Build the driver report command for one device
pub fn build_lspci_cmd(id: &str) -> String {
    format!("{} -k -s {}", shell::LSPCI_CMD, shellquote(id))
}

/// Build the loaded module listing command
pub fn build_lsmod_cmd() -> String {
    shell::LSMOD_CMD.to_string()
}

/// Build a module load command (`modprobe` spelling)
pub fn build_modprobe_cmd(module: &str) -> String {
    format!("{} {}", shell::MODPROBE_CMD, shellquote(module))
}

/// Build a module unload command
pub fn build_rmmod_cmd(module: &str) -> String {
    format!("{} {}", shell::RMMOD_CMD, shellquote(module))
}

/// Build a forced unbind command
pub fn build_unbind_cmd(devbind: &str, id: &str) -> String {
    format!("{} -u --force {}", devbind, shellquote(id))
}

/// Build a forced bind command
pub fn build_bind_cmd(devbind: &str, driver: &str, id: &str) -> String {
    format!(
        "{} -b {} --force {}",
        devbind,
        shellquote(driver),
        shellquote(id)
    )
}

/// Returns true if unbind output reports the device is carrying live routes
pub fn is_in_use_output(output: &str) -> bool {
    output.to_ascii_lowercase().contains(IN_USE_MARKER)
}

/// `lsmod` spelling of a module name (`vfio-pci` -> `vfio_pci`)
pub fn module_key(name: &str) -> String {
    name.trim().replace('-', "_")
}

/// Returns true if `lsmod` output lists `module`
pub fn lsmod_lists(output: &str, module: &str) -> bool {
    let key = module_key(module);
    output
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .any(|name| name == key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_bind_cmd() {
        let cmd = build_bind_cmd("/usr/bin/dpdk-devbind", "vfio-pci", "0000:01:00.0");
        assert_eq!(
            cmd,
            "/usr/bin/dpdk-devbind -b \"vfio-pci\" --force \"0000:01:00.0\""
        );
    }

    #[test]
    fn test_build_unbind_and_lspci() {
        assert_eq!(
            build_unbind_cmd("dpdk-devbind", "0000:01:00.0"),
            "dpdk-devbind -u --force \"0000:01:00.0\""
        );
        assert!(build_lspci_cmd("0000:01:00.0").ends_with("-k -s \"0000:01:00.0\""));
        assert!(build_modprobe_cmd("vfio-pci").ends_with("modprobe \"vfio-pci\""));
    }

    #[test]
    fn test_in_use_detection() {
        assert!(is_in_use_output(
            "Warning: routing table indicates that interface 0000:01:00.0 is active. Not modifying"
        ));
        assert!(is_in_use_output("ROUTING TABLE INDICATES"));
        assert!(!is_in_use_output("Routing is fine"));
        assert!(!is_in_use_output(""));
    }

    #[test]
    fn test_lsmod_lists() {
        let output = "Module                  Size  Used by\n\
                      vfio_pci               61440  0\n\
                      vfio_iommu_type1       40960  0\n\
                      ixgbevf                73728  0";
        assert!(lsmod_lists(output, "vfio-pci"));
        assert!(lsmod_lists(output, "ixgbevf"));
        assert!(!lsmod_lists(output, "vfio"));
        assert!(!lsmod_lists(output, "Module"));
    }
}
