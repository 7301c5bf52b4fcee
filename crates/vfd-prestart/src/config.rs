//! Loading of the declared device set from the VF daemon's `vfd.cfg`
//!
//! The file is shared with the daemon itself, so every key except
//! `pciids` is ignored, as are unknown keys inside each entry (`mtu`,
//! `enable_loopback`, per-VF settings).

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use vfd_common::{PciAddress, VfdError, VfdResult};

use crate::types::DeviceSpec;

/// Default location of the daemon parameter file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vfd/vfd.cfg";

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    pciids: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    id: String,
    pf_driver: String,
    vf_driver: String,
    vfs_count: u32,
}

/// Parses the `pciids` list out of a `vfd.cfg` document.
pub fn parse_config(text: &str) -> VfdResult<Vec<DeviceSpec>> {
    let raw: RawConfig = serde_json::from_str(text)
        .map_err(|e| VfdError::config("vfd.cfg", format!("not valid JSON: {}", e)))?;

    let entries = raw
        .pciids
        .ok_or_else(|| VfdError::config("pciids", "missing"))?;
    if entries.is_empty() {
        return Err(VfdError::config("pciids", "no devices declared"));
    }

    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(entries.len());
    for (index, value) in entries.into_iter().enumerate() {
        let field = format!("pciids[{}]", index);
        let spec = parse_entry(&field, value)?;
        if !seen.insert(spec.id.clone()) {
            return Err(VfdError::config(
                field,
                format!("duplicate device id {}", spec.id),
            ));
        }
        debug!(
            device = %spec.id,
            pf_driver = %spec.pf_driver,
            vf_driver = %spec.vf_driver,
            vfs_count = spec.vfs_count,
            "Declared device"
        );
        specs.push(spec);
    }
    Ok(specs)
}

fn parse_entry(field: &str, value: Value) -> VfdResult<DeviceSpec> {
    if let Value::String(id) = &value {
        return Err(VfdError::config(
            field,
            format!(
                "bare device id \"{}\" is not supported; use an object with id, pf_driver, vf_driver and vfs_count",
                id
            ),
        ));
    }
    if !value.is_object() {
        return Err(VfdError::config(field, "entry must be an object"));
    }

    let entry: RawEntry =
        serde_json::from_value(value).map_err(|e| VfdError::config(field, e.to_string()))?;

    let id: PciAddress = entry
        .id
        .parse()
        .map_err(|e: vfd_common::pci::PciAddressError| VfdError::config(field, e.to_string()))?;

    for (name, driver) in [("pf_driver", &entry.pf_driver), ("vf_driver", &entry.vf_driver)] {
        if driver.trim().is_empty() {
            return Err(VfdError::config(
                format!("{}.{}", field, name),
                "driver name is empty",
            ));
        }
    }

    Ok(DeviceSpec::new(
        id,
        entry.pf_driver.trim(),
        entry.vf_driver.trim(),
        entry.vfs_count,
    ))
}

/// Reads and parses `path`. An unreadable file is a configuration error.
pub async fn load_config(path: &Path) -> VfdResult<Vec<DeviceSpec>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| VfdError::config(path.display().to_string(), e.to_string()))?;
    parse_config(&text)
}
