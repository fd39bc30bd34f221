// Plugin configuration record - the persisted PEX state (pex_config.json)
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::types::{ChipType, DeviceConfig, PexStatus};

pub const PEX_CONFIG_FILE: &str = "pex_config.json";

pub const LIBRARY_MISSING_MSG: &str = "Unable to load library. please follow instructions on the help page";
pub const NEEDS_CONFIG_MSG: &str = "ERROR: Failure to set outputs. PEX needs to be configured.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PexConfig {
    pub pex_status: PexStatus,
    pub enable_requested: bool,  // Set only from the settings form
    pub auto_configure: bool,
    pub demo_mode: bool,
    pub default_ic_type: ChipType,
    pub default_smbus: u8,
    pub num_sip_stations: usize,  // Station count dev_configs was built for
    pub dev_configs: Vec<DeviceConfig>,
    pub discovered_devices: Vec<u8>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub warnmsg: String,  // Transient, cleared before every save
    pub debug: bool,
}

impl Default for PexConfig {
    fn default() -> Self {
        PexConfig {
            pex_status: PexStatus::Unconfigured,
            enable_requested: false,
            auto_configure: true,
            // Without Pi hardware there is nothing to drive, so simulate writes
            demo_mode: !cfg!(any(target_arch = "arm", target_arch = "aarch64")),
            default_ic_type: ChipType::Mcp23017,
            default_smbus: 1,
            num_sip_stations: 0,
            dev_configs: Vec::new(),
            discovered_devices: Vec::new(),
            warnmsg: String::new(),
            debug: false,
        }
    }
}

impl PexConfig {
    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join(PEX_CONFIG_FILE)
    }

    /// Load the record from `data_dir`, recreating it with defaults when missing or unreadable.
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        let path = Self::path_in(data_dir);
        match Self::load_from(&path) {
            Ok(config) => Ok(config),
            Err(e) => {
                if path.exists() {
                    warn!("PEX bad or missing hardware config ({:#}), creating default config", e);
                } else {
                    info!("No PEX config at {}, creating default config", path.display());
                }
                let config = PexConfig::default();
                config.save_to(&path)?;
                Ok(config)
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut parsed: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        parsed.sanitize();
        Ok(parsed)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        // Don't save temporary data
        let mut persisted = self.clone();
        persisted.warnmsg.clear();
        persisted.sanitize();

        let contents = serde_json::to_string_pretty(&persisted)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn sanitize(&mut self) {
        // Files written before enable_requested existed
        if self.pex_status.is_enabled() {
            self.enable_requested = true;
        }
        self.discovered_devices.sort_unstable();
        self.discovered_devices.dedup();
        self.warnmsg = self.warnmsg.trim().to_string();
        for dev in &mut self.dev_configs {
            if dev.last < dev.first {
                dev.last = dev.first;
            }
        }
    }

    /// Total number of stations the configured devices span
    pub fn num_pex_stations(&self) -> usize {
        self.dev_configs.iter().map(|d| d.span()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempdir().unwrap();
        let config = PexConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(config.pex_status, PexStatus::Unconfigured);
        assert!(!config.enable_requested);
        assert!(config.dev_configs.is_empty());
        assert!(PexConfig::path_in(dir.path()).exists());
    }

    #[test]
    fn broken_file_is_replaced() {
        let dir = tempdir().unwrap();
        std::fs::write(PexConfig::path_in(dir.path()), "{ not json").unwrap();
        let config = PexConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(config, PexConfig::default());
    }

    #[test]
    fn warning_is_not_persisted() {
        let dir = tempdir().unwrap();
        let path = PexConfig::path_in(dir.path());
        let mut config = PexConfig::default();
        config.warnmsg = NEEDS_CONFIG_MSG.to_string();
        config.dev_configs.push(DeviceConfig {
            bus_id: 1,
            hw_addr: 0x21,
            ic_type: ChipType::Pcf8574,
            first: 0,
            last: 8,
            active_low: true,
        });
        config.save_to(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("warnmsg"));

        let loaded = PexConfig::load_from(&path).unwrap();
        assert!(loaded.warnmsg.is_empty());
        assert_eq!(loaded.dev_configs, config.dev_configs);
        assert_eq!(loaded.num_pex_stations(), 8);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = PexConfig::path_in(dir.path());
        std::fs::write(&path, r#"{"pex_status": "enabled", "default_ic_type": "mcp2308"}"#).unwrap();
        let loaded = PexConfig::load_from(&path).unwrap();
        assert_eq!(loaded.pex_status, PexStatus::Enabled);
        assert!(loaded.enable_requested);
        assert_eq!(loaded.default_ic_type, ChipType::Mcp23008);
        assert_eq!(loaded.default_smbus, 1);
    }
}
