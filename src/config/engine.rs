//! Engine configuration structure
//!
//! Every path and name the classifier and mutator rely on comes from here
//! instead of process-wide constants.

use crate::utils::error::{Result, StorixError};
use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// How swap targets are switched on and off
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Running system: go through `systemctl start/stop`
    #[default]
    Normal,
    /// Installer environment without a running systemd: `swapon`/`swapoff`
    Setup,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Normal => write!(f, "normal"),
            RunMode::Setup => write!(f, "setup"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Mount point of the root filesystem
    #[serde(default = "default_root_mount")]
    pub root_mount: String,
    /// Mount point of the boot partition (the ESP on EFI layouts)
    #[serde(default = "default_boot_mount")]
    pub boot_mount: String,
    /// Volume group holding root (and optional swap) logical volumes
    #[serde(default = "default_volume_group")]
    pub volume_group: String,
    #[serde(default = "default_root_lv")]
    pub root_lv: String,
    #[serde(default = "default_swap_lv")]
    pub swap_lv: String,
    /// Size of the ESP and of every reserved ESP-sized partition
    #[serde(default = "default_esp_size_mib")]
    pub esp_size_mib: u64,
    /// Swap file used by the simple layouts
    #[serde(default = "default_swap_file")]
    pub swap_file: String,
    /// Swap size override; twice the physical memory when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_size_mib: Option<u64>,
    /// Directory receiving generated `.swap` units
    #[serde(default = "default_unit_dir")]
    pub unit_dir: String,
    #[serde(default)]
    pub run_mode: RunMode,
}

fn default_root_mount() -> String {
    "/".to_string()
}

fn default_boot_mount() -> String {
    "/boot".to_string()
}

fn default_volume_group() -> String {
    "hdd".to_string()
}

fn default_root_lv() -> String {
    "root".to_string()
}

fn default_swap_lv() -> String {
    "swap".to_string()
}

fn default_esp_size_mib() -> u64 {
    512
}

fn default_swap_file() -> String {
    "/var/swap.dat".to_string()
}

fn default_unit_dir() -> String {
    "/etc/systemd/system".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root_mount: default_root_mount(),
            boot_mount: default_boot_mount(),
            volume_group: default_volume_group(),
            root_lv: default_root_lv(),
            swap_lv: default_swap_lv(),
            esp_size_mib: default_esp_size_mib(),
            swap_file: default_swap_file(),
            swap_size_mib: None,
            unit_dir: default_unit_dir(),
            run_mode: RunMode::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration written by `generate-config`
    pub fn sample() -> Self {
        Self::default()
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("root_mount", &self.root_mount),
            ("boot_mount", &self.boot_mount),
            ("swap_file", &self.swap_file),
            ("unit_dir", &self.unit_dir),
        ] {
            if !path.starts_with('/') {
                return Err(StorixError::ConfigError(format!(
                    "{} must be an absolute path, got '{}'",
                    name, path
                )));
            }
        }

        if self.swap_file.starts_with("/dev/") {
            return Err(StorixError::ConfigError(
                "swap_file must not point into /dev".to_string(),
            ));
        }

        for (name, value) in [
            ("volume_group", &self.volume_group),
            ("root_lv", &self.root_lv),
            ("swap_lv", &self.swap_lv),
        ] {
            if value.is_empty() || value.contains('/') || value.contains(char::is_whitespace) {
                return Err(StorixError::ConfigError(format!(
                    "{} '{}' is not a valid LVM name",
                    name, value
                )));
            }
        }
        if self.root_lv == self.swap_lv {
            return Err(StorixError::ConfigError(
                "root_lv and swap_lv must differ".to_string(),
            ));
        }

        if self.esp_size_mib < 32 {
            return Err(StorixError::ConfigError(
                "esp_size_mib must be at least 32".to_string(),
            ));
        }
        if self.swap_size_mib == Some(0) {
            return Err(StorixError::ConfigError(
                "swap_size_mib must be positive when set".to_string(),
            ));
        }

        Ok(())
    }

    pub fn esp_size_bytes(&self) -> u64 {
        self.esp_size_mib * MIB
    }

    /// Required swap size for a machine with `memory_bytes` of RAM
    ///
    /// Memory is counted in whole GiB rounded up by one, then doubled.
    pub fn swap_size_bytes(&self, memory_bytes: u64) -> u64 {
        match self.swap_size_mib {
            Some(mib) => mib * MIB,
            None => (memory_bytes / GIB + 1) * 2 * GIB,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_standard_layouts() {
        let config = EngineConfig::sample();
        assert_eq!(config.volume_group, "hdd");
        assert_eq!(config.esp_size_bytes(), 512 * MIB);
        assert_eq!(config.swap_file, "/var/swap.dat");
        assert_eq!(config.run_mode, RunMode::Normal);
        config.validate().unwrap();
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
volume_group = "pool"
run_mode = "setup"
swap_size_mib = 4096
"#,
        )
        .unwrap();
        assert_eq!(config.volume_group, "pool");
        assert_eq!(config.boot_mount, "/boot");
        assert_eq!(config.run_mode, RunMode::Setup);
        assert_eq!(config.swap_size_bytes(64 * GIB), 4 * GIB);
    }

    #[test]
    fn sample_round_trips_through_toml() {
        let text = EngineConfig::sample().to_toml().unwrap();
        let parsed: EngineConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, EngineConfig::sample());
    }

    #[test]
    fn swap_is_twice_rounded_memory() {
        let config = EngineConfig::default();
        // 15.5 GiB of RAM counts as 16
        assert_eq!(config.swap_size_bytes(15 * GIB + GIB / 2), 32 * GIB);
        assert_eq!(config.swap_size_bytes(8 * GIB), 18 * GIB);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let relative = EngineConfig {
            boot_mount: "boot".into(),
            ..EngineConfig::default()
        };
        assert!(relative.validate().is_err());

        let same_lv = EngineConfig {
            swap_lv: "root".into(),
            ..EngineConfig::default()
        };
        assert!(same_lv.validate().is_err());

        let tiny_esp = EngineConfig {
            esp_size_mib: 1,
            ..EngineConfig::default()
        };
        assert!(tiny_esp.validate().is_err());
    }
}
