//! Configuration file handling.
//!
//! Every field has a default, so a missing file and an empty JSON object both
//! yield a working configuration. Values that end up inside privileged
//! commands are checked by `validate()` before use.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Runtime configuration for gpupilot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    // Elevation
    /// Polkit-style helper that runs its arguments as root
    pub elevation_helper: String,
    /// Shell the helper starts; it receives `-c <joined chain>`
    pub elevation_shell: String,

    // Drivers
    /// Open kernel module version used when the caller gives none
    pub open_kernel_default_version: String,

    // Snapshots
    pub snapshot_tool: String,
    pub snapshot_comment: String,

    // Repository optimization
    pub geolocation_url: String,
    pub geolocation_timeout_secs: u64,
    pub sources_list: String,
    pub mirror_host: String,
    pub mirror_path: String,

    /// Force simulated execution even on Linux
    pub simulate: bool,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            elevation_helper: "pkexec".to_string(),
            elevation_shell: "/bin/sh".to_string(),
            open_kernel_default_version: "535".to_string(),
            snapshot_tool: "timeshift".to_string(),
            snapshot_comment: "gpupilot automatic backup".to_string(),
            geolocation_url: "http://ip-api.com/json/".to_string(),
            geolocation_timeout_secs: 3,
            sources_list: "/etc/apt/sources.list".to_string(),
            mirror_host: "archive.ubuntu.com".to_string(),
            mirror_path: "/ubuntu".to_string(),
            simulate: false,
        }
    }
}

impl PilotConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Load `path` if given, defaults otherwise, then validate.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => Self::load_from_file(p)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.elevation_helper.trim().is_empty() {
            anyhow::bail!("Elevation helper must be specified");
        }
        if !self.elevation_shell.starts_with('/') {
            anyhow::bail!("Elevation shell must be an absolute path");
        }

        crate::package_manager::DriverVersion::parse(&self.open_kernel_default_version)
            .context("Invalid open_kernel_default_version")?;

        if self.geolocation_timeout_secs == 0 || self.geolocation_timeout_secs > 30 {
            anyhow::bail!("Geolocation timeout must be between 1 and 30 seconds");
        }
        if !self.geolocation_url.starts_with("http://") && !self.geolocation_url.starts_with("https://") {
            anyhow::bail!("Geolocation URL must be http(s)");
        }

        if !self.sources_list.starts_with('/') {
            anyhow::bail!("Sources list must be an absolute path");
        }
        // Spliced into a sed expression delimited by '|'
        let host_ok = !self.mirror_host.is_empty()
            && self
                .mirror_host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
        if !host_ok {
            anyhow::bail!("Mirror host may only contain letters, digits, '.' and '-'");
        }
        let path_ok = self.mirror_path.starts_with('/')
            && self
                .mirror_path
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_'));
        if !path_ok {
            anyhow::bail!("Mirror path must be an absolute URL path");
        }

        Ok(())
    }
}
