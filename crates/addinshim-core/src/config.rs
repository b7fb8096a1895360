//! Host configuration.
//!
//! Defaults live here so hosts, the SDK runtime and the CLI agree on them.
//! Values can come from a TOML file and are then overridden by environment
//! variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::identity::current_platform;
use crate::manifest::DEFAULT_MANIFEST_FILE;

/// Environment variable names.
pub mod env_vars {
    /// `auto`, `enabled` or `disabled`.
    pub const ISOLATION: &str = "ADDINSHIM_ISOLATION";
    /// Manifest file name inside install directories.
    pub const MANIFEST: &str = "ADDINSHIM_MANIFEST";
    /// Host default scope search paths, separated like `PATH`.
    pub const DEFAULT_PATH: &str = "ADDINSHIM_DEFAULT_PATH";
    /// Platform tag override.
    pub const PLATFORM: &str = "ADDINSHIM_PLATFORM";
    /// `true` for JSON log output in the CLI.
    pub const LOG_JSON: &str = "ADDINSHIM_LOG_JSON";
}

/// Whether private loading scopes should be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Use scopes when the loading backend supports them.
    #[default]
    Auto,
    /// Require scopes; falls back with a warning when unsupported.
    Enabled,
    /// Always run add-ins in the default scope.
    Disabled,
}

impl FromStr for IsolationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "enabled" | "on" | "true" => Ok(Self::Enabled),
            "disabled" | "off" | "false" => Ok(Self::Disabled),
            other => Err(ConfigError::InvalidValue {
                key: "isolation".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

/// Settings shared by every scope in a host process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub isolation: IsolationMode,
    pub manifest_file: String,
    pub default_search_paths: Vec<PathBuf>,
    pub platform: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationMode::Auto,
            manifest_file: DEFAULT_MANIFEST_FILE.to_string(),
            default_search_paths: Vec::new(),
            platform: None,
        }
    }
}

impl HostConfig {
    /// Read a TOML config file. Environment overrides are not applied.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Invalid values are logged and ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(env_vars::ISOLATION) {
            match raw.parse() {
                Ok(mode) => self.isolation = mode,
                Err(e) => tracing::warn!("Ignoring {}: {}", env_vars::ISOLATION, e),
            }
        }

        if let Some(manifest) = lookup(env_vars::MANIFEST).filter(|m| !m.trim().is_empty()) {
            self.manifest_file = manifest;
        }

        if let Some(paths) = lookup(env_vars::DEFAULT_PATH) {
            self.default_search_paths = std::env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }

        if let Some(platform) = lookup(env_vars::PLATFORM).filter(|p| !p.trim().is_empty()) {
            self.platform = Some(platform);
        }

        self
    }

    /// Effective platform tag.
    pub fn platform(&self) -> String {
        self.platform.clone().unwrap_or_else(current_platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.isolation, IsolationMode::Auto);
        assert_eq!(config.manifest_file, DEFAULT_MANIFEST_FILE);
        assert!(config.default_search_paths.is_empty());
        assert_eq!(config.platform(), current_platform());
    }

    #[test]
    fn test_isolation_mode_parse() {
        assert_eq!("AUTO".parse::<IsolationMode>().unwrap(), IsolationMode::Auto);
        assert_eq!("off".parse::<IsolationMode>().unwrap(), IsolationMode::Disabled);
        assert_eq!("enabled".parse::<IsolationMode>().unwrap(), IsolationMode::Enabled);
        assert!("sometimes".parse::<IsolationMode>().is_err());
    }

    #[test]
    fn test_overrides() {
        let joined = std::env::join_paths(["/opt/host/lib", "/usr/lib/host"]).unwrap();
        let vars: HashMap<&str, String> = HashMap::from([
            (env_vars::ISOLATION, "disabled".to_string()),
            (env_vars::MANIFEST, "deps.toml".to_string()),
            (env_vars::DEFAULT_PATH, joined.to_string_lossy().into_owned()),
            (env_vars::PLATFORM, "testos-testarch".to_string()),
        ]);

        let config = HostConfig::default().with_overrides(|key| vars.get(key).cloned());
        assert_eq!(config.isolation, IsolationMode::Disabled);
        assert_eq!(config.manifest_file, "deps.toml");
        assert_eq!(
            config.default_search_paths,
            vec![PathBuf::from("/opt/host/lib"), PathBuf::from("/usr/lib/host")]
        );
        assert_eq!(config.platform(), "testos-testarch");
    }

    #[test]
    fn test_invalid_override_is_ignored() {
        let config = HostConfig::default().with_overrides(|key| {
            (key == env_vars::ISOLATION).then(|| "maybe".to_string())
        });
        assert_eq!(config.isolation, IsolationMode::Auto);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addinshim.toml");
        std::fs::write(&path, "isolation = \"enabled\"\n").unwrap();

        let config = HostConfig::load(&path).unwrap();
        assert_eq!(config.isolation, IsolationMode::Enabled);
        assert_eq!(config.manifest_file, DEFAULT_MANIFEST_FILE);
    }
}
