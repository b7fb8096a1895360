//! Per-directory dependency manifest.
//!
//! Each add-in install directory may carry a TOML deployment descriptor
//! listing the exact file of every dependency it ships:
//!
//! ```toml
//! [addin]
//! name = "SampleAddin"
//! module = "libsample_addin.so"
//!
//! [[dependencies]]
//! name = "libX"
//! version = "1.0.0"
//! kind = "module"
//! path = "deps/libX.so"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ManifestError;
use crate::identity::{parse_version, DependencyIdentity, DependencyKind};

/// Default manifest file name inside an install directory.
pub const DEFAULT_MANIFEST_FILE: &str = "addin.deps.toml";

/// Optional description of the add-in itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddinSection {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// One shipped dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    #[serde(deserialize_with = "deserialize_version")]
    pub version: semver::Version,
    #[serde(default)]
    pub kind: DependencyKind,
    #[serde(default)]
    pub platform: Option<String>,
    /// Path relative to the install directory.
    pub path: PathBuf,
}

impl ManifestEntry {
    /// Whether this entry satisfies `identity` on `platform`.
    pub fn matches(&self, identity: &DependencyIdentity, platform: &str) -> bool {
        if self.name != identity.name || self.kind != identity.kind {
            return false;
        }

        let wanted_platform = identity.platform.as_deref().unwrap_or(platform);
        if let Some(entry_platform) = &self.platform {
            if entry_platform != wanted_platform {
                return false;
            }
        }

        match &identity.version {
            None => true,
            Some(requested) => match semver::VersionReq::parse(&format!("^{}", requested)) {
                Ok(req) => req.matches(&self.version),
                Err(_) => &self.version == requested,
            },
        }
    }
}

/// Parsed dependency manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyManifest {
    #[serde(default)]
    pub addin: Option<AddinSection>,
    #[serde(default)]
    pub dependencies: Vec<ManifestEntry>,
}

impl DependencyManifest {
    /// Parse manifest text. `origin` is only used for error messages.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, ManifestError> {
        let manifest: Self = toml::from_str(text).map_err(|source| ManifestError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Load `file_name` from `dir`, or an empty manifest if it does not exist.
    pub fn load_from_dir(dir: &Path, file_name: &str) -> Result<Self, ManifestError> {
        let path = dir.join(file_name);
        if !path.is_file() {
            tracing::debug!("No dependency manifest at {}", path.display());
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// Best entry for `identity`: the highest matching version.
    pub fn find(&self, identity: &DependencyIdentity, platform: &str) -> Option<&ManifestEntry> {
        self.candidates(identity, platform).into_iter().next()
    }

    /// Every entry matching `identity`, highest version first.
    pub fn candidates(&self, identity: &DependencyIdentity, platform: &str) -> Vec<&ManifestEntry> {
        let mut matching: Vec<&ManifestEntry> = self
            .dependencies
            .iter()
            .filter(|entry| entry.matches(identity, platform))
            .collect();
        matching.sort_by(|a, b| b.version.cmp(&a.version));
        matching
    }

    fn validate(&self) -> Result<(), ManifestError> {
        for entry in &self.dependencies {
            if entry.name.trim().is_empty() {
                return Err(ManifestError::InvalidEntry {
                    name: entry.name.clone(),
                    reason: "empty name".to_string(),
                });
            }
            if entry.path.as_os_str().is_empty() {
                return Err(ManifestError::InvalidEntry {
                    name: entry.name.clone(),
                    reason: "empty path".to_string(),
                });
            }
            if entry.path.is_absolute() {
                return Err(ManifestError::InvalidEntry {
                    name: entry.name.clone(),
                    reason: format!(
                        "path {} must be relative to the install directory",
                        entry.path.display()
                    ),
                });
            }
        }
        Ok(())
    }
}

fn deserialize_version<'de, D>(deserializer: D) -> Result<semver::Version, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_version(&raw).map_err(serde::de::Error::custom)
}
