//! Scope-local dependency resolution.
//!
//! A resolver only ever looks inside one install directory. Anything it
//! cannot find is a miss, and the caller falls through to the host's
//! default scope.

use std::path::{Component, Path, PathBuf};

use crate::config::HostConfig;
use crate::error::ManifestError;
use crate::identity::{native_file_name, DependencyIdentity, DependencyKind};
use crate::manifest::DependencyManifest;

/// A successful scope-local resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub path: PathBuf,
    /// Declared version, absent for undeclared native libraries.
    pub version: Option<semver::Version>,
}

/// Maps dependency identities to files under one install directory.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    root: PathBuf,
    manifest: DependencyManifest,
    platform: String,
}

impl DependencyResolver {
    pub fn new(root: impl Into<PathBuf>, manifest: DependencyManifest, platform: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            manifest,
            platform: platform.into(),
        }
    }

    /// Resolver for `root` using the manifest file named in `config`.
    pub fn from_directory(root: &Path, config: &HostConfig) -> Result<Self, ManifestError> {
        let manifest = DependencyManifest::load_from_dir(root, &config.manifest_file)?;
        Ok(Self::new(root, manifest, config.platform()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &DependencyManifest {
        &self.manifest
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Resolve `identity` inside the install directory.
    ///
    /// Matching manifest entries are tried highest version first and the
    /// first one present on disk wins. Native libraries without a usable
    /// entry are looked up under their platform file name.
    pub fn resolve(&self, identity: &DependencyIdentity) -> Option<Resolution> {
        for entry in self.manifest.candidates(identity, &self.platform) {
            let Some(path) = self.contained(&entry.path) else {
                continue;
            };
            tracing::debug!(
                "Resolved {} to {} via manifest ({})",
                identity,
                path.display(),
                entry.version
            );
            return Some(Resolution {
                path,
                version: Some(entry.version.clone()),
            });
        }

        if identity.kind == DependencyKind::Native {
            let candidate = self.root.join(native_file_name(&identity.name));
            if candidate.is_file() {
                tracing::debug!("Resolved {} to {} by file name", identity, candidate.display());
                return Some(Resolution {
                    path: candidate,
                    version: None,
                });
            }
        }

        tracing::debug!(
            "{} not found under {}, falling through",
            identity,
            self.root.display()
        );
        None
    }

    /// Every manifest entry applicable to this platform that exists on disk.
    pub fn declared(&self) -> Vec<(DependencyIdentity, Resolution)> {
        self.manifest
            .dependencies
            .iter()
            .filter(|entry| {
                entry
                    .platform
                    .as_deref()
                    .map_or(true, |platform| platform == self.platform)
            })
            .filter_map(|entry| {
                let path = self.contained(&entry.path)?;
                let identity = DependencyIdentity {
                    name: entry.name.clone(),
                    version: Some(entry.version.clone()),
                    platform: entry.platform.clone(),
                    kind: entry.kind,
                };
                Some((
                    identity,
                    Resolution {
                        path,
                        version: Some(entry.version.clone()),
                    },
                ))
            })
            .collect()
    }

    /// Join a manifest path onto the root, rejecting escapes and missing files.
    fn contained(&self, relative: &Path) -> Option<PathBuf> {
        let mut depth = 0usize;
        for component in relative.components() {
            match component {
                Component::Normal(_) => depth += 1,
                Component::CurDir => {}
                Component::ParentDir if depth > 0 => depth -= 1,
                _ => {
                    tracing::warn!(
                        "Manifest path {} escapes {}",
                        relative.display(),
                        self.root.display()
                    );
                    return None;
                }
            }
        }

        let path = self.root.join(relative);
        if !path.is_file() {
            tracing::warn!("Manifest entry points to missing file {}", path.display());
            return None;
        }
        Some(path)
    }
}
