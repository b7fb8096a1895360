//! Dependency identities and platform naming.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a dependency is consumed by the add-in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// A module the add-in links against through the loader.
    #[default]
    Module,
    /// A plain native library opened by name at runtime.
    Native,
}

/// Name + optional version + optional platform of a requested dependency.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyIdentity {
    pub name: String,
    pub version: Option<semver::Version>,
    pub platform: Option<String>,
    pub kind: DependencyKind,
}

impl DependencyIdentity {
    pub fn module(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            platform: None,
            kind: DependencyKind::Module,
        }
    }

    pub fn native(name: impl Into<String>) -> Self {
        Self {
            kind: DependencyKind::Native,
            ..Self::module(name)
        }
    }

    pub fn with_version(mut self, version: semver::Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }
}

impl fmt::Display for DependencyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(version) = &self.version {
            write!(f, " {}", version)?;
        }
        if let Some(platform) = &self.platform {
            write!(f, " ({})", platform)?;
        }
        Ok(())
    }
}

/// Platform tag of the running process, e.g. `linux-x86_64`.
pub fn current_platform() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// File name a native library called `name` has on this platform.
///
/// `"X"` becomes `libX.so` on Linux and `X.dll` on Windows. Names that
/// already carry the platform prefix or suffix are not decorated twice.
pub fn native_file_name(name: &str) -> String {
    let prefix = std::env::consts::DLL_PREFIX;
    let suffix = std::env::consts::DLL_SUFFIX;

    let mut file_name = String::with_capacity(prefix.len() + name.len() + suffix.len());
    if !prefix.is_empty() && !name.starts_with(prefix) {
        file_name.push_str(prefix);
    }
    file_name.push_str(name);
    if !name.ends_with(suffix) {
        file_name.push_str(suffix);
    }
    file_name
}

/// Parse a version leniently: `"2"` and `"2.1"` are padded to full semver.
pub fn parse_version(raw: &str) -> Result<semver::Version, semver::Error> {
    let raw = raw.trim();
    let core = raw.split(['-', '+']).next().unwrap_or(raw);
    let padding = match core.matches('.').count() {
        0 => ".0.0",
        1 => ".0",
        _ => "",
    };
    if padding.is_empty() {
        return semver::Version::parse(raw);
    }
    let rest = &raw[core.len()..];
    semver::Version::parse(&format!("{}{}{}", core, padding, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_display() {
        let id = DependencyIdentity::module("libX")
            .with_version(semver::Version::new(1, 0, 0))
            .with_platform("linux-x86_64");
        assert_eq!(id.to_string(), "libX 1.0.0 (linux-x86_64)");
        assert_eq!(DependencyIdentity::native("zstd").to_string(), "zstd");
    }

    #[test]
    fn test_native_file_name_decorates_once() {
        let plain = native_file_name("zstd");
        assert!(plain.contains("zstd"));
        assert!(plain.ends_with(std::env::consts::DLL_SUFFIX));

        let decorated = native_file_name(&plain);
        assert_eq!(decorated, plain);
    }

    #[test]
    fn test_parse_version_pads_components() {
        assert_eq!(parse_version("2").unwrap(), semver::Version::new(2, 0, 0));
        assert_eq!(parse_version("1.4").unwrap(), semver::Version::new(1, 4, 0));
        assert_eq!(parse_version("3.2.1").unwrap(), semver::Version::new(3, 2, 1));
        let pre = parse_version("1.0-beta.1").unwrap();
        assert_eq!(pre.to_string(), "1.0.0-beta.1");
        assert!(parse_version("not-a-version").is_err());
    }

    #[test]
    fn test_current_platform_shape() {
        let platform = current_platform();
        assert!(platform.starts_with(std::env::consts::OS));
        assert!(platform.ends_with(std::env::consts::ARCH));
    }
}
