//! Error types for the isolation loader.
//!
//! A resolution miss is not an error anywhere in this crate; it is an
//! `Option::None` that tells the caller to fall through to the default scope.

use std::path::PathBuf;

use crate::abi::{AddinStatus, Method};

/// Dependency manifest errors.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid manifest entry '{name}': {reason}")]
    InvalidEntry { name: String, reason: String },
}

/// Scope construction and loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Module path has no parent directory: {0}")]
    NoInstallDirectory(PathBuf),

    #[error("Failed to load module {path} into scope '{scope}': {reason}")]
    ModuleLoad {
        scope: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Dependency '{0}' not found in any scope")]
    DependencyNotFound(String),
}

/// Failure to construct an add-in type inside a scope.
#[derive(Debug, thiserror::Error)]
pub enum InstantiationError {
    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error("ABI version mismatch in {path}: expected {expected}, found {found}")]
    AbiMismatch {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    #[error("Module {path} does not export symbol '{symbol}'")]
    MissingSymbol { path: PathBuf, symbol: String },

    #[error("Type '{type_name}' has no accessible constructor")]
    NoConstructor { type_name: String },

    #[error("Constructor of '{type_name}' returned null")]
    NullInstance { type_name: String },
}

/// Defect in the binding between the relay and an isolated instance.
///
/// These indicate packaging or versioning mistakes and are surfaced loudly.
#[derive(Debug, thiserror::Error)]
pub enum RelayBindingError {
    #[error(transparent)]
    Instantiation(#[from] InstantiationError),

    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error("Type '{type_name}' has no method '{method}'")]
    MissingMethod { type_name: String, method: Method },

    #[error("Method '{method}' of '{type_name}' does not match signature '{expected}'")]
    SignatureMismatch {
        type_name: String,
        method: Method,
        expected: &'static str,
    },

    #[error("'{method}' on '{type_name}' returned {status}")]
    Status {
        type_name: String,
        method: Method,
        status: AddinStatus,
    },
}

pub type Result<T> = std::result::Result<T, ScopeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_error_display() {
        let err = RelayBindingError::MissingMethod {
            type_name: "sample::Addin".to_string(),
            method: Method::Deactivate,
        };
        assert_eq!(
            err.to_string(),
            "Type 'sample::Addin' has no method 'deactivate'"
        );

        let err = RelayBindingError::Status {
            type_name: "sample::Addin".to_string(),
            method: Method::Activate,
            status: AddinStatus::Panicked,
        };
        assert!(err.to_string().contains("panicked"));
    }

    #[test]
    fn test_scope_error_wraps_manifest_error() {
        let err: ScopeError = ManifestError::InvalidEntry {
            name: "libX".to_string(),
            reason: "empty path".to_string(),
        }
        .into();
        assert!(matches!(err, ScopeError::Manifest(_)));
        assert_eq!(err.to_string(), "Invalid manifest entry 'libX': empty path");
    }
}
