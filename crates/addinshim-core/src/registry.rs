//! Isolation scope registry.
//!
//! Maps install directories to their scopes. Exactly one scope exists per
//! directory for the lifetime of the registry; scopes are created on first
//! use and never torn down.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::abi::{LINK_PASS_THROUGH, LINK_PRIVATE_SCOPES};
use crate::config::{HostConfig, IsolationMode};
use crate::dispatch::PluginInstance;
use crate::error::{InstantiationError, ScopeError};
use crate::identity::DependencyIdentity;
use crate::loader::{ModuleBackend, NativeBackend};
use crate::report::UserReporter;
use crate::scope::{AddinType, DefaultScope, DependencySource, IsolationScope, LoadedDependency};

/// Whether private scopes can be used in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationCapability {
    PrivateScopes,
    PassThrough,
}

impl IsolationCapability {
    /// Code handed to modules in `HostLink::capability`.
    pub fn to_raw(self) -> u32 {
        match self {
            IsolationCapability::PrivateScopes => LINK_PRIVATE_SCOPES,
            IsolationCapability::PassThrough => LINK_PASS_THROUGH,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            LINK_PRIVATE_SCOPES => Some(IsolationCapability::PrivateScopes),
            LINK_PASS_THROUGH => Some(IsolationCapability::PassThrough),
            _ => None,
        }
    }
}

/// Scope state at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeSnapshot {
    pub name: String,
    pub install_directory: PathBuf,
    pub namespace: Option<i64>,
    pub dependencies: Vec<LoadedDependency>,
}

/// Registry state at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub capability: IsolationCapability,
    pub scopes: Vec<ScopeSnapshot>,
    pub default_dependencies: Vec<LoadedDependency>,
}

/// Owns every isolation scope of a host process.
pub struct ScopeRegistry {
    config: HostConfig,
    backend: Arc<dyn ModuleBackend>,
    scopes: Mutex<HashMap<PathBuf, Arc<IsolationScope>>>,
    default_scope: DefaultScope,
}

impl std::fmt::Debug for ScopeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeRegistry")
            .field("config", &self.config)
            .field("scopes", &self.scopes.lock().len())
            .finish_non_exhaustive()
    }
}

impl ScopeRegistry {
    pub fn new(backend: Arc<dyn ModuleBackend>, config: HostConfig) -> Self {
        let default_scope = DefaultScope::new(config.default_search_paths.clone(), backend.clone());
        Self {
            config,
            backend,
            scopes: Mutex::new(HashMap::new()),
            default_scope,
        }
    }

    /// Registry backed by the platform's native loader.
    pub fn native(config: HostConfig) -> Self {
        Self::new(Arc::new(NativeBackend::new()), config)
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn default_scope(&self) -> &DefaultScope {
        &self.default_scope
    }

    /// Combine configuration with backend support.
    pub fn capability(&self) -> IsolationCapability {
        let supported = self.backend.supports_private_namespaces();
        match self.config.isolation {
            IsolationMode::Disabled => IsolationCapability::PassThrough,
            IsolationMode::Auto if supported => IsolationCapability::PrivateScopes,
            IsolationMode::Enabled if supported => IsolationCapability::PrivateScopes,
            IsolationMode::Auto => IsolationCapability::PassThrough,
            IsolationMode::Enabled => {
                tracing::warn!(
                    "Isolation requested but the loading backend has no private namespaces"
                );
                IsolationCapability::PassThrough
            }
        }
    }

    /// Whether `addin_type` already runs inside a private scope.
    pub fn is_isolated(&self, addin_type: &AddinType) -> bool {
        addin_type.context().is_isolated()
    }

    /// Scope for the directory `addin_type`'s module was installed into.
    pub fn get_or_create_scope(&self, addin_type: &AddinType) -> Result<Arc<IsolationScope>, ScopeError> {
        let dir = addin_type
            .install_directory()
            .ok_or_else(|| ScopeError::NoInstallDirectory(addin_type.module_path().to_path_buf()))?;
        self.scope_for_directory(dir)
    }

    /// Scope for an install directory, created on first use.
    pub fn scope_for_directory(&self, dir: &Path) -> Result<Arc<IsolationScope>, ScopeError> {
        let key = normalize(dir);

        let mut scopes = self.scopes.lock();
        if let Some(scope) = scopes.get(&key) {
            return Ok(scope.clone());
        }

        let scope = Arc::new(IsolationScope::open(
            key.clone(),
            &self.config,
            self.backend.clone(),
        )?);
        tracing::info!(
            scope = scope.name(),
            "Created isolation scope for {}",
            key.display()
        );
        scopes.insert(key, scope.clone());
        Ok(scope)
    }

    /// Existing scope for an install directory, without creating one.
    pub fn find_scope_for_directory(&self, dir: &Path) -> Option<Arc<IsolationScope>> {
        self.scopes.lock().get(&normalize(dir)).cloned()
    }

    /// Existing scope with the given name.
    pub fn find_scope(&self, name: &str) -> Option<Arc<IsolationScope>> {
        self.scopes
            .lock()
            .values()
            .find(|scope| scope.name() == name)
            .cloned()
    }

    /// All scopes, ordered by install directory.
    pub fn scopes(&self) -> Vec<Arc<IsolationScope>> {
        let mut scopes: Vec<_> = self.scopes.lock().values().cloned().collect();
        scopes.sort_by(|a, b| a.install_directory().cmp(b.install_directory()));
        scopes
    }

    /// Scope-local resolution only. `None` means fall through.
    pub fn resolve_dependency(
        &self,
        scope: &IsolationScope,
        identity: &DependencyIdentity,
    ) -> Option<PathBuf> {
        scope.resolve(identity).map(|resolution| resolution.path)
    }

    /// Construct `addin_type` inside `scope`. Failures the instance
    /// contains are reported to `reporter`.
    pub fn instantiate(
        &self,
        scope: &IsolationScope,
        addin_type: &AddinType,
        reporter: Arc<dyn UserReporter>,
    ) -> Result<PluginInstance, InstantiationError> {
        scope.instantiate(addin_type, reporter)
    }

    /// Construct `addin_type` through the default scope, like a plain host.
    /// The module is told this registry's capability.
    pub fn instantiate_default(
        &self,
        addin_type: &AddinType,
        reporter: Arc<dyn UserReporter>,
    ) -> Result<PluginInstance, InstantiationError> {
        self.default_scope
            .instantiate(addin_type, self.capability(), reporter)
    }

    /// Load a dependency: scope first, then the default scope.
    pub fn load_dependency(
        &self,
        scope: Option<&IsolationScope>,
        identity: &DependencyIdentity,
    ) -> Result<DependencySource, ScopeError> {
        if let Some(scope) = scope {
            if let Some(dependency) = scope.load_dependency(identity)? {
                return Ok(DependencySource::Scope {
                    scope_name: scope.name().to_string(),
                    dependency,
                });
            }
        }
        self.default_scope.load(identity).map(DependencySource::Default)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let scopes = self
            .scopes()
            .into_iter()
            .map(|scope| ScopeSnapshot {
                name: scope.name().to_string(),
                install_directory: scope.install_directory().to_path_buf(),
                namespace: scope.namespace().id(),
                dependencies: scope.loaded_dependencies(),
            })
            .collect();

        RegistrySnapshot {
            capability: self.capability(),
            scopes,
            default_dependencies: self.default_scope.loaded_dependencies(),
        }
    }
}

fn normalize(dir: &Path) -> PathBuf {
    dir.canonicalize()
        .or_else(|_| std::path::absolute(dir))
        .unwrap_or_else(|_| dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{LoadError, LoadedModule, PrivateNamespace};

    struct NoopBackend {
        private: bool,
    }

    impl ModuleBackend for NoopBackend {
        fn supports_private_namespaces(&self) -> bool {
            self.private
        }

        fn open_default(&self, path: &Path) -> Result<Arc<dyn LoadedModule>, LoadError> {
            Err(LoadError(format!("not loadable: {}", path.display())))
        }

        fn open_private(
            &self,
            path: &Path,
            _namespace: &mut PrivateNamespace,
        ) -> Result<Arc<dyn LoadedModule>, LoadError> {
            Err(LoadError(format!("not loadable: {}", path.display())))
        }
    }

    fn registry(private: bool, isolation: IsolationMode) -> ScopeRegistry {
        let config = HostConfig {
            isolation,
            ..HostConfig::default()
        };
        ScopeRegistry::new(Arc::new(NoopBackend { private }), config)
    }

    #[test]
    fn test_capability_matrix() {
        assert_eq!(
            registry(true, IsolationMode::Auto).capability(),
            IsolationCapability::PrivateScopes
        );
        assert_eq!(
            registry(false, IsolationMode::Auto).capability(),
            IsolationCapability::PassThrough
        );
        assert_eq!(
            registry(true, IsolationMode::Disabled).capability(),
            IsolationCapability::PassThrough
        );
        assert_eq!(
            registry(false, IsolationMode::Enabled).capability(),
            IsolationCapability::PassThrough
        );
    }

    #[test]
    fn test_scope_is_created_once_per_directory() {
        let root = tempfile::tempdir().unwrap();
        let a = root.path().join("AddinA");
        std::fs::create_dir(&a).unwrap();

        let registry = registry(true, IsolationMode::Auto);
        let first = registry
            .get_or_create_scope(&AddinType::new("a::A", a.join("liba.so")))
            .unwrap();
        let second = registry
            .get_or_create_scope(&AddinType::new("a::Other", a.join("liba.so")))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "AddinA");
        assert_eq!(registry.scopes().len(), 1);
        assert!(registry.find_scope("AddinA").is_some());
    }

    #[test]
    fn test_module_without_directory_has_no_scope() {
        let registry = registry(true, IsolationMode::Auto);
        let err = registry
            .get_or_create_scope(&AddinType::new("a::A", "liba.so"))
            .unwrap_err();
        assert!(matches!(err, ScopeError::NoInstallDirectory(_)));
    }

    #[test]
    fn test_malformed_manifest_fails_scope_creation() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join(crate::manifest::DEFAULT_MANIFEST_FILE),
            "[[dependencies]]\nname = 3\n",
        )
        .unwrap();

        let registry = registry(true, IsolationMode::Auto);
        let err = registry.scope_for_directory(root.path()).unwrap_err();
        assert!(matches!(err, ScopeError::Manifest(_)));
        assert!(registry.scopes().is_empty());
    }

    #[test]
    fn test_unresolvable_dependency_is_not_found() {
        let registry = registry(true, IsolationMode::Auto);
        let err = registry
            .load_dependency(None, &DependencyIdentity::module("libNowhere"))
            .unwrap_err();
        assert!(matches!(err, ScopeError::DependencyNotFound(_)));
    }
}
