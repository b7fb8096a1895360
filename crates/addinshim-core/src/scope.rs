//! Isolation scopes and the host default scope.
//!
//! An [`IsolationScope`] owns one private namespace and resolves every
//! dependency from its install directory first. The [`DefaultScope`] is the
//! host's shared namespace that misses fall through to.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::bridge::HostBridge;
use crate::config::HostConfig;
use crate::dispatch::{bind_module, DispatchTable, PluginInstance};
use crate::error::{InstantiationError, ScopeError};
use crate::identity::{native_file_name, DependencyIdentity, DependencyKind};
use crate::loader::{LoadedModule, ModuleBackend, PrivateNamespace};
use crate::registry::IsolationCapability;
use crate::report::UserReporter;
use crate::resolver::{DependencyResolver, Resolution};

/// Display name of the host default load context.
pub const DEFAULT_CONTEXT_NAME: &str = "<default>";

/// The load context a module was loaded through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LoadContext {
    #[default]
    Default,
    Isolated { scope_name: String },
}

impl LoadContext {
    pub fn isolated(scope_name: impl Into<String>) -> Self {
        Self::Isolated {
            scope_name: scope_name.into(),
        }
    }

    /// Decode the context name passed across the C ABI. Empty means default.
    pub fn from_wire(name: &str) -> Self {
        if name.is_empty() {
            Self::Default
        } else {
            Self::isolated(name)
        }
    }

    /// Name passed across the C ABI.
    pub fn wire_name(&self) -> &str {
        match self {
            Self::Default => "",
            Self::Isolated { scope_name } => scope_name,
        }
    }

    pub fn is_isolated(&self) -> bool {
        matches!(self, Self::Isolated { .. })
    }
}

impl fmt::Display for LoadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str(DEFAULT_CONTEXT_NAME),
            Self::Isolated { scope_name } => f.write_str(scope_name),
        }
    }
}

/// Runtime handle of an add-in type: its name, defining module and the
/// context that module was loaded through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddinType {
    type_name: String,
    module_path: PathBuf,
    context: LoadContext,
}

impl AddinType {
    /// A type whose module was loaded through the default context.
    pub fn new(type_name: impl Into<String>, module_path: impl Into<PathBuf>) -> Self {
        Self {
            type_name: type_name.into(),
            module_path: module_path.into(),
            context: LoadContext::Default,
        }
    }

    pub fn with_context(mut self, context: LoadContext) -> Self {
        self.context = context;
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn module_path(&self) -> &Path {
        &self.module_path
    }

    pub fn context(&self) -> &LoadContext {
        &self.context
    }

    /// Directory the defining module was installed into.
    pub fn install_directory(&self) -> Option<&Path> {
        self.module_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
    }
}

/// A dependency a scope actually loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedDependency {
    pub name: String,
    pub version: Option<semver::Version>,
    pub kind: DependencyKind,
    pub path: PathBuf,
}

impl LoadedDependency {
    fn new(identity: &DependencyIdentity, path: PathBuf, version: Option<semver::Version>) -> Self {
        Self {
            name: identity.name.clone(),
            version,
            kind: identity.kind,
            path,
        }
    }
}

/// Where a loaded dependency came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencySource {
    Scope {
        scope_name: String,
        dependency: LoadedDependency,
    },
    Default(LoadedDependency),
}

impl DependencySource {
    pub fn dependency(&self) -> &LoadedDependency {
        match self {
            Self::Scope { dependency, .. } => dependency,
            Self::Default(dependency) => dependency,
        }
    }

    pub fn context_name(&self) -> &str {
        match self {
            Self::Scope { scope_name, .. } => scope_name,
            Self::Default(_) => DEFAULT_CONTEXT_NAME,
        }
    }
}

fn record(ledger: &mut Vec<LoadedDependency>, dependency: LoadedDependency) {
    if !ledger.iter().any(|d| d.path == dependency.path) {
        ledger.push(dependency);
    }
}

#[derive(Default)]
struct ScopeState {
    namespace: PrivateNamespace,
    preloaded: bool,
    modules: HashMap<PathBuf, Arc<dyn LoadedModule>>,
    dependencies: Vec<LoadedDependency>,
    tables: HashMap<(PathBuf, String), Arc<DispatchTable>>,
}

/// One private loading boundary rooted at an add-in install directory.
pub struct IsolationScope {
    name: String,
    install_directory: PathBuf,
    resolver: DependencyResolver,
    backend: Arc<dyn ModuleBackend>,
    state: Mutex<ScopeState>,
}

impl fmt::Debug for IsolationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationScope")
            .field("name", &self.name)
            .field("install_directory", &self.install_directory)
            .finish_non_exhaustive()
    }
}

impl IsolationScope {
    /// Open a scope for `install_directory`. The scope name is the
    /// directory's leaf name.
    pub(crate) fn open(
        install_directory: PathBuf,
        config: &HostConfig,
        backend: Arc<dyn ModuleBackend>,
    ) -> Result<Self, ScopeError> {
        let name = install_directory
            .file_name()
            .map(|leaf| leaf.to_string_lossy().into_owned())
            .unwrap_or_else(|| install_directory.display().to_string());
        let resolver = DependencyResolver::from_directory(&install_directory, config)?;

        Ok(Self {
            name,
            install_directory,
            resolver,
            backend,
            state: Mutex::new(ScopeState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn install_directory(&self) -> &Path {
        &self.install_directory
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    pub fn context(&self) -> LoadContext {
        LoadContext::isolated(self.name.clone())
    }

    /// Backend namespace of this scope, empty until the first load.
    pub fn namespace(&self) -> PrivateNamespace {
        self.state.lock().namespace
    }

    /// Scope-local resolution. `None` means fall through.
    pub fn resolve(&self, identity: &DependencyIdentity) -> Option<Resolution> {
        self.resolver.resolve(identity)
    }

    /// Load a module into this scope's namespace.
    ///
    /// The first load preloads every declared dependency so the module's
    /// own links bind to the scope's copies.
    pub fn load_module(&self, path: &Path) -> Result<Arc<dyn LoadedModule>, ScopeError> {
        let mut state = self.state.lock();
        self.preload(&mut state);
        self.open_locked(&mut state, path)
    }

    /// Resolve and load a dependency into this scope. `Ok(None)` on a miss.
    pub fn load_dependency(
        &self,
        identity: &DependencyIdentity,
    ) -> Result<Option<LoadedDependency>, ScopeError> {
        let Some(resolution) = self.resolve(identity) else {
            return Ok(None);
        };

        let mut state = self.state.lock();
        self.open_locked(&mut state, &resolution.path)?;
        let dependency = LoadedDependency::new(identity, resolution.path, resolution.version);
        record(&mut state.dependencies, dependency.clone());
        Ok(Some(dependency))
    }

    /// Dependencies loaded so far, in load order.
    pub fn loaded_dependencies(&self) -> Vec<LoadedDependency> {
        self.state.lock().dependencies.clone()
    }

    /// Construct `addin_type` inside this scope. Failures the instance
    /// contains are reported to `reporter`.
    pub fn instantiate(
        &self,
        addin_type: &AddinType,
        reporter: Arc<dyn UserReporter>,
    ) -> Result<PluginInstance, InstantiationError> {
        let module = self.load_module(addin_type.module_path())?;
        let table = self.dispatch_table(&module, addin_type.type_name())?;
        tracing::debug!(
            scope = %self.name,
            type_name = addin_type.type_name(),
            "Instantiating add-in inside scope"
        );
        let bridge = HostBridge::new(IsolationCapability::PrivateScopes, reporter);
        PluginInstance::create(module, table, addin_type, self.context(), bridge)
    }

    fn dispatch_table(
        &self,
        module: &Arc<dyn LoadedModule>,
        type_name: &str,
    ) -> Result<Arc<DispatchTable>, InstantiationError> {
        let key = (module.path().to_path_buf(), type_name.to_string());
        let mut state = self.state.lock();
        if let Some(table) = state.tables.get(&key) {
            return Ok(table.clone());
        }
        let table = Arc::new(bind_module(module.as_ref(), type_name)?);
        state.tables.insert(key, table.clone());
        Ok(table)
    }

    fn open_locked(
        &self,
        state: &mut ScopeState,
        path: &Path,
    ) -> Result<Arc<dyn LoadedModule>, ScopeError> {
        if let Some(module) = state.modules.get(path) {
            return Ok(module.clone());
        }

        let module = self
            .backend
            .open_private(path, &mut state.namespace)
            .map_err(|e| ScopeError::ModuleLoad {
                scope: self.name.clone(),
                path: path.to_path_buf(),
                reason: e.0,
            })?;
        state.modules.insert(path.to_path_buf(), module.clone());
        Ok(module)
    }

    fn preload(&self, state: &mut ScopeState) {
        if state.preloaded {
            return;
        }
        state.preloaded = true;

        for (identity, resolution) in self.resolver.declared() {
            match self.open_locked(state, &resolution.path) {
                Ok(_) => {
                    let dependency =
                        LoadedDependency::new(&identity, resolution.path, resolution.version);
                    record(&mut state.dependencies, dependency);
                }
                Err(e) => tracing::warn!("Failed to preload {} into '{}': {}", identity, self.name, e),
            }
        }
    }
}

#[derive(Default)]
struct DefaultState {
    modules: HashMap<PathBuf, Arc<dyn LoadedModule>>,
    dependencies: Vec<LoadedDependency>,
}

/// The host's shared namespace, searched through configured paths.
pub struct DefaultScope {
    search_paths: Vec<PathBuf>,
    backend: Arc<dyn ModuleBackend>,
    state: Mutex<DefaultState>,
}

impl fmt::Debug for DefaultScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultScope")
            .field("search_paths", &self.search_paths)
            .finish_non_exhaustive()
    }
}

impl DefaultScope {
    pub(crate) fn new(search_paths: Vec<PathBuf>, backend: Arc<dyn ModuleBackend>) -> Self {
        Self {
            search_paths,
            backend,
            state: Mutex::new(DefaultState::default()),
        }
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// First file under the search paths that matches `identity`.
    pub fn resolve(&self, identity: &DependencyIdentity) -> Option<PathBuf> {
        let candidates = match identity.kind {
            DependencyKind::Native => vec![native_file_name(&identity.name)],
            DependencyKind::Module => vec![identity.name.clone(), native_file_name(&identity.name)],
        };

        self.search_paths
            .iter()
            .flat_map(|dir| candidates.iter().map(move |c| dir.join(c)))
            .find(|path| path.is_file())
    }

    /// Resolve and load a dependency into the default namespace.
    pub fn load(&self, identity: &DependencyIdentity) -> Result<LoadedDependency, ScopeError> {
        let path = self
            .resolve(identity)
            .ok_or_else(|| ScopeError::DependencyNotFound(identity.to_string()))?;
        self.load_module(&path)?;

        let dependency = LoadedDependency::new(identity, path, identity.version.clone());
        tracing::debug!("Loaded {} from the default scope", identity);
        self.record(dependency.clone());
        Ok(dependency)
    }

    /// Load a module into the default namespace.
    pub fn load_module(&self, path: &Path) -> Result<Arc<dyn LoadedModule>, ScopeError> {
        let mut state = self.state.lock();
        if let Some(module) = state.modules.get(path) {
            return Ok(module.clone());
        }
        let module = self
            .backend
            .open_default(path)
            .map_err(|e| ScopeError::ModuleLoad {
                scope: DEFAULT_CONTEXT_NAME.to_string(),
                path: path.to_path_buf(),
                reason: e.0,
            })?;
        state.modules.insert(path.to_path_buf(), module.clone());
        Ok(module)
    }

    /// Register a dependency the host loaded on its own.
    pub fn record(&self, dependency: LoadedDependency) {
        record(&mut self.state.lock().dependencies, dependency);
    }

    pub fn loaded_dependencies(&self) -> Vec<LoadedDependency> {
        self.state.lock().dependencies.clone()
    }

    /// Construct `addin_type` from a module loaded the way a plain host does.
    ///
    /// `capability` is handed to the module so it does not decide on
    /// isolation again from its own environment.
    pub fn instantiate(
        &self,
        addin_type: &AddinType,
        capability: IsolationCapability,
        reporter: Arc<dyn UserReporter>,
    ) -> Result<PluginInstance, InstantiationError> {
        let module = self.load_module(addin_type.module_path())?;
        let table = Arc::new(bind_module(module.as_ref(), addin_type.type_name())?);
        let bridge = HostBridge::new(capability, reporter);
        PluginInstance::create(module, table, addin_type, LoadContext::Default, bridge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_context_wire_names() {
        assert_eq!(LoadContext::from_wire(""), LoadContext::Default);
        assert_eq!(
            LoadContext::from_wire("SampleAddin"),
            LoadContext::isolated("SampleAddin")
        );
        assert_eq!(LoadContext::Default.wire_name(), "");
        assert_eq!(LoadContext::Default.to_string(), DEFAULT_CONTEXT_NAME);
        assert!(LoadContext::isolated("A").is_isolated());
    }

    #[test]
    fn test_addin_type_install_directory() {
        let ty = AddinType::new("sample::Addin", "/opt/addins/Sample/libsample.so");
        assert_eq!(ty.install_directory(), Some(Path::new("/opt/addins/Sample")));
        assert_eq!(ty.context(), &LoadContext::Default);

        let bare = AddinType::new("sample::Addin", "libsample.so");
        assert_eq!(bare.install_directory(), None);
    }

    #[test]
    fn test_dependency_source_context_name() {
        let dependency = LoadedDependency {
            name: "libX".to_string(),
            version: None,
            kind: DependencyKind::Module,
            path: PathBuf::from("/A/libX.so"),
        };
        let scoped = DependencySource::Scope {
            scope_name: "A".to_string(),
            dependency: dependency.clone(),
        };
        assert_eq!(scoped.context_name(), "A");
        assert_eq!(DependencySource::Default(dependency).context_name(), DEFAULT_CONTEXT_NAME);
    }

    #[test]
    fn test_record_dedupes_by_path() {
        let dependency = LoadedDependency {
            name: "libX".to_string(),
            version: None,
            kind: DependencyKind::Module,
            path: PathBuf::from("/A/libX.so"),
        };
        let mut ledger = Vec::new();
        record(&mut ledger, dependency.clone());
        record(&mut ledger, dependency);
        assert_eq!(ledger.len(), 1);
    }
}
