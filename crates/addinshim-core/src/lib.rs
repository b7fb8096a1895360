//! Dependency isolation and lifecycle relay for in-process add-ins.
//!
//! Every add-in install directory gets one private loading scope. Modules
//! and native libraries an add-in depends on are resolved inside that
//! directory first and only fall through to the host's default scope when
//! the add-in does not ship them. The host talks to each add-in through a
//! relay that instantiates it inside its scope and forwards the lifecycle
//! protocol by name.

pub mod abi;
pub mod bridge;
pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod identity;
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod relay;
pub mod report;
pub mod resolver;
pub mod scope;

pub use abi::{AddinStatus, HostLink, Method, SiteHandle, ABI_VERSION};
pub use config::{HostConfig, IsolationMode};
pub use diagnostics::DependencyReport;
pub use dispatch::{DispatchTable, PluginInstance};
pub use error::{InstantiationError, ManifestError, RelayBindingError, ScopeError};
pub use identity::{DependencyIdentity, DependencyKind};
pub use manifest::DependencyManifest;
pub use registry::{IsolationCapability, RegistrySnapshot, ScopeRegistry};
pub use relay::{
    connect, select_server, select_server_for, ActivationContext, AddinHooks, AddinServer, LifecycleRelay,
    PassThroughRelay, RelayMode,
};
pub use report::{TracingReporter, UserReport, UserReporter};
pub use resolver::DependencyResolver;
pub use scope::{AddinType, DependencySource, IsolationScope, LoadContext, LoadedDependency};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::abi::SiteHandle;
    pub use crate::config::HostConfig;
    pub use crate::error::{InstantiationError, RelayBindingError, ScopeError};
    pub use crate::identity::DependencyIdentity;
    pub use crate::registry::ScopeRegistry;
    pub use crate::relay::{ActivationContext, AddinHooks, AddinServer};
    pub use crate::scope::{AddinType, LoadContext};
}
