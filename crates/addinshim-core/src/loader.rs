//! Module loading backends.
//!
//! A backend opens library files either into the host's default namespace
//! or into a private namespace owned by one isolation scope. The native
//! backend lives in [`native`]; tests substitute in-process fakes.

pub mod native;

use std::path::Path;
use std::sync::Arc;

use crate::abi::LookupFn;

pub use native::NativeBackend;

/// Backend-level load failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct LoadError(pub String);

/// Private namespace slot owned by a scope.
///
/// Empty until the first module is loaded into it; the backend fills in
/// its identifier and every later load reuses it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrivateNamespace {
    id: Option<i64>,
}

impl PrivateNamespace {
    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.id.is_some()
    }

    pub fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }
}

/// A library opened by a backend. Dropping the last handle may unload it,
/// so scopes keep every module they load.
pub trait LoadedModule: Send + Sync {
    /// File the module was loaded from.
    fn path(&self) -> &Path;

    /// Value of the exported ABI version static, if present.
    fn abi_version(&self) -> Option<u32>;

    /// The exported lookup entry point, if present.
    fn lookup_fn(&self) -> Option<LookupFn>;
}

/// Opens libraries into namespaces.
pub trait ModuleBackend: Send + Sync {
    /// Whether [`open_private`](Self::open_private) is available.
    fn supports_private_namespaces(&self) -> bool;

    /// Open a library in the host's default namespace.
    fn open_default(&self, path: &Path) -> Result<Arc<dyn LoadedModule>, LoadError>;

    /// Open a library in `namespace`, creating the namespace on first use.
    fn open_private(
        &self,
        path: &Path,
        namespace: &mut PrivateNamespace,
    ) -> Result<Arc<dyn LoadedModule>, LoadError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_namespace_slot() {
        let mut ns = PrivateNamespace::default();
        assert!(!ns.is_created());
        assert_eq!(ns.id(), None);

        ns.set_id(3);
        assert!(ns.is_created());
        assert_eq!(ns.id(), Some(3));
    }
}
