//! Native backend using libloading.
//!
//! Default loads go through `Library::new`. Private namespaces use glibc's
//! `dlmopen`, which gives every scope its own link map: a library name that
//! is already loaded in another namespace is loaded again from the scope's
//! own file instead of being shared. Other platforms report no private
//! namespace support and hosts fall back to the pass-through relay.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::{Library, Symbol};

use super::{LoadError, LoadedModule, ModuleBackend, PrivateNamespace};
use crate::abi::{LookupFn, ABI_VERSION_SYMBOL, LOOKUP_SYMBOL};

/// Backend for `.so` / `.dylib` / `.dll` files.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

impl NativeBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ModuleBackend for NativeBackend {
    fn supports_private_namespaces(&self) -> bool {
        cfg!(all(target_os = "linux", target_env = "gnu"))
    }

    fn open_default(&self, path: &Path) -> Result<Arc<dyn LoadedModule>, LoadError> {
        let library = unsafe {
            Library::new(path)
                .map_err(|e| LoadError(format!("Failed to load library: {}", e)))?
        };
        tracing::debug!("Loaded {} into the default namespace", path.display());
        Ok(Arc::new(NativeModule {
            path: path.to_path_buf(),
            library,
        }))
    }

    fn open_private(
        &self,
        path: &Path,
        namespace: &mut PrivateNamespace,
    ) -> Result<Arc<dyn LoadedModule>, LoadError> {
        #[cfg(all(target_os = "linux", target_env = "gnu"))]
        {
            let library = link_map::open(path, namespace)?;
            tracing::debug!(
                "Loaded {} into namespace {:?}",
                path.display(),
                namespace.id()
            );
            Ok(Arc::new(NativeModule {
                path: path.to_path_buf(),
                library,
            }))
        }

        #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
        {
            let _ = namespace;
            Err(LoadError(format!(
                "Private namespaces are not supported on this platform ({})",
                path.display()
            )))
        }
    }
}

struct NativeModule {
    path: PathBuf,
    library: Library,
}

impl LoadedModule for NativeModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn abi_version(&self) -> Option<u32> {
        unsafe {
            let symbol: Symbol<*const u32> = self.library.get(ABI_VERSION_SYMBOL).ok()?;
            let ptr = *symbol;
            if ptr.is_null() {
                return None;
            }
            Some(*ptr)
        }
    }

    fn lookup_fn(&self) -> Option<LookupFn> {
        unsafe {
            let symbol: Symbol<LookupFn> = self.library.get(LOOKUP_SYMBOL).ok()?;
            Some(*symbol)
        }
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod link_map {
    use std::ffi::{c_char, c_int, c_long, c_void, CStr, CString};
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use libloading::Library;

    use super::super::{LoadError, PrivateNamespace};

    type Lmid = c_long;

    const LM_ID_NEWLM: Lmid = -1;
    const RTLD_DI_LMID: c_int = 1;

    #[link(name = "dl")]
    extern "C" {
        fn dlmopen(lmid: Lmid, filename: *const c_char, flags: c_int) -> *mut c_void;
        fn dlinfo(handle: *mut c_void, request: c_int, info: *mut c_void) -> c_int;
    }

    pub(super) fn open(path: &Path, namespace: &mut PrivateNamespace) -> Result<Library, LoadError> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| LoadError(format!("Path contains a NUL byte: {}", path.display())))?;

        let lmid = namespace.id().map(|id| id as Lmid).unwrap_or(LM_ID_NEWLM);

        let handle = unsafe { dlmopen(lmid, c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(LoadError(last_error()));
        }

        if !namespace.is_created() {
            let mut created: Lmid = 0;
            let rc = unsafe {
                dlinfo(
                    handle,
                    RTLD_DI_LMID,
                    &mut created as *mut Lmid as *mut c_void,
                )
            };
            if rc != 0 {
                let reason = last_error();
                unsafe { libc::dlclose(handle) };
                return Err(LoadError(format!("Failed to query namespace: {}", reason)));
            }
            namespace.set_id(created as i64);
        }

        let library = unsafe { libloading::os::unix::Library::from_raw(handle) };
        Ok(library.into())
    }

    fn last_error() -> String {
        let err = unsafe { libc::dlerror() };
        if err.is_null() {
            return "unknown dlmopen error".to_string();
        }
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}
