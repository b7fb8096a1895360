//! Shared test fixtures: an in-process loading backend and recording hooks.
//!
//! The fake backend hands out modules whose lookup entry points are real
//! `extern "C"` functions compiled into the test binary, so binding and
//! dispatch go through the same by-name path as a loaded library.

#![allow(dead_code)]

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use addinshim_core::abi::{str_from_raw, LookupFn, ABI_VERSION};
use addinshim_core::export;
use addinshim_core::loader::{LoadError, LoadedModule, ModuleBackend, PrivateNamespace};
use addinshim_core::relay::{ActivationContext, AddinHooks};
use parking_lot::Mutex;

/// What a fake module exports.
#[derive(Clone, Copy)]
pub struct FakeExports {
    pub abi_version: Option<u32>,
    pub lookup: Option<LookupFn>,
}

impl FakeExports {
    pub fn new(lookup: LookupFn) -> Self {
        Self {
            abi_version: Some(ABI_VERSION),
            lookup: Some(lookup),
        }
    }
}

/// One `open_*` call seen by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    pub path: PathBuf,
    /// `None` for the default namespace.
    pub namespace: Option<i64>,
}

pub struct FakeBackend {
    exports: FakeExports,
    private: bool,
    next_namespace: AtomicI64,
    opened: Mutex<Vec<Opened>>,
}

impl FakeBackend {
    pub fn new(lookup: LookupFn) -> Self {
        Self::with_exports(FakeExports::new(lookup))
    }

    pub fn with_exports(exports: FakeExports) -> Self {
        Self {
            exports,
            private: true,
            next_namespace: AtomicI64::new(1),
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn without_private_namespaces(mut self) -> Self {
        self.private = false;
        self
    }

    pub fn opened(&self) -> Vec<Opened> {
        self.opened.lock().clone()
    }

    pub fn open_count(&self, path: &Path) -> usize {
        self.opened.lock().iter().filter(|o| o.path == path).count()
    }
}

struct FakeModule {
    path: PathBuf,
    exports: FakeExports,
}

impl LoadedModule for FakeModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn abi_version(&self) -> Option<u32> {
        self.exports.abi_version
    }

    fn lookup_fn(&self) -> Option<LookupFn> {
        self.exports.lookup
    }
}

impl ModuleBackend for FakeBackend {
    fn supports_private_namespaces(&self) -> bool {
        self.private
    }

    fn open_default(&self, path: &Path) -> Result<Arc<dyn LoadedModule>, LoadError> {
        self.opened.lock().push(Opened {
            path: path.to_path_buf(),
            namespace: None,
        });
        Ok(Arc::new(FakeModule {
            path: path.to_path_buf(),
            exports: self.exports,
        }))
    }

    fn open_private(
        &self,
        path: &Path,
        namespace: &mut PrivateNamespace,
    ) -> Result<Arc<dyn LoadedModule>, LoadError> {
        if !self.private {
            return Err(LoadError("no private namespaces".to_string()));
        }
        if !namespace.is_created() {
            namespace.set_id(self.next_namespace.fetch_add(1, Ordering::SeqCst));
        }
        self.opened.lock().push(Opened {
            path: path.to_path_buf(),
            namespace: namespace.id(),
        });
        Ok(Arc::new(FakeModule {
            path: path.to_path_buf(),
            exports: self.exports,
        }))
    }
}

/// A hook call observed inside an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub module: PathBuf,
    pub instance: u64,
    pub kind: &'static str,
    pub context: String,
    pub first_time: Option<bool>,
    pub site: usize,
}

static EVENTS: Mutex<Vec<Event>> = parking_lot::const_mutex(Vec::new());
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Events recorded for instances created from `module`.
pub fn events_for(module: &Path) -> Vec<Event> {
    EVENTS
        .lock()
        .iter()
        .filter(|e| e.module == module)
        .cloned()
        .collect()
}

/// Event kinds for `module`, in order.
pub fn kinds_for(module: &Path) -> Vec<&'static str> {
    events_for(module).into_iter().map(|e| e.kind).collect()
}

/// Records every hook call. Events are keyed by the module path seen at
/// activation, so tests using distinct temp directories do not interfere.
pub struct RecordingHooks {
    id: u64,
    module: Option<PathBuf>,
    context: String,
}

impl Default for RecordingHooks {
    fn default() -> Self {
        Self {
            id: NEXT_INSTANCE.fetch_add(1, Ordering::SeqCst),
            module: None,
            context: String::new(),
        }
    }
}

impl RecordingHooks {
    fn push(&self, kind: &'static str, first_time: Option<bool>, site: usize) {
        if let Some(module) = &self.module {
            EVENTS.lock().push(Event {
                module: module.clone(),
                instance: self.id,
                kind,
                context: self.context.clone(),
                first_time,
                site,
            });
        }
    }

    fn remember(&mut self, context: &ActivationContext) {
        self.module = Some(context.addin_type().module_path().to_path_buf());
        self.context = context.addin_type().context().to_string();
    }
}

impl AddinHooks for RecordingHooks {
    fn on_activate(&mut self, context: &ActivationContext) -> anyhow::Result<()> {
        self.remember(context);
        self.push(
            "activate",
            Some(context.first_time()),
            context.site().as_raw() as usize,
        );
        Ok(())
    }

    fn on_deactivate(&mut self) -> anyhow::Result<()> {
        self.push("deactivate", None, 0);
        Ok(())
    }

    fn add_customization(&mut self, _context: &ActivationContext) -> anyhow::Result<()> {
        self.push("add", None, 0);
        Ok(())
    }

    fn remove_customization(&mut self) -> anyhow::Result<()> {
        self.push("remove", None, 0);
        Ok(())
    }
}

impl Drop for RecordingHooks {
    fn drop(&mut self) {
        self.push("drop", None, 0);
    }
}

/// `on_activate` returns an error after recording the attempt.
#[derive(Default)]
pub struct FailingHooks {
    inner: RecordingHooks,
}

impl AddinHooks for FailingHooks {
    fn on_activate(&mut self, context: &ActivationContext) -> anyhow::Result<()> {
        self.inner.on_activate(context)?;
        anyhow::bail!("site rejected")
    }

    fn on_deactivate(&mut self) -> anyhow::Result<()> {
        self.inner.on_deactivate()
    }
}

/// `on_activate` panics after recording the attempt.
#[derive(Default)]
pub struct PanickingHooks {
    inner: RecordingHooks,
}

impl AddinHooks for PanickingHooks {
    fn on_activate(&mut self, context: &ActivationContext) -> anyhow::Result<()> {
        self.inner.on_activate(context)?;
        panic!("add-in bug during activate")
    }

    fn on_deactivate(&mut self) -> anyhow::Result<()> {
        self.inner.on_deactivate()
    }
}

pub fn recording_type_name() -> &'static str {
    std::any::type_name::<RecordingHooks>()
}

pub fn recording_lookup() -> LookupFn {
    export::lookup::<RecordingHooks>
}

unsafe fn method_and_signature<'a>(
    method: *const u8,
    method_len: usize,
    signature: *const u8,
    signature_len: usize,
) -> (&'a str, &'a str) {
    (
        str_from_raw(method, method_len).unwrap_or(""),
        str_from_raw(signature, signature_len).unwrap_or(""),
    )
}

/// Like the recording lookup, but without `deactivate`.
pub unsafe extern "C" fn lookup_without_deactivate(
    type_name: *const u8,
    type_len: usize,
    method: *const u8,
    method_len: usize,
    signature: *const u8,
    signature_len: usize,
) -> *const c_void {
    let (name, _) = method_and_signature(method, method_len, signature, signature_len);
    if name == "deactivate" {
        return std::ptr::null();
    }
    export::lookup::<RecordingHooks>(
        type_name,
        type_len,
        method,
        method_len,
        signature,
        signature_len,
    )
}

/// `activate` exists only under an older signature.
pub unsafe extern "C" fn lookup_with_stale_activate(
    type_name: *const u8,
    type_len: usize,
    method: *const u8,
    method_len: usize,
    signature: *const u8,
    signature_len: usize,
) -> *const c_void {
    let (name, sig) = method_and_signature(method, method_len, signature, signature_len);
    if name == "activate" && !sig.is_empty() {
        return std::ptr::null();
    }
    export::lookup::<RecordingHooks>(
        type_name,
        type_len,
        method,
        method_len,
        signature,
        signature_len,
    )
}

/// A module whose type cannot be constructed.
pub unsafe extern "C" fn lookup_without_create(
    type_name: *const u8,
    type_len: usize,
    method: *const u8,
    method_len: usize,
    signature: *const u8,
    signature_len: usize,
) -> *const c_void {
    let (name, _) = method_and_signature(method, method_len, signature, signature_len);
    if name == "create" {
        return std::ptr::null();
    }
    export::lookup::<RecordingHooks>(
        type_name,
        type_len,
        method,
        method_len,
        signature,
        signature_len,
    )
}

/// Write a manifest into `dir` declaring `(name, version, relative path)`
/// entries and create the files they point to.
pub fn install(dir: &Path, entries: &[(&str, &str, &str)]) {
    std::fs::create_dir_all(dir).unwrap();
    let mut manifest = String::new();
    for (name, version, path) in entries {
        let file = dir.join(path);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&file, b"").unwrap();
        manifest.push_str(&format!(
            "[[dependencies]]\nname = \"{}\"\nversion = \"{}\"\npath = \"{}\"\n\n",
            name, version, path
        ));
    }
    std::fs::write(
        dir.join(addinshim_core::manifest::DEFAULT_MANIFEST_FILE),
        manifest,
    )
    .unwrap();
}
