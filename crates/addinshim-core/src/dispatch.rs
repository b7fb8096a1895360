//! Binding lifecycle entry points by name.
//!
//! The caller never links against an add-in's concrete type. It asks the
//! module's lookup function for each [`Method`] by name and signature tag
//! and keeps the answers in a [`DispatchTable`].

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::abi::{
    ActivateFn, AddinStatus, CreateFn, DestroyFn, LookupFn, Method, NullaryFn, RawStatus,
    SiteHandle, ABI_VERSION, ABI_VERSION_SYMBOL, LOOKUP_SYMBOL,
};
use crate::bridge::HostBridge;
use crate::error::{InstantiationError, RelayBindingError};
use crate::loader::LoadedModule;
use crate::relay::AddinServer;
use crate::scope::{AddinType, LoadContext};

/// Address of an exported function. Code addresses are immutable and valid
/// while their module stays loaded.
#[derive(Debug, Clone, Copy)]
struct EntryPoint(*const c_void);

unsafe impl Send for EntryPoint {}
unsafe impl Sync for EntryPoint {}

#[derive(Debug, Clone, Copy)]
enum Binding {
    Bound(EntryPoint),
    /// The name exists under a different signature.
    Mismatched,
    Missing,
}

/// Entry points of one add-in type, bound by name.
#[derive(Debug)]
pub struct DispatchTable {
    type_name: String,
    bindings: HashMap<Method, Binding>,
}

impl DispatchTable {
    /// Query `lookup` for every [`Method`] of `type_name`.
    ///
    /// # Safety
    /// `lookup` must come from a module that stays loaded while the table
    /// and any function obtained from it are in use.
    pub unsafe fn bind(lookup: LookupFn, type_name: &str) -> Self {
        let bindings = Method::ALL
            .into_iter()
            .map(|method| (method, bind_method(lookup, type_name, method)))
            .collect();
        Self {
            type_name: type_name.to_string(),
            bindings,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_bound(&self, method: Method) -> bool {
        matches!(self.bindings.get(&method), Some(Binding::Bound(_)))
    }

    fn entry(&self, method: Method) -> Result<*const c_void, RelayBindingError> {
        match self.bindings.get(&method).copied().unwrap_or(Binding::Missing) {
            Binding::Bound(entry) => Ok(entry.0),
            Binding::Mismatched => Err(RelayBindingError::SignatureMismatch {
                type_name: self.type_name.clone(),
                method,
                expected: method.signature(),
            }),
            Binding::Missing => Err(RelayBindingError::MissingMethod {
                type_name: self.type_name.clone(),
                method,
            }),
        }
    }

    pub fn create_fn(&self) -> Result<CreateFn, InstantiationError> {
        let entry = self
            .entry(Method::Create)
            .map_err(|_| InstantiationError::NoConstructor {
                type_name: self.type_name.clone(),
            })?;
        Ok(unsafe { std::mem::transmute::<*const c_void, CreateFn>(entry) })
    }

    pub fn activate_fn(&self) -> Result<ActivateFn, RelayBindingError> {
        let entry = self.entry(Method::Activate)?;
        Ok(unsafe { std::mem::transmute::<*const c_void, ActivateFn>(entry) })
    }

    /// `deactivate` or `reset_interface`.
    pub fn nullary_fn(&self, method: Method) -> Result<NullaryFn, RelayBindingError> {
        debug_assert!(matches!(method, Method::Deactivate | Method::ResetInterface));
        let entry = self.entry(method)?;
        Ok(unsafe { std::mem::transmute::<*const c_void, NullaryFn>(entry) })
    }

    pub fn destroy_fn(&self) -> Option<DestroyFn> {
        let entry = self.entry(Method::Destroy).ok()?;
        Some(unsafe { std::mem::transmute::<*const c_void, DestroyFn>(entry) })
    }
}

unsafe fn bind_method(lookup: LookupFn, type_name: &str, method: Method) -> Binding {
    let name = method.name();
    let signature = method.signature();
    let exact = lookup(
        type_name.as_ptr(),
        type_name.len(),
        name.as_ptr(),
        name.len(),
        signature.as_ptr(),
        signature.len(),
    );
    if !exact.is_null() {
        return Binding::Bound(EntryPoint(exact));
    }

    // An empty signature asks whether the name exists at all.
    let any = lookup(
        type_name.as_ptr(),
        type_name.len(),
        name.as_ptr(),
        name.len(),
        std::ptr::null(),
        0,
    );
    if any.is_null() {
        Binding::Missing
    } else {
        Binding::Mismatched
    }
}

fn symbol_name(symbol: &[u8]) -> String {
    String::from_utf8_lossy(symbol)
        .trim_end_matches('\0')
        .to_string()
}

/// Check a module's ABI exports and bind `type_name` from it.
pub(crate) fn bind_module(
    module: &dyn LoadedModule,
    type_name: &str,
) -> Result<DispatchTable, InstantiationError> {
    match module.abi_version() {
        None => {
            return Err(InstantiationError::MissingSymbol {
                path: module.path().to_path_buf(),
                symbol: symbol_name(ABI_VERSION_SYMBOL),
            })
        }
        Some(found) if found != ABI_VERSION => {
            return Err(InstantiationError::AbiMismatch {
                path: module.path().to_path_buf(),
                expected: ABI_VERSION,
                found,
            })
        }
        Some(_) => {}
    }

    let lookup = module
        .lookup_fn()
        .ok_or_else(|| InstantiationError::MissingSymbol {
            path: module.path().to_path_buf(),
            symbol: symbol_name(LOOKUP_SYMBOL),
        })?;

    Ok(unsafe { DispatchTable::bind(lookup, type_name) })
}

/// An add-in object constructed inside a module, driven through its
/// dispatch table. Dropping it destroys the object on the module side.
pub struct PluginInstance {
    raw: NonNull<c_void>,
    table: Arc<DispatchTable>,
    context: LoadContext,
    // Dropped after `destroy` ran; the module reports into it until then.
    _bridge: HostBridge,
    _module: Arc<dyn LoadedModule>,
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("type_name", &self.table.type_name())
            .field("context", &self.context)
            .field("raw", &self.raw)
            .finish()
    }
}

impl PluginInstance {
    pub(crate) fn create(
        module: Arc<dyn LoadedModule>,
        table: Arc<DispatchTable>,
        addin_type: &AddinType,
        context: LoadContext,
        bridge: HostBridge,
    ) -> Result<Self, InstantiationError> {
        let create = table.create_fn()?;
        let module_path = addin_type.module_path().to_string_lossy();
        let context_name = context.wire_name();
        let link = bridge.link();

        let raw = unsafe {
            create(
                module_path.as_ptr(),
                module_path.len(),
                context_name.as_ptr(),
                context_name.len(),
                &link,
            )
        };
        let raw = NonNull::new(raw).ok_or_else(|| InstantiationError::NullInstance {
            type_name: table.type_name().to_string(),
        })?;

        Ok(Self {
            raw,
            table,
            context,
            _bridge: bridge,
            _module: module,
        })
    }

    pub fn type_name(&self) -> &str {
        self.table.type_name()
    }

    /// Context the instance was created in.
    pub fn context(&self) -> &LoadContext {
        &self.context
    }

    fn check(&self, method: Method, raw: RawStatus) -> Result<(), RelayBindingError> {
        match AddinStatus::from_raw(raw) {
            AddinStatus::Ok => Ok(()),
            status => Err(RelayBindingError::Status {
                type_name: self.type_name().to_string(),
                method,
                status,
            }),
        }
    }

    fn call_nullary(&mut self, method: Method) -> Result<(), RelayBindingError> {
        let call = self.table.nullary_fn(method)?;
        let status = unsafe { call(self.raw.as_ptr()) };
        self.check(method, status)
    }
}

impl AddinServer for PluginInstance {
    fn activate(&mut self, site: SiteHandle, first_time: bool) -> Result<(), RelayBindingError> {
        let activate = self.table.activate_fn()?;
        let status = unsafe { activate(self.raw.as_ptr(), site, first_time) };
        self.check(Method::Activate, status)
    }

    fn deactivate(&mut self) -> Result<(), RelayBindingError> {
        self.call_nullary(Method::Deactivate)
    }

    fn reset_interface(&mut self) -> Result<(), RelayBindingError> {
        self.call_nullary(Method::ResetInterface)
    }
}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        match self.table.destroy_fn() {
            Some(destroy) => unsafe { destroy(self.raw.as_ptr()) },
            None => tracing::warn!(
                "'{}' exports no destroy entry point, instance leaked",
                self.type_name()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::str_from_raw;

    unsafe extern "C" fn only_activate(
        type_name: *const u8,
        type_len: usize,
        method: *const u8,
        method_len: usize,
        signature: *const u8,
        signature_len: usize,
    ) -> *const c_void {
        let (Some(type_name), Some(method), Some(signature)) = (
            str_from_raw(type_name, type_len),
            str_from_raw(method, method_len),
            str_from_raw(signature, signature_len),
        ) else {
            return std::ptr::null();
        };
        if type_name != "t::Only" {
            return std::ptr::null();
        }
        match method {
            "activate" if signature.is_empty() || signature == Method::Activate.signature() => {
                only_activate as LookupFn as *const c_void
            }
            // Present, but never with the expected signature.
            "deactivate" if signature.is_empty() => only_activate as LookupFn as *const c_void,
            _ => std::ptr::null(),
        }
    }

    #[test]
    fn test_bind_classifies_methods() {
        let table = unsafe { DispatchTable::bind(only_activate, "t::Only") };
        assert_eq!(table.type_name(), "t::Only");
        assert!(table.is_bound(Method::Activate));
        assert!(!table.is_bound(Method::Deactivate));
        assert!(table.destroy_fn().is_none());

        assert!(matches!(
            table.nullary_fn(Method::Deactivate),
            Err(RelayBindingError::SignatureMismatch {
                method: Method::Deactivate,
                ..
            })
        ));
        assert!(matches!(
            table.nullary_fn(Method::ResetInterface),
            Err(RelayBindingError::MissingMethod {
                method: Method::ResetInterface,
                ..
            })
        ));
        assert!(matches!(
            table.create_fn(),
            Err(InstantiationError::NoConstructor { .. })
        ));
    }

    #[test]
    fn test_unknown_type_binds_nothing() {
        let table = unsafe { DispatchTable::bind(only_activate, "t::Other") };
        for method in Method::ALL {
            assert!(!table.is_bound(method));
        }
    }

    #[test]
    fn test_symbol_name_strips_nul() {
        assert_eq!(symbol_name(LOOKUP_SYMBOL), "addinshim_lookup");
    }
}
