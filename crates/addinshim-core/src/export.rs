//! C-ABI entry points exported by add-in modules.
//!
//! `addinshim_sdk::export_addin!` wires these generics to the two exported
//! symbols. Every instance handed across the boundary is a boxed
//! [`AddinServer`] chosen by [`select_server_for`], so only `create` and
//! `lookup` need to know the concrete hooks type.
//!
//! `create` takes the host's [`HostLink`]: the host's capability decides
//! the relay strategy, user reports go to the host's reporter and log
//! records are re-emitted by the host. A null link leaves this copy to
//! decide from its own environment and report through `tracing`.

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use crate::abi::{
    str_from_raw, ActivateFn, CreateFn, DestroyFn, HostLink, Method, NullaryFn, RawStatus,
    SiteHandle, STATUS_BINDING_FAILED, STATUS_OK, STATUS_PANICKED,
};
use crate::bridge::{self, LinkedReporter};
use crate::config::HostConfig;
use crate::error::RelayBindingError;
use crate::registry::{IsolationCapability, ScopeRegistry};
use crate::relay::{select_server_for, AddinHooks, AddinServer};
use crate::report::{panic_message, TracingReporter, UserReporter};
use crate::scope::{AddinType, LoadContext};

type ServerBox = Box<dyn AddinServer>;

static RUNTIME: OnceLock<Arc<ScopeRegistry>> = OnceLock::new();

/// Registry owned by this copy of the module.
pub fn runtime() -> Arc<ScopeRegistry> {
    RUNTIME
        .get_or_init(|| Arc::new(ScopeRegistry::native(HostConfig::from_env())))
        .clone()
}

/// Resolve `(type, method, signature)` for hooks type `T`.
///
/// An empty signature matches any signature, so callers can tell a missing
/// method from a mismatched one.
///
/// # Safety
/// Each pointer must be valid for reads of its length, or null.
pub unsafe extern "C" fn lookup<T: AddinHooks + Default + 'static>(
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

    if type_name != std::any::type_name::<T>() {
        return std::ptr::null();
    }
    let Some(method) = Method::from_name(method) else {
        return std::ptr::null();
    };
    if !signature.is_empty() && signature != method.signature() {
        return std::ptr::null();
    }

    match method {
        Method::Create => create::<T> as CreateFn as *const c_void,
        Method::Activate => activate as ActivateFn as *const c_void,
        Method::Deactivate => deactivate as NullaryFn as *const c_void,
        Method::ResetInterface => reset_interface as NullaryFn as *const c_void,
        Method::Destroy => destroy as DestroyFn as *const c_void,
    }
}

/// Construct `T` behind a relay for the given module path and context.
///
/// # Safety
/// Both strings must be valid for reads of their lengths, or null. `link`
/// is null or points at a [`HostLink`] whose reporter outlives the
/// instance.
pub unsafe extern "C" fn create<T: AddinHooks + Default + 'static>(
    module_path: *const u8,
    module_len: usize,
    context: *const u8,
    context_len: usize,
    link: *const HostLink,
) -> *mut c_void {
    let link = link.as_ref();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        if let Some(link) = link {
            bridge::forward_logs(link);
        }
        let module_path = str_from_raw(module_path, module_len)?;
        let context = str_from_raw(context, context_len)?;

        let addin_type = AddinType::new(std::any::type_name::<T>(), module_path)
            .with_context(LoadContext::from_wire(context));

        let capability = link
            .and_then(|l| IsolationCapability::from_raw(l.capability))
            .unwrap_or_else(|| runtime().capability());
        let reporter: Arc<dyn UserReporter> = match link.and_then(LinkedReporter::from_link) {
            Some(linked) => Arc::new(linked),
            None => Arc::new(TracingReporter),
        };
        tracing::debug!(
            type_name = addin_type.type_name(),
            context = %addin_type.context(),
            linked = link.is_some(),
            "Creating add-in instance"
        );

        let server: ServerBox =
            select_server_for(capability, runtime(), addin_type, T::default(), reporter);
        Some(Box::into_raw(Box::new(server)) as *mut c_void)
    }));

    match result {
        Ok(Some(instance)) => instance,
        Ok(None) => {
            tracing::error!("create received a non UTF-8 argument");
            std::ptr::null_mut()
        }
        Err(payload) => {
            tracing::error!("create panicked: {}", panic_message(payload.as_ref()));
            std::ptr::null_mut()
        }
    }
}

unsafe fn with_server(
    instance: *mut c_void,
    method: Method,
    call: impl FnOnce(&mut dyn AddinServer) -> Result<(), RelayBindingError>,
) -> RawStatus {
    if instance.is_null() {
        tracing::error!("{} called with a null instance", method);
        return STATUS_BINDING_FAILED;
    }
    let server = &mut *(instance as *mut ServerBox);

    match panic::catch_unwind(AssertUnwindSafe(|| call(server.as_mut()))) {
        Ok(Ok(())) => STATUS_OK,
        Ok(Err(e)) => {
            tracing::error!("{} failed: {}", method, e);
            STATUS_BINDING_FAILED
        }
        Err(payload) => {
            tracing::error!("{} panicked: {}", method, panic_message(payload.as_ref()));
            STATUS_PANICKED
        }
    }
}

/// # Safety
/// `instance` must come from [`create`] and not be destroyed.
pub unsafe extern "C" fn activate(
    instance: *mut c_void,
    site: SiteHandle,
    first_time: bool,
) -> RawStatus {
    with_server(instance, Method::Activate, |server| {
        server.activate(site, first_time)
    })
}

/// # Safety
/// `instance` must come from [`create`] and not be destroyed.
pub unsafe extern "C" fn deactivate(instance: *mut c_void) -> RawStatus {
    with_server(instance, Method::Deactivate, |server| server.deactivate())
}

/// # Safety
/// `instance` must come from [`create`] and not be destroyed.
pub unsafe extern "C" fn reset_interface(instance: *mut c_void) -> RawStatus {
    with_server(instance, Method::ResetInterface, |server| {
        server.reset_interface()
    })
}

/// # Safety
/// `instance` must come from [`create`]; it is invalid afterwards.
pub unsafe extern "C" fn destroy(instance: *mut c_void) {
    if instance.is_null() {
        return;
    }
    let server = Box::from_raw(instance as *mut ServerBox);
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || drop(server))) {
        tracing::error!("destroy panicked: {}", panic_message(payload.as_ref()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::LookupFn;
    use crate::bridge::HostBridge;
    use crate::relay::ActivationContext;
    use crate::report::{CollectingReporter, Stage};

    #[derive(Default)]
    struct Quiet;

    impl AddinHooks for Quiet {
        fn on_activate(&mut self, _context: &ActivationContext) -> anyhow::Result<()> {
            Ok(())
        }

        fn on_deactivate(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn query(type_name: &str, method: &str, signature: &str) -> *const c_void {
        let entry: LookupFn = lookup::<Quiet>;
        unsafe {
            entry(
                type_name.as_ptr(),
                type_name.len(),
                method.as_ptr(),
                method.len(),
                signature.as_ptr(),
                signature.len(),
            )
        }
    }

    #[test]
    fn test_lookup_matches_type_and_signature() {
        let type_name = std::any::type_name::<Quiet>();
        for method in Method::ALL {
            assert!(!query(type_name, method.name(), method.signature()).is_null());
            assert!(!query(type_name, method.name(), "").is_null());
        }

        assert!(query(type_name, "activate", "fn()").is_null());
        assert!(query(type_name, "execute_command", "").is_null());
        assert!(query("other::Type", "activate", "").is_null());
    }

    #[test]
    fn test_isolated_instance_round_trip() {
        let module_path = "/opt/addins/Quiet/libquiet.so";
        let context = "Quiet";
        let instance = unsafe {
            create::<Quiet>(
                module_path.as_ptr(),
                module_path.len(),
                context.as_ptr(),
                context.len(),
                std::ptr::null(),
            )
        };
        assert!(!instance.is_null());

        unsafe {
            assert_eq!(activate(instance, SiteHandle::null(), true), STATUS_OK);
            assert_eq!(reset_interface(instance), STATUS_OK);
            assert_eq!(deactivate(instance), STATUS_OK);
            destroy(instance);
        }
    }

    #[derive(Default)]
    struct Refusing;

    impl AddinHooks for Refusing {
        fn on_activate(&mut self, _context: &ActivationContext) -> anyhow::Result<()> {
            anyhow::bail!("host site unusable")
        }

        fn on_deactivate(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_linked_pass_through_instance_reports_to_host() {
        let collected = Arc::new(CollectingReporter::new());
        let bridge = HostBridge::new(IsolationCapability::PassThrough, collected.clone());
        let link = bridge.link();

        let module_path = "/opt/addins/Refusing/librefusing.so";
        let default_context = LoadContext::Default;
        let context = default_context.wire_name();
        let instance = unsafe {
            create::<Refusing>(
                module_path.as_ptr(),
                module_path.len(),
                context.as_ptr(),
                context.len(),
                &link,
            )
        };
        assert!(!instance.is_null());

        unsafe {
            // Pass-through never loads the module again, so this path does
            // not need to exist.
            assert_eq!(activate(instance, SiteHandle::null(), true), STATUS_OK);
            assert_eq!(deactivate(instance), STATUS_OK);
            destroy(instance);
        }
        drop(bridge);

        let reports = collected.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].stage, Stage::Activate);
        assert!(reports[0].message.contains("host site unusable"));
        assert!(reports[0].addin.ends_with("Refusing"));
    }

    #[test]
    fn test_null_instance_is_binding_failure() {
        unsafe {
            assert_eq!(deactivate(std::ptr::null_mut()), STATUS_BINDING_FAILED);
            destroy(std::ptr::null_mut());
        }
    }
}
