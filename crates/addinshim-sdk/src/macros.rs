//! Export macros for add-in modules.

/// Export the add-in entry points of one or more hooks types.
///
/// Generates the two symbols every add-in module carries:
/// `addinshim_abi_version` and `addinshim_lookup`. Each listed type must
/// implement [`AddinHooks`](crate::AddinHooks) and `Default`.
///
/// # Example
///
/// ```rust,ignore
/// use addinshim_sdk::prelude::*;
///
/// #[derive(Default)]
/// pub struct RibbonAddin;
///
/// impl AddinHooks for RibbonAddin {
///     fn on_activate(&mut self, _context: &ActivationContext) -> anyhow::Result<()> {
///         Ok(())
///     }
///
///     fn on_deactivate(&mut self) -> anyhow::Result<()> {
///         Ok(())
///     }
/// }
///
/// export_addin!(RibbonAddin);
/// ```
#[macro_export]
macro_rules! export_addin {
    ($($ty:ty),+ $(,)?) => {
        #[no_mangle]
        #[allow(non_upper_case_globals)]
        pub static addinshim_abi_version: u32 = $crate::ABI_VERSION;

        /// # Safety
        /// Each pointer must be valid for reads of its length, or null.
        #[no_mangle]
        pub unsafe extern "C" fn addinshim_lookup(
            type_name: *const u8,
            type_len: usize,
            method: *const u8,
            method_len: usize,
            signature: *const u8,
            signature_len: usize,
        ) -> *const ::std::ffi::c_void {
            $(
                let entry = $crate::export::lookup::<$ty>(
                    type_name,
                    type_len,
                    method,
                    method_len,
                    signature,
                    signature_len,
                );
                if !entry.is_null() {
                    return entry;
                }
            )+
            ::std::ptr::null()
        }
    };
}
