//! addinshim Add-in SDK
//!
//! Build an add-in module that a host loads into its own isolation scope.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use addinshim_sdk::prelude::*;
//!
//! #[derive(Default)]
//! pub struct MyAddin;
//!
//! impl AddinHooks for MyAddin {
//!     fn on_activate(&mut self, context: &ActivationContext) -> anyhow::Result<()> {
//!         tracing::info!("activated, first time: {}", context.first_time());
//!         Ok(())
//!     }
//!
//!     fn on_deactivate(&mut self) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! export_addin!(MyAddin);
//! ```
//!
//! Build the crate as a `cdylib` and install it next to its
//! `addin.deps.toml`. The host refers to the add-in by
//! [`addin_type_name`].

#[macro_use]
pub mod macros;

pub use addinshim_core::abi::{SiteHandle, ABI_VERSION};
pub use addinshim_core::export;
pub use addinshim_core::relay::{ActivationContext, AddinHooks};
pub use addinshim_core::scope::{AddinType, LoadContext};

/// Name a host uses to address hooks type `T` in this module.
pub fn addin_type_name<T: AddinHooks + 'static>() -> &'static str {
    std::any::type_name::<T>()
}

/// Registry owned by this module copy.
///
/// Only used when the host loaded the module through its default scope and
/// the module proxies itself into a private scope.
pub fn module_registry() -> std::sync::Arc<addinshim_core::registry::ScopeRegistry> {
    export::runtime()
}

/// Prelude module with common imports
pub mod prelude {
    pub use crate::{addin_type_name, export_addin};
    pub use addinshim_core::abi::SiteHandle;
    pub use addinshim_core::relay::{ActivationContext, AddinHooks};
    pub use addinshim_core::scope::{AddinType, LoadContext};
}
