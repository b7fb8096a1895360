//! Lifecycle relay.
//!
//! The host talks to an [`AddinServer`]. When the add-in already runs inside
//! its own scope the relay calls the add-in's [`AddinHooks`] directly.
//! Otherwise it builds a fresh instance inside the scope on every
//! `activate` and forwards the lifecycle calls to it through the dispatch
//! table.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::abi::SiteHandle;
use crate::dispatch::PluginInstance;
use crate::error::{InstantiationError, RelayBindingError};
use crate::registry::{IsolationCapability, ScopeRegistry};
use crate::report::{panic_message, Stage, UserReport, UserReporter};
use crate::scope::AddinType;

/// What the host handed over on activation.
#[derive(Debug, Clone)]
pub struct ActivationContext {
    site: SiteHandle,
    first_time: bool,
    addin_type: AddinType,
}

impl ActivationContext {
    pub fn new(site: SiteHandle, first_time: bool, addin_type: AddinType) -> Self {
        Self {
            site,
            first_time,
            addin_type,
        }
    }

    /// Host site. Valid until the matching deactivate.
    pub fn site(&self) -> SiteHandle {
        self.site
    }

    /// True on the first load of the add-in after installation.
    pub fn first_time(&self) -> bool {
        self.first_time
    }

    pub fn addin_type(&self) -> &AddinType {
        &self.addin_type
    }
}

/// Code an add-in author writes.
///
/// Errors and panics from any hook are caught by the relay and reported to
/// the user; they never reach the host.
pub trait AddinHooks {
    fn on_activate(&mut self, context: &ActivationContext) -> anyhow::Result<()>;

    fn on_deactivate(&mut self) -> anyhow::Result<()>;

    /// Install the add-in's UI customization. Called after the first
    /// activation and on every interface reset.
    fn add_customization(&mut self, _context: &ActivationContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Undo [`add_customization`](Self::add_customization).
    fn remove_customization(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing, for host-side relays that only forward.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl AddinHooks for NoHooks {
    fn on_activate(&mut self, _context: &ActivationContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_deactivate(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The host-facing lifecycle protocol.
pub trait AddinServer {
    fn activate(&mut self, site: SiteHandle, first_time: bool) -> Result<(), RelayBindingError>;

    fn deactivate(&mut self) -> Result<(), RelayBindingError>;

    /// The host rebuilt its UI and lost every customization.
    fn reset_interface(&mut self) -> Result<(), RelayBindingError>;

    #[deprecated(note = "legacy host command entry point; has no effect")]
    fn execute_command(&mut self, _command_id: i32) {}
}

/// Runs hooks in-process and contains their failures.
pub struct DirectHost<H> {
    hooks: H,
    addin_type: AddinType,
    reporter: Arc<dyn UserReporter>,
    context: Option<ActivationContext>,
    customized: bool,
}

impl<H: AddinHooks> DirectHost<H> {
    pub fn new(hooks: H, addin_type: AddinType, reporter: Arc<dyn UserReporter>) -> Self {
        Self {
            hooks,
            addin_type,
            reporter,
            context: None,
            customized: false,
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    pub fn addin_type(&self) -> &AddinType {
        &self.addin_type
    }

    /// Context of the current activation, if active.
    pub fn context(&self) -> Option<&ActivationContext> {
        self.context.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.context.is_some()
    }

    pub fn is_customized(&self) -> bool {
        self.customized
    }

    pub fn activate(&mut self, site: SiteHandle, first_time: bool) {
        let context = ActivationContext::new(site, first_time, self.addin_type.clone());
        self.context = Some(context.clone());
        tracing::info!(
            type_name = self.addin_type.type_name(),
            first_time,
            "Activating add-in"
        );

        if self.contain(Stage::Activate, |hooks| hooks.on_activate(&context)) && first_time {
            // A repeated activation must not stack customizations.
            self.withdraw_customization();
            self.apply_customization();
        }
    }

    pub fn deactivate(&mut self) {
        self.withdraw_customization();
        self.contain(Stage::Deactivate, |hooks| hooks.on_deactivate());
        if self.context.take().is_some() {
            tracing::debug!(type_name = self.addin_type.type_name(), "Released host site");
        }
    }

    /// Remove, then add the customization again.
    pub fn reset_interface(&mut self) {
        if self.context.is_none() {
            tracing::debug!(
                type_name = self.addin_type.type_name(),
                "Interface reset before activation ignored"
            );
            return;
        }
        self.withdraw_customization();
        self.apply_customization();
    }

    fn apply_customization(&mut self) {
        let Some(context) = self.context.clone() else {
            return;
        };
        if self.contain(Stage::AddCustomization, |hooks| hooks.add_customization(&context)) {
            self.customized = true;
        }
    }

    fn withdraw_customization(&mut self) {
        if !self.customized {
            return;
        }
        self.customized = false;
        self.contain(Stage::RemoveCustomization, |hooks| hooks.remove_customization());
    }

    /// Run a hook, turning errors and panics into user reports.
    fn contain(&mut self, stage: Stage, call: impl FnOnce(&mut H) -> anyhow::Result<()>) -> bool {
        let hooks = &mut self.hooks;
        let message = match panic::catch_unwind(AssertUnwindSafe(|| call(hooks))) {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => format!("{:#}", e),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };

        self.reporter.report(&UserReport {
            addin: self.addin_type.type_name().to_string(),
            stage,
            message,
        });
        false
    }

    pub(crate) fn reporter(&self) -> Arc<dyn UserReporter> {
        self.reporter.clone()
    }

    /// Log and report a binding defect, then hand it back.
    fn surface(&self, err: RelayBindingError) -> RelayBindingError {
        self.reporter.report(&UserReport {
            addin: self.addin_type.type_name().to_string(),
            stage: Stage::Binding,
            message: err.to_string(),
        });
        err
    }
}

/// Relay mode, fixed by the first activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    Uninitialized,
    Direct,
    Proxied,
}

enum Mode {
    Direct,
    Proxied(Option<PluginInstance>),
}

/// Host-facing relay for one add-in type.
pub struct LifecycleRelay<H> {
    registry: Arc<ScopeRegistry>,
    direct: DirectHost<H>,
    mode: Option<Mode>,
}

impl<H: AddinHooks> LifecycleRelay<H> {
    pub fn new(
        addin_type: AddinType,
        hooks: H,
        registry: Arc<ScopeRegistry>,
        reporter: Arc<dyn UserReporter>,
    ) -> Self {
        Self {
            registry,
            direct: DirectHost::new(hooks, addin_type, reporter),
            mode: None,
        }
    }

    pub fn mode(&self) -> RelayMode {
        match self.mode {
            None => RelayMode::Uninitialized,
            Some(Mode::Direct) => RelayMode::Direct,
            Some(Mode::Proxied(_)) => RelayMode::Proxied,
        }
    }

    pub fn addin_type(&self) -> &AddinType {
        self.direct.addin_type()
    }

    pub fn hooks(&self) -> &H {
        self.direct.hooks()
    }

    /// Whether a proxied instance is currently alive.
    pub fn has_instance(&self) -> bool {
        matches!(self.mode, Some(Mode::Proxied(Some(_))))
    }
}

fn initial_mode(registry: &ScopeRegistry, addin_type: &AddinType) -> Mode {
    if registry.is_isolated(addin_type) {
        tracing::debug!(type_name = addin_type.type_name(), "Relay runs hooks directly");
        Mode::Direct
    } else {
        tracing::info!(
            type_name = addin_type.type_name(),
            "Relay proxies into an isolation scope"
        );
        Mode::Proxied(None)
    }
}

fn instantiate_isolated(
    registry: &ScopeRegistry,
    addin_type: &AddinType,
    reporter: Arc<dyn UserReporter>,
) -> Result<PluginInstance, RelayBindingError> {
    let scope = registry.get_or_create_scope(addin_type)?;
    let instance = registry.instantiate(&scope, addin_type, reporter)?;
    Ok(instance)
}

impl<H: AddinHooks> AddinServer for LifecycleRelay<H> {
    fn activate(&mut self, site: SiteHandle, first_time: bool) -> Result<(), RelayBindingError> {
        let mode = self
            .mode
            .get_or_insert_with(|| initial_mode(&self.registry, self.direct.addin_type()));

        match mode {
            Mode::Direct => {
                self.direct.activate(site, first_time);
                Ok(())
            }
            Mode::Proxied(slot) => {
                if slot.take().is_some() {
                    tracing::warn!(
                        type_name = self.direct.addin_type().type_name(),
                        "Activated twice without deactivate, released the previous instance"
                    );
                }

                let mut instance = instantiate_isolated(
                    &self.registry,
                    self.direct.addin_type(),
                    self.direct.reporter(),
                )
                .map_err(|e| self.direct.surface(e))?;
                instance
                    .activate(site, first_time)
                    .map_err(|e| self.direct.surface(e))?;
                *slot = Some(instance);
                Ok(())
            }
        }
    }

    fn deactivate(&mut self) -> Result<(), RelayBindingError> {
        match &mut self.mode {
            Some(Mode::Direct) => {
                self.direct.deactivate();
                Ok(())
            }
            Some(Mode::Proxied(slot)) => match slot.take() {
                Some(mut instance) => {
                    let result = instance.deactivate();
                    drop(instance);
                    result.map_err(|e| self.direct.surface(e))
                }
                None => {
                    tracing::debug!("Deactivate without a live instance ignored");
                    Ok(())
                }
            },
            None => {
                tracing::debug!("Deactivate before activate ignored");
                Ok(())
            }
        }
    }

    fn reset_interface(&mut self) -> Result<(), RelayBindingError> {
        match &mut self.mode {
            Some(Mode::Direct) => {
                self.direct.reset_interface();
                Ok(())
            }
            Some(Mode::Proxied(Some(instance))) => instance
                .reset_interface()
                .map_err(|e| self.direct.surface(e)),
            _ => {
                tracing::debug!("Interface reset before activation ignored");
                Ok(())
            }
        }
    }
}

/// Legacy strategy: hooks run in the caller's scope, no isolation.
pub struct PassThroughRelay<H> {
    direct: DirectHost<H>,
}

impl<H: AddinHooks> PassThroughRelay<H> {
    pub fn new(addin_type: AddinType, hooks: H, reporter: Arc<dyn UserReporter>) -> Self {
        Self {
            direct: DirectHost::new(hooks, addin_type, reporter),
        }
    }

    pub fn hooks(&self) -> &H {
        self.direct.hooks()
    }
}

impl<H: AddinHooks> AddinServer for PassThroughRelay<H> {
    fn activate(&mut self, site: SiteHandle, first_time: bool) -> Result<(), RelayBindingError> {
        self.direct.activate(site, first_time);
        Ok(())
    }

    fn deactivate(&mut self) -> Result<(), RelayBindingError> {
        self.direct.deactivate();
        Ok(())
    }

    fn reset_interface(&mut self) -> Result<(), RelayBindingError> {
        self.direct.reset_interface();
        Ok(())
    }
}

/// Pick the relay strategy for `addin_type` once, from the registry's
/// capability.
pub fn select_server<H: AddinHooks + 'static>(
    registry: Arc<ScopeRegistry>,
    addin_type: AddinType,
    hooks: H,
    reporter: Arc<dyn UserReporter>,
) -> Box<dyn AddinServer> {
    let capability = registry.capability();
    select_server_for(capability, registry, addin_type, hooks, reporter)
}

/// Pick the relay strategy from a capability decided elsewhere, typically
/// by the host that created the instance.
pub fn select_server_for<H: AddinHooks + 'static>(
    capability: IsolationCapability,
    registry: Arc<ScopeRegistry>,
    addin_type: AddinType,
    hooks: H,
    reporter: Arc<dyn UserReporter>,
) -> Box<dyn AddinServer> {
    match capability {
        IsolationCapability::PrivateScopes => {
            Box::new(LifecycleRelay::new(addin_type, hooks, registry, reporter))
        }
        IsolationCapability::PassThrough => {
            tracing::debug!(
                type_name = addin_type.type_name(),
                "Private scopes unavailable, using pass-through relay"
            );
            Box::new(PassThroughRelay::new(addin_type, hooks, reporter))
        }
    }
}

/// Host-side entry: a server driving the add-in in `addin_type`'s module.
///
/// With private scopes the module is only ever loaded inside its scope.
/// Without them it is loaded through the default scope and driven as is.
pub fn connect(
    registry: Arc<ScopeRegistry>,
    addin_type: AddinType,
    reporter: Arc<dyn UserReporter>,
) -> Result<Box<dyn AddinServer>, InstantiationError> {
    match registry.capability() {
        IsolationCapability::PrivateScopes => Ok(Box::new(LifecycleRelay::new(
            addin_type, NoHooks, registry, reporter,
        ))),
        IsolationCapability::PassThrough => {
            let instance = registry.instantiate_default(&addin_type, reporter)?;
            Ok(Box::new(instance))
        }
    }
}
