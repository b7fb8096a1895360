//! Sample add-in.
//!
//! Adds one "module version" command while active and reports which load
//! context it was created in. Build as a `cdylib`, install the library into
//! its own directory and point `addinshim host` at it with
//! `--type sample_addin::SampleAddin`.

use addinshim_sdk::prelude::*;

/// Internal name of the command this add-in contributes.
pub const VERSION_COMMAND: &str = "addinshim:SampleAddin:ModuleVersion";

/// Command that reports where this module was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCommand {
    internal_name: String,
    description: String,
}

impl VersionCommand {
    fn new(context: &ActivationContext) -> Self {
        let addin = context.addin_type();
        let description = format!(
            "     Name: {}\n     LoadContext: {}\n     Version: {}\n     Path: {}",
            addin.type_name(),
            addin.context(),
            env!("CARGO_PKG_VERSION"),
            addin.module_path().display(),
        );
        Self {
            internal_name: VERSION_COMMAND.to_string(),
            description,
        }
    }

    pub fn internal_name(&self) -> &str {
        &self.internal_name
    }

    /// Text shown when the command runs.
    pub fn execute(&self) -> &str {
        &self.description
    }
}

#[derive(Debug, Default)]
pub struct SampleAddin {
    command: Option<VersionCommand>,
}

impl SampleAddin {
    pub fn command(&self) -> Option<&VersionCommand> {
        self.command.as_ref()
    }
}

impl AddinHooks for SampleAddin {
    fn on_activate(&mut self, context: &ActivationContext) -> anyhow::Result<()> {
        tracing::info!(
            context = %context.addin_type().context(),
            first_time = context.first_time(),
            "SampleAddin activated"
        );
        Ok(())
    }

    fn on_deactivate(&mut self) -> anyhow::Result<()> {
        tracing::info!("SampleAddin deactivated");
        Ok(())
    }

    fn add_customization(&mut self, context: &ActivationContext) -> anyhow::Result<()> {
        let command = VersionCommand::new(context);
        tracing::info!("Added command {}", command.internal_name());
        tracing::debug!("{}", command.execute());
        self.command = Some(command);
        Ok(())
    }

    fn remove_customization(&mut self) -> anyhow::Result<()> {
        if let Some(command) = self.command.take() {
            tracing::info!("Removed command {}", command.internal_name());
        }
        Ok(())
    }
}

export_addin!(SampleAddin);
