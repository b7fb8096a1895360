//! Dependency diagnostics.
//!
//! Answers "which copy of this dependency did my add-in get, and who else
//! loaded one?" from the registry's load ledgers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::registry::ScopeRegistry;
use crate::scope::{AddinType, LoadedDependency, DEFAULT_CONTEXT_NAME};

/// One module as shown in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleRecord {
    pub name: String,
    pub context: String,
    pub version: Option<String>,
    pub path: Option<PathBuf>,
}

impl ModuleRecord {
    fn from_dependency(context: &str, dependency: &LoadedDependency) -> Self {
        Self {
            name: dependency.name.clone(),
            context: context.to_string(),
            version: dependency.version.as_ref().map(|v| v.to_string()),
            path: Some(dependency.path.clone()),
        }
    }
}

/// Report for one dependency name, as seen from one add-in.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyReport {
    pub dependency: String,
    pub requester: ModuleRecord,
    /// Copy the requester resolves to, if any is loaded.
    pub used: Option<ModuleRecord>,
    /// Every loaded copy, ordered by context name.
    pub loaded: Vec<ModuleRecord>,
}

impl DependencyReport {
    pub fn build(registry: &ScopeRegistry, requester: &AddinType, dependency: &str) -> Self {
        let scope = requester
            .install_directory()
            .and_then(|dir| registry.find_scope_for_directory(dir));

        let requester_record = ModuleRecord {
            name: requester.type_name().to_string(),
            context: scope
                .as_ref()
                .map(|s| s.name().to_string())
                .unwrap_or_else(|| requester.context().to_string()),
            version: scope
                .as_ref()
                .and_then(|s| s.resolver().manifest().addin.as_ref())
                .and_then(|addin| addin.version.clone()),
            path: Some(requester.module_path().to_path_buf()),
        };

        let mut loaded = Vec::new();
        for each in registry.scopes() {
            loaded.extend(
                each.loaded_dependencies()
                    .iter()
                    .filter(|d| d.name == dependency)
                    .map(|d| ModuleRecord::from_dependency(each.name(), d)),
            );
        }
        let defaults: Vec<ModuleRecord> = registry
            .default_scope()
            .loaded_dependencies()
            .iter()
            .filter(|d| d.name == dependency)
            .map(|d| ModuleRecord::from_dependency(DEFAULT_CONTEXT_NAME, d))
            .collect();
        loaded.extend(defaults.iter().cloned());
        loaded.sort_by(|a, b| a.context.cmp(&b.context));

        // Scope-local first, default second, same as resolution.
        let used = scope
            .as_ref()
            .and_then(|s| {
                loaded
                    .iter()
                    .find(|record| record.context == s.name())
                    .cloned()
            })
            .or_else(|| defaults.into_iter().next());

        Self {
            dependency: dependency.to_string(),
            requester: requester_record,
            used,
            loaded,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn key_value(f: &mut fmt::Formatter<'_>, key: &str, value: Option<&str>) -> fmt::Result {
    writeln!(f, "     {}: {}", key, value.unwrap_or("<n/a>"))
}

impl fmt::Display for DependencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path_text = |record: &ModuleRecord| record.path.as_ref().map(|p| p.display().to_string());

        writeln!(f, "****  Requesting Add-In Module  ****")?;
        key_value(f, "Name", Some(&self.requester.name))?;
        key_value(f, "LoadContext", Some(&self.requester.context))?;
        key_value(f, "Version", self.requester.version.as_deref())?;
        key_value(f, "Path", path_text(&self.requester).as_deref())?;
        writeln!(f)?;

        writeln!(f, "****  Dependency '{}' Actually Used  ****", self.dependency)?;
        match &self.used {
            Some(used) => {
                key_value(f, "Name", Some(&used.name))?;
                key_value(f, "LoadContext", Some(&used.context))?;
                key_value(f, "Version", used.version.as_deref())?;
                key_value(f, "Path", path_text(used).as_deref())?;
            }
            None => writeln!(f, "     <not loaded>")?,
        }
        writeln!(f)?;

        writeln!(
            f,
            "****  All Loaded \"{}\" Modules (by LoadContext)  ****",
            self.dependency
        )?;
        let mut groups: BTreeMap<&str, Vec<&ModuleRecord>> = BTreeMap::new();
        for record in &self.loaded {
            groups.entry(record.context.as_str()).or_default().push(record);
        }
        for (context, records) in groups {
            key_value(f, "LoadContext", Some(context))?;
            for record in records {
                key_value(f, "Version", record.version.as_deref())?;
                key_value(f, "Path", path_text(record).as_deref())?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
