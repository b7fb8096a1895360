//! Command-line interface for addinshim.
//!
//! Inspects install directories the way a host's scope would see them and
//! drives an add-in module through one host session.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use addinshim_core::config::{env_vars, HostConfig};
use addinshim_core::identity::{parse_version, DependencyIdentity};
use addinshim_core::manifest::ManifestEntry;
use addinshim_core::registry::{IsolationCapability, ScopeRegistry};
use addinshim_core::relay::{connect, AddinServer};
use addinshim_core::RelayBindingError;
use addinshim_core::{AddinType, DependencyReport, SiteHandle, TracingReporter};

/// addinshim - Run in-process add-ins in per-directory isolation scopes.
#[derive(Parser, Debug)]
#[command(name = "addinshim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Host config file (TOML). Environment variables still apply.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Show the scope an install directory maps to and what it ships.
    Inspect {
        /// Add-in install directory.
        dir: PathBuf,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Resolve one dependency the way the directory's scope would.
    Resolve {
        /// Add-in install directory.
        dir: PathBuf,

        /// Dependency name.
        name: String,

        /// Requested version.
        #[arg(long, value_parser = parse_version)]
        version: Option<semver::Version>,

        /// Resolve a native library instead of a module.
        #[arg(long)]
        native: bool,
    },

    /// Load an add-in module, run one activation and report on it.
    Host {
        /// Path to the add-in module.
        module: PathBuf,

        /// Add-in type name exported by the module.
        #[arg(short = 't', long = "type")]
        type_name: String,

        /// Interface resets to forward while active.
        #[arg(long, default_value_t = 0)]
        resets: u32,

        /// Dependency to print a load report for.
        #[arg(long)]
        report: Option<String>,

        /// Print the registry snapshot and report as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose);

    let config = load_config(args.config.as_deref())?;
    let registry = Arc::new(ScopeRegistry::native(config));

    match args.command {
        Command::Inspect { dir, json } => run_inspect(&registry, &dir, json),
        Command::Resolve {
            dir,
            name,
            version,
            native,
        } => run_resolve(&registry, &dir, name, version, native),
        Command::Host {
            module,
            type_name,
            resets,
            report,
            json,
        } => run_host(registry, module, type_name, resets, report, json),
    }
}

fn init_logging(verbose: bool) {
    // JSON logs for supervised hosts
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            tracing_subscriber::EnvFilter::new("addinshim=debug,addinshim_core=debug")
        } else {
            tracing_subscriber::EnvFilter::new("addinshim=info,addinshim_core=info")
                .add_directive(tracing::Level::WARN.into())
        }
    });

    // Logs go to stderr, stdout carries command output.
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(path: Option<&Path>) -> Result<HostConfig> {
    let config = match path {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => HostConfig::default(),
    };
    Ok(config.with_env_overrides())
}

#[derive(Debug, Serialize)]
struct InspectOutput<'a> {
    scope: &'a str,
    install_directory: &'a Path,
    capability: IsolationCapability,
    platform: &'a str,
    addin_name: Option<&'a str>,
    addin_version: Option<&'a str>,
    dependencies: Vec<DeclaredDependency<'a>>,
}

#[derive(Debug, Serialize)]
struct DeclaredDependency<'a> {
    #[serde(flatten)]
    entry: &'a ManifestEntry,
    resolved: Option<PathBuf>,
}

fn run_inspect(registry: &ScopeRegistry, dir: &Path, json: bool) -> Result<()> {
    let scope = registry.scope_for_directory(dir)?;
    let resolver = scope.resolver();
    let manifest = resolver.manifest();
    let addin = manifest.addin.as_ref();

    let dependencies = manifest
        .dependencies
        .iter()
        .map(|entry| {
            let identity = DependencyIdentity {
                name: entry.name.clone(),
                version: Some(entry.version.clone()),
                platform: entry.platform.clone(),
                kind: entry.kind,
            };
            DeclaredDependency {
                entry,
                resolved: resolver.resolve(&identity).map(|r| r.path),
            }
        })
        .collect();

    let output = InspectOutput {
        scope: scope.name(),
        install_directory: scope.install_directory(),
        capability: registry.capability(),
        platform: resolver.platform(),
        addin_name: addin.and_then(|a| a.name.as_deref()),
        addin_version: addin.and_then(|a| a.version.as_deref()),
        dependencies,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Scope: {}", output.scope);
    println!("  Install directory: {}", output.install_directory.display());
    println!("  Capability: {}", capability_label(output.capability));
    println!("  Platform: {}", output.platform);
    if let Some(name) = output.addin_name {
        println!("  Add-in: {} {}", name, output.addin_version.unwrap_or(""));
    }

    if output.dependencies.is_empty() {
        println!("  No declared dependencies");
        return Ok(());
    }

    println!("  Dependencies:");
    for declared in &output.dependencies {
        let entry = declared.entry;
        let platform = entry
            .platform
            .as_deref()
            .map(|p| format!(" [{}]", p))
            .unwrap_or_default();
        let location = match &declared.resolved {
            Some(path) => path.display().to_string(),
            None => "missing".to_string(),
        };
        println!(
            "    {} {} ({:?}){} -> {}",
            entry.name, entry.version, entry.kind, platform, location
        );
    }
    Ok(())
}

fn run_resolve(
    registry: &ScopeRegistry,
    dir: &Path,
    name: String,
    version: Option<semver::Version>,
    native: bool,
) -> Result<()> {
    let scope = registry.scope_for_directory(dir)?;
    let mut identity = if native {
        DependencyIdentity::native(name)
    } else {
        DependencyIdentity::module(name)
    };
    if let Some(version) = version {
        identity = identity.with_version(version);
    }

    match scope.resolve(&identity) {
        Some(resolution) => {
            let version = resolution
                .version
                .map(|v| v.to_string())
                .unwrap_or_else(|| "unversioned".to_string());
            println!(
                "{} -> {} ({}, scope {})",
                identity,
                resolution.path.display(),
                version,
                scope.name()
            );
        }
        None => {
            println!("{}: not found (falls through to default scope)", identity);
            if let Some(path) = registry.default_scope().resolve(&identity) {
                println!("  default scope: {}", path.display());
            }
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct HostOutput {
    snapshot: addinshim_core::RegistrySnapshot,
    report: Option<DependencyReport>,
}

fn run_host(
    registry: Arc<ScopeRegistry>,
    module: PathBuf,
    type_name: String,
    resets: u32,
    report: Option<String>,
    json: bool,
) -> Result<()> {
    if !module.is_file() {
        anyhow::bail!("Add-in module not found: {}", module.display());
    }

    let addin_type = AddinType::new(type_name, &module);
    tracing::info!(
        capability = capability_label(registry.capability()),
        "Hosting {} from {}",
        addin_type.type_name(),
        module.display()
    );

    let mut server = connect(registry.clone(), addin_type.clone(), Arc::new(TracingReporter))
        .with_context(|| format!("Failed to load {}", addin_type.type_name()))?;

    server
        .activate(SiteHandle::null(), true)
        .with_context(|| format!("Failed to activate {}", addin_type.type_name()))?;
    reset_or_release(server.as_mut(), resets)
        .with_context(|| format!("Failed to reset interface of {}", addin_type.type_name()))?;

    // Report while the instance is alive so its scope shows as in use.
    let report = report.map(|dep| DependencyReport::build(&registry, &addin_type, &dep));
    let output = HostOutput {
        snapshot: registry.snapshot(),
        report,
    };

    server
        .deactivate()
        .with_context(|| format!("Failed to deactivate {}", addin_type.type_name()))?;
    drop(server);

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!(
        "Hosted {} ({})",
        addin_type.type_name(),
        capability_label(output.snapshot.capability)
    );
    for scope in &output.snapshot.scopes {
        println!(
            "  Scope {}: {} dependencies loaded",
            scope.name,
            scope.dependencies.len()
        );
    }
    if let Some(report) = &output.report {
        println!();
        print!("{}", report);
    }
    Ok(())
}

/// Forward `resets` interface resets. On failure the add-in is deactivated
/// before the error is returned, so the host site is not left attached.
fn reset_or_release(server: &mut dyn AddinServer, resets: u32) -> Result<(), RelayBindingError> {
    for _ in 0..resets {
        if let Err(e) = server.reset_interface() {
            if let Err(deactivate_err) = server.deactivate() {
                tracing::warn!("Deactivate after failed reset also failed: {}", deactivate_err);
            }
            return Err(e);
        }
    }
    Ok(())
}

fn capability_label(capability: IsolationCapability) -> &'static str {
    match capability {
        IsolationCapability::PrivateScopes => "private scopes",
        IsolationCapability::PassThrough => "pass-through",
    }
}
