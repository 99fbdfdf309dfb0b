//! WR-021: CLI subcommands: validate, plan, start, stop, status, installers.

use crate::control::dao::{MemoryWorkspaceDao, WorkspaceDao};
use crate::control::runtimes::WorkspaceRuntimes;
use crate::core::config::ControlPlaneConfig;
use crate::core::environment::EnvironmentNormalizer;
use crate::core::hasher;
use crate::core::installer::{InstallerRegistry, InstallerResolver, MemoryInstallerRegistry};
use crate::core::parser;
use crate::core::recipe::RecipeResolver;
use crate::core::types::{Machine, Workspace};
use crate::events::EventService;
use crate::infra::local::LocalInfrastructure;
use crate::infra::registry::InfrastructureRegistry;
use crate::infra::RuntimeInfrastructure;
use clap::Subcommand;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate every environment of a workspace against its backend
    Validate {
        /// Path to the workspace definition
        #[arg(short, long, default_value = "workspace.yaml")]
        file: PathBuf,
    },

    /// Show how an environment would be provisioned
    Plan {
        /// Path to the workspace definition
        #[arg(short, long, default_value = "workspace.yaml")]
        file: PathBuf,

        /// Environment to plan (default: the workspace default)
        #[arg(short, long)]
        env: Option<String>,
    },

    /// Start a workspace environment on the local backend
    Start {
        /// Path to the workspace definition
        #[arg(short, long, default_value = "workspace.yaml")]
        file: PathBuf,

        /// Environment to start (default: the workspace default)
        #[arg(short, long)]
        env: Option<String>,

        /// Runtime owner (default: $USER)
        #[arg(long)]
        owner: Option<String>,
    },

    /// Stop the running runtime of a workspace
    Stop {
        /// Path to the workspace definition
        #[arg(short, long, default_value = "workspace.yaml")]
        file: PathBuf,
    },

    /// Show runtimes tracked by the local backend
    Status,

    /// List registered installers in dependency order
    Installers,
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands, config: &ControlPlaneConfig) -> Result<(), String> {
    match cmd {
        Commands::Validate { file } => cmd_validate(config, &file),
        Commands::Plan { file, env } => cmd_plan(config, &file, env.as_deref()),
        Commands::Start { file, env, owner } => {
            let owner = owner
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "user".to_string());
            cmd_start(config, &file, env.as_deref(), &owner)
        }
        Commands::Stop { file } => cmd_stop(config, &file),
        Commands::Status => cmd_status(config),
        Commands::Installers => cmd_installers(config),
    }
}

// ============================================================================
// Wiring
// ============================================================================

/// Installers from the config file plus the installers directory.
fn load_installers(config: &ControlPlaneConfig) -> Result<MemoryInstallerRegistry, String> {
    let mut registry = MemoryInstallerRegistry::from_installers(config.installers.clone());
    if let Some(ref dir) = config.installers_dir {
        registry.load_dir(dir).map_err(|e| e.to_string())?;
    }
    Ok(registry)
}

fn recipe_resolver(config: &ControlPlaneConfig) -> RecipeResolver {
    match config.recipe.fetch_timeout() {
        Some(timeout) => RecipeResolver::with_timeout(timeout),
        None => RecipeResolver::default(),
    }
}

fn local_infrastructure(
    config: &ControlPlaneConfig,
    events: Option<EventService>,
) -> Result<LocalInfrastructure, String> {
    let installers: Arc<dyn InstallerRegistry> = Arc::new(load_installers(config)?);
    let local = LocalInfrastructure::new(config, installers);
    Ok(match events {
        Some(events) => local.with_events(events),
        None => local,
    })
}

fn build_registry(
    config: &ControlPlaneConfig,
    events: Option<EventService>,
) -> Result<InfrastructureRegistry, String> {
    let mut registry = InfrastructureRegistry::new();
    if config.local.enabled {
        registry
            .register(Arc::new(local_infrastructure(config, events)?))
            .map_err(|e| e.to_string())?;
    }
    Ok(registry)
}

fn load_workspace(file: &Path) -> Result<Workspace, String> {
    parser::parse_workspace_file(file).map_err(|e| e.to_string())
}

fn block_on<F: Future<Output = Result<(), String>>>(fut: F) -> Result<(), String> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("cannot start async runtime: {}", e))?
        .block_on(fut)
}

/// Control plane over the local backend with `workspace` registered.
async fn control_plane(
    config: &ControlPlaneConfig,
    workspace: &Workspace,
) -> Result<WorkspaceRuntimes, String> {
    let events = EventService::new().with_log(&config.state_dir);
    let registry = build_registry(config, Some(events.clone()))?;
    let dao = Arc::new(MemoryWorkspaceDao::new());
    dao.create(workspace.clone()).map_err(|e| e.to_string())?;
    Ok(WorkspaceRuntimes::new(Arc::new(registry), dao, events).await)
}

fn print_machines<'a>(machines: impl IntoIterator<Item = (&'a String, &'a Machine)>) {
    for (name, machine) in machines {
        println!("  {}: {}", name, machine.status);
        for (server, s) in &machine.servers {
            println!("    {}: {} [{}]", server, s.url, s.status);
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_validate(config: &ControlPlaneConfig, file: &Path) -> Result<(), String> {
    let workspace = load_workspace(file)?;
    let registry = build_registry(config, None)?;

    let mut failures = 0;
    for (name, env) in &workspace.environments {
        let result = registry.get(&env.recipe.recipe_type).and_then(|infra| infra.estimate(env));
        if let Err(e) = result {
            eprintln!("  ERROR: {}: {}", name, e);
            failures += 1;
        }
    }

    if failures > 0 {
        return Err(format!("{} invalid environment(s)", failures));
    }
    println!(
        "OK: {} ({} environments)",
        workspace.name,
        workspace.environments.len()
    );
    Ok(())
}

fn cmd_plan(config: &ControlPlaneConfig, file: &Path, env: Option<&str>) -> Result<(), String> {
    let workspace = load_workspace(file)?;
    let env_name = workspace
        .select_env(env)
        .ok_or_else(|| format!("workspace '{}' has no default environment", workspace.id))?;
    let env = workspace.environments.get(env_name).ok_or_else(|| {
        format!(
            "Workspace '{}' doesn't contain environment '{}'",
            workspace.id, env_name
        )
    })?;

    let registry = build_registry(config, None)?;
    let infra = registry
        .get(&env.recipe.recipe_type)
        .map_err(|e| e.to_string())?;
    let estimated = infra.estimate(env).map_err(|e| e.to_string())?;

    let installers = load_installers(config)?;
    let recipes = recipe_resolver(config);
    let internal = EnvironmentNormalizer::new(&installers, &recipes)
        .normalize(&estimated)
        .map_err(|e| e.to_string())?;
    let fingerprint = hasher::fingerprint(&estimated).map_err(|e| e.to_string())?;

    println!(
        "Planning: {}/{} ({} machines, infrastructure {})",
        workspace.name,
        env_name,
        internal.machines.len(),
        infra.name()
    );
    println!();
    for (name, machine) in &internal.machines {
        println!("{}:", name);
        if !machine.installers.is_empty() {
            let order: Vec<String> = machine.installers.iter().map(|i| i.key()).collect();
            println!("  installers: {}", order.join(" -> "));
        }
        for (server, s) in &machine.servers {
            let protocol = s.protocol.as_deref().unwrap_or("tcp");
            println!("  server {}: {} ({})", server, s.port, protocol);
        }
    }

    if !internal.warnings().is_empty() {
        println!();
        println!("Warnings:");
        for w in internal.warnings() {
            println!("  {}", w);
        }
    }
    println!();
    println!("Fingerprint: {}", fingerprint);
    Ok(())
}

fn cmd_start(
    config: &ControlPlaneConfig,
    file: &Path,
    env: Option<&str>,
    owner: &str,
) -> Result<(), String> {
    let workspace = load_workspace(file)?;
    block_on(async {
        let runtimes = control_plane(config, &workspace).await?;
        let task = runtimes
            .start_async(&workspace, env, owner)
            .map_err(|e| e.to_string())?;
        let identity = task.identity().clone();

        let ctrl_c = {
            let runtimes = runtimes.clone();
            let workspace_id = workspace.id.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok()?;
                tracing::warn!(workspace = %workspace_id, "interrupted, stopping workspace");
                runtimes.stop_async(&workspace_id).ok()
            })
        };

        let result = task.wait().await;
        if ctrl_c.is_finished() {
            if let Ok(Some(stop)) = ctrl_c.await {
                let _ = stop.wait().await;
            }
        } else {
            ctrl_c.abort();
        }

        let runtime = result.map_err(|e| e.to_string())?;
        println!("Started {} as {}", workspace.name, identity);
        print_machines(&runtime.machines());
        if let Some(channel) = runtimes
            .runtime_context(&workspace.id)
            .and_then(|ctx| ctx.output_channel().ok())
        {
            println!("Output: {}", channel);
        }
        for w in runtime.warnings() {
            println!("  WARNING: {}", w);
        }
        Ok(())
    })
}

fn cmd_stop(config: &ControlPlaneConfig, file: &Path) -> Result<(), String> {
    let workspace = load_workspace(file)?;
    block_on(async {
        let runtimes = control_plane(config, &workspace).await?;
        runtimes.stop(&workspace.id).await.map_err(|e| e.to_string())?;
        println!("Stopped {}", workspace.name);
        Ok(())
    })
}

fn cmd_status(config: &ControlPlaneConfig) -> Result<(), String> {
    let local = local_infrastructure(config, None)?;
    let identities = local.identities().map_err(|e| e.to_string())?;
    if identities.is_empty() {
        println!("No tracked runtimes.");
        return Ok(());
    }

    for identity in &identities {
        let record = local
            .driver()
            .load_record(identity)
            .map_err(|e| e.to_string())?;
        let Some(record) = record else {
            continue;
        };
        println!("Runtime: {}", identity);
        println!("  Started: {}", record.started_at.to_rfc3339());
        let runtime = local.runtime(identity).map_err(|e| e.to_string())?;
        print_machines(&runtime.machines());
    }
    Ok(())
}

fn cmd_installers(config: &ControlPlaneConfig) -> Result<(), String> {
    let registry = load_installers(config)?;
    if registry.is_empty() {
        println!("No installers registered.");
        return Ok(());
    }
    let keys: Vec<String> = registry.installers().iter().map(|i| i.key()).collect();
    let ordered = InstallerResolver::resolve(&keys, &registry).map_err(|e| e.to_string())?;
    for installer in &ordered {
        let description = installer
            .description
            .as_deref()
            .or(installer.name.as_deref())
            .unwrap_or("");
        if installer.dependencies.is_empty() {
            println!("{}  {}", installer.key(), description);
        } else {
            println!(
                "{}  {} (after {})",
                installer.key(),
                description,
                installer.dependencies.join(", ")
            );
        }
    }
    Ok(())
}
