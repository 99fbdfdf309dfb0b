//! WR-018: Local shell-script infrastructure.
//!
//! Each machine is a directory under `<state_dir>/machines/<ws>/<env>/`.
//! Starting a machine runs the resolved recipe, then every installer script
//! in dependency order, through the configured shell. A YAML record of the
//! started runtime lives at `<state_dir>/runtimes/<ws>/<env>.yaml` so the
//! control plane can recover it after a restart.

use super::context::{ContextRegistry, RuntimeContext};
use super::runtime::{InternalRuntime, NoOpUrlRewriter, UrlRewriter};
use super::{RuntimeDriver, RuntimeInfrastructure, RuntimeTracker, StartedRuntime};
use crate::core::config::ControlPlaneConfig;
use crate::core::environment::{EnvironmentNormalizer, InternalEnvironment, InternalMachineConfig};
use crate::core::error::{InfraError, Result};
use crate::core::hasher::{self, ENVIRONMENT_HASH_PROPERTY};
use crate::core::parser::check_path_component;
use crate::core::installer::InstallerRegistry;
use crate::core::parser;
use crate::core::recipe::RecipeResolver;
use crate::core::types::{
    Environment, Machine, MachineStatus, RuntimeIdentity, Server, ServerStatus, Warning,
    ENV_VAR_ATTRIBUTE_PREFIX,
};
use crate::events::{EventService, RuntimeEvent};
use crate::transport::local::{exec_script, ExecRequest};
use crate::transport::ExecError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const INFRASTRUCTURE_NAME: &str = "local";
pub const DEFAULT_CONTENT_TYPE: &str = "text/x-shellscript";
const OUTPUT_LOG: &str = "output.log";

/// Persisted description of a started runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeRecord {
    pub identity: RuntimeIdentity,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub machines: IndexMap<String, Machine>,
    #[serde(default)]
    pub properties: IndexMap<String, String>,
    #[serde(default)]
    pub warnings: Vec<Warning>,
}

fn check_identity(identity: &RuntimeIdentity) -> Result<()> {
    check_path_component("workspace id", &identity.workspace_id)?;
    check_path_component("environment name", &identity.env_name)
}

/// URL a local server is reachable at.
fn server_url(protocol: Option<&str>, port: &str, path: Option<&str>) -> String {
    let path = match path {
        Some(p) if !p.is_empty() && !p.starts_with('/') => format!("/{}", p),
        Some(p) => p.to_string(),
        None => String::new(),
    };
    format!("{}://127.0.0.1:{}{}", protocol.unwrap_or("tcp"), port, path)
}

// ============================================================================
// Driver
// ============================================================================

#[derive(Debug, Clone)]
pub struct LocalDriver {
    state_dir: PathBuf,
    shell: String,
    events: Option<EventService>,
}

impl LocalDriver {
    pub fn new(state_dir: &Path, shell: &str) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            shell: shell.to_string(),
            events: None,
        }
    }

    pub fn runtime_dir(&self, identity: &RuntimeIdentity) -> PathBuf {
        self.state_dir
            .join("machines")
            .join(&identity.workspace_id)
            .join(&identity.env_name)
    }

    pub fn record_path(&self, identity: &RuntimeIdentity) -> PathBuf {
        self.state_dir
            .join("runtimes")
            .join(&identity.workspace_id)
            .join(format!("{}.yaml", identity.env_name))
    }

    fn publish(&self, event: RuntimeEvent) {
        if let Some(ref events) = self.events {
            events.publish(event);
        }
    }

    fn publish_machine(
        &self,
        identity: &RuntimeIdentity,
        machine: &str,
        status: MachineStatus,
        error: Option<String>,
    ) {
        self.publish(RuntimeEvent::MachineStatus {
            identity: identity.clone(),
            machine: machine.to_string(),
            status,
            error,
        });
    }

    pub fn load_record(&self, identity: &RuntimeIdentity) -> Result<Option<RuntimeRecord>> {
        check_identity(identity)?;
        read_record(&self.record_path(identity))
    }

    /// Write the record atomically (temp file + rename).
    fn save_record(&self, record: &RuntimeRecord) -> Result<()> {
        let path = self.record_path(&record.identity);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                InfraError::internal(format!("cannot create dir {}: {}", parent.display(), e))
            })?;
        }
        let yaml = serde_yaml_ng::to_string(record)
            .map_err(|e| InfraError::internal(format!("serialize error: {}", e)))?;

        let tmp_path = path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, &yaml).map_err(|e| {
            InfraError::internal(format!("cannot write {}: {}", tmp_path.display(), e))
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|e| {
            InfraError::internal(format!(
                "cannot rename {} → {}: {}",
                tmp_path.display(),
                path.display(),
                e
            ))
        })
    }

    fn remove_record(&self, identity: &RuntimeIdentity) -> Result<()> {
        let path = self.record_path(identity);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(InfraError::internal(format!(
                "cannot remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn machine_env(
        identity: &RuntimeIdentity,
        machine: &str,
        config: &InternalMachineConfig,
    ) -> Vec<(String, String)> {
        let mut env = vec![
            ("WSINFRA_WORKSPACE_ID".to_string(), identity.workspace_id.clone()),
            ("WSINFRA_ENV".to_string(), identity.env_name.clone()),
            ("WSINFRA_OWNER".to_string(), identity.owner_id.clone()),
            ("WSINFRA_MACHINE".to_string(), machine.to_string()),
        ];
        for (key, value) in &config.attributes {
            if let Some(var) = key.strip_prefix(ENV_VAR_ATTRIBUTE_PREFIX) {
                env.push((var.to_string(), value.clone()));
            }
        }
        env
    }

    async fn run_machine(
        &self,
        identity: &RuntimeIdentity,
        name: &str,
        config: &InternalMachineConfig,
        recipe: &str,
        cancel: &CancellationToken,
    ) -> Result<Machine> {
        let runtime_dir = self.runtime_dir(identity);
        let machine_dir = runtime_dir.join(name);
        std::fs::create_dir_all(&machine_dir).map_err(|e| {
            InfraError::internal(format!("cannot create {}: {}", machine_dir.display(), e))
        })?;

        let mut scripts: Vec<(String, &str)> = Vec::new();
        if !recipe.trim().is_empty() {
            scripts.push(("recipe".to_string(), recipe));
        }
        for installer in &config.installers {
            if !installer.script.trim().is_empty() {
                scripts.push((
                    format!("installer '{}'", installer.key()),
                    installer.script.as_str(),
                ));
            }
        }

        let env = Self::machine_env(identity, name, config);
        for (label, script) in scripts {
            tracing::debug!(identity = %identity, machine = name, step = %label, "running script");
            let mut request = ExecRequest::new(&self.shell, script, &machine_dir);
            request.env = env.clone();
            request.output_log = Some(runtime_dir.join(OUTPUT_LOG));

            let output = exec_script(&request, cancel).await.map_err(|e| match e {
                ExecError::Cancelled => InfraError::StartInterrupted(identity.clone()),
                other => InfraError::internal(format!("machine '{}': {}", name, other)),
            })?;
            if !output.success() {
                return Err(InfraError::Infrastructure(format!(
                    "machine '{}' failed: {} exited with code {}",
                    name, label, output.exit_code
                )));
            }
        }

        let servers = config
            .servers
            .iter()
            .map(|(server_name, cfg)| {
                (
                    server_name.clone(),
                    Server {
                        url: server_url(
                            cfg.protocol.as_deref(),
                            cfg.port_number(),
                            cfg.path.as_deref(),
                        ),
                        status: ServerStatus::Unknown,
                        attributes: cfg.attributes.clone(),
                    },
                )
            })
            .collect();

        Ok(Machine {
            attributes: config.attributes.clone(),
            servers,
            status: MachineStatus::Running,
        })
    }
}

#[async_trait]
impl RuntimeDriver for LocalDriver {
    async fn start(
        &self,
        identity: &RuntimeIdentity,
        env: &InternalEnvironment,
        cancel: CancellationToken,
    ) -> Result<StartedRuntime> {
        check_identity(identity)?;
        if let Some(existing) = self.load_record(identity)? {
            return Err(InfraError::Conflict(format!(
                "a runtime for '{}' is already recorded",
                existing.identity
            )));
        }

        let mut machines = IndexMap::new();
        for (name, config) in &env.machines {
            self.publish_machine(identity, name, MachineStatus::Starting, None);
            match self
                .run_machine(identity, name, config, &env.recipe.content, &cancel)
                .await
            {
                Ok(machine) => {
                    self.publish_machine(identity, name, MachineStatus::Running, None);
                    machines.insert(name.clone(), machine);
                }
                Err(e) => {
                    self.publish_machine(identity, name, MachineStatus::Failed, Some(e.to_string()));
                    return Err(e);
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(InfraError::StartInterrupted(identity.clone()));
        }

        let mut properties = IndexMap::new();
        properties.insert(
            ENVIRONMENT_HASH_PROPERTY.to_string(),
            hasher::fingerprint(&env.source)?,
        );
        properties.insert(
            "local.runtimeDir".to_string(),
            self.runtime_dir(identity).display().to_string(),
        );

        let record = RuntimeRecord {
            identity: identity.clone(),
            started_at: Utc::now(),
            machines: machines.clone(),
            properties: properties.clone(),
            warnings: env.warnings().to_vec(),
        };
        if let Err(e) = self.save_record(&record) {
            let _ = self.remove_record(identity);
            return Err(e);
        }

        tracing::info!(identity = %identity, machines = machines.len(), "local runtime started");
        Ok(StartedRuntime {
            machines,
            properties,
        })
    }

    async fn stop(&self, identity: &RuntimeIdentity) -> Result<()> {
        check_identity(identity)?;
        let Some(record) = self.load_record(identity)? else {
            return Ok(());
        };
        // Records are keyed by workspace and environment only.
        if &record.identity != identity {
            tracing::debug!(
                identity = %identity,
                recorded = %record.identity,
                "runtime record belongs to another owner, leaving it"
            );
            return Ok(());
        }
        for name in record.machines.keys() {
            self.publish_machine(identity, name, MachineStatus::Stopped, None);
        }
        self.remove_record(identity)
    }

    fn output_channel(&self, identity: &RuntimeIdentity) -> Result<String> {
        Ok(format!(
            "file://{}",
            self.runtime_dir(identity).join(OUTPUT_LOG).display()
        ))
    }
}

fn read_record(path: &Path) -> Result<Option<RuntimeRecord>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| InfraError::internal(format!("cannot read {}: {}", path.display(), e)))?;
    let record = serde_yaml_ng::from_str(&content).map_err(|e| {
        InfraError::internal(format!("invalid runtime record {}: {}", path.display(), e))
    })?;
    Ok(Some(record))
}

// ============================================================================
// Infrastructure
// ============================================================================

pub struct LocalInfrastructure {
    recipe_types: Vec<String>,
    installers: Arc<dyn InstallerRegistry>,
    recipes: RecipeResolver,
    contexts: Arc<ContextRegistry>,
    driver: Arc<LocalDriver>,
    rewriter: Arc<dyn UrlRewriter>,
}

impl LocalInfrastructure {
    pub fn new(config: &ControlPlaneConfig, installers: Arc<dyn InstallerRegistry>) -> Self {
        let recipes = match config.recipe.fetch_timeout() {
            Some(timeout) => RecipeResolver::with_timeout(timeout),
            None => RecipeResolver::default(),
        };
        Self {
            recipe_types: config.local.recipe_types.clone(),
            installers,
            recipes,
            contexts: Arc::new(ContextRegistry::default()),
            driver: Arc::new(LocalDriver::new(&config.state_dir, &config.local.shell)),
            rewriter: Arc::new(NoOpUrlRewriter),
        }
    }

    /// Publish machine status changes on `events`.
    pub fn with_events(mut self, events: EventService) -> Self {
        let mut driver = (*self.driver).clone();
        driver.events = Some(events);
        self.driver = Arc::new(driver);
        self
    }

    pub fn with_url_rewriter(mut self, rewriter: Arc<dyn UrlRewriter>) -> Self {
        self.rewriter = rewriter;
        self
    }

    pub fn driver(&self) -> &LocalDriver {
        &self.driver
    }
}

impl RuntimeInfrastructure for LocalInfrastructure {
    fn name(&self) -> &str {
        INFRASTRUCTURE_NAME
    }

    fn recipe_types(&self) -> &[String] {
        &self.recipe_types
    }

    fn estimate(&self, env: &Environment) -> Result<Environment> {
        parser::ensure_valid(env)?;
        if !self.recipe_types.contains(&env.recipe.recipe_type) {
            return Err(InfraError::Validation(format!(
                "recipe type '{}' is not supported by infrastructure '{}'",
                env.recipe.recipe_type, INFRASTRUCTURE_NAME
            )));
        }
        Ok(parser::normalize_environment(env, DEFAULT_CONTENT_TYPE))
    }

    fn prepare(&self, identity: &RuntimeIdentity, env: &Environment) -> Result<Arc<RuntimeContext>> {
        check_identity(identity)?;
        let env = self.estimate(env)?;
        let lease = self.contexts.acquire(identity)?;
        let internal =
            EnvironmentNormalizer::new(self.installers.as_ref(), &self.recipes).normalize(&env)?;
        Ok(Arc::new(RuntimeContext::new(
            identity.clone(),
            internal,
            INFRASTRUCTURE_NAME,
            Arc::clone(&self.driver) as Arc<dyn RuntimeDriver>,
            Arc::clone(&self.rewriter),
            lease,
        )))
    }

    fn tracker(&self) -> Option<&dyn RuntimeTracker> {
        Some(self)
    }
}

impl RuntimeTracker for LocalInfrastructure {
    fn tracked_identities(&self) -> Result<BTreeSet<RuntimeIdentity>> {
        let root = self.driver.state_dir.join("runtimes");
        let mut identities = BTreeSet::new();
        if !root.exists() {
            return Ok(identities);
        }
        let workspaces = std::fs::read_dir(&root)
            .map_err(|e| InfraError::internal(format!("cannot read {}: {}", root.display(), e)))?;
        for ws in workspaces.filter_map(|e| e.ok()) {
            let Ok(records) = std::fs::read_dir(ws.path()) else {
                continue;
            };
            for entry in records.filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.extension().is_none_or(|ext| ext != "yaml") {
                    continue;
                }
                match read_record(&path) {
                    Ok(Some(record)) => {
                        identities.insert(record.identity);
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "skipping unreadable runtime record"),
                }
            }
        }
        Ok(identities)
    }

    fn tracked_runtime(&self, identity: &RuntimeIdentity) -> Result<InternalRuntime> {
        let record = self
            .driver
            .load_record(identity)?
            .filter(|r| &r.identity == identity)
            .ok_or_else(|| {
                InfraError::NotFound(format!("no local runtime recorded for '{}'", identity))
            })?;
        Ok(InternalRuntime::new(
            record.identity,
            record.machines,
            record.properties,
            record.warnings,
            Arc::clone(&self.rewriter),
        ))
    }
}
