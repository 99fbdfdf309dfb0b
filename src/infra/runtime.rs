//! WR-016: Live runtime handle.
//!
//! An `InternalRuntime` always describes a running (or failed but not yet
//! cleaned up) environment. Clones share state; server status updates are
//! visible through every clone.

use crate::core::error::{InfraError, Result};
use crate::core::types::{Machine, MachineStatus, RuntimeIdentity, ServerStatus, Warning};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A server URL could not be rewritten and was left out of `machines()`.
pub const MALFORMED_SERVER_URL_FOUND: u32 = 4200;

/// Rewrites backend-internal server URLs into externally reachable ones.
pub trait UrlRewriter: Send + Sync {
    fn rewrite(
        &self,
        identity: &RuntimeIdentity,
        machine: &str,
        server: &str,
        url: &str,
    ) -> Result<String>;
}

/// Keeps URLs as they are, rejecting only malformed ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpUrlRewriter;

impl UrlRewriter for NoOpUrlRewriter {
    fn rewrite(
        &self,
        _identity: &RuntimeIdentity,
        _machine: &str,
        _server: &str,
        url: &str,
    ) -> Result<String> {
        reqwest::Url::parse(url)
            .map(|_| url.to_string())
            .map_err(|e| InfraError::Validation(e.to_string()))
    }
}

struct RuntimeState {
    machines: IndexMap<String, Machine>,
    warnings: Vec<Warning>,
}

struct Shared {
    identity: RuntimeIdentity,
    properties: IndexMap<String, String>,
    rewriter: Arc<dyn UrlRewriter>,
    state: Mutex<RuntimeState>,
}

#[derive(Clone)]
pub struct InternalRuntime {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for InternalRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalRuntime")
            .field("identity", &self.shared.identity)
            .field("properties", &self.shared.properties)
            .finish_non_exhaustive()
    }
}

impl InternalRuntime {
    pub fn new(
        identity: RuntimeIdentity,
        machines: IndexMap<String, Machine>,
        properties: IndexMap<String, String>,
        warnings: Vec<Warning>,
        rewriter: Arc<dyn UrlRewriter>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                identity,
                properties,
                rewriter,
                state: Mutex::new(RuntimeState { machines, warnings }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RuntimeState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn identity(&self) -> &RuntimeIdentity {
        &self.shared.identity
    }

    /// Name of the environment this runtime runs.
    pub fn active_env(&self) -> &str {
        &self.shared.identity.env_name
    }

    pub fn owner(&self) -> &str {
        &self.shared.identity.owner_id
    }

    pub fn properties(&self) -> &IndexMap<String, String> {
        &self.shared.properties
    }

    pub fn warnings(&self) -> Vec<Warning> {
        self.state().warnings.clone()
    }

    /// Machines exactly as the backend reported them.
    pub fn internal_machines(&self) -> IndexMap<String, Machine> {
        self.state().machines.clone()
    }

    /// Machines with externally reachable server URLs.
    ///
    /// Internal servers keep their URL. A server whose URL cannot be
    /// rewritten is omitted and recorded as a warning.
    pub fn machines(&self) -> IndexMap<String, Machine> {
        let mut state = self.state();
        let mut result = IndexMap::with_capacity(state.machines.len());
        let mut new_warnings = Vec::new();

        for (machine_name, machine) in &state.machines {
            let mut servers = IndexMap::with_capacity(machine.servers.len());
            for (server_name, server) in &machine.servers {
                if server.is_internal() {
                    servers.insert(server_name.clone(), server.clone());
                    continue;
                }
                match self.shared.rewriter.rewrite(
                    &self.shared.identity,
                    machine_name,
                    server_name,
                    &server.url,
                ) {
                    Ok(url) => {
                        let mut rewritten = server.clone();
                        rewritten.url = url;
                        servers.insert(server_name.clone(), rewritten);
                    }
                    Err(e) => {
                        new_warnings.push(Warning::new(
                            MALFORMED_SERVER_URL_FOUND,
                            format!("Malformed URL for {} : {}", server_name, e),
                        ));
                    }
                }
            }
            result.insert(
                machine_name.clone(),
                Machine {
                    attributes: machine.attributes.clone(),
                    servers,
                    status: machine.status,
                },
            );
        }

        for warning in new_warnings {
            if !state.warnings.contains(&warning) {
                tracing::warn!(identity = %self.shared.identity, message = %warning.message, "server URL rewrite failed");
                state.warnings.push(warning);
            }
        }
        result
    }

    /// Update one server's status in place.
    pub fn set_server_status(&self, machine: &str, server: &str, status: ServerStatus) -> Result<()> {
        let mut state = self.state();
        let m = state
            .machines
            .get_mut(machine)
            .ok_or_else(|| InfraError::NotFound(format!("machine '{}' not found", machine)))?;
        let s = m.servers.get_mut(server).ok_or_else(|| {
            InfraError::NotFound(format!("server '{}' not found in machine '{}'", server, machine))
        })?;
        s.status = status;
        Ok(())
    }

    pub fn set_machine_status(&self, machine: &str, status: MachineStatus) -> Result<()> {
        let mut state = self.state();
        let m = state
            .machines
            .get_mut(machine)
            .ok_or_else(|| InfraError::NotFound(format!("machine '{}' not found", machine)))?;
        m.status = status;
        Ok(())
    }
}
