//! WR-015: Runtime context lifecycle.
//!
//! ```text
//! PREPARED → STARTING → RUNNING → STOPPING → STOPPED
//!               └─────────┴──────────┴──→ FAILED
//! ```
//!
//! Every context holds a `ContextLease` for its identity from `prepare` until
//! it reaches `STOPPED` or `FAILED` (or is dropped). A second lease for an
//! identity that is still active is refused with `InfraError::State`.

use super::runtime::{InternalRuntime, UrlRewriter};
use super::{RuntimeDriver, StartedRuntime};
use crate::core::environment::InternalEnvironment;
use crate::core::error::{InfraError, Result};
use crate::core::hasher::{self, ENVIRONMENT_HASH_PROPERTY};
use crate::core::types::RuntimeIdentity;
use rustc_hash::FxHashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Prepared,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ContextState {
    /// Whether the context still holds its identity.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Prepared => "PREPARED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Per-identity leases
// ============================================================================

/// Identities with an active context.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    active: Mutex<FxHashSet<RuntimeIdentity>>,
}

impl ContextRegistry {
    fn active(&self) -> MutexGuard<'_, FxHashSet<RuntimeIdentity>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `identity` for a new context.
    pub fn acquire(self: &Arc<Self>, identity: &RuntimeIdentity) -> Result<ContextLease> {
        if !self.active().insert(identity.clone()) {
            return Err(InfraError::State(format!(
                "Runtime context for '{}' is already active",
                identity
            )));
        }
        Ok(ContextLease {
            registry: Arc::clone(self),
            identity: identity.clone(),
        })
    }

    pub fn is_active(&self, identity: &RuntimeIdentity) -> bool {
        self.active().contains(identity)
    }

    pub fn len(&self) -> usize {
        self.active().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active().is_empty()
    }
}

/// Releases its identity when dropped.
#[derive(Debug)]
pub struct ContextLease {
    registry: Arc<ContextRegistry>,
    identity: RuntimeIdentity,
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        self.registry.active().remove(&self.identity);
    }
}

// ============================================================================
// RuntimeContext
// ============================================================================

struct Inner {
    state: ContextState,
    runtime: Option<InternalRuntime>,
    cancel: Option<CancellationToken>,
    lease: Option<ContextLease>,
}

/// One prepared start of an environment.
pub struct RuntimeContext {
    identity: RuntimeIdentity,
    environment: InternalEnvironment,
    infrastructure: String,
    driver: Arc<dyn RuntimeDriver>,
    rewriter: Arc<dyn UrlRewriter>,
    inner: Mutex<Inner>,
    /// Flips to `true` once `start` has unwound
    start_done: watch::Sender<bool>,
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("identity", &self.identity)
            .field("infrastructure", &self.infrastructure)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RuntimeContext {
    pub fn new(
        identity: RuntimeIdentity,
        environment: InternalEnvironment,
        infrastructure: &str,
        driver: Arc<dyn RuntimeDriver>,
        rewriter: Arc<dyn UrlRewriter>,
        lease: ContextLease,
    ) -> Self {
        let (start_done, _) = watch::channel(false);
        Self {
            identity,
            environment,
            infrastructure: infrastructure.to_string(),
            driver,
            rewriter,
            inner: Mutex::new(Inner {
                state: ContextState::Prepared,
                runtime: None,
                cancel: None,
                lease: Some(lease),
            }),
            start_done,
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn identity(&self) -> &RuntimeIdentity {
        &self.identity
    }

    pub fn environment(&self) -> &InternalEnvironment {
        &self.environment
    }

    pub fn infrastructure(&self) -> &str {
        &self.infrastructure
    }

    pub fn state(&self) -> ContextState {
        self.inner().state
    }

    /// The running runtime.
    pub fn runtime(&self) -> Result<InternalRuntime> {
        self.inner().runtime.clone().ok_or_else(|| {
            InfraError::State(format!("Runtime '{}' is not running", self.identity))
        })
    }

    /// Backend output stream URI. Same value on every call.
    pub fn output_channel(&self) -> Result<String> {
        self.driver.output_channel(&self.identity)
    }

    /// Start with a private cancellation token.
    pub async fn start(&self) -> Result<InternalRuntime> {
        self.start_with_cancel(&CancellationToken::new()).await
    }

    /// Provision the environment. Cancelling `parent` interrupts the start.
    pub async fn start_with_cancel(&self, parent: &CancellationToken) -> Result<InternalRuntime> {
        let cancel = {
            let mut inner = self.inner();
            if inner.state != ContextState::Prepared {
                return Err(InfraError::State("Runtime already started".into()));
            }
            inner.state = ContextState::Starting;
            let token = parent.child_token();
            inner.cancel = Some(token.clone());
            token
        };

        info!(
            workspace = %self.identity.workspace_id,
            env = %self.identity.env_name,
            owner = %self.identity.owner_id,
            infrastructure = %self.infrastructure,
            "starting runtime"
        );
        let result = self
            .driver
            .start(&self.identity, &self.environment, cancel.clone())
            .await;
        let outcome = self.finish_start(result, &cancel).await;
        self.start_done.send_replace(true);
        outcome
    }

    async fn finish_start(
        &self,
        result: Result<StartedRuntime>,
        cancel: &CancellationToken,
    ) -> Result<InternalRuntime> {
        match result {
            Ok(started) if !cancel.is_cancelled() => {
                let runtime = self.build_runtime(started);
                let mut inner = self.inner();
                if inner.state == ContextState::Starting {
                    inner.state = ContextState::Running;
                    inner.runtime = Some(runtime.clone());
                    info!(identity = %self.identity, "runtime running");
                    return Ok(runtime);
                }
                // A concurrent stop owns the teardown from here.
                inner.runtime = Some(runtime);
                Err(InfraError::StartInterrupted(self.identity.clone()))
            }
            Ok(_) => {
                if let Err(e) = self.driver.stop(&self.identity).await {
                    warn!(identity = %self.identity, error = %e, "cleanup after interrupted start failed");
                }
                self.fail_if_starting();
                Err(InfraError::StartInterrupted(self.identity.clone()))
            }
            Err(e) => {
                self.fail_if_starting();
                let e = e.with_identity(&self.identity);
                log_failure(&self.identity, &e);
                Err(e)
            }
        }
    }

    fn fail_if_starting(&self) {
        let mut inner = self.inner();
        if inner.state == ContextState::Starting {
            inner.state = ContextState::Failed;
            inner.runtime = None;
            inner.lease = None;
        }
    }

    fn build_runtime(&self, started: StartedRuntime) -> InternalRuntime {
        let mut properties = started.properties;
        if !properties.contains_key(ENVIRONMENT_HASH_PROPERTY) {
            match hasher::fingerprint(&self.environment.source) {
                Ok(hash) => {
                    properties.insert(ENVIRONMENT_HASH_PROPERTY.to_string(), hash);
                }
                Err(e) => warn!(identity = %self.identity, error = %e, "cannot fingerprint environment"),
            }
        }
        InternalRuntime::new(
            self.identity.clone(),
            started.machines,
            properties,
            self.environment.warnings().to_vec(),
            Arc::clone(&self.rewriter),
        )
    }

    /// Interrupt an in-flight start. No effect in other states.
    pub fn cancel_start(&self) {
        let inner = self.inner();
        if inner.state == ContextState::Starting {
            if let Some(ref token) = inner.cancel {
                token.cancel();
            }
        }
    }

    /// Adopt a runtime that is already running, e.g. after a control-plane restart.
    pub fn attach(&self, runtime: InternalRuntime) -> Result<()> {
        if runtime.identity() != &self.identity {
            return Err(InfraError::State(format!(
                "Cannot attach runtime '{}' to context '{}'",
                runtime.identity(),
                self.identity
            )));
        }
        let mut inner = self.inner();
        if inner.state != ContextState::Prepared {
            return Err(InfraError::State("Runtime already started".into()));
        }
        inner.state = ContextState::Running;
        inner.runtime = Some(runtime);
        Ok(())
    }

    /// Stop the runtime. A start in progress is cancelled and awaited first.
    /// The context ends `STOPPED` even when the backend stop fails.
    pub async fn stop(&self) -> Result<()> {
        let was_starting = {
            let mut inner = self.inner();
            match inner.state {
                ContextState::Running => {
                    inner.state = ContextState::Stopping;
                    false
                }
                ContextState::Starting => {
                    inner.state = ContextState::Stopping;
                    if let Some(ref token) = inner.cancel {
                        token.cancel();
                    }
                    true
                }
                _ => {
                    return Err(InfraError::State(
                        "The environment must be running or starting".into(),
                    ))
                }
            }
        };

        if was_starting {
            let mut done = self.start_done.subscribe();
            let _ = done.wait_for(|finished| *finished).await;
        }

        // A start that unwound with an error already released its resources,
        // and may have failed on resources that belong to someone else.
        let provisioned = self.inner().runtime.is_some();
        let result = if provisioned {
            info!(identity = %self.identity, "stopping runtime");
            self.driver
                .stop(&self.identity)
                .await
                .map_err(|e| e.with_identity(&self.identity))
        } else {
            info!(identity = %self.identity, "start unwound before provisioning, nothing to stop");
            Ok(())
        };

        {
            let mut inner = self.inner();
            inner.state = ContextState::Stopped;
            inner.runtime = None;
            inner.lease = None;
        }

        if let Err(ref e) = result {
            log_failure(&self.identity, e);
        }
        result
    }
}

/// Internal errors are logged as errors; the rest are user-caused.
fn log_failure(identity: &RuntimeIdentity, e: &InfraError) {
    if e.is_internal() {
        error!(identity = %identity, error = %e, "runtime operation failed");
    } else {
        info!(identity = %identity, error = %e, "runtime operation failed");
    }
}
