//! WR-020: Workspace runtimes control plane.
//!
//! Tracks at most one runtime per workspace id and drives it through
//! `STARTING → RUNNING → STOPPING → STOPPED`, publishing a status event on
//! every transition. Starts and stops run as spawned tokio tasks; the
//! runtime map is only ever locked for short, non-async sections.

use super::dao::WorkspaceDao;
use crate::core::error::{InfraError, Result};
use crate::core::parser::check_path_component;
use crate::core::types::{Environment, RuntimeIdentity, Workspace, WorkspaceStatus};
use crate::events::{EventService, RuntimeEvent};
use crate::infra::context::{ContextState, RuntimeContext};
use crate::infra::registry::InfrastructureRegistry;
use crate::infra::runtime::InternalRuntime;
use crate::infra::RuntimeInfrastructure;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct RuntimeState {
    identity: RuntimeIdentity,
    status: WorkspaceStatus,
    context: Option<Arc<RuntimeContext>>,
    cancel: CancellationToken,
    /// Flips to `true` when the start task has finished
    start_done: watch::Receiver<bool>,
}

struct Shared {
    infrastructures: Arc<InfrastructureRegistry>,
    dao: Arc<dyn WorkspaceDao>,
    events: EventService,
    runtimes: Mutex<FxHashMap<String, RuntimeState>>,
    start_refused: AtomicBool,
}

/// Control plane over every registered infrastructure.
#[derive(Clone)]
pub struct WorkspaceRuntimes {
    shared: Arc<Shared>,
}

/// Handle to an in-flight start.
#[derive(Debug)]
pub struct StartTask {
    identity: RuntimeIdentity,
    cancel: CancellationToken,
    handle: JoinHandle<Result<InternalRuntime>>,
}

impl StartTask {
    pub fn identity(&self) -> &RuntimeIdentity {
        &self.identity
    }

    /// Interrupt the start. `wait` then yields `InfraError::StartInterrupted`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<InternalRuntime> {
        self.handle
            .await
            .map_err(|e| InfraError::internal(format!("start task failed: {}", e)))?
    }
}

/// Handle to an in-flight stop.
#[derive(Debug)]
pub struct StopTask {
    handle: JoinHandle<Result<()>>,
}

impl StopTask {
    pub async fn wait(self) -> Result<()> {
        self.handle
            .await
            .map_err(|e| InfraError::internal(format!("stop task failed: {}", e)))?
    }
}

impl WorkspaceRuntimes {
    /// Build the control plane and recover runtimes the backends still track.
    pub async fn new(
        infrastructures: Arc<InfrastructureRegistry>,
        dao: Arc<dyn WorkspaceDao>,
        events: EventService,
    ) -> Self {
        let receiver = events.subscribe();
        let this = Self {
            shared: Arc::new(Shared {
                infrastructures,
                dao,
                events,
                runtimes: Mutex::new(FxHashMap::default()),
                start_refused: AtomicBool::new(false),
            }),
        };
        tokio::spawn(listen_abnormal_stops(Arc::downgrade(&this.shared), receiver));
        this.recover().await;
        this
    }

    fn runtimes(&self) -> MutexGuard<'_, FxHashMap<String, RuntimeState>> {
        self.shared
            .runtimes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_status(
        &self,
        workspace_id: &str,
        status: WorkspaceStatus,
        previous: WorkspaceStatus,
        error: Option<String>,
    ) {
        self.shared.events.publish(RuntimeEvent::WorkspaceStatus {
            workspace_id: workspace_id.to_string(),
            status,
            previous: Some(previous),
            error,
        });
    }

    fn infrastructure_for(&self, env: &Environment) -> Result<Arc<dyn RuntimeInfrastructure>> {
        self.shared.infrastructures.get(&env.recipe.recipe_type)
    }

    /// Estimate an environment on the backend serving its recipe type.
    pub fn validate(&self, env: &Environment) -> Result<Environment> {
        self.infrastructure_for(env)?.estimate(env)
    }

    /// Refuse every further start, e.g. ahead of a shutdown.
    pub fn refuse_start(&self) {
        self.shared.start_refused.store(true, Ordering::SeqCst);
    }

    pub fn is_start_refused(&self) -> bool {
        self.shared.start_refused.load(Ordering::SeqCst)
    }

    /// Begin starting `env_name` (or the workspace default) for `owner`.
    pub fn start_async(
        &self,
        workspace: &Workspace,
        env_name: Option<&str>,
        owner: &str,
    ) -> Result<StartTask> {
        check_path_component("workspace id", &workspace.id)?;
        let env_name = workspace.select_env(env_name).ok_or_else(|| {
            InfraError::NotFound(format!(
                "Workspace '{}' has no default environment",
                workspace.id
            ))
        })?;
        let env = workspace.environments.get(env_name).cloned().ok_or_else(|| {
            InfraError::NotFound(format!(
                "Workspace '{}' doesn't contain environment '{}'",
                workspace.id, env_name
            ))
        })?;
        let infra = self.infrastructure_for(&env).map_err(|_| {
            InfraError::NotFound(format!(
                "No infrastructure found of type: {} for workspace: {}",
                env.recipe.recipe_type, workspace.id
            ))
        })?;
        if self.is_start_refused() {
            return Err(InfraError::Conflict(format!(
                "Start of the workspace '{}' is rejected by the system, no more workspaces are allowed to start",
                workspace.name
            )));
        }

        let identity = RuntimeIdentity::new(&workspace.id, env_name, owner);
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut runtimes = self.runtimes();
            if let Some(existing) = runtimes.get(&workspace.id) {
                return Err(InfraError::Conflict(format!(
                    "Could not start workspace '{}' because its state is '{}'",
                    workspace.id, existing.status
                )));
            }
            runtimes.insert(
                workspace.id.clone(),
                RuntimeState {
                    identity: identity.clone(),
                    status: WorkspaceStatus::Starting,
                    context: None,
                    cancel: cancel.clone(),
                    start_done: done_rx,
                },
            );
        }

        info!(
            workspace = %workspace.id,
            env = %env_name,
            owner = %owner,
            infrastructure = infra.name(),
            "Starting workspace '{}/{}'",
            workspace.namespace,
            workspace.name
        );
        self.publish_status(
            &workspace.id,
            WorkspaceStatus::Starting,
            WorkspaceStatus::Stopped,
            None,
        );

        let this = self.clone();
        let task_identity = identity.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let result = this.run_start(infra, &task_identity, env, &task_cancel).await;
            let result = this.finish_start(&task_identity, result);
            done_tx.send_replace(true);
            result
        });

        Ok(StartTask {
            identity,
            cancel,
            handle,
        })
    }

    async fn run_start(
        &self,
        infra: Arc<dyn RuntimeInfrastructure>,
        identity: &RuntimeIdentity,
        env: Environment,
        cancel: &CancellationToken,
    ) -> Result<InternalRuntime> {
        let context = prepare_blocking(infra, identity.clone(), env)
            .await
            .map_err(|e| e.with_identity(identity))?;
        if let Some(state) = self.runtimes().get_mut(&identity.workspace_id) {
            state.context = Some(Arc::clone(&context));
        }
        if cancel.is_cancelled() {
            return Err(InfraError::StartInterrupted(identity.clone()));
        }
        context.start_with_cancel(cancel).await
    }

    fn finish_start(
        &self,
        identity: &RuntimeIdentity,
        result: Result<InternalRuntime>,
    ) -> Result<InternalRuntime> {
        let workspace_id = &identity.workspace_id;
        let mut runtimes = self.runtimes();
        let starting = runtimes
            .get(workspace_id)
            .is_some_and(|s| s.status == WorkspaceStatus::Starting);

        if !starting {
            // A stop request owns the entry now.
            return match result {
                Ok(_) => Err(InfraError::StartInterrupted(identity.clone())),
                Err(e) => Err(e),
            };
        }

        match result {
            Ok(runtime) => {
                if let Some(state) = runtimes.get_mut(workspace_id) {
                    state.status = WorkspaceStatus::Running;
                }
                drop(runtimes);
                info!(identity = %identity, "Workspace '{}' started", workspace_id);
                self.publish_status(
                    workspace_id,
                    WorkspaceStatus::Running,
                    WorkspaceStatus::Starting,
                    None,
                );
                Ok(runtime)
            }
            Err(e) => {
                runtimes.remove(workspace_id);
                drop(runtimes);
                if e.is_internal() {
                    error!(identity = %identity, error = %e, "Workspace start failed");
                } else {
                    info!(identity = %identity, error = %e, "Workspace start failed");
                }
                self.publish_status(
                    workspace_id,
                    WorkspaceStatus::Stopped,
                    WorkspaceStatus::Starting,
                    Some(e.to_string()),
                );
                Err(e)
            }
        }
    }

    /// Begin stopping a starting or running workspace.
    pub fn stop_async(&self, workspace_id: &str) -> Result<StopTask> {
        let (previous, context, cancel, mut start_done) = {
            let mut runtimes = self.runtimes();
            let state = runtimes.get_mut(workspace_id).ok_or_else(|| {
                InfraError::NotFound(format!(
                    "Workspace with id '{}' is not running.",
                    workspace_id
                ))
            })?;
            if !matches!(
                state.status,
                WorkspaceStatus::Running | WorkspaceStatus::Starting
            ) {
                return Err(InfraError::Conflict(format!(
                    "Could not stop workspace '{}' because its state is '{}'",
                    workspace_id, state.status
                )));
            }
            let previous = state.status;
            state.status = WorkspaceStatus::Stopping;
            (
                previous,
                state.context.clone(),
                state.cancel.clone(),
                state.start_done.clone(),
            )
        };

        info!(workspace = %workspace_id, "Workspace '{}' is being stopped", workspace_id);
        self.publish_status(workspace_id, WorkspaceStatus::Stopping, previous, None);

        let this = self.clone();
        let workspace_id = workspace_id.to_string();
        let handle = tokio::spawn(async move {
            let mut context = context;
            if previous == WorkspaceStatus::Starting {
                cancel.cancel();
                let _ = start_done.wait_for(|done| *done).await;
                // The context may have been prepared after the snapshot.
                context = this
                    .runtimes()
                    .get(&workspace_id)
                    .and_then(|s| s.context.clone());
            }

            let result = match context {
                Some(ctx) if matches!(ctx.state(), ContextState::Running | ContextState::Starting) => {
                    ctx.stop().await
                }
                _ => Ok(()),
            };

            this.runtimes().remove(&workspace_id);
            if let Err(ref e) = result {
                error!(workspace = %workspace_id, error = %e, "Workspace stop failed");
            } else {
                info!(workspace = %workspace_id, "Workspace '{}' stopped", workspace_id);
            }
            this.publish_status(
                &workspace_id,
                WorkspaceStatus::Stopped,
                WorkspaceStatus::Stopping,
                result.as_ref().err().map(ToString::to_string),
            );
            result
        });
        Ok(StopTask { handle })
    }

    /// Stop and wait for completion.
    pub async fn stop(&self, workspace_id: &str) -> Result<()> {
        self.stop_async(workspace_id)?.wait().await
    }

    /// A backend lost a running runtime.
    pub fn handle_abnormal_stop(&self, identity: &RuntimeIdentity, error: &str) {
        let removed = {
            let mut runtimes = self.runtimes();
            let matches = runtimes.get(&identity.workspace_id).is_some_and(|s| {
                &s.identity == identity && s.status == WorkspaceStatus::Running
            });
            if matches {
                runtimes.remove(&identity.workspace_id)
            } else {
                None
            }
        };
        let Some(state) = removed else {
            return;
        };

        warn!(identity = %identity, error, "Workspace runtime stopped abnormally");
        self.publish_status(
            &identity.workspace_id,
            WorkspaceStatus::Stopped,
            WorkspaceStatus::Running,
            Some(error.to_string()),
        );
        if let Some(ctx) = state.context {
            tokio::spawn(async move {
                if let Err(e) = ctx.stop().await {
                    warn!(identity = %ctx.identity(), error = %e, "cleanup after abnormal stop failed");
                }
            });
        }
    }

    /// Re-attach every runtime the backends still track.
    pub async fn recover(&self) {
        let infrastructures: Vec<_> = self.shared.infrastructures.infrastructures().to_vec();
        for infra in infrastructures {
            let identities = match infra.identities() {
                Ok(ids) => ids,
                Err(e) if e.is_not_supported() => {
                    warn!(infrastructure = infra.name(), "Not recoverable infrastructure");
                    continue;
                }
                Err(e) => {
                    error!(infrastructure = infra.name(), error = %e, "Cannot list runtimes");
                    continue;
                }
            };
            for identity in identities {
                match self.recover_one(Arc::clone(&infra), &identity).await {
                    Ok(()) => info!(identity = %identity, "Successfully recovered workspace runtime"),
                    Err(e) => error!(identity = %identity, error = %e, "Couldn't recover runtime"),
                }
            }
        }
    }

    async fn recover_one(
        &self,
        infra: Arc<dyn RuntimeInfrastructure>,
        identity: &RuntimeIdentity,
    ) -> Result<()> {
        let workspace = self.shared.dao.get(&identity.workspace_id)?;
        let env = workspace
            .environments
            .get(&identity.env_name)
            .cloned()
            .ok_or_else(|| {
                InfraError::NotFound(format!(
                    "Environment '{}' not found in workspace '{}'",
                    identity.env_name, identity.workspace_id
                ))
            })?;
        if self.has_runtime(&identity.workspace_id) {
            return Err(InfraError::Conflict(format!(
                "Runtime for workspace '{}' is already registered",
                identity.workspace_id
            )));
        }

        let runtime = infra.runtime(identity)?;
        let context = prepare_blocking(infra, identity.clone(), env)
            .await
            .map_err(|e| e.with_identity(identity))?;
        context.attach(runtime)?;

        let mut runtimes = self.runtimes();
        if runtimes.contains_key(&identity.workspace_id) {
            return Err(InfraError::Conflict(format!(
                "Runtime for workspace '{}' is already registered",
                identity.workspace_id
            )));
        }
        let (_, done_rx) = watch::channel(true);
        runtimes.insert(
            identity.workspace_id.clone(),
            RuntimeState {
                identity: identity.clone(),
                status: WorkspaceStatus::Running,
                context: Some(context),
                cancel: CancellationToken::new(),
                start_done: done_rx,
            },
        );
        Ok(())
    }

    /// Current status; `STOPPED` when no runtime exists.
    pub fn status(&self, workspace_id: &str) -> WorkspaceStatus {
        self.runtimes()
            .get(workspace_id)
            .map_or(WorkspaceStatus::Stopped, |s| s.status)
    }

    pub fn has_runtime(&self, workspace_id: &str) -> bool {
        self.runtimes().contains_key(workspace_id)
    }

    /// Workspace ids with a runtime, sorted.
    pub fn runtime_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runtimes().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_any_running(&self) -> bool {
        !self.runtimes().is_empty()
    }

    pub fn identity(&self, workspace_id: &str) -> Option<RuntimeIdentity> {
        self.runtimes().get(workspace_id).map(|s| s.identity.clone())
    }

    pub fn runtime_context(&self, workspace_id: &str) -> Option<Arc<RuntimeContext>> {
        self.runtimes()
            .get(workspace_id)
            .and_then(|s| s.context.clone())
    }

    /// The running runtime of a workspace.
    pub fn runtime(&self, workspace_id: &str) -> Result<InternalRuntime> {
        self.runtime_context(workspace_id)
            .ok_or_else(|| {
                InfraError::NotFound(format!(
                    "Workspace with id '{}' is not running.",
                    workspace_id
                ))
            })?
            .runtime()
    }
}

/// `prepare` may block on a recipe fetch, so it runs off the async workers.
async fn prepare_blocking(
    infra: Arc<dyn RuntimeInfrastructure>,
    identity: RuntimeIdentity,
    env: Environment,
) -> Result<Arc<RuntimeContext>> {
    tokio::task::spawn_blocking(move || infra.prepare(&identity, &env))
        .await
        .map_err(|e| InfraError::internal(format!("prepare task failed: {}", e)))?
}

async fn listen_abnormal_stops(
    shared: Weak<Shared>,
    mut receiver: broadcast::Receiver<RuntimeEvent>,
) {
    loop {
        match receiver.recv().await {
            Ok(RuntimeEvent::AbnormalStop { identity, error }) => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                WorkspaceRuntimes { shared }.handle_abnormal_stop(&identity, &error);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "runtime event listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::dao::MemoryWorkspaceDao;
    use crate::infra::testing::{scratch_env, FakeInfrastructure};
    use indexmap::IndexMap;
    use std::time::Duration;

    fn workspace(id: &str) -> Workspace {
        let mut environments = IndexMap::new();
        environments.insert("default".to_string(), scratch_env("fake"));
        Workspace {
            id: id.into(),
            namespace: "user1".into(),
            name: format!("{}-name", id),
            default_env: Some("default".into()),
            temporary: false,
            environments,
            attributes: IndexMap::new(),
        }
    }

    async fn setup(
        infra: Arc<FakeInfrastructure>,
        dao: Arc<MemoryWorkspaceDao>,
    ) -> (WorkspaceRuntimes, EventService) {
        let mut registry = InfrastructureRegistry::new();
        registry.register(infra).unwrap();
        let events = EventService::new();
        let runtimes = WorkspaceRuntimes::new(Arc::new(registry), dao, events.clone()).await;
        (runtimes, events)
    }

    async fn plain() -> (WorkspaceRuntimes, Arc<FakeInfrastructure>, EventService) {
        let infra = Arc::new(FakeInfrastructure::new());
        let (runtimes, events) =
            setup(Arc::clone(&infra), Arc::new(MemoryWorkspaceDao::new())).await;
        (runtimes, infra, events)
    }

    fn statuses(rx: &mut broadcast::Receiver<RuntimeEvent>) -> Vec<WorkspaceStatus> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let RuntimeEvent::WorkspaceStatus { status, .. } = event {
                out.push(status);
            }
        }
        out
    }

    async fn wait_for_status(runtimes: &WorkspaceRuntimes, ws: &str, status: WorkspaceStatus) {
        for _ in 0..200 {
            if runtimes.status(ws) == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("workspace {} never reached {}", ws, status);
    }

    #[tokio::test]
    async fn test_wr020_start_and_stop() {
        let (runtimes, infra, events) = plain().await;
        let mut rx = events.subscribe();

        let task = runtimes.start_async(&workspace("ws1"), None, "user1").unwrap();
        assert_eq!(task.identity().env_name, "default");
        let runtime = task.wait().await.unwrap();
        assert_eq!(runtime.machines().len(), 1);
        assert_eq!(runtime.owner(), "user1");
        assert_eq!(runtimes.status("ws1"), WorkspaceStatus::Running);
        assert!(runtimes.is_any_running());
        assert_eq!(runtimes.runtime_ids(), vec!["ws1"]);
        assert_eq!(runtimes.runtime("ws1").unwrap().active_env(), "default");

        runtimes.stop("ws1").await.unwrap();
        assert_eq!(runtimes.status("ws1"), WorkspaceStatus::Stopped);
        assert!(!runtimes.has_runtime("ws1"));
        assert_eq!(
            infra.driver.stops.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert_eq!(
            statuses(&mut rx),
            vec![
                WorkspaceStatus::Starting,
                WorkspaceStatus::Running,
                WorkspaceStatus::Stopping,
                WorkspaceStatus::Stopped
            ]
        );
    }

    #[tokio::test]
    async fn test_wr020_second_start_conflicts() {
        let (runtimes, _, _) = plain().await;
        runtimes
            .start_async(&workspace("ws1"), None, "user1")
            .unwrap()
            .wait()
            .await
            .unwrap();
        let err = runtimes
            .start_async(&workspace("ws1"), None, "user2")
            .unwrap_err();
        assert!(matches!(err, InfraError::Conflict(_)));
        assert!(err.to_string().contains("RUNNING"));
    }

    #[tokio::test]
    async fn test_wr020_refused_start() {
        let (runtimes, _, _) = plain().await;
        runtimes.refuse_start();
        let err = runtimes
            .start_async(&workspace("ws1"), None, "user1")
            .unwrap_err();
        assert!(matches!(err, InfraError::Conflict(_)));
        assert!(!runtimes.has_runtime("ws1"));
    }

    #[tokio::test]
    async fn test_wr020_unknown_env_and_type() {
        let (runtimes, _, _) = plain().await;
        let ws = workspace("ws1");
        assert!(matches!(
            runtimes.start_async(&ws, Some("other"), "user1"),
            Err(InfraError::NotFound(_))
        ));

        let mut ws = workspace("ws2");
        ws.environments["default"].recipe.recipe_type = "k8s".into();
        let err = runtimes.start_async(&ws, None, "user1").unwrap_err();
        assert!(err.to_string().contains("No infrastructure found of type: k8s"));
    }

    #[tokio::test]
    async fn test_wr020_failed_start_publishes_stopped() {
        let (runtimes, infra, events) = plain().await;
        infra.driver.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut rx = events.subscribe();

        let err = runtimes
            .start_async(&workspace("ws1"), None, "user1")
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, InfraError::Infrastructure(_)));
        assert!(!runtimes.has_runtime("ws1"));

        let mut last_error = None;
        while let Ok(event) = rx.try_recv() {
            if let RuntimeEvent::WorkspaceStatus { status, error, .. } = event {
                if status == WorkspaceStatus::Stopped {
                    last_error = error;
                }
            }
        }
        assert_eq!(last_error.as_deref(), Some("image not found"));
    }

    #[tokio::test]
    async fn test_wr020_prepare_failure_carries_identity() {
        let (runtimes, infra, _) = plain().await;
        infra
            .fail_prepare
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let err = runtimes
            .start_async(&workspace("ws1"), None, "user1")
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(err.is_internal());
        assert_eq!(
            err.identity(),
            Some(&RuntimeIdentity::new("ws1", "default", "user1"))
        );
        assert!(!runtimes.has_runtime("ws1"));
    }

    #[tokio::test]
    async fn test_wr020_path_escaping_workspace_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let infra = Arc::new(FakeInfrastructure::new());
        let mut registry = InfrastructureRegistry::new();
        registry.register(infra).unwrap();
        let events = EventService::new().with_log(dir.path().join("state"));
        let mut rx = events.subscribe();
        let runtimes = WorkspaceRuntimes::new(
            Arc::new(registry),
            Arc::new(MemoryWorkspaceDao::new()),
            events,
        )
        .await;

        for id in ["../../escaped", "", "a/b"] {
            let err = runtimes
                .start_async(&workspace(id), None, "user1")
                .unwrap_err();
            assert!(matches!(err, InfraError::Validation(_)), "{id:?}");
            assert!(!runtimes.has_runtime(id));
        }
        assert!(statuses(&mut rx).is_empty());
        assert!(!dir.path().join("escaped.jsonl").exists());
        assert!(!dir.path().join("state").exists());
    }

    #[tokio::test]
    async fn test_wr020_invalid_environment_fails_start() {
        let (runtimes, _, _) = plain().await;
        let mut ws = workspace("ws1");
        ws.environments["default"].machines.clear();
        let err = runtimes
            .start_async(&ws, None, "user1")
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, InfraError::Validation(_)));
        assert!(!runtimes.has_runtime("ws1"));
    }

    #[tokio::test]
    async fn test_wr020_stop_not_running() {
        let (runtimes, _, _) = plain().await;
        assert!(matches!(
            runtimes.stop_async("ws1"),
            Err(InfraError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_wr020_stop_twice_conflicts() {
        let (runtimes, infra, _) = plain().await;
        infra.driver.hang.store(true, std::sync::atomic::Ordering::SeqCst);
        let _task = runtimes.start_async(&workspace("ws1"), None, "user1").unwrap();
        let stop = runtimes.stop_async("ws1").unwrap();
        assert_eq!(runtimes.status("ws1"), WorkspaceStatus::Stopping);
        let err = runtimes.stop_async("ws1").unwrap_err();
        assert!(matches!(err, InfraError::Conflict(_)));
        assert!(err.to_string().contains("STOPPING"));
        stop.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_wr020_stop_while_starting() {
        let (runtimes, infra, _) = plain().await;
        infra.driver.hang.store(true, std::sync::atomic::Ordering::SeqCst);
        let task = runtimes.start_async(&workspace("ws1"), None, "user1").unwrap();

        runtimes.stop("ws1").await.unwrap();
        assert!(task.wait().await.unwrap_err().is_interrupted());
        assert_eq!(runtimes.status("ws1"), WorkspaceStatus::Stopped);
        assert!(!infra.contexts.is_active(&RuntimeIdentity::new("ws1", "default", "user1")));
    }

    #[tokio::test]
    async fn test_wr020_cancel_start() {
        let (runtimes, infra, _) = plain().await;
        infra.driver.hang.store(true, std::sync::atomic::Ordering::SeqCst);
        let task = runtimes.start_async(&workspace("ws1"), None, "user1").unwrap();
        task.cancel();
        let err = task.wait().await.unwrap_err();
        assert!(err.is_interrupted());
        assert!(!runtimes.has_runtime("ws1"));
    }

    #[tokio::test]
    async fn test_wr020_abnormal_stop() {
        let (runtimes, _, events) = plain().await;
        let runtime = runtimes
            .start_async(&workspace("ws1"), None, "user1")
            .unwrap()
            .wait()
            .await
            .unwrap();

        events.publish(RuntimeEvent::AbnormalStop {
            identity: runtime.identity().clone(),
            error: "machine crashed".into(),
        });
        wait_for_status(&runtimes, "ws1", WorkspaceStatus::Stopped).await;
        assert!(!runtimes.has_runtime("ws1"));
    }

    #[tokio::test]
    async fn test_wr020_abnormal_stop_other_identity_ignored() {
        let (runtimes, _, _) = plain().await;
        runtimes
            .start_async(&workspace("ws1"), None, "user1")
            .unwrap()
            .wait()
            .await
            .unwrap();
        runtimes.handle_abnormal_stop(&RuntimeIdentity::new("ws1", "default", "user2"), "x");
        assert_eq!(runtimes.status("ws1"), WorkspaceStatus::Running);
    }

    #[tokio::test]
    async fn test_wr020_recover_tracked_runtimes() {
        let mut fake = FakeInfrastructure::new();
        fake.tracking = true;
        let tracked_id = RuntimeIdentity::new("ws1", "default", "user1");
        let orphan_id = RuntimeIdentity::new("gone", "default", "user1");
        for id in [&tracked_id, &orphan_id] {
            fake.tracked.lock().unwrap().push(InternalRuntime::new(
                id.clone(),
                IndexMap::new(),
                IndexMap::new(),
                Vec::new(),
                Arc::new(crate::infra::runtime::NoOpUrlRewriter),
            ));
        }
        let dao = Arc::new(MemoryWorkspaceDao::new());
        dao.create(workspace("ws1")).unwrap();

        let (runtimes, _) = setup(Arc::new(fake), dao).await;
        assert_eq!(runtimes.runtime_ids(), vec!["ws1"]);
        assert_eq!(runtimes.status("ws1"), WorkspaceStatus::Running);
        assert_eq!(runtimes.identity("ws1"), Some(tracked_id));
        assert_eq!(
            runtimes.runtime_context("ws1").unwrap().state(),
            ContextState::Running
        );

        runtimes.stop("ws1").await.unwrap();
        assert!(!runtimes.is_any_running());
    }

    #[tokio::test]
    async fn test_wr020_recover_skips_untracked_backend() {
        let (runtimes, _, _) = plain().await;
        runtimes.recover().await;
        assert!(runtimes.runtime_ids().is_empty());
    }

    #[tokio::test]
    async fn test_wr020_validate() {
        let (runtimes, _, _) = plain().await;
        let estimated = runtimes.validate(&scratch_env("fake")).unwrap();
        assert_eq!(estimated.recipe.content_type.as_deref(), Some("text/plain"));
        assert!(matches!(
            runtimes.validate(&scratch_env("k8s")),
            Err(InfraError::NotFound(_))
        ));
    }
}
