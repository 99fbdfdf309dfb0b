//! WR-014: Infrastructure backend contracts.
//!
//! A backend is split in two:
//! - `RuntimeInfrastructure`: fast, synchronous `estimate`/`prepare` plus
//!   optional runtime tracking
//! - `RuntimeDriver`: the slow, cancellable provisioning work behind a
//!   `RuntimeContext`

pub mod context;
pub mod local;
pub mod registry;
pub mod runtime;

use crate::core::environment::InternalEnvironment;
use crate::core::error::{InfraError, Result};
use crate::core::types::{Environment, Machine, RuntimeIdentity};
use async_trait::async_trait;
use context::RuntimeContext;
use indexmap::IndexMap;
use runtime::InternalRuntime;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Backend that turns environments of its recipe types into runtimes.
pub trait RuntimeInfrastructure: Send + Sync {
    /// Backend name for logs and diagnostics.
    fn name(&self) -> &str;

    /// Recipe types served. Non-empty, fixed for the backend's lifetime.
    fn recipe_types(&self) -> &[String];

    /// Validate and normalize an environment without side effects.
    fn estimate(&self, env: &Environment) -> Result<Environment>;

    /// Build a prepared context. No provisioning happens here; the recipe
    /// fetch may block, so async callers run this on a blocking thread.
    fn prepare(&self, identity: &RuntimeIdentity, env: &Environment) -> Result<Arc<RuntimeContext>>;

    /// Runtime tracking, if this backend can recover after a restart.
    fn tracker(&self) -> Option<&dyn RuntimeTracker> {
        None
    }

    /// Identities of runtimes alive on this backend.
    fn identities(&self) -> Result<BTreeSet<RuntimeIdentity>> {
        match self.tracker() {
            Some(tracker) => tracker.tracked_identities(),
            None => Err(InfraError::NotSupported("runtime tracking".into())),
        }
    }

    /// Live runtime for an identity reported by `identities`.
    fn runtime(&self, identity: &RuntimeIdentity) -> Result<InternalRuntime> {
        match self.tracker() {
            Some(tracker) => tracker.tracked_runtime(identity),
            None => Err(InfraError::NotSupported("runtime tracking".into())),
        }
    }
}

/// Enumerates and reloads runtimes that outlive the control plane.
pub trait RuntimeTracker: Send + Sync {
    fn tracked_identities(&self) -> Result<BTreeSet<RuntimeIdentity>>;
    fn tracked_runtime(&self, identity: &RuntimeIdentity) -> Result<InternalRuntime>;
}

/// What a driver reports after a successful start.
#[derive(Debug, Clone, Default)]
pub struct StartedRuntime {
    pub machines: IndexMap<String, Machine>,
    pub properties: IndexMap<String, String>,
}

/// Provisioning half of a backend.
#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// Provision the environment. When `cancel` fires the driver releases
    /// whatever it created and returns `InfraError::StartInterrupted`.
    async fn start(
        &self,
        identity: &RuntimeIdentity,
        env: &InternalEnvironment,
        cancel: CancellationToken,
    ) -> Result<StartedRuntime>;

    /// Tear down everything belonging to `identity`. Idempotent.
    async fn stop(&self, identity: &RuntimeIdentity) -> Result<()>;

    /// Stable URI streaming long-lived process output.
    fn output_channel(&self, _identity: &RuntimeIdentity) -> Result<String> {
        Err(InfraError::NotSupported("output channel".into()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory backend for lifecycle and control-plane tests.

    use super::*;
    use crate::core::installer::MemoryInstallerRegistry;
    use crate::core::parser;
    use crate::core::environment::EnvironmentNormalizer;
    use crate::core::recipe::RecipeResolver;
    use crate::core::types::MachineStatus;
    use context::ContextRegistry;
    use runtime::NoOpUrlRewriter;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Driver whose behaviour is switched by flags.
    #[derive(Default)]
    pub struct FakeDriver {
        /// Block in `start` until cancelled
        pub hang: AtomicBool,
        /// Fail `start` with an infrastructure error
        pub fail: AtomicBool,
        /// Fail `stop` with an internal error
        pub fail_stop: AtomicBool,
        pub starts: AtomicUsize,
        pub stops: AtomicUsize,
    }

    #[async_trait]
    impl RuntimeDriver for FakeDriver {
        async fn start(
            &self,
            identity: &RuntimeIdentity,
            env: &InternalEnvironment,
            cancel: CancellationToken,
        ) -> Result<StartedRuntime> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                cancel.cancelled().await;
                return Err(InfraError::StartInterrupted(identity.clone()));
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(InfraError::Infrastructure("image not found".into()));
            }
            let machines = env
                .machines
                .iter()
                .map(|(name, cfg)| {
                    (
                        name.clone(),
                        Machine {
                            attributes: cfg.attributes.clone(),
                            servers: IndexMap::new(),
                            status: MachineStatus::Running,
                        },
                    )
                })
                .collect();
            Ok(StartedRuntime {
                machines,
                properties: IndexMap::new(),
            })
        }

        async fn stop(&self, _identity: &RuntimeIdentity) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.fail_stop.load(Ordering::SeqCst) {
                return Err(InfraError::internal("stop failed"));
            }
            Ok(())
        }

        fn output_channel(&self, identity: &RuntimeIdentity) -> Result<String> {
            Ok(format!("fake://{}/output", identity))
        }
    }

    /// Backend serving recipe type `fake`, with optional tracked runtimes.
    pub struct FakeInfrastructure {
        pub driver: Arc<FakeDriver>,
        pub contexts: Arc<ContextRegistry>,
        pub types: Vec<String>,
        pub tracked: Mutex<Vec<InternalRuntime>>,
        pub tracking: bool,
        /// Fail `prepare` with an internal error
        pub fail_prepare: AtomicBool,
    }

    impl FakeInfrastructure {
        pub fn new() -> Self {
            Self::with_types(&["fake"])
        }

        pub fn with_types(types: &[&str]) -> Self {
            Self {
                driver: Arc::new(FakeDriver::default()),
                contexts: Arc::new(ContextRegistry::default()),
                types: types.iter().map(|t| t.to_string()).collect(),
                tracked: Mutex::new(Vec::new()),
                tracking: false,
                fail_prepare: AtomicBool::new(false),
            }
        }
    }

    impl RuntimeTracker for FakeInfrastructure {
        fn tracked_identities(&self) -> Result<BTreeSet<RuntimeIdentity>> {
            Ok(self
                .tracked
                .lock()
                .map_err(|_| InfraError::internal("poisoned"))?
                .iter()
                .map(|r| r.identity().clone())
                .collect())
        }

        fn tracked_runtime(&self, identity: &RuntimeIdentity) -> Result<InternalRuntime> {
            self.tracked
                .lock()
                .map_err(|_| InfraError::internal("poisoned"))?
                .iter()
                .find(|r| r.identity() == identity)
                .cloned()
                .ok_or_else(|| InfraError::NotFound(identity.to_string()))
        }
    }

    impl RuntimeInfrastructure for FakeInfrastructure {
        fn name(&self) -> &str {
            "fake"
        }

        fn recipe_types(&self) -> &[String] {
            &self.types
        }

        fn estimate(&self, env: &Environment) -> Result<Environment> {
            parser::ensure_valid(env)?;
            Ok(parser::normalize_environment(env, "text/plain"))
        }

        fn prepare(&self, identity: &RuntimeIdentity, env: &Environment) -> Result<Arc<RuntimeContext>> {
            if self.fail_prepare.load(Ordering::SeqCst) {
                return Err(InfraError::internal("prepare failed"));
            }
            let env = self.estimate(env)?;
            let lease = self.contexts.acquire(identity)?;
            let installers = MemoryInstallerRegistry::new();
            let recipes = RecipeResolver::default();
            let internal = EnvironmentNormalizer::new(&installers, &recipes).normalize(&env)?;
            Ok(Arc::new(RuntimeContext::new(
                identity.clone(),
                internal,
                "fake",
                self.driver.clone(),
                Arc::new(NoOpUrlRewriter),
                lease,
            )))
        }

        fn tracker(&self) -> Option<&dyn RuntimeTracker> {
            self.tracking.then_some(self as &dyn RuntimeTracker)
        }
    }

    /// One machine, no installers, recipe `FROM scratch`.
    pub fn scratch_env(recipe_type: &str) -> Environment {
        let mut env = Environment {
            recipe: crate::core::types::Recipe::inline(recipe_type, "FROM scratch"),
            ..Environment::default()
        };
        env.machines
            .insert("dev".into(), crate::core::types::MachineConfig::default());
        env
    }
}
