//! WR-017: Recipe type → infrastructure backend dispatch.
//!
//! Built once at startup and read-only afterwards, so lookups need no locking.

use super::RuntimeInfrastructure;
use crate::core::error::{InfraError, Result};
use rustc_hash::FxHashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct InfrastructureRegistry {
    by_type: FxHashMap<String, Arc<dyn RuntimeInfrastructure>>,
    /// Distinct backends in registration order
    backends: Vec<Arc<dyn RuntimeInfrastructure>>,
}

impl std::fmt::Debug for InfrastructureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.by_type.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("InfrastructureRegistry")
            .field("recipe_types", &types)
            .finish()
    }
}

impl InfrastructureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under every recipe type it serves.
    ///
    /// Fails without registering anything if the backend serves no types or
    /// claims a type another backend already serves.
    pub fn register(&mut self, infra: Arc<dyn RuntimeInfrastructure>) -> Result<()> {
        let types = infra.recipe_types();
        if types.is_empty() {
            return Err(InfraError::Validation(format!(
                "infrastructure '{}' serves no recipe types",
                infra.name()
            )));
        }
        for t in types {
            if let Some(existing) = self.by_type.get(t) {
                return Err(InfraError::Conflict(format!(
                    "recipe type '{}' is already served by infrastructure '{}'",
                    t,
                    existing.name()
                )));
            }
        }
        for t in types {
            self.by_type.insert(t.clone(), Arc::clone(&infra));
        }
        tracing::debug!(infrastructure = infra.name(), types = ?types, "registered infrastructure");
        self.backends.push(infra);
        Ok(())
    }

    /// Backend serving `recipe_type`.
    pub fn get(&self, recipe_type: &str) -> Result<Arc<dyn RuntimeInfrastructure>> {
        self.by_type.get(recipe_type).cloned().ok_or_else(|| {
            InfraError::NotFound(format!(
                "No infrastructure found of type: {}",
                recipe_type
            ))
        })
    }

    /// All recipe types served, sorted.
    pub fn recipe_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.by_type.keys().cloned().collect();
        types.sort();
        types
    }

    /// Each registered backend once, in registration order.
    pub fn infrastructures(&self) -> &[Arc<dyn RuntimeInfrastructure>] {
        &self.backends
    }
}
