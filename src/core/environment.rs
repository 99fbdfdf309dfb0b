//! WR-006: Environment normalization into the resolved, internal form.
//!
//! `EnvironmentNormalizer` validates the raw environment, resolves the recipe,
//! and resolves each machine's installers and servers. Configuration gaps that
//! are not fatal become `Warning`s on the resulting `InternalEnvironment`.

use super::error::Result;
use super::installer::{InstallerRegistry, InstallerResolver};
use super::parser;
use super::recipe::{RecipeResolver, RecipeSource};
use super::types::{
    Environment, Installer, ServerConfig, Warning, MEMORY_LIMIT_ATTRIBUTE,
};
use indexmap::IndexMap;

/// Recipe carried both content and location; location was ignored.
pub const WARNING_CONTENT_AND_LOCATION: u32 = 4101;
/// Recipe location was not HTTP(S) and was used verbatim as content.
pub const WARNING_LOCATION_PASS_THROUGH: u32 = 4102;
/// Machine has no memory limit attribute.
pub const WARNING_MEMORY_LIMIT_MISSING: u32 = 4103;

/// Resolved recipe: script text plus its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalRecipe {
    pub recipe_type: String,
    pub content_type: Option<String>,
    pub content: String,
}

/// Resolved machine configuration. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InternalMachineConfig {
    /// Installers in dependency order
    pub installers: Vec<Installer>,
    /// Explicit servers plus installer-declared servers
    pub servers: IndexMap<String, ServerConfig>,
    pub attributes: IndexMap<String, String>,
}

/// Fully resolved environment owned by one runtime context.
#[derive(Debug, Clone)]
pub struct InternalEnvironment {
    pub recipe: InternalRecipe,
    pub machines: IndexMap<String, InternalMachineConfig>,
    /// Raw environment this one was built from
    pub source: Environment,
    warnings: Vec<Warning>,
}

impl InternalEnvironment {
    pub fn new(
        recipe: InternalRecipe,
        machines: IndexMap<String, InternalMachineConfig>,
        source: Environment,
    ) -> Self {
        Self {
            recipe,
            machines,
            source,
            warnings: Vec::new(),
        }
    }

    /// Append a warning. Warnings are never removed.
    pub fn add_warning(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }
}

/// Builds `InternalEnvironment`s from raw environments.
pub struct EnvironmentNormalizer<'a> {
    installers: &'a dyn InstallerRegistry,
    recipes: &'a RecipeResolver,
}

impl<'a> EnvironmentNormalizer<'a> {
    pub fn new(installers: &'a dyn InstallerRegistry, recipes: &'a RecipeResolver) -> Self {
        Self { installers, recipes }
    }

    /// Validate and resolve `env`. May block on an HTTP recipe fetch.
    pub fn normalize(&self, env: &Environment) -> Result<InternalEnvironment> {
        parser::ensure_valid(env)?;

        let mut warnings = Vec::new();
        if env.recipe.non_empty_content().is_some() && env.recipe.non_empty_location().is_some() {
            warnings.push(Warning::new(
                WARNING_CONTENT_AND_LOCATION,
                "Recipe has both content and location; location is ignored",
            ));
        }

        let resolved = self.recipes.resolve_detailed(&env.recipe)?;
        if resolved.source == RecipeSource::PassThrough {
            warnings.push(Warning::new(
                WARNING_LOCATION_PASS_THROUGH,
                format!(
                    "Recipe location '{}' is not an HTTP(S) URL and is used as recipe content",
                    env.recipe.non_empty_location().unwrap_or_default()
                ),
            ));
        }

        let mut machines = IndexMap::new();
        for (name, config) in &env.machines {
            let installers = InstallerResolver::resolve(&config.installers, self.installers)?;
            let mut servers = config.servers.clone();
            InstallerResolver::merge_servers(&mut servers, &installers)?;

            if !config.attributes.contains_key(MEMORY_LIMIT_ATTRIBUTE) {
                warnings.push(Warning::new(
                    WARNING_MEMORY_LIMIT_MISSING,
                    format!(
                        "Machine '{}' does not declare '{}'; the backend default applies",
                        name, MEMORY_LIMIT_ATTRIBUTE
                    ),
                ));
            }

            machines.insert(
                name.clone(),
                InternalMachineConfig {
                    installers,
                    servers,
                    attributes: config.attributes.clone(),
                },
            );
        }

        let recipe = InternalRecipe {
            recipe_type: env.recipe.recipe_type.clone(),
            content_type: env.recipe.content_type.clone(),
            content: resolved.content,
        };
        let mut internal = InternalEnvironment::new(recipe, machines, env.clone());
        for warning in warnings {
            tracing::debug!(code = warning.code, message = %warning.message, "environment warning");
            internal.add_warning(warning);
        }
        Ok(internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::InfraError;
    use crate::core::installer::MemoryInstallerRegistry;
    use crate::core::types::{MachineConfig, Recipe};

    fn installer(id: &str, deps: &[&str], server: Option<(&str, &str)>) -> Installer {
        let mut i = Installer {
            id: id.into(),
            version: "latest".into(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            ..Installer::default()
        };
        if let Some((name, port)) = server {
            i.servers
                .insert(name.into(), ServerConfig::new(port, Some("http")));
        }
        i
    }

    fn registry() -> MemoryInstallerRegistry {
        MemoryInstallerRegistry::from_installers([
            installer("exec", &[], Some(("exec", "4412/tcp"))),
            installer("ws-agent", &["exec"], Some(("wsagent", "4401/tcp"))),
        ])
    }

    fn env_with(installers: &[&str]) -> Environment {
        let mut machine = MachineConfig::default();
        machine.installers = installers.iter().map(|s| s.to_string()).collect();
        machine
            .attributes
            .insert(MEMORY_LIMIT_ATTRIBUTE.into(), "2147483648".into());
        machine
            .servers
            .insert("web".into(), ServerConfig::new("8080/tcp", Some("http")));
        let mut env = Environment {
            recipe: Recipe::inline("script", "echo hi"),
            machines: IndexMap::new(),
        };
        env.machines.insert("dev".into(), machine);
        env
    }

    #[test]
    fn test_wr006_normalize_resolves_installers_and_servers() {
        let reg = registry();
        let resolver = RecipeResolver::default();
        let internal = EnvironmentNormalizer::new(&reg, &resolver)
            .normalize(&env_with(&["ws-agent"]))
            .unwrap();

        assert_eq!(internal.recipe.content, "echo hi");
        let dev = &internal.machines["dev"];
        let ids: Vec<_> = dev.installers.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["exec", "ws-agent"]);
        let servers: Vec<_> = dev.servers.keys().map(String::as_str).collect();
        assert_eq!(servers, vec!["web", "exec", "wsagent"]);
        assert!(internal.warnings().is_empty());
    }

    #[test]
    fn test_wr006_normalize_rejects_invalid() {
        let reg = registry();
        let resolver = RecipeResolver::default();
        let mut env = env_with(&[]);
        env.machines.clear();
        let err = EnvironmentNormalizer::new(&reg, &resolver)
            .normalize(&env)
            .unwrap_err();
        assert!(matches!(err, InfraError::Validation(_)));
    }

    #[test]
    fn test_wr006_missing_installer_fails() {
        let reg = registry();
        let resolver = RecipeResolver::default();
        let err = EnvironmentNormalizer::new(&reg, &resolver)
            .normalize(&env_with(&["ghost"]))
            .unwrap_err();
        assert!(matches!(err, InfraError::Infrastructure(_)));
    }

    #[test]
    fn test_wr006_server_conflict_is_internal() {
        let reg = MemoryInstallerRegistry::from_installers([installer(
            "x",
            &[],
            Some(("web", "9090/tcp")),
        )]);
        let resolver = RecipeResolver::default();
        let err = EnvironmentNormalizer::new(&reg, &resolver)
            .normalize(&env_with(&["x"]))
            .unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn test_wr006_warnings_recorded() {
        let reg = registry();
        let resolver = RecipeResolver::default();
        let mut env = env_with(&[]);
        env.recipe.location = Some("http://127.0.0.1:1/ignored".into());
        env.machines["dev"].attributes.clear();

        let internal = EnvironmentNormalizer::new(&reg, &resolver)
            .normalize(&env)
            .unwrap();
        let codes: Vec<u32> = internal.warnings().iter().map(|w| w.code).collect();
        assert_eq!(
            codes,
            vec![WARNING_CONTENT_AND_LOCATION, WARNING_MEMORY_LIMIT_MISSING]
        );
    }

    #[test]
    fn test_wr006_pass_through_warning() {
        let reg = registry();
        let resolver = RecipeResolver::default();
        let mut env = env_with(&[]);
        env.recipe.content = None;
        env.recipe.location = Some("file:///r.yml".into());

        let internal = EnvironmentNormalizer::new(&reg, &resolver)
            .normalize(&env)
            .unwrap();
        assert_eq!(internal.recipe.content, "file:///r.yml");
        assert!(internal
            .warnings()
            .iter()
            .any(|w| w.code == WARNING_LOCATION_PASS_THROUGH && w.message.contains("file:///r.yml")));
    }

    #[test]
    fn test_wr006_add_warning_appends() {
        let reg = registry();
        let resolver = RecipeResolver::default();
        let mut internal = EnvironmentNormalizer::new(&reg, &resolver)
            .normalize(&env_with(&[]))
            .unwrap();
        internal.add_warning(Warning::new(1, "one"));
        internal.add_warning(Warning::new(2, "two"));
        assert_eq!(internal.warnings().len(), 2);
        assert_eq!(internal.warnings()[1].message, "two");
    }
}
