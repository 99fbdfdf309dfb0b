//! WR-003: YAML parsing, structural validation, and estimate normalization.
//!
//! Validates environments before anything is resolved or provisioned:
//! - Recipe type must be set and the recipe must carry content or location
//! - At least one machine, with well-formed names
//! - Server ports `N` or `N/tcp|udp`, protocols are URL schemes
//! - Installer keys and env-var attribute names are non-empty
//!
//! `normalize_environment` is the enrichment half of `estimate`: it is a
//! fixed point after a single pass.

use super::error::{InfraError, Result};
use super::types::*;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

static MACHINE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("valid regex"));
static SERVER_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[1-9][0-9]*(/(tcp|udp))?$").expect("valid regex"));
static SERVER_PROTOCOL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9\-+.]*$").expect("valid regex"));

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a workspace YAML file from disk.
pub fn parse_workspace_file(path: &Path) -> Result<Workspace> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        InfraError::Validation(format!("failed to read {}: {}", path.display(), e))
    })?;
    parse_workspace(&content)
}

/// Parse a workspace from a YAML string.
pub fn parse_workspace(yaml: &str) -> Result<Workspace> {
    serde_yaml_ng::from_str(yaml)
        .map_err(|e| InfraError::Validation(format!("YAML parse error: {}", e)))
}

/// Parse a single environment from a YAML string.
pub fn parse_environment(yaml: &str) -> Result<Environment> {
    serde_yaml_ng::from_str(yaml)
        .map_err(|e| InfraError::Validation(format!("YAML parse error: {}", e)))
}

/// Validate an environment. Returns a list of errors (empty = valid).
pub fn validate_environment(env: &Environment) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut push = |message: String| errors.push(ValidationError { message });

    if env.recipe.recipe_type.trim().is_empty() {
        push("environment recipe type should not be empty".to_string());
    }
    if env.recipe.non_empty_content().is_none() && env.recipe.non_empty_location().is_none() {
        push("environment recipe must contain location or content".to_string());
    }
    if env.machines.is_empty() {
        push("environment should contain at least 1 machine".to_string());
    }

    for (name, machine) in &env.machines {
        if !MACHINE_NAME.is_match(name) {
            push(format!("machine name '{}' is invalid", name));
        }

        for (server_ref, server) in &machine.servers {
            if server_ref.is_empty() {
                push(format!("machine '{}' contains server with empty name", name));
            }
            if !SERVER_PORT.is_match(&server.port) {
                push(format!(
                    "machine '{}' contains server conf '{}' with invalid port '{}'",
                    name, server_ref, server.port
                ));
            }
            if let Some(ref protocol) = server.protocol {
                if !SERVER_PROTOCOL.is_match(&protocol.to_ascii_lowercase()) {
                    push(format!(
                        "machine '{}' contains server conf '{}' with invalid protocol '{}'",
                        name, server_ref, protocol
                    ));
                }
            }
        }

        for key in &machine.installers {
            if key.trim().is_empty() {
                push(format!("machine '{}' contains an empty installer key", name));
            }
        }

        for attr in machine.attributes.keys() {
            if let Some(var) = attr.strip_prefix(ENV_VAR_ATTRIBUTE_PREFIX) {
                if var.is_empty() {
                    push(format!(
                        "machine '{}' contains environment variable with empty name",
                        name
                    ));
                }
            }
        }
    }

    errors
}

/// Fold validation errors into a single `Validation` error.
pub fn ensure_valid(env: &Environment) -> Result<()> {
    let errors = validate_environment(env);
    if errors.is_empty() {
        return Ok(());
    }
    let joined = errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    Err(InfraError::Validation(joined))
}

/// Reject identifiers that would escape a directory when used as a path component.
pub fn check_path_component(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\']) {
        return Err(InfraError::Validation(format!(
            "{} '{}' cannot be used as a path component",
            kind, value
        )));
    }
    Ok(())
}

/// Normalize a valid environment. Idempotent:
/// `normalize(normalize(env)) == normalize(env)`.
pub fn normalize_environment(env: &Environment, default_content_type: &str) -> Environment {
    let mut out = env.clone();

    if out
        .recipe
        .content_type
        .as_deref()
        .is_none_or(|ct| ct.trim().is_empty())
    {
        out.recipe.content_type = Some(default_content_type.to_string());
    }
    if out.recipe.non_empty_content().is_some() {
        out.recipe.location = None;
    }

    for machine in out.machines.values_mut() {
        for server in machine.servers.values_mut() {
            if !server.port.contains('/') {
                server.port = format!("{}/tcp", server.port);
            }
            if let Some(ref mut protocol) = server.protocol {
                *protocol = protocol.to_ascii_lowercase();
            }
        }

        let mut seen = std::collections::HashSet::new();
        machine.installers.retain(|k| seen.insert(k.clone()));
    }

    out
}
