//! WR-001: Workspace environment and runtime data model.
//!
//! Defines the YAML schema types for recipes, machines, servers, installers,
//! workspaces, and the identity/status types shared by the control plane.
//! All schema types derive Serialize/Deserialize for YAML roundtripping.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Server attribute marking a server as reachable only inside the runtime.
pub const INTERNAL_SERVER_ATTRIBUTE: &str = "internal";

/// Machine attribute holding the preferred memory limit in bytes.
pub const MEMORY_LIMIT_ATTRIBUTE: &str = "memoryLimitBytes";

/// Machine attribute prefix for environment variables passed to machine scripts.
pub const ENV_VAR_ATTRIBUTE_PREFIX: &str = "env.";

// ============================================================================
// Environment (user-supplied)
// ============================================================================

/// Declarative description of how to build a workspace environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    /// Recipe type, selects the infrastructure backend
    #[serde(rename = "type")]
    pub recipe_type: String,

    /// MIME type of the recipe content
    #[serde(default, rename = "contentType")]
    pub content_type: Option<String>,

    /// Inline recipe content (authoritative when non-empty)
    #[serde(default)]
    pub content: Option<String>,

    /// Remote or opaque recipe location
    #[serde(default)]
    pub location: Option<String>,
}

impl Recipe {
    /// Inline recipe with the given type and content.
    pub fn inline(recipe_type: &str, content: &str) -> Self {
        Self {
            recipe_type: recipe_type.to_string(),
            content_type: None,
            content: Some(content.to_string()),
            location: None,
        }
    }

    /// Content if present and non-empty.
    pub fn non_empty_content(&self) -> Option<&str> {
        self.content.as_deref().filter(|c| !c.is_empty())
    }

    /// Location if present and non-empty.
    pub fn non_empty_location(&self) -> Option<&str> {
        self.location.as_deref().filter(|l| !l.is_empty())
    }
}

/// A server (port) exposed by a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port with optional transport, e.g. `8080` or `8080/tcp`
    pub port: String,

    /// URL scheme used to reach the server
    #[serde(default)]
    pub protocol: Option<String>,

    /// URL path
    #[serde(default)]
    pub path: Option<String>,

    /// Free-form server attributes
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub attributes: IndexMap<String, String>,
}

impl ServerConfig {
    pub fn new(port: &str, protocol: Option<&str>) -> Self {
        Self {
            port: port.to_string(),
            protocol: protocol.map(str::to_string),
            path: None,
            attributes: IndexMap::new(),
        }
    }

    /// Port number without the transport suffix.
    pub fn port_number(&self) -> &str {
        self.port.split('/').next().unwrap_or(&self.port)
    }

    /// Whether the server is only reachable from inside the runtime.
    pub fn is_internal(&self) -> bool {
        self.attributes
            .get(INTERNAL_SERVER_ATTRIBUTE)
            .is_some_and(|v| v == "true")
    }
}

/// Raw, user-supplied machine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Servers declared directly on the machine
    #[serde(default)]
    pub servers: IndexMap<String, ServerConfig>,

    /// Installer keys (`id` or `id:version`)
    #[serde(default)]
    pub installers: Vec<String>,

    /// Machine attributes
    #[serde(default)]
    pub attributes: IndexMap<String, String>,
}

/// A requestable workspace environment: recipe plus machines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub recipe: Recipe,

    /// Machine configurations (order-preserving)
    #[serde(default)]
    pub machines: IndexMap<String, MachineConfig>,
}

// ============================================================================
// Installers
// ============================================================================

/// A named, dependency-aware unit that configures a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installer {
    pub id: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Installer ids that must be installed first
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Script executed on the machine
    #[serde(default)]
    pub script: String,

    /// Servers contributed to the machine
    #[serde(default)]
    pub servers: IndexMap<String, ServerConfig>,

    #[serde(default)]
    pub properties: IndexMap<String, String>,
}

fn default_version() -> String {
    "latest".to_string()
}

impl Installer {
    /// Registry key in `id:version` form.
    pub fn key(&self) -> String {
        format!("{}:{}", self.id, self.version)
    }
}

// ============================================================================
// Warnings
// ============================================================================

/// A non-fatal configuration gap recorded during estimation or preparation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub code: u32,
    pub message: String,
}

impl Warning {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

// ============================================================================
// Runtime identity and live state
// ============================================================================

/// Uniquely names one runtime instance.
///
/// Equality and hashing cover all three fields, so two owners starting the
/// same workspace environment never collide in identity-keyed structures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuntimeIdentity {
    #[serde(rename = "workspaceId")]
    pub workspace_id: String,
    #[serde(rename = "envName")]
    pub env_name: String,
    #[serde(rename = "ownerId")]
    pub owner_id: String,
}

impl RuntimeIdentity {
    pub fn new(workspace_id: &str, env_name: &str, owner_id: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            env_name: env_name.to_string(),
            owner_id: owner_id.to_string(),
        }
    }
}

impl fmt::Display for RuntimeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.workspace_id, self.env_name, self.owner_id)
    }
}

/// Server status as observed by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    Running,
    Stopped,
    #[default]
    Unknown,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// A running server of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub url: String,
    #[serde(default)]
    pub status: ServerStatus,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub attributes: IndexMap<String, String>,
}

impl Server {
    pub fn is_internal(&self) -> bool {
        self.attributes
            .get(INTERNAL_SERVER_ATTRIBUTE)
            .is_some_and(|v| v == "true")
    }
}

/// Machine status as observed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineStatus {
    Starting,
    Running,
    Stopped,
    Failed,
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// One addressable unit of a running environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    #[serde(default)]
    pub attributes: IndexMap<String, String>,
    #[serde(default)]
    pub servers: IndexMap<String, Server>,
    pub status: MachineStatus,
}

/// Workspace status as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkspaceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

// ============================================================================
// Workspace metadata (persisted by WorkspaceDao)
// ============================================================================

/// Workspace metadata: a named set of environments within a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub namespace: String,
    pub name: String,

    /// Environment started when none is requested explicitly
    #[serde(default, rename = "defaultEnv")]
    pub default_env: Option<String>,

    #[serde(default)]
    pub temporary: bool,

    #[serde(default)]
    pub environments: IndexMap<String, Environment>,

    #[serde(default)]
    pub attributes: IndexMap<String, String>,
}

impl Workspace {
    /// Resolve the environment to start: the requested one, else the default,
    /// else the only environment.
    pub fn select_env<'a>(&'a self, requested: Option<&'a str>) -> Option<&'a str> {
        if let Some(name) = requested {
            return Some(name);
        }
        if let Some(ref name) = self.default_env {
            return Some(name.as_str());
        }
        if self.environments.len() == 1 {
            return self.environments.keys().next().map(String::as_str);
        }
        None
    }
}

// ============================================================================
// Tests
// ============================================================================
