//! WR-005: Installer registry, dependency ordering, and server merging.
//!
//! Installers are collected into an arena of nodes with index-based
//! dependency edges, then ordered with Kahn's algorithm. Ties among ready
//! installers go to the one discovered first, so the order follows the
//! requested keys and is identical across calls.

use super::error::{InfraError, Result};
use super::types::{Installer, ServerConfig};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::Path;

/// Source of installer definitions.
pub trait InstallerRegistry: Send + Sync {
    /// Look up an installer by `id` or `id:version`.
    fn installer(&self, key: &str) -> Result<Installer>;

    /// All registered installers.
    fn installers(&self) -> Vec<Installer>;
}

/// Split an installer key into id and optional version.
pub fn parse_key(key: &str) -> (&str, Option<&str>) {
    match key.split_once(':') {
        Some((id, version)) if !version.is_empty() => (id, Some(version)),
        Some((id, _)) => (id, None),
        None => (key, None),
    }
}

/// In-memory installer registry keyed by id, then version.
#[derive(Debug, Clone, Default)]
pub struct MemoryInstallerRegistry {
    by_id: FxHashMap<String, IndexMap<String, Installer>>,
}

impl MemoryInstallerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the given installers.
    pub fn from_installers(installers: impl IntoIterator<Item = Installer>) -> Self {
        let mut registry = Self::new();
        for installer in installers {
            registry.add(installer);
        }
        registry
    }

    /// Register an installer, replacing the same id and version.
    pub fn add(&mut self, installer: Installer) {
        self.by_id
            .entry(installer.id.clone())
            .or_default()
            .insert(installer.version.clone(), installer);
    }

    /// Load every `*.yaml`/`*.yml` installer definition in a directory.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        let read_dir = std::fs::read_dir(dir).map_err(|e| {
            InfraError::Validation(format!("cannot read installers dir {}: {}", dir.display(), e))
        })?;
        let mut paths: Vec<_> = read_dir
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .is_some_and(|ext| ext == "yaml" || ext == "yml")
            })
            .collect();
        paths.sort();

        for path in &paths {
            let content = std::fs::read_to_string(path).map_err(|e| {
                InfraError::Validation(format!("cannot read installer {}: {}", path.display(), e))
            })?;
            let installer: Installer = serde_yaml_ng::from_str(&content).map_err(|e| {
                InfraError::Validation(format!("invalid installer {}: {}", path.display(), e))
            })?;
            self.add(installer);
        }
        Ok(paths.len())
    }

    pub fn len(&self) -> usize {
        self.by_id.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl InstallerRegistry for MemoryInstallerRegistry {
    fn installer(&self, key: &str) -> Result<Installer> {
        let (id, version) = parse_key(key);
        let versions = self
            .by_id
            .get(id)
            .ok_or_else(|| InfraError::NotFound(format!("installer '{}' not found", key)))?;

        let found = match version {
            Some(v) if v != "latest" => versions.get(v),
            _ => versions
                .get("latest")
                .or_else(|| versions.values().next_back()),
        };
        found
            .cloned()
            .ok_or_else(|| InfraError::NotFound(format!("installer '{}' not found", key)))
    }

    fn installers(&self) -> Vec<Installer> {
        let mut all: Vec<Installer> = self
            .by_id
            .values()
            .flat_map(|versions| versions.values().cloned())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.version.cmp(&b.version)));
        all
    }
}

/// One installer in the dependency arena.
struct Node {
    installer: Installer,
    /// Indices of nodes this one depends on.
    deps: Vec<usize>,
}

/// Dependency ordering and server merging for a machine's installers.
pub struct InstallerResolver;

impl InstallerResolver {
    /// Resolve installer keys and their transitive dependencies into
    /// dependency order (a depends on b ⇒ b precedes a).
    pub fn resolve(keys: &[String], registry: &dyn InstallerRegistry) -> Result<Vec<Installer>> {
        let nodes = collect(keys, registry)?;
        let order = topo_order(&nodes)?;

        let mut slots: Vec<Option<Installer>> =
            nodes.into_iter().map(|n| Some(n.installer)).collect();
        Ok(order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect())
    }

    /// Ordered installer keys (`id:version`) for the requested keys.
    pub fn sort_keys(keys: &[String], registry: &dyn InstallerRegistry) -> Result<Vec<String>> {
        Ok(Self::resolve(keys, registry)?
            .iter()
            .map(Installer::key)
            .collect())
    }

    /// Merge installer-declared servers into a machine's server map.
    ///
    /// Absent keys are inserted, identical duplicates are ignored, and a
    /// differing declaration for an existing key is an internal error.
    pub fn merge_servers(
        servers: &mut IndexMap<String, ServerConfig>,
        installers: &[Installer],
    ) -> Result<()> {
        for installer in installers {
            for (name, config) in &installer.servers {
                match servers.get(name) {
                    None => {
                        servers.insert(name.clone(), config.clone());
                    }
                    Some(existing) if existing == config => {}
                    Some(_) => {
                        return Err(InfraError::internal(format!(
                            "installer '{}' declares server '{}' that conflicts with an existing server configuration",
                            installer.id, name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Look up every requested installer and its transitive dependencies.
fn collect(keys: &[String], registry: &dyn InstallerRegistry) -> Result<Vec<Node>> {
    let mut nodes: Vec<Node> = Vec::new();
    let mut index: FxHashMap<String, usize> = FxHashMap::default();
    let mut pending: Vec<(String, Option<String>)> = Vec::new();

    for key in keys {
        pending.push((key.clone(), None));
        // Drain breadth-first so each requested key's dependencies are
        // discovered before the next requested key.
        let mut cursor = 0;
        while cursor < pending.len() {
            let (key, dependent) = pending[cursor].clone();
            cursor += 1;

            let (id, _) = parse_key(&key);
            if index.contains_key(id) {
                continue;
            }
            let installer = registry.installer(&key).map_err(|e| match dependent {
                Some(ref parent) => InfraError::Infrastructure(format!(
                    "installer '{}' depends on unknown installer '{}'",
                    parent, key
                )),
                None => InfraError::Infrastructure(format!(
                    "installer '{}' could not be resolved: {}",
                    key, e
                )),
            })?;

            for dep in &installer.dependencies {
                pending.push((dep.clone(), Some(installer.id.clone())));
            }
            index.insert(installer.id.clone(), nodes.len());
            nodes.push(Node {
                installer,
                deps: Vec::new(),
            });
        }
        pending.clear();
    }

    for i in 0..nodes.len() {
        let mut deps = Vec::new();
        for dep in &nodes[i].installer.dependencies {
            let (dep_id, _) = parse_key(dep);
            if let Some(&j) = index.get(dep_id) {
                if !deps.contains(&j) {
                    deps.push(j);
                }
            }
        }
        nodes[i].deps = deps;
    }

    Ok(nodes)
}

/// Kahn's algorithm over the arena, smallest discovery index first.
fn topo_order(nodes: &[Node]) -> Result<Vec<usize>> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.deps.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for &d in &node.deps {
            dependents[d].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(current)) = ready.pop() {
        order.push(current);
        for &next in &dependents[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() != nodes.len() {
        let cycle_members: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d > 0)
            .map(|(i, _)| nodes[i].installer.id.as_str())
            .collect();
        return Err(InfraError::Infrastructure(format!(
            "installer dependency cycle detected involving: {}",
            cycle_members.join(", ")
        )));
    }

    Ok(order)
}
