//! WR-019: Workspace metadata persistence contract and in-memory store.

use crate::core::error::InfraError;
use crate::core::types::Workspace;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DaoError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Server(String),
}

impl From<DaoError> for InfraError {
    fn from(e: DaoError) -> Self {
        match e {
            DaoError::NotFound(m) => InfraError::NotFound(m),
            DaoError::Conflict(m) => InfraError::Conflict(m),
            DaoError::InvalidArgument(m) => InfraError::Validation(m),
            DaoError::Server(m) => InfraError::internal(m),
        }
    }
}

pub type DaoResult<T> = std::result::Result<T, DaoError>;

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub max_items: usize,
    pub skip_count: usize,
    pub total_count: usize,
}

impl<T> Page<T> {
    pub fn has_next_page(&self) -> bool {
        self.skip_count + self.items.len() < self.total_count
    }
}

/// Persistence of workspace metadata.
///
/// Pagination takes `(max_items, skip_count)`; negative values are rejected
/// with `DaoError::InvalidArgument`.
pub trait WorkspaceDao: Send + Sync {
    fn create(&self, workspace: Workspace) -> DaoResult<Workspace>;
    fn update(&self, workspace: Workspace) -> DaoResult<Workspace>;
    fn remove(&self, id: &str) -> DaoResult<Option<Workspace>>;
    fn get(&self, id: &str) -> DaoResult<Workspace>;
    fn get_by_name(&self, name: &str, namespace: &str) -> DaoResult<Workspace>;
    fn get_by_namespace(&self, namespace: &str, max_items: i64, skip_count: i64)
        -> DaoResult<Page<Workspace>>;
    /// Workspaces the user owns (the user's namespace).
    fn get_workspaces(&self, user_id: &str, max_items: i64, skip_count: i64)
        -> DaoResult<Page<Workspace>>;
    fn get_workspaces_by_temporary(
        &self,
        temporary: bool,
        max_items: i64,
        skip_count: i64,
    ) -> DaoResult<Page<Workspace>>;
    fn get_workspaces_total_count(&self) -> DaoResult<u64>;
}

fn check_paging(max_items: i64, skip_count: i64) -> DaoResult<(usize, usize)> {
    if max_items < 0 {
        return Err(DaoError::InvalidArgument(format!(
            "The number of items to return can't be negative, was {}",
            max_items
        )));
    }
    if skip_count < 0 {
        return Err(DaoError::InvalidArgument(format!(
            "The number of items to skip can't be negative, was {}",
            skip_count
        )));
    }
    let max = usize::try_from(max_items).map_err(|e| DaoError::InvalidArgument(e.to_string()))?;
    let skip = usize::try_from(skip_count).map_err(|e| DaoError::InvalidArgument(e.to_string()))?;
    Ok((max, skip))
}

/// `RwLock`-guarded map of workspaces keyed by id.
#[derive(Debug, Default)]
pub struct MemoryWorkspaceDao {
    workspaces: RwLock<BTreeMap<String, Workspace>>,
}

impl MemoryWorkspaceDao {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Workspace>> {
        self.workspaces.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Workspace>> {
        self.workspaces.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn page(
        &self,
        max_items: i64,
        skip_count: i64,
        filter: impl Fn(&Workspace) -> bool,
    ) -> DaoResult<Page<Workspace>> {
        let (max, skip) = check_paging(max_items, skip_count)?;
        let all = self.read();
        let matching: Vec<&Workspace> = all.values().filter(|w| filter(w)).collect();
        Ok(Page {
            items: matching.iter().skip(skip).take(max).map(|w| (*w).clone()).collect(),
            max_items: max,
            skip_count: skip,
            total_count: matching.len(),
        })
    }
}

fn name_taken(
    all: &BTreeMap<String, Workspace>,
    workspace: &Workspace,
) -> bool {
    all.values().any(|w| {
        w.id != workspace.id && w.namespace == workspace.namespace && w.name == workspace.name
    })
}

impl WorkspaceDao for MemoryWorkspaceDao {
    fn create(&self, workspace: Workspace) -> DaoResult<Workspace> {
        let mut all = self.write();
        if all.contains_key(&workspace.id) {
            return Err(DaoError::Conflict(format!(
                "Workspace with id '{}' already exists",
                workspace.id
            )));
        }
        if name_taken(&all, &workspace) {
            return Err(DaoError::Conflict(format!(
                "Workspace with name '{}' in namespace '{}' already exists",
                workspace.name, workspace.namespace
            )));
        }
        all.insert(workspace.id.clone(), workspace.clone());
        Ok(workspace)
    }

    fn update(&self, workspace: Workspace) -> DaoResult<Workspace> {
        let mut all = self.write();
        if !all.contains_key(&workspace.id) {
            return Err(DaoError::NotFound(format!(
                "Workspace with id '{}' was not found",
                workspace.id
            )));
        }
        if name_taken(&all, &workspace) {
            return Err(DaoError::Conflict(format!(
                "Workspace with name '{}' in namespace '{}' already exists",
                workspace.name, workspace.namespace
            )));
        }
        all.insert(workspace.id.clone(), workspace.clone());
        Ok(workspace)
    }

    fn remove(&self, id: &str) -> DaoResult<Option<Workspace>> {
        Ok(self.write().remove(id))
    }

    fn get(&self, id: &str) -> DaoResult<Workspace> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| DaoError::NotFound(format!("Workspace with id '{}' was not found", id)))
    }

    fn get_by_name(&self, name: &str, namespace: &str) -> DaoResult<Workspace> {
        self.read()
            .values()
            .find(|w| w.name == name && w.namespace == namespace)
            .cloned()
            .ok_or_else(|| {
                DaoError::NotFound(format!(
                    "Workspace with name '{}' in namespace '{}' was not found",
                    name, namespace
                ))
            })
    }

    fn get_by_namespace(
        &self,
        namespace: &str,
        max_items: i64,
        skip_count: i64,
    ) -> DaoResult<Page<Workspace>> {
        self.page(max_items, skip_count, |w| w.namespace == namespace)
    }

    fn get_workspaces(
        &self,
        user_id: &str,
        max_items: i64,
        skip_count: i64,
    ) -> DaoResult<Page<Workspace>> {
        self.page(max_items, skip_count, |w| w.namespace == user_id)
    }

    fn get_workspaces_by_temporary(
        &self,
        temporary: bool,
        max_items: i64,
        skip_count: i64,
    ) -> DaoResult<Page<Workspace>> {
        self.page(max_items, skip_count, |w| w.temporary == temporary)
    }

    fn get_workspaces_total_count(&self) -> DaoResult<u64> {
        Ok(self.read().len() as u64)
    }
}
