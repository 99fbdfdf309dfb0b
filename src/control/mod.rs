//! Workspace control plane: metadata persistence and runtime lifecycle.

pub mod dao;
pub mod runtimes;
