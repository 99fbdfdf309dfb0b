//! wsinfra: workspace runtime infrastructure.
//!
//! Environments are validated and normalized, dispatched by recipe type to a
//! pluggable backend, and driven through a two-phase `prepare`/`start`
//! lifecycle by the control plane. Backends that track their runtimes let the
//! control plane recover them after a restart.

pub mod cli;
pub mod control;
pub mod core;
pub mod events;
pub mod infra;
pub mod transport;
