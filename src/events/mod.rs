//! WR-012: Runtime status events and their in-process fan-out.

pub mod eventlog;

use crate::core::types::{MachineStatus, RuntimeIdentity, ServerStatus, WorkspaceStatus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Status change published by the control plane or a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    WorkspaceStatus {
        workspace_id: String,
        status: WorkspaceStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous: Option<WorkspaceStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    MachineStatus {
        identity: RuntimeIdentity,
        machine: String,
        status: MachineStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ServerStatus {
        identity: RuntimeIdentity,
        machine: String,
        server: String,
        status: ServerStatus,
        url: String,
    },
    /// Backend observed a runtime dying without a stop request.
    AbnormalStop {
        identity: RuntimeIdentity,
        error: String,
    },
}

impl RuntimeEvent {
    /// Workspace the event belongs to.
    pub fn workspace_id(&self) -> &str {
        match self {
            Self::WorkspaceStatus { workspace_id, .. } => workspace_id,
            Self::MachineStatus { identity, .. }
            | Self::ServerStatus { identity, .. }
            | Self::AbnormalStop { identity, .. } => &identity.workspace_id,
        }
    }
}

/// Broadcast bus for runtime events, optionally mirrored to JSONL logs.
#[derive(Debug, Clone)]
pub struct EventService {
    sender: broadcast::Sender<RuntimeEvent>,
    log_dir: Option<PathBuf>,
}

impl Default for EventService {
    fn default() -> Self {
        Self::new()
    }
}

impl EventService {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sender,
            log_dir: None,
        }
    }

    /// Also append every published event to `<state_dir>/events/<workspace>.jsonl`.
    pub fn with_log(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(state_dir.into());
        self
    }

    /// Publish an event. Never fails when nobody is subscribed.
    pub fn publish(&self, event: RuntimeEvent) {
        if let Some(ref dir) = self.log_dir {
            if let Err(e) = eventlog::append_event(dir, &event) {
                tracing::warn!(error = %e, "cannot append runtime event");
            }
        }
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }
}
