//! WR-013: Append-only JSONL runtime event log, one file per workspace.

use super::RuntimeEvent;
use crate::core::error::{InfraError, Result};
use crate::core::parser::check_path_component;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// A logged event with its UTC timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RuntimeEvent,
}

/// Derive the event log path for a workspace. Ids that are not a single
/// path component are rejected.
pub fn event_log_path(state_dir: &Path, workspace_id: &str) -> Result<PathBuf> {
    check_path_component("workspace id", workspace_id)?;
    Ok(state_dir
        .join("events")
        .join(format!("{}.jsonl", workspace_id)))
}

/// Append an event to its workspace's event log.
pub fn append_event(state_dir: &Path, event: &RuntimeEvent) -> Result<()> {
    let path = event_log_path(state_dir, event.workspace_id())?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            InfraError::internal(format!("cannot create {}: {}", parent.display(), e))
        })?;
    }

    let te = TimestampedEvent {
        ts: Utc::now(),
        event: event.clone(),
    };
    let json = serde_json::to_string(&te)
        .map_err(|e| InfraError::internal(format!("JSON serialize error: {}", e)))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| {
            InfraError::internal(format!("cannot open event log {}: {}", path.display(), e))
        })?;
    writeln!(file, "{}", json)
        .map_err(|e| InfraError::internal(format!("write error {}: {}", path.display(), e)))?;

    Ok(())
}

/// Read a workspace's event log. A missing log is empty.
pub fn read_events(state_dir: &Path, workspace_id: &str) -> Result<Vec<TimestampedEvent>> {
    let path = event_log_path(state_dir, workspace_id)?;
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| InfraError::internal(format!("cannot read {}: {}", path.display(), e)))?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| {
                InfraError::internal(format!("corrupt event in {}: {}", path.display(), e))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{MachineStatus, RuntimeIdentity, WorkspaceStatus};

    #[test]
    fn test_wr013_event_log_path() {
        let p = event_log_path(Path::new("/state"), "ws1").unwrap();
        assert_eq!(p, PathBuf::from("/state/events/ws1.jsonl"));
    }

    #[test]
    fn test_wr013_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let id = RuntimeIdentity::new("ws1", "default", "user1");
        append_event(
            dir.path(),
            &RuntimeEvent::MachineStatus {
                identity: id.clone(),
                machine: "dev".into(),
                status: MachineStatus::Running,
                error: None,
            },
        )
        .unwrap();
        append_event(
            dir.path(),
            &RuntimeEvent::WorkspaceStatus {
                workspace_id: "ws1".into(),
                status: WorkspaceStatus::Running,
                previous: Some(WorkspaceStatus::Starting),
                error: None,
            },
        )
        .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("events/ws1.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.contains("machine_status"));
        assert!(raw.contains(r#""ts":"#));

        let events = read_events(dir.path(), "ws1").unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].ts <= events[1].ts);
        assert!(matches!(events[0].event, RuntimeEvent::MachineStatus { .. }));
    }

    #[test]
    fn test_wr013_read_missing_log() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_events(dir.path(), "nope").unwrap().is_empty());
    }

    #[test]
    fn test_wr013_escaping_workspace_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");
        let event = RuntimeEvent::WorkspaceStatus {
            workspace_id: "../../escaped".into(),
            status: WorkspaceStatus::Starting,
            previous: None,
            error: None,
        };
        let err = append_event(&state, &event).unwrap_err();
        assert!(matches!(err, InfraError::Validation(_)));
        assert!(!dir.path().join("escaped.jsonl").exists());
        assert!(!state.exists());

        for bad in ["", ".", "..", "a/b", "a\\b"] {
            assert!(event_log_path(&state, bad).is_err(), "{bad:?} accepted");
        }
        assert!(read_events(&state, "../x").is_err());
    }
}
