//! WR-002: Error taxonomy for the infrastructure control plane.
//!
//! Every variant is an infrastructure error; the variant says who is at fault
//! and whether the caller may distinguish "absent capability" from failure.

use super::types::RuntimeIdentity;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, InfraError>;

#[derive(Debug, Error)]
pub enum InfraError {
    /// Caller-supplied environment or configuration is structurally invalid.
    #[error("{0}")]
    Validation(String),

    /// Backend failure caused by the user's configuration (not logged as an error).
    #[error("{0}")]
    Infrastructure(String),

    /// Unexpected backend-internal failure.
    #[error("{message}")]
    Internal {
        message: String,
        identity: Option<RuntimeIdentity>,
    },

    /// Operation violates the runtime lifecycle.
    #[error("{0}")]
    State(String),

    /// `start()` was cancelled; no runtime exists afterwards.
    #[error("Runtime start for '{0}' was interrupted")]
    StartInterrupted(RuntimeIdentity),

    /// Optional capability is absent.
    #[error("{0} is not supported")]
    NotSupported(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),
}

impl InfraError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            identity: None,
        }
    }

    /// Attach a runtime identity to an internal error. Other variants pass through.
    pub fn with_identity(self, id: &RuntimeIdentity) -> Self {
        match self {
            Self::Internal { message, identity } => Self::Internal {
                message,
                identity: identity.or_else(|| Some(id.clone())),
            },
            other => other,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::StartInterrupted(_))
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }

    /// Identity attached to the error, if any.
    pub fn identity(&self) -> Option<&RuntimeIdentity> {
        match self {
            Self::Internal { identity, .. } => identity.as_ref(),
            Self::StartInterrupted(id) => Some(id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wr002_with_identity_only_touches_internal() {
        let id = RuntimeIdentity::new("ws1", "default", "user1");
        let e = InfraError::internal("boom").with_identity(&id);
        assert!(e.is_internal());
        assert_eq!(e.identity(), Some(&id));
        assert_eq!(e.to_string(), "boom");

        let v = InfraError::Validation("bad".into()).with_identity(&id);
        assert!(v.identity().is_none());
    }

    #[test]
    fn test_wr002_with_identity_keeps_first() {
        let first = RuntimeIdentity::new("ws1", "default", "user1");
        let second = RuntimeIdentity::new("ws2", "default", "user1");
        let e = InfraError::internal("boom")
            .with_identity(&first)
            .with_identity(&second);
        assert_eq!(e.identity(), Some(&first));
    }

    #[test]
    fn test_wr002_interrupted_message() {
        let id = RuntimeIdentity::new("ws1", "default", "user1");
        let e = InfraError::StartInterrupted(id);
        assert!(e.is_interrupted());
        assert!(e.to_string().contains("ws1:default:user1"));
    }

    #[test]
    fn test_wr002_not_supported() {
        let e = InfraError::NotSupported("runtime tracking".into());
        assert!(e.is_not_supported());
        assert_eq!(e.to_string(), "runtime tracking is not supported");
    }
}
