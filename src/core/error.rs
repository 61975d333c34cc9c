use thiserror::Error;

/// Errors surfaced by the pipeline core.
///
/// Collaborators (HTTP clients, storage backends) speak `anyhow`; the core
/// converts at the seam so callers can match on the category.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed or missing input. Never retried automatically.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Text or image service failure, including timeouts.
    #[error("{service} service error: {message}")]
    Upstream { service: &'static str, message: String },

    #[error("persistence error: {0}")]
    Persistence(String),

    /// A batch stopped at a unit boundary. A normal end state, not a fault.
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        PipelineError::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        PipelineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Wraps a collaborator failure, keeping the full anyhow chain in the message.
    pub fn upstream(service: &'static str, err: impl std::fmt::Display) -> Self {
        PipelineError::Upstream {
            service,
            message: format!("{:#}", err),
        }
    }

    pub fn persistence(err: impl std::fmt::Display) -> Self {
        PipelineError::Persistence(format!("{:#}", err))
    }

    /// Text or image service failures, the only errors that put a run into the
    /// error state. Storage failures are reported but leave the run as it was.
    pub fn is_upstream(&self) -> bool {
        matches!(self, PipelineError::Upstream { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_keeps_context_chain() {
        let err = anyhow::anyhow!("connection reset").context("Gemini API error");
        let wrapped = PipelineError::upstream("text", err);
        assert_eq!(
            wrapped.to_string(),
            "text service error: Gemini API error: connection reset"
        );
        assert!(wrapped.is_upstream());
    }

    #[test]
    fn test_not_found_display() {
        let err = PipelineError::not_found("run", "abc");
        assert_eq!(err.to_string(), "run not found: abc");
    }
}
