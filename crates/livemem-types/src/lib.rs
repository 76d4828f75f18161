use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a single token in the model vocabulary.
pub type TokenId = u32;

/// Version tag written into every persisted memory state.
///
/// Bump this whenever the on-disk layout or the meaning of a state field
/// changes; loaders reject versions they do not understand.
pub const STATE_SCHEMA_VERSION: u16 = 1;

/// Default number of tokens fed to the model per ingestion window.
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Default generation budget for a single query turn.
pub const DEFAULT_MAX_NEW_TOKENS: usize = 50;

/// Where in a long-running session a failure happened.
///
/// Carried by ingestion and query failures so the caller can resume from the
/// last completed chunk boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    /// Index of the window that failed (or was not started).
    pub chunk_index: usize,
    /// Offset of the first token of that window in the full input.
    pub token_offset: usize,
}

impl std::fmt::Display for ResumePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chunk {} (token offset {})", self.chunk_index, self.token_offset)
    }
}

/// Top-level error taxonomy shared by every livemem crate.
///
/// Library crates keep their own precise error enums; they all convert into
/// this one so binaries can report a single, stable category.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiveMemError {
    /// A loaded state does not fit the configured model.
    #[error("Configuration mismatch: {0}")]
    ConfigMismatch(String),

    /// The persisted state file does not exist.
    #[error("Memory state not found: {0}")]
    StateNotFound(String),

    /// The persisted state file exists but cannot be decoded.
    #[error("Corrupt memory state: {0}")]
    CorruptState(String),

    /// A state value violates its structural invariants.
    #[error("Malformed memory state: {0}")]
    MalformedState(String),

    /// The sequence model failed; the session may be resumed at `at`.
    #[error("Model execution failed{}: {details}", location(.at))]
    ModelFailure {
        at: Option<ResumePoint>,
        details: String,
    },

    /// The caller interrupted a session between two chunks.
    #[error("Cancelled at {0}")]
    Cancelled(ResumePoint),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

fn location(at: &Option<ResumePoint>) -> String {
    at.as_ref().map(|p| format!(" at {p}")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_point_display_names_chunk_and_offset() {
        let at = ResumePoint { chunk_index: 3, token_offset: 1536 };
        assert_eq!(at.to_string(), "chunk 3 (token offset 1536)");
    }

    #[test]
    fn error_serialization_roundtrip() {
        let err = LiveMemError::ModelFailure {
            at: Some(ResumePoint { chunk_index: 1, token_offset: 512 }),
            details: "sequence too long".to_string(),
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: LiveMemError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }

    #[test]
    fn error_display() {
        let err = LiveMemError::ConfigMismatch("width 32 != 64".to_string());
        assert!(err.to_string().contains("Configuration mismatch"));

        let err = LiveMemError::Cancelled(ResumePoint { chunk_index: 2, token_offset: 8 });
        assert!(err.to_string().contains("token offset 8"));
    }

    #[test]
    fn model_failure_names_the_chunk_in_plain_words() {
        let err = LiveMemError::ModelFailure {
            at: Some(ResumePoint { chunk_index: 1, token_offset: 512 }),
            details: "sequence too long".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Model execution failed at chunk 1 (token offset 512): sequence too long"
        );

        let err = LiveMemError::ModelFailure { at: None, details: "boom".to_string() };
        assert_eq!(err.to_string(), "Model execution failed: boom");
    }
}
