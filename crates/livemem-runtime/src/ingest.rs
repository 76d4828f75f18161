//! [`Ingestor`] – feeds an arbitrarily long token stream through the model in
//! bounded windows, threading the memory state from one window to the next.
//!
//! # Algorithm
//!
//! The input is split into contiguous, non-overlapping windows of at most
//! `chunk_size` tokens.  Each window is run with the state returned by the
//! previous one (the first window gets the initial state, usually `None`).
//! Logits are discarded; only the state evolution matters.
//!
//! Ingestion advances one whole window at a time and never retries.  When the
//! model fails, or the cancel flag is raised between two windows, the error
//! carries the [`ResumePoint`] of the window that did not complete together
//! with the state after the last window that did.  Passing both back to
//! [`Ingestor::resume`] continues exactly where the session stopped.
//!
//! # Example
//!
//! ```rust
//! use livemem_model::{ModelConfig, ReferenceModel};
//! use livemem_runtime::ingest::Ingestor;
//!
//! let model = ReferenceModel::new(ModelConfig::default()).unwrap();
//! let tokens: Vec<u32> = (0..200).map(|i| i % 256).collect();
//!
//! let state = Ingestor::new(&model).chunk_size(64).ingest(&tokens, None).unwrap();
//! assert!(!state.is_empty());
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use livemem_memory::MemoryState;
use livemem_model::{ModelError, SequenceModel};
use livemem_types::{DEFAULT_CHUNK_SIZE, LiveMemError, ResumePoint, TokenId};
use thiserror::Error;
use tracing::{info, instrument, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that stop an ingestion session.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("chunk size must be positive")]
    InvalidChunkSize,

    #[error("resume offset {offset} lies beyond the {len}-token input")]
    InvalidResumeOffset { offset: usize, len: usize },

    /// The model failed on the window starting at `at.token_offset`.
    #[error("model failed on {at}: {source}")]
    Chunk {
        at: ResumePoint,
        /// State after the last completed window (`None` if none completed
        /// and the session started without a state).
        resume_state: Option<MemoryState>,
        #[source]
        source: ModelError,
    },

    /// The cancel flag was raised before the window at `at` started.
    #[error("ingestion cancelled before {at}")]
    Cancelled {
        at: ResumePoint,
        resume_state: Option<MemoryState>,
    },
}

impl IngestError {
    /// Where to restart the session, if it can be restarted.
    pub fn resume_point(&self) -> Option<ResumePoint> {
        match self {
            IngestError::Chunk { at, .. } | IngestError::Cancelled { at, .. } => Some(*at),
            _ => None,
        }
    }

    /// Take the last good state out of the error.
    pub fn into_resume_state(self) -> Option<MemoryState> {
        match self {
            IngestError::Chunk { resume_state, .. } | IngestError::Cancelled { resume_state, .. } => {
                resume_state
            }
            _ => None,
        }
    }
}

impl From<IngestError> for LiveMemError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Chunk { at, source, .. } => match source {
                ModelError::State(inner) => inner.into(),
                other => LiveMemError::ModelFailure {
                    at: Some(at),
                    details: other.to_string(),
                },
            },
            IngestError::Cancelled { at, .. } => LiveMemError::Cancelled(at),
            other => LiveMemError::InvalidArgument(other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Progress
// ─────────────────────────────────────────────────────────────────────────────

/// Reported after every completed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub chunk_index: usize,
    /// First token of the window (inclusive).
    pub start: usize,
    /// One past the last token of the window.
    pub end: usize,
    /// Length of the whole input.
    pub total: usize,
    /// Traces held by the state after this window.
    pub trace_count: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Ingestor
// ─────────────────────────────────────────────────────────────────────────────

/// Chunked ingestion engine.
///
/// Borrows the model for the duration of the session; the model itself is
/// never mutated.
pub struct Ingestor<'m> {
    model: &'m dyn SequenceModel,
    chunk_size: usize,
    cancel: Option<Arc<AtomicBool>>,
    on_chunk: Option<Box<dyn FnMut(&ChunkProgress) + 'm>>,
}

impl<'m> Ingestor<'m> {
    /// An ingestor with the default window of [`DEFAULT_CHUNK_SIZE`] tokens.
    pub fn new(model: &'m dyn SequenceModel) -> Self {
        Self {
            model,
            chunk_size: DEFAULT_CHUNK_SIZE,
            cancel: None,
            on_chunk: None,
        }
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Stop between windows once `flag` is set.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Observe every completed window.
    pub fn on_chunk(mut self, callback: impl FnMut(&ChunkProgress) + 'm) -> Self {
        self.on_chunk = Some(Box::new(callback));
        self
    }

    /// Ingest `tokens` from the beginning, starting from `initial`.
    ///
    /// An empty input returns `initial` untouched, or a freshly initialised
    /// empty state when `initial` is `None`.
    pub fn ingest(
        &mut self,
        tokens: &[TokenId],
        initial: Option<MemoryState>,
    ) -> Result<MemoryState, IngestError> {
        self.resume(tokens, 0, initial)
    }

    /// Continue ingesting `tokens` from `offset` with the state recovered from
    /// an earlier, interrupted session.
    ///
    /// `offset` should be the `token_offset` of the reported [`ResumePoint`],
    /// so that window boundaries line up with the original session.
    #[instrument(skip_all, fields(tokens = tokens.len(), offset = offset, chunk_size = self.chunk_size))]
    pub fn resume(
        &mut self,
        tokens: &[TokenId],
        offset: usize,
        state: Option<MemoryState>,
    ) -> Result<MemoryState, IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkSize);
        }
        if offset > tokens.len() {
            return Err(IngestError::InvalidResumeOffset {
                offset,
                len: tokens.len(),
            });
        }

        let total = tokens.len();
        let first_chunk = offset / self.chunk_size;
        info!(
            total,
            remaining = total - offset,
            chunk_size = self.chunk_size,
            "ingesting tokens"
        );

        let mut current = state;
        for (i, start) in (offset..total).step_by(self.chunk_size).enumerate() {
            let at = ResumePoint {
                chunk_index: first_chunk + i,
                token_offset: start,
            };
            if self.cancel.as_ref().is_some_and(|c| c.load(Ordering::SeqCst)) {
                warn!(%at, "ingestion cancelled");
                return Err(IngestError::Cancelled {
                    at,
                    resume_state: current,
                });
            }

            let end = (start + self.chunk_size).min(total);
            // A failed window leaves `current` as the last good state.
            self.model
                .extend_state(&tokens[start..end], &mut current)
                .map_err(|source| IngestError::Chunk {
                    at,
                    resume_state: current.take(),
                    source,
                })?;
            let traces = current.as_ref().map_or(0, MemoryState::len);

            info!(
                chunk = at.chunk_index,
                traces,
                consolidated = current.as_ref().is_some_and(|s| s.consolidated().is_some()),
                "Processed chunk {start}-{end}"
            );
            if let Some(callback) = self.on_chunk.as_mut() {
                callback(&ChunkProgress {
                    chunk_index: at.chunk_index,
                    start,
                    end,
                    total,
                    trace_count: traces,
                });
            }
        }

        match current {
            Some(state) => Ok(state),
            None => self
                .model
                .forward_with_state(&[], None)
                .map(|(_, state)| state)
                .map_err(|source| IngestError::Chunk {
                    at: ResumePoint {
                        chunk_index: first_chunk,
                        token_offset: offset,
                    },
                    resume_state: None,
                    source,
                }),
        }
    }
}

/// Ingest `tokens` in windows of `chunk_size`, starting from `initial`.
pub fn ingest(
    model: &dyn SequenceModel,
    tokens: &[TokenId],
    chunk_size: usize,
    initial: Option<MemoryState>,
) -> Result<MemoryState, IngestError> {
    Ingestor::new(model).chunk_size(chunk_size).ingest(tokens, initial)
}
