//! The sequence model contract consumed by ingestion and query.
//!
//! The model is a black box exposing
//!
//! ```text
//! forward(tokens, state, return_state) -> (logits, state_or_none)
//! ```
//!
//! * With `return_state == false` the returned state is always `None`.
//! * With `return_state == true` a state is always returned, even for an
//!   empty window; a `None` input state is initialised to an empty record.
//! * The returned state is authoritative.  Implementations may reuse the
//!   input allocation, but callers must only ever continue from the value
//!   handed back.
//!
//! Callers that must keep the last good state across a failure use
//! [`SequenceModel::extend_state`] instead, which leaves its argument as it
//! was when the call fails.

use livemem_memory::{MemoryState, StateError};
use livemem_types::{LiveMemError, TokenId};
use thiserror::Error;

use crate::config::ModelConfig;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Failures of a single forward call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("token {token} at position {position} is outside the vocabulary of {vocab_size}")]
    TokenOutOfRange {
        token: TokenId,
        position: usize,
        vocab_size: usize,
    },
    #[error("window of {len} tokens exceeds the model limit of {max}")]
    SequenceTooLong { len: usize, max: usize },
    #[error("invalid input state: {0}")]
    State(#[from] StateError),
    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),
}

impl From<ModelError> for LiveMemError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::State(inner) => inner.into(),
            ModelError::InvalidConfig(msg) => LiveMemError::InvalidArgument(msg),
            other => LiveMemError::ModelFailure {
                at: None,
                details: other.to_string(),
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logits
// ─────────────────────────────────────────────────────────────────────────────

/// Next-token scores, row-major `[positions, vocab_size]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Logits {
    data: Vec<f32>,
    vocab_size: usize,
}

impl Logits {
    pub fn new(data: Vec<f32>, vocab_size: usize) -> Self {
        debug_assert!(vocab_size > 0 && data.len() % vocab_size == 0);
        Self { data, vocab_size }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Number of positions scored.
    pub fn positions(&self) -> usize {
        self.data.len() / self.vocab_size
    }

    pub fn row(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.vocab_size)?;
        self.data.get(start..start + self.vocab_size)
    }

    pub fn last_row(&self) -> Option<&[f32]> {
        self.positions().checked_sub(1).and_then(|p| self.row(p))
    }

    /// Greedy choice at the final position.  Ties go to the lowest token id.
    pub fn argmax_last(&self) -> Option<TokenId> {
        let row = self.last_row()?;
        let mut best = 0usize;
        for (i, &score) in row.iter().enumerate().skip(1) {
            if score > row[best] {
                best = i;
            }
        }
        TokenId::try_from(best).ok()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SequenceModel
// ─────────────────────────────────────────────────────────────────────────────

/// Result of one forward call.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    pub logits: Logits,
    /// `Some` exactly when the call was made with `return_state = true`.
    pub state: Option<MemoryState>,
}

/// A frozen autoregressive model that reads and extends a [`MemoryState`].
///
/// Models are immutable and shared by reference; every call is synchronous.
pub trait SequenceModel: Send + Sync {
    fn config(&self) -> &ModelConfig;

    fn forward(
        &self,
        tokens: &[TokenId],
        state: Option<MemoryState>,
        return_state: bool,
    ) -> Result<ForwardOutput, ModelError>;

    /// Convenience for callers that always thread state: returns the logits
    /// and the new state.
    fn forward_with_state(
        &self,
        tokens: &[TokenId],
        state: Option<MemoryState>,
    ) -> Result<(Logits, MemoryState), ModelError> {
        let out = self.forward(tokens, state, true)?;
        let state = match out.state {
            Some(state) => state,
            None => MemoryState::new(self.config().width),
        };
        Ok((out.logits, state))
    }

    /// Extend `state` in place and return the logits.
    ///
    /// On error `state` is exactly what it was before the call.  The default
    /// keeps a copy of the input for that, which costs one full copy of the
    /// record per call; models that finish every check before touching the
    /// state should override it.
    fn extend_state(
        &self,
        tokens: &[TokenId],
        state: &mut Option<MemoryState>,
    ) -> Result<Logits, ModelError> {
        let (logits, next) = self.forward_with_state(tokens, state.clone())?;
        *state = Some(next);
        Ok(logits)
    }
}
