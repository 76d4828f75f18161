//! [`QueryEngine`] – greedy generation conditioned on a loaded memory state.
//!
//! # Querying writes memory
//!
//! A query is **not** read-only.  The prompt's own forward pass and every
//! generation step append traces exactly as ingestion does, so repeated
//! queries keep growing the memory.  The engine takes the state by value and
//! returns the extended state; a caller that wants to inspect memory without
//! keeping the query's contribution clones the state first and discards the
//! returned one.
//!
//! # Steps
//!
//! 1. Run the whole prompt with the current state.
//! 2. Pick the argmax of the final position (ties go to the lowest token id)
//!    and append it to the output.
//! 3. Stop after `max_new_tokens` tokens, or as soon as the end-of-turn token
//!    is picked (it is kept in the output).
//! 4. Otherwise run only the newest token with the carried state and go to 2.
//!
//! # Example
//!
//! ```rust
//! use livemem_model::{ModelConfig, ReferenceModel};
//! use livemem_runtime::query::{QueryEngine, StopReason};
//!
//! let model = ReferenceModel::new(ModelConfig::default()).unwrap();
//! let out = QueryEngine::new(&model)
//!     .max_new_tokens(4)
//!     .run(&[256, 104, 105], None)
//!     .unwrap();
//! assert!(out.tokens.len() <= 4);
//! assert!(!out.state.is_empty());
//! # let _ = StopReason::MaxTokens;
//! ```

use livemem_memory::MemoryState;
use livemem_model::{Logits, ModelError, SequenceModel};
use livemem_types::{DEFAULT_MAX_NEW_TOKENS, LiveMemError, TokenId};
use thiserror::Error;
use tracing::{debug, info};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// A generation step failed.
#[derive(Error, Debug)]
#[error("query failed at step {step}: {source}")]
pub struct QueryError {
    /// Number of tokens generated before the failure.
    pub step: usize,
    /// Tokens generated before the failure.
    pub generated: Vec<TokenId>,
    /// State after the last successful step (`None` if the prompt pass failed
    /// on a session that started without a state).
    pub state: Option<MemoryState>,
    #[source]
    pub source: ModelError,
}

impl From<QueryError> for LiveMemError {
    fn from(e: QueryError) -> Self {
        match e.source {
            ModelError::State(inner) => inner.into(),
            other => LiveMemError::ModelFailure {
                at: None,
                details: format!("step {}: {other}", e.step),
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The generation budget was exhausted.
    MaxTokens,
    /// The end-of-turn token was produced.
    EndOfTurn,
    /// The prompt was empty, so there was nothing to continue from.
    EmptyPrompt,
}

#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub tokens: Vec<TokenId>,
    /// Authoritative state after the query, including its own traces.
    pub state: MemoryState,
    pub stop: StopReason,
}

// ─────────────────────────────────────────────────────────────────────────────
// QueryEngine
// ─────────────────────────────────────────────────────────────────────────────

pub struct QueryEngine<'m> {
    model: &'m dyn SequenceModel,
    max_new_tokens: usize,
    eot_token: Option<TokenId>,
    on_token: Option<Box<dyn FnMut(TokenId) + 'm>>,
}

impl<'m> QueryEngine<'m> {
    pub fn new(model: &'m dyn SequenceModel) -> Self {
        Self {
            model,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            eot_token: None,
            on_token: None,
        }
    }

    pub fn max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Stop as soon as `token` is generated.
    pub fn eot_token(mut self, token: TokenId) -> Self {
        self.eot_token = Some(token);
        self
    }

    /// Receive every token as soon as it is picked.
    pub fn on_token(mut self, callback: impl FnMut(TokenId) + 'm) -> Self {
        self.on_token = Some(Box::new(callback));
        self
    }

    fn step(
        &self,
        tokens: &[TokenId],
        state: &mut Option<MemoryState>,
        generated: &mut Vec<TokenId>,
    ) -> Result<Logits, QueryError> {
        // a failed step leaves the last good state in place
        self.model
            .extend_state(tokens, state)
            .map_err(|source| QueryError {
                step: generated.len(),
                generated: std::mem::take(generated),
                state: state.take(),
                source,
            })
    }

    /// Generate a continuation of `prompt` from `state`.
    pub fn run(
        &mut self,
        prompt: &[TokenId],
        state: Option<MemoryState>,
    ) -> Result<QueryOutput, QueryError> {
        let traces_before = state.as_ref().map_or(0, MemoryState::len);
        let mut state = state;
        let mut generated = Vec::new();

        let mut logits = self.step(prompt, &mut state, &mut generated)?;
        let stop = loop {
            if generated.len() >= self.max_new_tokens {
                break StopReason::MaxTokens;
            }
            let Some(next) = logits.argmax_last() else {
                break StopReason::EmptyPrompt;
            };
            generated.push(next);
            if let Some(callback) = self.on_token.as_mut() {
                callback(next);
            }
            if self.eot_token == Some(next) {
                break StopReason::EndOfTurn;
            }
            if generated.len() >= self.max_new_tokens {
                break StopReason::MaxTokens;
            }
            logits = self.step(&[next], &mut state, &mut generated)?;
        };

        // `step` always leaves a state behind after the prompt pass.
        let state = match state {
            Some(state) => state,
            None => MemoryState::new(self.model.config().width),
        };
        info!(
            prompt = prompt.len(),
            generated = generated.len(),
            traces_before,
            traces_after = state.len(),
            stop = ?stop,
            "query complete"
        );
        Ok(QueryOutput {
            tokens: generated,
            state,
            stop,
        })
    }
}

/// Generate up to `max_new_tokens` tokens after `prompt`, returning them with
/// the extended state.
pub fn query(
    model: &dyn SequenceModel,
    prompt: &[TokenId],
    state: Option<MemoryState>,
    max_new_tokens: usize,
) -> Result<(Vec<TokenId>, MemoryState), QueryError> {
    let out = QueryEngine::new(model)
        .max_new_tokens(max_new_tokens)
        .run(prompt, state)?;
    Ok((out.tokens, out.state))
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// A multi-turn conversation that keeps one memory state across turns.
pub struct Session<'m> {
    model: &'m dyn SequenceModel,
    state: Option<MemoryState>,
    max_new_tokens: usize,
    eot_token: Option<TokenId>,
    turns: usize,
}

impl<'m> Session<'m> {
    pub fn new(model: &'m dyn SequenceModel, state: Option<MemoryState>) -> Self {
        Self {
            model,
            state,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            eot_token: None,
            turns: 0,
        }
    }

    pub fn max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn eot_token(mut self, token: TokenId) -> Self {
        self.eot_token = Some(token);
        self
    }

    /// Run one turn, streaming tokens to `on_token`.
    ///
    /// On failure the session keeps the state of the last successful step,
    /// so the next turn continues from there.
    pub fn turn(
        &mut self,
        prompt: &[TokenId],
        on_token: impl FnMut(TokenId),
    ) -> Result<QueryOutput, QueryError> {
        let mut engine = QueryEngine::new(self.model)
            .max_new_tokens(self.max_new_tokens)
            .on_token(on_token);
        if let Some(eot) = self.eot_token {
            engine = engine.eot_token(eot);
        }
        match engine.run(prompt, self.state.take()) {
            Ok(out) => {
                self.state = Some(out.state.clone());
                self.turns += 1;
                debug!(turn = self.turns, traces = out.state.len(), "turn complete");
                Ok(out)
            }
            Err(mut err) => {
                self.state = err.state.take();
                Err(err)
            }
        }
    }

    pub fn state(&self) -> Option<&MemoryState> {
        self.state.as_ref()
    }

    pub fn turns(&self) -> usize {
        self.turns
    }
}
