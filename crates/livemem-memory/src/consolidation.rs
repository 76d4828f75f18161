//! Consolidation policies – folding accumulated traces into one summary.
//!
//! The sequence model runs its configured [`ConsolidationPolicy`] at the end
//! of every forward call.  Ingestion and query loops never trigger it
//! themselves; they only observe its effect on the returned state.
//!
//! Every policy must be:
//!
//! * **pure** – the result depends only on the state passed in;
//! * **idempotent** – running it again with nothing new to fold leaves
//!   `consolidated` unchanged;
//! * **shape preserving** – it only touches `traces` and `consolidated`.
//!
//! Two folding modes are provided.  [`SummarizeAll`] keeps every trace and
//! maintains `consolidated` as their mean.  [`FoldOldest`] prunes the oldest
//! traces once the record grows past a bound and blends their mean into
//! `consolidated`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::state::{MemoryState, Trace};

/// What a consolidation step did to the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationEvent {
    /// Number of traces folded into `consolidated`.
    pub folded: usize,
    /// Number of traces left in the record afterwards.
    pub remaining: usize,
}

/// A policy deciding when and how traces are folded into `consolidated`.
pub trait ConsolidationPolicy: Send + Sync {
    /// Human-readable name used in log lines.
    fn name(&self) -> &str;

    /// Apply the policy.  Returns `None` when the state was left untouched.
    fn consolidate(&self, state: &mut MemoryState) -> Option<ConsolidationEvent>;
}

/// Element-wise mean of `traces`, accumulated in insertion order.
fn mean_of(traces: &[Trace], width: usize) -> Vec<f32> {
    let mut acc = vec![0.0f32; width];
    for trace in traces {
        for (a, v) in acc.iter_mut().zip(trace.as_slice()) {
            *a += v;
        }
    }
    let n = traces.len().max(1) as f32;
    acc.iter_mut().for_each(|a| *a /= n);
    acc
}

// ─────────────────────────────────────────────────────────────────────────────
// Policies
// ─────────────────────────────────────────────────────────────────────────────

/// Never consolidates; `traces` grows with every forward call.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConsolidation;

impl ConsolidationPolicy for NoConsolidation {
    fn name(&self) -> &str {
        "none"
    }

    fn consolidate(&self, _state: &mut MemoryState) -> Option<ConsolidationEvent> {
        None
    }
}

/// Keeps every trace and sets `consolidated` to the mean of the whole record
/// once it holds at least `min_traces` entries.
#[derive(Debug, Clone, Copy)]
pub struct SummarizeAll {
    pub min_traces: usize,
}

impl ConsolidationPolicy for SummarizeAll {
    fn name(&self) -> &str {
        "summarize_all"
    }

    fn consolidate(&self, state: &mut MemoryState) -> Option<ConsolidationEvent> {
        if state.is_empty() || state.len() < self.min_traces {
            return None;
        }
        let summary = mean_of(state.traces(), state.width());
        if state.consolidated() == Some(summary.as_slice()) {
            return None;
        }
        state.set_consolidated(summary);
        let event = ConsolidationEvent {
            folded: state.len(),
            remaining: state.len(),
        };
        debug!(policy = self.name(), folded = event.folded, "summarized trace record");
        Some(event)
    }
}

/// Once the record holds more than `max_traces` entries, removes all but the
/// newest `keep_recent` and blends their mean into `consolidated`:
///
/// ```text
/// consolidated = decay * consolidated + (1 - decay) * mean(folded)
/// ```
///
/// The first fold stores the mean directly.
///
/// The policy sees the record only after each forward call, so the folds it
/// performs depend on how the input was split into calls.  Two ingestions of
/// the same tokens with different chunk sizes keep the same recent traces
/// but generally end with different `consolidated` vectors.
#[derive(Debug, Clone, Copy)]
pub struct FoldOldest {
    pub max_traces: usize,
    pub keep_recent: usize,
    pub decay: f32,
}

impl ConsolidationPolicy for FoldOldest {
    fn name(&self) -> &str {
        "fold_oldest"
    }

    fn consolidate(&self, state: &mut MemoryState) -> Option<ConsolidationEvent> {
        if state.len() <= self.max_traces {
            return None;
        }
        let keep = self.keep_recent.min(self.max_traces);
        let count = state.len() - keep;
        let width = state.width();
        let folded = state.drain_oldest(count);
        let fresh = mean_of(&folded, width);
        let summary = match state.consolidated() {
            Some(previous) => previous
                .iter()
                .zip(&fresh)
                .map(|(p, m)| self.decay * p + (1.0 - self.decay) * m)
                .collect(),
            None => fresh,
        };
        state.set_consolidated(summary);
        let event = ConsolidationEvent {
            folded: folded.len(),
            remaining: state.len(),
        };
        debug!(
            policy = self.name(),
            folded = event.folded,
            remaining = event.remaining,
            "folded oldest traces"
        );
        Some(event)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Serializable selection of a consolidation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsolidationConfig {
    None,
    SummarizeAll {
        #[serde(default = "default_min_traces")]
        min_traces: usize,
    },
    FoldOldest {
        max_traces: usize,
        keep_recent: usize,
        #[serde(default = "default_decay")]
        decay: f32,
    },
}

fn default_min_traces() -> usize {
    8
}

fn default_decay() -> f32 {
    0.9
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        ConsolidationConfig::SummarizeAll {
            min_traces: default_min_traces(),
        }
    }
}

impl ConsolidationConfig {
    /// Reject parameter combinations that cannot satisfy the policy contract.
    pub fn validate(&self) -> Result<(), String> {
        if let ConsolidationConfig::FoldOldest {
            max_traces,
            keep_recent,
            decay,
        } = self
        {
            if keep_recent > max_traces {
                return Err(format!(
                    "fold_oldest: keep_recent ({keep_recent}) exceeds max_traces ({max_traces})"
                ));
            }
            if !(0.0..=1.0).contains(decay) {
                return Err(format!("fold_oldest: decay {decay} outside [0, 1]"));
            }
        }
        Ok(())
    }

    pub fn build(&self) -> Box<dyn ConsolidationPolicy> {
        match *self {
            ConsolidationConfig::None => Box::new(NoConsolidation),
            ConsolidationConfig::SummarizeAll { min_traces } => Box::new(SummarizeAll { min_traces }),
            ConsolidationConfig::FoldOldest {
                max_traces,
                keep_recent,
                decay,
            } => Box::new(FoldOldest {
                max_traces,
                keep_recent,
                decay,
            }),
        }
    }
}
