//! The memory state record carried between model invocations.
//!
//! A [`MemoryState`] holds two kinds of memory:
//!
//! * **traces** – an ordered list of fixed-width vectors, one per compression
//!   event, in the order the content was ingested.
//! * **consolidated** – an optional single vector summarising some or all of
//!   the traces, present only after a consolidation event.
//!
//! The record is deliberately a plain value.  Forward calls take it by value
//! and hand back a new one; the returned value is always the authoritative
//! state, so a caller that wants to discard a query's contribution simply
//! keeps a clone of the previous value.
//!
//! # Example
//!
//! ```rust
//! use livemem_memory::state::{MemoryState, Trace};
//!
//! let mut state = MemoryState::new(4);
//! state.push_trace(Trace::new(vec![0.5, 0.5, 0.0, 1.0])).unwrap();
//! assert_eq!(state.len(), 1);
//! assert!(state.consolidated().is_none());
//! assert!(state.validate().is_ok());
//! ```

use livemem_types::{LiveMemError, STATE_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Structural violations of a [`MemoryState`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("state width must be non-zero")]
    ZeroWidth,
    #[error("trace {index} has {found} elements, expected {expected}")]
    Malformed {
        index: usize,
        expected: usize,
        found: usize,
    },
    #[error("consolidated vector has {found} elements, expected {expected}")]
    MalformedConsolidated { expected: usize, found: usize },
    #[error("non-finite value in {location}")]
    NonFinite { location: String },
    #[error("state width {found} does not match model width {expected}")]
    WidthMismatch { expected: usize, found: usize },
    #[error("unsupported state schema version {0}")]
    UnsupportedVersion(u16),
}

impl From<StateError> for LiveMemError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::WidthMismatch { .. } => LiveMemError::ConfigMismatch(e.to_string()),
            other => LiveMemError::MalformedState(other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trace
// ─────────────────────────────────────────────────────────────────────────────

/// One compressed snapshot of ingested content emitted by a memory layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trace(Vec<f32>);

impl Trace {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn width(&self) -> usize {
        self.0.len()
    }

    /// Arithmetic mean of the elements, `0.0` for an empty trace.
    pub fn mean(&self) -> f32 {
        if self.0.is_empty() {
            0.0
        } else {
            self.0.iter().sum::<f32>() / self.0.len() as f32
        }
    }
}

impl From<Vec<f32>> for Trace {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryState
// ─────────────────────────────────────────────────────────────────────────────

/// Append-only record of compressed history carried between forward calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryState {
    schema_version: u16,
    width: usize,
    traces: Vec<Trace>,
    consolidated: Option<Vec<f32>>,
}

impl MemoryState {
    /// An empty record for a model of hidden width `width`.
    pub fn new(width: usize) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            width,
            traces: Vec::new(),
            consolidated: None,
        }
    }

    /// Assemble a state from raw parts without checking them.
    ///
    /// Structural problems are reported by [`MemoryState::validate`], which
    /// the model and the persistence layer call at the point of use.
    pub fn from_parts(width: usize, traces: Vec<Trace>, consolidated: Option<Vec<f32>>) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            width,
            traces,
            consolidated,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_schema_version(mut self, version: u16) -> Self {
        self.schema_version = version;
        self
    }

    pub fn schema_version(&self) -> u16 {
        self.schema_version
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn traces(&self) -> &[Trace] {
        &self.traces
    }

    pub fn consolidated(&self) -> Option<&[f32]> {
        self.consolidated.as_deref()
    }

    /// Number of traces currently held.
    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Append a trace.  This is the only way new memory enters a state.
    pub fn push_trace(&mut self, trace: Trace) -> Result<(), StateError> {
        if trace.width() != self.width {
            return Err(StateError::Malformed {
                index: self.traces.len(),
                expected: self.width,
                found: trace.width(),
            });
        }
        self.traces.push(trace);
        Ok(())
    }

    /// Remove the oldest `count` traces and return them, oldest first.
    ///
    /// Only consolidation policies prune traces.
    pub(crate) fn drain_oldest(&mut self, count: usize) -> Vec<Trace> {
        let count = count.min(self.traces.len());
        self.traces.drain(..count).collect()
    }

    pub(crate) fn set_consolidated(&mut self, summary: Vec<f32>) {
        self.consolidated = Some(summary);
    }

    /// Check every structural invariant of the record.
    pub fn validate(&self) -> Result<(), StateError> {
        if self.schema_version != STATE_SCHEMA_VERSION {
            return Err(StateError::UnsupportedVersion(self.schema_version));
        }
        if self.width == 0 {
            return Err(StateError::ZeroWidth);
        }
        for (index, trace) in self.traces.iter().enumerate() {
            if trace.width() != self.width {
                return Err(StateError::Malformed {
                    index,
                    expected: self.width,
                    found: trace.width(),
                });
            }
            if trace.as_slice().iter().any(|v| !v.is_finite()) {
                return Err(StateError::NonFinite {
                    location: format!("trace {index}"),
                });
            }
        }
        if let Some(summary) = &self.consolidated {
            if summary.len() != self.width {
                return Err(StateError::MalformedConsolidated {
                    expected: self.width,
                    found: summary.len(),
                });
            }
            if summary.iter().any(|v| !v.is_finite()) {
                return Err(StateError::NonFinite {
                    location: "consolidated".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Fail unless the state was produced for a model of width `expected`.
    pub fn ensure_width(&self, expected: usize) -> Result<(), StateError> {
        if self.width != expected {
            return Err(StateError::WidthMismatch {
                expected,
                found: self.width,
            });
        }
        Ok(())
    }

    /// A short description of the record for logs and the CLI.
    pub fn summary(&self) -> StateSummary {
        StateSummary {
            schema_version: self.schema_version,
            width: self.width,
            trace_count: self.traces.len(),
            last_trace_mean: self.traces.last().map(Trace::mean),
            consolidated_norm: self
                .consolidated
                .as_ref()
                .map(|c| c.iter().map(|v| v * v).sum::<f32>().sqrt()),
        }
    }
}

/// Inspection view of a [`MemoryState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSummary {
    pub schema_version: u16,
    pub width: usize,
    pub trace_count: usize,
    /// Mean of the newest trace, if any.
    pub last_trace_mean: Option<f32>,
    /// L2 norm of the consolidated vector, if present.
    pub consolidated_norm: Option<f32>,
}

impl std::fmt::Display for StateSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} traces (width {})", self.trace_count, self.width)?;
        if let Some(mean) = self.last_trace_mean {
            write!(f, ", last trace mean {mean:.4}")?;
        }
        if let Some(norm) = self.consolidated_norm {
            write!(f, ", consolidated norm {norm:.4}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(values: &[f32]) -> Trace {
        Trace::new(values.to_vec())
    }

    #[test]
    fn new_state_is_empty_and_valid() {
        let state = MemoryState::new(8);
        assert!(state.is_empty());
        assert_eq!(state.width(), 8);
        assert_eq!(state.schema_version(), STATE_SCHEMA_VERSION);
        assert!(state.consolidated().is_none());
        assert!(state.validate().is_ok());
    }

    #[test]
    fn push_trace_preserves_insertion_order() {
        let mut state = MemoryState::new(2);
        state.push_trace(trace(&[1.0, 0.0])).unwrap();
        state.push_trace(trace(&[0.0, 1.0])).unwrap();
        assert_eq!(state.traces()[0].as_slice(), &[1.0, 0.0]);
        assert_eq!(state.traces()[1].as_slice(), &[0.0, 1.0]);
    }

    #[test]
    fn push_trace_rejects_wrong_width() {
        let mut state = MemoryState::new(3);
        let err = state.push_trace(trace(&[1.0])).unwrap_err();
        assert_eq!(
            err,
            StateError::Malformed { index: 0, expected: 3, found: 1 }
        );
        assert!(state.is_empty());
    }

    #[test]
    fn validate_reports_first_malformed_trace() {
        let state = MemoryState::from_parts(
            2,
            vec![trace(&[1.0, 2.0]), trace(&[1.0, 2.0, 3.0])],
            None,
        );
        assert_eq!(
            state.validate().unwrap_err(),
            StateError::Malformed { index: 1, expected: 2, found: 3 }
        );
    }

    #[test]
    fn validate_rejects_bad_consolidated() {
        let state = MemoryState::from_parts(2, vec![], Some(vec![1.0]));
        assert!(matches!(
            state.validate().unwrap_err(),
            StateError::MalformedConsolidated { expected: 2, found: 1 }
        ));
    }

    #[test]
    fn validate_rejects_non_finite_values() {
        let state = MemoryState::from_parts(2, vec![trace(&[f32::NAN, 0.0])], None);
        assert!(matches!(state.validate().unwrap_err(), StateError::NonFinite { .. }));
    }

    #[test]
    fn validate_rejects_zero_width() {
        assert_eq!(MemoryState::new(0).validate().unwrap_err(), StateError::ZeroWidth);
    }

    #[test]
    fn validate_rejects_unknown_schema_version() {
        let state = MemoryState::new(2).with_schema_version(99);
        assert_eq!(state.validate().unwrap_err(), StateError::UnsupportedVersion(99));
    }

    #[test]
    fn ensure_width_detects_mismatch() {
        let state = MemoryState::new(32);
        assert!(state.ensure_width(32).is_ok());
        assert_eq!(
            state.ensure_width(64).unwrap_err(),
            StateError::WidthMismatch { expected: 64, found: 32 }
        );
    }

    #[test]
    fn width_mismatch_maps_to_config_mismatch() {
        let err: LiveMemError = StateError::WidthMismatch { expected: 64, found: 32 }.into();
        assert!(matches!(err, LiveMemError::ConfigMismatch(_)));
    }

    #[test]
    fn summary_reports_last_trace_and_norm() {
        let state = MemoryState::from_parts(
            2,
            vec![trace(&[1.0, 1.0]), trace(&[2.0, 4.0])],
            Some(vec![3.0, 4.0]),
        );
        let summary = state.summary();
        assert_eq!(summary.trace_count, 2);
        assert_eq!(summary.last_trace_mean, Some(3.0));
        assert_eq!(summary.consolidated_norm, Some(5.0));
        assert!(summary.to_string().contains("2 traces"));
    }

    #[test]
    fn clone_is_an_independent_snapshot() {
        let mut state = MemoryState::new(1);
        let snapshot = state.clone();
        state.push_trace(trace(&[1.0])).unwrap();
        assert_eq!(snapshot.len(), 0);
        assert_eq!(state.len(), 1);
    }
}
