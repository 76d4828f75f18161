//! `livemem-memory` – the live memory record and everything that touches it
//! outside the model.
//!
//! # Modules
//!
//! - [`state`] – [`MemoryState`][state::MemoryState]: the append-only record
//!   of traces plus an optional consolidated summary, with structural
//!   validation.
//! - [`consolidation`] – [`ConsolidationPolicy`][consolidation::ConsolidationPolicy]
//!   and its implementations, run by the model at the end of every forward
//!   call to fold traces into the consolidated vector.
//! - [`persist`] – [`save`][persist::save] / [`load`][persist::load]: a
//!   single-file, checksummed binary container that round-trips a state
//!   bit-for-bit without needing the model.

pub mod consolidation;
pub mod persist;
pub mod state;

pub use consolidation::{ConsolidationConfig, ConsolidationEvent, ConsolidationPolicy};
pub use persist::PersistError;
pub use state::{MemoryState, StateError, StateSummary, Trace};
