//! `livemem-runtime` – drives a [`SequenceModel`][livemem_model::SequenceModel]
//! through the memory state lifecycle.
//!
//! # Modules
//!
//! - [`ingest`] – [`Ingestor`][ingest::Ingestor]: splits an arbitrarily long
//!   token stream into bounded windows and threads the state through them,
//!   reporting a [`ResumePoint`][livemem_types::ResumePoint] on failure or
//!   cancellation.
//! - [`query`] – [`QueryEngine`][query::QueryEngine] and
//!   [`Session`][query::Session]: greedy generation conditioned on a loaded
//!   state.  Queries extend the state they run on.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: initialises
//!   the global `tracing` subscriber with an optional OTLP span exporter.
//!
//! # Lifecycle
//!
//! ```text
//! tokens ──ingest──▶ MemoryState ──save──▶ file ──load──▶ MemoryState ──query──▶ text
//!                                                             ▲                 │
//!                                                             └─── extended ────┘
//! ```

pub mod ingest;
pub mod query;
pub mod telemetry;

pub use ingest::{ChunkProgress, IngestError, Ingestor};
pub use query::{QueryEngine, QueryError, QueryOutput, Session, StopReason};
pub use telemetry::{TracerProviderGuard, init_tracing};
