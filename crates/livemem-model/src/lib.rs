//! `livemem-model` – the sequence model side of the live memory protocol.
//!
//! # Modules
//!
//! - [`forward`] – [`SequenceModel`][forward::SequenceModel]: the
//!   `forward(tokens, state, return_state)` contract every model implements,
//!   plus [`Logits`][forward::Logits] with greedy selection.
//! - [`compression`] – [`CompressionPolicy`][compression::CompressionPolicy]:
//!   the configured rule deciding which layers emit memory traces.
//! - [`reference`] – [`ReferenceModel`][reference::ReferenceModel]: a small,
//!   deterministic, seeded model implementing the contract.
//! - [`tokenizer`] – [`ByteTokenizer`][tokenizer::ByteTokenizer]: byte-level
//!   stand-in tokenizer with BOS/EOT specials.
//!
//! # Example
//!
//! ```rust
//! use livemem_model::{ModelConfig, ReferenceModel, SequenceModel};
//!
//! let model = ReferenceModel::new(ModelConfig::default()).unwrap();
//! let out = model.forward(&[256, 104, 105], None, true).unwrap();
//! let state = out.state.unwrap();
//! assert_eq!(state.width(), 64);
//! assert!(!state.is_empty());
//! ```

pub mod compression;
pub mod config;
pub mod forward;
pub mod reference;
pub mod tokenizer;

pub use compression::{CompressionConfig, CompressionPolicy};
pub use config::ModelConfig;
pub use forward::{ForwardOutput, Logits, ModelError, SequenceModel};
pub use reference::ReferenceModel;
pub use tokenizer::ByteTokenizer;
