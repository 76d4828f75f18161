//! Model configuration shared by every component that needs the model's
//! shape (width, vocabulary) without holding the model itself.

use livemem_memory::ConsolidationConfig;
use serde::{Deserialize, Serialize};

use crate::compression::CompressionConfig;
use crate::forward::ModelError;
use crate::tokenizer::ByteTokenizer;

/// Immutable description of a sequence model instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of distinct token ids.
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    /// Hidden width; every trace has exactly this many elements.
    #[serde(default = "default_width")]
    pub width: usize,

    #[serde(default = "default_n_layers")]
    pub n_layers: usize,

    /// Longest window a single forward call accepts.
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,

    /// Tokens summarised by one trace.  Chunk boundaries that fall on a
    /// multiple of this value are invisible in the resulting trace record.
    #[serde(default = "default_segment_len")]
    pub segment_len: usize,

    /// Seed for the deterministic weight initialisation.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Which layers emit memory traces.
    #[serde(default)]
    pub compression: CompressionConfig,

    /// When traces are folded into the consolidated vector.
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
}

fn default_vocab_size() -> usize {
    ByteTokenizer::VOCAB_SIZE
}
fn default_width() -> usize {
    64
}
fn default_n_layers() -> usize {
    2
}
fn default_max_seq_len() -> usize {
    2048
}
fn default_segment_len() -> usize {
    64
}
fn default_seed() -> u64 {
    42
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            width: default_width(),
            n_layers: default_n_layers(),
            max_seq_len: default_max_seq_len(),
            segment_len: default_segment_len(),
            seed: default_seed(),
            compression: CompressionConfig::default(),
            consolidation: ConsolidationConfig::default(),
        }
    }
}

impl ModelConfig {
    /// Reject configurations no model can be built from.
    pub fn validate(&self) -> Result<(), ModelError> {
        let positive = [
            ("vocab_size", self.vocab_size),
            ("width", self.width),
            ("n_layers", self.n_layers),
            ("max_seq_len", self.max_seq_len),
            ("segment_len", self.segment_len),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ModelError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if u32::try_from(self.vocab_size).is_err() {
            return Err(ModelError::InvalidConfig(format!(
                "vocab_size {} exceeds the token id range",
                self.vocab_size
            )));
        }
        self.compression
            .validate(self.n_layers)
            .map_err(ModelError::InvalidConfig)?;
        self.consolidation.validate().map_err(ModelError::InvalidConfig)
    }
}
