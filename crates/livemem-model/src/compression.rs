//! Trace-emission policies.
//!
//! A [`CompressionPolicy`] decides, per layer, whether that layer compresses
//! its activations into a memory trace or behaves as a stateless layer.  The
//! rule is an explicitly configured function of `(layer, n_layers)`; nothing
//! else about the model may influence it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Decides which layers contribute memory traces.
pub trait CompressionPolicy: Send + Sync {
    fn emits_trace(&self, layer: usize, n_layers: usize) -> bool;

    /// Indices of every emitting layer, in ascending order.
    fn emitting_layers(&self, n_layers: usize) -> Vec<usize> {
        (0..n_layers).filter(|&l| self.emits_trace(l, n_layers)).collect()
    }
}

/// Every layer emits a trace.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllLayers;

impl CompressionPolicy for AllLayers {
    fn emits_trace(&self, layer: usize, n_layers: usize) -> bool {
        layer < n_layers
    }
}

/// Out of every `ratio + 1` consecutive layers, the first `ratio` emit traces
/// and the last one is stateless: `layer % (ratio + 1) < ratio`.
///
/// With `ratio = 3` layers 0, 1, 2 compress, layer 3 does not, and so on.
/// `usize::MAX` saturates and makes every layer emit.
#[derive(Debug, Clone, Copy)]
pub struct RatioPolicy {
    pub ratio: usize,
}

impl CompressionPolicy for RatioPolicy {
    fn emits_trace(&self, layer: usize, n_layers: usize) -> bool {
        layer < n_layers && layer % self.ratio.saturating_add(1) < self.ratio
    }
}

/// An explicit set of emitting layers.
#[derive(Debug, Clone, Default)]
pub struct LayerSet(pub BTreeSet<usize>);

impl CompressionPolicy for LayerSet {
    fn emits_trace(&self, layer: usize, n_layers: usize) -> bool {
        layer < n_layers && self.0.contains(&layer)
    }
}

/// Serializable selection of a [`CompressionPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompressionConfig {
    AllLayers,
    Ratio { ratio: usize },
    Layers { layers: Vec<usize> },
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig::Ratio { ratio: 3 }
    }
}

impl CompressionConfig {
    /// Reject layer sets that name layers the model does not have.
    pub fn validate(&self, n_layers: usize) -> Result<(), String> {
        if let CompressionConfig::Layers { layers } = self {
            if let Some(&bad) = layers.iter().find(|&&l| l >= n_layers) {
                return Err(format!(
                    "compression layer {bad} is out of range for a model with {n_layers} layers"
                ));
            }
        }
        Ok(())
    }

    pub fn build(&self) -> Box<dyn CompressionPolicy> {
        match self {
            CompressionConfig::AllLayers => Box::new(AllLayers),
            CompressionConfig::Ratio { ratio } => Box::new(RatioPolicy { ratio: *ratio }),
            CompressionConfig::Layers { layers } => {
                Box::new(LayerSet(layers.iter().copied().collect()))
            }
        }
    }
}
