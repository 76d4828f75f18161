//! [`ReferenceModel`] – a small deterministic sequence model with live memory.
//!
//! Real checkpoints are loaded elsewhere; this model exists so the memory
//! protocol can run end to end and be tested.  All weights come from a seeded
//! generator, so two models built from the same [`ModelConfig`] are
//! bit-identical.
//!
//! # Forward pass
//!
//! 1. Each token is embedded and tagged with its position inside the current
//!    segment of `segment_len` tokens.
//! 2. The hidden vector passes through `n_layers` residual elementwise layers
//!    `h += tanh(g ⊙ h + b)`.
//! 3. Every layer selected by the compression policy accumulates its output
//!    over the segment.  When the segment closes (it is full, or the window
//!    ends) each emitting layer appends one trace: its mean output over the
//!    segment.  Traces are appended segment by segment, lowest layer first.
//! 4. Logits at each position are the tied-embedding projection of the final
//!    hidden vector plus the running window context plus a memory read
//!    (mean of the newest traces, plus the consolidated vector).
//! 5. The consolidation policy runs on the extended state.
//!
//! Trace content depends only on the tokens of its segment, never on the
//! incoming state.  Chunking a long input is therefore invisible in the trace
//! record as long as every chunk boundary lands on a multiple of
//! `segment_len`; any other boundary closes a partial segment early.
//!
//! Consolidation is a per-call effect.  `SummarizeAll` recomputes its summary
//! from the whole record, so aligned chunking stays invisible under it.
//! `FoldOldest` folds whenever a single call leaves the record over its
//! limit, so the number and size of folds, and with them the `consolidated`
//! vector, depend on where the calls were split.  The surviving traces do
//! not.

use livemem_memory::{ConsolidationPolicy, MemoryState, Trace};
use livemem_types::TokenId;
use tracing::debug;

use crate::compression::CompressionPolicy;
use crate::config::ModelConfig;
use crate::forward::{ForwardOutput, Logits, ModelError, SequenceModel};

/// Number of newest traces averaged by the memory read.
const MEMORY_RECALL: usize = 8;
const MEMORY_GAIN: f32 = 0.5;
const CONTEXT_GAIN: f32 = 0.5;
const POSITION_GAIN: f32 = 0.1;

// ─────────────────────────────────────────────────────────────────────────────
// Deterministic weight generator
// ─────────────────────────────────────────────────────────────────────────────

/// SplitMix64 generator used for weight initialisation.
struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform in `[0, 1)`.
    fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }

    /// Fill `buf` with values uniform in `[-scale, scale)`.
    fn fill_uniform(&mut self, buf: &mut [f32], scale: f32) {
        for x in buf.iter_mut() {
            *x = (self.next_f32() * 2.0 - 1.0) * scale;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ReferenceModel
// ─────────────────────────────────────────────────────────────────────────────

pub struct ReferenceModel {
    config: ModelConfig,
    /// Tied input/output embedding, `[vocab_size, width]`.
    embed: Vec<f32>,
    gates: Vec<Vec<f32>>,
    biases: Vec<Vec<f32>>,
    /// `emitting[l]` is true when layer `l` produces traces.
    emitting: Vec<bool>,
    consolidation: Box<dyn ConsolidationPolicy>,
}

impl ReferenceModel {
    /// Build a model with the policies named in `config`.
    pub fn new(config: ModelConfig) -> Result<Self, ModelError> {
        let compression = config.compression.build();
        let consolidation = config.consolidation.build();
        Self::with_policies(config, compression.as_ref(), consolidation)
    }

    /// Build a model with caller-supplied policies, overriding the ones in
    /// `config`.
    pub fn with_policies(
        config: ModelConfig,
        compression: &dyn CompressionPolicy,
        consolidation: Box<dyn ConsolidationPolicy>,
    ) -> Result<Self, ModelError> {
        config.validate()?;
        let width = config.width;
        let mut rng = SimpleRng::new(config.seed);

        let mut embed = vec![0.0f32; config.vocab_size * width];
        rng.fill_uniform(&mut embed, (1.0 / width as f32).sqrt());

        let mut gates = Vec::with_capacity(config.n_layers);
        let mut biases = Vec::with_capacity(config.n_layers);
        for _ in 0..config.n_layers {
            let mut g = vec![0.0f32; width];
            rng.fill_uniform(&mut g, 1.0);
            let mut b = vec![0.0f32; width];
            rng.fill_uniform(&mut b, 0.1);
            gates.push(g);
            biases.push(b);
        }

        let emitting = (0..config.n_layers)
            .map(|l| compression.emits_trace(l, config.n_layers))
            .collect::<Vec<_>>();
        debug!(
            width,
            n_layers = config.n_layers,
            emitting_layers = emitting.iter().filter(|e| **e).count(),
            consolidation = consolidation.name(),
            "reference model initialised"
        );

        Ok(Self {
            config,
            embed,
            gates,
            biases,
            emitting,
            consolidation,
        })
    }

    /// Number of traces one full segment adds to the state.
    pub fn traces_per_segment(&self) -> usize {
        self.emitting.iter().filter(|e| **e).count()
    }

    fn embedding(&self, token: TokenId) -> &[f32] {
        let w = self.config.width;
        let start = token as usize * w;
        &self.embed[start..start + w]
    }

    fn check_tokens(&self, tokens: &[TokenId]) -> Result<(), ModelError> {
        if tokens.len() > self.config.max_seq_len {
            return Err(ModelError::SequenceTooLong {
                len: tokens.len(),
                max: self.config.max_seq_len,
            });
        }
        if let Some((position, &token)) = tokens
            .iter()
            .enumerate()
            .find(|(_, t)| **t as usize >= self.config.vocab_size)
        {
            return Err(ModelError::TokenOutOfRange {
                token,
                position,
                vocab_size: self.config.vocab_size,
            });
        }
        Ok(())
    }

    fn apply_layer(&self, layer: usize, h: &mut [f32]) {
        let (g, b) = (&self.gates[layer], &self.biases[layer]);
        for ((x, gk), bk) in h.iter_mut().zip(g).zip(b) {
            *x += (gk * *x + bk).tanh();
        }
    }

    /// What the model remembers: mean of the newest traces plus the
    /// consolidated summary.  `None` for an empty memory.
    fn memory_read(&self, state: &MemoryState) -> Option<Vec<f32>> {
        let w = self.config.width;
        let traces = state.traces();
        let recent = &traces[traces.len().saturating_sub(MEMORY_RECALL)..];
        if recent.is_empty() && state.consolidated().is_none() {
            return None;
        }
        let mut read = vec![0.0f32; w];
        if !recent.is_empty() {
            for trace in recent {
                for (r, v) in read.iter_mut().zip(trace.as_slice()) {
                    *r += v;
                }
            }
            let n = recent.len() as f32;
            read.iter_mut().for_each(|r| *r /= n);
        }
        if let Some(summary) = state.consolidated() {
            for (r, v) in read.iter_mut().zip(summary) {
                *r += v;
            }
        }
        Some(read)
    }

    /// Append one trace per emitting layer and reset the accumulators.
    fn close_segment(
        &self,
        state: &mut MemoryState,
        acc: &mut [Vec<f32>],
        count: usize,
    ) -> Result<(), ModelError> {
        let n = count as f32;
        for (layer, sum) in acc.iter_mut().enumerate() {
            if !self.emitting[layer] {
                continue;
            }
            let trace = sum.iter().map(|v| v / n).collect();
            state.push_trace(Trace::new(trace))?;
            sum.iter_mut().for_each(|v| *v = 0.0);
        }
        Ok(())
    }

    fn project(&self, x: &[f32], out: &mut Vec<f32>) {
        for row in self.embed.chunks_exact(self.config.width) {
            out.push(row.iter().zip(x).map(|(e, v)| e * v).sum());
        }
    }

    /// Everything that can reject a call, done before any state is touched.
    fn check_input(&self, tokens: &[TokenId], state: Option<&MemoryState>) -> Result<(), ModelError> {
        self.check_tokens(tokens)?;
        if let Some(state) = state {
            state.validate()?;
            state.ensure_width(self.config.width)?;
        }
        Ok(())
    }

    /// Run a checked window over `state`, appending its traces and running
    /// consolidation.
    fn run_window(&self, tokens: &[TokenId], state: &mut MemoryState) -> Result<Logits, ModelError> {
        let width = self.config.width;
        let traces_before = state.len();
        let memory = self.memory_read(state);

        let segment_len = self.config.segment_len;
        let mut acc = vec![vec![0.0f32; width]; self.config.n_layers];
        let mut in_segment = 0usize;
        let mut running = vec![0.0f32; width];
        let mut logits = Vec::with_capacity(tokens.len() * self.config.vocab_size);

        for (t, &token) in tokens.iter().enumerate() {
            let offset = t % segment_len;
            let mut h = self.embedding(token).to_vec();
            for (k, x) in h.iter_mut().enumerate() {
                *x += POSITION_GAIN * ((offset + 1) as f32 * (k + 1) as f32 * 0.01).sin();
            }
            for layer in 0..self.config.n_layers {
                self.apply_layer(layer, &mut h);
                if self.emitting[layer] {
                    for (a, x) in acc[layer].iter_mut().zip(&h) {
                        *a += x;
                    }
                }
            }
            in_segment += 1;
            if in_segment == segment_len || t + 1 == tokens.len() {
                self.close_segment(state, &mut acc, in_segment)?;
                in_segment = 0;
            }

            for (r, x) in running.iter_mut().zip(&h) {
                *r += x;
            }
            let seen = (t + 1) as f32;
            let x: Vec<f32> = (0..width)
                .map(|k| {
                    let recall = memory.as_ref().map_or(0.0, |m| MEMORY_GAIN * m[k]);
                    h[k] + CONTEXT_GAIN * running[k] / seen + recall
                })
                .collect();
            self.project(&x, &mut logits);
        }

        let appended = state.len() - traces_before;
        let consolidation = self.consolidation.consolidate(state);
        debug!(
            tokens = tokens.len(),
            appended,
            traces = state.len(),
            consolidated = consolidation.map(|e| e.folded),
            "forward"
        );
        Ok(Logits::new(logits, self.config.vocab_size))
    }
}

impl SequenceModel for ReferenceModel {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn forward(
        &self,
        tokens: &[TokenId],
        state: Option<MemoryState>,
        return_state: bool,
    ) -> Result<ForwardOutput, ModelError> {
        self.check_input(tokens, state.as_ref())?;
        let mut state = state.unwrap_or_else(|| MemoryState::new(self.config.width));
        let logits = self.run_window(tokens, &mut state)?;
        Ok(ForwardOutput {
            logits,
            state: return_state.then_some(state),
        })
    }

    /// Checks run before the state is touched, and segment closing cannot
    /// fail on a width-checked state, so no copy of the input is kept.
    fn extend_state(
        &self,
        tokens: &[TokenId],
        state: &mut Option<MemoryState>,
    ) -> Result<Logits, ModelError> {
        self.check_input(tokens, state.as_ref())?;
        let width = self.config.width;
        self.run_window(tokens, state.get_or_insert_with(|| MemoryState::new(width)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{CompressionConfig, LayerSet};
    use livemem_memory::consolidation::NoConsolidation;
    use livemem_memory::{ConsolidationConfig, StateError};

    fn small_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 100,
            width: 64,
            n_layers: 2,
            max_seq_len: 32,
            segment_len: 32,
            seed: 7,
            compression: CompressionConfig::Ratio { ratio: 3 },
            consolidation: ConsolidationConfig::None,
        }
    }

    fn tokens(n: usize) -> Vec<TokenId> {
        (0..n).map(|i| ((i * 37 + 11) % 100) as TokenId).collect()
    }

    #[test]
    fn one_window_emits_one_trace_per_emitting_layer() {
        let model = ReferenceModel::new(small_config()).unwrap();
        let out = model.forward(&tokens(16), None, true).unwrap();
        let state = out.state.unwrap();
        assert_eq!(state.len(), 2);
        assert_eq!(state.width(), 64);
        assert_eq!(out.logits.positions(), 16);
        assert_eq!(out.logits.vocab_size(), 100);
    }

    #[test]
    fn state_is_absent_without_return_state() {
        let model = ReferenceModel::new(small_config()).unwrap();
        let out = model.forward(&tokens(4), None, false).unwrap();
        assert!(out.state.is_none());
    }

    #[test]
    fn empty_window_initialises_state() {
        let model = ReferenceModel::new(small_config()).unwrap();
        let out = model.forward(&[], None, true).unwrap();
        let state = out.state.unwrap();
        assert!(state.is_empty());
        assert_eq!(state.width(), 64);
        assert_eq!(out.logits.positions(), 0);
    }

    #[test]
    fn segments_split_long_windows() {
        let cfg = ModelConfig { segment_len: 5, ..small_config() };
        let model = ReferenceModel::new(cfg).unwrap();
        let state = model.forward(&tokens(12), None, true).unwrap().state.unwrap();
        // segments of 5, 5 and 2 tokens, two emitting layers each
        assert_eq!(state.len(), 6);
    }

    #[test]
    fn forward_is_deterministic() {
        let a = ReferenceModel::new(small_config()).unwrap();
        let b = ReferenceModel::new(small_config()).unwrap();
        let out_a = a.forward(&tokens(20), None, true).unwrap();
        let out_b = b.forward(&tokens(20), None, true).unwrap();
        assert_eq!(out_a.logits, out_b.logits);
        assert_eq!(out_a.state, out_b.state);
    }

    #[test]
    fn memory_changes_logits_but_not_traces() {
        let model = ReferenceModel::new(small_config()).unwrap();
        let (_, history) = model.forward_with_state(&tokens(10), None).unwrap();

        let fresh = model.forward(&tokens(3), None, true).unwrap();
        let recalled = model.forward(&tokens(3), Some(history.clone()), true).unwrap();
        assert_ne!(fresh.logits, recalled.logits);

        let recalled_state = recalled.state.unwrap();
        assert_eq!(&recalled_state.traces()[..history.len()], history.traces());
        assert_eq!(&recalled_state.traces()[history.len()..], fresh.state.unwrap().traces());
    }

    #[test]
    fn rejects_out_of_vocabulary_token() {
        let model = ReferenceModel::new(small_config()).unwrap();
        let err = model.forward(&[1, 2, 100], None, true).unwrap_err();
        assert_eq!(
            err,
            ModelError::TokenOutOfRange { token: 100, position: 2, vocab_size: 100 }
        );
    }

    #[test]
    fn rejects_windows_longer_than_max() {
        let model = ReferenceModel::new(small_config()).unwrap();
        let err = model.forward(&tokens(33), None, true).unwrap_err();
        assert_eq!(err, ModelError::SequenceTooLong { len: 33, max: 32 });
    }

    #[test]
    fn rejects_state_of_other_width() {
        let model = ReferenceModel::new(small_config()).unwrap();
        let err = model.forward(&tokens(2), Some(MemoryState::new(8)), true).unwrap_err();
        assert_eq!(err, ModelError::State(StateError::WidthMismatch { expected: 64, found: 8 }));
    }

    #[test]
    fn rejects_malformed_state_before_running() {
        let model = ReferenceModel::new(small_config()).unwrap();
        let bad = MemoryState::from_parts(64, vec![Trace::new(vec![0.0; 3])], None);
        let err = model.forward(&tokens(2), Some(bad), true).unwrap_err();
        assert!(matches!(err, ModelError::State(StateError::Malformed { index: 0, .. })));
    }

    #[test]
    fn custom_policies_override_config() {
        let model = ReferenceModel::with_policies(
            small_config(),
            &LayerSet([1].into_iter().collect()),
            Box::new(NoConsolidation),
        )
        .unwrap();
        assert_eq!(model.traces_per_segment(), 1);
        let state = model.forward(&tokens(8), None, true).unwrap().state.unwrap();
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn consolidation_runs_after_each_call() {
        let cfg = ModelConfig {
            consolidation: ConsolidationConfig::SummarizeAll { min_traces: 2 },
            ..small_config()
        };
        let model = ReferenceModel::new(cfg).unwrap();
        let state = model.forward(&tokens(4), None, true).unwrap().state.unwrap();
        assert_eq!(state.len(), 2);
        assert!(state.consolidated().is_some());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = ModelConfig { segment_len: 0, ..small_config() };
        assert!(matches!(ReferenceModel::new(cfg), Err(ModelError::InvalidConfig(_))));
    }

    #[test]
    fn extend_state_matches_forward() {
        let model = ReferenceModel::new(small_config()).unwrap();
        let (logits, expected) = model.forward_with_state(&tokens(20), None).unwrap();

        let mut state = None;
        let in_place = model.extend_state(&tokens(20), &mut state).unwrap();
        assert_eq!(in_place, logits);
        assert_eq!(state, Some(expected));
    }

    #[test]
    fn rejected_extension_leaves_state_alone() {
        let model = ReferenceModel::new(small_config()).unwrap();
        let mut state = None;
        model.extend_state(&tokens(8), &mut state).unwrap();
        let before = state.clone();

        let err = model.extend_state(&[1, 2, 100], &mut state).unwrap_err();
        assert!(matches!(err, ModelError::TokenOutOfRange { token: 100, position: 2, .. }));
        assert_eq!(state, before);

        let err = model.extend_state(&tokens(33), &mut state).unwrap_err();
        assert!(matches!(err, ModelError::SequenceTooLong { len: 33, max: 32 }));
        assert_eq!(state, before);
    }

    #[test]
    fn extreme_compression_settings_never_panic() {
        let cfg = ModelConfig {
            compression: CompressionConfig::Ratio { ratio: usize::MAX },
            ..small_config()
        };
        let model = ReferenceModel::new(cfg).unwrap();
        let state = model.forward(&tokens(4), None, true).unwrap().state.unwrap();
        assert_eq!(state.len(), 2);

        let cfg = ModelConfig {
            compression: CompressionConfig::Layers { layers: vec![9] },
            ..small_config()
        };
        assert!(matches!(ReferenceModel::new(cfg), Err(ModelError::InvalidConfig(_))));
    }
}
