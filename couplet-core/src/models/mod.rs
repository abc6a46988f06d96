pub mod bigram;

pub use candle_core;
pub use candle_core::Tensor;
pub use candle_core::{DType, Device};

use anyhow::Result;

use crate::ops::tile_beams;

/// Recurrent state carried between decode steps, one slot per hypothesis.
///
/// `hidden` is (layers, N, H); `feed` and every `memory` tensor keep the slot
/// axis first. Slot i must depend only on slot i so a gather over slots is safe.
#[derive(Debug, Clone)]
pub struct DecoderState {
    pub hidden: Tensor,
    pub feed: Option<Tensor>,
    pub memory: Option<Vec<Tensor>>,
}

impl DecoderState {
    pub fn new(hidden: Tensor) -> Self {
        Self {
            hidden,
            feed: None,
            memory: None,
        }
    }

    pub fn num_slots(&self) -> Result<usize> {
        Ok(self.hidden.dim(1)?)
    }

    /// Replicates each batch entry `k` times so beams of one entry sit next
    /// to each other.
    pub fn tile(&self, k: usize) -> Result<Self> {
        Ok(Self {
            hidden: tile_beams(&self.hidden, k, 1)?,
            feed: self.feed.as_ref().map(|f| tile_beams(f, k, 0)).transpose()?,
            memory: self
                .memory
                .as_ref()
                .map(|mem| mem.iter().map(|m| tile_beams(m, k, 0)).collect::<candle_core::Result<Vec<_>>>())
                .transpose()?,
        })
    }

    /// Slot j of the result is slot `indices[j]` of `self`.
    pub fn reorder(&self, indices: &Tensor) -> Result<Self> {
        Ok(Self {
            hidden: self.hidden.index_select(indices, 1)?,
            feed: self.feed.as_ref().map(|f| f.index_select(indices, 0)).transpose()?,
            memory: self
                .memory
                .as_ref()
                .map(|mem| {
                    mem.iter()
                        .map(|m| m.index_select(indices, 0))
                        .collect::<candle_core::Result<Vec<_>>>()
                })
                .transpose()?,
        })
    }
}

/// Result of one decode step over all N slots.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// (N, vocab_size) or (N, 1, vocab_size) log-probabilities.
    pub log_probs: Tensor,
    pub state: DecoderState,
    pub attn_weights: Option<Tensor>,
}

/// Encoder/decoder pair driven one position at a time.
///
/// Implementations must be pure: the same inputs give the same outputs.
pub trait Seq2seqModel {
    fn device(&self) -> &Device;

    fn vocab_size(&self) -> usize;

    /// `source` is (B, L) u32, `seq_len` is (B,) u32. Returns the context
    /// (B, L, ...) and the initial state with B slots.
    fn encode(&self, source: &Tensor, seq_len: &Tensor) -> Result<(Tensor, DecoderState)>;

    /// `input` is (N, 1) u32, `attention_mask` is (N, 1, L) u8 with padding set.
    fn decode(
        &self,
        input: &Tensor,
        context: &Tensor,
        state: &DecoderState,
        attention_mask: Option<&Tensor>,
    ) -> Result<StepOutput>;
}
