//! A compact token-transition model.
//!
//! The next-token logits are `transition[input] + carry[previous input]`, so
//! the decoder state is the carry row of the token fed one step earlier. It
//! is small enough to train offline into a safetensors file with two
//! (vocab, vocab) tables, `transition.weight` and `carry.weight`.

use std::path::Path;

use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Embedding, Module, VarBuilder};

use super::{DecoderState, Seq2seqModel, StepOutput};
use crate::error::CoupletError;

pub struct BigramModel {
    transition: Embedding,
    carry: Embedding,
    vocab_size: usize,
    device: Device,
}

impl BigramModel {
    pub fn new(transition: Tensor, carry: Tensor) -> Result<Self> {
        let (vocab_size, cols) = transition.dims2()?;
        if cols != vocab_size || carry.dims() != transition.dims() {
            return Err(CoupletError::shape(
                "bigram tables",
                (vocab_size, vocab_size),
                (transition.dims(), carry.dims()),
            )
            .into());
        }
        let device = transition.device().clone();
        Ok(Self {
            transition: Embedding::new(transition.to_dtype(DType::F32)?, vocab_size),
            carry: Embedding::new(carry.to_dtype(DType::F32)?, vocab_size),
            vocab_size,
            device,
        })
    }

    pub fn load(vb: VarBuilder, vocab_size: usize) -> Result<Self> {
        let transition = candle_nn::embedding(vocab_size, vocab_size, vb.pp("transition"))?;
        let carry = candle_nn::embedding(vocab_size, vocab_size, vb.pp("carry"))?;
        Ok(Self {
            transition,
            carry,
            vocab_size,
            device: vb.device().clone(),
        })
    }

    pub fn from_safetensors<P: AsRef<Path>>(path: P, vocab_size: usize, device: &Device) -> Result<Self> {
        let filenames = [path.as_ref().to_path_buf()];
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&filenames, DType::F32, device) }?;
        Self::load(vb, vocab_size)
    }
}

impl Seq2seqModel for BigramModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn encode(&self, source: &Tensor, _seq_len: &Tensor) -> Result<(Tensor, DecoderState)> {
        let (batch_size, _) = source.dims2()?;
        // context: (batch_size, src_len, vocab_size)
        let context = self.transition.forward(source)?;
        let hidden = Tensor::zeros((1, batch_size, self.vocab_size), DType::F32, &self.device)?;
        Ok((context, DecoderState::new(hidden)))
    }

    fn decode(
        &self,
        input: &Tensor,
        context: &Tensor,
        state: &DecoderState,
        attention_mask: Option<&Tensor>,
    ) -> Result<StepOutput> {
        let ids = input.flatten_all()?;
        let logits = self.transition.forward(&ids)?.add(&state.hidden.squeeze(0)?)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;

        // attention over the source, reported but not mixed into the logits
        // scores: (n, 1, src_len)
        let scores = logits.unsqueeze(1)?.matmul(&context.transpose(1, 2)?.contiguous()?)?;
        let scores = match attention_mask {
            Some(mask) => {
                let neg_inf = Tensor::full(f32::NEG_INFINITY, scores.shape(), &self.device)?;
                mask.broadcast_as(scores.shape())?.where_cond(&neg_inf, &scores)?
            }
            None => scores,
        };
        let attn_weights = candle_nn::ops::softmax_last_dim(&scores)?;

        let hidden = self.carry.forward(&ids)?.unsqueeze(0)?;
        Ok(StepOutput {
            log_probs,
            state: DecoderState::new(hidden),
            attn_weights: Some(attn_weights),
        })
    }
}
