//! Text in, ranked second lines out.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use crate::error::CoupletError;
use crate::generation::{BeamSearch, GenerationConfig};
use crate::models::bigram::BigramModel;
use crate::models::Seq2seqModel;
use crate::pattern::{CharacterPattern, PatternAnalyzer};
use crate::utils::select_device;
use crate::vocab::Vocab;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub text: String,
    pub score: f32,
}

pub struct CoupletPredictor<M, P = CharacterPattern> {
    model: M,
    vocab: Vocab,
    analyzer: P,
}

impl<M: Seq2seqModel> CoupletPredictor<M> {
    pub fn new(model: M, vocab: Vocab) -> Result<Self> {
        if model.vocab_size() != vocab.size() {
            return Err(CoupletError::shape("model vocabulary", vocab.size(), model.vocab_size()).into());
        }
        let analyzer = CharacterPattern::excluding(&[vocab.unk()]);
        Ok(Self {
            model,
            vocab,
            analyzer,
        })
    }
}

impl CoupletPredictor<BigramModel> {
    /// Loads `model.safetensors` plus `tokenizer.json` or `vocab.txt` from `model_dir`.
    pub fn load<P: AsRef<Path>>(model_dir: P, config: &GenerationConfig) -> Result<Self> {
        let model_dir = model_dir.as_ref();
        let device = select_device(config.force_cpu)?;
        let vocab = Vocab::from_model_dir(model_dir)?;
        let model = BigramModel::from_safetensors(model_dir.join("model.safetensors"), vocab.size(), &device)?;
        tracing::info!("Loaded couplet model from {}", model_dir.display());
        Self::new(model, vocab)
    }
}

impl<M: Seq2seqModel, P: PatternAnalyzer> CoupletPredictor<M, P> {
    pub fn with_analyzer<Q: PatternAnalyzer>(self, analyzer: Q) -> CoupletPredictor<M, Q> {
        CoupletPredictor {
            model: self.model,
            vocab: self.vocab,
            analyzer,
        }
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    /// Best `config.returned()` second lines for each first line, best first.
    pub fn predict(&self, lines: &[&str], config: &GenerationConfig) -> Result<Vec<Vec<Candidate>>> {
        config.validate()?;
        let (source, seq_len) = self.vocab.encode_batch(lines, self.model.device())?;
        let generation = BeamSearch::new(&self.model, self.vocab.special())
            .with_analyzer(&self.analyzer)
            .with_banned(&[self.vocab.unk()])
            .generate(&source, &seq_len, config.beam_size)?;

        let candidates = generation
            .hypotheses()?
            .into_iter()
            .map(|hyps| {
                hyps.into_iter()
                    .take(config.returned())
                    .map(|(ids, score)| Candidate {
                        text: self.vocab.decode(&ids),
                        score,
                    })
                    .collect()
            })
            .collect();
        Ok(candidates)
    }
}
