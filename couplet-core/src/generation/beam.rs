//! Constrained beam search over fixed-length couplet lines.
//!
//! All hypotheses of a batch live in fused B·K slots: scores, used-token masks
//! and decoder state are tensors indexed by slot, the partially written lines
//! are a flat host buffer. Every step re-ranks the slots and gathers each of
//! those arrays by the winning origin indices.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use tracing::{debug, info, warn};

use crate::error::CoupletError;
use crate::models::Seq2seqModel;
use crate::ops::{initial_beam_scores, tile_beams, token_one_hot, topk_per_row};
use crate::pattern::{CharacterPattern, PatternAnalyzer, SentencePattern};
use crate::vocab::SpecialTokens;

/// Ranked hypotheses of one `generate` call.
#[derive(Debug, Clone)]
pub struct Generation {
    /// (B, K, fix_len) u32
    pub tokens: Tensor,
    /// (B, K) f32, best first per batch entry.
    pub scores: Tensor,
    pub seq_len: Vec<usize>,
}

impl Generation {
    /// Per batch entry, the K lines cut after their end token, with scores.
    pub fn hypotheses(&self) -> Result<Vec<Vec<(Vec<u32>, f32)>>> {
        let tokens = self.tokens.to_vec3::<u32>()?;
        let scores = self.scores.to_vec2::<f32>()?;
        let out = tokens
            .into_iter()
            .zip(scores)
            .zip(&self.seq_len)
            .map(|((beams, scores), &len)| {
                beams
                    .into_iter()
                    .zip(scores)
                    .map(|(mut line, score)| {
                        line.truncate(len);
                        (line, score)
                    })
                    .collect()
            })
            .collect();
        Ok(out)
    }
}

pub struct BeamSearch<'a, M, P = CharacterPattern> {
    model: &'a M,
    analyzer: P,
    special: SpecialTokens,
    /// Banned in every slot on top of the special tokens.
    banned: Vec<u32>,
}

impl<'a, M: Seq2seqModel> BeamSearch<'a, M, CharacterPattern> {
    pub fn new(model: &'a M, special: SpecialTokens) -> Self {
        Self {
            model,
            analyzer: CharacterPattern::default(),
            special,
            banned: Vec::new(),
        }
    }
}

impl<'a, M: Seq2seqModel, P: PatternAnalyzer> BeamSearch<'a, M, P> {
    pub fn with_analyzer<Q: PatternAnalyzer>(self, analyzer: Q) -> BeamSearch<'a, M, Q> {
        BeamSearch {
            model: self.model,
            analyzer,
            special: self.special,
            banned: self.banned,
        }
    }

    /// Tokens that may never be emitted, e.g. `[UNK]`.
    pub fn with_banned(mut self, tokens: &[u32]) -> Self {
        self.banned.extend_from_slice(tokens);
        self
    }

    /// Generates `beam_size` second lines for every row of `source`.
    ///
    /// `source` is (B, fix_len) u32 right-padded with the pad token and
    /// `seq_len` (B,) holds the true lengths, end token included.
    pub fn generate(&self, source: &Tensor, seq_len: &Tensor, beam_size: usize) -> Result<Generation> {
        if beam_size == 0 {
            return Err(CoupletError::invalid("beam size must be greater than 0").into());
        }
        let k = beam_size;
        let (batch_size, fix_len, lens) = self.check_inputs(source, seq_len)?;
        let vocab_size = self.model.vocab_size();
        let mut reserved = self.special.as_array().to_vec();
        reserved.extend_from_slice(&self.banned);
        if let Some(id) = reserved.into_iter().find(|&id| id as usize >= vocab_size) {
            return Err(CoupletError::invalid(format!(
                "banned token {id} outside vocabulary of {vocab_size}"
            ))
            .into());
        }
        let device = self.model.device().clone();
        let slots = batch_size * k;
        let SpecialTokens { pad, bos, eos } = self.special;

        let source = source.to_dtype(DType::U32)?.to_device(&device)?;
        let seq_len_t = Tensor::from_vec(
            lens.iter().map(|&l| l as u32).collect::<Vec<_>>(),
            batch_size,
            &device,
        )?;

        // pad_mask: (batch_size, fix_len)
        let pad_mask = if lens.iter().any(|&l| l != fix_len) {
            let mask: Vec<u8> = lens
                .iter()
                .flat_map(|&len| (0..fix_len).map(move |p| u8::from(p >= len)))
                .collect();
            Some(Tensor::from_vec(mask, (batch_size, fix_len), &device)?)
        } else {
            None
        };

        // scores: (slots, 1)
        let mut scores = initial_beam_scores(batch_size, k, &device)?;

        // output: (batch_size, k, fix_len) flattened
        let mut output = vec![pad; slots * fix_len];
        for (slot, line) in output.chunks_mut(fix_len).enumerate() {
            line[lens[slot / k] - 1] = eos;
        }

        // input: (slots, 1)
        let mut input = Tensor::full(bos, (slots, 1), &device)?;

        // ban_mask: (slots, vocab_size)
        let mut ban_mask = self.base_ban_mask(slots, vocab_size, &device)?;
        let ones = Tensor::ones((slots, vocab_size), DType::U8, &device)?;
        let neg_inf = Tensor::full(f32::NEG_INFINITY, (slots, vocab_size), &device)?;

        let pattern = self.analyzer.sentence_pattern(&source, pad_mask.as_ref())?;
        let pattern = SentencePattern::analyze(&pattern, &lens)?;

        let (context, state) = self.model.encode(&source, &seq_len_t)?;
        let context = tile_beams(&context, k, 0)?;
        let mut state = state.tile(k)?;
        if state.num_slots()? != slots {
            return Err(CoupletError::shape("encoder state slots", slots, state.num_slots()?).into());
        }

        // attention_mask: (slots, 1, fix_len)
        let attention_mask = pad_mask
            .as_ref()
            .map(|m| tile_beams(m, k, 0)?.unsqueeze(1))
            .transpose()?;

        info!(batch_size, beam_size = k, fix_len, vocab_size, "Starting couplet beam search");

        for i in 0..fix_len {
            let step = self
                .model
                .decode(&input, &context, &state, attention_mask.as_ref())?;
            let log_probs = Self::step_log_probs(&step.log_probs, slots, vocab_size)?;

            // candidates: (slots, vocab_size)
            let candidates = scores.broadcast_add(&log_probs)?;

            let known: Vec<bool> = (0..slots).map(|s| pattern.is_known(s / k, i)).collect();
            let num_known = known.iter().filter(|&&kn| kn).count();
            let token_mask = if num_known == 0 {
                ban_mask.clone()
            } else {
                let forced: Vec<u32> = (0..slots).map(|s| output[s * fix_len + i]).collect();
                self.known_token_mask(&ban_mask, &known, &forced, &device)?
            };
            let candidates = token_mask.where_cond(&neg_inf, &candidates)?;

            let flat = candidates.flatten_all()?.to_vec1::<f32>()?;
            let top = topk_per_row(&flat, k * vocab_size, k)?;
            let last_scores = scores.flatten_all()?.to_vec1::<f32>()?;

            let mut new_scores = Vec::with_capacity(slots);
            let mut origins = Vec::with_capacity(slots);
            let mut symbols = Vec::with_capacity(slots);
            let mut num_frozen = 0usize;
            let mut degenerate = 0usize;
            for (b, ranked) in top.iter().enumerate() {
                let frozen = i >= lens[b];
                for (j, &(flat_idx, score)) in ranked.iter().enumerate() {
                    let slot = b * k + j;
                    if frozen {
                        num_frozen += 1;
                        new_scores.push(last_scores[slot]);
                        origins.push(slot as u32);
                        symbols.push(pad);
                        continue;
                    }
                    let score = if score.is_nan() { f32::NEG_INFINITY } else { score };
                    if score == f32::NEG_INFINITY && last_scores[b * k] != f32::NEG_INFINITY {
                        degenerate += 1;
                    }
                    let origin = b * k + flat_idx as usize / vocab_size;
                    // a known position keeps its token even when every candidate was masked
                    let symbol = if known[slot] {
                        output[origin * fix_len + i]
                    } else {
                        flat_idx % vocab_size as u32
                    };
                    new_scores.push(score);
                    origins.push(origin as u32);
                    symbols.push(symbol);
                }
            }
            if degenerate > 0 {
                warn!(step = i, degenerate, "No allowed continuation; keeping lowest-index tokens");
            }
            debug!(step = i, known = num_known, frozen = num_frozen, "Beam step");

            // re-rank
            let origin_idx = Tensor::from_vec(origins.clone(), slots, &device)?;
            output = origins
                .iter()
                .flat_map(|&o| {
                    let o = o as usize;
                    output[o * fix_len..(o + 1) * fix_len].iter().copied()
                })
                .collect();
            state = step.state.reorder(&origin_idx)?;
            ban_mask = ban_mask.index_select(&origin_idx, 0)?;

            // write symbols, propagating to correlated positions
            for (slot, &symbol) in symbols.iter().enumerate() {
                let b = slot / k;
                let line = &mut output[slot * fix_len..(slot + 1) * fix_len];
                line[i] = symbol;
                if i < lens[b] && pattern.is_multi(b, i) {
                    for j in pattern.propagation_targets(b, i) {
                        line[j] = symbol;
                    }
                }
            }

            let symbols = Tensor::from_vec(symbols, slots, &device)?;
            ban_mask = token_one_hot(&symbols, vocab_size)?.where_cond(&ones, &ban_mask)?;
            input = symbols.unsqueeze(1)?;
            scores = Tensor::from_vec(new_scores, (slots, 1), &device)?;
        }

        Ok(Generation {
            tokens: Tensor::from_vec(output, (batch_size, k, fix_len), &device)?,
            scores: scores.reshape((batch_size, k))?,
            seq_len: lens,
        })
    }

    fn check_inputs(&self, source: &Tensor, seq_len: &Tensor) -> Result<(usize, usize, Vec<usize>)> {
        let (batch_size, fix_len) = match source.dims() {
            &[b, l] => (b, l),
            dims => return Err(CoupletError::shape("source", "(batch, fix_len)", dims).into()),
        };
        if batch_size == 0 || fix_len == 0 {
            return Err(CoupletError::invalid(format!("empty source of shape {:?}", source.dims())).into());
        }
        if seq_len.dims() != [batch_size].as_slice() {
            return Err(CoupletError::shape("seq_len", [batch_size], seq_len.dims()).into());
        }
        let lens: Vec<usize> = seq_len
            .to_dtype(DType::U32)?
            .to_vec1::<u32>()?
            .into_iter()
            .map(|l| l as usize)
            .collect();
        if let Some(&len) = lens.iter().find(|&&l| l == 0 || l > fix_len) {
            return Err(CoupletError::invalid(format!(
                "sequence length {len} outside 1..={fix_len}"
            ))
            .into());
        }
        Ok((batch_size, fix_len, lens))
    }

    /// Bans the three special tokens and any extra banned tokens in every slot.
    fn base_ban_mask(&self, slots: usize, vocab_size: usize, device: &Device) -> Result<Tensor> {
        let mut row = vec![0u8; vocab_size];
        for id in self.special.as_array().into_iter().chain(self.banned.iter().copied()) {
            row[id as usize] = 1;
        }
        let row = Tensor::from_vec(row, (1, vocab_size), device)?;
        Ok(row.broadcast_as((slots, vocab_size))?.contiguous()?)
    }

    /// Known slots may only emit the token already written at this position;
    /// the others fall back to their used-token mask.
    fn known_token_mask(
        &self,
        ban_mask: &Tensor,
        known: &[bool],
        forced: &[u32],
        device: &Device,
    ) -> Result<Tensor> {
        let (slots, vocab_size) = ban_mask.dims2()?;
        let forced = Tensor::from_slice(forced, slots, device)?;
        let only_forced = token_one_hot(&forced, vocab_size)?.eq(0u8)?;
        let known: Vec<u8> = known.iter().map(|&kn| u8::from(kn)).collect();
        let known = Tensor::from_vec(known, (slots, 1), device)?.broadcast_as((slots, vocab_size))?;
        Ok(known.where_cond(&only_forced, ban_mask)?)
    }

    fn step_log_probs(log_probs: &Tensor, slots: usize, vocab_size: usize) -> Result<Tensor> {
        let log_probs = match log_probs.dims() {
            &[n, v] if n == slots && v == vocab_size => log_probs.clone(),
            &[n, 1, v] if n == slots && v == vocab_size => log_probs.squeeze(1)?,
            dims => {
                return Err(CoupletError::shape("decoder log-probs", (slots, vocab_size), dims).into())
            }
        };
        Ok(log_probs.to_dtype(DType::F32)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::models::{DecoderState, StepOutput};

    const VOCAB: usize = 12;
    const SPECIAL: SpecialTokens = SpecialTokens {
        pad: 0,
        bos: 1,
        eos: 2,
    };

    /// Log-probabilities looked up from (previous input, input, token); the
    /// previous input is the carried state, so a wrong gather changes scores.
    struct TableModel {
        device: Device,
        dead: bool,
    }

    impl TableModel {
        fn new() -> Self {
            Self {
                device: Device::Cpu,
                dead: false,
            }
        }

        fn dead() -> Self {
            Self {
                device: Device::Cpu,
                dead: true,
            }
        }

        fn row(&self, prev: u32, input: u32) -> Vec<f32> {
            (0..VOCAB as u32)
                .map(|tok| {
                    if self.dead {
                        return f32::NEG_INFINITY;
                    }
                    let h = (prev * 131 + input * 71 + tok * 7919 + prev * tok * 17) % 997;
                    -(h as f32) / 100.0 - 0.01
                })
                .collect()
        }
    }

    impl Seq2seqModel for TableModel {
        fn device(&self) -> &Device {
            &self.device
        }

        fn vocab_size(&self) -> usize {
            VOCAB
        }

        fn encode(&self, source: &Tensor, _seq_len: &Tensor) -> Result<(Tensor, DecoderState)> {
            let (b, l) = source.dims2()?;
            let context = Tensor::zeros((b, l, 2), DType::F32, &self.device)?;
            let hidden = Tensor::zeros((1, b, 1), DType::F32, &self.device)?;
            Ok((context, DecoderState::new(hidden)))
        }

        fn decode(
            &self,
            input: &Tensor,
            _context: &Tensor,
            state: &DecoderState,
            _attention_mask: Option<&Tensor>,
        ) -> Result<StepOutput> {
            let ids = input.flatten_all()?.to_vec1::<u32>()?;
            let prev = state.hidden.flatten_all()?.to_vec1::<f32>()?;
            let n = ids.len();
            let data: Vec<f32> = ids
                .iter()
                .zip(&prev)
                .flat_map(|(&id, &p)| self.row(p as u32, id))
                .collect();
            let log_probs = Tensor::from_vec(data, (n, 1, VOCAB), &self.device)?;
            let hidden = input.to_dtype(DType::F32)?.reshape((1, n, 1))?;
            Ok(StepOutput {
                log_probs,
                state: DecoderState::new(hidden),
                attn_weights: None,
            })
        }
    }

    struct FixedPattern(Tensor);

    impl PatternAnalyzer for FixedPattern {
        fn sentence_pattern(&self, _source: &Tensor, _pad_mask: Option<&Tensor>) -> Result<Tensor> {
            Ok(self.0.clone())
        }
    }

    fn identity(batch: usize, len: usize) -> Result<Tensor> {
        let eye: Vec<u8> = (0..batch * len * len)
            .map(|idx| u8::from(idx % (len * len) % (len + 1) == 0))
            .collect();
        Ok(Tensor::from_vec(eye, (batch, len, len), &Device::Cpu)?)
    }

    fn inputs(rows: &[&[u32]]) -> Result<(Tensor, Tensor)> {
        let fix_len = rows.iter().map(|r| r.len()).max().unwrap_or(0);
        let mut data = Vec::new();
        let mut lens = Vec::new();
        for r in rows {
            lens.push(r.len() as u32);
            data.extend_from_slice(r);
            data.extend(std::iter::repeat(SPECIAL.pad).take(fix_len - r.len()));
        }
        Ok((
            Tensor::from_vec(data, (rows.len(), fix_len), &Device::Cpu)?,
            Tensor::from_vec(lens, rows.len(), &Device::Cpu)?,
        ))
    }

    /// One-hypothesis-at-a-time beam search over the same log-prob table.
    fn reference_beam_search(model: &TableModel, len: usize, k: usize) -> Vec<(Vec<u32>, f32)> {
        #[derive(Clone)]
        struct Hyp {
            line: Vec<u32>,
            score: f32,
            prev: u32,
            input: u32,
            used: HashSet<u32>,
        }
        let mut line = vec![SPECIAL.pad; len];
        line[len - 1] = SPECIAL.eos;
        let mut beams = vec![Hyp {
            line,
            score: 0.0,
            prev: 0,
            input: SPECIAL.bos,
            used: SPECIAL.as_array().into_iter().collect(),
        }];
        for i in 0..len {
            let mut cands: Vec<(f32, usize, usize, u32)> = Vec::new();
            for (h, hyp) in beams.iter().enumerate() {
                let row = model.row(hyp.prev, hyp.input);
                for tok in 0..VOCAB as u32 {
                    let allowed = if i == len - 1 {
                        tok == SPECIAL.eos
                    } else {
                        !hyp.used.contains(&tok)
                    };
                    if allowed {
                        cands.push((hyp.score + row[tok as usize], h * VOCAB + tok as usize, h, tok));
                    }
                }
            }
            cands.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap().then(a.1.cmp(&b.1)));
            beams = cands
                .into_iter()
                .take(k)
                .map(|(score, _, h, tok)| {
                    let mut next = beams[h].clone();
                    next.line[i] = tok;
                    next.score = score;
                    next.prev = next.input;
                    next.input = tok;
                    next.used.insert(tok);
                    next
                })
                .collect();
        }
        beams.into_iter().map(|h| (h.line, h.score)).collect()
    }

    #[test]
    fn zero_beam_size_is_invalid_argument() -> Result<()> {
        let model = TableModel::new();
        let (source, seq_len) = inputs(&[&[4, 5, 2]])?;
        let err = BeamSearch::new(&model, SPECIAL)
            .generate(&source, &seq_len, 0)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoupletError>(),
            Some(CoupletError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn mismatched_lengths_fail_fast() -> Result<()> {
        let model = TableModel::new();
        let search = BeamSearch::new(&model, SPECIAL);
        let (source, _) = inputs(&[&[4, 5, 2]])?;

        let two_lens = Tensor::new(&[3u32, 3], &Device::Cpu)?;
        let err = search.generate(&source, &two_lens, 2).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoupletError>(),
            Some(CoupletError::ShapeMismatch { .. })
        ));

        let too_long = Tensor::new(&[4u32], &Device::Cpu)?;
        assert!(search.generate(&source, &too_long, 2).is_err());

        let flat = Tensor::new(&[4u32, 5, 2], &Device::Cpu)?;
        assert!(search.generate(&flat, &Tensor::new(&[3u32], &Device::Cpu)?, 2).is_err());
        Ok(())
    }

    #[test]
    fn beam_of_one_is_greedy() -> Result<()> {
        let model = TableModel::new();
        let (source, seq_len) = inputs(&[&[4, 5, 6, 7, 2]])?;
        let generation = BeamSearch::new(&model, SPECIAL).generate(&source, &seq_len, 1)?;
        let (line, score) = generation.hypotheses()?.remove(0).remove(0);

        let mut used: HashSet<u32> = SPECIAL.as_array().into_iter().collect();
        let (mut prev, mut input, mut total) = (0u32, SPECIAL.bos, 0f32);
        let mut expected = Vec::new();
        for i in 0..5 {
            let row = model.row(prev, input);
            let tok = if i == 4 {
                SPECIAL.eos
            } else {
                (0..VOCAB as u32)
                    .filter(|t| !used.contains(t))
                    .fold(None, |best: Option<u32>, t| match best {
                        Some(b) if row[b as usize] >= row[t as usize] => Some(b),
                        _ => Some(t),
                    })
                    .unwrap()
            };
            total += row[tok as usize];
            used.insert(tok);
            expected.push(tok);
            prev = input;
            input = tok;
        }
        assert_eq!(line, expected);
        assert!((score - total).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn correlated_positions_share_tokens() -> Result<()> {
        let model = TableModel::new();
        let (source, seq_len) = inputs(&[&[4, 5, 6, 2]])?;
        let mut pattern = vec![0u8; 16];
        for (i, j) in [(0, 0), (1, 1), (2, 2), (3, 3), (0, 2), (2, 0)] {
            pattern[i * 4 + j] = 1;
        }
        let pattern = Tensor::from_vec(pattern, (1, 4, 4), &Device::Cpu)?;
        let generation = BeamSearch::new(&model, SPECIAL)
            .with_analyzer(FixedPattern(pattern))
            .generate(&source, &seq_len, 3)?;

        let hyps = generation.hypotheses()?.remove(0);
        assert_eq!(hyps.len(), 3);
        for (line, score) in &hyps {
            assert_eq!(line[0], line[2]);
            assert_ne!(line[0], line[1]);
            assert_eq!(line[3], SPECIAL.eos);
            assert!(!SPECIAL.contains(line[0]) && !SPECIAL.contains(line[1]));
            assert!(score.is_finite());
        }
        Ok(())
    }

    #[test]
    fn repeated_source_characters_are_mirrored() -> Result<()> {
        let model = TableModel::new();
        // 4 5 4 5 6: positions {0,2} and {1,3} correlated
        let (source, seq_len) = inputs(&[&[4, 5, 4, 5, 6, 2]])?;
        let generation = BeamSearch::new(&model, SPECIAL).generate(&source, &seq_len, 4)?;
        for (line, _) in generation.hypotheses()?.remove(0) {
            assert_eq!(line[0], line[2]);
            assert_eq!(line[1], line[3]);
            let distinct: HashSet<u32> = [line[0], line[1], line[4]].into_iter().collect();
            assert_eq!(distinct.len(), 3);
            assert_eq!(line[5], SPECIAL.eos);
        }
        Ok(())
    }

    #[test]
    fn identity_pattern_matches_reference_search() -> Result<()> {
        let model = TableModel::new();
        let (source, seq_len) = inputs(&[&[4, 5, 6, 7, 8, 2]])?;
        let generation = BeamSearch::new(&model, SPECIAL)
            .with_analyzer(FixedPattern(identity(1, 6)?))
            .generate(&source, &seq_len, 3)?;
        let got = generation.hypotheses()?.remove(0);
        let want = reference_beam_search(&model, 6, 3);
        assert_eq!(got.len(), want.len());
        for ((g_line, g_score), (w_line, w_score)) in got.iter().zip(&want) {
            assert_eq!(g_line, w_line);
            assert!((g_score - w_score).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn lines_end_with_eos_and_never_repeat() -> Result<()> {
        let model = TableModel::new();
        let (source, seq_len) = inputs(&[&[4, 5, 6, 7, 2], &[8, 9, 2]])?;
        let generation = BeamSearch::new(&model, SPECIAL).generate(&source, &seq_len, 4)?;
        assert_eq!(generation.tokens.dims(), &[2, 4, 5]);
        for (b, hyps) in generation.hypotheses()?.into_iter().enumerate() {
            let len = [5, 3][b];
            for (line, _) in hyps {
                assert_eq!(line.len(), len);
                assert_eq!(line[len - 1], SPECIAL.eos);
                let body: HashSet<u32> = line[..len - 1].iter().copied().collect();
                assert_eq!(body.len(), len - 1);
                assert!(body.iter().all(|&t| !SPECIAL.contains(t)));
            }
        }
        // positions past the true length stay padded
        let tokens = generation.tokens.to_vec3::<u32>()?;
        for line in &tokens[1] {
            assert_eq!(&line[3..], &[SPECIAL.pad, SPECIAL.pad]);
        }
        Ok(())
    }

    #[test]
    fn mixed_length_batch_mirrors_each_row() -> Result<()> {
        let model = TableModel::new();
        let (source, seq_len) = inputs(&[&[4, 5, 4, 2], &[6, 7, 8, 6, 9, 2]])?;
        let generation = BeamSearch::new(&model, SPECIAL).generate(&source, &seq_len, 3)?;

        let hyps = generation.hypotheses()?;
        for (line, _) in &hyps[0] {
            assert_eq!(line[0], line[2]);
            assert_ne!(line[0], line[1]);
            assert_eq!(line[3], SPECIAL.eos);
        }
        for (line, _) in &hyps[1] {
            assert_eq!(line[0], line[3]);
            let distinct: HashSet<u32> = [line[0], line[1], line[2], line[4]].into_iter().collect();
            assert_eq!(distinct.len(), 4);
            assert_eq!(line[5], SPECIAL.eos);
        }
        let tokens = generation.tokens.to_vec3::<u32>()?;
        for line in &tokens[0] {
            assert_eq!(&line[4..], &[SPECIAL.pad, SPECIAL.pad]);
        }
        Ok(())
    }

    #[test]
    fn banned_tokens_are_never_emitted() -> Result<()> {
        let model = TableModel::new();
        let (source, seq_len) = inputs(&[&[4, 5, 6, 7, 2]])?;
        let plain = BeamSearch::new(&model, SPECIAL).generate(&source, &seq_len, 3)?;
        let top_token = plain.hypotheses()?[0][0].0[0];

        let generation = BeamSearch::new(&model, SPECIAL)
            .with_banned(&[3, top_token])
            .generate(&source, &seq_len, 3)?;
        for (line, _) in generation.hypotheses()?.remove(0) {
            assert!(!line.contains(&3), "{line:?}");
            assert!(!line.contains(&top_token), "{line:?}");
            assert_eq!(line[4], SPECIAL.eos);
        }

        let err = BeamSearch::new(&model, SPECIAL)
            .with_banned(&[VOCAB as u32])
            .generate(&source, &seq_len, 1)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoupletError>(),
            Some(CoupletError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn scores_are_descending() -> Result<()> {
        let model = TableModel::new();
        let (source, seq_len) = inputs(&[&[4, 5, 6, 7, 2], &[8, 9, 2]])?;
        let generation = BeamSearch::new(&model, SPECIAL).generate(&source, &seq_len, 5)?;
        for row in generation.scores.to_vec2::<f32>()? {
            assert!(row.windows(2).all(|w| w[0] >= w[1]), "{row:?}");
        }
        Ok(())
    }

    #[test]
    fn frozen_entries_match_a_standalone_run() -> Result<()> {
        let model = TableModel::new();
        let search = BeamSearch::new(&model, SPECIAL);
        let (source, seq_len) = inputs(&[&[4, 5, 6, 7, 2], &[8, 9, 2]])?;
        let batched = search.generate(&source, &seq_len, 3)?.hypotheses()?;

        let (alone_src, alone_len) = inputs(&[&[8, 9, 2]])?;
        let alone = search.generate(&alone_src, &alone_len, 3)?.hypotheses()?;
        assert_eq!(batched[1], alone[0]);
        Ok(())
    }

    #[test]
    fn generation_is_deterministic() -> Result<()> {
        let model = TableModel::new();
        let search = BeamSearch::new(&model, SPECIAL);
        let (source, seq_len) = inputs(&[&[4, 5, 4, 2], &[6, 7, 8, 9, 2]])?;
        let a = search.generate(&source, &seq_len, 3)?;
        let b = search.generate(&source, &seq_len, 3)?;
        assert_eq!(a.tokens.to_vec3::<u32>()?, b.tokens.to_vec3::<u32>()?);
        assert_eq!(a.scores.to_vec2::<f32>()?, b.scores.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn fully_masked_rows_do_not_crash() -> Result<()> {
        let model = TableModel::dead();
        let (source, seq_len) = inputs(&[&[4, 5, 2]])?;
        let generation = BeamSearch::new(&model, SPECIAL).generate(&source, &seq_len, 2)?;
        let scores = generation.scores.to_vec2::<f32>()?;
        assert!(scores[0].iter().all(|s| *s == f32::NEG_INFINITY));
        // lowest flat indices win every step, known positions keep their token
        let tokens = generation.tokens.to_vec3::<u32>()?;
        assert_eq!(tokens[0], vec![vec![0, 0, SPECIAL.eos], vec![0, 0, SPECIAL.eos]]);
        Ok(())
    }
}
