//! Sentence patterns: which output positions must carry the same token.
//!
//! A couplet's second line repeats a character exactly where the first line
//! does. [`CharacterPattern`] derives the (B, L, L) correspondence matrix from
//! the source ids, and [`SentencePattern`] turns it into the lookup tables the
//! beam search consults at every step.

use anyhow::Result;
use candle_core::{DType, Tensor};

use crate::error::CoupletError;

pub trait PatternAnalyzer {
    /// Returns a (B, L, L) u8 matrix, symmetric per batch element; entry
    /// (i, j) set means output positions i and j must hold equal tokens.
    fn sentence_pattern(&self, source: &Tensor, pad_mask: Option<&Tensor>) -> Result<Tensor>;
}

impl<T: PatternAnalyzer + ?Sized> PatternAnalyzer for &T {
    fn sentence_pattern(&self, source: &Tensor, pad_mask: Option<&Tensor>) -> Result<Tensor> {
        (**self).sentence_pattern(source, pad_mask)
    }
}

/// Equal source characters correlate their positions. Padding and the
/// excluded ids (typically `[UNK]`, which stands for many characters)
/// correlate with nothing.
#[derive(Debug, Clone, Default)]
pub struct CharacterPattern {
    exclude: Vec<u32>,
}

impl CharacterPattern {
    pub fn excluding(ids: &[u32]) -> Self {
        Self {
            exclude: ids.to_vec(),
        }
    }
}

impl PatternAnalyzer for CharacterPattern {
    fn sentence_pattern(&self, source: &Tensor, pad_mask: Option<&Tensor>) -> Result<Tensor> {
        let source = source.to_dtype(DType::U32)?;
        let same = source.unsqueeze(2)?.broadcast_eq(&source.unsqueeze(1)?)?;

        // valid: (batch_size, fix_len)
        let mut valid = pad_mask
            .map(|m| m.to_dtype(DType::U8)?.eq(0u8))
            .transpose()?;
        for &id in &self.exclude {
            let keep = source.ne(id)?;
            valid = Some(match valid {
                Some(v) => v.mul(&keep)?,
                None => keep,
            });
        }

        let pattern = match valid {
            Some(valid) => {
                let both_valid = valid.unsqueeze(2)?.broadcast_mul(&valid.unsqueeze(1)?)?;
                same.mul(&both_valid)?
            }
            None => same,
        };
        Ok(pattern)
    }
}

/// Per-batch lookup tables precomputed from a pattern matrix.
#[derive(Debug, Clone)]
pub struct SentencePattern {
    fix_len: usize,
    /// (B, L, L) row-major.
    pattern: Vec<bool>,
    /// (B, L): token fixed before the position is reached.
    known: Vec<bool>,
    /// (B, L): writing here must propagate to other positions.
    multi: Vec<bool>,
}

impl SentencePattern {
    pub fn analyze(pattern: &Tensor, seq_len: &[usize]) -> Result<Self> {
        let batch_size = seq_len.len();
        let (b, rows, cols) = pattern.dims3()?;
        if b != batch_size || rows != cols {
            return Err(CoupletError::shape("sentence pattern", (batch_size, "L", "L"), pattern.dims()).into());
        }
        let fix_len = rows;
        if let Some(&len) = seq_len.iter().find(|&&len| len == 0 || len > fix_len) {
            return Err(CoupletError::invalid(format!("sequence length {len} outside 1..={fix_len}")).into());
        }
        let pattern: Vec<bool> = pattern
            .to_dtype(DType::U8)?
            .flatten_all()?
            .to_vec1::<u8>()?
            .into_iter()
            .map(|v| v != 0)
            .collect();

        let at = |b: usize, i: usize, j: usize| pattern[(b * fix_len + i) * fix_len + j];
        let mut known = vec![false; batch_size * fix_len];
        let mut multi = vec![false; batch_size * fix_len];
        for (b, &len) in seq_len.iter().enumerate() {
            for i in 0..fix_len {
                let mut linked = 0usize;
                for j in 0..fix_len {
                    if at(b, i, j) != at(b, j, i) {
                        return Err(CoupletError::invalid(format!(
                            "sentence pattern of batch entry {b} is not symmetric at ({i}, {j})"
                        ))
                        .into());
                    }
                    if at(b, i, j) {
                        linked += 1;
                        if j < i {
                            known[b * fix_len + i] = true;
                        }
                    }
                }
                multi[b * fix_len + i] = linked > 1;
                if i != len - 1 && at(b, i, len - 1) {
                    return Err(CoupletError::invalid(format!(
                        "sentence pattern of batch entry {b} ties position {i} to the end position {}",
                        len - 1
                    ))
                    .into());
                }
            }
            known[b * fix_len + len - 1] = true;
        }

        Ok(Self {
            fix_len,
            pattern,
            known,
            multi,
        })
    }

    pub fn is_known(&self, b: usize, i: usize) -> bool {
        self.known[b * self.fix_len + i]
    }

    pub fn is_multi(&self, b: usize, i: usize) -> bool {
        self.multi[b * self.fix_len + i]
    }

    pub fn correlated(&self, b: usize, i: usize, j: usize) -> bool {
        self.pattern[(b * self.fix_len + i) * self.fix_len + j]
    }

    /// Later positions a token written at `i` must also land in.
    pub fn propagation_targets(&self, b: usize, i: usize) -> impl Iterator<Item = usize> + '_ {
        (i + 1..self.fix_len).filter(move |&j| self.correlated(b, i, j))
    }
}
