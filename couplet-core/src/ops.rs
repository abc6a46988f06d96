//! Small tensor helpers shared by the beam search.
//!
//! - `topk_per_row` — host-side top-k over each row of a flattened score matrix
//! - `token_one_hot` — (N,) token ids to an (N, vocab) u8 mask
//! - `tile_beams` — replicate each batch entry K times along one axis

use std::cmp::Ordering;

use candle_core::{DType, Device, Result, Tensor};

/// Descending by score, then ascending by index. NaN sorts as `-inf`, so an
/// all-masked row still yields its lowest indices.
fn rank(a: &(f32, u32), b: &(f32, u32)) -> Ordering {
    let key = |v: f32| if v.is_nan() { f32::NEG_INFINITY } else { v };
    key(b.0)
        .partial_cmp(&key(a.0))
        .unwrap_or(Ordering::Equal)
        .then(a.1.cmp(&b.1))
}

/// Top-k of every row of a row-major `rows x cols` matrix.
///
/// Returns one `Vec<(index, score)>` per row, best first.
pub fn topk_per_row(scores: &[f32], cols: usize, k: usize) -> Result<Vec<Vec<(u32, f32)>>> {
    if cols == 0 || scores.len() % cols != 0 {
        candle_core::bail!("topk_per_row: {} scores do not split into rows of {cols}", scores.len());
    }
    if k == 0 || k > cols {
        candle_core::bail!("topk_per_row: invalid k {k} for rows of {cols}");
    }
    let rows = scores
        .chunks(cols)
        .map(|row| {
            let mut pairs: Vec<(f32, u32)> = row
                .iter()
                .enumerate()
                .map(|(i, &v)| (v, i as u32))
                .collect();
            if k < pairs.len() {
                pairs.select_nth_unstable_by(k - 1, rank);
                pairs.truncate(k);
            }
            pairs.sort_by(rank);
            pairs.into_iter().map(|(v, i)| (i, v)).collect()
        })
        .collect();
    Ok(rows)
}

/// (N,) u32 token ids -> (N, vocab_size) u8 with a single 1 per row.
pub fn token_one_hot(tokens: &Tensor, vocab_size: usize) -> Result<Tensor> {
    let ids = Tensor::arange(0u32, vocab_size as u32, tokens.device())?.unsqueeze(0)?;
    tokens.to_dtype(DType::U32)?.unsqueeze(1)?.broadcast_eq(&ids)
}

/// Repeats every entry along `dim` K times in place, so that entry `b`
/// becomes entries `b*k .. b*k + k`.
pub fn tile_beams(t: &Tensor, k: usize, dim: usize) -> Result<Tensor> {
    if k == 1 {
        return Ok(t.clone());
    }
    let copies = vec![t.clone(); k];
    Tensor::stack(&copies, dim + 1)?.flatten(dim, dim + 1)
}

/// (B·K, 1) scores with slot 0 of every beam block at zero and the rest at `-inf`.
pub fn initial_beam_scores(batch_size: usize, k: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = (0..batch_size * k)
        .map(|slot| if slot % k == 0 { 0.0 } else { f32::NEG_INFINITY })
        .collect();
    Tensor::from_vec(data, (batch_size * k, 1), device)
}
