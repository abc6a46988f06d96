//! Character vocabulary for couplet lines.
//!
//! A line is encoded one character per token and closed with the end token,
//! so the true length of a line counts that end token.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::error::CoupletError;

pub const PAD_TOKEN: &str = "[PAD]";
pub const BOS_TOKEN: &str = "[BOS]";
pub const EOS_TOKEN: &str = "[EOS]";
pub const UNK_TOKEN: &str = "[UNK]";

/// Ids of the tokens the decoder treats specially.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub pad: u32,
    pub bos: u32,
    pub eos: u32,
}

impl SpecialTokens {
    pub fn as_array(&self) -> [u32; 3] {
        [self.bos, self.eos, self.pad]
    }

    pub fn contains(&self, id: u32) -> bool {
        id == self.pad || id == self.bos || id == self.eos
    }
}

#[derive(Debug, Clone)]
pub struct Vocab {
    tokens: Vec<String>,
    ids: HashMap<String, u32>,
    special: SpecialTokens,
    unk: u32,
}

impl Vocab {
    /// Builds a vocabulary where a token's id is its position in `tokens`.
    pub fn from_tokens<I, S>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        let mut ids = HashMap::with_capacity(tokens.len());
        for (id, tok) in tokens.iter().enumerate() {
            if ids.insert(tok.clone(), id as u32).is_some() {
                return Err(CoupletError::Vocab(format!("duplicate token {tok:?}")).into());
            }
        }
        let lookup = |name: &str| {
            ids.get(name)
                .copied()
                .ok_or_else(|| CoupletError::Vocab(format!("missing special token {name}")))
        };
        let special = SpecialTokens {
            pad: lookup(PAD_TOKEN)?,
            bos: lookup(BOS_TOKEN)?,
            eos: lookup(EOS_TOKEN)?,
        };
        let unk = lookup(UNK_TOKEN)?;
        Ok(Self {
            tokens,
            ids,
            special,
            unk,
        })
    }

    /// Plain-text vocabulary, one token per line.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_tokens(data.lines().map(str::trim).filter(|l| !l.is_empty()))
    }

    /// Reuses the token table of a HuggingFace tokenizer. Ids must be dense.
    pub fn from_tokenizer(tokenizer: &Tokenizer) -> Result<Self> {
        let mut entries: Vec<(String, u32)> = tokenizer.get_vocab(true).into_iter().collect();
        entries.sort_by_key(|(_, id)| *id);
        if let Some(pos) = entries.iter().enumerate().position(|(i, (_, id))| *id as usize != i) {
            return Err(CoupletError::Vocab(format!("tokenizer ids are not dense at {pos}")).into());
        }
        Self::from_tokens(entries.into_iter().map(|(tok, _)| tok))
    }

    /// Loads `tokenizer.json` when present, else `vocab.txt`.
    pub fn from_model_dir<P: AsRef<Path>>(model_dir: P) -> Result<Self> {
        let model_dir = model_dir.as_ref();
        let tokenizer_json = model_dir.join("tokenizer.json");
        if tokenizer_json.exists() {
            let tokenizer = Tokenizer::from_file(&tokenizer_json)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Failed to load {}", tokenizer_json.display()))?;
            return Self::from_tokenizer(&tokenizer);
        }
        let vocab_txt = model_dir.join("vocab.txt");
        if !vocab_txt.exists() {
            anyhow::bail!(
                "No vocabulary in {}. Need tokenizer.json or vocab.txt",
                model_dir.display()
            );
        }
        Self::from_file(vocab_txt)
    }

    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    pub fn special(&self) -> SpecialTokens {
        self.special
    }

    /// Id every out-of-vocabulary character encodes to.
    pub fn unk(&self) -> u32 {
        self.unk
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.ids.get(token).copied()
    }

    pub fn id_to_token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    /// Characters of `line` followed by the end token. Whitespace is dropped,
    /// characters outside the table map to `[UNK]`.
    pub fn encode(&self, line: &str) -> Vec<u32> {
        let mut ids: Vec<u32> = line
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| {
                let mut buf = [0u8; 4];
                self.token_to_id(c.encode_utf8(&mut buf)).unwrap_or(self.unk)
            })
            .collect();
        ids.push(self.special.eos);
        ids
    }

    /// Encodes and right-pads `lines` to the longest one.
    ///
    /// Returns `(source (B, fix_len) u32, seq_len (B,) u32)`.
    pub fn encode_batch(&self, lines: &[&str], device: &Device) -> Result<(Tensor, Tensor)> {
        if lines.is_empty() {
            return Err(CoupletError::invalid("cannot encode an empty batch").into());
        }
        let encoded: Vec<Vec<u32>> = lines.iter().map(|l| self.encode(l)).collect();
        let fix_len = encoded.iter().map(Vec::len).max().unwrap_or(1);
        let mut source = Vec::with_capacity(lines.len() * fix_len);
        let mut seq_len = Vec::with_capacity(lines.len());
        for ids in &encoded {
            seq_len.push(ids.len() as u32);
            source.extend_from_slice(ids);
            source.extend(std::iter::repeat(self.special.pad).take(fix_len - ids.len()));
        }
        let source = Tensor::from_vec(source, (lines.len(), fix_len), device)?;
        let seq_len = Tensor::from_vec(seq_len, lines.len(), device)?;
        Ok((source, seq_len))
    }

    /// Text up to the first end token, special tokens skipped.
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .take_while(|&&id| id != self.special.eos)
            .filter(|&&id| !self.special.contains(id) && id != self.unk)
            .filter_map(|&id| self.id_to_token(id))
            .collect()
    }
}
