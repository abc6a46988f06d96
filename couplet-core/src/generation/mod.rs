pub mod beam;

pub use beam::{BeamSearch, Generation};

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::CoupletError;

/// Knobs for one prediction call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Hypotheses kept per line while searching.
    pub beam_size: usize,
    /// Candidates returned per line, at most `beam_size`. All of them when unset.
    pub num_return: Option<usize>,
    /// Force inference on CPU even if an accelerator is present.
    pub force_cpu: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            beam_size: 1,
            num_return: None,
            force_cpu: false,
        }
    }
}

impl GenerationConfig {
    pub fn with_beam_size(beam_size: usize) -> Self {
        Self {
            beam_size,
            ..Default::default()
        }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.beam_size == 0 {
            return Err(CoupletError::invalid("beam_size must be greater than 0").into());
        }
        match self.num_return {
            Some(0) => Err(CoupletError::invalid("num_return must be greater than 0").into()),
            Some(n) if n > self.beam_size => Err(CoupletError::invalid(format!(
                "num_return {n} exceeds beam_size {}",
                self.beam_size
            ))
            .into()),
            _ => Ok(()),
        }
    }

    /// Number of candidates handed back per line.
    pub fn returned(&self) -> usize {
        self.num_return.unwrap_or(self.beam_size)
    }
}
