//! # couplet-core
//!
//! Generates the second line of a Chinese couplet from its first line with a
//! sequence model and a constrained beam search, on top of the
//! [Candle](https://github.com/huggingface/candle) framework.
//!
//! The second line must echo the first line's repeated characters at the
//! same positions and may not otherwise repeat a character.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |---|---|
//! | [`generation`] | Constrained beam search and generation config |
//! | [`pattern`] | Sentence patterns: which output positions must match |
//! | [`models`] | Encoder/decoder step contract and a bigram model |
//! | [`vocab`] | Character vocabulary and special tokens |
//! | [`predictor`] | Text-to-text convenience wrapper |
//! | [`ops`] | Top-k, one-hot and beam tiling helpers |
//! | [`utils`] | Device selection |
//!
//! ## Feature flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | Enable the CUDA device |

pub mod error;
pub mod generation;
pub mod models;
pub mod ops;
pub mod pattern;
pub mod predictor;
pub mod utils;
pub mod vocab;

pub use error::CoupletError;
pub use generation::{BeamSearch, Generation, GenerationConfig};
pub use predictor::{Candidate, CoupletPredictor};
