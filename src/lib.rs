//! # unmt-core
//!
//! Transformer encoder-decoder for unsupervised neural machine translation,
//! built on the [Candle](https://github.com/huggingface/candle) framework.
//! One model translates between several languages through language-specific
//! embeddings and start symbols, with an optional variational latent between
//! encoder and decoder.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |---|---|
//! | [`models`] | Attention stack, latent bottleneck, configuration and the text-level `Model` loader |
//! | [`generation`] | Batched beam search, sampled decoding and their configuration |
//! | [`data`] | Vocabulary ids, noise models and pretrained embedding injection |
//! | [`objectives`] | Denoising and back-translation losses |
//! | [`utils`] | Masks, device selection and model file resolution (local or Hub) |
//!
//! ## Feature flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | Enable the CUDA device |
//! | `metal` | Enable the Metal device |

pub mod data;
pub mod generation;
pub mod models;
pub mod objectives;
pub mod utils;

pub use candle_core;
pub use candle_core::{DType, Device, Tensor};
