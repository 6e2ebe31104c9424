pub mod config;
pub mod latent;
pub mod model;
pub mod modeling;

pub use config::{ModelConfig, VocabConfig};
pub use latent::{LatentBottleneck, LatentCode};
pub use model::{Decoding, Model};
pub use modeling::{Seq2SeqOutput, Seq2SeqTransformer};
