//! Collaborators around the model: vocabularies, noise, pretrained vectors.

pub mod embeddings;
pub mod noise;
pub mod vocabulary;

pub use embeddings::{initialize_embeddings, EmbeddingSource, InitReport, PretrainedEmbeddings};
pub use noise::{word_dropout, NoNoise, NoiseModel, WordBlanking};
pub use vocabulary::{Dictionary, Vocabulary};
