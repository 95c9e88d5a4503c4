//! The native safetensors inference pipeline for the PocketTTS-style
//! on-device text-to-speech runtime: tensor store, tokenizer, chunker,
//! model params, numeric kernels, the four-stage generation pipeline, and
//! the `Runtime` façade that ties them together.

pub mod config;
pub mod error;
pub mod kernels;
pub mod model;
pub mod pipeline;
mod runtime;
pub mod store;
pub mod text;
pub mod voice;

pub use config::{RuntimeGenerateConfig, StepCallback};
pub use error::CoreError;
pub use model::{ModelConfig, ModelParams};
pub use runtime::{PCMChunk, Runtime};
pub use store::{IdentityMapper, KeyMapper, OpenOptions, PrefixStripMapper, RemapMode, Store};
pub use text::{normalize, prepare_chunks, Chunk, SentencePieceModel};
pub use voice::{VoiceBank, VoiceEmbedding};
