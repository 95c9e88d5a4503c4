mod chunker;
mod normalize;
mod tokenizer;

pub use chunker::{prepare_chunks, Chunk};
pub use normalize::normalize;
pub use tokenizer::{SentencePieceModel, TokenizerError};
