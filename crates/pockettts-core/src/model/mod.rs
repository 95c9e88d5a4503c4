mod params;

pub use params::{LayerWeights, LsdWeights, ModelConfig, ModelParams, VocoderWeights};
