use pockettts_base::Tensor;

use crate::error::CoreError;
use crate::store::Store;

/// Fixed architectural hyperparameters. Learned weights live in
/// [`ModelParams`]; these are the scalar choices the catalog can't infer
/// (or inference of which is itself documented below).
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    pub max_seq_len: usize,
    pub rope_base: f32,
    pub rms_norm_eps: f32,
    pub latent_dim: usize,
    pub voice_embedding_dim: usize,
    pub samples_per_latent_frame: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            vocab_size: 4001,
            hidden_size: 1024,
            intermediate_size: 4096,
            num_layers: 6,
            num_heads: 16,
            head_dim: 64,
            max_seq_len: 2048,
            rope_base: 10_000.0,
            rms_norm_eps: 1e-6,
            latent_dim: 32,
            voice_embedding_dim: 1024,
            samples_per_latent_frame: 1920,
        }
    }
}

/// One flow-LM transformer layer's resolved weights.
pub struct LayerWeights {
    pub q_proj: Tensor<f32>,
    pub k_proj: Tensor<f32>,
    pub v_proj: Tensor<f32>,
    pub o_proj: Tensor<f32>,
    pub norm1: Tensor<f32>,
    pub norm2: Tensor<f32>,
    /// Gate projection of the gated MLP (`silu(W1 x)`).
    pub ff_w1: Tensor<f32>,
    /// Down projection of the gated MLP.
    pub ff_w2: Tensor<f32>,
    /// Up projection of the gated MLP (`W3 x`).
    pub ff_w3: Tensor<f32>,
}

/// The latent flow decoder's small residual network, applied identically at
/// every Euler step.
pub struct LsdWeights {
    pub layers: Vec<Tensor<f32>>,
}

/// The Mimi vocoder's stacked conv-transpose upsamplers and residual blocks.
pub struct VocoderWeights {
    pub blocks: Vec<Tensor<f32>>,
    pub final_conv: Tensor<f32>,
}

/// Resolved, typed, immutable view over every tensor the pipeline needs.
/// Constructed once from a [`Store`]; shared read-only across generations.
pub struct ModelParams {
    pub config: ModelConfig,
    pub text_emb: Tensor<f32>,
    pub layers: Vec<LayerWeights>,
    pub norm_final: Tensor<f32>,
    /// Projects the previous step's latent frame (or start-of-stream vector)
    /// up into model dimension as the next step's transformer input.
    pub input_proj: Tensor<f32>,
    /// Projects the final hidden state down to per-code logits for Stage-B
    /// sampling, shape `[vocab_size, hidden_size]`.
    pub logits_proj: Tensor<f32>,
    /// Codebook mapping a sampled code index to a latent frame, shape
    /// `[vocab_size, latent_dim]`.
    pub latent_codebook: Tensor<f32>,
    /// Projects the final hidden state down to the scalar EOS logit, shape
    /// `[1, hidden_size]`.
    pub eos_proj: Tensor<f32>,
    pub lsd: LsdWeights,
    pub vocoder: VocoderWeights,
}

fn require(store: &Store, key: &str) -> Result<Tensor<f32>, CoreError> {
    store.tensor(key)
}

impl ModelParams {
    /// Resolve the fixed weight catalog documented in §4.4 from an opened
    /// store. `default_config` supplies scalar hyperparameters that cannot
    /// be read back out of tensor shapes (e.g. `rope_base`); everything
    /// shape-derivable is cross-checked against it rather than trusted
    /// blindly.
    pub fn load_from_store(store: &Store, default_config: ModelConfig) -> Result<Self, CoreError> {
        let text_emb = require(store, "text_emb")?;

        let mut layers = Vec::new();
        let mut hidden_size = None;
        let mut num_heads = default_config.num_heads;

        let mut i = 0;
        loop {
            let prefix = format!("flow_transformer.layers.{i}");
            let q_key = format!("{prefix}.self_attn.q_proj");
            if store.shape_of(&q_key).is_none() {
                break;
            }

            let q_proj = require(store, &q_key)?;
            let k_proj = require(store, &format!("{prefix}.self_attn.k_proj"))?;
            let v_proj = require(store, &format!("{prefix}.self_attn.v_proj"))?;
            let o_proj = require(store, &format!("{prefix}.self_attn.o_proj"))?;
            let norm1 = require(store, &format!("{prefix}.norm1"))?;
            let norm2 = require(store, &format!("{prefix}.norm2"))?;
            let ff_w1 = require(store, &format!("{prefix}.ff.w1"))?;
            let ff_w2 = require(store, &format!("{prefix}.ff.w2"))?;
            let ff_w3 = require(store, &format!("{prefix}.ff.w3"))?;

            if q_proj.shape.len() != 2 {
                return Err(CoreError::Schema {
                    detail: format!(
                        "{q_key} must be rank 2, got shape {:?}",
                        q_proj.shape
                    ),
                });
            }
            let layer_hidden = q_proj.shape[1];
            match hidden_size {
                None => hidden_size = Some(layer_hidden),
                Some(expected) if expected != layer_hidden => {
                    return Err(CoreError::Schema {
                        detail: format!(
                            "layer {i} model dim {layer_hidden} disagrees with layer 0's {expected}"
                        ),
                    });
                }
                _ => {}
            }

            if layer_hidden % num_heads != 0 {
                if layer_hidden % default_config.num_heads == 0 {
                    num_heads = default_config.num_heads;
                } else {
                    return Err(CoreError::Schema {
                        detail: format!(
                            "model dim {layer_hidden} is not divisible by head count {num_heads}"
                        ),
                    });
                }
            }

            layers.push(LayerWeights {
                q_proj,
                k_proj,
                v_proj,
                o_proj,
                norm1,
                norm2,
                ff_w1,
                ff_w2,
                ff_w3,
            });
            i += 1;
        }

        if layers.is_empty() {
            return Err(CoreError::Schema {
                detail: "no flow_transformer layers found (expected flow_transformer.layers.0.*)"
                    .to_string(),
            });
        }

        let norm_final = require(store, "flow_transformer.norm_final")?;
        let input_proj = require(store, "flow_transformer.input_proj")?;
        let logits_proj = require(store, "flow_transformer.logits_proj")?;
        let latent_codebook = require(store, "flow_transformer.latent_codebook")?;
        let eos_proj = require(store, "flow_transformer.eos_proj")?;

        let mut lsd_layers = Vec::new();
        let mut j = 0;
        loop {
            let key = format!("lsd_decode.net.{j}");
            if store.shape_of(&key).is_none() {
                break;
            }
            lsd_layers.push(require(store, &key)?);
            j += 1;
        }
        if lsd_layers.is_empty() {
            return Err(CoreError::Schema {
                detail: "no lsd_decode.net.* tensors found".to_string(),
            });
        }

        let mut vocoder_blocks = Vec::new();
        let mut k = 0;
        loop {
            let key = format!("mimi_decode.decoder.model.{k}");
            if store.shape_of(&key).is_none() {
                break;
            }
            vocoder_blocks.push(require(store, &key)?);
            k += 1;
        }
        let final_conv = require(store, "mimi_decode.decoder.final_conv")?;

        // Every even-index vocoder block is a ConvTranspose1D upsampler
        // (`run_vocoder`'s stride = kernel_size / 2 convention); their
        // combined stride is exactly how many waveform samples one Stage-C
        // latent frame expands into, so it is derived rather than trusted to
        // `default_config` whenever the catalog has upsampler blocks at all.
        let samples_per_latent_frame = vocoder_blocks
            .iter()
            .enumerate()
            .filter(|(idx, _)| idx % 2 == 0)
            .map(|(_, block)| (block.shape[2] / 2).max(1))
            .product::<usize>();

        let resolved_hidden_size = hidden_size.unwrap_or(default_config.hidden_size);
        let config = ModelConfig {
            hidden_size: resolved_hidden_size,
            num_layers: layers.len(),
            num_heads,
            head_dim: resolved_hidden_size / num_heads,
            samples_per_latent_frame: if samples_per_latent_frame > 0 {
                samples_per_latent_frame
            } else {
                default_config.samples_per_latent_frame
            },
            ..default_config
        };

        let decoder_out_channels = *lsd_layers
            .last()
            .and_then(|t| t.shape.first())
            .unwrap_or(&config.latent_dim);
        let vocoder_in_channels = *vocoder_blocks
            .first()
            .and_then(|t| t.shape.get(1))
            .unwrap_or(&decoder_out_channels);
        if vocoder_blocks
            .first()
            .is_some_and(|_| vocoder_in_channels != decoder_out_channels)
        {
            return Err(CoreError::Schema {
                detail: format!(
                    "vocoder input channels {vocoder_in_channels} do not match flow-decoder output channels {decoder_out_channels}"
                ),
            });
        }

        Ok(ModelParams {
            config,
            text_emb,
            layers,
            norm_final,
            input_proj,
            logits_proj,
            latent_codebook,
            eos_proj,
            lsd: LsdWeights { layers: lsd_layers },
            vocoder: VocoderWeights {
                blocks: vocoder_blocks,
                final_conv,
            },
        })
    }
}
