use pockettts_base::Epoch;

use crate::config::RuntimeGenerateConfig;
use crate::error::CoreError;
use crate::kernels::{
    attend_single_step, linear, rms_norm, silu, softmax_in_place, DeterministicRng, KVCache,
    RotaryTables,
};
use crate::model::{LayerWeights, ModelConfig, ModelParams};
use crate::pipeline::conditioner::ConditioningSequence;
use crate::text::Chunk;

/// Stage-B output: the generated latent sequence, flattened row-major
/// `[frame_count, latent_dim]`.
pub struct FlowLmOutput {
    pub latents: Vec<f32>,
    pub frame_count: usize,
}

/// Mutates `hidden` (length `config.hidden_size`) in place through one
/// transformer layer: RMSNorm -> self-attention (RoPE, causal, KV cache
/// appended at `position`) -> residual; RMSNorm -> gated MLP -> residual.
fn apply_layer(
    layer: &LayerWeights,
    kv_cache: &mut KVCache,
    rope: &RotaryTables,
    hidden: &mut [f32],
    position: usize,
    config: &ModelConfig,
) {
    let d = config.hidden_size;
    let eps = config.rms_norm_eps;

    let normed = rms_norm(hidden, d, eps, &layer.norm1.data);
    let mut q = linear(&normed, d, &layer.q_proj.data, d, None);
    let mut k = linear(&normed, d, &layer.k_proj.data, d, None);
    let v = linear(&normed, d, &layer.v_proj.data, d, None);

    rope.apply(&mut q, config.num_heads, position);
    rope.apply(&mut k, config.num_heads, position);

    kv_cache.append(&k, &v);
    let attn_out = attend_single_step(&q, kv_cache, config.num_heads, config.head_dim);
    let o = linear(&attn_out, d, &layer.o_proj.data, d, None);
    for (h, o_val) in hidden.iter_mut().zip(o.iter()) {
        *h += o_val;
    }

    let normed2 = rms_norm(hidden, d, eps, &layer.norm2.data);
    let mut gate = linear(&normed2, d, &layer.ff_w1.data, config.intermediate_size, None);
    for g in gate.iter_mut() {
        *g = silu(*g);
    }
    let up = linear(&normed2, d, &layer.ff_w3.data, config.intermediate_size, None);
    let gated: Vec<f32> = gate.iter().zip(up.iter()).map(|(g, u)| g * u).collect();
    let down = linear(&gated, config.intermediate_size, &layer.ff_w2.data, d, None);
    for (h, d_val) in hidden.iter_mut().zip(down.iter()) {
        *h += d_val;
    }
}

fn run_all_layers(
    params: &ModelParams,
    kv_caches: &mut [KVCache],
    rope: &RotaryTables,
    hidden: &mut [f32],
    position: usize,
) {
    for (layer, kv_cache) in params.layers.iter().zip(kv_caches.iter_mut()) {
        apply_layer(layer, kv_cache, rope, hidden, position, &params.config);
    }
}

/// Picks the index of the highest value; ties resolve to the lowest index
/// (first occurrence wins under `>`, per the spec's stable tie-break rule).
fn argmax(values: &[f32]) -> usize {
    let mut best_idx = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best_idx = i;
        }
    }
    best_idx
}

/// The autoregressive flow-LM loop (spec Stage B). `cond` has already been
/// prefilled through the KV caches before generation proper starts; the
/// first generation step always begins from a start-of-stream latent
/// (zero vector — the catalog names no explicit BOS tensor).
pub fn run_flow_lm(
    params: &ModelParams,
    cond: &ConditioningSequence,
    chunk: &Chunk,
    config: &RuntimeGenerateConfig,
    rng: &mut DeterministicRng,
    epoch: &Epoch,
    my_epoch: u64,
    mut step_callback: Option<&mut (dyn FnMut(usize, usize) + Send)>,
) -> Result<FlowLmOutput, CoreError> {
    let d = params.config.hidden_size;
    let latent_dim = params.config.latent_dim;
    let max_seq = cond.len + config.max_steps;

    let rope = RotaryTables::new(params.config.head_dim, params.config.rope_base, max_seq);
    let mut kv_caches: Vec<KVCache> = params
        .layers
        .iter()
        .map(|_| KVCache::new(params.config.num_heads, max_seq, params.config.head_dim))
        .collect();

    // Prefill: run the conditioning sequence through every layer so the KV
    // caches hold its keys/values before causal generation begins. The
    // resulting hidden states themselves are not needed downstream.
    for position in 0..cond.len {
        let mut hidden = cond.frames[position * d..(position + 1) * d].to_vec();
        run_all_layers(params, &mut kv_caches, &rope, &mut hidden, position);
    }

    let mut latents = Vec::new();
    let mut current_latent = vec![0.0f32; latent_dim];
    let mut eos_step: Option<usize> = None;
    let mut frame_count = 0usize;

    for step in 0..config.max_steps {
        if !epoch.is_current(my_epoch) {
            return Err(CoreError::Cancelled);
        }

        let position = cond.len + step;
        let mut hidden = linear(&current_latent, latent_dim, &params.input_proj.data, d, None);
        run_all_layers(params, &mut kv_caches, &rope, &mut hidden, position);

        let normed_final = rms_norm(&hidden, d, params.config.rms_norm_eps, &params.norm_final.data);
        let logits = linear(&normed_final, d, &params.logits_proj.data, params.config.vocab_size, None);
        let eos_logit = linear(&normed_final, d, &params.eos_proj.data, 1, None)[0];

        if eos_step.is_none() && (eos_logit as f64) > config.eos_threshold {
            eos_step = Some(step);
        }
        if let Some(eos_at) = eos_step {
            if step.saturating_sub(eos_at) >= chunk.frames_after_eos as usize {
                break;
            }
        }

        let sampled_index = if config.temperature <= 0.0 {
            argmax(&logits)
        } else {
            let temp = config.temperature.max(1e-6) as f32;
            let mut probs: Vec<f32> = logits.iter().map(|&v| v / temp).collect();
            softmax_in_place(&mut probs);
            rng.sample_categorical(&probs)
        };

        if !epoch.is_current(my_epoch) {
            return Err(CoreError::Cancelled);
        }

        let row_start = sampled_index * latent_dim;
        let next_latent = params.latent_codebook.data[row_start..row_start + latent_dim].to_vec();
        latents.extend_from_slice(&next_latent);
        current_latent = next_latent;
        frame_count += 1;

        if let Some(cb) = step_callback.as_deref_mut() {
            cb(step, config.max_steps);
        }
    }

    Ok(FlowLmOutput { latents, frame_count })
}
