use crate::kernels::rms_norm;
use crate::model::ModelParams;

/// Stage A output: `cond[T, D]`, flattened row-major.
pub struct ConditioningSequence {
    pub frames: Vec<f32>,
    pub len: usize,
    pub dim: usize,
}

/// Token-embedding lookup followed by a parameter-free RMSNorm (the model
/// catalog names no separate encoder-stack weights beyond the embedding
/// table itself). If a voice embedding is supplied it is prepended along
/// the time axis.
pub fn run_text_conditioner(
    params: &ModelParams,
    token_ids: &[i64],
    voice_embedding: Option<&[f32]>,
    voice_len: usize,
) -> ConditioningSequence {
    let dim = params.config.hidden_size;
    let unit_scale = vec![1.0f32; dim];

    let mut frames = Vec::with_capacity((voice_len + token_ids.len()) * dim);

    if let Some(voice) = voice_embedding {
        debug_assert_eq!(voice.len(), voice_len * dim);
        frames.extend_from_slice(voice);
    }

    for &token_id in token_ids {
        let row_start = (token_id as usize) * dim;
        let embedding = &params.text_emb.data[row_start..row_start + dim];
        frames.extend_from_slice(embedding);
    }

    let normed = rms_norm(&frames, dim, params.config.rms_norm_eps, &unit_scale);

    ConditioningSequence {
        len: voice_len + token_ids.len(),
        dim,
        frames: normed,
    }
}
