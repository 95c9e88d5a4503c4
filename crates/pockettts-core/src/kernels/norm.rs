/// Per-last-axis layer normalization with learned scale and optional bias.
pub fn layer_norm(x: &[f32], dim: usize, eps: f32, scale: &[f32], bias: Option<&[f32]>) -> Vec<f32> {
    assert_eq!(scale.len(), dim);
    let rows = x.len() / dim;
    let mut out = vec![0.0f32; x.len()];
    for r in 0..rows {
        let row = &x[r * dim..(r + 1) * dim];
        let mean = row.iter().sum::<f32>() / dim as f32;
        let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / dim as f32;
        let denom = (var + eps).sqrt();
        let out_row = &mut out[r * dim..(r + 1) * dim];
        for (i, &v) in row.iter().enumerate() {
            let normed = (v - mean) / denom * scale[i];
            out_row[i] = match bias {
                Some(b) => normed + b[i],
                None => normed,
            };
        }
    }
    out
}

/// Per-last-axis RMSNorm (no mean subtraction), with learned scale.
pub fn rms_norm(x: &[f32], dim: usize, eps: f32, scale: &[f32]) -> Vec<f32> {
    assert_eq!(scale.len(), dim);
    let rows = x.len() / dim;
    let mut out = vec![0.0f32; x.len()];
    for r in 0..rows {
        let row = &x[r * dim..(r + 1) * dim];
        let mean_sq = row.iter().map(|v| v * v).sum::<f32>() / dim as f32;
        let denom = (mean_sq + eps).sqrt();
        let out_row = &mut out[r * dim..(r + 1) * dim];
        for (i, &v) in row.iter().enumerate() {
            out_row[i] = (v / denom) * scale[i];
        }
    }
    out
}
