use pockettts_base::Tensor;

use crate::kernels::{linear, silu};
use crate::model::ModelParams;

/// Stage C: refines the Stage-B latent sequence in place via Euler
/// integration of a learned vector field, `z <- z + (1/N) * v(z, t)`, over
/// `steps` uniform steps. `N = 1` degenerates to a single residual pass.
/// The network has no randomness (spec §4.6 describes a plain ODE, not a
/// flow-matching prior draw).
pub fn run_lsd(params: &ModelParams, latents: &[f32], frame_count: usize, steps: usize) -> Vec<f32> {
    let latent_dim = params.config.latent_dim;
    let mut z = latents.to_vec();
    if frame_count == 0 || steps == 0 {
        return z;
    }

    let dt = 1.0f32 / steps as f32;
    for step in 0..steps {
        let t = step as f32 / steps as f32;
        let mut velocity = vec![0.0f32; frame_count * latent_dim];
        for frame_idx in 0..frame_count {
            let frame = &z[frame_idx * latent_dim..(frame_idx + 1) * latent_dim];
            let v = forward_net(&params.lsd.layers, frame, t);
            velocity[frame_idx * latent_dim..(frame_idx + 1) * latent_dim].copy_from_slice(&v);
        }
        for (z_val, v_val) in z.iter_mut().zip(velocity.iter()) {
            *z_val += dt * v_val;
        }
    }
    z
}

/// Runs one latent frame through the fixed residual net, gated with SiLU
/// between layers (no activation after the last). Whether the time scalar
/// is concatenated to the input is inferred from the first layer's declared
/// input width, the same shape-driven-inference style `ModelParams` uses.
fn forward_net(layers: &[Tensor<f32>], frame: &[f32], t: f32) -> Vec<f32> {
    let mut input = frame.to_vec();
    if let Some(first) = layers.first() {
        if first.shape[1] == frame.len() + 1 {
            input.push(t);
        }
    }

    let last_idx = layers.len().saturating_sub(1);
    let mut current = input;
    for (idx, layer) in layers.iter().enumerate() {
        let out_dim = layer.shape[0];
        let in_dim = layer.shape[1];
        current = linear(&current, in_dim, &layer.data, out_dim, None);
        if idx != last_idx {
            for v in current.iter_mut() {
                *v = silu(*v);
            }
        }
    }
    current
}
