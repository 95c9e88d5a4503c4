use crate::kernels::{conv1d, conv_transpose1d, silu};
use crate::model::ModelParams;

/// Stage D: turns the refined latent sequence into a mono waveform. The
/// vocoder's block catalog alternates upsamplers and residual refinement
/// blocks: even index -> `ConvTranspose1D` (time axis multiplied by a fixed
/// integer factor), odd index -> a same-padded residual `Conv1D` block
/// (`y = x + silu(conv1d(x))`). `final_conv` maps the last upsampler's
/// channel width down to one (mono) channel.
pub fn run_vocoder(params: &ModelParams, latents: &[f32], frame_count: usize) -> Vec<f32> {
    let latent_dim = params.config.latent_dim;
    if frame_count == 0 {
        return Vec::new();
    }

    let mut channels = transpose_time_major(latents, frame_count, latent_dim);
    let mut num_channels = latent_dim;
    let mut len = frame_count;

    for (idx, block) in params.vocoder.blocks.iter().enumerate() {
        if idx % 2 == 0 {
            let in_channels = block.shape[0];
            let out_channels = block.shape[1];
            let kernel_size = block.shape[2];
            debug_assert_eq!(in_channels, num_channels, "vocoder upsampler {idx} channel mismatch");

            let stride = (kernel_size / 2).max(1);
            let padding = kernel_size.saturating_sub(stride) / 2;
            channels = conv_transpose1d(
                &channels,
                in_channels,
                len,
                &block.data,
                out_channels,
                kernel_size,
                stride,
                padding,
                None,
                1,
            );
            len = (len - 1) * stride + kernel_size - 2 * padding;
            num_channels = out_channels;
        } else {
            let out_channels = block.shape[0];
            let in_channels = block.shape[1];
            let kernel_size = block.shape[2];
            debug_assert_eq!(in_channels, num_channels, "vocoder residual block {idx} channel mismatch");
            debug_assert_eq!(out_channels, num_channels, "vocoder residual block {idx} must preserve channel count");

            let padding = kernel_size / 2;
            let mut refined = conv1d(&channels, in_channels, len, &block.data, out_channels, kernel_size, 1, padding, 1, None, 1);
            for v in refined.iter_mut() {
                *v = silu(*v);
            }
            for (c, r) in channels.iter_mut().zip(refined.iter()) {
                *c += r;
            }
        }
    }

    let final_conv = &params.vocoder.final_conv;
    let out_channels = final_conv.shape[0];
    let in_channels = final_conv.shape[1];
    let kernel_size = final_conv.shape[2];
    let padding = kernel_size / 2;
    conv1d(&channels, in_channels, len, &final_conv.data, out_channels, kernel_size, 1, padding, 1, None, 1)
}

/// `[T, D] -> [D, T]` (time-major to channel-major, row-major flat layout).
fn transpose_time_major(input: &[f32], frames: usize, dim: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; frames * dim];
    for t in 0..frames {
        for d in 0..dim {
            out[d * frames + t] = input[t * dim + d];
        }
    }
    out
}
