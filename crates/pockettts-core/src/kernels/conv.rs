/// `Conv1D`: input `[in_channels, in_len]`, weight `[out_channels, in_channels,
/// kernel_size]`, optional bias `[out_channels]`. Standard stride/padding/
/// dilation semantics; output length follows the usual convolution formula.
///
/// `workers` controls how many output channels are computed concurrently
/// (1 = sequential); the thread pool is spawned and joined within this call,
/// so no work escapes it.
pub fn conv1d(
    input: &[f32],
    in_channels: usize,
    in_len: usize,
    weight: &[f32],
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
    bias: Option<&[f32]>,
    workers: usize,
) -> Vec<f32> {
    assert_eq!(input.len(), in_channels * in_len);
    assert_eq!(weight.len(), out_channels * in_channels * kernel_size);

    let out_len = (in_len + 2 * padding).saturating_sub(dilation * (kernel_size - 1) + 1) / stride + 1;
    let mut out = vec![0.0f32; out_channels * out_len];

    let compute_channel = |oc: usize, out_row: &mut [f32]| {
        for (t, slot) in out_row.iter_mut().enumerate() {
            let mut acc = bias.map(|b| b[oc]).unwrap_or(0.0);
            let origin = t * stride;
            for ic in 0..in_channels {
                let in_row = &input[ic * in_len..(ic + 1) * in_len];
                let w_row = &weight[(oc * in_channels + ic) * kernel_size..(oc * in_channels + ic + 1) * kernel_size];
                for kk in 0..kernel_size {
                    let pos = origin + kk * dilation;
                    if pos < padding {
                        continue;
                    }
                    let pos = pos - padding;
                    if pos >= in_len {
                        continue;
                    }
                    acc += in_row[pos] * w_row[kk];
                }
            }
            *slot = acc;
        }
    };

    run_parallel_over_channels(&mut out, out_channels, out_len, workers, compute_channel);
    out
}

/// `ConvTranspose1D`: input `[in_channels, in_len]`, weight `[in_channels,
/// out_channels, kernel_size]` (PyTorch transpose-conv layout), optional
/// bias `[out_channels]`.
pub fn conv_transpose1d(
    input: &[f32],
    in_channels: usize,
    in_len: usize,
    weight: &[f32],
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    bias: Option<&[f32]>,
    workers: usize,
) -> Vec<f32> {
    assert_eq!(input.len(), in_channels * in_len);
    assert_eq!(weight.len(), in_channels * out_channels * kernel_size);

    let out_len = (in_len - 1) * stride + kernel_size - 2 * padding;
    let mut out = vec![0.0f32; out_channels * out_len];

    let compute_channel = |oc: usize, out_row: &mut [f32]| {
        if let Some(bias) = bias {
            for v in out_row.iter_mut() {
                *v = bias[oc];
            }
        }
        for ic in 0..in_channels {
            let in_row = &input[ic * in_len..(ic + 1) * in_len];
            let w_row = &weight[(ic * out_channels + oc) * kernel_size..(ic * out_channels + oc + 1) * kernel_size];
            for (t, &x) in in_row.iter().enumerate() {
                if x == 0.0 {
                    continue;
                }
                let origin = t * stride;
                for kk in 0..kernel_size {
                    let pos = origin + kk;
                    if pos < padding {
                        continue;
                    }
                    let pos = pos - padding;
                    if pos >= out_row.len() {
                        continue;
                    }
                    out_row[pos] += x * w_row[kk];
                }
            }
        }
    };

    run_parallel_over_channels(&mut out, out_channels, out_len, workers, compute_channel);
    out
}

fn run_parallel_over_channels<F>(out: &mut [f32], channels: usize, stride: usize, workers: usize, f: F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    let workers = workers.max(1);
    if workers == 1 || channels <= 1 {
        for (oc, row) in out.chunks_mut(stride).enumerate().take(channels) {
            f(oc, row);
        }
        return;
    }

    std::thread::scope(|scope| {
        let chunk_size = channels.div_ceil(workers);
        for (worker_idx, chunk) in out.chunks_mut(stride * chunk_size).enumerate() {
            let f = &f;
            scope.spawn(move || {
                let base = worker_idx * chunk_size;
                for (offset, row) in chunk.chunks_mut(stride).enumerate() {
                    f(base + offset, row);
                }
            });
        }
    });
}
