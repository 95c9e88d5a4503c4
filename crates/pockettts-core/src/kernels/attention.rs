use super::activation::softmax_in_place;

/// Per-layer storage of attention keys and values for prior steps.
///
/// Shape is conceptually `[heads, max_seq, head_dim]`; rows `[0, length)` are
/// populated. Appending a new step grows `length` by 1. Reset to empty
/// between independent generations.
pub struct KVCache {
    heads: usize,
    max_seq: usize,
    head_dim: usize,
    k: Vec<f32>,
    v: Vec<f32>,
    length: usize,
}

impl KVCache {
    pub fn new(heads: usize, max_seq: usize, head_dim: usize) -> Self {
        KVCache {
            heads,
            max_seq,
            head_dim,
            k: vec![0.0; heads * max_seq * head_dim],
            v: vec![0.0; heads * max_seq * head_dim],
            length: 0,
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn reset(&mut self) {
        self.length = 0;
    }

    /// Append one step's `[heads, head_dim]` K and V rows. Panics if the
    /// cache is already at `max_seq` (callers must enforce `MaxSteps <=
    /// max_seq`).
    pub fn append(&mut self, k_step: &[f32], v_step: &[f32]) {
        assert!(self.length < self.max_seq, "KVCache is full");
        assert_eq!(k_step.len(), self.heads * self.head_dim);
        assert_eq!(v_step.len(), self.heads * self.head_dim);

        for h in 0..self.heads {
            let dst_base = h * self.max_seq * self.head_dim + self.length * self.head_dim;
            let src = &k_step[h * self.head_dim..(h + 1) * self.head_dim];
            self.k[dst_base..dst_base + self.head_dim].copy_from_slice(src);
            let src = &v_step[h * self.head_dim..(h + 1) * self.head_dim];
            self.v[dst_base..dst_base + self.head_dim].copy_from_slice(src);
        }
        self.length += 1;
    }

    fn k_row(&self, head: usize, pos: usize) -> &[f32] {
        let base = head * self.max_seq * self.head_dim + pos * self.head_dim;
        &self.k[base..base + self.head_dim]
    }

    fn v_row(&self, head: usize, pos: usize) -> &[f32] {
        let base = head * self.max_seq * self.head_dim + pos * self.head_dim;
        &self.v[base..base + self.head_dim]
    }
}

/// Scaled dot-product causal attention for a single new query step against
/// everything in the cache (which already includes this step's K/V,
/// appended by the caller before calling this function). Returns the
/// `[heads, head_dim]` attention output for the new step.
pub fn attend_single_step(q_step: &[f32], cache: &KVCache, heads: usize, head_dim: usize) -> Vec<f32> {
    assert_eq!(q_step.len(), heads * head_dim);
    let scale = 1.0 / (head_dim as f32).sqrt();
    let length = cache.length();

    let mut out = vec![0.0f32; heads * head_dim];
    let mut scores = vec![0.0f32; length];

    for h in 0..heads {
        let q = &q_step[h * head_dim..(h + 1) * head_dim];
        for (pos, score) in scores.iter_mut().enumerate().take(length) {
            let k = cache.k_row(h, pos);
            *score = q.iter().zip(k.iter()).map(|(a, b)| a * b).sum::<f32>() * scale;
        }
        softmax_in_place(&mut scores);

        let out_row = &mut out[h * head_dim..(h + 1) * head_dim];
        for (pos, &weight) in scores.iter().enumerate() {
            let v = cache.v_row(h, pos);
            for (o, &vv) in out_row.iter_mut().zip(v.iter()) {
                *o += weight * vv;
            }
        }
    }
    out
}
