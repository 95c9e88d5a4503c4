/// Precomputed rotary embedding sine/cosine tables, indexed by absolute
/// position, for a fixed `head_dim` and `base`.
pub struct RotaryTables {
    head_dim: usize,
    /// `[max_positions][head_dim/2]`
    cos: Vec<Vec<f32>>,
    sin: Vec<Vec<f32>>,
}

impl RotaryTables {
    pub fn new(head_dim: usize, base: f32, max_positions: usize) -> Self {
        assert_eq!(head_dim % 2, 0, "RoPE requires an even head_dim");
        let half = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| 1.0 / base.powf((2 * i) as f32 / head_dim as f32))
            .collect();

        let mut cos = Vec::with_capacity(max_positions);
        let mut sin = Vec::with_capacity(max_positions);
        for pos in 0..max_positions {
            let mut cos_row = Vec::with_capacity(half);
            let mut sin_row = Vec::with_capacity(half);
            for &freq in &inv_freq {
                let angle = pos as f32 * freq;
                cos_row.push(angle.cos());
                sin_row.push(angle.sin());
            }
            cos.push(cos_row);
            sin.push(sin_row);
        }

        RotaryTables { head_dim, cos, sin }
    }

    /// Apply rotary embedding in place to a `[heads, head_dim]` tensor at the
    /// given absolute position, using the rotate-half convention.
    pub fn apply(&self, x: &mut [f32], heads: usize, position: usize) {
        assert_eq!(x.len(), heads * self.head_dim);
        let half = self.head_dim / 2;
        let cos = &self.cos[position];
        let sin = &self.sin[position];

        for h in 0..heads {
            let row = &mut x[h * self.head_dim..(h + 1) * self.head_dim];
            for i in 0..half {
                let a = row[i];
                let b = row[i + half];
                row[i] = a * cos[i] - b * sin[i];
                row[i + half] = b * cos[i] + a * sin[i];
            }
        }
    }
}
