use crate::voice::VoiceEmbedding;

/// Per-step progress reporter invoked synchronously on the generator thread
/// after each Stage-B iteration. Must be side-effect-limited; the pipeline
/// does not guard against a slow callback stalling generation.
pub type StepCallback = Box<dyn FnMut(usize, usize) + Send>;

/// Enumerated generation options (§4.7). Replaces the source's dynamic
/// config-map style with an explicit struct; there is no escape hatch for
/// unknown keys.
pub struct RuntimeGenerateConfig {
    /// Logit temperature for Stage-B sampling; 0 selects argmax.
    pub temperature: f64,
    /// Raw-logit threshold above which EOS fires (§9 open question:
    /// preserved verbatim as a raw-logit comparison, not a probability).
    pub eos_threshold: f64,
    /// Hard cap on Stage-B iterations.
    pub max_steps: usize,
    /// Number of Euler steps in Stage C.
    pub lsd_decode_steps: usize,
    /// Tail length to continue generating after EOS fires.
    pub frames_after_eos: u32,
    /// Speaker conditioning prefix.
    pub voice_embedding: Option<VoiceEmbedding>,
    /// Per-step progress reporter.
    pub step_callback: Option<StepCallback>,
    /// RNG seed; `None` seeds from process-wide entropy.
    pub seed: Option<u64>,
}

impl Default for RuntimeGenerateConfig {
    fn default() -> Self {
        RuntimeGenerateConfig {
            temperature: 0.7,
            eos_threshold: -4.0,
            max_steps: 256,
            lsd_decode_steps: 1,
            frames_after_eos: 3,
            voice_embedding: None,
            step_callback: None,
            seed: None,
        }
    }
}
