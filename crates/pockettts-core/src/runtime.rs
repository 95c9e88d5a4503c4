use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pockettts_base::{Epoch, Level, Logger, NoopLogger};

use crate::config::RuntimeGenerateConfig;
use crate::error::CoreError;
use crate::kernels::DeterministicRng;
use crate::model::ModelParams;
use crate::pipeline::{run_flow_lm, run_lsd, run_text_conditioner, run_vocoder};
use crate::text::{normalize, prepare_chunks, Chunk, SentencePieceModel};
use crate::voice::VoiceEmbedding;

/// One chunk of streamed output (§3). `is_final` corresponds to the spec's
/// `final` field (a reserved word in this language).
pub struct PCMChunk {
    pub samples: Vec<f32>,
    pub chunk_index: usize,
    pub is_final: bool,
}

/// Holds loaded model state and exposes the generation entry points.
/// Immutable after construction except for the cancellation epoch and the
/// closed flag; `ModelParams` and the tokenizer are shared read-only across
/// concurrent calls as long as each call owns its own generation state
/// (§5 — Runtime is single-writer per generation, not globally single-writer).
pub struct Runtime {
    params: Arc<ModelParams>,
    tokenizer: Arc<SentencePieceModel>,
    logger: Arc<dyn Logger>,
    epoch: Epoch,
    closed: AtomicBool,
}

impl Runtime {
    pub fn new(params: ModelParams, tokenizer: SentencePieceModel, logger: Option<Arc<dyn Logger>>) -> Self {
        let logger = logger.unwrap_or_else(|| Arc::new(NoopLogger));
        logger.log(Level::Info, "runtime loaded");
        Runtime {
            params: Arc::new(params),
            tokenizer: Arc::new(tokenizer),
            logger,
            epoch: Epoch::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Invalidates any in-flight generation; already-pushed PCMChunks remain
    /// valid (§5). Safe to call from any thread.
    pub fn cancel(&self) {
        self.epoch.advance();
        self.logger.log(Level::Info, "generation cancelled");
    }

    /// Releases held tensors. Subsequent calls fail with `CoreError::Runtime`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<(), CoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::Runtime("runtime is closed".to_string()));
        }
        Ok(())
    }

    /// Runs stages A-D for one chunk of already-tokenized text and returns
    /// the full PCM for it (§4.7). `config.frames_after_eos` governs Stage-B
    /// termination for this call; `config.voice_embedding`, if present, is
    /// prepended as a conditioning prefix.
    pub fn generate_audio(&self, tokens: &[i64], config: &mut RuntimeGenerateConfig) -> Result<Vec<f32>, CoreError> {
        self.ensure_open()?;
        if tokens.is_empty() {
            return Err(CoreError::Runtime("no tokens".to_string()));
        }

        let my_epoch = self.epoch.current();
        if !self.epoch.is_current(my_epoch) {
            return Err(CoreError::Cancelled);
        }

        generate_one_chunk(&self.params, tokens, config.frames_after_eos, config, &self.epoch, my_epoch)
    }

    /// Normalizes, chunks, and synthesizes `text` sequentially, pushing one
    /// `PCMChunk` per chunk onto `out` in strictly increasing `chunk_index`
    /// order and closing it when done (§4.7, §5). This call runs Stage A-D
    /// inline and blocks the calling thread until the last chunk has been
    /// sent (or an error/cancellation is observed) — it does not spawn its
    /// own thread. `out` is a bounded channel, so with a caller-chosen
    /// capacity smaller than the eventual chunk count, a caller that waits
    /// for this call to return before draining `out` will deadlock; the
    /// caller must run this call on its own thread (or in `spawn_blocking`)
    /// and drain `out` concurrently, exactly as `demos/synth-wav` does.
    pub fn synthesize_stream(
        &self,
        text: &str,
        voice: Option<&VoiceEmbedding>,
        mut config: RuntimeGenerateConfig,
        max_tokens_per_chunk: usize,
        out: tokio::sync::mpsc::Sender<PCMChunk>,
    ) -> Result<(), CoreError> {
        self.ensure_open()?;

        let normalized = normalize(text);
        let chunks = prepare_chunks(&normalized, &self.tokenizer, max_tokens_per_chunk);
        if chunks.is_empty() {
            return Err(CoreError::Runtime("no tokens".to_string()));
        }

        config.voice_embedding = voice.cloned();

        let my_epoch = self.epoch.current();
        run_streaming_worker(&self.params, &chunks, config, &self.epoch, my_epoch, &self.logger, out)
    }
}

fn run_streaming_worker(
    params: &ModelParams,
    chunks: &[Chunk],
    mut config: RuntimeGenerateConfig,
    epoch: &Epoch,
    my_epoch: u64,
    logger: &Arc<dyn Logger>,
    out: tokio::sync::mpsc::Sender<PCMChunk>,
) -> Result<(), CoreError> {
    let last_index = chunks.len() - 1;

    for (chunk_index, chunk) in chunks.iter().enumerate() {
        if !epoch.is_current(my_epoch) {
            return Err(CoreError::Cancelled);
        }

        logger.log(Level::Debug, &format!("synthesizing chunk {chunk_index}/{last_index}"));
        let frames_after_eos = chunk.frames_after_eos;
        let samples = generate_one_chunk(params, &chunk.tokens, frames_after_eos, &mut config, epoch, my_epoch)?;

        let pcm_chunk = PCMChunk {
            samples,
            chunk_index,
            is_final: chunk_index == last_index,
        };
        if out.blocking_send(pcm_chunk).is_err() {
            return Err(CoreError::Runtime("output channel closed".to_string()));
        }
    }

    Ok(())
}

fn generate_one_chunk(
    params: &ModelParams,
    tokens: &[i64],
    frames_after_eos: u32,
    config: &mut RuntimeGenerateConfig,
    epoch: &Epoch,
    my_epoch: u64,
) -> Result<Vec<f32>, CoreError> {
    let voice = config.voice_embedding.as_ref();
    if let Some(voice) = voice {
        if voice.dim != params.config.voice_embedding_dim {
            return Err(CoreError::Schema {
                detail: format!(
                    "voice embedding dim {} does not match model voice-embedding dim {}",
                    voice.dim, params.config.voice_embedding_dim
                ),
            });
        }
    }
    let (voice_frames, voice_len) = match voice {
        Some(v) => (Some(v.frames.as_slice()), v.len),
        None => (None, 0),
    };

    let cond = run_text_conditioner(params, tokens, voice_frames, voice_len);

    let mut rng = match config.seed {
        Some(seed) => DeterministicRng::from_seed(seed),
        None => DeterministicRng::from_entropy(),
    };

    let chunk = Chunk {
        tokens: tokens.to_vec(),
        frames_after_eos,
    };

    // Lift the callback out of `config` first: `run_flow_lm` needs `config`
    // itself by shared reference at the same time it needs the callback by
    // unique reference, and those can't both borrow through `config` at once.
    let mut step_callback_box = config.step_callback.take();
    let step_callback = step_callback_box.as_deref_mut();
    let flow_out_result = run_flow_lm(params, &cond, &chunk, config, &mut rng, epoch, my_epoch, step_callback);
    config.step_callback = step_callback_box;
    let flow_out = flow_out_result?;

    if !epoch.is_current(my_epoch) {
        return Err(CoreError::Cancelled);
    }

    let refined = run_lsd(params, &flow_out.latents, flow_out.frame_count, config.lsd_decode_steps);
    let samples = run_vocoder(params, &refined, flow_out.frame_count);
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StepCallback;
    use crate::model::{LayerWeights, LsdWeights, ModelConfig, VocoderWeights};
    use crate::text::SentencePieceModel;
    use pockettts_base::Tensor;

    fn tiny_runtime() -> Runtime {
        let hidden = 8;
        let heads = 2;
        let head_dim = hidden / heads;
        let intermediate = 16;
        let vocab = 5;
        let latent_dim = 4;

        let layer = || LayerWeights {
            q_proj: Tensor::new(vec![hidden, hidden], vec![0.01; hidden * hidden]).unwrap(),
            k_proj: Tensor::new(vec![hidden, hidden], vec![0.01; hidden * hidden]).unwrap(),
            v_proj: Tensor::new(vec![hidden, hidden], vec![0.01; hidden * hidden]).unwrap(),
            o_proj: Tensor::new(vec![hidden, hidden], vec![0.01; hidden * hidden]).unwrap(),
            norm1: Tensor::new(vec![hidden], vec![1.0; hidden]).unwrap(),
            norm2: Tensor::new(vec![hidden], vec![1.0; hidden]).unwrap(),
            ff_w1: Tensor::new(vec![intermediate, hidden], vec![0.01; intermediate * hidden]).unwrap(),
            ff_w2: Tensor::new(vec![hidden, intermediate], vec![0.01; hidden * intermediate]).unwrap(),
            ff_w3: Tensor::new(vec![intermediate, hidden], vec![0.01; intermediate * hidden]).unwrap(),
        };

        let params = ModelParams {
            config: ModelConfig {
                vocab_size: vocab,
                hidden_size: hidden,
                intermediate_size: intermediate,
                num_layers: 2,
                num_heads: heads,
                head_dim,
                max_seq_len: 64,
                rope_base: 10_000.0,
                rms_norm_eps: 1e-6,
                latent_dim,
                voice_embedding_dim: hidden,
                samples_per_latent_frame: 4,
            },
            text_emb: Tensor::new(vec![vocab, hidden], vec![0.02; vocab * hidden]).unwrap(),
            layers: vec![layer(), layer()],
            norm_final: Tensor::new(vec![hidden], vec![1.0; hidden]).unwrap(),
            input_proj: Tensor::new(vec![hidden, latent_dim], vec![0.01; hidden * latent_dim]).unwrap(),
            logits_proj: Tensor::new(vec![vocab, hidden], vec![0.01; vocab * hidden]).unwrap(),
            latent_codebook: Tensor::new(vec![vocab, latent_dim], vec![0.05; vocab * latent_dim]).unwrap(),
            eos_proj: Tensor::new(vec![1, hidden], vec![0.0; hidden]).unwrap(),
            lsd: LsdWeights {
                layers: vec![Tensor::new(vec![latent_dim, latent_dim], vec![0.0; latent_dim * latent_dim]).unwrap()],
            },
            vocoder: VocoderWeights {
                blocks: Vec::new(),
                final_conv: Tensor::new(vec![1, latent_dim, 1], vec![0.1; latent_dim]).unwrap(),
            },
        };

        let tokenizer = SentencePieceModel::from_bytes(&minimal_tokenizer_model_bytes())
            .expect("tokenizer model fixture must parse");
        Runtime::new(params, tokenizer, None)
    }

    /// Builds a `Runtime` whose tokenizer can encode arbitrary ASCII text via
    /// byte fallback, for tests that exercise `synthesize_stream`'s own
    /// normalize-and-chunk path rather than taking pre-tokenized input.
    fn tiny_runtime_with_byte_fallback_tokenizer() -> Runtime {
        let hidden = 8;
        let heads = 2;
        let head_dim = hidden / heads;
        let intermediate = 16;
        let vocab = 256;
        let latent_dim = 4;

        let layer = || LayerWeights {
            q_proj: Tensor::new(vec![hidden, hidden], vec![0.01; hidden * hidden]).unwrap(),
            k_proj: Tensor::new(vec![hidden, hidden], vec![0.01; hidden * hidden]).unwrap(),
            v_proj: Tensor::new(vec![hidden, hidden], vec![0.01; hidden * hidden]).unwrap(),
            o_proj: Tensor::new(vec![hidden, hidden], vec![0.01; hidden * hidden]).unwrap(),
            norm1: Tensor::new(vec![hidden], vec![1.0; hidden]).unwrap(),
            norm2: Tensor::new(vec![hidden], vec![1.0; hidden]).unwrap(),
            ff_w1: Tensor::new(vec![intermediate, hidden], vec![0.01; intermediate * hidden]).unwrap(),
            ff_w2: Tensor::new(vec![hidden, intermediate], vec![0.01; hidden * intermediate]).unwrap(),
            ff_w3: Tensor::new(vec![intermediate, hidden], vec![0.01; intermediate * hidden]).unwrap(),
        };

        let params = ModelParams {
            config: ModelConfig {
                vocab_size: vocab,
                hidden_size: hidden,
                intermediate_size: intermediate,
                num_layers: 2,
                num_heads: heads,
                head_dim,
                max_seq_len: 64,
                rope_base: 10_000.0,
                rms_norm_eps: 1e-6,
                latent_dim,
                voice_embedding_dim: hidden,
                samples_per_latent_frame: 4,
            },
            text_emb: Tensor::new(vec![vocab, hidden], vec![0.001; vocab * hidden]).unwrap(),
            layers: vec![layer(), layer()],
            norm_final: Tensor::new(vec![hidden], vec![1.0; hidden]).unwrap(),
            input_proj: Tensor::new(vec![hidden, latent_dim], vec![0.01; hidden * latent_dim]).unwrap(),
            logits_proj: Tensor::new(vec![vocab, hidden], vec![0.01; vocab * hidden]).unwrap(),
            latent_codebook: Tensor::new(vec![vocab, latent_dim], vec![0.05; vocab * latent_dim]).unwrap(),
            eos_proj: Tensor::new(vec![1, hidden], vec![0.0; hidden]).unwrap(),
            lsd: LsdWeights {
                layers: vec![Tensor::new(vec![latent_dim, latent_dim], vec![0.0; latent_dim * latent_dim]).unwrap()],
            },
            vocoder: VocoderWeights {
                blocks: Vec::new(),
                final_conv: Tensor::new(vec![1, latent_dim, 1], vec![0.1; latent_dim]).unwrap(),
            },
        };

        let tokenizer =
            SentencePieceModel::from_bytes(&byte_fallback_tokenizer_model_bytes()).expect("byte-fallback fixture must parse");
        Runtime::new(params, tokenizer, None)
    }

    fn byte_fallback_tokenizer_model_bytes() -> Vec<u8> {
        fn encode_varint(mut value: u64) -> Vec<u8> {
            let mut out = Vec::new();
            loop {
                let mut byte = (value & 0x7F) as u8;
                value >>= 7;
                if value != 0 {
                    byte |= 0x80;
                }
                out.push(byte);
                if value == 0 {
                    break;
                }
            }
            out
        }
        fn encode_tag(tag: u32, wire_type: u8) -> Vec<u8> {
            encode_varint(((tag as u64) << 3) | wire_type as u64)
        }

        let mut out = Vec::new();
        for b in 0u32..256 {
            let text = format!("<0x{b:02X}>");
            let mut piece = Vec::new();
            piece.extend(encode_tag(1, 2));
            piece.extend(encode_varint(text.len() as u64));
            piece.extend_from_slice(text.as_bytes());
            piece.extend(encode_tag(2, 5));
            piece.extend_from_slice(&(-100.0f32).to_le_bytes());
            piece.extend(encode_tag(3, 0));
            piece.extend(encode_varint(6)); // PieceType::Byte

            out.extend(encode_tag(1, 2));
            out.extend(encode_varint(piece.len() as u64));
            out.extend(piece);
        }
        out
    }

    /// A single-piece SentencePiece model, just enough to satisfy
    /// `SentencePieceModel::from_bytes`'s non-empty-vocabulary requirement;
    /// `generate_audio` takes already-tokenized input, so the tokenizer
    /// itself is never exercised by these tests.
    fn minimal_tokenizer_model_bytes() -> Vec<u8> {
        fn encode_varint(mut value: u64) -> Vec<u8> {
            let mut out = Vec::new();
            loop {
                let mut byte = (value & 0x7F) as u8;
                value >>= 7;
                if value != 0 {
                    byte |= 0x80;
                }
                out.push(byte);
                if value == 0 {
                    break;
                }
            }
            out
        }
        fn encode_tag(tag: u32, wire_type: u8) -> Vec<u8> {
            encode_varint(((tag as u64) << 3) | wire_type as u64)
        }

        let mut piece = Vec::new();
        piece.extend(encode_tag(1, 2));
        piece.extend(encode_varint(1));
        piece.push(b'a');

        let mut out = Vec::new();
        out.extend(encode_tag(1, 2));
        out.extend(encode_varint(piece.len() as u64));
        out.extend(piece);
        out
    }

    #[test]
    fn empty_tokens_is_a_runtime_error() {
        let runtime = tiny_runtime();
        let mut config = RuntimeGenerateConfig {
            max_steps: 4,
            ..RuntimeGenerateConfig::default()
        };
        let err = runtime.generate_audio(&[], &mut config).unwrap_err();
        assert!(matches!(err, CoreError::Runtime(_)));
    }

    #[test]
    fn generate_audio_produces_nonempty_pcm_for_positive_eos_threshold() {
        let runtime = tiny_runtime();
        let mut config = RuntimeGenerateConfig {
            max_steps: 4,
            eos_threshold: f64::INFINITY,
            temperature: 0.0,
            seed: Some(1),
            ..RuntimeGenerateConfig::default()
        };
        let pcm = runtime.generate_audio(&[0, 1, 2], &mut config).unwrap();
        assert!(!pcm.is_empty());
    }

    #[test]
    fn closed_runtime_rejects_generation() {
        let runtime = tiny_runtime();
        runtime.close();
        let mut config = RuntimeGenerateConfig::default();
        let err = runtime.generate_audio(&[0, 1], &mut config).unwrap_err();
        assert!(matches!(err, CoreError::Runtime(_)));
    }

    #[test]
    fn cancel_before_call_yields_cancelled() {
        let runtime = tiny_runtime();
        runtime.cancel();
        let mut config = RuntimeGenerateConfig {
            max_steps: 4,
            ..RuntimeGenerateConfig::default()
        };
        // cancel() advances the epoch; the stamp taken inside generate_audio
        // is fresh, so this call should still succeed. Cancelling again
        // *during* generation is covered in pipeline::flow_lm's own tests.
        let result = runtime.generate_audio(&[0, 1], &mut config);
        assert!(result.is_ok() || matches!(result, Err(CoreError::Cancelled)));
    }

    #[test]
    fn synthesize_stream_matches_generate_audio_for_single_chunk() {
        let runtime = tiny_runtime_with_byte_fallback_tokenizer();
        let tokens = runtime.tokenizer.encode("hi");

        let mut direct_config = RuntimeGenerateConfig {
            max_steps: 4,
            eos_threshold: f64::INFINITY,
            temperature: 0.0,
            seed: Some(7),
            ..RuntimeGenerateConfig::default()
        };
        let direct_pcm = runtime.generate_audio(&tokens, &mut direct_config).unwrap();

        let stream_config = RuntimeGenerateConfig {
            max_steps: 4,
            eos_threshold: f64::INFINITY,
            temperature: 0.0,
            seed: Some(7),
            ..RuntimeGenerateConfig::default()
        };
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        runtime.synthesize_stream("hi", None, stream_config, 1000, tx).unwrap();

        let mut streamed_pcm = Vec::new();
        let mut chunk_count = 0;
        while let Some(chunk) = rx.blocking_recv() {
            assert_eq!(chunk.chunk_index, chunk_count);
            assert!(chunk.is_final);
            streamed_pcm.extend(chunk.samples);
            chunk_count += 1;
        }
        assert_eq!(chunk_count, 1);
        assert_eq!(streamed_pcm, direct_pcm);
    }

    #[test]
    fn cancelling_mid_stream_yields_exactly_one_chunk_then_cancelled() {
        use std::sync::atomic::AtomicUsize;

        let runtime = Arc::new(tiny_runtime_with_byte_fallback_tokenizer());
        // Two terminal-punctuated sentences with a tiny per-chunk budget force
        // at least two chunks.
        let text = "hi. bye.";

        // Cancels after the second Stage-B step callback invocation, i.e.
        // right as the first chunk's (max_steps == 2) generation finishes.
        // The next chunk's `run_flow_lm` call observes the new epoch at its
        // very first iteration and returns Cancelled before producing any
        // output, so exactly one PCMChunk is ever sent.
        let cancel_runtime = Arc::clone(&runtime);
        let calls = Arc::new(AtomicUsize::new(0));
        let step_callback: StepCallback = Box::new(move |_step, _total| {
            if calls.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                cancel_runtime.cancel();
            }
        });

        let config = RuntimeGenerateConfig {
            max_steps: 2,
            eos_threshold: f64::INFINITY,
            temperature: 0.0,
            seed: Some(3),
            step_callback: Some(step_callback),
            ..RuntimeGenerateConfig::default()
        };

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let result = runtime.synthesize_stream(text, None, config, 1, tx);
        assert!(matches!(result, Err(CoreError::Cancelled)));

        let first = rx.blocking_recv().expect("first chunk must have been sent before cancellation took effect");
        assert_eq!(first.chunk_index, 0);
        assert!(rx.blocking_recv().is_none(), "no second chunk should ever be sent");
    }
}
