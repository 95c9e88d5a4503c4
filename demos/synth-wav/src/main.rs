use std::path::PathBuf;
use std::sync::Arc;

use pockettts_base::StdoutLogger;
use pockettts_core::{
    IdentityMapper, ModelConfig, ModelParams, OpenOptions, PCMChunk, RemapMode, Runtime,
    RuntimeGenerateConfig, SentencePieceModel, Store, VoiceEmbedding,
};

const SENTENCE: &str = "The key issue, with rookworst, is that it is a delicious deli meat, made of willing, pork volunteers, slaughtered with love, prepared with care. - Have you had your rookworst today?";
const SAMPLE_RATE: u32 = 24_000;
const MAX_TOKENS_PER_CHUNK: usize = 120;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        eprintln!("Usage: {} <model.safetensors> <tokenizer.model> <output.wav> [voice.safetensors] [text]", args[0]);
        std::process::exit(1);
    }

    let model_path = PathBuf::from(&args[1]);
    let tokenizer_path = PathBuf::from(&args[2]);
    let output_path = &args[3];
    let voice_path = args.get(4).map(PathBuf::from);
    let text = args.get(5).cloned().unwrap_or_else(|| SENTENCE.to_string());

    for path in [&model_path, &tokenizer_path] {
        if !path.exists() {
            eprintln!("Missing: {}", path.display());
            std::process::exit(1);
        }
    }

    println!("Loading model from {}...", model_path.display());
    let identity = IdentityMapper;
    let store_opts = OpenOptions {
        key_mapper: &identity,
        remap_mode: RemapMode::Lenient,
    };
    let store = Store::open_mmap(&model_path, &store_opts)?;
    let params = ModelParams::load_from_store(&store, ModelConfig::default())?;
    println!(
        "Model loaded: {} flow-LM layers, {} vocab, {} latent dim",
        params.config.num_layers, params.config.vocab_size, params.config.latent_dim
    );

    let tokenizer = SentencePieceModel::from_file(&tokenizer_path)?;
    println!("Tokenizer loaded: {} pieces", tokenizer.vocab_size());

    let voice = match &voice_path {
        Some(path) => {
            let voice_store = Store::open_mmap(path, &store_opts)?;
            Some(VoiceEmbedding::load_from_store(&voice_store, params.config.voice_embedding_dim)?)
        }
        None => None,
    };

    let runtime = Arc::new(Runtime::new(params, tokenizer, Some(Arc::new(StdoutLogger))));

    println!("Synthesizing: \"{text}\"");
    let config = RuntimeGenerateConfig::default();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<PCMChunk>(8);

    let worker_runtime = Arc::clone(&runtime);
    let worker = std::thread::spawn(move || worker_runtime.synthesize_stream(&text, voice.as_ref(), config, MAX_TOKENS_PER_CHUNK, tx));

    let mut all_samples: Vec<f32> = Vec::new();
    while let Some(chunk) = rx.blocking_recv() {
        println!(
            "chunk {}: {} samples{}",
            chunk.chunk_index,
            chunk.samples.len(),
            if chunk.is_final { " (final)" } else { "" }
        );
        all_samples.extend(chunk.samples);
    }
    worker.join().expect("synthesis worker thread panicked")?;
    println!("Generated {} samples", all_samples.len());

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(output_path, spec)?;
    for sample in all_samples {
        writer.write_sample(sample.clamp(-32767.0, 32767.0) as i16)?;
    }
    writer.finalize()?;

    println!("Wrote {output_path}");
    Ok(())
}
