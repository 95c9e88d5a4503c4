use unicode_segmentation::UnicodeSegmentation;

use super::tokenizer::SentencePieceModel;

/// `{tokens, frames_after_eos}` as consumed by Stage B.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub tokens: Vec<i64>,
    pub frames_after_eos: u32,
}

const LONG_TAIL_FRAMES: u32 = 8;
const SHORT_TAIL_FRAMES: u32 = 3;

/// Split normalized text into generation chunks bounded by a max-token
/// budget. Sentences are never split across chunks unless a single sentence
/// alone exceeds the budget, in which case it is placed alone and its tokens
/// truncated to the budget.
pub fn prepare_chunks(
    normalized_text: &str,
    tokenizer: &SentencePieceModel,
    max_tokens_per_chunk: usize,
) -> Vec<Chunk> {
    let sentences = split_sentences(normalized_text);

    let mut chunks = Vec::new();
    let mut current_tokens: Vec<i64> = Vec::new();
    let mut current_tail = SHORT_TAIL_FRAMES;

    for sentence in sentences {
        if sentence.trim().is_empty() {
            continue;
        }
        let tail = tail_frames_for(&sentence);
        let sentence_tokens = tokenizer.encode(&sentence);
        if sentence_tokens.is_empty() {
            continue;
        }

        if sentence_tokens.len() > max_tokens_per_chunk {
            if !current_tokens.is_empty() {
                chunks.push(Chunk {
                    tokens: std::mem::take(&mut current_tokens),
                    frames_after_eos: current_tail,
                });
            }
            let mut truncated = sentence_tokens;
            truncated.truncate(max_tokens_per_chunk);
            chunks.push(Chunk {
                tokens: truncated,
                frames_after_eos: SHORT_TAIL_FRAMES,
            });
            current_tail = SHORT_TAIL_FRAMES;
            continue;
        }

        if current_tokens.len() + sentence_tokens.len() > max_tokens_per_chunk
            && !current_tokens.is_empty()
        {
            chunks.push(Chunk {
                tokens: std::mem::take(&mut current_tokens),
                frames_after_eos: current_tail,
            });
        }

        current_tokens.extend(sentence_tokens);
        current_tail = tail;
    }

    if !current_tokens.is_empty() {
        chunks.push(Chunk {
            tokens: current_tokens,
            frames_after_eos: current_tail,
        });
    }

    chunks
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for word in text.split_word_bounds() {
        current.push_str(word);
        if matches!(word, "." | "!" | "?") {
            sentences.push(std::mem::take(&mut current));
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current);
    }

    sentences
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn tail_frames_for(sentence: &str) -> u32 {
    match sentence.trim_end().chars().next_back() {
        Some('.') | Some('!') | Some('?') => LONG_TAIL_FRAMES,
        _ => SHORT_TAIL_FRAMES,
    }
}
