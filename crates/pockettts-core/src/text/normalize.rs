use unicode_normalization::UnicodeNormalization;

/// Unicode NFKC; collapse runs of whitespace into a single space; trim.
/// Sentence-terminal punctuation is left untouched. Pure and deterministic.
pub fn normalize(text: &str) -> String {
    let nfkc: String = text.nfkc().collect();

    let mut out = String::with_capacity(nfkc.len());
    let mut last_was_space = false;
    for ch in nfkc.chars() {
        if ch.is_whitespace() {
            if !last_was_space && !out.is_empty() {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }

    if out.ends_with(' ') {
        out.pop();
    }

    out
}
