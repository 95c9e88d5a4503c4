use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::path::Path;

/// Errors specific to loading and running the SentencePiece tokenizer.
#[derive(Debug)]
pub enum TokenizerError {
    Protobuf(String),
    Io(String),
    EmptyVocabulary,
}

impl fmt::Display for TokenizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenizerError::Protobuf(msg) => write!(f, "malformed SentencePiece model: {msg}"),
            TokenizerError::Io(msg) => write!(f, "{msg}"),
            TokenizerError::EmptyVocabulary => {
                write!(f, "SentencePiece model contains no pieces")
            }
        }
    }
}

impl std::error::Error for TokenizerError {}

const META_SPACE: char = '\u{2581}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PieceType {
    Normal,
    Unknown,
    Control,
    UserDefined,
    Unused,
    Byte,
}

impl PieceType {
    fn from_proto_enum(value: u64) -> Self {
        match value {
            2 => PieceType::Unknown,
            3 => PieceType::Control,
            4 => PieceType::UserDefined,
            5 => PieceType::Unused,
            6 => PieceType::Byte,
            _ => PieceType::Normal,
        }
    }

    fn merges(self) -> bool {
        matches!(self, PieceType::Normal)
    }
}

struct Piece {
    text: String,
    score: f32,
    kind: PieceType,
}

/// A loaded SentencePiece BPE model with byte-fallback.
///
/// `Encode` does not normalize its input — callers are expected to call
/// [`crate::text::normalize`] first.
pub struct SentencePieceModel {
    pieces: Vec<Piece>,
    piece_to_id: HashMap<String, usize>,
    byte_piece_ids: [Option<usize>; 256],
}

impl SentencePieceModel {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TokenizerError> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| TokenizerError::Io(format!("{}: {e}", path.display())))?;
        Self::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TokenizerError> {
        let parsed = parse_model_proto(data)?;
        if parsed.is_empty() {
            return Err(TokenizerError::EmptyVocabulary);
        }

        let mut piece_to_id = HashMap::with_capacity(parsed.len());
        let mut byte_piece_ids = [None; 256];

        for (id, piece) in parsed.iter().enumerate() {
            piece_to_id.insert(piece.text.clone(), id);
            if piece.kind == PieceType::Byte {
                if let Some(byte) = parse_byte_piece(&piece.text) {
                    byte_piece_ids[byte as usize] = Some(id);
                }
            }
        }

        Ok(SentencePieceModel {
            pieces: parsed,
            piece_to_id,
            byte_piece_ids,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_score(&self, id: usize) -> Option<f32> {
        self.pieces.get(id).map(|p| p.score)
    }

    /// Encode already-normalized text into token IDs. SentencePiece's
    /// whitespace convention (leading meta-space, spaces become U+2581) is
    /// applied internally.
    pub fn encode(&self, normalized_text: &str) -> Vec<i64> {
        let prefixed: String = {
            let mut s = String::new();
            s.push(META_SPACE);
            for ch in normalized_text.chars() {
                if ch == ' ' {
                    s.push(META_SPACE);
                } else {
                    s.push(ch);
                }
            }
            s
        };

        if prefixed.chars().count() <= 1 {
            return Vec::new();
        }

        self.bpe_encode(&prefixed)
            .into_iter()
            .map(|id| id as i64)
            .collect()
    }

    fn lookup_normal(&self, text: &str) -> Option<usize> {
        self.piece_to_id
            .get(text)
            .copied()
            .filter(|&id| self.pieces[id].kind.merges())
    }

    fn byte_fallback(&self, ch: char) -> Vec<usize> {
        let mut buf = [0u8; 4];
        let encoded = ch.encode_utf8(&mut buf);
        encoded
            .as_bytes()
            .iter()
            .filter_map(|&b| self.byte_piece_ids[b as usize])
            .collect()
    }

    fn bpe_encode(&self, text: &str) -> Vec<usize> {
        #[derive(Clone)]
        struct Symbol {
            text: String,
            prev: Option<usize>,
            next: Option<usize>,
            order: usize,
            alive: bool,
        }

        struct Candidate {
            score: f32,
            order: usize,
            left: usize,
            right: usize,
            merged: String,
        }

        impl PartialEq for Candidate {
            fn eq(&self, other: &Self) -> bool {
                self.score == other.score && self.order == other.order
            }
        }
        impl Eq for Candidate {}
        impl PartialOrd for Candidate {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for Candidate {
            fn cmp(&self, other: &Self) -> Ordering {
                self.score
                    .total_cmp(&other.score)
                    .then_with(|| other.order.cmp(&self.order))
            }
        }

        let mut symbols: Vec<Symbol> = Vec::new();
        for (i, ch) in text.chars().enumerate() {
            let prev = if i == 0 { None } else { Some(i - 1) };
            symbols.push(Symbol {
                text: ch.to_string(),
                prev,
                next: None,
                order: i,
                alive: true,
            });
        }
        let n = symbols.len();
        for i in 0..n {
            symbols[i].next = if i + 1 < n { Some(i + 1) } else { None };
        }

        let mut heap: BinaryHeap<Candidate> = BinaryHeap::new();
        let push_candidate = |heap: &mut BinaryHeap<Candidate>, symbols: &[Symbol], left: usize, right: usize| {
            let merged = format!("{}{}", symbols[left].text, symbols[right].text);
            if let Some(id) = self.lookup_normal(&merged) {
                let score = self.pieces[id].score;
                heap.push(Candidate {
                    score,
                    order: symbols[left].order,
                    left,
                    right,
                    merged,
                });
            }
        };

        for i in 0..n {
            if let Some(next) = symbols[i].next {
                push_candidate(&mut heap, &symbols, i, next);
            }
        }

        while let Some(candidate) = heap.pop() {
            let (left, right) = (candidate.left, candidate.right);
            if !symbols[left].alive || !symbols[right].alive {
                continue;
            }
            if symbols[left].next != Some(right) {
                continue;
            }

            let prev = symbols[left].prev;
            let next = symbols[right].next;

            let new_index = symbols.len();
            symbols.push(Symbol {
                text: candidate.merged,
                prev,
                next,
                order: symbols[left].order,
                alive: true,
            });
            symbols[left].alive = false;
            symbols[right].alive = false;
            if let Some(p) = prev {
                symbols[p].next = Some(new_index);
            }
            if let Some(nx) = next {
                symbols[nx].prev = Some(new_index);
            }

            if let Some(p) = prev {
                push_candidate(&mut heap, &symbols, p, new_index);
            }
            if let Some(nx) = next {
                push_candidate(&mut heap, &symbols, new_index, nx);
            }
        }

        let mut head = symbols.iter().position(|s| s.alive && s.prev.is_none());
        let mut ids = Vec::new();
        while let Some(i) = head {
            let symbol = &symbols[i];
            if let Some(id) = self.piece_to_id.get(&symbol.text).copied() {
                ids.push(id);
            } else {
                for ch in symbol.text.chars() {
                    ids.extend(self.byte_fallback(ch));
                }
            }
            head = symbol.next;
        }
        ids
    }
}

fn parse_byte_piece(text: &str) -> Option<u8> {
    let inner = text.strip_prefix("<0x")?.strip_suffix('>')?;
    u8::from_str_radix(inner, 16).ok()
}

fn parse_model_proto(data: &[u8]) -> Result<Vec<Piece>, TokenizerError> {
    let mut pieces = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let (tag, wire_type, new_pos) = read_tag(data, pos)?;
        pos = new_pos;

        if tag == 1 && wire_type == 2 {
            let (sub_data, new_pos) = read_bytes(data, pos)?;
            pos = new_pos;
            pieces.push(parse_sentencepiece(sub_data)?);
        } else {
            pos = skip_field(data, pos, wire_type)?;
        }
    }

    Ok(pieces)
}

fn parse_sentencepiece(data: &[u8]) -> Result<Piece, TokenizerError> {
    let mut pos = 0;
    let mut text = String::new();
    let mut score = 0.0f32;
    let mut kind = PieceType::Normal;

    while pos < data.len() {
        let (tag, wire_type, new_pos) = read_tag(data, pos)?;
        pos = new_pos;

        match (tag, wire_type) {
            (1, 2) => {
                let (bytes, new_pos) = read_bytes(data, pos)?;
                pos = new_pos;
                text = String::from_utf8_lossy(bytes).into_owned();
            }
            (2, 5) => {
                if pos + 4 > data.len() {
                    return Err(TokenizerError::Protobuf(
                        "truncated fixed32 score field".to_string(),
                    ));
                }
                let bytes: [u8; 4] = data[pos..pos + 4].try_into().unwrap();
                score = f32::from_le_bytes(bytes);
                pos += 4;
            }
            (3, 0) => {
                let (value, new_pos) = read_varint(data, pos)?;
                pos = new_pos;
                kind = PieceType::from_proto_enum(value);
            }
            (_, wt) => {
                pos = skip_field(data, pos, wt)?;
            }
        }
    }

    Ok(Piece { text, score, kind })
}

fn read_varint(data: &[u8], mut pos: usize) -> Result<(u64, usize), TokenizerError> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        if pos >= data.len() {
            return Err(TokenizerError::Protobuf(
                "unexpected end of protobuf data".to_string(),
            ));
        }
        let byte = data[pos];
        pos += 1;
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, pos));
        }
        shift += 7;
        if shift >= 64 {
            return Err(TokenizerError::Protobuf("varint too long".to_string()));
        }
    }
}

fn read_tag(data: &[u8], pos: usize) -> Result<(u32, u8, usize), TokenizerError> {
    let (value, new_pos) = read_varint(data, pos)?;
    let tag = (value >> 3) as u32;
    let wire_type = (value & 0x07) as u8;
    Ok((tag, wire_type, new_pos))
}

fn read_bytes(data: &[u8], pos: usize) -> Result<(&[u8], usize), TokenizerError> {
    let (len, pos) = read_varint(data, pos)?;
    let len = len as usize;
    let end = pos + len;
    if end > data.len() {
        return Err(TokenizerError::Protobuf(
            "length-delimited field exceeds data".to_string(),
        ));
    }
    Ok((&data[pos..end], end))
}

fn skip_field(data: &[u8], pos: usize, wire_type: u8) -> Result<usize, TokenizerError> {
    match wire_type {
        0 => {
            let (_, new_pos) = read_varint(data, pos)?;
            Ok(new_pos)
        }
        1 => Ok(pos + 8),
        2 => {
            let (_, new_pos) = read_bytes(data, pos)?;
            Ok(new_pos)
        }
        5 => Ok(pos + 4),
        other => Err(TokenizerError::Protobuf(format!(
            "unknown wire type: {other}"
        ))),
    }
}
