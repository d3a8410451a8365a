use std::collections::HashMap;

pub const UNK: &str = "<unk>";
pub const BOS: &str = "<s>";
pub const EOS: &str = "</s>";

/// Whitespace vocabulary backed by a fixed word list.
///
/// Entry 0 is the unknown token. Entries written as `<...>` are special and
/// render to no bytes; every other entry renders as a space followed by the
/// word, so concatenated pieces read as a sentence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vocab {
    ids: HashMap<String, usize>,
    pieces: Vec<String>,
}

impl Vocab {
    pub fn new(pieces: Vec<String>) -> Self {
        let mut ids = HashMap::with_capacity(pieces.len());
        for (i, piece) in pieces.iter().enumerate() {
            ids.entry(piece.clone()).or_insert(i);
        }
        Self { ids, pieces }
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn id(&self, piece: &str) -> Option<usize> {
        self.ids.get(piece).copied()
    }

    pub fn piece(&self, id: usize) -> Option<&str> {
        self.pieces.get(id).map(String::as_str)
    }

    pub fn pieces(&self) -> &[String] {
        &self.pieces
    }

    /// Lowercased whitespace split; unknown words map to id 0.
    pub fn encode(&self, text: &str) -> Vec<usize> {
        text.split_whitespace()
            .map(|word| self.id(&word.to_lowercase()).unwrap_or(0))
            .collect()
    }

    /// Bytes `id` renders to, or `None` for ids outside the vocabulary.
    pub fn render(&self, id: usize) -> Option<Vec<u8>> {
        let piece = self.piece(id)?;
        if is_special(piece) {
            return Some(Vec::new());
        }
        let mut bytes = Vec::with_capacity(piece.len() + 1);
        bytes.push(b' ');
        bytes.extend_from_slice(piece.as_bytes());
        Some(bytes)
    }

    /// Longest rendering of any entry.
    pub fn max_render_len(&self) -> usize {
        self.pieces
            .iter()
            .map(|p| if is_special(p) { 0 } else { p.len() + 1 })
            .max()
            .unwrap_or(0)
    }
}

fn is_special(piece: &str) -> bool {
    piece.len() > 2 && piece.starts_with('<') && piece.ends_with('>')
}
