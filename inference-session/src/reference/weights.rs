//! Int8 model file for the reference engine.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! magic "ISQ8" | version u32
//! vocab: count u32, then (len u32, utf-8 bytes) per entry
//! bos u32 | eos u32
//! embedding: rows u32, cols u32, scale f32, i8 * rows * cols
//! head:      rows u32, cols u32, scale f32, i8 * rows * cols, bias flag u8, f32 * rows
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use bytemuck::cast_slice;
use memmap2::MmapOptions;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::vocab::{Vocab, BOS, EOS, UNK};
use crate::engine::EngineError;

const MAGIC: &[u8; 4] = b"ISQ8";
const VERSION: u32 = 1;
const MAX_VOCAB: usize = 1 << 20;
const MAX_DIM: usize = 1 << 16;

/// Symmetric int8 quantization of a matrix with one scale factor.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantizedMatrix {
    rows: usize,
    cols: usize,
    scale: f32,
    data: Vec<i8>,
}

impl QuantizedMatrix {
    pub fn quantize(t: &Array2<f32>) -> Self {
        let max = t.iter().fold(0.0_f32, |m, &v| m.max(v.abs()));
        let scale = if max == 0.0 { 1.0 } else { 127.0 / max };
        let data = t.iter().map(|&v| (v * scale).round() as i8).collect();
        Self {
            rows: t.nrows(),
            cols: t.ncols(),
            scale: 1.0 / scale,
            data,
        }
    }

    pub fn dequantize(&self) -> Array2<f32> {
        Array2::from_shape_fn((self.rows, self.cols), |(i, j)| {
            self.data[i * self.cols + j] as f32 * self.scale
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_all(&(self.rows as u32).to_le_bytes())?;
        w.write_all(&(self.cols as u32).to_le_bytes())?;
        w.write_all(&self.scale.to_le_bytes())?;
        w.write_all(cast_slice(self.data.as_slice()))
    }

    fn read_from(r: &mut ByteReader<'_>) -> Result<Self, EngineError> {
        let rows = r.u32()? as usize;
        let cols = r.u32()? as usize;
        if rows > MAX_VOCAB || cols > MAX_DIM {
            return Err(reject(format!("matrix shape {rows}x{cols} out of range")));
        }
        let scale = r.f32()?;
        if !scale.is_finite() {
            return Err(reject("non-finite quantization scale"));
        }
        let data: &[i8] = cast_slice(r.take(rows * cols)?);
        Ok(Self {
            rows,
            cols,
            scale,
            data: data.to_vec(),
        })
    }
}

/// Vocabulary plus quantized embedding and output head.
#[derive(Clone, Debug, PartialEq)]
pub struct ReferenceWeights {
    pub vocab: Vocab,
    pub bos: usize,
    pub eos: usize,
    pub embedding: QuantizedMatrix,
    pub head: QuantizedMatrix,
    pub head_bias: Option<Vec<f32>>,
}

impl ReferenceWeights {
    /// Randomly initialized weights for `words`, reproducible from `seed`.
    ///
    /// The vocabulary always starts with `<unk>`, `<s>` and `</s>` at ids 0, 1
    /// and 2; copies of them elsewhere in `words` are dropped.
    pub fn random(words: Vec<String>, dim: usize, seed: u64) -> Self {
        let specials = [UNK, BOS, EOS];
        let mut pieces: Vec<String> = specials.iter().map(|s| s.to_string()).collect();
        pieces.extend(words.into_iter().filter(|w| !specials.contains(&w.as_str())));
        let vocab = Vocab::new(pieces);
        let n = vocab.len();
        let mut rng = StdRng::seed_from_u64(seed);
        let embedding: Array2<f32> = Array2::from_shape_fn((n, dim), |_| rng.gen_range(-0.1..0.1));
        let head: Array2<f32> = Array2::from_shape_fn((n, dim), |_| rng.gen_range(-0.1..0.1));
        let bias: Vec<f32> = (0..n).map(|_| rng.gen_range(-0.1..0.1)).collect();

        Self {
            vocab,
            bos: 1,
            eos: 2,
            embedding: QuantizedMatrix::quantize(&embedding),
            head: QuantizedMatrix::quantize(&head),
            head_bias: Some(bias),
        }
    }

    /// Small conversational vocabulary used by the demo tools.
    pub fn demo_vocab() -> Vec<String> {
        [
            UNK, BOS, EOS, "hello", "world", "how", "are", "you", "i", "am", "fine", "what",
            "is", "your", "name", "my", "assistant", "help", "can", "please", "thank", "yes",
            "no", "the", "and", "a", "to", "of", "in", "that", "have", "it", "for", "not",
            "on", "with", "coffee", "tea", "croissant", "large", "small", "order", "add",
            "remove", "one", "two", "good", "great", "nice", "ok", "sure", "maybe", "think",
            "know", "see",
        ]
        .iter()
        .map(|w| w.to_string())
        .collect()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let mut f = BufWriter::new(File::create(path)?);
        self.write_to(&mut f)?;
        f.flush()
    }

    pub fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_all(MAGIC)?;
        w.write_all(&VERSION.to_le_bytes())?;
        w.write_all(&(self.vocab.len() as u32).to_le_bytes())?;
        for piece in self.vocab.pieces() {
            w.write_all(&(piece.len() as u32).to_le_bytes())?;
            w.write_all(piece.as_bytes())?;
        }
        w.write_all(&(self.bos as u32).to_le_bytes())?;
        w.write_all(&(self.eos as u32).to_le_bytes())?;
        self.embedding.write_to(w)?;
        self.head.write_to(w)?;
        match &self.head_bias {
            Some(bias) => {
                w.write_all(&[1u8])?;
                for v in bias {
                    w.write_all(&v.to_le_bytes())?;
                }
            }
            None => w.write_all(&[0u8])?,
        }
        Ok(())
    }

    /// Read a model file, memory-mapping it when `use_mmap` is set.
    pub fn load(path: &Path, use_mmap: bool) -> Result<Self, EngineError> {
        if !path.is_file() {
            return Err(EngineError::InvalidPath(path.to_path_buf()));
        }
        if use_mmap {
            let file = File::open(path)?;
            // SAFETY: the map is read once into owned buffers and dropped
            // before returning.
            let mmap = unsafe { MmapOptions::new().map(&file)? };
            Self::parse(&mmap[..])
        } else {
            Self::parse(&std::fs::read(path)?)
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, EngineError> {
        let mut r = ByteReader::new(bytes);
        if r.take(4)? != MAGIC {
            return Err(reject("bad magic"));
        }
        let version = r.u32()?;
        if version != VERSION {
            return Err(reject(format!("unsupported version {version}")));
        }

        let count = r.u32()? as usize;
        if count == 0 || count > MAX_VOCAB {
            return Err(reject(format!("vocabulary size {count} out of range")));
        }
        let mut pieces = Vec::with_capacity(count);
        for _ in 0..count {
            let len = r.u32()? as usize;
            let piece = std::str::from_utf8(r.take(len)?)
                .map_err(|_| reject("vocabulary entry is not utf-8"))?;
            pieces.push(piece.to_string());
        }

        let bos = r.u32()? as usize;
        let eos = r.u32()? as usize;
        if bos >= count || eos >= count {
            return Err(reject("special token id outside vocabulary"));
        }

        let embedding = QuantizedMatrix::read_from(&mut r)?;
        let head = QuantizedMatrix::read_from(&mut r)?;
        if embedding.rows != count || head.rows != count || head.cols != embedding.cols {
            return Err(reject(format!(
                "shape mismatch: vocab {count}, embedding {:?}, head {:?}",
                embedding.shape(),
                head.shape()
            )));
        }

        let head_bias = match r.u8()? {
            0 => None,
            1 => {
                let mut bias = Vec::with_capacity(count);
                for _ in 0..count {
                    bias.push(r.f32()?);
                }
                Some(bias)
            }
            flag => return Err(reject(format!("bad bias flag {flag}"))),
        };

        Ok(Self {
            vocab: Vocab::new(pieces),
            bos,
            eos,
            embedding,
            head,
            head_bias,
        })
    }

    /// Dequantized head bias as an ndarray vector.
    pub(crate) fn bias_array(&self) -> Option<Array1<f32>> {
        self.head_bias.as_ref().map(|b| Array1::from(b.clone()))
    }
}

fn reject(msg: impl Into<String>) -> EngineError {
    EngineError::RejectedWeights(msg.into())
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], EngineError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| reject(format!("truncated at byte {}", self.pos)))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, EngineError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, EngineError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn f32(&mut self) -> Result<f32, EngineError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(f32::from_le_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_save_and_load() {
        let weights = ReferenceWeights::random(ReferenceWeights::demo_vocab(), 16, 1);
        let file = NamedTempFile::new().unwrap();
        weights.save(file.path()).unwrap();

        let mapped = ReferenceWeights::load(file.path(), true).unwrap();
        let read = ReferenceWeights::load(file.path(), false).unwrap();
        assert_eq!(mapped, weights);
        assert_eq!(read, weights);
        assert_eq!(mapped.eos, 2);
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = ReferenceWeights::random(ReferenceWeights::demo_vocab(), 8, 5);
        let b = ReferenceWeights::random(ReferenceWeights::demo_vocab(), 8, 5);
        assert_eq!(a, b);
    }

    #[test]
    fn test_quantization_error_is_small() {
        let t = Array2::from_shape_fn((4, 4), |(i, j)| (i as f32 - j as f32) * 0.05);
        let q = QuantizedMatrix::quantize(&t);
        let back = q.dequantize();
        for (a, b) in t.iter().zip(back.iter()) {
            assert!((a - b).abs() < 0.01);
        }
    }

    #[test]
    fn test_truncated_file_rejected() {
        let weights = ReferenceWeights::random(ReferenceWeights::demo_vocab(), 8, 2);
        let mut bytes = Vec::new();
        weights.write_to(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 10);
        assert!(matches!(
            ReferenceWeights::parse(&bytes),
            Err(EngineError::RejectedWeights(_))
        ));
    }

    #[test]
    fn test_bad_magic_rejected() {
        assert!(matches!(
            ReferenceWeights::parse(b"GGUF\x01\x00\x00\x00"),
            Err(EngineError::RejectedWeights(_))
        ));
    }

    #[test]
    fn test_custom_vocab_without_specials_loads() {
        let words = vec!["coffee".to_string(), "tea".to_string()];
        let weights = ReferenceWeights::random(words, 8, 0);
        let file = NamedTempFile::new().unwrap();
        weights.save(file.path()).unwrap();

        let loaded = ReferenceWeights::load(file.path(), true).unwrap();
        assert_eq!(loaded.vocab.len(), 5);
        assert_eq!(loaded.vocab.piece(0), Some(UNK));
        assert_eq!(loaded.vocab.piece(loaded.bos), Some(BOS));
        assert_eq!(loaded.vocab.piece(loaded.eos), Some(EOS));
        assert_eq!(loaded.vocab.encode("coffee tea milk"), vec![3, 4, 0]);
    }

    #[test]
    fn test_custom_vocab_keeps_words_as_words() {
        let words: Vec<String> = ["coffee", "tea", "</s>", "milk", "cake"]
            .iter()
            .map(|w| w.to_string())
            .collect();
        let weights = ReferenceWeights::random(words, 8, 0);
        assert_eq!(weights.vocab.len(), 7);
        assert_eq!(weights.vocab.id("tea"), Some(4));
        assert_eq!(weights.vocab.id(EOS), Some(weights.eos));
        assert_ne!(weights.vocab.piece(weights.bos), Some("tea"));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            ReferenceWeights::load(Path::new("/definitely/not/here.q8"), true),
            Err(EngineError::InvalidPath(_))
        ));
    }
}
