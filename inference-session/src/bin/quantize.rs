//! Write a randomly initialized int8 model for the reference engine.
//!
//! Useful for exercising `generate` and `chat` without real weights.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use inference_session::reference::ReferenceWeights;

#[derive(Parser, Debug)]
#[command(name = "quantize", about = "Write a demo model file")]
struct Args {
    /// Output file for the quantized model
    #[arg(long, default_value = "model.q8")]
    out: PathBuf,

    /// Embedding width
    #[arg(long, default_value_t = 32)]
    dim: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Newline-separated word list to use instead of the built-in vocabulary
    #[arg(long)]
    vocab: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let vocab = match &args.vocab {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?
            .lines()
            .map(str::trim)
            .filter(|w| !w.is_empty())
            .map(String::from)
            .collect(),
        None => ReferenceWeights::demo_vocab(),
    };
    anyhow::ensure!(!vocab.is_empty(), "vocabulary is empty");
    anyhow::ensure!(args.dim > 0, "dim must be positive");

    let weights = ReferenceWeights::random(vocab, args.dim, args.seed);
    weights
        .save(&args.out)
        .with_context(|| format!("cannot write {}", args.out.display()))?;
    println!(
        "Saved {}-entry model ({} dims) to {}",
        weights.vocab.len(),
        args.dim,
        args.out.display()
    );
    Ok(())
}
