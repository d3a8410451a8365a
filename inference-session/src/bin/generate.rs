//! One-shot text generation from a prompt.
//!
//! Settings come from an optional TOML file and `INFERENCE_SESSION_*`
//! environment variables; flags given here win over both.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use inference_session::reference::ReferenceEngine;
use inference_session::{Backend, Session, SessionConfig};

#[derive(Parser, Debug)]
#[command(name = "generate", about = "Generate a completion for a prompt")]
struct Args {
    /// Prompt to complete
    prompt: String,

    /// TOML configuration file
    #[arg(long, env = "INFERENCE_SESSION_CONFIG")]
    config: Option<PathBuf>,

    /// Model file, overrides the configuration
    #[arg(long)]
    model: Option<PathBuf>,

    #[arg(long)]
    threads: Option<usize>,

    /// Context window in tokens
    #[arg(long)]
    context: Option<usize>,

    #[arg(long)]
    max_tokens: Option<usize>,

    /// Seed for reproducible sampling
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    temperature: Option<f32>,

    /// Stop when this text appears in the output; may be repeated
    #[arg(long = "stop")]
    stop_sequences: Vec<String>,

    /// Print pieces as they are decoded
    #[arg(long)]
    stream: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("inference_session=info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let mut config = SessionConfig::load(args.config.as_deref())?;
    if let Some(model) = args.model {
        config.model_path = model;
    }
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    if let Some(context) = args.context {
        config.context_capacity = context;
    }
    if let Some(max_tokens) = args.max_tokens {
        config.generation.max_tokens = max_tokens;
    }
    if let Some(seed) = args.seed {
        config.sampling.seed = Some(seed);
    }
    if let Some(temperature) = args.temperature {
        config.sampling.temperature = temperature;
    }
    config.generation.stop_sequences.extend(args.stop_sequences);
    config.validate()?;

    let backend = Backend::with_numa(ReferenceEngine::new(), config.numa);
    let mut session = Session::construct(
        &backend,
        &config.model_path,
        config.threads,
        config.context_capacity,
    )
    .with_context(|| format!("cannot open {}", config.model_path.display()))?;

    let request = config.request(args.prompt);
    let result = if args.stream {
        let mut stdout = io::stdout().lock();
        let result = session.generate_streaming(&request, |piece| {
            // A closed pipe only loses the echo; the final result still prints.
            let _ = stdout.write_all(piece).and_then(|()| stdout.flush());
        })?;
        writeln!(stdout)?;
        result
    } else {
        let result = session.generate(&request)?;
        println!("{}", result.text.trim_start());
        result
    };

    eprintln!(
        "[{} tokens, prompt {} tokens, stop: {}, {:.1?}]",
        result.token_count, result.prompt_tokens, result.stop_reason, result.elapsed
    );
    session.release();
    Ok(())
}
