//! Interactive chat over a single session.
//!
//! Turns are appended to the session's context so the model sees the whole
//! conversation; `!reset` starts over when the window fills up.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use inference_session::reference::ReferenceEngine;
use inference_session::{
    Backend, GenerationError, GenerationRequest, Session, SessionConfig, SessionState, StopReason,
};

/// Stops that end an assistant turn in the instruction template.
const TURN_STOPS: &[&str] = &["</s>", "[INST]", "User:"];

#[derive(Parser, Debug)]
#[command(name = "chat", about = "Chat with a model in the terminal")]
struct Args {
    #[arg(long, env = "INFERENCE_SESSION_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    model: Option<PathBuf>,

    /// Seed for reproducible sampling
    #[arg(long)]
    seed: Option<u64>,
}

struct ChatApp {
    backend: Arc<Backend<ReferenceEngine>>,
    config: SessionConfig,
    session: Session<ReferenceEngine>,
    turns: usize,
    generated: usize,
}

impl ChatApp {
    fn new(config: SessionConfig) -> Result<Self> {
        let backend = Backend::with_numa(ReferenceEngine::new(), config.numa);
        let session = open(&backend, &config)?;
        Ok(Self {
            backend,
            config,
            session,
            turns: 0,
            generated: 0,
        })
    }

    /// Wrap a user turn in the instruction template.
    fn prompt_for(&self, input: &str) -> String {
        if self.session.cursor() == 0 {
            format!("[INST] {input} [/INST]")
        } else {
            format!(" [INST] {input} [/INST]")
        }
    }

    fn request_for(&self, input: &str) -> GenerationRequest {
        let mut request = self.config.request(self.prompt_for(input));
        request.reset_context = self.session.cursor() == 0;
        for stop in TURN_STOPS {
            request = request.with_stop_sequence(*stop);
        }
        request
    }

    fn respond(&mut self, input: &str) -> Result<()> {
        let request = self.request_for(input);
        let mut stdout = io::stdout().lock();
        write!(stdout, "Assistant:")?;
        stdout.flush()?;

        let outcome = self.session.generate_streaming(&request, |piece| {
            let _ = stdout.write_all(piece).and_then(|()| stdout.flush());
        });
        writeln!(stdout)?;

        match outcome {
            Ok(result) => {
                self.turns += 1;
                self.generated += result.token_count;
                match result.stop_reason {
                    StopReason::ContextWindowExceeded => {
                        println!("(context window full; type !reset to start over)");
                    }
                    reason if !reason.is_complete() => println!("(stopped: {reason})"),
                    _ => {}
                }
            }
            Err(GenerationError::CapacityExceeded { tokens, capacity }) => {
                println!("(that turn needs {tokens} of {capacity} positions; type !reset)");
            }
            Err(err) => {
                warn!(%err, "turn failed");
                println!("(error: {err})");
            }
        }

        if self.session.state() == SessionState::Poisoned {
            println!("(session lost its context; reopening the model)");
            self.reopen()?;
        }
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        self.session.release();
        self.session = open(&self.backend, &self.config)?;
        Ok(())
    }

    fn show_stats(&self) {
        println!();
        println!("Session {}", self.session.id());
        println!("  model:     {}", self.config.model_path.display());
        println!(
            "  context:   {} / {} positions used",
            self.session.cursor(),
            self.session.capacity()
        );
        println!("  turns:     {}", self.turns);
        println!("  generated: {} tokens", self.generated);
        println!("  sampling:  {:?}", self.config.sampling);
        println!();
    }

    fn run(&mut self) -> Result<()> {
        println!("Local assistant. Commands: 'quit', '!reset', '!stats'");
        println!();

        let stdin = io::stdin();
        let mut lines = stdin.lock().lines();
        loop {
            print!("You: ");
            io::stdout().flush()?;

            let Some(line) = lines.next() else {
                break;
            };
            let line = line?;
            let input = line.trim();
            if input.is_empty() {
                continue;
            }

            match input.to_lowercase().as_str() {
                "quit" | "exit" => break,
                "!reset" => {
                    self.session.reset();
                    println!("(conversation cleared)");
                    continue;
                }
                "!stats" => {
                    self.show_stats();
                    continue;
                }
                _ => {}
            }

            self.respond(input)?;
            println!();
        }
        println!("Goodbye!");
        Ok(())
    }
}

fn open(
    backend: &Arc<Backend<ReferenceEngine>>,
    config: &SessionConfig,
) -> Result<Session<ReferenceEngine>> {
    Session::construct(
        backend,
        &config.model_path,
        config.threads,
        config.context_capacity,
    )
    .with_context(|| format!("cannot open {}", config.model_path.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("inference_session=warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let mut config = SessionConfig::load(args.config.as_deref())?;
    if let Some(model) = args.model {
        config.model_path = model;
    }
    if let Some(seed) = args.seed {
        config.sampling.seed = Some(seed);
    }

    ChatApp::new(config)?.run()
}
