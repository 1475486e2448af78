use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tinybrain::model::TablePredictor;
use tinybrain::runner::ModelRunner;
use tinybrain::tokenizer::{BpeTokenizer, TokenId, Tokenizer};

/// Byte-level BPE tokenization and short-form text generation over a local
/// model bundle.
#[derive(Parser)]
#[command(name = "tinybrain")]
struct Cli {
    /// Model bundle directory
    #[arg(short, long, env = "TINYBRAIN_MODEL_DIR", default_value = "data/model")]
    model: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the token ids of a text
    Encode { text: String },
    /// Print the text of a list of token ids
    Decode { ids: Vec<TokenId> },
    /// Continue a prompt
    Generate(GenerateArgs),
    /// Describe the predictor interface and tokenizer
    Inspect,
}

#[derive(Args)]
struct GenerateArgs {
    prompt: String,

    /// Maximum tokens to generate
    #[arg(short = 'n', long)]
    max_new_tokens: Option<usize>,

    #[arg(short, long)]
    temperature: Option<f32>,

    #[arg(short = 'k', long)]
    top_k: Option<usize>,

    /// Nucleus sampling threshold
    #[arg(short = 'p', long)]
    top_p: Option<f32>,

    #[arg(long)]
    frequency_penalty: Option<f32>,

    #[arg(long)]
    presence_penalty: Option<f32>,

    /// RNG seed for sampling
    #[arg(short, long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Encode { text } => {
            let tokenizer = load_tokenizer(&cli.model)?;
            let ids = tokenizer.encode(&text)?;
            println!("{ids:?}");
        }
        Command::Decode { ids } => {
            let tokenizer = load_tokenizer(&cli.model)?;
            println!("{}", tokenizer.decode(&ids));
        }
        Command::Generate(args) => generate(&cli.model, args)?,
        Command::Inspect => {
            let runner = load_runner(&cli.model)?;
            for line in runner.metadata() {
                println!("{line}");
            }
        }
    }

    Ok(())
}

fn load_tokenizer(model_dir: &Path) -> Result<BpeTokenizer> {
    BpeTokenizer::from_dir(model_dir)
        .with_context(|| format!("Failed to load tokenizer from {}", model_dir.display()))
}

fn load_runner(model_dir: &Path) -> Result<ModelRunner<TablePredictor>> {
    ModelRunner::from_dir(model_dir)
        .with_context(|| format!("Failed to load model from {}", model_dir.display()))
}

fn generate(model_dir: &Path, args: GenerateArgs) -> Result<()> {
    let mut runner = load_runner(model_dir)?;

    let config = runner.config_mut();
    if let Some(max_new_tokens) = args.max_new_tokens {
        config.max_new_tokens = max_new_tokens.max(1);
    }
    if let Some(temperature) = args.temperature {
        config.sampling.set_temperature(temperature);
    }
    if let Some(top_k) = args.top_k {
        config.sampling.set_top_k(top_k);
    }
    if let Some(top_p) = args.top_p {
        config.sampling.set_top_p(top_p);
    }
    if let Some(penalty) = args.frequency_penalty {
        config.sampling.set_frequency_penalty(penalty);
    }
    if let Some(penalty) = args.presence_penalty {
        config.sampling.set_presence_penalty(penalty);
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }

    let generation = runner.predict(&args.prompt)?;

    println!("{}", generation.text);
    if generation.tokens_per_second > 0.0 {
        println!("⚡ {:.2} tokens/s", generation.tokens_per_second);
    }

    Ok(())
}
