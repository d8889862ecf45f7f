use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use qwenforge::engine::{ChatSession, GenerationConfig, Generator, DEFAULT_SYSTEM_PROMPT};
use qwenforge::loader::WeightFile;
use qwenforge::logging::init_logging_default;
use qwenforge::memory::CpuAllocator;
use qwenforge::model::{Qwen2Model, TransformerConfig};
use qwenforge::sampler::Sampler;
use qwenforge::tokenizer::{infer_tokenizer_path, HfTokenizer};

#[derive(Parser, Debug)]
#[command(name = "qwenforge-chat", version)]
#[command(about = "Run a Qwen2 checkpoint on the CPU", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Path to the exported weight file
    #[arg(short, long)]
    model: PathBuf,
    /// Path to tokenizer JSON (defaults to a tokenizer next to the model)
    #[arg(long)]
    tokenizer: Option<PathBuf>,
    /// Sampling temperature; 0 selects greedy decoding
    #[arg(long, default_value_t = 0.0)]
    temperature: f32,
    /// Top-p sampling threshold
    #[arg(long, default_value_t = 0.9)]
    top_p: f32,
    /// Maximum number of tokens per reply
    #[arg(long, default_value_t = 1024)]
    max_steps: usize,
    /// Seed for reproducible sampling
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Interactive multi-turn chat
    Chat {
        #[command(flatten)]
        args: ModelArgs,
        /// System prompt sent with the first turn
        #[arg(long, default_value = DEFAULT_SYSTEM_PROMPT)]
        system: String,
    },
    /// Complete a raw prompt once and exit
    Generate {
        #[command(flatten)]
        args: ModelArgs,
        /// Prompt text to feed the model
        #[arg(short, long)]
        prompt: String,
    },
    /// Print the model header and derived configuration
    Info {
        /// Path to the exported weight file
        #[arg(short, long)]
        model: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    init_logging_default();
    let cli = Cli::parse();
    match cli.command {
        Commands::Chat { args, system } => run_chat(&args, system),
        Commands::Generate { args, prompt } => run_generate(&args, &prompt),
        Commands::Info { model } => run_info(&model),
    }
}

fn load_model(path: &Path) -> anyhow::Result<Qwen2Model> {
    Qwen2Model::load(path, Arc::new(CpuAllocator::new()), Sampler::Greedy)
        .with_context(|| format!("failed to load model '{}'", path.display()))
}

fn build_generator(args: &ModelArgs) -> anyhow::Result<Generator<HfTokenizer>> {
    let tokenizer_path = match &args.tokenizer {
        Some(path) => path.clone(),
        None => match infer_tokenizer_path(&args.model) {
            Some(path) => path,
            None => bail!(
                "no tokenizer found next to '{}'; pass --tokenizer",
                args.model.display()
            ),
        },
    };
    let tokenizer = HfTokenizer::from_file(&tokenizer_path)?;

    let config = GenerationConfig::new()
        .with_temperature(args.temperature)
        .with_top_p(args.top_p)
        .with_max_steps(args.max_steps);
    let config = match args.seed {
        Some(seed) => config.with_seed(seed),
        None => config,
    };

    let model = load_model(&args.model)?;
    Ok(Generator::new(model, tokenizer, config)?)
}

fn print_piece(piece: &str) {
    print!("{}", piece);
    let _ = io::stdout().flush();
}

fn run_generate(args: &ModelArgs, prompt: &str) -> anyhow::Result<()> {
    let mut generator = build_generator(args)?;
    let output = generator.generate(prompt, print_piece)?;
    println!();
    eprintln!("[{}]", output.stats);
    Ok(())
}

fn run_chat(args: &ModelArgs, system: String) -> anyhow::Result<()> {
    let generator = build_generator(args)?;
    let mut session = ChatSession::with_system_prompt(generator, system);
    let stdin = io::stdin();

    println!("Type a message; '/reset' clears the conversation, '/quit' exits.");
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                session.reset()?;
                println!("(conversation cleared)");
                continue;
            }
            _ => {}
        }

        match session.send(line, print_piece) {
            Ok(output) => {
                println!();
                eprintln!("[{}]", output.stats);
            }
            Err(e) if e.is_recoverable() || matches!(e, qwenforge::ForgeError::ContextExhausted { .. }) => {
                println!();
                eprintln!("{}; resetting conversation", e);
                session.reset()?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Header summary; maps the file but allocates no model buffers
fn run_info(path: &Path) -> anyhow::Result<()> {
    let file = WeightFile::open(path)
        .with_context(|| format!("reading header of {}", path.display()))?;
    let config = TransformerConfig::from_header(file.header())?;
    println!("{}", config);
    println!(
        "weights: {} f32 elements expected, {} in file",
        config.expected_weight_elements(),
        file.weight_elements()
    );
    Ok(())
}
