mod cmd;

use clap::{Args, Parser, Subcommand};
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "vlm")]
#[command(version)]
#[command(about = "Run vision-language models locally", long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate text for a prompt and optional images or video
    Generate(GenerateArgs),
    /// Print the composed token layout without loading weights
    Compose(ComposeArgs),
    /// Print the resolved model config as JSON
    Config { model: String },
}

#[derive(Args)]
pub struct MediaArgs {
    /// Image path, URL or data URI; repeat for several images
    #[arg(long = "image")]
    pub images: Vec<String>,

    /// Video file, GIF or frame directory
    #[arg(long)]
    pub video: Option<String>,

    /// Frames per second sampled from the video
    #[arg(long)]
    pub fps: Option<f64>,

    /// Largest frame size, as WxH
    #[arg(long, value_parser = cmd::parse_size)]
    pub max_pixels: Option<(usize, usize)>,

    /// Proxy for media URLs
    #[arg(long)]
    pub proxy: Option<String>,
}

#[derive(Args)]
pub struct ComposeArgs {
    pub model: String,

    #[arg(short, long, default_value = "")]
    pub prompt: String,

    #[arg(long)]
    pub system: Option<String>,

    #[command(flatten)]
    pub media: MediaArgs,
}

#[derive(Args)]
pub struct GenerateArgs {
    #[command(flatten)]
    pub compose: ComposeArgs,

    #[arg(long)]
    pub max_tokens: Option<usize>,

    #[arg(long)]
    pub temperature: Option<f32>,

    #[arg(long, default_value_t = 1.0)]
    pub top_p: f32,

    #[arg(long, default_value_t = 1.0)]
    pub repetition_penalty: f32,

    #[arg(long)]
    pub seed: Option<u64>,

    /// LoRA adapter directory
    #[arg(long)]
    pub adapter: Option<String>,

    /// fused or dynamic
    #[arg(long, default_value = "dynamic")]
    pub adapter_mode: String,

    /// Run on CPU even when an accelerator is available
    #[arg(long)]
    pub cpu: bool,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Generate(args) => cmd::generate(args),
        Commands::Compose(args) => cmd::compose(args),
        Commands::Config { model } => cmd::config(&model),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
