use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use wavespeed::{ApiConfig, Client, Input, RunOptions};

/// wavespeed - run models on the WaveSpeed inference API
///
/// Configuration is read from WAVESPEED_* environment variables
/// (WAVESPEED_API_KEY, WAVESPEED_BASE_URL, WAVESPEED_MAX_RETRIES, ...);
/// the options below override them.
///
/// Examples:
///   wavespeed run wavespeed-ai/z-image/turbo --input '{"prompt": "A cat"}'
///   wavespeed upload ./cat.png
#[derive(Parser, Debug)]
#[command(author, version = wavespeed::VERSION, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// API key (also via WAVESPEED_API_KEY)
    #[arg(
        long = "api-key",
        env = "WAVESPEED_API_KEY",
        hide_env_values = true,
        global = true
    )]
    pub api_key: Option<String>,

    /// API base URL (defaults to https://api.wavespeed.ai)
    #[arg(long = "base-url", value_name = "URL", global = true)]
    pub base_url: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a model and print its outputs as JSON
    Run(RunArgs),

    /// Upload a file and print its download URL
    Upload(UploadArgs),
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Model identifier, e.g. "wavespeed-ai/z-image/turbo"
    #[arg(value_name = "MODEL")]
    pub model: String,

    /// Model input as a JSON object
    #[arg(long, short = 'i', value_name = "JSON", default_value = "{}")]
    pub input: String,

    /// Wait server-side instead of polling
    #[arg(long)]
    pub sync: bool,

    /// Seconds to wait for the prediction, per attempt
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<f64>,

    /// Seconds between status checks
    #[arg(long = "poll-interval", value_name = "SECONDS")]
    pub poll_interval: Option<f64>,

    /// Whole-task retries on transient failures
    #[arg(long = "max-retries", value_name = "N")]
    pub max_retries: Option<u32>,
}

#[derive(clap::Args, Debug)]
pub struct UploadArgs {
    /// File to upload
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Request timeout in seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<f64>,
}

fn seconds(value: Option<f64>, name: &str) -> Result<Option<Duration>> {
    value
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .with_context(|| format!("Invalid value for --{}: {}", name, secs))
        })
        .transpose()
}

fn parse_input(raw: &str) -> Result<Input> {
    match serde_json::from_str(raw).context("Failed to parse --input as JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("--input must be a JSON object, got {}", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let mut config = ApiConfig::from_env();
    if let Some(api_key) = cli.api_key.filter(|key| !key.trim().is_empty()) {
        config.api_key = Some(api_key);
    }
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }

    match cli.command {
        Commands::Run(args) => {
            let input = parse_input(&args.input)?;
            let options = RunOptions {
                timeout: seconds(args.timeout, "timeout")?,
                poll_interval: seconds(args.poll_interval, "poll-interval")?,
                sync_mode: args.sync,
                max_retries: args.max_retries,
                cancel: None,
            };
            let client = Client::new(config)?;
            let output = client.run(&args.model, &input, &options).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Upload(args) => {
            let timeout = seconds(args.timeout, "timeout")?;
            let client = Client::new(config)?;
            let url = client.upload(&args.file, timeout).await?;
            println!("{}", url);
        }
    }
    Ok(())
}
