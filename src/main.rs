// SPDX-License-Identifier: MIT OR Apache-2.0

//! smol-interp CLI: one subcommand per session operation, JSON on stdout.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use smol_interp::session::DEFAULT_TOP_K;
use smol_interp::{InterpService, SessionConfig, SteeringConfig};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "smol-interp")]
#[command(about = "SAE feature inspection and steering for Gemma 2")]
#[command(version)]
struct Cli {
    /// Session config JSON (defaults apply to absent fields)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model ID from `HuggingFace` (overrides config and environment)
    #[arg(short, long)]
    model: Option<String>,

    /// Directory for the explanations cache
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Seed for sampling (makes generation reproducible)
    #[arg(long)]
    seed: Option<u64>,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Model name, layer count, and hidden size
    Info,
    /// Logits for every position of a prompt
    Infer {
        /// Prompt text
        prompt: String,
    },
    /// Top SAE features at the final token of a prompt
    Features {
        /// Prompt text
        prompt: String,
        /// Number of features to report
        #[arg(short, default_value_t = DEFAULT_TOP_K)]
        k: usize,
    },
    /// Generate with SAE feature steering
    Steer {
        /// Prompt text
        prompt: String,
        /// Steering entry `<feature>:<max_activation>:<strength>` (repeatable)
        #[arg(short, long = "feature")]
        features: Vec<SteeringConfig>,
        /// Maximum number of new tokens
        #[arg(long)]
        max_new_tokens: Option<usize>,
    },
    /// Generate without steering
    Generate {
        /// Prompt text
        prompt: String,
        /// Maximum number of new tokens
        #[arg(long)]
        max_new_tokens: Option<usize>,
    },
    /// Features whose explanations match a query, best first
    Search {
        /// Free-text query
        query: String,
        /// Number of results
        #[arg(short = 'k', long, default_value_t = 10)]
        top_k: usize,
    },
    /// A random sample of explained features (uses --seed when given)
    Browse {
        /// Number of features
        #[arg(short = 'n', long, default_value_t = 25)]
        count: usize,
    },
    /// Cached explanation for a feature (all explanations when omitted)
    Explain {
        /// Feature index
        index: Option<u32>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    }
    .with_env_overrides();
    if let Some(model) = cli.model {
        config.model_id = model;
    }
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }
    if cli.seed.is_some() {
        config.generation.seed = cli.seed;
    }
    config.force_cpu |= cli.cpu;
    let default_max_new = config.generation.max_new_tokens;

    let mut service = InterpService::new(config);
    service.load().context("loading session")?;

    match cli.command {
        Command::Info => emit(&service.model_info()?),
        Command::Infer { prompt } => emit(&service.run_inference(&prompt)?),
        Command::Features { prompt, k } => emit(&service.activated_features(&prompt, k)?),
        Command::Steer {
            prompt,
            features,
            max_new_tokens,
        } => {
            info!(features = features.len(), "steering");
            let max_new = max_new_tokens.unwrap_or(default_max_new);
            emit(&service.run_with_steering(&prompt, &features, max_new)?)
        }
        Command::Generate {
            prompt,
            max_new_tokens,
        } => emit(&service.generate(&prompt, max_new_tokens.unwrap_or(default_max_new))?),
        Command::Search { query, top_k } => emit(&service.search_features(&query, top_k)?),
        Command::Browse { count } => emit(&service.random_features(count, None)?),
        Command::Explain { index: Some(index) } => match service.explanation(index)? {
            Some(record) => emit(record),
            None => anyhow::bail!("no explanation cached for feature {index}"),
        },
        Command::Explain { index: None } => emit(service.explanations()?),
    }
}

fn emit<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
