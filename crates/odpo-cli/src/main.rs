//! odpo CLI - online DPO training on MLX.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};

use clap::{Parser, Subcommand};
use odpo_core::{BatchLayout, RunConfig};
use odpo_distributed::{BlockingCollective, Collective, DistributedConfig, LocalCollective};
use odpo_trainer::{
    seeded_pair, LoggingCallback, MetricsJsonCallback, OnlineDpoTrainer, PolicyOptimizer,
    ProgressCallback, PromptDataset, TargetTokenScorer, TinyCausalLm,
};

#[derive(Parser)]
#[command(name = "odpo")]
#[command(author, version, about = "Online DPO training on MLX", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a configuration and print the derived batch layout
    ValidateConfig {
        /// Path to the run configuration (YAML)
        #[arg(short, long)]
        config: String,

        /// Number of workers to size the layout for
        #[arg(long, default_value = "1")]
        world_size: usize,

        /// Number of prompts in the training set
        #[arg(long, default_value = "1024")]
        dataset_len: usize,
    },

    /// Train the built-in tiny causal LM against a target-token scorer
    Train {
        /// Path to the run configuration (YAML)
        #[arg(short, long)]
        config: String,

        /// Training prompts (JSONL, one `{"input_ids": [...]}` per line)
        #[arg(short, long)]
        prompts: String,

        /// Held-out prompts for the evaluation sampler (JSONL)
        #[arg(long)]
        eval_prompts: Option<String>,

        /// Write per-update metrics to this JSONL file
        #[arg(long)]
        metrics_jsonl: Option<String>,

        /// Vocabulary size of the tiny model
        #[arg(long, default_value = "32")]
        vocab_size: i32,

        /// Hidden size of the tiny model
        #[arg(long, default_value = "32")]
        hidden_size: i32,

        /// Token the scorer rewards
        #[arg(long, default_value = "5")]
        target_token: i32,

        /// Worker addresses in rank order (IP:Port, comma separated). Single process when omitted.
        #[arg(long, value_delimiter = ',')]
        nodes: Vec<SocketAddr>,

        /// Rank of this worker within `--nodes`
        #[arg(long, default_value = "0")]
        rank: usize,

        /// Disable the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Write a default configuration file
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "odpo.yaml")]
        output: String,
    },
}

struct TrainArgs {
    config: RunConfig,
    prompts: PromptDataset,
    eval_prompts: Option<PromptDataset>,
    metrics_jsonl: Option<PathBuf>,
    vocab_size: i32,
    hidden_size: i32,
    target_token: i32,
    progress: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ValidateConfig {
            config,
            world_size,
            dataset_len,
        } => {
            let config = RunConfig::from_yaml_file(&config)?;
            let layout = BatchLayout::new(&config, world_size, dataset_len)?;
            print!("{}", serde_yaml::to_string(&layout)?);
        }

        Commands::Train {
            config,
            prompts,
            eval_prompts,
            metrics_jsonl,
            vocab_size,
            hidden_size,
            target_token,
            nodes,
            rank,
            no_progress,
        } => {
            let metrics_jsonl = metrics_jsonl
                .map(|path| validate_output_path(&path, "metrics file"))
                .transpose()?;
            let args = TrainArgs {
                config: RunConfig::from_yaml_file(&config)?,
                prompts: PromptDataset::from_jsonl(&prompts)?,
                eval_prompts: eval_prompts
                    .as_deref()
                    .map(PromptDataset::from_jsonl)
                    .transpose()?,
                metrics_jsonl,
                vocab_size,
                hidden_size,
                target_token,
                progress: !no_progress,
            };

            if nodes.is_empty() {
                run_training(args, LocalCollective)?;
            } else {
                let distributed = DistributedConfig::new(nodes, rank);
                distributed.validate()?;
                run_training(args, BlockingCollective::connect(distributed)?)?;
            }
        }

        Commands::InitConfig { output } => {
            let output = validate_output_path(&output, "config output")?;
            std::fs::write(&output, RunConfig::default().to_yaml_string()?)?;
            println!("Default configuration written to: {}", output.display());
            println!("\nEdit it and start training with:");
            println!(
                "  odpo train --config {} --prompts prompts.jsonl",
                output.display()
            );
        }
    }

    Ok(())
}

fn run_training<C: Collective>(args: TrainArgs, collective: C) -> anyhow::Result<()> {
    let is_main = collective.is_main_process();
    let mut trainer = OnlineDpoTrainer::new(args.config, collective, args.prompts.len())?;

    if is_main {
        trainer.add_callback(Box::new(LoggingCallback::default()));
        if args.progress {
            trainer.add_callback(Box::new(ProgressCallback::new(
                trainer.layout().num_total_batches,
            )));
        }
        if let Some(path) = &args.metrics_jsonl {
            let callback =
                MetricsJsonCallback::new(path)?.with_run_name(trainer.run_info().run_name.clone());
            trainer.add_callback(Box::new(callback));
        }
    }

    let (mut policy, mut reference) = seeded_pair(trainer.config().training.seed, || {
        TinyCausalLm::new(args.vocab_size, args.hidden_size)
    })?;
    let mut scorer = TargetTokenScorer::new(args.target_token);
    let mut optimizer = PolicyOptimizer::from_config(&trainer.config().training)?;

    let state = trainer.train(
        &mut policy,
        &mut reference,
        &mut scorer,
        &mut optimizer,
        &args.prompts,
        args.eval_prompts.as_ref(),
    )?;

    if is_main {
        println!(
            "Finished {} updates ({} episodes, {} optimizer steps)",
            state.update, state.episode, state.optimizer_steps
        );
    }
    Ok(())
}

/// Resolve an output path, rejecting `..` components and creating parent
/// directories.
fn validate_output_path(path: &str, context: &str) -> anyhow::Result<PathBuf> {
    let path = PathBuf::from(path);

    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        anyhow::bail!(
            "Path traversal detected in {}: '{}' contains '..' component",
            context,
            path.display()
        );
    }

    let resolved = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()?.join(path)
    };

    if let Some(parent) = resolved.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    Ok(canonical_or_joined(&resolved)?)
}

fn canonical_or_joined(path: &Path) -> std::io::Result<PathBuf> {
    if path.exists() {
        return path.canonicalize();
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => Ok(parent.canonicalize()?.join(name)),
        _ => Ok(path.to_path_buf()),
    }
}
