use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use fashionvil_core::FashionVil;

use fashionvil_cli::config::{Overrides, RunConfig};
use fashionvil_cli::logging;
use fashionvil_cli::smoke::{synthetic_batch, BatchShape};

#[derive(Parser)]
#[command(name = "fashionvil", about = "FashionViL vision-language model tooling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// TOML run config (defaults to ~/.config/fashionvil/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override `model.training_head_type`
    #[arg(long)]
    head_type: Option<String>,

    /// Override `model.enable_prompt`
    #[arg(long)]
    enable_prompt: Option<bool>,

    /// Override `runtime.device` (cpu, cuda, cuda:N)
    #[arg(long)]
    device: Option<String>,

    /// Override `runtime.dtype` (f32, f16, bf16)
    #[arg(long)]
    dtype: Option<String>,

    /// Override `optimizer.params.lr`
    #[arg(long)]
    lr: Option<f64>,

    /// Safetensors checkpoint to load after building
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            head_type: self.head_type.clone(),
            enable_prompt: self.enable_prompt,
            device: self.device.clone(),
            dtype: self.dtype.clone(),
            lr: self.lr,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Build the model and print its parameter groups
    Inspect {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run one forward pass on a synthetic batch
    Smoke {
        #[command(flatten)]
        run: RunArgs,

        #[arg(long, default_value_t = 2)]
        batch_size: usize,

        #[arg(long, default_value_t = 16)]
        text_len: usize,

        /// Visual tokens per image when features are fed directly
        #[arg(long, default_value_t = 49)]
        visual_len: usize,

        /// Pretraining objective (mlm, itm, itc)
        #[arg(long)]
        task: Option<String>,
    },
    /// Write a freshly initialized checkpoint
    InitCheckpoint {
        #[command(flatten)]
        run: RunArgs,

        /// Output safetensors file
        #[arg(long)]
        output: PathBuf,
    },
}

/// Resolve the run config, set up logging and build the model.
fn build(run: &RunArgs) -> anyhow::Result<(RunConfig, FashionVil)> {
    let mut config = RunConfig::resolve(run.config.as_deref()).context("loading run config")?;
    config.merge(&run.overrides());

    let level = run
        .log_level
        .clone()
        .or_else(|| config.runtime.log_level.clone());
    logging::init(level.as_deref());

    let device = config.runtime.device()?;
    let dtype = config.runtime.dtype()?;
    let model = FashionVil::build(config.model.clone(), dtype, &device)
        .context("building FashionViL model")?;
    if let Some(path) = &run.checkpoint {
        let report = model
            .load_checkpoint(path)
            .with_context(|| format!("loading checkpoint {}", path.display()))?;
        tracing::info!(
            loaded = report.loaded,
            missing = report.missing.len(),
            unexpected = report.unexpected.len(),
            "checkpoint applied"
        );
    }
    Ok((config, model))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Inspect { run } => {
            let (config, model) = build(&run)?;
            println!("head: {}", model.head_type());
            println!("image encoder: {:?}", model.image_encoder().kind());
            match model.prefix_prompts() {
                Some(prompt) => println!("prefix prompts: {:?}", prompt.dims()),
                None => println!("prefix prompts: none"),
            }
            for group in model.parameter_groups(&config.optimizer)? {
                println!(
                    "group {:<14} tensors={:<5} parameters={:<12} lr={:e}",
                    group.name,
                    group.params.len(),
                    group.num_parameters(),
                    group.lr
                );
            }
        }
        Command::Smoke {
            run,
            batch_size,
            text_len,
            visual_len,
            task,
        } => {
            let (_config, model) = build(&run)?;
            let shape = BatchShape {
                batch: batch_size,
                text_len,
                visual_len,
            };
            let samples = synthetic_batch(&model, shape, task.as_deref())?;
            let output = model.forward(samples).context("forward pass")?;
            for key in output.keys() {
                if let Some(tensor) = output.get(key) {
                    println!("{key}: {:?}", tensor.dims());
                }
            }
            for (name, loss) in output.losses() {
                let value = loss.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?;
                println!("{name}: {value:.4}");
            }
        }
        Command::InitCheckpoint { run, output } => {
            let (_config, model) = build(&run)?;
            model.save_checkpoint(&output)?;
            println!("wrote {}", output.display());
        }
    }

    Ok(())
}
