//! CLI entry point for sketch-rnn-rs.

use std::path::PathBuf;

use candle_core::Device;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sketch_rnn_rs::{SketchResult, SketchRnnConfig, Trainer};

#[derive(Parser)]
#[command(name = "sketch-rnn")]
#[command(about = "Train and sample a Sketch-RNN VAE on pen-stroke sketches")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Start or resume training
    Train {
        /// Path to configuration file
        config: String,
        /// Resume from the checkpoint saved at this epoch
        #[arg(long, requires = "run_id")]
        resume_epoch: Option<usize>,
        /// Run to write into (or resume)
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Decode one validation sketch with a saved checkpoint
    Sample {
        /// Path to configuration file
        config: String,
        /// Run holding the checkpoint
        #[arg(long)]
        run_id: String,
        /// Checkpoint epoch
        #[arg(long)]
        epoch: usize,
        /// Validation sketch to encode
        #[arg(long, default_value_t = 0)]
        index: usize,
        /// Sampling temperature (defaults to the configured one)
        #[arg(long)]
        temperature: Option<f64>,
        /// Where to write the decoded stroke-3 JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn select_device() -> Device {
    let force_cpu = std::env::var("SKETCH_RNN_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if force_cpu || !cfg!(feature = "cuda") {
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(device @ Device::Cuda(_)) => {
            tracing::info!("Training device: CUDA (device 0)");
            device
        }
        Ok(_) => {
            tracing::warn!("CUDA not available; falling back to CPU");
            Device::Cpu
        }
        Err(err) => {
            tracing::warn!("CUDA init failed ({err}); falling back to CPU");
            Device::Cpu
        }
    }
}

fn main() -> SketchResult<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output } => {
            SketchRnnConfig::default().to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = SketchRnnConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!(
                "  Model: enc {} / dec {} / d_z {} / {} mixtures",
                config.model.enc_hidden_size,
                config.model.dec_hidden_size,
                config.model.d_z,
                config.model.n_distributions
            );
            println!("  Dataset: {}", config.dataset.path);
        }
        Commands::Train {
            config,
            resume_epoch,
            run_id,
        } => {
            tracing::info!("Starting training with config: {}", config);
            let mut config = SketchRnnConfig::from_file(&config)?;
            if run_id.is_some() {
                config.run_id = run_id;
            }

            let mut trainer = Trainer::new(config, select_device())?;
            if let Some(epoch) = resume_epoch {
                trainer.resume(epoch)?;
            }
            println!("RUN_ID: {}", trainer.run_id());
            trainer.train()?;
            println!("✓ Run written to: {}", trainer.store().run_dir().display());
        }
        Commands::Sample {
            config,
            run_id,
            epoch,
            index,
            temperature,
            output,
        } => {
            let mut config = SketchRnnConfig::from_file(&config)?;
            config.run_id = Some(run_id);
            let temperature = temperature.unwrap_or(config.training.temperature);

            let mut trainer = Trainer::new(config, select_device())?;
            trainer.load(epoch)?;
            let (_, decoded) = trainer.sample_one(index, temperature)?;

            let path =
                output.unwrap_or_else(|| trainer.store().sample_path(epoch, index, "decoded"));
            trainer.store().save_strokes(&path, &decoded)?;
            println!("✓ Sample written to: {}", path.display());
        }
    }

    Ok(())
}
