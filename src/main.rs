use clap::Parser;
use introvae::ModelConfig;
use std::{error::Error, path::PathBuf};
use tracing_subscriber::EnvFilter;

mod eval;
mod train;

#[derive(Parser)]
#[clap(
    name = "introvae",
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
struct Entry {
    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(clap::Args)]
struct ModelArgs {
    /// Image side length (power of two)
    #[clap(long, default_value = "128")]
    imgsz: i64,
    /// Encoder stem channels
    #[clap(long, default_value = "32")]
    channels: i64,
    /// Latent dimension
    #[clap(long, default_value = "256")]
    z_dim: i64,
    /// Adversarial weight
    #[clap(long, default_value = "1")]
    alpha: f64,
    /// Reconstruction weight
    #[clap(long, default_value = "1")]
    beta: f64,
    /// KL margin for the encoder hinge
    #[clap(long, default_value = "125")]
    margin: f64,
    /// Learning rate of both optimizers
    #[clap(long, default_value = "1e-3")]
    lr: f64,
}

impl From<ModelArgs> for ModelConfig {
    fn from(args: ModelArgs) -> Self {
        ModelConfig {
            image_size: args.imgsz,
            base_channels: args.channels,
            z_dim: args.z_dim,
            alpha: args.alpha,
            beta: args.beta,
            margin: args.margin,
            lr_encoder: args.lr,
            lr_decoder: args.lr,
        }
    }
}

#[derive(clap::Subcommand)]
enum Subcommand {
    /// Start training process
    Train {
        /// Dataset path
        dataset: PathBuf,
        /// Model path
        model: PathBuf,
        /// Demo path
        demo: PathBuf,
        #[clap(flatten)]
        config: ModelArgs,
        /// Images per batch
        #[clap(long, default_value = "32")]
        batch_size: i64,
        /// Total iterations
        #[clap(long, default_value = "100000")]
        iterations: u64,
        /// Iterations between demo images and checkpoints
        #[clap(long, default_value = "1000")]
        sample_every: u64,
    },
    /// Interpolate between images in latent space
    Eval {
        /// Checkpoint path
        checkpoint: PathBuf,
        /// Output image path
        output: PathBuf,
        /// Input images
        #[clap(long, required = true, multiple_values = true)]
        input: Vec<PathBuf>,
        /// Number of interpolated images
        #[clap(long, default_value = "3")]
        n_interp: i64,
        #[clap(flatten)]
        config: ModelArgs,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Entry::parse();
    match args.subcommand {
        Subcommand::Train {
            dataset,
            model,
            demo,
            config,
            batch_size,
            iterations,
            sample_every,
        } => {
            let opts = train::TrainOptions {
                batch_size,
                iterations,
                sample_every,
            };
            train::train(dataset, model, demo, config.into(), opts)
        }
        Subcommand::Eval {
            checkpoint,
            output,
            input,
            n_interp,
            config,
        } => eval::eval(checkpoint, input, output, config.into(), n_interp),
    }
}
