use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "inferport", version, about = "Run a graph once on the best available backend")]
pub struct Cli {
    /// Log filter (RUST_LOG syntax)
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug)]
pub struct BackendArgs {
    /// Backends to try, most preferred first
    #[arg(long, env = "INFERPORT_BACKENDS", default_value = "GpuAcc,CpuAcc,CpuRef")]
    pub backends: String,

    /// Refuse to load networks needing more resident bytes than this
    #[arg(long, env = "INFERPORT_MAX_RESIDENT_BYTES")]
    pub max_resident_bytes: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Echo a number through a one-weight fully connected layer
    Identity {
        #[arg(long, default_value_t = 3.0)]
        value: f32,

        #[command(flatten)]
        backend: BackendArgs,
    },

    /// Classify one dataset sample with a JSON model
    Classify {
        /// Path to the JSON model description
        #[arg(long, env = "INFERPORT_MODEL")]
        model: PathBuf,

        /// IDX image file
        #[arg(long, env = "INFERPORT_IMAGES")]
        images: PathBuf,

        /// IDX label file
        #[arg(long, env = "INFERPORT_LABELS")]
        labels: PathBuf,

        /// Record to classify
        #[arg(long, default_value_t = 0)]
        index: usize,

        /// Feed raw 0-255 pixels instead of scaling to [0, 1]
        #[arg(long)]
        no_scale: bool,

        /// Pipeline config (JSON); overrides --backends
        #[arg(long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        backend: BackendArgs,
    },
}
