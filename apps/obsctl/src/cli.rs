//! Command-line arguments.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "obsctl", version, about = "Resumable multipart transfers for object storage")]
pub struct Cli {
    /// Configuration file (defaults to the per-user obsctl.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Upload, download or copy objects. Remote paths look like obs://bucket/key.
    Cp(CpArgs),
}

#[derive(Debug, Clone, Args)]
pub struct CpArgs {
    /// Source: local path or obs://bucket/key.
    pub src: String,

    /// Destination: local path or obs://bucket/key.
    pub dest: String,

    /// Upload every file below a local directory.
    #[arg(short, long)]
    pub recursive: bool,

    /// Files transferred at once.
    #[arg(long)]
    pub tasknum: Option<usize>,

    /// Parts transferred at once within one file.
    #[arg(long)]
    pub parttasknum: Option<usize>,

    /// Part size, e.g. 8M.
    #[arg(long)]
    pub partsize: Option<String>,

    /// Do not record checkpoints; interrupted transfers start over.
    #[arg(long)]
    pub no_checkpoint: bool,

    /// Directory for checkpoint files.
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Aggregate byte rate ceiling, e.g. 10M. 0 means unlimited.
    #[arg(long)]
    pub flowwidth: Option<String>,

    /// Time-of-day rate table, e.g. '{"07:30-12:00": "1M"}'.
    #[arg(long)]
    pub flowpolicy: Option<String>,

    /// Compare the uploaded object's ETag with one computed locally.
    #[arg(long)]
    pub verify: bool,

    /// Version of the source object to download.
    #[arg(long)]
    pub version_id: Option<String>,
}
