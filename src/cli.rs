//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Mirror filtered file sets of archive.org items.
///
/// grabia downloads the files of one or more archive.org items into a local
/// directory, resumes interrupted jobs, and reconciles the local tree with
/// the remote listings.
#[derive(Parser, Debug)]
#[command(name = "grabia")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Archive server root (defaults to https://archive.org)
    #[arg(long, global = true, hide = true, value_name = "URL")]
    pub endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start (or continue) mirroring items into a directory
    Start(StartArgs),
    /// Continue the job stored in a directory with its saved settings
    Resume(ResumeArgs),
    /// Show progress of the job stored in a directory
    Status(StatusArgs),
    /// Find (and optionally delete) local files no longer selected
    Clean(CleanArgs),
}

/// Where the item identifiers come from.
#[derive(Args, Debug, Clone, Default)]
pub struct ItemArgs {
    /// Item identifiers or archive.org URLs
    #[arg(value_name = "ITEM")]
    pub items: Vec<String>,

    /// Read identifiers from a TXT or CSV list
    #[arg(short = 'i', long = "input", value_name = "FILE")]
    pub input: Option<PathBuf>,
}

/// File selection rules shared by `start` and `clean`.
#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Keep only these extensions (comma separated, e.g. "mp3,flac")
    #[arg(short = 'e', long = "ext", value_delimiter = ',', value_name = "EXT")]
    pub extensions: Vec<String>,

    /// Keep only names matching this regular expression
    #[arg(long, value_name = "PATTERN")]
    pub regex: Option<String>,

    /// Keep only xml, json, txt and README files
    #[arg(long)]
    pub metadata_only: bool,

    /// Treat generated README.txt files as orphans in `clean`
    #[arg(long)]
    pub no_keep_readme: bool,
}

#[derive(Args, Debug)]
pub struct StartArgs {
    #[command(flatten)]
    pub items: ItemArgs,

    /// Output directory (defaults to the config value, then ".")
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub filter: FilterArgs,

    /// Maximum concurrent downloads (1-64)
    #[arg(short = 'w', long, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub workers: Option<u8>,

    /// Aggregate speed cap in MB/s (0 for unlimited)
    #[arg(short = 's', long, value_parser = parse_speed_limit, value_name = "MB_S")]
    pub speed_limit: Option<f64>,

    /// Skip files already present with the declared size
    #[arg(long)]
    pub sync: bool,

    /// Keep the worker count fixed at the maximum
    #[arg(long)]
    pub no_dynamic: bool,

    /// Write a README.txt describing each item
    #[arg(long)]
    pub readme: bool,

    /// Discard previous job state in the output directory first
    #[arg(long)]
    pub fresh: bool,
}

#[derive(Args, Debug)]
pub struct ResumeArgs {
    /// Job directory (defaults to the config output_dir, then ".")
    #[arg(value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Override the saved worker maximum (1-64)
    #[arg(short = 'w', long, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub workers: Option<u8>,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Job directory (defaults to the config output_dir, then ".")
    #[arg(value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Print the status as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct CleanArgs {
    #[command(flatten)]
    pub items: ItemArgs,

    /// Mirror directory (defaults to the config value, then ".")
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub filter: FilterArgs,

    /// Delete orphans; without it the run only reports them
    #[arg(long)]
    pub execute: bool,

    /// Also treat item directories not in the list as orphans
    #[arg(long)]
    pub prune_unlisted: bool,
}

fn parse_speed_limit(raw: &str) -> Result<f64, String> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("'{raw}' is not a number"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("'{raw}' must be a non-negative number"));
    }
    Ok(value)
}
