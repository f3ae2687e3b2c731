//! Command handlers for the grabia binary.
//!
//! Each subcommand merges CLI flags over config-file values over built-in
//! defaults, drives the library [`Mirror`], and maps the result to a
//! [`ProcessExit`].

pub(crate) mod config;
pub(crate) mod exit;
pub(crate) mod output;
pub(crate) mod progress;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use grabia_core::input::normalize_identifier;
use grabia_core::{
    ArchiveEndpoints, CleanOptions, FilterSpec, HttpClient, HttpOptions, JobOptions, Mirror,
    load_item_list,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::config::FileConfig;
use self::exit::{ProcessExit, clean_outcome, job_outcome};
use self::progress::ProgressUi;
use crate::cli::{
    CleanArgs, Cli, Command, FilterArgs, ItemArgs, ResumeArgs, StartArgs, StatusArgs,
};

/// Runs the parsed command.
pub(crate) async fn run(cli: &Cli, file_config: &FileConfig) -> Result<ProcessExit> {
    match &cli.command {
        Command::Start(args) => run_start(cli, file_config, args).await,
        Command::Resume(args) => run_resume(cli, file_config, args).await,
        Command::Status(args) => run_status(file_config, args).await,
        Command::Clean(args) => run_clean(cli, file_config, args).await,
    }
}

async fn run_start(cli: &Cli, cfg: &FileConfig, args: &StartArgs) -> Result<ProcessExit> {
    let items = collect_items(&args.items).await?;
    let mut options = JobOptions::new(items, output_dir(args.output.as_deref(), cfg));
    options.filter = filter_spec(&args.filter, cfg);
    if let Some(workers) = args.workers.or(cfg.max_workers) {
        options.max_workers = usize::from(workers);
    }
    options.speed_limit_mb_s = args.speed_limit.or(cfg.speed_limit).unwrap_or(0.0);
    options.sync = args.sync || cfg.sync.unwrap_or(false);
    options.dynamic_scaling = !args.no_dynamic && cfg.dynamic_scaling.unwrap_or(true);
    options.write_readme = args.readme;
    options.fresh = args.fresh;
    debug!(?options, "job options resolved");

    let mirror = build_mirror(cli, cfg)?;
    let cancel = shutdown_token();
    let ui = ProgressUi::spawn(use_progress(cli), mirror.events());
    let result = mirror.start(&options, cancel).await;
    ui.finish().await;
    let summary = result.with_context(|| {
        format!("Failed to mirror into '{}'", options.output_dir.display())
    })?;

    for line in output::job_summary_lines(&summary) {
        println!("{line}");
    }
    Ok(job_outcome(&summary))
}

async fn run_resume(cli: &Cli, cfg: &FileConfig, args: &ResumeArgs) -> Result<ProcessExit> {
    let dir = output_dir(args.dir.as_deref(), cfg);
    let mirror = build_mirror(cli, cfg)?;
    let cancel = shutdown_token();
    let ui = ProgressUi::spawn(use_progress(cli), mirror.events());
    let result = mirror
        .resume(&dir, args.workers.map(usize::from), cancel)
        .await;
    ui.finish().await;
    let summary =
        result.with_context(|| format!("Failed to resume job in '{}'", dir.display()))?;

    for line in output::job_summary_lines(&summary) {
        println!("{line}");
    }
    Ok(job_outcome(&summary))
}

async fn run_status(cfg: &FileConfig, args: &StatusArgs) -> Result<ProcessExit> {
    let dir = output_dir(args.dir.as_deref(), cfg);
    let report = Mirror::status(&dir)
        .await
        .with_context(|| format!("Failed to read job status in '{}'", dir.display()))?;

    if args.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to encode status")?;
        println!("{json}");
    } else {
        for line in output::status_lines(&report) {
            println!("{line}");
        }
    }
    Ok(ProcessExit::Success)
}

async fn run_clean(cli: &Cli, cfg: &FileConfig, args: &CleanArgs) -> Result<ProcessExit> {
    let options = CleanOptions {
        items: collect_items(&args.items).await?,
        output_dir: output_dir(args.output.as_deref(), cfg),
        filter: filter_spec(&args.filter, cfg),
        dry_run: !args.execute,
        prune_unlisted: args.prune_unlisted,
    };
    let mirror = build_mirror(cli, cfg)?;
    let report = mirror
        .clean(&options)
        .await
        .with_context(|| format!("Failed to clean '{}'", options.output_dir.display()))?;

    for line in output::clean_report_lines(&report) {
        println!("{line}");
    }
    Ok(clean_outcome(&report))
}

fn build_mirror(cli: &Cli, cfg: &FileConfig) -> Result<Mirror> {
    let client = HttpClient::with_options(&HttpOptions {
        access_token: cfg.resolved_access_token(),
        ..HttpOptions::default()
    })
    .context("Failed to build HTTP client")?;

    let endpoints = match cli.endpoint.as_deref() {
        Some(root) => ArchiveEndpoints::with_root(root)
            .with_context(|| format!("Invalid endpoint '{root}'"))?,
        None => ArchiveEndpoints::default(),
    };

    let mut mirror = Mirror::new(client, endpoints);
    if let Some(secs) = cfg.idle_timeout_secs {
        mirror = mirror.with_idle_timeout(Duration::from_secs(secs));
    }
    Ok(mirror)
}

/// Positional identifiers followed by the list file, deduplicated.
async fn collect_items(args: &ItemArgs) -> Result<Vec<String>> {
    let mut items = Vec::new();
    for raw in &args.items {
        match normalize_identifier(raw) {
            Some(id) => items.push(id),
            None => warn!(input = %raw, "Skipped unrecognized item identifier"),
        }
    }
    if let Some(path) = &args.input {
        let listed = load_item_list(path)
            .await
            .with_context(|| format!("Failed to load item list '{}'", path.display()))?;
        items.extend(listed);
    }

    let mut seen = HashSet::new();
    items.retain(|id| seen.insert(id.clone()));
    if items.is_empty() {
        bail!("No items given. Pass identifiers as arguments or use --input <FILE>.");
    }
    info!(items = items.len(), "Items to process");
    Ok(items)
}

fn filter_spec(args: &FilterArgs, cfg: &FileConfig) -> FilterSpec {
    FilterSpec {
        extensions: args.extensions.clone(),
        regex: args.regex.clone(),
        metadata_only: args.metadata_only,
        keep_readme: !args.no_keep_readme && cfg.keep_readme.unwrap_or(true),
    }
}

fn output_dir(flag: Option<&Path>, cfg: &FileConfig) -> PathBuf {
    flag.map(Path::to_path_buf)
        .or_else(|| cfg.output_dir.clone())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn use_progress(cli: &Cli) -> bool {
    progress::should_use_progress(
        progress::stderr_is_terminal(),
        cli.quiet,
        progress::is_dumb_terminal(),
    )
}

/// Token cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signalled = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping transfers");
            signalled.cancel();
        }
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_dir_precedence() {
        let mut cfg = FileConfig::default();
        assert_eq!(output_dir(None, &cfg), PathBuf::from("."));

        cfg.output_dir = Some(PathBuf::from("/cfg"));
        assert_eq!(output_dir(None, &cfg), PathBuf::from("/cfg"));
        assert_eq!(
            output_dir(Some(Path::new("/flag")), &cfg),
            PathBuf::from("/flag")
        );
    }

    #[test]
    fn test_filter_spec_keep_readme_merging() {
        let mut cfg = FileConfig::default();
        let args = FilterArgs::default();
        assert!(filter_spec(&args, &cfg).keep_readme);

        cfg.keep_readme = Some(false);
        assert!(!filter_spec(&args, &cfg).keep_readme);

        cfg.keep_readme = Some(true);
        let args = FilterArgs {
            no_keep_readme: true,
            ..FilterArgs::default()
        };
        assert!(!filter_spec(&args, &cfg).keep_readme);
    }

    #[tokio::test]
    async fn test_collect_items_normalizes_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("items.txt");
        std::fs::write(&list, "# list\nbeta\nalpha\n").unwrap();

        let args = ItemArgs {
            items: vec![
                "https://archive.org/details/alpha".to_string(),
                "not an id".to_string(),
            ],
            input: Some(list),
        };
        let items = collect_items(&args).await.unwrap();
        assert_eq!(items, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_collect_items_requires_something() {
        assert!(collect_items(&ItemArgs::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_collect_items_missing_list_is_error() {
        let args = ItemArgs {
            items: vec!["a".into()],
            input: Some(PathBuf::from("/definitely/not/here.txt")),
        };
        let err = collect_items(&args).await.unwrap_err();
        assert!(format!("{err:#}").contains("here.txt"));
    }
}
