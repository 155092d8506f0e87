//! CLI interface for pinner.
//!
//! Every command is non-interactive: arguments in, a summary out.
//! Configuration comes from `~/.pinner/config.toml`; the global flags
//! below override it for one run.

mod format;

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use jiff::{Zoned, civil::Date};

use crate::classify::Classifier;
use crate::config::Config;
use crate::github::{GhRemote, GitMirror};
use crate::model::ActionIdentity;
use crate::patch::OccurrencePolicy;
use crate::resolve::{MirrorCache, Resolver};
use crate::schedule::Scheduler;
use crate::workflow::{DocumentOutcome, Pinner};

use format::{format_notice, format_resolution, format_tally};

/// Pinner: pin GitHub Actions references to commit hashes.
#[derive(Debug, Parser)]
#[command(name = "pinner", version, after_long_help = USAGE_HELP)]
pub struct Cli {
    /// Log resolver and cache activity to stderr.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Leave `uses` values containing this substring alone. Repeatable.
    #[arg(long = "skip", value_name = "SUBSTR", global = true)]
    skip: Vec<String>,

    /// Resolution worker count (defaults to host parallelism).
    #[arg(long, global = true)]
    workers: Option<NonZeroUsize>,

    /// Mirror cache root.
    #[arg(long, value_name = "DIR", global = true)]
    cache_dir: Option<PathBuf>,

    /// Pin every occurrence of a duplicated invocation, not just the first.
    #[arg(long, global = true)]
    all_occurrences: bool,

    #[command(subcommand)]
    pub command: Command,
}

const USAGE_HELP: &str = r"Examples:
  pinner repo .
  pinner --skip my-org/ workflow .github/workflows/ci.yml
  pinner action actions/checkout v4
  pinner cache clean

Pinned steps look like:
  uses: actions/checkout@<hash> # v4 on 2024-03-09";

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Pin every workflow in `<path>/.github/workflows`.
    Repo {
        /// Repository checkout root.
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Pin a single workflow file.
    Workflow {
        /// Path to the workflow YAML.
        file: PathBuf,
    },

    /// Resolve one action ref and print its commit hash. Changes nothing.
    Action {
        /// `owner/name`.
        action: String,

        /// Tag, branch, or version prefix (e.g. `v4`).
        reference: String,
    },

    /// Inspect or clear the mirror cache.
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Print the cache root.
    Path,

    /// Delete every cached mirror.
    Clean,
}

/// Run the CLI, returning an error message on failure.
pub fn run(cli: Cli, config: &Config) -> Result<(), String> {
    let settings = Settings::merge(&cli, config);

    match cli.command {
        Command::Repo { path } => cmd_repo(&settings, &path),
        Command::Workflow { file } => cmd_workflow(&settings, &file),
        Command::Action { action, reference } => cmd_action(&settings, &action, &reference),
        Command::Cache { command } => match command {
            CacheCommand::Path => {
                println!("{}", settings.cache_dir.display());
                Ok(())
            }
            CacheCommand::Clean => cmd_cache_clean(&settings),
        },
    }
}

/// Flags layered over the config file.
#[derive(Debug)]
struct Settings {
    skip: Vec<String>,
    workers: NonZeroUsize,
    cache_dir: PathBuf,
    policy: OccurrencePolicy,
    gh_config_dir: Option<PathBuf>,
}

impl Settings {
    fn merge(cli: &Cli, config: &Config) -> Self {
        let skip = config
            .skip_actions
            .iter()
            .chain(&cli.skip)
            .cloned()
            .collect();
        let policy = if cli.all_occurrences || config.replace_all_occurrences {
            OccurrencePolicy::All
        } else {
            OccurrencePolicy::First
        };

        Self {
            skip,
            workers: cli
                .workers
                .or(config.workers)
                .unwrap_or_else(Scheduler::default_workers),
            cache_dir: cli
                .cache_dir
                .clone()
                .or_else(|| config.cache_dir.clone())
                .unwrap_or_else(MirrorCache::default_root),
            policy,
            gh_config_dir: config.gh_config_dir.clone(),
        }
    }

    fn resolver(&self) -> Resolver {
        Resolver::new(
            GhRemote::new(self.gh_config_dir.clone()),
            GitMirror::new(self.gh_config_dir.clone()),
            MirrorCache::new(&self.cache_dir),
        )
    }

    fn pinner(&self) -> Pinner {
        Pinner::new(self.resolver(), Classifier::new(self.skip.clone()))
            .with_workers(self.workers)
            .with_policy(self.policy)
    }
}

fn today() -> Date {
    Zoned::now().date()
}

fn cmd_repo(settings: &Settings, path: &Path) -> Result<(), String> {
    let outcome = settings
        .pinner()
        .pin_repository(path, today())
        .map_err(|e| format!("failed to pin repository: {e}"))?;

    if outcome.missing_workflows {
        println!("No workflows found in {}", path.display());
        return Ok(());
    }

    for (file, document) in &outcome.documents {
        report_document(file, document);
    }
    for failure in &outcome.failures {
        eprintln!("Warning: {failure}");
    }

    println!("{} workflow(s):", outcome.documents.len());
    println!("{}", format_tally(&outcome.tally));
    Ok(())
}

fn cmd_workflow(settings: &Settings, file: &Path) -> Result<(), String> {
    let outcome = settings
        .pinner()
        .pin_file(file, today())
        .map_err(|e| e.to_string())?;

    report_document(file, &outcome);
    println!("{}", format_tally(&outcome.tally));
    Ok(())
}

fn cmd_action(settings: &Settings, action: &str, reference: &str) -> Result<(), String> {
    let identity = ActionIdentity::parse(action)
        .ok_or_else(|| format!("expected owner/name, got '{action}'"))?;
    if reference.is_empty() {
        return Err("ref must not be empty".to_string());
    }

    let resolved = settings
        .resolver()
        .resolve(&identity, reference)
        .map_err(|e| e.to_string())?;

    println!("{}", format_resolution(&identity, reference, &resolved));
    Ok(())
}

fn cmd_cache_clean(settings: &Settings) -> Result<(), String> {
    let cache = MirrorCache::new(&settings.cache_dir);
    let removed = cache
        .clean()
        .map_err(|e| format!("failed to clean {}: {e}", cache.root().display()))?;

    if removed {
        println!("Removed {}", cache.root().display());
    } else {
        println!("Cache is empty");
    }
    Ok(())
}

fn report_document(file: &Path, document: &DocumentOutcome) {
    if document.changed {
        println!("Updated {}", file.display());
    }
    for notice in &document.notices {
        eprintln!("Warning: {}: {}", file.display(), format_notice(notice));
    }
}
