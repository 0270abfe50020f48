use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use ghmirror::cache::{CACHE_FORMAT_VERSION, CacheLocation};
use ghmirror::cancel::Cancellation;
use ghmirror::config::{ConfigOverrides, PullConfig};
use ghmirror::pull::PullService;

#[derive(Parser)]
#[command(
    name = "ghmirror",
    about = "Mirror a GitHub-hosted action and the release bundles it needs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Update the git mirror and cache the relevant release assets
    Pull {
        #[command(flatten)]
        source: SourceArgs,

        /// Only synchronize the git mirror
        #[arg(long)]
        skip_releases: bool,

        /// Give up after this many seconds, including time spent waiting for the cache lock
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// List the releases the mirrored branches depend on
    Releases {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Check dependencies and cache state
    Doctor {
        #[command(flatten)]
        source: SourceArgs,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// Cache directory (default: the user cache dir + "ghmirror")
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// URL of the GitHub instance to pull from
    #[arg(long)]
    source_url: Option<String>,

    /// Token for the source instance (default: $GITHUB_TOKEN)
    #[arg(long)]
    source_token: Option<String>,

    /// Repository in owner/repo format
    #[arg(long)]
    repository: Option<String>,

    /// git executable to run (default: git from PATH)
    #[arg(long)]
    git: Option<PathBuf>,
}

impl SourceArgs {
    fn into_config(self) -> Result<PullConfig, Box<dyn std::error::Error>> {
        let overrides = ConfigOverrides {
            cache_dir: self.cache_dir,
            source_url: self.source_url,
            source_token: self.source_token,
            repository: self.repository,
            git_program: self.git,
        };
        Ok(PullConfig::from_env(overrides)?)
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("ghmirror=info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Pull {
            source,
            skip_releases,
            timeout,
        } => cmd_pull(source, skip_releases, timeout),
        Commands::Releases { source } => cmd_releases(source),
        Commands::Doctor { source } => cmd_doctor(source),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Cancellation tripped by Ctrl-C.
fn install_interrupt_handler() -> Result<Cancellation, Box<dyn std::error::Error>> {
    let cancel = Cancellation::new();
    let handler_cancel = cancel.clone();
    ctrlc::set_handler(move || {
        log::warn!("Interrupted, stopping after the current step");
        handler_cancel.cancel();
    })?;
    Ok(cancel)
}

fn cmd_pull(
    source: SourceArgs,
    skip_releases: bool,
    timeout: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = source.into_config()?;
    let mut cancel = install_interrupt_handler()?;
    if let Some(secs) = timeout {
        cancel = cancel.with_timeout(Duration::from_secs(secs));
    }
    let cache = config.cache_directory();
    let _lock = cache.prepare_and_lock(&cancel)?;

    let pull = PullService::from_config(&config, cancel);
    let fresh = !pull.has_mirror();
    println!(
        "{} {} from {}...",
        if fresh { "Cloning" } else { "Updating" },
        config.repository,
        config.source_url
    );
    pull.synchronize_git(fresh)?;

    if skip_releases {
        println!("Skipping releases");
        return Ok(());
    }

    let summary = pull.synchronize_releases()?;
    println!(
        "Cached release assets: {} downloaded, {} up to date",
        summary.downloaded, summary.skipped
    );
    Ok(())
}

fn cmd_releases(source: SourceArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = source.into_config()?;
    let pull = PullService::from_config(&config, Cancellation::new());

    let releases = pull.relevant_releases()?;
    if releases.is_empty() {
        println!("No relevant releases");
        return Ok(());
    }
    for tag in releases {
        println!("{}", tag);
    }
    Ok(())
}

fn cmd_doctor(source: SourceArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = source.into_config()?;
    println!("ghmirror System Check\n");

    let git = config.git_cli().version();
    println!(
        "[{}] git: {}",
        if git.is_ok() { "OK" } else { "FAIL" },
        match &git {
            Ok(version) => version.clone(),
            Err(_) => "not found".to_string(),
        }
    );

    let cache = config.cache_directory();
    let marker = std::fs::read_to_string(cache.version_path()).ok();
    let cache_state = match marker.as_deref().map(str::trim) {
        Some(CACHE_FORMAT_VERSION) => "OK",
        Some(_) => "FAIL",
        None => "INFO",
    };
    println!(
        "[{}] Cache dir: {}{}",
        cache_state,
        cache.root().display(),
        match cache_state {
            "FAIL" => " (incompatible format version)",
            "INFO" => " (not initialized)",
            _ => "",
        }
    );

    let pull = PullService::from_config(&config, Cancellation::new());
    println!(
        "[{}] Mirror: {}",
        if pull.has_mirror() { "OK" } else { "INFO" },
        if pull.has_mirror() {
            cache.git_path().display().to_string()
        } else {
            "not cloned yet".to_string()
        }
    );

    println!(
        "[{}] Token: {}",
        if config.source_token.is_some() { "OK" } else { "INFO" },
        if config.source_token.is_some() {
            "configured"
        } else {
            "none (anonymous API requests are rate limited)"
        }
    );

    if git.is_err() || cache_state == "FAIL" {
        return Err("system check failed".into());
    }

    Ok(())
}
