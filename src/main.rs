// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use distroget::colors::*;
use distroget::config::{self, load_config, save_config, Config};
use distroget::deploy::{select_for_deploy, DeployTransport, RsyncTransport};
use distroget::download::{
    filename_from_source, CatalogEntry, DownloadManager, FetchBinary, Summary, TaskEvent, TaskReport,
    TaskState, TransferKind, TransferRequest,
};
use distroget::error::{explain_download_error, explain_failure, ErrorBuilder};
use distroget::error_msg;
use distroget::logging::{init_logging, LogLevel};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Every task completed
    pub const SUCCESS: i32 = 0;
    /// At least one task failed or was cancelled
    pub const ERROR: i32 = 1;
    /// Usage error - invalid command line arguments
    pub const USAGE: i32 = 64;
    /// Torrent-only batch and no fetch binary installed
    pub const SERVICE_UNAVAILABLE: i32 = 69;
    /// Configuration error - invalid or unreadable config
    pub const CONFIG: i32 = 78;
}

use exit_codes::*;

mod spinner {
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    /// Create a spinner with consistent styling
    pub fn create(message: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner()
            .tick_chars("\u{28FB}\u{28F9}\u{28FC}\u{28F8}\u{28FE}\u{28F6}\u{28F7}\u{28E7}\u{28CF}\u{28DF} ")
            .template("{spinner:.cyan} {msg}")
        {
            spinner.set_style(style);
        }
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(80));
        spinner
    }

    /// Finish spinner with success message
    pub fn finish_success(spinner: &ProgressBar, message: &str) {
        spinner.finish_and_clear();
        println!("\x1b[32m[OK]\x1b[0m {}", message);
    }

    /// Finish spinner with error message
    pub fn finish_error(spinner: &ProgressBar, message: &str) {
        spinner.finish_and_clear();
        println!("\x1b[31m[X]\x1b[0m {}", message);
    }
}

#[derive(Parser)]
#[command(name = "distroget")]
#[command(version = VERSION)]
#[command(about = "Fetch Linux distribution images concurrently, over HTTP or BitTorrent.")]
#[command(long_about = "distroget - concurrent image fetcher\n\n\
    Download images:      distroget fetch <URL|MAGNET>...\n\
    Check torrent tool:   distroget check\n\
    Configure:            distroget config show\n\n\
    HTTP downloads resume where they stopped. Torrents need aria2c.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level for the log file
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Log file (default: ~/.config/distroget/distroget.log)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Quiet mode: no progress bars, summary only
    #[arg(short = 'q', long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one or more images
    ///
    /// Examples:
    ///   distroget fetch https://cdimage.debian.org/.../debian-12.iso
    ///   distroget fetch -j 2 "magnet:?xt=urn:btih:...&dn=mint.iso" https://.../alpine.iso
    Fetch(FetchArgs),

    /// Check whether the torrent fetcher (aria2c) is installed
    Check,

    /// View or change configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(clap::Args)]
struct FetchArgs {
    /// HTTP(S) URLs, .torrent URLs or magnet links
    #[arg(required = true)]
    sources: Vec<String>,

    /// Directory to download into (default: configured download_dir)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Maximum simultaneous downloads
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Keep partial files of cancelled HTTP downloads for later resume
    #[arg(long)]
    keep_partial: bool,

    /// Leave .gz/.bz2/.zip artifacts compressed
    #[arg(long)]
    no_decompress: bool,

    /// Expected hex digest (MD5, SHA-256 or SHA-512); single source only
    #[arg(long)]
    checksum: Option<String>,

    /// Deploy every completed image to the configured rsync target
    #[arg(long)]
    deploy: bool,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration
    ///
    /// Example:
    ///   distroget config show
    Show,

    /// Change the download directory (~ and $VAR are expanded at use)
    ///
    /// Example:
    ///   distroget config set-dir ~/iso
    SetDir {
        /// Directory path
        dir: String,
    },

    /// Change how many downloads run at once
    ///
    /// Example:
    ///   distroget config set-concurrency 4
    SetConcurrency {
        /// Worker count (at least 1)
        count: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "{}",
                error_msg!(
                    &format!("Could not load configuration: {:#}", e),
                    fixes: [
                        "Inspect the file: distroget config show",
                        "Delete ~/.config/distroget/config.json to restore defaults",
                    ]
                )
            );
            std::process::exit(CONFIG);
        }
    };

    if let Err(e) = init_logging(cli.log_level, cli.log_file.as_deref()) {
        eprintln!("{YELLOW}[!]{RESET} Logging disabled: {:#}", e);
    }

    let code = match cli.command {
        Commands::Check => handle_check(&config),
        Commands::Config { command } => {
            handle_config(command, config)?;
            SUCCESS
        }
        Commands::Fetch(args) => {
            let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
            runtime.block_on(run_fetch(args, config, cli.quiet))?
        }
    };

    if code != SUCCESS {
        std::process::exit(code);
    }
    Ok(())
}

fn handle_check(config: &Config) -> i32 {
    let fetch = FetchBinary::new(&config.fetch_binary);
    let sp = spinner::create(&format!("Probing {}...", config.fetch_binary));
    let (available, message) = fetch.is_available();
    if available {
        spinner::finish_success(&sp, &message);
        SUCCESS
    } else {
        spinner::finish_error(&sp, &format!("{} is not usable", config.fetch_binary));
        println!();
        println!("{}", message);
        SERVICE_UNAVAILABLE
    }
}

fn handle_config(command: Option<ConfigCommands>, mut config: Config) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{CYAN}{BOLD}=== distroget Configuration ==={RESET}");
            println!();
            println!(
                "  Download dir:     {} {GRAY}({}){RESET}",
                config.download_dir,
                config.download_dir().display()
            );
            println!("  Concurrency:      {}", config.max_concurrency);
            println!(
                "  Retries:          {} attempts, {}ms base, {}ms cap",
                config.retry.max_attempts,
                config.retry.base_delay.as_millis(),
                config.retry.max_delay.as_millis()
            );
            println!(
                "  Timeouts:         idle {}s, connect {}s, read {}s",
                config.idle_timeout_secs, config.connect_timeout_secs, config.read_timeout_secs
            );
            println!("  Fetch binary:     {}", config.fetch_binary);
            println!("  Skip existing:    {}", config.skip_existing);
            println!("  Decompress:       {}", config.decompress);
            println!("  Keep partial:     {}", config.keep_partial_on_cancel);
            match &config.deploy {
                Some(target) => println!("  Deploy target:    {}", target.destination),
                None => println!("  Deploy target:    {DIM}(not set){RESET}"),
            }
            if !config.auto_deploy_items.is_empty() {
                let items: Vec<&str> = config.auto_deploy_items.iter().map(String::as_str).collect();
                println!("  Auto-deploy:      {}", items.join(", "));
            }
            println!();
            if let Ok(path) = config::config_path() {
                println!("Config file: {}", path.display());
            }
            println!();
        }
        Some(ConfigCommands::SetDir { dir }) => {
            config.download_dir = dir.clone();
            save_config(&config)?;
            println!("{GREEN}{}{RESET} Download directory set to: {}", symbols::SUCCESS, dir);
        }
        Some(ConfigCommands::SetConcurrency { count }) => {
            if count == 0 {
                eprintln!("{RED}{}{RESET} Concurrency must be at least 1", symbols::ERROR);
                std::process::exit(USAGE);
            }
            config.max_concurrency = count;
            save_config(&config)?;
            println!("{GREEN}{}{RESET} Concurrency set to: {}", symbols::SUCCESS, count);
        }
    }
    Ok(())
}

fn build_requests(args: &FetchArgs, config: &Config) -> Result<Vec<TransferRequest>, String> {
    if args.checksum.is_some() && args.sources.len() != 1 {
        return Err("--checksum can only be used with a single source".to_string());
    }
    let dir = args.dir.clone().unwrap_or_else(|| config.download_dir());
    let keep_partial = args.keep_partial || config.keep_partial_on_cancel;

    Ok(args
        .sources
        .iter()
        .map(|source| {
            let entry = CatalogEntry::new(filename_from_source(source), source.clone());
            let mut request = TransferRequest::from_catalog(&entry, &dir).keep_partial(keep_partial);
            if let Some(sum) = &args.checksum {
                request = request.with_checksum(sum.clone());
            }
            request
        })
        .collect())
}

async fn run_fetch(args: FetchArgs, mut config: Config, quiet: bool) -> Result<i32> {
    if let Some(n) = args.concurrency {
        if n == 0 {
            eprintln!("{RED}{}{RESET} --concurrency must be at least 1", symbols::ERROR);
            return Ok(USAGE);
        }
        config.max_concurrency = n;
    }
    if args.no_decompress {
        config.decompress = false;
    }
    if let Err(e) = config.validate() {
        eprintln!("{RED}{}{RESET} Invalid configuration: {:#}", symbols::ERROR, e);
        return Ok(CONFIG);
    }

    let requests = match build_requests(&args, &config) {
        Ok(r) => r,
        Err(msg) => {
            eprintln!("{RED}{}{RESET} {}", symbols::ERROR, msg);
            return Ok(USAGE);
        }
    };

    let fetch = Arc::new(FetchBinary::new(&config.fetch_binary));
    if requests.iter().all(|r| r.kind == TransferKind::Torrent) {
        let probe = Arc::clone(&fetch);
        let (available, message) = tokio::task::spawn_blocking(move || probe.is_available())
            .await
            .context("fetch binary probe panicked")?;
        if !available {
            let text = ErrorBuilder::new(format!("{} is required for torrent and magnet sources", config.fetch_binary))
                .cause(message)
                .fix("Use direct HTTP(S) links instead")
                .build();
            eprintln!("{}", text);
            return Ok(SERVICE_UNAVAILABLE);
        }
    }

    let manager = Arc::new(DownloadManager::new(config.engine_options(), fetch)?);
    let ids = match manager.submit(requests) {
        Ok(ids) => ids,
        Err(e) => {
            eprintln!("{}", explain_download_error(&e));
            manager.shutdown().await;
            return Ok(USAGE);
        }
    };

    println!(
        "{CYAN}{}{RESET} Fetching {} image(s), {} at a time",
        symbols::INFO,
        ids.len(),
        config.max_concurrency
    );

    let multi = if quiet {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    } else {
        MultiProgress::new()
    };

    let mut renderers = Vec::with_capacity(ids.len());
    for id in &ids {
        let Some(snapshot) = manager.snapshot(*id) else { continue };
        let name = manager
            .report(*id)
            .map(|r| display_name(&r))
            .unwrap_or_else(|| snapshot.id.to_string());
        let bar = multi.add(task_bar(&name));
        let events = manager.subscribe(*id)?;
        renderers.push(spawn_renderer(bar, events));
    }

    let interrupt = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, cancelling all downloads");
                eprintln!("\n{YELLOW}{}{RESET} Cancelling downloads...", symbols::WARNING);
                manager.cancel_all();
            }
        })
    };

    let summary = manager.wait_all().await;
    interrupt.abort();
    for renderer in renderers {
        let _ = renderer.await;
    }
    manager.shutdown().await;

    print_summary(&summary);
    deploy_completed(&args, &config, &summary).await;

    Ok(if summary.all_succeeded() { SUCCESS } else { ERROR })
}

fn display_name(report: &TaskReport) -> String {
    report
        .request
        .label
        .clone()
        .unwrap_or_else(|| report.request.destination.display().to_string())
}

fn task_bar(name: &str) -> ProgressBar {
    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} {prefix:<28!} [{bar:30.cyan/blue}] {bytes:>10}/{total_bytes:<10} {msg}")
    {
        bar.set_style(style.progress_chars("█▓░"));
    }
    bar.set_prefix(name.to_string());
    bar.set_message("queued");
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn spawn_renderer(bar: ProgressBar, mut events: mpsc::UnboundedReceiver<TaskEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TaskEvent::Progress { progress, .. } => {
                    if let Some(total) = progress.bytes_total {
                        bar.set_length(total);
                    }
                    bar.set_position(progress.bytes_done);
                    let mut msg = progress.speed_string();
                    if let Some(eta) = progress.eta_string() {
                        msg.push_str(&format!(" ETA {}", eta));
                    }
                    if let Some(peers) = progress.peers {
                        msg.push_str(&format!(" {} peers", peers));
                    }
                    bar.set_message(msg);
                }
                TaskEvent::StateChanged { state, attempt, .. } => {
                    let msg = match (state, attempt) {
                        (TaskState::Queued, a) if a > 0 => format!("retrying (attempt {} failed)", a),
                        (TaskState::Running, a) if a > 1 => format!("attempt {}", a),
                        (state, _) => state.to_string(),
                    };
                    bar.set_message(msg);
                }
                TaskEvent::Finished { report, .. } => {
                    let msg = match report.state {
                        TaskState::Completed => format!("{GREEN}done{RESET}"),
                        TaskState::Cancelled => format!("{YELLOW}cancelled{RESET}"),
                        _ => format!("{RED}failed{RESET}"),
                    };
                    bar.finish_with_message(msg);
                    break;
                }
            }
        }
    })
}

fn print_summary(summary: &Summary) {
    println!();
    println!("{}", separator(60));
    for report in &summary.succeeded {
        let path = report
            .artifact
            .as_ref()
            .unwrap_or(&report.request.destination)
            .display()
            .to_string();
        println!("{GREEN}{}{RESET} {} {} {}", symbols::SUCCESS, display_name(report), symbols::ARROW, path.dimmed());
        if report.retries > 0 {
            println!("     {GRAY}after {} retr{}{RESET}", report.retries, if report.retries == 1 { "y" } else { "ies" });
        }
        if let Some(warning) = &report.warning {
            println!("     {YELLOW}{}{RESET} {}", symbols::WARNING, warning);
        }
    }
    for report in &summary.cancelled {
        println!("{YELLOW}{}{RESET} {} cancelled", symbols::WARNING, display_name(report));
    }
    for report in &summary.failed {
        match &report.failure {
            Some(failure) => eprintln!("{}\n", explain_failure(&display_name(report), failure)),
            None => eprintln!("{RED}{}{RESET} {} failed", symbols::ERROR, display_name(report)),
        }
    }
    println!("{}", separator(60));
    let headline = format!(
        "{} completed, {} failed, {} cancelled",
        summary.succeeded.len(),
        summary.failed.len(),
        summary.cancelled.len()
    );
    if summary.all_succeeded() {
        println!("{}", headline.green().bold());
    } else {
        println!("{}", headline.yellow().bold());
    }
}

async fn deploy_completed(args: &FetchArgs, config: &Config, summary: &Summary) {
    let markers = if args.deploy {
        summary.succeeded.iter().filter_map(|r| r.request.label.clone()).collect()
    } else {
        config.auto_deploy_items.clone()
    };
    let artifacts = select_for_deploy(summary, &markers);
    if artifacts.is_empty() {
        return;
    }
    let Some(target) = config.deploy.clone() else {
        if args.deploy {
            eprintln!("{YELLOW}{}{RESET} --deploy given but no deploy target is configured", symbols::WARNING);
        }
        return;
    };

    let transport = RsyncTransport::new(target);
    for artifact in artifacts {
        let sp = spinner::create(&format!("Deploying {}...", artifact.display()));
        let t = transport.clone();
        let path = artifact.clone();
        match tokio::task::spawn_blocking(move || t.deploy(&path)).await {
            Ok(outcome) if outcome.success => spinner::finish_success(&sp, &outcome.message),
            Ok(outcome) => spinner::finish_error(&sp, &outcome.message),
            Err(e) => spinner::finish_error(&sp, &format!("deploy task failed: {}", e)),
        }
    }
}
