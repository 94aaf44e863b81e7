mod browser;
mod coordinator;
mod db;
mod error;
mod extract;
mod monitor;
mod session;
mod settings;
mod task;

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use regex::Regex;
use serde_json::json;
use tracing::info;

use crate::browser::chromium::ChromiumLauncher;
use crate::coordinator::Coordinator;
use crate::error::TaskFailure;
use crate::extract::rules::{ExtractionRules, ReadyCondition};
use crate::extract::Engine;
use crate::monitor::SiteOutcome;
use crate::session::SessionPool;
use crate::settings::{Overrides, Settings};

#[derive(Parser)]
#[command(name = "newsmon", about = "News site monitor driven by headless Chromium")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Config file (default: newsmon.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Subcommand)]
enum Commands {
    /// Start monitoring one or more listing pages
    Add { urls: Vec<String> },
    /// Stop monitoring pages
    Remove { urls: Vec<String> },
    /// Show monitored pages
    List,
    /// Fetch every monitored page and report new articles
    Check,
    /// Fetch article pages as cleaned HTML or reader view
    Read {
        urls: Vec<String>,
        #[arg(short, long, value_enum, default_value = "reader")]
        mode: ReadMode,
        /// Write each page into this directory instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Run arbitrary extraction rules (JSON) against one page
    Fetch {
        url: String,
        /// e.g. '{"kind":"fields","fields":[{"name":"headline","selector":"h1"}]}'
        #[arg(long)]
        rules: Option<String>,
        /// Readiness condition (JSON), default DOMContentLoaded
        #[arg(long)]
        ready: Option<String>,
    },
    /// Show monitoring statistics
    Stats,
}

#[derive(Clone, Copy, ValueEnum)]
enum ReadMode {
    Html,
    Reader,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?.apply(&cli.overrides)?;

    let result = match cli.command {
        Commands::Add { urls } => {
            let conn = open_db(&settings)?;
            for url in &urls {
                check_url(url)?;
                if db::add_site(&conn, url)? {
                    println!("Added {}", url);
                } else {
                    println!("Already monitored: {}", url);
                }
            }
            Ok(())
        }
        Commands::Remove { urls } => {
            let conn = open_db(&settings)?;
            for url in &urls {
                if db::remove_site(&conn, url)? {
                    println!("Removed {}", url);
                } else {
                    println!("Not monitored: {}", url);
                }
            }
            Ok(())
        }
        Commands::List => {
            let conn = open_db(&settings)?;
            let sites = db::list_sites(&conn)?;
            if sites.is_empty() {
                println!("No sites. Add one with 'newsmon add <url>'.");
                return Ok(());
            }
            println!(
                "{:>3} | {:<60} | {:>8} | {:<10} | {:<19}",
                "#", "Site", "Articles", "Added", "Last checked"
            );
            println!("{}", "-".repeat(113));
            for (i, s) in sites.iter().enumerate() {
                println!(
                    "{:>3} | {:<60} | {:>8} | {:<10} | {:<19}",
                    i + 1,
                    truncate(&s.url, 60),
                    s.articles,
                    s.added_at.get(..10).unwrap_or(&s.added_at),
                    s.last_checked.as_deref().unwrap_or("never"),
                );
            }
            Ok(())
        }
        Commands::Check => {
            let conn = open_db(&settings)?;
            let sites = db::list_sites(&conn)?;
            if sites.is_empty() {
                println!("No sites. Add one with 'newsmon add <url>'.");
                return Ok(());
            }
            println!("Checking {} sites (pool of {})...", sites.len(), settings.pool_size);
            let coordinator = build_coordinator(&settings);
            let summary =
                monitor::check_sites(&conn, Arc::clone(&coordinator), sites, settings.snapshot_limit)
                    .await;
            coordinator.shutdown().await;
            let summary = summary?;

            for report in &summary.reports {
                match &report.outcome {
                    SiteOutcome::Checked { diff, total } if diff.first_check => {
                        println!("\n{} (first check, {} articles)", report.url, total);
                        for a in &diff.new {
                            println!("  + {} ({})", a.title, a.url);
                        }
                    }
                    SiteOutcome::Checked { diff, .. } if diff.new.is_empty() => {
                        println!("\n{}: no new articles", report.url);
                    }
                    SiteOutcome::Checked { diff, .. } => {
                        println!("\n{}: {} new", report.url, diff.new.len());
                        for a in &diff.new {
                            println!("  + {} ({})", a.title, a.url);
                        }
                    }
                    SiteOutcome::Failed(f) => {
                        println!("\n{}: FAILED {}", report.url, describe_failure(f));
                    }
                }
            }
            println!(
                "\nDone: {} checked ({} ok, {} failed), {} new articles.",
                summary.total, summary.ok, summary.failed, summary.new_articles
            );
            Ok(())
        }
        Commands::Read { urls, mode, out } => {
            if urls.is_empty() {
                bail!("no URLs given");
            }
            let rules = match mode {
                ReadMode::Html => ExtractionRules::html(),
                ReadMode::Reader => ExtractionRules::Reader,
            };
            if let Some(dir) = &out {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
            }

            let coordinator = build_coordinator(&settings);
            let results = monitor::read_pages(&coordinator, &urls, &rules).await;
            coordinator.shutdown().await;

            let mut failed = 0usize;
            for (url, result) in results {
                match result {
                    Ok(capture) => match &out {
                        Some(dir) => {
                            let path = dir.join(format!("{}.html", slug_for(&url)));
                            std::fs::write(&path, &capture.raw)
                                .with_context(|| format!("writing {}", path.display()))?;
                            println!("{} -> {}", url, path.display());
                        }
                        None => println!("<!-- {} -->\n{}\n", url, capture.raw),
                    },
                    Err(f) => {
                        failed += 1;
                        eprintln!("{}: {}", url, describe_failure(&f));
                    }
                }
            }
            if failed > 0 {
                bail!("{} of {} pages failed", failed, urls.len());
            }
            Ok(())
        }
        Commands::Fetch { url, rules, ready } => {
            let rules: ExtractionRules = match rules {
                Some(r) => serde_json::from_str(&r).context("parsing --rules")?,
                None => ExtractionRules::default(),
            };
            let ready: ReadyCondition = match ready {
                Some(r) => serde_json::from_str(&r).context("parsing --ready")?,
                None => ReadyCondition::default(),
            };

            let coordinator = build_coordinator(&settings);
            let result = coordinator.submit_with(&url, rules, ready).await;
            coordinator.shutdown().await;

            match result {
                Ok(capture) => {
                    println!("{}", serde_json::to_string_pretty(&capture)?);
                    Ok(())
                }
                Err(f) => {
                    let report = json!({
                        "task_id": f.task_id,
                        "url": f.locator,
                        "error": f.kind(),
                        "message": f.error.to_string(),
                        "attempts": f.attempts,
                        "retries_exhausted": f.retries_exhausted,
                    });
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    Err(f.into())
                }
            }
        }
        Commands::Stats => {
            let conn = open_db(&settings)?;
            let s = db::get_stats(&conn)?;
            println!("Sites:     {}", s.sites);
            println!("Articles:  {}", s.articles);
            println!("Checks:    {}", s.checks);
            println!("Failed:    {}", s.failed);
            for (kind, n) in &s.failures_by_kind {
                println!("  {:<20} {}", kind, n);
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn open_db(settings: &Settings) -> anyhow::Result<rusqlite::Connection> {
    let conn = db::connect(&settings.db_path)?;
    db::init_schema(&conn)?;
    Ok(conn)
}

fn build_coordinator(settings: &Settings) -> Arc<Coordinator> {
    let launcher = Arc::new(ChromiumLauncher {
        executable: settings.chromium_path.clone(),
        headless: settings.headless,
        request_timeout: settings.step_timeout(),
    });
    let pool = SessionPool::new(launcher, settings.pool_size, settings.idle_timeout());
    pool.spawn_reaper();
    info!(
        pool = settings.pool_size,
        attempts = settings.max_attempts,
        "step timeout {:?}, task timeout {:?}",
        settings.step_timeout(),
        settings.task_timeout()
    );
    Arc::new(Coordinator::new(
        pool,
        Engine::new(settings.step_timeout()),
        settings.retry_policy(),
        settings.task_timeout(),
    ))
}

fn check_url(url: &str) -> anyhow::Result<()> {
    let parsed = url::Url::parse(url).with_context(|| format!("invalid URL {}", url))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        bail!("only http(s) URLs can be monitored: {}", url);
    }
    Ok(())
}

fn describe_failure(f: &TaskFailure) -> String {
    let hint = if f.is_content_error() {
        "page structure changed?"
    } else if f.is_transient() {
        "transient, try again later"
    } else {
        "permanent"
    };
    format!(
        "{} after {} attempt(s), {} ({})",
        f.kind(),
        f.attempts,
        hint,
        f.error
    )
}

static SLUG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9]+").unwrap());

/// Filesystem-safe name for a page URL.
fn slug_for(url: &str) -> String {
    let stripped = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let slug = SLUG_RE.replace_all(stripped, "-");
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "page".to_string()
    } else {
        slug.chars().take(120).collect()
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
