//! Site monitoring: fetch article links for every site and diff against the last snapshot.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::coordinator::Coordinator;
use crate::db::{self, CheckRow, SiteRow};
use crate::error::TaskFailure;
use crate::extract::rules::{ExtractionRules, Link};
use crate::extract::Capture;

#[derive(Debug, Clone, PartialEq)]
pub struct ArticleDiff {
    pub first_check: bool,
    pub new: Vec<Link>,
}

/// Everything is new on first sight; afterwards only URLs missing from the snapshot.
pub fn diff_articles(previous: Option<&[String]>, current: &[Link]) -> ArticleDiff {
    match previous {
        None => ArticleDiff {
            first_check: true,
            new: current.to_vec(),
        },
        Some(prev) => {
            let seen: HashSet<&str> = prev.iter().map(String::as_str).collect();
            ArticleDiff {
                first_check: false,
                new: current
                    .iter()
                    .filter(|l| !seen.contains(l.url.as_str()))
                    .cloned()
                    .collect(),
            }
        }
    }
}

pub enum SiteOutcome {
    Checked { diff: ArticleDiff, total: usize },
    Failed(TaskFailure),
}

pub struct SiteReport {
    pub url: String,
    pub outcome: SiteOutcome,
}

pub struct CheckSummary {
    pub total: usize,
    pub ok: usize,
    pub failed: usize,
    pub new_articles: usize,
    pub reports: Vec<SiteReport>,
}

struct CheckResult {
    site: SiteRow,
    result: Result<Capture, TaskFailure>,
    latency_ms: i64,
}

/// Check all sites concurrently, saving each result to DB as it arrives.
pub async fn check_sites(
    conn: &Connection,
    coordinator: Arc<Coordinator>,
    sites: Vec<SiteRow>,
    limit: usize,
) -> Result<CheckSummary> {
    let total = sites.len();
    let capacity = coordinator.pool().stats().capacity;
    let semaphore = Arc::new(Semaphore::new(capacity));

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );

    // Workers send results, this loop owns the connection
    let (tx, mut rx) = tokio::sync::mpsc::channel::<CheckResult>(capacity * 2);

    for site in sites {
        let coordinator = Arc::clone(&coordinator);
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();

        tokio::spawn(async move {
            // keeps queued sites from burning their task timeout waiting for a session
            let Ok(_permit) = sem.acquire_owned().await else {
                return;
            };
            let rules = ExtractionRules::Links {
                selectors: Vec::new(),
                limit,
                site_defaults: true,
            };
            let t0 = Instant::now();
            let result = coordinator.submit(&site.url, rules).await;
            let latency_ms = t0.elapsed().as_millis() as i64;
            let _ = tx.send(CheckResult { site, result, latency_ms }).await;
        });
    }

    drop(tx);

    let mut summary = CheckSummary {
        total,
        ok: 0,
        failed: 0,
        new_articles: 0,
        reports: Vec::with_capacity(total),
    };

    while let Some(CheckResult { site, result, latency_ms }) = rx.recv().await {
        let outcome = match result {
            Ok(capture) => {
                let links = capture.links();
                let previous = db::load_snapshot(conn, site.id)?;
                let diff = diff_articles(previous.as_deref(), &links);
                db::save_check(
                    conn,
                    &CheckRow {
                        site_id: site.id,
                        url: site.url.clone(),
                        articles: Some(links.clone()),
                        new_articles: diff.new.len(),
                        attempts: capture.attempt,
                        error_kind: None,
                        error: None,
                        latency_ms,
                    },
                )?;
                summary.ok += 1;
                summary.new_articles += diff.new.len();
                info!(site = %site.url, new = diff.new.len(), total = links.len(), "checked");
                SiteOutcome::Checked {
                    diff,
                    total: links.len(),
                }
            }
            Err(failure) => {
                warn!(site = %site.url, "check failed: {}", failure.error);
                db::save_check(
                    conn,
                    &CheckRow {
                        site_id: site.id,
                        url: site.url.clone(),
                        articles: None,
                        new_articles: 0,
                        attempts: failure.attempts,
                        error_kind: Some(failure.kind().to_string()),
                        error: Some(failure.error.to_string()),
                        latency_ms,
                    },
                )?;
                summary.failed += 1;
                SiteOutcome::Failed(failure)
            }
        };
        summary.reports.push(SiteReport {
            url: site.url,
            outcome,
        });
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!(
        "Checked {} sites ({} ok, {} failed, {} new articles)",
        total, summary.ok, summary.failed, summary.new_articles
    );
    Ok(summary)
}

/// Run the same rules against several pages, in input order.
pub async fn read_pages(
    coordinator: &Coordinator,
    urls: &[String],
    rules: &ExtractionRules,
) -> Vec<(String, Result<Capture, TaskFailure>)> {
    let results = join_all(urls.iter().map(|url| coordinator.submit(url, rules.clone()))).await;
    urls.iter().cloned().zip(results).collect()
}
