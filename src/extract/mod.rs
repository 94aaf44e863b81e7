//! Extraction engine: drive one session through navigate → ready → prepare → extract.

pub mod reader;
pub mod rules;
pub mod sites;

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::browser::{BrowserError, BrowserHandle, PageHandle, ReadyState};
use crate::error::AcquireError;
use crate::session::Session;
use crate::task::Task;
use rules::{ExtractionRules, FieldRule, Link, ReadyCondition};
use sites::{PrepStep, SiteProfile};

const PING_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Extracted content for one task.
#[derive(Debug, Clone, Serialize)]
pub struct Capture {
    pub task_id: Uuid,
    /// Attempt that produced this capture, starting at 1.
    pub attempt: u32,
    pub url: String,
    pub final_url: String,
    pub raw: String,
    pub fields: BTreeMap<String, Value>,
    pub captured_at: DateTime<Utc>,
}

impl Capture {
    pub fn links(&self) -> Vec<Link> {
        self.fields
            .get("links")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// Which part of the pipeline a driver error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Navigate,
    Extract,
}

pub struct Engine {
    step_timeout: Duration,
}

impl Engine {
    pub fn new(step_timeout: Duration) -> Self {
        Self { step_timeout }
    }

    pub async fn extract(&self, session: &mut Session, task: &Task) -> Result<Capture, AcquireError> {
        let site = sites::profile_for(&task.locator);
        let result = self.run(session.browser(), task, &site).await;
        if let Err(AcquireError::SessionDied(reason)) = &result {
            debug!(session = %session.id, "marking session dead: {}", reason);
            session.mark_dead();
        }
        result
    }

    async fn run(
        &self,
        browser: &dyn BrowserHandle,
        task: &Task,
        site: &SiteProfile,
    ) -> Result<Capture, AcquireError> {
        let mut page = self
            .step(browser, Phase::Navigate, "a new tab", browser.new_page(&site.browser))
            .await?;

        let result = self.drive(browser, page.as_mut(), task, site).await;

        match timeout(PING_TIMEOUT, page.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("closing tab failed: {}", e),
            Err(_) => debug!("closing tab timed out"),
        }
        result
    }

    async fn drive(
        &self,
        browser: &dyn BrowserHandle,
        page: &mut dyn PageHandle,
        task: &Task,
        site: &SiteProfile,
    ) -> Result<Capture, AcquireError> {
        let waiting_for = format!("navigation to {}", task.locator);
        let final_url = self
            .step(browser, Phase::Navigate, &waiting_for, page.goto(&task.locator))
            .await?;

        self.step(
            browser,
            Phase::Navigate,
            &task.ready.to_string(),
            wait_ready(page, &task.ready),
        )
        .await?;

        // site preparation only serves link discovery on listing pages
        if matches!(task.rules, ExtractionRules::Links { .. }) {
            for prep in &site.prepare {
                self.prepare(browser, page, prep).await?;
            }
        }

        let (raw, fields) = match &task.rules {
            ExtractionRules::Links {
                selectors,
                limit,
                site_defaults,
            } => {
                let selectors = sites::link_selectors(site, selectors, *site_defaults);
                self.extract_links(browser, page, &selectors, *limit).await?
            }
            ExtractionRules::Fields { fields } => self.extract_fields(browser, page, fields).await?,
            ExtractionRules::Html { strip } => {
                self.step(browser, Phase::Extract, "element removal", page.remove_elements(strip))
                    .await?;
                let html = self
                    .step(browser, Phase::Extract, "page content", page.content())
                    .await?;
                if html.trim().is_empty() {
                    return Err(AcquireError::ExtractionMismatch("page has no content".into()));
                }
                (html, BTreeMap::new())
            }
            ExtractionRules::Reader => {
                let html = self
                    .step(browser, Phase::Extract, "page content", page.content())
                    .await?;
                let article = reader::extract_readable(&html);
                if article.text.is_empty() {
                    return Err(AcquireError::ExtractionMismatch(
                        "no readable article text".into(),
                    ));
                }
                let mut fields = BTreeMap::new();
                fields.insert("title".to_string(), json!(article.title));
                fields.insert("text".to_string(), json!(article.text));
                (article.to_html(), fields)
            }
        };

        Ok(Capture {
            task_id: task.id,
            attempt: task.attempts(),
            url: task.locator.clone(),
            final_url,
            raw,
            fields,
            captured_at: Utc::now(),
        })
    }

    /// Preparation never fails the task unless the browser itself is gone.
    async fn prepare(
        &self,
        browser: &dyn BrowserHandle,
        page: &mut dyn PageHandle,
        step: &PrepStep,
    ) -> Result<(), AcquireError> {
        let outcome = match step {
            PrepStep::WaitForSelector { selector, timeout: limit } => {
                let ready = ReadyCondition::Selector {
                    selector: selector.clone(),
                };
                match timeout(*limit, wait_ready(page, &ready)).await {
                    Ok(r) => r,
                    Err(_) => {
                        debug!("`{}` did not appear within {:?}", selector, limit);
                        return Ok(());
                    }
                }
            }
            PrepStep::ScrollToBottom { settle } => {
                let r = match timeout(self.step_timeout, page.scroll_to_bottom()).await {
                    Ok(r) => r,
                    Err(_) => Err(BrowserError::Protocol("scroll timed out".into())),
                };
                if r.is_ok() {
                    sleep(*settle).await;
                }
                r
            }
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(BrowserError::Disconnected(reason)) => Err(AcquireError::SessionDied(reason)),
            Err(e) => {
                debug!("preparation step {:?} failed: {}", step, e);
                ensure_alive(browser).await
            }
        }
    }

    async fn extract_links(
        &self,
        browser: &dyn BrowserHandle,
        page: &mut dyn PageHandle,
        selectors: &[String],
        limit: usize,
    ) -> Result<(String, BTreeMap<String, Value>), AcquireError> {
        for sel in selectors {
            let links = match self
                .step(browser, Phase::Extract, &format!("links `{}`", sel), page.links(sel))
                .await
            {
                Ok(links) => links,
                // a selector the page cannot evaluate is skipped, like an empty one
                Err(AcquireError::ExtractionMismatch(reason)) => {
                    debug!("selector `{}` failed: {}", sel, reason);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut seen = HashSet::new();
            let links: Vec<Link> = links
                .into_iter()
                .filter(|l| seen.insert(l.url.clone()))
                .take(limit)
                .collect();
            if links.is_empty() {
                continue;
            }

            let raw = serde_json::to_string(&links).unwrap_or_default();
            let mut fields = BTreeMap::new();
            fields.insert("selector".to_string(), json!(sel));
            fields.insert("links".to_string(), json!(links));
            return Ok((raw, fields));
        }

        Err(AcquireError::ExtractionMismatch(format!(
            "none of {} link selectors matched",
            selectors.len()
        )))
    }

    async fn extract_fields(
        &self,
        browser: &dyn BrowserHandle,
        page: &mut dyn PageHandle,
        rules: &[FieldRule],
    ) -> Result<(String, BTreeMap<String, Value>), AcquireError> {
        let mut fields = BTreeMap::new();
        for rule in rules {
            let values = self
                .step(
                    browser,
                    Phase::Extract,
                    &format!("field `{}`", rule.name),
                    page.select_all(&rule.selector, &rule.source),
                )
                .await?;
            let values: Vec<String> = values.into_iter().filter(|v| !v.is_empty()).collect();

            if values.is_empty() && rule.required {
                return Err(AcquireError::ExtractionMismatch(format!(
                    "required field `{}` (`{}`) not found",
                    rule.name, rule.selector
                )));
            }

            let value = if rule.multiple {
                json!(values)
            } else {
                values.into_iter().next().map(Value::String).unwrap_or(Value::Null)
            };
            fields.insert(rule.name.clone(), value);
        }
        let raw = serde_json::to_string(&fields).unwrap_or_default();
        Ok((raw, fields))
    }

    /// Bound a driver call by the step timeout and map its failure.
    async fn step<T>(
        &self,
        browser: &dyn BrowserHandle,
        phase: Phase,
        waiting_for: &str,
        call: impl Future<Output = Result<T, BrowserError>>,
    ) -> Result<T, AcquireError> {
        match timeout(self.step_timeout, call).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(classify(browser, phase, e).await),
            Err(_) => {
                ensure_alive(browser).await?;
                Err(AcquireError::NavigationTimeout {
                    timeout: self.step_timeout,
                    waiting_for: waiting_for.to_string(),
                })
            }
        }
    }
}

async fn ensure_alive(browser: &dyn BrowserHandle) -> Result<(), AcquireError> {
    match timeout(PING_TIMEOUT, browser.ping()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(AcquireError::SessionDied(e.to_string())),
        Err(_) => Err(AcquireError::SessionDied(format!(
            "browser unresponsive for {:?}",
            PING_TIMEOUT
        ))),
    }
}

async fn classify(browser: &dyn BrowserHandle, phase: Phase, err: BrowserError) -> AcquireError {
    if let BrowserError::Disconnected(reason) = err {
        return AcquireError::SessionDied(reason);
    }
    if let Err(died) = ensure_alive(browser).await {
        return died;
    }
    match (phase, err) {
        (Phase::Extract, BrowserError::Script(msg)) => AcquireError::ExtractionMismatch(msg),
        (_, e) => AcquireError::NavigationFailed(e.to_string()),
    }
}

/// Poll the page until `ready` holds. Callers bound the wait.
async fn wait_ready(page: &mut dyn PageHandle, ready: &ReadyCondition) -> Result<(), BrowserError> {
    match ready {
        ReadyCondition::Load => {
            while page.ready_state().await? != ReadyState::Complete {
                sleep(POLL_INTERVAL).await;
            }
            Ok(())
        }
        ReadyCondition::DomContentLoaded => {
            while page.ready_state().await? == ReadyState::Loading {
                sleep(POLL_INTERVAL).await;
            }
            Ok(())
        }
        ReadyCondition::Selector { selector } => {
            while page.count(selector).await? == 0 {
                sleep(POLL_INTERVAL).await;
            }
            Ok(())
        }
        ReadyCondition::NetworkIdle { quiet_ms } => {
            let quiet = Duration::from_millis(*quiet_ms);
            let mut last = None;
            let mut since = Instant::now();
            loop {
                let complete = page.ready_state().await? == ReadyState::Complete;
                let count = page.resource_count().await?;
                if !complete || last != Some(count) {
                    last = Some(count);
                    since = Instant::now();
                } else if since.elapsed() >= quiet {
                    return Ok(());
                }
                sleep(POLL_INTERVAL).await;
            }
        }
    }
}
