//! Headless Chromium driven over CDP with chromiumoxide.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetLocaleOverrideParams, SetTimezoneOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{BrowserError, BrowserHandle, BrowserLauncher, BrowserProfile, PageHandle, ReadyState};
use crate::extract::rules::{FieldSource, Link};

const CHROME_ARGS: &[&str] = &[
    "--disable-gpu",
    "--no-sandbox",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--disable-background-networking",
];

const BLANK: &str = "about:blank";
const COMMIT_POLL: Duration = Duration::from_millis(50);

/// Locate a Chromium binary: explicit path, Playwright's download cache, then PATH.
pub fn find_chromium(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return p.exists().then(|| p.to_path_buf());
    }

    if let Some(cache) = dirs::cache_dir() {
        if let Some(path) = find_in_playwright_cache(&cache.join("ms-playwright")) {
            return Some(path);
        }
    }

    ["chromium", "chromium-browser", "google-chrome", "google-chrome-stable"]
        .iter()
        .find_map(|name| which::which(name).ok())
}

/// `ms-playwright/chromium-<rev>/chrome-*/...`, newest revision first.
fn find_in_playwright_cache(root: &Path) -> Option<PathBuf> {
    let mut revisions: Vec<PathBuf> = std::fs::read_dir(root)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("chromium-"))
        })
        .collect();
    revisions.sort();

    const BINARIES: &[&str] = &[
        "chrome-linux64/chrome",
        "chrome-linux/chrome",
        "chrome-mac/Chromium.app/Contents/MacOS/Chromium",
        "chrome-mac-arm64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing",
        "chrome-win/chrome.exe",
    ];
    revisions.iter().rev().find_map(|rev| {
        BINARIES
            .iter()
            .map(|b| rev.join(b))
            .find(|candidate| candidate.exists())
    })
}

pub struct ChromiumLauncher {
    pub executable: Option<PathBuf>,
    pub headless: bool,
    pub request_timeout: Duration,
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserHandle>, BrowserError> {
        let executable = find_chromium(self.executable.as_deref()).ok_or_else(|| {
            BrowserError::Launch(
                "Chromium not found. Set NEWSMON_CHROMIUM_PATH or run `playwright install chromium`."
                    .into(),
            )
        })?;

        // Each process needs its own profile directory or concurrent launches collide.
        let profile_dir =
            std::env::temp_dir().join(format!("newsmon-profile-{}", uuid::Uuid::new_v4()));

        let mut builder = BrowserConfig::builder()
            .chrome_executable(executable)
            .user_data_dir(&profile_dir)
            .request_timeout(self.request_timeout);
        for arg in CHROME_ARGS {
            builder = builder.arg(*arg);
        }
        if !self.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(BrowserError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        let connected = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&connected);
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("cdp handler: {}", e);
                }
            }
            flag.store(false, Ordering::SeqCst);
        });

        Ok(Box::new(ChromiumBrowser {
            browser,
            connected,
            handler_task,
            profile_dir,
        }))
    }
}

pub struct ChromiumBrowser {
    browser: Browser,
    connected: Arc<AtomicBool>,
    handler_task: JoinHandle<()>,
    profile_dir: PathBuf,
}

#[async_trait]
impl BrowserHandle for ChromiumBrowser {
    async fn new_page(&self, profile: &BrowserProfile) -> Result<Box<dyn PageHandle>, BrowserError> {
        let page = self
            .browser
            .new_page(BLANK)
            .await
            .map_err(|e| classify(&self.connected, e))?;

        let mut tab = ChromiumPage {
            page,
            connected: Arc::clone(&self.connected),
        };
        tab.apply_profile(profile).await?;
        Ok(Box::new(tab))
    }

    async fn ping(&self) -> Result<(), BrowserError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrowserError::Disconnected("cdp connection closed".into()));
        }
        self.browser
            .version()
            .await
            .map(|_| ())
            .map_err(|e| BrowserError::Disconnected(e.to_string()))
    }

    async fn close(mut self: Box<Self>) -> Result<(), BrowserError> {
        if let Err(e) = self.browser.close().await {
            warn!("graceful close failed, killing chromium: {}", e);
            let _ = self.browser.kill().await;
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), self.browser.wait()).await;
        self.handler_task.abort();
        if let Err(e) = tokio::fs::remove_dir_all(&self.profile_dir).await {
            debug!("could not remove {}: {}", self.profile_dir.display(), e);
        }
        Ok(())
    }
}

pub struct ChromiumPage {
    page: Page,
    connected: Arc<AtomicBool>,
}

impl ChromiumPage {
    async fn apply_profile(&mut self, profile: &BrowserProfile) -> Result<(), BrowserError> {
        if let Some(ua) = &profile.user_agent {
            let mut params = SetUserAgentOverrideParams::new(ua.clone());
            params.accept_language = profile.locale.clone();
            self.page
                .execute(params)
                .await
                .map_err(|e| classify(&self.connected, e))?;
        }
        if let Some((width, height)) = profile.viewport {
            self.page
                .execute(SetDeviceMetricsOverrideParams::new(width, height, 1.0, false))
                .await
                .map_err(|e| classify(&self.connected, e))?;
        }
        if let Some(locale) = &profile.locale {
            self.page
                .execute(SetLocaleOverrideParams {
                    locale: Some(locale.clone()),
                })
                .await
                .map_err(|e| classify(&self.connected, e))?;
        }
        if let Some(tz) = &profile.timezone {
            self.page
                .execute(SetTimezoneOverrideParams::new(tz.clone()))
                .await
                .map_err(|e| classify(&self.connected, e))?;
        }
        Ok(())
    }

    async fn eval<T: DeserializeOwned>(&self, script: String) -> Result<T, BrowserError> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| classify(&self.connected, e))?;
        result
            .into_value::<T>()
            .map_err(|e| BrowserError::Script(format!("unexpected script result: {}", e)))
    }
}

#[async_trait]
impl PageHandle for ChromiumPage {
    async fn goto(&mut self, url: &str) -> Result<String, BrowserError> {
        // Page.navigate would hold the reply until the load event; assigning
        // location returns at once and readiness is polled by the engine.
        let _: serde_json::Value = self
            .eval(format!("window.location.href = {}", js_string(url)))
            .await
            .map_err(|e| match e {
                BrowserError::Protocol(msg) | BrowserError::Script(msg) => {
                    BrowserError::Navigation(msg)
                }
                other => other,
            })?;

        loop {
            match self.eval::<String>("location.href".to_string()).await {
                Ok(href) if href.starts_with("chrome-error://") => {
                    return Err(BrowserError::Navigation(format!("{} failed to load", url)))
                }
                Ok(href) if href != BLANK => return Ok(href),
                Ok(_) => {}
                Err(e @ BrowserError::Disconnected(_)) => return Err(e),
                // the old document's context goes away while the new one commits
                Err(e) => debug!("waiting for navigation commit: {}", e),
            }
            sleep(COMMIT_POLL).await;
        }
    }

    async fn ready_state(&mut self) -> Result<ReadyState, BrowserError> {
        let state: String = self.eval("document.readyState".to_string()).await?;
        Ok(ReadyState::parse(&state))
    }

    async fn resource_count(&mut self) -> Result<u64, BrowserError> {
        self.eval("performance.getEntriesByType('resource').length".to_string())
            .await
    }

    async fn count(&mut self, selector: &str) -> Result<usize, BrowserError> {
        self.eval(format!(
            "document.querySelectorAll({}).length",
            js_string(selector)
        ))
        .await
    }

    async fn select_all(
        &mut self,
        selector: &str,
        source: &FieldSource,
    ) -> Result<Vec<String>, BrowserError> {
        let read = match source {
            FieldSource::Text => "(e.innerText || e.textContent || '').trim()".to_string(),
            FieldSource::Html => "e.innerHTML".to_string(),
            FieldSource::Attribute { name } => {
                format!("e.getAttribute({}) || ''", js_string(name))
            }
        };
        self.eval(format!(
            "Array.from(document.querySelectorAll({})).map(function (e) {{ return {}; }})",
            js_string(selector),
            read
        ))
        .await
    }

    async fn links(&mut self, selector: &str) -> Result<Vec<Link>, BrowserError> {
        self.eval(format!(
            "Array.from(document.querySelectorAll({}))\
             .map(function (a) {{ return {{ title: (a.innerText || '').trim(), url: a.href || '' }}; }})\
             .filter(function (x) {{ return x.title && x.url; }})",
            js_string(selector)
        ))
        .await
    }

    async fn scroll_to_bottom(&mut self) -> Result<(), BrowserError> {
        let _: bool = self
            .eval("window.scrollTo(0, document.body.scrollHeight); true".to_string())
            .await?;
        Ok(())
    }

    async fn remove_elements(&mut self, tags: &[String]) -> Result<(), BrowserError> {
        if tags.is_empty() {
            return Ok(());
        }
        let _: bool = self
            .eval(format!(
                "document.querySelectorAll({}).forEach(function (e) {{ e.remove(); }}); true",
                js_string(&tags.join(", "))
            ))
            .await?;
        Ok(())
    }

    async fn content(&mut self) -> Result<String, BrowserError> {
        self.page
            .content()
            .await
            .map_err(|e| classify(&self.connected, e))
    }

    async fn close(self: Box<Self>) -> Result<(), BrowserError> {
        self.page
            .close()
            .await
            .map_err(|e| classify(&self.connected, e))
    }
}

fn classify(connected: &AtomicBool, err: CdpError) -> BrowserError {
    if !connected.load(Ordering::SeqCst) {
        return BrowserError::Disconnected(err.to_string());
    }
    match err {
        e @ CdpError::JavascriptException(_) => BrowserError::Script(e.to_string()),
        e @ CdpError::Ws(_) => BrowserError::Disconnected(e.to_string()),
        e => BrowserError::Protocol(e.to_string()),
    }
}

/// Quote a value as a JS string literal.
fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}
