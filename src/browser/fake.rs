//! In-memory browser serving fixture HTML, for pool, engine and coordinator tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use super::{BrowserError, BrowserHandle, BrowserLauncher, BrowserProfile, PageHandle, ReadyState};
use crate::extract::rules::{FieldSource, Link};

#[derive(Debug, Clone)]
pub enum Behavior {
    Serve(String),
    /// Navigation never completes.
    Hang,
    /// The browser process dies during navigation.
    Crash,
    /// Hang for the first `times` navigations, then serve.
    HangTimes { times: u32, html: String },
    /// Crash on the first `times` navigations, then serve.
    CrashTimes { times: u32, html: String },
    /// Serve after a delay.
    Slow { delay: Duration, html: String },
    /// The host does not resolve.
    Unreachable,
    /// Serve at once, then move through the page lifecycle in `stages`.
    Staged { html: String, stages: Stages },
}

/// Poll counts a staged page spends in each phase. `u32::MAX` never leaves it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stages {
    /// `ready_state` polls answered with `Loading`.
    pub loading: u32,
    /// Further polls answered with `Interactive` before `Complete`.
    pub interactive: u32,
    /// `resource_count` polls during which the count keeps growing.
    pub fetching: u32,
}

#[derive(Default)]
pub struct FakeWeb {
    sites: HashMap<String, Behavior>,
    visits: Mutex<HashMap<String, u32>>,
    pub scrolls: AtomicUsize,
    pub profiles: Mutex<Vec<BrowserProfile>>,
}

impl FakeWeb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, url: &str, behavior: Behavior) -> Self {
        self.sites.insert(url.to_string(), behavior);
        self
    }

    pub fn serve(self, url: &str, html: &str) -> Self {
        self.with(url, Behavior::Serve(html.to_string()))
    }

    pub fn visits(&self, url: &str) -> u32 {
        self.visits.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    fn visit(&self, url: &str) -> u32 {
        let mut visits = self.visits.lock().unwrap();
        let n = visits.entry(url.to_string()).or_insert(0);
        *n += 1;
        *n
    }
}

#[derive(Default)]
pub struct FakeStats {
    pub launched: AtomicUsize,
    pub live: AtomicUsize,
    pub peak_live: AtomicUsize,
    /// Pages opened on a browser that already had one open.
    pub overlaps: AtomicUsize,
    /// Health pings never answer while set.
    pub hang_pings: AtomicBool,
    alive_flags: Mutex<Vec<Arc<AtomicBool>>>,
}

impl FakeStats {
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Simulate every running browser process crashing.
    pub fn kill_all(&self) {
        for flag in self.alive_flags.lock().unwrap().iter() {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

pub struct FakeLauncher {
    pub web: Arc<FakeWeb>,
    pub stats: Arc<FakeStats>,
    failing_launches: AtomicU32,
}

impl FakeLauncher {
    pub fn new(web: FakeWeb) -> Self {
        Self {
            web: Arc::new(web),
            stats: Arc::new(FakeStats::default()),
            failing_launches: AtomicU32::new(0),
        }
    }

    /// Make the next `n` launches fail.
    pub fn fail_launches(&self, n: u32) {
        self.failing_launches.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserHandle>, BrowserError> {
        let failing = self.failing_launches.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_launches.store(failing - 1, Ordering::SeqCst);
            return Err(BrowserError::Launch("chromium exited with status 127".into()));
        }

        self.stats.launched.fetch_add(1, Ordering::SeqCst);
        let live = self.stats.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak_live.fetch_max(live, Ordering::SeqCst);

        let alive = Arc::new(AtomicBool::new(true));
        self.stats.alive_flags.lock().unwrap().push(Arc::clone(&alive));

        Ok(Box::new(FakeBrowser {
            web: Arc::clone(&self.web),
            stats: Arc::clone(&self.stats),
            alive,
            busy: Arc::new(AtomicBool::new(false)),
        }))
    }
}

pub struct FakeBrowser {
    web: Arc<FakeWeb>,
    stats: Arc<FakeStats>,
    alive: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
}

impl Drop for FakeBrowser {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        self.stats.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrowserHandle for FakeBrowser {
    async fn new_page(&self, profile: &BrowserProfile) -> Result<Box<dyn PageHandle>, BrowserError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(BrowserError::Disconnected("browser exited".into()));
        }
        if self.busy.swap(true, Ordering::SeqCst) {
            self.stats.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.web.profiles.lock().unwrap().push(profile.clone());
        Ok(Box::new(FakePage {
            web: Arc::clone(&self.web),
            alive: Arc::clone(&self.alive),
            busy: Arc::clone(&self.busy),
            url: None,
            html: String::new(),
            stages: None,
            ready_polls: 0,
            resource_polls: 0,
        }))
    }

    async fn ping(&self) -> Result<(), BrowserError> {
        if self.stats.hang_pings.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrowserError::Disconnected("browser exited".into()))
        }
    }

    async fn close(self: Box<Self>) -> Result<(), BrowserError> {
        Ok(())
    }
}

pub struct FakePage {
    web: Arc<FakeWeb>,
    alive: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
    url: Option<Url>,
    html: String,
    stages: Option<Stages>,
    ready_polls: u32,
    resource_polls: u32,
}

impl Drop for FakePage {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl FakePage {
    fn check_alive(&self) -> Result<(), BrowserError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrowserError::Disconnected("browser exited".into()))
        }
    }

    fn crash(&self) -> BrowserError {
        self.alive.store(false, Ordering::SeqCst);
        BrowserError::Disconnected("target crashed".into())
    }
}

fn parse_selector(selector: &str) -> Result<Selector, BrowserError> {
    Selector::parse(selector)
        .map_err(|e| BrowserError::Script(format!("invalid selector {}: {:?}", selector, e)))
}

fn query(html: &str, selector: &str, source: &FieldSource) -> Result<Vec<String>, BrowserError> {
    let sel = parse_selector(selector)?;
    let doc = Html::parse_document(html);
    let values = doc
        .select(&sel)
        .map(|e| match source {
            FieldSource::Text => e.text().collect::<String>().trim().to_string(),
            FieldSource::Html => e.inner_html(),
            FieldSource::Attribute { name } => e.value().attr(name).unwrap_or("").to_string(),
        })
        .collect();
    Ok(values)
}

fn query_links(html: &str, base: Option<&Url>, selector: &str) -> Result<Vec<Link>, BrowserError> {
    let sel = parse_selector(selector)?;
    let doc = Html::parse_document(html);
    let links = doc
        .select(&sel)
        .filter_map(|a| {
            let title = a.text().collect::<String>().trim().to_string();
            let href = a.value().attr("href")?;
            let url = match base {
                Some(b) => b.join(href).ok()?.to_string(),
                None => href.to_string(),
            };
            (!title.is_empty() && !url.is_empty()).then_some(Link { title, url })
        })
        .collect();
    Ok(links)
}

#[async_trait]
impl PageHandle for FakePage {
    async fn goto(&mut self, url: &str) -> Result<String, BrowserError> {
        self.check_alive()?;
        let visit = self.web.visit(url);
        self.stages = None;
        self.ready_polls = 0;
        self.resource_polls = 0;
        let html = match self.web.sites.get(url).cloned() {
            Some(Behavior::Serve(html)) => html,
            Some(Behavior::Staged { html, stages }) => {
                self.stages = Some(stages);
                html
            }
            Some(Behavior::Hang) => std::future::pending().await,
            Some(Behavior::Crash) => return Err(self.crash()),
            Some(Behavior::HangTimes { times, html }) => {
                if visit <= times {
                    std::future::pending::<()>().await;
                }
                html
            }
            Some(Behavior::CrashTimes { times, html }) => {
                if visit <= times {
                    return Err(self.crash());
                }
                html
            }
            Some(Behavior::Slow { delay, html }) => {
                tokio::time::sleep(delay).await;
                html
            }
            Some(Behavior::Unreachable) | None => {
                return Err(BrowserError::Navigation(format!(
                    "net::ERR_NAME_NOT_RESOLVED at {}",
                    url
                )))
            }
        };
        self.url = Url::parse(url).ok();
        self.html = html;
        Ok(url.to_string())
    }

    async fn ready_state(&mut self) -> Result<ReadyState, BrowserError> {
        self.check_alive()?;
        let n = self.ready_polls;
        self.ready_polls = self.ready_polls.saturating_add(1);
        Ok(match self.stages {
            Some(s) if n < s.loading => ReadyState::Loading,
            Some(s) if n < s.loading.saturating_add(s.interactive) => ReadyState::Interactive,
            _ => ReadyState::Complete,
        })
    }

    async fn resource_count(&mut self) -> Result<u64, BrowserError> {
        self.check_alive()?;
        let n = self.resource_polls;
        self.resource_polls = self.resource_polls.saturating_add(1);
        Ok(match self.stages {
            Some(s) if n < s.fetching => 4 + u64::from(n),
            Some(s) => 3 + u64::from(s.fetching),
            None => 3,
        })
    }

    async fn count(&mut self, selector: &str) -> Result<usize, BrowserError> {
        self.check_alive()?;
        Ok(query(&self.html, selector, &FieldSource::Text)?.len())
    }

    async fn select_all(
        &mut self,
        selector: &str,
        source: &FieldSource,
    ) -> Result<Vec<String>, BrowserError> {
        self.check_alive()?;
        query(&self.html, selector, source)
    }

    async fn links(&mut self, selector: &str) -> Result<Vec<Link>, BrowserError> {
        self.check_alive()?;
        query_links(&self.html, self.url.as_ref(), selector)
    }

    async fn scroll_to_bottom(&mut self) -> Result<(), BrowserError> {
        self.check_alive()?;
        self.web.scrolls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_elements(&mut self, tags: &[String]) -> Result<(), BrowserError> {
        self.check_alive()?;
        for tag in tags {
            let re = Regex::new(&format!(r"(?is)<{0}[^>]*>.*?</{0}>|<{0}[^>]*/?>", regex::escape(tag)))
                .map_err(|e| BrowserError::Script(e.to_string()))?;
            self.html = re.replace_all(&self.html, "").into_owned();
        }
        Ok(())
    }

    async fn content(&mut self) -> Result<String, BrowserError> {
        self.check_alive()?;
        Ok(self.html.clone())
    }

    async fn close(self: Box<Self>) -> Result<(), BrowserError> {
        Ok(())
    }
}
