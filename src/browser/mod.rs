//! Browser driver seam.
//!
//! `BrowserLauncher` starts a browser process, `BrowserHandle` is one live
//! process and `PageHandle` one tab inside it. The session pool and the
//! extraction engine only talk to these traits; `chromium` drives a real
//! Chromium over CDP and `fake` serves fixture HTML in tests.

pub mod chromium;
#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use thiserror::Error;

use crate::extract::rules::{FieldSource, Link};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrowserError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    /// The CDP connection or the process is gone.
    #[error("browser disconnected: {0}")]
    Disconnected(String),
    #[error("navigation error: {0}")]
    Navigation(String),
    #[error("script error: {0}")]
    Script(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Context overrides applied to a fresh tab.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrowserProfile {
    pub user_agent: Option<String>,
    pub viewport: Option<(u32, u32)>,
    pub locale: Option<String>,
    pub timezone: Option<String>,
}

/// `document.readyState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Loading,
    Interactive,
    Complete,
}

impl ReadyState {
    pub fn parse(state: &str) -> Self {
        match state {
            "complete" => ReadyState::Complete,
            "interactive" => ReadyState::Interactive,
            _ => ReadyState::Loading,
        }
    }
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserHandle>, BrowserError>;
}

#[async_trait]
pub trait BrowserHandle: Send + Sync {
    async fn new_page(&self, profile: &BrowserProfile) -> Result<Box<dyn PageHandle>, BrowserError>;
    /// Cheap round trip proving the process still answers.
    async fn ping(&self) -> Result<(), BrowserError>;
    async fn close(self: Box<Self>) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait PageHandle: Send {
    /// Start navigating and return the URL once the new document is committed.
    /// Readiness is polled separately through `ready_state`.
    async fn goto(&mut self, url: &str) -> Result<String, BrowserError>;
    async fn ready_state(&mut self) -> Result<ReadyState, BrowserError>;
    /// Number of resource-timing entries, used for network-idle detection.
    async fn resource_count(&mut self) -> Result<u64, BrowserError>;
    async fn count(&mut self, selector: &str) -> Result<usize, BrowserError>;
    async fn select_all(
        &mut self,
        selector: &str,
        source: &FieldSource,
    ) -> Result<Vec<String>, BrowserError>;
    /// `{title, url}` for each match; entries with an empty title or href are dropped.
    async fn links(&mut self, selector: &str) -> Result<Vec<Link>, BrowserError>;
    async fn scroll_to_bottom(&mut self) -> Result<(), BrowserError>;
    async fn remove_elements(&mut self, tags: &[String]) -> Result<(), BrowserError>;
    async fn content(&mut self) -> Result<String, BrowserError>;
    async fn close(self: Box<Self>) -> Result<(), BrowserError>;
}
