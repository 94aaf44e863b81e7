use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::task::RetryPolicy;

pub const CONFIG_FILE: &str = "newsmon.toml";
const ENV_PREFIX: &str = "NEWSMON";

/// Runtime settings: defaults, then `newsmon.toml`, then `NEWSMON_*`, then CLI flags.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Settings {
    pub pool_size: usize,
    pub step_timeout_ms: u64,
    pub task_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub idle_timeout_secs: u64,
    pub chromium_path: Option<PathBuf>,
    pub headless: bool,
    pub db_path: PathBuf,
    pub snapshot_limit: usize,
}

/// Command-line overrides, applied last.
#[derive(Debug, Default, Clone, clap::Args)]
pub struct Overrides {
    /// Concurrent browser sessions
    #[arg(long, global = true)]
    pub pool_size: Option<usize>,
    /// Attempts per task before giving up
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,
    /// Per-step timeout in milliseconds
    #[arg(long, global = true)]
    pub step_timeout_ms: Option<u64>,
    /// Overall per-task timeout in milliseconds
    #[arg(long, global = true)]
    pub task_timeout_ms: Option<u64>,
    /// Chromium executable
    #[arg(long, global = true)]
    pub chromium: Option<PathBuf>,
    /// Show the browser window
    #[arg(long, global = true)]
    pub headful: bool,
    /// SQLite database file
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,
}

impl Settings {
    /// Load from `file` (optional) and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let env = Environment::with_prefix(ENV_PREFIX).try_parsing(true);
        Self::build(file.unwrap_or(Path::new(CONFIG_FILE)), env)
    }

    fn build(file: &Path, env: Environment) -> Result<Self> {
        let settings: Settings = Config::builder()
            .set_default("pool_size", 2_i64)?
            .set_default("step_timeout_ms", 60_000_i64)?
            .set_default("task_timeout_ms", 300_000_i64)?
            .set_default("max_attempts", 3_i64)?
            .set_default("backoff_base_ms", 2_000_i64)?
            .set_default("backoff_max_ms", 30_000_i64)?
            .set_default("idle_timeout_secs", 300_i64)?
            .set_default("headless", true)?
            .set_default("db_path", "data/monitor.sqlite")?
            .set_default("snapshot_limit", 10_i64)?
            .add_source(File::from(file.to_path_buf()).required(false))
            .add_source(env)
            .build()
            .context("reading configuration")?
            .try_deserialize()
            .context("invalid configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply(mut self, o: &Overrides) -> Result<Self> {
        if let Some(n) = o.pool_size {
            self.pool_size = n;
        }
        if let Some(n) = o.max_attempts {
            self.max_attempts = n;
        }
        if let Some(ms) = o.step_timeout_ms {
            self.step_timeout_ms = ms;
        }
        if let Some(ms) = o.task_timeout_ms {
            self.task_timeout_ms = ms;
        }
        if let Some(p) = &o.chromium {
            self.chromium_path = Some(p.clone());
        }
        if o.headful {
            self.headless = false;
        }
        if let Some(p) = &o.db {
            self.db_path = p.clone();
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            bail!("pool_size must be at least 1");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.step_timeout_ms == 0 || self.task_timeout_ms == 0 {
            bail!("timeouts must be positive");
        }
        if self.snapshot_limit == 0 {
            bail!("snapshot_limit must be at least 1");
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}
