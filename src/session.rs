//! Session Manager: a bounded pool of browser processes handed out as scoped leases.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::browser::{BrowserHandle, BrowserLauncher};
use crate::error::AcquireError;

const PING_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// One live browser process.
pub struct Session {
    pub id: Uuid,
    browser: Box<dyn BrowserHandle>,
    alive: bool,
    uses: u32,
    last_used: Instant,
}

impl Session {
    pub fn new(browser: Box<dyn BrowserHandle>) -> Self {
        Self {
            id: Uuid::new_v4(),
            browser,
            alive: true,
            uses: 0,
            last_used: Instant::now(),
        }
    }

    pub fn browser(&self) -> &dyn BrowserHandle {
        self.browser.as_ref()
    }

    /// Flag the session so it is discarded instead of pooled.
    pub fn mark_dead(&mut self) {
        self.alive = false;
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn uses(&self) -> u32 {
        self.uses
    }

    async fn healthy(&self) -> bool {
        matches!(timeout(PING_TIMEOUT, self.browser.ping()).await, Ok(Ok(())))
    }

    async fn close(self) {
        let id = self.id;
        match timeout(CLOSE_TIMEOUT, self.browser.close()).await {
            Ok(Ok(())) => debug!(session = %id, "browser closed"),
            Ok(Err(e)) => warn!(session = %id, "closing browser failed: {}", e),
            Err(_) => warn!(session = %id, "closing browser timed out"),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("alive", &self.alive)
            .field("uses", &self.uses)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub live: usize,
    pub idle: usize,
    pub launched: usize,
    pub discarded: usize,
}

struct PoolInner {
    launcher: Arc<dyn BrowserLauncher>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Session>>,
    capacity: usize,
    idle_timeout: Duration,
    live: AtomicUsize,
    launched: AtomicUsize,
    discarded: AtomicUsize,
    closed: AtomicBool,
}

/// Cloneable handle over the shared pool.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, size: usize, idle_timeout: Duration) -> Self {
        let capacity = size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                launcher,
                permits: Arc::new(Semaphore::new(capacity)),
                idle: Mutex::new(Vec::with_capacity(capacity)),
                capacity,
                idle_timeout,
                live: AtomicUsize::new(0),
                launched: AtomicUsize::new(0),
                discarded: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Wait for a free slot and hand out a healthy session.
    pub async fn acquire(&self) -> Result<SessionLease, AcquireError> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| AcquireError::ResourceExhausted("session pool is shut down".into()))?;

        while let Some(session) = self.pop_idle() {
            if session.last_used.elapsed() >= self.inner.idle_timeout {
                debug!(session = %session.id, "idle session expired");
                self.destroy(session).await;
                continue;
            }
            let checkout = Checkout {
                pool: self,
                session: Some(session),
            };
            let healthy = checkout.healthy().await;
            let Some(session) = checkout.into_session() else {
                continue;
            };
            if healthy {
                debug!(session = %session.id, uses = session.uses(), "reusing session");
                return Ok(self.lease(session, permit));
            }
            warn!(session = %session.id, "idle session failed health check, replacing");
            self.destroy(session).await;
        }

        let session = self.spawn().await?;
        Ok(self.lease(session, permit))
    }

    /// Return a session; dead sessions and anything after shutdown are closed instead.
    pub async fn release(&self, mut lease: SessionLease) {
        let Some(mut session) = lease.session.take() else {
            return;
        };
        if !session.is_alive() || self.inner.closed.load(Ordering::SeqCst) {
            self.destroy(session).await;
            return;
        }
        session.uses += 1;
        session.last_used = Instant::now();
        debug!(session = %session.id, "session returned to pool");
        if let Ok(mut idle) = self.inner.idle.lock() {
            idle.push(session);
            return;
        }
        // poisoned idle list; treat as discarded
        self.inner.live.fetch_sub(1, Ordering::SeqCst);
        self.inner.discarded.fetch_add(1, Ordering::SeqCst);
    }

    /// Close a session that must not be reused.
    pub async fn discard(&self, mut lease: SessionLease) {
        if let Some(session) = lease.session.take() {
            info!(session = %session.id, "discarding session");
            self.destroy(session).await;
        }
    }

    /// Close every idle session and refuse further acquisitions.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();
        let idle = self.drain_idle(|_| true);
        let n = idle.len();
        for session in idle {
            self.destroy(session).await;
        }
        info!("Session pool shut down ({} idle sessions closed)", n);
    }

    /// Close sessions idle for longer than the idle timeout.
    pub async fn reap_idle(&self) -> usize {
        let limit = self.inner.idle_timeout;
        let expired = self.drain_idle(|s| s.last_used.elapsed() >= limit);
        let n = expired.len();
        for session in expired {
            self.destroy(session).await;
        }
        if n > 0 {
            debug!("reaped {} idle sessions", n);
        }
        n
    }

    /// Reap idle sessions in the background for as long as the pool exists.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let every = (self.inner.idle_timeout / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let pool = SessionPool { inner };
                if pool.inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                pool.reap_idle().await;
            }
        })
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.inner.idle.lock().map(|v| v.len()).unwrap_or(0);
        PoolStats {
            capacity: self.inner.capacity,
            live: self.inner.live.load(Ordering::SeqCst),
            idle,
            launched: self.inner.launched.load(Ordering::SeqCst),
            discarded: self.inner.discarded.load(Ordering::SeqCst),
        }
    }

    // ── Internals ──

    fn lease(&self, session: Session, permit: OwnedSemaphorePermit) -> SessionLease {
        SessionLease {
            session: Some(session),
            pool: self.clone(),
            _permit: permit,
        }
    }

    fn pop_idle(&self) -> Option<Session> {
        self.inner.idle.lock().ok()?.pop()
    }

    fn drain_idle(&self, pred: impl Fn(&Session) -> bool) -> Vec<Session> {
        let Ok(mut idle) = self.inner.idle.lock() else {
            return Vec::new();
        };
        let (out, keep): (Vec<_>, Vec<_>) = idle.drain(..).partition(|s| pred(s));
        *idle = keep;
        out
    }

    /// Launch a browser, retrying once before giving up.
    async fn spawn(&self) -> Result<Session, AcquireError> {
        let mut last_err = None;
        for attempt in 1..=2 {
            match self.inner.launcher.launch().await {
                Ok(browser) => {
                    let session = Session::new(browser);
                    self.inner.launched.fetch_add(1, Ordering::SeqCst);
                    self.inner.live.fetch_add(1, Ordering::SeqCst);
                    info!(session = %session.id, "browser session started");
                    return Ok(session);
                }
                Err(e) => {
                    warn!(attempt, "browser launch failed: {}", e);
                    last_err = Some(e);
                }
            }
        }
        let reason = last_err.map(|e| e.to_string()).unwrap_or_default();
        Err(AcquireError::ResourceExhausted(format!(
            "could not start a browser: {}",
            reason
        )))
    }

    async fn destroy(&self, session: Session) {
        self.inner.live.fetch_sub(1, Ordering::SeqCst);
        self.inner.discarded.fetch_add(1, Ordering::SeqCst);
        session.close().await;
    }

    /// Discard from a synchronous context; the close runs on the runtime if there is one.
    fn abandon(&self, session: Session) {
        self.inner.live.fetch_sub(1, Ordering::SeqCst);
        self.inner.discarded.fetch_add(1, Ordering::SeqCst);
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(session.close());
        }
    }
}

/// An idle session taken out for a health check.
struct Checkout<'a> {
    pool: &'a SessionPool,
    session: Option<Session>,
}

impl Checkout<'_> {
    async fn healthy(&self) -> bool {
        match &self.session {
            Some(session) => session.healthy().await,
            None => false,
        }
    }

    fn into_session(mut self) -> Option<Session> {
        self.session.take()
    }
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!(session = %session.id, "health check abandoned, discarding session");
            self.pool.abandon(session);
        }
    }
}

/// Exclusive use of one session. Dropping a lease without returning it
/// discards the session.
pub struct SessionLease {
    session: Option<Session>,
    pool: SessionPool,
    _permit: OwnedSemaphorePermit,
}

impl Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session.as_ref().expect("lease holds a session until returned")
    }
}

impl DerefMut for SessionLease {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().expect("lease holds a session until returned")
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease").field("session", &self.session).finish()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        warn!(session = %session.id, "lease dropped without release, discarding session");
        self.pool.abandon(session);
    }
}
