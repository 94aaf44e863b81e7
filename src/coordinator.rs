//! Task Coordinator: runs one task through acquire → extract → release with retries.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AcquireError, TaskFailure};
use crate::extract::rules::{ExtractionRules, ReadyCondition};
use crate::extract::{Capture, Engine};
use crate::session::SessionPool;
use crate::task::{Next, RetryPolicy, Task, TaskSnapshot, TransitionError};

pub struct Coordinator {
    pool: SessionPool,
    engine: Engine,
    policy: RetryPolicy,
    task_timeout: Duration,
    in_flight: Mutex<HashMap<Uuid, TaskSnapshot>>,
}

impl Coordinator {
    pub fn new(pool: SessionPool, engine: Engine, policy: RetryPolicy, task_timeout: Duration) -> Self {
        Self {
            pool,
            engine,
            policy,
            task_timeout,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub async fn submit(&self, locator: &str, rules: ExtractionRules) -> Result<Capture, TaskFailure> {
        self.submit_with(locator, rules, ReadyCondition::default()).await
    }

    pub async fn submit_with(
        &self,
        locator: &str,
        rules: ExtractionRules,
        ready: ReadyCondition,
    ) -> Result<Capture, TaskFailure> {
        let mut task = Task::new(locator, rules, ready, self.policy);

        if let Err(e) = task.target() {
            warn!(task = %task.id, "rejected: {}", e);
            return Err(self.abort(&mut task, e));
        }

        self.track(&task);
        let _tracked = Tracked {
            in_flight: &self.in_flight,
            id: task.id,
        };
        match timeout(self.task_timeout, self.run(&mut task)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(task = %task.id, url = %task.locator, "gave up after {:?}", self.task_timeout);
                Err(self.abort(&mut task, AcquireError::TaskTimeout(self.task_timeout)))
            }
        }
    }

    /// Tasks currently pending or running.
    pub fn in_flight(&self) -> Vec<TaskSnapshot> {
        self.in_flight
            .lock()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn shutdown(&self) {
        for task in self.in_flight() {
            warn!(
                task = %task.id,
                url = %task.locator,
                attempts = task.attempts,
                "still {:?} at shutdown",
                task.status
            );
        }
        let s = self.pool.stats();
        info!(
            launched = s.launched,
            discarded = s.discarded,
            live = s.live,
            idle = s.idle,
            "shutting down session pool"
        );
        self.pool.shutdown().await;
    }

    // ── Attempt loop ──

    async fn run(&self, task: &mut Task) -> Result<Capture, TaskFailure> {
        loop {
            let attempt = match task.begin_attempt() {
                Ok(n) => n,
                Err(e) => return Err(self.illegal(task, e)),
            };
            self.track(task);

            let mut lease = match self.pool.acquire().await {
                Ok(lease) => lease,
                Err(e) => {
                    error!(task = %task.id, attempt, "no session available: {}", e);
                    return Err(self.abort(task, e));
                }
            };
            let session = lease.id;
            info!(task = %task.id, attempt, session = %session, url = %task.locator, "extracting");

            match self.engine.extract(&mut lease, task).await {
                Ok(capture) => {
                    self.pool.release(lease).await;
                    if let Err(e) = task.succeed() {
                        return Err(self.illegal(task, e));
                    }
                    info!(task = %task.id, attempt, "succeeded");
                    return Ok(capture);
                }
                Err(err) => {
                    if matches!(err, AcquireError::SessionDied(_)) {
                        self.pool.discard(lease).await;
                    } else {
                        self.pool.release(lease).await;
                    }
                    warn!(task = %task.id, attempt, session = %session, "attempt failed: {}", err);

                    match task.record_failure(err) {
                        Ok(Next::Retry { delay }) => {
                            self.track(task);
                            warn!(
                                task = %task.id,
                                "retrying ({}/{}), backing off {:.1}s",
                                attempt + 1,
                                self.policy.max_attempts,
                                delay.as_secs_f64()
                            );
                            sleep(delay).await;
                        }
                        Ok(Next::Fail) => return Err(failure_of(task)),
                        Err(e) => return Err(self.illegal(task, e)),
                    }
                }
            }
        }
    }

    fn abort(&self, task: &mut Task, err: AcquireError) -> TaskFailure {
        if let Err(e) = task.abort(err) {
            error!(task = %task.id, "cannot abort: {}", e);
        }
        failure_of(task)
    }

    fn illegal(&self, task: &mut Task, e: TransitionError) -> TaskFailure {
        error!(task = %task.id, "illegal task transition: {}", e);
        let cause = task
            .last_error()
            .cloned()
            .unwrap_or_else(|| AcquireError::NavigationFailed(e.to_string()));
        self.abort(task, cause)
    }

    fn track(&self, task: &Task) {
        if let Ok(mut m) = self.in_flight.lock() {
            m.insert(task.id, task.snapshot());
        }
    }

}

/// Drops a task from the in-flight registry however `submit` ends, cancellation included.
struct Tracked<'a> {
    in_flight: &'a Mutex<HashMap<Uuid, TaskSnapshot>>,
    id: Uuid,
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        if let Ok(mut m) = self.in_flight.lock() {
            m.remove(&self.id);
        }
    }
}

fn failure_of(task: &Task) -> TaskFailure {
    task.failure().unwrap_or_else(|| TaskFailure {
        task_id: task.id,
        locator: task.locator.clone(),
        error: task
            .last_error()
            .cloned()
            .unwrap_or_else(|| AcquireError::NavigationFailed("task ended without a result".into())),
        attempts: task.attempts(),
        last_state: task.status(),
        retries_exhausted: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use crate::browser::fake::{Behavior, FakeLauncher, FakeWeb};
    use crate::browser::BrowserLauncher;
    use crate::error::ErrorKind;
    use crate::extract::rules::{FieldRule, FieldSource};
    use crate::task::TaskStatus;

    const PAGE: &str = "<html><body><h3><a href='/story/1'>One</a></h3></body></html>";

    struct Harness {
        launcher: Arc<FakeLauncher>,
        coordinator: Arc<Coordinator>,
    }

    fn harness(web: FakeWeb, pool_size: usize, task_timeout: Duration) -> Harness {
        let launcher = Arc::new(FakeLauncher::new(web));
        let pool = SessionPool::new(
            Arc::clone(&launcher) as Arc<dyn BrowserLauncher>,
            pool_size,
            Duration::from_secs(300),
        );
        let coordinator = Coordinator::new(
            pool,
            Engine::new(Duration::from_secs(2)),
            RetryPolicy::default(),
            task_timeout,
        );
        Harness {
            launcher,
            coordinator: Arc::new(coordinator),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_releases_session() {
        let url = "https://example.org/";
        let h = harness(FakeWeb::new().serve(url, PAGE), 2, Duration::from_secs(600));
        let capture = h.coordinator.submit(url, ExtractionRules::default()).await.unwrap();
        assert_eq!(capture.links().len(), 1);

        let stats = h.coordinator.pool().stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.live, 1);
        assert!(h.coordinator.in_flight().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn mismatch_is_never_retried() {
        let url = "https://example.org/";
        let h = harness(FakeWeb::new().serve(url, PAGE), 1, Duration::from_secs(600));
        let rules = ExtractionRules::Fields {
            fields: vec![FieldRule {
                name: "byline".into(),
                selector: ".byline".into(),
                source: FieldSource::Text,
                required: true,
                multiple: false,
            }],
        };
        let failure = h.coordinator.submit(url, rules).await.unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::ExtractionMismatch);
        assert_eq!(failure.attempts, 1);
        assert!(failure.is_content_error());
        assert!(!failure.retries_exhausted);
        assert_eq!(h.launcher.web.visits(url), 1);
        // the session survived and went back to the pool
        assert_eq!(h.coordinator.pool().stats().idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_stop_at_max_attempts() {
        let url = "https://slow.example.org/";
        let h = harness(FakeWeb::new().with(url, Behavior::Hang), 1, Duration::from_secs(600));
        let failure = h.coordinator.submit(url, ExtractionRules::default()).await.unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::NavigationTimeout);
        assert_eq!(failure.attempts, 3);
        assert!(failure.retries_exhausted);
        assert!(failure.is_transient());
        assert_eq!(failure.last_state, TaskStatus::Failed);
        assert_eq!(h.launcher.web.visits(url), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_timeout_recovers() {
        let url = "https://flaky.example.org/";
        let web = FakeWeb::new().with(
            url,
            Behavior::HangTimes {
                times: 1,
                html: PAGE.into(),
            },
        );
        let h = harness(web, 1, Duration::from_secs(600));
        let capture = h.coordinator.submit(url, ExtractionRules::default()).await.unwrap();
        assert_eq!(capture.links()[0].title, "One");
        assert_eq!(h.launcher.web.visits(url), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_session_is_replaced_on_retry() {
        let url = "https://crashy.example.org/";
        let web = FakeWeb::new().with(
            url,
            Behavior::CrashTimes {
                times: 1,
                html: PAGE.into(),
            },
        );
        let h = harness(web, 1, Duration::from_secs(600));
        h.coordinator.submit(url, ExtractionRules::default()).await.unwrap();

        assert_eq!(h.launcher.stats.launched.load(Ordering::SeqCst), 2);
        let stats = h.coordinator.pool().stats();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_of_one_serialises_tasks() {
        let a = "https://a.example.org/";
        let b = "https://b.example.org/";
        let slow = |html: &str| Behavior::Slow {
            delay: Duration::from_secs(1),
            html: html.into(),
        };
        let web = FakeWeb::new().with(a, slow(PAGE)).with(b, slow(PAGE));
        let h = harness(web, 1, Duration::from_secs(600));

        let (ra, rb) = tokio::join!(
            h.coordinator.submit(a, ExtractionRules::default()),
            h.coordinator.submit(b, ExtractionRules::default()),
        );
        assert!(ra.is_ok() && rb.is_ok());
        assert_eq!(h.launcher.stats.peak_live.load(Ordering::SeqCst), 1);
        assert_eq!(h.launcher.stats.overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_tasks_never_share_a_session() {
        let web = (0..6).fold(FakeWeb::new(), |web, i| {
            web.with(
                &format!("https://s{}.example.org/", i),
                Behavior::Slow {
                    delay: Duration::from_millis(300 * (i + 1)),
                    html: PAGE.into(),
                },
            )
        });
        let h = harness(web, 3, Duration::from_secs(600));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let c = Arc::clone(&h.coordinator);
                tokio::spawn(async move {
                    c.submit(&format!("https://s{}.example.org/", i), ExtractionRules::default())
                        .await
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(h.launcher.stats.overlaps.load(Ordering::SeqCst), 0);
        assert!(h.launcher.stats.peak_live.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn overall_timeout_discards_session() {
        let url = "https://slow.example.org/";
        let web = FakeWeb::new().with(url, Behavior::Hang);
        let launcher = Arc::new(FakeLauncher::new(web));
        let pool = SessionPool::new(
            Arc::clone(&launcher) as Arc<dyn BrowserLauncher>,
            1,
            Duration::from_secs(300),
        );
        let coordinator = Coordinator::new(
            pool,
            Engine::new(Duration::from_secs(60)),
            RetryPolicy::default(),
            Duration::from_secs(5),
        );

        let failure = coordinator.submit(url, ExtractionRules::default()).await.unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::TaskTimeout);
        assert_eq!(failure.attempts, 1);
        assert_eq!(coordinator.pool().stats().live, 0);
        assert!(coordinator.in_flight().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_target_fails_without_attempts() {
        let h = harness(FakeWeb::new(), 1, Duration::from_secs(600));
        for bad in ["ftp://example.org/file", "not a url", "file:///etc/passwd"] {
            let failure = h.coordinator.submit(bad, ExtractionRules::default()).await.unwrap_err();
            assert_eq!(failure.kind(), ErrorKind::InvalidTarget);
            assert_eq!(failure.attempts, 0);
        }
        assert_eq!(h.launcher.stats.launched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_is_not_retried() {
        let url = "https://example.org/";
        let h = harness(FakeWeb::new().serve(url, PAGE), 1, Duration::from_secs(600));
        h.launcher.fail_launches(2);
        let failure = h.coordinator.submit(url, ExtractionRules::default()).await.unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(failure.attempts, 1);
        assert!(failure.is_transient());
        assert_eq!(h.launcher.web.visits(url), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn running_task_is_visible_in_flight() {
        let url = "https://slow.example.org/";
        let web = FakeWeb::new().with(
            url,
            Behavior::Slow {
                delay: Duration::from_secs(1),
                html: PAGE.into(),
            },
        );
        let h = harness(web, 1, Duration::from_secs(600));
        let c = Arc::clone(&h.coordinator);
        let handle = tokio::spawn(async move { c.submit(url, ExtractionRules::default()).await });

        sleep(Duration::from_millis(500)).await;
        let running = h.coordinator.in_flight();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].status, TaskStatus::Running);
        assert_eq!(running[0].attempts, 1);

        assert!(handle.await.unwrap().is_ok());
        assert!(h.coordinator.in_flight().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_submit_leaves_nothing_in_flight() {
        let url = "https://slow.example.org/";
        let h = harness(FakeWeb::new().with(url, Behavior::Hang), 1, Duration::from_secs(600));

        let cancelled = timeout(
            Duration::from_secs(1),
            h.coordinator.submit(url, ExtractionRules::default()),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(h.coordinator.in_flight().is_empty());

        // the abandoned lease discarded its session and freed the slot
        tokio::task::yield_now().await;
        assert_eq!(h.coordinator.pool().stats().live, 0);
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(h.coordinator.in_flight().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_new_work() {
        let url = "https://example.org/";
        let h = harness(FakeWeb::new().serve(url, PAGE), 1, Duration::from_secs(600));
        h.coordinator.submit(url, ExtractionRules::default()).await.unwrap();
        h.coordinator.shutdown().await;

        let failure = h.coordinator.submit(url, ExtractionRules::default()).await.unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(h.launcher.stats.live(), 0);
    }
}
