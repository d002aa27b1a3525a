use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::db;
use crate::models::{ReminderKind, TaskRow, TaskStatus};
use crate::session::{ConfirmState, ConfirmStep, Mode, SessionStore, Speaker};
use crate::slack::SlackClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderSchedule {
    /// Absolute fire time, unix seconds.
    At(i64),
    /// Repeating interval.
    Every(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Scheduled,
    /// An active job already exists for this task id; registration is a no-op.
    AlreadyScheduled,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("invalid frequency: {0:?}")]
    InvalidFrequency(String),
}

static CADENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:every\s+)?(\d+)\s*(minutes?|mins?|hours?|hrs?|days?)$").expect("regex")
});

/// Parse a cadence phrase of the form `<N> <minute|hour|day>[s]`, with a
/// leading "every" tolerated.
pub fn parse_cadence(phrase: &str) -> Option<Duration> {
    let cap = CADENCE_RE.captures(phrase.trim())?;
    let n: u64 = cap[1].parse().ok()?;
    if n == 0 {
        return None;
    }
    let unit = cap[2].to_ascii_lowercase();
    let secs = if unit.starts_with('d') {
        n * 86_400
    } else if unit.starts_with('h') {
        n * 3_600
    } else {
        n * 60
    };
    Some(Duration::from_secs(secs))
}

struct Inner {
    pool: SqlitePool,
    sessions: SessionStore,
    gateway: Option<SlackClient>,
    jobs: Mutex<HashMap<i64, tokio::task::AbortHandle>>,
}

/// Registry of active delivery jobs, one per task id. Timers re-validate task
/// state immediately before any delivery; a firing timer is not proof the
/// reminder is still wanted.
#[derive(Clone)]
pub struct ReminderScheduler {
    inner: Arc<Inner>,
}

impl ReminderScheduler {
    pub fn new(pool: SqlitePool, sessions: SessionStore, gateway: Option<SlackClient>) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                sessions,
                gateway,
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Boundary entry after task finalization: one-time jobs carry an
    /// absolute fire time, recurring jobs a cadence phrase. Unparseable
    /// cadences register nothing.
    pub async fn register_request(
        &self,
        task_id: i64,
        kind: ReminderKind,
        frequency: Option<&str>,
        at: Option<i64>,
    ) -> Result<RegisterOutcome, RegisterError> {
        let schedule = match kind {
            ReminderKind::Recurring => {
                let phrase = frequency.unwrap_or_default();
                let period = parse_cadence(phrase)
                    .ok_or_else(|| RegisterError::InvalidFrequency(phrase.to_string()))?;
                ReminderSchedule::Every(period)
            }
            ReminderKind::OneTime => ReminderSchedule::At(at.unwrap_or(0)),
        };
        Ok(self.register(task_id, kind, schedule).await)
    }

    /// Idempotent: the check and the insert happen under one lock, so two
    /// racing registrations for the same id yield exactly one job.
    pub async fn register(
        &self,
        task_id: i64,
        kind: ReminderKind,
        schedule: ReminderSchedule,
    ) -> RegisterOutcome {
        let mut jobs = self.inner.jobs.lock().await;
        if jobs.contains_key(&task_id) {
            return RegisterOutcome::AlreadyScheduled;
        }

        let weak = Arc::downgrade(&self.inner);
        let handle = match schedule {
            ReminderSchedule::At(target) => {
                // Already-due or clock-skewed targets deliver immediately.
                let delay = (target - Utc::now().timestamp()).max(0) as u64;
                tokio::spawn(async move {
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                    }
                    Inner::fire_one_time(weak, task_id).await;
                })
            }
            ReminderSchedule::Every(period) => tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick of a tokio interval is immediate; skip it so
                // the first delivery lands one period out.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if !Inner::fire_recurring(weak.clone(), task_id).await {
                        break;
                    }
                }
            }),
        };

        jobs.insert(task_id, handle.abort_handle());
        info!(task_id, kind = kind.as_db_str(), "registered reminder job");
        RegisterOutcome::Scheduled
    }

    /// Remove the job and halt its timer. Cooperative: a firing that already
    /// started may still complete.
    pub async fn cancel(&self, task_id: i64) -> bool {
        match self.inner.jobs.lock().await.remove(&task_id) {
            Some(abort) => {
                abort.abort();
                info!(task_id, "cancelled reminder job");
                true
            }
            None => false,
        }
    }

    pub async fn is_registered(&self, task_id: i64) -> bool {
        self.inner.jobs.lock().await.contains_key(&task_id)
    }
}

impl Inner {
    async fn fire_one_time(weak: Weak<Inner>, task_id: i64) {
        let Some(inner) = weak.upgrade() else {
            return;
        };

        match inner.revalidate(task_id).await {
            Some(task) => {
                inner.deliver_confirmation(&task).await;
                // Exactly one delivery: clear the flag and drop the job.
                if let Err(err) = db::clear_task_reminder(&inner.pool, task_id).await {
                    warn!(error = %err, task_id, "failed to clear reminder flag after delivery");
                }
                inner.deregister(task_id).await;
            }
            None => inner.deregister(task_id).await,
        }
    }

    /// Returns false once the job should stop ticking.
    async fn fire_recurring(weak: Weak<Inner>, task_id: i64) -> bool {
        let Some(inner) = weak.upgrade() else {
            return false;
        };

        match inner.revalidate(task_id).await {
            Some(task) => {
                inner.deliver_confirmation(&task).await;
                true
            }
            None => {
                inner.deregister(task_id).await;
                false
            }
        }
    }

    /// The dedup/staleness guard: a task that is gone, finished, or has had
    /// its reminder flag cleared gets no delivery.
    async fn revalidate(&self, task_id: i64) -> Option<TaskRow> {
        let task = match db::get_task(&self.pool, task_id).await {
            Ok(t) => t,
            Err(err) => {
                warn!(error = %err, task_id, "fire-time task fetch failed; discarding job");
                return None;
            }
        };
        match task {
            Some(t) if t.status == TaskStatus::Pending && t.reminder => Some(t),
            Some(_) | None => {
                info!(task_id, "reminder fired for stale task; discarding");
                None
            }
        }
    }

    async fn deliver_confirmation(&self, task: &TaskRow) {
        let text = format!(
            "Reminder: *{}*. Have you completed this task? (yes/no)",
            task.description
        );

        if let Some(gateway) = self.gateway.as_ref() {
            if let Err(err) = gateway.post_message(&task.assignee, &text).await {
                warn!(error = %err, task_id = task.id, "reminder delivery failed");
            }
        } else {
            warn!(task_id = task.id, "no notification gateway configured; reminder not sent");
        }

        // The assignee's next reply belongs to the confirmation flow.
        let now = Utc::now().timestamp();
        let handle = self
            .sessions
            .acquire(&task.assignee, &task.assignee, now)
            .await;
        let mut session = handle.lock().await;
        session.mode = Mode::Confirmation;
        session.awaiting = None;
        session.confirm = Some(ConfirmState {
            task_id: task.id,
            step: ConfirmStep::AwaitYesNo,
        });
        session.last_used_at = now;
        session.record(Speaker::Assistant, &text);
    }

    async fn deregister(&self, task_id: i64) {
        self.jobs.lock().await.remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    async fn test_pool() -> SqlitePool {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .connect_with(options)
            .await
            .expect("connect in-memory sqlite");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("run migrations");
        pool
    }

    async fn seed_task(pool: &SqlitePool, kind: ReminderKind, spec: Option<&str>) -> i64 {
        db::create_task(
            pool,
            "file the report",
            "U_ASSIGNEE",
            "U_ASSIGNER",
            "D1",
            Utc::now().timestamp() + 60,
            Some(kind),
            spec,
        )
        .await
        .expect("create task")
    }

    async fn settle<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never settled");
    }

    #[test]
    fn cadence_grammar() {
        assert_eq!(parse_cadence("every 2 hours"), Some(Duration::from_secs(7_200)));
        assert_eq!(parse_cadence("2 hours"), Some(Duration::from_secs(7_200)));
        assert_eq!(parse_cadence("15 minutes"), Some(Duration::from_secs(900)));
        assert_eq!(parse_cadence("1 min"), Some(Duration::from_secs(60)));
        assert_eq!(parse_cadence("3 days"), Some(Duration::from_secs(259_200)));
        assert_eq!(parse_cadence("fortnightly"), None);
        assert_eq!(parse_cadence("0 hours"), None);
        assert_eq!(parse_cadence("every hour"), None);
        assert_eq!(parse_cadence(""), None);
    }

    #[tokio::test(start_paused = true)]
    async fn registration_is_idempotent() {
        let pool = test_pool().await;
        let sessions = SessionStore::new();
        let scheduler = ReminderScheduler::new(pool.clone(), sessions, None);
        let task_id = seed_task(&pool, ReminderKind::OneTime, None).await;

        let target = Utc::now().timestamp() + 600;
        let first = scheduler
            .register(task_id, ReminderKind::OneTime, ReminderSchedule::At(target))
            .await;
        let second = scheduler
            .register(task_id, ReminderKind::OneTime, ReminderSchedule::At(target))
            .await;

        assert_eq!(first, RegisterOutcome::Scheduled);
        assert_eq!(second, RegisterOutcome::AlreadyScheduled);
        assert!(scheduler.is_registered(task_id).await);
        scheduler.cancel(task_id).await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_frequency_registers_nothing() {
        let pool = test_pool().await;
        let scheduler = ReminderScheduler::new(pool.clone(), SessionStore::new(), None);
        let task_id = seed_task(&pool, ReminderKind::Recurring, Some("whenever")).await;

        let err = scheduler
            .register_request(task_id, ReminderKind::Recurring, Some("whenever"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegisterError::InvalidFrequency(_)));
        assert!(!scheduler.is_registered(task_id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn one_time_job_delivers_once_and_deregisters() {
        let pool = test_pool().await;
        let sessions = SessionStore::new();
        let scheduler = ReminderScheduler::new(pool.clone(), sessions.clone(), None);
        let task_id = seed_task(&pool, ReminderKind::OneTime, None).await;

        let target = Utc::now().timestamp() + 60;
        scheduler
            .register(task_id, ReminderKind::OneTime, ReminderSchedule::At(target))
            .await;

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle(|| {
            let scheduler = scheduler.clone();
            async move { !scheduler.is_registered(task_id).await }
        })
        .await;

        // Delivery happened after re-verification: flag cleared, confirmation
        // flow opened for the assignee.
        let task = db::get_task(&pool, task_id).await.unwrap().unwrap();
        assert!(!task.reminder);
        let handle = sessions.get("U_ASSIGNEE").await.expect("confirmation session");
        let session = handle.lock().await;
        assert_eq!(session.mode, Mode::Confirmation);
        assert_eq!(session.confirm.as_ref().map(|c| c.task_id), Some(task_id));
    }

    #[tokio::test(start_paused = true)]
    async fn already_due_one_time_job_delivers_immediately() {
        let pool = test_pool().await;
        let sessions = SessionStore::new();
        let scheduler = ReminderScheduler::new(pool.clone(), sessions.clone(), None);
        let task_id = seed_task(&pool, ReminderKind::OneTime, None).await;

        let past = Utc::now().timestamp() - 30;
        scheduler
            .register(task_id, ReminderKind::OneTime, ReminderSchedule::At(past))
            .await;

        settle(|| {
            let scheduler = scheduler.clone();
            async move { !scheduler.is_registered(task_id).await }
        })
        .await;
        assert!(sessions.get("U_ASSIGNEE").await.is_some());
        let task = db::get_task(&pool, task_id).await.unwrap().unwrap();
        assert!(!task.reminder);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_one_time_job_discards_silently() {
        let pool = test_pool().await;
        let sessions = SessionStore::new();
        let scheduler = ReminderScheduler::new(pool.clone(), sessions.clone(), None);
        let task_id = seed_task(&pool, ReminderKind::OneTime, None).await;

        db::update_task_status(&pool, task_id, TaskStatus::Completed, None)
            .await
            .unwrap();

        let target = Utc::now().timestamp() + 60;
        scheduler
            .register(task_id, ReminderKind::OneTime, ReminderSchedule::At(target))
            .await;

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle(|| {
            let scheduler = scheduler.clone();
            async move { !scheduler.is_registered(task_id).await }
        })
        .await;

        // No confirmation session: nothing was delivered.
        assert!(sessions.get("U_ASSIGNEE").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn recurring_job_deregisters_on_completed_task() {
        let pool = test_pool().await;
        let sessions = SessionStore::new();
        let scheduler = ReminderScheduler::new(pool.clone(), sessions.clone(), None);
        let task_id = seed_task(&pool, ReminderKind::Recurring, Some("every 2 hours")).await;

        db::update_task_status(&pool, task_id, TaskStatus::Completed, None)
            .await
            .unwrap();

        scheduler
            .register_request(task_id, ReminderKind::Recurring, Some("every 2 hours"), None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2 * 3_600 + 1)).await;
        settle(|| {
            let scheduler = scheduler.clone();
            async move { !scheduler.is_registered(task_id).await }
        })
        .await;
        assert!(sessions.get("U_ASSIGNEE").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn recurring_job_keeps_firing_while_pending() {
        let pool = test_pool().await;
        let sessions = SessionStore::new();
        let scheduler = ReminderScheduler::new(pool.clone(), sessions.clone(), None);
        let task_id = seed_task(&pool, ReminderKind::Recurring, Some("every 1 hour")).await;

        scheduler
            .register_request(task_id, ReminderKind::Recurring, Some("every 1 hour"), None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3_601)).await;
        settle(|| {
            let sessions = sessions.clone();
            async move { sessions.get("U_ASSIGNEE").await.is_some() }
        })
        .await;
        assert!(scheduler.is_registered(task_id).await);
        scheduler.cancel(task_id).await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_halts_the_timer() {
        let pool = test_pool().await;
        let sessions = SessionStore::new();
        let scheduler = ReminderScheduler::new(pool.clone(), sessions.clone(), None);
        let task_id = seed_task(&pool, ReminderKind::OneTime, None).await;

        let target = Utc::now().timestamp() + 300;
        scheduler
            .register(task_id, ReminderKind::OneTime, ReminderSchedule::At(target))
            .await;
        assert!(scheduler.cancel(task_id).await);
        assert!(!scheduler.is_registered(task_id).await);

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(sessions.get("U_ASSIGNEE").await.is_none());
    }
}
