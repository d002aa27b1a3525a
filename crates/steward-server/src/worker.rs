use std::time::{Duration, Instant};

use chrono::Utc;
use chrono_english::{parse_date_string, Dialect};
use tracing::{info, warn};

use crate::db;
use crate::models::ReminderKind;
use crate::scheduler::{RegisterError, ReminderSchedule};
use crate::AppState;

/// Background hygiene: legacy due-task sweep, idle-session expiry, and
/// processed-event cleanup. Runs for the life of the process.
pub async fn sweep_loop(state: AppState) {
    if let Err(err) = rearm_reminders(&state).await {
        warn!(error = %err, "failed to re-arm reminders after startup");
    }

    let mut last_cleanup = Instant::now();
    loop {
        tokio::time::sleep(Duration::from_secs(state.config.sweep_interval_secs)).await;

        if let Err(err) = sweep_due_tasks(&state).await {
            warn!(error = %err, "due-task sweep failed");
        }

        let ttl_secs = state.config.session_ttl_minutes as i64 * 60;
        let now = Utc::now().timestamp();
        let dropped = state.sessions.expire_idle(ttl_secs, now).await;
        if dropped > 0 {
            info!(count = dropped, "expired abandoned sessions");
        }

        if last_cleanup.elapsed() >= Duration::from_secs(60 * 60) {
            last_cleanup = Instant::now();
            match db::cleanup_old_processed_events(&state.pool, 7).await {
                Ok(n) if n > 0 => info!(count = n, "cleaned up old processed events"),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "failed to cleanup old processed events"),
            }
        }
    }
}

/// Tasks written before per-task registration existed carry no job in the
/// registry; hand any that have come due to the scheduler as already-due
/// one-shot jobs so they flow through the normal re-validate/deliver path.
async fn sweep_due_tasks(state: &AppState) -> anyhow::Result<()> {
    let now = Utc::now().timestamp();
    for task in db::list_due_tasks(&state.pool, now).await? {
        if task.reminder_kind == Some(ReminderKind::Recurring) {
            continue;
        }
        if state.scheduler.is_registered(task.id).await {
            continue;
        }
        state
            .scheduler
            .register(task.id, ReminderKind::OneTime, ReminderSchedule::At(now))
            .await;
    }
    Ok(())
}

/// A restart must not drop scheduled deliveries: re-register every pending
/// task whose reminder flag is still set.
async fn rearm_reminders(state: &AppState) -> anyhow::Result<()> {
    let now = Utc::now().with_timezone(&state.config.tz_offset());
    let mut armed = 0usize;

    for task in db::list_tasks_with_active_reminders(&state.pool).await? {
        let Some(kind) = task.reminder_kind else {
            // Legacy row; the due sweep picks it up once due.
            continue;
        };
        match kind {
            ReminderKind::OneTime => {
                let at = task
                    .reminder_spec
                    .as_deref()
                    .and_then(|raw| parse_date_string(raw, now, Dialect::Us).ok())
                    .map(|dt| dt.timestamp())
                    .unwrap_or(task.due_at);
                state
                    .scheduler
                    .register(task.id, kind, ReminderSchedule::At(at))
                    .await;
                armed += 1;
            }
            ReminderKind::Recurring => {
                match state
                    .scheduler
                    .register_request(task.id, kind, task.reminder_spec.as_deref(), None)
                    .await
                {
                    Ok(_) => armed += 1,
                    Err(RegisterError::InvalidFrequency(spec)) => {
                        // Fail safe to silence rather than retrying forever.
                        warn!(task_id = task.id, ?spec, "stored cadence no longer parses; clearing reminder");
                        let _ = db::clear_task_reminder(&state.pool, task.id).await;
                    }
                }
            }
        }
    }

    if armed > 0 {
        info!(count = armed, "re-armed reminder jobs");
    }
    Ok(())
}
