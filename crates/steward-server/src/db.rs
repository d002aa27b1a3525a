use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::models::{ReminderKind, TaskRow, TaskStatus};

pub async fn init_sqlite(db_path: &Path) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("connect sqlite at {}", db_path.display()))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("run migrations")?;

    Ok(pool)
}

pub async fn try_mark_event_processed(
    pool: &SqlitePool,
    source: &str,
    event_id: &str,
) -> anyhow::Result<bool> {
    let res = sqlx::query(
        r#"
        INSERT INTO processed_events (source, event_id, processed_at)
        VALUES (?1, ?2, unixepoch())
        ON CONFLICT(source, event_id) DO NOTHING
        "#,
    )
    .bind(source)
    .bind(event_id)
    .execute(pool)
    .await
    .context("insert processed event")?;

    Ok(res.rows_affected() == 1)
}

pub async fn cleanup_old_processed_events(
    pool: &SqlitePool,
    older_than_days: i64,
) -> anyhow::Result<u64> {
    let res = sqlx::query(
        "DELETE FROM processed_events WHERE processed_at < unixepoch() - ?1 * 86400",
    )
    .bind(older_than_days)
    .execute(pool)
    .await
    .context("cleanup processed events")?;
    Ok(res.rows_affected())
}

#[allow(clippy::too_many_arguments)]
pub async fn create_task(
    pool: &SqlitePool,
    description: &str,
    assignee: &str,
    assigner: &str,
    channel_id: &str,
    due_at: i64,
    reminder_kind: Option<ReminderKind>,
    reminder_spec: Option<&str>,
) -> anyhow::Result<i64> {
    let res = sqlx::query(
        r#"
        INSERT INTO tasks (
          description,
          assignee,
          assigner,
          channel_id,
          due_at,
          reminder,
          reminder_kind,
          reminder_spec,
          status,
          created_at,
          updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', unixepoch(), unixepoch())
        "#,
    )
    .bind(description)
    .bind(assignee)
    .bind(assigner)
    .bind(channel_id)
    .bind(due_at)
    .bind(if reminder_kind.is_some() { 1 } else { 0 })
    .bind(reminder_kind.map(|k| k.as_db_str()))
    .bind(reminder_spec)
    .execute(pool)
    .await
    .context("insert task")?;

    Ok(res.last_insert_rowid())
}

fn task_from_row(row: sqlx::sqlite::SqliteRow) -> TaskRow {
    TaskRow {
        id: row.get::<i64, _>("id"),
        description: row.get::<String, _>("description"),
        assignee: row.get::<String, _>("assignee"),
        assigner: row.get::<String, _>("assigner"),
        channel_id: row.get::<String, _>("channel_id"),
        due_at: row.get::<i64, _>("due_at"),
        reminder: row.get::<i64, _>("reminder") != 0,
        reminder_kind: row
            .get::<Option<String>, _>("reminder_kind")
            .as_deref()
            .and_then(ReminderKind::from_db_str),
        reminder_spec: row.get::<Option<String>, _>("reminder_spec"),
        status: TaskStatus::from_db_str(row.get::<String, _>("status").as_str()),
        not_completed_reason: row.get::<Option<String>, _>("not_completed_reason"),
        created_at: row.get::<i64, _>("created_at"),
        updated_at: row.get::<i64, _>("updated_at"),
    }
}

const TASK_COLUMNS: &str = r#"
  id,
  description,
  assignee,
  assigner,
  channel_id,
  due_at,
  reminder,
  reminder_kind,
  reminder_spec,
  status,
  not_completed_reason,
  created_at,
  updated_at
"#;

pub async fn get_task(pool: &SqlitePool, id: i64) -> anyhow::Result<Option<TaskRow>> {
    let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("select task")?;
    Ok(row.map(task_from_row))
}

pub async fn get_tasks_by_assignee(
    pool: &SqlitePool,
    assignee: &str,
) -> anyhow::Result<Vec<TaskRow>> {
    let rows = sqlx::query(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE assignee = ?1 ORDER BY due_at ASC, id ASC"
    ))
    .bind(assignee)
    .fetch_all(pool)
    .await
    .context("select tasks by assignee")?;
    Ok(rows.into_iter().map(task_from_row).collect())
}

pub async fn update_task_status(
    pool: &SqlitePool,
    id: i64,
    status: TaskStatus,
    not_completed_reason: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET status = ?2,
            not_completed_reason = ?3,
            updated_at = unixepoch()
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(status.as_db_str())
    .bind(not_completed_reason)
    .execute(pool)
    .await
    .context("update task status")?;
    Ok(())
}

pub async fn clear_task_reminder(pool: &SqlitePool, id: i64) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET reminder = 0,
            updated_at = unixepoch()
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .execute(pool)
    .await
    .context("clear task reminder")?;
    Ok(())
}

/// Pending tasks whose due instant has passed and whose reminder flag is
/// still set. Used by the legacy batch sweep, not the per-task scheduler.
pub async fn list_due_tasks(pool: &SqlitePool, now: i64) -> anyhow::Result<Vec<TaskRow>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {TASK_COLUMNS} FROM tasks
        WHERE status = 'pending'
          AND reminder = 1
          AND due_at <= ?1
        ORDER BY due_at ASC, id ASC
        "#
    ))
    .bind(now)
    .fetch_all(pool)
    .await
    .context("list due tasks")?;
    Ok(rows.into_iter().map(task_from_row).collect())
}

/// Pending tasks with the reminder flag set, regardless of due time.
/// Used to re-arm the scheduler after a restart.
pub async fn list_tasks_with_active_reminders(pool: &SqlitePool) -> anyhow::Result<Vec<TaskRow>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {TASK_COLUMNS} FROM tasks
        WHERE status = 'pending'
          AND reminder = 1
        ORDER BY id ASC
        "#
    ))
    .fetch_all(pool)
    .await
    .context("list tasks with active reminders")?;
    Ok(rows.into_iter().map(task_from_row).collect())
}
