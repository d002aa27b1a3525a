use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Utc};
use chrono_english::{parse_date_string, Dialect};
use serde_json::Value;
use tracing::{info, warn};

use crate::confirm;
use crate::db;
use crate::llm::Extraction;
use crate::models::ReminderKind;
use crate::scheduler::{parse_cadence, RegisterError};
use crate::session::{Mode, Session, Slot, Speaker};
use crate::validate::{self, DurationCheck};
use crate::AppState;

/// Classifier instructions: either structured fields under this schema or a
/// plain-text clarification question, nothing else.
const EXTRACTION_PROMPT: &str = "You are the intake classifier for a workplace assistant that \
schedules meetings and assigns tasks. Read the conversation and the latest user message. \
If the request is clear enough, reply ONLY with a JSON object. Use \
\"intent\": \"schedule_meeting\", \"create_task\", or \"list_tasks\" (the user asking what is \
on their plate). \
Meeting fields: title, start_date (YYYY-MM-DD), start_time (clock time), duration_minutes, \
attendees (array of names), recurrence_rule, recurrence_end_date. \
Task fields: task, assignee, due_date, due_time, reminder_type (\"one-time\" or \"recurring\"), \
reminder_frequency (like \"every 2 hours\"), reminder_date_time. \
Include only fields the user actually stated; never invent values. \
If you cannot tell what the user wants, reply with one short clarification question as plain text.";

const GENERIC_FAILURE: &str = "Sorry, I couldn't process that just now. Mind trying again?";

fn prompt_for(slot: Slot) -> &'static str {
    match slot {
        Slot::Title => "What should I call the meeting?",
        Slot::StartTime => "What time should it start? (e.g. 3:30 PM)",
        Slot::StartDate => "What day is the meeting? (e.g. tomorrow, or 2025-07-01)",
        Slot::Duration => "How long should it run? Give me minutes, e.g. 45 or 45 mins.",
        Slot::Attendees => "Who should be invited? Names or @mentions, comma-separated.",
        Slot::EndDate => "Until what date should it repeat?",
        Slot::Description => "What is the task?",
        Slot::Assignee => "Who should this be assigned to?",
        Slot::DueDate => "What day is it due? (e.g. tomorrow, or 2025-07-01)",
        Slot::DueTime => "What time on that day is it due?",
        Slot::ReminderType => "Should the reminder be one-time or recurring?",
        Slot::ReminderFrequency => "How often should I remind them? e.g. every 2 hours",
    }
}

const REJECT_TIME: &str =
    "That reads like a duration or a fuzzy time, not a clock time. Try something like 3:30 PM.";
const REJECT_DATE: &str = "I couldn't read that as an upcoming date. Try tomorrow or 2025-07-01.";
const REJECT_DURATION: &str = "I couldn't work out the length. Give me minutes, e.g. 45 or 45 mins.";
const REJECT_ATTENDEES: &str = "I need at least one attendee.";
const REJECT_REMINDER_TYPE: &str = "Please say one-time or recurring.";
const REJECT_FREQUENCY: &str = "I couldn't parse that cadence. Try something like every 2 hours.";

/// The meeting check order decides which field gets asked for next. It is
/// fixed so prompts never flip-flop between turns.
fn next_missing_meeting_slot(session: &Session) -> Option<Slot> {
    let m = &session.meeting;
    if m.title.is_none() {
        Some(Slot::Title)
    } else if m.start_time.is_none() {
        Some(Slot::StartTime)
    } else if m.start_date.is_none() {
        Some(Slot::StartDate)
    } else if m.duration_minutes.is_none() {
        Some(Slot::Duration)
    } else if m.attendees.is_empty() {
        Some(Slot::Attendees)
    } else if m.recurrence_rule.is_some() && m.recurrence_end_date.is_none() {
        Some(Slot::EndDate)
    } else {
        None
    }
}

fn next_missing_task_slot(session: &Session) -> Option<Slot> {
    let t = &session.task;
    if t.description.is_none() {
        Some(Slot::Description)
    } else if t.assignee.is_none() {
        Some(Slot::Assignee)
    } else if t.due_date.is_none() {
        Some(Slot::DueDate)
    } else if t.due_time.is_none() {
        Some(Slot::DueTime)
    } else if t.reminder_type.is_none() {
        Some(Slot::ReminderType)
    } else if t.reminder_type == Some(ReminderKind::Recurring) && t.reminder_spec.is_none() {
        Some(Slot::ReminderFrequency)
    } else {
        None
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Advance {
    Prompt(&'static str),
    Ready,
}

/// Restart the check-order scan from the top and either ask for the next
/// missing field or report the flow ready to finalize.
fn scan_and_advance(session: &mut Session) -> Advance {
    let next = match session.mode {
        Mode::Meeting => next_missing_meeting_slot(session),
        Mode::Task => next_missing_task_slot(session),
        _ => None,
    };
    match next {
        Some(slot) => {
            session.awaiting = Some(slot);
            Advance::Prompt(prompt_for(slot))
        }
        None => {
            session.awaiting = None;
            Advance::Ready
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SlotReply {
    Accepted,
    Rejected(&'static str),
}

fn parse_attendees(text: &str) -> Vec<String> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .map(clean_mention)
        .filter(|s| !s.is_empty())
        .collect()
}

fn clean_mention(token: &str) -> String {
    token
        .trim()
        .trim_start_matches("<@")
        .trim_end_matches('>')
        .trim()
        .to_string()
}

fn parse_reminder_type(text: &str) -> Option<ReminderKind> {
    let t = text.trim().to_ascii_lowercase();
    if t.contains("recur") || t.contains("repeat") || t.contains("every") {
        Some(ReminderKind::Recurring)
    } else if t.contains("once") || t.contains("one") || t.contains("single") {
        Some(ReminderKind::OneTime)
    } else {
        None
    }
}

fn today_string(now: DateTime<FixedOffset>) -> String {
    now.date_naive().format("%Y-%m-%d").to_string()
}

/// Assign the raw message to the awaited slot, gating temporal slots through
/// the validation engine. Rejection leaves every other collected slot intact.
async fn assign_slot(
    state: &AppState,
    session: &mut Session,
    slot: Slot,
    text: &str,
    now: DateTime<FixedOffset>,
) -> SlotReply {
    let raw = text.trim();
    match slot {
        Slot::Title => {
            if raw.is_empty() {
                return SlotReply::Rejected(prompt_for(Slot::Title));
            }
            session.meeting.title = Some(raw.to_string());
        }
        Slot::StartTime => {
            let date = session
                .meeting
                .start_date
                .clone()
                .unwrap_or_else(|| today_string(now));
            if !validate::validate_clock_time(now, &date, raw) {
                return SlotReply::Rejected(REJECT_TIME);
            }
            session.meeting.start_time = Some(raw.to_string());
        }
        Slot::StartDate => match validate::validate_future_date(now, raw) {
            Some(date) => session.meeting.start_date = Some(date.format("%Y-%m-%d").to_string()),
            None => return SlotReply::Rejected(REJECT_DATE),
        },
        Slot::Duration => match validate::validate_duration(raw, &state.llm).await {
            DurationCheck::Valid(minutes) => session.meeting.duration_minutes = Some(minutes),
            DurationCheck::Unclear => return SlotReply::Rejected(REJECT_DURATION),
        },
        Slot::Attendees => {
            let attendees = parse_attendees(raw);
            if attendees.is_empty() {
                return SlotReply::Rejected(REJECT_ATTENDEES);
            }
            session.meeting.attendees = attendees;
        }
        Slot::EndDate => match validate::validate_future_date(now, raw) {
            Some(date) => {
                session.meeting.recurrence_end_date = Some(date.format("%Y-%m-%d").to_string())
            }
            None => return SlotReply::Rejected(REJECT_DATE),
        },
        Slot::Description => {
            if raw.is_empty() {
                return SlotReply::Rejected(prompt_for(Slot::Description));
            }
            session.task.description = Some(raw.to_string());
        }
        Slot::Assignee => {
            let name = clean_mention(raw.split_whitespace().next().unwrap_or(""));
            if name.is_empty() {
                return SlotReply::Rejected(prompt_for(Slot::Assignee));
            }
            session.task.assignee = Some(name);
        }
        Slot::DueDate => match validate::validate_future_date(now, raw) {
            Some(date) => session.task.due_date = Some(date.format("%Y-%m-%d").to_string()),
            None => return SlotReply::Rejected(REJECT_DATE),
        },
        Slot::DueTime => {
            let date = session
                .task
                .due_date
                .clone()
                .unwrap_or_else(|| today_string(now));
            if !validate::validate_clock_time(now, &date, raw) {
                return SlotReply::Rejected(REJECT_TIME);
            }
            session.task.due_time = Some(raw.to_string());
        }
        Slot::ReminderType => match parse_reminder_type(raw) {
            Some(kind) => session.task.reminder_type = Some(kind),
            None => return SlotReply::Rejected(REJECT_REMINDER_TYPE),
        },
        Slot::ReminderFrequency => {
            if parse_cadence(raw).is_none() {
                return SlotReply::Rejected(REJECT_FREQUENCY);
            }
            session.task.reminder_spec = Some(raw.to_string());
        }
    }
    SlotReply::Accepted
}

/// Merge classifier fields into the session's collected slots. Temporal
/// values go through the same deterministic validators as slot replies;
/// values that fail are dropped so the scan re-prompts for them.
fn apply_extraction(
    session: &mut Session,
    fields: &serde_json::Map<String, Value>,
    now: DateTime<FixedOffset>,
) {
    if let Some(intent) = fields.get("intent").and_then(Value::as_str) {
        match intent {
            "schedule_meeting" => session.mode = Mode::Meeting,
            "create_task" | "assign_task" => session.mode = Mode::Task,
            _ => {}
        }
    }

    match session.mode {
        Mode::Meeting => merge_meeting_fields(session, fields, now),
        Mode::Task => merge_task_fields(session, fields, now),
        _ => {}
    }
}

fn field_str<'a>(fields: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn merge_meeting_fields(
    session: &mut Session,
    fields: &serde_json::Map<String, Value>,
    now: DateTime<FixedOffset>,
) {
    if let Some(title) = field_str(fields, "title") {
        session.meeting.title = Some(title.to_string());
    }
    // Date first: time validation is anchored to the collected date.
    if let Some(raw) = field_str(fields, "start_date") {
        if let Some(date) = validate::validate_future_date(now, raw) {
            session.meeting.start_date = Some(date.format("%Y-%m-%d").to_string());
        }
    }
    if let Some(raw) = field_str(fields, "start_time") {
        let date = session
            .meeting
            .start_date
            .clone()
            .unwrap_or_else(|| today_string(now));
        if validate::validate_clock_time(now, &date, raw) {
            session.meeting.start_time = Some(raw.to_string());
        }
    }
    if let Some(minutes) = fields.get("duration_minutes").and_then(duration_value) {
        session.meeting.duration_minutes = Some(minutes);
    }
    if let Some(value) = fields.get("attendees") {
        let attendees = match value {
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(clean_mention)
                .filter(|s| !s.is_empty())
                .collect(),
            Value::String(s) => parse_attendees(s),
            _ => Vec::new(),
        };
        if !attendees.is_empty() {
            session.meeting.attendees = attendees;
        }
    }
    if let Some(rule) = field_str(fields, "recurrence_rule") {
        session.meeting.recurrence_rule = Some(rule.to_string());
    }
    if let Some(raw) = field_str(fields, "recurrence_end_date") {
        if let Some(date) = validate::validate_future_date(now, raw) {
            session.meeting.recurrence_end_date = Some(date.format("%Y-%m-%d").to_string());
        }
    }
}

fn duration_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().filter(|m| *m > 0),
        Value::String(s) => validate::parse_duration_minutes(s),
        _ => None,
    }
}

fn merge_task_fields(
    session: &mut Session,
    fields: &serde_json::Map<String, Value>,
    now: DateTime<FixedOffset>,
) {
    if let Some(desc) = field_str(fields, "task").or_else(|| field_str(fields, "description")) {
        session.task.description = Some(desc.to_string());
    }
    if let Some(assignee) = field_str(fields, "assignee") {
        let name = clean_mention(assignee);
        if !name.is_empty() {
            session.task.assignee = Some(name);
        }
    }
    if let Some(raw) = field_str(fields, "due_date") {
        if let Some(date) = validate::validate_future_date(now, raw) {
            session.task.due_date = Some(date.format("%Y-%m-%d").to_string());
        }
    }
    if let Some(raw) = field_str(fields, "due_time") {
        let date = session
            .task
            .due_date
            .clone()
            .unwrap_or_else(|| today_string(now));
        if validate::validate_clock_time(now, &date, raw) {
            session.task.due_time = Some(raw.to_string());
        }
    }
    if let Some(raw) = field_str(fields, "reminder_type") {
        if let Some(kind) = ReminderKind::from_db_str(raw).or_else(|| parse_reminder_type(raw)) {
            session.task.reminder_type = Some(kind);
        }
    }
    if let Some(raw) = field_str(fields, "reminder_frequency") {
        if parse_cadence(raw).is_some() {
            session.task.reminder_spec = Some(raw.to_string());
            session.task.reminder_type = Some(ReminderKind::Recurring);
        }
    }
    if let Some(raw) = field_str(fields, "reminder_date_time") {
        if parse_date_string(raw, now, Dialect::Us).is_ok() {
            session.task.reminder_spec = Some(raw.to_string());
            session
                .task
                .reminder_type
                .get_or_insert(ReminderKind::OneTime);
        }
    }
}

fn is_cancel_command(text: &str) -> bool {
    matches!(
        text.trim().to_ascii_lowercase().as_str(),
        "cancel" | "never mind" | "nevermind" | "stop" | "abort"
    )
}

/// One inbound chat message, one turn. The session lock is held end to end,
/// which serializes concurrent messages from the same sender.
pub async fn handle_message(
    state: &AppState,
    identity: &str,
    channel: &str,
    text: &str,
) -> anyhow::Result<()> {
    let now = Utc::now().with_timezone(&state.config.tz_offset());
    let handle = state.sessions.acquire(identity, channel, now.timestamp()).await;
    let mut session = handle.lock().await;
    session.channel = channel.to_string();
    session.last_used_at = now.timestamp();

    if session.mode == Mode::Confirmation {
        session.record(Speaker::User, text);
        return confirm::handle_reply(state, &mut session, text).await;
    }

    if is_cancel_command(text) {
        drop(session);
        state.sessions.remove(identity).await;
        state.send(channel, "Okay, I've dropped that. Nothing was saved.").await;
        return Ok(());
    }

    session.record(Speaker::User, text);

    if let Some(slot) = session.awaiting {
        if let SlotReply::Rejected(msg) = assign_slot(state, &mut session, slot, text, now).await {
            session.record(Speaker::Assistant, msg);
            state.send(channel, msg).await;
            return Ok(());
        }
    } else {
        let context = format!(
            "Today is {} and the current time is {}.\n\nConversation:\n{}",
            now.format("%A %Y-%m-%d"),
            now.format("%H:%M"),
            session.history_text()
        );
        match state.llm.classify(EXTRACTION_PROMPT, &context).await {
            Ok(Extraction::Fields(map)) => {
                if map.get("intent").and_then(Value::as_str) == Some("list_tasks") {
                    let tasks = db::get_tasks_by_assignee(&state.pool, identity).await?;
                    let reply = format_task_list(&tasks, state.config.tz_offset());
                    session.record(Speaker::Assistant, &reply);
                    state.send(channel, &reply).await;
                    return Ok(());
                }
                apply_extraction(&mut session, &map, now)
            }
            Ok(Extraction::Text(reply)) => {
                // A clarification question from the model: relay verbatim and
                // stay idle for the next free-form reply.
                session.record(Speaker::Assistant, &reply);
                state.send(channel, &reply).await;
                return Ok(());
            }
            Err(err) => {
                warn!(error = %err, "language model call failed");
                state.send(channel, GENERIC_FAILURE).await;
                return Ok(());
            }
        }

        if session.mode == Mode::Idle {
            let msg = "I can assign tasks or schedule meetings — which would you like?";
            session.record(Speaker::Assistant, msg);
            state.send(channel, msg).await;
            return Ok(());
        }
    }

    match scan_and_advance(&mut session) {
        Advance::Prompt(msg) => {
            session.record(Speaker::Assistant, msg);
            state.send(channel, msg).await;
            Ok(())
        }
        Advance::Ready => match session.mode {
            Mode::Meeting => finalize_meeting(state, &mut session, now).await,
            Mode::Task => finalize_task(state, &mut session, now).await,
            _ => Ok(()),
        },
    }
}

fn format_task_list(tasks: &[crate::models::TaskRow], tz: FixedOffset) -> String {
    let open: Vec<_> = tasks
        .iter()
        .filter(|t| t.status == crate::models::TaskStatus::Pending)
        .collect();
    if open.is_empty() {
        return "You have no open tasks.".to_string();
    }
    let mut out = String::from("Your open tasks:\n");
    for task in open {
        let due = DateTime::from_timestamp(task.due_at, 0)
            .map(|d| d.with_timezone(&tz).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        out.push_str(&format!("• #{} *{}* — due {}\n", task.id, task.description, due));
    }
    out
}

/// Resolve the collected date + time strings into a concrete start/end pair.
fn meeting_window(
    session: &Session,
    now: DateTime<FixedOffset>,
) -> anyhow::Result<(String, String)> {
    let m = &session.meeting;
    let date = m.start_date.as_deref().context("start date missing")?;
    let time = m.start_time.as_deref().context("start time missing")?;
    let minutes = m.duration_minutes.context("duration missing")?;
    let start = parse_date_string(&format!("{date} {time}"), now, Dialect::Us)
        .map_err(|err| anyhow::anyhow!("parse meeting start: {err}"))?;
    let end = start + ChronoDuration::minutes(minutes);
    Ok((start.to_rfc3339(), end.to_rfc3339()))
}

async fn finalize_meeting(
    state: &AppState,
    session: &mut Session,
    now: DateTime<FixedOffset>,
) -> anyhow::Result<()> {
    let (start, end) = match meeting_window(session, now) {
        Ok(window) => window,
        Err(err) => {
            warn!(error = %err, "meeting window no longer resolves; asking again");
            session.meeting.start_time = None;
            if let Advance::Prompt(msg) = scan_and_advance(session) {
                state.send(&session.channel, msg).await;
            }
            return Ok(());
        }
    };

    let title = session.meeting.title.clone().unwrap_or_default();
    let Some(calendar) = state.calendar.as_ref() else {
        state
            .send(&session.channel, "No calendar is configured, so I can't book this yet.")
            .await;
        return Ok(());
    };

    match calendar
        .create_event(
            &title,
            &start,
            &end,
            &session.meeting.attendees,
            session.meeting.recurrence_rule.as_deref(),
        )
        .await
    {
        Ok(link) => {
            info!(title = %title, "meeting scheduled");
            state
                .send(
                    &session.channel,
                    &format!("Scheduled *{title}* starting {start} — {link}"),
                )
                .await;
            state.sessions.remove(&session.identity).await;
        }
        Err(err) => {
            // The action aborts; collected slots stay for a retry.
            warn!(error = %err, "calendar event creation failed");
            state
                .send(
                    &session.channel,
                    "I couldn't create the calendar event. Nothing was booked — try again shortly.",
                )
                .await;
        }
    }
    Ok(())
}

fn task_due_at(session: &Session, now: DateTime<FixedOffset>) -> anyhow::Result<i64> {
    let t = &session.task;
    let date = t.due_date.as_deref().context("due date missing")?;
    let time = t.due_time.as_deref().context("due time missing")?;
    let due = parse_date_string(&format!("{date} {time}"), now, Dialect::Us)
        .map_err(|err| anyhow::anyhow!("parse due datetime: {err}"))?;
    Ok(due.timestamp())
}

async fn finalize_task(
    state: &AppState,
    session: &mut Session,
    now: DateTime<FixedOffset>,
) -> anyhow::Result<()> {
    let due_at = match task_due_at(session, now) {
        Ok(v) => v,
        Err(err) => {
            warn!(error = %err, "due datetime no longer resolves; asking again");
            session.task.due_time = None;
            if let Advance::Prompt(msg) = scan_and_advance(session) {
                state.send(&session.channel, msg).await;
            }
            return Ok(());
        }
    };

    let description = session.task.description.clone().unwrap_or_default();
    let assignee = session.task.assignee.clone().unwrap_or_default();
    let kind = session.task.reminder_type;
    let spec = session.task.reminder_spec.clone();

    let task_id = match db::create_task(
        &state.pool,
        &description,
        &assignee,
        &session.identity,
        &session.channel,
        due_at,
        kind,
        spec.as_deref(),
    )
    .await
    {
        Ok(id) => id,
        Err(err) => {
            // Abort only the in-flight action; the slots survive for retry.
            warn!(error = %err, "task insert failed");
            state
                .send(&session.channel, "I couldn't save the task. Nothing was created — try again.")
                .await;
            return Ok(());
        }
    };

    if let Some(kind) = kind {
        let at = match kind {
            ReminderKind::OneTime => Some(one_time_fire_at(spec.as_deref(), due_at, now)),
            ReminderKind::Recurring => None,
        };
        match state
            .scheduler
            .register_request(task_id, kind, spec.as_deref(), at)
            .await
        {
            Ok(_) => {}
            Err(RegisterError::InvalidFrequency(_)) => {
                state
                    .send(
                        &session.channel,
                        "Task saved, but I couldn't understand the reminder frequency — no reminder is set.",
                    )
                    .await;
            }
        }
    }

    let due_local = DateTime::from_timestamp(due_at, 0)
        .map(|d| d.with_timezone(&now.timezone()).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default();
    state
        .send(
            &assignee,
            &format!("<@{}> assigned you a task: *{description}* (due {due_local})", session.identity),
        )
        .await;
    state
        .send(
            &session.channel,
            &format!("Task #{task_id} assigned to <@{assignee}>, due {due_local}."),
        )
        .await;

    info!(task_id, assignee = %assignee, "task finalized");
    state.sessions.remove(&session.identity).await;
    Ok(())
}

/// One-time reminders fire at the explicit requested instant when one was
/// collected, otherwise at the task's due datetime.
fn one_time_fire_at(spec: Option<&str>, due_at: i64, now: DateTime<FixedOffset>) -> i64 {
    spec.and_then(|raw| parse_date_string(raw, now, Dialect::Us).ok())
        .map(|dt| dt.timestamp())
        .unwrap_or(due_at)
}
