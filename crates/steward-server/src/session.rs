use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::models::ReminderKind;

const HISTORY_MAX_TURNS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    Meeting,
    Task,
    Confirmation,
}

/// The one slot a session may be waiting on. Meeting and task flows share the
/// enum; the mode decides which family is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Title,
    StartTime,
    StartDate,
    Duration,
    Attendees,
    EndDate,
    Description,
    Assignee,
    DueDate,
    DueTime,
    ReminderType,
    ReminderFrequency,
}

#[derive(Debug, Clone, Default)]
pub struct MeetingSlots {
    pub title: Option<String>,
    pub start_date: Option<String>,
    pub start_time: Option<String>,
    pub duration_minutes: Option<i64>,
    pub attendees: Vec<String>,
    pub recurrence_rule: Option<String>,
    pub recurrence_end_date: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskSlots {
    pub description: Option<String>,
    pub assignee: Option<String>,
    pub due_date: Option<String>,
    pub due_time: Option<String>,
    pub reminder_type: Option<ReminderKind>,
    pub reminder_spec: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmStep {
    AwaitYesNo,
    AwaitReason,
}

#[derive(Debug, Clone)]
pub struct ConfirmState {
    pub task_id: i64,
    pub step: ConfirmStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub identity: String,
    pub channel: String,
    pub mode: Mode,
    pub awaiting: Option<Slot>,
    pub meeting: MeetingSlots,
    pub task: TaskSlots,
    pub confirm: Option<ConfirmState>,
    pub history: Vec<Turn>,
    pub last_used_at: i64,
}

impl Session {
    pub fn new(identity: &str, channel: &str, now: i64) -> Self {
        Self {
            identity: identity.to_string(),
            channel: channel.to_string(),
            mode: Mode::Idle,
            awaiting: None,
            meeting: MeetingSlots::default(),
            task: TaskSlots::default(),
            confirm: None,
            history: Vec::new(),
            last_used_at: now,
        }
    }

    pub fn record(&mut self, speaker: Speaker, text: &str) {
        self.history.push(Turn {
            speaker,
            text: text.to_string(),
        });
        if self.history.len() > HISTORY_MAX_TURNS {
            let excess = self.history.len() - HISTORY_MAX_TURNS;
            self.history.drain(..excess);
        }
    }

    pub fn history_text(&self) -> String {
        let mut out = String::new();
        for turn in &self.history {
            let who = match turn.speaker {
                Speaker::User => "user",
                Speaker::Assistant => "assistant",
            };
            out.push_str(who);
            out.push_str(": ");
            out.push_str(&turn.text);
            out.push('\n');
        }
        out
    }
}

/// Per-identity session registry. Each identity maps to one
/// `Arc<Mutex<Session>>`; the dialog engine holds that lock for the whole
/// turn, so two messages racing from the same sender are serialized.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<Session>>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, identity: &str, channel: &str, now: i64) -> Arc<Mutex<Session>> {
        let mut map = self.inner.lock().await;
        map.entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(identity, channel, now))))
            .clone()
    }

    /// Look up without creating; used when delivering reminders would only
    /// need an existing session.
    pub async fn get(&self, identity: &str) -> Option<Arc<Mutex<Session>>> {
        self.inner.lock().await.get(identity).cloned()
    }

    pub async fn remove(&self, identity: &str) {
        self.inner.lock().await.remove(identity);
    }

    /// Drop sessions idle past `ttl_secs`. Sessions currently locked by a
    /// turn are in use and are left alone.
    pub async fn expire_idle(&self, ttl_secs: i64, now: i64) -> usize {
        let mut map = self.inner.lock().await;
        let before = map.len();
        map.retain(|_, handle| match handle.try_lock() {
            Ok(session) => now - session.last_used_at < ttl_secs,
            Err(_) => true,
        });
        before - map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_returns_one_handle_per_identity() {
        let store = SessionStore::new();
        let a = store.acquire("U1", "D1", 100).await;
        let b = store.acquire("U1", "D1", 200).await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn expire_drops_idle_sessions_only() {
        let store = SessionStore::new();
        store.acquire("U1", "D1", 0).await;
        let live = store.acquire("U2", "D2", 0).await;
        {
            let mut s = live.lock().await;
            s.last_used_at = 10_000;
        }
        let dropped = store.expire_idle(1_800, 10_000).await;
        assert_eq!(dropped, 1);
        assert!(store.get("U1").await.is_none());
        assert!(store.get("U2").await.is_some());
    }

    #[tokio::test]
    async fn expire_skips_sessions_held_by_a_turn() {
        let store = SessionStore::new();
        let handle = store.acquire("U1", "D1", 0).await;
        let _guard = handle.lock().await;
        let dropped = store.expire_idle(1, 10_000).await;
        assert_eq!(dropped, 0);
        assert!(store.get("U1").await.is_some());
    }

    #[test]
    fn history_is_capped() {
        let mut s = Session::new("U1", "D1", 0);
        for i in 0..40 {
            s.record(Speaker::User, &format!("m{i}"));
        }
        assert_eq!(s.history.len(), HISTORY_MAX_TURNS);
        assert_eq!(s.history.last().map(|t| t.text.as_str()), Some("m39"));
    }
}
