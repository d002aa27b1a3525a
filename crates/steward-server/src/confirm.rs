use crate::db;
use crate::models::TaskStatus;
use crate::session::{ConfirmStep, Session, Speaker};
use crate::AppState;

const YES_NO_PROMPT: &str = "Please reply *yes* or *no* — have you completed this task?";
const REASON_PROMPT: &str = "Okay — what's blocking it? A short reason is fine.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YesNoReply {
    Yes,
    No,
    Other,
}

pub fn parse_yes_no(text: &str) -> YesNoReply {
    match text.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" | "yep" | "yeah" | "done" => YesNoReply::Yes,
        "no" | "n" | "nope" | "not yet" => YesNoReply::No,
        _ => YesNoReply::Other,
    }
}

/// Drive one reply through the two-step confirmation flow. The session is
/// already locked by the caller and is in Confirmation mode.
pub async fn handle_reply(
    state: &AppState,
    session: &mut Session,
    text: &str,
) -> anyhow::Result<()> {
    let Some(confirm) = session.confirm.clone() else {
        // Mode says confirmation but there is no state to act on; reset.
        state.sessions.remove(&session.identity).await;
        return Ok(());
    };

    let Some(task) = db::get_task(&state.pool, confirm.task_id).await? else {
        state
            .send(&session.channel, "That task no longer exists — nothing to confirm.")
            .await;
        state.sessions.remove(&session.identity).await;
        return Ok(());
    };

    match confirm.step {
        ConfirmStep::AwaitYesNo => match parse_yes_no(text) {
            YesNoReply::Yes => {
                db::update_task_status(&state.pool, task.id, TaskStatus::Completed, None).await?;
                state.scheduler.cancel(task.id).await;
                state
                    .send(
                        &task.assigner,
                        &format!("<@{}> completed: *{}*", task.assignee, task.description),
                    )
                    .await;
                state
                    .send(&session.channel, "Nice — marked as completed.")
                    .await;
                state.sessions.remove(&session.identity).await;
            }
            YesNoReply::No => {
                session.confirm = Some(crate::session::ConfirmState {
                    task_id: task.id,
                    step: ConfirmStep::AwaitReason,
                });
                session.record(Speaker::Assistant, REASON_PROMPT);
                state.send(&session.channel, REASON_PROMPT).await;
            }
            YesNoReply::Other => {
                session.record(Speaker::Assistant, YES_NO_PROMPT);
                state.send(&session.channel, YES_NO_PROMPT).await;
            }
        },
        ConfirmStep::AwaitReason => {
            let reason = text.trim();
            if reason.is_empty() {
                state.send(&session.channel, REASON_PROMPT).await;
                return Ok(());
            }
            db::update_task_status(&state.pool, task.id, TaskStatus::NotCompleted, Some(reason))
                .await?;
            state
                .send(
                    &task.assigner,
                    &format!(
                        "<@{}> has not completed *{}* — reason: {}",
                        task.assignee, task.description, reason
                    ),
                )
                .await;
            state
                .send(&session.channel, "Got it, I've passed that along.")
                .await;
            state.sessions.remove(&session.identity).await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReminderKind;
    use crate::session::Mode;
    use chrono::Utc;

    #[test]
    fn yes_no_parsing() {
        assert_eq!(parse_yes_no(" YES "), YesNoReply::Yes);
        assert_eq!(parse_yes_no("done"), YesNoReply::Yes);
        assert_eq!(parse_yes_no("no"), YesNoReply::No);
        assert_eq!(parse_yes_no("not yet"), YesNoReply::No);
        assert_eq!(parse_yes_no("maybe tomorrow"), YesNoReply::Other);
        assert_eq!(parse_yes_no(""), YesNoReply::Other);
    }

    #[tokio::test]
    async fn yes_completes_task_and_cancels_job() {
        let state = crate::test_state().await;
        let task_id = db::create_task(
            &state.pool,
            "ship the build",
            "U_ASSIGNEE",
            "U_ASSIGNER",
            "D1",
            Utc::now().timestamp() + 3_600,
            Some(ReminderKind::Recurring),
            Some("every 2 hours"),
        )
        .await
        .unwrap();
        state
            .scheduler
            .register_request(task_id, ReminderKind::Recurring, Some("every 2 hours"), None)
            .await
            .unwrap();

        let handle = state
            .sessions
            .acquire("U_ASSIGNEE", "U_ASSIGNEE", 0)
            .await;
        {
            let mut session = handle.lock().await;
            session.mode = Mode::Confirmation;
            session.confirm = Some(crate::session::ConfirmState {
                task_id,
                step: ConfirmStep::AwaitYesNo,
            });
            handle_reply(&state, &mut session, "yes").await.unwrap();
        }

        let task = db::get_task(&state.pool, task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(!state.scheduler.is_registered(task_id).await);
        assert!(state.sessions.get("U_ASSIGNEE").await.is_none());
    }

    #[tokio::test]
    async fn no_then_reason_marks_not_completed() {
        let state = crate::test_state().await;
        let task_id = db::create_task(
            &state.pool,
            "draft the memo",
            "U_ASSIGNEE",
            "U_ASSIGNER",
            "D1",
            Utc::now().timestamp() + 3_600,
            Some(ReminderKind::OneTime),
            None,
        )
        .await
        .unwrap();

        let handle = state
            .sessions
            .acquire("U_ASSIGNEE", "U_ASSIGNEE", 0)
            .await;
        let mut session = handle.lock().await;
        session.mode = Mode::Confirmation;
        session.confirm = Some(crate::session::ConfirmState {
            task_id,
            step: ConfirmStep::AwaitYesNo,
        });

        handle_reply(&state, &mut session, "no").await.unwrap();
        assert_eq!(
            session.confirm.as_ref().map(|c| c.step),
            Some(ConfirmStep::AwaitReason)
        );

        handle_reply(&state, &mut session, "waiting on legal review")
            .await
            .unwrap();
        let task = db::get_task(&state.pool, task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::NotCompleted);
        assert_eq!(
            task.not_completed_reason.as_deref(),
            Some("waiting on legal review")
        );
        assert!(state.sessions.get("U_ASSIGNEE").await.is_none());
    }

    #[tokio::test]
    async fn unrecognized_reply_reissues_prompt() {
        let state = crate::test_state().await;
        let task_id = db::create_task(
            &state.pool,
            "update the roadmap",
            "U_ASSIGNEE",
            "U_ASSIGNER",
            "D1",
            Utc::now().timestamp() + 3_600,
            Some(ReminderKind::OneTime),
            None,
        )
        .await
        .unwrap();

        let handle = state
            .sessions
            .acquire("U_ASSIGNEE", "U_ASSIGNEE", 0)
            .await;
        let mut session = handle.lock().await;
        session.mode = Mode::Confirmation;
        session.confirm = Some(crate::session::ConfirmState {
            task_id,
            step: ConfirmStep::AwaitYesNo,
        });

        handle_reply(&state, &mut session, "ask me tomorrow")
            .await
            .unwrap();
        // No state change: still awaiting yes/no, task untouched.
        assert_eq!(
            session.confirm.as_ref().map(|c| c.step),
            Some(ConfirmStep::AwaitYesNo)
        );
        let task = db::get_task(&state.pool, task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }
}
