//! In-process registry of pending question groups.
//!
//! A tool that needs a human decision registers a group and awaits its
//! [`QuestionWaiter`]. A later, unrelated request (the REST respond
//! endpoint) calls [`SuspensionStore::submit_responses`], which wakes the
//! waiter exactly once. The map lock is held only for the map operation
//! itself; waiting never holds it.
//!
//! Groups live in process memory. A deployment with several workers needs
//! sticky routing or an external store, since the respond request must reach
//! the process that holds the waiter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::question::{QuestionInput, QuestionItem, Responses, normalize_questions};

/// Result of [`SuspensionStore::submit_responses`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Responses recorded and the waiter signalled.
    Accepted,
    /// No group with that id (never existed, cleaned up, or cancelled).
    UnknownGroup,
    /// The group already has responses.
    AlreadyAnswered,
}

impl SubmitOutcome {
    pub fn is_accepted(self) -> bool {
        self == SubmitOutcome::Accepted
    }
}

/// Why a [`QuestionWaiter`] returned without responses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The group was cancelled, swept or cleaned up before an answer arrived.
    #[error("question group {0} was cancelled")]
    Cancelled(String),
    #[error("question group {group_id} timed out after {after:?}")]
    TimedOut { group_id: String, after: Duration },
}

/// Receive half of a group's wait handle.
#[derive(Debug)]
pub struct QuestionWaiter {
    group_id: String,
    rx: oneshot::Receiver<Responses>,
}

impl QuestionWaiter {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Wait until responses are submitted or the group goes away.
    pub async fn wait(self) -> Result<Responses, WaitError> {
        self.rx.await.map_err(|_| WaitError::Cancelled(self.group_id))
    }

    /// Like [`wait`](Self::wait), bounded by `timeout`. The group stays
    /// registered after a timeout; the caller cleans it up.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<Responses, WaitError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(responses)) => Ok(responses),
            Ok(Err(_)) => Err(WaitError::Cancelled(self.group_id)),
            Err(_) => Err(WaitError::TimedOut {
                group_id: self.group_id,
                after: timeout,
            }),
        }
    }
}

/// Returned by group creation: the id, the normalized questions and the
/// waiter.
#[derive(Debug)]
pub struct QuestionGroupHandle {
    pub group_id: String,
    pub questions: Vec<QuestionItem>,
    pub waiter: QuestionWaiter,
}

/// Public view of an unanswered group.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PendingQuestionGroup {
    pub group_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub questions: Vec<QuestionItem>,
    pub created_at: DateTime<Utc>,
}

struct GroupEntry {
    thread_id: Option<String>,
    questions: Vec<QuestionItem>,
    sender: Option<oneshot::Sender<Responses>>,
    responses: Option<Responses>,
    registered: Instant,
    created_at: DateTime<Utc>,
}

type GroupMap = Mutex<HashMap<String, GroupEntry>>;

/// Registry of pending question groups. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct SuspensionStore {
    groups: Arc<GroupMap>,
}

impl SuspensionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(groups: &GroupMap) -> MutexGuard<'_, HashMap<String, GroupEntry>> {
        groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a group not tied to a thread.
    pub fn create_question_group(&self, questions: Vec<QuestionInput>) -> QuestionGroupHandle {
        self.register(None, questions)
    }

    /// Register a group raised by a turn on `thread_id`.
    pub fn create_question_group_for(
        &self,
        thread_id: impl Into<String>,
        questions: Vec<QuestionInput>,
    ) -> QuestionGroupHandle {
        self.register(Some(thread_id.into()), questions)
    }

    fn register(&self, thread_id: Option<String>, questions: Vec<QuestionInput>) -> QuestionGroupHandle {
        let group_id = uuid::Uuid::new_v4().to_string();
        let questions = normalize_questions(questions);
        let (tx, rx) = oneshot::channel();

        let entry = GroupEntry {
            thread_id: thread_id.clone(),
            questions: questions.clone(),
            sender: Some(tx),
            responses: None,
            registered: Instant::now(),
            created_at: Utc::now(),
        };
        Self::lock(&self.groups).insert(group_id.clone(), entry);
        info!(
            group_id = %group_id,
            thread = thread_id.as_deref().unwrap_or("-"),
            questions = questions.len(),
            "Registered question group"
        );

        QuestionGroupHandle {
            waiter: QuestionWaiter {
                group_id: group_id.clone(),
                rx,
            },
            group_id,
            questions,
        }
    }

    /// Record responses for a group and wake its waiter. Never panics.
    pub fn submit_responses(&self, group_id: &str, responses: Responses) -> SubmitOutcome {
        let mut groups = Self::lock(&self.groups);
        let Some(entry) = groups.get_mut(group_id) else {
            debug!(group_id, "Responses for unknown question group");
            return SubmitOutcome::UnknownGroup;
        };
        if entry.responses.is_some() {
            debug!(group_id, "Question group already answered");
            return SubmitOutcome::AlreadyAnswered;
        }

        entry.responses = Some(responses.clone());
        if let Some(tx) = entry.sender.take()
            && tx.send(responses).is_err()
        {
            // Recorded anyway; the waiter may have timed out a moment ago.
            debug!(group_id, "Question group waiter already gone");
        }
        info!(group_id, "Question group answered");
        SubmitOutcome::Accepted
    }

    /// Remove a group. Returns whether it existed.
    pub fn cleanup(&self, group_id: &str) -> bool {
        let removed = Self::lock(&self.groups).remove(group_id).is_some();
        if removed {
            debug!(group_id, "Cleaned up question group");
        }
        removed
    }

    /// Remove a group and wake its waiter with [`WaitError::Cancelled`].
    pub fn cancel(&self, group_id: &str) -> bool {
        let removed = Self::lock(&self.groups).remove(group_id);
        match removed {
            Some(entry) => {
                if entry.responses.is_none() {
                    info!(group_id, "Cancelled unanswered question group");
                }
                true
            }
            None => false,
        }
    }

    /// The group, if it exists and is still unanswered.
    pub fn pending(&self, group_id: &str) -> Option<PendingQuestionGroup> {
        let groups = Self::lock(&self.groups);
        let entry = groups.get(group_id)?;
        if entry.responses.is_some() {
            return None;
        }
        Some(PendingQuestionGroup {
            group_id: group_id.to_string(),
            thread_id: entry.thread_id.clone(),
            questions: entry.questions.clone(),
            created_at: entry.created_at,
        })
    }

    /// Number of registered groups (answered or not).
    pub fn len(&self) -> usize {
        Self::lock(&self.groups).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove groups registered at least `max_age` ago. Unanswered groups'
    /// waiters observe [`WaitError::Cancelled`]. Returns how many were removed.
    pub fn sweep_expired(&self, max_age: Duration) -> usize {
        Self::sweep(&self.groups, max_age)
    }

    fn sweep(groups: &GroupMap, max_age: Duration) -> usize {
        let mut groups = Self::lock(groups);
        let before = groups.len();
        groups.retain(|group_id, entry| {
            let keep = entry.registered.elapsed() < max_age;
            if !keep && entry.responses.is_none() {
                warn!(group_id = %group_id, "Expiring unanswered question group");
            }
            keep
        });
        before - groups.len()
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval`. The task
    /// ends by itself once every clone of the store has been dropped.
    pub fn spawn_sweeper(&self, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        let groups: Weak<GroupMap> = Arc::downgrade(&self.groups);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(groups) = groups.upgrade() else {
                    debug!("Suspension store dropped, sweeper exiting");
                    return;
                };
                let removed = Self::sweep(&groups, max_age);
                if removed > 0 {
                    info!(removed, "Swept expired question groups");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suspension::question::QuestionInput;
    use serde_json::json;

    fn two_questions() -> Vec<QuestionInput> {
        vec![
            QuestionInput::confirm("Book the 9am slot?"),
            QuestionInput::text("Anything else?"),
        ]
    }

    fn responses(pairs: &[(&str, serde_json::Value)]) -> Responses {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn unknown_group_is_reported_not_raised() {
        let store = SuspensionStore::new();
        let outcome = store.submit_responses("nonexistent", responses(&[("q1", json!("yes"))]));
        assert_eq!(outcome, SubmitOutcome::UnknownGroup);
    }

    #[tokio::test]
    async fn submit_wakes_waiter_once() {
        let store = SuspensionStore::new();
        let handle = store.create_question_group(two_questions());
        assert_eq!(handle.questions.len(), 2);
        assert_eq!(handle.questions[0].id, "q1");

        let waiter = tokio::spawn(handle.waiter.wait());
        let answer = responses(&[("q1", json!("yes"))]);

        assert_eq!(
            store.submit_responses(&handle.group_id, answer.clone()),
            SubmitOutcome::Accepted
        );
        assert_eq!(waiter.await.unwrap(), Ok(answer));
        assert_eq!(
            store.submit_responses(&handle.group_id, responses(&[("q1", json!("no"))])),
            SubmitOutcome::AlreadyAnswered
        );
    }

    #[tokio::test]
    async fn cancel_wakes_waiter_with_cancelled() {
        let store = SuspensionStore::new();
        let handle = store.create_question_group_for("thread-7", two_questions());
        let id = handle.group_id.clone();

        assert!(store.cancel(&id));
        assert_eq!(handle.waiter.wait().await, Err(WaitError::Cancelled(id.clone())));
        assert!(!store.cancel(&id));
        assert_eq!(
            store.submit_responses(&id, Responses::new()),
            SubmitOutcome::UnknownGroup
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_leaves_group_registered() {
        let store = SuspensionStore::new();
        let handle = store.create_question_group(two_questions());
        let id = handle.group_id.clone();

        let result = handle.waiter.wait_timeout(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(WaitError::TimedOut { .. })));
        assert!(store.pending(&id).is_some());
        assert!(store.cleanup(&id));
        assert!(store.is_empty());
    }

    #[test]
    fn pending_view_hides_answered_groups() {
        let store = SuspensionStore::new();
        let handle = store.create_question_group_for("thread-1", two_questions());
        let view = store.pending(&handle.group_id).unwrap();
        assert_eq!(view.thread_id.as_deref(), Some("thread-1"));
        assert_eq!(view.questions.len(), 2);

        store.submit_responses(&handle.group_id, Responses::new());
        assert!(store.pending(&handle.group_id).is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_stale_groups() {
        let store = SuspensionStore::new();
        let old = store.create_question_group(two_questions());
        tokio::time::advance(Duration::from_secs(120)).await;
        let fresh = store.create_question_group(two_questions());

        assert_eq!(store.sweep_expired(Duration::from_secs(60)), 1);
        assert!(store.pending(&fresh.group_id).is_some());
        assert!(matches!(old.waiter.wait().await, Err(WaitError::Cancelled(_))));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_expires_groups() {
        let store = SuspensionStore::new();
        let handle = store.create_question_group(two_questions());
        let sweeper = store.spawn_sweeper(Duration::from_secs(10), Duration::from_secs(30));

        let result = handle.waiter.wait().await;
        assert!(matches!(result, Err(WaitError::Cancelled(_))));
        assert!(store.is_empty());
        sweeper.abort();
    }

    #[test]
    fn groups_are_independent() {
        let store = SuspensionStore::new();
        let a = store.create_question_group(two_questions());
        let b = store.create_question_group(two_questions());
        assert_ne!(a.group_id, b.group_id);
        store.submit_responses(&a.group_id, Responses::new());
        assert!(store.pending(&b.group_id).is_some());
    }
}
