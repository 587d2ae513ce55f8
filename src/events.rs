//! Client notifications and questions.

use crate::vm::{SessionId, VmIdentity};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the broadcast ring.
const EVENT_BUFFER: usize = 256;

/// Notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// The VM's snapshot tree changed.
    SnapshotTreeChanged,
    /// A snapshot was created.
    Snapshotted {
        /// New snapshot.
        guid: String,
    },
    /// The VM was reverted to a snapshot.
    VmRestored {
        /// Snapshot reverted to.
        guid: String,
    },
    /// A VM was registered.
    VmAdded {
        /// New VM uuid.
        uuid: String,
        /// New VM name.
        name: String,
    },
    /// Progress of a long operation.
    Progress {
        /// Operation name.
        operation: String,
        /// Percentage, 0 to 100.
        percent: u32,
    },
    /// Non-fatal condition the user should know about.
    Warning {
        /// Human-readable message.
        message: String,
    },
    /// A question was raised without an interactive answer.
    Question {
        /// The question.
        question: Question,
    },
}

/// A notification with its audience.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// VM the event is about.
    pub vm: Option<VmIdentity>,
    /// Target session, or every session when `None`.
    pub session: Option<SessionId>,
    /// Payload.
    pub kind: EventKind,
}

impl Event {
    /// Event for every session.
    pub fn broadcast(vm: &VmIdentity, kind: EventKind) -> Self {
        Self {
            vm: Some(vm.clone()),
            session: None,
            kind,
        }
    }

    /// Event for one session.
    pub fn to_session(session: &SessionId, vm: &VmIdentity, kind: EventKind) -> Self {
        Self {
            vm: Some(vm.clone()),
            session: Some(session.clone()),
            kind,
        }
    }

    /// Whether `session` should see this event.
    pub fn is_visible_to(&self, session: &SessionId) -> bool {
        self.session.as_ref().map_or(true, |s| s == session)
    }
}

/// Yes/no question to the requesting user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "question", rename_all = "snake_case")]
pub enum Question {
    /// Free space could not be determined; continue anyway?
    CannotGetDiskFreeSpace {
        /// Source VM uuid.
        vm_uuid: String,
    },
    /// Free space looks insufficient; continue anyway?
    NotEnoughSpaceForClone {
        /// Source VM uuid.
        vm_uuid: String,
        /// Estimated need in MB.
        required_mb: u64,
        /// Available space in MB.
        available_mb: u64,
    },
}

/// Answer to a [`Question`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Answer {
    /// Continue.
    Yes,
    /// Stop.
    No,
}

/// Transport for events and questions.
pub trait Channel: Send + Sync {
    /// Deliver an event.
    fn send_event(&self, event: Event);

    /// Ask the session's user and wait for the answer.
    fn ask(&self, session: &SessionId, question: Question) -> Answer;
}

/// [`Channel`] over a tokio broadcast ring, consumed by event streams.
///
/// Questions cannot be answered through the stream; they are published
/// as [`EventKind::Question`] and get the configured default answer.
#[derive(Debug, Clone)]
pub struct BroadcastChannel {
    tx: broadcast::Sender<Event>,
    default_answer: Answer,
}

impl BroadcastChannel {
    /// Create a channel that answers questions with `No`.
    pub fn new() -> Self {
        Self::with_default_answer(Answer::No)
    }

    /// Create a channel with a fixed answer to questions.
    pub fn with_default_answer(default_answer: Answer) -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx, default_answer }
    }

    /// Subscribe to subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for BroadcastChannel {
    fn send_event(&self, event: Event) {
        tracing::debug!(kind = ?event.kind, "event");
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    fn ask(&self, session: &SessionId, question: Question) -> Answer {
        let _ = self.tx.send(Event {
            vm: None,
            session: Some(session.clone()),
            kind: EventKind::Question { question },
        });
        self.default_answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visibility() {
        let vm = VmIdentity::new("default", "web");
        let a = SessionId::new("a");
        let b = SessionId::new("b");
        assert!(Event::broadcast(&vm, EventKind::SnapshotTreeChanged).is_visible_to(&a));

        let targeted = Event::to_session(&a, &vm, EventKind::SnapshotTreeChanged);
        assert!(targeted.is_visible_to(&a));
        assert!(!targeted.is_visible_to(&b));
    }

    #[test]
    fn test_broadcast_delivers() {
        let channel = BroadcastChannel::new();
        let mut rx = channel.subscribe();
        let vm = VmIdentity::new("default", "web");
        channel.send_event(Event::broadcast(
            &vm,
            EventKind::Snapshotted { guid: "{a}".into() },
        ));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::Snapshotted { guid: "{a}".into() });
    }

    #[test]
    fn test_questions_use_default_answer() {
        let channel = BroadcastChannel::with_default_answer(Answer::Yes);
        let mut rx = channel.subscribe();
        let answer = channel.ask(
            &SessionId::new("a"),
            Question::CannotGetDiskFreeSpace {
                vm_uuid: "u".into(),
            },
        );
        assert_eq!(answer, Answer::Yes);
        assert!(matches!(
            rx.try_recv().unwrap().kind,
            EventKind::Question { .. }
        ));

        let refusing = BroadcastChannel::new();
        let answer = refusing.ask(
            &SessionId::new("a"),
            Question::CannotGetDiskFreeSpace {
                vm_uuid: "u".into(),
            },
        );
        assert_eq!(answer, Answer::No);
    }

    #[test]
    fn test_event_json_shape() {
        let vm = VmIdentity::new("default", "web");
        let json = serde_json::to_value(Event::broadcast(
            &vm,
            EventKind::Progress {
                operation: "delete_snapshot".into(),
                percent: 40,
            },
        ))
        .unwrap();
        assert_eq!(json["kind"]["type"], "progress");
        assert_eq!(json["kind"]["percent"], 40);
        assert!(json["session"].is_null());
    }
}
