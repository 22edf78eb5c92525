use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::Task;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Primary key of a row. Deletes only carry this much of the old record.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
pub struct RowKey {
    pub id: Uuid,
}

/// A row-level change as delivered by the store: `{old, new, eventKind}`.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub kind: ChangeKind,
    pub new: Option<Task>,
    pub old: Option<RowKey>,
}

/// A change notification folded into the local task collection.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Inserted(Task),
    Updated(Task),
    Deleted(Uuid),
}

impl ChangeEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            ChangeEvent::Inserted(task) | ChangeEvent::Updated(task) => task.id,
            ChangeEvent::Deleted(id) => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed {kind:?} change: {reason}")]
pub struct MalformedChange {
    pub kind: ChangeKind,
    pub reason: &'static str,
}

impl TryFrom<RowChange> for ChangeEvent {
    type Error = MalformedChange;

    fn try_from(change: RowChange) -> Result<Self, Self::Error> {
        let kind = change.kind;
        match kind {
            ChangeKind::Insert => change
                .new
                .map(ChangeEvent::Inserted)
                .ok_or(MalformedChange { kind, reason: "missing new record" }),
            ChangeKind::Update => change
                .new
                .map(ChangeEvent::Updated)
                .ok_or(MalformedChange { kind, reason: "missing new record" }),
            ChangeKind::Delete => change
                .old
                .map(|key| ChangeEvent::Deleted(key.id))
                .ok_or(MalformedChange { kind, reason: "missing old record key" }),
        }
    }
}
