//! Folds a bulk load and a stream of change notifications into one ordered,
//! newest-first task collection.
//!
//! Notification delivery is at-least-once and may overlap with a bulk load, so
//! every rule here is idempotent: inserts are deduplicated by id, updates and
//! deletes of unknown ids are ignored, and notifications that arrive while a
//! load is in flight are replayed on top of the loaded snapshot.

use std::collections::{HashMap, HashSet};

use log::{debug, trace};
use uuid::Uuid;

use crate::change::ChangeEvent;
use crate::task::{sort_newest_first, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    /// No load has succeeded yet. Notifications are buffered.
    Uninitialized,
    Ready,
}

/// Identifies one bulk load. Only the most recently issued ticket can complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket(u64);

#[derive(Debug, Clone, Copy)]
struct PendingToggle {
    previous: bool,
    outstanding: u32,
}

#[derive(Debug)]
pub struct TaskReconciler {
    tasks: Vec<Task>,
    state: ReconcilerState,
    /// Backlog before the first load, journal of applied events during a reload.
    pending: Vec<ChangeEvent>,
    in_flight: Option<u64>,
    next_ticket: u64,
    deleted: HashSet<Uuid>,
    toggles: HashMap<Uuid, PendingToggle>,
}

impl Default for TaskReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskReconciler {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            state: ReconcilerState::Uninitialized,
            pending: Vec::new(),
            in_flight: None,
            next_ticket: 0,
            deleted: HashSet::new(),
            toggles: HashMap::new(),
        }
    }

    pub fn state(&self) -> ReconcilerState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ReconcilerState::Ready
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    /// Starts a bulk load. Issuing a new ticket supersedes any load in flight.
    pub fn begin_load(&mut self) -> LoadTicket {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        if self.in_flight.is_some() {
            // The superseded load's journal is kept; replaying it is idempotent.
            debug!("load {ticket} supersedes an in-flight load");
        }
        self.in_flight = Some(ticket);
        LoadTicket(ticket)
    }

    /// Replaces the collection with a loaded snapshot and replays the
    /// notifications received since the load began. Returns `false` when the
    /// ticket was superseded, in which case nothing changes.
    pub fn complete_load(&mut self, ticket: LoadTicket, mut tasks: Vec<Task>) -> bool {
        if self.in_flight != Some(ticket.0) {
            debug!("ignoring stale load {}", ticket.0);
            return false;
        }
        self.in_flight = None;

        let mut seen = HashSet::with_capacity(tasks.len());
        tasks.retain(|task| !self.deleted.contains(&task.id) && seen.insert(task.id));
        sort_newest_first(&mut tasks);
        self.tasks = tasks;
        self.toggles.clear();
        self.state = ReconcilerState::Ready;

        let replay = std::mem::take(&mut self.pending);
        debug!(
            "loaded {} tasks, replaying {} notifications",
            self.tasks.len(),
            replay.len()
        );
        for event in replay {
            self.fold(event);
        }
        true
    }

    /// Gives up on a load. The collection is left exactly as it was.
    pub fn abort_load(&mut self, ticket: LoadTicket) {
        if self.in_flight != Some(ticket.0) {
            return;
        }
        self.in_flight = None;
        if self.state == ReconcilerState::Ready {
            // Already applied; the journal only existed for the replay.
            self.pending.clear();
        }
    }

    /// Applies one change notification. Returns whether the visible collection
    /// changed; buffered notifications report `false`.
    pub fn apply_change(&mut self, event: ChangeEvent) -> bool {
        match self.state {
            ReconcilerState::Uninitialized => {
                trace!("buffering {} for {}", kind_name(&event), event.task_id());
                self.pending.push(event);
                false
            }
            ReconcilerState::Ready => {
                if self.in_flight.is_some() {
                    self.pending.push(event.clone());
                }
                self.fold(event)
            }
        }
    }

    /// Optimistically sets the completion flag. Returns the previous value, or
    /// `None` when the task is not in the collection.
    pub fn toggle_local(&mut self, id: Uuid, completed: bool) -> Option<bool> {
        let task = self.tasks.iter_mut().find(|task| task.id == id)?;
        let previous = task.is_completed;
        task.is_completed = completed;
        self.toggles
            .entry(id)
            .and_modify(|pending| pending.outstanding += 1)
            .or_insert(PendingToggle {
                previous,
                outstanding: 1,
            });
        Some(previous)
    }

    /// Marks one optimistic toggle as confirmed by the store.
    pub fn commit_local(&mut self, id: Uuid) {
        if let Some(pending) = self.toggles.get_mut(&id) {
            pending.outstanding = pending.outstanding.saturating_sub(1);
            if pending.outstanding == 0 {
                self.toggles.remove(&id);
            }
        }
    }

    /// Restores the last known-good completion flag after a failed toggle.
    /// Returns `false` when a notification has already superseded the
    /// optimistic value.
    pub fn rollback_local(&mut self, id: Uuid) -> bool {
        let Some(pending) = self.toggles.remove(&id) else {
            return false;
        };
        match self.tasks.iter_mut().find(|task| task.id == id) {
            Some(task) => {
                task.is_completed = pending.previous;
                true
            }
            None => false,
        }
    }

    fn fold(&mut self, event: ChangeEvent) -> bool {
        match event {
            ChangeEvent::Inserted(task) => {
                if self.deleted.contains(&task.id) || self.position(task.id).is_some() {
                    trace!("duplicate insert for {}", task.id);
                    return false;
                }
                self.tasks.insert(0, task);
                true
            }
            ChangeEvent::Updated(task) => {
                let Some(index) = self.position(task.id) else {
                    trace!("update for unknown task {}", task.id);
                    return false;
                };
                self.toggles.remove(&task.id);
                if self.tasks[index] == task {
                    return false;
                }
                self.tasks[index] = task;
                true
            }
            ChangeEvent::Deleted(id) => {
                self.deleted.insert(id);
                self.toggles.remove(&id);
                match self.position(id) {
                    Some(index) => {
                        self.tasks.remove(index);
                        true
                    }
                    None => false,
                }
            }
        }
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.tasks.iter().position(|task| task.id == id)
    }
}

fn kind_name(event: &ChangeEvent) -> &'static str {
    match event {
        ChangeEvent::Inserted(_) => "insert",
        ChangeEvent::Updated(_) => "update",
        ChangeEvent::Deleted(_) => "delete",
    }
}
