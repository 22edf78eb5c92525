//! Session-scoped driver that keeps a [`TaskReconciler`] in step with the
//! remote store.
//!
//! Store calls run as spawned tasks and report back through an inbox channel,
//! so the caller stays responsive while a call is outstanding. The owner feeds
//! inbox messages to [`TaskSync::handle`] and subscription messages to
//! [`TaskSync::handle_stream`]; both run on the owner's flow, so the
//! reconciler is never touched concurrently.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tasksync_shared::{ChangeEvent, LoadTicket, NewTask, Task, TaskPatch, TaskReconciler};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{ClientError, MutationOp, Result};
use crate::realtime::StreamMessage;
use crate::session::SessionContext;
use crate::store::TaskStore;

/// Identifies one mutation started by [`TaskSync`], so its outcome can be
/// matched to whatever started it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

/// Completion of a store call started by [`TaskSync`].
#[derive(Debug)]
pub enum SyncMessage {
    Loaded {
        ticket: LoadTicket,
        result: Result<Vec<Task>>,
    },
    Created {
        request: RequestId,
        result: Result<Task>,
    },
    Edited {
        request: RequestId,
        id: Uuid,
        result: Result<Task>,
    },
    Removed {
        request: RequestId,
        id: Uuid,
        result: Result<()>,
    },
    Toggled {
        request: RequestId,
        id: Uuid,
        result: Result<Task>,
    },
}

/// What the view should tell the user.
#[derive(Debug, Clone, PartialEq)]
pub enum Feedback {
    Loaded,
    Saved {
        op: MutationOp,
        request: RequestId,
    },
    /// Bulk load failed; the previous list is still shown.
    LoadFailed(String),
    MutationFailed {
        op: MutationOp,
        request: RequestId,
        message: String,
    },
    /// Live updates are flowing (again).
    Live,
    /// Live updates are unavailable; the list only changes on reload or own saves.
    StreamFailed(String),
}

pub struct TaskSync {
    store: Arc<dyn TaskStore>,
    ctx: SessionContext,
    reconciler: TaskReconciler,
    inbox: mpsc::UnboundedSender<SyncMessage>,
    live: bool,
    /// The stream failed since the last successful join.
    outage: bool,
    next_request: u64,
}

impl TaskSync {
    pub fn new(
        store: Arc<dyn TaskStore>,
        ctx: SessionContext,
    ) -> (Self, mpsc::UnboundedReceiver<SyncMessage>) {
        let (inbox, messages) = mpsc::unbounded_channel();
        let sync = Self {
            store,
            ctx,
            reconciler: TaskReconciler::new(),
            inbox,
            live: false,
            outage: false,
            next_request: 0,
        };
        (sync, messages)
    }

    pub fn tasks(&self) -> &[Task] {
        self.reconciler.tasks()
    }

    pub fn reconciler(&self) -> &TaskReconciler {
        &self.reconciler
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Swaps in a refreshed token for the same user. Calls already in flight
    /// keep the token they started with.
    pub fn set_context(&mut self, ctx: SessionContext) {
        if ctx.user_id != self.ctx.user_id {
            warn!("ignoring context for a different user");
            return;
        }
        self.ctx = ctx;
    }

    fn next_request(&mut self) -> RequestId {
        self.next_request += 1;
        RequestId(self.next_request)
    }

    /// Loads the full task list and waits for it.
    pub async fn load(&mut self) -> Result<()> {
        let ticket = self.reconciler.begin_load();
        match self.store.list(&self.ctx).await {
            Ok(tasks) => {
                self.reconciler.complete_load(ticket, tasks);
                Ok(())
            }
            Err(e) => {
                self.reconciler.abort_load(ticket);
                error!("load failed: {e}");
                Err(e)
            }
        }
    }

    /// Starts a load in the background; the result arrives as [`SyncMessage::Loaded`].
    pub fn start_load(&mut self) {
        let ticket = self.reconciler.begin_load();
        let store = Arc::clone(&self.store);
        let ctx = self.ctx.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = store.list(&ctx).await;
            let _ = inbox.send(SyncMessage::Loaded { ticket, result });
        });
    }

    pub fn create(&mut self, task: NewTask) -> RequestId {
        let request = self.next_request();
        let store = Arc::clone(&self.store);
        let ctx = self.ctx.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = store.insert(&ctx, task).await;
            let _ = inbox.send(SyncMessage::Created { request, result });
        });
        request
    }

    /// Title/description edit. Completion only changes through [`TaskSync::toggle`].
    pub fn update(&mut self, id: Uuid, patch: TaskPatch) -> Result<RequestId> {
        if patch.is_completed.is_some() {
            return Err(ClientError::mutation(
                MutationOp::Update,
                "completion is changed with toggle",
            ));
        }
        let request = self.next_request();
        let store = Arc::clone(&self.store);
        let ctx = self.ctx.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = store.update(&ctx, id, patch).await;
            let _ = inbox.send(SyncMessage::Edited {
                request,
                id,
                result,
            });
        });
        Ok(request)
    }

    pub fn delete(&mut self, id: Uuid) -> RequestId {
        let request = self.next_request();
        let store = Arc::clone(&self.store);
        let ctx = self.ctx.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = store.delete(&ctx, id).await;
            let _ = inbox.send(SyncMessage::Removed {
                request,
                id,
                result,
            });
        });
        request
    }

    /// Flips completion locally right away, then asks the store.
    pub fn toggle(&mut self, id: Uuid, completed: bool) -> Result<RequestId> {
        if self.reconciler.toggle_local(id, completed).is_none() {
            return Err(ClientError::mutation(MutationOp::Toggle, "task not found"));
        }
        let request = self.next_request();
        let store = Arc::clone(&self.store);
        let ctx = self.ctx.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = store
                .update(&ctx, id, TaskPatch::completion(completed))
                .await
                .map_err(|e| retag(e, MutationOp::Toggle));
            let _ = inbox.send(SyncMessage::Toggled {
                request,
                id,
                result,
            });
        });
        Ok(request)
    }

    /// Folds the result of a store call into the collection.
    pub fn handle(&mut self, message: SyncMessage) -> Option<Feedback> {
        match message {
            SyncMessage::Loaded { ticket, result } => match result {
                Ok(tasks) => self
                    .reconciler
                    .complete_load(ticket, tasks)
                    .then_some(Feedback::Loaded),
                Err(e) => {
                    self.reconciler.abort_load(ticket);
                    error!("load failed: {e}");
                    Some(Feedback::LoadFailed(e.to_string()))
                }
            },
            SyncMessage::Created { request, result } => {
                let op = MutationOp::Create;
                match result {
                    Ok(task) => {
                        debug!("created {}", task.id);
                        // The change notification for this row may already be applied.
                        self.reconciler.apply_change(ChangeEvent::Inserted(task));
                        Some(Feedback::Saved { op, request })
                    }
                    Err(e) => Some(mutation_failed(op, request, e)),
                }
            }
            SyncMessage::Edited {
                request,
                id,
                result,
            } => {
                let op = MutationOp::Update;
                match result {
                    Ok(task) => {
                        if !self.live {
                            self.reconciler.apply_change(ChangeEvent::Updated(task));
                        }
                        debug!("updated {id}");
                        Some(Feedback::Saved { op, request })
                    }
                    Err(e) => Some(mutation_failed(op, request, e)),
                }
            }
            SyncMessage::Removed {
                request,
                id,
                result,
            } => {
                let op = MutationOp::Delete;
                match result {
                    Ok(()) => {
                        self.reconciler.apply_change(ChangeEvent::Deleted(id));
                        Some(Feedback::Saved { op, request })
                    }
                    Err(e) => Some(mutation_failed(op, request, e)),
                }
            }
            SyncMessage::Toggled {
                request,
                id,
                result,
            } => {
                let op = MutationOp::Toggle;
                match result {
                    Ok(task) => {
                        self.reconciler.commit_local(id);
                        if !self.live {
                            self.reconciler.apply_change(ChangeEvent::Updated(task));
                        }
                        Some(Feedback::Saved { op, request })
                    }
                    Err(e) => {
                        if !self.reconciler.rollback_local(id) {
                            debug!("toggle of {id} already superseded, nothing to roll back");
                        }
                        Some(mutation_failed(op, request, e))
                    }
                }
            }
        }
    }

    /// Folds a subscription message into the collection.
    pub fn handle_stream(&mut self, message: StreamMessage) -> Option<Feedback> {
        match message {
            StreamMessage::Subscribed => {
                self.live = true;
                if std::mem::take(&mut self.outage) {
                    // First join only succeeded after retries; catch up on what was missed.
                    self.start_load();
                }
                Some(Feedback::Live)
            }
            StreamMessage::Change(event) => {
                self.reconciler.apply_change(event);
                None
            }
            StreamMessage::Reconnected => {
                info!("live updates resumed, reloading");
                self.live = true;
                self.outage = false;
                self.start_load();
                Some(Feedback::Live)
            }
            StreamMessage::Failed(reason) => {
                warn!("live updates unavailable: {reason}");
                self.live = false;
                self.outage = true;
                Some(Feedback::StreamFailed(
                    ClientError::Stream(reason).to_string(),
                ))
            }
            StreamMessage::Closed => {
                self.live = false;
                None
            }
        }
    }
}

fn retag(error: ClientError, op: MutationOp) -> ClientError {
    match error {
        ClientError::Mutation { message, .. } => ClientError::Mutation { op, message },
        other => other,
    }
}

fn mutation_failed(op: MutationOp, request: RequestId, error: ClientError) -> Feedback {
    error!("{op} failed: {error}");
    Feedback::MutationFailed {
        op,
        request,
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::sync::Mutex;

    /// In-memory store that can be told to fail every call.
    struct MemoryStore {
        rows: Mutex<Vec<Task>>,
        failing: AtomicBool,
        clock: AtomicI64,
    }

    impl MemoryStore {
        fn with_rows(rows: Vec<Task>) -> Arc<Self> {
            Arc::new(Self {
                rows: Mutex::new(rows),
                failing: AtomicBool::new(false),
                clock: AtomicI64::new(1_000),
            })
        }

        fn fail(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn check(&self, op: Option<MutationOp>) -> Result<()> {
            if !self.failing.load(Ordering::SeqCst) {
                return Ok(());
            }
            Err(match op {
                Some(op) => ClientError::mutation(op, "store unavailable"),
                None => ClientError::Fetch("store unavailable".into()),
            })
        }
    }

    #[async_trait]
    impl TaskStore for MemoryStore {
        async fn list(&self, ctx: &SessionContext) -> Result<Vec<Task>> {
            self.check(None)?;
            let mut rows: Vec<Task> = self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.user_id == ctx.user_id)
                .cloned()
                .collect();
            tasksync_shared::sort_newest_first(&mut rows);
            Ok(rows)
        }

        async fn insert(&self, ctx: &SessionContext, task: NewTask) -> Result<Task> {
            self.check(Some(MutationOp::Create))?;
            let secs = self.clock.fetch_add(1, Ordering::SeqCst);
            let row = Task {
                id: Uuid::new_v4(),
                title: task.title,
                description: task.description,
                is_completed: false,
                user_id: ctx.user_id,
                created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            };
            self.rows.lock().unwrap().push(row.clone());
            Ok(row)
        }

        async fn update(&self, _ctx: &SessionContext, id: Uuid, patch: TaskPatch) -> Result<Task> {
            self.check(Some(MutationOp::Update))?;
            let mut rows = self.rows.lock().unwrap();
            let row = rows
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| ClientError::mutation(MutationOp::Update, "task not found"))?;
            patch.apply_to(row);
            Ok(row.clone())
        }

        async fn delete(&self, _ctx: &SessionContext, id: Uuid) -> Result<()> {
            self.check(Some(MutationOp::Delete))?;
            self.rows.lock().unwrap().retain(|t| t.id != id);
            Ok(())
        }
    }

    fn owner() -> Uuid {
        Uuid::from_u128(42)
    }

    fn row(n: u128, secs: i64) -> Task {
        Task {
            id: Uuid::from_u128(n),
            title: format!("task {n}"),
            description: None,
            is_completed: false,
            user_id: owner(),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    fn sync_over(
        store: Arc<MemoryStore>,
    ) -> (TaskSync, mpsc::UnboundedReceiver<SyncMessage>) {
        TaskSync::new(store, SessionContext::new(owner(), "jwt"))
    }

    async fn settle(sync: &mut TaskSync, inbox: &mut mpsc::UnboundedReceiver<SyncMessage>) -> Option<Feedback> {
        let message = inbox.recv().await.expect("store call reports back");
        sync.handle(message)
    }

    #[tokio::test]
    async fn load_fills_collection_newest_first() {
        let store = MemoryStore::with_rows(vec![row(1, 10), row(2, 20)]);
        let (mut sync, _inbox) = sync_over(store);
        sync.load().await.unwrap();
        let ids: Vec<_> = sync.tasks().iter().map(|t| t.id.as_u128()).collect();
        assert_eq!(ids, vec![2, 1]);
        assert!(sync.reconciler().is_ready());
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_tasks() {
        let store = MemoryStore::with_rows(vec![row(1, 10)]);
        let (mut sync, mut inbox) = sync_over(Arc::clone(&store));
        sync.load().await.unwrap();

        store.fail(true);
        sync.start_load();
        let feedback = settle(&mut sync, &mut inbox).await;
        assert!(matches!(feedback, Some(Feedback::LoadFailed(_))));
        assert_eq!(sync.tasks().len(), 1);
    }

    #[tokio::test]
    async fn failed_first_load_is_reported() {
        let store = MemoryStore::with_rows(vec![row(1, 10)]);
        store.fail(true);
        let (mut sync, _inbox) = sync_over(store);
        let err = sync.load().await.unwrap_err();
        assert!(matches!(err, ClientError::Fetch(_)));
        assert!(!sync.reconciler().is_ready());
    }

    #[tokio::test]
    async fn create_response_then_echo_shows_one_row() {
        let store = MemoryStore::with_rows(vec![row(1, 10)]);
        let (mut sync, mut inbox) = sync_over(store);
        sync.load().await.unwrap();
        sync.handle_stream(StreamMessage::Subscribed);

        let request = sync.create(NewTask::new("new", "").unwrap());
        let message = inbox.recv().await.unwrap();
        let SyncMessage::Created {
            result: Ok(created),
            ..
        } = &message
        else {
            panic!("unexpected {message:?}");
        };
        let echo = StreamMessage::Change(ChangeEvent::Inserted(created.clone()));
        assert_eq!(
            sync.handle(message),
            Some(Feedback::Saved {
                op: MutationOp::Create,
                request
            })
        );
        sync.handle_stream(echo);
        assert_eq!(sync.tasks().len(), 2);
        assert_eq!(sync.tasks()[0].title, "new");
    }

    #[tokio::test]
    async fn echo_before_create_response_shows_one_row() {
        let store = MemoryStore::with_rows(vec![]);
        let (mut sync, mut inbox) = sync_over(store);
        sync.load().await.unwrap();

        sync.create(NewTask::new("new", "").unwrap());
        let message = inbox.recv().await.unwrap();
        let SyncMessage::Created {
            result: Ok(created),
            ..
        } = &message
        else {
            panic!("unexpected {message:?}");
        };
        sync.handle_stream(StreamMessage::Change(ChangeEvent::Inserted(created.clone())));
        sync.handle(message);
        assert_eq!(sync.tasks().len(), 1);
    }

    #[tokio::test]
    async fn failed_toggle_rolls_back() {
        let store = MemoryStore::with_rows(vec![row(1, 10)]);
        let (mut sync, mut inbox) = sync_over(Arc::clone(&store));
        sync.load().await.unwrap();

        store.fail(true);
        let request = sync.toggle(Uuid::from_u128(1), true).unwrap();
        assert!(sync.tasks()[0].is_completed, "optimistic flip is immediate");

        let feedback = settle(&mut sync, &mut inbox).await;
        assert!(matches!(
            feedback,
            Some(Feedback::MutationFailed { op: MutationOp::Toggle, request: r, .. }) if r == request
        ));
        assert!(!sync.tasks()[0].is_completed);
    }

    #[tokio::test]
    async fn toggle_of_unknown_task_is_rejected() {
        let store = MemoryStore::with_rows(vec![]);
        let (mut sync, _inbox) = sync_over(store);
        sync.load().await.unwrap();
        assert!(sync.toggle(Uuid::from_u128(9), true).is_err());
    }

    #[tokio::test]
    async fn update_cannot_change_completion() {
        let store = MemoryStore::with_rows(vec![row(1, 10)]);
        let (mut sync, _inbox) = sync_over(store);
        sync.load().await.unwrap();
        let err = sync
            .update(Uuid::from_u128(1), TaskPatch::completion(true))
            .unwrap_err();
        assert!(matches!(err, ClientError::Mutation { op: MutationOp::Update, .. }));
    }

    #[tokio::test]
    async fn degraded_mode_applies_update_responses() {
        let store = MemoryStore::with_rows(vec![row(1, 10)]);
        let (mut sync, mut inbox) = sync_over(store);
        sync.load().await.unwrap();
        sync.handle_stream(StreamMessage::Failed("refused".into()));
        assert!(!sync.is_live());

        let patch = TaskPatch::edit("renamed", "notes").unwrap();
        sync.update(Uuid::from_u128(1), patch).unwrap();
        settle(&mut sync, &mut inbox).await;
        assert_eq!(sync.tasks()[0].title, "renamed");
        assert_eq!(sync.tasks()[0].description.as_deref(), Some("notes"));
    }

    #[tokio::test]
    async fn live_mode_waits_for_the_notification() {
        let store = MemoryStore::with_rows(vec![row(1, 10)]);
        let (mut sync, mut inbox) = sync_over(store);
        sync.load().await.unwrap();
        sync.handle_stream(StreamMessage::Subscribed);

        let patch = TaskPatch::edit("renamed", "").unwrap();
        sync.update(Uuid::from_u128(1), patch).unwrap();
        let message = inbox.recv().await.unwrap();
        let SyncMessage::Edited { result: Ok(updated), .. } = &message else {
            panic!("unexpected {message:?}");
        };
        let notification = StreamMessage::Change(ChangeEvent::Updated(updated.clone()));
        sync.handle(message);
        assert_eq!(sync.tasks()[0].title, "task 1");

        sync.handle_stream(notification);
        assert_eq!(sync.tasks()[0].title, "renamed");
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let store = MemoryStore::with_rows(vec![row(1, 10), row(2, 20)]);
        let (mut sync, mut inbox) = sync_over(store);
        sync.load().await.unwrap();

        let request = sync.delete(Uuid::from_u128(2));
        let feedback = settle(&mut sync, &mut inbox).await;
        assert_eq!(
            feedback,
            Some(Feedback::Saved {
                op: MutationOp::Delete,
                request
            })
        );
        assert_eq!(sync.tasks().len(), 1);

        // The delete notification arrives afterwards and changes nothing.
        sync.handle_stream(StreamMessage::Change(ChangeEvent::Deleted(Uuid::from_u128(2))));
        assert_eq!(sync.tasks().len(), 1);
    }

    #[tokio::test]
    async fn reconnect_reloads_to_catch_missed_changes() {
        let store = MemoryStore::with_rows(vec![row(1, 10)]);
        let (mut sync, mut inbox) = sync_over(Arc::clone(&store));
        sync.load().await.unwrap();
        sync.handle_stream(StreamMessage::Failed("connection closed".into()));

        // A row written while the stream was down.
        store.rows.lock().unwrap().push(row(2, 20));

        assert_eq!(
            sync.handle_stream(StreamMessage::Reconnected),
            Some(Feedback::Live)
        );
        assert_eq!(settle(&mut sync, &mut inbox).await, Some(Feedback::Loaded));
        assert_eq!(sync.tasks().len(), 2);
        assert!(sync.is_live());
    }

    #[tokio::test]
    async fn each_mutation_gets_its_own_request_id() {
        let store = MemoryStore::with_rows(vec![row(1, 10)]);
        let (mut sync, _inbox) = sync_over(store);
        sync.load().await.unwrap();
        let first = sync.create(NewTask::new("a", "").unwrap());
        let second = sync.create(NewTask::new("b", "").unwrap());
        let third = sync.delete(Uuid::from_u128(1));
        assert_ne!(first, second);
        assert_ne!(second, third);
    }

    #[tokio::test]
    async fn refreshed_context_is_used_for_later_calls() {
        let store = MemoryStore::with_rows(vec![row(1, 10)]);
        let (mut sync, _inbox) = sync_over(store);
        sync.set_context(SessionContext::new(owner(), "jwt-2"));
        assert_eq!(sync.context().access_token, "jwt-2");

        sync.set_context(SessionContext::new(Uuid::from_u128(7), "intruder"));
        assert_eq!(sync.context().user_id, owner());
        assert_eq!(sync.context().access_token, "jwt-2");
    }

    #[tokio::test]
    async fn late_first_join_reloads() {
        let store = MemoryStore::with_rows(vec![row(1, 10)]);
        let (mut sync, mut inbox) = sync_over(Arc::clone(&store));
        sync.load().await.unwrap();
        sync.handle_stream(StreamMessage::Failed("connect: refused".into()));
        store.rows.lock().unwrap().push(row(2, 20));

        assert_eq!(sync.handle_stream(StreamMessage::Subscribed), Some(Feedback::Live));
        assert_eq!(settle(&mut sync, &mut inbox).await, Some(Feedback::Loaded));
        assert_eq!(sync.tasks().len(), 2);
    }

    #[tokio::test]
    async fn notifications_before_load_are_not_lost() {
        let store = MemoryStore::with_rows(vec![row(1, 10)]);
        let (mut sync, mut inbox) = sync_over(store);
        sync.start_load();
        sync.handle_stream(StreamMessage::Change(ChangeEvent::Inserted(row(3, 30))));
        assert!(sync.tasks().is_empty());

        settle(&mut sync, &mut inbox).await;
        let ids: Vec<_> = sync.tasks().iter().map(|t| t.id.as_u128()).collect();
        assert_eq!(ids, vec![3, 1]);
    }
}
