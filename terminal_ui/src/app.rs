use std::io;
use std::sync::Arc;

use chrono::Utc;
use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use futures::StreamExt;
use log::{debug, info, warn};
use tasksync_client::{
    AuthClient, Feedback, RealtimeClient, RequestId, Result as ClientResult, Session,
    SessionContext, SignUpOutcome, StreamMessage, Subscription, SubscriptionSpec, SyncMessage,
    TaskStore, TaskSync,
};
use tasksync_shared::{NewTask, Task, TaskPatch};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

/// Result of a spawned auth call.
#[derive(Debug)]
pub enum AuthEvent {
    SignedIn(ClientResult<Session>),
    SignedUp(ClientResult<SignUpOutcome>),
    SignedOut(ClientResult<()>),
    Refreshed(ClientResult<Session>),
}

#[derive(Debug)]
pub enum Input {
    Key(KeyEvent),
    Redraw,
    Sync(SyncMessage),
    Stream(StreamMessage),
    Auth(AuthEvent),
    Session(Option<Session>),
    /// The access token is about to expire.
    RefreshDue,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginField {
    Email,
    Password,
}

#[derive(Debug)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
    pub focus: LoginField,
    pub sign_up: bool,
    pub busy: bool,
    pub alert: Option<(Severity, String)>,
}

impl Default for LoginForm {
    fn default() -> Self {
        Self {
            email: String::new(),
            password: String::new(),
            focus: LoginField::Email,
            sign_up: false,
            busy: false,
            alert: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormField {
    Title,
    Description,
}

#[derive(Debug)]
pub struct TaskForm {
    /// `None` when creating.
    pub editing: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub focus: FormField,
    pub error: Option<String>,
    /// The save this form is waiting for.
    pub pending: Option<RequestId>,
}

impl TaskForm {
    fn blank() -> Self {
        Self {
            editing: None,
            title: String::new(),
            description: String::new(),
            focus: FormField::Title,
            error: None,
            pending: None,
        }
    }

    pub fn is_saving(&self) -> bool {
        self.pending.is_some()
    }

    fn for_task(task: &Task) -> Self {
        Self {
            editing: Some(task.id),
            title: task.title.clone(),
            description: task.description.clone().unwrap_or_default(),
            ..Self::blank()
        }
    }
}

/// Everything that exists only while someone is signed in.
pub struct ActiveSession {
    pub email: String,
    pub user_id: Uuid,
    pub sync: TaskSync,
    inbox: mpsc::UnboundedReceiver<SyncMessage>,
    subscription: Option<Subscription>,
    pub selected: usize,
    pub form: Option<TaskForm>,
    pub banner: Option<String>,
    pub inline_error: Option<String>,
    refresh_at: Option<Instant>,
}

impl ActiveSession {
    pub fn selected_task(&self) -> Option<&Task> {
        self.sync.tasks().get(self.selected)
    }

    fn clamp_selection(&mut self) {
        self.selected = self.selected.min(self.sync.tasks().len().saturating_sub(1));
    }
}

pub struct App {
    auth: Arc<AuthClient>,
    store: Arc<dyn TaskStore>,
    realtime: RealtimeClient,
    table: String,
    auth_events: mpsc::UnboundedSender<AuthEvent>,
    auth_inbox: mpsc::UnboundedReceiver<AuthEvent>,
    sessions: watch::Receiver<Option<Session>>,
    pub login: LoginForm,
    pub session: Option<ActiveSession>,
    pub should_quit: bool,
}

impl App {
    pub fn new(
        auth: Arc<AuthClient>,
        store: Arc<dyn TaskStore>,
        realtime: RealtimeClient,
        table: impl Into<String>,
    ) -> Self {
        let (auth_events, auth_inbox) = mpsc::unbounded_channel();
        let sessions = auth.on_session_change();
        let current = auth.current_session();
        let mut app = Self {
            auth,
            store,
            realtime,
            table: table.into(),
            auth_events,
            auth_inbox,
            sessions,
            login: LoginForm::default(),
            session: None,
            should_quit: false,
        };
        app.on_session(current);
        app
    }

    /// Waits for the next thing that needs handling.
    pub async fn next_input(&mut self, terminal: &mut EventStream) -> io::Result<Input> {
        let App {
            auth_inbox,
            sessions,
            session,
            ..
        } = self;
        let (inbox, subscription, refresh_at) = match session {
            Some(active) => (
                Some(&mut active.inbox),
                active.subscription.as_mut(),
                active.refresh_at,
            ),
            None => (None, None, None),
        };

        tokio::select! {
            event = terminal.next() => match event {
                Some(Ok(Event::Key(key))) if key.kind != KeyEventKind::Release => Ok(Input::Key(key)),
                Some(Ok(_)) => Ok(Input::Redraw),
                Some(Err(e)) => Err(e),
                None => Ok(Input::Closed),
            },
            Some(message) = recv_from(inbox) => Ok(Input::Sync(message)),
            Some(message) = stream_from(subscription) => Ok(Input::Stream(message)),
            Some(event) = auth_inbox.recv() => Ok(Input::Auth(event)),
            Ok(()) = sessions.changed() => Ok(Input::Session(sessions.borrow_and_update().clone())),
            _ = sleep_until(refresh_at) => Ok(Input::RefreshDue),
        }
    }

    pub fn apply(&mut self, input: Input) {
        match input {
            Input::Key(key) => self.on_key(key),
            Input::Redraw => {}
            Input::Sync(message) => {
                if let Some(active) = self.session.as_mut() {
                    let feedback = active.sync.handle(message);
                    on_feedback(active, feedback);
                }
            }
            Input::Stream(message) => {
                if let Some(active) = self.session.as_mut() {
                    let feedback = active.sync.handle_stream(message);
                    on_feedback(active, feedback);
                }
            }
            Input::Auth(event) => self.on_auth(event),
            Input::Session(session) => self.on_session(session),
            Input::RefreshDue => self.refresh_session(),
            Input::Closed => self.should_quit = true,
        }
    }

    /// Tears the live subscription down before exit.
    pub async fn shutdown(&mut self) {
        if let Some(mut active) = self.session.take() {
            if let Some(subscription) = active.subscription.take() {
                subscription.unsubscribe().await;
            }
        }
    }

    fn on_session(&mut self, session: Option<Session>) {
        match session {
            Some(session) => {
                if self.session.as_ref().map(|s| s.user_id) == Some(session.user.id) {
                    self.renew_session(&session);
                    return;
                }
                self.end_session();
                self.start_session(&session);
            }
            None => self.end_session(),
        }
    }

    fn start_session(&mut self, session: &Session) {
        info!("starting task session for {}", session.email());
        let ctx = session.context();
        let (mut sync, inbox) = TaskSync::new(Arc::clone(&self.store), ctx.clone());
        sync.start_load();
        // Notifications that beat the initial load are buffered by the reconciler.
        let subscription = self.subscribe(&ctx);
        self.session = Some(ActiveSession {
            email: session.email().to_string(),
            user_id: session.user.id,
            sync,
            inbox,
            subscription: Some(subscription),
            selected: 0,
            form: None,
            banner: None,
            inline_error: None,
            refresh_at: refresh_deadline(session),
        });
        self.login = LoginForm::default();
    }

    fn subscribe(&self, ctx: &SessionContext) -> Subscription {
        self.realtime
            .subscribe(ctx, SubscriptionSpec::owned_rows(&self.table, ctx))
    }

    /// Same user, new token: keep the list, rejoin the channel with the new token.
    fn renew_session(&mut self, session: &Session) {
        let ctx = session.context();
        let unchanged = self
            .session
            .as_ref()
            .map_or(true, |active| active.sync.context() == &ctx);
        if unchanged {
            return;
        }
        let subscription = self.subscribe(&ctx);
        let Some(active) = self.session.as_mut() else {
            return;
        };
        debug!("session renewed for {}", active.email);
        active.sync.set_context(ctx);
        active.refresh_at = refresh_deadline(session);
        if let Some(old) = active.subscription.replace(subscription) {
            tokio::spawn(old.unsubscribe());
        }
        // Changes between leaving the old channel and joining the new one.
        active.sync.start_load();
    }

    fn refresh_session(&mut self) {
        let Some(active) = self.session.as_mut() else {
            return;
        };
        active.refresh_at = None;
        info!("refreshing session for {}", active.email);
        let auth = Arc::clone(&self.auth);
        let events = self.auth_events.clone();
        tokio::spawn(async move {
            let result = auth.refresh().await;
            let _ = events.send(AuthEvent::Refreshed(result));
        });
    }

    fn end_session(&mut self) {
        if let Some(mut active) = self.session.take() {
            info!("ending task session for {}", active.email);
            if let Some(subscription) = active.subscription.take() {
                tokio::spawn(subscription.unsubscribe());
            }
        }
    }

    fn on_auth(&mut self, event: AuthEvent) {
        if let AuthEvent::Refreshed(result) = event {
            // Success arrives as a session change.
            if let (Err(e), Some(active)) = (result, self.session.as_mut()) {
                warn!("session refresh failed: {e}");
                active.banner = Some(format!("session refresh failed: {e}"));
            }
            return;
        }
        self.login.busy = false;
        match event {
            AuthEvent::SignedIn(Ok(_)) => {
                self.login.alert = Some((Severity::Success, "Signed in".into()));
            }
            AuthEvent::SignedUp(Ok(SignUpOutcome::ConfirmationRequired { email })) => {
                self.login.sign_up = false;
                self.login.password.clear();
                self.login.alert = Some((
                    Severity::Success,
                    format!("Account created. Check {email} to confirm it, then sign in."),
                ));
            }
            AuthEvent::SignedUp(Ok(SignUpOutcome::SignedIn(_))) => {
                self.login.alert = Some((Severity::Success, "Account created".into()));
            }
            AuthEvent::SignedOut(Ok(())) => {
                self.login.alert = Some((Severity::Success, "Signed out".into()));
            }
            AuthEvent::SignedIn(Err(e))
            | AuthEvent::SignedUp(Err(e))
            | AuthEvent::SignedOut(Err(e)) => {
                warn!("auth failed: {e}");
                self.login.alert = Some((Severity::Error, e.to_string()));
            }
            AuthEvent::Refreshed(_) => {}
        }
    }

    fn on_key(&mut self, key: KeyEvent) {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.should_quit = true;
            return;
        }
        let form_open = self.session.as_ref().map(|active| active.form.is_some());
        match form_open {
            None => self.on_login_key(key),
            Some(false) => self.on_list_key(key),
            Some(true) => {
                if let Some(active) = self.session.as_mut() {
                    on_form_key(active, key);
                }
            }
        }
    }

    fn on_login_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Esc => {
                self.should_quit = true;
                return;
            }
            KeyCode::Enter => {
                self.submit_login();
                return;
            }
            _ => {}
        }
        let login = &mut self.login;
        match key.code {
            KeyCode::Tab | KeyCode::BackTab | KeyCode::Up | KeyCode::Down => {
                login.focus = match login.focus {
                    LoginField::Email => LoginField::Password,
                    LoginField::Password => LoginField::Email,
                };
            }
            KeyCode::Char('t') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                login.sign_up = !login.sign_up;
                login.alert = None;
            }
            _ => {
                let field = match login.focus {
                    LoginField::Email => &mut login.email,
                    LoginField::Password => &mut login.password,
                };
                edit_text(field, key);
            }
        }
    }

    fn submit_login(&mut self) {
        if self.login.busy {
            return;
        }
        self.login.busy = true;
        self.login.alert = None;
        let auth = Arc::clone(&self.auth);
        let events = self.auth_events.clone();
        let email = self.login.email.clone();
        let password = self.login.password.clone();
        if self.login.sign_up {
            tokio::spawn(async move {
                let result = auth.sign_up(&email, &password).await;
                let _ = events.send(AuthEvent::SignedUp(result));
            });
        } else {
            tokio::spawn(async move {
                let result = auth.sign_in(&email, &password).await;
                let _ = events.send(AuthEvent::SignedIn(result));
            });
        }
    }

    fn sign_out(&mut self) {
        let auth = Arc::clone(&self.auth);
        let events = self.auth_events.clone();
        tokio::spawn(async move {
            let result = auth.sign_out().await;
            let _ = events.send(AuthEvent::SignedOut(result));
        });
    }

    fn on_list_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.should_quit = true;
                return;
            }
            KeyCode::Char('L') => {
                self.sign_out();
                return;
            }
            _ => {}
        }
        let Some(active) = self.session.as_mut() else {
            return;
        };
        match key.code {
            KeyCode::Up | KeyCode::Char('k') => {
                active.selected = active.selected.saturating_sub(1);
            }
            KeyCode::Down | KeyCode::Char('j') => {
                active.selected += 1;
                active.clamp_selection();
            }
            KeyCode::Char('n') => {
                active.inline_error = None;
                active.form = Some(TaskForm::blank());
            }
            KeyCode::Char('e') | KeyCode::Enter => {
                if let Some(task) = active.selected_task() {
                    let form = TaskForm::for_task(task);
                    active.inline_error = None;
                    active.form = Some(form);
                }
            }
            KeyCode::Char(' ') => {
                if let Some(task) = active.selected_task() {
                    let (id, completed) = (task.id, !task.is_completed);
                    active.inline_error = active
                        .sync
                        .toggle(id, completed)
                        .err()
                        .map(|e| e.to_string());
                }
            }
            KeyCode::Char('d') | KeyCode::Delete => {
                if let Some(id) = active.selected_task().map(|task| task.id) {
                    active.inline_error = None;
                    active.sync.delete(id);
                }
            }
            KeyCode::Char('r') => {
                active.banner = None;
                active.sync.start_load();
            }
            _ => {}
        }
    }
}

fn on_form_key(active: &mut ActiveSession, key: KeyEvent) {
    if key.code == KeyCode::Esc {
        active.form = None;
        return;
    }
    let Some(form) = active.form.as_mut() else {
        return;
    };
    match key.code {
        KeyCode::Tab | KeyCode::BackTab | KeyCode::Up | KeyCode::Down => {
            form.focus = match form.focus {
                FormField::Title => FormField::Description,
                FormField::Description => FormField::Title,
            };
        }
        KeyCode::Enter => {
            if form.is_saving() {
                return;
            }
            match submit_form(&mut active.sync, form) {
                Ok(request) => {
                    form.pending = Some(request);
                    form.error = None;
                }
                Err(e) => form.error = Some(e.to_string()),
            }
        }
        _ => {
            let field = match form.focus {
                FormField::Title => &mut form.title,
                FormField::Description => &mut form.description,
            };
            edit_text(field, key);
        }
    }
}

fn submit_form(sync: &mut TaskSync, form: &TaskForm) -> ClientResult<RequestId> {
    match form.editing {
        Some(id) => sync.update(id, TaskPatch::edit(&form.title, &form.description)?),
        None => Ok(sync.create(NewTask::new(&form.title, &form.description)?)),
    }
}

fn on_feedback(active: &mut ActiveSession, feedback: Option<Feedback>) {
    active.clamp_selection();
    let Some(feedback) = feedback else {
        return;
    };
    debug!("feedback: {feedback:?}");
    match feedback {
        Feedback::Loaded | Feedback::Live => active.banner = None,
        Feedback::LoadFailed(message) | Feedback::StreamFailed(message) => {
            active.banner = Some(message);
        }
        Feedback::Saved { request, .. } => {
            let closes_form = active
                .form
                .as_ref()
                .map_or(false, |form| form.pending == Some(request));
            if closes_form {
                active.form = None;
            }
        }
        Feedback::MutationFailed {
            request, message, ..
        } => match active.form.as_mut() {
            Some(form) if form.pending == Some(request) => {
                form.pending = None;
                form.error = Some(message);
            }
            _ => active.inline_error = Some(message),
        },
    }
}

fn refresh_deadline(session: &Session) -> Option<Instant> {
    session
        .refresh_delay(Utc::now())
        .map(|delay| Instant::now() + delay)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn edit_text(field: &mut String, key: KeyEvent) {
    match key.code {
        KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => field.push(c),
        KeyCode::Backspace => {
            field.pop();
        }
        _ => {}
    }
}

async fn recv_from<T>(inbox: Option<&mut mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match inbox {
        Some(inbox) => inbox.recv().await,
        None => std::future::pending().await,
    }
}

async fn stream_from(subscription: Option<&mut Subscription>) -> Option<StreamMessage> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
