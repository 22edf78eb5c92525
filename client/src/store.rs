use async_trait::async_trait;
use log::{debug, error};
use reqwest::header::AUTHORIZATION;
use reqwest::RequestBuilder;
use serde::Serialize;
use tasksync_shared::{NewTask, Task, TaskPatch};
use url::Url;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{response_message, ClientError, MutationOp, Result};
use crate::session::SessionContext;

/// Store operations, always scoped to the caller in `ctx`.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// All of the caller's tasks, newest first.
    async fn list(&self, ctx: &SessionContext) -> Result<Vec<Task>>;

    /// Persists a new task. The store assigns `id`, `created_at` and `user_id`.
    async fn insert(&self, ctx: &SessionContext, task: NewTask) -> Result<Task>;

    async fn update(&self, ctx: &SessionContext, id: Uuid, patch: TaskPatch) -> Result<Task>;

    async fn delete(&self, ctx: &SessionContext, id: Uuid) -> Result<()>;
}

#[derive(Serialize)]
struct InsertRow<'a> {
    title: &'a str,
    description: Option<&'a str>,
    is_completed: bool,
    user_id: Uuid,
}

pub struct RestTaskStore {
    http: reqwest::Client,
    table_url: Url,
    anon_key: String,
}

impl RestTaskStore {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Self::with_http(config, reqwest::Client::new())
    }

    pub fn with_http(config: &ClientConfig, http: reqwest::Client) -> Result<Self> {
        Ok(Self {
            http,
            table_url: config.rest_url()?,
            anon_key: config.anon_key.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, ctx: &SessionContext) -> RequestBuilder {
        self.http
            .request(method, self.table_url.clone())
            .header("apikey", &self.anon_key)
            .header(AUTHORIZATION, ctx.bearer())
    }

    async fn single_row(&self, request: RequestBuilder, op: MutationOp) -> Result<Task> {
        let response = request
            .header("Prefer", "return=representation")
            .send()
            .await
            .map_err(|e| ClientError::mutation(op, e.to_string()))?;
        if !response.status().is_success() {
            let message = response_message(response).await;
            error!("{op} failed: {message}");
            return Err(ClientError::mutation(op, message));
        }
        let mut rows: Vec<Task> = response
            .json()
            .await
            .map_err(|e| ClientError::mutation(op, format!("unexpected response: {e}")))?;
        if rows.is_empty() {
            return Err(ClientError::mutation(op, "task not found"));
        }
        Ok(rows.swap_remove(0))
    }
}

fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{value}")
}

#[async_trait]
impl TaskStore for RestTaskStore {
    async fn list(&self, ctx: &SessionContext) -> Result<Vec<Task>> {
        let response = self
            .request(reqwest::Method::GET, ctx)
            .query(&[
                ("select", "*".to_string()),
                ("user_id", eq(ctx.user_id)),
                ("order", "created_at.desc".to_string()),
            ])
            .send()
            .await
            .map_err(|e| ClientError::Fetch(e.to_string()))?;
        if !response.status().is_success() {
            let message = response_message(response).await;
            error!("list failed: {message}");
            return Err(ClientError::Fetch(message));
        }
        let tasks: Vec<Task> = response
            .json()
            .await
            .map_err(|e| ClientError::Fetch(format!("unexpected response: {e}")))?;
        debug!("listed {} tasks", tasks.len());
        Ok(tasks)
    }

    async fn insert(&self, ctx: &SessionContext, task: NewTask) -> Result<Task> {
        let row = InsertRow {
            title: &task.title,
            description: task.description.as_deref(),
            is_completed: false,
            user_id: ctx.user_id,
        };
        let request = self.request(reqwest::Method::POST, ctx).json(&row);
        self.single_row(request, MutationOp::Create).await
    }

    async fn update(&self, ctx: &SessionContext, id: Uuid, patch: TaskPatch) -> Result<Task> {
        if patch.is_empty() {
            return Err(ClientError::mutation(MutationOp::Update, "nothing to update"));
        }
        let request = self
            .request(reqwest::Method::PATCH, ctx)
            .query(&[("id", eq(id)), ("user_id", eq(ctx.user_id))])
            .json(&patch);
        self.single_row(request, MutationOp::Update).await
    }

    async fn delete(&self, ctx: &SessionContext, id: Uuid) -> Result<()> {
        let op = MutationOp::Delete;
        let response = self
            .request(reqwest::Method::DELETE, ctx)
            .query(&[("id", eq(id)), ("user_id", eq(ctx.user_id))])
            .send()
            .await
            .map_err(|e| ClientError::mutation(op, e.to_string()))?;
        if !response.status().is_success() {
            let message = response_message(response).await;
            error!("delete failed: {message}");
            return Err(ClientError::mutation(op, message));
        }
        Ok(())
    }
}
