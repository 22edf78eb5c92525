use tasksync_shared::ValidationError;

/// Which store mutation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    Create,
    Update,
    Delete,
    Toggle,
}

impl std::fmt::Display for MutationOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MutationOp::Create => "create",
            MutationOp::Update => "update",
            MutationOp::Delete => "delete",
            MutationOp::Toggle => "toggle",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Sign-in, sign-up or sign-out rejected by the auth service.
    #[error("{0}")]
    Auth(String),

    /// Bulk load of the task list failed.
    #[error("could not load tasks: {0}")]
    Fetch(String),

    /// A create/update/delete/toggle call failed.
    #[error("could not {op} task: {message}")]
    Mutation { op: MutationOp, message: String },

    /// The change-notification subscription could not be established.
    #[error("live updates unavailable: {0}")]
    Stream(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("not signed in")]
    NoSession,

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ClientError {
    pub fn mutation(op: MutationOp, message: impl Into<String>) -> Self {
        ClientError::Mutation {
            op,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Default, serde::Deserialize)]
struct ErrorBody {
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

/// Readable message from a non-success backend response. Auth errors use
/// `error_description`/`msg`, the data API uses `message`.
pub(crate) async fn response_message(response: reqwest::Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
    body.error_description
        .or(body.msg)
        .or(body.message)
        .or(body.error)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("request failed with status {status}"))
}
