pub mod auth;
pub mod config;
pub mod error;
pub mod realtime;
pub mod session;
pub mod store;
pub mod sync;

pub use auth::{AuthClient, SignUpOutcome};
pub use config::ClientConfig;
pub use error::{ClientError, MutationOp, Result};
pub use realtime::{RealtimeClient, StreamMessage, Subscription, SubscriptionSpec};
pub use session::{Session, SessionContext, User};
pub use store::{RestTaskStore, TaskStore};
pub use sync::{Feedback, RequestId, SyncMessage, TaskSync};
