use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How long before expiry a session should be refreshed.
pub const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
}

/// An authenticated session as issued by the auth service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub user: User,
}

impl Session {
    pub fn context(&self) -> SessionContext {
        SessionContext {
            user_id: self.user.id,
            access_token: self.access_token.clone(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    /// Time left until the session should be refreshed; zero when it already
    /// is (nearly) expired. `None` when the token never expires.
    pub fn refresh_delay(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        let at = self.expires_at? - Duration::seconds(REFRESH_MARGIN_SECS);
        if self.is_expired(now + Duration::seconds(REFRESH_MARGIN_SECS)) {
            return Some(std::time::Duration::ZERO);
        }
        (at - now).to_std().ok()
    }

    pub fn email(&self) -> &str {
        self.user.email.as_deref().unwrap_or("")
    }
}

/// Who is calling. Passed explicitly to every store and realtime call; the
/// user id doubles as the owner filter and owner assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub user_id: Uuid,
    pub access_token: String,
}

impl SessionContext {
    pub fn new(user_id: Uuid, access_token: impl Into<String>) -> Self {
        Self {
            user_id,
            access_token: access_token.into(),
        }
    }

    pub(crate) fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

/// Token grant body returned by sign-in, refresh and auto-confirmed sign-up.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: User,
}

impl TokenResponse {
    pub fn into_session(self, now: DateTime<Utc>) -> Session {
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => Utc.timestamp_opt(at, 0).single(),
            (None, Some(secs)) => Some(now + Duration::seconds(secs)),
            (None, None) => None,
        };
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}
