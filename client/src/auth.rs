//! Password authentication against the hosted auth service.
//!
//! The current session lives in memory only. Interested parties observe it
//! through [`AuthClient::on_session_change`] instead of a registered callback.

use chrono::Utc;
use log::{info, warn};
use reqwest::header::AUTHORIZATION;
use serde::Serialize;
use tokio::sync::watch;

use crate::config::ClientConfig;
use crate::error::{response_message, ClientError, Result};
use crate::session::{Session, SessionContext, TokenResponse};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignUpOutcome {
    /// The backend auto-confirmed the account and issued a session.
    SignedIn(Session),
    /// A confirmation email was sent; no session yet.
    ConfirmationRequired { email: String },
}

#[derive(Serialize)]
struct Credentials<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshGrant<'a> {
    refresh_token: &'a str,
}

pub struct AuthClient {
    http: reqwest::Client,
    config: ClientConfig,
    session: watch::Sender<Option<Session>>,
}

impl AuthClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_http(config, reqwest::Client::new())
    }

    pub fn with_http(config: ClientConfig, http: reqwest::Client) -> Self {
        let (session, _) = watch::channel(None);
        Self {
            http,
            config,
            session,
        }
    }

    pub fn current_session(&self) -> Option<Session> {
        self.session.borrow().clone()
    }

    /// Context for store calls, or `NoSession` when signed out.
    pub fn context(&self) -> Result<SessionContext> {
        self.session
            .borrow()
            .as_ref()
            .map(Session::context)
            .ok_or(ClientError::NoSession)
    }

    pub fn on_session_change(&self) -> watch::Receiver<Option<Session>> {
        self.session.subscribe()
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let credentials = credentials(email, password)?;
        let url = self.config.auth_url("token")?;
        let response = self
            .http
            .post(url)
            .query(&[("grant_type", "password")])
            .header("apikey", &self.config.anon_key)
            .json(&credentials)
            .send()
            .await
            .map_err(|e| ClientError::Auth(e.to_string()))?;
        let session = self.session_from(response).await?;
        info!("signed in as {}", session.email());
        self.session.send_replace(Some(session.clone()));
        Ok(session)
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpOutcome> {
        let credentials = credentials(email, password)?;
        let url = self.config.auth_url("signup")?;
        let response = self
            .http
            .post(url)
            .header("apikey", &self.config.anon_key)
            .json(&credentials)
            .send()
            .await
            .map_err(|e| ClientError::Auth(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ClientError::Auth(response_message(response).await));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ClientError::Auth(format!("unexpected sign-up response: {e}")))?;

        if body.get("access_token").is_none() {
            info!("sign-up for {} awaits email confirmation", credentials.email);
            return Ok(SignUpOutcome::ConfirmationRequired {
                email: credentials.email.to_string(),
            });
        }
        let token: TokenResponse = serde_json::from_value(body)
            .map_err(|e| ClientError::Auth(format!("unexpected sign-up response: {e}")))?;
        let session = token.into_session(Utc::now());
        info!("signed up and signed in as {}", session.email());
        self.session.send_replace(Some(session.clone()));
        Ok(SignUpOutcome::SignedIn(session))
    }

    /// Ends the session. The local session is cleared even when the backend
    /// call fails; the failure is still reported.
    pub async fn sign_out(&self) -> Result<()> {
        let Some(session) = self.session.send_replace(None) else {
            return Ok(());
        };
        let url = self.config.auth_url("logout")?;
        let response = self
            .http
            .post(url)
            .header("apikey", &self.config.anon_key)
            .header(AUTHORIZATION, session.context().bearer())
            .send()
            .await
            .map_err(|e| ClientError::Auth(e.to_string()))?;
        if !response.status().is_success() {
            let message = response_message(response).await;
            warn!("sign-out rejected: {message}");
            return Err(ClientError::Auth(message));
        }
        info!("signed out {}", session.email());
        Ok(())
    }

    /// Exchanges the refresh token for a new session.
    pub async fn refresh(&self) -> Result<Session> {
        let current = self.current_session().ok_or(ClientError::NoSession)?;
        let url = self.config.auth_url("token")?;
        let response = self
            .http
            .post(url)
            .query(&[("grant_type", "refresh_token")])
            .header("apikey", &self.config.anon_key)
            .json(&RefreshGrant {
                refresh_token: &current.refresh_token,
            })
            .send()
            .await
            .map_err(|e| ClientError::Auth(e.to_string()))?;
        let session = self.session_from(response).await?;
        self.session.send_replace(Some(session.clone()));
        Ok(session)
    }

    async fn session_from(&self, response: reqwest::Response) -> Result<Session> {
        if !response.status().is_success() {
            return Err(ClientError::Auth(response_message(response).await));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Auth(format!("unexpected token response: {e}")))?;
        Ok(token.into_session(Utc::now()))
    }
}

fn credentials<'a>(email: &'a str, password: &'a str) -> Result<Credentials<'a>> {
    let email = email.trim();
    if email.is_empty() {
        return Err(ClientError::Auth("email is required".into()));
    }
    if password.is_empty() {
        return Err(ClientError::Auth("password is required".into()));
    }
    Ok(Credentials { email, password })
}
