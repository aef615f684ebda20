//! Identity provider abstraction and the HTTP-backed implementation.
//!
//! The session manager never talks to an auth backend directly; it goes
//! through [`IdentityProvider`] so hosts can plug in whatever backend they
//! authenticate against. [`HttpIdentityProvider`] covers the common case of
//! a cookie-less JSON API with bearer tokens.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use tether_shared::{ProviderSession, SessionError};

/// Backend operations the session manager depends on.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Fetch the currently persisted session, if the backend has one.
    async fn current_session(&self) -> Result<Option<ProviderSession>, SessionError>;

    /// Exchange the refresh token for a new session.
    async fn refresh_session(&self) -> Result<ProviderSession, SessionError>;

    /// Invalidate the session server side. Best effort; local state is
    /// cleared regardless of the outcome.
    async fn sign_out(&self) -> Result<(), SessionError>;
}

/// [`IdentityProvider`] over a JSON HTTP API.
///
/// Endpoints:
/// - `GET  /api/session` with a bearer token; 401/404 mean no session
/// - `POST /api/session/refresh` with `{"refreshToken": ...}`
/// - `POST /api/logout` with a bearer token
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    base_url: String,
    tokens: Mutex<Option<(String, String)>>,
}

impl HttpIdentityProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            tokens: Mutex::new(None),
        }
    }

    /// Seed access/refresh tokens, e.g. restored from host storage.
    pub fn with_tokens(
        self,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        *self.tokens.lock().expect("token store poisoned") =
            Some((access_token.into(), refresh_token.into()));
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn access_token(&self) -> Option<String> {
        self.tokens
            .lock()
            .expect("token store poisoned")
            .as_ref()
            .map(|(access, _)| access.clone())
    }

    fn refresh_token(&self) -> Option<String> {
        self.tokens
            .lock()
            .expect("token store poisoned")
            .as_ref()
            .map(|(_, refresh)| refresh.clone())
    }

    fn store_tokens(&self, session: &ProviderSession) {
        *self.tokens.lock().expect("token store poisoned") = Some((
            session.access_token.clone(),
            session.refresh_token.clone(),
        ));
    }

    fn clear_tokens(&self) {
        *self.tokens.lock().expect("token store poisoned") = None;
    }

    async fn decode_session(response: reqwest::Response) -> Result<ProviderSession, SessionError> {
        response
            .json::<ProviderSession>()
            .await
            .map_err(|e| SessionError::Decode(e.to_string()))
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn current_session(&self) -> Result<Option<ProviderSession>, SessionError> {
        let Some(access) = self.access_token() else {
            return Ok(None);
        };
        let response = self
            .client
            .get(self.endpoint("/api/session"))
            .bearer_auth(access)
            .send()
            .await
            .map_err(|e| SessionError::Network(e.to_string()))?;

        match response.status().as_u16() {
            200 => Ok(Some(Self::decode_session(response).await?)),
            401 | 404 => Ok(None),
            status => Err(SessionError::Http {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn refresh_session(&self) -> Result<ProviderSession, SessionError> {
        let Some(refresh) = self.refresh_token() else {
            return Err(SessionError::NoTokens);
        };
        let response = self
            .client
            .post(self.endpoint("/api/session/refresh"))
            .json(&json!({ "refreshToken": refresh }))
            .send()
            .await
            .map_err(|e| SessionError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SessionError::Http {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let session = Self::decode_session(response).await?;
        self.store_tokens(&session);
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), SessionError> {
        let access = self.access_token();
        self.clear_tokens();
        let Some(access) = access else {
            return Ok(());
        };
        let response = self
            .client
            .post(self.endpoint("/api/logout"))
            .bearer_auth(access)
            .send()
            .await
            .map_err(|e| SessionError::Network(e.to_string()))?;

        if response.status().is_success() || response.status().as_u16() == 401 {
            Ok(())
        } else {
            Err(SessionError::Http {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}
