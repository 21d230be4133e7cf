//! HTTP client for the Atlas identity service
//!
//! Two small endpoints are spoken:
//!
//! - **Refresh**: `POST <refreshURL>` with `{"refresh_token": "<jwt>"}`,
//!   answered with `{"saturn_token": "<jwt>"}`.
//! - **Token verify**: `GET <tokenURL>?targetResource=<key>` carrying the
//!   caller's `Authorization` header; 204 means the header is valid for the
//!   resource, anything else means it is not.
//!
//! The trait boundary exists so dispatcher tests can run against a mock
//! instead of a live identity service.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::header;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::settings::Settings;

/// Identity-service call failures
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The endpoint could not be reached or returned garbage
    #[error("identity service request failed: {0}")]
    Transport(String),

    /// The refresh endpoint answered without a usable token
    #[error("identity service returned no session token")]
    EmptyToken,
}

impl From<reqwest::Error> for IdentityError {
    fn from(e: reqwest::Error) -> Self {
        IdentityError::Transport(e.to_string())
    }
}

/// Refresh request body
#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Refresh response body
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    saturn_token: String,
}

/// Operations the dispatcher needs from the identity service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Exchange a refresh token for a fresh Atlas-signed session token
    async fn refresh_session(&self, refresh_token: &str) -> Result<String, IdentityError>;

    /// Check whether an `Authorization` header is valid for the target
    /// resource. `Ok(false)` is a definitive rejection; `Err` means the
    /// verdict could not be obtained at all.
    async fn verify_access_key(
        &self,
        target: &str,
        auth_header: &str,
    ) -> Result<bool, IdentityError>;
}

/// reqwest-backed client for the real identity service
pub struct AtlasClient {
    http: reqwest::Client,
    refresh_url: Url,
    token_url: Url,
}

impl AtlasClient {
    /// Build the client from the loaded settings
    pub fn new(settings: &Settings) -> Result<Self, IdentityError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| IdentityError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            refresh_url: settings.urls.refresh.clone(),
            token_url: settings.urls.token.clone(),
        })
    }
}

#[async_trait]
impl IdentityService for AtlasClient {
    async fn refresh_session(&self, refresh_token: &str) -> Result<String, IdentityError> {
        debug!("Found refresh_token, proxying authentication request");
        let response: RefreshResponse = self
            .http
            .post(self.refresh_url.clone())
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?
            .json()
            .await?;

        if response.saturn_token.is_empty() {
            return Err(IdentityError::EmptyToken);
        }
        Ok(response.saturn_token)
    }

    async fn verify_access_key(
        &self,
        target: &str,
        auth_header: &str,
    ) -> Result<bool, IdentityError> {
        let mut url = self.token_url.clone();
        url.query_pairs_mut().append_pair("targetResource", target);

        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, auth_header)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(true);
        }
        info!(
            status = response.status().as_u16(),
            target = %target,
            "Rejecting token"
        );
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_request_serializes_the_expected_shape() {
        let body = serde_json::to_string(&RefreshRequest {
            refresh_token: "abc",
        })
        .unwrap();
        assert_eq!(body, r#"{"refresh_token":"abc"}"#);
    }

    #[test]
    fn refresh_response_tolerates_missing_token() {
        let response: RefreshResponse = serde_json::from_str("{}").unwrap();
        assert!(response.saturn_token.is_empty());

        let response: RefreshResponse =
            serde_json::from_str(r#"{"saturn_token":"jwt"}"#).unwrap();
        assert_eq!(response.saturn_token, "jwt");
    }
}
