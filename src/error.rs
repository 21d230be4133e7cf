//! Error types surfaced by the request dispatcher
//!
//! Authentication and routing failures all funnel into [`AuthError`], which
//! renders the canonical HTML error page when converted into a response.
//! The diagnostic detail stays in the `Display` output (and therefore the
//! logs); clients only ever see the generic page text.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::info;

/// Result type for dispatcher operations
pub type Result<T> = std::result::Result<T, AuthError>;

/// Error type covering every failure the dispatcher can observe
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Token signature verification failed or the token is malformed
    #[error("invalid token: {0}")]
    TokenInvalid(String),

    /// Token expiration is in the past
    #[error("token expired")]
    TokenExpired,

    /// Token carries no issuer claim
    #[error("invalid token, missing issuer")]
    IssuerMissing,

    /// Token issuer does not match the expected principal
    #[error("invalid token issuer")]
    IssuerMismatch,

    /// Token audience is not this proxy
    #[error("invalid token audience")]
    AudienceMismatch,

    /// Token resource claim does not match the requested host
    #[error("token is not valid for the requested host")]
    ResourceMismatch,

    /// Token subject has no active proxy session
    #[error("invalid session, user is not logged in")]
    SessionUnknown,

    /// Redirect token was never issued or was already consumed
    #[error("invalid redirect token")]
    RedirectTokenUnknown,

    /// Identity service rejected the bearer header for this resource
    #[error("bearer token rejected for this resource")]
    BearerRejected,

    /// No upstream is configured for the requested host
    #[error("no upstream for host {0}")]
    UpstreamUnknown(String),

    /// Session cookies could not be issued
    #[error("failed to issue cookies: {0}")]
    CookieIssue(String),

    /// Token-verify endpoint could not be reached
    #[error("token verification unavailable: {0}")]
    VerifyUnavailable(String),

    /// Forwarding the request to the upstream failed
    #[error("upstream request failed: {0}")]
    Proxy(String),
}

impl AuthError {
    /// HTTP status this error surfaces as
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::TokenInvalid(_)
            | AuthError::TokenExpired
            | AuthError::IssuerMissing
            | AuthError::IssuerMismatch
            | AuthError::AudienceMismatch
            | AuthError::ResourceMismatch
            | AuthError::SessionUnknown
            | AuthError::RedirectTokenUnknown => StatusCode::UNAUTHORIZED,
            AuthError::BearerRejected => StatusCode::FORBIDDEN,
            AuthError::UpstreamUnknown(_) => StatusCode::BAD_REQUEST,
            AuthError::CookieIssue(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AuthError::VerifyUnavailable(_) | AuthError::Proxy(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Page text shown to the client
    ///
    /// Token failures deliberately collapse into one message so the page
    /// does not leak which validation step rejected the token.
    fn client_message(&self) -> &'static str {
        match self {
            AuthError::TokenInvalid(_)
            | AuthError::TokenExpired
            | AuthError::IssuerMissing
            | AuthError::IssuerMismatch
            | AuthError::AudienceMismatch
            | AuthError::ResourceMismatch
            | AuthError::SessionUnknown
            | AuthError::RedirectTokenUnknown => "Invalid token.",
            AuthError::BearerRejected => "This token is not valid for this resource.",
            AuthError::UpstreamUnknown(_) => "Unable to route request to a valid resource.",
            AuthError::CookieIssue(_) => "An internal error has occurred.",
            AuthError::VerifyUnavailable(_) | AuthError::Proxy(_) => {
                "Unable to reach the upstream service."
            }
        }
    }
}

/// Render a styled HTML error page
fn error_page(status: StatusCode, message: &str) -> String {
    format!(
        "<html><head><title>{code}</title></head>\
         <body>Error {code}: {message}</body></html>",
        code = status.as_u16(),
        message = message,
    )
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        info!(status = status.as_u16(), error = %self, "Request rejected");

        // The bearer rejection is plain text; everything else gets the page.
        if matches!(self, AuthError::BearerRejected) {
            return (status, self.client_message().to_string()).into_response();
        }

        (
            status,
            [(header::CONTENT_TYPE, "text/html;charset=utf-8")],
            error_page(status, self.client_message()),
        )
            .into_response()
    }
}
