//! JWT issuance and validation, session cookies, and the redirect-token
//! registry
//!
//! Two token families flow through the proxy:
//!
//! - **Session tokens** (`saturn_token`): issuer and audience are both this
//!   proxy, signed with the process-private JWT key.
//! - **Refresh tokens** (`refresh_token`): issued by this proxy *for* the
//!   identity service (audience `atlas`), signed with the shared federation
//!   key so Atlas can verify them. Tokens coming back from Atlas are also
//!   signed with the shared key.
//!
//! The signing contracts are deliberately independent: leaking the
//! process-private key must not let anyone forge federation tokens, and
//! vice versa.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cookie::Cookie;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AuthError;
use crate::session::SessionRegistry;
use crate::settings::Settings;
use crate::{ATLAS_PRINCIPAL, PROXY_PRINCIPAL, REFRESH_TOKEN_COOKIE, SATURN_TOKEN_COOKIE};

/// Alphabet for generated keys and nonces.
const TOKEN_LETTERS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz-";

/// Length of redirect-token nonces.
const REDIRECT_TOKEN_LENGTH: usize = 40;

/// Generate a random token of `len` characters from `[0-9A-Za-z-]`.
pub fn random_token(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| TOKEN_LETTERS[rng.random_range(0..TOKEN_LETTERS.len())] as char)
        .collect()
}

/// JWT payload for both token families
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SaturnClaims {
    /// Audience principal
    #[serde(default)]
    pub aud: String,
    /// Expiration, seconds since the Unix epoch
    #[serde(default)]
    pub exp: i64,
    /// Issuer principal
    #[serde(default)]
    pub iss: String,
    /// Subject (proxy session identifier)
    #[serde(default)]
    pub sub: String,
    /// Host the token is valid for
    #[serde(default)]
    pub resource: String,
    /// One-shot nonce tying a login redirect to its completion request
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub redirect_token: String,
}

/// One-shot registry of outstanding login redirect nonces.
///
/// A nonce is inserted when the proxy redirects a browser to the login page
/// and consumed exactly once when the browser returns with it embedded in an
/// Atlas-signed token. The registry is process-local by design; a
/// multi-instance deployment needs sticky routing or an external store.
#[derive(Debug, Default)]
pub struct RedirectTokens {
    tokens: Mutex<HashSet<String>>,
}

impl RedirectTokens {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh nonce and register it
    pub fn issue(&self) -> String {
        let nonce = random_token(REDIRECT_TOKEN_LENGTH);
        self.tokens.lock().unwrap().insert(nonce.clone());
        debug!(token = %nonce, "Added redirect token");
        nonce
    }

    /// Consume a nonce, returning whether it was outstanding
    pub fn remove_if_present(&self, nonce: &str) -> bool {
        let removed = self.tokens.lock().unwrap().remove(nonce);
        if removed {
            debug!(token = %nonce, "Consumed redirect token");
        }
        removed
    }

    /// Number of outstanding nonces
    pub fn len(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    /// Whether no nonces are outstanding
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keys for one signing direction
struct KeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl KeyPair {
    fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }
}

/// Issues and validates both token families
pub struct TokenService {
    shared: KeyPair,
    jwt: KeyPair,
    saturn_token_expiration: ChronoDuration,
    refresh_token_expiration: ChronoDuration,
    sessions: Arc<SessionRegistry>,
    /// Outstanding login nonces
    pub redirect_tokens: RedirectTokens,
}

impl TokenService {
    /// Build the service from the loaded settings
    pub fn new(settings: &Settings, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            shared: KeyPair::from_secret(&settings.shared_key),
            jwt: KeyPair::from_secret(&settings.jwt_key),
            saturn_token_expiration: ChronoDuration::from_std(settings.saturn_token_expiration)
                .unwrap_or_else(|_| ChronoDuration::hours(1)),
            refresh_token_expiration: ChronoDuration::from_std(settings.refresh_token_expiration)
                .unwrap_or_else(|_| ChronoDuration::hours(24)),
            sessions,
            redirect_tokens: RedirectTokens::new(),
        }
    }

    /// Create a JWT for proxy authentication (`refresh: false`) or for
    /// presentation to the identity service (`refresh: true`).
    ///
    /// Refresh tokens carry the `atlas` audience, which makes them useless
    /// for authenticating against the proxy itself.
    pub fn create_token(
        &self,
        host: &str,
        subject: &str,
        expires_at: DateTime<Utc>,
        refresh: bool,
    ) -> Result<String, AuthError> {
        let (audience, key) = if refresh {
            (ATLAS_PRINCIPAL, &self.shared.encoding)
        } else {
            (PROXY_PRINCIPAL, &self.jwt.encoding)
        };
        let claims = SaturnClaims {
            aud: audience.to_string(),
            exp: expires_at.timestamp(),
            iss: PROXY_PRINCIPAL.to_string(),
            sub: subject.to_string(),
            resource: host.to_string(),
            redirect_token: String::new(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, key)
            .map_err(|e| AuthError::CookieIssue(e.to_string()))
    }

    /// Validate a token against the expected issuer and the request host.
    ///
    /// Key selection follows the issuer: Atlas-issued tokens verify against
    /// the shared federation key, proxy-issued tokens against the private
    /// JWT key. The claim checks run in a fixed order so each failure maps
    /// onto a single error variant.
    pub fn validate(
        &self,
        token: &str,
        expected_issuer: &str,
        host: &str,
    ) -> Result<SaturnClaims, AuthError> {
        let key = if expected_issuer == ATLAS_PRINCIPAL {
            &self.shared.decoding
        } else {
            &self.jwt.decoding
        };

        // exp/aud/iss are checked explicitly below so every rejection gets
        // its own variant instead of the library's blanket error.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let claims = decode::<SaturnClaims>(token, key, &validation)
            .map_err(|e| AuthError::TokenInvalid(e.to_string()))?
            .claims;

        if claims.iss.is_empty() {
            return Err(AuthError::IssuerMissing);
        }
        if claims.iss != expected_issuer {
            return Err(AuthError::IssuerMismatch);
        }
        if claims.aud != PROXY_PRINCIPAL {
            return Err(AuthError::AudienceMismatch);
        }
        if claims.resource != host {
            return Err(AuthError::ResourceMismatch);
        }
        if claims.exp < Utc::now().timestamp() {
            return Err(AuthError::TokenExpired);
        }
        if !self.sessions.contains(&claims.sub) {
            return Err(AuthError::SessionUnknown);
        }
        Ok(claims)
    }

    /// Mint the `refresh_token` and `saturn_token` cookie pair for a session.
    ///
    /// `cap` bounds the session cookie's lifetime to the expiration of the
    /// Atlas token that authorized it, so the proxy never extends what the
    /// identity service granted.
    pub fn session_cookies(
        &self,
        host: &str,
        subject: &str,
        cap: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, AuthError> {
        let now = Utc::now();

        let refresh_expires = now + self.refresh_token_expiration;
        let refresh_token = self.create_token(host, subject, refresh_expires, true)?;

        let mut saturn_expires = now + self.saturn_token_expiration;
        if let Some(cap) = cap {
            saturn_expires = saturn_expires.min(cap);
        }
        let saturn_token = self.create_token(host, subject, saturn_expires, false)?;

        Ok(vec![
            build_cookie(REFRESH_TOKEN_COOKIE, &refresh_token, refresh_expires - now),
            build_cookie(SATURN_TOKEN_COOKIE, &saturn_token, saturn_expires - now),
        ])
    }
}

/// Build a `Set-Cookie` header value with `Path=/` and a max-age
fn build_cookie(name: &str, value: &str, ttl: ChronoDuration) -> String {
    Cookie::build((name, value))
        .path("/")
        .max_age(cookie::time::Duration::seconds(ttl.num_seconds()))
        .build()
        .to_string()
}
