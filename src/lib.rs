//! Saturn auth proxy - authenticating reverse proxy for per-tenant workloads
//!
//! The proxy fronts a fleet of per-tenant backend services running inside a
//! Kubernetes namespace. Every inbound HTTP request is authenticated against
//! a session cookie, a post-login URL token, a long-lived bearer header, or a
//! refresh-token cookie, and then forwarded to the backend selected by the
//! request's virtual-host subdomain.
//!
//! # Architecture
//!
//! - Routing and session state is fed entirely from ConfigMap/Secret watch
//!   streams; nothing is persisted locally
//! - Login is federated to the external Atlas identity service; the proxy
//!   mints its own session and refresh cookies once Atlas hands a user back
//! - An optional HAProxy sidecar carries non-HTTP TCP/TLS workloads; the
//!   proxy renders its configuration and soft-reloads it on change
//!
//! # Modules
//!
//! - [`settings`] - Typed configuration snapshot loaded at startup
//! - [`token`] - JWT issuance/validation and the one-shot redirect-token registry
//! - [`session`] - Active proxy session membership
//! - [`routes`] - Hostname-prefix to upstream URL routing table
//! - [`auth_cache`] - TTL cache for validated bearer headers
//! - [`identity`] - HTTP client for the Atlas identity service
//! - [`dispatch`] - The per-request authentication state machine
//! - [`forward`] - Single-host reverse-proxy forwarder
//! - [`watch`] - ConfigMap/Secret watch streams feeding the registries
//! - [`tls`] - In-memory TLS secret store and certificate verification
//! - [`haproxy`] - TCP target registry and HAProxy configurator
//! - [`error`] - Error types surfaced by the dispatcher

#![deny(missing_docs)]

pub mod auth_cache;
pub mod dispatch;
pub mod error;
pub mod forward;
pub mod haproxy;
pub mod identity;
pub mod routes;
pub mod session;
pub mod settings;
pub mod tls;
pub mod token;
pub mod watch;

pub use error::AuthError;

/// Principal name of the external identity service in JWT issuer/audience
/// claims.
pub const ATLAS_PRINCIPAL: &str = "atlas";

/// Principal name of this proxy in JWT issuer/audience claims.
pub const PROXY_PRINCIPAL: &str = "saturn-auth-proxy";

/// Cookie carrying the steady-state session token.
pub const SATURN_TOKEN_COOKIE: &str = "saturn_token";

/// Cookie carrying the long-lived refresh token.
pub const REFRESH_TOKEN_COOKIE: &str = "refresh_token";
