//! The per-request authentication state machine
//!
//! Every inbound request runs through the same ordered checks:
//!
//! 1. `Authorization` header - fixed bearer keys for automation, verified
//!    against the identity service and remembered in the bearer cache.
//! 2. `saturn_token` URL parameter - the browser returning from a login
//!    redirect with an Atlas-signed token; consumed exactly once via the
//!    redirect-token registry, answered with cookies and a self-redirect
//!    that scrubs the token from the URL.
//! 3. `saturn_token` cookie - the steady state; a valid session cookie goes
//!    straight to routing.
//! 4. `refresh_token` cookie - silent reauth through the identity service;
//!    on success the request continues to the upstream in the same cycle
//!    with fresh cookies attached.
//!
//! Anything else is redirected to the login page with a fresh one-shot
//! redirect token.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use chrono::DateTime;
use cookie::Cookie;
use tracing::{debug, info};
use url::form_urlencoded;

use crate::auth_cache::{cache_key, BearerCache};
use crate::error::AuthError;
use crate::forward::Forwarder;
use crate::identity::IdentityService;
use crate::routes::{target_key, HttpRoutes};
use crate::settings::Settings;
use crate::token::TokenService;
use crate::{ATLAS_PRINCIPAL, PROXY_PRINCIPAL, REFRESH_TOKEN_COOKIE, SATURN_TOKEN_COOKIE};

/// Shared state for the dispatcher
#[derive(Clone)]
pub struct AppState {
    /// Immutable runtime configuration
    pub settings: Arc<Settings>,
    /// Token issuance/validation
    pub tokens: Arc<TokenService>,
    /// Hostname-prefix routing table
    pub routes: Arc<HttpRoutes>,
    /// Verified bearer headers
    pub bearer_cache: Arc<BearerCache>,
    /// Identity-service client
    pub identity: Arc<dyn IdentityService>,
    /// Upstream forwarder
    pub forwarder: Arc<Forwarder>,
}

/// Build the proxy router: every path lands in the dispatcher
pub fn router(state: AppState) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

/// Entry point for every inbound request
async fn dispatch(State(state): State<AppState>, req: Request<Body>) -> Response<Body> {
    match handle(&state, req).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle(state: &AppState, req: Request<Body>) -> Result<Response<Body>, AuthError> {
    let host = request_host(&req);

    // 1. Bearer-header path
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    if let Some(auth_header) = auth_header {
        check_bearer(state, &host, &auth_header).await?;
        return route_and_forward(state, &host, req, Vec::new()).await;
    }

    // 2. Post-login handoff path
    if let Some(url_token) =
        query_param(req.uri(), SATURN_TOKEN_COOKIE).filter(|token| !token.is_empty())
    {
        return complete_login(state, &host, req.uri(), &url_token);
    }

    // 3. Steady-state cookie path
    let cookies = parse_cookies(req.headers());
    if let Some(saturn_token) = cookies.get(SATURN_TOKEN_COOKIE) {
        match state.tokens.validate(saturn_token, PROXY_PRINCIPAL, &host) {
            Ok(_) => return route_and_forward(state, &host, req, Vec::new()).await,
            Err(e) => info!(error = %e, "Invalid cookie"),
        }
    }

    // 4. Silent reauth path. Every failure here has a safe fallback: the
    // login redirect below.
    if let Some(refresh_token) = cookies.get(REFRESH_TOKEN_COOKIE) {
        match refresh_session(state, &host, refresh_token).await {
            Ok(set_cookies) => return route_and_forward(state, &host, req, set_cookies).await,
            Err(e) => info!(error = %e, "Authentication failed"),
        }
    }

    login_redirect(state, &host, req.uri())
}

/// Bearer path: cache hit, or a round trip to the identity service.
///
/// A definitive rejection is a 403; an unreachable verification endpoint
/// fails the request loudly as a 502 (there is no safe fallback for bearer
/// callers).
async fn check_bearer(state: &AppState, host: &str, auth_header: &str) -> Result<(), AuthError> {
    let target = target_key(host, &state.settings.common_suffix);
    let key = cache_key(&target, auth_header);

    if state.bearer_cache.contains(&key) {
        debug!(target = %target, "Valid bearer cache hit");
        return Ok(());
    }

    let valid = state
        .identity
        .verify_access_key(&target, auth_header)
        .await
        .map_err(|e| AuthError::VerifyUnavailable(e.to_string()))?;
    if !valid {
        return Err(AuthError::BearerRejected);
    }

    info!(target = %target, "Caching verified bearer token");
    state.bearer_cache.insert(key);
    Ok(())
}

/// Post-login handoff: validate the Atlas token, consume its one-shot
/// redirect nonce, issue cookies, and bounce back to the same URL with the
/// token scrubbed from the query string.
fn complete_login(
    state: &AppState,
    host: &str,
    uri: &Uri,
    url_token: &str,
) -> Result<Response<Body>, AuthError> {
    let claims = state.tokens.validate(url_token, ATLAS_PRINCIPAL, host)?;

    if !state
        .tokens
        .redirect_tokens
        .remove_if_present(&claims.redirect_token)
    {
        return Err(AuthError::RedirectTokenUnknown);
    }

    let cap = DateTime::from_timestamp(claims.exp, 0);
    let set_cookies = state.tokens.session_cookies(host, &claims.sub, cap)?;

    let location = strip_query_param(uri, SATURN_TOKEN_COOKIE);
    info!(location = %location, "Login complete, redirecting to self");
    redirect(&location, set_cookies)
}

/// Silent reauth: exchange the refresh cookie for a fresh Atlas token and
/// mint new session cookies from it.
async fn refresh_session(
    state: &AppState,
    host: &str,
    refresh_token: &str,
) -> Result<Vec<String>, AuthError> {
    let saturn_token = state
        .identity
        .refresh_session(refresh_token)
        .await
        .map_err(|e| AuthError::TokenInvalid(e.to_string()))?;

    let claims = state.tokens.validate(&saturn_token, ATLAS_PRINCIPAL, host)?;
    let cap = DateTime::from_timestamp(claims.exp, 0);
    state.tokens.session_cookies(host, &claims.sub, cap)
}

/// Redirect to the login page with a freshly registered one-shot nonce
fn login_redirect(state: &AppState, host: &str, uri: &Uri) -> Result<Response<Body>, AuthError> {
    let orig_url = format!(
        "{}://{}{}",
        state.settings.self_scheme(),
        host,
        request_uri(uri)
    );
    let nonce = state.tokens.redirect_tokens.issue();

    let mut login = state.settings.urls.login.clone();
    login
        .query_pairs_mut()
        .append_pair("next", &orig_url)
        .append_pair("redirect_token", &nonce);

    info!(url = %login, "Redirecting to login");
    redirect(login.as_str(), Vec::new())
}

/// Resolve the upstream and forward, attaching any freshly minted cookies
/// to the proxied response
async fn route_and_forward(
    state: &AppState,
    host: &str,
    req: Request<Body>,
    set_cookies: Vec<String>,
) -> Result<Response<Body>, AuthError> {
    let key = target_key(host, &state.settings.common_suffix);
    let Some(upstream) = state.routes.target(&key) else {
        info!(host = %host, "Unknown target url");
        return Err(AuthError::UpstreamUnknown(host.to_string()));
    };

    let mut response = state.forwarder.forward(&upstream, host, req).await?;
    append_cookies(&mut response, set_cookies)?;
    debug!(upstream = %upstream, "Proxied request");
    Ok(response)
}

/// 302 with `Cache-Control: no-cache` and any session cookies
fn redirect(location: &str, set_cookies: Vec<String>) -> Result<Response<Body>, AuthError> {
    let mut response = Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::empty())
        .map_err(|e| AuthError::Proxy(e.to_string()))?;
    append_cookies(&mut response, set_cookies)?;
    Ok(response)
}

fn append_cookies(
    response: &mut Response<Body>,
    set_cookies: Vec<String>,
) -> Result<(), AuthError> {
    for value in set_cookies {
        let value =
            HeaderValue::from_str(&value).map_err(|e| AuthError::CookieIssue(e.to_string()))?;
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    Ok(())
}

/// The `Host` the client addressed, as seen by this proxy
fn request_host(req: &Request<Body>) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

/// Path plus query, as the client sent it
fn request_uri(uri: &Uri) -> &str {
    uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
}

/// First value of a query parameter
fn query_param(uri: &Uri, name: &str) -> Option<String> {
    form_urlencoded::parse(uri.query()?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Rebuild the relative URL with one query parameter removed
fn strip_query_param(uri: &Uri, name: &str) -> String {
    let remaining: Vec<(String, String)> = uri
        .query()
        .map(|query| {
            form_urlencoded::parse(query.as_bytes())
                .filter(|(key, _)| key != name)
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect()
        })
        .unwrap_or_default();

    if remaining.is_empty() {
        return uri.path().to_string();
    }
    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(remaining)
        .finish();
    format!("{}?{}", uri.path(), query)
}

/// All cookies from the request headers
fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(|cookie| cookie.ok())
        .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MockIdentityService;
    use crate::session::SessionRegistry;
    use crate::settings::{SettingsEnv, SettingsFile, KEY_LENGTH};
    use crate::token::SaturnClaims;
    use chrono::{Duration as ChronoDuration, Utc};
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use tower::ServiceExt;

    const HOST: &str = "app.localtest.me";
    const SHARED_KEY_BYTE: &str = "s";

    struct Harness {
        state: AppState,
        sessions: Arc<SessionRegistry>,
    }

    fn harness(identity: MockIdentityService) -> Harness {
        let env = SettingsEnv {
            shared_key: Some(SHARED_KEY_BYTE.repeat(KEY_LENGTH)),
            namespace: None,
        };
        let settings = Arc::new(Settings::from_file(SettingsFile::default(), env).unwrap());

        let sessions = Arc::new(SessionRegistry::new());
        sessions.load([("u1".to_string(), String::new())].into_iter().collect());

        let state = AppState {
            tokens: Arc::new(TokenService::new(&settings, sessions.clone())),
            routes: Arc::new(HttpRoutes::new()),
            bearer_cache: Arc::new(BearerCache::new(settings.access_key_expiration)),
            identity: Arc::new(identity),
            forwarder: Arc::new(Forwarder::new().unwrap()),
            settings,
        };
        Harness { state, sessions }
    }

    /// Upstream that echoes the forwarded-host header back in its body
    async fn spawn_upstream() -> String {
        let app = Router::new().fallback(|req: Request<Body>| async move {
            let forwarded_host = req
                .headers()
                .get("x-forwarded-host")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            format!("upstream saw {}", forwarded_host)
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// Atlas-signed token, as the identity service would mint it
    fn atlas_token(subject: &str, resource: &str, redirect_token: &str) -> String {
        let claims = SaturnClaims {
            aud: PROXY_PRINCIPAL.to_string(),
            exp: (Utc::now() + ChronoDuration::hours(1)).timestamp(),
            iss: ATLAS_PRINCIPAL.to_string(),
            sub: subject.to_string(),
            resource: resource.to_string(),
            redirect_token: redirect_token.to_string(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SHARED_KEY_BYTE.repeat(KEY_LENGTH).as_bytes()),
        )
        .unwrap()
    }

    fn get(uri: &str) -> axum::http::request::Builder {
        Request::builder().method("GET").uri(uri).header(header::HOST, HOST)
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    // =========================================================================
    // Login redirect
    // =========================================================================

    #[tokio::test]
    async fn anonymous_requests_redirect_to_login() {
        let h = harness(MockIdentityService::new());
        let app = router(h.state.clone());

        let response = app
            .oneshot(get("/path").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache"
        );

        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        let location = url::Url::parse(location).unwrap();
        assert!(location
            .as_str()
            .starts_with(h.state.settings.urls.login.as_str()));

        let params: HashMap<String, String> = location
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(params["next"], format!("http://{}/path", HOST));
        assert_eq!(params["redirect_token"].len(), 40);

        // The nonce is registered for the return trip.
        assert_eq!(h.state.tokens.redirect_tokens.len(), 1);
        assert!(h
            .state
            .tokens
            .redirect_tokens
            .remove_if_present(&params["redirect_token"]));
    }

    // =========================================================================
    // Steady-state cookie flow
    // =========================================================================

    #[tokio::test]
    async fn valid_session_cookie_is_proxied_upstream() {
        let h = harness(MockIdentityService::new());
        let upstream = spawn_upstream().await;
        h.state
            .routes
            .load([("app".to_string(), upstream)].into_iter().collect());

        let cookies = h.state.tokens.session_cookies(HOST, "u1", None).unwrap();
        let saturn = Cookie::parse(cookies[1].clone()).unwrap();

        let app = router(h.state.clone());
        let response = app
            .oneshot(
                get("/data")
                    .header(
                        header::COOKIE,
                        format!("{}={}", SATURN_TOKEN_COOKIE, saturn.value()),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, format!("upstream saw {}", HOST));
    }

    #[tokio::test]
    async fn unroutable_hosts_get_a_400() {
        let h = harness(MockIdentityService::new());
        let cookies = h.state.tokens.session_cookies(HOST, "u1", None).unwrap();
        let saturn = Cookie::parse(cookies[1].clone()).unwrap();

        let app = router(h.state.clone());
        let response = app
            .oneshot(
                get("/data")
                    .header(
                        header::COOKIE,
                        format!("{}={}", SATURN_TOKEN_COOKIE, saturn.value()),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response)
            .await
            .contains("Unable to route request to a valid resource."));
    }

    #[tokio::test]
    async fn revoked_sessions_fall_back_to_login() {
        let h = harness(MockIdentityService::new());
        let cookies = h.state.tokens.session_cookies(HOST, "u1", None).unwrap();
        let saturn = Cookie::parse(cookies[1].clone()).unwrap();

        // The control plane revokes the session after the cookie was minted.
        h.sessions.clear();

        let app = router(h.state.clone());
        let response = app
            .oneshot(
                get("/data")
                    .header(
                        header::COOKIE,
                        format!("{}={}", SATURN_TOKEN_COOKIE, saturn.value()),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(location.starts_with(h.state.settings.urls.login.as_str()));
    }

    // =========================================================================
    // Login handoff
    // =========================================================================

    #[tokio::test]
    async fn login_handoff_sets_cookies_and_scrubs_the_url() {
        let h = harness(MockIdentityService::new());
        let nonce = h.state.tokens.redirect_tokens.issue();
        let token = atlas_token("u1", HOST, &nonce);

        let app = router(h.state.clone());
        let response = app
            .oneshot(
                get(&format!("/page?saturn_token={}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/page");
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache"
        );

        let set_cookies: Vec<Cookie<'_>> = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| Cookie::parse(v.to_str().unwrap()).unwrap())
            .collect();
        assert_eq!(set_cookies.len(), 2);
        assert_eq!(set_cookies[0].name(), REFRESH_TOKEN_COOKIE);
        assert_eq!(set_cookies[1].name(), SATURN_TOKEN_COOKIE);

        // The session cookie round-trips through validation.
        h.state
            .tokens
            .validate(set_cookies[1].value(), PROXY_PRINCIPAL, HOST)
            .unwrap();

        // The nonce is gone.
        assert!(h.state.tokens.redirect_tokens.is_empty());
    }

    #[tokio::test]
    async fn handoff_preserves_other_query_parameters() {
        let h = harness(MockIdentityService::new());
        let nonce = h.state.tokens.redirect_tokens.issue();
        let token = atlas_token("u1", HOST, &nonce);

        let app = router(h.state.clone());
        let response = app
            .oneshot(
                get(&format!("/page?a=1&saturn_token={}&b=2", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(location.starts_with("/page?"));
        assert!(location.contains("a=1"));
        assert!(location.contains("b=2"));
        assert!(!location.contains("saturn_token"));
    }

    #[tokio::test]
    async fn unknown_redirect_tokens_are_rejected() {
        let h = harness(MockIdentityService::new());
        // Never registered with the proxy.
        let token = atlas_token("u1", HOST, "Rogue-nonce-that-was-never-issued-000000");

        let app = router(h.state.clone());
        let response = app
            .oneshot(
                get(&format!("/page?saturn_token={}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(body_string(response).await.contains("Invalid token."));
    }

    #[tokio::test]
    async fn replayed_login_urls_are_rejected() {
        let h = harness(MockIdentityService::new());
        let nonce = h.state.tokens.redirect_tokens.issue();
        let token = atlas_token("u1", HOST, &nonce);
        let uri = format!("/page?saturn_token={}", token);

        let app = router(h.state.clone());
        let first = app
            .clone()
            .oneshot(get(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::FOUND);

        let replay = app
            .oneshot(get(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(replay.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn handoff_tokens_for_another_host_are_rejected() {
        let h = harness(MockIdentityService::new());
        let nonce = h.state.tokens.redirect_tokens.issue();
        let token = atlas_token("u1", "other.localtest.me", &nonce);

        let app = router(h.state.clone());
        let response = app
            .oneshot(
                get(&format!("/page?saturn_token={}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        // The nonce survives: validation failed before consumption.
        assert_eq!(h.state.tokens.redirect_tokens.len(), 1);
    }

    // =========================================================================
    // Silent refresh
    // =========================================================================

    #[tokio::test]
    async fn refresh_cookie_reauths_and_forwards_in_one_cycle() {
        let mut identity = MockIdentityService::new();
        identity
            .expect_refresh_session()
            .withf(|token| token == "refresh-cookie-jwt")
            .times(1)
            .returning(|_| Ok(atlas_token_for_refresh()));

        let h = harness(identity);
        let upstream = spawn_upstream().await;
        h.state
            .routes
            .load([("app".to_string(), upstream)].into_iter().collect());

        let app = router(h.state.clone());
        let response = app
            .oneshot(
                get("/data")
                    .header(
                        header::COOKIE,
                        format!("{}=refresh-cookie-jwt", REFRESH_TOKEN_COOKIE),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        // Forwarded upstream with fresh cookies on the same response.
        assert_eq!(response.status(), StatusCode::OK);
        let cookie_names: Vec<String> = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| {
                Cookie::parse(v.to_str().unwrap().to_string())
                    .unwrap()
                    .name()
                    .to_string()
            })
            .collect();
        assert_eq!(
            cookie_names,
            vec![REFRESH_TOKEN_COOKIE.to_string(), SATURN_TOKEN_COOKIE.to_string()]
        );
        assert_eq!(body_string(response).await, format!("upstream saw {}", HOST));
    }

    fn atlas_token_for_refresh() -> String {
        let claims = SaturnClaims {
            aud: PROXY_PRINCIPAL.to_string(),
            exp: (Utc::now() + ChronoDuration::hours(1)).timestamp(),
            iss: ATLAS_PRINCIPAL.to_string(),
            sub: "u1".to_string(),
            resource: HOST.to_string(),
            redirect_token: String::new(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SHARED_KEY_BYTE.repeat(KEY_LENGTH).as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn failed_refresh_degrades_to_the_login_redirect() {
        let mut identity = MockIdentityService::new();
        identity.expect_refresh_session().times(1).returning(|_| {
            Err(crate::identity::IdentityError::Transport(
                "connection refused".to_string(),
            ))
        });

        let h = harness(identity);
        let app = router(h.state.clone());
        let response = app
            .oneshot(
                get("/data")
                    .header(
                        header::COOKIE,
                        format!("{}=stale-refresh", REFRESH_TOKEN_COOKIE),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(location.contains("redirect_token="));
    }

    // =========================================================================
    // Bearer-header flow
    // =========================================================================

    #[tokio::test]
    async fn rejected_bearer_headers_get_the_403_text() {
        let mut identity = MockIdentityService::new();
        identity
            .expect_verify_access_key()
            .withf(|target, header| target == "app" && header == "Bearer xyz")
            .times(1)
            .returning(|_, _| Ok(false));

        let h = harness(identity);
        let app = router(h.state.clone());
        let response = app
            .oneshot(
                get("/data")
                    .header(header::AUTHORIZATION, "Bearer xyz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_string(response).await,
            "This token is not valid for this resource."
        );
        assert!(h.state.bearer_cache.is_empty());
    }

    #[tokio::test]
    async fn verified_bearer_headers_are_cached_across_requests() {
        let mut identity = MockIdentityService::new();
        // Exactly one verification for two requests: the second is a cache
        // hit.
        identity
            .expect_verify_access_key()
            .times(1)
            .returning(|_, _| Ok(true));

        let h = harness(identity);
        let upstream = spawn_upstream().await;
        h.state
            .routes
            .load([("app".to_string(), upstream)].into_iter().collect());

        let app = router(h.state.clone());
        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(
                    get("/data")
                        .header(header::AUTHORIZATION, "Bearer xyz")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(h.state.bearer_cache.len(), 1);
    }

    #[tokio::test]
    async fn unreachable_verification_fails_loudly() {
        let mut identity = MockIdentityService::new();
        identity.expect_verify_access_key().times(1).returning(|_, _| {
            Err(crate::identity::IdentityError::Transport(
                "connection refused".to_string(),
            ))
        });

        let h = harness(identity);
        let app = router(h.state.clone());
        let response = app
            .oneshot(
                get("/data")
                    .header(header::AUTHORIZATION, "Bearer xyz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    #[test]
    fn query_params_are_extracted_and_stripped() {
        let uri: Uri = "/page?a=1&saturn_token=tok&b=2".parse().unwrap();
        assert_eq!(query_param(&uri, "saturn_token").as_deref(), Some("tok"));
        assert_eq!(query_param(&uri, "missing"), None);

        let stripped = strip_query_param(&uri, "saturn_token");
        assert!(stripped.starts_with("/page?"));
        assert!(!stripped.contains("saturn_token"));

        let bare: Uri = "/page?saturn_token=tok".parse().unwrap();
        assert_eq!(strip_query_param(&bare, "saturn_token"), "/page");
    }

    #[test]
    fn cookies_parse_from_a_combined_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("saturn_token=abc; refresh_token=def"),
        );
        let cookies = parse_cookies(&headers);
        assert_eq!(cookies[SATURN_TOKEN_COOKIE], "abc");
        assert_eq!(cookies[REFRESH_TOKEN_COOKIE], "def");
    }
}
