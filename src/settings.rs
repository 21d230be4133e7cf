//! Typed configuration snapshot for the proxy
//!
//! Settings are read once at startup from a YAML file plus two environment
//! overrides (`PROXY_SHARED_KEY`, `NAMESPACE`) and are immutable afterwards.
//! Durations are human strings (`"10m"`, `"86400s"`); the login/refresh/token
//! paths are resolved against the configured base URL.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use crate::token::random_token;

/// Minimum length of both signing keys, in bytes.
pub const KEY_LENGTH: usize = 512 / 8;

/// Default location of the settings file.
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/saturn/settings.yaml";

/// Weak key substituted when `debug: true` and no shared key is configured.
/// Never used in production: a missing key outside debug mode is fatal.
const DEBUG_SHARED_KEY: &str =
    "debugKeyForTestOnlydNeverUseInProduction123456789012345678901234567890";

/// Settings load/validation errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Settings file could not be read
    #[error("failed to read settings file {}: {source}", path.display())]
    Read {
        /// Path that was attempted
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Settings file is not valid YAML
    #[error("failed to parse settings file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A duration string could not be parsed
    #[error("invalid {field}: {reason}")]
    Duration {
        /// Settings key that failed
        field: &'static str,
        /// Why parsing failed
        reason: String,
    },

    /// A URL could not be parsed
    #[error("invalid {field}: {source}")]
    Url {
        /// Settings key that failed
        field: &'static str,
        /// Underlying parse error
        source: url::ParseError,
    },

    /// No shared signing key was supplied outside debug mode
    #[error("unable to obtain shared saturn signing key; set PROXY_SHARED_KEY")]
    MissingSharedKey,

    /// Shared key is shorter than [`KEY_LENGTH`]
    #[error("shared saturn signing key is too short ({0} bytes); set PROXY_SHARED_KEY")]
    SharedKeyTooShort(usize),
}

/// ConfigMap names feeding the proxy registries
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfigMaps {
    /// ConfigMap holding the hostname-prefix to upstream routing table
    pub http_targets: String,
    /// ConfigMap holding TCP target descriptors for the HAProxy sidecar
    pub tcp_targets: String,
    /// ConfigMap whose keys are the active proxy session identifiers
    pub user_sessions: String,
}

impl Default for ProxyConfigMaps {
    fn default() -> Self {
        Self {
            http_targets: "saturn-auth-proxy".to_string(),
            tcp_targets: "saturn-tcp-proxy".to_string(),
            user_sessions: "saturn-proxy-sessions".to_string(),
        }
    }
}

/// HAProxy sidecar configuration
#[derive(Clone, Debug)]
pub struct HaproxySettings {
    /// Whether the TCP sidecar path is active at all
    pub enabled: bool,
    /// Directory holding the `config/` and `certs/` subdirectories
    pub base_dir: PathBuf,
    /// File the HAProxy master process writes its PID to
    pub pid_file: PathBuf,
    /// Minimum interval between sidecar reloads
    pub reload_rate_limit: Duration,
    /// Label selector picking the TLS secrets to mirror to disk
    pub tls_label_selector: String,
    /// Ports that always get a frontend, even with no targets
    pub default_listeners: Vec<u16>,
}

/// Parsed URLs for talking to the Atlas identity service
#[derive(Clone, Debug)]
pub struct ProxyUrls {
    /// Identity service base URL
    pub base: Url,
    /// Browser login page (redirect target)
    pub login: Url,
    /// Refresh-token exchange endpoint
    pub refresh: Url,
    /// Bearer-header verification endpoint
    pub token: Url,
}

/// Immutable runtime configuration
#[derive(Clone, Debug)]
pub struct Settings {
    /// Port the HTTP dispatcher listens on
    pub proxy_port: u16,
    /// Kubernetes namespace watched for ConfigMaps and Secrets
    pub namespace: String,
    /// Cluster DNS suffix used when deriving service FQDNs
    pub cluster_domain: String,
    /// Debug mode (weak-key fallback, noisier logs)
    pub debug: bool,
    /// Whether self-redirects use the https scheme
    pub https_redirect: bool,
    /// Virtual-host suffix stripped from the request host
    pub common_suffix: String,
    /// Identity service URLs
    pub urls: ProxyUrls,
    /// ConfigMap names
    pub config_maps: ProxyConfigMaps,
    /// TTL for validated bearer headers
    pub access_key_expiration: Duration,
    /// Lifetime of refresh-token cookies
    pub refresh_token_expiration: Duration,
    /// Lifetime of session-token cookies
    pub saturn_token_expiration: Duration,
    /// Federation secret shared with the identity service
    pub shared_key: Vec<u8>,
    /// Process-private key for session cookies, generated at startup
    pub jwt_key: Vec<u8>,
    /// HAProxy sidecar configuration
    pub haproxy: HaproxySettings,
}

/// Environment inputs consulted during settings parsing.
///
/// Split out from process environment access so tests can drive parsing
/// without mutating global state.
#[derive(Clone, Debug, Default)]
pub struct SettingsEnv {
    /// `PROXY_SHARED_KEY`
    pub shared_key: Option<String>,
    /// `NAMESPACE`
    pub namespace: Option<String>,
}

impl SettingsEnv {
    /// Capture the relevant variables from the process environment
    pub fn from_process() -> Self {
        Self {
            shared_key: std::env::var("PROXY_SHARED_KEY").ok(),
            namespace: std::env::var("NAMESPACE").ok(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file, applying environment overrides
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: SettingsFile = serde_yaml::from_str(&raw)?;
        Self::from_file(file, SettingsEnv::from_process())
    }

    /// Build settings from a parsed file and environment inputs
    pub fn from_file(file: SettingsFile, env: SettingsEnv) -> Result<Self, SettingsError> {
        let debug = file.debug;

        // Keys. The shared key is the federation secret; the JWT key is
        // process-private and regenerated on every start.
        let shared_key = match env.shared_key.filter(|k| !k.is_empty()) {
            Some(key) => key.into_bytes(),
            None if debug => {
                warn!(
                    "WARNING! Running in debug mode with a predefined weak key; \
                     set debug=false in production"
                );
                DEBUG_SHARED_KEY.as_bytes().to_vec()
            }
            None => return Err(SettingsError::MissingSharedKey),
        };
        if shared_key.len() < KEY_LENGTH {
            return Err(SettingsError::SharedKeyTooShort(shared_key.len()));
        }
        let jwt_key = random_token(KEY_LENGTH).into_bytes();
        info!(bytes = shared_key.len(), "Saturn signing key obtained");
        info!(bytes = jwt_key.len(), "JWT signing key generated");

        // Expirations
        let access_key_expiration =
            parse_duration(&file.access_key_expiration).map_err(|reason| {
                SettingsError::Duration {
                    field: "accessKeyExpiration",
                    reason,
                }
            })?;
        let refresh_token_expiration =
            parse_duration(&file.refresh_token_expiration).map_err(|reason| {
                SettingsError::Duration {
                    field: "refreshTokenExpiration",
                    reason,
                }
            })?;
        let saturn_token_expiration =
            parse_duration(&file.saturn_token_expiration).map_err(|reason| {
                SettingsError::Duration {
                    field: "saturnTokenExpiration",
                    reason,
                }
            })?;

        // URLs. Relative paths resolve against the base.
        let base = Url::parse(&file.proxy_urls.base_url).map_err(|source| SettingsError::Url {
            field: "proxyURLs.baseURL",
            source,
        })?;
        let login = base
            .join(&file.proxy_urls.login_path)
            .map_err(|source| SettingsError::Url {
                field: "proxyURLs.loginPath",
                source,
            })?;
        let refresh =
            base.join(&file.proxy_urls.refresh_path)
                .map_err(|source| SettingsError::Url {
                    field: "proxyURLs.refreshPath",
                    source,
                })?;
        let token = base
            .join(&file.proxy_urls.token_path)
            .map_err(|source| SettingsError::Url {
                field: "proxyURLs.tokenPath",
                source,
            })?;

        let reload_rate_limit =
            parse_duration(&file.ha_proxy.reload_rate_limit).map_err(|reason| {
                SettingsError::Duration {
                    field: "haProxy.reloadRateLimit",
                    reason,
                }
            })?;

        let settings = Self {
            proxy_port: file.proxy_port,
            namespace: env.namespace.unwrap_or(file.namespace),
            cluster_domain: file.cluster_domain,
            debug,
            https_redirect: file.https_redirect,
            common_suffix: file.proxy_urls.common_suffix,
            urls: ProxyUrls {
                base,
                login,
                refresh,
                token,
            },
            config_maps: file.proxy_config_maps,
            access_key_expiration,
            refresh_token_expiration,
            saturn_token_expiration,
            shared_key,
            jwt_key,
            haproxy: HaproxySettings {
                enabled: file.ha_proxy.enabled,
                base_dir: PathBuf::from(file.ha_proxy.base_dir),
                pid_file: PathBuf::from(file.ha_proxy.pid_file),
                reload_rate_limit,
                tls_label_selector: file.ha_proxy.tls_label_selector,
                default_listeners: file.ha_proxy.default_listeners,
            },
        };

        info!(expiration = ?settings.access_key_expiration, "Access key expiration");
        info!(expiration = ?settings.saturn_token_expiration, "JWT cookie expiration");
        info!(expiration = ?settings.refresh_token_expiration, "Refresh cookie expiration");
        info!(login = %settings.urls.login, "Redirect URL");
        info!(refresh = %settings.urls.refresh, "Refresh URL");
        info!(enabled = settings.haproxy.enabled, "HAProxy sidecar");

        Ok(settings)
    }

    /// Scheme used when the proxy redirects back to itself
    pub fn self_scheme(&self) -> &'static str {
        if self.https_redirect {
            "https"
        } else {
            "http"
        }
    }
}

/// Raw settings file shape; see the crate README for an annotated example
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsFile {
    /// `clusterDomain`
    pub cluster_domain: String,
    /// `debug`
    pub debug: bool,
    /// `haProxy`
    pub ha_proxy: HaproxyFile,
    /// `httpsRedirect`
    pub https_redirect: bool,
    /// `namespace`
    pub namespace: String,
    /// `proxyConfigMaps`
    pub proxy_config_maps: ProxyConfigMaps,
    /// `proxyPort`
    pub proxy_port: u16,
    /// `proxyURLs`
    #[serde(rename = "proxyURLs")]
    pub proxy_urls: ProxyUrlsFile,
    /// `accessKeyExpiration`
    pub access_key_expiration: String,
    /// `refreshTokenExpiration`
    pub refresh_token_expiration: String,
    /// `saturnTokenExpiration`
    pub saturn_token_expiration: String,
}

impl Default for SettingsFile {
    fn default() -> Self {
        Self {
            cluster_domain: "cluster.local".to_string(),
            debug: false,
            ha_proxy: HaproxyFile::default(),
            https_redirect: false,
            namespace: "main-namespace".to_string(),
            proxy_config_maps: ProxyConfigMaps::default(),
            proxy_port: 8080,
            proxy_urls: ProxyUrlsFile::default(),
            access_key_expiration: "10m".to_string(),
            refresh_token_expiration: "86400s".to_string(),
            saturn_token_expiration: "3600s".to_string(),
        }
    }
}

/// Raw `haProxy` section
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HaproxyFile {
    /// `enabled`
    pub enabled: bool,
    /// `baseDir`
    pub base_dir: String,
    /// `pidFile`
    pub pid_file: String,
    /// `reloadRateLimit`
    pub reload_rate_limit: String,
    /// `tlsLabelSelector`
    pub tls_label_selector: String,
    /// `defaultListeners`
    pub default_listeners: Vec<u16>,
}

impl Default for HaproxyFile {
    fn default() -> Self {
        Self {
            enabled: false,
            base_dir: "/etc/haproxy".to_string(),
            pid_file: "/etc/haproxy/haproxy.pid".to_string(),
            reload_rate_limit: "3s".to_string(),
            tls_label_selector: "saturncloud.io/certificate=server".to_string(),
            default_listeners: Vec::new(),
        }
    }
}

/// Raw `proxyURLs` section
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyUrlsFile {
    /// `baseURL`
    #[serde(rename = "baseURL")]
    pub base_url: String,
    /// `loginPath`
    pub login_path: String,
    /// `refreshPath`
    pub refresh_path: String,
    /// `tokenPath`
    pub token_path: String,
    /// `commonSuffix`
    pub common_suffix: String,
}

impl Default for ProxyUrlsFile {
    fn default() -> Self {
        Self {
            base_url: "http://dev.localtest.me:8888".to_string(),
            login_path: "/api/auth/login".to_string(),
            refresh_path: "/auth/refresh".to_string(),
            token_path: "/api/deployments/auth".to_string(),
            common_suffix: ".localtest.me".to_string(),
        }
    }
}

/// Parse a human duration string (`"500ms"`, `"10m"`, `"86400s"`, `"1h"`).
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let offset = s
        .rfind(|c: char| c.is_ascii_digit())
        .ok_or_else(|| format!("'{}' does not contain a duration value", s))?;
    let (magnitude, unit) = s.split_at(offset + 1);
    let magnitude = magnitude
        .parse::<u64>()
        .map_err(|e| format!("invalid duration value '{}': {}", magnitude, e))?;

    let millis_per_unit = match unit {
        "" if magnitude == 0 => 0,
        "ms" => 1,
        "s" => 1000,
        "m" => 1000 * 60,
        "h" => 1000 * 60 * 60,
        "d" => 1000 * 60 * 60 * 24,
        _ => {
            return Err(format!(
                "invalid duration unit '{}' (expected one of 'ms', 's', 'm', 'h', or 'd')",
                unit
            ))
        }
    };

    let ms = magnitude
        .checked_mul(millis_per_unit)
        .ok_or_else(|| format!("duration '{}' overflows", s))?;
    Ok(Duration::from_millis(ms))
}
