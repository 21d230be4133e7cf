//! TCP target registry and HAProxy configurator
//!
//! Non-HTTP workloads (scheduler protocols and the like) are carried by an
//! HAProxy sidecar doing SNI-based TCP routing with TLS termination. This
//! module tracks the desired TCP targets from a ConfigMap, renders the
//! sidecar configuration, mirrors certificates to disk, and soft-reloads the
//! sidecar with SIGUSR2.
//!
//! All change sources (target map, TLS store) funnel into a single
//! capacity-1 `pending` channel with drop-on-full sends, so bursts of
//! updates collapse into one rebuild.

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use minijinja::{context, Environment};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::settings::Settings;
use crate::tls::{verify_server_cert, TlsStore};

/// HAProxy configurator errors
#[derive(Debug, thiserror::Error)]
pub enum HaproxyError {
    /// Template rendering failed
    #[error("failed to render HAProxy config template: {0}")]
    Template(String),

    /// Config or PID file I/O failed
    #[error("HAProxy file error: {0}")]
    Io(#[from] std::io::Error),

    /// PID file contents were not a process id
    #[error("invalid HAProxy pid file: {0}")]
    Pid(String),

    /// The reload signal could not be delivered
    #[error("failed to reload HAProxy: {0}")]
    Reload(String),
}

/// TCP target parse errors
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    /// Value was not valid YAML
    #[error("failed to load TCP target YAML: {0}")]
    Yaml(String),

    /// Required fields were missing or zero
    #[error("invalid TCP target configuration")]
    Invalid,

    /// A dotted service name did not resolve inside the cluster domain
    #[error("invalid service name \"{0}\"")]
    ServiceName(String),
}

/// Capacity-1 dirty flag feeding the reload task.
///
/// Senders never block: a signal while one is already queued is dropped,
/// which is what coalesces update bursts into a single rebuild.
#[derive(Clone)]
pub struct PendingSignal(mpsc::Sender<()>);

impl PendingSignal {
    /// Create the signal and its receiving end
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self(tx), rx)
    }

    /// Mark work pending; a no-op if a signal is already queued
    pub fn signal(&self) {
        let _ = self.0.try_send(());
    }
}

/// Raw YAML shape of one TCP target ConfigMap value
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TcpTargetSpec {
    port: u16,
    service_name: String,
    service_port: u16,
    secret_name: String,
}

impl Default for TcpTargetSpec {
    fn default() -> Self {
        Self {
            port: 0,
            service_name: String::new(),
            service_port: 0,
            secret_name: String::new(),
        }
    }
}

/// One TCP backend service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpTarget {
    /// Sidecar listener port
    pub port: u16,
    /// Backend service name as configured
    pub service_name: String,
    /// Backend service port
    pub service_port: u16,
    /// TLS secret carrying the listener certificate
    pub secret_name: String,
    /// Fully qualified service name for the HAProxy DNS resolver
    pub service_fqdn: String,
}

impl TcpTarget {
    /// Parse a ConfigMap value and derive the service FQDN.
    ///
    /// Bare names land in the proxy's namespace; `name.namespace` pairs get
    /// the `svc` suffix appended; anything longer must already be a service
    /// address under the cluster domain.
    pub fn parse(
        target_yaml: &str,
        namespace: &str,
        cluster_domain: &str,
    ) -> Result<Self, TargetError> {
        let spec: TcpTargetSpec =
            serde_yaml::from_str(target_yaml).map_err(|e| TargetError::Yaml(e.to_string()))?;
        if spec.port == 0 || spec.service_port == 0 || spec.service_name.is_empty() {
            return Err(TargetError::Invalid);
        }

        let service_fqdn = match spec.service_name.split('.').count() {
            1 => format!("{}.{}.svc.{}", spec.service_name, namespace, cluster_domain),
            2 => format!("{}.svc.{}", spec.service_name, cluster_domain),
            _ => {
                if !spec
                    .service_name
                    .ends_with(&format!(".svc.{}", cluster_domain))
                {
                    return Err(TargetError::ServiceName(spec.service_name));
                }
                spec.service_name.clone()
            }
        };

        Ok(Self {
            port: spec.port,
            service_name: spec.service_name,
            service_port: spec.service_port,
            secret_name: spec.secret_name,
            service_fqdn,
        })
    }
}

/// One routable SNI hostname in the rendered configuration
#[derive(Debug, Serialize)]
struct ListenerEntry {
    hostname: String,
    service_address: String,
    service_name: String,
    cert_bundle: String,
    ca_file: String,
}

/// One frontend port with its SNI targets
#[derive(Debug, Serialize)]
struct PortListeners {
    port: u16,
    targets: Vec<ListenerEntry>,
}

/// HAProxy configuration template. Each listener port gets a TCP frontend
/// that routes on the client hello's SNI; each hostname gets a loopback
/// abstract-socket pair that terminates TLS (with client verification) and
/// forwards to the resolved service.
const CONFIG_TEMPLATE: &str = "\
{% for listener in listeners %}
frontend tcp-{{ listener.port }}
    mode tcp
    bind 0.0.0.0:{{ listener.port }}
    tcp-request inspect-delay 5s
    tcp-request content accept if { req_ssl_hello_type 1 }
{%- for target in listener.targets %}
    use_backend loopback-{{ target.hostname }} if { req_ssl_sni -i {{ target.hostname }} }
{%- endfor %}
{% endfor %}
{%- for listener in listeners %}
{%- for target in listener.targets %}
backend loopback-{{ target.hostname }}
    server loopback-for-tls abns@{{ target.hostname }} send-proxy-v2

listen {{ target.hostname }}
    bind abns@{{ target.hostname }} accept-proxy ssl crt {{ target.cert_bundle }} ca-file {{ target.ca_file }} strict-sni
    server {{ target.service_name }} {{ target.service_address }} resolvers dns
{% endfor %}
{%- endfor %}
";

/// Delivers the soft-reload signal to the sidecar process.
///
/// A trait so tests can observe reload attempts without a live process.
pub trait ProcessSignaller: Send + Sync {
    /// Ask the process to reload its configuration
    fn reload(&self, pid: i32) -> Result<(), HaproxyError>;
}

/// Production signaller: SIGUSR2 to the HAProxy master process
pub struct Sigusr2Signaller;

impl ProcessSignaller for Sigusr2Signaller {
    fn reload(&self, pid: i32) -> Result<(), HaproxyError> {
        kill(Pid::from_raw(pid), Signal::SIGUSR2).map_err(|e| HaproxyError::Reload(e.to_string()))
    }
}

/// TCP target registry plus the configuration generator
pub struct HaproxyConfig {
    targets: Mutex<HashMap<String, TcpTarget>>,
    tls: Arc<TlsStore>,
    default_listeners: Vec<u16>,
    namespace: String,
    cluster_domain: String,
    config_path: PathBuf,
    pid_file: PathBuf,
    /// Minimum interval between sidecar reloads
    pub reload_rate_limit: Duration,
    pending: PendingSignal,
}

impl HaproxyConfig {
    /// Build the configurator, creating the config directory. An initial
    /// rebuild is queued when default listeners are configured so the
    /// sidecar always has frontends for them.
    pub fn new(
        settings: &Settings,
        tls: Arc<TlsStore>,
        pending: PendingSignal,
    ) -> Result<Self, HaproxyError> {
        let config_dir = settings.haproxy.base_dir.join("config");
        std::fs::create_dir_all(&config_dir)?;

        let config = Self {
            targets: Mutex::new(HashMap::new()),
            tls,
            default_listeners: settings.haproxy.default_listeners.clone(),
            namespace: settings.namespace.clone(),
            cluster_domain: settings.cluster_domain.clone(),
            config_path: config_dir.join("haproxy.cfg"),
            pid_file: settings.haproxy.pid_file.clone(),
            reload_rate_limit: settings.haproxy.reload_rate_limit,
            pending,
        };
        if !config.default_listeners.is_empty() {
            config.pending.signal();
        }
        Ok(config)
    }

    /// Replace the target map from the ConfigMap contents.
    ///
    /// Blank values are tombstones left behind by the config writer and are
    /// skipped without noise; entries that fail to parse are logged and
    /// skipped. The rebuild signal fires only when the resulting map
    /// differs.
    pub fn load(&self, data: BTreeMap<String, String>) -> bool {
        let mut incoming = HashMap::new();
        for (hostname, target_yaml) in data {
            if target_yaml.is_empty() {
                continue;
            }
            match TcpTarget::parse(&target_yaml, &self.namespace, &self.cluster_domain) {
                Ok(target) => {
                    incoming.insert(hostname, target);
                }
                Err(e) => {
                    warn!(hostname = %hostname, error = %e, "Error loading TCP config");
                }
            }
        }

        let mut targets = self.targets.lock().unwrap();
        if *targets == incoming {
            return false;
        }
        info!(count = incoming.len(), "Loaded HAProxy config");
        *targets = incoming;
        drop(targets);

        self.pending.signal();
        true
    }

    /// Drop every target (the backing ConfigMap was deleted)
    pub fn clear(&self) {
        {
            let mut targets = self.targets.lock().unwrap();
            targets.clear();
        }
        info!("Removed HAProxy configuration");
        self.pending.signal();
    }

    /// Queue a rebuild
    pub fn signal_pending(&self) {
        self.pending.signal();
    }

    /// Regenerate the sidecar configuration: write certificates, render the
    /// config file, and soft-reload the process.
    ///
    /// Targets whose TLS secret is missing, fails verification, or cannot
    /// be written are skipped for this cycle; the secret stays in memory
    /// and the target returns on the next rebuild that fixes it.
    pub fn update(&self, signaller: &dyn ProcessSignaller) -> Result<(), HaproxyError> {
        // Snapshot both registries. Lock order is targets then TLS; this is
        // the only place the two locks nest. Both drop before any file I/O.
        let (targets, tls_entries) = {
            let targets = self.targets.lock().unwrap();
            let tls = self.tls.lock();
            (targets.clone(), tls.clone())
        };

        let mut ports: BTreeMap<u16, Vec<ListenerEntry>> = self
            .default_listeners
            .iter()
            .map(|port| (*port, Vec::new()))
            .collect();

        for (hostname, target) in &targets {
            let Some(entry) = tls_entries.get(&target.secret_name) else {
                warn!(
                    hostname = %hostname,
                    secret = %target.secret_name,
                    "Skipping TCP target: missing TLS secret"
                );
                continue;
            };
            if let Err(e) = verify_server_cert(&entry.cert, &entry.ca, hostname) {
                warn!(hostname = %hostname, error = %e, "Skipping TCP target");
                continue;
            }
            if let Err(e) = entry.write() {
                warn!(
                    secret = %target.secret_name,
                    error = %e,
                    "Failed to write certificate files"
                );
                continue;
            }

            ports.entry(target.port).or_default().push(ListenerEntry {
                hostname: hostname.clone(),
                service_address: format!("{}:{}", target.service_fqdn, target.service_port),
                service_name: target.service_name.clone(),
                cert_bundle: entry.bundle_path.display().to_string(),
                ca_file: entry.ca_path.display().to_string(),
            });
        }

        for entries in ports.values_mut() {
            entries.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        }

        info!(path = %self.config_path.display(), "Writing HAProxy config");
        self.render_config(ports)?;

        let pid = self.read_pid()?;
        debug!(pid, "Signalling HAProxy soft-reload");
        signaller.reload(pid)
    }

    /// Render the template to the config file (world-readable; it holds no
    /// secrets, only file paths)
    fn render_config(&self, ports: BTreeMap<u16, Vec<ListenerEntry>>) -> Result<(), HaproxyError> {
        let listeners: Vec<PortListeners> = ports
            .into_iter()
            .map(|(port, targets)| PortListeners { port, targets })
            .collect();

        let env = Environment::new();
        let rendered = env
            .render_str(CONFIG_TEMPLATE, context! { listeners })
            .map_err(|e| HaproxyError::Template(e.to_string()))?;

        use std::os::unix::fs::OpenOptionsExt;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .mode(0o644)
            .open(&self.config_path)?;
        file.write_all(rendered.as_bytes())?;
        Ok(())
    }

    /// PID of the HAProxy master process
    fn read_pid(&self) -> Result<i32, HaproxyError> {
        let contents = std::fs::read_to_string(&self.pid_file)?;
        contents
            .split_whitespace()
            .next()
            .unwrap_or("")
            .parse::<i32>()
            .map_err(|e| HaproxyError::Pid(e.to_string()))
    }
}

/// Consume the pending signal and rebuild the sidecar configuration.
///
/// Each rebuild waits on the rate-limit ticker first, so a storm of
/// configuration changes produces at most one reload per interval. A failed
/// rebuild re-queues itself.
pub async fn run_reload_task(
    config: Arc<HaproxyConfig>,
    mut pending: mpsc::Receiver<()>,
    signaller: Arc<dyn ProcessSignaller>,
) {
    let mut ticker = tokio::time::interval(config.reload_rate_limit);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while pending.recv().await.is_some() {
        ticker.tick().await;
        if let Err(e) = config.update(signaller.as_ref()) {
            error!(error = %e, "HAProxy update failed, will retry");
            config.signal_pending();
        }
    }
}
