//! Saturn auth proxy - process bootstrap
//!
//! Loads the settings snapshot, starts the ConfigMap/Secret watchers and the
//! HAProxy reload task, and serves the HTTP dispatcher until the process is
//! signalled to stop.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use saturn_proxy::auth_cache::{self, BearerCache};
use saturn_proxy::dispatch::{self, AppState};
use saturn_proxy::forward::Forwarder;
use saturn_proxy::haproxy::{self, HaproxyConfig, PendingSignal, Sigusr2Signaller};
use saturn_proxy::identity::AtlasClient;
use saturn_proxy::routes::HttpRoutes;
use saturn_proxy::session::SessionRegistry;
use saturn_proxy::settings::{Settings, DEFAULT_SETTINGS_PATH};
use saturn_proxy::tls::TlsStore;
use saturn_proxy::token::TokenService;
use saturn_proxy::watch;

/// Authenticating reverse proxy for per-tenant workloads
#[derive(Parser, Debug)]
#[command(name = "saturn-proxy", version, about, long_about = None)]
struct Cli {
    /// Settings file
    #[arg(short = 'f', long = "settings-file", default_value = DEFAULT_SETTINGS_PATH)]
    settings_file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings =
        Arc::new(Settings::load(&cli.settings_file).context("Failed to load settings")?);

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    // Registries, fed by the watchers below
    let sessions = Arc::new(SessionRegistry::new());
    let routes = Arc::new(HttpRoutes::new());
    let tokens = Arc::new(TokenService::new(&settings, sessions.clone()));
    let bearer_cache = Arc::new(BearerCache::new(settings.access_key_expiration));

    // HTTP route watcher
    tokio::spawn(watch::watch_configmap(
        client.clone(),
        settings.namespace.clone(),
        settings.config_maps.http_targets.clone(),
        {
            let routes = routes.clone();
            move |data| {
                routes.load(data);
            }
        },
        {
            let routes = routes.clone();
            move || routes.clear()
        },
    ));

    // User session watcher
    tokio::spawn(watch::watch_configmap(
        client.clone(),
        settings.namespace.clone(),
        settings.config_maps.user_sessions.clone(),
        {
            let sessions = sessions.clone();
            move |data| {
                sessions.load(data);
            }
        },
        {
            let sessions = sessions.clone();
            move || sessions.clear()
        },
    ));

    // TCP sidecar: target watcher, TLS secret watcher, and the rate-limited
    // reload task, all funnelling into one pending signal
    if settings.haproxy.enabled {
        let (pending, pending_rx) = PendingSignal::channel();
        let tls = Arc::new(
            TlsStore::new(settings.haproxy.base_dir.join("certs"), pending.clone())
                .context("Failed to create TLS certificate store")?,
        );
        let haproxy_config = Arc::new(
            HaproxyConfig::new(&settings, tls.clone(), pending)
                .context("Failed to create HAProxy configurator")?,
        );

        tokio::spawn(watch::watch_configmap(
            client.clone(),
            settings.namespace.clone(),
            settings.config_maps.tcp_targets.clone(),
            {
                let haproxy_config = haproxy_config.clone();
                move |data| {
                    haproxy_config.load(data);
                }
            },
            {
                let haproxy_config = haproxy_config.clone();
                move || haproxy_config.clear()
            },
        ));

        tokio::spawn(watch::watch_secrets(
            client.clone(),
            settings.namespace.clone(),
            settings.haproxy.tls_label_selector.clone(),
            {
                let tls = tls.clone();
                move |secret| {
                    tls.load(&secret);
                }
            },
            {
                let tls = tls.clone();
                move |secret| tls.delete(&secret)
            },
        ));

        tokio::spawn(haproxy::run_reload_task(
            haproxy_config,
            pending_rx,
            Arc::new(Sigusr2Signaller),
        ));
    }

    // Bearer-cache janitor
    tokio::spawn(auth_cache::run_janitor(bearer_cache.clone()));

    let state = AppState {
        tokens,
        routes,
        bearer_cache,
        identity: Arc::new(AtlasClient::new(&settings).context("Failed to create Atlas client")?),
        forwarder: Arc::new(Forwarder::new().context("Failed to create forwarder")?),
        settings: settings.clone(),
    };
    let app = dispatch::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.proxy_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(addr = %addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Saturn proxy shutting down");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}
