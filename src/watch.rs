//! ConfigMap/Secret watch streams feeding the registries
//!
//! Each registry gets its own watcher task: HTTP routes, user sessions, and
//! TCP targets each follow a single named ConfigMap (field selector), while
//! TLS secrets follow a label selector. The kube watcher re-lists
//! periodically, so handlers see repeated `Apply` events with unchanged
//! payloads; the registries are responsible for swallowing those quietly.

use std::collections::BTreeMap;
use std::pin::pin;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::Client;
use tracing::{debug, info, warn};

/// Pause before polling again after a watch stream error
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Data payload of a ConfigMap
pub type ConfigMapData = BTreeMap<String, String>;

/// Follow a single named ConfigMap, invoking `on_apply` with its data on
/// every add/update (and resync) and `on_delete` when it disappears.
///
/// Blocks for the life of the process; run it on its own task.
pub async fn watch_configmap<A, D>(
    client: Client,
    namespace: String,
    name: String,
    on_apply: A,
    on_delete: D,
) where
    A: Fn(ConfigMapData) + Send + Sync + 'static,
    D: Fn() + Send + Sync + 'static,
{
    let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
    let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
    let mut stream = pin!(watcher::watcher(api, config));

    info!(configmap = %name, namespace = %namespace, "Watching ConfigMap");
    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Apply(cm)) | Ok(Event::InitApply(cm)) => {
                on_apply(cm.data.unwrap_or_default());
            }
            Ok(Event::Delete(_)) => on_delete(),
            Ok(Event::Init) | Ok(Event::InitDone) => {
                debug!(configmap = %name, "Watcher initialized");
            }
            Err(e) => {
                warn!(configmap = %name, error = %e, "Watcher error, will retry");
                tokio::time::sleep(WATCH_RETRY_DELAY).await;
            }
        }
    }
}

/// Follow every Secret matching a label selector.
///
/// Apply and delete both hand over the full Secret; the TLS store needs the
/// name either way.
pub async fn watch_secrets<A, D>(
    client: Client,
    namespace: String,
    label_selector: String,
    on_apply: A,
    on_delete: D,
) where
    A: Fn(Secret) + Send + Sync + 'static,
    D: Fn(Secret) + Send + Sync + 'static,
{
    let api: Api<Secret> = Api::namespaced(client, &namespace);
    let config = watcher::Config::default().labels(&label_selector);
    let mut stream = pin!(watcher::watcher(api, config));

    info!(selector = %label_selector, namespace = %namespace, "Watching TLS secrets");
    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Apply(secret)) | Ok(Event::InitApply(secret)) => on_apply(secret),
            Ok(Event::Delete(secret)) => on_delete(secret),
            Ok(Event::Init) | Ok(Event::InitDone) => {
                debug!(selector = %label_selector, "Watcher initialized");
            }
            Err(e) => {
                warn!(selector = %label_selector, error = %e, "Watcher error, will retry");
                tokio::time::sleep(WATCH_RETRY_DELAY).await;
            }
        }
    }
}
