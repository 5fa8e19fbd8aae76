//! Discovers resource kinds and keeps one dynamic watch per kind.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::discovery::{verbs, ApiCapabilities, ApiResource, Discovery};
use kube::runtime::watcher;
use kube::Client;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Kinds that are never watched: ephemeral review/lease kinds whose
/// churn carries no state worth replicating.
const UNWATCHED_KINDS: &[&str] = &[
    "TokenReview",
    "Binding",
    "ComponentStatus",
    "LocalSubjectAccessReview",
    "SelfSubjectRulesReview",
    "SubjectAccessReview",
    "SelfSubjectAccessReview",
    "Lease",
    "ControllerRevision",
    "APIService",
];

/// Receives every add/update/delete from every watched kind.
///
/// Callbacks fire from concurrently running watch tasks and must be
/// re-entrant.
pub trait EventHandler: Send + Sync + 'static {
    fn on_add(&self, resource: &ApiResource, object: &DynamicObject);
    fn on_update(&self, resource: &ApiResource, object: &DynamicObject);
    fn on_delete(&self, resource: &ApiResource, object: &DynamicObject);
}

/// Periodically enumerates the API surface and attaches a watch to every
/// newly appearing resource kind.
pub struct WatchScheduler {
    client: Client,
    handler: Arc<dyn EventHandler>,
    interval: Duration,
    watched: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for WatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchScheduler")
            .field("interval", &self.interval)
            .finish()
    }
}

impl WatchScheduler {
    pub fn new(client: Client, handler: Arc<dyn EventHandler>, interval: Duration) -> Self {
        WatchScheduler {
            client,
            handler,
            interval,
            watched: Mutex::new(HashSet::new()),
        }
    }

    /// Runs discovery immediately and then on every tick until cancelled.
    /// Discovery failures are logged and retried on the next tick.
    pub async fn run(&self, token: CancellationToken) {
        self.discover_and_subscribe(&token).await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => self.discover_and_subscribe(&token).await,
            }
        }
    }

    async fn discover_and_subscribe(&self, token: &CancellationToken) {
        let discovery = match Discovery::new(self.client.clone()).run().await {
            Ok(discovery) => discovery,
            Err(error) => {
                error!(message = "Resource discovery failed.", %error);
                return;
            }
        };

        for group in discovery.groups() {
            for (resource, capabilities) in group.recommended_resources() {
                if !self.watchable(&resource, &capabilities) {
                    continue;
                }
                let key = watch_key(&resource);
                if !self.watched.lock().insert(key.clone()) {
                    continue;
                }
                debug!(message = "Watching new resource kind.", resource = %key);

                let api = Api::<DynamicObject>::all_with(self.client.clone(), &resource);
                let handler = Arc::clone(&self.handler);
                let token = token.clone();
                tokio::spawn(watch_resource(api, resource, handler, token));
            }
        }
    }

    fn watchable(&self, resource: &ApiResource, capabilities: &ApiCapabilities) -> bool {
        if UNWATCHED_KINDS.contains(&resource.kind.as_str()) {
            return false;
        }
        capabilities.supports_operation(verbs::WATCH)
            && capabilities.supports_operation(verbs::LIST)
    }
}

fn watch_key(resource: &ApiResource) -> String {
    format!("{}/{}/{}", resource.group, resource.version, resource.plural)
}

/// One long-lived watch over a single resource kind. The watcher re-lists
/// internally after desyncs; stream errors are logged and the stream
/// polled again.
async fn watch_resource(
    api: Api<DynamicObject>,
    resource: ApiResource,
    handler: Arc<dyn EventHandler>,
    token: CancellationToken,
) {
    let mut stream = watcher(api, watcher::Config::default()).boxed();
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            event = stream.next() => match event {
                Some(Ok(watcher::Event::InitApply(object))) => handler.on_add(&resource, &object),
                Some(Ok(watcher::Event::Apply(object))) => handler.on_update(&resource, &object),
                Some(Ok(watcher::Event::Delete(object))) => handler.on_delete(&resource, &object),
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    warn!(message = "Watch stream error.", kind = %resource.kind, %error);
                }
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_kinds_are_denied() {
        for kind in ["TokenReview", "SelfSubjectAccessReview", "Lease", "APIService"] {
            assert!(UNWATCHED_KINDS.contains(&kind));
        }
        assert!(!UNWATCHED_KINDS.contains(&"Pod"));
    }

    #[test]
    fn watch_keys_are_unique_per_version() {
        let v1 = ApiResource {
            group: "apps".into(),
            version: "v1".into(),
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            plural: "deployments".into(),
        };
        let mut v1beta1 = v1.clone();
        v1beta1.version = "v1beta1".into();
        assert_ne!(watch_key(&v1), watch_key(&v1beta1));
    }
}
