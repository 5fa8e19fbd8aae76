//! Turns watch events into dataset entries and fans them out to every
//! entitled agent's queue.

use std::sync::Arc;

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use serde_json::value::RawValue;
use snafu::{ResultExt, Snafu};
use tracing::{debug, error};

use outpost_sync::suid::{Ksuid, Suid};
use outpost_sync::{Instance, Item};

use crate::event::{Envelope, EventKind};
use crate::kubernetes::{pluralize, EventHandler, MetaKey};
use crate::nodeset::{Key, NodeSet};

#[derive(Debug, Snafu)]
pub enum PublishError {
    #[snafu(display("failed to encode resource: {source}"))]
    Encode { source: serde_json::Error },

    #[snafu(display("failed to append event to dataset: {source}"))]
    Append { source: outpost_sync::Error },
}

/// The scheduler-facing side of the server: every event is logged into
/// the dataset and enqueued for each agent the NodeSet authorises.
pub struct EventFanout {
    instance: Arc<Instance>,
    node_set: Arc<NodeSet>,
}

impl std::fmt::Debug for EventFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFanout").finish()
    }
}

impl EventFanout {
    pub fn new(instance: Arc<Instance>, node_set: Arc<NodeSet>) -> Self {
        EventFanout { instance, node_set }
    }

    fn publish(&self, kind: EventKind, resource: &ApiResource, object: &DynamicObject) {
        if let Err(error) = self.try_publish(kind, resource, object) {
            // The watch stream must keep flowing; the entry is retried on
            // the next observed change of the resource.
            error!(
                message = "Failed to publish watch event.",
                kind = %resource.kind,
                name = %object.name_any(),
                %error,
            );
        }
    }

    fn try_publish(
        &self,
        kind: EventKind,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<(), PublishError> {
        let raw = serde_json::to_string(object).context(EncodeSnafu)?;
        let meta = MetaKey {
            group: resource.group.clone(),
            version: resource.version.clone(),
            kind: resource.kind.clone(),
            namespace: object.namespace().unwrap_or_default(),
            name: object.name_any(),
            resource_version: object.resource_version().unwrap_or_default(),
        };

        let uid = Suid::with_custom(Ksuid::new(), meta.to_string());
        let envelope = Envelope::new(kind, RawValue::from_string(raw).context(EncodeSnafu)?);
        let item = Item {
            uid: uid.clone(),
            value: serde_json::to_vec(&envelope).context(EncodeSnafu)?,
        };
        self.instance.data_set().add(&[item]).context(AppendSnafu)?;

        let key = Key::new(
            meta.group.clone(),
            pluralize(&meta.kind),
            meta.namespace.clone(),
        );
        let agents = self.node_set.get_union(&key);
        debug!(
            message = "Published watch event.",
            meta = %meta,
            agents = agents.len(),
        );
        for agent in agents {
            if let Err(error) = self.instance.syncer(&agent).add(std::slice::from_ref(&uid)) {
                error!(
                    message = "Failed to enqueue event for agent.",
                    %agent,
                    %error,
                );
            }
        }
        Ok(())
    }
}

impl EventHandler for EventFanout {
    fn on_add(&self, resource: &ApiResource, object: &DynamicObject) {
        self.publish(EventKind::Added, resource, object);
    }

    fn on_update(&self, resource: &ApiResource, object: &DynamicObject) {
        self.publish(EventKind::Modified, resource, object);
    }

    fn on_delete(&self, resource: &ApiResource, object: &DynamicObject) {
        self.publish(EventKind::Deleted, resource, object);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kube::api::{ApiResource, DynamicObject};
    use kube::core::TypeMeta;

    use outpost_sync::storage::MemoryStorage;
    use outpost_sync::suid::Suid;
    use outpost_sync::Instance;

    use super::*;

    fn pod_resource() -> ApiResource {
        ApiResource {
            group: String::new(),
            version: "v1".into(),
            api_version: "v1".into(),
            kind: "Pod".into(),
            plural: "pods".into(),
        }
    }

    fn deployment_resource() -> ApiResource {
        ApiResource {
            group: "apps".into(),
            version: "v1".into(),
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            plural: "deployments".into(),
        }
    }

    fn object(namespace: &str, name: &str, resource_version: &str, ar: &ApiResource) -> DynamicObject {
        let mut object = DynamicObject::new(name, ar);
        object.types = Some(TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
        object.metadata.namespace = Some(namespace.to_owned());
        object.metadata.resource_version = Some(resource_version.to_owned());
        object
    }

    fn fanout() -> (Arc<Instance>, Arc<NodeSet>, EventFanout) {
        let instance = Arc::new(Instance::new("srv", Arc::new(MemoryStorage::new())));
        let node_set = Arc::new(NodeSet::new());
        let fanout = EventFanout::new(Arc::clone(&instance), Arc::clone(&node_set));
        (instance, node_set, fanout)
    }

    fn queued(instance: &Instance, agent: &str) -> Vec<Suid> {
        match instance.syncer(agent).manifest(&Suid::default(), 0) {
            Ok(page) => page.iter().map(|id| page.get_uid(id)).collect(),
            Err(outpost_sync::Error::EmptyManifest) => Vec::new(),
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn events_land_in_dataset_and_entitled_queues() {
        let (instance, node_set, fanout) = fanout();
        node_set.set("edge-pods", &[Key::new("", "pods", "default")]);
        node_set.set("edge-any", &[Key::any()]);

        let ar = pod_resource();
        fanout.on_add(&ar, &object("default", "web", "1", &ar));

        let pods = queued(&instance, "edge-pods");
        assert_eq!(pods.len(), 1);
        assert!(pods[0]
            .custom()
            .unwrap()
            .starts_with("v1,Pod,default/web,1"));
        assert_eq!(queued(&instance, "edge-any").len(), 1);

        // The dataset itself holds the envelope.
        let item = instance
            .data_set()
            .get(&Suid::from_custom("v1,Pod,default/web,1"))
            .unwrap();
        let envelope: Envelope = serde_json::from_slice(&item.value).unwrap();
        assert_eq!(envelope.kind, EventKind::Added);
    }

    #[test]
    fn agents_only_receive_entitled_kinds() {
        let (instance, node_set, fanout) = fanout();
        // Granted by a clusterrole: pods in every namespace.
        node_set.set("edge-2", &[Key::new("", "pods", "*")]);

        let pods = pod_resource();
        let deployments = deployment_resource();
        fanout.on_add(&deployments, &object("default", "api", "5", &deployments));
        fanout.on_add(&pods, &object("default", "web", "6", &pods));

        let got = queued(&instance, "edge-2");
        assert_eq!(got.len(), 1);
        assert!(got[0].custom().unwrap().starts_with("v1,Pod,"));
    }

    #[test]
    fn update_and_delete_map_to_their_kinds() {
        let (instance, node_set, fanout) = fanout();
        node_set.set("edge", &[Key::any()]);

        let ar = pod_resource();
        fanout.on_update(&ar, &object("default", "web", "2", &ar));
        fanout.on_delete(&ar, &object("default", "web", "3", &ar));

        for (rv, want) in [("2", EventKind::Modified), ("3", EventKind::Deleted)] {
            let item = instance
                .data_set()
                .get(&Suid::from_custom(format!("v1,Pod,default/web,{rv}")))
                .unwrap();
            let envelope: Envelope = serde_json::from_slice(&item.value).unwrap();
            assert_eq!(envelope.kind, want);
        }
    }
}
