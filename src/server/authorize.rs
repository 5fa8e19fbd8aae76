//! First-contact authorisation: node annotations to NodeSet scopes.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule, Role};
use kube::api::Api;
use kube::Client;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, warn};

use outpost_sync::suid::Suid;
use outpost_sync::Instance;

use crate::kubernetes::{pluralize, MetaKey};
use crate::nodeset::{Key, NodeSet};

/// Comma-separated cluster roles whose rules scope the agent.
pub const ANNOTATION_CLUSTERROLE: &str = "outpost.io/relate-clusterrole";

/// Namespaced roles in `ns1:role1,role2; ns2:role3` form.
pub const ANNOTATION_ROLE: &str = "outpost.io/relate-role";

#[derive(Debug, Snafu)]
pub enum AuthorizeError {
    #[snafu(display("no cluster client available"))]
    NoCluster,

    #[snafu(display("failed to look up node {node}: {source}"))]
    NodeLookup { node: String, source: kube::Error },

    #[snafu(display("failed to look up cluster role {role}: {source}"))]
    ClusterRoleLookup { role: String, source: kube::Error },

    #[snafu(display("failed to look up role {namespace}/{role}: {source}"))]
    RoleLookup {
        namespace: String,
        role: String,
        source: kube::Error,
    },

    #[snafu(display("failed to seed agent queue: {source}"))]
    Seed { source: outpost_sync::Error },
}

/// Resolves an agent's scopes from its node annotations, registers them,
/// and seeds the agent's queue with every existing entry it is entitled
/// to. Called exactly once per agent per server lifetime.
pub async fn resolve(
    client: Option<&Client>,
    node_set: &NodeSet,
    instance: &Arc<Instance>,
    node_name: &str,
) -> Result<(), AuthorizeError> {
    let client = client.context(NoClusterSnafu)?;

    let node: Node = Api::all(client.clone())
        .get(node_name)
        .await
        .context(NodeLookupSnafu { node: node_name })?;
    let annotations = node.metadata.annotations.unwrap_or_default();

    let cluster_roles = annotations.get(ANNOTATION_CLUSTERROLE);
    let roles = annotations.get(ANNOTATION_ROLE);

    let mut keys = Vec::new();
    if let Some(names) = cluster_roles {
        for name in split_list(names) {
            let role: ClusterRole = Api::all(client.clone())
                .get(name)
                .await
                .context(ClusterRoleLookupSnafu { role: name })?;
            // Cluster-wide grants scope to every namespace.
            rule_keys(&mut keys, role.rules.as_deref().unwrap_or_default(), "*");
        }
    }
    if let Some(spec) = roles {
        for (namespace, name) in split_role_spec(spec) {
            let role: Role = Api::namespaced(client.clone(), namespace)
                .get(name)
                .await
                .context(RoleLookupSnafu {
                    namespace,
                    role: name,
                })?;
            rule_keys(&mut keys, role.rules.as_deref().unwrap_or_default(), namespace);
        }
    }
    if cluster_roles.is_none() && roles.is_none() {
        keys.push(Key::any());
    }

    debug!(
        message = "Resolved agent authorisation.",
        node = %node_name,
        scopes = keys.len(),
    );
    node_set.set(node_name, &keys);

    seed(node_set, instance, node_name)
}

fn rule_keys(keys: &mut Vec<Key>, rules: &[PolicyRule], namespace: &str) {
    for rule in rules {
        let groups = rule.api_groups.as_deref().unwrap_or_default();
        let resources = rule.resources.as_deref().unwrap_or_default();
        for group in groups {
            for resource in resources {
                keys.push(Key::new(group.clone(), resource.clone(), namespace));
            }
        }
    }
}

/// Enqueues the latest version of every already-known resource the agent
/// is entitled to, so a brand-new agent converges without waiting for
/// fresh cluster churn.
fn seed(
    node_set: &NodeSet,
    instance: &Arc<Instance>,
    node_name: &str,
) -> Result<(), AuthorizeError> {
    let mut uids: Vec<Suid> = Vec::new();
    instance
        .data_set()
        .range_custom(&mut |uid| {
            let Some(tag) = uid.custom() else {
                return true;
            };
            let Ok(meta) = MetaKey::parse(tag) else {
                warn!(message = "Skipping unparseable relate tag.", tag = %tag);
                return true;
            };
            let key = Key::new(meta.group.clone(), pluralize(&meta.kind), meta.namespace);
            if node_set.get_union(&key).contains(node_name) {
                uids.push(uid.clone());
            }
            true
        })
        .context(SeedSnafu)?;

    if uids.is_empty() {
        return Ok(());
    }
    debug!(
        message = "Seeding agent queue.",
        node = %node_name,
        entries = uids.len(),
    );
    instance
        .syncer(node_name)
        .add(&uids)
        .context(SeedSnafu)
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Parses `ns1:role1,role2; ns2:role3` into `(namespace, role)` pairs.
fn split_role_spec(value: &str) -> Vec<(&str, &str)> {
    let mut pairs = Vec::new();
    for entry in value.split(';') {
        let Some((namespace, names)) = entry.split_once(':') else {
            continue;
        };
        let namespace = namespace.trim();
        if namespace.is_empty() {
            continue;
        }
        for name in split_list(names) {
            pairs.push((namespace, name));
        }
    }
    pairs
}
