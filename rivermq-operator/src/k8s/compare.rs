//! The resource diff engine.
//!
//! Compares the desired managed object set of a cluster against what is actually deployed and
//! partitions the result into added / updated / removed deltas. Comparison is spec-level only:
//! platform-populated metadata and server-assigned spec fields (cluster IPs, node ports) never
//! produce a diff, which is what keeps convergence passes idempotent.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::Client;
use tokio::time::timeout;

use crate::k8s::API_TIMEOUT;

/// The kinds of platform objects the diff engine manages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, derive_more::Display)]
pub enum ObjectKind {
    #[display(fmt = "StatefulSet")]
    StatefulSet,
    #[display(fmt = "Service")]
    Service,
    #[display(fmt = "Secret")]
    Secret,
    #[display(fmt = "Ingress")]
    Ingress,
}

/// A typed member of a cluster's managed object set.
#[derive(Clone, Debug)]
pub enum ManagedObject {
    StatefulSet(Box<StatefulSet>),
    Service(Box<Service>),
    Secret(Box<Secret>),
    Ingress(Box<Ingress>),
}

impl ManagedObject {
    /// This object's kind.
    pub fn kind(&self) -> ObjectKind {
        match self {
            ManagedObject::StatefulSet(_) => ObjectKind::StatefulSet,
            ManagedObject::Service(_) => ObjectKind::Service,
            ManagedObject::Secret(_) => ObjectKind::Secret,
            ManagedObject::Ingress(_) => ObjectKind::Ingress,
        }
    }

    /// This object's name.
    pub fn name(&self) -> String {
        self.metadata().name.clone().unwrap_or_default()
    }

    /// This object's metadata.
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            ManagedObject::StatefulSet(obj) => &obj.metadata,
            ManagedObject::Service(obj) => &obj.metadata,
            ManagedObject::Secret(obj) => &obj.metadata,
            ManagedObject::Ingress(obj) => &obj.metadata,
        }
    }

    /// Mutable access to this object's metadata.
    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            ManagedObject::StatefulSet(obj) => &mut obj.metadata,
            ManagedObject::Service(obj) => &mut obj.metadata,
            ManagedObject::Secret(obj) => &mut obj.metadata,
            ManagedObject::Ingress(obj) => &mut obj.metadata,
        }
    }

    /// Whether this object carries an owner reference with the given UID.
    pub fn is_owned_by(&self, uid: &str) -> bool {
        self.metadata()
            .owner_references
            .as_ref()
            .map(|refs| refs.iter().any(|owner| owner.uid == uid))
            .unwrap_or(false)
    }

    /// Spec-level equality against another object of the same kind and name.
    fn spec_equals(&self, other: &ManagedObject) -> bool {
        match (self, other) {
            (ManagedObject::StatefulSet(a), ManagedObject::StatefulSet(b)) => sts_spec_equals(a, b),
            (ManagedObject::Service(a), ManagedObject::Service(b)) => service_spec_equals(a, b),
            (ManagedObject::Secret(a), ManagedObject::Secret(b)) => secret_data_map(a) == secret_data_map(b),
            (ManagedObject::Ingress(a), ManagedObject::Ingress(b)) => a.spec == b.spec,
            _ => false,
        }
    }
}

/// The partitioned result of comparing desired against deployed objects.
#[derive(Debug, Default)]
pub struct Delta {
    /// Objects which are desired but not deployed.
    pub added: Vec<ManagedObject>,
    /// Objects deployed with a spec differing from the desired one.
    pub updated: Vec<ManagedObject>,
    /// Deployed objects with no desired counterpart.
    pub removed: Vec<ManagedObject>,
}

impl Delta {
    /// Whether the delta contains no work at all.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Compare a desired object set against the deployed set.
///
/// Identity is the pair (kind, name). Output ordering is deterministic regardless of input
/// ordering. An object appearing twice in the desired set keeps its last occurrence.
pub fn compare(desired: Vec<ManagedObject>, deployed: Vec<ManagedObject>) -> Delta {
    let mut deployed_by_id: BTreeMap<(ObjectKind, String), ManagedObject> =
        deployed.into_iter().map(|obj| ((obj.kind(), obj.name()), obj)).collect();
    let desired_by_id: BTreeMap<(ObjectKind, String), ManagedObject> =
        desired.into_iter().map(|obj| ((obj.kind(), obj.name()), obj)).collect();

    let mut delta = Delta::default();
    for (id, want) in desired_by_id {
        match deployed_by_id.remove(&id) {
            None => delta.added.push(want),
            Some(have) => {
                if !want.spec_equals(&have) {
                    delta.updated.push(want);
                }
            }
        }
    }
    delta.removed = deployed_by_id.into_iter().map(|(_, obj)| obj).collect();
    delta
}

/// Counts of what an apply pass did and what failed.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Apply a delta to the platform.
///
/// Created objects get the owning cluster's owner reference stamped on. Removals only touch
/// objects actually owned by the cluster. A failed operation is logged and counted, and the
/// rest of the delta is still applied; the caller decides whether the pass converged.
#[tracing::instrument(level = "debug", skip(client, owner, delta), fields(namespace = %namespace))]
pub async fn apply(client: &Client, namespace: &str, owner: &OwnerReference, delta: Delta) -> ApplyReport {
    let mut report = ApplyReport::default();
    for mut obj in delta.added {
        obj.metadata_mut().namespace = Some(namespace.into());
        obj.metadata_mut().owner_references.get_or_insert_with(Vec::new).push(owner.clone());
        match create_object(client, namespace, &obj).await {
            Ok(_) => {
                tracing::info!(kind = %obj.kind(), name = %obj.name(), "created managed object");
                report.created += 1;
            }
            Err(err) => {
                tracing::error!(error = ?err, kind = %obj.kind(), name = %obj.name(), "error creating managed object");
                report.failed += 1;
            }
        }
    }
    for obj in delta.updated {
        match update_object(client, namespace, obj.clone()).await {
            Ok(_) => {
                tracing::info!(kind = %obj.kind(), name = %obj.name(), "updated managed object");
                report.updated += 1;
            }
            Err(err) => {
                tracing::error!(error = ?err, kind = %obj.kind(), name = %obj.name(), "error updating managed object");
                report.failed += 1;
            }
        }
    }
    for obj in delta.removed {
        if !obj.is_owned_by(&owner.uid) {
            tracing::debug!(kind = %obj.kind(), name = %obj.name(), "skipping removal of unowned object");
            continue;
        }
        match delete_object(client, namespace, &obj).await {
            Ok(_) => {
                tracing::info!(kind = %obj.kind(), name = %obj.name(), "deleted managed object");
                report.deleted += 1;
            }
            Err(err) => {
                tracing::error!(error = ?err, kind = %obj.kind(), name = %obj.name(), "error deleting managed object");
                report.failed += 1;
            }
        }
    }
    report
}

/// Fetch the deployed managed object set of a cluster, scoped by the cluster's label.
pub async fn fetch_deployed(client: &Client, namespace: &str, cluster_name: &str) -> Result<Vec<ManagedObject>> {
    let selector = format!(
        "{},{}={}",
        rivermq_core::RIVERMQ_OPERATOR_LABEL_SELECTORS,
        crate::k8s::LABEL_RIVERMQ_CLUSTER,
        cluster_name
    );
    let params = ListParams { label_selector: Some(selector), ..Default::default() };
    let mut deployed = Vec::new();

    let api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
    let list = timeout(API_TIMEOUT, api.list(&params))
        .await
        .context("timeout while listing deployed statefulsets")?
        .context("error listing deployed statefulsets")?;
    deployed.extend(list.items.into_iter().map(|obj| ManagedObject::StatefulSet(Box::new(obj))));

    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    let list = timeout(API_TIMEOUT, api.list(&params))
        .await
        .context("timeout while listing deployed services")?
        .context("error listing deployed services")?;
    deployed.extend(list.items.into_iter().map(|obj| ManagedObject::Service(Box::new(obj))));

    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let list = timeout(API_TIMEOUT, api.list(&params))
        .await
        .context("timeout while listing deployed secrets")?
        .context("error listing deployed secrets")?;
    deployed.extend(list.items.into_iter().map(|obj| ManagedObject::Secret(Box::new(obj))));

    let api: Api<Ingress> = Api::namespaced(client.clone(), namespace);
    let list = timeout(API_TIMEOUT, api.list(&params))
        .await
        .context("timeout while listing deployed ingresses")?
        .context("error listing deployed ingresses")?;
    deployed.extend(list.items.into_iter().map(|obj| ManagedObject::Ingress(Box::new(obj))));

    Ok(deployed)
}

async fn create_object(client: &Client, namespace: &str, obj: &ManagedObject) -> Result<()> {
    let params = PostParams::default();
    match obj {
        ManagedObject::StatefulSet(sts) => {
            let api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
            timeout(API_TIMEOUT, api.create(&params, sts))
                .await
                .context("timeout while creating statefulset")?
                .context("error creating statefulset")?;
        }
        ManagedObject::Service(svc) => {
            let api: Api<Service> = Api::namespaced(client.clone(), namespace);
            timeout(API_TIMEOUT, api.create(&params, svc))
                .await
                .context("timeout while creating service")?
                .context("error creating service")?;
        }
        ManagedObject::Secret(secret) => {
            let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
            timeout(API_TIMEOUT, api.create(&params, secret))
                .await
                .context("timeout while creating secret")?
                .context("error creating secret")?;
        }
        ManagedObject::Ingress(ingress) => {
            let api: Api<Ingress> = Api::namespaced(client.clone(), namespace);
            timeout(API_TIMEOUT, api.create(&params, ingress))
                .await
                .context("timeout while creating ingress")?
                .context("error creating ingress")?;
        }
    }
    Ok(())
}

/// Update a deployed object by fetching the live copy and grafting the desired spec onto it.
///
/// The live metadata is kept so resource versions, UIDs and owner references survive the
/// replace; server-assigned Service fields are carried over for the same reason.
async fn update_object(client: &Client, namespace: &str, obj: ManagedObject) -> Result<()> {
    let params = PostParams::default();
    let name = obj.name();
    match obj {
        ManagedObject::StatefulSet(mut sts) => {
            let api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
            let live = timeout(API_TIMEOUT, api.get(&name))
                .await
                .context("timeout while fetching statefulset for update")?
                .context("error fetching statefulset for update")?;
            sts.metadata = live.metadata;
            timeout(API_TIMEOUT, api.replace(&name, &params, &sts))
                .await
                .context("timeout while updating statefulset")?
                .context("error updating statefulset")?;
        }
        ManagedObject::Service(mut svc) => {
            let api: Api<Service> = Api::namespaced(client.clone(), namespace);
            let live = timeout(API_TIMEOUT, api.get(&name))
                .await
                .context("timeout while fetching service for update")?
                .context("error fetching service for update")?;
            if let (Some(spec), Some(live_spec)) = (svc.spec.as_mut(), live.spec.as_ref()) {
                spec.cluster_ip = live_spec.cluster_ip.clone();
                spec.cluster_ips = live_spec.cluster_ips.clone();
            }
            svc.metadata = live.metadata;
            timeout(API_TIMEOUT, api.replace(&name, &params, &svc))
                .await
                .context("timeout while updating service")?
                .context("error updating service")?;
        }
        ManagedObject::Secret(mut secret) => {
            let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
            let live = timeout(API_TIMEOUT, api.get(&name))
                .await
                .context("timeout while fetching secret for update")?
                .context("error fetching secret for update")?;
            secret.metadata = live.metadata;
            // Replace with string_data only so stale keys are dropped.
            secret.data = None;
            timeout(API_TIMEOUT, api.replace(&name, &params, &secret))
                .await
                .context("timeout while updating secret")?
                .context("error updating secret")?;
        }
        ManagedObject::Ingress(mut ingress) => {
            let api: Api<Ingress> = Api::namespaced(client.clone(), namespace);
            let live = timeout(API_TIMEOUT, api.get(&name))
                .await
                .context("timeout while fetching ingress for update")?
                .context("error fetching ingress for update")?;
            ingress.metadata = live.metadata;
            timeout(API_TIMEOUT, api.replace(&name, &params, &ingress))
                .await
                .context("timeout while updating ingress")?
                .context("error updating ingress")?;
        }
    }
    Ok(())
}

async fn delete_object(client: &Client, namespace: &str, obj: &ManagedObject) -> Result<()> {
    let name = obj.name();
    let params = DeleteParams::default();
    let res = match obj {
        ManagedObject::StatefulSet(_) => {
            let api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
            timeout(API_TIMEOUT, api.delete(&name, &params))
                .await
                .context("timeout while deleting statefulset")?
                .map(|_| ())
        }
        ManagedObject::Service(_) => {
            let api: Api<Service> = Api::namespaced(client.clone(), namespace);
            timeout(API_TIMEOUT, api.delete(&name, &params))
                .await
                .context("timeout while deleting service")?
                .map(|_| ())
        }
        ManagedObject::Secret(_) => {
            let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
            timeout(API_TIMEOUT, api.delete(&name, &params))
                .await
                .context("timeout while deleting secret")?
                .map(|_| ())
        }
        ManagedObject::Ingress(_) => {
            let api: Api<Ingress> = Api::namespaced(client.clone(), namespace);
            timeout(API_TIMEOUT, api.delete(&name, &params))
                .await
                .context("timeout while deleting ingress")?
                .map(|_| ())
        }
    };
    match res {
        Ok(_) => Ok(()),
        // An already-absent object is the desired end state.
        Err(kube::Error::Api(err)) if err.code == http::StatusCode::NOT_FOUND => Ok(()),
        Err(err) => Err(err).context("error deleting managed object"),
    }
}

/// Spec-level equality for StatefulSets over the fields this operator manages.
///
/// A deployed StatefulSet carries a raft of server-defaulted fields the desired template never
/// sets, so equality is a projection of the managed fields rather than a whole-spec compare.
fn sts_spec_equals(a: &StatefulSet, b: &StatefulSet) -> bool {
    let project = |sts: &StatefulSet| {
        sts.spec.as_ref().map(|spec| {
            // Only the roll count is compared from the pod-template annotations; other
            // systems are free to annotate pod templates without fighting this operator.
            let roll_count = spec
                .template
                .metadata
                .as_ref()
                .and_then(|meta| meta.annotations.as_ref())
                .and_then(|annotations| annotations.get(crate::k8s::channel::ROLL_COUNT_ANNOTATION))
                .cloned();
            let containers: Vec<_> = spec
                .template
                .spec
                .as_ref()
                .map(|pod| {
                    pod.containers
                        .iter()
                        .map(|container| {
                            let mut env = container.env.clone().unwrap_or_default();
                            env.sort_by(|a, b| a.name.cmp(&b.name));
                            let mut ports: Vec<_> = container
                                .ports
                                .iter()
                                .flatten()
                                .map(|port| (port.name.clone(), port.container_port))
                                .collect();
                            ports.sort();
                            (container.name.clone(), container.image.clone(), env, ports, container.volume_mounts.clone())
                        })
                        .collect()
                })
                .unwrap_or_default();
            let claims: Vec<_> = spec
                .volume_claim_templates
                .iter()
                .flatten()
                .map(|claim| {
                    (
                        claim.metadata.name.clone(),
                        claim.spec.as_ref().and_then(|spec| {
                            spec.resources.as_ref().and_then(|res| res.requests.clone())
                        }),
                    )
                })
                .collect();
            (
                spec.replicas,
                spec.service_name.clone(),
                spec.selector.match_labels.clone(),
                roll_count,
                containers,
                claims,
            )
        })
    };
    project(a) == project(b)
}

/// Spec-level equality for Services over the fields this operator manages.
fn service_spec_equals(a: &Service, b: &Service) -> bool {
    let project = |svc: &Service| {
        svc.spec.as_ref().map(|spec| {
            let mut ports: Vec<_> = spec
                .ports
                .iter()
                .flatten()
                .map(|port| (port.name.clone(), port.port))
                .collect();
            ports.sort();
            (spec.selector.clone(), ports, spec.publish_not_ready_addresses)
        })
    };
    project(a) == project(b)
}

/// Normalize a Secret's content to a byte map regardless of which field carries it.
fn secret_data_map(secret: &Secret) -> BTreeMap<String, Vec<u8>> {
    let mut map = BTreeMap::new();
    if let Some(data) = secret.data.as_ref() {
        for (key, val) in data {
            map.insert(key.clone(), val.0.clone());
        }
    }
    if let Some(data) = secret.string_data.as_ref() {
        for (key, val) in data {
            map.insert(key.clone(), val.clone().into_bytes());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::StatefulSetSpec;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use k8s_openapi::ByteString;
    use maplit::btreemap;

    fn named_meta(name: &str) -> ObjectMeta {
        ObjectMeta { name: Some(name.into()), ..Default::default() }
    }

    fn sts(name: &str, replicas: i32) -> ManagedObject {
        ManagedObject::StatefulSet(Box::new(StatefulSet {
            metadata: named_meta(name),
            spec: Some(StatefulSetSpec { replicas: Some(replicas), ..Default::default() }),
            ..Default::default()
        }))
    }

    fn svc(name: &str, port: i32) -> ManagedObject {
        ManagedObject::Service(Box::new(Service {
            metadata: named_meta(name),
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort { port, ..Default::default() }]),
                ..Default::default()
            }),
            ..Default::default()
        }))
    }

    fn secret(name: &str, key: &str, val: &str) -> ManagedObject {
        ManagedObject::Secret(Box::new(Secret {
            metadata: named_meta(name),
            string_data: Some(btreemap! {key.to_string() => val.to_string()}),
            ..Default::default()
        }))
    }

    #[test]
    fn compare_partitions_added_updated_removed() {
        let desired = vec![sts("mq", 3), svc("mq-hs", 5672), secret("mq-credentials", "RIVERMQ_USER", "admin")];
        let deployed = vec![sts("mq", 1), svc("mq-hs", 5672), svc("stale", 80)];
        let delta = compare(desired, deployed);

        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.added[0].name(), "mq-credentials");
        assert_eq!(delta.updated.len(), 1);
        assert_eq!(delta.updated[0].name(), "mq");
        assert_eq!(delta.removed.len(), 1);
        assert_eq!(delta.removed[0].name(), "stale");
    }

    #[test]
    fn compare_is_deterministic_over_input_order() {
        let desired = || vec![svc("b", 2), sts("a", 1), secret("c", "k", "v")];
        let mut reversed = desired();
        reversed.reverse();
        let a = compare(desired(), vec![]);
        let b = compare(reversed, vec![]);
        let names = |delta: &Delta| delta.added.iter().map(|o| (o.kind(), o.name())).collect::<Vec<_>>();
        assert_eq!(names(&a), names(&b));
    }

    #[test]
    fn equal_sets_produce_empty_delta() {
        let delta = compare(vec![sts("mq", 3), svc("mq-hs", 5672)], vec![sts("mq", 3), svc("mq-hs", 5672)]);
        assert!(delta.is_empty());
    }

    #[test]
    fn service_equality_ignores_server_assigned_fields() {
        let desired = svc("mq-hs", 5672);
        let mut deployed_inner = Service {
            metadata: named_meta("mq-hs"),
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.0.0.17".into()),
                cluster_ips: Some(vec!["10.0.0.17".into()]),
                ports: Some(vec![ServicePort { port: 5672, node_port: Some(30001), ..Default::default() }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        deployed_inner.metadata.resource_version = Some("41".into());
        let delta = compare(vec![desired], vec![ManagedObject::Service(Box::new(deployed_inner))]);
        assert!(delta.is_empty());
    }

    #[test]
    fn secret_equality_normalizes_data_representations() {
        let desired = secret("mq-credentials", "RIVERMQ_USER", "admin");
        let deployed = ManagedObject::Secret(Box::new(Secret {
            metadata: named_meta("mq-credentials"),
            data: Some(btreemap! {"RIVERMQ_USER".to_string() => ByteString(b"admin".to_vec())}),
            ..Default::default()
        }));
        assert!(compare(vec![desired], vec![deployed]).is_empty());
    }

    #[test]
    fn replica_change_is_an_update_not_a_replace() {
        let deployed = vec![sts("mq", 1), svc("mq-hs", 5672)];
        let delta = compare(vec![sts("mq", 3), svc("mq-hs", 5672)], deployed);
        assert!(delta.added.is_empty());
        assert!(delta.removed.is_empty());
        assert_eq!(delta.updated.len(), 1);
        assert_eq!(delta.updated[0].kind(), ObjectKind::StatefulSet);
    }
}
