//! Crash-recovery snapshots.
//!
//! After every successful convergence pass the owning worker persists a snapshot of the
//! cluster's reconciliation record to a dedicated Secret, keyed by the declaration's revision
//! token. On restart, a matching token means the last pass fully covered the declaration and
//! first-sight processing can be skipped outright; a mismatch means the record is rehydrated
//! and a normal pass picks up from where the previous process left off.
//!
//! Snapshot Secrets deliberately do not carry the cluster label, keeping them outside the
//! managed object set the diff engine owns. They do carry the cluster's owner reference, so
//! platform garbage collection reclaims them even when the deletion is never observed.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::k8s::fsm::FsmState;
use crate::k8s::{ClusterKey, API_TIMEOUT};
use rivermq_core::crd::BrokerCluster;

const KEY_RECORD: &str = "record";
const KEY_CHECKSUM: &str = "checksum";

/// The serializable payload of a reconciliation record.
///
/// The cached workload template is derived data and is not part of the snapshot; it is rebuilt
/// deterministically on the first pass after rehydration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// The machine's active state.
    pub state: FsmState,
    /// The last declaration generation processed for semantic changes.
    pub last_generation: i64,
    /// The previously processed declaration.
    pub previous: BrokerCluster,
    /// The declaration the snapshot covers.
    pub declaration: BrokerCluster,
}

/// A snapshot as retrieved from the platform.
#[derive(Clone, Debug)]
pub struct StoredSnapshot {
    /// The revision token of the declaration the snapshot covers.
    pub checksum: String,
    /// The record payload.
    pub record: SnapshotRecord,
}

/// What first-sight processing must do given the stored snapshot and the sighted declaration.
#[derive(Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    /// No snapshot; treat the declaration as brand new.
    FreshStart,
    /// The snapshot covers exactly this revision; restore the record and do nothing else.
    SkipPass,
    /// The declaration moved while we were away; restore the record and run a pass.
    Resume,
}

/// Decide the first-sight recovery action.
pub fn recovery_action(stored: Option<&StoredSnapshot>, revision: &str) -> RecoveryAction {
    match stored {
        None => RecoveryAction::FreshStart,
        Some(snap) if !revision.is_empty() && snap.checksum == revision => RecoveryAction::SkipPass,
        Some(_) => RecoveryAction::Resume,
    }
}

/// The Secret-backed store for one namespace's snapshots.
pub struct SnapshotStore {
    api: Api<Secret>,
}

impl SnapshotStore {
    /// Create a new store scoped to the given namespace.
    pub fn new(client: Client, namespace: &str) -> Self {
        Self { api: Api::namespaced(client, namespace) }
    }

    /// The name of the snapshot Secret for a cluster.
    pub fn secret_name(cluster_name: &str) -> String {
        format!("rivermq-snapshot-{}", cluster_name)
    }

    /// Retrieve the stored snapshot for a cluster, if any.
    ///
    /// A corrupt snapshot is logged and treated as not found; losing a snapshot only costs one
    /// redundant convergence pass.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn retrieve(&self, key: &ClusterKey) -> Result<Option<StoredSnapshot>> {
        let name = Self::secret_name(&key.name);
        let secret = match timeout(API_TIMEOUT, self.api.get(&name))
            .await
            .context("timeout while fetching recovery snapshot")?
        {
            Ok(secret) => secret,
            Err(kube::Error::Api(err)) if err.code == http::StatusCode::NOT_FOUND => return Ok(None),
            Err(err) => return Err(err).context("error fetching recovery snapshot"),
        };
        match decode(&secret) {
            Ok(snap) => Ok(Some(snap)),
            Err(err) => {
                tracing::warn!(error = ?err, cluster = %key, "corrupt recovery snapshot, discarding");
                Ok(None)
            }
        }
    }

    /// Persist a snapshot, creating or replacing the backing Secret.
    #[tracing::instrument(level = "debug", skip(self, record))]
    pub async fn store(&self, key: &ClusterKey, checksum: &str, record: &SnapshotRecord) -> Result<()> {
        let name = Self::secret_name(&key.name);
        let mut secret = snapshot_secret(key, checksum, record)?;

        let live = match timeout(API_TIMEOUT, self.api.get(&name))
            .await
            .context("timeout while fetching recovery snapshot for store")?
        {
            Ok(live) => Some(live),
            Err(kube::Error::Api(err)) if err.code == http::StatusCode::NOT_FOUND => None,
            Err(err) => return Err(err).context("error fetching recovery snapshot for store"),
        };
        match live {
            None => {
                timeout(API_TIMEOUT, self.api.create(&PostParams::default(), &secret))
                    .await
                    .context("timeout while creating recovery snapshot")?
                    .context("error creating recovery snapshot")?;
            }
            Some(live) => {
                let owner_references = secret.metadata.owner_references.take();
                secret.metadata = live.metadata;
                secret.metadata.owner_references = owner_references;
                timeout(API_TIMEOUT, self.api.replace(&name, &PostParams::default(), &secret))
                    .await
                    .context("timeout while updating recovery snapshot")?
                    .context("error updating recovery snapshot")?;
            }
        }
        Ok(())
    }

    /// Delete a cluster's snapshot. An already-absent snapshot is success.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete(&self, key: &ClusterKey) -> Result<()> {
        let name = Self::secret_name(&key.name);
        let res = timeout(API_TIMEOUT, self.api.delete(&name, &DeleteParams::default()))
            .await
            .context("timeout while deleting recovery snapshot")?;
        match res {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == http::StatusCode::NOT_FOUND => Ok(()),
            Err(err) => Err(err).context("error deleting recovery snapshot"),
        }
    }
}

/// Build the snapshot Secret for a record.
///
/// The Secret is stamped with the declared cluster's owner reference so the platform reclaims
/// it together with the cluster. The cluster label is deliberately absent: snapshots stay
/// outside the managed object set the diff engine owns.
fn snapshot_secret(key: &ClusterKey, checksum: &str, record: &SnapshotRecord) -> Result<Secret> {
    let payload = serde_json::to_string(record).context("error serializing recovery snapshot")?;
    let mut labels = crate::k8s::canonical_labels();
    labels.insert("rivermq.io/snapshot".into(), key.name.clone());
    let owner_references =
        crate::k8s::reconciler::owner_reference(&record.declaration).ok().map(|owner| vec![owner]);
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(SnapshotStore::secret_name(&key.name)),
            namespace: Some(key.namespace.clone()),
            labels: Some(labels),
            owner_references,
            ..Default::default()
        },
        string_data: Some(maplit::btreemap! {
            KEY_RECORD.to_string() => payload,
            KEY_CHECKSUM.to_string() => checksum.to_string(),
        }),
        ..Default::default()
    })
}

fn decode(secret: &Secret) -> Result<StoredSnapshot> {
    let checksum = crate::k8s::channel::secret_value(secret, KEY_CHECKSUM)
        .context("recovery snapshot is missing its checksum")?;
    let payload = crate::k8s::channel::secret_value(secret, KEY_RECORD)
        .context("recovery snapshot is missing its record")?;
    let record: SnapshotRecord = serde_json::from_str(&payload).context("error deserializing recovery snapshot")?;
    Ok(StoredSnapshot { checksum, record })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use rivermq_core::crd::{BrokerClusterSpec, DeploymentPlan, LoggerSpec};

    fn record() -> SnapshotRecord {
        let spec = BrokerClusterSpec {
            deployment_plan: DeploymentPlan { replicas: 2, image: "rivermq/broker:2.1".into(), ..Default::default() },
            ..Default::default()
        };
        let mut declaration = BrokerCluster::new("mq", spec);
        declaration.metadata.generation = Some(4);
        let mut previous = declaration.clone();
        previous.spec.logging.loggers = vec![LoggerSpec { name: "audit".into(), level: Some("INFO".into()) }];
        SnapshotRecord { state: FsmState::Running, last_generation: 4, previous, declaration }
    }

    #[test]
    fn record_round_trips_losslessly() {
        let record = record();
        let payload = serde_json::to_string(&record).unwrap();
        let restored: SnapshotRecord = serde_json::from_str(&payload).unwrap();
        assert_eq!(restored.state, record.state);
        assert_eq!(restored.last_generation, record.last_generation);
        assert_eq!(restored.declaration, record.declaration);
        assert_eq!(restored.previous, record.previous);
    }

    #[test]
    fn recovery_action_decision_table() {
        let stored = StoredSnapshot { checksum: "812".into(), record: record() };
        assert_eq!(recovery_action(None, "812"), RecoveryAction::FreshStart);
        assert_eq!(recovery_action(Some(&stored), "812"), RecoveryAction::SkipPass);
        assert_eq!(recovery_action(Some(&stored), "977"), RecoveryAction::Resume);
        // A declaration with no revision token can never be proven covered.
        assert_eq!(recovery_action(Some(&stored), ""), RecoveryAction::Resume);
    }

    #[test]
    fn snapshot_secret_is_owned_by_its_cluster() {
        let mut record = record();
        record.declaration.metadata.uid = Some("6f1d6a54".into());
        let key = ClusterKey::new("default", "mq");
        let secret = snapshot_secret(&key, "812", &record).unwrap();
        let owners = secret.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "BrokerCluster");
        assert_eq!(owners[0].uid, "6f1d6a54");
        // Never the cluster label: the diff engine must not own snapshots.
        assert!(!secret.metadata.labels.unwrap().contains_key(crate::k8s::LABEL_RIVERMQ_CLUSTER));
    }

    #[test]
    fn corrupt_payload_is_treated_as_absent() {
        let secret = Secret {
            data: Some(maplit::btreemap! {
                KEY_RECORD.to_string() => ByteString(b"not json".to_vec()),
                KEY_CHECKSUM.to_string() => ByteString(b"812".to_vec()),
            }),
            ..Default::default()
        };
        assert!(decode(&secret).is_err());
    }
}
