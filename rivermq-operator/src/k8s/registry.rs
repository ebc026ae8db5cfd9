//! The cluster worker registry.
//!
//! Every declared cluster is pinned to exactly one worker task which owns its state machine
//! and processes that cluster's events strictly in arrival order over an unbounded channel.
//! Different clusters converge concurrently on independent tasks; the registry map only
//! guards worker lookup, never convergence work, so no lock is ever held across I/O.

use std::sync::Arc;

use dashmap::DashMap;
use kube::{Client, Resource};
use tokio::sync::mpsc;

use crate::k8s::fsm::ClusterFsm;
use crate::k8s::reconciler::{self, ReconcileContext};
use crate::k8s::recovery::{recovery_action, RecoveryAction, SnapshotStore};
use crate::k8s::ClusterKey;
use rivermq_core::crd::BrokerCluster;
use rivermq_core::ReconcileError;

/// An event for a single cluster's worker.
pub enum ClusterEvent {
    /// The declaration was created or updated.
    Applied(Box<BrokerCluster>),
    /// The declaration was deleted.
    Deleted,
    /// Scheduled resync: re-run a convergence pass against the current declaration.
    Resync,
}

/// The registry of per-cluster workers.
pub struct ClusterRegistry {
    client: Client,
    workers: DashMap<ClusterKey, mpsc::UnboundedSender<ClusterEvent>>,
}

impl ClusterRegistry {
    pub fn new(client: Client) -> Arc<Self> {
        Arc::new(Self { client, workers: DashMap::new() })
    }

    /// Route an event to the cluster's worker, spawning one on first sight.
    ///
    /// Sends never block, so a slow cluster can never stall event routing for the others.
    pub fn dispatch(self: &Arc<Self>, key: ClusterKey, event: ClusterEvent) {
        let undelivered = {
            match self.workers.get(&key) {
                Some(tx) => match tx.send(event) {
                    Ok(()) => return,
                    // The worker has exited; fall through and spawn a fresh one.
                    Err(err) => err.0,
                },
                None => event,
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(undelivered);
        self.workers.insert(key.clone(), tx.clone());
        let this = self.clone();
        tokio::spawn(async move { this.run_worker(key, tx, rx).await });
    }

    /// Queue a resync pass onto every live worker.
    pub fn resync(&self) {
        for entry in self.workers.iter() {
            let _ = entry.value().send(ClusterEvent::Resync);
        }
    }

    async fn run_worker(
        self: Arc<Self>, key: ClusterKey, tx: mpsc::UnboundedSender<ClusterEvent>,
        mut rx: mpsc::UnboundedReceiver<ClusterEvent>,
    ) {
        tracing::debug!(cluster = %key, "cluster worker started");
        let store = SnapshotStore::new(self.client.clone(), &key.namespace);
        let ctx = ReconcileContext { client: self.client.clone() };
        let mut fsm: Option<ClusterFsm> = None;
        while let Some(event) = rx.recv().await {
            match event {
                ClusterEvent::Applied(cluster) => {
                    self.handle_applied(&key, &store, &ctx, &mut fsm, *cluster).await;
                }
                ClusterEvent::Resync => {
                    if let Some(machine) = fsm.as_mut() {
                        match machine.update(&ctx).await {
                            Ok(summary) if summary.fully_applied => persist_snapshot(&store, &key, machine).await,
                            Ok(_) => {
                                tracing::debug!(cluster = %key, "pass left objects unapplied, holding snapshot for retry");
                            }
                            Err(err) => {
                                tracing::error!(error = %err, cluster = %key, "error during resync convergence pass");
                                surface_invalid(&ctx, &key, &err).await;
                            }
                        }
                    }
                }
                ClusterEvent::Deleted => {
                    // Unregister before any await so replacement events spawn a fresh worker.
                    retire_worker(&self.workers, &key, &tx);
                    if let Err(err) = store.delete(&key).await {
                        tracing::error!(error = ?err, cluster = %key, "error deleting recovery snapshot");
                    }
                    if let Some(machine) = fsm.take() {
                        machine.exit();
                    }
                    break;
                }
            }
        }
        retire_worker(&self.workers, &key, &tx);
        tracing::debug!(cluster = %key, "cluster worker stopped");
    }

    /// Handle a created or updated declaration.
    ///
    /// First sight consults the crash-recovery snapshot: a snapshot covering exactly this
    /// revision means the last process fully converged it and no pass is needed at all.
    async fn handle_applied(
        &self, key: &ClusterKey, store: &SnapshotStore, ctx: &ReconcileContext, fsm: &mut Option<ClusterFsm>,
        cluster: BrokerCluster,
    ) {
        if let Some(machine) = fsm.as_mut() {
            machine.update_declaration(cluster);
            match machine.update(ctx).await {
                Ok(summary) if summary.fully_applied => persist_snapshot(store, key, machine).await,
                Ok(_) => tracing::debug!(cluster = %key, "pass left objects unapplied, holding snapshot for retry"),
                Err(err) => {
                    tracing::error!(error = %err, cluster = %key, "error during convergence pass");
                    surface_invalid(ctx, key, &err).await;
                }
            }
            return;
        }

        let revision = cluster.meta().resource_version.clone().unwrap_or_default();
        let stored = match store.retrieve(key).await {
            Ok(stored) => stored,
            Err(err) => {
                tracing::error!(error = ?err, cluster = %key, "error retrieving recovery snapshot, treating as fresh start");
                None
            }
        };
        match (recovery_action(stored.as_ref(), &revision), stored) {
            (RecoveryAction::SkipPass, Some(snap)) => {
                tracing::info!(cluster = %key, "recovery snapshot covers current revision, skipping first-sight pass");
                *fsm = Some(ClusterFsm::from_snapshot(key.clone(), snap.record));
            }
            (RecoveryAction::Resume, Some(snap)) => {
                tracing::info!(cluster = %key, "declaration moved while offline, resuming from recovery snapshot");
                let mut machine = ClusterFsm::from_snapshot(key.clone(), snap.record);
                machine.update_declaration(cluster);
                match machine.update(ctx).await {
                    Ok(summary) if summary.fully_applied => persist_snapshot(store, key, &machine).await,
                    Ok(_) => tracing::debug!(cluster = %key, "pass left objects unapplied, holding snapshot for retry"),
                    Err(err) => {
                        tracing::error!(error = %err, cluster = %key, "error during resumed convergence pass");
                        surface_invalid(ctx, key, &err).await;
                    }
                }
                *fsm = Some(machine);
            }
            _ => {
                let mut machine = match ClusterFsm::new(key.clone(), cluster) {
                    Ok(machine) => machine,
                    Err(err) => {
                        tracing::error!(error = %err, cluster = %key, "invalid cluster declaration, refusing to manage");
                        surface_invalid(ctx, key, &err).await;
                        return;
                    }
                };
                match machine.enter(ctx).await {
                    Ok(fully_applied) => {
                        if fully_applied {
                            persist_snapshot(store, key, &machine).await;
                        }
                        *fsm = Some(machine);
                    }
                    Err(err) => {
                        tracing::error!(error = %err, cluster = %key, "error establishing cluster record");
                        surface_invalid(ctx, key, &err).await;
                    }
                }
            }
        }
    }
}

/// Drop a worker's registry entry, but never a successor's.
///
/// A worker can race its own replacement: dispatch may spawn a fresh worker for the same key
/// while the old one is still unwinding. Guarding the removal by channel identity keeps the
/// retiring worker from evicting the live sender.
fn retire_worker(
    workers: &DashMap<ClusterKey, mpsc::UnboundedSender<ClusterEvent>>, key: &ClusterKey,
    tx: &mpsc::UnboundedSender<ClusterEvent>,
) {
    workers.remove_if(key, |_, live| live.same_channel(tx));
}

/// Persist a worker's record after a fully applied pass. Failures only cost a redundant pass.
async fn persist_snapshot(store: &SnapshotStore, key: &ClusterKey, machine: &ClusterFsm) {
    let record = machine.snapshot();
    if let Err(err) = store.store(key, &machine.revision_token(), &record).await {
        tracing::error!(error = ?err, cluster = %key, "error persisting recovery snapshot");
    }
}

/// Write an invalid declaration onto the cluster's status so the failure is visible without
/// operator logs.
async fn surface_invalid(ctx: &ReconcileContext, key: &ClusterKey, err: &ReconcileError) {
    if !matches!(err, ReconcileError::InvalidDeclaration(_)) {
        return;
    }
    if let Err(patch_err) = reconciler::post_invalid_condition(ctx, key, &err.to_string()).await {
        tracing::error!(error = ?patch_err, cluster = %key, "error surfacing invalid declaration on status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retiring_worker_never_evicts_its_successor() {
        let workers: DashMap<ClusterKey, mpsc::UnboundedSender<ClusterEvent>> = DashMap::new();
        let key = ClusterKey::new("default", "mq");
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, _new_rx) = mpsc::unbounded_channel();
        workers.insert(key.clone(), new_tx.clone());

        // The old worker's guarded removal leaves the replacement in place.
        retire_worker(&workers, &key, &old_tx);
        assert!(workers.get(&key).map(|live| live.same_channel(&new_tx)).unwrap_or(false));

        // The replacement's own retirement removes it.
        retire_worker(&workers, &key, &new_tx);
        assert!(workers.get(&key).is_none());
    }
}
