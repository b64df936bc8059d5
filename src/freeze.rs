//! Quiescing a range's replicas around a descriptor change.
//!
//! Freezing is a two step affair: the pause command is sent to every replica,
//! then each store is polled until it reports the replica frozen. Polling is
//! point-in-time; a mismatch that persists for `max_polls` rounds is escalated
//! instead of retried forever.

use {
    crate::{
        RangeError,
        RangeResult,
        api::{ChangeFrozenRequest, PollFrozenRequest, ReplicaTransport},
        config::{CompletionPolicy, CoordinatorConfig},
        directory::StoreDirectory,
        fanout::{FanOut, fan_out},
        metadata::{RangeDescriptor, RangeId, ReplicaDescriptor, StoreId},
    },
    std::sync::Arc,
    tokio::time,
};

/// Drives freeze and thaw of range replicas.
#[derive(Clone)]
pub struct FreezeCoordinator {
    transport: Arc<dyn ReplicaTransport>,
    directory: Arc<StoreDirectory>,
    config: CoordinatorConfig,
}

impl FreezeCoordinator {
    pub fn new(
        transport: Arc<dyn ReplicaTransport>,
        directory: Arc<StoreDirectory>,
        config: CoordinatorConfig,
    ) -> RangeResult<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            directory,
            config,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Replicas of one store currently frozen (`collect_frozen`) or thawed.
    pub async fn poll_frozen(
        &self,
        store_id: StoreId,
        collect_frozen: bool,
    ) -> RangeResult<Vec<ReplicaDescriptor>> {
        let target = self.directory.get(store_id)?;
        let req = PollFrozenRequest {
            node_id: target.node_id(),
            store_id,
            collect_frozen,
        };
        let resp = time::timeout(
            self.config.rpc_timeout(),
            self.transport.poll_frozen(&target, req),
        )
        .await
        .map_err(|_| RangeError::Timeout {
            node_id: target.node_id(),
            store_id,
        })??;
        Ok(resp.results)
    }

    /// Polls the replica's store until it reports the replica in the
    /// requested state.
    async fn await_state(&self, replica: ReplicaDescriptor, frozen: bool) -> RangeResult<()> {
        let mut backoff = self.config.poll_backoff();
        for attempt in 1..=self.config.max_polls {
            match self.poll_frozen(replica.store_id, frozen).await {
                Ok(reported) if reported.contains(&replica) => return Ok(()),
                Ok(_) => {
                    tracing::trace!(?replica, frozen, attempt, "replica not yet in requested state");
                }
                Err(err) if err.is_retryable() => {
                    tracing::debug!(?replica, error = ?err, attempt, "poll failed");
                }
                Err(err) => return Err(err),
            }
            if attempt < self.config.max_polls {
                if let Some(delay) = backoff.next() {
                    time::sleep(delay).await;
                }
            }
        }
        Err(RangeError::Transport(format!(
            "replica n{}/s{} did not report {} after {} polls",
            replica.node_id,
            replica.store_id,
            if frozen { "frozen" } else { "thawed" },
            self.config.max_polls
        )))
    }

    async fn change_frozen(
        &self,
        range_id: RangeId,
        replicas: &[ReplicaDescriptor],
        frozen: bool,
        serve_under: &[RangeDescriptor],
        policy: CompletionPolicy,
    ) -> FanOut<()> {
        fan_out(replicas, self.config.freeze_window(), policy, |replica| {
            let target = self.directory.resolve(&replica);
            let req = ChangeFrozenRequest {
                node_id: replica.node_id,
                store_id: replica.store_id,
                range_id,
                frozen,
                descriptors: serve_under.to_vec(),
            };
            async move {
                let target = target?;
                let resp = time::timeout(
                    self.config.rpc_timeout(),
                    self.transport.change_frozen(&target, req),
                )
                .await
                .map_err(|_| RangeError::Timeout {
                    node_id: replica.node_id,
                    store_id: replica.store_id,
                })??;
                if resp.frozen != frozen {
                    return Err(RangeError::Transport(format!(
                        "replica n{}/s{} refused to change frozen state",
                        replica.node_id, replica.store_id
                    )));
                }
                if frozen {
                    return self.await_state(replica, true).await;
                }
                // A thawed replica reports itself as a member of the range it
                // now serves, which after a merge carries another replica id.
                // Removed replicas leave the store; nothing to confirm.
                let serving = serve_under
                    .iter()
                    .find_map(|d| d.find_replica(replica.node_id, replica.store_id))
                    .copied();
                match serving {
                    Some(serving) => self.await_state(serving, false).await,
                    None => Ok(()),
                }
            }
        })
        .await
    }

    /// Freezes every replica of the range.
    ///
    /// If the freeze policy is not met, the replicas are thawed back under
    /// `desc` and the freeze fails; nothing else is changed.
    pub async fn freeze(&self, desc: &RangeDescriptor) -> RangeResult<()> {
        tracing::debug!(range_id = desc.range_id, "freezing range");
        let out = self
            .change_frozen(
                desc.range_id,
                &desc.replicas,
                true,
                &[],
                self.config.freeze_policy,
            )
            .await;
        if out.is_satisfied() {
            return Ok(());
        }

        let reason = out.describe_failures();
        tracing::warn!(range_id = desc.range_id, %reason, "freeze failed, rolling back");
        // A replica that timed out may still have frozen, so thaw them all.
        if let Err(err) = self
            .thaw(desc.range_id, &desc.replicas, std::slice::from_ref(desc))
            .await
        {
            tracing::error!(range_id = desc.range_id, error = %err, "rollback thaw failed");
        }
        Err(RangeError::FreezeFailed {
            range_id: desc.range_id,
            reason,
        })
    }

    /// Thaws the replicas, which from now on serve under `serve_under`.
    ///
    /// Every replica must confirm; the ones that do not are reported as
    /// [`RangeError::StuckFreeze`].
    pub async fn thaw(
        &self,
        range_id: RangeId,
        replicas: &[ReplicaDescriptor],
        serve_under: &[RangeDescriptor],
    ) -> RangeResult<()> {
        tracing::debug!(range_id, replicas = replicas.len(), "thawing range");
        let out = self
            .change_frozen(range_id, replicas, false, serve_under, CompletionPolicy::All)
            .await;
        let stuck: Vec<_> = out.failures().map(|(r, _)| *r).collect();
        if stuck.is_empty() {
            return Ok(());
        }
        tracing::error!(
            range_id,
            reason = %out.describe_failures(),
            "replicas stuck frozen"
        );
        Err(RangeError::StuckFreeze {
            range_id,
            replicas: stuck,
        })
    }
}
