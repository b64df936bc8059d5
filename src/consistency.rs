//! Replica divergence detection.
//!
//! A check collects one checksum per replica under a shared checksum id,
//! asking every replica at once without a reference value. The most common
//! checksum is taken as the expected one, and each replica disagreeing with
//! it is asked once more (same id, so the same checksum) for a snapshot of
//! its data. Checks only report; nothing is repaired.

use {
    crate::{
        RangeError,
        RangeResult,
        api::{CollectChecksumRequest, CollectChecksumResponse, RangeSnapshot, ReplicaTransport},
        config::{CompletionPolicy, CoordinatorConfig},
        directory::StoreDirectory,
        fanout::fan_out,
        freeze::FreezeCoordinator,
        metadata::{RangeDescriptor, RangeId, ReplicaDescriptor},
    },
    std::sync::Arc,
    tokio::time,
    uuid::Uuid,
};

/// Replica whose checksum disagrees with the majority.
#[derive(Debug, Clone, PartialEq)]
pub struct Divergence {
    pub replica: ReplicaDescriptor,
    pub expected: Vec<u8>,
    pub actual: Vec<u8>,
    /// Data of the replica; absent if it could not be fetched.
    pub snapshot: Option<RangeSnapshot>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckOptions {
    /// Freeze the range for the duration of the check.
    pub freeze: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsistencyReport {
    pub range_id: RangeId,
    pub checksum_id: Uuid,
    /// Checksum or failure of every replica that answered, in replica set
    /// order.
    pub outcomes: Vec<(ReplicaDescriptor, RangeResult<Vec<u8>>)>,
    /// Replicas still in flight when the checksum policy was satisfied.
    pub abandoned: Vec<ReplicaDescriptor>,
    /// The most common checksum.
    pub majority: Vec<u8>,
    pub divergent: Vec<Divergence>,
    /// Whether writes may have raced the collection (range not frozen), in
    /// which case a mismatch is a hint rather than proof.
    pub advisory: bool,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.divergent.is_empty()
    }

    /// Replicas that failed to report a checksum.
    pub fn unreachable(&self) -> impl Iterator<Item = (&ReplicaDescriptor, &RangeError)> {
        self.outcomes
            .iter()
            .filter_map(|(replica, r)| r.as_ref().err().map(|e| (replica, e)))
    }

    /// Turns divergence into [`RangeError::DataDivergence`].
    pub fn into_result(self) -> RangeResult<Self> {
        if self.divergent.is_empty() {
            return Ok(self);
        }
        Err(RangeError::DataDivergence {
            range_id: self.range_id,
            divergent: self.divergent,
        })
    }
}

/// Most common checksum; ties go to the one reported first.
fn majority_of<'a>(checksums: impl IntoIterator<Item = &'a [u8]>) -> Option<Vec<u8>> {
    let mut counts: Vec<(&[u8], usize)> = Vec::new();
    for checksum in checksums {
        match counts.iter_mut().find(|(c, _)| *c == checksum) {
            Some((_, n)) => *n += 1,
            None => counts.push((checksum, 1)),
        }
    }
    let mut best: Option<(&[u8], usize)> = None;
    for (checksum, n) in counts {
        if best.is_none_or(|(_, m)| n > m) {
            best = Some((checksum, n));
        }
    }
    best.map(|(c, _)| c.to_vec())
}

pub struct ConsistencyChecker {
    transport: Arc<dyn ReplicaTransport>,
    directory: Arc<StoreDirectory>,
    freezer: FreezeCoordinator,
    config: CoordinatorConfig,
}

impl ConsistencyChecker {
    pub fn new(
        transport: Arc<dyn ReplicaTransport>,
        directory: Arc<StoreDirectory>,
        config: CoordinatorConfig,
    ) -> RangeResult<Self> {
        let freezer =
            FreezeCoordinator::new(Arc::clone(&transport), Arc::clone(&directory), config.clone())?;
        Ok(Self {
            transport,
            directory,
            freezer,
            config,
        })
    }

    /// Asks one replica for its checksum under `checksum_id`.
    ///
    /// With a non-empty `requester_checksum` that differs from the replica's,
    /// the response carries the replica's snapshot.
    pub async fn collect_checksum(
        &self,
        replica: ReplicaDescriptor,
        range_id: RangeId,
        checksum_id: Uuid,
        requester_checksum: Vec<u8>,
    ) -> RangeResult<CollectChecksumResponse> {
        let target = self.directory.resolve(&replica)?;
        let req = CollectChecksumRequest {
            node_id: replica.node_id,
            store_id: replica.store_id,
            range_id,
            checksum_id: checksum_id.as_bytes().to_vec(),
            checksum: requester_checksum,
        };
        time::timeout(
            self.config.rpc_timeout(),
            self.transport.collect_checksum(&target, req),
        )
        .await
        .map_err(|_| RangeError::Timeout {
            node_id: replica.node_id,
            store_id: replica.store_id,
        })?
    }

    /// Compares the checksums of every replica of the range.
    ///
    /// Fails if fewer replicas than the checksum policy requires report a
    /// checksum. Divergence is part of the report; see
    /// [`ConsistencyReport::into_result`].
    pub async fn check(
        &self,
        desc: &RangeDescriptor,
        opts: CheckOptions,
    ) -> RangeResult<ConsistencyReport> {
        if !opts.freeze {
            return self.collect(desc, true).await;
        }

        self.freezer.freeze(desc).await?;
        let report = self.collect(desc, false).await;
        let thawed = self
            .freezer
            .thaw(desc.range_id, &desc.replicas, std::slice::from_ref(desc))
            .await;
        match (report, thawed) {
            (Ok(report), Ok(())) => Ok(report),
            (Err(err), thawed) => {
                if let Err(thaw_err) = thawed {
                    tracing::error!(
                        range_id = desc.range_id,
                        error = %thaw_err,
                        "thaw after check failed"
                    );
                }
                Err(err)
            }
            (Ok(_), Err(err)) => Err(err),
        }
    }

    async fn collect(
        &self,
        desc: &RangeDescriptor,
        advisory: bool,
    ) -> RangeResult<ConsistencyReport> {
        let range_id = desc.range_id;
        let checksum_id = Uuid::new_v4();
        let policy = self.config.checksum_policy;
        let required = policy.required(desc.replicas.len());
        tracing::debug!(range_id, %checksum_id, advisory, "collecting checksums");

        // No requester checksum: nobody ships a snapshot before the majority
        // is known.
        let out = fan_out(
            &desc.replicas,
            self.config.rpc_timeout(),
            policy,
            |replica| async move {
                self.collect_checksum(replica, range_id, checksum_id, vec![])
                    .await
                    .map(|resp| resp.checksum)
            },
        )
        .await;
        let abandoned = out.abandoned;
        let mut outcomes = out.results;
        outcomes.sort_by_key(|(replica, _)| {
            desc.replicas
                .iter()
                .position(|r| r == replica)
                .unwrap_or(usize::MAX)
        });
        for (replica, res) in &outcomes {
            if let Err(err) = res {
                tracing::warn!(range_id, ?replica, error = ?err, "checksum collection failed");
            }
        }

        let collected: Vec<(ReplicaDescriptor, &[u8])> = outcomes
            .iter()
            .filter_map(|(replica, r)| r.as_ref().ok().map(|c| (*replica, c.as_slice())))
            .collect();
        if collected.len() < required {
            let failures: Vec<_> = outcomes
                .iter()
                .filter_map(|(r, res)| {
                    let err = res.as_ref().err()?;
                    Some(format!("n{}/s{}: {err}", r.node_id, r.store_id))
                })
                .collect();
            return Err(RangeError::Transport(format!(
                "range {range_id}: {} of {required} required checksums collected ({})",
                collected.len(),
                failures.join("; ")
            )));
        }

        let Some(majority) = majority_of(collected.iter().map(|(_, c)| *c)) else {
            return Err(RangeError::Transport(format!(
                "no replica of range {range_id} reported a checksum"
            )));
        };
        let mismatched: Vec<_> = collected
            .iter()
            .filter(|(_, c)| *c != majority.as_slice())
            .map(|(replica, c)| (*replica, c.to_vec()))
            .collect();

        let mut divergent = Vec::with_capacity(mismatched.len());
        if !mismatched.is_empty() {
            let replicas: Vec<_> = mismatched.iter().map(|(r, _)| *r).collect();
            let snapshots = fan_out(
                &replicas,
                self.config.rpc_timeout(),
                CompletionPolicy::All,
                |replica| self.collect_checksum(replica, range_id, checksum_id, majority.clone()),
            )
            .await;
            for (replica, actual) in mismatched {
                let snapshot = snapshots
                    .results
                    .iter()
                    .find(|(r, _)| *r == replica)
                    .and_then(|(_, res)| match res {
                        Ok(resp) => resp.snapshot.clone(),
                        Err(err) => {
                            tracing::warn!(
                                range_id,
                                ?replica,
                                error = ?err,
                                "snapshot collection failed"
                            );
                            None
                        }
                    });
                tracing::error!(
                    range_id,
                    ?replica,
                    %checksum_id,
                    advisory,
                    "replica checksum diverges from majority"
                );
                divergent.push(Divergence {
                    replica,
                    expected: majority.clone(),
                    actual,
                    snapshot,
                });
            }
        }

        Ok(ConsistencyReport {
            range_id,
            checksum_id,
            outcomes,
            abandoned,
            majority,
            divergent,
            advisory,
        })
    }
}
