//! Concurrent per-replica calls joined under a completion policy.

use {
    crate::{
        RangeError,
        RangeResult,
        config::CompletionPolicy,
        metadata::ReplicaDescriptor,
    },
    futures_util::stream::{FuturesUnordered, StreamExt},
    std::{future::Future, time::Duration},
    tokio::time,
};

/// Outcome of a fan-out.
#[derive(Debug)]
pub struct FanOut<T> {
    /// Per-replica outcomes, in completion order.
    pub results: Vec<(ReplicaDescriptor, RangeResult<T>)>,
    /// Replicas still in flight when the policy was satisfied; their calls
    /// were abandoned.
    pub abandoned: Vec<ReplicaDescriptor>,
    /// Successes the policy required.
    pub required: usize,
}

impl<T> FanOut<T> {
    pub fn successes(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn is_satisfied(&self) -> bool {
        self.successes() >= self.required
    }

    /// Replicas whose call failed, with the error.
    pub fn failures(&self) -> impl Iterator<Item = (&ReplicaDescriptor, &RangeError)> {
        self.results
            .iter()
            .filter_map(|(replica, r)| r.as_ref().err().map(|e| (replica, e)))
    }

    /// Replicas whose call succeeded, with the value.
    pub fn successful(&self) -> impl Iterator<Item = (&ReplicaDescriptor, &T)> {
        self.results
            .iter()
            .filter_map(|(replica, r)| r.as_ref().ok().map(|v| (replica, v)))
    }

    /// One line summary of the failures, for error reports.
    pub fn describe_failures(&self) -> String {
        let failures: Vec<_> = self
            .failures()
            .map(|(r, e)| format!("n{}/s{}: {e}", r.node_id, r.store_id))
            .collect();
        if failures.is_empty() {
            "no failures".to_string()
        } else {
            failures.join("; ")
        }
    }
}

/// Calls `call` for every replica concurrently, each under its own timeout.
///
/// Returns once every call finished, or as soon as the policy is satisfied;
/// calls still in flight at that point are dropped. A call exceeding
/// `timeout` is reported as [`RangeError::Timeout`] without affecting the
/// others.
pub async fn fan_out<T, F, Fut>(
    replicas: &[ReplicaDescriptor],
    timeout: Duration,
    policy: CompletionPolicy,
    call: F,
) -> FanOut<T>
where
    F: Fn(ReplicaDescriptor) -> Fut,
    Fut: Future<Output = RangeResult<T>>,
{
    let required = policy.required(replicas.len());
    let early_exit = policy != CompletionPolicy::All;

    let mut calls: FuturesUnordered<_> = replicas
        .iter()
        .map(|replica| {
            let replica = *replica;
            let fut = call(replica);
            async move {
                let res = match time::timeout(timeout, fut).await {
                    Ok(res) => res,
                    Err(_) => Err(RangeError::Timeout {
                        node_id: replica.node_id,
                        store_id: replica.store_id,
                    }),
                };
                (replica, res)
            }
        })
        .collect();

    let mut results = Vec::with_capacity(replicas.len());
    let mut ok = 0;
    while let Some((replica, res)) = calls.next().await {
        if res.is_ok() {
            ok += 1;
        }
        results.push((replica, res));
        if early_exit && ok >= required {
            break;
        }
    }
    drop(calls);

    let abandoned = replicas
        .iter()
        .filter(|r| !results.iter().any(|(done, _)| done == *r))
        .copied()
        .collect();

    FanOut {
        results,
        abandoned,
        required,
    }
}
