//! Clearing of the "network unavailable" readiness condition.
//!
//! Some kubelets mark a new node `NetworkUnavailable` with reason
//! `NoRouteCreated` until a cloud route exists. The overlay does not use cloud
//! routes, so the master clears the condition once it sees the node.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use log::{error, info};
use tokio::time::sleep;

use crate::error::Result;
use crate::store::NodeClient;
use crate::types::{ConditionStatus, Machine};

pub const NETWORK_UNAVAILABLE: &str = "NetworkUnavailable";
pub const NO_ROUTE_CREATED: &str = "NoRouteCreated";
pub const ROUTE_CREATED: &str = "RouteCreated";
const CLEARED_MESSAGE: &str = "subnetd cleared kubelet-set NoRouteCreated";

/// Exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub steps: u32,
    pub duration: Duration,
    pub factor: u32,
}

pub const DEFAULT_BACKOFF: Backoff = Backoff {
    steps: 4,
    duration: Duration::from_millis(10),
    factor: 5,
};

/// Runs `attempt` until it succeeds, fails with a non-conflict error, or
/// `backoff.steps` attempts have been made. The closure receives the attempt
/// number, starting at zero.
pub async fn retry_on_conflict<T, F>(backoff: Backoff, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> BoxFuture<'static, Result<T>>,
{
    let mut delay = backoff.duration;
    let mut n = 0;
    loop {
        match attempt(n).await {
            Err(e) if e.is_conflict() && n + 1 < backoff.steps => {
                sleep(delay).await;
                delay *= backoff.factor;
                n += 1;
            }
            result => return result,
        }
    }
}

/// Flips a stale `NetworkUnavailable/NoRouteCreated` condition to cleared.
/// Returns false when there is nothing to change.
pub fn clear_network_unavailable(machine: &mut Machine, now: DateTime<Utc>) -> bool {
    let Some(condition) = machine.condition_mut(NETWORK_UNAVAILABLE) else {
        return false;
    };
    if condition.status == ConditionStatus::False || condition.reason != NO_ROUTE_CREATED {
        return false;
    }
    condition.status = ConditionStatus::False;
    condition.reason = ROUTE_CREATED.into();
    condition.message = CLEARED_MESSAGE.into();
    condition.last_transition_time = Some(now);
    true
}

pub struct NodeConditionReconciler {
    client: Arc<dyn NodeClient>,
    backoff: Backoff,
}

impl NodeConditionReconciler {
    pub fn new(client: Arc<dyn NodeClient>) -> Self {
        Self {
            client,
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Best-effort clear of the condition on `machine`. The first attempt
    /// works from the given snapshot; retries after a conflict refetch it.
    /// Failures are logged and reported as `false`.
    pub async fn reconcile(&self, machine: &Machine) -> bool {
        if !clear_network_unavailable(&mut machine.clone(), Utc::now()) {
            return false;
        }

        let name = machine.metadata.name.clone();
        let client = Arc::clone(&self.client);
        let snapshot = machine.clone();
        let result = retry_on_conflict(self.backoff, |n| {
            let client = Arc::clone(&client);
            let snapshot = snapshot.clone();
            let name = name.clone();
            async move {
                let mut current = if n == 0 {
                    snapshot
                } else {
                    client.get_node(&name).await?
                };
                if !clear_network_unavailable(&mut current, Utc::now()) {
                    return Ok(false);
                }
                client.update_node_status(current).await?;
                Ok(true)
            }
            .boxed()
        })
        .await;

        match result {
            Ok(true) => {
                info!(
                    "Cleared node {}/{} condition for {}",
                    NETWORK_UNAVAILABLE, NO_ROUTE_CREATED, name
                );
                true
            }
            Ok(false) => false,
            Err(e) => {
                error!("Status update failed for node {}: {}", name, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::MemoryStore;
    use crate::types::NodeCondition;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn stale_condition() -> NodeCondition {
        NodeCondition {
            kind: NETWORK_UNAVAILABLE.into(),
            status: ConditionStatus::True,
            reason: NO_ROUTE_CREATED.into(),
            message: "RouteController failed to create a route".into(),
            last_transition_time: None,
        }
    }

    #[test]
    fn clears_only_stale_reason() {
        let now = Utc::now();
        let mut machine = Machine::new("node-a").with_condition(stale_condition());
        assert!(clear_network_unavailable(&mut machine, now));

        let condition = machine.condition(NETWORK_UNAVAILABLE).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, ROUTE_CREATED);
        assert_eq!(condition.last_transition_time, Some(now));

        assert!(!clear_network_unavailable(&mut machine, now));

        let mut other = stale_condition();
        other.reason = "SomethingElse".into();
        let mut machine = Machine::new("node-b").with_condition(other);
        assert!(!clear_network_unavailable(&mut machine, now));
        assert!(!clear_network_unavailable(&mut Machine::new("node-c"), now));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_steps() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = retry_on_conflict(DEFAULT_BACKOFF, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Conflict("busy".into())) }.boxed()
        })
        .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), DEFAULT_BACKOFF.steps);
    }

    #[tokio::test]
    async fn retry_stops_on_other_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = retry_on_conflict(DEFAULT_BACKOFF, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::NotFound("node".into())) }.boxed()
        })
        .await;

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reconcile_refetches_after_conflict() {
        let store = MemoryStore::<Machine>::new();
        let snapshot = store
            .create(Machine::new("node-a").with_condition(stale_condition()))
            .await
            .unwrap();

        // A concurrent writer bumps the version so the snapshot is stale.
        let mut newer = snapshot.clone();
        newer = newer.with_address("192.168.1.10");
        store.update(newer).await.unwrap();

        let reconciler = NodeConditionReconciler::new(Arc::new(store.clone()));
        assert!(reconciler.reconcile(&snapshot).await);

        let stored = store.get("node-a").await.unwrap();
        assert_eq!(stored.status.addresses.len(), 1);
        let condition = stored.condition(NETWORK_UNAVAILABLE).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);

        // Nothing left to clear.
        assert!(!reconciler.reconcile(&stored).await);
    }

    #[tokio::test]
    async fn reconcile_failure_is_not_fatal() {
        let store = MemoryStore::<Machine>::new();
        let reconciler = NodeConditionReconciler::new(Arc::new(store));
        let machine = Machine::new("node-a").with_condition(stale_condition());
        assert!(!reconciler.reconcile(&machine).await);
    }
}
