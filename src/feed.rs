//! List-then-watch delivery of object changes to a single handler.
//!
//! A [`ChangeFeed`] subscribes to its source, replays the full listing as
//! [`DeltaKind::Synced`] deltas and then forwards live changes. Lagging or
//! losing the watch triggers a relist, and the listing is replayed again every
//! resync interval so that deltas a handler failed on are retried. Handler
//! errors are logged and never stop delivery. Redelivery is possible, so
//! handlers must be idempotent.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

use crate::error::Result;
use crate::store::{WatchEvent, WatchSource};
use crate::types::{Delta, DeltaKind, Object};

const RESUME_DELAY: Duration = Duration::from_secs(2);
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Receives the deltas of one resource kind, one at a time.
#[async_trait]
pub trait DeltaHandler<T>: Send {
    async fn handle(&mut self, delta: Delta<T>) -> Result<()>;
}

pub struct ChangeFeed<T, S> {
    source: S,
    /// Last delivered state per object name.
    known: HashMap<String, T>,
    resume_delay: Duration,
    resync_interval: Duration,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Object, S: WatchSource<T>> ChangeFeed<T, S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            known: HashMap::new(),
            resume_delay: RESUME_DELAY,
            resync_interval: RESYNC_INTERVAL,
            _kind: PhantomData,
        }
    }

    /// Replays the full listing every `interval`. Must be non-zero.
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Delivers changes to `handler` forever.
    pub async fn run<H: DeltaHandler<T>>(mut self, mut handler: H) {
        loop {
            // Subscribe before listing so nothing falls between the two.
            let mut events = self.source.subscribe();
            if let Err(e) = self.resync(&mut handler).await {
                error!(
                    "Failed to list {}: {}. Retrying in {:?}...",
                    T::KIND,
                    e,
                    self.resume_delay
                );
                sleep(self.resume_delay).await;
                continue;
            }
            info!("Watching {} changes ({} known)", T::KIND, self.known.len());

            let mut ticker = interval_at(
                Instant::now() + self.resync_interval,
                self.resync_interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => {
                            if let Some(delta) = self.live_delta(event) {
                                self.dispatch(&mut handler, delta).await;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("{} watch lagged by {} events, relisting", T::KIND, skipped);
                            break;
                        }
                        Err(RecvError::Closed) => {
                            warn!(
                                "{} watch closed. Reconnecting in {:?}...",
                                T::KIND,
                                self.resume_delay
                            );
                            sleep(self.resume_delay).await;
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        debug!("Periodic resync of {}", T::KIND);
                        // A failed listing is retried on the next tick.
                        if let Err(e) = self.resync(&mut handler).await {
                            error!("Failed to resync {}: {}", T::KIND, e);
                        }
                    }
                }
            }
        }
    }

    /// Replays the current listing. Known objects missing from it, or
    /// replaced by a new incarnation, are reported as deleted first.
    async fn resync<H: DeltaHandler<T>>(&mut self, handler: &mut H) -> Result<()> {
        let objects = self.source.snapshot().await?;
        let gone: Vec<T> = {
            let live: HashSet<(&str, &str)> =
                objects.iter().map(|o| (o.name(), o.uid())).collect();
            self.known
                .values()
                .filter(|o| !live.contains(&(o.name(), o.uid())))
                .cloned()
                .collect()
        };

        for object in gone {
            self.dispatch(handler, Delta::new(DeltaKind::Deleted, object)).await;
        }
        for object in objects {
            self.dispatch(handler, Delta::new(DeltaKind::Synced, object)).await;
        }
        Ok(())
    }

    /// Maps a watch event to a delta, dropping events already covered by
    /// what has been delivered.
    fn live_delta(&self, event: WatchEvent<T>) -> Option<Delta<T>> {
        let (kind, object) = match event {
            WatchEvent::Added(o) => (DeltaKind::Added, o),
            WatchEvent::Modified(o) => (DeltaKind::Updated, o),
            WatchEvent::Deleted(o) => (DeltaKind::Deleted, o),
        };
        let known = self.known.get(object.name());
        let stale = match (kind, known) {
            (DeltaKind::Deleted, None) => true,
            (DeltaKind::Deleted, Some(k)) => k.uid() != object.uid(),
            (_, Some(k)) => {
                k.uid() == object.uid()
                    && k.meta().resource_version >= object.meta().resource_version
            }
            (_, None) => false,
        };
        if stale {
            debug!("Dropping stale {} event for {} {:?}", kind, T::KIND, object.name());
            return None;
        }
        Some(Delta::new(kind, object))
    }

    async fn dispatch<H: DeltaHandler<T>>(&mut self, handler: &mut H, delta: Delta<T>) {
        let name = delta.object.name().to_string();
        let kind = delta.kind;
        if kind == DeltaKind::Deleted {
            self.known.remove(&name);
        } else {
            self.known.insert(name.clone(), delta.object.clone());
        }
        if let Err(e) = handler.handle(delta).await {
            error!("Error handling {} event for {} {:?}: {}", kind, T::KIND, name, e);
        }
    }
}
