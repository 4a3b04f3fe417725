//! Control-plane store interfaces and an in-memory, watchable implementation.
//!
//! Writes are compare-and-swap on `resource_version`: an update carrying a
//! stale version is refused with [`Error::Conflict`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, Mutex};

use crate::error::{Error, Result};
use crate::types::{HostSubnet, Machine, Object};

pub(crate) const WATCH_BUFFER_SIZE: usize = 256;

/// Durable registry of host subnet records.
#[async_trait]
pub trait SubnetRegistry: Send + Sync {
    async fn list(&self) -> Result<Vec<HostSubnet>>;
    async fn get(&self, name: &str) -> Result<HostSubnet>;
    async fn create(&self, subnet: HostSubnet) -> Result<HostSubnet>;
    async fn update(&self, subnet: HostSubnet) -> Result<HostSubnet>;
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Access to machine objects, used to patch readiness conditions.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Machine>;
    async fn update_node_status(&self, machine: Machine) -> Result<Machine>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

/// Something a change feed can list and then watch.
#[async_trait]
pub trait WatchSource<T>: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<T>>;

    /// Live events published after the call returns.
    fn subscribe(&self) -> broadcast::Receiver<WatchEvent<T>>;
}

struct Inner<T> {
    objects: BTreeMap<String, T>,
    version: u64,
}

/// In-memory object store for a single kind.
pub struct MemoryStore<T> {
    inner: Arc<Mutex<Inner<T>>>,
    events: broadcast::Sender<WatchEvent<T>>,
}

impl<T> Clone for MemoryStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            events: self.events.clone(),
        }
    }
}

impl<T: Object> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Object> MemoryStore<T> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER_SIZE);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                objects: BTreeMap::new(),
                version: 0,
            })),
            events,
        }
    }

    fn publish(&self, event: WatchEvent<T>) {
        // No receivers is fine; watchers relist when they subscribe.
        let _ = self.events.send(event);
    }

    pub async fn list(&self) -> Vec<T> {
        self.inner.lock().await.objects.values().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> Result<T> {
        self.inner
            .lock()
            .await
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{} {:?}", T::KIND, name)))
    }

    pub async fn create(&self, mut object: T) -> Result<T> {
        let mut inner = self.inner.lock().await;
        let name = object.name().to_string();
        if inner.objects.contains_key(&name) {
            return Err(Error::Conflict(format!("{} {:?} already exists", T::KIND, name)));
        }
        inner.version += 1;
        let meta = object.meta_mut();
        meta.uid = object_uid(T::KIND, &name, inner.version);
        meta.resource_version = inner.version;
        inner.objects.insert(name, object.clone());

        // Published under the lock so per-object event order matches writes.
        debug!("Created {} {:?}", T::KIND, object.name());
        self.publish(WatchEvent::Added(object.clone()));
        Ok(object)
    }

    pub async fn update(&self, mut object: T) -> Result<T> {
        let mut inner = self.inner.lock().await;
        let name = object.name().to_string();
        let stored = inner
            .objects
            .get(&name)
            .ok_or_else(|| Error::NotFound(format!("{} {:?}", T::KIND, name)))?;
        let current = stored.meta().resource_version;
        let uid = stored.uid().to_string();
        if object.meta().resource_version != current {
            return Err(Error::Conflict(format!(
                "{} {:?} has been modified (version {} != {})",
                T::KIND,
                name,
                object.meta().resource_version,
                current
            )));
        }
        inner.version += 1;
        let meta = object.meta_mut();
        meta.uid = uid;
        meta.resource_version = inner.version;
        inner.objects.insert(name, object.clone());

        self.publish(WatchEvent::Modified(object.clone()));
        Ok(object)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.objects.remove(name) {
            Some(object) => {
                debug!("Deleted {} {:?}", T::KIND, name);
                self.publish(WatchEvent::Deleted(object));
                Ok(())
            }
            None => Err(Error::NotFound(format!("{} {:?}", T::KIND, name))),
        }
    }
}

/// Opaque identity of one incarnation of an object.
fn object_uid(kind: &str, name: &str, sequence: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b"/");
    hasher.update(name.as_bytes());
    hasher.update(sequence.to_be_bytes());
    hex::encode(&hasher.finalize()[..16])
}

#[async_trait]
impl<T: Object> WatchSource<T> for MemoryStore<T> {
    async fn snapshot(&self) -> Result<Vec<T>> {
        Ok(self.list().await)
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.events.subscribe()
    }
}

#[async_trait]
impl SubnetRegistry for MemoryStore<HostSubnet> {
    async fn list(&self) -> Result<Vec<HostSubnet>> {
        Ok(MemoryStore::list(self).await)
    }

    async fn get(&self, name: &str) -> Result<HostSubnet> {
        MemoryStore::get(self, name).await
    }

    async fn create(&self, subnet: HostSubnet) -> Result<HostSubnet> {
        MemoryStore::create(self, subnet).await
    }

    async fn update(&self, subnet: HostSubnet) -> Result<HostSubnet> {
        MemoryStore::update(self, subnet).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        MemoryStore::delete(self, name).await
    }
}

#[async_trait]
impl NodeClient for MemoryStore<Machine> {
    async fn get_node(&self, name: &str) -> Result<Machine> {
        self.get(name).await
    }

    async fn update_node_status(&self, machine: Machine) -> Result<Machine> {
        self.update(machine).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_assigns_identity() {
        let store = MemoryStore::<HostSubnet>::new();
        let created = store
            .create(HostSubnet::new("node-a", "192.168.1.10", "10.0.0.0/24"))
            .await
            .unwrap();
        assert!(!created.uid().is_empty());
        assert_eq!(created.meta().resource_version, 1);

        let err = store
            .create(HostSubnet::new("node-a", "192.168.1.11", "10.0.1.0/24"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn recreated_object_gets_new_uid() {
        let store = MemoryStore::<HostSubnet>::new();
        let first = store
            .create(HostSubnet::new("node-a", "192.168.1.10", "10.0.0.0/24"))
            .await
            .unwrap();
        store.delete("node-a").await.unwrap();
        let second = store
            .create(HostSubnet::new("node-a", "192.168.1.10", "10.0.0.0/24"))
            .await
            .unwrap();
        assert_ne!(first.uid(), second.uid());
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = MemoryStore::<HostSubnet>::new();
        let created = store
            .create(HostSubnet::new("node-a", "192.168.1.10", "10.0.0.0/24"))
            .await
            .unwrap();

        let mut fresh = created.clone();
        fresh.host_ip = "192.168.1.20".into();
        let updated = store.update(fresh).await.unwrap();
        assert_eq!(updated.uid(), created.uid());
        assert!(updated.meta().resource_version > created.meta().resource_version);

        let mut stale = created;
        stale.host_ip = "192.168.1.30".into();
        assert!(store.update(stale).await.unwrap_err().is_conflict());
        assert_eq!(store.get("node-a").await.unwrap().host_ip, "192.168.1.20");
    }

    #[tokio::test]
    async fn missing_objects() {
        let store = MemoryStore::<Machine>::new();
        assert!(store.get("ghost").await.unwrap_err().is_not_found());
        assert!(store.delete("ghost").await.unwrap_err().is_not_found());
        assert!(store.update(Machine::new("ghost")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn publishes_events() {
        let store = MemoryStore::<Machine>::new();
        let mut events = store.subscribe();

        let created = store.create(Machine::new("node-a")).await.unwrap();
        store.delete("node-a").await.unwrap();

        assert_eq!(events.recv().await.unwrap(), WatchEvent::Added(created.clone()));
        assert_eq!(events.recv().await.unwrap(), WatchEvent::Deleted(created));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_delete_and_recreate_publish_in_write_order() {
        let store = MemoryStore::<Machine>::new();
        let mut events = store.subscribe();
        store.create(Machine::new("node-a")).await.unwrap();

        // At most 201 events, so the receiver cannot lag.
        let deleter = store.clone();
        let deletes = tokio::spawn(async move {
            for _ in 0..100 {
                let _ = deleter.delete("node-a").await;
                tokio::task::yield_now().await;
            }
        });
        let creator = store.clone();
        let creates = tokio::spawn(async move {
            for _ in 0..100 {
                let _ = creator.create(Machine::new("node-a")).await;
                tokio::task::yield_now().await;
            }
        });
        deletes.await.unwrap();
        creates.await.unwrap();

        let mut live: Option<String> = None;
        while let Ok(event) = events.try_recv() {
            match event {
                WatchEvent::Added(o) => {
                    assert!(live.is_none(), "added {} while {:?} exists", o.uid(), live);
                    live = Some(o.uid().to_string());
                }
                WatchEvent::Deleted(o) => {
                    assert_eq!(live.take().as_deref(), Some(o.uid()));
                }
                WatchEvent::Modified(o) => panic!("unexpected update of {}", o.uid()),
            }
        }
    }
}
