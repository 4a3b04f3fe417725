//! Data structures exchanged between the store, the change feed and the
//! controllers.
//!
//! Every stored object carries an [`ObjectMeta`]: the `name` is the unique
//! key, the `uid` distinguishes a recreated object from an update of the same
//! one, and `resource_version` backs compare-and-swap writes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// An object kept in the control-plane store.
pub trait Object: fmt::Debug + Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str {
        &self.meta().name
    }

    fn uid(&self) -> &str {
        &self.meta().uid
    }
}

/// A cluster member that needs overlay connectivity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: MachineStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    #[serde(default)]
    pub addresses: Vec<MachineAddress>,
    #[serde(default)]
    pub conditions: Vec<NodeCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineAddress {
    #[serde(rename = "type")]
    pub kind: String,
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Machine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            status: MachineStatus::default(),
        }
    }

    /// Adds a reported address; the first one is preferred for overlay traffic.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.status.addresses.push(MachineAddress {
            kind: "InternalIP".into(),
            address: address.into(),
        });
        self
    }

    #[cfg(test)]
    pub fn with_condition(mut self, condition: NodeCondition) -> Self {
        self.status.conditions.push(condition);
        self
    }

    #[cfg(test)]
    pub fn condition(&self, kind: &str) -> Option<&NodeCondition> {
        self.status.conditions.iter().find(|c| c.kind == kind)
    }

    pub fn condition_mut(&mut self, kind: &str) -> Option<&mut NodeCondition> {
        self.status.conditions.iter_mut().find(|c| c.kind == kind)
    }
}

impl Object for Machine {
    const KIND: &'static str = "Node";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// The durable subnet assignment of a single machine.
///
/// `subnet` is stored as text so that a malformed record read back from the
/// store can still be listed and reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSubnet {
    pub metadata: ObjectMeta,
    pub host: String,
    #[serde(rename = "hostIP")]
    pub host_ip: String,
    pub subnet: String,
}

impl HostSubnet {
    pub fn new(host: impl Into<String>, host_ip: impl Into<String>, subnet: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            metadata: ObjectMeta::named(host.clone()),
            host,
            host_ip: host_ip.into(),
            subnet: subnet.into(),
        }
    }
}

impl Object for HostSubnet {
    const KIND: &'static str = "HostSubnet";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl fmt::Display for HostSubnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (host: {:?}, ip: {:?}, subnet: {:?})",
            self.metadata.name, self.host, self.host_ip, self.subnet
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaKind {
    /// Replayed from a full listing rather than observed live.
    Synced,
    Added,
    Updated,
    Deleted,
}

impl fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeltaKind::Synced => "Sync",
            DeltaKind::Added => "Added",
            DeltaKind::Updated => "Updated",
            DeltaKind::Deleted => "Deleted",
        };
        f.write_str(s)
    }
}

/// A single change notification for an object of kind `T`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta<T> {
    pub kind: DeltaKind,
    pub object: T,
}

impl<T> Delta<T> {
    pub fn new(kind: DeltaKind, object: T) -> Self {
        Self { kind, object }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_subnet_from_json() {
        let record: HostSubnet = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "node-a", "uid": "abc", "resourceVersion": 3 },
            "host": "node-a",
            "hostIP": "192.168.1.10",
            "subnet": "10.128.0.0/23"
        }))
        .unwrap();

        assert_eq!(record.uid(), "abc");
        assert_eq!(record.meta().resource_version, 3);
        assert_eq!(
            record.to_string(),
            r#"node-a (host: "node-a", ip: "192.168.1.10", subnet: "10.128.0.0/23")"#
        );
    }

    #[test]
    fn machine_condition_lookup() {
        let machine: Machine = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "node-a" },
            "status": {
                "addresses": [{ "type": "InternalIP", "address": "192.168.1.10" }],
                "conditions": [
                    { "type": "Ready", "status": "True" },
                    { "type": "NetworkUnavailable", "status": "True", "reason": "NoRouteCreated" }
                ]
            }
        }))
        .unwrap();

        let condition = machine.condition("NetworkUnavailable").unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.reason, "NoRouteCreated");
        assert!(machine.condition("MemoryPressure").is_none());
    }
}
