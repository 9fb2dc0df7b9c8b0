//! Allocation, task and workload identity types shared by the hook and the
//! renewal loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Name of the identity every task receives unless it opts out.
pub const DEFAULT_IDENTITY_NAME: &str = "default";

/// Unique identifier for an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationId(pub String);

impl AllocationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A workload allocation placed on this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    /// Raft index at which the allocation was created. Used as the
    /// consistency lower bound for every signing request.
    pub create_index: u64,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Allocation {
    /// Tasks that declare at least one workload identity.
    pub fn tasks_with_identities(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| !t.identities.is_empty())
    }

    /// Look up a declared identity by task and identity name.
    pub fn find_identity(&self, task: &str, identity: &str) -> Option<&WorkloadIdentity> {
        self.tasks
            .iter()
            .find(|t| t.name == task)
            .and_then(|t| t.identities.iter().find(|w| w.name == identity))
    }
}

/// A task inside an allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    /// Declared workload identities, in declaration order.
    #[serde(default)]
    pub identities: Vec<WorkloadIdentity>,
}

impl Task {
    /// Build the batched signing request for every declared identity.
    pub fn identity_requests(&self, alloc_id: &AllocationId) -> Vec<IdentityRequest> {
        self.identities
            .iter()
            .map(|wid| IdentityRequest::new(alloc_id.clone(), &self.name, &wid.name))
            .collect()
    }

    /// Identities that expire and therefore need renewing.
    pub fn renewable_identities(&self) -> impl Iterator<Item = &WorkloadIdentity> {
        self.identities.iter().filter(|w| w.is_renewable())
    }
}

/// Declared workload identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadIdentity {
    pub name: String,
    /// Token lifetime. Zero means the token never expires: it is fetched
    /// once at startup and never renewed.
    #[serde(
        default,
        serialize_with = "serialize_ttl",
        deserialize_with = "deserialize_ttl"
    )]
    pub ttl: Duration,
}

impl WorkloadIdentity {
    pub fn new(name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            ttl,
        }
    }

    pub fn is_renewable(&self) -> bool {
        !self.ttl.is_zero()
    }
}

fn serialize_ttl<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*ttl).to_string())
}

fn deserialize_ttl<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
}

/// One identity to be signed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityRequest {
    pub alloc_id: AllocationId,
    pub task_name: String,
    pub identity_name: String,
}

impl IdentityRequest {
    pub fn new(alloc_id: AllocationId, task: &str, identity: &str) -> Self {
        Self {
            alloc_id,
            task_name: task.to_string(),
            identity_name: identity.to_string(),
        }
    }

    pub fn key(&self) -> IdentityKey {
        IdentityKey::new(&self.task_name, &self.identity_name)
    }
}

/// A token returned by the signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedIdentity {
    /// Task of the request this token answers.
    pub task_name: String,
    pub identity_name: String,
    /// Opaque signed token. Never logged.
    pub token: String,
    pub expiration: DateTime<Utc>,
}

impl SignedIdentity {
    pub fn key(&self) -> IdentityKey {
        IdentityKey::new(&self.task_name, &self.identity_name)
    }
}

/// (task, identity) pair identifying one managed token within an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub task: String,
    pub identity: String,
}

impl IdentityKey {
    pub fn new(task: &str, identity: &str) -> Self {
        Self {
            task: task.to_string(),
            identity: identity.to_string(),
        }
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.task, self.identity)
    }
}
