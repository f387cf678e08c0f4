//! Sync operations.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque unique identifier of a queued operation.
///
/// Executors should treat it as an idempotency key: after a crash an
/// operation that was in flight is dispatched again under the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Creates a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for OperationId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ProtocolError::InvalidId(format!("{s}: {e}")))
    }
}

/// Type of sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Entity was created.
    Create,
    /// Entity was updated.
    Update,
    /// Entity was deleted.
    Delete,
}

impl OperationType {
    /// Returns true if the operation must carry a payload.
    pub fn requires_payload(&self) -> bool {
        !matches!(self, OperationType::Delete)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::Create => "Create",
            OperationType::Update => "Update",
            OperationType::Delete => "Delete",
        };
        f.write_str(name)
    }
}

/// Scheduling priority.
///
/// Variants are declared most urgent first, so the derived ordering sorts
/// `Critical` before `Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Must go out before anything else.
    Critical,
    /// Ahead of routine work.
    High,
    /// Routine work.
    #[default]
    Normal,
    /// Background work.
    Low,
}

impl Priority {
    /// All priorities, most urgent first.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Returns the lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    /// Returns true if `self` is strictly more urgent than `other`.
    pub fn outranks(&self, other: Priority) -> bool {
        *self < other
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Priority::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ProtocolError::UnknownName {
                kind: "priority",
                value: s.to_string(),
            })
    }
}

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Waiting to be dispatched.
    #[default]
    Pending,
    /// Handed to the executor.
    InFlight,
    /// Failed permanently; kept for dead-letter visibility.
    Failed,
    /// Confirmed by the server.
    Done,
}

impl OperationStatus {
    /// Returns true for `Failed` and `Done`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Failed | OperationStatus::Done)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationStatus::Pending => "Pending",
            OperationStatus::InFlight => "InFlight",
            OperationStatus::Failed => "Failed",
            OperationStatus::Done => "Done",
        };
        f.write_str(name)
    }
}

/// A single queued mutation awaiting remote application.
///
/// The serde representation is the persisted record shape:
///
/// ```json
/// {
///   "id": "5b0f…", "type": "Update", "entityType": "resident", "entityId": "42",
///   "payload": {"name": "Ada"}, "baseVersion": 3, "priority": "normal",
///   "enqueuedAt": "2024-05-01T09:30:00Z", "attemptCount": 0,
///   "status": "Pending", "sequence": 17
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Unique operation ID.
    pub id: OperationId,
    /// Operation type.
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Kind of entity, e.g. `"resident"`.
    pub entity_type: String,
    /// Entity identifier within its type.
    pub entity_id: String,
    /// JSON payload (absent for deletes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Server version the client last saw, for optimistic concurrency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<u64>,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
    /// When the mutation was captured.
    pub enqueued_at: DateTime<Utc>,
    /// Number of times the operation has been dispatched.
    #[serde(default)]
    pub attempt_count: u32,
    /// Lifecycle status.
    #[serde(default)]
    pub status: OperationStatus,
    /// Most recent error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Queue-assigned enqueue order. Zero until the operation is stored.
    #[serde(default)]
    pub sequence: u64,
}

impl SyncOperation {
    fn new(
        op_type: OperationType,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            id: OperationId::new(),
            op_type,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload,
            base_version: None,
            priority: Priority::default(),
            enqueued_at: Utc::now(),
            attempt_count: 0,
            status: OperationStatus::Pending,
            last_error: None,
            sequence: 0,
        }
    }

    /// Creates a new Create operation.
    pub fn create(entity_type: impl Into<String>, entity_id: impl Into<String>, payload: Value) -> Self {
        Self::new(OperationType::Create, entity_type, entity_id, Some(payload))
    }

    /// Creates a new Update operation.
    pub fn update(entity_type: impl Into<String>, entity_id: impl Into<String>, payload: Value) -> Self {
        Self::new(OperationType::Update, entity_type, entity_id, Some(payload))
    }

    /// Creates a new Delete operation.
    pub fn delete(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(OperationType::Delete, entity_type, entity_id, None)
    }

    /// Sets the base version.
    pub fn with_base_version(mut self, version: u64) -> Self {
        self.base_version = Some(version);
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Returns true if both operations target the same entity.
    pub fn same_entity(&self, other: &SyncOperation) -> bool {
        self.entity_type == other.entity_type && self.entity_id == other.entity_id
    }

    /// Returns `entityType/entityId`, used in logs.
    pub fn entity_key(&self) -> String {
        format!("{}/{}", self.entity_type, self.entity_id)
    }

    /// Returns the size of the encoded payload in bytes.
    pub fn payload_size(&self) -> usize {
        self.payload
            .as_ref()
            .map(|p| p.to_string().len())
            .unwrap_or(0)
    }

    /// Checks that the operation is well formed.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Invalid`] if the entity type or id is empty,
    /// a Create/Update has no payload or a non-object payload, a Delete
    /// carries a payload, or the payload exceeds `max_payload_bytes`.
    pub fn validate(&self, max_payload_bytes: usize) -> ProtocolResult<()> {
        if self.entity_type.trim().is_empty() {
            return Err(ProtocolError::invalid("entity type is empty"));
        }
        if self.entity_id.trim().is_empty() {
            return Err(ProtocolError::invalid("entity id is empty"));
        }

        match (&self.payload, self.op_type.requires_payload()) {
            (None, true) => {
                return Err(ProtocolError::invalid(format!(
                    "{} of {} has no payload",
                    self.op_type,
                    self.entity_key()
                )))
            }
            (Some(Value::Object(_)), true) => {}
            (Some(_), true) => {
                return Err(ProtocolError::invalid("payload must be a JSON object"))
            }
            (Some(_), false) => {
                return Err(ProtocolError::invalid("delete must not carry a payload"))
            }
            (None, false) => {}
        }

        let size = self.payload_size();
        if size > max_payload_bytes {
            return Err(ProtocolError::invalid(format!(
                "payload is {size} bytes, limit is {max_payload_bytes}"
            )));
        }
        Ok(())
    }

    /// Encodes to the persisted JSON record.
    pub fn to_record(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes from the persisted JSON record.
    pub fn from_record(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
