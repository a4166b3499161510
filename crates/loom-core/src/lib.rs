use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LoomError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Invalid Tree-Id")]
    InvalidTree,
    #[error("node not found: {0}")]
    NotFound(NodeId),
    #[error("node already exists: {0}")]
    Conflict(NodeId),
    #[error("tree has no root node")]
    RootMissing,
    #[error("tree has {0} root nodes; expected exactly one")]
    MultipleRoots(usize),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Opaque node identifier. Clients may supply their own ids; the server
/// mints one when the create request carries none.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Mint a fresh server-side id.
    #[must_use]
    pub fn mint() -> Self {
        Self(Ulid::new().to_string().to_lowercase())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One stored tree node. `parent_ids` is empty for the root; the tree is
/// really a DAG, so several parents model a branch merge. `children_ids`
/// is derived from the parent index at read time, never stored.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub parent_ids: Vec<NodeId>,
    pub children_ids: Vec<NodeId>,
    pub text: String,
    pub author: String,
    /// Time of last mutation, client-supplied. Doubles as the sync
    /// cursor value: lexicographic order over `YYYY-MM-DD HH:MM:SS`.
    pub timestamp: String,
}

/// Input for one create operation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NodeDraft {
    pub id: Option<NodeId>,
    pub parent_ids: Vec<NodeId>,
    /// Children declared by the caller; turned into parent edges on the
    /// listed children so the two views cannot disagree.
    pub children_ids: Vec<NodeId>,
    pub text: String,
    pub author: String,
    pub timestamp: String,
}

impl NodeDraft {
    /// Check the fields required for every create.
    ///
    /// # Errors
    /// Returns [`LoomError::Validation`] when `text`, `author`, or
    /// `timestamp` is empty, or a supplied id is the empty string.
    pub fn validate(&self) -> Result<(), LoomError> {
        if let Some(id) = &self.id {
            if id.is_empty() {
                return Err(LoomError::Validation("node id must be non-empty".to_string()));
            }
        }
        require_non_empty("text", &self.text)?;
        require_non_empty("author", &self.author)?;
        require_non_empty("timestamp", &self.timestamp)?;
        Ok(())
    }
}

/// Input for one update operation. Updates mutate in place; the node
/// keeps its identity and edges.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NodeUpdate {
    pub id: NodeId,
    pub text: String,
    pub author: String,
    pub timestamp: String,
}

impl NodeUpdate {
    /// # Errors
    /// Returns [`LoomError::Validation`] when any required field is empty.
    pub fn validate(&self) -> Result<(), LoomError> {
        if self.id.is_empty() {
            return Err(LoomError::Validation("node id must be non-empty".to_string()));
        }
        require_non_empty("text", &self.text)?;
        require_non_empty("author", &self.author)?;
        require_non_empty("timestamp", &self.timestamp)?;
        Ok(())
    }
}

/// Immutable audit record of one mutation to one node. Appended in the
/// same transaction as the mutation, never rewritten, and retained after
/// the node itself is deleted.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryEntry {
    pub node_id: NodeId,
    /// Server-stamped at second precision, unlike node timestamps which
    /// are client-supplied.
    pub timestamp: String,
    pub operation: Operation,
    pub author: String,
}

/// Current wall clock formatted as the wire/storage timestamp,
/// `YYYY-MM-DD HH:MM:SS`.
///
/// # Errors
/// Returns [`LoomError::Storage`] when formatting fails.
pub fn now_stamp() -> Result<String, LoomError> {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    OffsetDateTime::now_utc()
        .format(&format)
        .map_err(|err| LoomError::Storage(format!("failed to format timestamp: {err}")))
}

fn require_non_empty(field: &str, value: &str) -> Result<(), LoomError> {
    if value.is_empty() {
        return Err(LoomError::Validation(format!("{field} must be provided")));
    }
    Ok(())
}
