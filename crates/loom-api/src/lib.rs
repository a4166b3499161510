use std::collections::BTreeMap;
use std::path::PathBuf;

use loom_core::{
    now_stamp, HistoryEntry, LoomError, Node, NodeDraft, NodeId, NodeUpdate,
};
use loom_store_sqlite::{SqliteStore, TreeDocument};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stateless credential and tree-identifier check applied to every
/// operation before it reaches the store. Holds only the digest of the
/// configured secret, never the plaintext.
#[derive(Debug, Clone)]
pub struct AccessGuard {
    secret_digest: String,
    tree_id: String,
}

/// Credentials presented by one inbound request.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub credential: Option<String>,
    pub tree_id: Option<String>,
}

impl AccessGuard {
    #[must_use]
    pub fn new(secret: &str, tree_id: impl Into<String>) -> Self {
        Self { secret_digest: digest_hex(secret), tree_id: tree_id.into() }
    }

    /// Verify the presented credential digest and claimed tree id.
    /// Either failure short-circuits before any side effect.
    ///
    /// # Errors
    /// Returns [`LoomError::Unauthorized`] or [`LoomError::InvalidTree`].
    pub fn authorize(&self, auth: &AuthContext) -> Result<(), LoomError> {
        let presented = auth.credential.as_deref().ok_or(LoomError::Unauthorized)?;
        if digest_hex(presented) != self.secret_digest {
            return Err(LoomError::Unauthorized);
        }
        if auth.tree_id.as_deref() != Some(self.tree_id.as_str()) {
            return Err(LoomError::InvalidTree);
        }
        Ok(())
    }
}

fn digest_hex(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    format!("{digest:x}")
}

/// One element of a create batch. `parentIds` wins over `parentId`; an
/// empty or absent parent means a root node. Declared `childrenIds`
/// become parent edges on the listed children.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodeRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub parent_ids: Option<Vec<String>>,
    #[serde(default)]
    pub children_ids: Option<Vec<String>>,
    pub text: String,
    pub author: String,
    pub timestamp: String,
}

impl CreateNodeRequest {
    fn into_draft(self) -> NodeDraft {
        let parent_ids = match (self.parent_ids, self.parent_id) {
            (Some(parents), _) => {
                parents.into_iter().filter(|id| !id.is_empty()).map(NodeId::from).collect()
            }
            (None, Some(parent)) if !parent.is_empty() => vec![NodeId::from(parent)],
            (None, _) => Vec::new(),
        };
        NodeDraft {
            id: self.id.map(NodeId::from),
            parent_ids,
            children_ids: self
                .children_ids
                .unwrap_or_default()
                .into_iter()
                .filter(|id| !id.is_empty())
                .map(NodeId::from)
                .collect(),
            text: self.text,
            author: self.author,
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UpdateNodeBody {
    pub text: String,
    pub author: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UpdateNodeRequest {
    pub id: String,
    pub text: String,
    pub author: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DeleteNodeRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExistsManyRequest {
    pub node_ids: Vec<String>,
}

/// Wire shape of one node. Responses keep the historical JSON contract:
/// snake_case `parent_ids`/`children_ids` keys, empty collections
/// serialized as `null`. Only request bodies use the camelCase
/// spellings.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NodeView {
    pub id: String,
    pub parent_ids: Option<Vec<String>>,
    pub children_ids: Option<Vec<String>>,
    pub text: String,
    pub author: String,
    pub timestamp: String,
}

/// Wire shape of one node inside the id-keyed full-tree map, where the
/// id lives on the key instead of the value.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NodeBody {
    pub parent_ids: Option<Vec<String>>,
    pub children_ids: Option<Vec<String>>,
    pub text: String,
    pub author: String,
    pub timestamp: String,
}

fn id_strings(ids: Vec<NodeId>) -> Option<Vec<String>> {
    if ids.is_empty() {
        return None;
    }
    Some(ids.into_iter().map(|id| id.to_string()).collect())
}

impl From<Node> for NodeView {
    fn from(node: Node) -> Self {
        Self {
            id: node.id.to_string(),
            parent_ids: id_strings(node.parent_ids),
            children_ids: id_strings(node.children_ids),
            text: node.text,
            author: node.author,
            timestamp: node.timestamp,
        }
    }
}

impl From<Node> for NodeBody {
    fn from(node: Node) -> Self {
        Self {
            parent_ids: id_strings(node.parent_ids),
            children_ids: id_strings(node.children_ids),
            text: node.text,
            author: node.author,
            timestamp: node.timestamp,
        }
    }
}

/// Operation layer over the guard and the store. Every call checks the
/// guard first, then opens its own scoped store handle, which is
/// released when the call returns on any path.
#[derive(Debug, Clone)]
pub struct LoomApi {
    db_path: PathBuf,
    guard: AccessGuard,
}

impl LoomApi {
    #[must_use]
    pub fn new(db_path: PathBuf, guard: AccessGuard) -> Self {
        Self { db_path, guard }
    }

    fn open_store(&self) -> Result<SqliteStore, LoomError> {
        SqliteStore::open(&self.db_path)
    }

    /// Create a batch of nodes (a single create is a one-element batch).
    ///
    /// # Errors
    /// Returns guard errors, [`LoomError::Conflict`] for a duplicate id,
    /// or [`LoomError::Validation`] for missing required fields.
    pub fn create_nodes(
        &self,
        auth: &AuthContext,
        requests: Vec<CreateNodeRequest>,
    ) -> Result<Vec<NodeId>, LoomError> {
        self.guard.authorize(auth)?;
        let drafts: Vec<NodeDraft> =
            requests.into_iter().map(CreateNodeRequest::into_draft).collect();
        let mut store = self.open_store()?;
        store.create_nodes(&drafts)
    }

    /// # Errors
    /// Returns guard errors or [`LoomError::NotFound`].
    pub fn update_node(
        &self,
        auth: &AuthContext,
        id: &str,
        body: UpdateNodeBody,
    ) -> Result<(), LoomError> {
        self.guard.authorize(auth)?;
        let mut store = self.open_store()?;
        store.update_nodes(&[NodeUpdate {
            id: NodeId::from(id),
            text: body.text,
            author: body.author,
            timestamp: body.timestamp,
        }])
    }

    /// # Errors
    /// Returns guard errors or [`LoomError::NotFound`]; the whole batch
    /// rolls back on the first missing id.
    pub fn update_nodes(
        &self,
        auth: &AuthContext,
        requests: Vec<UpdateNodeRequest>,
    ) -> Result<(), LoomError> {
        self.guard.authorize(auth)?;
        let updates: Vec<NodeUpdate> = requests
            .into_iter()
            .map(|request| NodeUpdate {
                id: NodeId::from(request.id),
                text: request.text,
                author: request.author,
                timestamp: request.timestamp,
            })
            .collect();
        let mut store = self.open_store()?;
        store.update_nodes(&updates)
    }

    /// # Errors
    /// Returns guard errors; deleting a missing id still succeeds and
    /// appends its audit entry.
    pub fn delete_node(&self, auth: &AuthContext, id: &str, author: &str) -> Result<(), LoomError> {
        self.guard.authorize(auth)?;
        let mut store = self.open_store()?;
        store.delete_nodes(&[NodeId::from(id)], author)
    }

    /// # Errors
    /// Returns guard errors or [`LoomError::Validation`] for an empty author.
    pub fn delete_nodes(
        &self,
        auth: &AuthContext,
        requests: Vec<DeleteNodeRequest>,
        author: &str,
    ) -> Result<(), LoomError> {
        self.guard.authorize(auth)?;
        let ids: Vec<NodeId> = requests.into_iter().map(|request| NodeId::from(request.id)).collect();
        let mut store = self.open_store()?;
        store.delete_nodes(&ids, author)
    }

    /// # Errors
    /// Returns guard or storage errors.
    pub fn node_exists(&self, auth: &AuthContext, id: &str) -> Result<bool, LoomError> {
        self.guard.authorize(auth)?;
        self.open_store()?.exists(&NodeId::from(id))
    }

    /// # Errors
    /// Returns guard or storage errors.
    pub fn nodes_exist(
        &self,
        auth: &AuthContext,
        request: ExistsManyRequest,
    ) -> Result<BTreeMap<String, bool>, LoomError> {
        self.guard.authorize(auth)?;
        let ids: Vec<NodeId> = request.node_ids.into_iter().map(NodeId::from).collect();
        let found = self.open_store()?.exists_many(&ids)?;
        Ok(found.into_iter().map(|(id, exists)| (id.to_string(), exists)).collect())
    }

    /// The incremental-sync pull: every node mutated strictly after the
    /// client's cursor.
    ///
    /// # Errors
    /// Returns guard or storage errors.
    pub fn nodes_since(&self, auth: &AuthContext, cursor: &str) -> Result<Vec<NodeView>, LoomError> {
        self.guard.authorize(auth)?;
        let nodes = self.open_store()?.nodes_since(cursor)?;
        Ok(nodes.into_iter().map(NodeView::from).collect())
    }

    /// # Errors
    /// Returns guard or storage errors.
    pub fn all_node_ids(&self, auth: &AuthContext) -> Result<Vec<String>, LoomError> {
        self.guard.authorize(auth)?;
        let ids = self.open_store()?.all_ids()?;
        Ok(ids.into_iter().map(|id| id.to_string()).collect())
    }

    /// # Errors
    /// Returns guard or storage errors.
    pub fn all_nodes(&self, auth: &AuthContext) -> Result<BTreeMap<String, NodeBody>, LoomError> {
        self.guard.authorize(auth)?;
        let nodes = self.open_store()?.all_nodes()?;
        Ok(nodes
            .into_iter()
            .map(|node| (node.id.to_string(), NodeBody::from(node)))
            .collect())
    }

    /// # Errors
    /// Returns guard or storage errors.
    pub fn node_count(&self, auth: &AuthContext) -> Result<u64, LoomError> {
        self.guard.authorize(auth)?;
        self.open_store()?.count()
    }

    /// # Errors
    /// Returns guard errors or [`LoomError::NotFound`].
    pub fn node(&self, auth: &AuthContext, id: &str) -> Result<NodeView, LoomError> {
        self.guard.authorize(auth)?;
        let node = self.open_store()?.node(&NodeId::from(id))?;
        Ok(NodeView::from(node))
    }

    /// # Errors
    /// Returns guard errors, [`LoomError::RootMissing`], or
    /// [`LoomError::MultipleRoots`].
    pub fn root(&self, auth: &AuthContext) -> Result<NodeView, LoomError> {
        self.guard.authorize(auth)?;
        let node = self.open_store()?.root()?;
        Ok(NodeView::from(node))
    }

    /// # Errors
    /// Returns guard or storage errors.
    pub fn children(&self, auth: &AuthContext, id: &str) -> Result<Vec<NodeView>, LoomError> {
        self.guard.authorize(auth)?;
        let nodes = self.open_store()?.children(&NodeId::from(id))?;
        Ok(nodes.into_iter().map(NodeView::from).collect())
    }

    /// # Errors
    /// Returns guard or storage errors.
    pub fn parents(&self, auth: &AuthContext, id: &str) -> Result<Vec<NodeView>, LoomError> {
        self.guard.authorize(auth)?;
        let nodes = self.open_store()?.parents(&NodeId::from(id))?;
        Ok(nodes.into_iter().map(NodeView::from).collect())
    }

    /// # Errors
    /// Returns guard or storage errors.
    pub fn history(&self, auth: &AuthContext) -> Result<Vec<HistoryEntry>, LoomError> {
        self.guard.authorize(auth)?;
        self.open_store()?.history()
    }

    /// The log-side sync feed; unlike the node feed it carries deletes.
    ///
    /// # Errors
    /// Returns guard or storage errors.
    pub fn history_since(
        &self,
        auth: &AuthContext,
        cursor: &str,
    ) -> Result<Vec<HistoryEntry>, LoomError> {
        self.guard.authorize(auth)?;
        self.open_store()?.history_since(cursor)
    }

    /// Startup-only bulk load; bypasses the guard because it never runs
    /// on behalf of a network caller.
    ///
    /// # Errors
    /// Returns storage errors.
    pub fn seed_from_document(
        &self,
        document: &TreeDocument,
        default_author: &str,
    ) -> Result<usize, LoomError> {
        let stamp = now_stamp()?;
        let mut store = self.open_store()?;
        store.seed_tree_document(document, default_author, &stamp)
    }
}
