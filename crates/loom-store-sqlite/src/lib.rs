use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::Path;

use anyhow::Context;
use loom_core::{
    now_stamp, HistoryEntry, LoomError, Node, NodeDraft, NodeId, NodeUpdate, Operation,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS nodes (
  id TEXT PRIMARY KEY,
  text TEXT NOT NULL,
  author TEXT NOT NULL,
  timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS node_parents (
  node_id TEXT NOT NULL,
  parent_id TEXT NOT NULL,
  position INTEGER NOT NULL,
  PRIMARY KEY (node_id, position)
);

CREATE TABLE IF NOT EXISTS history (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  node_id TEXT NOT NULL,
  timestamp TEXT NOT NULL,
  operation TEXT NOT NULL CHECK (operation IN ('create','update','delete')),
  author TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_node_parents_parent ON node_parents(parent_id);
CREATE INDEX IF NOT EXISTS idx_nodes_timestamp ON nodes(timestamp);
CREATE INDEX IF NOT EXISTS idx_history_timestamp ON history(timestamp);
";

/// Authoritative store for the node table and the append-only history
/// log. Children are never stored; they are derived from the
/// `node_parents` edge table, so parent/child views cannot disagree and
/// membership tests are exact by construction.
pub struct SqliteStore {
    conn: Connection,
}

/// Externally supplied tree snapshot, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct TreeDocument {
    pub nodes: BTreeMap<String, TreeDocumentNode>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeDocumentNode {
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub parent_ids: Option<Vec<String>>,
    #[serde(default)]
    pub children_ids: Option<Vec<String>>,
    pub text: String,
    #[serde(default)]
    pub author: Option<String>,
}

impl TreeDocumentNode {
    fn parents(&self) -> Vec<NodeId> {
        if let Some(parent_ids) = &self.parent_ids {
            return parent_ids
                .iter()
                .filter(|id| !id.is_empty())
                .map(|id| NodeId::from(id.as_str()))
                .collect();
        }
        match self.parent_id.as_deref() {
            None | Some("") => Vec::new(),
            Some(single) => vec![NodeId::from(single)],
        }
    }
}

/// Read and parse a tree document from disk.
///
/// # Errors
/// Returns an error when the file cannot be read or is not valid JSON.
pub fn load_tree_document(path: &Path) -> anyhow::Result<TreeDocument> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read tree document {}", path.display()))?;
    let document = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse tree document {}", path.display()))?;
    Ok(document)
}

fn storage(err: impl Display) -> LoomError {
    LoomError::Storage(err.to_string())
}

struct NodeRow {
    id: String,
    text: String,
    author: String,
    timestamp: String,
}

fn map_node_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeRow> {
    Ok(NodeRow {
        id: row.get(0)?,
        text: row.get(1)?,
        author: row.get(2)?,
        timestamp: row.get(3)?,
    })
}

impl SqliteStore {
    /// Open (and bootstrap) a SQLite-backed tree store.
    ///
    /// # Errors
    /// Returns [`LoomError::Storage`] when the database cannot be opened
    /// or the schema cannot be applied.
    pub fn open(path: &Path) -> Result<Self, LoomError> {
        let conn = Connection::open(path)
            .map_err(|err| storage(format!("failed to open {}: {err}", path.display())))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(storage)?;
        conn.execute_batch(SCHEMA_SQL).map_err(storage)?;
        Ok(Self { conn })
    }

    /// Insert a batch of nodes, appending one create history entry per
    /// node, all inside one transaction. A duplicate id fails the whole
    /// batch; nothing is persisted.
    ///
    /// # Errors
    /// Returns [`LoomError::Conflict`] for a duplicate id,
    /// [`LoomError::Validation`] for a missing required field, or
    /// [`LoomError::Storage`] on an engine fault.
    pub fn create_nodes(&mut self, drafts: &[NodeDraft]) -> Result<Vec<NodeId>, LoomError> {
        let stamp = now_stamp()?;
        let tx = self.conn.transaction().map_err(storage)?;
        let mut ids = Vec::with_capacity(drafts.len());
        for draft in drafts {
            draft.validate()?;
            let id = draft.id.clone().unwrap_or_else(NodeId::mint);
            let exists = row_exists(&tx, &id).map_err(storage)?;
            if exists {
                return Err(LoomError::Conflict(id));
            }
            tx.execute(
                "INSERT INTO nodes(id, text, author, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![id.as_str(), draft.text, draft.author, draft.timestamp],
            )
            .map_err(storage)?;
            replace_parent_edges(&tx, &id, &draft.parent_ids).map_err(storage)?;
            for child in &draft.children_ids {
                if !child.is_empty() {
                    link_parent(&tx, child, &id).map_err(storage)?;
                }
            }
            append_history(&tx, &id, Operation::Create, &draft.author, &stamp)
                .map_err(storage)?;
            ids.push(id);
        }
        tx.commit().map_err(storage)?;
        Ok(ids)
    }

    /// Apply a batch of in-place updates, one update history entry per
    /// node, all-or-nothing.
    ///
    /// # Errors
    /// Returns [`LoomError::NotFound`] when any target id does not
    /// exist; the transaction rolls back and no history is written.
    pub fn update_nodes(&mut self, updates: &[NodeUpdate]) -> Result<(), LoomError> {
        let stamp = now_stamp()?;
        let tx = self.conn.transaction().map_err(storage)?;
        for update in updates {
            update.validate()?;
            let affected = tx
                .execute(
                    "UPDATE nodes SET text = ?1, author = ?2, timestamp = ?3 WHERE id = ?4",
                    params![update.text, update.author, update.timestamp, update.id.as_str()],
                )
                .map_err(storage)?;
            if affected == 0 {
                return Err(LoomError::NotFound(update.id.clone()));
            }
            append_history(&tx, &update.id, Operation::Update, &update.author, &stamp)
                .map_err(storage)?;
        }
        tx.commit().map_err(storage)?;
        Ok(())
    }

    /// Delete a batch of nodes. A delete history entry is appended for
    /// every requested id even when no row was removed: the log carries
    /// delete visibility for sync, the node table does not.
    ///
    /// # Errors
    /// Returns [`LoomError::Validation`] for an empty author or
    /// [`LoomError::Storage`] on an engine fault.
    pub fn delete_nodes(&mut self, ids: &[NodeId], author: &str) -> Result<(), LoomError> {
        if author.is_empty() {
            return Err(LoomError::Validation("author must be provided".to_string()));
        }
        let stamp = now_stamp()?;
        let tx = self.conn.transaction().map_err(storage)?;
        for id in ids {
            tx.execute("DELETE FROM nodes WHERE id = ?1", params![id.as_str()])
                .map_err(storage)?;
            // Only the node's own parent list goes; edges pointing at the
            // deleted node stay, so surviving children keep their (now
            // dangling) parent references, as the naive store did.
            tx.execute("DELETE FROM node_parents WHERE node_id = ?1", params![id.as_str()])
                .map_err(storage)?;
            append_history(&tx, id, Operation::Delete, author, &stamp).map_err(storage)?;
        }
        tx.commit().map_err(storage)?;
        Ok(())
    }

    /// # Errors
    /// Returns [`LoomError::Storage`] on an engine fault.
    pub fn exists(&self, id: &NodeId) -> Result<bool, LoomError> {
        row_exists(&self.conn, id).map_err(storage)
    }

    /// # Errors
    /// Returns [`LoomError::Storage`] on an engine fault.
    pub fn exists_many(&self, ids: &[NodeId]) -> Result<BTreeMap<NodeId, bool>, LoomError> {
        let mut found = BTreeMap::new();
        for id in ids {
            let exists = row_exists(&self.conn, id).map_err(storage)?;
            found.insert(id.clone(), exists);
        }
        Ok(found)
    }

    /// # Errors
    /// Returns [`LoomError::NotFound`] when the id has no row.
    pub fn node(&self, id: &NodeId) -> Result<Node, LoomError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, text, author, timestamp FROM nodes WHERE id = ?1",
                params![id.as_str()],
                map_node_row,
            )
            .optional()
            .map_err(storage)?;
        match row {
            Some(row) => hydrate(&self.conn, row).map_err(storage),
            None => Err(LoomError::NotFound(id.clone())),
        }
    }

    /// # Errors
    /// Returns [`LoomError::Storage`] on an engine fault.
    pub fn all_nodes(&self) -> Result<Vec<Node>, LoomError> {
        self.query_nodes("SELECT id, text, author, timestamp FROM nodes ORDER BY id ASC", &[])
    }

    /// # Errors
    /// Returns [`LoomError::Storage`] on an engine fault.
    pub fn all_ids(&self) -> Result<Vec<NodeId>, LoomError> {
        let mut stmt =
            self.conn.prepare("SELECT id FROM nodes ORDER BY id ASC").map_err(storage)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;
        Ok(rows.into_iter().map(NodeId::from).collect())
    }

    /// # Errors
    /// Returns [`LoomError::Storage`] on an engine fault.
    pub fn count(&self) -> Result<u64, LoomError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))
            .map_err(storage)?;
        Ok(count.unsigned_abs())
    }

    /// The single node with no parents. Exactly-one-root is a system
    /// precondition; zero or several roots is reported as a typed error
    /// instead of an ambiguous query result.
    ///
    /// # Errors
    /// Returns [`LoomError::RootMissing`] or [`LoomError::MultipleRoots`]
    /// when the precondition does not hold.
    pub fn root(&self) -> Result<Node, LoomError> {
        let roots = self.query_nodes(
            "SELECT id, text, author, timestamp FROM nodes
             WHERE id NOT IN (SELECT node_id FROM node_parents)
             ORDER BY id ASC",
            &[],
        )?;
        match roots.len() {
            0 => Err(LoomError::RootMissing),
            1 => roots.into_iter().next().ok_or(LoomError::RootMissing),
            n => Err(LoomError::MultipleRoots(n)),
        }
    }

    /// Nodes whose parent list contains `id`, by exact edge membership.
    ///
    /// # Errors
    /// Returns [`LoomError::Storage`] on an engine fault.
    pub fn children(&self, id: &NodeId) -> Result<Vec<Node>, LoomError> {
        self.query_nodes(
            "SELECT n.id, n.text, n.author, n.timestamp FROM nodes n
             JOIN node_parents e ON e.node_id = n.id
             WHERE e.parent_id = ?1
             ORDER BY n.id ASC",
            &[id.as_str()],
        )
    }

    /// Nodes listed in `id`'s parent edges, in declared order.
    ///
    /// # Errors
    /// Returns [`LoomError::Storage`] on an engine fault.
    pub fn parents(&self, id: &NodeId) -> Result<Vec<Node>, LoomError> {
        self.query_nodes(
            "SELECT n.id, n.text, n.author, n.timestamp FROM nodes n
             JOIN node_parents e ON e.parent_id = n.id
             WHERE e.node_id = ?1
             ORDER BY e.position ASC",
            &[id.as_str()],
        )
    }

    /// Nodes mutated strictly after the cursor: the sync primitive.
    /// Deterministic order so a re-pull from the same cursor returns an
    /// identical sequence.
    ///
    /// # Errors
    /// Returns [`LoomError::Storage`] on an engine fault.
    pub fn nodes_since(&self, cursor: &str) -> Result<Vec<Node>, LoomError> {
        self.query_nodes(
            "SELECT id, text, author, timestamp FROM nodes
             WHERE timestamp > ?1
             ORDER BY timestamp ASC, id ASC",
            &[cursor],
        )
    }

    /// # Errors
    /// Returns [`LoomError::Storage`] on an engine fault.
    pub fn history(&self) -> Result<Vec<HistoryEntry>, LoomError> {
        self.query_history(
            "SELECT node_id, timestamp, operation, author FROM history ORDER BY seq ASC",
            &[],
        )
    }

    /// History entries strictly after the cursor, timestamp order with
    /// insertion order as the tie-break. This is the only channel that
    /// carries delete visibility to a syncing client.
    ///
    /// # Errors
    /// Returns [`LoomError::Storage`] on an engine fault.
    pub fn history_since(&self, cursor: &str) -> Result<Vec<HistoryEntry>, LoomError> {
        self.query_history(
            "SELECT node_id, timestamp, operation, author FROM history
             WHERE timestamp > ?1
             ORDER BY timestamp ASC, seq ASC",
            &[cursor],
        )
    }

    /// Seed the store from an external tree document. Runs once at
    /// startup against an empty database; rows are inserted directly and
    /// no history entries are written, so the log records only live
    /// mutations. Children declared without a matching parent
    /// declaration on the child are folded into the parent edge set.
    ///
    /// # Errors
    /// Returns [`LoomError::Storage`] when any insert fails.
    pub fn seed_tree_document(
        &mut self,
        document: &TreeDocument,
        default_author: &str,
        stamp: &str,
    ) -> Result<usize, LoomError> {
        let tx = self.conn.transaction().map_err(storage)?;
        for (id, node) in &document.nodes {
            let author = node.author.as_deref().unwrap_or(default_author);
            tx.execute(
                "INSERT INTO nodes(id, text, author, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![id, node.text, author, stamp],
            )
            .map_err(storage)?;
            let node_id = NodeId::from(id.as_str());
            replace_parent_edges(&tx, &node_id, &node.parents()).map_err(storage)?;
        }
        for (id, node) in &document.nodes {
            let Some(children) = &node.children_ids else {
                continue;
            };
            let parent = NodeId::from(id.as_str());
            for child in children {
                if !child.is_empty() {
                    link_parent(&tx, &NodeId::from(child.as_str()), &parent)
                        .map_err(storage)?;
                }
            }
        }
        tx.commit().map_err(storage)?;
        Ok(document.nodes.len())
    }

    fn query_nodes(&self, sql: &str, args: &[&str]) -> Result<Vec<Node>, LoomError> {
        let mut stmt = self.conn.prepare(sql).map_err(storage)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), map_node_row)
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;
        rows.into_iter()
            .map(|row| hydrate(&self.conn, row).map_err(storage))
            .collect()
    }

    fn query_history(&self, sql: &str, args: &[&str]) -> Result<Vec<HistoryEntry>, LoomError> {
        let mut stmt = self.conn.prepare(sql).map_err(storage)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;

        let mut entries = Vec::with_capacity(rows.len());
        for (node_id, timestamp, operation_raw, author) in rows {
            let operation = Operation::parse(&operation_raw)
                .ok_or_else(|| storage(format!("unknown operation: {operation_raw}")))?;
            entries.push(HistoryEntry {
                node_id: NodeId::from(node_id),
                timestamp,
                operation,
                author,
            });
        }
        Ok(entries)
    }
}

fn row_exists(conn: &Connection, id: &NodeId) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare("SELECT 1 FROM nodes WHERE id = ?1")?;
    stmt.exists(params![id.as_str()])
}

fn hydrate(conn: &Connection, row: NodeRow) -> rusqlite::Result<Node> {
    let parent_ids = parent_ids_of(conn, &row.id)?;
    let children_ids = children_ids_of(conn, &row.id)?;
    Ok(Node {
        id: NodeId::from(row.id),
        parent_ids,
        children_ids,
        text: row.text,
        author: row.author,
        timestamp: row.timestamp,
    })
}

fn parent_ids_of(conn: &Connection, id: &str) -> rusqlite::Result<Vec<NodeId>> {
    let mut stmt = conn.prepare(
        "SELECT parent_id FROM node_parents WHERE node_id = ?1 ORDER BY position ASC",
    )?;
    let ids = stmt
        .query_map(params![id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids.into_iter().map(NodeId::from).collect())
}

fn children_ids_of(conn: &Connection, id: &str) -> rusqlite::Result<Vec<NodeId>> {
    let mut stmt = conn.prepare(
        "SELECT node_id FROM node_parents WHERE parent_id = ?1 ORDER BY node_id ASC",
    )?;
    let ids = stmt
        .query_map(params![id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids.into_iter().map(NodeId::from).collect())
}

fn replace_parent_edges(
    conn: &Connection,
    id: &NodeId,
    parents: &[NodeId],
) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM node_parents WHERE node_id = ?1", params![id.as_str()])?;
    let mut position = 0_i64;
    for parent in parents {
        if parent.is_empty() {
            continue;
        }
        conn.execute(
            "INSERT INTO node_parents(node_id, parent_id, position) VALUES (?1, ?2, ?3)",
            params![id.as_str(), parent.as_str(), position],
        )?;
        position += 1;
    }
    Ok(())
}

/// Append `parent` to `child`'s parent list unless the edge is already
/// present.
fn link_parent(conn: &Connection, child: &NodeId, parent: &NodeId) -> rusqlite::Result<()> {
    let mut stmt =
        conn.prepare("SELECT 1 FROM node_parents WHERE node_id = ?1 AND parent_id = ?2")?;
    if stmt.exists(params![child.as_str(), parent.as_str()])? {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO node_parents(node_id, parent_id, position)
         VALUES (?1, ?2, (SELECT COALESCE(MAX(position) + 1, 0) FROM node_parents WHERE node_id = ?1))",
        params![child.as_str(), parent.as_str()],
    )?;
    Ok(())
}

fn append_history(
    conn: &Connection,
    id: &NodeId,
    operation: Operation,
    author: &str,
    stamp: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO history(node_id, timestamp, operation, author) VALUES (?1, ?2, ?3, ?4)",
        params![id.as_str(), stamp, operation.as_str(), author],
    )?;
    Ok(())
}
