//! Prepared statements of a logical connection.
//!
//! A [`Statement`] is only a handle: a local id plus routing hints. The
//! server-side statements behind it live in a [`StatementRegistry`], one
//! binding per physical session, and are created lazily the first time the
//! statement runs on a session.

use std::collections::HashMap;

/// Caller-facing prepared statement handle.
///
/// Handles stay valid across failover; the connection re-prepares the SQL
/// on whichever session ends up running it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Statement {
    pub(crate) id: u64,
    pub(crate) owner: u64,
    pub(crate) read_only: bool,
    pub(crate) param_count: usize,
}

impl Statement {
    /// Local id, unique within its connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this statement may be routed to a reader.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }
}

#[derive(Debug)]
struct Entry<B> {
    sql: String,
    read_only: bool,
    bindings: HashMap<u64, B>,
}

/// Local statement ids mapped to their SQL and per-session bindings.
///
/// Bindings are keyed by session token.
#[derive(Debug)]
pub struct StatementRegistry<B> {
    next_id: u64,
    entries: HashMap<u64, Entry<B>>,
}

impl<B> Default for StatementRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> StatementRegistry<B> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    /// Register SQL and return its local id.
    pub fn register(&mut self, sql: &str, read_only: bool) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                sql: sql.to_string(),
                read_only,
                bindings: HashMap::new(),
            },
        );
        id
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn sql(&self, id: u64) -> Option<&str> {
        self.entries.get(&id).map(|e| e.sql.as_str())
    }

    pub fn is_read_only(&self, id: u64) -> Option<bool> {
        self.entries.get(&id).map(|e| e.read_only)
    }

    /// The binding of statement `id` on session `token`, if prepared there.
    pub fn binding(&self, id: u64, token: u64) -> Option<&B> {
        self.entries.get(&id).and_then(|e| e.bindings.get(&token))
    }

    /// Record that `id` is prepared on session `token`. Unknown ids are
    /// ignored and the binding is handed back.
    pub fn bind(&mut self, id: u64, token: u64, binding: B) -> Option<B> {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.bindings.insert(token, binding);
                None
            }
            None => Some(binding),
        }
    }

    /// Remove every binding held on session `token`, returning them with
    /// their local ids in id order.
    pub fn take_session(&mut self, token: u64) -> Vec<(u64, B)> {
        let mut taken: Vec<(u64, B)> = self
            .entries
            .iter_mut()
            .filter_map(|(&id, entry)| entry.bindings.remove(&token).map(|b| (id, b)))
            .collect();
        taken.sort_by_key(|(id, _)| *id);
        taken
    }

    /// Forget statement `id`, returning its bindings so the caller can
    /// deallocate them.
    pub fn remove(&mut self, id: u64) -> Option<Vec<(u64, B)>> {
        self.entries
            .remove(&id)
            .map(|entry| entry.bindings.into_iter().collect())
    }

    /// Forget every statement. Returns all bindings as `(token, binding)`.
    pub fn clear(&mut self) -> Vec<(u64, B)> {
        self.entries
            .drain()
            .flat_map(|(_, entry)| entry.bindings)
            .collect()
    }
}
