//! Outstanding structure requests.
//!
//! Entries are keyed by node path rather than node id: ids are reassigned on
//! server restart, but the path of a cached node survives a reconnect, so
//! unresolved requests can be re-issued and matched against fresh ids.

use crate::error::Error;
use crate::node::Node;
use std::sync::Arc;
use tokio::sync::oneshot;

pub(crate) type StructureWaiter = oneshot::Sender<crate::Result<Arc<Node>>>;

/// One outstanding request: the target path (`None` = root/system) and the
/// completions waiting on its response, in insertion order.
pub(crate) struct PendingEntry {
    pub node_path: Option<String>,
    pub waiters: Vec<StructureWaiter>,
}

#[derive(Default)]
pub(crate) struct PendingRequests {
    entries: Vec<PendingEntry>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a waiter to the entry for `node_path`, creating the entry if
    /// this is the first request for that path.
    pub fn add(&mut self, node_path: Option<String>, waiter: StructureWaiter) {
        if let Some(index) = self.entries.iter().position(|e| e.node_path == node_path) {
            self.entries[index].waiters.push(waiter);
        } else {
            self.entries.push(PendingEntry {
                node_path,
                waiters: vec![waiter],
            });
        }
    }

    /// Create an empty entry for `node_path` if none exists.  Used for
    /// internally triggered fetches that still need re-issue on reconnect.
    pub fn ensure_entry(&mut self, node_path: Option<String>) {
        if self.find(&node_path).is_none() {
            self.entries.push(PendingEntry {
                node_path,
                waiters: Vec::new(),
            });
        }
    }

    pub fn find(&self, node_path: &Option<String>) -> Option<&PendingEntry> {
        self.entries.iter().find(|e| &e.node_path == node_path)
    }

    pub fn remove(&mut self, node_path: &Option<String>) -> Option<PendingEntry> {
        let index = self.entries.iter().position(|e| &e.node_path == node_path)?;
        Some(self.entries.remove(index))
    }

    /// All pending paths, in insertion order.
    pub fn paths(&self) -> Vec<Option<String>> {
        self.entries.iter().map(|e| e.node_path.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Deliver `node` to every waiter of the entry for `node_path`.
    /// Returns false when no entry was pending for that path.
    pub fn resolve(&mut self, node_path: &Option<String>, node: &Arc<Node>) -> bool {
        match self.remove(node_path) {
            Some(entry) => {
                for waiter in entry.waiters {
                    let _ = waiter.send(Ok(Arc::clone(node)));
                }
                true
            }
            None => false,
        }
    }

    /// Reject every waiter of the entry for `node_path` with `error`.
    pub fn reject(&mut self, node_path: &Option<String>, error: &Error) -> bool {
        match self.remove(node_path) {
            Some(entry) => {
                for waiter in entry.waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
                true
            }
            None => false,
        }
    }

    /// Reject every waiter in every entry with `error`, then empty the set.
    pub fn clear(&mut self, error: &Error) {
        for entry in self.entries.drain(..) {
            for waiter in entry.waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }
}
