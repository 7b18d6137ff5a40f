//! The node tree cache.
//!
//! Owns at most one root node.  The root is the `is_local` application
//! selected out of a system structure response; it stays `None` until the
//! first response materialises it.

use crate::error::{Error, Result};
use crate::node::Node;
use crate::session::SessionHandle;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub(crate) struct NodeTree {
    inner: Arc<TreeInner>,
}

struct TreeInner {
    handle: SessionHandle,
    root: Mutex<Option<Arc<Node>>>,
}

impl NodeTree {
    pub(crate) fn new(handle: SessionHandle) -> Self {
        Self {
            inner: Arc::new(TreeInner {
                handle,
                root: Mutex::new(None),
            }),
        }
    }

    /// Resolve the root node, requesting the system structure when no root
    /// has been materialised yet.
    pub(crate) async fn root(&self) -> Result<Arc<Node>> {
        if let Some(root) = self.cached_root() {
            return Ok(root);
        }
        let receiver = self.inner.handle.structure_request(None, None);
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(Error::Connection("Connection was closed".to_owned())),
        }
    }

    pub(crate) fn cached_root(&self) -> Option<Arc<Node>> {
        self.inner.root.lock().unwrap().clone()
    }

    pub(crate) fn install_root(&self, root: Arc<Node>) {
        *self.inner.root.lock().unwrap() = Some(root);
    }

    /// Depth-first search by server-assigned id.
    pub(crate) fn find_by_id(&self, node_id: u32) -> Option<Arc<Node>> {
        let root = self.cached_root()?;
        find_in_subtree(&root, node_id)
    }

    /// Descend a dotted path; the first token must name the root.
    pub(crate) fn find_by_path(&self, dotted: &str) -> Option<Arc<Node>> {
        let root = self.cached_root()?;
        let mut tokens = dotted.split('.');
        if tokens.next()? != root.name() {
            return None;
        }
        let mut node = root;
        for token in tokens {
            node = node
                .children_snapshot()
                .into_iter()
                .find(|child| child.name() == token)?;
        }
        Some(node)
    }
}

fn find_in_subtree(node: &Arc<Node>, node_id: u32) -> Option<Arc<Node>> {
    if node.id() == node_id {
        return Some(Arc::clone(node));
    }
    for child in node.children_snapshot() {
        if let Some(found) = find_in_subtree(&child, node_id) {
            return Some(found);
        }
    }
    None
}
