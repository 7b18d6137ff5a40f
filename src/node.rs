//! One position in the server's node tree.
//!
//! Nodes are shared as `Arc<Node>`; a node owns its children and holds a
//! weak back-reference to its parent for path computation.  Structure is
//! server-authoritative: the cached copy is replaced wholesale by structure
//! responses, with identity preserved across id reassignment (see
//! [`Node::update_structure`]).

use crate::error::{Error, Result};
use crate::session::SessionHandle;
use crate::value::Value;
use cdp_proto::{NodeInfo, NodeStructure, NodeType, ValueType, VariantValue};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::debug;

/// Handle returned by the subscribe operations, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken(u64);

type ValueCallback = Arc<dyn Fn(&Value, u64) + Send + Sync>;
type StructureCallback = Arc<dyn Fn(&[String], &[String]) + Send + Sync>;

pub struct Node {
    handle: SessionHandle,
    parent: Weak<Node>,
    state: Mutex<NodeState>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("Node")
            .field("info", &state.info)
            .field("children", &state.children)
            .field("expanded", &state.expanded)
            .field("last_value", &state.last_value)
            .finish()
    }
}

struct NodeState {
    info: NodeInfo,
    children: Vec<Arc<Node>>,
    /// True once this node's own structure response has been applied; only
    /// expanded subtrees are re-fetched on reconnect.
    expanded: bool,
    last_value: Value,
    value_subscriptions: Vec<(SubscriptionToken, ValueCallback)>,
    structure_subscriptions: Vec<(SubscriptionToken, StructureCallback)>,
}

impl Node {
    pub(crate) fn from_structure(
        handle: &SessionHandle,
        structure: &NodeStructure,
        parent: Weak<Node>,
    ) -> Arc<Node> {
        Arc::new_cyclic(|me: &Weak<Node>| {
            let children = structure
                .children
                .iter()
                .map(|child| Node::from_structure(handle, child, me.clone()))
                .collect();
            Node {
                handle: handle.clone(),
                parent,
                state: Mutex::new(NodeState {
                    last_value: Value::default_for(structure.info.value_type),
                    info: structure.info.clone(),
                    children,
                    expanded: false,
                    value_subscriptions: Vec::new(),
                    structure_subscriptions: Vec::new(),
                }),
            }
        })
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap()
    }

    // -- metadata --

    pub fn id(&self) -> u32 {
        self.state().info.node_id
    }

    pub fn name(&self) -> String {
        self.state().info.name.clone()
    }

    pub fn node_type(&self) -> NodeType {
        self.state().info.node_type
    }

    pub fn value_type(&self) -> ValueType {
        self.state().info.value_type
    }

    pub fn is_leaf(&self) -> bool {
        self.state().info.is_leaf()
    }

    pub fn is_read_only(&self) -> bool {
        self.state().info.is_read_only()
    }

    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.upgrade()
    }

    /// Dotted path from the root: the root's path is its name, every other
    /// node appends `.name` to its parent's path.
    pub fn path(&self) -> String {
        let mut segments = vec![self.name()];
        let mut current = self.parent();
        while let Some(node) = current {
            segments.push(node.name());
            current = node.parent();
        }
        segments.reverse();
        segments.join(".")
    }

    /// The most recently observed value, or the type default before any
    /// update arrives.
    pub fn last_value(&self) -> Value {
        self.state().last_value.clone()
    }

    pub(crate) fn is_expanded(&self) -> bool {
        self.state().expanded
    }

    pub(crate) fn children_snapshot(&self) -> Vec<Arc<Node>> {
        self.state().children.clone()
    }

    /// Replace this node's metadata in place (the id may have changed).
    /// Returns true when the id changed under live value subscribers, in
    /// which case the getter subscription must be re-issued.
    pub(crate) fn replace_info(&self, info: &NodeInfo) -> bool {
        let mut state = self.state();
        let id_changed = state.info.node_id != info.node_id;
        state.info = info.clone();
        id_changed && !state.value_subscriptions.is_empty()
    }

    // -- structure operations --

    /// Resolve the named child.
    ///
    /// Fails with [`Error::NotFound`] when the local cache has no such
    /// child.  A leaf child resolves immediately; otherwise the child's
    /// structure is fetched and the refreshed child is returned.
    pub async fn child(self: &Arc<Self>, name: &str) -> Result<Arc<Node>> {
        let Some(child) = self
            .children_snapshot()
            .into_iter()
            .find(|c| c.name() == name)
        else {
            return Err(Error::NotFound(format!(
                "could not find any children with name '{name}'"
            )));
        };
        if child.is_leaf() {
            return Ok(child);
        }
        let receiver = self
            .handle
            .structure_request(Some(child.path()), Some(child.id()));
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(Error::Connection("Connection was closed".to_owned())),
        }
    }

    /// Resolve every cached child, joined.
    pub async fn children(self: &Arc<Self>) -> Result<Vec<Arc<Node>>> {
        let names: Vec<String> = self
            .children_snapshot()
            .iter()
            .map(|child| child.name())
            .collect();
        let fetches = names.into_iter().map(|name| {
            let node = Arc::clone(self);
            async move { node.child(&name).await }
        });
        futures_util::future::try_join_all(fetches).await
    }

    /// Fire-and-forget variant of [`Node::children`]: `callback` is invoked
    /// once for each child as it resolves.
    pub fn for_each_child<F>(self: &Arc<Self>, callback: F)
    where
        F: Fn(Arc<Node>) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        for child in self.children_snapshot() {
            let name = child.name();
            let node = Arc::clone(self);
            let callback = Arc::clone(&callback);
            tokio::spawn(async move {
                match node.child(&name).await {
                    Ok(resolved) => callback(resolved),
                    Err(error) => debug!(%name, %error, "child fetch failed"),
                }
            });
        }
    }

    // -- value operations --

    /// Send a setter request carrying `value`.  No acknowledgement is
    /// awaited; `timestamp_ns` of 0 lets the server stamp the write.
    pub fn set_value(&self, value: Value, timestamp_ns: u64) {
        let (node_id, value_type) = {
            let state = self.state();
            (state.info.node_id, state.info.value_type)
        };
        if value.value_type() != value_type {
            debug!(
                node_id,
                expected = ?value_type,
                got = ?value.value_type(),
                "setter value type differs from node value type"
            );
        }
        let mut variant = value.to_variant();
        variant.node_id = node_id;
        variant.timestamp = timestamp_ns;
        self.handle.send_value(variant);
    }

    /// Register a value-change callback.  The first subscriber starts the
    /// server-side getter subscription.
    pub fn subscribe_to_value_changes<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(&Value, u64) + Send + Sync + 'static,
    {
        let token = SubscriptionToken(self.handle.next_subscription_id());
        let (first, node_id) = {
            let mut state = self.state();
            let first = state.value_subscriptions.is_empty();
            state.value_subscriptions.push((token, Arc::new(callback)));
            (first, state.info.node_id)
        };
        if first {
            self.handle.value_request(node_id);
        }
        token
    }

    /// Remove a value-change callback.  Removing the last subscriber stops
    /// the server-side getter subscription.
    pub fn unsubscribe_from_value_changes(&self, token: SubscriptionToken) {
        let (emit_stop, node_id) = {
            let mut state = self.state();
            let before = state.value_subscriptions.len();
            state.value_subscriptions.retain(|(t, _)| *t != token);
            let removed = state.value_subscriptions.len() < before;
            (
                removed && state.value_subscriptions.is_empty(),
                state.info.node_id,
            )
        };
        if emit_stop {
            self.handle.value_unrequest(node_id);
        }
    }

    /// Register a structure-change callback, invoked with the names of
    /// added and removed children.  Local only; no wire traffic.
    pub fn subscribe_to_structure_changes<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(&[String], &[String]) + Send + Sync + 'static,
    {
        let token = SubscriptionToken(self.handle.next_subscription_id());
        self.state()
            .structure_subscriptions
            .push((token, Arc::new(callback)));
        token
    }

    pub fn unsubscribe_from_structure_changes(&self, token: SubscriptionToken) {
        self.state()
            .structure_subscriptions
            .retain(|(t, _)| *t != token);
    }

    // -- updates from the dispatcher --

    /// Apply a structure response for this node.
    ///
    /// Pass 1 reconciles metadata by name: a refresh can reassign child ids,
    /// and responses to requests issued before this update arrive keyed by
    /// the new ids, so the cached instances must adopt them first.  Pass 2
    /// diffs identity on the post-update ids; pass 3 applies the diff and
    /// notifies structure subscribers.
    pub(crate) fn update_structure(self: &Arc<Self>, structure: &NodeStructure) {
        let children = self.children_snapshot();

        for incoming in &structure.children {
            if let Some(existing) = children.iter().find(|c| c.name() == incoming.info.name) {
                if existing.replace_info(&incoming.info) {
                    self.handle.value_request(incoming.info.node_id);
                }
            }
        }

        let incoming_ids: Vec<u32> = structure.children.iter().map(|c| c.info.node_id).collect();
        let existing_ids: Vec<u32> = children.iter().map(|c| c.id()).collect();
        let removed_children: Vec<Arc<Node>> = children
            .iter()
            .filter(|c| !incoming_ids.contains(&c.id()))
            .cloned()
            .collect();
        let new_children: Vec<&NodeStructure> = structure
            .children
            .iter()
            .filter(|c| !existing_ids.contains(&c.info.node_id))
            .collect();

        let removed: Vec<String> = removed_children.iter().map(|c| c.name()).collect();
        let added: Vec<String> = new_children.iter().map(|c| c.info.name.clone()).collect();

        let callbacks: Vec<StructureCallback> = {
            let mut state = self.state();
            state.info = structure.info.clone();
            state.expanded = true;
            state
                .children
                .retain(|child| !removed_children.iter().any(|lost| Arc::ptr_eq(lost, child)));
            for child in &new_children {
                state
                    .children
                    .push(Node::from_structure(&self.handle, child, Arc::downgrade(self)));
            }
            state
                .structure_subscriptions
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect()
        };

        if !added.is_empty() || !removed.is_empty() {
            for callback in callbacks {
                callback(&added, &removed);
            }
        }
    }

    /// Apply a value response for this node: decode per the node's value
    /// type, store, and fan out with the offset-adjusted timestamp.
    pub(crate) fn update_value(&self, variant: &VariantValue) {
        let (value_type, callbacks) = {
            let state = self.state();
            let callbacks: Vec<ValueCallback> = state
                .value_subscriptions
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect();
            (state.info.value_type, callbacks)
        };
        let Some(value) = Value::from_variant(value_type, variant) else {
            debug!(
                node_id = variant.node_id,
                ?value_type,
                "variant carried no scalar for the node's value type"
            );
            return;
        };
        self.state().last_value = value.clone();

        let timestamp = variant
            .timestamp
            .saturating_add_signed(self.handle.time_offset_ns());
        for callback in callbacks {
            callback(&value, timestamp);
        }
    }
}
