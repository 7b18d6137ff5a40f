//! Client façade.
//!
//! Construct a [`Client`], drive it with [`Client::run_event_loop`] from a
//! task, then resolve nodes with [`Client::root`] / [`Client::find_node`].

use crate::error::{Error, Result};
use crate::listener::NotificationListener;
use crate::node::Node;
use crate::session::{Session, SessionHandle};
use crate::tree::NodeTree;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub const DEFAULT_PORT: u16 = 7689;

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    /// Retry dropped connections once per second, keeping pending requests
    /// for re-issue.  Terminal failures (protocol mismatch, embedder
    /// rejection) stop the loop regardless.
    pub auto_reconnect: bool,
    /// Connect with `wss://` instead of `ws://`.
    pub use_tls: bool,
}

impl ClientOptions {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            auto_reconnect: true,
            use_tls: false,
        }
    }
}

/// A CDP client bound to one server application.
pub struct Client {
    handle: SessionHandle,
    tree: NodeTree,
    shutdown: watch::Sender<bool>,
    session: Mutex<Option<Session>>,
}

impl Client {
    pub fn new(options: ClientOptions, listener: Arc<dyn NotificationListener>) -> Client {
        let (session, handle, tree, shutdown) = Session::new(options, listener);
        Client {
            handle,
            tree,
            shutdown,
            session: Mutex::new(Some(session)),
        }
    }

    /// Drive the connection until [`Client::disconnect`] or a terminal
    /// failure.  With `auto_reconnect` disabled, the first connection loss
    /// also ends the loop.
    pub async fn run_event_loop(&self) -> Result<()> {
        let session = self.session.lock().unwrap().take();
        let Some(mut session) = session else {
            return Err(Error::Unknown("event loop is already running".to_owned()));
        };
        let result = session.run().await;
        *self.session.lock().unwrap() = Some(session);
        result
    }

    /// Disable reconnection, fail all pending requests and close the
    /// transport.
    pub fn disconnect(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Resolve the root node (the server's local application).
    pub async fn root(&self) -> Result<Arc<Node>> {
        self.tree.root().await
    }

    /// Resolve a node by dotted path, descending token by token through
    /// [`Node::child`].  The first token names the root.
    pub async fn find_node(&self, path: &str) -> Result<Arc<Node>> {
        let mut tokens = path.split('.');
        let root = self.root().await?;
        match tokens.next() {
            Some(first) if first == root.name() => {}
            _ => {
                return Err(Error::NotFound(format!(
                    "path '{path}' does not start at the root"
                )));
            }
        }
        let mut node = root;
        for token in tokens {
            node = node.child(token).await?;
        }
        Ok(node)
    }

    pub fn is_connected(&self) -> bool {
        self.handle.shared.is_connected()
    }

    pub fn is_authenticated(&self) -> bool {
        self.handle.shared.is_authenticated()
    }

    /// System name announced in the server hello.
    pub fn system_name(&self) -> String {
        self.handle.shared.system_name()
    }

    pub fn application_name(&self) -> String {
        self.handle.shared.application_name()
    }

    /// `"{major}.{minor}.{patch}"` announced in the server hello.
    pub fn cdp_version(&self) -> String {
        self.handle.shared.cdp_version()
    }

    pub fn system_use_notification(&self) -> String {
        self.handle.shared.system_use_notification()
    }

    /// Current estimate of client-minus-server wall clock, seconds.
    pub fn time_offset_seconds(&self) -> f64 {
        self.handle.shared.time_offset_seconds()
    }
}
