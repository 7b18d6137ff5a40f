//! Session state machine and message dispatcher.
//!
//! One task drives the connection: connect, hello gate, application
//! acceptance, challenge/response authentication, clock sync, tree refresh,
//! then READY dispatch.  Public API calls post commands onto an unbounded
//! channel; round-trip operations suspend on oneshot completions held in
//! [`PendingRequests`], resolved exclusively by the dispatcher.
//!
//! Reconnection re-enters the same loop after a one-second delay, so a
//! reconnect can never overlap a pending re-authentication prompt.

use crate::auth;
use crate::client::ClientOptions;
use crate::error::Error;
use crate::listener::{
    ApplicationAcceptanceRequest, CredentialsRequest, NotificationListener, UserAuthResult,
};
use crate::node::Node;
use crate::requests::PendingRequests;
use crate::time_sync::{self, SyncStep, TimeSyncRun};
use crate::tree::NodeTree;
use cdp_proto::{
    AuthResponse, Container, GetterRequest, Hello, NodeStructure, NodeType, RemoteError,
    SetterRequest, StructureRequest, ValueRequest, VariantValue, remote_error_codes,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const COMPAT_VERSION: u32 = 1;
/// Sample-frequency hint carried in every getter request, protocol-prescribed.
const GETTER_FS: f64 = 5.0;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Shared state & handle
// ---------------------------------------------------------------------------

/// Session facts shared with the public API handles.
pub(crate) struct SessionShared {
    connected: AtomicBool,
    authenticated: AtomicBool,
    time_offset_ns: AtomicI64,
    next_subscription_id: AtomicU64,
    system_name: Mutex<String>,
    application_name: Mutex<String>,
    cdp_version: Mutex<String>,
    system_use_notification: Mutex<String>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            time_offset_ns: AtomicI64::new(0),
            next_subscription_id: AtomicU64::new(1),
            system_name: Mutex::new(String::new()),
            application_name: Mutex::new(String::new()),
            cdp_version: Mutex::new(String::new()),
            system_use_notification: Mutex::new(String::new()),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    pub(crate) fn time_offset_ns(&self) -> i64 {
        self.time_offset_ns.load(Ordering::SeqCst)
    }

    pub(crate) fn time_offset_seconds(&self) -> f64 {
        self.time_offset_ns() as f64 / 1e9
    }

    pub(crate) fn set_time_offset_seconds(&self, offset: f64) {
        self.time_offset_ns
            .store((offset * 1e9) as i64, Ordering::SeqCst);
    }

    fn next_subscription_id(&self) -> u64 {
        self.next_subscription_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn system_name(&self) -> String {
        self.system_name.lock().unwrap().clone()
    }

    pub(crate) fn application_name(&self) -> String {
        self.application_name.lock().unwrap().clone()
    }

    pub(crate) fn cdp_version(&self) -> String {
        self.cdp_version.lock().unwrap().clone()
    }

    pub(crate) fn system_use_notification(&self) -> String {
        self.system_use_notification.lock().unwrap().clone()
    }

    fn record_hello(&self, hello: &Hello) {
        *self.system_name.lock().unwrap() = hello.system_name.clone();
        *self.application_name.lock().unwrap() = hello.application_name.clone();
        *self.cdp_version.lock().unwrap() = format!(
            "{}.{}.{}",
            hello.cdp_version_major, hello.cdp_version_minor, hello.cdp_version_patch
        );
        *self.system_use_notification.lock().unwrap() = hello.system_use_notification.clone();
    }
}

/// Commands posted by the API handles onto the session loop.
#[derive(Debug)]
pub(crate) enum Command {
    Structure {
        path: Option<String>,
        node_id: Option<u32>,
        waiter: Option<crate::requests::StructureWaiter>,
    },
    Getter {
        node_id: u32,
        stop: bool,
    },
    Setter {
        variant: VariantValue,
    },
}

/// Cloneable handle through which nodes and the tree reach the session.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    pub(crate) shared: Arc<SessionShared>,
}

impl SessionHandle {
    /// Post a structure request; the returned receiver resolves with the
    /// refreshed node or the rejection error.
    pub(crate) fn structure_request(
        &self,
        path: Option<String>,
        node_id: Option<u32>,
    ) -> oneshot::Receiver<crate::Result<Arc<Node>>> {
        let (waiter, receiver) = oneshot::channel();
        let command = Command::Structure {
            path,
            node_id,
            waiter: Some(waiter),
        };
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            if let Command::Structure {
                waiter: Some(waiter),
                ..
            } = command
            {
                let _ = waiter.send(Err(Error::Connection("Connection was closed".to_owned())));
            }
        }
        receiver
    }

    pub(crate) fn value_request(&self, node_id: u32) {
        let _ = self.commands.send(Command::Getter {
            node_id,
            stop: false,
        });
    }

    pub(crate) fn value_unrequest(&self, node_id: u32) {
        let _ = self.commands.send(Command::Getter {
            node_id,
            stop: true,
        });
    }

    pub(crate) fn send_value(&self, variant: VariantValue) {
        let _ = self.commands.send(Command::Setter { variant });
    }

    pub(crate) fn time_offset_ns(&self) -> i64 {
        self.shared.time_offset_ns()
    }

    pub(crate) fn next_subscription_id(&self) -> u64 {
        self.shared.next_subscription_id()
    }
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

/// A failed connection attempt.  `terminal` failures stop the reconnect
/// loop even with auto-reconnect enabled (retrying cannot change them).
#[derive(Debug)]
struct SessionFailure {
    error: Error,
    terminal: bool,
}

impl SessionFailure {
    fn terminal(error: Error) -> Self {
        Self {
            error,
            terminal: true,
        }
    }

    fn retryable(error: Error) -> Self {
        Self {
            error,
            terminal: false,
        }
    }
}

enum LoopExit {
    /// `disconnect()` was requested; pending work has been failed.
    Shutdown,
    /// The server went away; pending work is kept for re-issue.
    Disconnected,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

enum ReauthPhase {
    Idle,
    AwaitingCredentials,
    AwaitingResponse,
}

/// Loop-owned session state.
struct SessionState {
    options: ClientOptions,
    listener: Arc<dyn NotificationListener>,
    handle: SessionHandle,
    tree: NodeTree,
    shared: Arc<SessionShared>,
    pending: PendingRequests,
    /// Challenge for the next (re-)authentication round.
    challenge: Vec<u8>,
    last_sync: Option<Instant>,
    time_sync_run: Option<TimeSyncRun>,
    /// Paths whose refresh responses are still outstanding after reconnect.
    refresh_set: HashSet<Option<String>>,
    /// Flush pre-disconnect pending entries once the refresh drains.
    flush_deferred: bool,
    reauth: ReauthPhase,
    reauth_rx: Option<oneshot::Receiver<Option<HashMap<String, String>>>>,
}

pub(crate) struct Session {
    state: SessionState,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
}

impl Session {
    pub(crate) fn new(
        options: ClientOptions,
        listener: Arc<dyn NotificationListener>,
    ) -> (Session, SessionHandle, NodeTree, watch::Sender<bool>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(SessionShared::new());
        let handle = SessionHandle {
            commands: commands_tx,
            shared: Arc::clone(&shared),
        };
        let tree = NodeTree::new(handle.clone());
        let session = Session {
            state: SessionState {
                options,
                listener,
                handle: handle.clone(),
                tree: tree.clone(),
                shared,
                pending: PendingRequests::new(),
                challenge: Vec::new(),
                last_sync: None,
                time_sync_run: None,
                refresh_set: HashSet::new(),
                flush_deferred: false,
                reauth: ReauthPhase::Idle,
                reauth_rx: None,
            },
            commands: commands_rx,
            shutdown: shutdown_rx,
        };
        (session, handle, tree, shutdown_tx)
    }

    /// Run until `disconnect()` or a terminal failure; with auto-reconnect
    /// enabled, sleep one second between attempts indefinitely.
    pub(crate) async fn run(&mut self) -> crate::Result<()> {
        loop {
            if *self.shutdown.borrow() {
                let error = Error::Connection("Connection was closed".to_owned());
                self.state.pending.clear(&error);
                drain_commands(&mut self.commands, &error);
                return Ok(());
            }

            let result =
                run_connection(&mut self.state, &mut self.commands, &mut self.shutdown).await;
            self.state.shared.set_connected(false);
            self.state.shared.set_authenticated(false);
            self.state.time_sync_run = None;
            self.state.reauth = ReauthPhase::Idle;
            self.state.reauth_rx = None;

            match result {
                Ok(LoopExit::Shutdown) => {
                    let error = Error::Connection("Connection was closed".to_owned());
                    drain_commands(&mut self.commands, &error);
                    return Ok(());
                }
                Ok(LoopExit::Disconnected) => {
                    if !self.state.options.auto_reconnect {
                        let error = Error::Connection("Connection was closed".to_owned());
                        self.state.pending.clear(&error);
                        drain_commands(&mut self.commands, &error);
                        return Err(error);
                    }
                    info!("connection closed, reconnecting");
                }
                Err(failure) => {
                    if failure.terminal || !self.state.options.auto_reconnect {
                        self.state.pending.clear(&failure.error);
                        drain_commands(&mut self.commands, &failure.error);
                        return Err(failure.error);
                    }
                    warn!(error = %failure.error, "connection failed, reconnecting");
                }
            }

            tokio::select! {
                () = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = self.shutdown.changed() => {}
            }
        }
    }
}

/// Reject structure waiters still sitting in the command channel when the
/// loop stops; they would otherwise never resolve.
fn drain_commands(commands: &mut mpsc::UnboundedReceiver<Command>, error: &Error) {
    while let Ok(command) = commands.try_recv() {
        if let Command::Structure {
            waiter: Some(waiter),
            ..
        } = command
        {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

async fn run_connection(
    state: &mut SessionState,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<LoopExit, SessionFailure> {
    let url = state.url();
    let (mut ws, _response) = connect_async(url.as_str())
        .await
        .map_err(|e| SessionFailure::retryable(Error::Connection(e.to_string())))?;
    debug!(%url, "transport open");

    // AWAITING_HELLO
    let hello = read_hello(&mut ws).await?;
    state.accept_hello(&hello)?;

    // APP_ACCEPTANCE
    if !state.request_acceptance(&hello).await {
        let _ = ws.close(None).await;
        return Err(SessionFailure::terminal(Error::Connection(
            "application was not accepted".to_owned(),
        )));
    }

    // AWAITING_CREDENTIALS / AUTHENTICATING
    if !state.challenge.is_empty() {
        authenticate(state, &mut ws).await?;
    }
    state.shared.set_connected(true);
    info!(
        system = %hello.system_name,
        application = %hello.application_name,
        "session established"
    );

    // TIME_SYNC
    initial_time_sync(state, &mut ws).await?;

    // Tree refresh, then flush of queued structure requests.
    state.enter_ready(&mut ws).await?;

    // READY
    loop {
        let mut reauth_wait = state.reauth_rx.take();
        let reauth_active = reauth_wait.is_some();
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    state
                        .pending
                        .clear(&Error::Connection("Connection was closed".to_owned()));
                    let _ = ws.close(None).await;
                    return Ok(LoopExit::Shutdown);
                }
            }
            reply = async { reauth_wait.as_mut().expect("guarded by reauth_active").await }, if reauth_active => {
                reauth_wait = None;
                state.on_reauth_credentials(&mut ws, reply.ok().flatten()).await?;
            }
            command = commands.recv() => match command {
                Some(command) => state.handle_command(&mut ws, command).await?,
                None => {
                    state
                        .pending
                        .clear(&Error::Connection("Connection was closed".to_owned()));
                    let _ = ws.close(None).await;
                    return Ok(LoopExit::Shutdown);
                }
            },
            message = ws.next() => match message {
                None => return Ok(LoopExit::Disconnected),
                Some(Err(e)) => {
                    return Err(SessionFailure::retryable(Error::Connection(e.to_string())));
                }
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Container>(&text) {
                    Ok(container) => state.dispatch_container(&mut ws, container).await?,
                    Err(e) => warn!(error = %e, "undecodable container frame"),
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => return Ok(LoopExit::Disconnected),
                Some(Ok(_)) => {}
            }
        }
        if let Some(receiver) = reauth_wait {
            state.reauth_rx = Some(receiver);
        }
    }
}

async fn authenticate(state: &mut SessionState, ws: &mut WsStream) -> Result<(), SessionFailure> {
    let mut last_result: Option<UserAuthResult> = None;
    loop {
        let Some(credentials) = state.prompt_credentials(last_result.take()).await else {
            let _ = ws.close(None).await;
            return Err(SessionFailure::terminal(Error::Connection(
                "credentials were not provided".to_owned(),
            )));
        };
        let request = auth::compose_auth_request(&state.challenge, &credentials)
            .map_err(SessionFailure::terminal)?;
        send_frame(ws, &request).await?;

        let response = read_auth_response(ws).await?;
        if response.result_code.is_granted() {
            if response.result_code == cdp_proto::AuthResultCode::GrantedPasswordWillExpireSoon {
                warn!(text = %response.result_text, "password will expire soon");
            }
            state.shared.set_authenticated(true);
            return Ok(());
        }
        warn!(
            code = ?response.result_code,
            text = %response.result_text,
            "authentication denied"
        );
        last_result = Some(UserAuthResult::from_response(&response));
    }
}

/// Three ping-filtered samples before entering READY.  Containers that
/// arrive interleaved are dispatched normally.
async fn initial_time_sync(
    state: &mut SessionState,
    ws: &mut WsStream,
) -> Result<(), SessionFailure> {
    let (mut run, request) = TimeSyncRun::begin();
    send_frame(ws, &request).await?;
    loop {
        let text = next_text_frame(ws).await?;
        match serde_json::from_str::<Container>(&text) {
            Ok(Container::CurrentTimeResponse(response)) => {
                match run.on_response(response.server_time_ns) {
                    SyncStep::Continue(next) => send_frame(ws, &next).await?,
                    SyncStep::Done(offset) => {
                        state.adopt_time_offset(offset);
                        return Ok(());
                    }
                }
            }
            Ok(other) => state.dispatch_container(ws, other).await?,
            Err(e) => warn!(error = %e, "undecodable frame during time sync"),
        }
    }
}

// ---------------------------------------------------------------------------
// Frame helpers
// ---------------------------------------------------------------------------

async fn send_frame<T: Serialize>(ws: &mut WsStream, frame: &T) -> Result<(), SessionFailure> {
    let json = serde_json::to_string(frame)
        .map_err(|e| SessionFailure::terminal(Error::Unknown(format!("serialize: {e}"))))?;
    ws.send(Message::Text(json.into()))
        .await
        .map_err(|e| SessionFailure::retryable(Error::Connection(e.to_string())))
}

async fn next_text_frame(ws: &mut WsStream) -> Result<String, SessionFailure> {
    loop {
        match ws.next().await {
            None | Some(Ok(Message::Close(_))) => {
                return Err(SessionFailure::retryable(Error::Connection(
                    "Connection was closed".to_owned(),
                )));
            }
            Some(Err(e)) => {
                return Err(SessionFailure::retryable(Error::Connection(e.to_string())));
            }
            Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
            Some(Ok(Message::Ping(data))) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            Some(Ok(_)) => {}
        }
    }
}

async fn read_hello(ws: &mut WsStream) -> Result<Hello, SessionFailure> {
    let text = next_text_frame(ws).await?;
    serde_json::from_str(&text).map_err(|e| {
        warn!(error = %e, "malformed hello frame");
        SessionFailure::terminal(Error::Communication("Protocol mismatch".to_owned()))
    })
}

async fn read_auth_response(ws: &mut WsStream) -> Result<AuthResponse, SessionFailure> {
    let text = next_text_frame(ws).await?;
    serde_json::from_str(&text).map_err(|e| {
        warn!(error = %e, "malformed auth response");
        SessionFailure::terminal(Error::Communication(
            "malformed authentication response".to_owned(),
        ))
    })
}

// ---------------------------------------------------------------------------
// State behavior
// ---------------------------------------------------------------------------

impl SessionState {
    fn url(&self) -> String {
        let scheme = if self.options.use_tls { "wss" } else { "ws" };
        format!("{}://{}:{}", scheme, self.options.host, self.options.port)
    }

    fn accept_hello(&mut self, hello: &Hello) -> Result<(), SessionFailure> {
        if hello.compat_version != COMPAT_VERSION {
            warn!(
                compat = hello.compat_version,
                incremental = hello.incremental_version,
                "unsupported protocol version"
            );
            return Err(SessionFailure::terminal(Error::Communication(
                "Protocol mismatch".to_owned(),
            )));
        }
        self.challenge = hello.challenge.clone();
        self.shared.record_hello(hello);
        Ok(())
    }

    async fn request_acceptance(&self, hello: &Hello) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ApplicationAcceptanceRequest::new(
            self.options.host.clone(),
            self.options.port,
            hello.system_name.clone(),
            hello.application_name.clone(),
            self.shared.cdp_version(),
            hello.system_use_notification.clone(),
            reply_tx,
        );
        self.listener.on_application_acceptance_requested(request);
        reply_rx.await.unwrap_or(false)
    }

    async fn prompt_credentials(
        &self,
        auth_result: Option<UserAuthResult>,
    ) -> Option<HashMap<String, String>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.listener
            .on_credentials_requested(CredentialsRequest::new(auth_result, reply_tx));
        reply_rx.await.ok().flatten()
    }

    fn adopt_time_offset(&mut self, offset_seconds: f64) {
        self.shared.set_time_offset_seconds(offset_seconds);
        self.last_sync = Some(Instant::now());
        debug!(offset_seconds, "clock offset updated");
    }

    /// Trigger a throttled offset refresh.  The triggering operation is not
    /// blocked; it proceeds with the current offset.
    async fn maybe_refresh_time(&mut self, ws: &mut WsStream) -> Result<(), SessionFailure> {
        if self.time_sync_run.is_some() || !time_sync::needs_refresh(self.last_sync) {
            return Ok(());
        }
        let (run, request) = TimeSyncRun::begin();
        self.time_sync_run = Some(run);
        send_frame(ws, &request).await
    }

    async fn enter_ready(&mut self, ws: &mut WsStream) -> Result<(), SessionFailure> {
        self.refresh_set.clear();
        if self.tree.cached_root().is_some() {
            debug!("refreshing cached tree");
            self.flush_deferred = !self.pending.is_empty();
            self.refresh_set.insert(None);
            self.pending.ensure_entry(None);
            self.send_structure_for_path(ws, &None, None).await
        } else {
            self.flush_deferred = false;
            self.flush_pending(ws).await
        }
    }

    async fn flush_pending(&mut self, ws: &mut WsStream) -> Result<(), SessionFailure> {
        for path in self.pending.paths() {
            self.send_structure_for_path(ws, &path, None).await?;
        }
        Ok(())
    }

    /// Compose and send a structure request for `path`, resolving the target
    /// id from the tree (ids are refreshed by path across reconnects).
    async fn send_structure_for_path(
        &mut self,
        ws: &mut WsStream,
        path: &Option<String>,
        fallback_id: Option<u32>,
    ) -> Result<(), SessionFailure> {
        let node_ids = match path {
            None => Vec::new(),
            Some(dotted) => {
                match self
                    .tree
                    .find_by_path(dotted)
                    .map(|node| node.id())
                    .or(fallback_id)
                {
                    Some(node_id) => vec![node_id],
                    None => {
                        self.pending.reject(
                            path,
                            &Error::NotFound(format!("node '{dotted}' is no longer present")),
                        );
                        return Ok(());
                    }
                }
            }
        };
        send_frame(
            ws,
            &Container::StructureRequest(StructureRequest { node_ids }),
        )
        .await
    }

    async fn handle_command(
        &mut self,
        ws: &mut WsStream,
        command: Command,
    ) -> Result<(), SessionFailure> {
        self.maybe_refresh_time(ws).await?;
        match command {
            Command::Structure {
                path,
                node_id,
                waiter,
            } => {
                match waiter {
                    Some(waiter) => self.pending.add(path.clone(), waiter),
                    None => self.pending.ensure_entry(path.clone()),
                }
                self.send_structure_for_path(ws, &path, node_id).await
            }
            Command::Getter { node_id, stop } => {
                send_frame(
                    ws,
                    &Container::GetterRequest(GetterRequest {
                        requests: vec![ValueRequest {
                            node_id,
                            fs: GETTER_FS,
                            stop,
                        }],
                    }),
                )
                .await
            }
            Command::Setter { variant } => {
                send_frame(
                    ws,
                    &Container::SetterRequest(SetterRequest {
                        variants: vec![variant],
                    }),
                )
                .await
            }
        }
    }

    // -- incoming dispatch --

    async fn dispatch_container(
        &mut self,
        ws: &mut WsStream,
        container: Container,
    ) -> Result<(), SessionFailure> {
        match container {
            Container::StructureResponse(response) => {
                for structure in response.structures {
                    self.apply_structure(ws, structure).await?;
                }
                Ok(())
            }
            Container::GetterResponse(response) => {
                for variant in &response.variants {
                    match self.tree.find_by_id(variant.node_id) {
                        Some(node) => node.update_value(variant),
                        None => debug!(node_id = variant.node_id, "value for unknown node"),
                    }
                }
                Ok(())
            }
            Container::StructureChangeResponse(response) => {
                for node_id in response.node_ids {
                    match self.tree.find_by_id(node_id) {
                        Some(node) => {
                            let path = Some(node.path());
                            self.pending.ensure_entry(path.clone());
                            self.send_structure_for_path(ws, &path, Some(node_id)).await?;
                        }
                        None => debug!(node_id, "structure change for unknown node"),
                    }
                }
                Ok(())
            }
            Container::CurrentTimeResponse(response) => {
                self.on_time_response(ws, response.server_time_ns).await
            }
            Container::ReAuthResponse(response) => {
                self.on_reauth_response(&response);
                Ok(())
            }
            Container::RemoteError(error) => {
                self.on_remote_error(error);
                Ok(())
            }
            other => {
                info!(kind = message_kind(&other), "unsupported message type received");
                Ok(())
            }
        }
    }

    async fn apply_structure(
        &mut self,
        ws: &mut WsStream,
        structure: NodeStructure,
    ) -> Result<(), SessionFailure> {
        if structure.info.node_type == NodeType::System {
            return self.apply_system_structure(ws, &structure).await;
        }
        let Some(node) = self.tree.find_by_id(structure.info.node_id) else {
            debug!(
                node_id = structure.info.node_id,
                name = %structure.info.name,
                "structure response for unknown node"
            );
            return Ok(());
        };
        node.update_structure(&structure);
        let path = Some(node.path());
        self.pending.resolve(&path, &node);
        self.continue_refresh(ws, &path, &node).await
    }

    /// A system structure carries the application list.  Select the local
    /// application as the tree root (materialising it on first contact),
    /// re-key root waiters to the root's path and fetch its own structure.
    async fn apply_system_structure(
        &mut self,
        ws: &mut WsStream,
        structure: &NodeStructure,
    ) -> Result<(), SessionFailure> {
        let refreshing = self.refresh_set.remove(&None);

        let Some(local) = structure.children.iter().find(|c| c.info.is_local) else {
            warn!(system = %structure.info.name, "system structure carries no local application");
            self.pending.reject(
                &None,
                &Error::Communication("no local application in system structure".to_owned()),
            );
            return self.finish_refresh_if_idle(ws).await;
        };

        let root = match self.tree.cached_root() {
            Some(root) => {
                if root.replace_info(&local.info) {
                    self.handle.value_request(local.info.node_id);
                }
                root
            }
            None => {
                let root = Node::from_structure(&self.handle, local, Weak::new());
                self.tree.install_root(Arc::clone(&root));
                debug!(root = %root.name(), "root materialised");
                root
            }
        };

        let root_path = Some(root.path());
        if let Some(entry) = self.pending.remove(&None) {
            for waiter in entry.waiters {
                self.pending.add(root_path.clone(), waiter);
            }
        }
        self.pending.ensure_entry(root_path.clone());
        if refreshing {
            self.refresh_set.insert(root_path.clone());
        }
        self.send_structure_for_path(ws, &root_path, Some(root.id()))
            .await
    }

    /// After a refreshed node applies, re-request its already-expanded
    /// children; never-expanded subtrees and leaves are skipped.
    async fn continue_refresh(
        &mut self,
        ws: &mut WsStream,
        path: &Option<String>,
        node: &Arc<Node>,
    ) -> Result<(), SessionFailure> {
        if !self.refresh_set.remove(path) {
            return Ok(());
        }
        for child in node.children_snapshot() {
            if !child.is_expanded() || child.is_leaf() {
                continue;
            }
            let child_path = Some(child.path());
            self.pending.ensure_entry(child_path.clone());
            self.refresh_set.insert(child_path.clone());
            self.send_structure_for_path(ws, &child_path, Some(child.id()))
                .await?;
        }
        self.finish_refresh_if_idle(ws).await
    }

    async fn finish_refresh_if_idle(&mut self, ws: &mut WsStream) -> Result<(), SessionFailure> {
        if self.flush_deferred && self.refresh_set.is_empty() {
            self.flush_deferred = false;
            self.flush_pending(ws).await?;
        }
        Ok(())
    }

    async fn on_time_response(
        &mut self,
        ws: &mut WsStream,
        server_time_ns: u64,
    ) -> Result<(), SessionFailure> {
        let Some(run) = self.time_sync_run.as_mut() else {
            debug!("unsolicited current-time response");
            return Ok(());
        };
        match run.on_response(server_time_ns) {
            SyncStep::Continue(request) => send_frame(ws, &request).await,
            SyncStep::Done(offset) => {
                self.time_sync_run = None;
                self.adopt_time_offset(offset);
                Ok(())
            }
        }
    }

    fn on_remote_error(&mut self, error: RemoteError) {
        if error.code == remote_error_codes::AUTH_RESPONSE_EXPIRED {
            info!("authentication expired, re-authenticating");
            self.begin_reauth(error.challenge);
            return;
        }
        match Error::from_remote(&error.code, &error.text) {
            Some(mapped) => {
                warn!(code = %error.code, text = %error.text, "remote error");
                self.time_sync_run = None;
                self.pending.clear(&mapped);
            }
            None => warn!(code = %error.code, text = %error.text, "unrecognised remote error"),
        }
    }

    // -- re-authentication --

    fn begin_reauth(&mut self, challenge: Vec<u8>) {
        if !challenge.is_empty() {
            self.challenge = challenge;
        }
        // At most one re-auth prompt outstanding at a time.
        if !matches!(self.reauth, ReauthPhase::Idle) {
            return;
        }
        self.prompt_reauth(None);
    }

    fn prompt_reauth(&mut self, auth_result: Option<UserAuthResult>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.listener
            .on_credentials_requested(CredentialsRequest::new(auth_result, reply_tx));
        self.reauth_rx = Some(reply_rx);
        self.reauth = ReauthPhase::AwaitingCredentials;
    }

    async fn on_reauth_credentials(
        &mut self,
        ws: &mut WsStream,
        credentials: Option<HashMap<String, String>>,
    ) -> Result<(), SessionFailure> {
        let Some(credentials) = credentials else {
            warn!("re-authentication credentials were not provided");
            self.reauth = ReauthPhase::Idle;
            return Ok(());
        };
        match auth::compose_auth_request(&self.challenge, &credentials) {
            Ok(request) => {
                self.reauth = ReauthPhase::AwaitingResponse;
                send_frame(ws, &Container::ReAuthRequest(request)).await
            }
            Err(error) => {
                warn!(%error, "invalid re-authentication credentials");
                self.reauth = ReauthPhase::Idle;
                Ok(())
            }
        }
    }

    fn on_reauth_response(&mut self, response: &AuthResponse) {
        if !matches!(self.reauth, ReauthPhase::AwaitingResponse) {
            debug!("unexpected re-auth response");
            return;
        }
        if response.result_code.is_granted() {
            info!("re-authentication granted");
            self.reauth = ReauthPhase::Idle;
            self.shared.set_authenticated(true);
            return;
        }
        warn!(
            code = ?response.result_code,
            text = %response.result_text,
            "re-authentication denied"
        );
        self.prompt_reauth(Some(UserAuthResult::from_response(response)));
    }
}

fn message_kind(container: &Container) -> &'static str {
    match container {
        Container::StructureRequest(_) => "structure_request",
        Container::StructureResponse(_) => "structure_response",
        Container::GetterRequest(_) => "getter_request",
        Container::GetterResponse(_) => "getter_response",
        Container::SetterRequest(_) => "setter_request",
        Container::StructureChangeResponse(_) => "structure_change_response",
        Container::CurrentTimeRequest(_) => "current_time_request",
        Container::CurrentTimeResponse(_) => "current_time_response",
        Container::ReAuthRequest(_) => "re_auth_request",
        Container::ReAuthResponse(_) => "re_auth_response",
        Container::RemoteError(_) => "remote_error",
    }
}

#[cfg(test)]
pub(crate) fn test_handle() -> (SessionHandle, mpsc::UnboundedReceiver<Command>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let handle = SessionHandle {
        commands: commands_tx,
        shared: Arc::new(SessionShared::new()),
    };
    (handle, commands_rx)
}
