// mock_cdp_server: A mock CDP server for testing clients.
//
// Accepts connections on ws://127.0.0.1:<port>, opens with a Hello frame,
// verifies challenge/response authentication when configured, and serves a
// configurable node structure.  Requests are recorded for assertions and
// unsolicited containers can be pushed to live connections.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use cdp_proto::{
    AuthRequest, AuthResponse, AuthResultCode, Container, CurrentTimeResponse, GetterResponse,
    Hello, NodeStructure, RemoteError, StructureResponse, ValueRequest, VariantValue,
    remote_error_codes,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::fixtures;

type WsWriter = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReader = SplitStream<WebSocketStream<TcpStream>>;

/// What the mock server announces and serves.
#[derive(Debug, Clone)]
pub struct MockServerConfig {
    pub system_name: String,
    pub application_name: String,
    pub compat_version: u32,
    pub cdp_version: (u32, u32, u32),
    /// Empty means no authentication required.
    pub challenge: Vec<u8>,
    /// `(user_id, password)` accepted when authentication is required.
    pub credentials: Option<(String, String)>,
    pub system_use_notification: String,
    /// The system structure served for the empty structure request; node
    /// requests are answered from its subtrees.
    pub tree: NodeStructure,
    /// Getter replies by node id.
    pub values: Vec<VariantValue>,
    /// Added to the local clock when answering current-time requests.
    pub time_offset_ns: i64,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            system_name: "foo".to_owned(),
            application_name: "App1".to_owned(),
            compat_version: 1,
            cdp_version: (3, 2, 1),
            challenge: Vec::new(),
            credentials: None,
            system_use_notification: String::new(),
            tree: fixtures::system_node(vec![fixtures::application_node(1, "App1", true, true)]),
            values: Vec::new(),
            time_offset_ns: 0,
        }
    }
}

/// Everything the server has received, for test assertions.
#[derive(Debug, Clone, Default)]
pub struct Records {
    pub structure_requests: Vec<Vec<u32>>,
    pub getter_requests: Vec<ValueRequest>,
    pub setter_requests: Vec<VariantValue>,
    pub auth_requests: Vec<AuthRequest>,
    pub reauth_requests: Vec<AuthRequest>,
    pub time_requests: usize,
}

enum PushEvent {
    Send(Container),
    Close,
}

struct ServerState {
    config: MockServerConfig,
    /// When set, structure requests are recorded but never answered.
    silent: bool,
    records: Records,
    connections: Vec<mpsc::UnboundedSender<PushEvent>>,
}

/// A mock CDP server bound to a random local port.
pub struct MockCdpServer {
    addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    /// Handle to the background accept loop; dropped with the server.
    _task: tokio::task::JoinHandle<()>,
}

impl MockCdpServer {
    /// Start the mock server, binding to a random available port.  Each
    /// connection is handled in its own background task.
    pub async fn start(config: MockServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(ServerState {
            config,
            silent: false,
            records: Records::default(),
            connections: Vec::new(),
        }));

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, accept_state).await;
        });

        Ok(Self {
            addr,
            state,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn records(&self) -> Records {
        self.state.lock().unwrap().records.clone()
    }

    /// Replace the served tree; subsequent structure requests see it.
    pub fn set_tree(&self, tree: NodeStructure) {
        self.state.lock().unwrap().config.tree = tree;
    }

    /// Stop answering structure requests (they are still recorded).
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }

    /// Install or replace the getter reply for a node.
    pub fn set_value(&self, variant: VariantValue) {
        let mut state = self.state.lock().unwrap();
        state.config.values.retain(|v| v.node_id != variant.node_id);
        state.config.values.push(variant);
    }

    /// Send an unsolicited container to every live connection.
    pub fn push(&self, container: Container) {
        let mut state = self.state.lock().unwrap();
        state
            .connections
            .retain(|tx| tx.send(PushEvent::Send(container.clone())).is_ok());
    }

    /// Drop every live connection, as a crashing server would.
    pub fn close_connections(&self) {
        let mut state = self.state.lock().unwrap();
        for tx in state.connections.drain(..) {
            let _ = tx.send(PushEvent::Close);
        }
    }

    // -- internal --

    async fn accept_loop(listener: TcpListener, state: Arc<Mutex<ServerState>>) {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        // Connection errors are expected in tests (clients
                        // drop at will); swallow them.
                        let _ = Self::handle_connection(state, stream).await;
                    });
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_connection(
        state: Arc<Mutex<ServerState>>,
        stream: TcpStream,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws.split();

        let (push_tx, mut push_rx) = mpsc::unbounded_channel();
        state.lock().unwrap().connections.push(push_tx);

        let hello = {
            let state = state.lock().unwrap();
            let config = &state.config;
            Hello {
                system_name: config.system_name.clone(),
                application_name: config.application_name.clone(),
                compat_version: config.compat_version,
                incremental_version: 0,
                cdp_version_major: config.cdp_version.0,
                cdp_version_minor: config.cdp_version.1,
                cdp_version_patch: config.cdp_version.2,
                challenge: config.challenge.clone(),
                system_use_notification: config.system_use_notification.clone(),
            }
        };
        send_json(&mut write, &hello).await?;

        let requires_auth = !state.lock().unwrap().config.challenge.is_empty();
        if requires_auth && !Self::auth_phase(&state, &mut write, &mut read).await? {
            return Ok(());
        }

        loop {
            tokio::select! {
                event = push_rx.recv() => match event {
                    Some(PushEvent::Send(container)) => send_json(&mut write, &container).await?,
                    Some(PushEvent::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                },
                message = read.next() => match message {
                    None | Some(Err(_)) => return Ok(()),
                    Some(Ok(Message::Text(text))) => {
                        let Ok(container) = serde_json::from_str::<Container>(&text) else {
                            continue;
                        };
                        for reply in Self::handle_container(&state, container) {
                            send_json(&mut write, &reply).await?;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => return Ok(()),
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    /// Read bare `AuthRequest` frames until one verifies.  Returns false
    /// when the connection ends first.
    async fn auth_phase(
        state: &Arc<Mutex<ServerState>>,
        write: &mut WsWriter,
        read: &mut WsReader,
    ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let Some(text) = next_text(write, read).await? else {
                return Ok(false);
            };
            let Ok(request) = serde_json::from_str::<AuthRequest>(&text) else {
                continue;
            };
            let granted = {
                let mut state = state.lock().unwrap();
                let granted = verify_auth(&state.config, &request);
                state.records.auth_requests.push(request);
                granted
            };
            let response = AuthResponse {
                result_code: if granted {
                    AuthResultCode::Granted
                } else {
                    AuthResultCode::InvalidChallengeResponse
                },
                result_text: if granted {
                    String::new()
                } else {
                    "invalid credentials".to_owned()
                },
                additional_challenge_response_required: vec![],
            };
            send_json(write, &response).await?;
            if granted {
                return Ok(true);
            }
        }
    }

    fn handle_container(state: &Arc<Mutex<ServerState>>, container: Container) -> Vec<Container> {
        let mut state = state.lock().unwrap();
        match container {
            Container::StructureRequest(request) => {
                state.records.structure_requests.push(request.node_ids.clone());
                if state.silent {
                    return vec![];
                }
                if request.node_ids.is_empty() {
                    return vec![Container::StructureResponse(StructureResponse {
                        structures: vec![shallow(&state.config.tree)],
                    })];
                }
                let mut structures = Vec::new();
                let mut replies = Vec::new();
                for node_id in &request.node_ids {
                    match find_subtree(&state.config.tree, *node_id) {
                        Some(found) => structures.push(shallow(found)),
                        None => replies.push(Container::RemoteError(RemoteError {
                            code: remote_error_codes::INVALID_REQUEST.to_owned(),
                            text: format!("unknown node {node_id}"),
                            challenge: vec![],
                        })),
                    }
                }
                if !structures.is_empty() {
                    replies.insert(
                        0,
                        Container::StructureResponse(StructureResponse { structures }),
                    );
                }
                replies
            }
            Container::GetterRequest(request) => {
                let mut replies = Vec::new();
                for value_request in request.requests {
                    if !value_request.stop {
                        if let Some(variant) = state
                            .config
                            .values
                            .iter()
                            .find(|v| v.node_id == value_request.node_id)
                        {
                            replies.push(Container::GetterResponse(GetterResponse {
                                variants: vec![variant.clone()],
                            }));
                        }
                    }
                    state.records.getter_requests.push(value_request);
                }
                replies
            }
            Container::SetterRequest(request) => {
                state.records.setter_requests.extend(request.variants);
                vec![]
            }
            Container::CurrentTimeRequest(_) => {
                state.records.time_requests += 1;
                let now_ns = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos() as i128;
                let server_time_ns =
                    (now_ns + i128::from(state.config.time_offset_ns)).max(0) as u64;
                vec![Container::CurrentTimeResponse(CurrentTimeResponse {
                    server_time_ns,
                })]
            }
            Container::ReAuthRequest(request) => {
                let granted = verify_auth(&state.config, &request);
                state.records.reauth_requests.push(request);
                vec![Container::ReAuthResponse(AuthResponse {
                    result_code: if granted {
                        AuthResultCode::Granted
                    } else {
                        AuthResultCode::InvalidChallengeResponse
                    },
                    result_text: String::new(),
                    additional_challenge_response_required: vec![],
                })]
            }
            _ => vec![],
        }
    }
}

async fn send_json<T: Serialize>(
    write: &mut WsWriter,
    frame: &T,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let json = serde_json::to_string(frame)?;
    write.send(Message::Text(json.into())).await?;
    Ok(())
}

async fn next_text(
    write: &mut WsWriter,
    read: &mut WsReader,
) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
    loop {
        match read.next().await {
            None | Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
            Some(Ok(Message::Ping(data))) => {
                let _ = write.send(Message::Pong(data)).await;
            }
            Some(Ok(_)) => {}
        }
    }
}

/// `SHA256(challenge || ':' || SHA256(lower(user_id) || ':' || password))`.
fn verify_auth(config: &MockServerConfig, request: &AuthRequest) -> bool {
    let Some((user_id, password)) = &config.credentials else {
        return false;
    };
    if request.user_id != *user_id {
        return false;
    }
    let Some(challenge_response) = request
        .challenge_response
        .iter()
        .find(|r| r.response_type == "PasswordHash")
    else {
        return false;
    };

    let mut inner = Sha256::new();
    inner.update(user_id.to_lowercase().as_bytes());
    inner.update(b":");
    inner.update(password.as_bytes());
    let user_pass_hash = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(&config.challenge);
    outer.update(b":");
    outer.update(user_pass_hash);

    challenge_response.response == outer.finalize().to_vec()
}

/// One level of children, as the real server serves it: child metadata
/// without grandchildren (subtrees are fetched lazily).
fn shallow(structure: &NodeStructure) -> NodeStructure {
    NodeStructure {
        info: structure.info.clone(),
        children: structure
            .children
            .iter()
            .map(|child| NodeStructure {
                info: child.info.clone(),
                children: vec![],
            })
            .collect(),
    }
}

fn find_subtree(tree: &NodeStructure, node_id: u32) -> Option<&NodeStructure> {
    if tree.info.node_id == node_id {
        return Some(tree);
    }
    tree.children
        .iter()
        .find_map(|child| find_subtree(child, node_id))
}
