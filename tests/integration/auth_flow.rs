use cdp_client::{
    AuthResultCode, Client, ClientOptions, CredentialsRequest, NotificationListener,
};
use cdp_proto::{Container, RemoteError, remote_error_codes};
use cdp_test_utils::{MockCdpServer, MockServerConfig, fixtures};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};

fn options_for(server: &MockCdpServer) -> ClientOptions {
    let addr = server.local_addr();
    let mut options = ClientOptions::new(addr.ip().to_string());
    options.port = addr.port();
    options
}

fn spawn_client(
    options: ClientOptions,
    listener: Arc<dyn NotificationListener>,
) -> (Arc<Client>, JoinHandle<cdp_client::Result<()>>) {
    let client = Arc::new(Client::new(options, listener));
    let runner = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.run_event_loop().await })
    };
    (client, runner)
}

async fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn credentials(user: &str, password: &str) -> HashMap<String, String> {
    HashMap::from([
        ("Username".to_owned(), user.to_owned()),
        ("Password".to_owned(), password.to_owned()),
    ])
}

/// Answers credentials prompts from a queue, recording the auth result each
/// prompt carried.
struct QueueListener {
    supply: Mutex<VecDeque<HashMap<String, String>>>,
    prompts: Mutex<Vec<Option<AuthResultCode>>>,
}

impl QueueListener {
    fn new(supply: Vec<HashMap<String, String>>) -> Self {
        Self {
            supply: Mutex::new(supply.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn prompt_codes(&self) -> Vec<Option<AuthResultCode>> {
        self.prompts.lock().unwrap().clone()
    }
}

impl NotificationListener for QueueListener {
    fn on_credentials_requested(&self, request: CredentialsRequest) {
        self.prompts
            .lock()
            .unwrap()
            .push(request.user_auth_result().map(|r| r.code));
        match self.supply.lock().unwrap().pop_front() {
            Some(entry) => request.accept(entry),
            None => request.reject(),
        }
    }
}

fn expected_digest(challenge: &[u8], user_lowercase: &str, password: &str) -> Vec<u8> {
    let user_pass_hash = Sha256::digest(format!("{user_lowercase}:{password}").as_bytes());
    let mut outer = Sha256::new();
    outer.update(challenge);
    outer.update(b":");
    outer.update(user_pass_hash);
    outer.finalize().to_vec()
}

#[tokio::test]
async fn granted_credentials_establish_an_authenticated_session() {
    let server = MockCdpServer::start(MockServerConfig {
        challenge: b"challenge".to_vec(),
        credentials: Some(("Testuser".to_owned(), "testpass".to_owned())),
        ..Default::default()
    })
    .await
    .unwrap();

    let listener = Arc::new(QueueListener::new(vec![credentials("Testuser", "testpass")]));
    let (client, runner) = spawn_client(options_for(&server), Arc::clone(&listener) as _);

    let root = timeout(Duration::from_secs(5), client.root())
        .await
        .expect("root timed out")
        .unwrap();
    assert_eq!(root.name(), "App1");
    assert!(client.is_connected());
    assert!(client.is_authenticated());

    // One prompt, with no prior result attached.
    assert_eq!(listener.prompt_codes(), vec![None]);

    // The wire carried the user id as typed and the lower-cased-user digest.
    let records = server.records();
    assert_eq!(records.auth_requests.len(), 1);
    let request = &records.auth_requests[0];
    assert_eq!(request.user_id, "Testuser");
    assert_eq!(request.challenge_response.len(), 1);
    assert_eq!(request.challenge_response[0].response_type, "PasswordHash");
    assert_eq!(
        request.challenge_response[0].response,
        expected_digest(b"challenge", "testuser", "testpass")
    );

    client.disconnect();
    let _ = timeout(Duration::from_secs(2), runner).await;
}

#[tokio::test]
async fn denied_credentials_reprompt_with_the_result_code() {
    let server = MockCdpServer::start(MockServerConfig {
        challenge: b"challenge".to_vec(),
        credentials: Some(("Testuser".to_owned(), "testpass".to_owned())),
        ..Default::default()
    })
    .await
    .unwrap();

    let listener = Arc::new(QueueListener::new(vec![
        credentials("Testuser", "wrongpass"),
        credentials("Testuser", "testpass"),
    ]));
    let (client, runner) = spawn_client(options_for(&server), Arc::clone(&listener) as _);

    let _root = timeout(Duration::from_secs(5), client.root())
        .await
        .expect("root timed out")
        .unwrap();

    assert_eq!(
        listener.prompt_codes(),
        vec![None, Some(AuthResultCode::InvalidChallengeResponse)]
    );
    assert_eq!(server.records().auth_requests.len(), 2);

    client.disconnect();
    let _ = timeout(Duration::from_secs(2), runner).await;
}

#[tokio::test]
async fn rejected_credentials_prompt_is_terminal() {
    let server = MockCdpServer::start(MockServerConfig {
        challenge: b"challenge".to_vec(),
        credentials: Some(("Testuser".to_owned(), "testpass".to_owned())),
        ..Default::default()
    })
    .await
    .unwrap();

    // Empty queue: the listener rejects the first prompt.
    let listener = Arc::new(QueueListener::new(vec![]));
    let (_client, runner) = spawn_client(options_for(&server), Arc::clone(&listener) as _);

    let result = timeout(Duration::from_secs(5), runner)
        .await
        .expect("runner timed out")
        .unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn expired_auth_response_drives_reauthentication() {
    let server = MockCdpServer::start(MockServerConfig {
        challenge: b"challenge".to_vec(),
        credentials: Some(("Testuser".to_owned(), "testpass".to_owned())),
        tree: fixtures::system_node(vec![fixtures::with_children(
            fixtures::application_node(1, "App1", true, false),
            vec![fixtures::component_node(9, "Comp1", vec![])],
        )]),
        ..Default::default()
    })
    .await
    .unwrap();

    let listener = Arc::new(QueueListener::new(vec![
        credentials("Testuser", "testpass"),
        credentials("Testuser", "testpass"),
    ]));
    let (client, runner) = spawn_client(options_for(&server), Arc::clone(&listener) as _);

    let _root = timeout(Duration::from_secs(5), client.root())
        .await
        .expect("root timed out")
        .unwrap();

    server.push(Container::RemoteError(RemoteError {
        code: remote_error_codes::AUTH_RESPONSE_EXPIRED.to_owned(),
        text: "Session expired".to_owned(),
        challenge: b"challenge".to_vec(),
    }));

    assert!(
        wait_until(Duration::from_secs(5), || {
            server.records().reauth_requests.len() == 1
        })
        .await,
        "re-auth request never arrived"
    );
    let records = server.records();
    assert_eq!(records.reauth_requests[0].user_id, "Testuser");
    assert_eq!(listener.prompt_codes(), vec![None, None]);

    // The expiry left pending work untouched; the session keeps serving.
    let comp = timeout(Duration::from_secs(5), client.find_node("App1.Comp1"))
        .await
        .expect("find_node timed out")
        .unwrap();
    assert_eq!(comp.id(), 9);
    assert!(client.is_authenticated());

    client.disconnect();
    let _ = timeout(Duration::from_secs(2), runner).await;
}
