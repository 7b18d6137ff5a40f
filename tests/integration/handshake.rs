use cdp_client::{
    ApplicationAcceptanceRequest, Client, ClientOptions, DefaultListener, Error,
    NotificationListener,
};
use cdp_test_utils::{MockCdpServer, MockServerConfig, fixtures};
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

/// Records every acceptance request and answers with a fixed decision.
struct RecordingListener {
    accept: bool,
    seen: Mutex<Vec<(String, String, String, String)>>,
}

impl RecordingListener {
    fn new(accept: bool) -> Self {
        Self {
            accept,
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl NotificationListener for RecordingListener {
    fn on_application_acceptance_requested(&self, request: ApplicationAcceptanceRequest) {
        self.seen.lock().unwrap().push((
            request.system_name.clone(),
            request.application_name.clone(),
            request.cdp_version.clone(),
            request.system_use_notification.clone(),
        ));
        if self.accept {
            request.accept();
        } else {
            request.reject();
        }
    }
}

#[tokio::test]
async fn valid_hello_establishes_a_session() {
    let server = MockCdpServer::start(MockServerConfig {
        system_use_notification: "authorized use only".to_owned(),
        ..Default::default()
    })
    .await
    .unwrap();

    let listener = Arc::new(RecordingListener::new(true));
    let (client, runner) = spawn_client(options_for(&server), Arc::clone(&listener) as _);

    let root = timeout(Duration::from_secs(5), client.root())
        .await
        .expect("root timed out")
        .unwrap();
    assert_eq!(root.name(), "App1");
    assert!(client.is_connected());
    assert_eq!(client.system_name(), "foo");
    assert_eq!(client.application_name(), "App1");
    assert_eq!(client.cdp_version(), "3.2.1");
    assert_eq!(client.system_use_notification(), "authorized use only");

    let seen = listener.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "foo");
    assert_eq!(seen[0].2, "3.2.1");
    assert_eq!(seen[0].3, "authorized use only");

    client.disconnect();
    let result = timeout(Duration::from_secs(2), runner)
        .await
        .expect("runner timed out")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn protocol_mismatch_is_terminal_despite_auto_reconnect() {
    let server = MockCdpServer::start(MockServerConfig {
        compat_version: 2,
        ..Default::default()
    })
    .await
    .unwrap();

    let (client, runner) = spawn_client(options_for(&server), Arc::new(DefaultListener));
    let result = timeout(Duration::from_secs(5), runner)
        .await
        .expect("runner timed out")
        .unwrap();
    match result {
        Err(Error::Communication(text)) => assert_eq!(text, "Protocol mismatch"),
        other => panic!("expected protocol mismatch, got {other:?}"),
    }
    assert!(!client.is_connected());
}

#[tokio::test]
async fn embedder_rejection_closes_the_connection() {
    let server = MockCdpServer::start(MockServerConfig::default()).await.unwrap();

    let listener = Arc::new(RecordingListener::new(false));
    let (_client, runner) = spawn_client(options_for(&server), Arc::clone(&listener) as _);

    let result = timeout(Duration::from_secs(5), runner)
        .await
        .expect("runner timed out")
        .unwrap();
    assert!(matches!(result, Err(Error::Connection(_))));
    assert_eq!(listener.seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn disconnect_before_running_rejects_queued_requests() {
    let server = MockCdpServer::start(MockServerConfig::default()).await.unwrap();

    let client = Arc::new(Client::new(options_for(&server), Arc::new(DefaultListener)));
    let root_task = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.root().await })
    };
    // Let the root request land in the command queue before shutting down.
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.disconnect();

    let run_result = timeout(Duration::from_secs(2), client.run_event_loop())
        .await
        .expect("event loop timed out");
    assert!(run_result.is_ok());

    let root_result = timeout(Duration::from_secs(2), root_task)
        .await
        .expect("root timed out")
        .unwrap();
    match root_result {
        Err(Error::Connection(text)) => assert_eq!(text, "Connection was closed"),
        other => panic!("expected connection error, got {other:?}"),
    }
}

#[tokio::test]
async fn initial_time_sync_takes_three_samples() {
    let server = MockCdpServer::start(MockServerConfig::default()).await.unwrap();

    let (client, runner) = spawn_client(options_for(&server), Arc::new(DefaultListener));
    let _root = timeout(Duration::from_secs(5), client.root())
        .await
        .expect("root timed out")
        .unwrap();

    let records = server.records();
    assert_eq!(records.time_requests, 3);
    // Against a zero-offset server the estimate stays near zero.
    assert!(client.time_offset_seconds().abs() < 1.0);

    client.disconnect();
    let _ = timeout(Duration::from_secs(2), runner).await;
}

#[tokio::test]
async fn offset_estimate_tracks_a_skewed_server_clock() {
    let server = MockCdpServer::start(MockServerConfig {
        // Server clock runs one hour ahead of the client.
        time_offset_ns: 3_600 * 1_000_000_000,
        tree: fixtures::system_node(vec![fixtures::application_node(1, "App1", true, true)]),
        ..Default::default()
    })
    .await
    .unwrap();

    let (client, runner) = spawn_client(options_for(&server), Arc::new(DefaultListener));
    let _root = timeout(Duration::from_secs(5), client.root())
        .await
        .expect("root timed out")
        .unwrap();

    let offset = client.time_offset_seconds();
    assert!(
        (offset + 3_600.0).abs() < 1.0,
        "expected about -3600s, got {offset}"
    );

    client.disconnect();
    let _ = timeout(Duration::from_secs(2), runner).await;
}
