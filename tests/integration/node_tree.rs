use cdp_client::{
    Client, ClientOptions, DefaultListener, Error, NodeType, NotificationListener, Value, ValueType,
};
use cdp_proto::{Container, NodeStructure, StructureChangeResponse};
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

/// `System -> App1 (local) -> Comp1 -> Value1 (double property, id 5)`.
fn sample_tree() -> NodeStructure {
    fixtures::system_node(vec![
        fixtures::with_children(
            fixtures::application_node(1, "App1", true, false),
            vec![fixtures::component_node(
                9,
                "Comp1",
                vec![fixtures::property_node(5, "Value1", ValueType::Double)],
            )],
        ),
        fixtures::application_node(2, "App2", false, false),
    ])
}

#[tokio::test]
async fn root_resolves_to_the_local_application() {
    let server = MockCdpServer::start(MockServerConfig {
        tree: fixtures::system_node(vec![
            fixtures::application_node(1, "App1", true, true),
            fixtures::application_node(2, "App2", false, false),
        ]),
        ..Default::default()
    })
    .await
    .unwrap();

    let (client, runner) = spawn_client(options_for(&server), Arc::new(DefaultListener));
    let root = timeout(Duration::from_secs(5), client.root())
        .await
        .expect("root timed out")
        .unwrap();

    assert_eq!(root.name(), "App1");
    assert_eq!(root.id(), 1);
    assert_eq!(root.node_type(), NodeType::Application);
    assert!(root.is_leaf());
    assert!(root.is_read_only());
    assert_eq!(root.path(), "App1");

    // A second call resolves from the cache, against the same instance.
    let cached = timeout(Duration::from_secs(1), client.root())
        .await
        .expect("cached root timed out")
        .unwrap();
    assert!(Arc::ptr_eq(&cached, &root));

    client.disconnect();
    let _ = timeout(Duration::from_secs(2), runner).await;
}

#[tokio::test]
async fn find_node_descends_a_dotted_path() {
    let server = MockCdpServer::start(MockServerConfig {
        tree: sample_tree(),
        ..Default::default()
    })
    .await
    .unwrap();

    let (client, runner) = spawn_client(options_for(&server), Arc::new(DefaultListener));
    let value = timeout(Duration::from_secs(5), client.find_node("App1.Comp1.Value1"))
        .await
        .expect("find_node timed out")
        .unwrap();

    assert_eq!(value.id(), 5);
    assert_eq!(value.name(), "Value1");
    assert_eq!(value.node_type(), NodeType::Property);
    assert_eq!(value.value_type(), ValueType::Double);
    assert!(value.is_leaf());
    assert_eq!(value.path(), "App1.Comp1.Value1");
    assert_eq!(value.last_value(), Value::Double(0.0));

    client.disconnect();
    let _ = timeout(Duration::from_secs(2), runner).await;
}

#[tokio::test]
async fn missing_child_fails_locally_with_not_found() {
    let server = MockCdpServer::start(MockServerConfig {
        tree: sample_tree(),
        ..Default::default()
    })
    .await
    .unwrap();

    let (client, runner) = spawn_client(options_for(&server), Arc::new(DefaultListener));
    let root = timeout(Duration::from_secs(5), client.root())
        .await
        .expect("root timed out")
        .unwrap();

    let result = timeout(Duration::from_secs(1), root.child("Nope"))
        .await
        .expect("child timed out");
    assert!(matches!(result, Err(Error::NotFound(_))));

    client.disconnect();
    let _ = timeout(Duration::from_secs(2), runner).await;
}

#[tokio::test]
async fn value_subscription_starts_one_getter_and_delivers_updates() {
    let base_timestamp: u64 = 1_700_000_000_000_000_000;
    let server = MockCdpServer::start(MockServerConfig {
        tree: sample_tree(),
        values: vec![fixtures::double_value(5, 55.0, base_timestamp)],
        ..Default::default()
    })
    .await
    .unwrap();

    let (client, runner) = spawn_client(options_for(&server), Arc::new(DefaultListener));
    let value = timeout(Duration::from_secs(5), client.find_node("App1.Comp1.Value1"))
        .await
        .expect("find_node timed out")
        .unwrap();

    let observed: Arc<Mutex<Vec<(Value, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    let _token = value.subscribe_to_value_changes(move |value, timestamp| {
        sink.lock().unwrap().push((value.clone(), timestamp));
    });

    assert!(
        wait_until(Duration::from_secs(5), || !observed.lock().unwrap().is_empty()).await,
        "no value update arrived"
    );

    {
        let events = observed.lock().unwrap();
        assert_eq!(events[0].0, Value::Double(55.0));
        // Offset-adjusted against a zero-skew server: within a second.
        let delta = events[0].1.abs_diff(base_timestamp);
        assert!(delta < 1_000_000_000, "timestamp off by {delta}ns");
    }
    assert_eq!(value.last_value(), Value::Double(55.0));

    // Exactly one getter request, fs = 5, for the subscribed node; a second
    // subscriber does not re-request.
    let _second = value.subscribe_to_value_changes(|_, _| {});
    tokio::time::sleep(Duration::from_millis(100)).await;
    let getters: Vec<_> = server
        .records()
        .getter_requests
        .into_iter()
        .filter(|r| !r.stop)
        .collect();
    assert_eq!(getters.len(), 1);
    assert_eq!(getters[0].node_id, 5);
    assert!((getters[0].fs - 5.0).abs() < f64::EPSILON);

    client.disconnect();
    let _ = timeout(Duration::from_secs(2), runner).await;
}

#[tokio::test]
async fn removing_the_last_subscriber_sends_one_stop() {
    let server = MockCdpServer::start(MockServerConfig {
        tree: sample_tree(),
        ..Default::default()
    })
    .await
    .unwrap();

    let (client, runner) = spawn_client(options_for(&server), Arc::new(DefaultListener));
    let value = timeout(Duration::from_secs(5), client.find_node("App1.Comp1.Value1"))
        .await
        .expect("find_node timed out")
        .unwrap();

    let first = value.subscribe_to_value_changes(|_, _| {});
    let second = value.subscribe_to_value_changes(|_, _| {});
    value.unsubscribe_from_value_changes(first);
    value.unsubscribe_from_value_changes(second);

    assert!(
        wait_until(Duration::from_secs(5), || {
            server.records().getter_requests.iter().any(|r| r.stop)
        })
        .await,
        "getter stop never arrived"
    );
    let stops: Vec<_> = server
        .records()
        .getter_requests
        .into_iter()
        .filter(|r| r.stop)
        .collect();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].node_id, 5);

    client.disconnect();
    let _ = timeout(Duration::from_secs(2), runner).await;
}

#[tokio::test]
async fn set_value_sends_a_typed_setter() {
    let server = MockCdpServer::start(MockServerConfig {
        tree: sample_tree(),
        ..Default::default()
    })
    .await
    .unwrap();

    let (client, runner) = spawn_client(options_for(&server), Arc::new(DefaultListener));
    let value = timeout(Duration::from_secs(5), client.find_node("App1.Comp1.Value1"))
        .await
        .expect("find_node timed out")
        .unwrap();

    value.set_value(Value::Double(42.5), 0);

    assert!(
        wait_until(Duration::from_secs(5), || {
            !server.records().setter_requests.is_empty()
        })
        .await,
        "setter never arrived"
    );
    let setters = server.records().setter_requests;
    assert_eq!(setters.len(), 1);
    assert_eq!(setters[0].node_id, 5);
    assert_eq!(setters[0].d_value, Some(42.5));
    assert_eq!(setters[0].timestamp, 0);

    client.disconnect();
    let _ = timeout(Duration::from_secs(2), runner).await;
}

#[tokio::test]
async fn structure_change_notification_diffs_the_children() {
    let server = MockCdpServer::start(MockServerConfig {
        tree: fixtures::system_node(vec![fixtures::with_children(
            fixtures::application_node(1, "App1", true, false),
            vec![
                fixtures::component_node(9, "Comp1", vec![]),
                fixtures::component_node(10, "Comp2", vec![]),
            ],
        )]),
        ..Default::default()
    })
    .await
    .unwrap();

    let (client, runner) = spawn_client(options_for(&server), Arc::new(DefaultListener));
    let root = timeout(Duration::from_secs(5), client.root())
        .await
        .expect("root timed out")
        .unwrap();

    let observed: Arc<Mutex<Vec<(Vec<String>, Vec<String>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    let _token = root.subscribe_to_structure_changes(move |added, removed| {
        sink.lock()
            .unwrap()
            .push((added.to_vec(), removed.to_vec()));
    });

    server.set_tree(fixtures::system_node(vec![fixtures::with_children(
        fixtures::application_node(1, "App1", true, false),
        vec![fixtures::component_node(11, "Comp3", vec![])],
    )]));
    server.push(Container::StructureChangeResponse(StructureChangeResponse {
        node_ids: vec![1],
    }));

    assert!(
        wait_until(Duration::from_secs(5), || !observed.lock().unwrap().is_empty()).await,
        "structure change never surfaced"
    );

    let events = observed.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, vec!["Comp3".to_owned()]);
    let mut removed = events[0].1.clone();
    removed.sort();
    assert_eq!(removed, vec!["Comp1".to_owned(), "Comp2".to_owned()]);

    let child = timeout(Duration::from_secs(5), root.child("Comp3"))
        .await
        .expect("child timed out")
        .unwrap();
    assert_eq!(child.id(), 11);
    assert!(matches!(
        timeout(Duration::from_secs(1), root.child("Comp1"))
            .await
            .expect("child timed out"),
        Err(Error::NotFound(_))
    ));

    client.disconnect();
    let _ = timeout(Duration::from_secs(2), runner).await;
}

#[tokio::test]
async fn children_resolves_every_cached_child() {
    let server = MockCdpServer::start(MockServerConfig {
        tree: fixtures::system_node(vec![fixtures::with_children(
            fixtures::application_node(1, "App1", true, false),
            vec![
                fixtures::component_node(9, "Comp1", vec![]),
                fixtures::property_node(5, "Value1", ValueType::Double),
            ],
        )]),
        ..Default::default()
    })
    .await
    .unwrap();

    let (client, runner) = spawn_client(options_for(&server), Arc::new(DefaultListener));
    let root = timeout(Duration::from_secs(5), client.root())
        .await
        .expect("root timed out")
        .unwrap();

    let children = timeout(Duration::from_secs(5), root.children())
        .await
        .expect("children timed out")
        .unwrap();
    let mut names: Vec<String> = children.iter().map(|c| c.name()).collect();
    names.sort();
    assert_eq!(names, vec!["Comp1".to_owned(), "Value1".to_owned()]);

    client.disconnect();
    let _ = timeout(Duration::from_secs(2), runner).await;
}
