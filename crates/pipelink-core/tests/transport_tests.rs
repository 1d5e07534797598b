//! Integration tests for servers and clients over real endpoints.
//!
//! Every test claims its own uniquely named endpoint, so the suite can run
//! in parallel against the shared pipe directory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::join_all;
use pipelink::{
    ClientOptions, ConnectHook, ConnectMode, JsonFormatter, PipeClient, PipeConnection, PipeError,
    PipeEvent, PipeEvents, PipeServer, ServerOptions, SingleConnectionPipeServer,
};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

async fn started_server(name: &str) -> (PipeServer<String>, PipeEvents<String>) {
    let server = PipeServer::new(name);
    let events = server.take_events().expect("events already taken");
    server.start().await.expect("server failed to start");
    (server, events)
}

async fn connected_client(name: &str) -> (PipeClient<String>, PipeEvents<String>) {
    let client = PipeClient::new(name);
    let events = client.take_events().expect("events already taken");
    tokio::time::timeout(WAIT, client.connect())
        .await
        .expect("connect timed out")
        .expect("connect failed");
    (client, events)
}

async fn next_event(events: &mut PipeEvents<String>) -> PipeEvent<String> {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

async fn expect_text(events: &mut PipeEvents<String>, expected: &str) -> Arc<PipeConnection<String>> {
    let (connection, _) = events
        .wait_message(|m| m.map(String::as_str) == Some(expected), WAIT)
        .await
        .unwrap_or_else(|e| panic!("never received {:?}: {}", expected, e));
    connection
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_client_roundtrip() {
    init_tracing();
    let name = unique_name("roundtrip");
    let (server, mut server_events) = started_server(&name).await;
    let (client, mut client_events) = connected_client(&name).await;

    let connected = server_events.wait_connected(WAIT).await.unwrap();
    assert!(connected.pipe_name().starts_with(&format!("{}_", name)));
    assert_eq!(
        client.connection().unwrap().pipe_name(),
        connected.pipe_name()
    );

    client.write(Some(&"ping".to_string())).await.unwrap();
    let from = expect_text(&mut server_events, "ping").await;

    server
        .write_to(from.pipe_name(), Some(&"pong".to_string()))
        .await
        .unwrap();
    expect_text(&mut client_events, "pong").await;

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_zero_length_message_then_close() {
    init_tracing();
    let name = unique_name("empty");
    let (server, mut server_events) = started_server(&name).await;
    let (client, _client_events) = connected_client(&name).await;
    server_events.wait_connected(WAIT).await.unwrap();

    client.write(None).await.unwrap();
    client.disconnect().await;

    match next_event(&mut server_events).await {
        PipeEvent::Message { message, .. } => assert_eq!(message, None),
        other => panic!("expected empty message, got {:?}", other),
    }
    assert!(matches!(
        next_event(&mut server_events).await,
        PipeEvent::Disconnected(_)
    ));

    server.stop().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server_events.try_recv().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clients_get_isolated_channels() {
    init_tracing();
    let name = unique_name("isolated");
    let (server, mut server_events) = started_server(&name).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connected_client(&name).await);
        server_events.wait_connected(WAIT).await.unwrap();
    }

    let mut names: Vec<String> = clients
        .iter()
        .map(|(c, _)| c.connection().unwrap().pipe_name().to_string())
        .collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 3);

    let mut server_names = server.connected_pipe_names();
    server_names.sort();
    assert_eq!(server_names, names);

    // A targeted write reaches only its addressee.
    let (first, first_events) = &mut clients[0];
    let target = first.connection().unwrap().pipe_name().to_string();
    server
        .write_to(&target, Some(&"only-you".to_string()))
        .await
        .unwrap();
    expect_text(first_events, "only-you").await;

    server.write(Some(&"everyone".to_string())).await.unwrap();
    for (_, events) in clients.iter_mut() {
        let (_, message) = events
            .wait_message(|_| true, WAIT)
            .await
            .expect("broadcast not received");
        assert_eq!(message.as_deref(), Some("everyone"));
    }

    for (client, _) in &clients {
        client.disconnect().await;
    }
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_broadcast_reaches_every_client() {
    init_tracing();
    let name = unique_name("broadcast");
    let (server, mut server_events) = started_server(&name).await;

    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(connected_client(&name).await);
        server_events.wait_connected(WAIT).await.unwrap();
    }

    for round in 0..10 {
        server.write(Some(&format!("round-{}", round))).await.unwrap();
    }

    for (_, events) in clients.iter_mut() {
        for round in 0..10 {
            expect_text(events, &format!("round-{}", round)).await;
        }
    }

    for (client, _) in &clients {
        client.disconnect().await;
    }
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_connects_to_late_server() {
    init_tracing();
    let name = unique_name("late");
    let client: PipeClient<String> = PipeClient::new(&name);
    let mut client_events = client.take_events().unwrap();

    let connecting = {
        let name = name.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            started_server(&name).await
        })
    };

    tokio::time::timeout(WAIT, client.connect())
        .await
        .expect("connect timed out")
        .unwrap();
    client_events.wait_connected(WAIT).await.unwrap();

    let (server, _server_events) = connecting.await.unwrap();
    client.disconnect().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_reconnects_after_server_restart() {
    init_tracing();
    let name = unique_name("restart");
    let (server, mut server_events) = started_server(&name).await;
    let (client, mut client_events) = connected_client(&name).await;
    client_events.wait_connected(WAIT).await.unwrap();
    server_events.wait_connected(WAIT).await.unwrap();

    server.stop().await;
    loop {
        if let PipeEvent::Disconnected(_) = next_event(&mut client_events).await {
            break;
        }
    }

    server.start().await.unwrap();
    client_events.wait_connected(WAIT).await.unwrap();
    server_events.wait_connected(WAIT).await.unwrap();

    client.write(Some(&"back".to_string())).await.unwrap();
    expect_text(&mut server_events, "back").await;

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_double_start_and_restart() {
    init_tracing();
    let name = unique_name("double");
    let (first, _first_events) = started_server(&name).await;

    let result = first.start().await;
    assert!(matches!(result, Err(PipeError::AlreadyStarted { .. })));

    let second: PipeServer<String> = PipeServer::new(&name);
    let result = second.start().await;
    assert!(matches!(result, Err(PipeError::NameConflict { .. })));
    assert!(!second.is_started().await);

    first.stop().await;
    first.stop().await;
    assert!(!first.is_started().await);

    second.start().await.unwrap();
    assert!(second.is_started().await);
    second.stop().await;

    first.start().await.unwrap();
    first.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wait_free_pipe_takes_over_released_name() {
    init_tracing();
    let name = unique_name("waitfree");
    let (first, _first_events) = started_server(&name).await;

    let second: Arc<PipeServer<String>> = Arc::new(PipeServer::with_options(
        &name,
        JsonFormatter::shared(),
        ServerOptions::default().with_wait_free_pipe(true),
    ));
    let starting = {
        let second = second.clone();
        tokio::spawn(async move { second.start().await })
    };

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!starting.is_finished());

    // A pending bind does not hold up status checks.
    let started = tokio::time::timeout(Duration::from_secs(1), second.is_started())
        .await
        .expect("is_started blocked behind a pending start");
    assert!(!started);

    first.stop().await;
    tokio::time::timeout(WAIT, starting)
        .await
        .expect("second server never claimed the name")
        .unwrap()
        .unwrap();
    assert!(second.is_started().await);
    second.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oversized_frame_disconnects_both_peers() {
    init_tracing();
    let name = unique_name("oversized");
    // Shorter than the data name, so the handshake must not be held to it.
    let server: PipeServer<String> = PipeServer::with_options(
        &name,
        JsonFormatter::shared(),
        ServerOptions::default().with_max_message_size(16),
    );
    let mut server_events = server.take_events().unwrap();
    server.start().await.unwrap();

    let client: PipeClient<String> = PipeClient::with_options(
        &name,
        ConnectMode::Handshake,
        JsonFormatter::shared(),
        ClientOptions::default().with_auto_reconnect(false),
    );
    let mut client_events = client.take_events().unwrap();
    tokio::time::timeout(WAIT, client.connect())
        .await
        .expect("connect timed out")
        .expect("connect failed");
    server_events.wait_connected(WAIT).await.unwrap();
    client_events.wait_connected(WAIT).await.unwrap();

    client.write(Some(&"x".repeat(300))).await.unwrap();

    match next_event(&mut server_events).await {
        PipeEvent::Error { connection, error } => {
            assert!(connection.is_some());
            assert!(matches!(
                *error,
                PipeError::MessageTooLarge { size: 302, max: 16 }
            ));
        }
        other => panic!("expected oversized frame error, got {:?}", other),
    }
    assert!(matches!(
        next_event(&mut server_events).await,
        PipeEvent::Disconnected(_)
    ));

    assert!(matches!(
        next_event(&mut client_events).await,
        PipeEvent::Disconnected(_)
    ));
    assert!(!client.is_connected());
    let result = client.write(Some(&"after".to_string())).await;
    assert!(matches!(result, Err(PipeError::NotConnected { .. })));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connects_share_one_attempt() {
    init_tracing();
    let name = unique_name("concurrent");
    let (server, mut server_events) = started_server(&name).await;

    let client: PipeClient<String> = PipeClient::new(&name);
    let results = tokio::time::timeout(WAIT, join_all((0..5).map(|_| client.connect())))
        .await
        .expect("connects timed out");
    assert!(results.iter().all(|r| r.is_ok()));

    server_events.wait_connected(WAIT).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.connected_pipe_names().len(), 1);
    while let Some(event) = server_events.try_recv() {
        assert!(!matches!(event, PipeEvent::Connected(_)));
    }

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_untaken_events_do_not_retain_connections() {
    init_tracing();
    let name = unique_name("untaken");
    let server: PipeServer<String> = PipeServer::new(&name);
    server.start().await.unwrap();

    let (first, _first_events) = connected_client(&name).await;
    let deadline = Instant::now() + WAIT;
    let served: Weak<PipeConnection<String>> = loop {
        if let Some(connection) = server.connections().first() {
            break Arc::downgrade(connection);
        }
        assert!(Instant::now() < deadline, "server never registered the client");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    for i in 0..200 {
        first.write(Some(&format!("message {}", i))).await.unwrap();
    }
    first.disconnect().await;
    let deadline = Instant::now() + WAIT;
    while served.upgrade().is_some_and(|c| c.is_connected()) {
        assert!(Instant::now() < deadline, "server never saw the client leave");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Connecting again prunes the dead connection from the set.
    let (second, _second_events) = connected_client(&name).await;
    let deadline = Instant::now() + WAIT;
    while served.strong_count() > 0 {
        assert!(
            Instant::now() < deadline,
            "dead connection still has {} owners",
            served.strong_count()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    second.disconnect().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_without_connection() {
    init_tracing();
    let name = unique_name("offline");
    let client: PipeClient<String> = PipeClient::with_options(
        &name,
        ConnectMode::Handshake,
        JsonFormatter::shared(),
        ClientOptions::default().with_auto_reconnect(false),
    );
    let result = client.write(Some(&"nobody".to_string())).await;
    assert!(matches!(result, Err(PipeError::NotConnected { .. })));

    let server: PipeServer<String> = PipeServer::new(&name);
    server.write(Some(&"nobody".to_string())).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_connection_server_cycles_clients() {
    init_tracing();
    let name = unique_name("single");
    let server: SingleConnectionPipeServer<String> = SingleConnectionPipeServer::new(&name);
    let mut server_events = server.take_events().unwrap();

    server.write(Some(&"nobody home".to_string())).await.unwrap();
    server.start().await.unwrap();

    for round in 0..2 {
        let client: PipeClient<String> = PipeClient::direct(&name);
        let mut client_events = client.take_events().unwrap();
        tokio::time::timeout(WAIT, client.connect())
            .await
            .expect("connect timed out")
            .unwrap();

        let connection = server_events.wait_connected(WAIT).await.unwrap();
        assert_eq!(connection.pipe_name(), name);

        let text = format!("hello-{}", round);
        client.write(Some(&text)).await.unwrap();
        expect_text(&mut server_events, &text).await;

        server.write(Some(&"welcome".to_string())).await.unwrap();
        expect_text(&mut client_events, "welcome").await;

        client.disconnect().await;
        loop {
            if let PipeEvent::Disconnected(_) = next_event(&mut server_events).await {
                break;
            }
        }
    }

    server.stop().await;
    assert!(server.connection().is_none());
}

struct Greeter {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl ConnectHook<String> for Greeter {
    async fn on_connected(&self, connection: &Arc<PipeConnection<String>>) -> pipelink::Result<()> {
        assert!(!connection.is_started());
        self.calls.fetch_add(1, Ordering::SeqCst);
        connection.write(Some(&"greetings".to_string())).await
    }
}

struct Refuser;

#[async_trait::async_trait]
impl ConnectHook<String> for Refuser {
    async fn on_connected(&self, _connection: &Arc<PipeConnection<String>>) -> pipelink::Result<()> {
        Err(PipeError::Other("refused".into()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connect_hook_runs_before_read_loop() {
    init_tracing();
    let name = unique_name("hook");
    let server: PipeServer<String> = PipeServer::new(&name);
    let mut server_events = server.take_events().unwrap();
    let greeter = Arc::new(Greeter {
        calls: AtomicUsize::new(0),
    });
    server.set_hook(Some(greeter.clone()));
    server.start().await.unwrap();

    let (client, mut client_events) = connected_client(&name).await;
    server_events.wait_connected(WAIT).await.unwrap();
    expect_text(&mut client_events, "greetings").await;
    assert_eq!(greeter.calls.load(Ordering::SeqCst), 1);

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_client_hook_fails_connect() {
    init_tracing();
    let name = unique_name("refused");
    let (server, _server_events) = started_server(&name).await;

    let client: PipeClient<String> = PipeClient::with_options(
        &name,
        ConnectMode::Handshake,
        JsonFormatter::shared(),
        ClientOptions::default().with_auto_reconnect(false),
    );
    client.set_hook(Some(Arc::new(Refuser)));

    let result = tokio::time::timeout(WAIT, client.connect())
        .await
        .expect("connect timed out");
    assert!(matches!(result, Err(PipeError::Other(_))));
    assert!(!client.is_connected());

    server.stop().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_endpoint_init_restricts_socket() {
    use pipelink::platform::endpoint::socket_path_in;
    use pipelink::platform::{permissions::restrict_to_owner, pipe_dir};
    use std::os::unix::fs::PermissionsExt;

    init_tracing();
    let name = unique_name("private");
    let server: PipeServer<String> = PipeServer::with_options(
        &name,
        JsonFormatter::shared(),
        ServerOptions::default().with_endpoint_init(restrict_to_owner),
    );
    server.start().await.unwrap();

    let mode = std::fs::metadata(socket_path_in(&pipe_dir(), &name))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o077, 0);

    // Data endpoints get the same treatment and clients still get through.
    let (client, _client_events) = connected_client(&name).await;
    client.disconnect().await;
    server.stop().await;
}
