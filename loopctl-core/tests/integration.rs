//! Integration tests: a real control server on localhost, a scripted
//! host GUI, and clients driving it over TCP.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use loopctl_core::{
    ApiCall, ApiRegistry, BridgeOptions, ClientOptions, CommandFrame, CommandKind, Connection,
    ConnectionInfo, ControlClient, ControlServer, EventLoopBridge, Hello, HostError, HostGui,
    LoopError, Message, Reply, ResponseFrame, ServerOptions, SessionManager, ShutdownSignal,
    Status, TransportOptions, Welcome,
};
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

// ── Helpers ──────────────────────────────────────────────────────

/// Echoes payloads; `b"fail"` makes the handler fail.
#[derive(Default)]
struct Script {
    applied: Vec<Vec<u8>>,
}

impl HostGui for Script {
    fn inject_event(&mut self, payload: &[u8]) -> Result<Reply, HostError> {
        self.applied.push(payload.to_vec());
        if payload == b"fail" {
            return Err(HostError::Rejected("scripted failure".into()));
        }
        Ok(Reply::Ready(payload.to_vec()))
    }

    fn query_state(&mut self, _selector: &[u8]) -> Result<Reply, HostError> {
        Ok(Reply::Ready((self.applied.len() as u64).to_le_bytes().to_vec()))
    }
}

struct Harness {
    server: Arc<ControlServer>,
    info: ConnectionInfo,
    stop: CancellationToken,
}

impl Harness {
    async fn start(options: ServerOptions) -> Self {
        let options = ServerOptions {
            listen_address: "127.0.0.1:0".into(),
            ..options
        };
        let server = Arc::new(ControlServer::bind(&options).await.unwrap());
        let addr = server.local_addr().unwrap();
        let info = ConnectionInfo::new(addr.ip().to_string(), addr.port());
        let stop = CancellationToken::new();
        tokio::spawn({
            let server = Arc::clone(&server);
            let stop = stop.clone();
            async move { server.run(stop).await }
        });
        Self { server, info, stop }
    }

    fn sessions(&self) -> Arc<SessionManager> {
        self.server.sessions()
    }

    /// A bridge driven by hand from the test thread.
    fn manual_bridge<H: HostGui>(&self, host: H) -> EventLoopBridge<H> {
        EventLoopBridge::with_pool(
            host,
            self.sessions(),
            2,
            Handle::current(),
            BridgeOptions::default(),
        )
    }

    /// Run a bridge on its own thread, as a GUI loop would.
    fn spawn_gui<H, F>(&self, make_host: F) -> (ShutdownSignal, thread::JoinHandle<()>)
    where
        H: HostGui + 'static,
        F: FnOnce() -> H + Send + 'static,
    {
        let sessions = self.sessions();
        let runtime = Handle::current();
        let (signal_tx, signal_rx) = std::sync::mpsc::channel();
        let gui = thread::spawn(move || {
            let mut bridge = EventLoopBridge::with_pool(
                make_host(),
                sessions,
                2,
                runtime,
                BridgeOptions::default(),
            );
            let _ = signal_tx.send(bridge.shutdown_signal());
            while !bridge.state().is_stopped() {
                let tick = bridge.tick().unwrap();
                if tick.applied.is_none() && tick.completed == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
            }
        });
        (signal_rx.recv().unwrap(), gui)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn raw_connect(info: &ConnectionInfo) -> (Connection, Welcome) {
    raw_resume(info, None).await
}

async fn raw_resume(info: &ConnectionInfo, resume: Option<u64>) -> (Connection, Welcome) {
    let mut conn = Connection::connect(info).await.unwrap();
    conn.send(Message::Hello(Hello {
        client_name: "raw".into(),
        token: None,
        resume,
        capabilities: u32::MAX,
    }))
    .await
    .unwrap();
    let welcome = match next_non_ping(&mut conn).await {
        Some(Message::Welcome(w)) => w,
        other => panic!("expected Welcome, got {other:?}"),
    };
    (conn, welcome)
}

async fn next_non_ping(conn: &mut Connection) -> Option<Message> {
    tokio::time::timeout(WAIT, async {
        loop {
            match conn.recv().await? {
                Message::Ping { nonce } => conn.send(Message::Pong { nonce }).await.ok()?,
                other => return Some(other),
            }
        }
    })
    .await
    .expect("timeout")
}

async fn next_response(conn: &mut Connection) -> ResponseFrame {
    match next_non_ping(conn).await {
        Some(Message::Response(r)) => r,
        other => panic!("expected Response, got {other:?}"),
    }
}

fn command(id: u64, payload: &[u8]) -> Message {
    Message::Command(CommandFrame {
        id,
        kind: CommandKind::InjectEvent,
        args: payload.to_vec(),
    })
}

async fn wait_until(mut f: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

// ── Ordering and isolation ───────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_command_does_not_block_the_next() {
    let harness = Harness::start(ServerOptions::default()).await;
    let (signal, gui) = harness.spawn_gui(Script::default);
    let (mut conn, _) = raw_connect(&harness.info).await;

    conn.send(command(1, b"one")).await.unwrap();
    conn.send(command(2, b"fail")).await.unwrap();
    conn.send(command(3, b"three")).await.unwrap();

    let responses = [
        next_response(&mut conn).await,
        next_response(&mut conn).await,
        next_response(&mut conn).await,
    ];
    let ids: Vec<u64> = responses.iter().map(|r| r.command_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(responses[0].status, Status::Ok);
    assert_eq!(responses[1].status, Status::Failed);
    assert!(responses[1].reason().contains("scripted failure"));
    assert_eq!(responses[2].result, b"three");

    signal.trigger();
    gui.join().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn applied_order_follows_ids_across_many_commands() {
    let harness = Harness::start(ServerOptions::default()).await;
    let (signal, gui) = harness.spawn_gui(Script::default);
    let (mut conn, _) = raw_connect(&harness.info).await;

    for id in 1..=50u64 {
        conn.send(command(id, &id.to_le_bytes())).await.unwrap();
    }
    for id in 1..=50u64 {
        let r = next_response(&mut conn).await;
        assert_eq!(r.command_id, id);
        assert_eq!(r.result, id.to_le_bytes());
    }

    signal.trigger();
    gui.join().unwrap();
}

// ── Backpressure and ticks ───────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_capacity_bounds_admission_and_ticks_drain_one_each() {
    let harness = Harness::start(ServerOptions {
        queue_capacity: 10,
        ..Default::default()
    })
    .await;
    let mut bridge = harness.manual_bridge(Script::default());
    let (mut conn, _) = raw_connect(&harness.info).await;

    for id in 1..=100u64 {
        conn.send(command(id, b"x")).await.unwrap();
    }
    for _ in 0..90 {
        let r = next_response(&mut conn).await;
        assert_eq!(r.status, Status::QueueFull);
        assert!(r.status.is_retryable());
    }
    let queue = harness.server.queue();
    assert_eq!(queue.len(), 10);

    for n in 1..=10u64 {
        let tick = bridge.tick().unwrap();
        assert_eq!(tick.applied.map(|(_, id)| id), Some(n));
    }
    assert_eq!(bridge.tick().unwrap().applied, None);
    assert!(queue.is_empty());

    for n in 1..=10u64 {
        let r = next_response(&mut conn).await;
        assert_eq!((r.command_id, r.status), (n, Status::Ok));
    }
}

// ── Admission outcomes ───────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replay_conflict_and_silent_duplicate() {
    let harness = Harness::start(ServerOptions::default()).await;
    let mut bridge = harness.manual_bridge(Script::default());
    let (mut conn, _) = raw_connect(&harness.info).await;

    conn.send(command(1, b"a")).await.unwrap();
    conn.send(command(1, b"b")).await.unwrap();
    let r = next_response(&mut conn).await;
    assert_eq!((r.command_id, r.status), (1, Status::ReplayConflict));

    // Identical resend: absorbed without a Response of its own.
    conn.send(command(1, b"a")).await.unwrap();
    conn.send(Message::Ping { nonce: 9 }).await.unwrap();
    assert_eq!(next_non_ping(&mut conn).await, Some(Message::Pong { nonce: 9 }));
    assert_eq!(harness.server.queue().len(), 1);
    let sessions = harness.sessions();

    bridge.tick().unwrap();
    let r = next_response(&mut conn).await;
    assert_eq!((r.command_id, r.status), (1, Status::Ok));
    assert_eq!(bridge.host().applied, vec![b"a".to_vec()]);

    conn.send(command(1, b"a")).await.unwrap();
    let r = next_response(&mut conn).await;
    assert_eq!(r.status, Status::Stale);
    assert_eq!(sessions.session_count(), 1);
}

// ── Reconnection ─────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_within_grace_rejects_applied_id() {
    let harness = Harness::start(ServerOptions::default()).await;
    let (signal, gui) = harness.spawn_gui(Script::default);
    let sessions = harness.sessions();

    let (mut conn, welcome) = raw_connect(&harness.info).await;
    let session = welcome.session_id;
    for id in 1..=5u64 {
        conn.send(command(id, &[id as u8])).await.unwrap();
        let r = next_response(&mut conn).await;
        assert_eq!((r.command_id, r.status), (id, Status::Ok));
    }

    drop(conn);
    wait_until(|| !sessions.is_attached(session)).await;
    assert_eq!(sessions.session_count(), 1, "session kept during grace");

    let (mut conn, welcome) = raw_resume(&harness.info, Some(session)).await;
    assert_eq!(welcome.session_id, session);
    assert!(welcome.resumed);
    assert_eq!(welcome.last_applied, 5);

    conn.send(command(5, &[5])).await.unwrap();
    let stale = next_response(&mut conn).await;
    assert_eq!((stale.command_id, stale.status), (5, Status::Stale));

    conn.send(command(6, &[6])).await.unwrap();
    let fresh = next_response(&mut conn).await;
    assert_eq!((fresh.command_id, fresh.status), (6, Status::Ok));

    signal.trigger();
    gui.join().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_reconnect_takes_over_its_session() {
    let harness = Harness::start(ServerOptions::default()).await;
    let (signal, gui) = harness.spawn_gui(Script::default);

    let mut client = ControlClient::connect(harness.info.clone(), ClientOptions::new("replay"))
        .await
        .unwrap();
    for n in 1..=5u8 {
        assert!(client.inject(vec![n]).await.unwrap().status.is_ok());
    }
    let session = client.session_id();

    let welcome = client.reconnect().await.unwrap();
    assert_eq!(welcome.session_id, session);
    assert!(welcome.resumed);
    assert_eq!(welcome.last_applied, 5);

    let stale = client
        .send_with_id(5, CommandKind::InjectEvent, vec![5])
        .await
        .unwrap();
    assert_eq!(stale.status, Status::Stale);

    let fresh = client.inject(vec![6]).await.unwrap();
    assert_eq!(fresh.command_id, 6);
    assert_eq!(fresh.status, Status::Ok);

    client.goodbye().await.unwrap();
    wait_until(|| harness.sessions().session_count() == 0).await;

    signal.trigger();
    gui.join().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn displaced_connection_is_closed_and_cannot_admit() {
    let harness = Harness::start(ServerOptions::default()).await;
    let (mut first, welcome) = raw_connect(&harness.info).await;
    let session = welcome.session_id;

    let (mut second, welcome) = raw_resume(&harness.info, Some(session)).await;
    assert_eq!(welcome.session_id, session);

    match next_non_ping(&mut first).await {
        Some(Message::Shutdown { reason }) => assert!(reason.contains("taken over")),
        other => panic!("expected Shutdown, got {other:?}"),
    }
    // Anything the old connection still sends is not admitted.
    let _ = first.send(command(1, b"stale writer")).await;
    assert_eq!(next_non_ping(&mut first).await, None);
    wait_until(|| harness.server.connection_count() == 1).await;
    assert!(harness.server.queue().is_empty());

    let mut bridge = harness.manual_bridge(Script::default());
    second.send(command(1, b"owner")).await.unwrap();
    wait_until(|| harness.server.queue().len() == 1).await;
    bridge.tick().unwrap();
    let r = next_response(&mut second).await;
    assert_eq!((r.command_id, r.status), (1, Status::Ok));
    assert_eq!(bridge.host().applied, vec![b"owner".to_vec()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn responses_held_by_full_write_buffer_flow_without_client_traffic() {
    let harness = Harness::start(ServerOptions {
        transport: TransportOptions {
            write_buffer_frames: 1,
            keepalive_interval: Duration::from_secs(60),
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let mut bridge = harness.manual_bridge(Script::default());
    let (mut conn, _) = raw_connect(&harness.info).await;

    for id in 1..=20u64 {
        conn.send(command(id, b"x")).await.unwrap();
    }
    wait_until(|| harness.server.queue().len() == 20).await;
    for _ in 0..20 {
        bridge.tick().unwrap();
    }

    // The client sends nothing more; only the writer draining can push these out.
    for id in 1..=20u64 {
        let r = next_response(&mut conn).await;
        assert_eq!((r.command_id, r.status), (id, Status::Ok));
    }
}

// ── Handshake ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_token_is_rejected() {
    let harness = Harness::start(ServerOptions {
        shared_token: Some("s3cret".into()),
        ..Default::default()
    })
    .await;

    let err = ControlClient::connect(
        harness.info.clone(),
        ClientOptions::new("intruder").with_token("guess"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, LoopError::AuthRejected(_)));

    let ok = ControlClient::connect(
        harness.info.clone(),
        ClientOptions::new("friend").with_token("s3cret"),
    )
    .await;
    assert!(ok.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn command_before_hello_closes_connection() {
    let harness = Harness::start(ServerOptions::default()).await;
    let mut conn = Connection::connect(&harness.info).await.unwrap();
    conn.send(command(1, b"early")).await.unwrap();
    assert_eq!(next_non_ping(&mut conn).await, None);
    assert_eq!(harness.sessions().session_count(), 0);
}

// ── Named API and shutdown ───────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn named_api_calls_and_offload() {
    let harness = Harness::start(ServerOptions::default()).await;
    let (signal, gui) = harness.spawn_gui(|| {
        let mut api = ApiRegistry::new(String::new());
        api.register("set_title", |title, args| {
            *title = args.as_str().unwrap_or_default().to_string();
            Ok(Value::Null)
        })
        .register("get_title", |title, _| Ok(json!(title)))
        .register_offload("length", |_, args| {
            let text = args.as_str().unwrap_or_default().to_string();
            Ok(Box::new(move || {
                Ok(serde_json::to_vec(&json!(text.len())).map_err(|e| e.to_string())?)
            }))
        });
        api
    });

    let client = ControlClient::connect(harness.info.clone(), ClientOptions::new("api"))
        .await
        .unwrap();
    client.invoke("set_title", json!("hello")).await.unwrap();
    assert_eq!(client.invoke("get_title", Value::Null).await.unwrap(), json!("hello"));
    assert_eq!(client.invoke("length", json!("four")).await.unwrap(), json!(4));

    let missing = client
        .inject(ApiCall::new("nope", Value::Null).to_bytes().unwrap())
        .await
        .unwrap();
    assert_eq!(missing.status, Status::Failed);
    assert!(missing.reason().contains("no handler registered"));

    signal.trigger();
    gui.join().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_command_notifies_clients_and_stops_loop() {
    let harness = Harness::start(ServerOptions::default()).await;
    let (_signal, gui) = harness.spawn_gui(Script::default);

    let watcher = ControlClient::connect(harness.info.clone(), ClientOptions::new("watcher"))
        .await
        .unwrap();
    let admin = ControlClient::connect(harness.info.clone(), ClientOptions::new("admin"))
        .await
        .unwrap();

    let r = admin.shutdown_host().await.unwrap();
    assert!(r.status.is_ok());
    wait_until(|| watcher.server_shutdown().is_some()).await;

    let refused = admin.ping().await.unwrap();
    assert_eq!(refused.status, Status::Draining);

    tokio::task::spawn_blocking(move || gui.join().unwrap())
        .await
        .unwrap();
}
