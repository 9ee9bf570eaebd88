//! End-to-end scenarios: real relay, real sockets, real channels.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use battery_db::signaling::relay;
use battery_db::{BatteryDb, Config, SqlValue, SyncEvent};

struct Relay {
    url: String,
    addr: SocketAddr,
    server: JoinHandle<()>,
}

async fn spawn_relay() -> Relay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, relay::router()).await;
    });
    Relay {
        url: format!("ws://{addr}"),
        addr,
        server,
    }
}

/// TCP proxy whose live connections can be cut on demand, for simulating
/// signaling flaps without touching the peer channels.
struct FlakyProxy {
    url: String,
    pipes: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accept: JoinHandle<()>,
}

async fn spawn_proxy(target: SocketAddr) -> FlakyProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let pipes: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
    let tracked = pipes.clone();
    let accept = tokio::spawn(async move {
        loop {
            let Ok((mut client, _)) = listener.accept().await else {
                break;
            };
            let Ok(mut upstream) = TcpStream::connect(target).await else {
                continue;
            };
            let pipe = tokio::spawn(async move {
                let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            });
            tracked.lock().unwrap().push(pipe);
        }
    });
    FlakyProxy {
        url: format!("ws://{addr}"),
        pipes,
        accept,
    }
}

impl FlakyProxy {
    /// Cuts every live connection; new ones still get through.
    fn cut(&self) {
        for pipe in self.pipes.lock().unwrap().drain(..) {
            pipe.abort();
        }
    }
}

async fn node() -> BatteryDb {
    let db = BatteryDb::new(Config::default()).unwrap();
    db.init().await.unwrap();
    db.exec_local(
        "CREATE TABLE notes (id TEXT PRIMARY KEY, content TEXT)",
        &[],
    )
    .await
    .unwrap();
    db
}

fn text(s: &str) -> SqlValue {
    SqlValue::Text(s.to_string())
}

async fn note_count(db: &BatteryDb) -> i64 {
    let rows = db
        .exec_local("SELECT count(*) FROM notes", &[])
        .await
        .unwrap()
        .rows;
    match rows[0][0] {
        SqlValue::Integer(n) => n,
        ref other => panic!("unexpected count value {other:?}"),
    }
}

async fn all_rows(db: &BatteryDb) -> Vec<Vec<SqlValue>> {
    db.exec_local("SELECT id, content FROM notes ORDER BY id", &[])
        .await
        .unwrap()
        .rows
}

/// Polls until `check` holds or a generous deadline passes.
macro_rules! wait_for {
    ($check:expr, $what:literal) => {{
        let mut ok = false;
        for _ in 0..400 {
            if $check {
                ok = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(ok, "timed out waiting for {}", $what);
    }};
}

async fn wait_for_peer(db: &BatteryDb) {
    wait_for!(!db.peers().await.is_empty(), "peer channel");
}

// S1: two peers, insert on one, delete on the other, both end empty with
// both ops logged.
#[tokio::test]
async fn two_peer_insert_delete_convergence() {
    let relay = spawn_relay().await;
    let a = node().await;
    let b = node().await;

    a.connect(&relay.url, "r").await.unwrap();
    b.connect(&relay.url, "r").await.unwrap();
    wait_for_peer(&a).await;
    wait_for_peer(&b).await;

    a.exec(
        "INSERT INTO notes (id, content) VALUES (?, ?)",
        &[text("n1"), text("hello")],
    )
    .await
    .unwrap();
    wait_for!(note_count(&b).await == 1, "insert to reach b");

    b.exec("DELETE FROM notes WHERE id = ?", &[text("n1")])
        .await
        .unwrap();
    wait_for!(note_count(&a).await == 0, "delete to reach a");

    assert_eq!(note_count(&a).await, 0);
    assert_eq!(note_count(&b).await, 0);
    wait_for!(
        a.op_count().await == 2 && b.op_count().await == 2,
        "both logs to hold both ops"
    );

    a.close().await.unwrap();
    b.close().await.unwrap();
    relay.server.abort();
}

// S3: offline edits catch up through one sync response.
#[tokio::test]
async fn offline_edits_arrive_in_one_sync_response() {
    let relay = spawn_relay().await;
    let a = node().await;
    let b = node().await;

    // a edits while offline
    for i in 0..5 {
        a.exec(
            "INSERT INTO notes (id, content) VALUES (?, ?)",
            &[text(&format!("n{i}")), text("offline")],
        )
        .await
        .unwrap();
    }

    let mut b_events = b.subscribe();
    a.connect(&relay.url, "offline-room").await.unwrap();
    b.connect(&relay.url, "offline-room").await.unwrap();
    wait_for_peer(&b).await;
    wait_for!(note_count(&b).await == 5, "all offline edits to reach b");

    // the five ops landed as one sync response
    let mut saw_batch = false;
    while let Ok(event) = b_events.try_recv() {
        if let SyncEvent::Sync { count: 5, .. } = event {
            saw_batch = true;
        }
    }
    assert!(saw_batch, "expected one sync event covering all five ops");
    assert_eq!(b.version().await, a.version().await);

    a.close().await.unwrap();
    b.close().await.unwrap();
    relay.server.abort();
}

// S4: a late joiner pulls the full log and converges.
#[tokio::test]
async fn late_joiner_converges() {
    let relay = spawn_relay().await;
    let a = node().await;
    let b = node().await;

    a.connect(&relay.url, "late").await.unwrap();
    b.connect(&relay.url, "late").await.unwrap();
    wait_for_peer(&a).await;
    wait_for_peer(&b).await;

    for i in 0..3 {
        a.exec(
            "INSERT INTO notes (id, content) VALUES (?, ?)",
            &[text(&format!("a{i}")), text("from a")],
        )
        .await
        .unwrap();
    }
    for i in 0..2 {
        b.exec(
            "INSERT INTO notes (id, content) VALUES (?, ?)",
            &[text(&format!("b{i}")), text("from b")],
        )
        .await
        .unwrap();
    }
    wait_for!(
        note_count(&a).await == 5 && note_count(&b).await == 5,
        "a and b to converge"
    );

    let c = node().await;
    c.connect(&relay.url, "late").await.unwrap();
    wait_for!(c.peers().await.len() == 2, "c to reach both peers");
    wait_for!(note_count(&c).await == 5, "c to converge on the union");

    // convergence of content, not just counts
    assert_eq!(all_rows(&a).await, all_rows(&c).await);
    assert_eq!(all_rows(&b).await, all_rows(&c).await);
    assert_eq!(c.op_count().await, 5);

    a.close().await.unwrap();
    b.close().await.unwrap();
    c.close().await.unwrap();
    relay.server.abort();
}

// Live ops keep flowing both ways after the initial delta sync.
#[tokio::test]
async fn live_broadcast_both_directions() {
    let relay = spawn_relay().await;
    let a = node().await;
    let b = node().await;

    a.connect(&relay.url, "live").await.unwrap();
    b.connect(&relay.url, "live").await.unwrap();
    wait_for_peer(&a).await;
    wait_for_peer(&b).await;

    a.exec(
        "INSERT INTO notes (id, content) VALUES (?, ?)",
        &[text("n1"), text("v0")],
    )
    .await
    .unwrap();
    wait_for!(note_count(&b).await == 1, "insert to reach b");

    b.exec(
        "UPDATE notes SET content = ? WHERE id = ?",
        &[text("v1"), text("n1")],
    )
    .await
    .unwrap();
    wait_for!(
        all_rows(&a).await == vec![vec![text("n1"), text("v1")]],
        "update to reach a"
    );

    a.close().await.unwrap();
    b.close().await.unwrap();
    relay.server.abort();
}

// S6: an upgrade without a token is closed with 4001 before any frame.
#[tokio::test]
async fn missing_token_closes_with_4001() {
    let relay = spawn_relay().await;
    let (mut ws, _) = connect_async(relay.url.as_str()).await.unwrap();

    match ws.next().await {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), 4001);
            assert_eq!(frame.reason.as_ref(), "Token required");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
    relay.server.abort();
}

// S5: a signaling flap reconnects with backoff while the open peer
// channel keeps working without a re-handshake.
#[tokio::test]
async fn signaling_flap_reconnects_without_rehandshake() {
    let relay = spawn_relay().await;
    let proxy = spawn_proxy(relay.addr).await;

    let a = node().await;
    let b = node().await;
    let mut a_events = a.subscribe();
    a.connect(&proxy.url, "flap").await.unwrap();
    b.connect(&proxy.url, "flap").await.unwrap();
    wait_for_peer(&a).await;
    wait_for_peer(&b).await;

    // cut the signaling sockets; the direct peer channel stays up
    proxy.cut();

    let mut saw_reconnecting = false;
    let mut saw_reconnected = false;
    for _ in 0..400 {
        while let Ok(event) = a_events.try_recv() {
            match event {
                SyncEvent::Reconnecting { attempt } => {
                    assert!(attempt >= 1);
                    saw_reconnecting = true;
                }
                SyncEvent::Reconnected => saw_reconnected = true,
                _ => {}
            }
        }
        if saw_reconnecting && saw_reconnected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(saw_reconnecting, "expected a reconnecting event");
    assert!(saw_reconnected, "expected a reconnected event");

    // no re-handshake happened and the channel still carries ops
    assert_eq!(a.peers().await.len(), 1);
    assert_eq!(b.peers().await.len(), 1);
    a.exec(
        "INSERT INTO notes (id, content) VALUES (?, ?)",
        &[text("after-flap"), text("still here")],
    )
    .await
    .unwrap();
    wait_for!(note_count(&b).await == 1, "op to cross the surviving channel");

    a.close().await.unwrap();
    b.close().await.unwrap();
    proxy.accept.abort();
    relay.server.abort();
}
