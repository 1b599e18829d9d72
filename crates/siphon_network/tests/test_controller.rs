use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use siphon_core::ControllerConfig;
use siphon_network::store::{CommandStore, TopicSubscriber, keys};
use siphon_network::{ConnectionState, Controller, MemoryStore, NodeId, NodeRegistry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    controller: Arc<Controller>,
    addr: SocketAddr,
    store: MemoryStore,
    task: JoinHandle<Result<(), siphon_network::NetworkError>>,
}

async fn start() -> Harness {
    let store = MemoryStore::new();
    let config = ControllerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..ControllerConfig::default()
    };
    let controller = Arc::new(Controller::new(config, Arc::new(store.clone())));
    let listener = controller.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let c = Arc::clone(&controller);
    let task = tokio::spawn(async move { c.serve(listener).await });
    Harness {
        controller,
        addr,
        store,
        task,
    }
}

/// Poll `check` until it holds or the wait expires.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A fake datapath node.
struct Node {
    id: u32,
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Node {
    /// Connect, handshake, and wait until the private topic is subscribed.
    async fn join(h: &Harness, hostname: &str) -> Node {
        let mut stream = TcpStream::connect(h.addr).await.unwrap();
        stream.write_u32_le(hostname.len() as u32).await.unwrap();
        stream.write_all(hostname.as_bytes()).await.unwrap();
        let id = tokio::time::timeout(WAIT, stream.read_u32_le())
            .await
            .unwrap()
            .unwrap();

        let store = h.store.clone();
        let topic = id.to_string();
        eventually(|| {
            let store = store.clone();
            let topic = topic.clone();
            async move { store.subscriber_count(&topic) == 1 }
        })
        .await;

        Node {
            id,
            stream,
            buf: Vec::new(),
        }
    }

    async fn send(&mut self, frame: &str) {
        self.stream.write_all(frame.as_bytes()).await.unwrap();
        self.stream.write_all(&[0]).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == 0) {
                let frame: Vec<u8> = self.buf.drain(..=pos).collect();
                return serde_json::from_slice(&frame[..pos]).unwrap();
            }
            let mut chunk = [0u8; 1024];
            let n = tokio::time::timeout(WAIT, self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
            assert!(n > 0, "controller closed the connection");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read frames until one matches `pred`.
    async fn recv_matching(&mut self, pred: impl Fn(&Value) -> bool) -> Value {
        loop {
            let frame = self.recv().await;
            if pred(&frame) {
                return frame;
            }
        }
    }
}

fn routing_info(session: &str, next_hop: u32) -> Value {
    json!({"Type": 5, "Msg": {"SessionID": session, "Entry": [next_hop], "Timeout": 0}})
}

#[tokio::test]
async fn test_handshake_assigns_sequential_ids() {
    let h = start().await;
    let a = Node::join(&h, "abc").await;
    let b = Node::join(&h, "def").await;
    let c = Node::join(&h, "ghi").await;
    assert_eq!((a.id, b.id, c.id), (1, 2, 3));

    let registry = NodeRegistry::new(Arc::new(h.store.command_handle()));
    assert_eq!(registry.hostname_of(NodeId(2)).await.unwrap().as_deref(), Some("def"));
    assert_eq!(registry.id_of("ghi").await.unwrap(), Some(NodeId(3)));
    assert_eq!(
        registry.online_nodes().await.unwrap(),
        vec![NodeId(1), NodeId(2), NodeId(3)]
    );
}

#[tokio::test]
async fn test_new_node_learns_peers_and_peers_learn_new_node() {
    let h = start().await;
    let mut a = Node::join(&h, "a").await;
    let mut b = Node::join(&h, "b").await;

    assert_eq!(
        b.recv().await,
        json!({"Type": 1, "Msg": {"NewNode": [{"NodeID": 1, "Hostname": "a"}]}})
    );
    assert_eq!(b.recv().await, routing_info("1", 1));

    assert_eq!(
        a.recv().await,
        json!({"Type": 1, "Msg": {"NewNode": [{"NodeID": 2, "Hostname": "b"}]}})
    );
    assert_eq!(a.recv().await, routing_info("2", 2));
}

#[tokio::test]
async fn test_static_path_installed_when_path_max_connects() {
    let h = start().await;
    h.store
        .command_handle()
        .set(
            keys::CONFIGURATION,
            r#"{"PseudoSessions":[{"SessionID":"2-1-3","Path":[2,1,3]}]}"#,
        )
        .await
        .unwrap();

    let mut n1 = Node::join(&h, "n1").await;
    let mut n2 = Node::join(&h, "n2").await;
    let mut n3 = Node::join(&h, "n3").await;

    let is_rule = |v: &Value| v["Type"] == 5 && v["Msg"]["SessionID"] == "2-1-3";
    assert_eq!(n1.recv_matching(is_rule).await, routing_info("2-1-3", 3));
    assert_eq!(n2.recv_matching(is_rule).await, routing_info("2-1-3", 1));
    assert_eq!(n3.recv_matching(is_rule).await, routing_info("2-1-3", 3));
}

#[tokio::test]
async fn test_first_node_gets_only_its_static_self_loop() {
    let h = start().await;
    h.store
        .command_handle()
        .set(keys::CONFIGURATION, r#"{"PseudoSessions":[{"SessionID":"solo","Path":[1]}]}"#)
        .await
        .unwrap();

    let mut node = Node::join(&h, "alone").await;
    assert_eq!(node.id, 1);
    assert_eq!(node.recv().await, routing_info("solo", 1));

    // Nothing else follows: no peers means no NodeOnline.
    assert!(node.buf.is_empty());
    let mut byte = [0u8; 1];
    let more = tokio::time::timeout(Duration::from_millis(200), node.stream.read(&mut byte)).await;
    assert!(more.is_err(), "unexpected frame after the self-loop");
}

#[tokio::test]
async fn test_unknown_and_garbage_frames_keep_connection_open() {
    let h = start().await;
    let mut node = Node::join(&h, "fw-next").await;

    node.send(r#"{"Type": 999, "Msg": {}}"#).await;
    node.send("{not json").await;
    node.send(r#"{"Msg": {}}"#).await;
    node.send(r#"{"Type":6,"Msg":[{"To":2,"OneWay":4.5}]}"#).await;

    let db = h.store.command_handle();
    let handle = &db;
    eventually(|| async move { handle.hget("1", "2").await.unwrap().is_some() }).await;
    assert_eq!(db.hget("1", "2").await.unwrap().as_deref(), Some("4.5"));
    assert_eq!(db.hgetall("1").await.unwrap().len(), 1);
    assert_eq!(h.controller.live_connections().await.len(), 1);
}

#[tokio::test]
async fn test_rtt_reports_keep_latest_value() {
    let h = start().await;
    let mut node = Node::join(&h, "m").await;

    node.send(r#"{"Type":6,"Msg":[{"To":7,"OneWay":10}]}"#).await;
    node.send(r#"{"Type":6,"Msg":[{"To":7,"OneWay":2.25}]}"#).await;
    node.send(r#"{"Type":7,"Msg":{"From":7,"Bandwidth":"300"}}"#).await;

    let db = h.store.command_handle();
    let handle = &db;
    eventually(|| async move { handle.hget("BandwidthTo1", "7").await.unwrap().is_some() }).await;
    assert_eq!(db.hget("1", "7").await.unwrap().as_deref(), Some("2.25"));
    assert_eq!(db.hget("BandwidthTo1", "7").await.unwrap().as_deref(), Some("300"));
}

#[tokio::test]
async fn test_session_subscription_announced_to_all_nodes() {
    let h = start().await;
    let mut a = Node::join(&h, "a").await;
    let mut b = Node::join(&h, "b").await;

    b.send(r#"{"Type":8,"Msg":"svc.regionA.7"}"#).await;

    let is_session = |v: &Value| v["Msg"]["SessionID"] == "svc.regionA.7";
    assert_eq!(a.recv_matching(is_session).await, routing_info("svc.regionA.7", 2));
    assert_eq!(b.recv_matching(is_session).await, routing_info("svc.regionA.7", 2));

    let db = h.store.command_handle();
    assert_eq!(
        db.hget(keys::SESSION_TO_DESTINATION, "svc.regionA.7").await.unwrap().as_deref(),
        Some("2")
    );
    assert_eq!(db.hget(keys::REGION_TO_NODE_ID, "regionA").await.unwrap().as_deref(), Some("2"));
    assert_eq!(db.hget(keys::NODE_ID_TO_REGION, "2").await.unwrap().as_deref(), Some("regionA"));
}

#[tokio::test]
async fn test_new_session_forwarded_to_allocator_topic() {
    let h = start().await;
    let mut sub = h.store.subscriber_handle();
    sub.subscribe(keys::QUERY_SESSION_ID_TOPIC).await.unwrap();

    let mut node = Node::join(&h, "src").await;
    node.send(r#"{"Type":3,"Msg":{"src":1,"dsts":[2]}}"#).await;

    let message = tokio::time::timeout(WAIT, sub.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.payload, r#"{"dsts":[2],"src":1}"#);
}

#[tokio::test]
async fn test_store_outage_fails_handshake() {
    let h = start().await;
    h.store.set_available(false);

    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    // The controller may already have hung up; only the reply matters.
    let _ = stream.write_u32_le(3).await;
    let _ = stream.write_all(b"abc").await;
    let reply = tokio::time::timeout(WAIT, stream.read_u32_le()).await.unwrap();
    assert!(reply.is_err(), "no id may be issued while the store is down");

    h.store.set_available(true);
    let node = Node::join(&h, "abc").await;
    assert_eq!(node.id, 1);
}

#[tokio::test]
async fn test_closed_connection_leaves_live_index() {
    let h = start().await;
    let node = Node::join(&h, "short-lived").await;

    let controller = Arc::clone(&h.controller);
    eventually(|| {
        let controller = Arc::clone(&controller);
        async move {
            controller
                .live_connections()
                .await
                .iter()
                .any(|(id, c)| *id == NodeId(1) && c.state == ConnectionState::Online)
        }
    })
    .await;

    drop(node);
    eventually(|| {
        let controller = Arc::clone(&controller);
        async move { controller.live_connections().await.is_empty() }
    })
    .await;

    let registry = NodeRegistry::new(Arc::new(h.store.command_handle()));
    eventually(|| {
        let registry = registry.clone();
        async move { registry.online_nodes().await.unwrap().is_empty() }
    })
    .await;
    // Default retention keeps the hostname mappings.
    assert_eq!(
        registry.hostname_of(NodeId(1)).await.unwrap().as_deref(),
        Some("short-lived")
    );
    assert_eq!(h.store.subscriber_count("1"), 0);
}

#[tokio::test]
async fn test_shutdown_closes_every_connection() {
    let h = start().await;
    let mut a = Node::join(&h, "a").await;

    h.controller.shutdown();
    h.task.await.unwrap().unwrap();

    let mut rest = Vec::new();
    let read = tokio::time::timeout(WAIT, a.stream.read_to_end(&mut rest)).await;
    assert!(read.is_ok(), "connection should be closed after shutdown");
}
