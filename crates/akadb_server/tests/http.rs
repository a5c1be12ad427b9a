//! End-to-end tests over a real TCP socket.

use akadb_core::{Cluster, Config};
use akadb_replication::{ReplicationConfig, ReplicationCoordinator, RetryConfig};
use akadb_server::{AkaServer, ServerConfig};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct TestServer {
    addr: SocketAddr,
    cluster: Arc<Cluster>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start(cluster: Arc<Cluster>, replication: bool) -> Self {
        Self::start_with(cluster, replication, ServerConfig::default()).await
    }

    async fn start_with(cluster: Arc<Cluster>, replication: bool, config: ServerConfig) -> Self {
        let coordinator = replication.then(|| {
            let config = ReplicationConfig::new()
                .with_retry(
                    RetryConfig::new(2)
                        .with_initial_delay(Duration::from_millis(5))
                        .with_jitter(false),
                )
                .without_sweep();
            ReplicationCoordinator::start(&cluster, config).unwrap()
        });
        let server = AkaServer::new(config, Arc::clone(&cluster), coordinator);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(async move {
            server
                .serve(listener, async {
                    stopped.await.ok();
                })
                .await
                .unwrap();
        });
        Self {
            addr,
            cluster,
            stop: Some(stop),
            task,
        }
    }

    async fn get(&self, target: &str) -> (u16, Value) {
        self.call("GET", target, None).await
    }

    async fn post(&self, target: &str, body: Value) -> (u16, Value) {
        self.call("POST", target, Some(body)).await
    }

    async fn call(&self, method: &str, target: &str, body: Option<Value>) -> (u16, Value) {
        let body = body.map(|b| b.to_string()).unwrap_or_default();
        let raw = format!(
            "{method} {target} HTTP/1.1\r\nHost: test\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        parse_response(&response)
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            stop.send(()).ok();
        }
        self.task.await.unwrap();
    }
}

/// Reads exactly one response from a kept-alive connection.
async fn read_one(stream: &mut TcpStream) -> (u16, Value) {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed mid-response");
        raw.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&raw);
        if let Some((head, body)) = text.split_once("\r\n\r\n") {
            let length: usize = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse().ok())?
                })
                .unwrap_or(0);
            if body.len() >= length {
                return parse_response(&raw);
            }
        }
    }
}

fn parse_response(raw: &[u8]) -> (u16, Value) {
    let text = String::from_utf8_lossy(raw);
    let (head, body) = text.split_once("\r\n\r\n").unwrap();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap();
    let body = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(body).unwrap()
    };
    (status, body)
}

fn cluster(nodes: u8) -> Arc<Cluster> {
    Arc::new(Cluster::in_memory(nodes).unwrap())
}

fn alpha() -> Value {
    json!({
        "titleId": "tt1", "ordering": 1, "title": "Alpha", "region": "US",
        "language": "en", "types": "movie", "attributes": "N/A",
        "isOriginalTitle": 1, "node": 1
    })
}

async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let wait = async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait).await.is_ok()
}

#[tokio::test]
async fn insert_read_delete_scenario() {
    let server = TestServer::start(cluster(3), true).await;

    let (status, body) = server.post("/insert", alpha()).await;
    assert_eq!(status, 200, "{body}");
    assert!(!body["logs"].as_array().unwrap().is_empty());

    let (status, body) = server.get("/movies?node=1&titleId=tt1").await;
    assert_eq!(status, 200);
    assert_eq!(body["total"], 1);
    assert_eq!(body["data"][0]["title"], "Alpha");
    assert_eq!(body["data"][0]["ordering"], 1);
    assert_eq!(body["data"][0]["isOriginalTitle"], 1);

    let replicated = eventually(|| {
        server
            .cluster
            .node(akadb_core::NodeId::new(3).unwrap())
            .unwrap()
            .store()
            .row_count()
            == 1
    })
    .await;
    assert!(replicated);

    let (status, _) = server
        .post("/delete", json!({"titleId": "tt1", "node": 1}))
        .await;
    assert_eq!(status, 200);
    let (_, body) = server.get("/movies?node=1&titleId=tt1").await;
    assert_eq!(body["total"], 0);

    server.shutdown().await;
}

#[tokio::test]
async fn duplicate_insert_is_conflict() {
    let server = TestServer::start(cluster(1), false).await;
    server.post("/insert", alpha()).await;

    let mut again = alpha();
    again["title"] = json!("Other");
    let (status, body) = server.post("/insert", again).await;
    assert_eq!(status, 409);
    assert_eq!(body["kind"], "DuplicateKey");
    assert!(body["logs"][0].as_str().unwrap().starts_with("DuplicateKey"));

    let (_, body) = server.get("/movies").await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["data"][0]["title"], "Alpha");

    server.shutdown().await;
}

#[tokio::test]
async fn manual_mode_hides_update_until_commit() {
    let server = TestServer::start(cluster(1), false).await;
    server.post("/insert", alpha()).await;

    let (status, body) = server
        .post(
            "/settings",
            json!({"isolationLevel": "READ COMMITTED", "autoCommit": "false"}),
        )
        .await;
    assert_eq!(status, 200, "{body}");

    let (status, _) = server
        .post(
            "/update",
            json!({"titleId": "tt1", "ordering": 1, "title": "Beta"}),
        )
        .await;
    assert_eq!(status, 200);

    let (_, body) = server.get("/movies?titleId=tt1").await;
    assert_eq!(body["data"][0]["title"], "Alpha");

    let (_, body) = server.get("/transactions").await;
    let txn = body["transactions"][0]["txnId"].as_u64().unwrap();

    let (_, body) = server.get(&format!("/movies?titleId=tt1&txnId=txn:{txn}")).await;
    assert_eq!(body["data"][0]["title"], "Beta");

    let (status, _) = server.post("/commit", json!({ "txnId": txn })).await;
    assert_eq!(status, 200);
    let (_, body) = server.get("/movies?titleId=tt1").await;
    assert_eq!(body["data"][0]["title"], "Beta");

    let (_, body) = server.get("/status").await;
    assert_eq!(body["current_settings"]["auto_commit"], false);
    assert_eq!(body["pendingTransactions"], 0);

    server.shutdown().await;
}

#[tokio::test]
async fn status_lists_every_node() {
    let server = TestServer::start(cluster(3), true).await;
    server.post("/insert", alpha()).await;

    let (status, body) = server.get("/status").await;
    assert_eq!(status, 200);
    for key in ["node1", "node2", "node3"] {
        assert_eq!(body[key]["status"], "ONLINE");
        assert!(body[key]["replication"]["state"].is_string());
    }
    assert_eq!(body["node1"]["role"], "central");
    assert_eq!(body["node1"]["rows"], 1);
    assert_eq!(body["local_node_id"], 1);
    assert_eq!(body["current_settings"]["isolation_level"], "READ COMMITTED");

    server.shutdown().await;
}

#[tokio::test]
async fn offline_node_rejects_then_catches_up() {
    let server = TestServer::start(cluster(2), true).await;

    let (status, _) = server
        .post("/node-state", json!({"node": 2, "online": false}))
        .await;
    assert_eq!(status, 200);

    let mut on_two = alpha();
    on_two["node"] = json!(2);
    let (status, body) = server.post("/insert", on_two).await;
    assert_eq!(status, 503);
    assert_eq!(body["kind"], "NodeUnavailable");

    let (status, _) = server.post("/insert", alpha()).await;
    assert_eq!(status, 200);

    let (_, body) = server.get("/status").await;
    assert_eq!(body["node2"]["status"], "OFFLINE");

    let (status, body) = server
        .post("/node-state", json!({"node": "node2", "online": true}))
        .await;
    assert_eq!(status, 200, "{body}");

    let caught_up = eventually(|| {
        server
            .cluster
            .node(akadb_core::NodeId::new(2).unwrap())
            .unwrap()
            .store()
            .row_count()
            == 1
    })
    .await;
    assert!(caught_up);

    server.shutdown().await;
}

#[tokio::test]
async fn report_and_errors() {
    let server = TestServer::start(cluster(1), false).await;
    server.post("/insert", alpha()).await;

    let (status, body) = server.get("/report/distribution").await;
    assert_eq!(status, 200);
    assert_eq!(body["report"], "Region | Count\nUS | 1\nTOTAL | 1");

    let (status, body) = server.get("/report/nope").await;
    assert_eq!(status, 400);
    assert!(body["error"].is_string());

    let (status, _) = server.get("/nowhere").await;
    assert_eq!(status, 404);

    let (status, body) = server
        .post("/update", json!({"titleId": "tt404", "ordering": 1, "title": "X"}))
        .await;
    assert_eq!(status, 404);
    assert_eq!(body["kind"], "NotFound");

    let (status, _) = server.post("/recover", json!({"node": 1})).await;
    assert_eq!(status, 503);

    server.shutdown().await;
}

#[tokio::test]
async fn keep_alive_serves_several_requests() {
    let server = TestServer::start(cluster(1), false).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    for _ in 0..2 {
        stream
            .write_all(b"GET /transactions HTTP/1.1\r\nHost: test\r\n\r\n")
            .await
            .unwrap();
        let (status, body) = read_one(&mut stream).await;
        assert_eq!(status, 200);
        assert_eq!(body["transactions"], json!([]));
    }

    server.shutdown().await;
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let config = ServerConfig::default().with_max_body_bytes(16);
    let server = TestServer::start_with(cluster(1), false, config).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"POST /insert HTTP/1.1\r\nHost: test\r\nContent-Length: 4096\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let (status, body) = parse_response(&response);
    assert_eq!(status, 413);
    assert_eq!(body["kind"], "PayloadTooLarge");

    server.shutdown().await;
}

#[tokio::test]
async fn chunked_bodies_are_accepted_and_limited() {
    let config = ServerConfig::default().with_max_body_bytes(512);
    let server = TestServer::start_with(cluster(1), false, config).await;

    let body = alpha().to_string();
    let raw = format!(
        "POST /insert HTTP/1.1\r\nHost: test\r\nTransfer-Encoding: chunked\r\n\r\n\
         {:x}\r\n{body}\r\n0\r\n\r\n",
        body.len()
    );
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let (status, reply) = read_one(&mut stream).await;
    assert_eq!(status, 200, "{reply}");
    assert_eq!(server.cluster.node(akadb_core::NodeId::CENTRAL).unwrap().store().row_count(), 1);

    let big = "x".repeat(600);
    let raw = format!(
        "POST /insert HTTP/1.1\r\nHost: test\r\nTransfer-Encoding: chunked\r\n\
         Connection: close\r\n\r\n{:x}\r\n{big}\r\n0\r\n\r\n",
        big.len()
    );
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let (status, reply) = read_one(&mut stream).await;
    assert_eq!(status, 413);
    assert_eq!(reply["kind"], "PayloadTooLarge");

    server.shutdown().await;
}

#[tokio::test]
async fn file_backed_cluster_serves_logs() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(Cluster::open(Config::new().node_count(2).data_dir(dir.path())).unwrap());
    let server = TestServer::start(cluster, false).await;
    server.post("/insert", alpha()).await;

    let (status, body) = server.get("/logs?node=1&limit=5").await;
    assert_eq!(status, 200);
    assert_eq!(body["node"], 1);
    assert_eq!(body["entries"].as_array().unwrap().len(), 1);

    server.shutdown().await;
}
