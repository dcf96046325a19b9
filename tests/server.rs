mod common;

use common::{cells, config, eventually, fast_limits, start, TestClient};
use futures::StreamExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use zerodb::{
    config::DEFAULT_SERVER_VERSION,
    error::codes,
    governor::Phase,
    protocol::{Command, PacketCodec, Response},
    server::Server,
};

#[tokio::test]
async fn create_insert_select_over_tcp() {
    let server = start(4).await;
    let mut client = TestClient::connect(server.local_addr()).await;
    assert_eq!(client.handshake.protocol_version, 10);
    assert_eq!(client.handshake.server_version, DEFAULT_SERVER_VERSION);

    assert_eq!(client.exec("CREATE TABLE t(x INTEGER)").await, 0);
    assert_eq!(client.exec("INSERT INTO t VALUES (1)").await, 1);
    let set = client.rows("SELECT x FROM t").await;
    assert_eq!(set.column_names(), vec!["x"]);
    assert_eq!(cells(&set), vec![vec![Some("1")]]);

    client.quit().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_command_keeps_the_connection_open() {
    let server = start(4).await;
    let mut client = TestClient::connect(server.local_addr()).await;

    match client.command(Command::Unknown(0x7F)).await {
        Response::Err(err) => {
            assert_eq!(err.code, codes::ER_UNKNOWN_COM);
            assert_eq!(err.sql_state, "08S01");
        }
        other => panic!("unexpected {:?}", other),
    }
    let set = client.rows("SELECT 1").await;
    assert_eq!(cells(&set), vec![vec![Some("1")]]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn connections_beyond_the_limit_are_closed_without_a_greeting() {
    let server = start(1).await;
    let first = TestClient::connect(server.local_addr()).await;
    assert_eq!(server.active_connections(), 1);

    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut rejected = Framed::new(stream, PacketCodec::new());
    let next = tokio::time::timeout(Duration::from_secs(2), rejected.next()).await.unwrap();
    assert!(matches!(next, None | Some(Err(_))), "got {:?}", next);

    first.quit().await;
    assert!(eventually(|| server.active_connections() == 0).await);
    let mut again = TestClient::connect(server.local_addr()).await;
    assert_eq!(cells(&again.rows("SELECT 2").await), vec![vec![Some("2")]]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn statement_errors_are_not_fatal() {
    let server = start(4).await;
    let mut client = TestClient::connect(server.local_addr()).await;

    assert_eq!(client.error("SELECT * FROM missing").await, codes::ER_NO_SUCH_TABLE);
    assert_eq!(client.error("THIS IS NOT SQL").await, codes::ER_PARSE_ERROR);
    client.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)").await;
    assert_eq!(client.error("CREATE TABLE t (id INT)").await, codes::ER_TABLE_EXISTS);
    assert_eq!(client.error("SELECT nope FROM t").await, codes::ER_BAD_FIELD);

    assert!(matches!(client.command(Command::Ping).await, Response::Ok(_)));
    assert!(matches!(client.command(Command::InitDb("zerodb".into())).await, Response::Ok(_)));
    assert_eq!(client.exec("INSERT INTO t (name) VALUES ('a'), ('b')").await, 2);
    match client.query("INSERT INTO t (name) VALUES ('c')").await {
        Response::Ok(ok) => assert_eq!(ok.last_insert_id, 3),
        other => panic!("unexpected {:?}", other),
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn client_startup_queries_are_answered() {
    let server = start(4).await;
    let mut client = TestClient::connect(server.local_addr()).await;

    let comment = client.rows("SELECT @@version_comment LIMIT 1").await;
    assert_eq!(comment.column_names(), vec!["@@version_comment"]);
    assert_eq!(comment.rows.len(), 1);

    let version = client.rows("SELECT @@version").await;
    assert_eq!(cells(&version), vec![vec![Some(DEFAULT_SERVER_VERSION)]]);

    assert_eq!(client.exec("SET NAMES utf8mb4").await, 0);
    assert_eq!(client.exec("SET autocommit=1").await, 0);
    let dbs = client.rows("SHOW DATABASES").await;
    assert_eq!(cells(&dbs), vec![vec![Some("zerodb")]]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn statements_from_many_clients_never_overlap() {
    let server = start(8).await;
    {
        let mut setup = TestClient::connect(server.local_addr()).await;
        setup.exec("CREATE TABLE hits (client INT, n INT)").await;
        setup.quit().await;
    }

    let addr = server.local_addr();
    let mut tasks = Vec::new();
    for c in 0..6 {
        tasks.push(tokio::spawn(async move {
            let mut client = TestClient::connect(addr).await;
            for n in 0..15 {
                let sql = format!("INSERT INTO hits VALUES ({}, {})", c, n);
                assert_eq!(client.exec(&sql).await, 1);
            }
            client.quit().await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut client = TestClient::connect(addr).await;
    let count = client.rows("SELECT COUNT(*) FROM hits").await;
    assert_eq!(cells(&count), vec![vec![Some("90")]]);

    let stats = server.engine().stats();
    assert_eq!(stats.peak_in_flight, 1);
    assert_eq!(stats.in_flight, 0);
    assert!(stats.executed >= 92);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn stop_closes_clients_then_engine_and_is_idempotent() {
    let server = start(4).await;
    let mut client = TestClient::connect(server.local_addr()).await;
    client.exec("CREATE TABLE t (x INT)").await;

    server.stop().await.unwrap();
    let next = tokio::time::timeout(Duration::from_secs(2), client.framed.next()).await.unwrap();
    assert!(matches!(next, None | Some(Err(_))));
    assert!(server.engine().is_closed().await);
    assert_eq!(server.governor().releases(), 0);

    server.stop().await.unwrap();
    assert!(TcpStream::connect(server.local_addr()).await.is_err());
}

#[tokio::test]
async fn idle_engine_is_released_and_reactivated() {
    let server = Server::start_with_limits(config(4), fast_limits(4, 80)).await.unwrap();
    assert_eq!(server.limits().idle_threshold, Duration::from_millis(80));
    let mut client = TestClient::connect(server.local_addr()).await;
    client.exec("CREATE TABLE t (x INT)").await;
    client.exec("INSERT INTO t VALUES (1), (2), (3)").await;

    assert!(eventually(|| server.governor().releases() == 1).await);
    assert_eq!(server.governor().phase(), Phase::Released);

    // Data survives the release and the query counts as activity.
    let sum = client.rows("SELECT SUM(x) FROM t").await;
    assert_eq!(cells(&sum), vec![vec![Some("6")]]);
    assert!(eventually(|| server.governor().phase() == Phase::Active).await);
    assert!(eventually(|| server.governor().releases() == 2).await);

    client.quit().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn on_disk_store_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let storage = dir.path().join("data").to_string_lossy().into_owned();
    let cfg = zerodb::config::ServerConfig { storage_path: storage, ..config(4) };

    let server = Server::start(cfg.clone()).await.unwrap();
    let mut client = TestClient::connect(server.local_addr()).await;
    client.exec("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)").await;
    client.exec("INSERT INTO users (name) VALUES ('ada'), ('grace')").await;
    assert_eq!(client.exec("DELETE FROM users WHERE name = 'ada'").await, 1);
    client.quit().await;
    server.stop().await.unwrap();

    let server = Server::start(cfg).await.unwrap();
    let mut client = TestClient::connect(server.local_addr()).await;
    let set = client.rows("SELECT id, name FROM users").await;
    assert_eq!(cells(&set), vec![vec![Some("2"), Some("grace")]]);
    let tables = client.rows("SHOW TABLES").await;
    assert_eq!(cells(&tables), vec![vec![Some("users")]]);
    server.stop().await.unwrap();
}
