#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use std::{net::SocketAddr, time::Duration};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use zerodb::{
    config::{ResourceLimits, ServerConfig},
    protocol::{
        Command, Handshake, HandshakeResponse, OkPacket, Packet, PacketCodec, Response,
        ResponseReader, TextResultSet,
    },
    server::Server,
};

pub fn config(max_connections: usize) -> ServerConfig {
    ServerConfig { port: 0, max_connections, ..Default::default() }
}

/// Limits with a fast governor: idle after `idle_ms`, polled every 10ms.
pub fn fast_limits(max_connections: usize, idle_ms: u64) -> ResourceLimits {
    ResourceLimits {
        max_connections,
        idle_threshold: Duration::from_millis(idle_ms),
        release_delay: Duration::ZERO,
        tick: Duration::from_millis(10),
    }
}

pub async fn start(max_connections: usize) -> Server {
    Server::start(config(max_connections)).await.unwrap()
}

/// A minimal MySQL client over the crate's own codec.
pub struct TestClient {
    pub framed: Framed<TcpStream, PacketCodec>,
    pub handshake: Handshake,
}

impl TestClient {
    /// Connects and completes the handshake.
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, PacketCodec::new());

        let greeting = framed.next().await.unwrap().unwrap();
        assert_eq!(greeting.seq, 0);
        let handshake = Handshake::decode(&greeting.payload).unwrap();

        framed
            .send(Packet::new(1, HandshakeResponse::new("root", Some("zerodb")).encode()))
            .await
            .unwrap();
        let ok = framed.next().await.unwrap().unwrap();
        assert_eq!(ok.seq, 2);
        OkPacket::decode(&ok.payload).unwrap();
        Self { framed, handshake }
    }

    /// Sends a command and reads its whole response, checking that reply
    /// sequence numbers continue from the request's.
    pub async fn command(&mut self, command: Command) -> Response {
        self.framed.send(Packet::new(0, command.encode())).await.unwrap();
        let mut reader = ResponseReader::new();
        let mut expected = 1u8;
        loop {
            let packet = self.framed.next().await.unwrap().unwrap();
            assert_eq!(packet.seq, expected, "reply sequence");
            expected = expected.wrapping_add(1);
            if let Some(response) = reader.push(&packet.payload).unwrap() {
                return response;
            }
        }
    }

    pub async fn query(&mut self, sql: &str) -> Response {
        self.command(Command::Query(sql.to_string())).await
    }

    /// Runs a statement that must succeed with OK; returns affected rows.
    pub async fn exec(&mut self, sql: &str) -> u64 {
        match self.query(sql).await {
            Response::Ok(ok) => ok.affected_rows,
            other => panic!("{}: expected OK, got {:?}", sql, other),
        }
    }

    /// Runs a query that must return a result set.
    pub async fn rows(&mut self, sql: &str) -> TextResultSet {
        match self.query(sql).await {
            Response::ResultSet(set) => set,
            other => panic!("{}: expected a result set, got {:?}", sql, other),
        }
    }

    /// Runs a statement that must fail; returns the error code.
    pub async fn error(&mut self, sql: &str) -> u16 {
        match self.query(sql).await {
            Response::Err(err) => err.code,
            other => panic!("{}: expected ERR, got {:?}", sql, other),
        }
    }

    pub async fn quit(mut self) {
        self.framed.send(Packet::new(0, Command::Quit.encode())).await.unwrap();
        assert!(self.framed.next().await.is_none());
    }
}

pub fn cells(set: &TextResultSet) -> Vec<Vec<Option<&str>>> {
    set.rows.iter().map(|row| row.iter().map(|c| c.as_deref()).collect()).collect()
}

/// Polls `cond` every 10ms for up to two seconds.
pub async fn eventually<F: FnMut() -> bool>(mut cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
