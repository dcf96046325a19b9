use futures::{SinkExt, StreamExt};
use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash, Hasher},
    sync::Arc,
    time::Instant,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, info, trace, warn};

use crate::engine::{EngineHandle, StatementResult};
use crate::error::{codes, EngineError, FramingError, ServerError, ServerResult};
use crate::protocol::{
    encode_result, Command, ErrPacket, Handshake, HandshakeResponse, OkPacket, Packet, PacketCodec,
    SERVER_STATUS_AUTOCOMMIT,
};

/// What one connection needs from the server.
#[derive(Clone)]
pub struct ConnectionContext {
    pub id: u32,
    pub engine: Arc<EngineHandle>,
    pub server_version: String,
    /// Cancelled when the server stops
    pub shutdown: CancellationToken,
}

/// 20 printable bytes (0x21..=0x7E) for the handshake challenge. The value
/// is never checked; it only has to look like a real scramble.
fn scramble(seed: u32) -> [u8; 20] {
    let state = RandomState::new();
    let started = Instant::now();
    let mut out = [0u8; 20];
    for (i, b) in out.iter_mut().enumerate() {
        let mut h = state.build_hasher();
        (seed, i, started).hash(&mut h);
        *b = 0x21 + (h.finish() % 94) as u8;
    }
    out
}

async fn next_packet<S>(
    framed: &mut Framed<S, PacketCodec>,
    shutdown: &CancellationToken,
) -> ServerResult<Option<Packet>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Ok(None),
        packet = framed.next() => match packet {
            Some(packet) => Ok(Some(packet?)),
            None => Ok(None),
        },
    }
}

/// Serves one client from greeting to close.
///
/// ## Connection Lifecycle
/// ```text
/// Greeting ─▶ Authenticating ─▶ Ready ◀─┐
///                    │            │  └───┘ query / ping / sleep / init_db / unknown
///                    ▼            ▼
///                  Closed ◀─── quit, EOF, framing error, shutdown
/// ```
///
/// Statement and unknown-command errors are answered with ERR packets and
/// the connection stays Ready. Framing and socket errors end the connection
/// and are returned. Shutdown is only observed between commands, so a
/// statement that already started runs to completion.
pub async fn handle_connection<S>(stream: S, ctx: ConnectionContext) -> ServerResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, PacketCodec::new());

    let greeting = Handshake::new(&ctx.server_version, ctx.id, scramble(ctx.id));
    framed.send(Packet::new(0, greeting.encode())).await?;

    let Some(auth) = next_packet(&mut framed, &ctx.shutdown).await? else {
        debug!(conn = ctx.id, "closed before authenticating");
        return Ok(());
    };
    let login = HandshakeResponse::decode(&auth.payload)?;
    framed.send(Packet::new(auth.seq.wrapping_add(1), OkPacket::new(0, 0).encode())).await?;
    info!(conn = ctx.id, user = %login.username, db = ?login.database, "client authenticated");

    while let Some(packet) = next_packet(&mut framed, &ctx.shutdown).await? {
        let reply_seq = packet.seq.wrapping_add(1);
        let command = Command::parse(&packet.payload)?;
        trace!(conn = ctx.id, ?command, "command");

        let reply = match command {
            Command::Quit => break,
            Command::Sleep | Command::Ping => Ok(vec![ok_packet(reply_seq)]),
            Command::InitDb(db) => {
                debug!(conn = ctx.id, %db, "init_db accepted");
                Ok(vec![ok_packet(reply_seq)])
            }
            Command::Query(sql) => match ctx.engine.execute(&sql).await {
                Ok(result) => encode_reply(&result, reply_seq),
                Err(e) => Err(ServerError::Engine(e)),
            },
            Command::Unknown(code) => Err(ServerError::UnsupportedCommand(code)),
        };

        match reply {
            Ok(packets) => {
                for p in packets {
                    framed.feed(p).await?;
                }
                framed.flush().await?;
            }
            Err(e) if !e.is_fatal() => {
                debug!(conn = ctx.id, error = %e, "command failed");
                framed.send(Packet::new(reply_seq, err_packet(&e).encode())).await?;
            }
            Err(e) => return Err(e),
        }
    }

    debug!(conn = ctx.id, "connection closed");
    Ok(())
}

fn ok_packet(seq: u8) -> Packet {
    Packet::new(seq, OkPacket::new(0, 0).encode())
}

fn encode_reply(result: &StatementResult, first_seq: u8) -> ServerResult<Vec<Packet>> {
    match encode_result(result, first_seq, SERVER_STATUS_AUTOCOMMIT) {
        Ok(packets) => Ok(packets),
        Err(FramingError::PayloadTooLarge { len, max }) => {
            warn!(len, max, "result row does not fit in one packet");
            Err(ServerError::Engine(EngineError::new(
                codes::ER_NET_PACKET_TOO_LARGE,
                "Got a packet bigger than 'max_allowed_packet' bytes",
            )))
        }
        Err(e) => Err(e.into()),
    }
}

fn err_packet(e: &ServerError) -> ErrPacket {
    match e {
        ServerError::Engine(engine) => ErrPacket::from(engine),
        ServerError::UnsupportedCommand(_) => {
            ErrPacket::new(codes::ER_UNKNOWN_COM, "08S01", "Unknown command")
        }
        other => ErrPacket::new(codes::ER_INTERNAL, "HY000", other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::protocol::{Response, ResponseReader};
    use tokio::{io::DuplexStream, task::JoinHandle};

    struct Client {
        framed: Framed<DuplexStream, PacketCodec>,
        task: JoinHandle<ServerResult<()>>,
        shutdown: CancellationToken,
    }

    async fn connect() -> (Client, Handshake) {
        let (client, server) = tokio::io::duplex(1 << 16);
        let shutdown = CancellationToken::new();
        let ctx = ConnectionContext {
            id: 7,
            engine: Arc::new(EngineHandle::new(Engine::in_memory(8))),
            server_version: "8.0.32-test".into(),
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(handle_connection(server, ctx));
        let mut framed = Framed::new(client, PacketCodec::new());

        let greeting = framed.next().await.unwrap().unwrap();
        assert_eq!(greeting.seq, 0);
        let handshake = Handshake::decode(&greeting.payload).unwrap();

        framed.send(Packet::new(1, HandshakeResponse::new("root", None).encode())).await.unwrap();
        let ok = framed.next().await.unwrap().unwrap();
        assert_eq!(ok.seq, 2);
        OkPacket::decode(&ok.payload).unwrap();
        (Client { framed, task, shutdown }, handshake)
    }

    impl Client {
        async fn command(&mut self, command: Command) -> Response {
            self.framed.send(Packet::new(0, command.encode())).await.unwrap();
            let mut reader = ResponseReader::new();
            let mut expected_seq = 1u8;
            loop {
                let packet = self.framed.next().await.unwrap().unwrap();
                assert_eq!(packet.seq, expected_seq);
                expected_seq = expected_seq.wrapping_add(1);
                if let Some(response) = reader.push(&packet.payload).unwrap() {
                    return response;
                }
            }
        }

        async fn query(&mut self, sql: &str) -> Response {
            self.command(Command::Query(sql.into())).await
        }
    }

    #[tokio::test]
    async fn greeting_carries_id_version_and_printable_scramble() {
        let (_client, handshake) = connect().await;
        assert_eq!(handshake.connection_id, 7);
        assert_eq!(handshake.server_version, "8.0.32-test");
        assert!(handshake.scramble.iter().all(|b| (0x21..=0x7E).contains(b)));
    }

    #[tokio::test]
    async fn queries_and_errors_keep_the_connection_ready() {
        let (mut client, _) = connect().await;
        assert!(matches!(client.query("CREATE TABLE t(x INTEGER)").await, Response::Ok(_)));
        match client.query("INSERT INTO t VALUES (1), (2)").await {
            Response::Ok(ok) => assert_eq!(ok.affected_rows, 2),
            other => panic!("unexpected {:?}", other),
        }
        match client.query("SELECT x FROM t ORDER BY x DESC").await {
            Response::ResultSet(set) => {
                assert_eq!(set.column_names(), vec!["x"]);
                assert_eq!(set.rows, vec![vec![Some("2".into())], vec![Some("1".into())]]);
            }
            other => panic!("unexpected {:?}", other),
        }
        match client.query("SELECT * FROM missing").await {
            Response::Err(err) => {
                assert_eq!(err.code, codes::ER_NO_SUCH_TABLE);
                assert_eq!(err.sql_state, "42S02");
            }
            other => panic!("unexpected {:?}", other),
        }
        match client.command(Command::Unknown(0x7F)).await {
            Response::Err(err) => {
                assert_eq!(err.code, codes::ER_UNKNOWN_COM);
                assert_eq!(err.sql_state, "08S01");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(client.command(Command::Ping).await, Response::Ok(_)));
        assert!(matches!(client.command(Command::Sleep).await, Response::Ok(_)));
        assert!(matches!(client.command(Command::InitDb("zerodb".into())).await, Response::Ok(_)));
        assert!(matches!(client.query("SELECT 1").await, Response::ResultSet(_)));
    }

    #[tokio::test]
    async fn quit_ends_the_session_cleanly() {
        let (mut client, _) = connect().await;
        client.framed.send(Packet::new(0, Command::Quit.encode())).await.unwrap();
        assert!(client.task.await.unwrap().is_ok());
        assert!(client.framed.next().await.is_none());
    }

    #[tokio::test]
    async fn empty_command_is_a_framing_error() {
        let (mut client, _) = connect().await;
        client.framed.send(Packet::new(0, bytes::Bytes::new())).await.unwrap();
        let err = client.task.await.unwrap().unwrap_err();
        assert!(matches!(err, ServerError::Framing(FramingError::EmptyCommand)));
    }

    #[tokio::test]
    async fn shutdown_closes_an_idle_connection() {
        let (client, _) = connect().await;
        client.shutdown.cancel();
        assert!(client.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn garbage_handshake_response_closes() {
        let (client, server) = tokio::io::duplex(1 << 12);
        let ctx = ConnectionContext {
            id: 1,
            engine: Arc::new(EngineHandle::new(Engine::in_memory(8))),
            server_version: "v".into(),
            shutdown: CancellationToken::new(),
        };
        let task = tokio::spawn(handle_connection(server, ctx));
        let mut framed = Framed::new(client, PacketCodec::new());
        framed.next().await.unwrap().unwrap();
        framed.send(Packet::new(1, bytes::Bytes::from_static(b"\x01\x02"))).await.unwrap();
        assert!(task.await.unwrap().unwrap_err().is_fatal());
    }
}
