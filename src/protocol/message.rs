//! Payload builders and parsers for the messages the server exchanges.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::packet::{
    get_lenenc_bytes, get_lenenc_int, get_null_terminated, put_lenenc_int, put_lenenc_str,
    Packet, MAX_PAYLOAD_LEN, NULL_MARKER,
};
use super::*;
use crate::engine::{StatementResult, Value};
use crate::error::{EngineError, FramingError};

const AUTH_PLUGIN: &str = "mysql_native_password";

fn malformed(what: &'static str) -> FramingError {
    FramingError::Malformed { what }
}

// ============================================================================
// Handshake
// ============================================================================

/// Initial handshake (protocol v10) sent by the server on accept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub scramble: [u8; 20],
    pub capabilities: u32,
    pub charset: u8,
    pub status: u16,
}

impl Handshake {
    pub fn new(server_version: &str, connection_id: u32, scramble: [u8; 20]) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            server_version: server_version.to_string(),
            connection_id,
            scramble,
            capabilities: SERVER_CAPABILITIES,
            charset: DEFAULT_CHARSET,
            status: SERVER_STATUS_AUTOCOMMIT,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.server_version.len());
        buf.put_u8(self.protocol_version);
        buf.put_slice(self.server_version.as_bytes());
        buf.put_u8(0);
        buf.put_u32_le(self.connection_id);
        // auth-plugin-data part 1 + filler
        buf.put_slice(&self.scramble[..8]);
        buf.put_u8(0);
        buf.put_u16_le((self.capabilities & 0xFFFF) as u16);
        buf.put_u8(self.charset);
        buf.put_u16_le(self.status);
        buf.put_u16_le((self.capabilities >> 16) as u16);
        buf.put_u8(self.scramble.len() as u8 + 1);
        buf.put_slice(&[0u8; 10]);
        // auth-plugin-data part 2, NUL terminated
        buf.put_slice(&self.scramble[8..]);
        buf.put_u8(0);
        if self.capabilities & CLIENT_PLUGIN_AUTH != 0 {
            buf.put_slice(AUTH_PLUGIN.as_bytes());
            buf.put_u8(0);
        }
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FramingError> {
        let mut buf = payload;
        if buf.remaining() < 1 {
            return Err(malformed("handshake"));
        }
        let protocol_version = buf.get_u8();
        let server_version = get_null_terminated(&mut buf).ok_or_else(|| malformed("handshake"))?;
        let server_version = String::from_utf8_lossy(server_version).into_owned();
        // thread id, salt part 1, filler, caps low, charset, status, caps high,
        // auth data length, 10 reserved bytes, salt part 2
        if buf.remaining() < 4 + 8 + 1 + 2 + 1 + 2 + 2 + 1 + 10 + 12 {
            return Err(malformed("handshake"));
        }
        let connection_id = buf.get_u32_le();
        let mut scramble = [0u8; 20];
        buf.copy_to_slice(&mut scramble[..8]);
        buf.advance(1);
        let caps_low = u32::from(buf.get_u16_le());
        let charset = buf.get_u8();
        let status = buf.get_u16_le();
        let caps_high = u32::from(buf.get_u16_le());
        buf.advance(1 + 10);
        buf.copy_to_slice(&mut scramble[8..]);
        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            scramble,
            capabilities: caps_low | (caps_high << 16),
            charset,
            status,
        })
    }
}

/// The client's reply to the handshake (protocol 4.1 layout).
///
/// Credentials are parsed for logging only; any user is accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub capabilities: u32,
    pub max_packet: u32,
    pub charset: u8,
    pub username: String,
    pub database: Option<String>,
}

impl HandshakeResponse {
    pub fn new(username: &str, database: Option<&str>) -> Self {
        let mut capabilities = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_LONG_PASSWORD;
        if database.is_some() {
            capabilities |= CLIENT_CONNECT_WITH_DB;
        }
        Self {
            capabilities,
            max_packet: MAX_PAYLOAD_LEN as u32,
            charset: DEFAULT_CHARSET,
            username: username.to_string(),
            database: database.map(str::to_string),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.capabilities);
        buf.put_u32_le(self.max_packet);
        buf.put_u8(self.charset);
        buf.put_slice(&[0u8; 23]);
        buf.put_slice(self.username.as_bytes());
        buf.put_u8(0);
        // empty auth response
        buf.put_u8(0);
        if let Some(db) = &self.database {
            buf.put_slice(db.as_bytes());
            buf.put_u8(0);
        }
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FramingError> {
        let mut buf = payload;
        if buf.remaining() < 32 {
            return Err(malformed("handshake response"));
        }
        let capabilities = buf.get_u32_le();
        let max_packet = buf.get_u32_le();
        let charset = buf.get_u8();
        buf.advance(23);

        let username = match get_null_terminated(&mut buf) {
            Some(name) => String::from_utf8_lossy(name).into_owned(),
            None => {
                let name = String::from_utf8_lossy(buf).into_owned();
                buf = &[];
                name
            }
        };

        // Auth data is skipped; a short or odd tail only loses the database name.
        let auth_skipped = if capabilities & CLIENT_PLUGIN_AUTH_LENENC_DATA != 0 {
            get_lenenc_bytes(&mut buf).is_some()
        } else if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            match buf.first() {
                Some(&len) if buf.len() > len as usize => {
                    buf.advance(1 + len as usize);
                    true
                }
                _ => false,
            }
        } else {
            get_null_terminated(&mut buf).is_some()
        };

        let database = if auth_skipped && capabilities & CLIENT_CONNECT_WITH_DB != 0 {
            get_null_terminated(&mut buf)
                .map(|db| String::from_utf8_lossy(db).into_owned())
                .filter(|db| !db.is_empty())
        } else {
            None
        };

        Ok(Self { capabilities, max_packet, charset, username, database })
    }
}

// ============================================================================
// Commands
// ============================================================================

/// A decoded command packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Sleep,
    Quit,
    InitDb(String),
    Query(String),
    Ping,
    Unknown(u8),
}

impl Command {
    pub fn parse(payload: &[u8]) -> Result<Self, FramingError> {
        let (&code, body) = payload.split_first().ok_or(FramingError::EmptyCommand)?;
        let text = || String::from_utf8_lossy(body).trim().to_string();
        Ok(match code {
            COM_SLEEP => Command::Sleep,
            COM_QUIT => Command::Quit,
            COM_INIT_DB => Command::InitDb(text()),
            COM_QUERY => Command::Query(text()),
            COM_PING => Command::Ping,
            other => Command::Unknown(other),
        })
    }

    /// Encodes a command payload (client side).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Command::Sleep => buf.put_u8(COM_SLEEP),
            Command::Quit => buf.put_u8(COM_QUIT),
            Command::InitDb(db) => {
                buf.put_u8(COM_INIT_DB);
                buf.put_slice(db.as_bytes());
            }
            Command::Query(sql) => {
                buf.put_u8(COM_QUERY);
                buf.put_slice(sql.as_bytes());
            }
            Command::Ping => buf.put_u8(COM_PING),
            Command::Unknown(code) => buf.put_u8(*code),
        }
        buf.freeze()
    }
}

// ============================================================================
// Generic responses
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn new(affected_rows: u64, last_insert_id: u64) -> Self {
        Self { affected_rows, last_insert_id, status: SERVER_STATUS_AUTOCOMMIT, warnings: 0 }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(11);
        buf.put_u8(OK_MARKER);
        put_lenenc_int(&mut buf, self.affected_rows);
        put_lenenc_int(&mut buf, self.last_insert_id);
        buf.put_u16_le(self.status);
        buf.put_u16_le(self.warnings);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FramingError> {
        let mut buf = payload;
        if buf.first() != Some(&OK_MARKER) {
            return Err(malformed("OK"));
        }
        buf.advance(1);
        let affected_rows = get_lenenc_int(&mut buf).ok_or_else(|| malformed("OK"))?;
        let last_insert_id = get_lenenc_int(&mut buf).ok_or_else(|| malformed("OK"))?;
        if buf.remaining() < 4 {
            return Err(malformed("OK"));
        }
        let status = buf.get_u16_le();
        let warnings = buf.get_u16_le();
        Ok(Self { affected_rows, last_insert_id, status, warnings })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrPacket {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrPacket {
    pub fn new(code: u16, sql_state: &str, message: impl Into<String>) -> Self {
        Self { code, sql_state: sql_state.to_string(), message: message.into() }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9 + self.message.len());
        buf.put_u8(ERR_MARKER);
        buf.put_u16_le(self.code);
        buf.put_u8(b'#');
        let mut state = [b'0'; 5];
        for (dst, src) in state.iter_mut().zip(self.sql_state.bytes()) {
            *dst = src;
        }
        buf.put_slice(&state);
        buf.put_slice(self.message.as_bytes());
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FramingError> {
        let mut buf = payload;
        if buf.remaining() < 9 || buf.get_u8() != ERR_MARKER {
            return Err(malformed("ERR"));
        }
        let code = buf.get_u16_le();
        if buf.get_u8() != b'#' {
            return Err(malformed("ERR"));
        }
        let sql_state = String::from_utf8_lossy(&buf[..5]).into_owned();
        let message = String::from_utf8_lossy(&buf[5..]).into_owned();
        Ok(Self { code, sql_state, message })
    }
}

impl From<&EngineError> for ErrPacket {
    fn from(e: &EngineError) -> Self {
        ErrPacket::new(e.code, e.sql_state, e.message.clone())
    }
}

pub fn encode_eof(status: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(EOF_MARKER);
    buf.put_u16_le(0);
    buf.put_u16_le(status);
    buf.freeze()
}

/// An EOF packet is `0xFE` with a payload shorter than 9 bytes; longer
/// payloads starting with `0xFE` are rows whose first cell uses an 8-byte
/// length prefix.
pub fn is_eof(payload: &[u8]) -> bool {
    payload.first() == Some(&EOF_MARKER) && payload.len() < 9
}

// ============================================================================
// Result sets
// ============================================================================

/// Column definition (protocol 4.1). Only the name and type are meaningful.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    pub column_type: u8,
}

impl ColumnDefinition {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32 + 2 * self.name.len());
        put_lenenc_str(&mut buf, "def");
        put_lenenc_str(&mut buf, "");
        put_lenenc_str(&mut buf, "");
        put_lenenc_str(&mut buf, "");
        put_lenenc_str(&mut buf, &self.name);
        put_lenenc_str(&mut buf, &self.name);
        // length of the fixed-size fields
        buf.put_u8(0x0c);
        let charset = if self.column_type == MYSQL_TYPE_VAR_STRING {
            u16::from(DEFAULT_CHARSET)
        } else {
            BINARY_CHARSET
        };
        buf.put_u16_le(charset);
        buf.put_u32_le(if self.column_type == MYSQL_TYPE_VAR_STRING { 1020 } else { 21 });
        buf.put_u8(self.column_type);
        buf.put_u16_le(0);
        buf.put_u8(if self.column_type == MYSQL_TYPE_DOUBLE { 31 } else { 0 });
        buf.put_u16_le(0);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FramingError> {
        let mut buf = payload;
        // catalog, schema, table, org_table
        for _ in 0..4 {
            get_lenenc_bytes(&mut buf).ok_or_else(|| malformed("column definition"))?;
        }
        let name = get_lenenc_bytes(&mut buf).ok_or_else(|| malformed("column definition"))?;
        let name = String::from_utf8_lossy(name).into_owned();
        get_lenenc_bytes(&mut buf).ok_or_else(|| malformed("column definition"))?;
        if buf.remaining() < 13 {
            return Err(malformed("column definition"));
        }
        buf.advance(1 + 2 + 4);
        let column_type = buf.get_u8();
        Ok(Self { name, column_type })
    }
}

/// Wire type for a column, taken from its first non-NULL cell.
fn column_type(rows: &[Vec<Value>], idx: usize) -> u8 {
    rows.iter()
        .filter_map(|row| row.get(idx))
        .find(|v| !matches!(v, Value::Null))
        .map(|v| match v {
            Value::Int(_) => MYSQL_TYPE_LONGLONG,
            Value::Real(_) => MYSQL_TYPE_DOUBLE,
            Value::Text(_) => MYSQL_TYPE_VAR_STRING,
            Value::Null => MYSQL_TYPE_NULL,
        })
        .unwrap_or(MYSQL_TYPE_VAR_STRING)
}

pub fn encode_text_row(values: &[Value]) -> Bytes {
    let mut buf = BytesMut::new();
    for value in values {
        match value.to_text() {
            Some(text) => put_lenenc_str(&mut buf, &text),
            None => buf.put_u8(NULL_MARKER),
        }
    }
    buf.freeze()
}

pub fn decode_text_row(payload: &[u8], columns: usize) -> Result<Vec<Option<String>>, FramingError> {
    let mut buf = payload;
    let mut cells = Vec::with_capacity(columns);
    for _ in 0..columns {
        if buf.first() == Some(&NULL_MARKER) {
            buf.advance(1);
            cells.push(None);
        } else {
            let cell = get_lenenc_bytes(&mut buf).ok_or_else(|| malformed("row"))?;
            cells.push(Some(String::from_utf8_lossy(cell).into_owned()));
        }
    }
    if !buf.is_empty() {
        return Err(malformed("row"));
    }
    Ok(cells)
}

/// Encodes a statement result as the packet train sent after a query.
///
/// Row-sets become `column count, column definitions, EOF, rows, EOF`;
/// mutation outcomes become a single OK. Sequence ids start at `first_seq`.
pub fn encode_result(
    result: &StatementResult,
    first_seq: u8,
    status: u16,
) -> Result<Vec<Packet>, FramingError> {
    let mut seq = first_seq;
    let mut out = Vec::new();
    let mut push = |payload: Bytes| -> Result<(), FramingError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FramingError::PayloadTooLarge { len: payload.len(), max: MAX_PAYLOAD_LEN });
        }
        out.push(Packet::new(seq, payload));
        seq = seq.wrapping_add(1);
        Ok(())
    };

    match result {
        StatementResult::Mutation { affected_rows, last_insert_id } => {
            let mut ok = OkPacket::new(*affected_rows, last_insert_id.unwrap_or(0));
            ok.status = status;
            push(ok.encode())?;
        }
        StatementResult::RowSet { columns, rows } => {
            let mut count = BytesMut::with_capacity(9);
            put_lenenc_int(&mut count, columns.len() as u64);
            push(count.freeze())?;
            for (idx, name) in columns.iter().enumerate() {
                let def = ColumnDefinition { name: name.clone(), column_type: column_type(rows, idx) };
                push(def.encode())?;
            }
            push(encode_eof(status))?;
            for row in rows {
                push(encode_text_row(row))?;
            }
            push(encode_eof(status))?;
        }
    }
    Ok(out)
}

/// A text result set as seen by a client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TextResultSet {
    pub columns: Vec<ColumnDefinition>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl TextResultSet {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// A complete server response to one command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ok(OkPacket),
    Err(ErrPacket),
    ResultSet(TextResultSet),
}

enum ReaderState {
    Start,
    Columns { expected: usize, set: TextResultSet },
    ColumnsEof { set: TextResultSet },
    Rows { set: TextResultSet },
}

/// Incrementally assembles a [`Response`] from the payloads of consecutive
/// packets.
pub struct ResponseReader {
    state: ReaderState,
}

impl Default for ResponseReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseReader {
    pub fn new() -> Self {
        Self { state: ReaderState::Start }
    }

    /// Feeds one payload. Returns the response once it is complete.
    pub fn push(&mut self, payload: &[u8]) -> Result<Option<Response>, FramingError> {
        let state = std::mem::replace(&mut self.state, ReaderState::Start);
        let (next, done) = match state {
            ReaderState::Start => match payload.first() {
                Some(&OK_MARKER) => (ReaderState::Start, Some(Response::Ok(OkPacket::decode(payload)?))),
                Some(&ERR_MARKER) => (ReaderState::Start, Some(Response::Err(ErrPacket::decode(payload)?))),
                Some(_) => {
                    let mut buf = payload;
                    let expected = get_lenenc_int(&mut buf).ok_or_else(|| malformed("column count"))?;
                    let set = TextResultSet::default();
                    if expected == 0 {
                        (ReaderState::ColumnsEof { set }, None)
                    } else {
                        (ReaderState::Columns { expected: expected as usize, set }, None)
                    }
                }
                None => return Err(malformed("response")),
            },
            ReaderState::Columns { expected, mut set } => {
                set.columns.push(ColumnDefinition::decode(payload)?);
                if set.columns.len() == expected {
                    (ReaderState::ColumnsEof { set }, None)
                } else {
                    (ReaderState::Columns { expected, set }, None)
                }
            }
            ReaderState::ColumnsEof { set } => {
                if !is_eof(payload) {
                    return Err(malformed("column EOF"));
                }
                (ReaderState::Rows { set }, None)
            }
            ReaderState::Rows { mut set } => {
                if is_eof(payload) {
                    (ReaderState::Start, Some(Response::ResultSet(set)))
                } else if payload.first() == Some(&ERR_MARKER) {
                    (ReaderState::Start, Some(Response::Err(ErrPacket::decode(payload)?)))
                } else {
                    let row = decode_text_row(payload, set.columns.len())?;
                    set.rows.push(row);
                    (ReaderState::Rows { set }, None)
                }
            }
        };
        self.state = next;
        Ok(done)
    }
}

/// Decodes a full packet train into one response.
pub fn decode_response(packets: &[Packet]) -> Result<Response, FramingError> {
    let mut reader = ResponseReader::new();
    for packet in packets {
        if let Some(response) = reader.push(&packet.payload)? {
            return Ok(response);
        }
    }
    Err(FramingError::Truncated { buffered: packets.len() })
}
