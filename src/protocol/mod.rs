//! MySQL client/server wire protocol subset.
//!
//! [`packet`] owns the framing layer (`[len u24][seq u8][payload]`) and the
//! length-encoded primitives; [`message`] builds and parses the payloads the
//! server speaks: handshake v10, OK, ERR, EOF, column definitions and text
//! rows.

pub mod message;
pub mod packet;

pub use message::{
    decode_response, encode_result, ColumnDefinition, Command, ErrPacket, Handshake,
    HandshakeResponse, OkPacket, Response, ResponseReader, TextResultSet,
};
pub use packet::{encode_packet, Packet, PacketCodec, HEADER_LEN, MAX_PAYLOAD_LEN};

/// Handshake protocol version.
pub const PROTOCOL_VERSION: u8 = 10;

// Capability flags
pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
pub const CLIENT_FOUND_ROWS: u32 = 0x0000_0002;
pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
pub const CLIENT_PLUGIN_AUTH_LENENC_DATA: u32 = 0x0020_0000;

/// Capabilities announced in the handshake. `CLIENT_DEPRECATE_EOF` is left out
/// on purpose: result sets always end with an EOF packet.
pub const SERVER_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_FOUND_ROWS
    | CLIENT_LONG_FLAG
    | CLIENT_CONNECT_WITH_DB
    | CLIENT_PROTOCOL_41
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION
    | CLIENT_PLUGIN_AUTH;

pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;

/// utf8mb4_0900_ai_ci
pub const DEFAULT_CHARSET: u8 = 255;
/// binary
pub const BINARY_CHARSET: u16 = 63;

// Command bytes
pub const COM_SLEEP: u8 = 0x00;
pub const COM_QUIT: u8 = 0x01;
pub const COM_INIT_DB: u8 = 0x02;
pub const COM_QUERY: u8 = 0x03;
pub const COM_PING: u8 = 0x0E;

// Response markers
pub const OK_MARKER: u8 = 0x00;
pub const EOF_MARKER: u8 = 0xFE;
pub const ERR_MARKER: u8 = 0xFF;

// Column types
pub const MYSQL_TYPE_DOUBLE: u8 = 0x05;
pub const MYSQL_TYPE_NULL: u8 = 0x06;
pub const MYSQL_TYPE_LONGLONG: u8 = 0x08;
pub const MYSQL_TYPE_VAR_STRING: u8 = 0xFD;
