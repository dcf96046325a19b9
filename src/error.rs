use std::fmt;

use thiserror::Error;

/// MySQL server error numbers used in ERR packets.
pub mod codes {
    pub const ER_TABLE_EXISTS: u16 = 1050;
    pub const ER_BAD_TABLE: u16 = 1051;
    pub const ER_BAD_NULL: u16 = 1048;
    pub const ER_SERVER_SHUTDOWN: u16 = 1053;
    pub const ER_BAD_FIELD: u16 = 1054;
    pub const ER_UNKNOWN_COM: u16 = 1047;
    pub const ER_DUP_ENTRY: u16 = 1062;
    pub const ER_PARSE_ERROR: u16 = 1064;
    pub const ER_INTERNAL: u16 = 1105;
    pub const ER_WRONG_VALUE_COUNT: u16 = 1136;
    pub const ER_NO_SUCH_TABLE: u16 = 1146;
    pub const ER_DUP_FIELDNAME: u16 = 1060;
    pub const ER_TABLE_MUST_HAVE_COLUMNS: u16 = 1113;
    pub const ER_NET_PACKET_TOO_LARGE: u16 = 1153;
    pub const ER_EMPTY_QUERY: u16 = 1065;
    pub const ER_UNKNOWN_SYSTEM_VARIABLE: u16 = 1193;
    pub const ER_NOT_SUPPORTED: u16 = 1235;
    pub const ER_WRONG_VALUE: u16 = 1366;
}

/// A statement rejected by the storage engine.
///
/// Carries everything an ERR packet needs. Never fatal to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub code: u16,
    pub sql_state: &'static str,
    pub message: String,
}

impl EngineError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            sql_state: sql_state_for(code),
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(codes::ER_PARSE_ERROR, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(codes::ER_NOT_SUPPORTED, message)
    }

    pub fn no_such_table(table: &str) -> Self {
        Self::new(codes::ER_NO_SUCH_TABLE, format!("Table '{}' doesn't exist", table))
    }

    pub fn unknown_column(column: &str) -> Self {
        Self::new(codes::ER_BAD_FIELD, format!("Unknown column '{}'", column))
    }

    pub fn shutdown() -> Self {
        Self::new(codes::ER_SERVER_SHUTDOWN, "Server shutdown in progress")
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self::new(codes::ER_INTERNAL, format!("{:#}", err))
    }

    /// Recovers an `EngineError` raised inside an `anyhow` chain; anything
    /// else becomes `ER_INTERNAL`.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<EngineError>() {
            Ok(engine) => engine,
            Err(other) => Self::internal(other),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERROR {} ({}): {}", self.code, self.sql_state, self.message)
    }
}

impl std::error::Error for EngineError {}

fn sql_state_for(code: u16) -> &'static str {
    match code {
        codes::ER_TABLE_EXISTS => "42S01",
        codes::ER_NO_SUCH_TABLE | codes::ER_BAD_TABLE => "42S02",
        codes::ER_BAD_FIELD => "42S22",
        codes::ER_DUP_FIELDNAME => "42S21",
        codes::ER_NET_PACKET_TOO_LARGE => "08S01",
        codes::ER_TABLE_MUST_HAVE_COLUMNS | codes::ER_EMPTY_QUERY => "42000",
        codes::ER_BAD_NULL | codes::ER_DUP_ENTRY => "23000",
        codes::ER_WRONG_VALUE_COUNT => "21S01",
        codes::ER_WRONG_VALUE => "HY000",
        codes::ER_UNKNOWN_COM => "08S01",
        codes::ER_SERVER_SHUTDOWN => "08S01",
        codes::ER_PARSE_ERROR | codes::ER_NOT_SUPPORTED => "42000",
        _ => "HY000",
    }
}

/// Malformed or truncated wire traffic. Always closes the connection.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("stream closed in the middle of a packet ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
    #[error("payload of {len} bytes exceeds the single packet limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("empty command packet")]
    EmptyCommand,
    #[error("malformed {what} packet")]
    Malformed { what: &'static str },
    #[error("connection closed by peer")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything that can go wrong between accept and close.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    /// Reserved: authentication always succeeds.
    #[error("authentication failed for user '{0}'")]
    Auth(String),
    #[error("{0}")]
    Engine(#[from] EngineError),
    #[error("connection limit of {max} reached")]
    Capacity { max: usize },
    #[error("unsupported command 0x{0:02x}")]
    UnsupportedCommand(u8),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Whether the connection must be closed after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ServerError::Engine(_) | ServerError::UnsupportedCommand(_))
    }
}

pub type ServerResult<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_carries_sql_state() {
        let e = EngineError::no_such_table("t");
        assert_eq!(e.code, codes::ER_NO_SUCH_TABLE);
        assert_eq!(e.sql_state.len(), 5);
        assert!(e.to_string().contains("doesn't exist"));
    }

    #[test]
    fn only_engine_and_command_errors_are_recoverable() {
        assert!(!ServerError::Engine(EngineError::parse("x")).is_fatal());
        assert!(!ServerError::UnsupportedCommand(0x7f).is_fatal());
        assert!(ServerError::Framing(FramingError::EmptyCommand).is_fatal());
        assert!(ServerError::Capacity { max: 1 }.is_fatal());
    }

    #[test]
    fn engine_errors_survive_an_anyhow_round_trip() {
        let wrapped: anyhow::Error = EngineError::unknown_column("x").into();
        assert_eq!(EngineError::from_anyhow(wrapped).code, codes::ER_BAD_FIELD);

        let other = anyhow::anyhow!("disk on fire");
        let mapped = EngineError::from_anyhow(other);
        assert_eq!(mapped.code, codes::ER_INTERNAL);
        assert_eq!(mapped.sql_state, "HY000");
    }
}
