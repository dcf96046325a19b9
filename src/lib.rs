//! # zerodb - A MySQL-wire-compatible Database in Rust
//!
//! A small relational server that speaks enough of the MySQL client/server
//! protocol for stock clients and drivers to connect, run SQL and read
//! results. It features:
//! - **Wire Protocol**: handshake v10, text queries, OK/ERR/EOF and result-set trains
//! - **Embedded Store**: paged tables behind an LRU buffer pool and a write-ahead log
//! - **Serialized Execution**: one statement runs at a time across all connections
//! - **Idle Release**: a governor flushes and drops cached pages when nothing runs
//!
//! ## Architecture Overview
//!
//! 1. **Server Layer** (`server`, `connection`): accept loop, capacity gate, per-client sessions
//! 2. **Protocol Layer** (`protocol`): packet framing and message codecs
//! 3. **SQL Layer** (`sql`): statement classification, parsing and dispatch
//! 4. **Engine Layer** (`engine`): catalog, pages, buffer pool, WAL, execution gate
//! 5. **Governor** (`governor`): idle detection and memory release
//!
//! ## Usage Example
//!
//! ```text
//! # Start the server on the default port with an in-memory store
//! cargo run -- --port 3306
//!
//! # Persist to a directory and allow 50 clients
//! cargo run -- --storage ./dbdata --max-connections 50
//!
//! # Connect with any MySQL client
//! mysql -h 127.0.0.1 -P 3306 -u root -e "SELECT @@version"
//! ```

/// Server configuration file and resource limits
pub mod config;

/// Error types and MySQL error codes
pub mod error;

/// MySQL packet framing and message encoding
pub mod protocol;

/// Storage engine, buffer pool, WAL and the execution gate
pub mod engine;

/// SQL classification, parsing and execution
pub mod sql;

/// Idle-time resource release
pub mod governor;

/// Per-client protocol sessions
pub mod connection;

/// Listener, capacity gate and ordered shutdown
pub mod server;
