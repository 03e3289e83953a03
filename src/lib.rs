//! An embeddable TFTP (RFC 1350, RFC 2347/2348/2349) server core.
//!
//! [`Server`] owns a single UDP socket and dispatches datagrams to
//! per-peer [`Connection`] state machines. Applications subscribe to
//! `rrq`/`wrq` events and attach a [`handle::Handle`] (a filesystem file,
//! an in-memory buffer, or anything else implementing the read/write
//! traits in [`handle`]) to serve or accept each transfer.

pub mod config;
pub mod connection;
pub mod error;
pub mod handle;
pub mod options;
pub mod packet;
pub mod server;

pub use config::ServerConfig;
pub use connection::{Connection, Kind, Outcome};
pub use error::{Error, ErrorKind, Result};
pub use handle::{ChunkSource, Handle, ReadHandle, ReadSource, WriteSink};
pub use packet::{DecodeError, Opcode, Packet};
pub use server::Server;
