//! Ident protocol implementation (RFC 1413, server side).
//!
//! Only the single-query exchange is supported:
//! - Client sends: `<port-on-server> , <port-on-client>\r\n`
//! - Server responds: `<request> : USERID : UNIX : <identity>\r\n`
//!
//! The request is not parsed into port pairs. Whatever the client sent on
//! its first line is echoed back as the prefix of the reply, and every
//! query gets the same identity.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  113, 6667\r\n
//! Response: 113, 6667 : USERID : UNIX : alice\r\n
//! ```
//!
//! The connection is closed right after the reply.

pub mod handler;
pub mod parser;

pub use handler::{handle_connection, ConnectionError, Exchange};
