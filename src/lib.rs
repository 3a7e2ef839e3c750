//! ident-responder: a single-shot ident (RFC 1413) responder
//!
//! Lets a program that connects to IRC-style servers answer their ident
//! probe on port 113 without a system-wide ident daemon:
//! - Binds the ident port and waits a bounded time for one peer
//! - Echoes the peer's query with a fixed `USERID : UNIX` identity
//! - Shuts down after one reply, a timeout or any failure
//!
//! Lifecycle messages go to a caller-supplied [`LogSink`].

pub mod config;
pub mod ident;
pub mod responder;
pub mod sink;

pub use responder::{Outcome, Responder, ResponderConfig, State};
pub use sink::{LogSink, MemorySink, TracingSink};
