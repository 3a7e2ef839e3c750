//! Ident exchange over a single accepted connection.

use bytes::BytesMut;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::parser::{self, ParseResult, MAX_LINE_LENGTH};
use crate::sink::LogSink;

/// What happened on a connection that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    /// A request line was read and answered.
    Replied,
    /// The peer closed before sending anything.
    NoRequest,
}

/// Failures while serving a connection.
#[derive(Debug)]
pub enum ConnectionError {
    Io(io::Error),
    ReadTimeout(Duration),
    WriteTimeout(Duration),
    LineTooLong,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "connection I/O error: {e}"),
            ConnectionError::ReadTimeout(t) => {
                write!(f, "no request line within {}s", t.as_secs_f64())
            }
            ConnectionError::WriteTimeout(t) => {
                write!(f, "reply not written within {}s", t.as_secs_f64())
            }
            ConnectionError::LineTooLong => {
                write!(f, "request line exceeds {MAX_LINE_LENGTH} bytes")
            }
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

/// Answer one ident request on `stream`.
///
/// Reads a single line, replies with `<line> : USERID : UNIX : <identity>`
/// and shuts the write side down. Reading and writing are each bounded by
/// `timeout`.
pub async fn handle_connection<S>(
    mut stream: S,
    identity: &str,
    timeout: Duration,
    sink: &dyn LogSink,
) -> Result<Exchange, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(256);

    let read = read_line(&mut stream, &mut buffer);
    let line_len = match tokio::time::timeout(timeout, read).await {
        Ok(result) => result?,
        Err(_) => return Err(ConnectionError::ReadTimeout(timeout)),
    };

    let Some(line_len) = line_len else {
        trace!("Peer closed without a request");
        return Ok(Exchange::NoRequest);
    };

    let line = &buffer[..line_len];
    sink.log(&format!(
        "*** Ident request received: {}",
        String::from_utf8_lossy(line)
    ));

    let reply = parser::response_reply(line, identity);
    let write = async {
        stream.write_all(&reply).await?;
        stream.flush().await?;
        stream.shutdown().await
    };
    match tokio::time::timeout(timeout, write).await {
        Ok(result) => result?,
        Err(_) => return Err(ConnectionError::WriteTimeout(timeout)),
    }

    let sent = &reply[..reply.len() - 2];
    sink.log(&format!(
        "*** Ident reply sent: {}",
        String::from_utf8_lossy(sent)
    ));

    Ok(Exchange::Replied)
}

/// Read until a line terminator or end of stream.
///
/// Returns the line length within `buffer`, or `None` if the stream ended
/// before any byte arrived. Bytes received before end of stream count as a
/// line.
async fn read_line<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
) -> Result<Option<usize>, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match parser::parse(buffer) {
            ParseResult::Complete(len) => return Ok(Some(len)),
            ParseResult::TooLong => return Err(ConnectionError::LineTooLong),
            ParseResult::Incomplete => {}
        }

        let n = reader.read_buf(buffer).await?;
        if n == 0 {
            return Ok(if buffer.is_empty() {
                None
            } else {
                Some(buffer.len())
            });
        }
    }
}
