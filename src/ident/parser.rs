//! Ident protocol framing and reply formatting.

use bytes::BytesMut;

/// Buffer bound for a single request line. Any content up to this size is
/// accepted and echoed; past it the peer is dropped instead of growing the
/// buffer without limit.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Inserted between the echoed request and the identity.
const REPLY_INFIX: &[u8] = b" : USERID : UNIX : ";

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// A full line is buffered; holds its length without the terminator.
    Complete(usize),
    /// Need more data.
    Incomplete,
    /// No terminator within `MAX_LINE_LENGTH` bytes.
    TooLong,
}

/// Look for the end of the request line in the input buffer.
///
/// `\n`, `\r` and `\r\n` all terminate a line.
pub fn parse(input: &[u8]) -> ParseResult {
    match find_line_end(input) {
        Some(pos) if pos <= MAX_LINE_LENGTH => ParseResult::Complete(pos),
        Some(_) => ParseResult::TooLong,
        None if input.len() > MAX_LINE_LENGTH => ParseResult::TooLong,
        None => ParseResult::Incomplete,
    }
}

/// Build the reply for a request line, `\r\n` included.
///
/// The request bytes are echoed as received; port pairs are not validated.
pub fn response_reply(line: &[u8], identity: &str) -> BytesMut {
    let mut reply = BytesMut::with_capacity(line.len() + REPLY_INFIX.len() + identity.len() + 2);
    reply.extend_from_slice(line);
    reply.extend_from_slice(REPLY_INFIX);
    reply.extend_from_slice(identity.as_bytes());
    reply.extend_from_slice(b"\r\n");
    reply
}

/// Find the first `\r` or `\n` in buffer.
fn find_line_end(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == b'\r' || b == b'\n')
}
