//! Single-shot ident responder.
//!
//! Binds the ident port at construction, then serves at most one request on
//! a spawned task and closes the listener, whatever happened.

use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::ident::{self, ConnectionError, Exchange};
use crate::sink::LogSink;

/// Well-known ident port.
pub const IDENT_PORT: u16 = 113;

/// Bound on the accept wait and on each connection's read and write.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings captured once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponderConfig {
    /// Address to listen on.
    pub listen: SocketAddr,
    /// How long to wait for a peer, and for its request and our reply.
    pub timeout: Duration,
    /// Login reported for every request.
    pub identity: String,
}

impl ResponderConfig {
    /// All interfaces, port 113, 60 second timeout.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, IDENT_PORT)),
            timeout: DEFAULT_TIMEOUT,
            identity: identity.into(),
        }
    }
}

/// How the serve phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A connection was handled: answered, or closed by the peer unasked.
    Served,
    /// Nobody connected in time.
    TimedOut,
    /// Accepting, reading or writing failed.
    Errored,
}

/// Lifecycle of a responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unstarted,
    Bound,
    BindFailed,
    Closed(Outcome),
}

impl State {
    /// `BindFailed` and `Closed` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::BindFailed | State::Closed(_))
    }
}

/// Serve-phase failures. None of these reach the caller.
#[derive(Debug)]
pub enum ServeError {
    AcceptTimeout(Duration),
    Accept(io::Error),
    ListenerClosed,
    Connection(ConnectionError),
}

impl fmt::Display for ServeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServeError::AcceptTimeout(t) => {
                write!(f, "no connection within {}s", t.as_secs_f64())
            }
            ServeError::Accept(e) => write!(f, "accept failed: {e}"),
            ServeError::ListenerClosed => write!(f, "listener already closed"),
            ServeError::Connection(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ServeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServeError::Accept(e) => Some(e),
            ServeError::Connection(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConnectionError> for ServeError {
    fn from(e: ConnectionError) -> Self {
        ServeError::Connection(e)
    }
}

/// Every serve-phase result ends in teardown; only the outcome differs.
fn outcome(result: &Result<Exchange, ServeError>) -> Outcome {
    match result {
        Ok(Exchange::Replied) | Ok(Exchange::NoRequest) => Outcome::Served,
        Err(ServeError::AcceptTimeout(_)) => Outcome::TimedOut,
        Err(ServeError::Accept(_))
        | Err(ServeError::ListenerClosed)
        | Err(ServeError::Connection(_)) => Outcome::Errored,
    }
}

/// Exclusive owner of the listening socket. Closing twice is a no-op.
struct ListenerHandle {
    inner: Option<TcpListener>,
}

impl ListenerHandle {
    fn new(listener: TcpListener) -> Self {
        Self {
            inner: Some(listener),
        }
    }

    async fn accept(&self, timeout: Duration) -> Result<(TcpStream, SocketAddr), ServeError> {
        let listener = self.inner.as_ref().ok_or(ServeError::ListenerClosed)?;
        match tokio::time::timeout(timeout, listener.accept()).await {
            Ok(result) => result.map_err(ServeError::Accept),
            Err(_) => Err(ServeError::AcceptTimeout(timeout)),
        }
    }

    fn close(&mut self) {
        if let Some(listener) = self.inner.take() {
            drop(listener);
            debug!("Ident listener closed");
        }
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

/// A responder that answers at most one ident query.
///
/// Construction binds the listener and, on success, spawns the serve task on
/// the current Tokio runtime. Everything after that is autonomous; the
/// handle only observes.
#[derive(Debug)]
pub struct Responder {
    local_addr: Option<SocketAddr>,
    state: watch::Receiver<State>,
}

impl Responder {
    /// Start on port 113 with the default timeout.
    pub fn start(identity: impl Into<String>, sink: Arc<dyn LogSink>) -> Self {
        Self::with_config(ResponderConfig::new(identity), sink)
    }

    /// Start with explicit settings.
    ///
    /// Never fails: when the port cannot be bound (or there is no runtime to
    /// serve on) a message goes to `sink` and the responder stays in
    /// [`State::BindFailed`].
    pub fn with_config(config: ResponderConfig, sink: Arc<dyn LogSink>) -> Self {
        let (state_tx, state_rx) = watch::channel(State::Unstarted);

        let bound = Handle::try_current()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .and_then(|runtime| bind(config.listen).map(|listener| (runtime, listener)));

        let (runtime, listener) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                debug!(addr = %config.listen, error = %e, "Ident bind failed");
                sink.log(&format!(
                    "*** Could not start the ident server on port {}.",
                    config.listen.port()
                ));
                state_tx.send_replace(State::BindFailed);
                return Self {
                    local_addr: None,
                    state: state_rx,
                };
            }
        };

        let local_addr = listener.local_addr().ok();
        let port = local_addr.map_or(config.listen.port(), |addr| addr.port());
        info!(addr = ?local_addr, timeout = ?config.timeout, "Ident listener bound");
        sink.log(&format!(
            "*** Ident server running on port {port} for the next {} seconds...",
            config.timeout.as_secs_f64()
        ));
        state_tx.send_replace(State::Bound);

        runtime.spawn(serve(listener, config, sink, state_tx));

        Self {
            local_addr,
            state: state_rx,
        }
    }

    /// Address actually bound, if binding succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Wait until the responder reaches a terminal state.
    pub async fn closed(&self) -> State {
        let mut state = self.state.clone();
        let terminal = state.wait_for(State::is_terminal).await.map(|current| *current);
        // Serve task is gone without closing; report what it left.
        terminal.unwrap_or_else(|_| *state.borrow())
    }
}

/// Bind a listener for one connection.
fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1)?;

    TcpListener::from_std(socket.into())
}

/// The serve phase: one accept, at most one reply, then teardown.
async fn serve(
    listener: TcpListener,
    config: ResponderConfig,
    sink: Arc<dyn LogSink>,
    state: watch::Sender<State>,
) {
    let mut listener = ListenerHandle::new(listener);

    let result = serve_one(&listener, &config, sink.as_ref()).await;
    if let Err(e) = &result {
        debug!(error = %e, "Ident request not served");
    }
    let outcome = outcome(&result);

    listener.close();
    sink.log("*** The Ident server has been shut down.");
    info!(?outcome, "Ident responder finished");
    state.send_replace(State::Closed(outcome));
}

async fn serve_one(
    listener: &ListenerHandle,
    config: &ResponderConfig,
    sink: &dyn LogSink,
) -> Result<Exchange, ServeError> {
    let (stream, peer) = listener.accept(config.timeout).await?;
    debug!(peer = %peer, "Ident connection accepted");

    let exchange = ident::handle_connection(stream, &config.identity, config.timeout, sink).await?;
    Ok(exchange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const SHUTDOWN: &str = "*** The Ident server has been shut down.";

    fn loopback(identity: &str, timeout: Duration) -> ResponderConfig {
        ResponderConfig {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            timeout,
            identity: identity.to_string(),
        }
    }

    fn start(config: ResponderConfig) -> (Responder, MemorySink) {
        let sink = MemorySink::new();
        let responder = Responder::with_config(config, Arc::new(sink.clone()));
        (responder, sink)
    }

    #[test]
    fn test_default_config() {
        let config = ResponderConfig::new("alice");
        assert_eq!(config.listen.port(), IDENT_PORT);
        assert!(config.listen.ip().is_unspecified());
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.identity, "alice");
    }

    #[test]
    fn test_outcome_table() {
        assert_eq!(outcome(&Ok(Exchange::Replied)), Outcome::Served);
        assert_eq!(outcome(&Ok(Exchange::NoRequest)), Outcome::Served);
        assert_eq!(
            outcome(&Err(ServeError::AcceptTimeout(DEFAULT_TIMEOUT))),
            Outcome::TimedOut
        );
        assert_eq!(
            outcome(&Err(ServeError::Accept(io::ErrorKind::Other.into()))),
            Outcome::Errored
        );
        assert_eq!(outcome(&Err(ServeError::ListenerClosed)), Outcome::Errored);
        assert_eq!(
            outcome(&Err(ServeError::Connection(ConnectionError::LineTooLong))),
            Outcome::Errored
        );
    }

    #[test]
    fn test_start_without_runtime() {
        let (responder, sink) = start(loopback("alice", DEFAULT_TIMEOUT));

        assert_eq!(responder.state(), State::BindFailed);
        assert_eq!(responder.local_addr(), None);
        assert_eq!(
            sink.messages(),
            vec!["*** Could not start the ident server on port 0."]
        );
    }

    #[tokio::test]
    async fn test_serves_one_request() {
        let (responder, sink) = start(loopback("alice", Duration::from_secs(5)));
        let addr = responder.local_addr().unwrap();

        let startup = sink.messages();
        assert_eq!(startup.len(), 1);
        assert!(startup[0].starts_with("*** Ident server running on port"));
        assert_eq!(responder.state(), State::Bound);

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"113, 6667\r\n").await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();

        assert_eq!(reply, b"113, 6667 : USERID : UNIX : alice\r\n");
        assert_eq!(responder.closed().await, State::Closed(Outcome::Served));
        assert_eq!(
            sink.messages()[1..],
            [
                "*** Ident request received: 113, 6667",
                "*** Ident reply sent: 113, 6667 : USERID : UNIX : alice",
                SHUTDOWN,
            ]
        );
    }

    #[tokio::test]
    async fn test_startup_message_text() {
        let (responder, sink) = start(loopback("alice", DEFAULT_TIMEOUT));
        let port = responder.local_addr().unwrap().port();

        assert_eq!(
            sink.messages(),
            vec![format!(
                "*** Ident server running on port {port} for the next 60 seconds..."
            )]
        );
    }

    #[tokio::test]
    async fn test_long_request_is_echoed() {
        let (responder, _sink) = start(loopback("alice", Duration::from_secs(5)));
        let addr = responder.local_addr().unwrap();
        let request = "x".repeat(2000);

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(request.as_bytes()).await.unwrap();
        client.write_all(b"\r\n").await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();

        let expected = format!("{request} : USERID : UNIX : alice\r\n");
        assert_eq!(reply, expected.as_bytes());
        assert_eq!(responder.closed().await, State::Closed(Outcome::Served));
    }

    #[tokio::test]
    async fn test_unterminated_request_is_answered() {
        let (responder, _sink) = start(loopback("alice", Duration::from_secs(5)));
        let addr = responder.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"113, 6667").await.unwrap();
        client.shutdown().await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();

        assert_eq!(reply, b"113, 6667 : USERID : UNIX : alice\r\n");
        assert_eq!(responder.closed().await, State::Closed(Outcome::Served));
    }

    #[tokio::test]
    async fn test_peer_closes_without_request() {
        let (responder, sink) = start(loopback("alice", Duration::from_secs(5)));
        let addr = responder.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        drop(client);

        assert_eq!(responder.closed().await, State::Closed(Outcome::Served));
        let messages = sink.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1], SHUTDOWN);
    }

    #[tokio::test]
    async fn test_times_out_without_client() {
        let (responder, sink) = start(loopback("alice", Duration::from_millis(100)));
        let addr = responder.local_addr().unwrap();

        assert_eq!(responder.closed().await, State::Closed(Outcome::TimedOut));
        assert_eq!(sink.messages().last().map(String::as_str), Some(SHUTDOWN));

        // Port is released.
        let rebound = std::net::TcpListener::bind(addr);
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_silent_client_is_dropped() {
        let (responder, sink) = start(loopback("alice", Duration::from_millis(200)));
        let addr = responder.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();

        assert!(reply.is_empty());
        assert_eq!(responder.closed().await, State::Closed(Outcome::Errored));
        assert_eq!(sink.messages().last().map(String::as_str), Some(SHUTDOWN));
    }

    #[tokio::test]
    async fn test_second_connection_refused() {
        let (responder, _sink) = start(loopback("alice", Duration::from_secs(5)));
        let addr = responder.local_addr().unwrap();

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"1, 2\r\n").await.unwrap();
        let mut reply = Vec::new();
        first.read_to_end(&mut reply).await.unwrap();
        responder.closed().await;

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_when_port_taken() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let config = ResponderConfig {
            listen: addr,
            ..loopback("alice", DEFAULT_TIMEOUT)
        };

        let (responder, sink) = start(config);

        assert_eq!(responder.state(), State::BindFailed);
        assert_eq!(responder.closed().await, State::BindFailed);
        assert_eq!(responder.local_addr(), None);
        assert_eq!(
            sink.messages(),
            vec![format!(
                "*** Could not start the ident server on port {}.",
                addr.port()
            )]
        );
    }

    #[tokio::test]
    async fn test_listener_close_is_idempotent() {
        let bound = bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
        let mut listener = ListenerHandle::new(bound);

        listener.close();
        listener.close();

        assert!(listener.is_closed());
        assert!(matches!(
            listener.accept(DEFAULT_TIMEOUT).await,
            Err(ServeError::ListenerClosed)
        ));
    }
}
