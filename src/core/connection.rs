use crate::config::Credentials;
use crate::core::metrics::{AtomicServerMetrics, ServerMetrics};
use crate::core::protocol::{self, ProtocolError, Request, Response, Status, HEADER_LEN};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

const PLAIN_MECHANISM: &[u8] = b"PLAIN";

/// Host and port of one cache server
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for ServerAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| "expected host:port".to_string())?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err("empty host".to_string());
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port '{}': {}", port, e))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Socket timeouts applied by a [`Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    /// `None` waits for a response indefinitely
    pub socket_timeout: Option<Duration>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            socket_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connected,
    Authenticated,
    Broken,
    Closed,
}

/// A single channel to one cache server
///
/// Strictly request/response: at most one request is in flight. Any I/O
/// failure, timeout or malformed response moves the connection to
/// [`ConnectionState::Broken`], after which it can only be closed.
#[derive(Debug)]
pub struct Connection {
    address: ServerAddress,
    settings: ConnectionSettings,
    stream: Option<TcpStream>,
    state: ConnectionState,
    next_opaque: u32,
    /// Opaque id of the in-flight request
    pending: Option<u32>,
    generation: u64,
    metrics: Option<Arc<AtomicServerMetrics>>,
}

impl Connection {
    pub fn new(address: ServerAddress, settings: ConnectionSettings) -> Self {
        Self {
            address,
            settings,
            stream: None,
            state: ConnectionState::New,
            next_opaque: 0,
            pending: None,
            generation: 0,
            metrics: None,
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Authenticated
    }

    pub fn is_broken(&self) -> bool {
        self.state == ConnectionState::Broken
    }

    /// True while a request has been sent without its response being read
    pub fn has_pending_request(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether the pool may lend this connection again
    pub fn is_reusable(&self) -> bool {
        self.is_authenticated() && !self.has_pending_request()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Report this connection's closure to `metrics` once it is released
    pub(crate) fn attach_metrics(&mut self, metrics: Arc<AtomicServerMetrics>) {
        self.metrics = Some(metrics);
    }

    /// Open the socket
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::New {
            return Err(ConnectionError::InvalidState(self.state));
        }

        let target = (self.address.host.as_str(), self.address.port);
        let connect = TcpStream::connect(target);
        let stream = match tokio::time::timeout(self.settings.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state = ConnectionState::Broken;
                return Err(ConnectionError::ConnectionFailed(format!(
                    "{}: {}",
                    self.address, e
                )));
            }
            Err(_) => {
                self.state = ConnectionState::Broken;
                return Err(ConnectionError::ConnectionFailed(format!(
                    "Connection to {} timed out after {:?}",
                    self.address, self.settings.connect_timeout
                )));
            }
        };

        optimize_socket_for_latency(&stream);
        self.stream = Some(stream);
        self.state = ConnectionState::Connected;
        debug!("Connected to {}", self.address);
        Ok(())
    }

    /// Complete the handshake
    ///
    /// Without credentials the handshake is trivially complete. With
    /// credentials the server is asked for its SASL mechanisms first; a server
    /// that does not know the command does not require authentication.
    pub async fn authenticate(
        &mut self,
        credentials: Option<&Credentials>,
    ) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Authenticated => return Ok(()),
            ConnectionState::Connected => {}
            state => return Err(ConnectionError::InvalidState(state)),
        }

        let Some(credentials) = credentials else {
            self.state = ConnectionState::Authenticated;
            return Ok(());
        };

        let mechanisms = self.round_trip(Request::sasl_list_mechs()).await?;
        match mechanisms.status {
            Status::Success => {}
            Status::UnknownCommand => {
                debug!("{} does not require authentication", self.address);
                self.state = ConnectionState::Authenticated;
                return Ok(());
            }
            other => {
                return Err(ConnectionError::AuthenticationFailed(format!(
                    "mechanism negotiation failed: {}",
                    other
                )))
            }
        }

        let offers_plain = mechanisms
            .value
            .split(|b| *b == b' ')
            .any(|mechanism| mechanism == PLAIN_MECHANISM);
        if !offers_plain {
            return Err(ConnectionError::AuthenticationFailed(format!(
                "server offers no supported mechanism ({})",
                String::from_utf8_lossy(&mechanisms.value)
            )));
        }

        let payload = plain_payload(credentials);
        let response = self
            .round_trip(Request::sasl_auth(PLAIN_MECHANISM, &payload))
            .await?;
        match response.status {
            Status::Success => {
                debug!("Authenticated to {} as {}", self.address, credentials.username);
                self.state = ConnectionState::Authenticated;
                Ok(())
            }
            Status::AuthError => Err(ConnectionError::AuthenticationFailed(format!(
                "credentials for '{}' rejected",
                credentials.username
            ))),
            other => Err(ConnectionError::AuthenticationFailed(format!(
                "unexpected status {}",
                other
            ))),
        }
    }

    /// Send one request and wait for its response
    pub async fn send_command(&mut self, request: Request) -> Result<Response, ConnectionError> {
        if self.state != ConnectionState::Authenticated {
            return Err(ConnectionError::InvalidState(self.state));
        }
        self.round_trip(request).await
    }

    /// Release the socket. Safe to call more than once.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closed connection to {}", self.address);
            if let Some(metrics) = self.metrics.take() {
                metrics.record_connection_closed();
            }
        }
        self.pending = None;
        self.state = ConnectionState::Closed;
    }

    async fn round_trip(&mut self, mut request: Request) -> Result<Response, ConnectionError> {
        if self.pending.is_some() {
            // A previous request was abandoned mid-flight; framing can't be trusted
            self.state = ConnectionState::Broken;
            return Err(ConnectionError::InvalidState(self.state));
        }

        self.next_opaque = self.next_opaque.wrapping_add(1);
        let opaque = self.next_opaque;
        request.opaque = opaque;
        let frame = protocol::encode_request(&request);

        self.pending = Some(opaque);
        let result = match self.settings.socket_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.exchange(&frame)).await {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Timeout(limit)),
            },
            None => self.exchange(&frame).await,
        };

        let result = result.and_then(|response| {
            if response.opaque != opaque {
                Err(ConnectionError::Protocol(ProtocolError::Malformed(format!(
                    "response opaque {} does not match request {}",
                    response.opaque, opaque
                ))))
            } else {
                Ok(response)
            }
        });

        match result {
            Ok(response) => {
                self.pending = None;
                debug!(
                    "{:?} on {} -> {}",
                    request.opcode, self.address, response.status
                );
                Ok(response)
            }
            Err(e) => {
                warn!("Connection to {} broken: {}", self.address, e);
                self.state = ConnectionState::Broken;
                Err(e)
            }
        }
    }

    async fn exchange(&mut self, frame: &[u8]) -> Result<Response, ConnectionError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(ConnectionError::InvalidState(self.state))?;

        stream.write_all(frame).await.map_err(io_error)?;
        stream.flush().await.map_err(io_error)?;

        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).await.map_err(io_error)?;
        let parsed = protocol::decode_header(&header)?;

        let mut buf = Vec::with_capacity(parsed.frame_len());
        buf.extend_from_slice(&header);
        buf.resize(parsed.frame_len(), 0);
        stream
            .read_exact(&mut buf[HEADER_LEN..])
            .await
            .map_err(io_error)?;

        Ok(protocol::decode_response(&buf)?)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn plain_payload(credentials: &Credentials) -> Vec<u8> {
    let mut payload =
        Vec::with_capacity(2 + credentials.username.len() + credentials.password.len());
    payload.push(0);
    payload.extend_from_slice(credentials.username.as_bytes());
    payload.push(0);
    payload.extend_from_slice(credentials.password.as_bytes());
    payload
}

fn io_error(e: std::io::Error) -> ConnectionError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ConnectionError::ConnectionFailed("connection closed by peer".to_string())
    } else {
        ConnectionError::ConnectionFailed(e.to_string())
    }
}

/// Optimize TCP socket for low latency
fn optimize_socket_for_latency(stream: &TcpStream) {
    // Disable Nagle's algorithm: every request is a small write awaiting a reply
    let _ = stream.set_nodelay(true);

    let socket_ref = socket2::SockRef::from(stream);
    // 32KB buffers balance latency vs throughput for cache operations
    let _ = socket_ref.set_send_buffer_size(32768);
    let _ = socket_ref.set_recv_buffer_size(32768);
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Connection is not usable in state {0:?}")]
    InvalidState(ConnectionState),
}
