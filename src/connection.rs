//! Transport lifecycle and the bounded reconnect policy.
//!
//! The manager only opens streams and tracks state. Reading and writing the
//! stream is the event loop's business, and a finished reconnect is reported
//! back to it as an event rather than through a callback.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{ConnectError, ConnectionError};

/// Any duplex byte stream the client can talk MessagePack-RPC over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + 'static> Transport for T {}

pub type BoxedStream = Box<dyn Transport>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Unix(PathBuf),
    Tcp(String),
}

impl Address {
    /// `unix:/path`, `tcp:host:port`, bare `host:port`, or a bare socket path.
    pub fn parse(s: &str) -> Result<Address, ConnectError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConnectError::InvalidAddress(s.to_string()));
        }
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() { return Err(ConnectError::InvalidAddress(s.to_string())); }
            return Ok(Address::Unix(PathBuf::from(path)));
        }
        if let Some(hp) = s.strip_prefix("tcp:") {
            return parse_host_port(hp).ok_or_else(|| ConnectError::InvalidAddress(s.to_string()));
        }
        if !s.contains('/') && !s.contains('\\') {
            if let Some(addr) = parse_host_port(s) { return Ok(addr); }
        }
        Ok(Address::Unix(PathBuf::from(s)))
    }
}

fn parse_host_port(s: &str) -> Option<Address> {
    let (host, port) = s.rsplit_once(':')?;
    if host.is_empty() || port.parse::<u16>().is_err() { return None; }
    Some(Address::Tcp(s.to_string()))
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Unix(p) => write!(f, "unix:{}", p.display()),
            Address::Tcp(hp) => write!(f, "tcp:{hp}"),
        }
    }
}

/// Opens transports. Cloned into the background reconnect task.
pub trait Connector: Clone + 'static {
    fn connect(&self, address: &Address) -> impl Future<Output = Result<BoxedStream, ConnectError>>;
}

/// Real sockets: unix domain sockets where available, TCP otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketConnector;

impl Connector for SocketConnector {
    async fn connect(&self, address: &Address) -> Result<BoxedStream, ConnectError> {
        let io_err = |source| ConnectError::Io { address: address.to_string(), source };
        match address {
            #[cfg(unix)]
            Address::Unix(path) => {
                let s = tokio::net::UnixStream::connect(path).await.map_err(io_err)?;
                Ok(Box::new(s))
            }
            #[cfg(not(unix))]
            Address::Unix(_) => Err(ConnectError::Unsupported),
            Address::Tcp(hp) => {
                let s = tokio::net::TcpStream::connect(hp.as_str()).await.map_err(io_err)?;
                s.set_nodelay(true).map_err(io_err)?;
                Ok(Box::new(s))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, base_delay: Duration::from_millis(1000) }
    }
}

impl ReconnectPolicy {
    /// Linear backoff: the n-th attempt waits n × base.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

pub struct ConnectionManager<C> {
    connector: C,
    address: Address,
    policy: ReconnectPolicy,
    state: ConnectionState,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, address: Address, policy: ReconnectPolicy) -> Self {
        Self { connector, address, policy, state: ConnectionState::Disconnected }
    }

    pub fn state(&self) -> ConnectionState { self.state }
    pub fn address(&self) -> &Address { &self.address }
    pub fn policy(&self) -> ReconnectPolicy { self.policy }

    pub async fn connect(&mut self) -> Result<BoxedStream, ConnectError> {
        self.state = ConnectionState::Connecting;
        log::info!("connecting to {}", self.address);
        match self.connector.connect(&self.address).await {
            Ok(s) => {
                self.state = ConnectionState::Connected;
                log::info!("connected to {}", self.address);
                Ok(s)
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                log::warn!("connect failed: {e}");
                Err(e)
            }
        }
    }

    /// The transport closed or errored underneath us.
    pub fn on_lost(&mut self) {
        if self.state == ConnectionState::Connected {
            log::warn!("connection to {} lost", self.address);
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Detached future running the whole reconnect policy. `progress` is
    /// called with the attempt number before each attempt.
    pub fn begin_reconnect(
        &mut self,
        progress: impl FnMut(u32) + 'static,
    ) -> impl Future<Output = Result<BoxedStream, ConnectionError>> + 'static {
        self.state = ConnectionState::Connecting;
        let connector = self.connector.clone();
        let address = self.address.clone();
        let policy = self.policy;
        async move { reconnect(&connector, &address, policy, progress).await }
    }

    /// Record the result of a reconnect started with `begin_reconnect`.
    pub fn finish_reconnect(&mut self, succeeded: bool) {
        self.state = if succeeded { ConnectionState::Connected } else { ConnectionState::Disconnected };
    }
}

/// Try up to `policy.max_attempts` times, sleeping `delay_for(n)` before
/// attempt `n`. Gives up with the last connect error.
pub async fn reconnect<C: Connector>(
    connector: &C,
    address: &Address,
    policy: ReconnectPolicy,
    mut progress: impl FnMut(u32),
) -> Result<BoxedStream, ConnectionError> {
    let mut last = ConnectError::InvalidAddress(address.to_string());
    for attempt in 1..=policy.max_attempts {
        progress(attempt);
        tokio::time::sleep(policy.delay_for(attempt)).await;
        log::info!("reconnect attempt {}/{} to {}", attempt, policy.max_attempts, address);
        match connector.connect(address).await {
            Ok(s) => {
                log::info!("reconnected on attempt {attempt}");
                return Ok(s);
            }
            Err(e) => {
                log::warn!("reconnect attempt {attempt} failed: {e}");
                last = e;
            }
        }
    }
    Err(ConnectionError::Exhausted { attempts: policy.max_attempts, last })
}
