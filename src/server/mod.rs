use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use compact_str::CompactString;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};

use crate::handler::{EchoResponder, Responder};
use crate::Config;

mod conn;
mod table;

use self::table::{Core, Event};


/// Identifies a connection for the lifetime of a [`Server`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

impl ConnId {
    #[inline]
    #[must_use]
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}


/// The lifecycle state of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[derive(strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum State {
    /// Not listening. The initial and the final state.
    #[default]
    Idle,
    /// Creating the listening socket.
    Starting,
    /// Accepting and serving connections.
    Running,
    /// Closing all connections and the listening socket.
    Stopping,
}


/// Errors that change the [`State`] of a [`Server`].
///
/// Failures of individual connections are never reported here.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The configured address is not an IPv4 address in dotted-quad notation.
    #[error("invalid IPv4 listening address {0:?}")]
    InvalidAddress(CompactString),

    /// The listening socket could not be created.
    #[error("unable to create TCP socket: {0}")]
    Socket(#[source] Arc<io::Error>),

    /// A socket option could not be set.
    #[error("unable to set socket option: {0}")]
    SocketOption(#[source] Arc<io::Error>),

    /// Binding to the configured address failed.
    #[error("unable to bind to {addr}: {source}")]
    Bind {
        /// The address that was requested.
        addr: SocketAddr,
        /// The underlying error.
        source: Arc<io::Error>,
    },

    /// The bound socket could not be switched to listening mode.
    #[error("unable to listen on {addr}: {source}")]
    Listen {
        /// The address the socket is bound to.
        addr: SocketAddr,
        /// The underlying error.
        source: Arc<io::Error>,
    },

    /// [`Server::start`] was called while the server was running.
    #[error("server is already started")]
    AlreadyStarted,

    /// The event loop panicked.
    #[error("server event loop panicked")]
    Paniced,
}


/// A snapshot of a running server's connection table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Stats {
    /// Connections whose request is still being framed.
    pub framing: usize,
    /// Connections with an active response handler.
    pub handling: usize,
    /// Connections accepted since the last start.
    pub accepted: u64,
}


/// State observable from outside of the event loop.
#[derive(Debug)]
struct Shared {
    state: watch::Sender<State>,
    stats: watch::Sender<Stats>,
    last_error: Mutex<Option<Error>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: watch::channel(State::Idle).0,
            stats: watch::channel(Stats::default()).0,
            last_error: Mutex::new(None),
        }
    }

    fn state(&self) -> State {
        *self.state.borrow()
    }

    fn set_state(&self, new: State) {
        self.state.send_if_modified(|state| {
            if *state == new {
                return false;
            }
            tracing::info!(from = %state, to = %new, "server state changed");
            *state = new;
            true
        });
    }

    fn set_stats(&self, new: Stats) {
        self.stats.send_if_modified(|stats| std::mem::replace(stats, new) != new);
    }

    fn last_error(&self) -> Option<Error> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_error(&self, error: Option<Error>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Records a fatal error. The caller is responsible for the shutdown.
    fn fail(&self, e: Error) {
        let error: &dyn std::error::Error = &e;
        tracing::error!(error, "server failed");
        self.set_error(Some(e));
    }
}


#[derive(Debug)]
struct Running {
    local_addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}


/// An SCGI server listening on a single IPv4 address.
///
/// Each accepted connection carries exactly one request. Its bytes are
/// framed into a [`Message`](crate::Message), which is passed to the
/// server's [`Responder`]. The response is written back and the connection
/// is closed. Malformed or incomplete requests close the connection without
/// any response.
///
/// A [`Server`] moves through the [`State`]s `Idle`, `Starting`, `Running`
/// and `Stopping`. Errors that stop it (such as a failed bind) are kept and
/// can be retrieved with [`Server::last_error`]. A stopped server can be
/// started again.
pub struct Server {
    config: Config,
    responder: Arc<dyn Responder>,
    shared: Arc<Shared>,
    running: Option<Running>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("shared", &self.shared)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Creates an idle [`Server`] answering every request with an
    /// [`EchoResponder`].
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_responder(config, EchoResponder)
    }

    /// Creates an idle [`Server`] answering requests with `responder`.
    #[must_use]
    pub fn with_responder(config: Config, responder: impl Responder) -> Self {
        Self { config, responder: Arc::new(responder), shared: Arc::new(Shared::new()), running: None }
    }

    /// Returns the configuration of this server.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the current [`State`].
    #[inline]
    #[must_use]
    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// Returns a receiver that is notified of every [`State`] change.
    #[inline]
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.shared.state.subscribe()
    }

    /// Returns the error that stopped the server most recently, if any.
    ///
    /// The error is kept until the next call to [`Server::start`].
    #[inline]
    #[must_use]
    pub fn last_error(&self) -> Option<Error> {
        self.shared.last_error()
    }

    /// Returns the address the server is listening on, while it is running.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().filter(|r| !r.task.is_finished()).map(|r| r.local_addr)
    }

    /// Returns a snapshot of the connection table.
    #[inline]
    #[must_use]
    pub fn stats(&self) -> Stats {
        *self.shared.stats.borrow()
    }

    /// Binds the listening socket and starts serving connections.
    ///
    /// On success, the server is [`State::Running`] and the bound address is
    /// returned. On failure, it is back in [`State::Idle`] with the error
    /// also stored for [`Server::last_error`]; no socket remains open.
    ///
    /// # Errors
    /// Returns [`Error::AlreadyStarted`] if the server is running, or the
    /// reason why listening failed.
    ///
    /// # Panics
    /// Panics if called outside of a tokio runtime.
    pub fn start(&mut self) -> Result<SocketAddr, Error> {
        if self.local_addr().is_some() {
            return Err(Error::AlreadyStarted);
        }
        self.running = None;
        self.shared.set_error(None);
        self.shared.set_state(State::Starting);

        let (listener, local_addr) = match self.listen() {
            Ok(l) => l,
            Err(e) => {
                self.shared.fail(e.clone());
                self.shared.set_state(State::Idle);
                return Err(e);
            },
        };
        tracing::info!(protocol = "tcp", local = %local_addr, "server listening");

        let (tx, events) = mpsc::unbounded_channel();
        let core = Core::new(&self.config, self.responder.clone(), tx);
        let (stop, stopped) = oneshot::channel();
        let shared = self.shared.clone();
        shared.set_stats(Stats::default());
        // Published before the event loop can publish anything itself
        shared.set_state(State::Running);
        let task = tokio::spawn(serve(Acceptor::new(listener), core, events, stopped, shared));

        self.running = Some(Running { local_addr, stop, task });
        Ok(local_addr)
    }

    fn listen(&self) -> Result<(TcpListener, SocketAddr), Error> {
        let ip: Ipv4Addr = self.config.address.parse()
            .map_err(|_| Error::InvalidAddress(self.config.address.clone()))?;
        let addr = SocketAddr::from((ip, self.config.port));

        let socket = TcpSocket::new_v4().map_err(|e| Error::Socket(Arc::new(e)))?;
        if self.config.reuse_address {
            socket.set_reuseaddr(true).map_err(|e| Error::SocketOption(Arc::new(e)))?;
        }
        socket.bind(addr).map_err(|e| Error::Bind { addr, source: Arc::new(e) })?;
        let listener = socket.listen(self.config.backlog)
            .map_err(|e| Error::Listen { addr, source: Arc::new(e) })?;
        let local_addr = listener.local_addr()
            .map_err(|e| Error::Listen { addr, source: Arc::new(e) })?;
        Ok((listener, local_addr))
    }

    /// Stops accepting connections and closes all open ones, including those
    /// with a response in flight. Returns once the server is idle.
    ///
    /// Does nothing if the server is not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        if self.state() == State::Running {
            self.shared.set_state(State::Stopping);
        }
        if running.stop.send(()).is_err() {
            tracing::debug!("event loop already exited");
        }

        if let Err(e) = running.task.await {
            if e.is_panic() {
                self.shared.fail(Error::Paniced);
            }
        }
        self.shared.set_state(State::Idle);
    }
}


/// The event loop of a running server. It owns the listener and the
/// connection table until it is told to stop.
///
/// Failing to accept a connection never stops the server.
async fn serve(
    mut acceptor: Acceptor,
    mut core: Core<tokio::net::tcp::OwnedWriteHalf>,
    mut events: mpsc::UnboundedReceiver<Event>,
    mut stop: oneshot::Receiver<()>,
    shared: Arc<Shared>,
) {
    loop {
        tokio::select! {
            // Also fires if the Server was dropped
            _ = &mut stop => break,
            Some(event) = events.recv() => core.handle(event),
            accepted = acceptor.accept() => match accepted {
                Ok((stream, peer)) => {
                    let (input, output) = stream.into_split();
                    let id = core.accept(input, output);
                    tracing::debug!(conn = %id, %peer, "connection accepted");
                },
                Err(e) => acceptor.failed(e),
            },
        }
        shared.set_stats(core.stats());
    }

    core.shutdown();
    drop(acceptor);
    shared.set_stats(core.stats());
    shared.set_state(State::Idle);
}


/// How long accepting pauses after an error that is not specific to the
/// connection being accepted, such as running out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The listening socket, which pauses for [`ACCEPT_BACKOFF`] after errors
/// that would likely repeat immediately.
#[derive(Debug)]
struct Acceptor {
    listener: TcpListener,
    pause: Pin<Box<Sleep>>,
    paused: bool,
}

impl Acceptor {
    fn new(listener: TcpListener) -> Self {
        Self { listener, pause: Box::pin(tokio::time::sleep(Duration::ZERO)), paused: false }
    }

    /// Accepts the next connection once a pending pause has elapsed.
    /// Cancel-safe.
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        if self.paused {
            self.pause.as_mut().await;
            self.paused = false;
        }
        self.listener.accept().await
    }

    /// Logs a failed accept and pauses accepting unless the error only
    /// concerned the connection being accepted.
    fn failed(&mut self, e: io::Error) {
        let error: &dyn std::error::Error = &e;
        if is_transient(&e) {
            tracing::info!(error, "accept failed");
            return;
        }
        tracing::error!(error, backoff = ?ACCEPT_BACKOFF, "accept failed, pausing");
        self.pause.as_mut().reset(Instant::now() + ACCEPT_BACKOFF);
        self.paused = true;
    }
}

/// Tests whether an accept error concerns only the connection being accepted.
fn is_transient(e: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(
        e.kind(),
        ConnectionAborted | ConnectionRefused | ConnectionReset | Interrupted | TimedOut | WouldBlock
    )
}
