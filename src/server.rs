//! TCP server for the packet log.
//!
//! The acceptor spawns one registered task per connection. Each task frames
//! incoming bytes into packets, appends every complete packet to the shared
//! log and answers with the full log contents. Shutdown stops the acceptor,
//! closes and joins every handler and the timestamp task, then removes the
//! data file.

use crate::config::Config;
use crate::connection::{ConnectionGuard, ConnectionRegistry};
use crate::protocol::{PacketAssembler, PacketError};
use crate::shutdown::Shutdown;
use crate::storage::{LogError, SharedLog};
use crate::timestamp::timestamp_task;
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pending-connection backlog handed to listen(2)
const LISTEN_BACKLOG: i32 = 128;

/// Pause before retrying accept when the process is out of descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bind the listening socket.
///
/// Done before the runtime starts so that a bind failure ends the process
/// before it daemonizes.
pub fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Server instance shared by the acceptor, every handler and the timestamp task
pub struct Server {
    config: Config,
    log: Arc<SharedLog>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Shutdown,
    connection_limit: Option<Arc<Semaphore>>,
    timestamp: Mutex<Option<JoinHandle<()>>>,
    torn_down: OnceCell<()>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Arc<Self> {
        let log = SharedLog::new(config.data_file.clone());
        let connection_limit = config
            .max_connections
            .map(|limit| Arc::new(Semaphore::new(limit)));

        Arc::new(Server {
            config,
            log,
            registry: ConnectionRegistry::new(),
            shutdown: Shutdown::new(),
            connection_limit,
            timestamp: Mutex::new(None),
            torn_down: OnceCell::new(),
        })
    }

    #[cfg(test)]
    pub fn log(&self) -> &Arc<SharedLog> {
        &self.log
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Handle for triggering shutdown from elsewhere (signals, tests).
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Accept connections on `listener` until shutdown, then tear down.
    pub async fn run(self: Arc<Self>, listener: std::net::TcpListener) -> io::Result<()> {
        let listener = TcpListener::from_std(listener)?;
        info!(address = %listener.local_addr()?, "Server listening");

        self.start_timestamp_task();
        let result = self.accept_loop(&listener).await;

        drop(listener);
        self.shutdown().await;
        result
    }

    fn start_timestamp_task(&self) {
        let Some(interval) = self.config.timestamp_interval else {
            debug!("Timestamp records disabled");
            return;
        };

        // Teardown triggers before taking this lock, so a task stored here
        // is always seen and joined by it.
        let mut slot = self.timestamp.lock().unwrap_or_else(|p| p.into_inner());
        if self.shutdown.is_triggered() {
            return;
        }

        *slot = Some(tokio::spawn(timestamp_task(
            Arc::clone(&self.log),
            interval,
            self.shutdown.clone(),
        )));
    }

    async fn accept_loop(self: &Arc<Self>, listener: &TcpListener) -> io::Result<()> {
        while !self.shutdown.is_triggered() {
            // Wait for a connection slot
            let permit = match &self.connection_limit {
                Some(limit) => tokio::select! {
                    permit = Arc::clone(limit).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    _ = self.shutdown.wait() => break,
                },
                None => None,
            };

            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.shutdown.wait() => break,
            };

            match accepted {
                Ok((stream, peer)) => self.dispatch(stream, peer, permit),
                Err(e) if is_transient_accept_error(&e) => {
                    debug!(error = %e, "Transient accept failure");
                }
                Err(e) if is_resource_exhaustion(&e) => {
                    warn!(error = %e, "Out of resources accepting connection, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        _ = self.shutdown.wait() => break,
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn dispatch(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let server = Arc::clone(self);
        let spawned = self.registry.spawn(peer, move |guard| async move {
            server.serve(stream, guard).await;
            drop(permit);
        });

        match spawned {
            Some(key) => debug!(key, active = self.registry.len(), "Spawned connection handler"),
            None => debug!(peer = %peer, "Shutting down, dropped new connection"),
        }
    }

    /// Drive one registered connection to completion.
    async fn serve(&self, stream: TcpStream, mut guard: ConnectionGuard) {
        let peer = guard.peer();
        info!(peer = %peer, conn = guard.key(), "Accepted connection from {}", peer.ip());

        let session = Session::new(peer, stream, &self.config);
        match session.run(&self.log, guard.closed()).await {
            Ok(Disconnect::PeerClosed) => debug!(peer = %peer, "Client disconnected"),
            Ok(Disconnect::Closed) => debug!(peer = %peer, "Connection closed for shutdown"),
            Err(e @ HandlerError::Packet(_)) => warn!(peer = %peer, error = %e, "Dropping connection"),
            Err(e) => error!(peer = %peer, error = %e, "Connection error"),
        }

        info!(peer = %peer, "Closed connection from {}", peer.ip());
    }

    /// Stop accepting, join every handler and the timestamp task, and
    /// remove the data file.
    ///
    /// Safe to call more than once and from several tasks: the teardown runs
    /// once and every caller returns after it has completed.
    pub async fn shutdown(&self) {
        if self.shutdown.trigger() {
            info!("Shutdown requested");
        }
        self.torn_down.get_or_init(|| self.teardown()).await;
    }

    async fn teardown(&self) {
        let joined = self.registry.join_all().await;
        debug!(joined, "Joined connection handlers");

        let timestamp = self
            .timestamp
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = timestamp {
            if let Err(e) = handle.await {
                warn!(error = %e, "Timestamp task failed");
            }
        }

        // Failures are already logged by the log itself.
        if let Ok(removed) = self.log.remove() {
            debug!(removed, "Cleaned up data file");
        }
        info!(data_file = %self.log.path().display(), "Server shutdown complete");
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::TimedOut
    )
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// The peer closed its side.
    PeerClosed,
    /// The registry closed the connection during shutdown.
    Closed,
}

/// Failures that end one connection.
#[derive(Debug)]
pub enum HandlerError {
    Recv(io::Error),
    Send(io::Error),
    Packet(PacketError),
    Log(LogError),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Recv(e) => write!(f, "error receiving data: {e}"),
            HandlerError::Send(e) => write!(f, "error sending data: {e}"),
            HandlerError::Packet(e) => write!(f, "{e}"),
            HandlerError::Log(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<PacketError> for HandlerError {
    fn from(e: PacketError) -> Self {
        HandlerError::Packet(e)
    }
}

/// One client connection: peer, socket and the packet in progress.
pub struct Session<S> {
    peer: SocketAddr,
    stream: S,
    assembler: PacketAssembler,
    read_buf: Vec<u8>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(peer: SocketAddr, stream: S, config: &Config) -> Self {
        Session {
            peer,
            stream,
            assembler: PacketAssembler::new(config.initial_capacity, config.max_packet_size),
            read_buf: vec![0; config.read_size],
        }
    }

    /// Read, frame, append and reply until the peer leaves, an error ends
    /// the connection, or `close` resolves.
    ///
    /// Every complete packet gets exactly one append; only a successful
    /// append is answered, with a snapshot of the log taken right after it.
    /// A failed append drops that packet and keeps the connection open.
    pub async fn run<C>(mut self, log: &Arc<SharedLog>, close: C) -> Result<Disconnect, HandlerError>
    where
        C: Future<Output = ()>,
    {
        tokio::pin!(close);

        loop {
            let n = tokio::select! {
                read = self.stream.read(&mut self.read_buf) => match read {
                    Ok(0) => return Ok(Disconnect::PeerClosed),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(HandlerError::Recv(e)),
                },
                _ = &mut close => return Ok(Disconnect::Closed),
            };

            let mut input = &self.read_buf[..n];
            while !input.is_empty() {
                let Some(packet) = self.assembler.feed(&mut input)? else {
                    continue;
                };

                if let Err(e) = log.append_async(packet).await {
                    error!(peer = %self.peer, error = %e, "Failed to write packet, dropping it");
                    continue;
                }

                let reply = log.snapshot_async().await.map_err(HandlerError::Log)?;
                tokio::select! {
                    sent = self.stream.write_all(&reply) => sent.map_err(HandlerError::Send)?,
                    _ = &mut close => return Ok(Disconnect::Closed),
                }
            }
        }
    }
}
