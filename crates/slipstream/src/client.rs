use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::ops::Deref;
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::connection::{
    ClientConnection, Connection, ConnectionCallback, ConnectionStatus, SendError,
    dispatch_with_retries,
};
use crate::event::{Event, EventHandler, EventHandlerRegistry};
use crate::gamestate::GameState;
use crate::protocol::{MAX_PACKAGE_SIZE, Package, PackageKind};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("condition was not met within {0:?}")]
pub struct WaitTimeoutError(pub Duration);

enum ClientCommand {
    Dispatch {
        event: Event,
        retries: u32,
        ack_callback: Option<ConnectionCallback>,
    },
    Shutdown {
        shutdown_server: bool,
    },
}

struct Session {
    commands: Sender<ClientCommand>,
    thread: thread::JoinHandle<()>,
}

/// A client that connects a local game state mirror to a remote server.
///
/// `connect` spawns the connection loop on a background thread; from then on
/// the mirror is continuously synchronized with the server's state and can
/// be read through [`Client::access_game_state`]. Events go out with
/// [`Client::dispatch_event`] and come in through handlers registered with
/// [`Client::register_event_handler`].
pub struct Client {
    game_state: Arc<Mutex<GameState>>,
    event_handlers: Arc<Mutex<EventHandlerRegistry<EventHandler>>>,
    session: Option<Session>,
}

impl Default for Client {
    fn default() -> Self {
        Client::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Client {
            game_state: Arc::new(Mutex::new(GameState::new())),
            event_handlers: Arc::new(Mutex::new(EventHandlerRegistry::new())),
            session: None,
        }
    }

    /// Open a socket and start the connection loop against the server.
    pub fn connect(&mut self, hostname: &str, port: u16) -> io::Result<()> {
        if self.session.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "client is already connected",
            ));
        }
        let remote = (hostname, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::AddrNotAvailable, "hostname did not resolve")
            })?;
        let socket = match remote {
            SocketAddr::V4(_) => UdpSocket::bind("0.0.0.0:0")?,
            SocketAddr::V6(_) => UdpSocket::bind("[::]:0")?,
        };
        socket.set_nonblocking(true)?;
        let connection = ClientConnection {
            conn: Connection::new(remote, None),
            game_state: Arc::clone(&self.game_state),
        };
        let handlers = Arc::clone(&self.event_handlers);
        let (commands, command_queue) = channel();
        let thread = thread::spawn(move || {
            connection_loop(connection, socket, command_queue, handlers);
        });
        self.session = Some(Session { commands, thread });
        Ok(())
    }

    /// Close the connection and join the loop thread. With `shutdown_server`
    /// the server is asked to terminate first, which only has an effect if
    /// this client holds host permissions.
    pub fn disconnect(&mut self, shutdown_server: bool) {
        if let Some(session) = self.session.take() {
            let _ = session.commands.send(ClientCommand::Shutdown { shutdown_server });
            let _ = session.thread.join();
        }
    }

    /// Whether the connection loop is still alive. The loop ends on
    /// disconnect and when the server goes silent past the connection
    /// timeout.
    pub fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| !session.thread.is_finished())
    }

    /// Scoped access to the local game state mirror. The mirror stays
    /// locked, and the connection loop blocked from applying server
    /// updates, for as long as the returned guard lives.
    pub fn access_game_state(&self) -> GameStateAccess<'_> {
        GameStateAccess(self.game_state.lock().expect("game state mirror poisoned"))
    }

    /// Block until `predicate` holds on the mirror, checking at millisecond
    /// granularity.
    pub fn wait_until(
        &self,
        predicate: impl Fn(&GameState) -> bool,
        timeout: Duration,
    ) -> Result<(), WaitTimeoutError> {
        let t0 = Instant::now();
        loop {
            if predicate(&self.access_game_state()) {
                return Ok(());
            }
            if t0.elapsed() > timeout {
                return Err(WaitTimeoutError(timeout));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Keep applying `accessor` to the mirror until it produces a value,
    /// for example until a player entry shows up in the state.
    pub fn try_to<T>(
        &self,
        accessor: impl Fn(&GameState) -> Option<T>,
        timeout: Duration,
    ) -> Result<T, WaitTimeoutError> {
        let t0 = Instant::now();
        loop {
            if let Some(value) = accessor(&self.access_game_state()) {
                return Ok(value);
            }
            if t0.elapsed() > timeout {
                return Err(WaitTimeoutError(timeout));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Queue an event for the server, with `retries` automatic re-dispatches
    /// on timeout and an optional ack callback.
    pub fn dispatch_event(
        &self,
        event: Event,
        retries: u32,
        ack_callback: Option<ConnectionCallback>,
    ) {
        match &self.session {
            Some(session) => {
                let _ = session.commands.send(ClientCommand::Dispatch {
                    event,
                    retries,
                    ack_callback,
                });
            }
            None => log::warn!("cannot dispatch event, client is not connected"),
        }
    }

    /// Register a handler for events received from the server. Events
    /// without a handler are discarded.
    pub fn register_event_handler<H>(&self, event_type: impl Into<String>, handler: H)
    where
        H: FnMut(&Event) + Send + 'static,
    {
        self.event_handlers
            .lock()
            .expect("event handler registry poisoned")
            .register(event_type, Box::new(handler));
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect(false);
    }
}

/// Guard returned by [`Client::access_game_state`]; dereferences to the
/// mirrored [`GameState`].
pub struct GameStateAccess<'a>(MutexGuard<'a, GameState>);

impl Deref for GameStateAccess<'_> {
    type Target = GameState;

    fn deref(&self) -> &GameState {
        &self.0
    }
}

/// The client-side connection loop: receive and apply server packages,
/// dispatch incoming events, pump the send cadence and congestion
/// supervisor, and watch the command queue for shutdown.
fn connection_loop(
    mut connection: ClientConnection,
    socket: UdpSocket,
    commands: Receiver<ClientCommand>,
    handlers: Arc<Mutex<EventHandlerRegistry<EventHandler>>>,
) {
    let remote = connection.conn.remote_address;
    log::info!("trying to connect to server at {remote}");
    connection.conn.set_status(ConnectionStatus::Connecting);
    let mut buf = [0u8; MAX_PACKAGE_SIZE];
    'serve: loop {
        loop {
            match commands.try_recv() {
                Ok(ClientCommand::Shutdown { shutdown_server }) => {
                    if shutdown_server {
                        log::info!("sending shutdown command to server at {remote}");
                        let _ = socket.send_to(b"shutdown", remote);
                    }
                    break 'serve;
                }
                Ok(ClientCommand::Dispatch {
                    event,
                    retries,
                    ack_callback,
                }) => {
                    dispatch_with_retries(&mut connection.conn, event, retries, ack_callback);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'serve,
            }
        }
        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, addr)) => {
                    if addr != remote {
                        continue;
                    }
                    match Package::from_datagram(&buf[..len], PackageKind::Server) {
                        Ok(package) => match connection.recv_package(&package) {
                            Ok(fired) => {
                                for callback in fired {
                                    callback(&mut connection.conn);
                                }
                            }
                            Err(err) => log::debug!("dropping package from server: {err}"),
                        },
                        Err(err) => log::warn!("dropping malformed datagram from {addr}: {err}"),
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    // on some platforms an ICMP rejection surfaces here
                    log::debug!("socket receive failed: {err}");
                    break;
                }
            }
        }
        {
            let mut handlers = handlers.lock().expect("event handler registry poisoned");
            while let Some(event) = connection.conn.poll_incoming_event() {
                match handlers.get_mut(&event.event_type) {
                    Some(handler) => handler(&event),
                    None => log::debug!("no handler for event type {}", event.event_type),
                }
            }
        }
        let now = Instant::now();
        connection.conn.check_timeout(now);
        if connection.conn.status() == ConnectionStatus::Disconnected {
            break 'serve;
        }
        connection.conn.pump_throttle(now);
        if connection.conn.send_due(now) {
            let body = connection.next_body();
            match connection.conn.send_next_package(body, &socket) {
                Ok(()) => {}
                Err(SendError::Io(err)) => log::debug!("failed to send package: {err}"),
                Err(SendError::Package(err)) => log::warn!("failed to build package: {err}"),
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
    connection.conn.set_status(ConnectionStatus::Disconnected);
    log::info!("connection loop to {remote} ended");
}
