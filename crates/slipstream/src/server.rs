use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::connection::{
    ConnectionCallback, ConnectionStatus, EventWire, SendError, ServerConnection,
    dispatch_with_retries,
};
use crate::event::{Event, EventHandler, EventHandlerRegistry};
use crate::gamestate::GameStateStore;
use crate::protocol::{Body, MAX_PACKAGE_SIZE, Package, PackageError, PackageKind};
use crate::sqn::Sqn;

/// Recipient selector for server-side event dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    /// Broadcast to every known connection.
    All,
    /// Send to one client by address.
    Client(SocketAddr),
}

enum ServerCommand {
    Dispatch {
        event: Event,
        target: EventTarget,
        retries: u32,
        ack_callback: Option<ConnectionCallback>,
    },
}

/// Listens on one UDP socket and routes every datagram to the connection of
/// its source address, creating connections for addresses it has not seen.
///
/// The server carries no game logic itself: state lives in the shared
/// [`GameStateStore`] and is progressed by a
/// [`GameStateMachine`](crate::GameStateMachine), whose event wire can be
/// passed to [`Server::run`] so client events reach the simulation.
///
/// The first client to connect becomes the host and may shut the server
/// down remotely by sending the bare bytes `shutdown`.
pub struct Server {
    connections: HashMap<SocketAddr, ServerConnection>,
    host_client: Option<SocketAddr>,
    game_state_store: Arc<GameStateStore>,
    event_handlers: EventHandlerRegistry<EventHandler>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
    commands: Receiver<ServerCommand>,
    command_sender: Sender<ServerCommand>,
}

impl Server {
    pub fn new(game_state_store: Arc<GameStateStore>) -> Self {
        let (command_sender, commands) = channel();
        Server {
            connections: HashMap::new(),
            host_client: None,
            game_state_store,
            event_handlers: EventHandlerRegistry::new(),
            local_addr: Arc::new(Mutex::new(None)),
            commands,
            command_sender,
        }
    }

    /// Address the server is currently bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("local addr poisoned")
    }

    /// The client holding shutdown permission, if any connected yet.
    pub fn host_client(&self) -> Option<SocketAddr> {
        self.host_client
    }

    pub fn client_addresses(&self) -> Vec<SocketAddr> {
        self.connections.keys().copied().collect()
    }

    /// Clonable handle for controlling a server whose `run` loop owns it.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            commands: self.command_sender.clone(),
            local_addr: Arc::clone(&self.local_addr),
        }
    }

    /// Register a handler for events received from clients.
    pub fn register_event_handler<H>(&mut self, event_type: impl Into<String>, handler: H)
    where
        H: FnMut(&Event) + Send + 'static,
    {
        self.event_handlers.register(event_type, Box::new(handler));
    }

    /// Send an event to one client or all of them. Retries re-dispatch the
    /// event each time it times out; the ack callback receives the
    /// connection that delivered it.
    pub fn dispatch_event(
        &mut self,
        event: Event,
        target: EventTarget,
        retries: u32,
        ack_callback: Option<ConnectionCallback>,
    ) {
        match target {
            EventTarget::All => {
                for connection in self.connections.values_mut() {
                    dispatch_with_retries(
                        &mut connection.conn,
                        event.clone(),
                        retries,
                        ack_callback.clone(),
                    );
                }
            }
            EventTarget::Client(addr) => match self.connections.get_mut(&addr) {
                Some(connection) => {
                    dispatch_with_retries(&mut connection.conn, event, retries, ack_callback);
                }
                None => log::warn!("cannot dispatch event, no connection to {addr}"),
            },
        }
    }

    /// Bind the socket and serve until a shutdown datagram arrives.
    ///
    /// Blocks the calling thread. Each loop iteration drains the socket,
    /// applies queued control commands, hands received events to the
    /// registered handlers and pumps every connection's send cadence,
    /// congestion supervisor and receive timeout.
    pub fn run(
        &mut self,
        port: u16,
        hostname: &str,
        event_wire: Option<EventWire>,
    ) -> io::Result<()> {
        let socket = UdpSocket::bind((hostname, port))?;
        socket.set_nonblocking(true)?;
        let local = reachable_addr(socket.local_addr()?);
        *self.local_addr.lock().expect("local addr poisoned") = Some(local);
        log::info!("server listening for client packages on {local}");
        let mut buf = [0u8; MAX_PACKAGE_SIZE];
        'serve: loop {
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((len, addr)) => {
                        let data = &buf[..len];
                        match Package::from_datagram(data, PackageKind::Client) {
                            Ok(package) => {
                                self.handle_package(package, addr, event_wire.as_ref());
                            }
                            Err(PackageError::ProtocolIdMismatch) => {
                                if data == b"shutdown" && Some(addr) == self.host_client {
                                    log::info!("received shutdown command from host client {addr}");
                                    break 'serve;
                                } else if data == b"shut_me_down" {
                                    break 'serve;
                                }
                                log::warn!("ignoring unidentifiable datagram from {addr}");
                            }
                            Err(err) => {
                                log::warn!("dropping malformed datagram from {addr}: {err}");
                            }
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => return Err(err),
                }
            }
            while let Ok(command) = self.commands.try_recv() {
                let ServerCommand::Dispatch {
                    event,
                    target,
                    retries,
                    ack_callback,
                } = command;
                self.dispatch_event(event, target, retries, ack_callback);
            }
            self.pump_events();
            self.pump_connections(&socket);
            thread::sleep(Duration::from_millis(1));
        }
        log::info!("shutting down server on {local}");
        Ok(())
    }

    /// Run the server on its own thread; joining the handle returns the
    /// server so it can be restarted with its connections intact.
    pub fn run_in_thread(
        mut self,
        port: u16,
        hostname: String,
        event_wire: Option<EventWire>,
    ) -> thread::JoinHandle<io::Result<Server>> {
        thread::spawn(move || {
            self.run(port, &hostname, event_wire)?;
            Ok(self)
        })
    }

    fn handle_package(
        &mut self,
        package: Package,
        addr: SocketAddr,
        event_wire: Option<&EventWire>,
    ) {
        let is_new = !self.connections.contains_key(&addr);
        if is_new {
            log::info!("new client connection from {addr}");
            let time_order = match package.body {
                Body::Client { time_order } => time_order,
                _ => Sqn::NEVER,
            };
            let connection = ServerConnection::new(
                addr,
                Arc::clone(&self.game_state_store),
                time_order,
                event_wire.cloned(),
            );
            self.connections.insert(addr, connection);
            // the first client gets host permissions
            if self.host_client.is_none() {
                log::info!("setting {addr} as client with host permissions");
                self.host_client = Some(addr);
            }
        }
        let connection = self.connections.get_mut(&addr).expect("connection present");
        if !is_new && connection.conn.status() == ConnectionStatus::Disconnected {
            log::info!("client reconnecting from {addr}");
        }
        match connection.recv_package(&package) {
            Ok(fired) => {
                for callback in fired {
                    callback(&mut connection.conn);
                }
            }
            Err(err) => log::debug!("dropping package from {addr}: {err}"),
        }
    }

    fn pump_events(&mut self) {
        for connection in self.connections.values_mut() {
            while let Some(event) = connection.conn.poll_incoming_event() {
                match self.event_handlers.get_mut(&event.event_type) {
                    Some(handler) => handler(&event),
                    None => log::debug!("no handler for event type {}", event.event_type),
                }
            }
        }
    }

    fn pump_connections(&mut self, socket: &UdpSocket) {
        let now = Instant::now();
        for connection in self.connections.values_mut() {
            connection.conn.check_timeout(now);
            connection.conn.pump_throttle(now);
            if connection.conn.send_due(now) {
                let body = connection.next_body();
                match connection.conn.send_next_package(body, socket) {
                    Ok(()) => {}
                    Err(SendError::Io(err)) => log::warn!(
                        "failed to send package to {}: {err}",
                        connection.conn.remote_address
                    ),
                    Err(SendError::Package(err)) => log::warn!(
                        "failed to build package for {}: {err}",
                        connection.conn.remote_address
                    ),
                }
            }
        }
    }
}

/// Clonable remote control for a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    commands: Sender<ServerCommand>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("local addr poisoned")
    }

    /// Queue an event dispatch into the server loop.
    pub fn dispatch_event(
        &self,
        event: Event,
        target: EventTarget,
        retries: u32,
        ack_callback: Option<ConnectionCallback>,
    ) {
        let _ = self.commands.send(ServerCommand::Dispatch {
            event,
            target,
            retries,
            ack_callback,
        });
    }

    /// Unblock and stop the server loop by sending the internal shutdown
    /// bytes to its own socket.
    pub fn shutdown(&self) -> io::Result<()> {
        let addr = self
            .local_addr()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "server is not running"))?;
        let bind_addr: SocketAddr = match addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.send_to(b"shut_me_down", addr)?;
        Ok(())
    }
}

/// Sending to an unspecified address is not portable, so advertise the
/// loopback of the same family instead.
fn reachable_addr(mut addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        match addr {
            SocketAddr::V4(_) => addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            SocketAddr::V6(_) => addr.set_ip(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        }
    }
    addr
}
