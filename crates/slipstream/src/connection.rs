use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::event::Event;
use crate::gamestate::{GameState, GameStateStore, GameStateUpdate};
use crate::protocol::{
    AckBitfield, Body, Header, MAX_PACKAGE_SIZE, PACKAGE_TIMEOUT, Package, PackageError,
};
use crate::sqn::Sqn;

/// Seconds without receiving anything before a connection is dropped.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

const GOOD_SEND_INTERVAL: Duration = Duration::from_millis(25);
const BAD_SEND_INTERVAL: Duration = Duration::from_millis(50);
const LATENCY_THRESHOLD: f64 = 0.25;
const MIN_THROTTLE_TIME: f64 = 1.0;
const MAX_THROTTLE_TIME: f64 = 60.0;
const MAX_EVENTS_PER_PACKAGE: usize = 5;

/// Channel onto which received events are repeated, usually the input queue
/// of the simulation loop.
pub type EventWire = Sender<Event>;

/// Callback attached to a dispatched event, fired at most once when the
/// carrying package is acked or times out.
pub type EventCallback = Box<dyn FnOnce(&mut Connection) + Send>;

/// Reusable callback shape for [`dispatch_with_retries`]: the ack callback
/// survives across retries, so it is shared rather than consumed.
pub type ConnectionCallback = Arc<dyn Fn(&mut Connection) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionQuality {
    Good,
    Bad,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReceiveError {
    #[error("sequence {0} was already received")]
    DuplicateSequence(Sqn),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Package(#[from] PackageError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

enum SequenceJudgement {
    Fresh,
    Duplicate,
    OutOfWindow,
}

enum CallbackKind {
    Ack,
    Timeout,
}

struct CallbackPair {
    ack: Option<EventCallback>,
    timeout: Option<EventCallback>,
}

/// Reliability core of one peer-to-peer link.
///
/// Tracks sequence numbers in both directions, resolves selective acks into
/// latency samples and event callbacks, queues events in and out, and
/// throttles the send cadence when the link degrades. All methods are driven
/// by a single owner; the send and congestion "loops" are pumped by calling
/// [`Connection::send_due`] and [`Connection::pump_throttle`] from the
/// owning loop.
pub struct Connection {
    pub remote_address: SocketAddr,
    /// Sequence number of the last package sent.
    pub local_sequence: Sqn,
    /// Highest sequence number received from the peer.
    pub remote_sequence: Sqn,
    /// Acks for the 32 packages before `remote_sequence`.
    pub ack_bitfield: AckBitfield,
    /// Smoothed round trip time in seconds.
    pub latency: f64,
    status: ConnectionStatus,
    quality: ConnectionQuality,
    package_interval: Duration,
    timeout: Duration,
    outgoing_events: VecDeque<(Event, Sqn)>,
    incoming_events: VecDeque<Event>,
    pending_acks: HashMap<Sqn, Instant>,
    event_callback_sequence: Sqn,
    events_with_callbacks: HashMap<Sqn, Vec<Sqn>>,
    event_callbacks: HashMap<Sqn, CallbackPair>,
    event_wire: Option<EventWire>,
    last_recv: Instant,
    next_send: Instant,
    epoch: Instant,
    throttle_time: f64,
    last_quality_change: f64,
    last_good_milestone: f64,
    next_throttle_tick: f64,
}

impl Connection {
    pub fn new(remote_address: SocketAddr, event_wire: Option<EventWire>) -> Self {
        log::debug!("creating connection record for remote address {remote_address}");
        let now = Instant::now();
        Connection {
            remote_address,
            local_sequence: Sqn::NEVER,
            remote_sequence: Sqn::NEVER,
            ack_bitfield: AckBitfield::default(),
            latency: 0.0,
            status: ConnectionStatus::Disconnected,
            quality: ConnectionQuality::Good,
            package_interval: GOOD_SEND_INTERVAL,
            timeout: CONNECTION_TIMEOUT,
            outgoing_events: VecDeque::new(),
            incoming_events: VecDeque::new(),
            pending_acks: HashMap::new(),
            event_callback_sequence: Sqn::NEVER,
            events_with_callbacks: HashMap::new(),
            event_callbacks: HashMap::new(),
            event_wire,
            last_recv: now,
            next_send: now,
            epoch: now,
            throttle_time: MIN_THROTTLE_TIME,
            last_quality_change: 0.0,
            last_good_milestone: 0.0,
            next_throttle_tick: MIN_THROTTLE_TIME / 2.0,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ConnectionStatus) {
        self.status = status;
        log::info!(
            "status of connection to {} set to {status:?}",
            self.remote_address
        );
    }

    pub fn quality(&self) -> ConnectionQuality {
        self.quality
    }

    pub fn send_interval(&self) -> Duration {
        self.package_interval
    }

    /// Process one well-formed package from the peer.
    ///
    /// Updates remote sequence bookkeeping, resolves pending acks and queues
    /// the carried events. Returns the ack and timeout callbacks that became
    /// due; the caller invokes them once its mutable borrow ends. Duplicates
    /// are rejected, packages older than the ack window are swallowed whole.
    pub fn recv_package(&mut self, package: &Package) -> Result<Vec<EventCallback>, ReceiveError> {
        self.last_recv = Instant::now();
        if self.status != ConnectionStatus::Connected {
            self.set_status(ConnectionStatus::Connected);
        }
        let Header {
            sequence,
            ack,
            ack_bitfield,
        } = package.header;
        log::debug!(
            "received package with sequence {sequence} from {}",
            self.remote_address
        );
        match self.update_remote_info(sequence) {
            SequenceJudgement::Fresh => {}
            SequenceJudgement::Duplicate => {
                return Err(ReceiveError::DuplicateSequence(sequence));
            }
            SequenceJudgement::OutOfWindow => {
                log::debug!("dropping package {sequence}, older than the ack window");
                return Ok(Vec::new());
            }
        }
        let fired = self.resolve_pending_acks(ack, ack_bitfield);
        for event in package.events() {
            log::debug!(
                "received event of type {} from {}",
                event.event_type,
                self.remote_address
            );
            if let Some(wire) = &self.event_wire {
                let _ = wire.send(event.clone());
            }
            self.incoming_events.push_back(event.clone());
        }
        Ok(fired)
    }

    /// Update `remote_sequence` and the ack bitfield for a received sequence.
    fn update_remote_info(&mut self, received: Sqn) -> SequenceJudgement {
        if self.remote_sequence == Sqn::NEVER {
            self.remote_sequence = received;
            return SequenceJudgement::Fresh;
        }
        let diff = self.remote_sequence.diff(received);
        if diff < 0 {
            self.ack_bitfield.record_newer((-diff) as u16);
            self.remote_sequence = received;
            SequenceJudgement::Fresh
        } else if diff == 0 {
            SequenceJudgement::Duplicate
        } else if diff <= AckBitfield::WIDTH as i16 {
            let distance = diff as u16;
            if self.ack_bitfield.get(distance) {
                SequenceJudgement::Duplicate
            } else {
                self.ack_bitfield.set(distance);
                SequenceJudgement::Fresh
            }
        } else {
            SequenceJudgement::OutOfWindow
        }
    }

    /// Match the peer's (ack, bitfield) against packages we still consider
    /// in flight. Acked packages feed the latency estimate and release ack
    /// callbacks; packages pending for longer than [`PACKAGE_TIMEOUT`]
    /// release timeout callbacks.
    fn resolve_pending_acks(&mut self, ack: Sqn, bits: AckBitfield) -> Vec<EventCallback> {
        let now = Instant::now();
        let mut fired = Vec::new();
        let pending: Vec<Sqn> = self.pending_acks.keys().copied().collect();
        for seq in pending {
            let sent_at = self.pending_acks[&seq];
            let diff = ack.diff(seq);
            let acked = diff == 0 || (diff > 0 && diff < 32 && bits.get(diff as u16));
            if acked {
                self.update_latency(now.duration_since(sent_at).as_secs_f64());
                let callbacks = self.take_callbacks(seq, CallbackKind::Ack);
                fired.extend(callbacks);
                self.pending_acks.remove(&seq);
            } else if now.duration_since(sent_at) > PACKAGE_TIMEOUT {
                let callbacks = self.take_callbacks(seq, CallbackKind::Timeout);
                fired.extend(callbacks);
                self.pending_acks.remove(&seq);
            }
        }
        fired
    }

    fn take_callbacks(&mut self, package_sequence: Sqn, kind: CallbackKind) -> Vec<EventCallback> {
        let mut result = Vec::new();
        if let Some(event_sequences) = self.events_with_callbacks.remove(&package_sequence) {
            for event_sequence in event_sequences {
                if let Some(pair) = self.event_callbacks.remove(&event_sequence) {
                    let callback = match kind {
                        CallbackKind::Ack => pair.ack,
                        CallbackKind::Timeout => pair.timeout,
                    };
                    if let Some(callback) = callback {
                        result.push(callback);
                    }
                }
            }
        }
        result
    }

    fn update_latency(&mut self, rtt: f64) {
        // exponential moving average filters out network jitter
        self.latency += 0.1 * (rtt - self.latency);
    }

    /// Queue an event for the peer.
    pub fn dispatch_event(&mut self, event: Event) {
        self.dispatch_event_with_callbacks(event, None, None);
    }

    /// Queue an event and register callbacks for its delivery outcome. Each
    /// callback fires at most once; an ack arriving within the package
    /// timeout wins over the timeout callback.
    pub fn dispatch_event_with_callbacks(
        &mut self,
        event: Event,
        ack_callback: Option<EventCallback>,
        timeout_callback: Option<EventCallback>,
    ) {
        let mut callback_sequence = Sqn::NEVER;
        if ack_callback.is_some() || timeout_callback.is_some() {
            self.event_callback_sequence = self.event_callback_sequence.next();
            callback_sequence = self.event_callback_sequence;
            self.event_callbacks.insert(
                callback_sequence,
                CallbackPair {
                    ack: ack_callback,
                    timeout: timeout_callback,
                },
            );
        }
        log::debug!(
            "dispatched event of type {} to be sent to {}",
            event.event_type,
            self.remote_address
        );
        self.outgoing_events.push_back((event, callback_sequence));
    }

    /// Take the next received event off the incoming queue.
    pub fn poll_incoming_event(&mut self) -> Option<Event> {
        self.incoming_events.pop_front()
    }

    /// Build and send the next package, draining up to 5 queued events into
    /// it. An event that would push the package over the size cap stays
    /// queued for the next send, unless it could never fit on its own, which
    /// is reported as an overflow.
    pub fn send_next_package(&mut self, body: Body, socket: &UdpSocket) -> Result<(), SendError> {
        self.local_sequence = self.local_sequence.next();
        let header = Header::new(self.local_sequence, self.remote_sequence, self.ack_bitfield);
        let mut package = Package::new(header, body);
        // prime the datagram cache so every added event is size-checked
        package.to_datagram()?;
        while package.events().len() < MAX_EVENTS_PER_PACKAGE {
            let Some((event, callback_sequence)) = self.outgoing_events.pop_front() else {
                break;
            };
            match package.add_event(event.clone()) {
                Ok(()) => {
                    if callback_sequence != Sqn::NEVER {
                        self.events_with_callbacks
                            .entry(self.local_sequence)
                            .or_default()
                            .push(callback_sequence);
                    }
                    log::debug!(
                        "sending event of type {} to {}",
                        event.event_type,
                        self.remote_address
                    );
                }
                Err(PackageError::Overflow) => {
                    let event_size = event.to_bytes().map(|b| b.len()).unwrap_or(0);
                    if Header::SIZE + 2 + event_size > MAX_PACKAGE_SIZE {
                        return Err(PackageError::Overflow.into());
                    }
                    self.outgoing_events.push_front((event, callback_sequence));
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }
        let datagram = package.to_datagram()?;
        socket.send_to(datagram, self.remote_address)?;
        log::debug!(
            "sent package with sequence {} to {}",
            self.local_sequence,
            self.remote_address
        );
        self.pending_acks.insert(self.local_sequence, Instant::now());
        self.next_send = Instant::now() + self.package_interval;
        Ok(())
    }

    /// Whether the send cadence calls for another package.
    pub fn send_due(&self, now: Instant) -> bool {
        self.status != ConnectionStatus::Disconnected && now >= self.next_send
    }

    /// Drop the connection if nothing has been received for the timeout.
    /// Returns true when the status just flipped to disconnected. A later
    /// datagram from the same peer resumes the connection.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        if self.status != ConnectionStatus::Disconnected
            && now.duration_since(self.last_recv) > self.timeout
        {
            log::warn!(
                "connection to {} timed out after {:?}",
                self.remote_address,
                self.timeout
            );
            self.set_status(ConnectionStatus::Disconnected);
            true
        } else {
            false
        }
    }

    /// Run the congestion supervisor if its half-second tick is due.
    pub fn pump_throttle(&mut self, now: Instant) {
        let t = now.duration_since(self.epoch).as_secs_f64();
        if t >= self.next_throttle_tick {
            self.throttle_step(t);
            self.next_throttle_tick = t + MIN_THROTTLE_TIME / 2.0;
        }
    }

    /// One step of the congestion state machine, on an abstract clock.
    ///
    /// Additive stability, multiplicative punishment: every time the link
    /// turns bad before a full throttle period of calm has passed, the
    /// period doubles (capped at a minute); every calm period that does last
    /// halves it again (floored at a second).
    fn throttle_step(&mut self, t: f64) {
        match self.quality {
            ConnectionQuality::Good => {
                if self.latency > LATENCY_THRESHOLD {
                    log::warn!(
                        "throttling down connection to {}, latency {:.3}s is above {LATENCY_THRESHOLD}s",
                        self.remote_address,
                        self.latency
                    );
                    self.quality = ConnectionQuality::Bad;
                    self.package_interval = BAD_SEND_INTERVAL;
                    if t - self.last_quality_change < self.throttle_time {
                        self.throttle_time = (self.throttle_time * 2.0).min(MAX_THROTTLE_TIME);
                    }
                    self.last_quality_change = t;
                } else if t - self.last_good_milestone > self.throttle_time {
                    if self.package_interval > GOOD_SEND_INTERVAL {
                        log::info!(
                            "throttling up connection to {}, latency stayed below {LATENCY_THRESHOLD}s for {:.1}s",
                            self.remote_address,
                            self.throttle_time
                        );
                        self.package_interval = GOOD_SEND_INTERVAL;
                    }
                    self.throttle_time = (self.throttle_time / 2.0).max(MIN_THROTTLE_TIME);
                    self.last_good_milestone = t;
                }
            }
            ConnectionQuality::Bad => {
                if self.latency < LATENCY_THRESHOLD {
                    self.quality = ConnectionQuality::Good;
                    self.last_quality_change = t;
                    self.last_good_milestone = t;
                }
            }
        }
    }
}

/// Dispatch an event with an optional ack callback and `retries` automatic
/// re-dispatches. Retries are chained timeout callbacks: when the carrying
/// package times out, the event is queued again with one retry less.
pub fn dispatch_with_retries(
    connection: &mut Connection,
    event: Event,
    retries: u32,
    ack_callback: Option<ConnectionCallback>,
) {
    let ack = ack_callback
        .clone()
        .map(|cb| Box::new(move |conn: &mut Connection| cb(conn)) as EventCallback);
    let timeout = if retries > 0 {
        let retry_event = event.clone();
        Some(Box::new(move |conn: &mut Connection| {
            log::debug!(
                "event of type {} timed out, {retries} retries left",
                retry_event.event_type
            );
            dispatch_with_retries(conn, retry_event, retries - 1, ack_callback);
        }) as EventCallback)
    } else {
        None
    };
    if ack.is_some() || timeout.is_some() {
        connection.dispatch_event_with_callbacks(event, ack, timeout);
    } else {
        connection.dispatch_event(event);
    }
}

/// Client side of a connection: the base reliability core plus a locked
/// local mirror of the game state that server deltas are applied to.
pub struct ClientConnection {
    pub conn: Connection,
    pub game_state: Arc<Mutex<GameState>>,
}

impl ClientConnection {
    pub fn new(remote_address: SocketAddr) -> Self {
        ClientConnection {
            conn: Connection::new(remote_address, None),
            game_state: Arc::new(Mutex::new(GameState::new())),
        }
    }

    /// Body for the next outgoing package: the mirror's current time order,
    /// so the server knows which updates this client still needs.
    pub fn next_body(&self) -> Body {
        let state = self.game_state.lock().expect("game state mirror poisoned");
        Body::Client {
            time_order: state.time_order,
        }
    }

    /// Receive a server package and fold its state update into the mirror.
    pub fn recv_package(&mut self, package: &Package) -> Result<Vec<EventCallback>, ReceiveError> {
        let fired = self.conn.recv_package(package)?;
        if let Body::Server { update } = &package.body {
            let mut state = self.game_state.lock().expect("game state mirror poisoned");
            log::debug!(
                "updating game state from time order {} to {}",
                state.time_order,
                update.time_order
            );
            state.apply(update);
        }
        Ok(fired)
    }
}

/// Server side of a connection: shares the game state store and remembers
/// the newest state time order the client has confirmed.
pub struct ServerConnection {
    pub conn: Connection,
    game_state_store: Arc<GameStateStore>,
    pub last_client_time_order: Sqn,
}

impl ServerConnection {
    pub fn new(
        remote_address: SocketAddr,
        game_state_store: Arc<GameStateStore>,
        last_client_time_order: Sqn,
        event_wire: Option<EventWire>,
    ) -> Self {
        ServerConnection {
            conn: Connection::new(remote_address, event_wire),
            game_state_store,
            last_client_time_order,
        }
    }

    /// Body for the next outgoing package: every cached update the client
    /// has not confirmed yet, folded into one delta, or the full state for a
    /// client that has seen nothing.
    pub fn next_body(&self) -> Body {
        if self.last_client_time_order == Sqn::NEVER {
            log::debug!("sending full game state to client {}", self.conn.remote_address);
            let game_state = self.game_state_store.get_game_state();
            return Body::Server {
                update: GameStateUpdate::from_state(&game_state),
            };
        }
        let base = GameStateUpdate::new(self.last_client_time_order);
        let base_time_order = base.time_order;
        let update = self
            .game_state_store
            .get_update_cache()
            .into_iter()
            .filter(|cached| cached.time_order > base_time_order)
            .fold(base, |folded, cached| folded + cached);
        log::debug!(
            "sending update from time order {} to {} to client {}",
            self.last_client_time_order,
            update.time_order,
            self.conn.remote_address
        );
        Body::Server { update }
    }

    /// Receive a client package and note its confirmed state time order.
    pub fn recv_package(&mut self, package: &Package) -> Result<Vec<EventCallback>, ReceiveError> {
        let fired = self.conn.recv_package(package)?;
        if let Body::Client { time_order } = package.body {
            self.last_client_time_order = time_order;
        }
        Ok(fired)
    }
}
