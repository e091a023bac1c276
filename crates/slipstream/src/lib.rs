//! Real-time client/server game state synchronization over UDP.
//!
//! One server binds a single socket and serves many clients, each over a
//! reliability layer that rides on plain datagrams: cyclic sequence numbers,
//! selective acks for the last 32 packages, latency-driven congestion
//! throttling, and at-most-once event delivery with ack and timeout
//! callbacks. Game state lives in a [`GameStateStore`], is progressed by a
//! fixed-tick [`GameStateMachine`] and flows to clients as mergeable
//! [`GameStateUpdate`] deltas, so a client only ever receives what it has
//! not yet confirmed.

pub mod client;
pub mod connection;
pub mod event;
pub mod gamestate;
pub mod protocol;
pub mod server;
pub mod simulation;
pub mod sqn;
pub mod value;

pub use client::{Client, GameStateAccess, WaitTimeoutError};
pub use connection::{
    CONNECTION_TIMEOUT, ClientConnection, Connection, ConnectionCallback, ConnectionQuality,
    ConnectionStatus, EventCallback, EventWire, ReceiveError, SendError, ServerConnection,
    dispatch_with_retries,
};
pub use event::{Event, EventHandler, EventHandlerRegistry};
pub use gamestate::{GameState, GameStateStore, GameStateUpdate, GameStatus};
pub use protocol::{
    AckBitfield, Body, Header, MAX_PACKAGE_SIZE, PACKAGE_TIMEOUT, PROTOCOL_ID, Package,
    PackageError, PackageKind,
};
pub use server::{EventTarget, Server, ServerHandle};
pub use simulation::{
    DEFAULT_GAME_LOOP_INTERVAL, GameLoopControl, GameStateMachine, SimulationEventHandler,
};
pub use sqn::{Sqn, SqnRangeError};
pub use value::{CodecError, Fields, TO_DELETE, Value};
