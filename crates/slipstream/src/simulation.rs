use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, channel};
use std::thread;
use std::time::{Duration, Instant};

use crate::connection::EventWire;
use crate::event::{Event, EventHandlerRegistry};
use crate::gamestate::{GameState, GameStateStore, GameStateUpdate, GameStatus};
use crate::value::Fields;

/// Default duration between consecutive time steps.
pub const DEFAULT_GAME_LOOP_INTERVAL: Duration = Duration::from_millis(20);

/// Handler invoked by the game loop for a queued event; returns the state
/// fields the event changes.
pub type SimulationEventHandler = Box<dyn FnMut(&Event, &GameState, f64) -> Fields + Send>;

/// Drives the game state through time at a fixed tick.
///
/// Each tick runs the `time_step` hook, folds in updates produced by queued
/// event handlers (stopping early when the tick budget is nearly spent) and
/// pushes the combined delta into the shared [`GameStateStore`] under the
/// next `time_order`.
///
/// Events reach the loop through the [`EventWire`] handed to a server's
/// `run`, so that events received from clients feed the simulation.
pub struct GameStateMachine<F> {
    /// Seconds of simulated time since the loop first started.
    pub game_time: f64,
    game_state_store: Arc<GameStateStore>,
    event_queue: Receiver<Event>,
    event_wire: EventWire,
    event_handlers: EventHandlerRegistry<SimulationEventHandler>,
    game_loop_is_running: Arc<AtomicBool>,
    time_step: F,
}

impl<F> GameStateMachine<F>
where
    F: FnMut(&GameState, f64) -> Fields + Send,
{
    /// Create a machine over `game_state_store` with `time_step` as the
    /// simulation hook. The hook gets the state before the step and the step
    /// duration, and returns the fields it changed; an empty map means
    /// nothing happened this tick.
    pub fn new(game_state_store: Arc<GameStateStore>, time_step: F) -> Self {
        let (event_wire, event_queue) = channel();
        GameStateMachine {
            game_time: 0.0,
            game_state_store,
            event_queue,
            event_wire,
            event_handlers: EventHandlerRegistry::new(),
            game_loop_is_running: Arc::new(AtomicBool::new(false)),
            time_step,
        }
    }

    /// A sender that feeds events into this machine's queue. Pass it to the
    /// server so client events reach the simulation.
    pub fn event_wire(&self) -> EventWire {
        self.event_wire.clone()
    }

    /// Register a handler for events of `event_type`. The handler gets the
    /// event, the current state and the tick duration, and returns the state
    /// fields it changes. Events without a registered handler are discarded.
    pub fn register_event_handler<H>(&mut self, event_type: impl Into<String>, handler: H)
    where
        H: FnMut(&Event, &GameState, f64) -> Fields + Send + 'static,
    {
        self.event_handlers.register(event_type, Box::new(handler));
    }

    /// Handle for pausing the loop from another thread.
    pub fn controls(&self) -> GameLoopControl {
        GameLoopControl {
            game_state_store: Arc::clone(&self.game_state_store),
            game_loop_is_running: Arc::clone(&self.game_loop_is_running),
        }
    }

    /// Pause the simulation; see [`GameLoopControl::stop`].
    pub fn stop(&self, timeout: Duration) -> bool {
        self.controls().stop(timeout)
    }

    /// Run the simulation until the stored state switches to `Paused`.
    ///
    /// Blocks the calling thread. If the state is paused when the loop
    /// starts, a status-only update to `Active` is pushed first; a
    /// subsequent run resumes where the simulation stopped.
    pub fn run_game_loop(&mut self, interval: Duration) {
        let store = &self.game_state_store;
        if store.get_game_state().is_paused() {
            let time_order = store.get_game_state().time_order.next();
            store.push_update(GameStateUpdate::with_status(time_order, GameStatus::Active));
        }
        log::info!("game loop running at {interval:?} per time step");
        let mut game_state = store.get_game_state();
        let mut dt = interval.as_secs_f64();
        self.game_loop_is_running.store(true, Ordering::SeqCst);
        while game_state.game_status == GameStatus::Active {
            let t0 = Instant::now();
            let mut update_fields = (self.time_step)(&game_state, dt);
            while let Ok(event) = self.event_queue.try_recv() {
                if let Some(handler) = self.event_handlers.get_mut(&event.event_type) {
                    let event_update = handler(&event, &game_state, dt);
                    update_fields.extend(event_update);
                }
                if t0.elapsed().as_secs_f64() > 0.95 * interval.as_secs_f64() {
                    break;
                }
            }
            store.push_update(GameStateUpdate::with_fields(
                game_state.time_order.next(),
                update_fields,
            ));
            game_state = store.get_game_state();
            let elapsed = t0.elapsed();
            dt = interval.max(elapsed).as_secs_f64();
            thread::sleep(interval.saturating_sub(elapsed));
            self.game_time += dt;
        }
        self.game_loop_is_running.store(false, Ordering::SeqCst);
        log::info!("game loop stopped after {:.3}s of game time", self.game_time);
    }

    /// Run the game loop on its own thread. Joining the handle returns the
    /// machine once the loop has been stopped.
    pub fn run_in_thread(mut self, interval: Duration) -> thread::JoinHandle<Self>
    where
        F: 'static,
    {
        thread::spawn(move || {
            self.run_game_loop(interval);
            self
        })
    }
}

/// Clonable handle that pauses a running game loop.
#[derive(Clone)]
pub struct GameLoopControl {
    game_state_store: Arc<GameStateStore>,
    game_loop_is_running: Arc<AtomicBool>,
}

impl GameLoopControl {
    pub fn is_running(&self) -> bool {
        self.game_loop_is_running.load(Ordering::SeqCst)
    }

    /// Push a status update to `Paused` and wait up to `timeout` for the
    /// loop to observe it. Returns whether the loop actually stopped.
    ///
    /// The push is repeated while waiting: a concurrently ticking loop can
    /// claim the same `time_order` the first push picked, which would
    /// otherwise shadow the pause.
    pub fn stop(&self, timeout: Duration) -> bool {
        let t0 = Instant::now();
        loop {
            let game_state = self.game_state_store.get_game_state();
            if game_state.game_status == GameStatus::Active {
                self.game_state_store.push_update(GameStateUpdate::with_status(
                    game_state.time_order.next(),
                    GameStatus::Paused,
                ));
            }
            let round = Instant::now();
            while round.elapsed() < Duration::from_millis(50) {
                if !self.game_loop_is_running.load(Ordering::SeqCst) {
                    return true;
                }
                if t0.elapsed() > timeout {
                    return false;
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}
