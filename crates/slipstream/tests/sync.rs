use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use slipstream::{
    Client, Event, EventTarget, Fields, GameStateMachine, GameStateStore, GameStateUpdate,
    GameStatus, Server, ServerHandle, Sqn, Value,
};

const WAIT: Duration = Duration::from_secs(5);

fn wait_for<T>(what: &str, mut probe: impl FnMut() -> Option<T>) -> T {
    let t0 = Instant::now();
    loop {
        if let Some(value) = probe() {
            return value;
        }
        assert!(t0.elapsed() < WAIT, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn bound_addr(handle: &ServerHandle) -> std::net::SocketAddr {
    wait_for("server to bind", || handle.local_addr())
}

#[test]
fn client_syncs_state_and_events_drive_the_simulation() {
    let store = Arc::new(GameStateStore::new(
        slipstream::GameState::with_fields(Fields::from([(
            "x".to_owned(),
            Value::Float(0.0),
        )])),
    ));

    let mut machine = GameStateMachine::new(Arc::clone(&store), |_state, _dt| Fields::new());
    machine.register_event_handler("MOVE", |event, state, _dt| {
        let dx = event.args.first().and_then(Value::as_float).unwrap_or(0.0);
        let x = state.get("x").and_then(Value::as_float).unwrap_or(0.0);
        Fields::from([("x".to_owned(), Value::Float(x + dx))])
    });
    let event_wire = machine.event_wire();
    let controls = machine.controls();
    let machine_thread = machine.run_in_thread(Duration::from_millis(10));

    let server = Server::new(Arc::clone(&store));
    let server_handle = server.handle();
    let server_thread = server.run_in_thread(0, "127.0.0.1".to_owned(), Some(event_wire));
    let server_addr = bound_addr(&server_handle);

    let mut client = Client::new();
    client
        .connect(&server_addr.ip().to_string(), server_addr.port())
        .unwrap();

    // first packages carry the full state, the mirror catches up
    client
        .wait_until(|state| state.game_status == GameStatus::Active, WAIT)
        .unwrap();

    let acked = Arc::new(AtomicUsize::new(0));
    let ack_counter = Arc::clone(&acked);
    client.dispatch_event(
        Event::new("MOVE").arg(2.5f32),
        0,
        Some(Arc::new(move |_conn| {
            ack_counter.fetch_add(1, Ordering::SeqCst);
        })),
    );

    // the event reaches the simulation through the wire and the resulting
    // state update flows back into the client mirror
    client
        .wait_until(
            |state| state.get("x").and_then(Value::as_float).unwrap_or(0.0) > 2.0,
            WAIT,
        )
        .unwrap();
    wait_for("event ack callback", || {
        (acked.load(Ordering::SeqCst) == 1).then_some(())
    });

    assert!(controls.stop(Duration::from_secs(2)));

    // the first client is the host, so it may shut the server down
    client.disconnect(true);
    let server = server_thread.join().unwrap().unwrap();
    assert_eq!(server.client_addresses().len(), 1);
    machine_thread.join().unwrap();
}

#[test]
fn server_broadcasts_reach_client_handlers() {
    let store = Arc::new(GameStateStore::default());
    store.push_update(GameStateUpdate::new(Sqn::new(1)).field("ready", true));

    let server = Server::new(Arc::clone(&store));
    let handle = server.handle();
    let server_thread = server.run_in_thread(0, "127.0.0.1".to_owned(), None);
    let server_addr = bound_addr(&handle);

    let received = Arc::new(AtomicUsize::new(0));
    let acked = Arc::new(AtomicUsize::new(0));

    let mut client = Client::new();
    let receive_counter = Arc::clone(&received);
    client.register_event_handler("ANNOUNCE", move |event| {
        assert_eq!(event.args.first().and_then(Value::as_str), Some("welcome"));
        receive_counter.fetch_add(1, Ordering::SeqCst);
    });
    client
        .connect(&server_addr.ip().to_string(), server_addr.port())
        .unwrap();
    client
        .wait_until(|state| state.time_order == Sqn::new(1), WAIT)
        .unwrap();

    let ack_counter = Arc::clone(&acked);
    handle.dispatch_event(
        Event::new("ANNOUNCE").arg("welcome"),
        EventTarget::All,
        1,
        Some(Arc::new(move |_conn| {
            ack_counter.fetch_add(1, Ordering::SeqCst);
        })),
    );

    wait_for("client to receive the broadcast", || {
        (received.load(Ordering::SeqCst) >= 1).then_some(())
    });
    wait_for("server to see the ack", || {
        (acked.load(Ordering::SeqCst) >= 1).then_some(())
    });

    client.disconnect(true);
    server_thread.join().unwrap().unwrap();
}
