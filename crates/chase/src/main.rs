use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use slipstream::{
    Client, DEFAULT_GAME_LOOP_INTERVAL, Event, Fields, GameState, GameStateMachine,
    GameStateStore, Server, Sqn, Value,
};

/// Squared distance below which the chaser catches a player.
const CATCH_RADIUS_SQUARED: f32 = 15.0;
/// Seconds of protection after a catch.
const PROTECTION_TIME: f32 = 5.0;

#[derive(Parser)]
#[command(name = "chase")]
#[command(about = "A small game of tag played over state sync")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the authoritative game server
    Server {
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,

        #[arg(short, long, default_value_t = 8080)]
        port: u16,
    },
    /// Run a scripted bot client that joins the game and wanders around
    Bot {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long, default_value_t = 8080)]
        port: u16,

        #[arg(short, long, default_value = "bot")]
        name: String,

        #[arg(short, long, default_value_t = 10.0, help = "Seconds to play")]
        duration: f32,

        #[arg(long, help = "Shut the server down on exit (host client only)")]
        shutdown: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match Args::parse().command {
        Command::Server { bind, port } => run_server(&bind, port),
        Command::Bot {
            host,
            port,
            name,
            duration,
            shutdown,
        } => run_bot(&host, port, &name, duration, shutdown),
    }
}

fn run_server(bind: &str, port: u16) -> Result<()> {
    let initial_state = GameState::with_fields(Fields::from([
        ("players".to_owned(), Value::Map(Fields::new())),
        ("protection".to_owned(), Value::Bool(false)),
        ("countdown".to_owned(), Value::Float(0.0)),
    ]));
    let store = Arc::new(GameStateStore::new(initial_state));

    let mut machine = GameStateMachine::new(Arc::clone(&store), time_step);
    let mut next_player_id = 0i64;
    machine.register_event_handler("JOIN", move |event, state, _dt| {
        let name = event
            .args
            .first()
            .and_then(Value::as_str)
            .unwrap_or("anonymous")
            .to_owned();
        let player_id = next_player_id.to_string();
        next_player_id += 1;
        log::info!("{name} joined as player {player_id}");
        let entry = Fields::from([
            ("name".to_owned(), Value::Str(name)),
            (
                "position".to_owned(),
                Value::List(vec![Value::Float(0.0), Value::Float(0.0)]),
            ),
        ]);
        let mut fields = Fields::from([(
            "players".to_owned(),
            Value::Map(Fields::from([(player_id.clone(), Value::Map(entry))])),
        )]);
        // the first player to join starts out as the chaser
        if state.get("chaser_id").is_none() {
            fields.insert("chaser_id".to_owned(), Value::Str(player_id));
        }
        fields
    });
    machine.register_event_handler("MOVE", |event, _state, _dt| {
        let (Some(player_id), Some(x), Some(y)) = (
            event.kwargs.get("player_id").and_then(Value::as_str),
            event.kwargs.get("x").and_then(Value::as_float),
            event.kwargs.get("y").and_then(Value::as_float),
        ) else {
            return Fields::new();
        };
        let entry = Fields::from([(
            "position".to_owned(),
            Value::List(vec![Value::Float(x), Value::Float(y)]),
        )]);
        Fields::from([(
            "players".to_owned(),
            Value::Map(Fields::from([(player_id.to_owned(), Value::Map(entry))])),
        )])
    });

    let event_wire = machine.event_wire();
    let controls = machine.controls();
    let machine_thread = machine.run_in_thread(DEFAULT_GAME_LOOP_INTERVAL);

    let mut server = Server::new(store);
    log::info!("chase server starting on {bind}:{port}");
    server.run(port, bind, Some(event_wire))?;

    controls.stop(Duration::from_secs(1));
    let _ = machine_thread.join();
    Ok(())
}

/// Chase rules: while protection is on, count it down; otherwise hand the
/// chaser role to the first player the chaser touches.
fn time_step(state: &GameState, dt: f64) -> Fields {
    // nothing to simulate before the first player joins
    let Some(chaser_id) = state.get("chaser_id").and_then(Value::as_str) else {
        return Fields::new();
    };
    if state
        .get("protection")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        let countdown =
            state.get("countdown").and_then(Value::as_float).unwrap_or(0.0) - dt as f32;
        let mut fields = Fields::from([("countdown".to_owned(), Value::Float(countdown))]);
        if countdown <= 0.0 {
            fields.insert("protection".to_owned(), Value::Bool(false));
        }
        return fields;
    }
    let Some(players) = state.get("players").and_then(Value::as_map) else {
        return Fields::new();
    };
    let Some(chaser_position) = players.get(chaser_id).and_then(position_of) else {
        return Fields::new();
    };
    for (player_id, player) in players {
        if player_id == chaser_id {
            continue;
        }
        let Some(position) = position_of(player) else {
            continue;
        };
        let dx = position.0 - chaser_position.0;
        let dy = position.1 - chaser_position.1;
        if dx * dx + dy * dy < CATCH_RADIUS_SQUARED {
            log::info!("player {player_id} was caught and is the new chaser");
            return Fields::from([
                ("chaser_id".to_owned(), Value::Str(player_id.clone())),
                ("protection".to_owned(), Value::Bool(true)),
                ("countdown".to_owned(), Value::Float(PROTECTION_TIME)),
            ]);
        }
    }
    Fields::new()
}

fn position_of(player: &Value) -> Option<(f32, f32)> {
    let position = player.as_map()?.get("position")?.as_list()?;
    Some((position.first()?.as_float()?, position.get(1)?.as_float()?))
}

fn run_bot(host: &str, port: u16, name: &str, duration: f32, shutdown: bool) -> Result<()> {
    let mut client = Client::new();
    client.connect(host, port)?;
    client
        .wait_until(|state| state.time_order > Sqn::NEVER, Duration::from_secs(5))
        .context("server state never arrived")?;

    client.dispatch_event(Event::new("JOIN").arg(name), 2, None);
    let find_name = name.to_owned();
    let player_id = client
        .try_to(
            move |state| {
                let players = state.get("players")?.as_map()?;
                players.iter().find_map(|(player_id, player)| {
                    let player_name = player.as_map()?.get("name")?.as_str()?;
                    (player_name == find_name).then(|| player_id.clone())
                })
            },
            Duration::from_secs(5),
        )
        .context("never showed up in the player list")?;
    log::info!("{name} is playing as {player_id}");

    let deadline = Instant::now() + Duration::from_secs_f32(duration);
    let mut heading: f32 = 0.7;
    while Instant::now() < deadline && client.is_running() {
        let id = player_id.clone();
        let (x, y) = client
            .try_to(
                move |state| {
                    let players = state.get("players")?.as_map()?;
                    position_of(players.get(&id)?)
                },
                Duration::from_secs(1),
            )
            .context("lost track of own position")?;
        heading += 0.3;
        client.dispatch_event(
            Event::new("MOVE")
                .kwarg("player_id", player_id.as_str())
                .kwarg("x", x + 2.0 * heading.cos())
                .kwarg("y", y + 2.0 * heading.sin()),
            0,
            None,
        );
        thread::sleep(Duration::from_millis(50));
    }

    {
        let state = client.access_game_state();
        let chaser = state
            .get("chaser_id")
            .and_then(Value::as_str)
            .unwrap_or("nobody");
        log::info!(
            "leaving the game at time order {}, the chaser is {chaser}",
            state.time_order
        );
    }
    client.disconnect(shutdown);
    Ok(())
}
