use std::collections::VecDeque;
use std::fmt;
use std::ops::Add;
use std::sync::Mutex;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::sqn::Sqn;
use crate::value::{self, CodecError, Fields, Value};

const UPDATE_CACHE_SIZE: usize = 100;

/// Whether the game simulation is currently progressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    Paused,
    Active,
}

impl GameStatus {
    pub fn to_int(self) -> i64 {
        match self {
            GameStatus::Paused => 0,
            GameStatus::Active => 1,
        }
    }

    pub fn from_int(value: i64) -> Option<Self> {
        match value {
            0 => Some(GameStatus::Paused),
            1 => Some(GameStatus::Active),
            _ => None,
        }
    }
}

/// Shared game state, an open string-keyed record plus the two reserved
/// fields `time_order` and `game_status`.
///
/// A state is created once per session and only ever mutated by applying a
/// strictly newer [`GameStateUpdate`].
#[derive(Debug, Clone, PartialEq)]
pub struct GameState {
    pub time_order: Sqn,
    pub game_status: GameStatus,
    fields: Fields,
}

impl Default for GameState {
    fn default() -> Self {
        GameState::new()
    }
}

impl GameState {
    pub fn new() -> Self {
        GameState {
            time_order: Sqn::NEVER,
            game_status: GameStatus::Paused,
            fields: Fields::new(),
        }
    }

    pub fn with_fields(fields: Fields) -> Self {
        GameState {
            time_order: Sqn::NEVER,
            game_status: GameStatus::Paused,
            fields,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.game_status == GameStatus::Paused
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Merge a strictly newer update into this state. Older or same-aged
    /// updates are a no-op. Keys carrying the deletion sentinel are removed.
    pub fn apply(&mut self, update: &GameStateUpdate) {
        if update.time_order <= self.time_order {
            return;
        }
        recursive_update(&mut self.fields, &update.fields, true);
        if let Some(status) = update.game_status {
            self.game_status = status;
        }
        self.time_order = update.time_order;
    }
}

/// A set of changes to carry out on a [`GameState`], labelled with the
/// `time_order` it advances the state to.
///
/// Updates merge with `+`: the result carries the larger `time_order` and,
/// per key, the value from the newer operand; nested records merge key by
/// key instead of being replaced wholesale. Merging is associative as long
/// as all operands carry distinct `time_order`s, so any subset of cached
/// updates can be folded into a single delta in any grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct GameStateUpdate {
    pub time_order: Sqn,
    pub game_status: Option<GameStatus>,
    pub fields: Fields,
}

impl GameStateUpdate {
    pub fn new(time_order: Sqn) -> Self {
        GameStateUpdate {
            time_order,
            game_status: None,
            fields: Fields::new(),
        }
    }

    pub fn with_fields(time_order: Sqn, fields: Fields) -> Self {
        GameStateUpdate {
            time_order,
            game_status: None,
            fields,
        }
    }

    pub fn with_status(time_order: Sqn, status: GameStatus) -> Self {
        GameStateUpdate {
            time_order,
            game_status: Some(status),
            fields: Fields::new(),
        }
    }

    /// Snapshot of an entire state as one update, used to bring a peer that
    /// has seen nothing up to speed in a single package.
    pub fn from_state(state: &GameState) -> Self {
        GameStateUpdate {
            time_order: state.time_order,
            game_status: Some(state.game_status),
            fields: state.fields.clone(),
        }
    }

    /// Set one field on the update.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        value::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        value::decode(bytes)
    }
}

impl Add for GameStateUpdate {
    type Output = GameStateUpdate;

    /// Merge two updates. At equal `time_order`s the result is unspecified
    /// (currently the left operand's keys win); producers must hand out
    /// distinct `time_order`s.
    fn add(self, other: GameStateUpdate) -> GameStateUpdate {
        if other.time_order > self.time_order {
            absorb(self, other)
        } else {
            absorb(other, self)
        }
    }
}

/// Overlay `newer` onto `base` without applying deletions, so that deletion
/// markers keep propagating through intermediate merges.
fn absorb(mut base: GameStateUpdate, newer: GameStateUpdate) -> GameStateUpdate {
    recursive_update(&mut base.fields, &newer.fields, false);
    base.time_order = newer.time_order;
    if newer.game_status.is_some() {
        base.game_status = newer.game_status;
    }
    base
}

/// Overlay `src` onto `dst`, descending into nested records. With `delete`
/// set, sentinel values remove the key instead of being stored.
fn recursive_update(dst: &mut Fields, src: &Fields, delete: bool) {
    for (key, val) in src {
        if delete && matches!(val, Value::Delete) {
            dst.remove(key);
            continue;
        }
        match (dst.get_mut(key), val) {
            (Some(Value::Map(existing)), Value::Map(incoming)) => {
                recursive_update(existing, incoming, delete);
            }
            _ => {
                dst.insert(key.clone(), val.clone());
            }
        }
    }
}

impl Serialize for GameStateUpdate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = 1 + usize::from(self.game_status.is_some()) + self.fields.len();
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry("time_order", &self.time_order.get())?;
        if let Some(status) = self.game_status {
            map.serialize_entry("game_status", &status.to_int())?;
        }
        for (key, val) in &self.fields {
            map.serialize_entry(key, val)?;
        }
        map.end()
    }
}

struct UpdateVisitor;

impl<'de> Visitor<'de> for UpdateVisitor {
    type Value = GameStateUpdate;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a game state update record")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<GameStateUpdate, A::Error> {
        use serde::de::Error;

        let mut time_order = None;
        let mut game_status = None;
        let mut fields = Fields::new();
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "time_order" => {
                    let raw: u64 = map.next_value()?;
                    time_order =
                        Some(Sqn::try_from(raw).map_err(|e| A::Error::custom(e.to_string()))?);
                }
                "game_status" => {
                    let raw: i64 = map.next_value()?;
                    game_status = Some(
                        GameStatus::from_int(raw)
                            .ok_or_else(|| A::Error::custom("unknown game status"))?,
                    );
                }
                _ => {
                    fields.insert(key, map.next_value::<Value>()?);
                }
            }
        }
        Ok(GameStateUpdate {
            time_order: time_order.ok_or_else(|| A::Error::missing_field("time_order"))?,
            game_status,
            fields,
        })
    }
}

impl<'de> Deserialize<'de> for GameStateUpdate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(UpdateVisitor)
    }
}

/// The authoritative game state plus a bounded cache of the updates that
/// produced it.
///
/// Shared between the simulation loop, the server loop and every server-side
/// connection; all access goes through the internal lock, and readers get
/// snapshots, never partially merged data.
pub struct GameStateStore {
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    game_state: GameState,
    update_cache: VecDeque<GameStateUpdate>,
}

impl Default for GameStateStore {
    fn default() -> Self {
        GameStateStore::new(GameState::new())
    }
}

impl GameStateStore {
    pub fn new(initial_game_state: GameState) -> Self {
        let mut update_cache = VecDeque::with_capacity(UPDATE_CACHE_SIZE + 1);
        update_cache.push_back(GameStateUpdate::new(Sqn::NEVER));
        GameStateStore {
            inner: Mutex::new(StoreInner {
                game_state: initial_game_state,
                update_cache,
            }),
        }
    }

    /// Append an update to the cache and, if it is newer than the current
    /// state, apply it. The oldest cache entry is evicted past the cache
    /// size.
    pub fn push_update(&self, update: GameStateUpdate) {
        let mut inner = self.inner.lock().expect("game state store poisoned");
        if update.time_order > inner.game_state.time_order {
            inner.game_state.apply(&update);
        }
        inner.update_cache.push_back(update);
        if inner.update_cache.len() > UPDATE_CACHE_SIZE {
            inner.update_cache.pop_front();
        }
    }

    /// A snapshot of the cached updates, safe to fold while pushes continue.
    pub fn get_update_cache(&self) -> Vec<GameStateUpdate> {
        let inner = self.inner.lock().expect("game state store poisoned");
        inner.update_cache.iter().cloned().collect()
    }

    /// A snapshot of the current authoritative state.
    pub fn get_game_state(&self) -> GameState {
        let inner = self.inner.lock().expect("game state store poisoned");
        inner.game_state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqn(n: u16) -> Sqn {
        Sqn::new(n)
    }

    #[test]
    fn apply_merges_and_advances_time_order() {
        let mut state = GameState::new();
        state.apply(&GameStateUpdate::new(sqn(1)).field("score", 3i64));
        assert_eq!(state.time_order, sqn(1));
        assert_eq!(state.get("score"), Some(&Value::Int(3)));
    }

    #[test]
    fn apply_older_update_is_noop() {
        let mut state = GameState::new();
        state.apply(&GameStateUpdate::new(sqn(5)).field("score", 5i64));
        state.apply(&GameStateUpdate::new(sqn(3)).field("score", 99i64));
        assert_eq!(state.time_order, sqn(5));
        assert_eq!(state.get("score"), Some(&Value::Int(5)));
    }

    #[test]
    fn delete_sentinel_removes_key() {
        let mut state = GameState::with_fields(Fields::from([
            ("foo".to_owned(), Value::Int(1)),
            ("bar".to_owned(), Value::Int(2)),
        ]));
        state.apply(
            &GameStateUpdate::new(sqn(1))
                .field("foo", Value::Delete)
                .field("baz", 3i64),
        );
        assert_eq!(state.get("foo"), None);
        assert_eq!(state.get("bar"), Some(&Value::Int(2)));
        assert_eq!(state.get("baz"), Some(&Value::Int(3)));
    }

    #[test]
    fn delete_survives_update_merge() {
        // merging updates must carry the marker through so that the final
        // apply still removes the key
        let u1 = GameStateUpdate::new(sqn(1)).field("foo", Value::Delete);
        let u2 = GameStateUpdate::new(sqn(2)).field("bar", 1i64);
        let merged = u1 + u2;
        assert_eq!(merged.fields.get("foo"), Some(&Value::Delete));
        let mut state = GameState::with_fields(Fields::from([("foo".to_owned(), Value::Int(9))]));
        state.apply(&merged);
        assert_eq!(state.get("foo"), None);
    }

    #[test]
    fn nested_records_merge_key_by_key() {
        let mut state = GameState::with_fields(Fields::from([(
            "players".to_owned(),
            Value::Map(Fields::from([
                ("0".to_owned(), Value::Str("alice".into())),
                ("1".to_owned(), Value::Str("bob".into())),
            ])),
        )]));
        state.apply(&GameStateUpdate::new(sqn(1)).field(
            "players",
            Value::Map(Fields::from([("1".to_owned(), Value::Str("carol".into()))])),
        ));
        let players = state.get("players").unwrap().as_map().unwrap();
        assert_eq!(players.get("0"), Some(&Value::Str("alice".into())));
        assert_eq!(players.get("1"), Some(&Value::Str("carol".into())));
    }

    #[test]
    fn merge_newer_operand_wins() {
        let older = GameStateUpdate::new(sqn(1)).field("a", 1i64).field("b", 1i64);
        let newer = GameStateUpdate::new(sqn(2)).field("b", 2i64).field("c", 2i64);
        let merged = older.clone() + newer.clone();
        assert_eq!(merged.time_order, sqn(2));
        assert_eq!(merged.fields.get("a"), Some(&Value::Int(1)));
        assert_eq!(merged.fields.get("b"), Some(&Value::Int(2)));
        assert_eq!(merged.fields.get("c"), Some(&Value::Int(2)));
        // operand order must not matter
        assert_eq!(newer + older, merged);
    }

    #[test]
    fn merge_is_associative_for_distinct_time_orders() {
        let u = GameStateUpdate::new(sqn(1)).field("a", 1i64).field("x", 1i64);
        let v = GameStateUpdate::new(sqn(2)).field("b", 2i64).field("x", 2i64);
        let w = GameStateUpdate::new(sqn(3)).field("c", 3i64).field("x", 3i64);
        let left = (u.clone() + v.clone()) + w.clone();
        let right = u + (v + w);
        assert_eq!(left, right);
        assert_eq!(left.fields.get("x"), Some(&Value::Int(3)));
    }

    #[test]
    fn update_wire_roundtrip() {
        let update = GameStateUpdate::with_status(sqn(7), GameStatus::Active)
            .field("score", 11i64)
            .field("gone", Value::Delete);
        let bytes = update.to_bytes().unwrap();
        assert_eq!(GameStateUpdate::from_bytes(&bytes).unwrap(), update);
    }

    #[test]
    fn update_without_status_roundtrip() {
        let update = GameStateUpdate::new(sqn(3)).field("score", 1i64);
        let bytes = update.to_bytes().unwrap();
        let parsed = GameStateUpdate::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.game_status, None);
        assert_eq!(parsed, update);
    }

    #[test]
    fn store_applies_and_caches() {
        let store = GameStateStore::default();
        store.push_update(GameStateUpdate::new(sqn(1)).field("score", 1i64));
        store.push_update(GameStateUpdate::new(sqn(2)).field("score", 2i64));
        let state = store.get_game_state();
        assert_eq!(state.time_order, sqn(2));
        assert_eq!(state.get("score"), Some(&Value::Int(2)));
        assert_eq!(store.get_update_cache().len(), 3);
    }

    #[test]
    fn store_cache_is_bounded_and_gapless() {
        let store = GameStateStore::default();
        for i in 1..=150u16 {
            store.push_update(GameStateUpdate::new(sqn(i)).field("tick", i));
        }
        let cache = store.get_update_cache();
        assert_eq!(cache.len(), UPDATE_CACHE_SIZE);
        let newest = cache.iter().map(|u| u.time_order).max().unwrap();
        assert_eq!(store.get_game_state().time_order, newest);
        // monotonically non-decreasing
        for pair in cache.windows(2) {
            assert!(pair[0].time_order < pair[1].time_order);
        }
    }

    #[test]
    fn full_state_snapshot_restores_mirror() {
        let mut authoritative = GameState::with_fields(Fields::from([(
            "score".to_owned(),
            Value::Int(42),
        )]));
        authoritative.time_order = sqn(9);
        authoritative.game_status = GameStatus::Active;
        let snapshot = GameStateUpdate::from_state(&authoritative);
        let mut mirror = GameState::new();
        mirror.apply(&snapshot);
        assert_eq!(mirror, authoritative);
    }
}
