//! The engine's cached view of the document
//!
//! Built from state-core deltas, eventually consistent with the
//! authoritative document within the debounce window. Rules read it by
//! dot-notation path with typed accessors; alert bookkeeping helpers cover
//! the dedup checks every domain rule performs.

use serde_json::Value;

use crate::state::{DeltaValue, StateDelta, StateDocument};
use crate::types::{DistanceUnit, Position};

/// Flat-path read access over the cached document.
pub struct StateView {
    doc: StateDocument,
}

fn dot_to_pointer(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let mut pointer = String::with_capacity(path.len() + 4);
    for token in path.split('.') {
        pointer.push('/');
        pointer.push_str(&token.replace('~', "~0").replace('/', "~1"));
    }
    pointer
}

impl StateView {
    pub fn new(initial: Value) -> Self {
        Self {
            doc: StateDocument::new(initial),
        }
    }

    /// Absorb a delta, returning the dot paths whose values actually
    /// changed (deep equality - a rewrite of an identical value is not a
    /// change and schedules nothing).
    pub fn absorb(&mut self, delta: &StateDelta) -> Vec<String> {
        let mut changed = Vec::new();
        for (path, value) in &delta.changes {
            let pointer = dot_to_pointer(path);
            match value {
                DeltaValue::Set(new_value) => {
                    if self.doc.get(&pointer) == Some(new_value) {
                        continue;
                    }
                    if path.is_empty() {
                        self.doc.set_root(new_value.clone());
                    } else if self.doc.set(&pointer, new_value.clone()).is_err() {
                        // A parent is a scalar in the cache but not in the
                        // authoritative document; resync the closest root.
                        tracing::debug!(path = %path, "Cache shape mismatch on delta absorb");
                        continue;
                    }
                    changed.push(path.clone());
                }
                DeltaValue::Removed => {
                    if self.doc.remove(&pointer).is_ok() {
                        changed.push(path.clone());
                    }
                }
            }
        }
        changed
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.doc.get(&dot_to_pointer(path))
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path)?.as_bool()
    }

    pub fn get_f64(&self, path: &str) -> Option<f64> {
        let v = self.get(path)?;
        v.as_f64().or_else(|| v.as_str()?.parse().ok())
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path)?.as_str()
    }

    /// Extract a coordinate pair from a value that is either
    /// `{latitude, longitude}` or `{position: {latitude, longitude}}`.
    pub fn position(&self, path: &str) -> Option<Position> {
        self.get(path).and_then(position_of)
    }

    /// The user's distance unit preference (`units.distance`).
    pub fn distance_unit(&self) -> DistanceUnit {
        self.get_str("units.distance")
            .map(DistanceUnit::parse)
            .unwrap_or_default()
    }

    /// Active alert records (empty slice if the list is missing).
    pub fn active_alerts(&self) -> &[Value] {
        self.get("alerts.active")
            .and_then(Value::as_array)
            .map_or(&[], Vec::as_slice)
    }

    /// Whether an active, unacknowledged alert exists for `trigger`.
    /// Rules consult this before creating a duplicate.
    pub fn has_open_alert(&self, trigger: &str) -> bool {
        self.active_alerts().iter().any(|a| {
            a.get("trigger").and_then(Value::as_str) == Some(trigger)
                && a.get("status").and_then(Value::as_str) == Some("active")
                && a.get("acknowledged").and_then(Value::as_bool) == Some(false)
        })
    }

    /// Whether an active auto-resolvable alert exists for `trigger`
    /// (the precondition of every resolution rule).
    pub fn has_auto_resolvable_alert(&self, trigger: &str) -> bool {
        self.active_alerts().iter().any(|a| {
            a.get("trigger").and_then(Value::as_str) == Some(trigger)
                && a.get("status").and_then(Value::as_str) == Some("active")
                && a.get("autoResolvable").and_then(Value::as_bool) == Some(true)
        })
    }

    /// AIS targets as (mmsi, position) pairs. Reads `aisTargets` with an
    /// `ais.targets` fallback for older feeders.
    pub fn ais_targets(&self) -> Vec<(String, Position)> {
        let map = self
            .get("aisTargets")
            .and_then(Value::as_object)
            .filter(|m| !m.is_empty())
            .or_else(|| self.get("ais.targets").and_then(Value::as_object));
        let Some(map) = map else {
            return Vec::new();
        };
        map.iter()
            .filter_map(|(mmsi, target)| position_of(target).map(|p| (mmsi.clone(), p)))
            .collect()
    }
}

fn position_of(value: &Value) -> Option<Position> {
    let obj = if value.get("latitude").is_some() {
        value
    } else {
        value.get("position")?
    };
    Some(Position {
        latitude: obj.get("latitude")?.as_f64()?,
        longitude: obj.get("longitude")?.as_f64()?,
    })
}
