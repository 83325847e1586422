//! The flat snapshot the engine saves after every transition and loads at
//! startup. Loading never fails: malformed entries are logged and replaced
//! with safe defaults.

use chrono::{DateTime, FixedOffset};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::clock::{format_timestamp, parse_timestamp};
use crate::schedule::Schedule;
use crate::state::{ActiveIrrigation, ControllerStatus, DailyBudget, EngineState, WeatherState};
use crate::weather::{CurrentWeather, ForecastBlock};

/// What to fall back to for anything the snapshot lacks.
#[derive(Debug, Clone, Copy)]
pub struct RestoreDefaults<'a> {
    pub num_stations: usize,
    pub flow_rates_lpm: &'a [f64],
    pub manual_duration_min: u32,
    /// Offset used to read the offset-less timestamps.
    pub offset: FixedOffset,
}

pub fn to_snapshot(state: &EngineState) -> Value {
    let ts = |t: &Option<DateTime<FixedOffset>>| t.as_ref().map(format_timestamp);
    json!({
        "will_it_rain_today": state.weather.will_rain_today,
        "will_it_rain_today_forecast": state.weather.forecast,
        "has_rained_today": state.weather.has_rained_today,
        "is_raining_now": state.weather.is_raining_now,
        "is_raining_now_json": state.weather.current,
        "last_reset": ts(&state.last_reset),
        "last_sprinkle": ts(&state.last_sprinkle),
        "last_rain": ts(&state.last_rain),
        "irrigation_manual_duration": state.manual_duration_min,
        "water_flow_rate": state.flow_rates_lpm,
        "rain_time_today": state.budget.rain_time_minutes,
        "rain_total_amount_today": state.budget.rain_total_mm,
        "rain_total_amount_forecasted_today": state.budget.rain_forecast_mm,
        "total_water_consumption": state.total_water_consumption_l,
        "sprinkle_total_amount_today": state.budget.applied_mm,
        "sprinkle_target_amount_today": state.budget.target_mm,
        "forecasted_sprinkle_today": state.budget.forecasted_sprinkle_mm,
        "schedule": state.schedule,
        "active_irrigation": state.active_sessions.last(),
        "active_irrigations": state.active_sessions,
        "controller_state": state.controller,
    })
}

pub fn restore(snapshot: Option<&Value>, defaults: RestoreDefaults<'_>) -> EngineState {
    let n = defaults.num_stations;
    let mut state = EngineState::new(n, defaults.flow_rates_lpm.to_vec(), defaults.manual_duration_min);

    let Some(map) = snapshot.and_then(Value::as_object) else {
        if snapshot.is_some() {
            warn!("persisted snapshot is not an object, starting fresh");
        }
        return state;
    };
    let offset = defaults.offset;

    state.weather = WeatherState {
        will_rain_today: flag(map, "will_it_rain_today"),
        has_rained_today: flag(map, "has_rained_today"),
        is_raining_now: flag(map, "is_raining_now"),
        forecast: forecast(map),
        current: map
            .get("is_raining_now_json")
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::from_value::<CurrentWeather>(v.clone()).ok()),
    };

    state.budget = DailyBudget {
        target_mm: per_station(map, "sprinkle_target_amount_today", n),
        applied_mm: per_station(map, "sprinkle_total_amount_today", n),
        forecasted_sprinkle_mm: per_station(map, "forecasted_sprinkle_today", n),
        rain_total_mm: number(map, "rain_total_amount_today"),
        rain_forecast_mm: number(map, "rain_total_amount_forecasted_today"),
        rain_time_minutes: number(map, "rain_time_today"),
    };

    if let Some(m) = map.get("irrigation_manual_duration").and_then(Value::as_u64) {
        state.manual_duration_min = u32::try_from(m).unwrap_or(defaults.manual_duration_min).max(1);
    }
    if let Some(rates) = array(map, "water_flow_rate", n) {
        state.flow_rates_lpm = rates;
    }
    state.total_water_consumption_l = number(map, "total_water_consumption");

    state.last_reset = timestamp(map, "last_reset", offset);
    state.last_rain = timestamp(map, "last_rain", offset);
    state.last_sprinkle = timestamp(map, "last_sprinkle", offset);

    state.schedule = match map.get("schedule") {
        None | Some(Value::Null) => None,
        Some(v) => match serde_json::from_value::<Schedule>(v.clone()) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("persisted schedule is invalid, replacing it: {e}");
                None
            }
        },
    };

    state.active_sessions = active_sessions(map, offset);
    state.controller = map
        .get("controller_state")
        .and_then(|v| serde_json::from_value::<ControllerStatus>(v.clone()).ok())
        .unwrap_or_default();

    state
}

// ---------------------------------------------------------------------------
// Field readers
// ---------------------------------------------------------------------------

fn flag(map: &Map<String, Value>, key: &str) -> bool {
    map.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn number(map: &Map<String, Value>, key: &str) -> f64 {
    map.get(key).and_then(Value::as_f64).filter(|v| v.is_finite()).unwrap_or(0.0)
}

fn array(map: &Map<String, Value>, key: &str, len: usize) -> Option<Vec<f64>> {
    let values: Option<Vec<f64>> = map
        .get(key)?
        .as_array()?
        .iter()
        .map(|v| v.as_f64().filter(|f| f.is_finite()))
        .collect();
    match values {
        Some(v) if v.len() == len => Some(v),
        _ => {
            warn!(key, expected = len, "persisted array has the wrong shape, using defaults");
            None
        }
    }
}

fn per_station(map: &Map<String, Value>, key: &str, len: usize) -> Vec<f64> {
    array(map, key, len).unwrap_or_else(|| vec![0.0; len])
}

fn timestamp(map: &Map<String, Value>, key: &str, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
    let raw = map.get(key)?.as_str()?;
    let parsed = parse_timestamp(raw, offset);
    if parsed.is_none() {
        warn!(key, value = raw, "invalid persisted timestamp, ignoring it");
    }
    parsed
}

fn forecast(map: &Map<String, Value>) -> Vec<ForecastBlock> {
    map.get("will_it_rain_today_forecast")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<ForecastBlock>(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Every persisted session, one per station. Older snapshots only carry the
/// single `active_irrigation` record.
fn active_sessions(map: &Map<String, Value>, offset: FixedOffset) -> Vec<ActiveIrrigation> {
    let mut sessions: Vec<ActiveIrrigation> = Vec::new();
    let records = match map.get("active_irrigations").and_then(Value::as_array) {
        Some(items) => items.iter().collect(),
        None => map.get("active_irrigation").into_iter().collect::<Vec<_>>(),
    };
    for session in records.into_iter().filter_map(|v| active_irrigation(v, offset)) {
        sessions.retain(|s| s.station != session.station);
        sessions.push(session);
    }
    sessions
}

/// A record whose `end_at` cannot be read is treated as already expired, so
/// the restart check turns the station off.
fn active_irrigation(value: &Value, offset: FixedOffset) -> Option<ActiveIrrigation> {
    let obj = value.as_object()?;
    let station = obj.get("station").and_then(Value::as_u64).filter(|s| *s > 0)? as usize;
    let read = |key: &str| obj.get(key).and_then(Value::as_str).and_then(|s| parse_timestamp(s, offset));

    let end_at = match read("end_at") {
        Some(t) => t,
        None => {
            warn!(station, "active irrigation has an invalid end_at, treating it as expired");
            DateTime::from_timestamp(0, 0)?.with_timezone(&offset)
        }
    };
    Some(ActiveIrrigation {
        station,
        start_at: read("start_at").unwrap_or(end_at),
        end_at,
        duration_minutes: obj
            .get("duration_minutes")
            .and_then(Value::as_u64)
            .and_then(|m| u32::try_from(m).ok())
            .unwrap_or(0),
    })
}
