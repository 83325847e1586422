//! The per-month watering schedule and the calendar algorithms built on it.

use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::error::{ControllerError, Result};

pub const MONTHS: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

const DEFAULT_INTERVAL_DAYS: u32 = 2;

// ---------------------------------------------------------------------------
// Time strings
// ---------------------------------------------------------------------------

/// Parse `HH:MM`, `HH:MM:SS` or a bare hour `H` into a time of day.
pub fn parse_time_string(value: &str) -> Result<NaiveTime> {
    let value = value.trim();
    for fmt in ["%H:%M:%S", "%H:%M"] {
        if let Ok(t) = NaiveTime::parse_from_str(value, fmt) {
            return Ok(t);
        }
    }
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
        if let Some(t) = value
            .parse::<u32>()
            .ok()
            .and_then(|h| NaiveTime::from_hms_opt(h, 0, 0))
        {
            return Ok(t);
        }
    }
    Err(ControllerError::config(format!(
        "invalid time format '{value}', expected HH:MM or HH:MM:SS"
    )))
}

// ---------------------------------------------------------------------------
// Month config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthConfig {
    #[serde(default = "default_interval_days")]
    pub interval_days: u32,
    #[serde(default)]
    pub hours: Vec<String>,
    /// Station number (1-based) to minutes per run.
    #[serde(rename = "stations", default, with = "station_keys")]
    pub station_minutes: BTreeMap<usize, u32>,
}

fn default_interval_days() -> u32 {
    DEFAULT_INTERVAL_DAYS
}

impl MonthConfig {
    pub fn empty(num_stations: usize) -> Self {
        Self {
            interval_days: 0,
            hours: Vec::new(),
            station_minutes: (1..=num_stations).map(|s| (s, 0)).collect(),
        }
    }

    pub fn has_hours(&self) -> bool {
        self.hours.iter().any(|h| !h.trim().is_empty())
    }

    pub fn minutes_for(&self, station: usize) -> u32 {
        self.station_minutes.get(&station).copied().unwrap_or(0)
    }

    /// Parsed and chronologically sorted hours. Invalid entries are logged
    /// and dropped.
    pub fn valid_hours(&self) -> Vec<NaiveTime> {
        let mut hours: Vec<NaiveTime> = self
            .hours
            .iter()
            .filter(|h| !h.trim().is_empty())
            .filter_map(|h| match parse_time_string(h) {
                Ok(t) => Some(t),
                Err(e) => {
                    error!(hour = %h, "dropping watering hour: {e}");
                    None
                }
            })
            .collect();
        hours.sort();
        hours
    }
}

/// `{"station_1_minutes": 10}` on the wire, `{1: 10}` in memory.
mod station_keys {
    use serde::de::Deserializer;
    use serde::ser::{SerializeMap, Serializer};
    use serde::Deserialize;
    use serde_json::Value;
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(map: &BTreeMap<usize, u32>, s: S) -> Result<S::Ok, S::Error> {
        let mut out = s.serialize_map(Some(map.len()))?;
        for (station, minutes) in map {
            out.serialize_entry(&format!("station_{station}_minutes"), minutes)?;
        }
        out.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<usize, u32>, D::Error> {
        let raw = BTreeMap::<String, Value>::deserialize(d)?;
        let mut out = BTreeMap::new();
        for (key, value) in raw {
            let Some(station) = parse_key(&key) else {
                tracing::warn!(key = %key, "ignoring unknown schedule station key");
                continue;
            };
            let minutes = value
                .as_u64()
                .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
                .unwrap_or(0);
            out.insert(station, u32::try_from(minutes).unwrap_or(u32::MAX));
        }
        Ok(out)
    }

    pub(super) fn parse_key(key: &str) -> Option<usize> {
        key.strip_prefix("station_")?
            .strip_suffix("_minutes")?
            .parse()
            .ok()
            .filter(|n| *n > 0)
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Twelve month configs, index 0 = January.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<MonthConfig>", into = "Vec<MonthConfig>")]
pub struct Schedule {
    months: Vec<MonthConfig>,
}

impl TryFrom<Vec<MonthConfig>> for Schedule {
    type Error = ControllerError;

    fn try_from(months: Vec<MonthConfig>) -> Result<Self> {
        if months.len() != 12 {
            return Err(ControllerError::config(format!(
                "schedule must have 12 months, got {}",
                months.len()
            )));
        }
        Ok(Self { months })
    }
}

impl From<Schedule> for Vec<MonthConfig> {
    fn from(s: Schedule) -> Self {
        s.months
    }
}

impl Schedule {
    pub fn empty(num_stations: usize) -> Self {
        Self {
            months: (0..12).map(|_| MonthConfig::empty(num_stations)).collect(),
        }
    }

    pub fn months(&self) -> &[MonthConfig] {
        &self.months
    }

    /// `month0` is zero-based (January = 0).
    pub fn month(&self, month0: usize) -> &MonthConfig {
        &self.months[month0 % 12]
    }

    pub fn month_mut(&mut self, month0: usize) -> &mut MonthConfig {
        &mut self.months[month0 % 12]
    }

    pub fn for_date(&self, date: NaiveDate) -> &MonthConfig {
        self.month(date.month0() as usize)
    }

    /// Make every month carry exactly stations `1..=num_stations`: existing
    /// values stay, new stations get 0, removed stations are dropped.
    /// Returns whether anything changed.
    pub fn reconcile_stations(&mut self, num_stations: usize) -> bool {
        let mut changed = false;
        for month in &mut self.months {
            let before = month.station_minutes.len();
            month.station_minutes.retain(|s, _| (1..=num_stations).contains(s));
            changed |= month.station_minutes.len() != before;
            for station in 1..=num_stations {
                if !month.station_minutes.contains_key(&station) {
                    month.station_minutes.insert(station, 0);
                    changed = true;
                }
            }
        }
        changed
    }

    /// First month with hours, scanning forward from `month0` and wrapping.
    pub fn first_month_with_hours(&self, month0: usize) -> Option<&MonthConfig> {
        (0..12)
            .map(|i| self.month(month0 + i))
            .find(|m| m.has_hours())
    }
}

// ---------------------------------------------------------------------------
// Calendar algorithms
// ---------------------------------------------------------------------------

/// Most recent rain or sprinkle event.
pub fn last_event(
    last_rain: Option<DateTime<FixedOffset>>,
    last_sprinkle: Option<DateTime<FixedOffset>>,
) -> Option<DateTime<FixedOffset>> {
    last_rain.into_iter().chain(last_sprinkle).max()
}

/// True when fewer than `interval_days` calendar days have passed since the
/// last event.
pub fn too_soon_since(last_event: Option<DateTime<FixedOffset>>, today: NaiveDate, interval_days: u32) -> bool {
    match last_event {
        Some(ts) => (today - ts.date_naive()).num_days() < i64::from(interval_days),
        None => false,
    }
}

/// Inputs for [`next_watering`].
#[derive(Debug, Clone, Copy)]
pub struct WateringOutlook {
    pub rain_today: bool,
    pub last_event: Option<DateTime<FixedOffset>>,
}

/// The next moment a scheduled watering could happen.
pub fn next_watering(schedule: &Schedule, clock: &dyn Clock, outlook: WateringOutlook) -> Option<DateTime<FixedOffset>> {
    let now = clock.now();
    let today = now.date_naive();
    let month_config = schedule.first_month_with_hours(today.month0() as usize)?;
    let interval = u64::from(month_config.interval_days);

    let mut day = if outlook.rain_today {
        debug!("rain today, pushing next watering out by the interval");
        today.checked_add_days(Days::new(interval))?
    } else {
        today
    };

    if let Some(last) = outlook.last_event {
        if too_soon_since(Some(last), today, month_config.interval_days) {
            day = last.date_naive().checked_add_days(Days::new(interval))?;
        }
    }

    let mut guard = 0;
    while !schedule.for_date(day).has_hours() {
        day = day.succ_opt()?;
        guard += 1;
        if guard > 366 {
            warn!("no month with watering hours found while searching forward");
            return None;
        }
    }

    let hours = month_config.valid_hours();
    let at = |date: NaiveDate, t: NaiveTime| clock.resolve_local(date.and_time(t));

    if let Some(next) = hours.iter().filter_map(|t| at(day, *t)).find(|ts| *ts > now) {
        return Some(next);
    }
    let first = hours.first()?;
    at(day.succ_opt()?, *first)
}

/// Count of this month's valid hours at or after the current `HH:MM`,
/// including the slot that is running right now. Never less than 1.
pub fn occurrences_left(month: &MonthConfig, now: DateTime<FixedOffset>) -> usize {
    let current = (now.hour(), now.minute());
    month
        .valid_hours()
        .iter()
        .filter(|t| (t.hour(), t.minute()) >= current)
        .count()
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    fn month(hours: &[&str], interval_days: u32) -> MonthConfig {
        MonthConfig {
            interval_days,
            hours: hours.iter().map(|h| h.to_string()).collect(),
            station_minutes: BTreeMap::from([(1, 10), (2, 5)]),
        }
    }

    fn june_schedule(hours: &[&str], interval_days: u32) -> Schedule {
        let mut s = Schedule::empty(2);
        *s.month_mut(5) = month(hours, interval_days);
        s
    }

    // -- parse_time_string --------------------------------------------------

    #[test]
    fn parses_hh_mm_and_seconds() {
        assert_eq!(parse_time_string("06:30").unwrap(), NaiveTime::from_hms_opt(6, 30, 0).unwrap());
        assert_eq!(parse_time_string("21:05:09").unwrap(), NaiveTime::from_hms_opt(21, 5, 9).unwrap());
    }

    #[test]
    fn parses_bare_hour() {
        assert_eq!(parse_time_string("6").unwrap(), NaiveTime::from_hms_opt(6, 0, 0).unwrap());
        assert_eq!(parse_time_string(" 23 ").unwrap(), NaiveTime::from_hms_opt(23, 0, 0).unwrap());
    }

    #[test]
    fn rejects_garbage_hours() {
        assert!(parse_time_string("24").is_err());
        assert!(parse_time_string("7am").is_err());
        assert!(parse_time_string("25:00").is_err());
        assert!(parse_time_string("").is_err());
    }

    #[test]
    fn valid_hours_drops_invalid_and_sorts() {
        let m = month(&["18:00", "bogus", "6", ""], 1);
        let hours = m.valid_hours();
        assert_eq!(
            hours,
            vec![NaiveTime::from_hms_opt(6, 0, 0).unwrap(), NaiveTime::from_hms_opt(18, 0, 0).unwrap()]
        );
    }

    // -- Wire format --------------------------------------------------------

    #[test]
    fn month_uses_station_key_wire_format() {
        let json = serde_json::to_value(month(&["06:00"], 2)).unwrap();
        assert_eq!(json["stations"]["station_1_minutes"], 10);
        assert_eq!(json["stations"]["station_2_minutes"], 5);

        let back: MonthConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.minutes_for(1), 10);
    }

    #[test]
    fn month_missing_interval_defaults_to_two() {
        let m: MonthConfig = serde_json::from_str(r#"{"hours": ["6"], "stations": {}}"#).unwrap();
        assert_eq!(m.interval_days, 2);
    }

    #[test]
    fn month_ignores_bad_station_keys_and_values() {
        let m: MonthConfig = serde_json::from_str(
            r#"{"interval_days": 1, "hours": [], "stations": {"station_1_minutes": "7", "zone_2": 3, "station_3_minutes": null}}"#,
        )
        .unwrap();
        assert_eq!(m.minutes_for(1), 7);
        assert_eq!(m.minutes_for(3), 0);
        assert_eq!(m.station_minutes.len(), 2);
    }

    #[test]
    fn schedule_requires_twelve_months() {
        let eleven = serde_json::to_value(vec![MonthConfig::empty(1); 11]).unwrap();
        assert!(serde_json::from_value::<Schedule>(eleven).is_err());

        let twelve = serde_json::to_value(vec![MonthConfig::empty(1); 12]).unwrap();
        assert!(serde_json::from_value::<Schedule>(twelve).is_ok());
    }

    // -- Station reconciliation ---------------------------------------------

    #[test]
    fn reconcile_adds_and_drops_stations() {
        let mut s = june_schedule(&["06:00"], 1);
        assert!(s.reconcile_stations(3));
        assert_eq!(s.month(5).minutes_for(1), 10);
        assert_eq!(s.month(5).station_minutes.get(&3), Some(&0));

        assert!(s.reconcile_stations(1));
        assert_eq!(s.month(5).station_minutes.len(), 1);
        assert_eq!(s.month(0).station_minutes.len(), 1);

        assert!(!s.reconcile_stations(1));
    }

    // -- Month scan -----------------------------------------------------------

    #[test]
    fn first_month_with_hours_wraps() {
        let mut s = Schedule::empty(1);
        s.month_mut(1).hours = vec!["7".into()];
        let found = s.first_month_with_hours(10).unwrap();
        assert_eq!(found.hours, vec!["7".to_string()]);
        assert!(Schedule::empty(1).first_month_with_hours(0).is_none());
    }

    // -- Interval gate --------------------------------------------------------

    #[test]
    fn interval_gate_counts_calendar_days() {
        let clock = ManualClock::at("2025-06-10 08:00:00");
        let today = clock.now().date_naive();
        let two_days_ago = clock.now() - Duration::days(2);
        assert!(too_soon_since(Some(two_days_ago), today, 3));
        assert!(!too_soon_since(Some(two_days_ago), today, 2));
        assert!(!too_soon_since(None, today, 5));
    }

    #[test]
    fn last_event_picks_most_recent() {
        let clock = ManualClock::at("2025-06-10 08:00:00");
        let rain = clock.now() - Duration::days(1);
        let sprinkle = clock.now() - Duration::days(3);
        assert_eq!(last_event(Some(rain), Some(sprinkle)), Some(rain));
        assert_eq!(last_event(None, Some(sprinkle)), Some(sprinkle));
        assert_eq!(last_event(None, None), None);
    }

    // -- Remaining occurrences ---------------------------------------------------

    #[test]
    fn occurrences_left_includes_running_slot() {
        let m = month(&["06:00", "18:00"], 1);
        let clock = ManualClock::at("2025-06-10 06:00:42");
        assert_eq!(occurrences_left(&m, clock.now()), 2);

        clock.set(clock.now() + Duration::hours(1));
        assert_eq!(occurrences_left(&m, clock.now()), 1);

        clock.set(clock.now() + Duration::hours(14));
        assert_eq!(occurrences_left(&m, clock.now()), 1, "never below one");
    }

    // -- Next watering date ----------------------------------------------------

    fn outlook(rain_today: bool, last_event: Option<DateTime<FixedOffset>>) -> WateringOutlook {
        WateringOutlook {
            rain_today,
            last_event,
        }
    }

    #[test]
    fn next_watering_later_today() {
        let s = june_schedule(&["06:00", "18:00"], 2);
        let clock = ManualClock::at("2025-06-10 08:00:00");
        let next = next_watering(&s, &clock, outlook(false, None)).unwrap();
        assert_eq!(crate::clock::format_timestamp(&next), "2025-06-10 18:00:00");
    }

    #[test]
    fn next_watering_falls_back_to_tomorrow() {
        let s = june_schedule(&["06:00"], 0);
        let clock = ManualClock::at("2025-06-10 08:00:00");
        let next = next_watering(&s, &clock, outlook(false, None)).unwrap();
        assert_eq!(crate::clock::format_timestamp(&next), "2025-06-11 06:00:00");
    }

    #[test]
    fn next_watering_respects_interval_since_last_event() {
        let s = june_schedule(&["06:00"], 3);
        let clock = ManualClock::at("2025-06-10 05:00:00");
        let yesterday = clock.now() - Duration::days(1);
        let next = next_watering(&s, &clock, outlook(false, Some(yesterday))).unwrap();
        assert_eq!(crate::clock::format_timestamp(&next), "2025-06-12 06:00:00");
    }

    #[test]
    fn next_watering_pushed_by_rain() {
        let s = june_schedule(&["06:00"], 2);
        let clock = ManualClock::at("2025-06-10 05:00:00");
        let next = next_watering(&s, &clock, outlook(true, None)).unwrap();
        assert_eq!(crate::clock::format_timestamp(&next), "2025-06-12 06:00:00");
    }

    #[test]
    fn next_watering_skips_to_month_with_hours() {
        let mut s = Schedule::empty(1);
        *s.month_mut(6) = month(&["07:00"], 0);
        let clock = ManualClock::at("2025-06-20 09:00:00");
        let next = next_watering(&s, &clock, outlook(false, None)).unwrap();
        assert_eq!(crate::clock::format_timestamp(&next), "2025-07-01 07:00:00");
    }

    #[test]
    fn next_watering_none_without_hours() {
        let clock = ManualClock::at("2025-06-20 09:00:00");
        assert!(next_watering(&Schedule::empty(2), &clock, outlook(false, None)).is_none());
    }

    #[test]
    fn next_watering_on_a_clock_change_day_uses_the_new_offset() {
        let mut s = Schedule::empty(1);
        *s.month_mut(2) = month(&["06:00"], 0);
        let clock = ManualClock::at("2025-03-30 00:30:00");
        let change = NaiveDate::from_ymd_opt(2025, 3, 30).unwrap().and_hms_opt(2, 0, 0).unwrap();
        clock.change_offset_at(change, FixedOffset::east_opt(3600).unwrap());

        let next = next_watering(&s, &clock, outlook(false, None)).unwrap();
        assert_eq!(crate::clock::format_timestamp(&next), "2025-03-30 06:00:00");
        assert_eq!(next.offset().local_minus_utc(), 3600);
    }
}
