//! Weather providers. Both backends normalize into 3-hour [`ForecastBlock`]s
//! and a [`CurrentWeather`] record, so the budget arithmetic never sees
//! provider-specific JSON.

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::clock::Clock;
use crate::error::{ControllerError, Result};

pub mod openweathermap;
pub mod pirateweather;

pub use openweathermap::OpenWeatherMapProvider;
pub use pirateweather::PirateWeatherProvider;

/// Width of one forecast block.
pub const BLOCK_MINUTES: i64 = 180;
/// Probability above which a block counts as rain.
pub const RAIN_PROBABILITY: f64 = 0.50;

// ---------------------------------------------------------------------------
// Normalized records
// ---------------------------------------------------------------------------

/// One 3-hour forecast window, starting at a local wall-clock time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastBlock {
    #[serde(rename = "dt_txt", with = "local_time")]
    pub start: NaiveDateTime,
    #[serde(default)]
    pub pop: f64,
    #[serde(default)]
    pub rain_mm: f64,
}

impl ForecastBlock {
    pub fn end(&self) -> NaiveDateTime {
        self.start + Duration::minutes(BLOCK_MINUTES)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentWeather {
    #[serde(default, with = "local_time::option")]
    pub observed_at: Option<NaiveDateTime>,
    pub is_raining: bool,
    /// Current precipitation rate, 0 when the provider reports none.
    #[serde(default)]
    pub rain_mm_per_hour: f64,
    #[serde(default)]
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RainOutlook {
    pub will_rain: bool,
    pub forecast: Vec<ForecastBlock>,
}

/// `%Y-%m-%d %H:%M:%S` on the wire.
mod local_time {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = crate::clock::TIMESTAMP_FORMAT;

    pub fn serialize<S: Serializer>(t: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&t.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::FORMAT;
        use chrono::NaiveDateTime;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(t: &Option<NaiveDateTime>, s: S) -> Result<S::Ok, S::Error> {
            match t {
                Some(t) => s.collect_str(&t.format(FORMAT)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveDateTime>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|raw| NaiveDateTime::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

// ---------------------------------------------------------------------------
// Block arithmetic
// ---------------------------------------------------------------------------

/// The block has not ended yet and starts no later than today. Works for
/// blocks that are not aligned to 3-hour local boundaries.
fn is_remaining_today(block: &ForecastBlock, now: NaiveDateTime) -> bool {
    block.end() > now && block.start.date() <= now.date()
}

/// The first block of a day from today on, kept so the day total can be
/// stitched after midnight.
fn opens_a_day(block: &ForecastBlock, today: NaiveDate) -> bool {
    block.start.date() >= today && block.start.time() < NaiveTime::MIN + Duration::minutes(BLOCK_MINUTES)
}

/// Any block from the current one to the end of today with pop > 0.5.
pub fn will_rain(blocks: &[ForecastBlock], now: NaiveDateTime) -> bool {
    blocks
        .iter()
        .filter(|b| is_remaining_today(b, now))
        .any(|b| b.pop > RAIN_PROBABILITY)
}

/// Rain still expected today. The block in progress counts for the share
/// of its 180 minutes that has not elapsed yet.
pub fn total_rain_for_today(blocks: &[ForecastBlock], now: NaiveDateTime) -> f64 {
    blocks
        .iter()
        .filter(|b| is_remaining_today(b, now))
        .map(|b| {
            if b.start >= now {
                b.rain_mm
            } else {
                let left = (b.end() - now).num_seconds() as f64;
                b.rain_mm * left / (BLOCK_MINUTES * 60) as f64
            }
        })
        .sum()
}

/// Hour-granular forecast items folded into today's eight blocks: the block
/// pop is the max of its hours, the block mm is the sum of hourly rates.
pub fn aggregate_hourly(hourly: &[(NaiveDateTime, f64, f64)], today: NaiveDate) -> Vec<ForecastBlock> {
    (0..8)
        .filter_map(|i| today.and_hms_opt(i * 3, 0, 0))
        .map(|start| {
            let end = start + Duration::minutes(BLOCK_MINUTES);
            let (pop, rain_mm) = hourly
                .iter()
                .filter(|(t, _, _)| t.date() == today && *t >= start && *t < end)
                .fold((0.0_f64, 0.0_f64), |(pop, mm), (_, p, rate)| (pop.max(*p), mm + rate));
            ForecastBlock { start, pop, rain_mm }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Caches
// ---------------------------------------------------------------------------

/// Time-boxed caches shared by both backends.
#[derive(Debug)]
pub struct WeatherCache {
    timeout: Duration,
    current: Mutex<Option<(DateTime<FixedOffset>, CurrentWeather)>>,
    forecast: Mutex<ForecastCache>,
}

#[derive(Debug, Default)]
struct ForecastCache {
    blocks: Vec<ForecastBlock>,
    fetched_at: Option<DateTime<FixedOffset>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl WeatherCache {
    pub fn new(timeout_min: u64) -> Self {
        Self {
            timeout: Duration::minutes(timeout_min.max(1) as i64),
            current: Mutex::new(None),
            forecast: Mutex::new(ForecastCache::default()),
        }
    }

    pub fn fresh_current(&self, now: DateTime<FixedOffset>) -> Option<CurrentWeather> {
        let guard = lock(&self.current);
        let (at, current) = guard.as_ref()?;
        (now - *at < self.timeout).then(|| current.clone())
    }

    pub fn store_current(&self, now: DateTime<FixedOffset>, current: CurrentWeather) {
        *lock(&self.current) = Some((now, current));
    }

    pub fn fresh_forecast(&self, now: DateTime<FixedOffset>) -> Option<Vec<ForecastBlock>> {
        let guard = lock(&self.forecast);
        let at = guard.fetched_at?;
        (!guard.blocks.is_empty() && now - at < self.timeout).then(|| guard.blocks.clone())
    }

    /// Merge freshly fetched blocks: same start replaces, new start appends.
    /// Blocks that ended before the current block or belong to another day
    /// are dropped, except the first block of each day from today on.
    pub fn merge_forecast(&self, now: DateTime<FixedOffset>, fetched: Vec<ForecastBlock>) -> Vec<ForecastBlock> {
        let mut guard = lock(&self.forecast);
        for block in fetched {
            match guard.blocks.iter_mut().find(|b| b.start == block.start) {
                Some(existing) => {
                    debug!(start = %block.start, "replacing forecast block");
                    *existing = block;
                }
                None => guard.blocks.push(block),
            }
        }
        let local = now.naive_local();
        guard
            .blocks
            .retain(|b| is_remaining_today(b, local) || opens_a_day(b, local.date()));
        guard.blocks.sort_by_key(|b| b.start);
        guard.fetched_at = Some(now);
        guard.blocks.clone()
    }

    /// Re-populate from a persisted snapshot. Seeded data is never treated as
    /// fresh, it only provides blocks to stitch on the next fetch.
    pub fn seed(&self, forecast: Vec<ForecastBlock>, current: Option<CurrentWeather>) {
        lock(&self.forecast).blocks = forecast;
        if let Some(current) = current {
            // An epoch timestamp keeps it stale.
            if let Some(epoch) = DateTime::from_timestamp(0, 0) {
                *lock(&self.current) = Some((epoch.fixed_offset(), current));
            }
        }
    }

    pub fn cached_forecast(&self) -> Vec<ForecastBlock> {
        lock(&self.forecast).blocks.clone()
    }

    pub fn cached_current(&self) -> Option<CurrentWeather> {
        lock(&self.current).as_ref().map(|(_, c)| c.clone())
    }
}

// ---------------------------------------------------------------------------
// Provider contract
// ---------------------------------------------------------------------------

#[async_trait]
pub trait WeatherProvider: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn clock(&self) -> &dyn Clock;

    fn cache(&self) -> &WeatherCache;

    /// Current conditions, cached for the configured timeout.
    async fn current_weather(&self) -> Result<CurrentWeather>;

    /// Today's blocks from the current one on, plus the first block of the
    /// next day.
    async fn forecast(&self) -> Result<Vec<ForecastBlock>>;

    async fn is_raining(&self) -> Result<CurrentWeather> {
        self.current_weather().await
    }

    async fn will_it_rain(&self) -> Result<RainOutlook> {
        let forecast = self.forecast().await?;
        let now = self.clock().now().naive_local();
        Ok(RainOutlook {
            will_rain: will_rain(&forecast, now),
            forecast,
        })
    }

    async fn total_rain_forecast_for_today(&self) -> Result<f64> {
        let forecast = self.forecast().await?;
        Ok(total_rain_for_today(&forecast, self.clock().now().naive_local()))
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    None,
    OpenWeatherMap,
    PirateWeather,
}

/// What a backend needs to talk to its API.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub api_key: String,
    pub latitude: f64,
    pub longitude: f64,
    pub cache_timeout_min: u64,
    /// Overrides the public endpoint (tests point this at a local server).
    pub base_url: Option<String>,
}

pub fn build_provider(
    kind: ProviderKind,
    settings: ProviderSettings,
    clock: Arc<dyn Clock>,
) -> Option<Arc<dyn WeatherProvider>> {
    match kind {
        ProviderKind::None => None,
        ProviderKind::OpenWeatherMap => Some(Arc::new(OpenWeatherMapProvider::new(settings, clock))),
        ProviderKind::PirateWeather => Some(Arc::new(PirateWeatherProvider::new(settings, clock))),
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

pub(crate) async fn get_json(
    http: &Client,
    what: &'static str,
    url: &str,
    query: &[(&str, String)],
) -> Result<Value> {
    let res = http.get(url).query(query).send().await?;
    let status = res.status();
    let body = res.text().await?;

    if !status.is_success() {
        return Err(ControllerError::Status {
            what,
            status: status.as_u16(),
            body: truncate_body(&body),
        });
    }

    serde_json::from_str(&body).map_err(|source| ControllerError::Decode { what, source })
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

/// Unix seconds to local wall-clock time in `offset`.
pub(crate) fn unix_to_local(secs: i64, offset: FixedOffset) -> Option<NaiveDateTime> {
    DateTime::from_timestamp(secs, 0).map(|t| t.with_timezone(&offset).naive_local())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, crate::clock::TIMESTAMP_FORMAT).unwrap()
    }

    fn block(start: &str, pop: f64, rain_mm: f64) -> ForecastBlock {
        ForecastBlock {
            start: at(start),
            pop,
            rain_mm,
        }
    }

    // -- Proration -----------------------------------------------------------

    #[test]
    fn boundary_counts_full_block() {
        let blocks = vec![block("2025-06-10 09:00:00", 0.2, 6.0)];
        assert_eq!(total_rain_for_today(&blocks, at("2025-06-10 09:00:00")), 6.0);
    }

    #[test]
    fn midpoint_counts_half_block() {
        let blocks = vec![block("2025-06-10 09:00:00", 0.2, 6.0)];
        assert_eq!(total_rain_for_today(&blocks, at("2025-06-10 10:30:00")), 3.0);
    }

    #[test]
    fn past_and_other_day_blocks_are_ignored() {
        let blocks = vec![
            block("2025-06-10 03:00:00", 0.9, 4.0),
            block("2025-06-10 12:00:00", 0.1, 1.5),
            block("2025-06-11 00:00:00", 0.9, 9.0),
        ];
        assert_eq!(total_rain_for_today(&blocks, at("2025-06-10 10:30:00")), 1.5);
    }

    // -- Will it rain ----------------------------------------------------------

    #[test]
    fn will_rain_only_looks_at_remaining_blocks() {
        let blocks = vec![
            block("2025-06-10 03:00:00", 0.9, 4.0),
            block("2025-06-10 09:00:00", 0.5, 0.0),
            block("2025-06-11 00:00:00", 0.9, 9.0),
        ];
        assert!(!will_rain(&blocks, at("2025-06-10 10:00:00")));

        let mut wetter = blocks.clone();
        wetter[1].pop = 0.51;
        assert!(will_rain(&wetter, at("2025-06-10 10:00:00")));
    }

    #[test]
    fn half_hour_offset_blocks_keep_the_one_in_progress() {
        // UTC+05:30 turns the 3-hourly UTC grid into 02:30, 05:30, 08:30...
        let blocks = vec![
            block("2025-06-10 05:30:00", 0.9, 4.0),
            block("2025-06-10 08:30:00", 0.8, 6.0),
            block("2025-06-10 11:30:00", 0.1, 1.0),
        ];
        let now = at("2025-06-10 10:00:00");
        assert!(will_rain(&blocks, now));
        assert_eq!(total_rain_for_today(&blocks, now), 4.0);
        assert!(!will_rain(&blocks[..1], now));
    }

    // -- Hourly aggregation ------------------------------------------------------

    #[test]
    fn hourly_items_fold_into_blocks() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
        let hourly = vec![
            (at("2025-06-10 06:00:00"), 0.2, 1.0),
            (at("2025-06-10 07:00:00"), 0.7, 0.5),
            (at("2025-06-10 08:00:00"), 0.1, 0.0),
            (at("2025-06-11 06:00:00"), 1.0, 8.0),
        ];
        let blocks = aggregate_hourly(&hourly, today);
        assert_eq!(blocks.len(), 8);
        assert_eq!(blocks[2].start, at("2025-06-10 06:00:00"));
        assert_eq!(blocks[2].pop, 0.7);
        assert_eq!(blocks[2].rain_mm, 1.5);
        assert_eq!(blocks[3].rain_mm, 0.0);
    }

    // -- Cache ---------------------------------------------------------------------

    #[test]
    fn merge_replaces_and_appends_then_filters() {
        let clock = ManualClock::at("2025-06-10 10:00:00");
        let cache = WeatherCache::new(5);
        cache.seed(
            vec![
                block("2025-06-09 21:00:00", 0.3, 1.0),
                block("2025-06-10 00:00:00", 0.3, 1.0),
                block("2025-06-10 09:00:00", 0.3, 1.0),
            ],
            None,
        );

        let merged = cache.merge_forecast(
            clock.now(),
            vec![
                block("2025-06-10 09:00:00", 0.8, 2.0),
                block("2025-06-10 12:00:00", 0.1, 0.0),
                block("2025-06-11 00:00:00", 0.1, 0.0),
            ],
        );

        let starts: Vec<String> = merged.iter().map(|b| b.start.to_string()).collect();
        assert_eq!(
            starts,
            vec![
                "2025-06-10 00:00:00",
                "2025-06-10 09:00:00",
                "2025-06-10 12:00:00",
                "2025-06-11 00:00:00"
            ]
        );
        assert_eq!(merged[1].pop, 0.8);
    }

    #[test]
    fn merge_keeps_unaligned_day_openers() {
        let clock = ManualClock::at("2025-06-10 10:00:00");
        let cache = WeatherCache::new(5);
        cache.seed(
            vec![
                block("2025-06-10 02:30:00", 0.3, 1.0),
                block("2025-06-10 05:30:00", 0.3, 1.0),
            ],
            None,
        );
        let merged = cache.merge_forecast(
            clock.now(),
            vec![
                block("2025-06-10 08:30:00", 0.2, 0.5),
                block("2025-06-11 02:30:00", 0.1, 0.0),
            ],
        );
        let starts: Vec<String> = merged.iter().map(|b| b.start.to_string()).collect();
        assert_eq!(
            starts,
            vec!["2025-06-10 02:30:00", "2025-06-10 08:30:00", "2025-06-11 02:30:00"]
        );
    }

    #[test]
    fn forecast_cache_expires() {
        let clock = ManualClock::at("2025-06-10 10:00:00");
        let cache = WeatherCache::new(5);
        cache.merge_forecast(clock.now(), vec![block("2025-06-10 12:00:00", 0.1, 0.0)]);
        assert!(cache.fresh_forecast(clock.now()).is_some());

        clock.advance(Duration::minutes(5));
        assert!(cache.fresh_forecast(clock.now()).is_none());
    }

    #[test]
    fn seeded_current_is_stale_but_available() {
        let clock = ManualClock::at("2025-06-10 10:00:00");
        let cache = WeatherCache::new(5);
        let current = CurrentWeather {
            observed_at: None,
            is_raining: true,
            rain_mm_per_hour: 1.0,
            raw: Value::Null,
        };
        cache.seed(Vec::new(), Some(current.clone()));
        assert!(cache.fresh_current(clock.now()).is_none());
        assert_eq!(cache.cached_current(), Some(current));
    }

    #[test]
    fn block_wire_format_uses_dt_txt() {
        let json = serde_json::to_value(block("2025-06-10 09:00:00", 0.4, 1.25)).unwrap();
        assert_eq!(json["dt_txt"], "2025-06-10 09:00:00");
        let back: ForecastBlock = serde_json::from_value(json).unwrap();
        assert_eq!(back.rain_mm, 1.25);
    }
}
