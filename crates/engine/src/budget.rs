//! Daily water budget arithmetic, in millimetres over a station's area.

use chrono::{DateTime, FixedOffset, NaiveDate};
use tracing::debug;

use crate::schedule::{too_soon_since, MonthConfig};

/// Hydraulic parameters of one station.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StationHydraulics {
    pub flow_rate_lpm: f64,
    pub area_m2: f64,
}

impl StationHydraulics {
    /// Area used in divisions: zero or unset counts as 1 m².
    pub fn effective_area(&self) -> f64 {
        if self.area_m2 > 0.0 && self.area_m2.is_finite() {
            self.area_m2
        } else {
            1.0
        }
    }

    /// Depth of water applied per minute of watering.
    pub fn mm_per_minute(&self) -> f64 {
        self.flow_rate_lpm / self.effective_area()
    }

    /// Litres delivered per one-second tick.
    pub fn litres_per_tick(&self) -> f64 {
        self.flow_rate_lpm / 60.0
    }

    /// Millimetres applied per one-second tick.
    pub fn mm_per_tick(&self) -> f64 {
        self.mm_per_minute() / 60.0
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Today's target per station. Zero everywhere when the month has no hours
/// or the last rain/sprinkle event is closer than the month's interval.
pub fn daily_targets(
    month: &MonthConfig,
    stations: &[StationHydraulics],
    last_event: Option<DateTime<FixedOffset>>,
    today: NaiveDate,
) -> Vec<f64> {
    let mut targets = vec![0.0; stations.len()];

    if too_soon_since(last_event, today, month.interval_days) {
        debug!(interval_days = month.interval_days, "too soon since last rain or sprinkle");
        return targets;
    }

    let occurrences = month.valid_hours().len() as f64;
    if occurrences == 0.0 {
        return targets;
    }

    for (idx, station) in stations.iter().enumerate() {
        let total_minutes = f64::from(month.minutes_for(idx + 1)) * occurrences;
        if total_minutes > 0.0 {
            targets[idx] = round2(station.mm_per_minute() * total_minutes);
        }
    }
    debug!(?targets, "sprinkle target amounts");
    targets
}

/// `max(0, target - forecast)` per station, computed at reset.
pub fn forecasted_sprinkle(targets: &[f64], rain_forecast_mm: f64) -> Vec<f64> {
    targets.iter().map(|t| (t - rain_forecast_mm).max(0.0)).collect()
}

/// Water still owed to a station today after what was applied and what
/// the sky is expected to deliver.
pub fn remaining_mm(target_mm: f64, applied_mm: f64, rain_forecast_mm: f64) -> f64 {
    (target_mm - (applied_mm + rain_forecast_mm)).max(0.0)
}

/// True when at least one station is still short of its target.
pub fn needs_watering(targets: &[f64], applied: &[f64], rain_forecast_mm: f64) -> bool {
    targets
        .iter()
        .zip(applied.iter().chain(std::iter::repeat(&0.0)))
        .enumerate()
        .any(|(idx, (target, applied))| {
            let remaining = target - (applied + rain_forecast_mm);
            if remaining > 0.0 {
                debug!(
                    station = idx + 1,
                    target, applied, rain = rain_forecast_mm, remaining, "station needs more water"
                );
            }
            remaining > 0.0
        })
}

/// Minutes to run this slot so the remaining need is spread evenly over
/// the slots left today.
pub fn minutes_needed(daily_remaining_mm: f64, occurrences_left: usize, station: &StationHydraulics) -> u32 {
    let mm_per_minute = station.mm_per_minute();
    if daily_remaining_mm <= 0.0 || mm_per_minute <= 0.0 {
        return 0;
    }
    let per_run = daily_remaining_mm / occurrences_left.max(1) as f64;
    // Absorb float noise such as 12.000000000000002 / 1.2.
    let minutes = (per_run / mm_per_minute - 1e-9).ceil();
    if minutes <= 0.0 {
        0
    } else {
        minutes.min(f64::from(u32::MAX)) as u32
    }
}

/// Rain that fell during one poll interval at `rate_mm_per_h`.
pub fn rain_per_poll(rate_mm_per_h: f64, poll_interval_sec: u64) -> f64 {
    if rate_mm_per_h <= 0.0 {
        return 0.0;
    }
    rate_mm_per_h / 60.0 * (poll_interval_sec as f64 / 60.0)
}
