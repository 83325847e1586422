//! Everything the engine owns, in one struct.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::budget::StationHydraulics;
use crate::schedule::Schedule;
use crate::weather::{CurrentWeather, ForecastBlock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StationStatus {
    #[default]
    Stopped,
    Sprinkling,
}

impl fmt::Display for StationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StationStatus::Stopped => "Stopped",
            StationStatus::Sprinkling => "Sprinkling",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControllerStatus {
    #[default]
    On,
    Off,
}

impl fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ControllerStatus::On => "On",
            ControllerStatus::Off => "Off",
        })
    }
}

/// A switch-driven session, persisted so a restart can still end it on time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveIrrigation {
    pub station: usize,
    pub start_at: DateTime<FixedOffset>,
    pub end_at: DateTime<FixedOffset>,
    pub duration_minutes: u32,
}

/// Per-station millimetre counters, rebuilt at each daily reset.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DailyBudget {
    pub target_mm: Vec<f64>,
    pub applied_mm: Vec<f64>,
    pub forecasted_sprinkle_mm: Vec<f64>,
    pub rain_total_mm: f64,
    pub rain_forecast_mm: f64,
    pub rain_time_minutes: f64,
}

impl DailyBudget {
    pub fn zeroed(num_stations: usize) -> Self {
        Self {
            target_mm: vec![0.0; num_stations],
            applied_mm: vec![0.0; num_stations],
            forecasted_sprinkle_mm: vec![0.0; num_stations],
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WeatherState {
    pub will_rain_today: bool,
    pub has_rained_today: bool,
    pub is_raining_now: bool,
    pub forecast: Vec<ForecastBlock>,
    pub current: Option<CurrentWeather>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineState {
    pub budget: DailyBudget,
    pub weather: WeatherState,
    pub manual_duration_min: u32,
    pub flow_rates_lpm: Vec<f64>,
    pub total_water_consumption_l: f64,
    pub last_reset: Option<DateTime<FixedOffset>>,
    pub last_rain: Option<DateTime<FixedOffset>>,
    pub last_sprinkle: Option<DateTime<FixedOffset>>,
    pub schedule: Option<Schedule>,
    /// At most one per station.
    pub active_sessions: Vec<ActiveIrrigation>,
    pub controller: ControllerStatus,

    // Runtime only, never persisted.
    pub stations: Vec<StationStatus>,
    pub next_schedule: Option<DateTime<FixedOffset>>,
}

impl EngineState {
    pub fn new(num_stations: usize, flow_rates_lpm: Vec<f64>, manual_duration_min: u32) -> Self {
        Self {
            budget: DailyBudget::zeroed(num_stations),
            weather: WeatherState::default(),
            manual_duration_min,
            flow_rates_lpm,
            total_water_consumption_l: 0.0,
            last_reset: None,
            last_rain: None,
            last_sprinkle: None,
            schedule: None,
            active_sessions: Vec::new(),
            controller: ControllerStatus::On,
            stations: vec![StationStatus::Stopped; num_stations],
            next_schedule: None,
        }
    }

    pub fn num_stations(&self) -> usize {
        self.stations.len()
    }

    pub fn hydraulics(&self, areas_m2: &[f64]) -> Vec<StationHydraulics> {
        self.flow_rates_lpm
            .iter()
            .enumerate()
            .map(|(idx, flow)| StationHydraulics {
                flow_rate_lpm: *flow,
                area_m2: areas_m2.get(idx).copied().unwrap_or(0.0),
            })
            .collect()
    }

    pub fn any_sprinkling(&self) -> bool {
        self.stations.contains(&StationStatus::Sprinkling)
    }

    pub fn set_station(&mut self, station: usize, status: StationStatus) {
        if let Some(slot) = station.checked_sub(1).and_then(|i| self.stations.get_mut(i)) {
            *slot = status;
        }
    }

    pub fn session(&self, station: usize) -> Option<&ActiveIrrigation> {
        self.active_sessions.iter().find(|a| a.station == station)
    }

    /// Record a session, replacing any earlier one for the same station.
    pub fn begin_session(&mut self, session: ActiveIrrigation) {
        self.end_session(session.station);
        self.active_sessions.push(session);
    }

    pub fn end_session(&mut self, station: usize) -> Option<ActiveIrrigation> {
        let idx = self.active_sessions.iter().position(|a| a.station == station)?;
        Some(self.active_sessions.remove(idx))
    }

    pub fn stop_all_stations(&mut self) {
        self.stations.iter_mut().for_each(|s| *s = StationStatus::Stopped);
    }

    /// Resize every per-station array after the station count changed.
    /// Existing values stay, new stations get the default flow rate.
    pub fn resize(&mut self, num_stations: usize, default_flow_rates: &[f64]) {
        let fill = |v: &mut Vec<f64>| v.resize(num_stations, 0.0);
        fill(&mut self.budget.target_mm);
        fill(&mut self.budget.applied_mm);
        fill(&mut self.budget.forecasted_sprinkle_mm);
        let kept = self.flow_rates_lpm.len().min(num_stations);
        self.flow_rates_lpm.truncate(kept);
        for idx in kept..num_stations {
            self.flow_rates_lpm
                .push(default_flow_rates.get(idx).copied().unwrap_or(crate::config::DEFAULT_FLOW_RATE_LPM));
        }
        self.stations.resize(num_stations, StationStatus::Stopped);
        if let Some(schedule) = self.schedule.as_mut() {
            schedule.reconcile_stations(num_stations);
        }
    }
}
