//! Controller configuration: stations, control method, weather, soil
//! moisture and the remote action mapping.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::actions::{Action, ServiceActions};
use crate::error::{ControllerError, Result};
use crate::host::EntityStates;
use crate::weather::{ProviderKind, ProviderSettings};

pub const MIN_POLL_INTERVAL_SEC: u64 = 10;
pub const DEFAULT_FLOW_RATE_LPM: f64 = 12.0;
pub const DEFAULT_MANUAL_DURATION_MIN: u32 = 10;

// ---------------------------------------------------------------------------
// Structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// `AA:BB:CC:DD:EE:FF`, or `Label - AA:BB:CC:DD:EE:FF`.
    #[serde(default)]
    pub controller_mac: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_sec: u64,
    #[serde(default)]
    pub sprinkle_with_rain: bool,
    #[serde(default = "default_manual_duration")]
    pub manual_duration_min: u32,
    #[serde(default)]
    pub control_method: ControlMethod,
    #[serde(default)]
    pub stations: Vec<StationConfig>,
    #[serde(default)]
    pub weather: WeatherConfig,
    #[serde(default)]
    pub soil_moisture: Option<SoilMoistureConfig>,
    /// Remote mapping; `preset = "solem_toolkit"` fills unset actions.
    #[serde(default)]
    pub actions: ActionsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMethod {
    Switch,
    #[default]
    Service,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub area_m2: f64,
    #[serde(default = "default_flow_rate")]
    pub flow_rate_lpm: f64,
    #[serde(default)]
    pub switch_entity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Entity carrying `latitude`/`longitude` attributes.
    #[serde(default)]
    pub location_entity: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default = "default_cache_timeout")]
    pub cache_timeout_min: u64,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::None,
            api_key: None,
            location_entity: None,
            latitude: None,
            longitude: None,
            cache_timeout_min: default_cache_timeout(),
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoilMoistureConfig {
    pub sensor: String,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionsConfig {
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(flatten)]
    pub custom: ServiceActions,
}

fn default_name() -> String {
    "Smart Water Controller".to_string()
}
fn default_poll_interval() -> u64 {
    60
}
fn default_manual_duration() -> u32 {
    DEFAULT_MANUAL_DURATION_MIN
}
fn default_flow_rate() -> f64 {
    DEFAULT_FLOW_RATE_LPM
}
fn default_cache_timeout() -> u64 {
    5
}
fn default_threshold() -> f64 {
    40.0
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl StationConfig {
    pub fn display_name(&self, station: usize) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => format!("Station {station}"),
        }
    }
}

impl ActionsConfig {
    /// Preset entries first, explicit entries on top.
    pub fn resolve(&self) -> ServiceActions {
        let mut base = match self.preset.as_deref() {
            Some("solem_toolkit") => ServiceActions::solem_toolkit(),
            _ => ServiceActions::default(),
        };
        let custom = self.custom.clone();
        if custom.sprinkle_station.is_some() {
            base.sprinkle_station = custom.sprinkle_station;
        }
        if custom.stop_sprinkle.is_some() {
            base.stop_sprinkle = custom.stop_sprinkle;
        }
        if custom.turn_on.is_some() {
            base.turn_on = custom.turn_on;
        }
        if custom.turn_off.is_some() {
            base.turn_off = custom.turn_off;
        }
        base
    }
}

impl WeatherConfig {
    /// Provider settings, or `None` when the provider is off or lacks a key or
    /// a location. Location comes from explicit coordinates first, then from
    /// the location entity's attributes.
    pub fn resolve(&self, entities: &dyn EntityStates) -> Option<(ProviderKind, ProviderSettings)> {
        if self.provider == ProviderKind::None {
            return None;
        }
        let Some(api_key) = self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) else {
            tracing::warn!(provider = ?self.provider, "weather provider has no API key, disabling");
            return None;
        };

        let coordinates = match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => self.location_entity.as_deref().and_then(|id| {
                let state = entities.state(id)?;
                Some((state.attribute_f64("latitude")?, state.attribute_f64("longitude")?))
            }),
        };
        let Some((latitude, longitude)) = coordinates else {
            tracing::warn!(provider = ?self.provider, "weather provider has no location, disabling");
            return None;
        };

        Some((
            self.provider,
            ProviderSettings {
                api_key: api_key.to_string(),
                latitude,
                longitude,
                cache_timeout_min: self.cache_timeout_min.max(1),
                base_url: self.base_url.clone(),
            },
        ))
    }
}

impl ControllerConfig {
    pub fn num_stations(&self) -> usize {
        self.stations.len()
    }

    /// Normalized MAC of the controller, when one is configured.
    pub fn mac(&self) -> Option<String> {
        self.controller_mac
            .as_deref()
            .map(extract_mac)
            .filter(|m| !m.is_empty())
    }

    /// Stable id prefix for published devices: the MAC when present, else
    /// the slugified name.
    pub fn unique_prefix(&self) -> String {
        match self.mac() {
            Some(mac) => mac,
            None => slugify(&self.name),
        }
    }

    pub fn poll_interval_sec(&self) -> u64 {
        self.poll_interval_sec.max(MIN_POLL_INTERVAL_SEC)
    }
}

// ---------------------------------------------------------------------------
// MAC helpers
// ---------------------------------------------------------------------------

/// Lowercase colon form with two hex digits per octet. Anything that is not
/// six hex octets comes back lowercased but otherwise untouched.
pub fn normalize_mac(mac: &str) -> String {
    let value = mac.trim().replace('-', ":").to_lowercase();
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 6 {
        return value;
    }
    let octets: Option<Vec<String>> = parts
        .iter()
        .map(|p| u8::from_str_radix(p, 16).ok().map(|b| format!("{b:02x}")))
        .collect();
    octets.map(|o| o.join(":")).unwrap_or(value)
}

/// Pull the MAC out of `Label - AA:BB:..` and normalize it.
pub fn extract_mac(value: &str) -> String {
    let mac = value.rsplit_once(" - ").map(|(_, m)| m).unwrap_or(value);
    normalize_mac(mac)
}

pub fn is_mac(value: &str) -> bool {
    let parts: Vec<&str> = value.split(':').collect();
    parts.len() == 6 && parts.iter().all(|p| p.len() == 2 && u8::from_str_radix(p, 16).is_ok())
}

pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    for c in value.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
    }
    let slug = slug.trim_end_matches('_').to_string();
    if slug.is_empty() {
        "controller".to_string()
    } else {
        slug
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl ControllerConfig {
    /// Returns `Ok(())` or one error listing every violation found.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name is empty".into());
        }
        if let Some(raw) = self.controller_mac.as_deref().filter(|m| !m.trim().is_empty()) {
            let mac = extract_mac(raw);
            if !is_mac(&mac) {
                errors.push(format!("controller_mac '{raw}' is not a valid MAC address"));
            }
        }
        if self.poll_interval_sec < MIN_POLL_INTERVAL_SEC {
            errors.push(format!(
                "poll_interval_sec must be at least {MIN_POLL_INTERVAL_SEC}, got {}",
                self.poll_interval_sec
            ));
        }
        if self.manual_duration_min == 0 {
            errors.push("manual_duration_min must be positive".into());
        }

        self.validate_stations(&mut errors);
        self.validate_weather(&mut errors);
        self.validate_actions(&mut errors);

        if let Some(soil) = &self.soil_moisture {
            if soil.sensor.trim().is_empty() {
                errors.push("soil_moisture.sensor is empty".into());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ControllerError::config(format!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            )))
        }
    }

    fn validate_stations(&self, errors: &mut Vec<String>) {
        if self.stations.is_empty() {
            errors.push("at least one station is required".into());
        }
        let mut seen_switches: HashSet<&str> = HashSet::new();

        for (i, s) in self.stations.iter().enumerate() {
            let ctx = format!("stations[{}]", i + 1);
            if s.area_m2 < 0.0 || !s.area_m2.is_finite() {
                errors.push(format!("{ctx}: area_m2 {} must be zero or positive", s.area_m2));
            }
            if s.flow_rate_lpm < 0.0 || !s.flow_rate_lpm.is_finite() {
                errors.push(format!("{ctx}: flow_rate_lpm {} must be zero or positive", s.flow_rate_lpm));
            }
            if self.control_method == ControlMethod::Switch {
                match s.switch_entity.as_deref().map(str::trim) {
                    None | Some("") => errors.push(format!("{ctx}: switch_entity is required for switch control")),
                    Some(e) if !seen_switches.insert(e) => {
                        errors.push(format!("{ctx}: switch_entity '{e}' is already used by another station"))
                    }
                    Some(_) => {}
                }
            }
        }
    }

    fn validate_weather(&self, errors: &mut Vec<String>) {
        let w = &self.weather;
        if w.cache_timeout_min == 0 {
            errors.push("weather.cache_timeout_min must be at least 1".into());
        }
        if let Some(lat) = w.latitude {
            if !(-90.0..=90.0).contains(&lat) {
                errors.push(format!("weather.latitude {lat} out of range [-90, 90]"));
            }
        }
        if let Some(lon) = w.longitude {
            if !(-180.0..=180.0).contains(&lon) {
                errors.push(format!("weather.longitude {lon} out of range [-180, 180]"));
            }
        }
        if w.latitude.is_some() != w.longitude.is_some() {
            errors.push("weather.latitude and weather.longitude must be set together".into());
        }
    }

    fn validate_actions(&self, errors: &mut Vec<String>) {
        if let Some(preset) = self.actions.preset.as_deref() {
            if preset != "solem_toolkit" {
                errors.push(format!("actions.preset '{preset}' is unknown (supported: solem_toolkit)"));
            }
        }
        if self.control_method != ControlMethod::Service {
            return;
        }
        let actions = self.actions.resolve();
        for action in [Action::SprinkleStation, Action::StopSprinkle, Action::TurnOn, Action::TurnOff] {
            let Some(cfg) = actions.get(action) else {
                continue;
            };
            if cfg.enabled && !cfg.service.contains('.') {
                errors.push(format!("actions.{action}: service '{}' is not domain.service", cfg.service));
            }
        }
        if actions.sprinkle_station.is_none() {
            errors.push("actions.sprinkle_station is required for service control".into());
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
