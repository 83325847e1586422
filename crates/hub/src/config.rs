//! Controller config file loading.

use anyhow::{Context, Result};
use std::path::Path;

use smart_water_engine::ControllerConfig;

/// Read, parse and validate the TOML config at `path`. Validation reports
/// every violation at once.
pub fn load(path: impl AsRef<Path>) -> Result<ControllerConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse(&text).with_context(|| format!("invalid config file: {}", path.display()))
}

pub fn parse(text: &str) -> Result<ControllerConfig> {
    let cfg: ControllerConfig = toml::from_str(text).context("failed to parse TOML")?;
    cfg.validate()?;
    Ok(cfg)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use smart_water_engine::config::ControlMethod;

    const VALID: &str = r#"
name = "Back Garden"
controller_mac = "Solem BL-IP - AA:BB:CC:DD:EE:FF"
poll_interval_sec = 120

[[stations]]
name = "Lawn"
area_m2 = 40.0
flow_rate_lpm = 18.0

[[stations]]
area_m2 = 6.0

[weather]
provider = "openweathermap"
api_key = "secret"
latitude = 38.72
longitude = -9.14

[soil_moisture]
sensor = "sensor.garden_soil"

[actions]
preset = "solem_toolkit"
"#;

    #[test]
    fn parses_a_complete_file() {
        let cfg = parse(VALID).unwrap();
        assert_eq!(cfg.num_stations(), 2);
        assert_eq!(cfg.control_method, ControlMethod::Service);
        assert_eq!(cfg.mac().as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(cfg.poll_interval_sec(), 120);
        assert_eq!(cfg.soil_moisture.unwrap().threshold, 40.0);
    }

    #[test]
    fn every_violation_is_reported() {
        let text = r#"
controller_mac = "not-a-mac"
poll_interval_sec = 1
control_method = "switch"

[[stations]]
area_m2 = -3.0
"#;
        let msg = format!("{:#}", parse(text).unwrap_err());
        assert!(msg.contains("controller_mac"), "{msg}");
        assert!(msg.contains("poll_interval_sec"), "{msg}");
        assert!(msg.contains("switch_entity"), "{msg}");
    }

    #[test]
    fn bad_toml_names_the_problem() {
        let msg = format!("{:#}", parse("stations = 3").unwrap_err());
        assert!(msg.contains("failed to parse TOML"), "{msg}");
    }

    #[test]
    fn missing_file_names_the_path() {
        let msg = format!("{:#}", load("/definitely/not/here.toml").unwrap_err());
        assert!(msg.contains("/definitely/not/here.toml"), "{msg}");
    }
}
