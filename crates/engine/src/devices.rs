//! Read-only device records rendered from the engine state: sensors,
//! numbers and buttons the host shows to the user.

use serde::Serialize;
use serde_json::Value;

use crate::budget::round2;
use crate::clock::format_timestamp;
use crate::state::EngineState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceKind {
    StateSensor,
    IrrigationDurationNumber,
    WaterFlowNumber,
    SprinkleButton,
    SprinkleTotalAmountSensor,
    ForecastedSprinkleTodaySensor,
    StopButton,
    OnButton,
    OffButton,
    WillRainSensor,
    HasRainedSensor,
    IsRainingSensor,
    NextScheduleSensor,
    LastSprinkleSensor,
    LastRainSensor,
    RainTimeTodaySensor,
    TotalWaterConsumptionSensor,
    TotalAmountRainToday,
    TotalForecastedRainToday,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub device_id: String,
    pub device_type: DeviceKind,
    pub device_name: String,
    pub icon: &'static str,
    pub state: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station: Option<usize>,
}

/// Naming inputs that come from configuration rather than state.
#[derive(Debug, Clone, Copy)]
pub struct DeviceContext<'a> {
    pub prefix: &'a str,
    pub station_names: &'a [String],
    pub weather_enabled: bool,
}

struct Builder<'a> {
    prefix: &'a str,
    out: Vec<Device>,
}

impl Builder<'_> {
    fn push(
        &mut self,
        suffix: String,
        kind: DeviceKind,
        name: String,
        icon: &'static str,
        state: Value,
        unit: Option<&'static str>,
        station: Option<usize>,
    ) {
        self.out.push(Device {
            device_id: format!("{}_{suffix}", self.prefix),
            device_type: kind,
            device_name: name,
            icon,
            state,
            unit,
            station,
        });
    }
}

fn ts(t: &Option<chrono::DateTime<chrono::FixedOffset>>) -> Value {
    t.as_ref().map(|t| Value::from(format_timestamp(t))).unwrap_or(Value::Null)
}

pub fn build_devices(state: &EngineState, ctx: DeviceContext<'_>) -> Vec<Device> {
    use DeviceKind::*;

    let mut b = Builder {
        prefix: ctx.prefix,
        out: Vec::new(),
    };
    let label = |station: usize| {
        ctx.station_names
            .get(station - 1)
            .cloned()
            .unwrap_or_else(|| format!("Station {station}"))
    };

    b.push(
        "irrigation_controller_status".into(),
        StateSensor,
        "Controller Status".into(),
        "mdi:state-machine",
        Value::from(state.controller.to_string()),
        None,
        None,
    );

    for (idx, status) in state.stations.iter().enumerate() {
        let n = idx + 1;
        b.push(
            format!("irrigation_station_{n}_status"),
            StateSensor,
            format!("{} Status", label(n)),
            "mdi:state-machine",
            Value::from(status.to_string()),
            None,
            Some(n),
        );
    }

    b.push(
        "irrigation_manual_duration".into(),
        IrrigationDurationNumber,
        "Manual Duration".into(),
        "mdi:clock-time-five-outline",
        Value::from(state.manual_duration_min),
        Some("min"),
        None,
    );

    for n in 1..=state.num_stations() {
        let i = n - 1;
        b.push(
            format!("water_flow_rate_{n}"),
            WaterFlowNumber,
            format!("Water Flow Rate {}", label(n)),
            "mdi:water-pump",
            Value::from(state.flow_rates_lpm.get(i).copied().unwrap_or(0.0)),
            Some("L/min"),
            Some(n),
        );
        b.push(
            format!("irrigation_manual_start_station_{n}"),
            SprinkleButton,
            format!("Sprinkle {}", label(n)),
            "mdi:sprinkler",
            Value::Null,
            None,
            Some(n),
        );
        b.push(
            format!("sprinkle_total_amount_today_station_{n}"),
            SprinkleTotalAmountSensor,
            format!("Sprinkle Total Amount Today {}", label(n)),
            "mdi:water",
            Value::from(round2(state.budget.applied_mm.get(i).copied().unwrap_or(0.0))),
            Some("mm"),
            Some(n),
        );
        b.push(
            format!("forecasted_sprinkle_today_station_{n}"),
            ForecastedSprinkleTodaySensor,
            format!("Forecasted Sprinkle Today {}", label(n)),
            "mdi:weather-partly-rainy",
            Value::from(round2(state.budget.forecasted_sprinkle_mm.get(i).copied().unwrap_or(0.0))),
            Some("mm"),
            Some(n),
        );
    }

    b.push("irrigation_stop".into(), StopButton, "Stop sprinkle".into(), "mdi:water-off", Value::Null, None, None);
    b.push(
        "irrigation_controller_on".into(),
        OnButton,
        "Turn on controller".into(),
        "mdi:power-on",
        Value::Null,
        None,
        None,
    );
    b.push(
        "irrigation_controller_off".into(),
        OffButton,
        "Turn off controller".into(),
        "mdi:power-off",
        Value::Null,
        None,
        None,
    );

    if ctx.weather_enabled {
        let w = &state.weather;
        b.push("will_rain_today".into(), WillRainSensor, "Will Rain Today".into(), "mdi:weather-rainy", Value::from(w.will_rain_today), None, None);
        b.push("has_rained_today".into(), HasRainedSensor, "Has Rained Today".into(), "mdi:weather-rainy", Value::from(w.has_rained_today), None, None);
        b.push("is_raining_now".into(), IsRainingSensor, "Is Raining Now".into(), "mdi:weather-pouring", Value::from(w.is_raining_now), None, None);
    }

    b.push(
        "next_schedule".into(),
        NextScheduleSensor,
        "Next Schedule".into(),
        "mdi:home-clock",
        ts(&state.next_schedule),
        None,
        None,
    );
    b.push(
        "last_sprinkle".into(),
        LastSprinkleSensor,
        "Last Sprinkle".into(),
        "mdi:sprinkler",
        ts(&state.last_sprinkle),
        None,
        None,
    );

    if ctx.weather_enabled {
        b.push("last_rain".into(), LastRainSensor, "Last Rain".into(), "mdi:weather-pouring", ts(&state.last_rain), None, None);
        b.push(
            "rain_time_today".into(),
            RainTimeTodaySensor,
            "Rain Time Today".into(),
            "mdi:weather-rainy",
            Value::from(round2(state.budget.rain_time_minutes)),
            Some("min"),
            None,
        );
    }

    b.push(
        "total_water_consumption".into(),
        TotalWaterConsumptionSensor,
        "Total Water Consumption".into(),
        "mdi:water-pump",
        Value::from(round2(state.total_water_consumption_l)),
        Some("L"),
        None,
    );

    if ctx.weather_enabled {
        b.push(
            "total_amount_rain_today".into(),
            TotalAmountRainToday,
            "Total Amount Rain Today".into(),
            "mdi:weather-rainy",
            Value::from(round2(state.budget.rain_total_mm)),
            Some("mm"),
            None,
        );
        b.push(
            "total_forecasted_rain_today".into(),
            TotalForecastedRainToday,
            "Total Forecasted Rain Today".into(),
            "mdi:weather-rainy",
            Value::from(round2(state.budget.rain_forecast_mm)),
            Some("mm"),
            None,
        );
    }

    b.out
}
