use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::{
    aggregate_hourly, get_json, unix_to_local, CurrentWeather, ForecastBlock, ProviderSettings, WeatherCache,
    WeatherProvider,
};
use crate::clock::Clock;
use crate::error::Result;

const DEFAULT_BASE_URL: &str = "https://api.pirateweather.net";

/// Dark Sky compatible API. Hourly data is folded into 3-hour blocks.
#[derive(Debug)]
pub struct PirateWeatherProvider {
    http: Client,
    base_url: String,
    settings: ProviderSettings,
    clock: Arc<dyn Clock>,
    cache: WeatherCache,
}

impl PirateWeatherProvider {
    pub fn new(settings: ProviderSettings, clock: Arc<dyn Clock>) -> Self {
        let base_url = settings
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: WeatherCache::new(settings.cache_timeout_min),
            settings,
            clock,
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/forecast/{}/{},{}",
            self.base_url, self.settings.api_key, self.settings.latitude, self.settings.longitude
        )
    }

    async fn fetch(&self, what: &'static str) -> Result<Value> {
        get_json(&self.http, what, &self.url(), &[("units", "si".to_string())]).await
    }
}

fn number(v: Option<&Value>) -> f64 {
    v.and_then(Value::as_f64).unwrap_or(0.0)
}

#[async_trait]
impl WeatherProvider for PirateWeatherProvider {
    fn name(&self) -> &'static str {
        "pirateweather"
    }

    fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    fn cache(&self) -> &WeatherCache {
        &self.cache
    }

    async fn current_weather(&self) -> Result<CurrentWeather> {
        let now = self.clock.now();
        if let Some(cached) = self.cache.fresh_current(now) {
            debug!("returning cached current weather");
            return Ok(cached);
        }

        let raw = self.fetch("PirateWeather current weather").await?;
        let currently = raw.get("currently").cloned().unwrap_or(Value::Null);
        let intensity = number(currently.get("precipIntensity"));

        let current = CurrentWeather {
            observed_at: currently
                .get("time")
                .and_then(Value::as_i64)
                .and_then(|secs| unix_to_local(secs, *now.offset())),
            is_raining: intensity > 0.0,
            rain_mm_per_hour: intensity.max(0.0),
            raw,
        };
        self.cache.store_current(now, current.clone());
        Ok(current)
    }

    async fn forecast(&self) -> Result<Vec<ForecastBlock>> {
        let now = self.clock.now();
        if let Some(cached) = self.cache.fresh_forecast(now) {
            debug!("returning cached forecast");
            return Ok(cached);
        }

        let raw = self.fetch("PirateWeather forecast").await?;
        let offset = *now.offset();
        let hourly: Vec<_> = raw
            .pointer("/hourly/data")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter_map(|h| {
                let time = unix_to_local(h.get("time")?.as_i64()?, offset)?;
                Some((time, number(h.get("precipProbability")), number(h.get("precipIntensity"))))
            })
            .collect();

        let blocks = aggregate_hourly(&hourly, now.date_naive());
        Ok(self.cache.merge_forecast(now, blocks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use mockito::{Matcher, Server};
    use serde_json::json;

    // 2025-06-10 06:00:00 UTC
    const SIX_AM: i64 = 1_749_535_200;

    fn provider(server: &Server, clock: Arc<ManualClock>) -> PirateWeatherProvider {
        PirateWeatherProvider::new(
            ProviderSettings {
                api_key: "KEY".into(),
                latitude: 38.5,
                longitude: -9.25,
                cache_timeout_min: 5,
                base_url: Some(server.url()),
            },
            clock,
        )
    }

    #[tokio::test]
    async fn intensity_drives_is_raining() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/forecast/KEY/38.5,-9.25")
            .match_query(Matcher::UrlEncoded("units".into(), "si".into()))
            .with_status(200)
            .with_body(json!({"currently": {"time": SIX_AM, "precipIntensity": 0.4}}).to_string())
            .create_async()
            .await;

        let clock = Arc::new(ManualClock::at("2025-06-10 06:05:00"));
        let current = provider(&server, clock).is_raining().await.unwrap();
        assert!(current.is_raining);
        assert_eq!(current.rain_mm_per_hour, 0.4);
    }

    #[tokio::test]
    async fn hourly_data_becomes_remaining_blocks() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/forecast/KEY/38.5,-9.25")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!({"hourly": {"data": [
                    {"time": SIX_AM - 6 * 3600, "precipProbability": 0.9, "precipIntensity": 2.0},
                    {"time": SIX_AM, "precipProbability": 0.3, "precipIntensity": 1.0},
                    {"time": SIX_AM + 3600, "precipProbability": 0.6, "precipIntensity": 1.0},
                    {"time": SIX_AM + 3 * 3600, "precipProbability": 0.1, "precipIntensity": 0.5}
                ]}})
                .to_string(),
            )
            .create_async()
            .await;

        let clock = Arc::new(ManualClock::at("2025-06-10 07:30:00"));
        let pirate = provider(&server, clock);

        let forecast = pirate.forecast().await.unwrap();
        // 00:00 plus 06:00 through 21:00
        assert_eq!(forecast.len(), 7);
        assert_eq!(forecast[0].rain_mm, 2.0);
        assert_eq!(forecast[1].pop, 0.6);

        let outlook = pirate.will_it_rain().await.unwrap();
        assert!(outlook.will_rain);

        // The 06:00 block is half over: 2.0 * 0.5 + 0.5
        assert_eq!(pirate.total_rain_forecast_for_today().await.unwrap(), 1.5);
    }
}
