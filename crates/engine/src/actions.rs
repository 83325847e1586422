//! Action invoker: how "water station N for M minutes" reaches hardware.
//!
//! Two strategies sit behind [`ActionInvoker`]. `Switch` toggles one host
//! switch per station and leaves timing to the engine's session loop.
//! `Remote` calls a configured `domain.service` per logical action and lets
//! the remote side own the timing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ControllerError, Result};
use crate::host::ServiceDispatcher;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    SprinkleStation,
    StopSprinkle,
    TurnOn,
    TurnOff,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::SprinkleStation => "sprinkle_station",
            Action::StopSprinkle => "stop_sprinkle",
            Action::TurnOn => "turn_on",
            Action::TurnOff => "turn_off",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Time,
    MacAddress,
    Station,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionParam {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ParamType,
    /// Literal value. Always wins over the runtime value when non-blank.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl ActionParam {
    pub fn new(name: &str, kind: ParamType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            value: None,
        }
    }

    fn literal(&self) -> Option<String> {
        let text = match self.value.as_ref()? {
            Value::Null => return None,
            Value::String(s) => s.trim().to_string(),
            other => other.to_string(),
        };
        (!text.is_empty()).then_some(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// `domain.service`
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub params: Vec<ActionParam>,
}

fn enabled_by_default() -> bool {
    true
}

/// Remote mapping for each logical action. Missing entries fail on use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceActions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprinkle_station: Option<ActionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sprinkle: Option<ActionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_on: Option<ActionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_off: Option<ActionConfig>,
}

impl ServiceActions {
    pub fn get(&self, action: Action) -> Option<&ActionConfig> {
        match action {
            Action::SprinkleStation => self.sprinkle_station.as_ref(),
            Action::StopSprinkle => self.stop_sprinkle.as_ref(),
            Action::TurnOn => self.turn_on.as_ref(),
            Action::TurnOff => self.turn_off.as_ref(),
        }
    }

    /// Service mapping for Solem Bluetooth controllers exposed through the
    /// `solem_toolkit` integration.
    pub fn solem_toolkit() -> Self {
        let mac_only = |service: &str| ActionConfig {
            enabled: true,
            service: service.to_string(),
            params: vec![ActionParam::new("device_mac", ParamType::MacAddress)],
        };
        Self {
            sprinkle_station: Some(ActionConfig {
                enabled: true,
                service: "solem_toolkit.sprinkle_station_x_for_y_minutes".into(),
                params: vec![
                    ActionParam::new("device_mac", ParamType::MacAddress),
                    ActionParam::new("station", ParamType::Station),
                    ActionParam::new("minutes", ParamType::Time),
                ],
            }),
            stop_sprinkle: Some(mac_only("solem_toolkit.stop_manual_sprinkle")),
            turn_on: Some(mac_only("solem_toolkit.turn_on")),
            turn_off: Some(mac_only("solem_toolkit.turn_off_permanent")),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload building
// ---------------------------------------------------------------------------

/// Integer when the text is all digits (optionally negative), float when it
/// parses as one, the trimmed text otherwise.
pub fn coerce_scalar(text: &str) -> Value {
    let v = text.trim();
    let digits = v.strip_prefix('-').unwrap_or(v);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(n) = v.parse::<i64>() {
            return Value::from(n);
        }
    }
    match v.parse::<f64>() {
        Ok(f) if f.is_finite() => Value::from(f),
        _ => Value::String(v.to_string()),
    }
}

/// Runtime values available to parameter resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallContext<'a> {
    pub station: Option<usize>,
    pub minutes: Option<u32>,
    pub controller_mac: Option<&'a str>,
}

/// A resolved remote call.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    pub payload: Map<String, Value>,
}

pub fn build_call(action: Action, cfg: Option<&ActionConfig>, ctx: CallContext<'_>) -> Result<ServiceCall> {
    let refuse = |message: &str| ControllerError::Dispatch {
        action: action.to_string(),
        message: message.to_string(),
    };

    let cfg = cfg.ok_or_else(|| refuse("no service mapped"))?;
    if !cfg.enabled {
        return Err(refuse("action is disabled"));
    }
    let (domain, service) = cfg
        .service
        .trim()
        .split_once('.')
        .filter(|(d, s)| !d.is_empty() && !s.is_empty())
        .ok_or_else(|| refuse("no valid domain.service configured"))?;

    let mut payload = Map::new();
    for param in &cfg.params {
        let name = param.name.trim();
        if name.is_empty() {
            continue;
        }
        if let Some(literal) = param.literal() {
            payload.insert(name.to_string(), coerce_scalar(&literal));
            continue;
        }
        let value = match (param.kind, ctx.station, ctx.minutes) {
            (ParamType::Time, _, Some(minutes)) => Value::from(minutes),
            (ParamType::Station, Some(station), _) => Value::from(station),
            (ParamType::MacAddress, _, _) => match ctx.controller_mac {
                Some(mac) if !mac.is_empty() => Value::from(mac),
                _ => return Err(refuse("controller MAC address is not set")),
            },
            _ => continue,
        };
        payload.insert(name.to_string(), value);
    }

    Ok(ServiceCall {
        domain: domain.to_string(),
        service: service.to_string(),
        payload,
    })
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SwitchActions {
    entities: Vec<String>,
    dispatcher: Arc<dyn ServiceDispatcher>,
}

impl SwitchActions {
    pub fn new(entities: Vec<String>, dispatcher: Arc<dyn ServiceDispatcher>) -> Self {
        Self { entities, dispatcher }
    }

    fn entity(&self, station: usize) -> Result<&str> {
        station
            .checked_sub(1)
            .and_then(|idx| self.entities.get(idx))
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ControllerError::config(format!("no switch entity configured for station {station}")))
    }

    async fn toggle(&self, entity_id: &str, service: &'static str) -> Result<()> {
        let mut payload = Map::new();
        payload.insert("entity_id".into(), Value::from(entity_id));
        self.dispatcher
            .call("switch", service, payload)
            .await
            .map_err(|e| ControllerError::Dispatch {
                action: format!("switch.{service} {entity_id}"),
                message: format!("{e:#}"),
            })
    }

    pub async fn turn_on_station(&self, station: usize) -> Result<()> {
        let entity = self.entity(station)?;
        self.toggle(entity, "turn_on").await
    }

    pub async fn turn_off_station(&self, station: usize) -> Result<()> {
        let entity = self.entity(station)?;
        self.toggle(entity, "turn_off").await
    }

    /// Best effort: a failing switch is logged and the rest still go off.
    pub async fn turn_off_all(&self) {
        for (idx, entity) in self.entities.iter().enumerate() {
            let entity = entity.trim();
            if entity.is_empty() {
                continue;
            }
            if let Err(e) = self.toggle(entity, "turn_off").await {
                warn!(station = idx + 1, entity, "failed turning off station switch: {e}");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteActions {
    actions: ServiceActions,
    controller_mac: Option<String>,
    dispatcher: Arc<dyn ServiceDispatcher>,
}

impl RemoteActions {
    pub fn new(actions: ServiceActions, controller_mac: Option<String>, dispatcher: Arc<dyn ServiceDispatcher>) -> Self {
        Self {
            actions,
            controller_mac,
            dispatcher,
        }
    }

    pub async fn invoke(&self, action: Action, station: Option<usize>, minutes: Option<u32>) -> Result<()> {
        let call = build_call(
            action,
            self.actions.get(action),
            CallContext {
                station,
                minutes,
                controller_mac: self.controller_mac.as_deref(),
            },
        )?;
        debug!(%action, domain = %call.domain, service = %call.service, payload = ?call.payload, "calling service");
        self.dispatcher
            .call(&call.domain, &call.service, call.payload)
            .await
            .map_err(|e| ControllerError::Dispatch {
                action: action.to_string(),
                message: format!("{e:#}"),
            })
    }
}

/// The strategy chosen at configuration time.
#[derive(Debug, Clone)]
pub enum ActionInvoker {
    Switch(SwitchActions),
    Remote(RemoteActions),
}

impl ActionInvoker {
    /// Switch sessions are timed and persisted by the engine.
    pub fn uses_sessions(&self) -> bool {
        matches!(self, ActionInvoker::Switch(_))
    }

    pub async fn start(&self, station: usize, minutes: u32) -> Result<()> {
        match self {
            ActionInvoker::Switch(s) => s.turn_on_station(station).await,
            ActionInvoker::Remote(r) => r.invoke(Action::SprinkleStation, Some(station), Some(minutes)).await,
        }
    }

    /// End one station's session. Remote sessions end on their own.
    pub async fn stop(&self, station: usize) -> Result<()> {
        match self {
            ActionInvoker::Switch(s) => s.turn_off_station(station).await,
            ActionInvoker::Remote(_) => Ok(()),
        }
    }

    pub async fn stop_all(&self) -> Result<()> {
        match self {
            ActionInvoker::Switch(s) => {
                s.turn_off_all().await;
                Ok(())
            }
            ActionInvoker::Remote(r) => r.invoke(Action::StopSprinkle, None, None).await,
        }
    }

    pub async fn controller_on(&self) -> Result<()> {
        match self {
            ActionInvoker::Switch(_) => {
                info!("switch control has no controller power action, state change only");
                Ok(())
            }
            ActionInvoker::Remote(r) => r.invoke(Action::TurnOn, None, None).await,
        }
    }

    pub async fn controller_off(&self) -> Result<()> {
        match self {
            ActionInvoker::Switch(_) => {
                info!("switch control has no controller power action, state change only");
                Ok(())
            }
            ActionInvoker::Remote(r) => r.invoke(Action::TurnOff, None, None).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::RecordingDispatcher;
    use serde_json::json;

    const MAC: &str = "aa:bb:cc:dd:ee:ff";

    fn remote(actions: ServiceActions, dispatcher: Arc<RecordingDispatcher>) -> ActionInvoker {
        ActionInvoker::Remote(RemoteActions::new(actions, Some(MAC.into()), dispatcher))
    }

    #[test]
    fn coerce_scalar_variants() {
        assert_eq!(coerce_scalar("3"), json!(3));
        assert_eq!(coerce_scalar("-12"), json!(-12));
        assert_eq!(coerce_scalar(" 2.5 "), json!(2.5));
        assert_eq!(coerce_scalar("zone-a"), json!("zone-a"));
        assert_eq!(coerce_scalar("-"), json!("-"));
    }

    #[test]
    fn literal_station_overrides_runtime_value() {
        let mut actions = ServiceActions::solem_toolkit();
        if let Some(cfg) = actions.sprinkle_station.as_mut() {
            cfg.params[1].value = Some(json!("3"));
        }
        let call = build_call(
            Action::SprinkleStation,
            actions.get(Action::SprinkleStation),
            CallContext {
                station: Some(5),
                minutes: Some(8),
                controller_mac: Some(MAC),
            },
        )
        .unwrap();

        assert_eq!(call.domain, "solem_toolkit");
        assert_eq!(call.service, "sprinkle_station_x_for_y_minutes");
        assert_eq!(call.payload["station"], json!(3));
        assert_eq!(call.payload["minutes"], json!(8));
        assert_eq!(call.payload["device_mac"], json!(MAC));
    }

    #[test]
    fn other_without_literal_is_omitted() {
        let cfg = ActionConfig {
            enabled: true,
            service: "rainbird.start".into(),
            params: vec![ActionParam::new("note", ParamType::Other), ActionParam::new("zone", ParamType::Station)],
        };
        let call = build_call(Action::SprinkleStation, Some(&cfg), CallContext::default()).unwrap();
        assert!(call.payload.is_empty());
    }

    #[test]
    fn mac_param_requires_controller_mac() {
        let actions = ServiceActions::solem_toolkit();
        let err = build_call(Action::TurnOn, actions.get(Action::TurnOn), CallContext::default()).unwrap_err();
        assert!(err.to_string().contains("MAC"));
    }

    #[test]
    fn disabled_and_malformed_actions_refuse() {
        let mut cfg = ActionConfig {
            enabled: false,
            service: "solem_toolkit.turn_on".into(),
            params: vec![],
        };
        assert!(build_call(Action::TurnOn, Some(&cfg), CallContext::default()).is_err());

        cfg.enabled = true;
        cfg.service = "turn_on".into();
        assert!(build_call(Action::TurnOn, Some(&cfg), CallContext::default()).is_err());

        assert!(build_call(Action::TurnOn, None, CallContext::default()).is_err());
    }

    #[test]
    fn params_deserialize_from_toml() {
        let cfg: ActionConfig = toml::from_str(
            r#"
            service = "script.water"
            [[params]]
            name = "zone"
            type = "station"
            value = 3
            [[params]]
            name = "extra"
            type = "weird"
            "#,
        )
        .unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.params[0].literal().as_deref(), Some("3"));
        assert_eq!(cfg.params[1].kind, ParamType::Other);
    }

    #[tokio::test]
    async fn remote_start_dispatches_sprinkle_action() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let invoker = remote(ServiceActions::solem_toolkit(), dispatcher.clone());

        invoker.start(2, 15).await.unwrap();
        invoker.stop(2).await.unwrap();

        let calls = dispatcher.calls();
        assert_eq!(calls.len(), 1, "remote stop of one station is a no-op");
        assert_eq!(calls[0].payload["station"], json!(2));
        assert_eq!(calls[0].payload["minutes"], json!(15));
    }

    #[tokio::test]
    async fn remote_failure_is_dispatch_error() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        dispatcher.fail_on("solem_toolkit.stop_manual_sprinkle");
        let invoker = remote(ServiceActions::solem_toolkit(), dispatcher);

        let err = invoker.stop_all().await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn switch_out_of_range_fails_before_dispatch() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let invoker = ActionInvoker::Switch(SwitchActions::new(
            vec!["switch.z1".into(), "switch.z2".into(), "switch.z3".into()],
            dispatcher.clone(),
        ));

        let err = invoker.start(4, 10).await.unwrap_err();
        assert!(matches!(err, ControllerError::Config(_)));
        assert!(dispatcher.calls().is_empty());
    }

    #[tokio::test]
    async fn switch_stop_all_is_best_effort() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        dispatcher.fail_on("switch.turn_off");
        let invoker = ActionInvoker::Switch(SwitchActions::new(
            vec!["switch.z1".into(), " ".into(), "switch.z3".into()],
            dispatcher.clone(),
        ));

        invoker.stop_all().await.unwrap();
        let touched: Vec<Value> = dispatcher.calls().into_iter().map(|c| c.payload["entity_id"].clone()).collect();
        assert_eq!(touched, vec![json!("switch.z1"), json!("switch.z3")]);
    }

    #[tokio::test]
    async fn switch_controller_power_is_local() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let invoker = ActionInvoker::Switch(SwitchActions::new(vec!["switch.z1".into()], dispatcher.clone()));
        invoker.controller_off().await.unwrap();
        assert!(dispatcher.calls().is_empty());
    }
}
