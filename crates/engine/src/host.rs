//! Collaborators supplied by whatever process embeds the engine: entity
//! state lookup, remote action dispatch and snapshot storage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Debug;

/// Current value of a host entity (sensor, switch, zone).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityState {
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl EntityState {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn is_available(&self) -> bool {
        !matches!(self.state.trim(), "" | "unavailable" | "unknown")
    }

    pub fn numeric(&self) -> Option<f64> {
        self.state.trim().parse().ok()
    }

    pub fn attribute_f64(&self, key: &str) -> Option<f64> {
        match self.attributes.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

pub trait EntityStates: Send + Sync + Debug {
    fn state(&self, entity_id: &str) -> Option<EntityState>;
}

/// Calls `domain.service` with a JSON payload and waits for the ack.
#[async_trait]
pub trait ServiceDispatcher: Send + Sync + Debug {
    async fn call(&self, domain: &str, service: &str, payload: Map<String, Value>) -> anyhow::Result<()>;
}

/// Flat key-value snapshot, overwritten wholesale on every save.
#[async_trait]
pub trait SnapshotStore: Send + Sync + Debug {
    async fn load(&self) -> anyhow::Result<Option<Value>>;
    async fn save(&self, snapshot: &Value) -> anyhow::Result<()>;
}

/// In-process collaborators for tests and dry runs.
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Mutex, MutexGuard, RwLock};

    fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        m.lock().unwrap_or_else(|p| p.into_inner())
    }

    #[derive(Debug, Default)]
    pub struct MemoryStore {
        snapshot: Mutex<Option<Value>>,
        saves: Mutex<usize>,
    }

    impl MemoryStore {
        pub fn with_snapshot(snapshot: Value) -> Self {
            Self {
                snapshot: Mutex::new(Some(snapshot)),
                saves: Mutex::new(0),
            }
        }

        pub fn snapshot(&self) -> Option<Value> {
            lock(&self.snapshot).clone()
        }

        pub fn save_count(&self) -> usize {
            *lock(&self.saves)
        }
    }

    #[async_trait]
    impl SnapshotStore for MemoryStore {
        async fn load(&self) -> anyhow::Result<Option<Value>> {
            Ok(self.snapshot())
        }

        async fn save(&self, snapshot: &Value) -> anyhow::Result<()> {
            *lock(&self.snapshot) = Some(snapshot.clone());
            *lock(&self.saves) += 1;
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct RecordedCall {
        pub domain: String,
        pub service: String,
        pub payload: Map<String, Value>,
    }

    impl RecordedCall {
        pub fn name(&self) -> String {
            format!("{}.{}", self.domain, self.service)
        }
    }

    /// Records every call. Calls named in `fail_on` return an error after
    /// being recorded.
    #[derive(Debug, Default)]
    pub struct RecordingDispatcher {
        calls: Mutex<Vec<RecordedCall>>,
        fail_on: Mutex<HashSet<String>>,
    }

    impl RecordingDispatcher {
        pub fn fail_on(&self, name: &str) {
            lock(&self.fail_on).insert(name.to_string());
        }

        pub fn recover(&self, name: &str) {
            lock(&self.fail_on).remove(name);
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            lock(&self.calls).clone()
        }

        pub fn names(&self) -> Vec<String> {
            lock(&self.calls).iter().map(RecordedCall::name).collect()
        }

        pub fn clear(&self) {
            lock(&self.calls).clear();
        }
    }

    #[async_trait]
    impl ServiceDispatcher for RecordingDispatcher {
        async fn call(&self, domain: &str, service: &str, payload: Map<String, Value>) -> anyhow::Result<()> {
            let call = RecordedCall {
                domain: domain.to_string(),
                service: service.to_string(),
                payload,
            };
            let name = call.name();
            lock(&self.calls).push(call);
            if lock(&self.fail_on).contains(&name) {
                anyhow::bail!("{name} is unreachable");
            }
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    pub struct StaticEntities {
        states: RwLock<HashMap<String, EntityState>>,
    }

    impl StaticEntities {
        pub fn set(&self, entity_id: &str, state: EntityState) {
            self.states
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .insert(entity_id.to_string(), state);
        }

        pub fn remove(&self, entity_id: &str) {
            self.states
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .remove(entity_id);
        }
    }

    impl EntityStates for StaticEntities {
        fn state(&self, entity_id: &str) -> Option<EntityState> {
            self.states
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .get(entity_id)
                .cloned()
        }
    }
}
