//! Smart irrigation engine: daily water budgets per station, weather-aware
//! scheduling and timed watering sessions driven through host services.

pub mod actions;
pub mod budget;
pub mod clock;
pub mod config;
pub mod devices;
pub mod engine;
pub mod error;
pub mod host;
pub mod persistence;
pub mod schedule;
pub mod state;
pub mod timers;
pub mod weather;

pub use clock::{Clock, SystemClock};
pub use config::ControllerConfig;
pub use devices::{Device, DeviceKind};
pub use engine::{Engine, Host, Snapshot};
pub use error::{ControllerError, Result};
pub use host::{EntityState, EntityStates, ServiceDispatcher, SnapshotStore};
pub use schedule::Schedule;
pub use state::{ControllerStatus, EngineState, StationStatus};
