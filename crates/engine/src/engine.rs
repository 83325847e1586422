//! The irrigation engine. Owns the [`EngineState`], decides when and how
//! long each station waters, runs watering sessions and keeps the persisted
//! snapshot and the published devices current.
//!
//! All state lives behind one async mutex that is never held across an
//! action dispatch or a weather call. A session task owns its station until
//! it ends. Each session has its own stop token, a child of the global one,
//! so a stop can end one station or all of them within one tick.

use chrono::{DateTime, Datelike, Duration as TimeDelta, FixedOffset, NaiveTime};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actions::{ActionInvoker, RemoteActions, SwitchActions};
use crate::budget::{self, StationHydraulics};
use crate::clock::{format_timestamp, Clock};
use crate::config::{ControlMethod, ControllerConfig, SoilMoistureConfig};
use crate::devices::{build_devices, Device, DeviceContext};
use crate::error::{ControllerError, Result};
use crate::host::{EntityStates, ServiceDispatcher, SnapshotStore};
use crate::persistence::{restore, to_snapshot, RestoreDefaults};
use crate::schedule::{self, Schedule, WateringOutlook};
use crate::state::{ActiveIrrigation, ControllerStatus, EngineState, StationStatus};
use crate::timers;
use crate::weather::{build_provider, RainOutlook, WeatherProvider};

const TICK: Duration = Duration::from_secs(1);
/// Slack between the end of the tick loop and the fail-safe stop.
const FAILSAFE_GRACE: Duration = Duration::from_secs(1);

fn after_midnight(minutes: i64) -> NaiveTime {
    NaiveTime::MIN + TimeDelta::minutes(minutes)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ---------------------------------------------------------------------------
// Collaborators and derived settings
// ---------------------------------------------------------------------------

/// The collaborators the engine runs against.
#[derive(Debug, Clone)]
pub struct Host {
    pub clock: Arc<dyn Clock>,
    pub entities: Arc<dyn EntityStates>,
    pub dispatcher: Arc<dyn ServiceDispatcher>,
    pub store: Arc<dyn SnapshotStore>,
}

/// Everything derived from a [`ControllerConfig`]. Replaced wholesale on
/// reconfiguration.
#[derive(Debug)]
struct Settings {
    invoker: ActionInvoker,
    weather: Option<Arc<dyn WeatherProvider>>,
    areas_m2: Vec<f64>,
    default_flow_rates: Vec<f64>,
    station_names: Vec<String>,
    prefix: String,
    soil_moisture: Option<SoilMoistureConfig>,
    poll_interval_sec: u64,
    sprinkle_with_rain: bool,
    manual_duration_min: u32,
}

impl Settings {
    fn derive(config: &ControllerConfig, host: &Host) -> Self {
        let invoker = match config.control_method {
            ControlMethod::Switch => ActionInvoker::Switch(SwitchActions::new(
                config
                    .stations
                    .iter()
                    .map(|s| s.switch_entity.clone().unwrap_or_default())
                    .collect(),
                host.dispatcher.clone(),
            )),
            ControlMethod::Service => ActionInvoker::Remote(RemoteActions::new(
                config.actions.resolve(),
                config.mac(),
                host.dispatcher.clone(),
            )),
        };

        let weather = config
            .weather
            .resolve(host.entities.as_ref())
            .and_then(|(kind, settings)| build_provider(kind, settings, host.clock.clone()));
        if let Some(provider) = &weather {
            info!(provider = provider.name(), "weather provider enabled");
        }

        Self {
            invoker,
            weather,
            areas_m2: config.stations.iter().map(|s| s.area_m2).collect(),
            default_flow_rates: config.stations.iter().map(|s| s.flow_rate_lpm).collect(),
            station_names: config
                .stations
                .iter()
                .enumerate()
                .map(|(idx, s)| s.display_name(idx + 1))
                .collect(),
            prefix: config.unique_prefix(),
            soil_moisture: config.soil_moisture.clone(),
            poll_interval_sec: config.poll_interval_sec(),
            sprinkle_with_rain: config.sprinkle_with_rain,
            manual_duration_min: config.manual_duration_min,
        }
    }

    fn num_stations(&self) -> usize {
        self.areas_m2.len()
    }

    fn hydraulics(&self, state: &EngineState, station: usize) -> Option<StationHydraulics> {
        let idx = station.checked_sub(1)?;
        Some(StationHydraulics {
            flow_rate_lpm: *state.flow_rates_lpm.get(idx)?,
            area_m2: self.areas_m2.get(idx).copied().unwrap_or(0.0),
        })
    }
}

/// What the host renders: one record per sensor, number and button.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub devices: Vec<Device>,
    /// False when the last refresh could not complete.
    pub last_update_success: bool,
    pub updated_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    host: Host,
    settings: RwLock<Arc<Settings>>,
    state: AsyncMutex<EngineState>,
    stop: Mutex<CancellationToken>,
    busy: Arc<Mutex<HashMap<usize, CancellationToken>>>,
    armed: Mutex<Vec<JoinHandle<()>>>,
    restored: Mutex<Vec<JoinHandle<()>>>,
    background: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
    save_lock: AsyncMutex<()>,
    snapshot: watch::Sender<Snapshot>,
}

/// Marks a station as owned by a running session until dropped.
struct BusyGuard {
    set: Arc<Mutex<HashMap<usize, CancellationToken>>>,
    station: usize,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.station);
    }
}

struct SessionRun {
    station: usize,
    minutes: u32,
    cap_mm: Option<f64>,
    stop: CancellationToken,
    /// End time and fail-safe stop of a switch session.
    session: Option<(DateTime<FixedOffset>, JoinHandle<()>)>,
}

fn check_station(station: usize, num_stations: usize) -> Result<()> {
    if (1..=num_stations).contains(&station) {
        Ok(())
    } else {
        Err(ControllerError::config(format!(
            "station {station} is out of range (1..={num_stations})"
        )))
    }
}

fn next_schedule_for(state: &EngineState, clock: &dyn Clock) -> Option<DateTime<FixedOffset>> {
    let schedule = state.schedule.as_ref()?;
    let weather = &state.weather;
    schedule::next_watering(
        schedule,
        clock,
        WateringOutlook {
            rain_today: weather.has_rained_today || weather.will_rain_today || weather.is_raining_now,
            last_event: schedule::last_event(state.last_rain, state.last_sprinkle),
        },
    )
}

impl Engine {
    pub fn new(config: ControllerConfig, host: Host) -> Result<Self> {
        config.validate()?;
        let settings = Settings::derive(&config, &host);
        let state = EngineState::new(
            settings.num_stations(),
            settings.default_flow_rates.clone(),
            settings.manual_duration_min,
        );
        let (snapshot, _) = watch::channel(Snapshot::default());

        Ok(Self {
            inner: Arc::new(Inner {
                host,
                settings: RwLock::new(Arc::new(settings)),
                state: AsyncMutex::new(state),
                stop: Mutex::new(CancellationToken::new()),
                busy: Arc::new(Mutex::new(HashMap::new())),
                armed: Mutex::new(Vec::new()),
                restored: Mutex::new(Vec::new()),
                background: Mutex::new(None),
                shutdown: CancellationToken::new(),
                save_lock: AsyncMutex::new(()),
                snapshot,
            }),
        })
    }

    fn settings(&self) -> Arc<Settings> {
        self.inner
            .settings
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn now(&self) -> DateTime<FixedOffset> {
        self.inner.host.clock.now()
    }

    /// Load the snapshot, make sure no session outlives its end, arm today's
    /// runs, start the daily timers and the poll loop, then refresh once.
    pub async fn start(&self) {
        let settings = self.settings();
        let loaded = match self.inner.host.store.load().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("failed to load snapshot, starting fresh: {e:#}");
                None
            }
        };

        let restored = restore(
            loaded.as_ref(),
            RestoreDefaults {
                num_stations: settings.num_stations(),
                flow_rates_lpm: &settings.default_flow_rates,
                manual_duration_min: settings.manual_duration_min,
                offset: *self.now().offset(),
            },
        );
        if let Some(provider) = &settings.weather {
            provider
                .cache()
                .seed(restored.weather.forecast.clone(), restored.weather.current.clone());
        }
        *self.inner.state.lock().await = restored;

        self.restore_active_irrigation().await;
        self.initialize_schedule().await;
        self.check_and_schedule_watering().await;
        self.spawn_background();
        if let Err(e) = self.refresh().await {
            error!("initial refresh failed: {e}");
        }
        info!(stations = settings.num_stations(), prefix = %settings.prefix, "irrigation engine started");
    }

    /// Stop timers, restored-session stops and the poll loop. Running
    /// sessions are left alone; the persisted session records end them after
    /// a restart.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for handle in lock(&self.inner.armed).drain(..) {
            handle.abort();
        }
        for handle in lock(&self.inner.restored).drain(..) {
            handle.abort();
        }
        info!("irrigation engine stopped");
    }

    fn spawn_background(&self) {
        let cancel = self.inner.shutdown.child_token();
        if let Some(previous) = lock(&self.inner.background).replace(cancel.clone()) {
            previous.cancel();
        }
        let clock = self.inner.host.clock.clone();

        let engine = self.clone();
        timers::spawn_daily(clock.clone(), NaiveTime::MIN, cancel.clone(), move || {
            let engine = engine.clone();
            async move { engine.reset_daily_budget().await }
        });

        let engine = self.clone();
        timers::spawn_daily(clock, after_midnight(1), cancel.clone(), move || {
            let engine = engine.clone();
            async move { engine.check_and_schedule_watering().await }
        });

        let poll = Duration::from_secs(self.settings().poll_interval_sec);
        let engine = self.clone();
        timers::spawn_every(poll, cancel, move || {
            let engine = engine.clone();
            async move {
                if let Err(e) = engine.refresh().await {
                    warn!("scheduled refresh failed: {e}");
                }
            }
        });
        debug!(poll_secs = poll.as_secs(), "background timers started");
    }

    // -- Observers -----------------------------------------------------------

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub async fn state(&self) -> EngineState {
        self.inner.state.lock().await.clone()
    }

    pub fn weather_enabled(&self) -> bool {
        self.settings().weather.is_some()
    }

    /// Today's remaining forecast straight from the provider.
    pub async fn rain_outlook(&self) -> Result<RainOutlook> {
        let settings = self.settings();
        let provider = settings.weather.as_ref().ok_or(ControllerError::WeatherDisabled)?;
        provider.will_it_rain().await
    }

    /// Watering cycles armed for later today and not yet fired.
    pub fn armed_cycles(&self) -> usize {
        lock(&self.inner.armed).iter().filter(|h| !h.is_finished()).count()
    }

    pub async fn next_watering_date(&self) -> Option<DateTime<FixedOffset>> {
        next_schedule_for(&*self.inner.state.lock().await, self.inner.host.clock.as_ref())
    }

    fn publish_locked(&self, state: &EngineState, settings: &Settings, success: bool) {
        let devices = build_devices(
            state,
            DeviceContext {
                prefix: &settings.prefix,
                station_names: &settings.station_names,
                weather_enabled: settings.weather.is_some(),
            },
        );
        self.inner.snapshot.send_replace(Snapshot {
            devices,
            last_update_success: success,
            updated_at: Some(format_timestamp(&self.now())),
        });
    }

    // -- Persistence ---------------------------------------------------------

    async fn persist(&self) -> Result<()> {
        let _writer = self.inner.save_lock.lock().await;
        let snapshot = to_snapshot(&*self.inner.state.lock().await);
        self.inner
            .host
            .store
            .save(&snapshot)
            .await
            .map_err(|e| ControllerError::Store(format!("{e:#}")))
    }

    async fn save(&self) {
        if let Err(e) = self.persist().await {
            error!("{e}");
        }
    }

    async fn initialize_schedule(&self) {
        let n = self.settings().num_stations();
        let changed = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            match &mut state.schedule {
                Some(schedule) => schedule.reconcile_stations(n),
                None => {
                    debug!("no schedule found, creating an empty one");
                    state.schedule = Some(Schedule::empty(n));
                    true
                }
            }
        };
        if changed {
            self.save().await;
        }
    }

    // -- Daily budget --------------------------------------------------------

    /// Zero today's counters and recompute targets from the schedule and
    /// the remaining rain forecast.
    pub async fn reset_daily_budget(&self) {
        let settings = self.settings();
        let rain_forecast = match &settings.weather {
            Some(provider) => provider.total_rain_forecast_for_today().await.unwrap_or_else(|e| {
                warn!(provider = provider.name(), "no rain forecast for the reset, assuming none: {e}");
                0.0
            }),
            None => 0.0,
        };

        let now = self.now();
        let today = now.date_naive();
        {
            let mut state = self.inner.state.lock().await;
            let n = state.num_stations();
            state.weather.has_rained_today = false;
            state.weather.will_rain_today = false;
            state.budget.rain_time_minutes = 0.0;
            state.budget.rain_total_mm = 0.0;
            state.budget.applied_mm = vec![0.0; n];
            state.budget.rain_forecast_mm = rain_forecast;

            let targets = match &state.schedule {
                Some(schedule) => budget::daily_targets(
                    schedule.for_date(today),
                    &state.hydraulics(&settings.areas_m2),
                    schedule::last_event(state.last_rain, state.last_sprinkle),
                    today,
                ),
                None => vec![0.0; n],
            };
            state.budget.forecasted_sprinkle_mm = budget::forecasted_sprinkle(&targets, rain_forecast);
            state.budget.target_mm = targets;
            state.last_reset = Some(now);
            info!(targets = ?state.budget.target_mm, rain_forecast, "daily budget reset");
        }
        self.save().await;
    }

    /// The polling fallback for the midnight reset: runs once a day, on the
    /// first refresh after 00:05, and re-arms today's runs afterwards.
    async fn reset_if_due(&self, now: DateTime<FixedOffset>) {
        if now.time() <= after_midnight(5) {
            return;
        }
        let last_reset = self.inner.state.lock().await.last_reset;
        let due = match last_reset {
            Some(at) => at.date_naive() != now.date_naive(),
            None => true,
        };
        if due {
            info!(last_reset = ?last_reset.map(|t| t.date_naive()), "performing daily reset");
            self.reset_daily_budget().await;
            self.check_and_schedule_watering().await;
        }
    }

    // -- Scheduling ----------------------------------------------------------

    /// Arm a watering cycle for every configured hour still ahead today,
    /// provided the interval has passed and some station needs water.
    pub async fn check_and_schedule_watering(&self) {
        info!("checking watering schedule");
        let now = self.now();
        let today = now.date_naive();

        let hours = {
            let state = self.inner.state.lock().await;
            let Some(schedule) = state.schedule.as_ref() else {
                warn!("schedule not initialized, skipping watering check");
                return;
            };
            let Some(month) = schedule.first_month_with_hours(today.month0() as usize) else {
                info!("no watering hours configured in any month");
                return;
            };
            let last = schedule::last_event(state.last_rain, state.last_sprinkle);
            if schedule::too_soon_since(last, today, month.interval_days) {
                info!(
                    last_event = ?last.map(|t| t.date_naive()),
                    interval_days = month.interval_days,
                    "interval since last rain or sprinkle not yet passed"
                );
                return;
            }
            if !budget::needs_watering(&state.budget.target_mm, &state.budget.applied_mm, state.budget.rain_forecast_mm) {
                info!("no station needs watering today");
                return;
            }
            month.valid_hours()
        };

        let clock = self.inner.host.clock.clone();
        let mut armed = lock(&self.inner.armed);
        for handle in armed.drain(..) {
            handle.abort();
        }
        for hour in hours {
            let Some(at) = clock.resolve_local(today.and_time(hour)) else {
                continue;
            };
            if at <= now {
                continue;
            }
            let engine = self.clone();
            armed.push(timers::spawn_at(clock.clone(), at, async move {
                // Detached so re-arming never cuts a running cycle short.
                tokio::spawn(async move { engine.run_watering_cycle().await });
            }));
            info!(at = %format_timestamp(&at), "watering scheduled");
        }
    }

    fn soil_is_wet(&self, soil: &SoilMoistureConfig) -> bool {
        match self.inner.host.entities.state(&soil.sensor) {
            Some(reading) if reading.is_available() => match reading.numeric() {
                Some(moisture) if moisture >= soil.threshold => {
                    info!(moisture, threshold = soil.threshold, "soil is wet enough, skipping watering");
                    true
                }
                Some(moisture) => {
                    debug!(moisture, threshold = soil.threshold, "soil is dry, proceeding");
                    false
                }
                None => {
                    warn!(sensor = %soil.sensor, value = %reading.state, "failed to parse soil moisture");
                    false
                }
            },
            other => {
                warn!(
                    sensor = %soil.sensor,
                    state = other.as_ref().map(|s| s.state.as_str()).unwrap_or("missing"),
                    "soil moisture sensor is unknown or unavailable"
                );
                false
            }
        }
    }

    /// One scheduled run: water every station still short of its target,
    /// one after the other, splitting what is left over the remaining runs.
    pub async fn run_watering_cycle(&self) {
        info!("running scheduled watering cycle");
        let settings = self.settings();
        if let Some(soil) = &settings.soil_moisture {
            if self.soil_is_wet(soil) {
                return;
            }
        }

        let now = self.now();
        let (stations, occurrences_left) = {
            let state = self.inner.state.lock().await;
            let Some(schedule) = state.schedule.as_ref() else {
                return;
            };
            let month = schedule.for_date(now.date_naive());
            if !month.has_hours() {
                info!("no watering hours configured this month");
                return;
            }
            let stations: Vec<usize> = (1..=state.num_stations())
                .filter(|s| month.minutes_for(*s) > 0)
                .collect();
            (stations, schedule::occurrences_left(month, now))
        };
        debug!(occurrences_left, ?stations, "cycle plan");

        for station in stations {
            let (minutes, per_run_mm) = {
                let state = self.inner.state.lock().await;
                let idx = station - 1;
                let remaining = budget::remaining_mm(
                    state.budget.target_mm.get(idx).copied().unwrap_or(0.0),
                    state.budget.applied_mm.get(idx).copied().unwrap_or(0.0),
                    state.budget.rain_forecast_mm,
                );
                if remaining <= 0.0 {
                    info!(station, "station already met the daily target");
                    continue;
                }
                let Some(hydraulics) = settings.hydraulics(&state, station) else {
                    continue;
                };
                let minutes = budget::minutes_needed(remaining, occurrences_left, &hydraulics);
                let per_run_mm = remaining / occurrences_left.max(1) as f64;
                info!(
                    station,
                    minutes,
                    per_run_mm,
                    daily_remaining_mm = remaining,
                    occurrences_left,
                    "station needs watering"
                );
                (minutes, per_run_mm)
            };
            if minutes == 0 {
                continue;
            }
            // A remote controller runs its full minutes regardless.
            let cap = settings.invoker.uses_sessions().then_some(per_run_mm);
            match self.start_session(station, Some(minutes), cap).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        error!(station, "watering session task failed: {e}");
                    }
                }
                Err(e) => warn!(station, "could not start scheduled watering: {e}"),
            }
        }
    }

    // -- Sessions ------------------------------------------------------------

    /// Reserve `station` for a new session and hand out its stop token, a
    /// child of the global stop token.
    fn claim(&self, station: usize) -> Result<(BusyGuard, CancellationToken)> {
        let token = self.session_token();
        let mut busy = lock(&self.inner.busy);
        if busy.contains_key(&station) {
            return Err(ControllerError::StationBusy(station));
        }
        busy.insert(station, token.clone());
        Ok((
            BusyGuard {
                set: self.inner.busy.clone(),
                station,
            },
            token,
        ))
    }

    /// A global token that was already cancelled by a stop is replaced.
    fn session_token(&self) -> CancellationToken {
        let mut stop = lock(&self.inner.stop);
        if stop.is_cancelled() {
            *stop = CancellationToken::new();
        }
        stop.child_token()
    }

    fn signal_stop(&self) {
        lock(&self.inner.stop).cancel();
    }

    /// Start watering `station` for `minutes` (the manual duration when
    /// `None`). Returns once the station is on; the handle resolves when the
    /// session ends. A failed start leaves the station state untouched.
    pub async fn start_irrigation(&self, station: usize, minutes: Option<u32>) -> Result<JoinHandle<()>> {
        self.start_session(station, minutes, None).await
    }

    /// `cap_mm` ends the session early once it has applied that much.
    async fn start_session(&self, station: usize, minutes: Option<u32>, cap_mm: Option<f64>) -> Result<JoinHandle<()>> {
        let settings = self.settings();
        let manual = {
            let state = self.inner.state.lock().await;
            check_station(station, state.num_stations())?;
            state.manual_duration_min
        };
        let minutes = minutes.unwrap_or(manual);
        if minutes == 0 {
            return Err(ControllerError::config("watering duration must be at least one minute"));
        }

        let (busy, stop) = self.claim(station)?;
        info!(station, minutes, "starting watering");

        if let Err(e) = settings.invoker.start(station, minutes).await {
            error!(station, "failed to start watering: {e}");
            return Err(e);
        }

        let session = if settings.invoker.uses_sessions() {
            let start_at = self.now();
            let end_at = start_at + TimeDelta::minutes(i64::from(minutes));
            self.inner.state.lock().await.begin_session(ActiveIrrigation {
                station,
                start_at,
                end_at,
                duration_minutes: minutes,
            });
            self.save().await;
            let failsafe = self.arm_stop(
                station,
                end_at,
                Duration::from_secs(u64::from(minutes) * 60) + FAILSAFE_GRACE,
            );
            Some((end_at, failsafe))
        } else {
            None
        };

        {
            let mut state = self.inner.state.lock().await;
            state.set_station(station, StationStatus::Sprinkling);
            self.publish_locked(&state, &settings, true);
        }

        let engine = self.clone();
        let run = SessionRun {
            station,
            minutes,
            cap_mm,
            stop,
            session,
        };
        Ok(tokio::spawn(async move {
            engine.run_session(settings, run, busy).await;
        }))
    }

    async fn run_session(&self, settings: Arc<Settings>, run: SessionRun, _busy: BusyGuard) {
        let SessionRun {
            station,
            minutes,
            cap_mm,
            stop,
            session,
        } = run;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + TICK, TICK);
        let mut stopped_early = false;
        let mut delivered_mm = 0.0;

        for _ in 0..u64::from(minutes) * 60 {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    stopped_early = true;
                    break;
                }
                _ = ticker.tick() => {}
            }
            let mut state = self.inner.state.lock().await;
            let Some(hydraulics) = settings.hydraulics(&state, station) else {
                continue;
            };
            state.total_water_consumption_l += hydraulics.litres_per_tick();
            if let Some(applied) = state.budget.applied_mm.get_mut(station - 1) {
                *applied += hydraulics.mm_per_tick();
            }
            delivered_mm += hydraulics.mm_per_tick();
            if cap_mm.is_some_and(|cap| delivered_mm >= cap - 1e-9) {
                debug!(station, delivered_mm, "run target reached");
                break;
            }
        }

        if stopped_early {
            info!(station, "watering cancelled");
        } else {
            info!(station, "finished watering");
        }

        if let Some((end_at, failsafe)) = session {
            failsafe.abort();
            if let Err(e) = settings.invoker.stop(station).await {
                warn!(station, "failed turning off station switch: {e}");
            }
            let mut state = self.inner.state.lock().await;
            if state.session(station).is_some_and(|a| a.end_at == end_at) {
                state.end_session(station);
            }
        }

        {
            let mut state = self.inner.state.lock().await;
            state.set_station(station, StationStatus::Stopped);
            state.last_sprinkle = Some(self.now());
            self.publish_locked(&state, &settings, true);
        }
        self.save().await;
    }

    /// Stop `station` after `delay` if its session ending at `end_at` is
    /// still recorded.
    fn arm_stop(&self, station: usize, end_at: DateTime<FixedOffset>, delay: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        timers::spawn_after(delay, async move { engine.stop_if_active(station, end_at).await })
    }

    /// Forced end of one station's session. Other stations keep running.
    async fn stop_if_active(&self, station: usize, end_at: DateTime<FixedOffset>) {
        let active = self
            .inner
            .state
            .lock()
            .await
            .session(station)
            .is_some_and(|a| a.end_at == end_at);
        if !active {
            debug!(station, "session already ended, nothing to stop");
            return;
        }
        warn!(station, end_at = %format_timestamp(&end_at), "session reached its end time, forcing stop");
        let token = lock(&self.inner.busy).get(&station).cloned();
        if let Some(token) = token {
            token.cancel();
        }

        let settings = self.settings();
        if let Err(e) = settings.invoker.stop(station).await {
            // The record stays, so a restart retries it.
            error!(station, "forced stop failed: {e}");
            return;
        }
        {
            let mut state = self.inner.state.lock().await;
            state.end_session(station);
            state.set_station(station, StationStatus::Stopped);
            self.publish_locked(&state, &settings, true);
        }
        self.save().await;
    }

    /// Startup check for switch control: persisted sessions that already
    /// ended are switched off now, those still running keep their station
    /// and get a stop at their original end.
    async fn restore_active_irrigation(&self) {
        let settings = self.settings();
        let sessions = {
            let mut state = self.inner.state.lock().await;
            if !settings.invoker.uses_sessions() {
                state.active_sessions.clear();
                return;
            }
            state.active_sessions.clone()
        };

        for active in sessions {
            let station = active.station;
            if self.now() >= active.end_at {
                warn!(station, "found stale active irrigation, turning it off now");
                if let Err(e) = settings.invoker.stop(station).await {
                    warn!(station, "failed turning off stale station switch: {e}");
                }
                self.inner.state.lock().await.end_session(station);
                self.save().await;
                continue;
            }

            let (busy, token) = match self.claim(station) {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(station, "cannot restore session: {e}");
                    continue;
                }
            };
            let remaining = timers::until(self.inner.host.clock.as_ref(), active.end_at);
            info!(station, remaining_secs = remaining.as_secs(), "restored active irrigation");
            self.inner.state.lock().await.set_station(station, StationStatus::Sprinkling);

            let engine = self.clone();
            let end_at = active.end_at;
            let handle = tokio::spawn(async move {
                let _busy = busy;
                tokio::select! {
                    _ = token.cancelled() => debug!(station, "restored session stopped"),
                    _ = tokio::time::sleep(remaining) => engine.stop_if_active(station, end_at).await,
                }
            });
            {
                let mut restored = lock(&self.inner.restored);
                restored.retain(|h| !h.is_finished());
                restored.push(handle);
            }
        }
    }

    /// Stop every station. Running sessions end within one tick.
    pub async fn stop_irrigation(&self) -> Result<()> {
        let settings = self.settings();
        info!("stopping watering");
        if let Err(e) = settings.invoker.stop_all().await {
            error!("failed to stop watering: {e}");
            return Err(e);
        }
        self.signal_stop();
        {
            let mut state = self.inner.state.lock().await;
            state.active_sessions.clear();
            state.stop_all_stations();
            self.publish_locked(&state, &settings, true);
        }
        self.save().await;
        info!("stopped watering");
        Ok(())
    }

    // -- Controller and settings ---------------------------------------------

    pub async fn turn_controller_on(&self) -> Result<()> {
        self.set_controller(ControllerStatus::On).await
    }

    pub async fn turn_controller_off(&self) -> Result<()> {
        self.set_controller(ControllerStatus::Off).await
    }

    async fn set_controller(&self, status: ControllerStatus) -> Result<()> {
        let settings = self.settings();
        info!(%status, "switching irrigation controller");
        let result = match status {
            ControllerStatus::On => settings.invoker.controller_on().await,
            ControllerStatus::Off => settings.invoker.controller_off().await,
        };
        if let Err(e) = result {
            error!(%status, "failed to switch controller: {e}");
            return Err(e);
        }
        {
            let mut state = self.inner.state.lock().await;
            state.controller = status;
            self.publish_locked(&state, &settings, true);
        }
        self.save().await;
        Ok(())
    }

    /// Replace the schedule. Station keys are reconciled with the configured
    /// station count first.
    pub async fn set_schedule(&self, mut schedule: Schedule) -> Result<()> {
        let settings = self.settings();
        if schedule.reconcile_stations(settings.num_stations()) {
            warn!(stations = settings.num_stations(), "schedule station keys reconciled");
        }
        {
            let mut state = self.inner.state.lock().await;
            state.schedule = Some(schedule);
            state.next_schedule = next_schedule_for(&state, self.inner.host.clock.as_ref());
            self.publish_locked(&state, &settings, true);
        }
        self.persist().await?;
        info!("updated schedule");
        Ok(())
    }

    pub async fn set_manual_duration(&self, minutes: u32) -> Result<()> {
        if minutes == 0 {
            return Err(ControllerError::config("manual duration must be at least one minute"));
        }
        let settings = self.settings();
        {
            let mut state = self.inner.state.lock().await;
            state.manual_duration_min = minutes;
            self.publish_locked(&state, &settings, true);
        }
        info!(minutes, "manual duration updated");
        self.persist().await
    }

    pub async fn set_water_flow_rate(&self, station: usize, flow_rate_lpm: f64) -> Result<()> {
        if !flow_rate_lpm.is_finite() || flow_rate_lpm < 0.0 {
            return Err(ControllerError::config(format!(
                "flow rate {flow_rate_lpm} must be zero or positive"
            )));
        }
        let settings = self.settings();
        {
            let mut state = self.inner.state.lock().await;
            check_station(station, state.num_stations())?;
            if let Some(slot) = state.flow_rates_lpm.get_mut(station - 1) {
                *slot = flow_rate_lpm;
            }
            self.publish_locked(&state, &settings, true);
        }
        info!(station, flow_rate_lpm, "flow rate updated");
        self.persist().await
    }

    /// Re-derive every setting from `config` and re-evaluate right away.
    /// An invalid config is rejected and the running settings stay.
    pub async fn reconfigure(&self, config: ControllerConfig) -> Result<()> {
        config.validate()?;
        let settings = Arc::new(Settings::derive(&config, &self.inner.host));
        {
            let mut state = self.inner.state.lock().await;
            state.resize(settings.num_stations(), &settings.default_flow_rates);
            if let Some(provider) = &settings.weather {
                provider
                    .cache()
                    .seed(state.weather.forecast.clone(), state.weather.current.clone());
            }
        }
        *self.inner.settings.write().unwrap_or_else(|p| p.into_inner()) = settings.clone();
        info!(stations = settings.num_stations(), "configuration updated");

        self.initialize_schedule().await;
        if lock(&self.inner.background).is_some() {
            self.spawn_background();
        }
        self.check_and_schedule_watering().await;
        self.refresh().await
    }

    // -- Refresh -------------------------------------------------------------

    /// The periodic update: daily reset check, weather, rain accounting,
    /// next watering date, devices and snapshot.
    pub async fn refresh(&self) -> Result<()> {
        let now = self.now();
        self.reset_if_due(now).await;
        let settings = self.settings();

        let (outlook, current, forecast_rain) = match &settings.weather {
            Some(provider) => {
                let outlook = provider
                    .will_it_rain()
                    .await
                    .inspect_err(|e| warn!(provider = provider.name(), "forecast unavailable, assuming no rain: {e}"))
                    .ok();
                let current = provider
                    .is_raining()
                    .await
                    .inspect_err(|e| warn!(provider = provider.name(), "current weather unavailable: {e}"))
                    .ok();
                let forecast_rain = provider.total_rain_forecast_for_today().await.unwrap_or(0.0);
                (outlook, current, forecast_rain)
            }
            None => (None, None, 0.0),
        };

        let stop_for_rain = {
            let mut state = self.inner.state.lock().await;
            state.weather.will_rain_today = outlook.as_ref().is_some_and(|o| o.will_rain);
            state.weather.forecast = match (outlook, &settings.weather) {
                (Some(o), _) => o.forecast,
                (None, Some(provider)) => provider.cache().cached_forecast(),
                (None, None) => Vec::new(),
            };
            let raining = current.as_ref().is_some_and(|c| c.is_raining);
            state.weather.is_raining_now = raining;

            if raining {
                let rate = current.as_ref().map_or(0.0, |c| c.rain_mm_per_hour);
                state.weather.has_rained_today = true;
                state.last_rain = Some(now);
                state.budget.rain_time_minutes += settings.poll_interval_sec as f64 / 60.0;
                state.budget.rain_total_mm += budget::rain_per_poll(rate, settings.poll_interval_sec);
                debug!(rate, total = state.budget.rain_total_mm, "raining");
            }
            state.weather.current = current;
            state.budget.rain_forecast_mm = forecast_rain + state.budget.rain_total_mm;

            raining && !settings.sprinkle_with_rain && state.any_sprinkling()
        };

        if stop_for_rain {
            info!("raining, stopping watering");
            if let Err(e) = self.stop_irrigation().await {
                warn!("could not stop watering for rain: {e}");
            }
        }

        {
            let mut state = self.inner.state.lock().await;
            state.next_schedule = next_schedule_for(&state, self.inner.host.clock.as_ref());
        }

        let result = self.persist().await;
        let state = self.inner.state.lock().await;
        self.publish_locked(&state, &settings, result.is_ok());
        result
    }
}

// ===========================================================================
// Tests
// ===========================================================================
