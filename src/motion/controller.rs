// src/motion/controller.rs - Motor-set lifecycle: activate, confirm, prepare, home, run, stop, off
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use super::homing::{HOMING_PASSES, HomingPass, PassOutcome, pass_budget};
use super::motor::{AxisId, CommitReport, Motor, ParamName, ValidationError};
use super::poll::hold;
use super::registry::MotorSetRegistry;
use crate::config::Config;
use crate::hardware::tags::TagMap;
use crate::hardware::{ChannelError, DeviceChannel, Provenance, TagSession, TagValue, reset_live_axes};
use crate::notify::NotificationSink;
use crate::storage::{Preset, StoreError, TelemetryStore};
use crate::telemetry::{TelemetryConfig, TelemetrySampler};

/// Granularity at which holds notice a stop request.
const HOLD_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Connectivity error: {0}")]
    Connectivity(#[from] ChannelError),
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("Failed to write parameters to motor(s) {}", axis_list(.axes))]
    PartialWriteFailure { axes: Vec<AxisId> },
    #[error("Unable to home motors: pass {pass} timed out after {iterations} polls")]
    HomingTimeout { pass: u32, iterations: u32 },
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("{0} is already in progress")]
    Busy(Operation),
    #[error("Axis {0} belongs to a confirmed motor set")]
    AxisFrozen(AxisId),
    #[error("Axis {0} is not active")]
    AxisInactive(AxisId),
    #[error("No motor set {0}")]
    UnknownSet(usize),
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("Background task failed: {0}")]
    Task(String),
}

fn axis_list(axes: &[AxisId]) -> String {
    let ids: Vec<String> = axes.iter().map(ToString::to_string).collect();
    format!("[{}]", ids.join(", "))
}

/// Operation classes; at most one of each runs at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    PowerOn,
    PowerOff,
    Prepare,
    Home,
    Run,
    Curve,
    Stop,
}

impl Operation {
    const COUNT: usize = 7;

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::PowerOn => "Power on",
            Operation::PowerOff => "Power off",
            Operation::Prepare => "Prepare",
            Operation::Home => "Homing",
            Operation::Run => "Run",
            Operation::Curve => "Curve",
            Operation::Stop => "Stop",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Unprepared,
    Homed,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    SingleStroke,
    Continuous,
    Curve,
}

impl RunMode {
    pub fn run_tag(self, tags: &TagMap) -> String {
        match self {
            RunMode::SingleStroke => tags.run_single(),
            RunMode::Continuous => tags.run_continuous(),
            RunMode::Curve => tags.run_curve(),
        }
    }

    fn operation(self) -> Operation {
        match self {
            RunMode::Curve => Operation::Curve,
            _ => Operation::Run,
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::SingleStroke => write!(f, "single stroke"),
            RunMode::Continuous => write!(f, "continuous"),
            RunMode::Curve => write!(f, "curve"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The machine was running; its stop tag was written.
    Stopped(RunMode),
    /// A run was starting and will not issue its run tag.
    Cancelled,
    /// Nothing was running. No tag was written.
    AlreadyStopped,
}

/// Snapshot handed to observers on every state change.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerStatus {
    pub state: ControlState,
    pub homing: bool,
    pub run_enable: bool,
    pub active_run: Option<RunMode>,
    pub working_axes: Vec<AxisId>,
    pub sets: Vec<Vec<AxisId>>,
    pub telemetry: TelemetryConfig,
    pub provenance: Provenance,
}

struct Session {
    working: BTreeMap<AxisId, Motor>,
    registry: MotorSetRegistry,
    state: ControlState,
    homing: bool,
    active_run: Option<RunMode>,
    cancelled_run: Option<RunMode>,
    /// Axes with a known reference position from the last successful homing.
    homed_axes: BTreeSet<AxisId>,
    run_enable: bool,
    telemetry: TelemetryConfig,
    /// Bumped by motor-off and full reset; background work started under an older
    /// epoch must not apply its result.
    epoch: u64,
}

impl Session {
    fn new(telemetry: TelemetryConfig) -> Self {
        Self {
            working: BTreeMap::new(),
            registry: MotorSetRegistry::new(),
            state: ControlState::Unprepared,
            homing: false,
            active_run: None,
            cancelled_run: None,
            homed_axes: BTreeSet::new(),
            run_enable: false,
            telemetry,
            epoch: 0,
        }
    }

    fn motor_count(&self) -> usize {
        self.working.len() + self.registry.total_axes()
    }

    fn refresh_run_enable(&mut self) {
        self.run_enable = self.motor_count() > 0
            && self.working.values().all(Motor::is_synchronized)
            && self.registry.is_synchronized();
    }

    /// Working mapping and confirmed sets together.
    fn live_axes(&self) -> Vec<AxisId> {
        let axes: BTreeSet<AxisId> = self
            .working
            .keys()
            .copied()
            .chain(self.registry.axes())
            .collect();
        axes.into_iter().collect()
    }

    fn unhomed_axes(&self) -> Vec<AxisId> {
        self.live_axes()
            .into_iter()
            .filter(|axis| !self.homed_axes.contains(axis))
            .collect()
    }

    /// Fold commits made on copies back into the live motors. Returns the axes whose
    /// commit was incomplete.
    fn merge_commits(&mut self, committed: &[(Motor, CommitReport)]) -> Vec<AxisId> {
        let mut failed = Vec::new();
        for (motor, report) in committed {
            if let Some(live) = self.registry.motor_mut(motor.axis()) {
                live.merge_commit(motor, report);
            }
            if !report.is_complete() {
                failed.push(motor.axis());
            }
        }
        failed
    }

    fn ensure_idle(&self) -> Result<(), ControlError> {
        if self.homing {
            return Err(ControlError::Busy(Operation::Home));
        }
        if let Some(mode) = self.active_run {
            return Err(ControlError::InvalidTransition(format!("a {} run is active", mode)));
        }
        Ok(())
    }

    fn status(&self, provenance: Provenance) -> ControllerStatus {
        ControllerStatus {
            state: self.state,
            homing: self.homing,
            run_enable: self.run_enable,
            active_run: self.active_run,
            working_axes: self.working.keys().copied().collect(),
            sets: self.registry.sets().iter().map(|set| set.axes()).collect(),
            telemetry: self.telemetry,
            provenance,
        }
    }
}

struct OperationLocks {
    locks: [Arc<Mutex<()>>; Operation::COUNT],
}

impl OperationLocks {
    fn new() -> Self {
        Self {
            locks: std::array::from_fn(|_| Arc::new(Mutex::new(()))),
        }
    }

    fn try_acquire(&self, operation: Operation) -> Result<OwnedMutexGuard<()>, ControlError> {
        self.locks[operation.index()]
            .clone()
            .try_lock_owned()
            .map_err(|_| ControlError::Busy(operation))
    }
}

/// Commit `motors` (copies taken from the session) one after another, checking `cancel`
/// between motors.
async fn commit_copies(
    link: &mut dyn TagSession,
    tags: &TagMap,
    motors: Vec<Motor>,
    cancel: Option<&AtomicBool>,
) -> Vec<(Motor, CommitReport)> {
    let mut committed = Vec::with_capacity(motors.len());
    for mut motor in motors {
        if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            break;
        }
        let report = motor.commit(link, tags).await;
        committed.push((motor, report));
    }
    committed
}

struct Inner {
    config: Config,
    tags: TagMap,
    channel: Arc<dyn DeviceChannel>,
    sink: Arc<dyn NotificationSink>,
    store: Option<Arc<dyn TelemetryStore>>,
    session: Mutex<Session>,
    locks: OperationLocks,
    /// Raised by stop, motor-off and reset; cleared when a run starts.
    stop: Arc<AtomicBool>,
    /// Raised by motor-off and reset to abandon an in-flight homing sequence.
    halt: Arc<AtomicBool>,
}

/// Cloneable handle to the control core. Long operations run as spawned tasks and
/// return their `JoinHandle`.
#[derive(Clone)]
pub struct MotionController {
    inner: Arc<Inner>,
}

impl MotionController {
    pub fn new(
        config: Config,
        channel: Arc<dyn DeviceChannel>,
        sink: Arc<dyn NotificationSink>,
        store: Option<Arc<dyn TelemetryStore>>,
    ) -> Self {
        let telemetry = match config.telemetry.validate() {
            Ok(()) => config.telemetry,
            Err(e) => {
                tracing::warn!("Ignoring configured telemetry settings: {}", e);
                TelemetryConfig::default()
            }
        };
        let tags = TagMap::new(config.controller.program.clone());
        tracing::info!(provenance = %channel.provenance(), program = %tags.program(), "Motion controller ready");

        Self {
            inner: Arc::new(Inner {
                config,
                tags,
                channel,
                sink,
                store,
                session: Mutex::new(Session::new(telemetry)),
                locks: OperationLocks::new(),
                stop: Arc::new(AtomicBool::new(false)),
                halt: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    pub fn tags(&self) -> &TagMap {
        &self.inner.tags
    }

    pub fn provenance(&self) -> Provenance {
        self.inner.channel.provenance()
    }

    pub async fn status(&self) -> ControllerStatus {
        let session = self.inner.session.lock().await;
        session.status(self.provenance())
    }

    /// Human-readable summary of the confirmed sets.
    pub async fn set_summary(&self) -> Vec<String> {
        self.inner.session.lock().await.registry.summary()
    }

    /// Targets and confirmed values of one live motor.
    pub async fn motor(&self, axis: AxisId) -> Option<Motor> {
        let session = self.inner.session.lock().await;
        session
            .working
            .get(&axis)
            .or_else(|| session.registry.sets().iter().find_map(|set| set.get(axis)))
            .cloned()
    }

    /// Enable `axes` on the controller and add them to the working selection.
    /// Returns the axes that were newly activated.
    pub async fn activate_axes(&self, axes: &[AxisId]) -> Result<Vec<AxisId>, ControlError> {
        let result = self.inner.activate(axes).await;
        self.inner.surface(result)
    }

    pub async fn deactivate_axes(&self, axes: &[AxisId]) -> Result<Vec<AxisId>, ControlError> {
        let result = self.inner.deactivate(axes).await;
        self.inner.surface(result)
    }

    /// Set `param` on every motor of the working selection; returns how many changed.
    pub async fn set_working_parameter(&self, param: ParamName, value: TagValue) -> Result<usize, ControlError> {
        let result = async {
            param.validate(value)?;
            let mut session = self.inner.session.lock().await;
            for motor in session.working.values_mut() {
                motor.set_parameter(param, value)?;
            }
            let changed = session.working.len();
            self.inner.publish(&mut session);
            Ok::<_, ControlError>(changed)
        }
        .await;
        self.inner.surface(result)
    }

    pub async fn set_set_parameter(&self, index: usize, param: ParamName, value: TagValue) -> Result<usize, ControlError> {
        let result = async {
            param.validate(value)?;
            let mut session = self.inner.session.lock().await;
            let set = session
                .registry
                .get_mut(index)
                .ok_or(ControlError::UnknownSet(index))?;
            for motor in set.motors_mut() {
                motor.set_parameter(param, value)?;
            }
            let changed = set.len();
            self.inner.publish(&mut session);
            Ok::<_, ControlError>(changed)
        }
        .await;
        self.inner.surface(result)
    }

    pub async fn set_motor_parameter(&self, axis: AxisId, param: ParamName, value: TagValue) -> Result<(), ControlError> {
        let result = async {
            let mut session = self.inner.session.lock().await;
            let session_ref = &mut *session;
            let motor = match session_ref.working.get_mut(&axis) {
                Some(motor) => motor,
                None => session_ref
                    .registry
                    .motor_mut(axis)
                    .ok_or(ControlError::AxisInactive(axis))?,
            };
            motor.set_parameter(param, value)?;
            self.inner.publish(&mut session);
            Ok::<_, ControlError>(())
        }
        .await;
        self.inner.surface(result)
    }

    /// Move the working selection into a new motor set and return its index.
    pub async fn confirm_set(&self) -> Result<usize, ControlError> {
        let result = async {
            let mut session = self.inner.session.lock().await;
            if session.working.is_empty() {
                return Err(ControlError::InvalidTransition(
                    "no working motors to confirm".to_string(),
                ));
            }
            let working = std::mem::take(&mut session.working);
            if session.state == ControlState::Homed && working.keys().any(|axis| !session.homed_axes.contains(axis)) {
                tracing::info!("New motor set has not been homed");
                session.state = ControlState::Unprepared;
            }
            let index = session.registry.confirm(&working);
            let summary = session.registry.summary().swap_remove(index);
            self.inner.publish(&mut session);
            self.inner.sink.on_message(&format!("Confirmed {}", summary));
            Ok::<_, ControlError>(index)
        }
        .await;
        self.inner.surface(result)
    }

    /// Commit every confirmed set, then home. Returns the homing task.
    pub async fn prepare(&self) -> Result<JoinHandle<Result<(), ControlError>>, ControlError> {
        let result = self.inner.prepare().await;
        let result = match result {
            Ok(()) => self.spawn_homing().await,
            Err(e) => Err(e),
        };
        self.inner.surface(result)
    }

    /// Home every confirmed set without committing parameters first.
    pub async fn home(&self) -> Result<JoinHandle<Result<(), ControlError>>, ControlError> {
        let result = self.spawn_homing().await;
        self.inner.surface(result)
    }

    async fn spawn_homing(&self) -> Result<JoinHandle<Result<(), ControlError>>, ControlError> {
        let guard = self.inner.locks.try_acquire(Operation::Home)?;
        let (motors, epoch) = {
            let mut session = self.inner.session.lock().await;
            session.ensure_idle()?;
            if session.registry.is_empty() {
                return Err(ControlError::InvalidTransition(
                    "no confirmed motor sets to home".to_string(),
                ));
            }
            if !session.registry.is_synchronized() {
                return Err(ControlError::InvalidTransition(
                    "motor parameters must be written before homing".to_string(),
                ));
            }
            session.homing = true;
            self.inner.halt.store(false, Ordering::SeqCst);
            self.inner.publish(&mut session);
            let motors: Vec<Motor> = session.registry.motors().cloned().collect();
            (motors, session.epoch)
        };

        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            let _guard = guard;
            let result = inner.run_homing(&motors, epoch).await;
            inner.surface(result)
        }))
    }

    /// Begin a run in `mode`. Guards are checked before returning; the run itself
    /// (including any re-commit) happens on the returned task.
    pub async fn start(&self, mode: RunMode) -> Result<JoinHandle<Result<(), ControlError>>, ControlError> {
        let result = self.begin_run(mode).await;
        self.inner.surface(result)
    }

    async fn begin_run(&self, mode: RunMode) -> Result<JoinHandle<Result<(), ControlError>>, ControlError> {
        let guard = self.inner.locks.try_acquire(mode.operation())?;
        let epoch = {
            let mut session = self.inner.session.lock().await;
            session.ensure_idle()?;
            if session.state != ControlState::Homed {
                return Err(ControlError::InvalidTransition(format!(
                    "cannot start a {} run while {:?}",
                    mode, session.state
                )));
            }
            if session.motor_count() == 0 {
                return Err(ControlError::InvalidTransition("no motors to run".to_string()));
            }
            let unhomed = session.unhomed_axes();
            if !unhomed.is_empty() {
                return Err(ControlError::InvalidTransition(format!(
                    "motor(s) {} have not been homed",
                    axis_list(&unhomed)
                )));
            }
            session.active_run = Some(mode);
            session.cancelled_run = None;
            self.inner.stop.store(false, Ordering::SeqCst);
            self.inner.publish(&mut session);
            session.epoch
        };

        tracing::info!(provenance = %self.provenance(), "Starting {} run", mode);
        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            let _guard = guard;
            let result = inner.run(mode, epoch).await;
            inner.surface(result)
        }))
    }

    pub async fn stop(&self) -> Result<StopOutcome, ControlError> {
        let result = self.inner.stop().await;
        self.inner.surface(result)
    }

    /// Clear faults, force every motion tag low, disable all axes and drop every motor.
    pub async fn motor_off(&self) -> Result<(), ControlError> {
        let result = self.inner.motor_off().await;
        self.inner.surface(result)
    }

    /// Motor-off plus a return to the initial session state.
    pub async fn full_reset(&self) -> Result<(), ControlError> {
        let result = async {
            self.inner.motor_off().await?;
            let mut session = self.inner.session.lock().await;
            session.state = ControlState::Unprepared;
            session.homing = false;
            session.telemetry = TelemetryConfig::default();
            session.epoch += 1;
            self.inner.publish(&mut session);
            self.inner.sink.on_message("Application fully reset to initial state");
            Ok::<_, ControlError>(())
        }
        .await;
        self.inner.surface(result)
    }

    pub async fn set_telemetry(&self, telemetry: TelemetryConfig) -> Result<(), ControlError> {
        let result = async {
            telemetry.validate()?;
            let mut session = self.inner.session.lock().await;
            session.telemetry = telemetry;
            self.inner.publish(&mut session);
            Ok::<_, ControlError>(())
        }
        .await;
        self.inner.surface(result)
    }

    /// Overwrite the targets of the chosen sets from `preset`. Homing is required again
    /// afterwards. Returns the number of motors updated.
    pub async fn apply_preset(&self, preset: &Preset, set_indices: &[usize]) -> Result<usize, ControlError> {
        let result = async {
            preset.validate()?;
            let mut session = self.inner.session.lock().await;
            session.ensure_idle()?;
            if let Some(missing) = set_indices.iter().find(|index| session.registry.get(**index).is_none()) {
                return Err(ControlError::UnknownSet(*missing));
            }

            let mut updated = 0;
            for index in set_indices {
                if let Some(set) = session.registry.get_mut(*index) {
                    for motor in set.motors_mut() {
                        if let Some(params) = preset.params_for(motor.axis()) {
                            motor.apply_params(params)?;
                            updated += 1;
                        }
                    }
                }
            }
            if updated > 0 {
                session.state = ControlState::Unprepared;
            }
            self.inner.publish(&mut session);
            self.inner
                .sink
                .on_message(&format!("Applied preset '{}' to {} motor(s)", preset.name, updated));
            Ok::<_, ControlError>(updated)
        }
        .await;
        self.inner.surface(result)
    }

    /// Capture the targets of set `index` as a named preset.
    pub async fn preset_from_set(&self, index: usize, name: &str) -> Result<Preset, ControlError> {
        let session = self.inner.session.lock().await;
        let set = session.registry.get(index).ok_or(ControlError::UnknownSet(index))?;
        Ok(Preset::from_set(name, set))
    }
}

impl Inner {
    /// Log and forward an error before handing it back to the caller.
    fn surface<T>(&self, result: Result<T, ControlError>) -> Result<T, ControlError> {
        if let Err(e) = &result {
            tracing::error!(provenance = %self.channel.provenance(), "{}", e);
            self.sink.on_message(&e.to_string());
        }
        result
    }

    fn publish(&self, session: &mut Session) {
        session.refresh_run_enable();
        self.sink.on_state_changed(&session.status(self.channel.provenance()));
    }

    async fn connect(&self) -> Result<Box<dyn TagSession>, ControlError> {
        tracing::debug!(provenance = %self.channel.provenance(), "Opening controller session");
        Ok(self.channel.connect().await?)
    }

    async fn pulse(&self, link: &mut dyn TagSession, tag: &str) -> Result<(), ControlError> {
        link.write_required(tag, 1).await?;
        tokio::time::sleep(self.config.timing.pulse_hold()).await;
        link.write_required(tag, 0).await?;
        Ok(())
    }

    async fn activate(&self, axes: &[AxisId]) -> Result<Vec<AxisId>, ControlError> {
        let _guard = self.locks.try_acquire(Operation::PowerOn)?;
        let added: Vec<AxisId> = {
            let session = self.session.lock().await;
            if let Some(frozen) = axes.iter().find(|axis| session.registry.contains(**axis)) {
                return Err(ControlError::AxisFrozen(*frozen));
            }
            let requested: BTreeSet<AxisId> = axes.iter().copied().collect();
            requested
                .into_iter()
                .filter(|axis| !session.working.contains_key(axis))
                .collect()
        };

        let mut link = self.connect().await?;
        for axis in &added {
            link.write_required(&self.tags.live_enable(*axis), 1).await?;
        }
        self.pulse(link.as_mut(), &self.tags.clear_error()).await?;
        self.pulse(link.as_mut(), &self.tags.motor_boot()).await?;
        drop(link);

        let mut session = self.session.lock().await;
        for axis in &added {
            session.working.entry(*axis).or_insert_with(|| Motor::new(*axis));
        }
        self.publish(&mut session);
        tracing::info!(axes = ?added, "Motor(s) turned ON");
        self.sink.on_message("Motor(s) turned ON");
        Ok(added)
    }

    async fn deactivate(&self, axes: &[AxisId]) -> Result<Vec<AxisId>, ControlError> {
        let _guard = self.locks.try_acquire(Operation::PowerOn)?;
        let removed: Vec<AxisId> = {
            let session = self.session.lock().await;
            if let Some(frozen) = axes.iter().find(|axis| session.registry.contains(**axis)) {
                return Err(ControlError::AxisFrozen(*frozen));
            }
            let requested: BTreeSet<AxisId> = axes.iter().copied().collect();
            requested
                .into_iter()
                .filter(|axis| session.working.contains_key(axis))
                .collect()
        };

        let mut link = self.connect().await?;
        for axis in &removed {
            link.write_required(&self.tags.live_enable(*axis), 0).await?;
        }
        drop(link);

        let mut session = self.session.lock().await;
        for axis in &removed {
            session.working.remove(axis);
        }
        self.publish(&mut session);
        tracing::info!(axes = ?removed, "Motor(s) deactivated");
        Ok(removed)
    }

    async fn prepare(&self) -> Result<(), ControlError> {
        let _guard = self.locks.try_acquire(Operation::Prepare)?;
        let (motors, epoch) = {
            let session = self.session.lock().await;
            session.ensure_idle()?;
            if session.registry.is_empty() {
                return Err(ControlError::InvalidTransition(
                    "no confirmed motor sets to prepare".to_string(),
                ));
            }
            if session.registry.is_ready() {
                tracing::info!("Motor sets already synchronized, skipping commit");
                return Ok(());
            }
            let motors: Vec<Motor> = session.registry.motors().cloned().collect();
            (motors, session.epoch)
        };

        let mut link = self.connect().await?;
        let committed = commit_copies(link.as_mut(), &self.tags, motors, None).await;
        drop(link);

        let mut session = self.session.lock().await;
        if session.epoch != epoch {
            return Err(ControlError::InvalidTransition(
                "motors were turned off while parameters were written".to_string(),
            ));
        }
        let failed = session.merge_commits(&committed);
        self.publish(&mut session);
        if !failed.is_empty() {
            return Err(ControlError::PartialWriteFailure { axes: failed });
        }
        tracing::info!("Successfully wrote to motors");
        self.sink.on_message("Parameters written to motor(s)");
        Ok(())
    }

    async fn run_homing(&self, motors: &[Motor], epoch: u64) -> Result<(), ControlError> {
        let result = self.homing_passes(motors).await;

        let mut session = self.session.lock().await;
        if session.epoch != epoch {
            tracing::info!("Homing result discarded after reset");
            return Ok(());
        }
        session.homing = false;
        if matches!(result, Ok(true)) {
            session.state = ControlState::Homed;
            session.homed_axes.extend(motors.iter().map(Motor::axis));
        }
        self.publish(&mut session);
        drop(session);

        match result {
            Ok(true) => {
                tracing::info!("Motor(s) Homed");
                self.sink.on_message("Motor(s) Homed");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Returns `Ok(false)` when homing was abandoned by motor-off or reset.
    async fn homing_passes(&self, motors: &[Motor]) -> Result<bool, ControlError> {
        let mut link = self.connect().await?;
        let runner = HomingPass {
            tags: &self.tags,
            timing: &self.config.timing,
            home_bit: self.config.controller.home_bit,
            cancel: self.halt.clone(),
        };

        for pass in 0..HOMING_PASSES {
            let number = pass + 1;
            self.sink.on_message(&format!("Homing motor(s): pass {} of {}", number, HOMING_PASSES));
            match runner.run(link.as_mut(), motors, pass).await? {
                PassOutcome::Homed { iterations } => {
                    tracing::info!(pass = number, iterations, "Homing pass complete");
                }
                PassOutcome::TimedOut { homed, iterations } => {
                    tracing::warn!(pass = number, iterations, homed, total = motors.len(), "Homing pass timed out");
                    self.sink.on_message(&format!(
                        "Homing pass {} timed out after {} polls: {} of {} motor(s) homed",
                        number,
                        iterations,
                        homed,
                        motors.len()
                    ));
                    if number == HOMING_PASSES {
                        return Err(ControlError::HomingTimeout {
                            pass: number,
                            iterations: pass_budget(pass),
                        });
                    }
                }
                PassOutcome::Cancelled => {
                    tracing::info!(pass = number, "Homing abandoned");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn run(&self, mode: RunMode, epoch: u64) -> Result<(), ControlError> {
        let result = self.drive_run(mode, epoch).await;
        if result.is_err() {
            let mut session = self.session.lock().await;
            // A machine left running keeps its active run so stop can still end it.
            if session.epoch == epoch && session.active_run == Some(mode) && session.state != ControlState::Running {
                session.active_run = None;
                self.publish(&mut session);
            }
        }
        result
    }

    async fn drive_run(&self, mode: RunMode, epoch: u64) -> Result<(), ControlError> {
        let mut link = self.connect().await?;
        let stale: Vec<Motor> = {
            let session = self.session.lock().await;
            if session.epoch != epoch || session.active_run != Some(mode) {
                return Ok(());
            }
            session
                .registry
                .motors()
                .filter(|motor| !motor.is_synchronized())
                .cloned()
                .collect()
        };

        if !stale.is_empty() {
            tracing::info!(motors = stale.len(), "Re-committing desynchronized motors before {} run", mode);
            self.sink.on_message("Re-committing motor parameters");
            let committed = commit_copies(link.as_mut(), &self.tags, stale, Some(self.stop.as_ref())).await;
            let mut session = self.session.lock().await;
            if session.epoch != epoch {
                return Ok(());
            }
            let failed = session.merge_commits(&committed);
            self.publish(&mut session);
            if !failed.is_empty() {
                return Err(ControlError::PartialWriteFailure { axes: failed });
            }
        }

        let telemetry_enabled = {
            let mut session = self.session.lock().await;
            if session.epoch != epoch || session.active_run != Some(mode) {
                return Ok(());
            }

            if self.stop.load(Ordering::SeqCst) {
                session.active_run = None;
                session.cancelled_run = Some(mode);
                self.publish(&mut session);
                self.sink.on_message(&format!("Cancelled {} run before start", mode));
                return Ok(());
            }

            if mode == RunMode::Curve && link.read_tag(&self.tags.run_curve()).await? != 0 {
                tracing::warn!("Curve is already running; ignored repeated activation");
                session.active_run = None;
                self.publish(&mut session);
                self.sink.on_message("Curve is already running");
                return Ok(());
            }

            link.write_required(&mode.run_tag(&self.tags), 1).await?;
            session.state = ControlState::Running;
            self.publish(&mut session);
            self.sink.on_message("Motor(s) Running");
            session.telemetry.enabled
        };

        match mode {
            RunMode::SingleStroke => {
                hold(self.config.timing.stroke_hold(), HOLD_STEP, &self.stop).await;
                self.finish_run(link.as_mut(), mode, epoch).await
            }
            RunMode::Continuous => {
                if telemetry_enabled {
                    self.record_telemetry(link.as_mut(), None).await?;
                }
                Ok(())
            }
            RunMode::Curve => {
                let curve_hold = self.config.timing.curve_hold();
                if telemetry_enabled {
                    self.record_telemetry(link.as_mut(), Some(curve_hold.as_secs_f64()))
                        .await?;
                } else {
                    hold(curve_hold, HOLD_STEP, &self.stop).await;
                }
                self.finish_run(link.as_mut(), mode, epoch).await
            }
        }
    }

    /// Drop the run tag and return to `Homed`, unless stop or reset got there first.
    async fn finish_run(&self, link: &mut dyn TagSession, mode: RunMode, epoch: u64) -> Result<(), ControlError> {
        let mut session = self.session.lock().await;
        if session.epoch != epoch || session.active_run != Some(mode) || session.state != ControlState::Running {
            return Ok(());
        }
        link.write_required(&mode.run_tag(&self.tags), 0).await?;
        session.state = ControlState::Homed;
        session.active_run = None;
        self.publish(&mut session);
        tracing::info!("Completed {} run", mode);
        self.sink.on_message("Motor(s) Stopped");
        Ok(())
    }

    async fn record_telemetry(&self, link: &mut dyn TagSession, duration: Option<f64>) -> Result<bool, ControlError> {
        let (telemetry, axes) = {
            let session = self.session.lock().await;
            (session.telemetry, session.live_axes())
        };
        let mut sampler = TelemetrySampler::new(&telemetry);
        if let Some(duration) = duration {
            sampler = sampler.with_duration(duration);
        }

        let (run, failure) = sampler
            .run(link, &self.tags, &axes, self.stop.clone(), self.sink.as_ref())
            .await;

        if let Some(store) = &self.store {
            if let Err(e) = store.save_run(&run).await {
                let _ = self.surface::<()>(Err(e.into()));
            }
        }
        self.sink.on_telemetry_complete();
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(run.completed),
        }
    }

    async fn stop(&self) -> Result<StopOutcome, ControlError> {
        let _guard = self.locks.try_acquire(Operation::Stop)?;
        // Raised before waiting on the session so a run that is still committing sees it.
        self.stop.store(true, Ordering::SeqCst);

        let mut session = self.session.lock().await;
        let active_run = session.active_run;
        match active_run {
            Some(mode) if session.state == ControlState::Running => {
                let mut link = self.connect().await?;
                link.write_required(&mode.run_tag(&self.tags), 0).await?;
                session.state = ControlState::Homed;
                session.active_run = None;
                self.publish(&mut session);
                tracing::info!("Stopped {} run", mode);
                self.sink.on_message("Motor(s) Stopped");
                Ok(StopOutcome::Stopped(mode))
            }
            Some(mode) => {
                tracing::info!("Cancelling pending {} run", mode);
                Ok(StopOutcome::Cancelled)
            }
            None if session.cancelled_run.take().is_some() => Ok(StopOutcome::Cancelled),
            None => {
                tracing::info!("Stop requested while not running");
                Ok(StopOutcome::AlreadyStopped)
            }
        }
    }

    async fn motor_off(&self) -> Result<(), ControlError> {
        let _guard = self.locks.try_acquire(Operation::PowerOff)?;
        self.stop.store(true, Ordering::SeqCst);
        self.halt.store(true, Ordering::SeqCst);

        let mut link = self.connect().await?;
        self.pulse(link.as_mut(), &self.tags.clear_error()).await?;
        for tag in self.tags.motion_tags() {
            link.write_required(&tag, 0).await?;
        }
        reset_live_axes(link.as_mut(), &self.tags).await?;
        drop(link);

        let mut session = self.session.lock().await;
        session.working.clear();
        session.registry.clear();
        session.homed_axes.clear();
        session.active_run = None;
        session.homing = false;
        if session.state == ControlState::Running {
            session.state = ControlState::Homed;
        }
        session.epoch += 1;
        self.publish(&mut session);
        tracing::info!("Motor(s) Turned Off and Motion Faults Cleared");
        self.sink.on_message("Motor(s) Turned Off and Motion Faults Cleared");
        Ok(())
    }
}
