// Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use wave_control::config::{Config, TimingConfig};
use wave_control::hardware::tags::TagMap;
use wave_control::hardware::{ChannelError, DeviceChannel, Provenance, TagSession, TagValue};
use wave_control::motion::{AxisId, ControlState, MotionController};
use wave_control::notify::{ChannelSink, Notification};
use wave_control::storage::{RunSummary, StoreError, TelemetryStore};
use wave_control::telemetry::TelemetryRun;

pub const HOME_BIT: u8 = 11;

/// Which axes report homed during one homing pass, and from which poll on.
#[derive(Debug, Clone)]
pub struct PassScript {
    pub axes: Vec<u8>,
    pub from_poll: u32,
}

impl PassScript {
    pub fn homes(axes: &[u8]) -> Self {
        Self {
            axes: axes.to_vec(),
            from_poll: 1,
        }
    }

    pub fn homes_at(axes: &[u8], from_poll: u32) -> Self {
        Self {
            axes: axes.to_vec(),
            from_poll,
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    tags: HashMap<String, TagValue>,
    writes: Vec<(String, TagValue)>,
    rejected: HashSet<String>,
    broken_writes: HashSet<String>,
    /// Tag -> successful reads left before reads of it fail in transport.
    broken_reads: HashMap<String, u32>,
    write_delay: Duration,
    /// Empty means every axis homes on the first poll of every pass.
    passes: Vec<PassScript>,
    arms: usize,
    polls: u32,
    connect_fails: bool,
}

/// Device channel whose homing behaviour and failures are scripted by the test.
#[derive(Debug, Clone)]
pub struct ScriptedChannel {
    tags: TagMap,
    script: Arc<Mutex<Script>>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self {
            tags: TagMap::default(),
            script: Arc::new(Mutex::new(Script::default())),
        }
    }

    pub fn with_passes(self, passes: Vec<PassScript>) -> Self {
        self.script.lock().unwrap().passes = passes;
        self
    }

    /// Writes to `tag` are refused by the controller.
    pub fn reject(&self, tag: String) {
        self.script.lock().unwrap().rejected.insert(tag);
    }

    /// Writes to `tag` fail in transport.
    pub fn break_writes(&self, tag: String) {
        self.script.lock().unwrap().broken_writes.insert(tag);
    }

    /// Reads of `tag` succeed `after` more times, then fail in transport.
    pub fn break_reads(&self, tag: String, after: u32) {
        self.script.lock().unwrap().broken_reads.insert(tag, after);
    }

    /// Every write takes `delay` before the controller answers.
    pub fn with_write_delay(self, delay: Duration) -> Self {
        self.script.lock().unwrap().write_delay = delay;
        self
    }

    pub fn fail_connect(&self, fail: bool) {
        self.script.lock().unwrap().connect_fails = fail;
    }

    pub fn set_tag(&self, tag: &str, value: TagValue) {
        self.script.lock().unwrap().tags.insert(tag.to_string(), value);
    }

    pub fn tag(&self, tag: &str) -> TagValue {
        self.script.lock().unwrap().tags.get(tag).copied().unwrap_or(0)
    }

    pub fn writes(&self) -> Vec<(String, TagValue)> {
        self.script.lock().unwrap().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.script.lock().unwrap().writes.len()
    }

    /// Position of the first write of `value` to `tag`.
    pub fn first_write(&self, tag: &str, value: TagValue) -> Option<usize> {
        self.writes().iter().position(|(t, v)| t == tag && *v == value)
    }

    pub fn last_write(&self, tag: &str) -> Option<(usize, TagValue)> {
        self.writes()
            .iter()
            .enumerate()
            .filter(|(_, (t, _))| t == tag)
            .map(|(i, (_, v))| (i, *v))
            .last()
    }

    pub fn tags(&self) -> &TagMap {
        &self.tags
    }
}

#[async_trait]
impl DeviceChannel for ScriptedChannel {
    async fn connect(&self) -> Result<Box<dyn TagSession>, ChannelError> {
        if self.script.lock().unwrap().connect_fails {
            return Err(ChannelError::Connect {
                address: "scripted".to_string(),
                reason: "unplugged".to_string(),
            });
        }
        Ok(Box::new(ScriptedSession {
            tags: self.tags.clone(),
            script: self.script.clone(),
        }))
    }

    fn provenance(&self) -> Provenance {
        Provenance::Simulated
    }
}

struct ScriptedSession {
    tags: TagMap,
    script: Arc<Mutex<Script>>,
}

impl ScriptedSession {
    fn homed(&self, script: &Script, axis: AxisId) -> bool {
        if script.arms == 0 {
            return false;
        }
        if script.passes.is_empty() {
            return true;
        }
        let pass = &script.passes[(script.arms - 1).min(script.passes.len() - 1)];
        pass.axes.contains(&axis.index()) && script.polls >= pass.from_poll
    }
}

#[async_trait]
impl TagSession for ScriptedSession {
    async fn read_tag(&mut self, tag: &str) -> Result<TagValue, ChannelError> {
        let mut script = self.script.lock().unwrap();
        if let Some(left) = script.broken_reads.get_mut(tag) {
            if *left == 0 {
                return Err(ChannelError::Protocol(format!("link dropped reading {}", tag)));
            }
            *left -= 1;
        }
        for axis in AxisId::all() {
            if tag == self.tags.status_word(axis) {
                return Ok(if self.homed(&script, axis) { 1 << HOME_BIT } else { 0 });
            }
        }
        Ok(script.tags.get(tag).copied().unwrap_or(0))
    }

    async fn write_tag(&mut self, tag: &str, value: TagValue) -> Result<bool, ChannelError> {
        let delay = self.script.lock().unwrap().write_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.script.lock().unwrap();
        if script.broken_writes.contains(tag) {
            return Err(ChannelError::Protocol(format!("link dropped writing {}", tag)));
        }
        if script.rejected.contains(tag) {
            return Ok(false);
        }
        if tag == self.tags.home_trigger() && value != 0 {
            script.arms += 1;
            script.polls = 0;
        }
        script.tags.insert(tag.to_string(), value);
        script.writes.push((tag.to_string(), value));
        Ok(true)
    }

    async fn keep_alive(&mut self) -> Result<(), ChannelError> {
        self.script.lock().unwrap().polls += 1;
        Ok(())
    }
}

/// Telemetry store that keeps runs in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    runs: Mutex<Vec<TelemetryRun>>,
}

impl MemoryStore {
    pub fn runs(&self) -> Vec<TelemetryRun> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn save_run(&self, run: &TelemetryRun) -> Result<(), StoreError> {
        self.runs.lock().unwrap().push(run.clone());
        Ok(())
    }

    async fn load_run(&self, id: Uuid) -> Result<TelemetryRun, StoreError> {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .find(|run| run.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list_runs(&self) -> Result<Vec<RunSummary>, StoreError> {
        Ok(self.runs.lock().unwrap().iter().map(RunSummary::from).collect())
    }
}

pub fn create_test_config() -> Config {
    Config {
        timing: TimingConfig::uniform(1),
        ..Config::default()
    }
}

pub fn axes(ids: &[u8]) -> Vec<AxisId> {
    ids.iter().map(|id| AxisId::new(*id).unwrap()).collect()
}

pub struct Harness {
    pub controller: MotionController,
    pub channel: ScriptedChannel,
    pub store: Arc<MemoryStore>,
    pub rx: UnboundedReceiver<Notification>,
}

impl Harness {
    pub fn new(channel: ScriptedChannel) -> Self {
        Self::with_config(channel, create_test_config())
    }

    pub fn with_config(channel: ScriptedChannel, config: Config) -> Self {
        let (sink, rx) = ChannelSink::new();
        let store = Arc::new(MemoryStore::default());
        let controller = MotionController::new(
            config,
            Arc::new(channel.clone()),
            Arc::new(sink),
            Some(store.clone() as Arc<dyn TelemetryStore>),
        );
        Self {
            controller,
            channel,
            store,
            rx,
        }
    }

    /// Activate `ids` as one confirmed set.
    pub async fn confirmed(&self, ids: &[u8]) {
        self.controller.activate_axes(&axes(ids)).await.unwrap();
        self.controller.confirm_set().await.unwrap();
    }

    /// Confirm `ids` as one set, prepare and wait for homing.
    pub async fn homed(&self, ids: &[u8]) {
        self.confirmed(ids).await;
        let homing = self.controller.prepare().await.unwrap();
        homing.await.unwrap().unwrap();
        assert_eq!(self.controller.status().await.state, ControlState::Homed);
    }

    pub fn notifications(&mut self) -> Vec<Notification> {
        wave_control::notify::drain(&mut self.rx)
    }

    pub fn messages(&mut self) -> Vec<String> {
        self.notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Message(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Wait until the controller reports `state`, giving up after a second.
    pub async fn wait_for(&self, state: ControlState) {
        for _ in 0..1000 {
            if self.controller.status().await.state == state {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        panic!("controller never reached {:?}", state);
    }
}
