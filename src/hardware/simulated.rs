// src/hardware/simulated.rs - In-memory controller used when the real one is unreachable
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::tags::TagMap;
use super::{ChannelError, DeviceChannel, Provenance, TagSession, TagValue};
use crate::motion::motor::{AxisId, ParamName, home_mask};

/// Tag table shared by every session of one simulated controller.
#[derive(Debug, Default)]
struct SimState {
    tags: HashMap<String, TagValue>,
    writes: Vec<(String, TagValue)>,
}

/// Synthesizes success for every call and mimics just enough controller logic for the
/// state machine: arming the home trigger homes every live axis, and position reads
/// follow the configured targets.
#[derive(Debug, Clone)]
pub struct SimulatedChannel {
    tags: TagMap,
    home_bit: u8,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedChannel {
    pub fn new(tags: TagMap, home_bit: u8) -> Self {
        Self {
            tags,
            home_bit,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Every write accepted so far, in order.
    pub fn write_log(&self) -> Vec<(String, TagValue)> {
        lock(&self.state).writes.clone()
    }

    /// Current value of a tag; unwritten tags read as zero.
    pub fn tag(&self, tag: &str) -> TagValue {
        lock(&self.state).tags.get(tag).copied().unwrap_or(0)
    }

    pub fn set_tag(&self, tag: &str, value: TagValue) {
        lock(&self.state).tags.insert(tag.to_string(), value);
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    // Every mutation is a single insert, so a poisoned table is still consistent.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl DeviceChannel for SimulatedChannel {
    async fn connect(&self) -> Result<Box<dyn TagSession>, ChannelError> {
        Ok(Box::new(SimulatedSession {
            tags: self.tags.clone(),
            home_bit: self.home_bit,
            state: self.state.clone(),
        }))
    }

    fn provenance(&self) -> Provenance {
        Provenance::Simulated
    }
}

pub struct SimulatedSession {
    tags: TagMap,
    home_bit: u8,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedSession {
    fn live_axes(&self, state: &SimState) -> Vec<AxisId> {
        AxisId::all()
            .filter(|axis| state.tags.get(&self.tags.live_enable(*axis)).copied().unwrap_or(0) != 0)
            .collect()
    }

    fn on_write(&self, state: &mut SimState, tag: &str, value: TagValue) {
        if tag == self.tags.home_trigger() && value != 0 {
            let mask = home_mask(self.home_bit);
            for axis in self.live_axes(state) {
                *state.tags.entry(self.tags.status_word(axis)).or_insert(0) |= mask;
            }
        }
    }

    fn target_position(&self, state: &SimState, axis: AxisId) -> TagValue {
        let running = [self.tags.run_continuous(), self.tags.run_curve(), self.tags.run_single()]
            .iter()
            .any(|tag| state.tags.get(tag).copied().unwrap_or(0) != 0);
        let param = if running { ParamName::Position2 } else { ParamName::Position1 };
        state
            .tags
            .get(&self.tags.param(axis, param))
            .copied()
            .unwrap_or_else(|| param.default_value())
    }
}

#[async_trait]
impl TagSession for SimulatedSession {
    async fn read_tag(&mut self, tag: &str) -> Result<TagValue, ChannelError> {
        let state = lock(&self.state);
        for axis in AxisId::all() {
            if tag == self.tags.demand_position(axis) {
                return Ok(self.target_position(&state, axis));
            }
            if tag == self.tags.actual_position(axis) {
                let lag = rand::rng().random_range(-2..=2);
                return Ok(self.target_position(&state, axis) + lag);
            }
        }
        Ok(state.tags.get(tag).copied().unwrap_or(0))
    }

    async fn write_tag(&mut self, tag: &str, value: TagValue) -> Result<bool, ChannelError> {
        let mut state = lock(&self.state);
        state.tags.insert(tag.to_string(), value);
        state.writes.push((tag.to_string(), value));
        self.on_write(&mut state, tag, value);
        Ok(true)
    }

    async fn keep_alive(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn arming_home_trigger_homes_live_axes() {
        let tags = TagMap::default();
        let channel = SimulatedChannel::new(tags.clone(), 11);
        let mut session = channel.connect().await.unwrap();
        let live = AxisId::new(3).unwrap();
        let idle = AxisId::new(4).unwrap();

        session.write_required(&tags.live_enable(live), 1).await.unwrap();
        session.write_required(&tags.home_trigger(), 1).await.unwrap();

        let word = session.read_tag(&tags.status_word(live)).await.unwrap();
        assert_ne!(word & (1 << 11), 0);
        assert_eq!(session.read_tag(&tags.status_word(idle)).await.unwrap(), 0);
        assert_eq!(channel.write_log().len(), 2);
    }

    #[tokio::test]
    async fn actual_position_tracks_demand() {
        let tags = TagMap::default();
        let channel = SimulatedChannel::new(tags.clone(), 11);
        let mut session = channel.connect().await.unwrap();
        let axis = AxisId::new(0).unwrap();
        session.write_required(&tags.param(axis, ParamName::Position1), 40).await.unwrap();

        let demand = session.read_tag(&tags.demand_position(axis)).await.unwrap();
        let actual = session.read_tag(&tags.actual_position(axis)).await.unwrap();
        assert_eq!(demand, 40);
        assert!((actual - demand).abs() <= 2);
    }
}
