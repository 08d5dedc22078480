// src/motion/registry.rs - Confirmed motor sets
use std::collections::BTreeMap;
use std::fmt;

use super::motor::{AxisId, Motor};

/// Confirmed group of motors. Membership is fixed at confirmation; values stay editable.
#[derive(Debug, Clone, PartialEq)]
pub struct MotorSet {
    motors: BTreeMap<AxisId, Motor>,
}

impl MotorSet {
    fn new(motors: BTreeMap<AxisId, Motor>) -> Self {
        Self { motors }
    }

    pub fn axes(&self) -> Vec<AxisId> {
        self.motors.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.motors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.motors.is_empty()
    }

    pub fn contains(&self, axis: AxisId) -> bool {
        self.motors.contains_key(&axis)
    }

    pub fn get(&self, axis: AxisId) -> Option<&Motor> {
        self.motors.get(&axis)
    }

    pub fn get_mut(&mut self, axis: AxisId) -> Option<&mut Motor> {
        self.motors.get_mut(&axis)
    }

    pub fn motors(&self) -> impl Iterator<Item = &Motor> {
        self.motors.values()
    }

    pub fn motors_mut(&mut self) -> impl Iterator<Item = &mut Motor> {
        self.motors.values_mut()
    }

    pub fn is_synchronized(&self) -> bool {
        self.motors().all(Motor::is_synchronized)
    }

    pub fn is_ready(&self) -> bool {
        self.motors().all(|motor| motor.is_valid() && motor.is_synchronized())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MotorSetRegistry {
    sets: Vec<MotorSet>,
}

impl MotorSetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep-copy `mapping` into a new set and return its index.
    pub fn confirm(&mut self, mapping: &BTreeMap<AxisId, Motor>) -> usize {
        self.sets.push(MotorSet::new(mapping.clone()));
        let index = self.sets.len() - 1;
        tracing::info!(set = index, axes = ?self.sets[index].axes(), "Motor set confirmed");
        index
    }

    pub fn clear(&mut self) {
        self.sets.clear();
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MotorSet> {
        self.sets.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut MotorSet> {
        self.sets.get_mut(index)
    }

    pub fn sets(&self) -> &[MotorSet] {
        &self.sets
    }

    pub fn sets_mut(&mut self) -> impl Iterator<Item = &mut MotorSet> {
        self.sets.iter_mut()
    }

    pub fn motors(&self) -> impl Iterator<Item = &Motor> {
        self.sets.iter().flat_map(MotorSet::motors)
    }

    pub fn motor_mut(&mut self, axis: AxisId) -> Option<&mut Motor> {
        self.sets.iter_mut().find_map(|set| set.get_mut(axis))
    }

    /// Index of the set an axis was confirmed into.
    pub fn set_of(&self, axis: AxisId) -> Option<usize> {
        self.sets.iter().position(|set| set.contains(axis))
    }

    pub fn contains(&self, axis: AxisId) -> bool {
        self.set_of(axis).is_some()
    }

    pub fn axes(&self) -> Vec<AxisId> {
        let mut axes: Vec<AxisId> = self.sets.iter().flat_map(MotorSet::axes).collect();
        axes.sort();
        axes
    }

    pub fn total_axes(&self) -> usize {
        self.sets.iter().map(MotorSet::len).sum()
    }

    pub fn is_synchronized(&self) -> bool {
        self.sets.iter().all(MotorSet::is_synchronized)
    }

    pub fn is_ready(&self) -> bool {
        self.sets.iter().all(MotorSet::is_ready)
    }

    /// Confirmed axes on grid row `row`.
    pub fn row(&self, row: u8) -> Vec<AxisId> {
        self.axes().into_iter().filter(|axis| axis.row() == row).collect()
    }

    /// Confirmed axes grouped by grid row; empty rows are omitted.
    pub fn rows(&self) -> BTreeMap<u8, Vec<AxisId>> {
        group_by(self.axes(), AxisId::row)
    }

    pub fn column(&self, column: u8) -> Vec<AxisId> {
        self.axes().into_iter().filter(|axis| axis.column() == column).collect()
    }

    pub fn columns(&self) -> BTreeMap<u8, Vec<AxisId>> {
        group_by(self.axes(), AxisId::column)
    }

    /// One line per set: `Set 1: Motors [0, 1, 2]`.
    pub fn summary(&self) -> Vec<String> {
        self.sets
            .iter()
            .enumerate()
            .map(|(index, set)| {
                let axes: Vec<String> = set.axes().iter().map(ToString::to_string).collect();
                format!("Set {}: Motors [{}]", index + 1, axes.join(", "))
            })
            .collect()
    }
}

fn group_by(axes: Vec<AxisId>, key: fn(AxisId) -> u8) -> BTreeMap<u8, Vec<AxisId>> {
    let mut groups: BTreeMap<u8, Vec<AxisId>> = BTreeMap::new();
    for axis in axes {
        groups.entry(key(axis)).or_default().push(axis);
    }
    groups
}

impl fmt::Display for MotorSetRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sets.is_empty() {
            return write!(f, "No motor sets");
        }
        write!(f, "{}", self.summary().join("\n"))
    }
}
