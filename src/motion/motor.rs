// src/motion/motor.rs - One axis: target parameters, confirmed parameters, validity
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use thiserror::Error;

use crate::hardware::tags::TagMap;
use crate::hardware::{TagSession, TagValue};

/// Number of axis slots on the controller.
pub const AXIS_COUNT: u8 = 30;
/// Axes are laid out column-major on a grid with this many rows.
pub const GRID_ROWS: u8 = 3;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Unknown parameter '{0}'")]
    UnknownParameter(String),
    #[error("{param} = {value} is outside [{min}, {max}]")]
    OutOfBounds {
        param: ParamName,
        value: TagValue,
        min: TagValue,
        max: TagValue,
    },
    #[error("Axis {0} is outside 0..{max}", max = AXIS_COUNT)]
    AxisOutOfRange(u8),
    #[error("Invalid telemetry settings: {0}")]
    Telemetry(String),
}

/// Controller axis slot, 0 through 29.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct AxisId(u8);

impl AxisId {
    pub fn new(id: u8) -> Result<Self, ValidationError> {
        if id < AXIS_COUNT {
            Ok(Self(id))
        } else {
            Err(ValidationError::AxisOutOfRange(id))
        }
    }

    pub fn all() -> impl Iterator<Item = AxisId> {
        (0..AXIS_COUNT).map(AxisId)
    }

    pub fn index(self) -> u8 {
        self.0
    }

    pub fn row(self) -> u8 {
        self.0 % GRID_ROWS
    }

    pub fn column(self) -> u8 {
        self.0 / GRID_ROWS
    }
}

impl TryFrom<u8> for AxisId {
    type Error = ValidationError;
    fn try_from(id: u8) -> Result<Self, Self::Error> {
        AxisId::new(id)
    }
}

impl From<AxisId> for u8 {
    fn from(axis: AxisId) -> u8 {
        axis.0
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The 18 canonical motor parameters, in controller order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ParamName {
    #[serde(rename = "Position 1")]
    Position1,
    #[serde(rename = "Position 2")]
    Position2,
    #[serde(rename = "Speed 1")]
    Speed1,
    #[serde(rename = "Speed 2")]
    Speed2,
    #[serde(rename = "Accel 1")]
    Accel1,
    #[serde(rename = "Accel 2")]
    Accel2,
    #[serde(rename = "Decel 1")]
    Decel1,
    #[serde(rename = "Decel 2")]
    Decel2,
    #[serde(rename = "Jerk 1")]
    Jerk1,
    #[serde(rename = "Jerk 2")]
    Jerk2,
    #[serde(rename = "Time 1")]
    Time1,
    #[serde(rename = "Time 2")]
    Time2,
    #[serde(rename = "Profile")]
    Profile,
    #[serde(rename = "Move Type")]
    MoveType,
    #[serde(rename = "Curve ID")]
    CurveId,
    #[serde(rename = "Time Scale")]
    TimeScale,
    #[serde(rename = "Amplitude Scale")]
    AmplitudeScale,
    #[serde(rename = "Curve Offset")]
    CurveOffset,
}

const POSITION_BOUNDS: RangeInclusive<TagValue> = -20..=370;
const SPEED_BOUNDS: RangeInclusive<TagValue> = 0..=900;
const RAMP_BOUNDS: RangeInclusive<TagValue> = 0..=50_000;
const PROFILE_BOUNDS: RangeInclusive<TagValue> = 0..=3;
const MOVE_TYPE_BOUNDS: RangeInclusive<TagValue> = 0..=1;
const NON_NEGATIVE: RangeInclusive<TagValue> = 0..=i32::MAX as TagValue;
const SIGNED: RangeInclusive<TagValue> = i32::MIN as TagValue..=i32::MAX as TagValue;

impl ParamName {
    pub const ALL: [ParamName; 18] = [
        ParamName::Position1,
        ParamName::Position2,
        ParamName::Speed1,
        ParamName::Speed2,
        ParamName::Accel1,
        ParamName::Accel2,
        ParamName::Decel1,
        ParamName::Decel2,
        ParamName::Jerk1,
        ParamName::Jerk2,
        ParamName::Time1,
        ParamName::Time2,
        ParamName::Profile,
        ParamName::MoveType,
        ParamName::CurveId,
        ParamName::TimeScale,
        ParamName::AmplitudeScale,
        ParamName::CurveOffset,
    ];

    /// Operator-facing name.
    pub fn label(self) -> &'static str {
        match self {
            ParamName::Position1 => "Position 1",
            ParamName::Position2 => "Position 2",
            ParamName::Speed1 => "Speed 1",
            ParamName::Speed2 => "Speed 2",
            ParamName::Accel1 => "Accel 1",
            ParamName::Accel2 => "Accel 2",
            ParamName::Decel1 => "Decel 1",
            ParamName::Decel2 => "Decel 2",
            ParamName::Jerk1 => "Jerk 1",
            ParamName::Jerk2 => "Jerk 2",
            ParamName::Time1 => "Time 1",
            ParamName::Time2 => "Time 2",
            ParamName::Profile => "Profile",
            ParamName::MoveType => "Move Type",
            ParamName::CurveId => "Curve ID",
            ParamName::TimeScale => "Time Scale",
            ParamName::AmplitudeScale => "Amplitude Scale",
            ParamName::CurveOffset => "Curve Offset",
        }
    }

    /// Field name in the controller program (`Speed 1` -> `Speed_1`).
    pub fn tag_field(self) -> String {
        self.label().replace(' ', "_")
    }

    pub fn bounds(self) -> RangeInclusive<TagValue> {
        match self {
            ParamName::Position1 | ParamName::Position2 => POSITION_BOUNDS,
            ParamName::Speed1 | ParamName::Speed2 => SPEED_BOUNDS,
            ParamName::Accel1 | ParamName::Accel2 | ParamName::Decel1 | ParamName::Decel2 => RAMP_BOUNDS,
            ParamName::Profile => PROFILE_BOUNDS,
            ParamName::MoveType => MOVE_TYPE_BOUNDS,
            ParamName::CurveOffset => SIGNED,
            _ => NON_NEGATIVE,
        }
    }

    pub fn default_value(self) -> TagValue {
        match self {
            ParamName::Position1 => 0,
            ParamName::Position2 => 100,
            ParamName::Speed1 | ParamName::Speed2 => 500,
            ParamName::Accel1 | ParamName::Accel2 | ParamName::Decel1 | ParamName::Decel2 => 10_000,
            ParamName::Jerk1 | ParamName::Jerk2 => 100_000,
            ParamName::TimeScale | ParamName::AmplitudeScale => 100,
            _ => 0,
        }
    }

    pub fn tip(self) -> &'static str {
        match self {
            ParamName::Position1 | ParamName::Position2 => {
                "Position limits after homing are 370mm and -20mm"
            }
            ParamName::Speed1 | ParamName::Speed2 => {
                "Velocity limits are 0 and approx. 900 mm/s, dependent on current usage"
            }
            ParamName::Accel1 | ParamName::Accel2 | ParamName::Decel1 | ParamName::Decel2 => {
                "Acceleration and deceleration are limited at 50,000 mm/s^2"
            }
            ParamName::Jerk1 | ParamName::Jerk2 => {
                "Jerk should generally be larger than acceleration and deceleration (mm/s^3)"
            }
            ParamName::Time1 | ParamName::Time2 => "Default to 0",
            ParamName::Profile => "Trapezoidal(0), Bestehorn(1), S-Curve(2), Sin(3)",
            ParamName::MoveType => {
                "Absolute(0): based on defined axis. Incremental(1): moves by the position argument"
            }
            ParamName::CurveId | ParamName::TimeScale | ParamName::AmplitudeScale | ParamName::CurveOffset => {
                "Used for curves"
            }
        }
    }

    pub fn validate(self, value: TagValue) -> Result<(), ValidationError> {
        let bounds = self.bounds();
        if bounds.contains(&value) {
            Ok(())
        } else {
            Err(ValidationError::OutOfBounds {
                param: self,
                value,
                min: *bounds.start(),
                max: *bounds.end(),
            })
        }
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ParamName {
    type Err = ValidationError;

    /// Accepts the operator label (`Speed 1`) or the tag field (`Speed_1`), any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('_', " ");
        ParamName::ALL
            .iter()
            .copied()
            .find(|param| param.label().eq_ignore_ascii_case(&wanted))
            .ok_or_else(|| ValidationError::UnknownParameter(s.to_string()))
    }
}

pub type ParamMap = BTreeMap<ParamName, TagValue>;

/// Status-word mask for `home_bit`; zero for bits past the word.
pub fn home_mask(home_bit: u8) -> TagValue {
    (1 as TagValue).checked_shl(u32::from(home_bit)).unwrap_or(0)
}

/// Per-key outcome of one commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReport {
    pub results: BTreeMap<ParamName, bool>,
}

impl CommitReport {
    pub fn is_complete(&self) -> bool {
        self.results.values().all(|ok| *ok)
    }

    pub fn failed(&self) -> Vec<ParamName> {
        self.results
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(param, _)| *param)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Motor {
    axis: AxisId,
    write_params: ParamMap,
    current_params: ParamMap,
}

impl Motor {
    /// New motor with default targets and nothing confirmed on the device.
    pub fn new(axis: AxisId) -> Self {
        let write_params = ParamName::ALL
            .iter()
            .map(|param| (*param, param.default_value()))
            .collect();
        Self {
            axis,
            write_params,
            current_params: ParamMap::new(),
        }
    }

    pub fn axis(&self) -> AxisId {
        self.axis
    }

    pub fn write_params(&self) -> &ParamMap {
        &self.write_params
    }

    pub fn current_params(&self) -> &ParamMap {
        &self.current_params
    }

    pub fn set_parameter(&mut self, param: ParamName, value: TagValue) -> Result<(), ValidationError> {
        param.validate(value)?;
        self.write_params.insert(param, value);
        Ok(())
    }

    /// String-keyed variant for operator input.
    pub fn set_parameter_named(&mut self, name: &str, value: TagValue) -> Result<(), ValidationError> {
        self.set_parameter(name.parse()?, value)
    }

    /// Overwrite several targets at once. Nothing changes unless every entry is valid.
    pub fn apply_params(&mut self, params: &ParamMap) -> Result<(), ValidationError> {
        for (param, value) in params {
            param.validate(*value)?;
        }
        self.write_params
            .extend(params.iter().map(|(param, value)| (*param, *value)));
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        ParamName::ALL.iter().all(|param| {
            self.write_params
                .get(param)
                .is_some_and(|value| param.bounds().contains(value))
        })
    }

    pub fn is_synchronized(&self) -> bool {
        ParamName::ALL
            .iter()
            .all(|param| match (self.write_params.get(param), self.current_params.get(param)) {
                (Some(target), Some(confirmed)) => target == confirmed,
                (None, None) => true,
                _ => false,
            })
    }

    /// Write every target to the device. Keys that were accepted become current;
    /// failed keys keep their previous confirmed value. After a transport error the
    /// remaining keys are reported failed without being sent.
    pub async fn commit(&mut self, session: &mut dyn TagSession, tags: &TagMap) -> CommitReport {
        let mut report = CommitReport::default();
        let mut link_failed = false;
        for (param, value) in &self.write_params {
            if link_failed {
                report.results.insert(*param, false);
                continue;
            }
            let tag = tags.param(self.axis, *param);
            let ok = match session.write_tag(&tag, *value).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(axis = %self.axis, "Write of {} failed: {}", param, e);
                    link_failed = true;
                    false
                }
            };
            if ok {
                self.current_params.insert(*param, *value);
            }
            report.results.insert(*param, ok);
        }

        if report.is_complete() {
            tracing::debug!(axis = %self.axis, "Committed {} parameters", report.results.len());
        } else {
            tracing::warn!(axis = %self.axis, failed = ?report.failed(), "Partial commit");
        }
        report
    }

    /// Take the confirmed values of a commit that ran on a copy of this motor.
    pub fn merge_commit(&mut self, committed: &Motor, report: &CommitReport) {
        for (param, ok) in &report.results {
            if let (true, Some(value)) = (*ok, committed.write_params.get(param)) {
                self.current_params.insert(*param, *value);
            }
        }
    }

    pub async fn poll_homed(&self, session: &mut dyn TagSession, tags: &TagMap, home_bit: u8) -> Result<bool, crate::hardware::ChannelError> {
        let word = session.read_tag(&tags.status_word(self.axis)).await?;
        Ok(word & home_mask(home_bit) != 0)
    }

    /// Compact `label=value` summary of the targets, in controller order.
    pub fn describe_targets(&self) -> String {
        self.write_params
            .iter()
            .map(|(param, value)| format!("{}={}", param, value))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::DeviceChannel;
    use crate::hardware::simulated::SimulatedChannel;

    fn axis(id: u8) -> AxisId {
        AxisId::new(id).unwrap()
    }

    #[test]
    fn new_motor_is_valid_but_unsynchronized() {
        let motor = Motor::new(axis(0));
        assert!(motor.is_valid());
        assert!(!motor.is_synchronized());
        assert!(motor.current_params().is_empty());
        assert_eq!(motor.write_params().len(), 18);
    }

    #[test]
    fn bounds_are_enforced_locally() {
        let mut motor = Motor::new(axis(1));
        assert!(motor.set_parameter(ParamName::Position1, -20).is_ok());
        assert!(motor.set_parameter(ParamName::Position2, 370).is_ok());
        assert!(matches!(
            motor.set_parameter(ParamName::Position1, 371),
            Err(ValidationError::OutOfBounds { .. })
        ));
        assert!(motor.set_parameter(ParamName::Speed1, 901).is_err());
        assert!(motor.set_parameter(ParamName::Accel2, 50_001).is_err());
        assert!(motor.set_parameter(ParamName::Profile, 4).is_err());
        assert!(motor.set_parameter(ParamName::MoveType, 2).is_err());
        assert_eq!(motor.write_params()[&ParamName::Position1], -20);
    }

    #[test]
    fn unknown_names_are_rejected() {
        let mut motor = Motor::new(axis(2));
        assert_eq!(
            motor.set_parameter_named("Warp Factor", 1),
            Err(ValidationError::UnknownParameter("Warp Factor".to_string()))
        );
        motor.set_parameter_named("speed_2", 640).unwrap();
        assert_eq!(motor.write_params()[&ParamName::Speed2], 640);
    }

    #[test]
    fn apply_params_is_all_or_nothing() {
        let mut motor = Motor::new(axis(3));
        let params: ParamMap = [(ParamName::Speed1, 300), (ParamName::Profile, 9)].into_iter().collect();
        assert!(motor.apply_params(&params).is_err());
        assert_eq!(motor.write_params()[&ParamName::Speed1], 500);
    }

    #[test]
    fn merge_keeps_only_accepted_keys() {
        let mut live = Motor::new(axis(6));
        let mut copy = live.clone();
        copy.set_parameter(ParamName::Speed1, 610).unwrap();
        let report = CommitReport {
            results: [(ParamName::Speed1, true), (ParamName::Speed2, false)].into_iter().collect(),
        };

        live.merge_commit(&copy, &report);

        assert_eq!(live.current_params()[&ParamName::Speed1], 610);
        assert!(!live.current_params().contains_key(&ParamName::Speed2));
        assert_eq!(live.write_params()[&ParamName::Speed1], 500);
    }

    #[test]
    fn home_mask_never_overflows() {
        assert_eq!(home_mask(11), 1 << 11);
        assert_eq!(home_mask(63), TagValue::MIN);
        assert_eq!(home_mask(64), 0);
        assert_eq!(home_mask(255), 0);
    }

    #[test]
    fn axis_grid_position() {
        assert_eq!((axis(0).row(), axis(0).column()), (0, 0));
        assert_eq!((axis(4).row(), axis(4).column()), (1, 1));
        assert_eq!((axis(29).row(), axis(29).column()), (2, 9));
        assert!(AxisId::new(30).is_err());
    }

    #[tokio::test]
    async fn commit_then_edit_round_trip() {
        let tags = TagMap::default();
        let channel = SimulatedChannel::new(tags.clone(), 11);
        let mut session = channel.connect().await.unwrap();

        let mut motor = Motor::new(axis(5));
        motor.set_parameter(ParamName::Speed1, 700).unwrap();
        let report = motor.commit(session.as_mut(), &tags).await;

        assert!(report.is_complete());
        assert!(motor.is_synchronized());
        assert_eq!(motor.current_params()[&ParamName::Speed1], 700);
        assert_eq!(channel.tag(&tags.param(axis(5), ParamName::Speed1)), 700);

        motor.set_parameter(ParamName::Accel1, 15_000).unwrap();
        assert!(!motor.is_synchronized());
    }
}
