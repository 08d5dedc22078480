//! Tag naming for the controller program.
//!
//! Every tag lives under one controller program and follows
//! `Program:<Program>.<Field>[.<Index>]`.

use crate::motion::motor::{AxisId, ParamName};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMap {
    program: String,
}

impl TagMap {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> String {
        format!("Program:{}", self.program)
    }

    fn field(&self, field: &str) -> String {
        format!("Program:{}.{}", self.program, field)
    }

    pub fn motor_boot(&self) -> String {
        self.field("Motor_Boot")
    }

    pub fn clear_error(&self) -> String {
        self.field("Clear_Motor_Error")
    }

    pub fn home_trigger(&self) -> String {
        self.field("Home_Button")
    }

    pub fn run_single(&self) -> String {
        self.field("Run_1")
    }

    pub fn run_continuous(&self) -> String {
        self.field("Run_2")
    }

    pub fn run_curve(&self) -> String {
        self.field("Run_Curve")
    }

    pub fn live_enable(&self, axis: AxisId) -> String {
        format!("Program:{}.Live_Motors.{}", self.program, axis)
    }

    pub fn param(&self, axis: AxisId, param: ParamName) -> String {
        format!("Program:{}.{}.{}", self.program, param.tag_field(), axis)
    }

    pub fn demand_position(&self, axis: AxisId) -> String {
        format!("Program:{}.Axis[{}].ComDemandPosition", self.program, axis)
    }

    pub fn actual_position(&self, axis: AxisId) -> String {
        format!("Program:{}.Axis[{}].ComActualPosition", self.program, axis)
    }

    pub fn status_word(&self, axis: AxisId) -> String {
        format!("Program:{}.Axis[{}].StatusWord", self.program, axis)
    }

    /// Motion and trigger tags that must all read false when the machine is idle.
    pub fn motion_tags(&self) -> [String; 5] {
        [
            self.run_single(),
            self.run_continuous(),
            self.run_curve(),
            self.home_trigger(),
            self.clear_error(),
        ]
    }
}

impl Default for TagMap {
    fn default() -> Self {
        Self::new("Wave_Control")
    }
}
