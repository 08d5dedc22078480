// src/motion/mod.rs - Motors, motor sets and the control state machine
pub mod controller;
pub mod homing;
pub mod motor;
pub mod poll;
pub mod registry;

pub use controller::{ControlError, ControlState, ControllerStatus, MotionController, Operation, RunMode, StopOutcome};
pub use motor::{AxisId, CommitReport, Motor, ParamMap, ParamName, ValidationError};
pub use registry::{MotorSet, MotorSetRegistry};
