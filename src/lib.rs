// src/lib.rs - Wave tank motion control core
pub mod config;
pub mod hardware;
pub mod motion;
pub mod notify;
pub mod storage;
pub mod telemetry;

pub use config::{Config, load_config};
pub use hardware::{DeviceChannel, Provenance, TagSession, select_channel};
pub use motion::{ControlError, ControlState, MotionController, RunMode};
