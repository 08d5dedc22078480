// src/telemetry.rs - Position sampling during continuous and curve runs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use uuid::Uuid;

use crate::hardware::tags::TagMap;
use crate::hardware::{ChannelError, TagSession, TagValue};
use crate::motion::motor::{AxisId, ValidationError};
use crate::motion::poll::{PollSchedule, Poller};
use crate::notify::NotificationSink;

/// Hard cap on ticks per run, whatever the interval and duration.
pub const MAX_SAMPLES: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Seconds between samples.
    #[serde(default = "default_interval")]
    pub interval: f64,
    /// Seconds of sampling per run.
    #[serde(default = "default_duration")]
    pub duration: f64,
}

fn default_interval() -> f64 {
    0.25
}
fn default_duration() -> f64 {
    10.0
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_interval(),
            duration: default_duration(),
        }
    }
}

impl TelemetryConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.interval.is_finite() && self.interval > 0.0) {
            return Err(ValidationError::Telemetry(format!(
                "interval must be a positive number of seconds, got {}",
                self.interval
            )));
        }
        if !(self.duration.is_finite() && self.duration > 0.0) {
            return Err(ValidationError::Telemetry(format!(
                "duration must be a positive number of seconds, got {}",
                self.duration
            )));
        }
        Ok(())
    }
}

/// One reading of one axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub axis: AxisId,
    /// Seconds since sampling started.
    pub time: f64,
    pub demand: TagValue,
    pub actual: TagValue,
    pub displacement: TagValue,
}

/// A finished (or stopped) sampling run, ready for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRun {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub interval: f64,
    pub duration: f64,
    /// False when a stop request ended sampling early.
    pub completed: bool,
    pub samples: Vec<TelemetrySample>,
}

impl TelemetryRun {
    pub fn series(&self, axis: AxisId) -> impl Iterator<Item = &TelemetrySample> {
        self.samples.iter().filter(move |sample| sample.axis == axis)
    }

    pub fn max_displacement(&self) -> Option<TagValue> {
        self.samples.iter().map(|sample| sample.displacement).max()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TelemetrySampler {
    interval: f64,
    duration: f64,
}

impl TelemetrySampler {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            interval: config.interval,
            duration: config.duration,
        }
    }

    /// Sample for `duration` seconds instead of the configured duration.
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }

    pub fn sample_count(&self) -> u32 {
        let count = (self.duration / self.interval).ceil();
        if count.is_finite() && count > 0.0 {
            (count as u32).min(MAX_SAMPLES)
        } else {
            0
        }
    }

    fn schedule(&self) -> PollSchedule {
        let interval = Duration::try_from_secs_f64(self.interval).unwrap_or(Duration::from_millis(250));
        PollSchedule::immediate(interval, self.sample_count())
    }

    /// Sample every axis each tick until the duration is covered or `stop` is raised.
    ///
    /// A channel error ends sampling early. The samples taken so far are still returned,
    /// as an incomplete run, alongside the error.
    pub async fn run(
        &self,
        session: &mut dyn TagSession,
        tags: &TagMap,
        axes: &[AxisId],
        stop: Arc<AtomicBool>,
        sink: &dyn NotificationSink,
    ) -> (TelemetryRun, Option<ChannelError>) {
        let timestamp = Utc::now();
        let count = self.sample_count();
        tracing::info!(
            axes = axes.len(),
            samples = count,
            "Recording telemetry every {}s for {}s",
            self.interval,
            self.duration
        );

        let mut samples = Vec::with_capacity(axes.len() * count as usize);
        let mut poller = Poller::new(self.schedule(), stop);
        let mut failure = None;
        'ticks: while let Some(tick) = poller.tick().await {
            let time = f64::from(tick) * self.interval;
            for axis in axes {
                match read_positions(session, tags, *axis).await {
                    Ok((demand, actual)) => samples.push(TelemetrySample {
                        axis: *axis,
                        time,
                        demand,
                        actual,
                        displacement: (demand - actual).abs(),
                    }),
                    Err(e) => {
                        tracing::warn!(axis = %axis, tick, "Telemetry read failed: {}", e);
                        failure = Some(e);
                        break 'ticks;
                    }
                }
            }
            sink.on_progress(((time + self.interval) / self.duration).min(1.0));
        }

        let completed = failure.is_none() && !poller.is_cancelled();
        if completed {
            sink.on_progress(1.0);
        } else {
            tracing::info!(ticks = poller.iterations(), samples = samples.len(), "Telemetry ended early");
        }

        let run = TelemetryRun {
            id: Uuid::new_v4(),
            timestamp,
            interval: self.interval,
            duration: self.duration,
            completed,
            samples,
        };
        (run, failure)
    }
}

async fn read_positions(
    session: &mut dyn TagSession,
    tags: &TagMap,
    axis: AxisId,
) -> Result<(TagValue, TagValue), ChannelError> {
    let demand = session.read_tag(&tags.demand_position(axis)).await?;
    let actual = session.read_tag(&tags.actual_position(axis)).await?;
    Ok((demand, actual))
}
