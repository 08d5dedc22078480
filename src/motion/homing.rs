// src/motion/homing.rs - One homing pass: reset, settle, arm, poll home bits
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use super::motor::Motor;
use super::poll::{PollSchedule, Poller};
use crate::config::TimingConfig;
use crate::hardware::tags::TagMap;
use crate::hardware::{ChannelError, TagSession};

/// Passes per homing sequence.
pub const HOMING_PASSES: u32 = 2;

/// Poll iterations allowed for zero-based `pass`: 1, then 6.
pub fn pass_budget(pass: u32) -> u32 {
    5 * pass + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Homed { iterations: u32 },
    TimedOut { homed: usize, iterations: u32 },
    Cancelled,
}

pub struct HomingPass<'a> {
    pub tags: &'a TagMap,
    pub timing: &'a TimingConfig,
    pub home_bit: u8,
    pub cancel: Arc<AtomicBool>,
}

impl HomingPass<'_> {
    /// Run zero-based pass `pass` over `motors`. The trigger is always left low on return,
    /// except when cancelled (the canceller owns the tags then).
    pub async fn run(&self, session: &mut dyn TagSession, motors: &[Motor], pass: u32) -> Result<PassOutcome, ChannelError> {
        let trigger = self.tags.home_trigger();
        let total = motors.len();

        session.write_required(&trigger, 0).await?;
        tokio::time::sleep(self.timing.homing_settle()).await;
        let before = session.read_tag(&trigger).await?;
        tracing::debug!(pass = pass + 1, "Home trigger reads {} before arming", before);
        session.write_required(&trigger, 1).await?;

        let budget = pass_budget(pass);
        let mut poller = Poller::new(PollSchedule::delayed(self.timing.homing_poll(), budget), self.cancel.clone());
        let mut homed = 0;
        while let Some(iteration) = poller.tick().await {
            session.keep_alive().await?;
            homed = 0;
            for motor in motors {
                if motor.poll_homed(session, self.tags, self.home_bit).await? {
                    homed += 1;
                }
            }
            tracing::debug!(pass = pass + 1, iteration, "{} of {} axes homed", homed, total);

            if homed == total {
                session.write_required(&trigger, 0).await?;
                return Ok(PassOutcome::Homed {
                    iterations: iteration + 1,
                });
            }
        }

        if poller.is_cancelled() {
            return Ok(PassOutcome::Cancelled);
        }

        session.write_required(&trigger, 0).await?;
        Ok(PassOutcome::TimedOut {
            homed,
            iterations: poller.iterations(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budgets_grow_per_pass() {
        assert_eq!(pass_budget(0), 1);
        assert_eq!(pass_budget(1), 6);
    }
}
