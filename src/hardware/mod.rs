// src/hardware/mod.rs - Device channel abstraction over the controller's tag link
pub mod gateway;
pub mod simulated;
pub mod tags;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::config::Config;
use crate::hardware::gateway::GatewayChannel;
use crate::hardware::simulated::SimulatedChannel;
use crate::hardware::tags::TagMap;
use crate::motion::motor::AxisId;

/// Raw tag value. Booleans are written as 0/1.
pub type TagValue = i64;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Unable to reach controller at {address}: {reason}")]
    Connect { address: String, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Command '{0}' timed out")]
    Timeout(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Write to {0} was rejected by the controller")]
    Rejected(String),
    #[error("Session closed after an earlier failure")]
    Closed,
}

/// Which implementation is answering tag calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Connected,
    Simulated,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Connected => write!(f, "connected"),
            Provenance::Simulated => write!(f, "simulated"),
        }
    }
}

/// A link to one programmable controller.
///
/// `connect` hands out a scoped session; dropping the session releases the
/// connection on every exit path, including early returns through `?`.
#[async_trait]
pub trait DeviceChannel: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn TagSession>, ChannelError>;
    fn provenance(&self) -> Provenance;
}

/// Open connection to the controller.
#[async_trait]
pub trait TagSession: Send {
    async fn read_tag(&mut self, tag: &str) -> Result<TagValue, ChannelError>;

    /// Returns `Ok(false)` when the controller refused the write.
    async fn write_tag(&mut self, tag: &str, value: TagValue) -> Result<bool, ChannelError>;

    /// Cheap request that keeps an otherwise idle connection from being dropped.
    async fn keep_alive(&mut self) -> Result<(), ChannelError>;

    /// Write that must be accepted; a refusal becomes [`ChannelError::Rejected`].
    async fn write_required(&mut self, tag: &str, value: TagValue) -> Result<(), ChannelError> {
        if self.write_tag(tag, value).await? {
            Ok(())
        } else {
            Err(ChannelError::Rejected(tag.to_string()))
        }
    }
}

/// Zero every live-enable slot so only explicitly activated axes are driven.
pub async fn reset_live_axes(session: &mut dyn TagSession, tags: &TagMap) -> Result<(), ChannelError> {
    for axis in AxisId::all() {
        session.write_required(&tags.live_enable(axis), 0).await?;
    }
    Ok(())
}

/// Probe the configured controller once and pick the channel for the whole session.
///
/// The probe doubles as the live-axis reset. Its failure is the one error that is not
/// surfaced: it only selects the simulated path.
pub async fn select_channel(config: &Config) -> Arc<dyn DeviceChannel> {
    let tags = TagMap::new(config.controller.program.clone());
    let gateway = GatewayChannel::new(&config.controller);

    let probe = async {
        let mut session = gateway.connect().await?;
        reset_live_axes(session.as_mut(), &tags).await
    };

    match probe.await {
        Ok(()) => {
            tracing::info!(
                "Connected to controller {} (slot {})",
                config.controller.address,
                config.controller.slot
            );
            Arc::new(gateway)
        }
        Err(e) => {
            tracing::warn!("Controller unreachable ({}), running simulated", e);
            Arc::new(SimulatedChannel::new(tags, config.controller.home_bit))
        }
    }
}
