// src/notify.rs - Observer side of the controller: state, messages, progress
use tokio::sync::mpsc;

use crate::motion::controller::ControllerStatus;

/// Receives everything the controller wants an operator to see.
///
/// Calls are made from whichever task caused the event and must not block.
pub trait NotificationSink: Send + Sync {
    fn on_state_changed(&self, status: &ControllerStatus);
    fn on_message(&self, text: &str);
    fn on_progress(&self, fraction: f64);
    fn on_telemetry_complete(&self);
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    StateChanged(ControllerStatus),
    Message(String),
    Progress(f64),
    TelemetryComplete,
}

/// Logs every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn on_state_changed(&self, status: &ControllerStatus) {
        tracing::info!(
            state = ?status.state,
            homing = status.homing,
            run_enable = status.run_enable,
            provenance = %status.provenance,
            "State changed"
        );
    }

    fn on_message(&self, text: &str) {
        tracing::info!("{}", text);
    }

    fn on_progress(&self, fraction: f64) {
        tracing::debug!("Progress {:.0}%", fraction * 100.0);
    }

    fn on_telemetry_complete(&self) {
        tracing::info!("Telemetry run complete");
    }
}

/// Forwards notifications into an unbounded channel for a UI or test to consume.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            tracing::trace!("Notification receiver dropped");
        }
    }
}

impl NotificationSink for ChannelSink {
    fn on_state_changed(&self, status: &ControllerStatus) {
        self.send(Notification::StateChanged(status.clone()));
    }

    fn on_message(&self, text: &str) {
        self.send(Notification::Message(text.to_string()));
    }

    fn on_progress(&self, fraction: f64) {
        self.send(Notification::Progress(fraction));
    }

    fn on_telemetry_complete(&self) {
        self.send(Notification::TelemetryComplete);
    }
}

/// Drain everything currently queued without waiting.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        out.push(notification);
    }
    out
}
