//! Renderer-visible state, snapshots and change events.

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;
use std::time::Duration;

use super::source::Source;

/// Transport state as seen by control points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportState {
    #[default]
    Idle,
    Transitioning,
    Playing,
    Paused,
}

impl TransportState {
    /// AVTransport `TransportState` value.
    pub fn as_upnp(&self) -> &'static str {
        match self {
            Self::Idle => "STOPPED",
            Self::Transitioning => "TRANSITIONING",
            Self::Playing => "PLAYING",
            Self::Paused => "PAUSED_PLAYBACK",
        }
    }
}

/// Changes pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RendererEvent {
    StateChanged(TransportState),
    VolumeChanged(f32),
    DurationChanged(Option<Duration>),
    /// The current media played to its end
    EndOfMedia,
    /// Exclusive control was handed back
    SessionClosed,
}

/// Point-in-time copy of the renderer attributes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RendererSnapshot {
    pub state: TransportState,
    /// Volume level (0.0 - 1.0)
    pub volume: f32,
    pub source: Option<Source>,
    pub track_duration: Option<Duration>,
    pub end_of_media: bool,
    /// When the current control session began, if one is active
    pub session_started: Option<DateTime<Utc>>,
}

/// Attributes plus subscriber list, kept behind the controller's lock.
#[derive(Debug, Default)]
pub(crate) struct Observed {
    pub snapshot: RendererSnapshot,
    subscribers: Vec<Sender<RendererEvent>>,
}

impl Observed {
    pub fn subscribe(&mut self) -> Receiver<RendererEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Push an event, forgetting subscribers that went away.
    pub fn publish(&mut self, event: RendererEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Returns `true` if the state actually changed.
    pub fn set_state(&mut self, state: TransportState) -> bool {
        if self.snapshot.state == state {
            return false;
        }
        tracing::info!(from = ?self.snapshot.state, to = ?state, "Transport state changed");
        self.snapshot.state = state;
        self.publish(RendererEvent::StateChanged(state));
        true
    }

    pub fn set_volume(&mut self, volume: f32) {
        if self.snapshot.volume != volume {
            self.snapshot.volume = volume;
            self.publish(RendererEvent::VolumeChanged(volume));
        }
    }

    pub fn set_duration(&mut self, duration: Option<Duration>) {
        if self.snapshot.track_duration != duration {
            self.snapshot.track_duration = duration;
            self.publish(RendererEvent::DurationChanged(duration));
        }
    }
}

/// Format a duration as H:MM:SS.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;
    format!("{}:{:02}:{:02}", hours, mins, secs)
}
