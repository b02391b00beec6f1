//! Control-session bookkeeping and the handlers that run on the privileged
//! context.
//!
//! Everything here executes as bridge work, so the session lock is never
//! contended and hardware calls keep arrival order.

use chrono::Utc;
use parking_lot::MutexGuard;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::source::Source;
use super::state::{RendererEvent, TransportState};
use super::Controller;
use crate::hardware::{Hardware, HardwareEvent, ServiceRef, Ticks};

/// Completion the controller is waiting for before reporting `Playing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Pending {
    /// A tune was issued; waiting for the service to become playable
    Tune,
    /// A picture was loaded; waiting for the viewer, tagged with its generation
    Picture(u64),
}

/// What was playing before the controller took over.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(super) enum Saved {
    /// No control session is active
    #[default]
    NotTaken,
    /// Control was taken; the service to hand back, if any
    Taken(Option<ServiceRef>),
}

/// State private to the privileged context.
pub(super) struct Session {
    pub hardware: Hardware,
    pub saved: Saved,
    /// Where `play` goes when resuming from `Paused`
    pub resume_to: Option<TransportState>,
    /// Position the hardware counter restarted at after the last seek
    pub seek_offset: Duration,
    pub pending: Option<Pending>,
    pub picture_generation: u64,
}

impl Session {
    pub fn new(hardware: Hardware) -> Self {
        Self {
            hardware,
            saved: Saved::NotTaken,
            resume_to: None,
            seek_offset: Duration::ZERO,
            pending: None,
            picture_generation: 0,
        }
    }

    pub fn control_taken(&self) -> bool {
        matches!(self.saved, Saved::Taken(_))
    }

    /// Length of the current service, `None` while it isn't seekable.
    /// An invalid length reading counts as zero.
    fn read_duration(&self) -> Option<Duration> {
        let navigation = &self.hardware.navigation;
        if !navigation.is_seekable() {
            return None;
        }
        Some(
            navigation
                .length()
                .map(Ticks::to_duration)
                .unwrap_or(Duration::ZERO),
        )
    }
}

impl Controller {
    fn session(&self) -> MutexGuard<'_, Session> {
        debug_assert!(
            self.inner.bridge.is_privileged(),
            "session touched outside the privileged context"
        );
        self.inner.session.lock()
    }

    /// Remember what was playing and stop it, once per control session.
    fn take_control(&self, session: &mut Session) {
        if session.control_taken() {
            return;
        }
        let previous = session.hardware.navigation.currently_playing();
        info!(saved = ?previous.as_ref().map(ToString::to_string), "Taking control of the tuner");
        session.hardware.navigation.stop_service();
        session.saved = Saved::Taken(previous);
        self.inner.observed.write().snapshot.session_started = Some(Utc::now());
    }

    pub(super) fn on_play(&self) {
        // A stop queued ahead of this play may have re-armed it.
        self.inner.watchdog.disarm();
        let mut session = self.session();
        self.take_control(&mut session);

        if session.resume_to.take().is_some() {
            if !session.hardware.navigation.unpause() {
                debug!("Nothing pausable is playing, resuming anyway");
            }
            self.inner.observed.write().set_state(TransportState::Playing);
            return;
        }

        let source = self.inner.observed.read().snapshot.source.clone();
        let Some(source) = source else {
            debug!("Source went away before playback started");
            self.inner.observed.write().set_state(TransportState::Idle);
            return;
        };

        if source.kind.is_image() {
            self.show_picture(&mut session, &source);
        } else {
            self.tune(&mut session, &source);
        }
    }

    fn tune(&self, session: &mut Session, source: &Source) {
        if session.hardware.pictures.is_showing() {
            session.hardware.pictures.close();
        }
        session.pending = Some(Pending::Tune);
        session.seek_offset = Duration::ZERO;
        {
            let mut observed = self.inner.observed.write();
            observed.snapshot.end_of_media = false;
            observed.set_duration(None);
            observed.set_state(TransportState::Transitioning);
        }

        let service = ServiceRef::new(self.inner.service_type, source.uri.as_str());
        info!(uri = %source.uri, mime = %source.mime_type, "Tuning");
        if let Err(e) = session.hardware.navigation.play_service(&service) {
            warn!(uri = %source.uri, "Tune failed: {}", e);
        }
    }

    fn show_picture(&self, session: &mut Session, source: &Source) {
        session.picture_generation += 1;
        let generation = session.picture_generation;
        session.pending = Some(Pending::Picture(generation));
        {
            let mut observed = self.inner.observed.write();
            observed.snapshot.end_of_media = false;
            observed.set_state(TransportState::Transitioning);
        }

        info!(uri = %source.uri, generation, "Loading picture");
        let weak = self.downgrade();
        session.hardware.pictures.load_picture(
            &source.uri,
            &source.mime_type,
            Box::new(move || {
                if let Some(controller) = Self::upgrade(&weak) {
                    let target = controller.clone();
                    controller
                        .inner
                        .bridge
                        .run_async(move || target.on_picture_shown(generation));
                }
            }),
        );
    }

    pub(super) fn on_picture_shown(&self, generation: u64) {
        let mut session = self.session();
        if session.pending != Some(Pending::Picture(generation)) {
            debug!(generation, "Ignoring stale picture notification");
            return;
        }
        session.pending = None;
        self.inner.observed.write().set_state(TransportState::Playing);
    }

    pub(super) fn on_event(&self, event: HardwareEvent) {
        match event {
            HardwareEvent::Start | HardwareEvent::UpdatedInfo | HardwareEvent::UpdatedEventInfo => {
                self.on_playable(event)
            }
            HardwareEvent::EndOfFile => self.on_end_of_file(),
            HardwareEvent::Buffering | HardwareEvent::TuneFailed => {
                debug!(?event, "Hardware event")
            }
        }
    }

    /// Complete a pending tune once the service can be played.
    fn on_playable(&self, event: HardwareEvent) {
        let mut session = self.session();
        if session.pending != Some(Pending::Tune) {
            debug!(?event, "Hardware event");
            return;
        }
        if event != HardwareEvent::Start && !session.hardware.navigation.is_seekable() {
            debug!(?event, "Service not seekable yet, still waiting");
            return;
        }
        session.pending = None;

        let duration = session.read_duration();
        let mut observed = self.inner.observed.write();
        if observed.snapshot.track_duration.is_none() {
            observed.set_duration(duration);
        }
        // A pause issued while tuning keeps the renderer paused.
        if observed.snapshot.state != TransportState::Paused {
            observed.set_state(TransportState::Playing);
        }
    }

    fn on_end_of_file(&self) {
        let mut session = self.session();
        debug!("End of media reported by the tuner");
        session.hardware.navigation.stop_service();
        session.pending = None;
        session.resume_to = None;

        let mut observed = self.inner.observed.write();
        observed.snapshot.end_of_media = true;
        observed.set_duration(None);
        observed.set_state(TransportState::Idle);
        observed.publish(RendererEvent::EndOfMedia);
    }

    pub(super) fn on_pause(&self) {
        let mut session = self.session();
        let state = self.inner.observed.read().snapshot.state;
        if !matches!(state, TransportState::Playing | TransportState::Transitioning) {
            debug!(?state, "Pause ignored");
            return;
        }
        if !session.hardware.navigation.pause() {
            debug!("Service is not pausable");
        }
        session.resume_to = Some(TransportState::Playing);
        self.inner.observed.write().set_state(TransportState::Paused);
    }

    pub(super) fn on_stop(&self) {
        let mut session = self.session();
        session.hardware.navigation.stop_service();
        session.pending = None;
        session.resume_to = None;
        {
            let mut observed = self.inner.observed.write();
            observed.snapshot.end_of_media = false;
            observed.set_duration(None);
            observed.set_state(TransportState::Idle);
        }

        if session.control_taken() {
            let weak = self.downgrade();
            self.inner.watchdog.arm(&self.inner.bridge, move || {
                if let Some(controller) = Self::upgrade(&weak) {
                    info!("Idle for too long, closing");
                    controller.on_close();
                }
            });
        }
        debug!("Playback stopped");
    }

    pub(super) fn on_seek(&self, position: Duration) {
        let mut session = self.session();
        let state = self.inner.observed.read().snapshot.state;
        if state != TransportState::Playing {
            debug!(?state, "Seek ignored");
            return;
        }
        if !session.hardware.navigation.is_seekable() {
            debug!("Service is not seekable");
            return;
        }
        let Some(target) = Ticks::checked_from_duration(position) else {
            debug!(?position, "Seek target out of range");
            return;
        };
        match session.hardware.navigation.seek_to(target) {
            Ok(()) => {
                session.seek_offset = position;
                debug!(?position, "Seeked");
            }
            Err(e) => warn!(?position, "Seek failed: {}", e),
        }
    }

    pub(super) fn on_set_volume(&self, volume: f32) {
        let mut session = self.session();
        let level = (volume * 100.0).round() as u8;
        session.hardware.volume.set_volume(level, level);
        self.inner.observed.write().set_volume(volume);
    }

    pub(super) fn on_position(&self) -> Option<Duration> {
        let session = self.session();
        if !session.hardware.navigation.is_seekable() {
            return None;
        }
        {
            let mut observed = self.inner.observed.write();
            if observed.snapshot.track_duration.is_none() {
                observed.set_duration(session.read_duration());
            }
        }
        match session.hardware.navigation.play_position() {
            Some(ticks) => Some(ticks.to_duration().saturating_add(session.seek_offset)),
            None => Some(Duration::ZERO),
        }
    }

    pub(super) fn on_source_changed(&self) {
        let resume = {
            let observed = self.inner.observed.read();
            observed.snapshot.end_of_media && observed.snapshot.state == TransportState::Idle
        };
        if resume {
            debug!("Previous media ended, continuing with the new source");
            self.play();
        }
    }

    pub(super) fn on_close(&self) {
        self.inner.watchdog.disarm();
        let mut session = self.session();
        if session.hardware.pictures.is_showing() {
            session.hardware.pictures.close();
        }
        session.pending = None;
        session.resume_to = None;
        session.seek_offset = Duration::ZERO;

        match std::mem::take(&mut session.saved) {
            Saved::Taken(Some(service)) => {
                info!(service = %service, "Handing control back");
                if let Err(e) = session.hardware.navigation.play_service(&service) {
                    warn!(service = %service, "Could not restore service: {}", e);
                }
            }
            Saved::Taken(None) => {
                info!("Handing control back, nothing to restore");
                session.hardware.navigation.stop_service();
            }
            Saved::NotTaken => debug!("No control session to close"),
        }

        let mut observed = self.inner.observed.write();
        let was_active = observed.snapshot.session_started.take().is_some();
        observed.snapshot.end_of_media = false;
        observed.set_duration(None);
        observed.set_state(TransportState::Idle);
        if was_active {
            observed.publish(RendererEvent::SessionClosed);
        }
    }
}
