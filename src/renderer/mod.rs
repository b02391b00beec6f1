//! Playback controller of the media renderer.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │              Controller (any thread, cheap to clone)           │
//! │  Resolves sources, publishes state, hands work to the bridge   │
//! └───────────────────────────────┬────────────────────────────────┘
//!                                 │ run_blocking / run_async
//!                                 ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │                   Privileged context (MainLoop)                │
//! │   Session handlers: tune, pause, seek, pictures, watchdog      │
//! └───────────────────────────────┬────────────────────────────────┘
//!                                 │ Navigation / VolumeControl / PictureViewer
//!                                 ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │                     Host tuner and display                     │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transport state moves `Idle -> Transitioning -> Playing`, with `Paused`
//! in between when asked to. `Transitioning` ends when the tuner reports the
//! service playable, or when the picture viewer reports the image on screen.
//!
//! The first `play` of a session remembers what the tuner was playing and
//! stops it. `close`, or the idle watchdog some seconds after a `stop`,
//! hands that service back.

mod session;
mod source;
mod state;
mod watchdog;

pub use source::{MediaKind, SUPPORTED_MIME_TYPES, Source, SourceError, protocol_info};
pub use state::{RendererEvent, RendererSnapshot, TransportState, format_duration};
pub use watchdog::IdleWatchdog;

use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::config::RendererConfig;
use crate::error::{Result, ResultExt};
use crate::hardware::{EventFeed, Hardware, HardwareEvent};
use session::Session;
use state::Observed;

struct Inner {
    bridge: Bridge,
    /// Readable from any thread
    observed: RwLock<Observed>,
    /// Only locked on the privileged context
    session: Mutex<Session>,
    watchdog: IdleWatchdog,
    service_type: u16,
    friendly_name: String,
}

/// The media renderer's playback controller.
///
/// Commands may be issued from any thread. `play`, `set_source` and
/// `close` return immediately; the rest wait for the privileged context and
/// fail only if it stopped answering.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("friendly_name", &self.inner.friendly_name)
            .field("state", &self.state())
            .finish()
    }
}

impl Controller {
    /// Create a controller driving `hardware` through `bridge`.
    ///
    /// Reads the initial volume on the privileged context.
    pub fn new(bridge: Bridge, hardware: Hardware, config: &RendererConfig) -> Result<Self> {
        let controller = Self {
            inner: Arc::new(Inner {
                bridge: bridge.clone(),
                observed: RwLock::new(Observed::default()),
                session: Mutex::new(Session::new(hardware)),
                watchdog: IdleWatchdog::new(config.idle_timeout()),
                service_type: config.service_type,
                friendly_name: config.friendly_name.clone(),
            }),
        };

        let handle = controller.clone();
        let volume = bridge
            .run_blocking(move || handle.inner.session.lock().hardware.volume.volume())
            .with_context("Failed to read initial volume")?;
        controller.inner.observed.write().snapshot.volume = f32::from(volume) / 100.0;

        Ok(controller)
    }

    fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn friendly_name(&self) -> &str {
        &self.inner.friendly_name
    }

    pub fn snapshot(&self) -> RendererSnapshot {
        self.inner.observed.read().snapshot.clone()
    }

    pub fn state(&self) -> TransportState {
        self.inner.observed.read().snapshot.state
    }

    /// Volume level (0.0 - 1.0).
    pub fn volume(&self) -> f32 {
        self.inner.observed.read().snapshot.volume
    }

    /// Duration of the current media, once known.
    pub fn current_track_duration(&self) -> Option<Duration> {
        self.inner.observed.read().snapshot.track_duration
    }

    /// Receive every subsequent [`RendererEvent`].
    pub fn subscribe(&self) -> Receiver<RendererEvent> {
        self.inner.observed.write().subscribe()
    }

    /// Whether the idle watchdog is counting down.
    pub fn is_idle_watchdog_armed(&self) -> bool {
        self.inner.watchdog.is_armed()
    }

    /// Feed for the host's hardware notification source.
    ///
    /// The feed does not keep the controller alive.
    pub fn event_feed(&self) -> EventFeed {
        let weak = self.downgrade();
        EventFeed::new(move |event| {
            if let Some(controller) = Self::upgrade(&weak) {
                controller.handle_event(event);
            }
        })
    }

    /// Deliver a hardware notification. Always handled as queued work, so
    /// it is safe to call from inside a hardware callback.
    pub fn handle_event(&self, event: HardwareEvent) {
        let controller = self.clone();
        self.inner
            .bridge
            .run_async(move || controller.on_event(event));
    }

    /// Set the media to play next.
    ///
    /// A source that cannot be resolved is logged and ignored. If the
    /// previous media played to its end, playback continues with this one.
    pub fn set_source(&self, uri: &str, metadata: Option<&str>) {
        let source = match Source::resolve(uri, metadata) {
            Ok(source) => source,
            Err(e) => {
                warn!(uri, "Ignoring source: {}", e);
                return;
            }
        };
        info!(uri = %source.uri, kind = ?source.kind, "Source set");
        self.inner.observed.write().snapshot.source = Some(source);

        let controller = self.clone();
        self.inner
            .bridge
            .run_async(move || controller.on_source_changed());
    }

    /// Start or resume playback of the current source.
    pub fn play(&self) {
        if self.inner.observed.read().snapshot.source.is_none() {
            debug!("Play without a source, ignoring");
            return;
        }
        if self.inner.watchdog.disarm() {
            debug!("Idle watchdog disarmed");
        }
        self.inner
            .observed
            .write()
            .set_state(TransportState::Transitioning);

        let controller = self.clone();
        self.inner.bridge.run_async(move || controller.on_play());
    }

    /// Pause playback; `play` resumes without re-tuning.
    pub fn pause(&self) -> Result<()> {
        let controller = self.clone();
        self.inner
            .bridge
            .run_blocking(move || controller.on_pause())?;
        Ok(())
    }

    /// Stop playback and start the idle watchdog.
    pub fn stop(&self) -> Result<()> {
        let controller = self.clone();
        self.inner.bridge.run_blocking(move || controller.on_stop())?;
        Ok(())
    }

    /// Seek to an absolute position. Ignored unless playing a seekable service.
    pub fn seek(&self, position: Duration) -> Result<()> {
        let controller = self.clone();
        self.inner
            .bridge
            .run_blocking(move || controller.on_seek(position))?;
        Ok(())
    }

    /// Set the volume (0.0 - 1.0).
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        if !volume.is_finite() {
            debug!(volume, "Ignoring non-finite volume");
            return Ok(());
        }
        let volume = volume.clamp(0.0, 1.0);
        let controller = self.clone();
        self.inner
            .bridge
            .run_blocking(move || controller.on_set_volume(volume))?;
        Ok(())
    }

    /// Playback position, `None` while the service isn't seekable.
    pub fn current_position(&self) -> Result<Option<Duration>> {
        let controller = self.clone();
        let position = self
            .inner
            .bridge
            .run_blocking(move || controller.on_position())?;
        Ok(position)
    }

    /// End the control session and hand the tuner back.
    pub fn close(&self) {
        let controller = self.clone();
        self.inner.bridge.run_async(move || controller.on_close());
    }
}
