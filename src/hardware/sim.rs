//! In-memory hardware backend.
//!
//! Behaves like a tuner closely enough to drive the controller end to end:
//! seeking restarts the position counter, tuning can be told to fail, and a
//! connected [`EventFeed`] receives `Start` some time after each tune.
//! Every call is recorded together with the thread it came from, which is
//! what the tests use to check that hardware is only touched from the
//! privileged context.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use super::{
    EventFeed, Hardware, HardwareError, HardwareEvent, Navigation, PictureViewer, ServiceRef,
    ShownCallback, Ticks, VolumeControl,
};
use crate::bridge::Bridge;

/// A recorded hardware call.
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareCall {
    PlayService(ServiceRef),
    StopService,
    Pause,
    Unpause,
    SeekTo(Ticks),
    SetVolume(u8),
    LoadPicture { uri: String, mime_type: String },
    ClosePicture,
}

struct AutoStart {
    bridge: Bridge,
    feed: EventFeed,
    delay: Duration,
}

struct SimState {
    playing: Option<ServiceRef>,
    paused: bool,
    seekable: bool,
    position: Option<Ticks>,
    length: Option<Ticks>,
    volume: u8,
    fail_next_play: bool,
    picture_showing: bool,
    auto_show: bool,
    pending_shown: Option<ShownCallback>,
    auto_start: Option<AutoStart>,
    calls: Vec<HardwareCall>,
    callers: HashSet<ThreadId>,
}

impl SimState {
    fn record(&mut self, call: HardwareCall) {
        tracing::trace!(?call, "Simulated hardware call");
        self.calls.push(call);
        self.callers.insert(thread::current().id());
    }
}

/// Control and inspection handle for a simulated backend.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

/// Build a simulated backend, optionally with a service already playing.
pub fn simulated(already_playing: Option<ServiceRef>) -> (Hardware, SimHandle) {
    let state = Arc::new(Mutex::new(SimState {
        playing: already_playing,
        paused: false,
        seekable: true,
        position: Some(Ticks::ZERO),
        length: Some(Ticks::from_secs(300)),
        volume: 50,
        fail_next_play: false,
        picture_showing: false,
        auto_show: false,
        pending_shown: None,
        auto_start: None,
        calls: Vec::new(),
        callers: HashSet::new(),
    }));

    let hardware = Hardware {
        navigation: Box::new(SimNavigation {
            state: Arc::clone(&state),
        }),
        volume: Box::new(SimVolume {
            state: Arc::clone(&state),
        }),
        pictures: Box::new(SimPictures {
            state: Arc::clone(&state),
        }),
    };
    (hardware, SimHandle { state })
}

impl SimHandle {
    /// Calls recorded so far.
    pub fn calls(&self) -> Vec<HardwareCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// How many times a service was tuned.
    pub fn play_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, HardwareCall::PlayService(_)))
            .count()
    }

    /// Threads that made hardware calls.
    pub fn caller_threads(&self) -> HashSet<ThreadId> {
        self.state.lock().callers.clone()
    }

    pub fn playing(&self) -> Option<ServiceRef> {
        self.state.lock().playing.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn volume(&self) -> u8 {
        self.state.lock().volume
    }

    pub fn picture_showing(&self) -> bool {
        self.state.lock().picture_showing
    }

    pub fn set_seekable(&self, seekable: bool) {
        self.state.lock().seekable = seekable;
    }

    /// Set the raw position counter; `None` makes the reading invalid.
    pub fn set_position(&self, position: Option<Ticks>) {
        self.state.lock().position = position;
    }

    /// Move the position counter forward.
    pub fn advance_position(&self, by: Duration) {
        let mut state = self.state.lock();
        if let Some(position) = state.position {
            state.position = Some(position.saturating_add(Ticks::from_duration(by)));
        }
    }

    pub fn set_length(&self, length: Option<Ticks>) {
        self.state.lock().length = length;
    }

    /// Make the next `play_service` call fail.
    pub fn fail_next_play(&self) {
        self.state.lock().fail_next_play = true;
    }

    /// Report pictures as shown as soon as they are loaded.
    pub fn set_auto_show(&self, auto_show: bool) {
        self.state.lock().auto_show = auto_show;
    }

    /// Finish decoding the pending picture. Returns `false` if none was loading.
    pub fn show_pending_picture(&self) -> bool {
        let callback = self.state.lock().pending_shown.take();
        match callback {
            Some(on_shown) => {
                on_shown();
                true
            }
            None => false,
        }
    }

    /// Emit `Start` on `feed` through `bridge`, `delay` after every tune.
    pub fn connect(&self, bridge: Bridge, feed: EventFeed, delay: Duration) {
        self.state.lock().auto_start = Some(AutoStart {
            bridge,
            feed,
            delay,
        });
    }
}

struct SimNavigation {
    state: Arc<Mutex<SimState>>,
}

impl Navigation for SimNavigation {
    fn currently_playing(&self) -> Option<ServiceRef> {
        self.state.lock().playing.clone()
    }

    fn play_service(&mut self, service: &ServiceRef) -> Result<(), HardwareError> {
        let mut state = self.state.lock();
        state.record(HardwareCall::PlayService(service.clone()));
        if std::mem::take(&mut state.fail_next_play) {
            return Err(HardwareError::rejected("playService", "simulated tuner failure"));
        }
        state.playing = Some(service.clone());
        state.paused = false;
        state.position = Some(Ticks::ZERO);

        if let Some(auto) = &state.auto_start {
            let feed = auto.feed.clone();
            auto.bridge
                .call_later(auto.delay, move || feed.emit(HardwareEvent::Start));
        }
        Ok(())
    }

    fn stop_service(&mut self) {
        let mut state = self.state.lock();
        state.record(HardwareCall::StopService);
        state.playing = None;
        state.paused = false;
    }

    fn pause(&mut self) -> bool {
        let mut state = self.state.lock();
        state.record(HardwareCall::Pause);
        if state.playing.is_none() {
            return false;
        }
        state.paused = true;
        true
    }

    fn unpause(&mut self) -> bool {
        let mut state = self.state.lock();
        state.record(HardwareCall::Unpause);
        if state.playing.is_none() {
            return false;
        }
        state.paused = false;
        true
    }

    fn is_seekable(&self) -> bool {
        let state = self.state.lock();
        state.playing.is_some() && state.seekable
    }

    fn seek_to(&mut self, target: Ticks) -> Result<(), HardwareError> {
        let mut state = self.state.lock();
        state.record(HardwareCall::SeekTo(target));
        if state.playing.is_none() {
            return Err(HardwareError::rejected("seekTo", "no service"));
        }
        // The counter restarts at the seek target.
        state.position = Some(Ticks::ZERO);
        Ok(())
    }

    fn play_position(&self) -> Option<Ticks> {
        self.state.lock().position
    }

    fn length(&self) -> Option<Ticks> {
        self.state.lock().length
    }
}

struct SimVolume {
    state: Arc<Mutex<SimState>>,
}

impl VolumeControl for SimVolume {
    fn volume(&self) -> u8 {
        self.state.lock().volume
    }

    fn set_volume(&mut self, left: u8, right: u8) {
        let mut state = self.state.lock();
        state.record(HardwareCall::SetVolume(left));
        state.volume = left.max(right);
    }
}

struct SimPictures {
    state: Arc<Mutex<SimState>>,
}

impl PictureViewer for SimPictures {
    fn load_picture(&mut self, uri: &str, mime_type: &str, on_shown: ShownCallback) {
        let auto_show = {
            let mut state = self.state.lock();
            state.record(HardwareCall::LoadPicture {
                uri: uri.to_string(),
                mime_type: mime_type.to_string(),
            });
            state.picture_showing = true;
            state.auto_show
        };
        if auto_show {
            on_shown();
        } else {
            self.state.lock().pending_shown = Some(on_shown);
        }
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.record(HardwareCall::ClosePicture);
        state.picture_showing = false;
        state.pending_shown = None;
    }

    fn is_showing(&self) -> bool {
        self.state.lock().picture_showing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seek_restarts_position_counter() {
        let (mut hw, sim) = simulated(None);
        hw.navigation
            .play_service(&ServiceRef::new(4097, "http://h/a.mp3"))
            .unwrap();
        sim.advance_position(Duration::from_secs(10));
        assert_eq!(hw.navigation.play_position(), Some(Ticks::from_secs(10)));

        hw.navigation.seek_to(Ticks::from_secs(120)).unwrap();
        assert_eq!(hw.navigation.play_position(), Some(Ticks::ZERO));
    }

    #[test]
    fn test_fail_next_play_fails_once() {
        let (mut hw, sim) = simulated(None);
        let service = ServiceRef::new(4097, "http://h/a.mp3");
        sim.fail_next_play();

        assert!(hw.navigation.play_service(&service).is_err());
        assert!(sim.playing().is_none());
        assert!(hw.navigation.play_service(&service).is_ok());
        assert_eq!(sim.play_count(), 2);
    }

    #[test]
    fn test_pending_picture_shown_on_demand() {
        let (mut hw, sim) = simulated(None);
        let shown = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&shown);

        hw.pictures.load_picture(
            "http://h/p.jpg",
            "image/jpeg",
            Box::new(move || *flag.lock() = true),
        );
        assert!(hw.pictures.is_showing());
        assert!(!*shown.lock());

        assert!(sim.show_pending_picture());
        assert!(*shown.lock());
        assert!(!sim.show_pending_picture());
    }
}
