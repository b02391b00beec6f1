//! Interfaces of the hardware collaborators.
//!
//! The tuner/navigation subsystem, the volume control and the picture
//! viewer belong to the host platform. They are only ever called from the
//! privileged context, so implementations need to be `Send` (to be handed to
//! it) but never `Sync`.
//!
//! Hosts plug in real drivers by implementing [`Navigation`],
//! [`VolumeControl`] and [`PictureViewer`]; [`sim`] provides an in-memory
//! backend used by the CLI and the tests.

pub mod sim;

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Hardware clock rate of position and length readings.
pub const TICKS_PER_SECOND: i64 = 90_000;

/// Number of data fields between the service type and the path of a
/// service reference string.
const SERVICE_REF_DATA_FIELDS: usize = 9;

/// A raw position or length reading from the tuner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
pub struct Ticks(pub i64);

impl Ticks {
    pub const ZERO: Ticks = Ticks(0);

    /// Convert a duration to ticks, truncating below one tick.
    ///
    /// `None` if the duration does not fit in a tick reading.
    pub fn checked_from_duration(duration: Duration) -> Option<Self> {
        let secs = i64::try_from(duration.as_secs()).ok()?;
        let sub = i64::from(duration.subsec_nanos()) * TICKS_PER_SECOND / 1_000_000_000;
        secs.checked_mul(TICKS_PER_SECOND)?.checked_add(sub).map(Self)
    }

    /// Like [`Ticks::checked_from_duration`], saturating at the largest reading.
    pub fn from_duration(duration: Duration) -> Self {
        Self::checked_from_duration(duration).unwrap_or(Self(i64::MAX))
    }

    /// Whole seconds to ticks.
    pub fn from_secs(secs: u64) -> Self {
        Self::from_duration(Duration::from_secs(secs))
    }

    pub fn saturating_add(self, other: Ticks) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Convert to a duration. Negative readings clamp to zero.
    pub fn to_duration(self) -> Duration {
        if self.0 <= 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.0 as f64 / TICKS_PER_SECOND as f64)
    }
}

/// Reference to a playable service, in the navigation subsystem's terms.
///
/// The string form is `<type>:<9 data fields>:<path>`, with `:` in the
/// path escaped as `%3a` so the path can't be confused with the fields.
/// Network sources leave every data field at `0`; broadcast services carry
/// their channel identifiers there.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ServiceRef {
    kind: u16,
    data: String,
    path: String,
}

impl ServiceRef {
    /// Reference with all data fields zeroed.
    pub fn new(kind: u16, path: impl Into<String>) -> Self {
        Self {
            kind,
            data: vec!["0"; SERVICE_REF_DATA_FIELDS].join(":"),
            path: path.into(),
        }
    }

    /// Service type (4097 for network media).
    pub fn kind(&self) -> u16 {
        self.kind
    }

    /// The URI or channel path this reference points at.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.kind,
            self.data,
            self.path.replace(':', "%3a")
        )
    }
}

impl FromStr for ServiceRef {
    type Err = HardwareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HardwareError::InvalidServiceRef(s.to_string());
        let mut fields = s.splitn(SERVICE_REF_DATA_FIELDS + 2, ':');
        let kind = fields
            .next()
            .and_then(|k| k.parse::<u16>().ok())
            .ok_or_else(invalid)?;
        let mut rest: Vec<&str> = fields.collect();
        if rest.len() != SERVICE_REF_DATA_FIELDS + 1 {
            return Err(invalid());
        }
        let path = rest
            .pop()
            .unwrap_or_default()
            .replace("%3a", ":")
            .replace("%3A", ":");
        Ok(Self {
            kind,
            data: rest.join(":"),
            path,
        })
    }
}

/// Notifications pushed by the playing service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HardwareEvent {
    /// Decoding started
    Start,
    /// The stream ended
    EndOfFile,
    /// Stream information (length, seekability) changed
    UpdatedInfo,
    /// Programme/event information changed
    UpdatedEventInfo,
    /// The pipeline is refilling its buffer
    Buffering,
    /// Tuning to the requested service failed
    TuneFailed,
}

/// Push-style event feed into the controller.
///
/// Handed to whatever owns the hardware notification source; emitting is
/// safe from any thread.
#[derive(Clone)]
pub struct EventFeed {
    sink: Arc<dyn Fn(HardwareEvent) + Send + Sync>,
}

impl EventFeed {
    pub fn new(sink: impl Fn(HardwareEvent) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn emit(&self, event: HardwareEvent) {
        (self.sink)(event)
    }
}

impl fmt::Debug for EventFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventFeed")
    }
}

/// Hardware errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HardwareError {
    #[error("{operation} rejected: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },

    #[error("Invalid service reference: {0}")]
    InvalidServiceRef(String),
}

impl HardwareError {
    pub fn rejected(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Rejected {
            operation,
            reason: reason.into(),
        }
    }
}

/// Service selection and transport control of the AV pipeline.
pub trait Navigation: Send {
    /// The service currently playing, if any.
    fn currently_playing(&self) -> Option<ServiceRef>;

    /// Tune to `service`. The outcome arrives later as [`HardwareEvent`]s.
    fn play_service(&mut self, service: &ServiceRef) -> Result<(), HardwareError>;

    fn stop_service(&mut self);

    /// Pause the current service. `false` if nothing pausable is playing.
    fn pause(&mut self) -> bool;

    /// Resume the current service. `false` if nothing pausable is playing.
    fn unpause(&mut self) -> bool;

    /// Whether the current service accepts seeks right now.
    fn is_seekable(&self) -> bool;

    /// Seek to an absolute position. The position counter restarts at zero.
    fn seek_to(&mut self, target: Ticks) -> Result<(), HardwareError>;

    /// Position since the last tune or seek; `None` if the reading is invalid.
    fn play_position(&self) -> Option<Ticks>;

    /// Length of the current service; `None` if the reading is invalid.
    fn length(&self) -> Option<Ticks>;
}

/// Output volume on a 0-100 scale.
pub trait VolumeControl: Send {
    fn volume(&self) -> u8;
    fn set_volume(&mut self, left: u8, right: u8);
}

/// Invoked by the picture viewer once an image is on screen.
pub type ShownCallback = Box<dyn FnOnce() + Send + 'static>;

/// Full-screen still image display.
pub trait PictureViewer: Send {
    /// Open the viewer if needed and start loading `uri`. `on_shown` is
    /// called once the decoded picture is visible, possibly much later.
    fn load_picture(&mut self, uri: &str, mime_type: &str, on_shown: ShownCallback);

    fn close(&mut self);

    fn is_showing(&self) -> bool;
}

/// The set of collaborators a controller drives.
pub struct Hardware {
    pub navigation: Box<dyn Navigation>,
    pub volume: Box<dyn VolumeControl>,
    pub pictures: Box<dyn PictureViewer>,
}
