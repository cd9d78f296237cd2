//! Local media element abstraction.
//!
//! A [`MediaElement`] is the native player (a browser video element, libVLC,
//! or the bundled [`SimulatedElement`]). It reports everything that happens to
//! it as [`MediaEvent`]s on a channel; [`MediaController`] turns those events
//! into [`PlaybackState`](crate::playback::PlaybackState).

mod controller;
mod simulated;

pub use controller::MediaController;
pub use simulated::{Clock, ManualClock, SimulatedElement, SystemClock};

use thiserror::Error;

/// Events a media element emits, named after their HTML media counterparts.
///
/// Events that carry a `time` report the element position at the moment the
/// change happened, which may differ from the position when the event is
/// handled.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    LoadStart,
    LoadedMetadata { duration: f64 },
    CanPlay,
    Play { time: f64 },
    Pause { time: f64 },
    Seeked { time: f64 },
    Waiting,
    TimeUpdate { time: f64 },
    Progress { buffered: f64 },
    VolumeChange { volume: f64, muted: bool },
    FullscreenChange { fullscreen: bool },
    Ended,
    Error { message: String },
}

impl MediaEvent {
    /// Whether the event can move the player lifecycle
    pub fn is_lifecycle(&self) -> bool {
        !matches!(
            self,
            MediaEvent::Seeked { .. }
                | MediaEvent::TimeUpdate { .. }
                | MediaEvent::Progress { .. }
                | MediaEvent::VolumeChange { .. }
                | MediaEvent::FullscreenChange { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("playback was denied by the autoplay policy")]
    PlaybackDenied,
    #[error("no media loaded")]
    NotLoaded,
    #[error("media decode failed: {0}")]
    Decode(String),
}

/// Imperative surface of a native media element.
///
/// Every state change is also reported as a [`MediaEvent`] on the element's
/// event channel; callers must not assume the change is visible in any
/// derived state until that event has been handled.
pub trait MediaElement: Send {
    fn load(&mut self, source: &str) -> Result<(), MediaError>;
    fn play(&mut self) -> Result<(), MediaError>;
    fn pause(&mut self);
    fn paused(&self) -> bool;
    fn current_time(&self) -> f64;
    fn set_current_time(&mut self, time: f64);
    /// Media length in seconds, `0.0` until metadata is known
    fn duration(&self) -> f64;
    fn volume(&self) -> f64;
    fn set_volume(&mut self, volume: f64);
    fn muted(&self) -> bool;
    fn set_muted(&mut self, muted: bool);
    fn fullscreen(&self) -> bool;
    fn set_fullscreen(&mut self, fullscreen: bool);
    fn buffered_fraction(&self) -> f64;

    /// Called periodically so elements without their own clock can emit
    /// `timeupdate`, `waiting` and `ended`.
    fn poll(&mut self) {}
}
