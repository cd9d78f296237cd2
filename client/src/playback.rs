use crate::media::MediaEvent;

/// Lifecycle of the local player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerPhase {
    #[default]
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    Buffering,
    Ended,
    Error,
}

impl PlayerPhase {
    /// Phase after `event`, or `None` when the event does not move the machine.
    ///
    /// `wants_play` is whether the element is unpaused, which decides where a
    /// stalled player resumes to.
    pub fn next(self, event: &MediaEvent, wants_play: bool) -> Option<PlayerPhase> {
        use PlayerPhase::*;
        let next = match (self, event) {
            (_, MediaEvent::LoadStart) => Loading,
            (_, MediaEvent::Error { .. }) => Error,
            (Loading, MediaEvent::LoadedMetadata { .. }) => Ready,
            (Loading, MediaEvent::CanPlay) => Ready,
            (Buffering, MediaEvent::CanPlay) if wants_play => Playing,
            (Buffering, MediaEvent::CanPlay) => Ready,
            (Ready | Paused | Ended | Buffering, MediaEvent::Play { .. }) => Playing,
            (Playing | Buffering | Ready, MediaEvent::Pause { .. }) => Paused,
            (Playing, MediaEvent::Waiting) => Buffering,
            (Playing | Buffering, MediaEvent::Ended) => Ended,
            _ => return None,
        };
        (next != self).then_some(next)
    }
}

/// Reactive view of the media element, rebuilt from its events
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub is_playing: bool,
    pub current_time: f64,
    pub duration: f64,
    pub volume: f64,
    pub is_muted: bool,
    pub buffered_fraction: f64,
    pub is_fullscreen: bool,
    pub phase: PlayerPhase,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            is_playing: false,
            current_time: 0.0,
            duration: 0.0,
            volume: 1.0,
            is_muted: false,
            buffered_fraction: 0.0,
            is_fullscreen: false,
            phase: PlayerPhase::Idle,
        }
    }
}

impl PlaybackState {
    pub fn apply(&mut self, event: &MediaEvent) {
        match event {
            MediaEvent::LoadStart => {
                self.is_playing = false;
                self.current_time = 0.0;
                self.duration = 0.0;
                self.buffered_fraction = 0.0;
            }
            MediaEvent::LoadedMetadata { duration } => self.duration = *duration,
            MediaEvent::Play { time } => {
                self.is_playing = true;
                self.current_time = *time;
            }
            MediaEvent::Pause { time } => {
                self.is_playing = false;
                self.current_time = *time;
            }
            MediaEvent::Ended | MediaEvent::Error { .. } => {
                self.is_playing = false
            }
            MediaEvent::Seeked { time } | MediaEvent::TimeUpdate { time } => {
                self.current_time = *time
            }
            MediaEvent::Progress { buffered } => {
                self.buffered_fraction = buffered.clamp(0.0, 1.0)
            }
            MediaEvent::VolumeChange { volume, muted } => {
                self.volume = *volume;
                self.is_muted = *muted;
            }
            MediaEvent::FullscreenChange { fullscreen } => self.is_fullscreen = *fullscreen,
            MediaEvent::CanPlay | MediaEvent::Waiting => {}
        }

        match self.phase.next(event, self.is_playing) {
            Some(next) => {
                tracing::debug!("Player phase {:?} -> {:?}", self.phase, next);
                self.phase = next;
            }
            None if event.is_lifecycle() => {
                tracing::debug!("Ignoring {:?} in phase {:?}", event, self.phase);
            }
            None => {}
        }
    }
}
