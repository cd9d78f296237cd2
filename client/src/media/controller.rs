use super::{MediaElement, MediaError, MediaEvent};
use crate::playback::PlaybackState;

/// Owns one media element and mirrors its events into [`PlaybackState`].
///
/// Operations only touch the element; state follows once the resulting
/// events are fed back through [`MediaController::handle_event`].
pub struct MediaController<E: MediaElement> {
    element: E,
    state: PlaybackState,
}

impl<E: MediaElement> MediaController<E> {
    pub fn new(element: E) -> Self {
        Self {
            element,
            state: PlaybackState::default(),
        }
    }

    pub fn load(&mut self, source: &str) -> Result<(), MediaError> {
        tracing::info!("Loading media {}", source);
        self.element.load(source)
    }

    /// Start playback. A denied play is reported but leaves the element paused.
    pub fn play(&mut self) -> Result<(), MediaError> {
        self.element.play().inspect_err(|e| {
            tracing::warn!("Play request failed: {}", e);
        })
    }

    pub fn pause(&mut self) {
        self.element.pause();
    }

    /// Seek to `time`, clamped to `[0, duration]`. Returns the applied position.
    pub fn seek(&mut self, time: f64) -> f64 {
        if time.is_nan() {
            return self.current_time();
        }
        let duration = self.element.duration();
        let target = if duration > 0.0 {
            time.clamp(0.0, duration)
        } else {
            time.max(0.0)
        };
        self.element.set_current_time(target);
        target
    }

    pub fn skip(&mut self, delta: f64) -> f64 {
        self.seek(self.current_time() + delta)
    }

    pub fn set_volume(&mut self, volume: f64) {
        if volume.is_nan() {
            return;
        }
        self.element.set_volume(volume.clamp(0.0, 1.0));
    }

    pub fn toggle_mute(&mut self) -> bool {
        let muted = !self.element.muted();
        self.element.set_muted(muted);
        muted
    }

    pub fn toggle_fullscreen(&mut self) -> bool {
        let fullscreen = !self.element.fullscreen();
        self.element.set_fullscreen(fullscreen);
        fullscreen
    }

    /// Live element position, not the last reported one
    pub fn current_time(&self) -> f64 {
        self.element.current_time()
    }

    pub fn duration(&self) -> f64 {
        self.element.duration()
    }

    pub fn is_playing(&self) -> bool {
        !self.element.paused()
    }

    pub fn poll(&mut self) {
        self.element.poll();
    }

    pub fn handle_event(&mut self, event: &MediaEvent) {
        self.state.apply(event);
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    /// State with the live position filled in
    pub fn snapshot(&self) -> PlaybackState {
        PlaybackState {
            current_time: self.current_time(),
            is_playing: self.is_playing(),
            ..self.state.clone()
        }
    }

    pub fn element(&self) -> &E {
        &self.element
    }

    pub fn element_mut(&mut self) -> &mut E {
        &mut self.element
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{ManualClock, SimulatedElement};
    use crate::playback::PlayerPhase;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        controller: MediaController<SimulatedElement>,
        events: mpsc::UnboundedReceiver<MediaEvent>,
        clock: ManualClock,
    }

    impl Harness {
        fn new(duration: f64) -> Self {
            let clock = ManualClock::default();
            let (element, events) = SimulatedElement::new(Arc::new(clock.clone()), duration);
            let mut harness = Self {
                controller: MediaController::new(element),
                events,
                clock,
            };
            harness.controller.load("test://video").unwrap();
            harness.pump();
            harness
        }

        fn pump(&mut self) -> Vec<MediaEvent> {
            let mut seen = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                self.controller.handle_event(&event);
                seen.push(event);
            }
            seen
        }
    }

    #[test]
    fn seek_clamps_to_media_bounds() {
        let mut h = Harness::new(300.0);
        assert_eq!(h.controller.seek(-5.0), 0.0);
        assert_eq!(h.controller.seek(301.0), 300.0);
        assert_eq!(h.controller.seek(42.0), 42.0);
        assert_eq!(
            h.pump(),
            vec![
                MediaEvent::Seeked { time: 0.0 },
                MediaEvent::Seeked { time: 300.0 },
                MediaEvent::Seeked { time: 42.0 },
            ]
        );
        assert_eq!(h.controller.state().current_time, 42.0);
    }

    #[test]
    fn huge_skip_lands_on_duration() {
        let mut h = Harness::new(300.0);
        h.controller.seek(10.0);
        assert_eq!(h.controller.skip(1_000_000.0), 300.0);
        assert_eq!(h.controller.current_time(), 300.0);
        assert_eq!(h.controller.skip(1_000_000.0), 300.0);
        assert_eq!(h.controller.skip(-1_000_000.0), 0.0);
    }

    #[test]
    fn skip_is_relative_to_live_position() {
        let mut h = Harness::new(300.0);
        h.controller.play().unwrap();
        h.clock.advance(Duration::from_secs(20));
        assert_eq!(h.controller.skip(-5.0), 15.0);
    }

    #[test]
    fn state_follows_events() {
        let mut h = Harness::new(300.0);
        assert_eq!(h.controller.state().phase, PlayerPhase::Ready);
        assert_eq!(h.controller.state().duration, 300.0);

        h.controller.play().unwrap();
        assert!(!h.controller.state().is_playing);
        h.pump();
        assert!(h.controller.state().is_playing);
        assert_eq!(h.controller.state().phase, PlayerPhase::Playing);

        h.controller.pause();
        h.pump();
        assert_eq!(h.controller.state().phase, PlayerPhase::Paused);
    }

    #[test]
    fn volume_mute_and_fullscreen() {
        let mut h = Harness::new(300.0);
        h.controller.set_volume(1.7);
        h.pump();
        assert_eq!(h.controller.state().volume, 1.0);

        assert!(h.controller.toggle_mute());
        h.controller.set_volume(0.4);
        h.pump();
        assert_eq!(h.controller.state().volume, 0.4);
        assert!(h.controller.state().is_muted);

        assert!(h.controller.toggle_fullscreen());
        assert!(!h.controller.toggle_fullscreen());
        h.pump();
        assert!(!h.controller.state().is_fullscreen);
    }

    #[test]
    fn denied_play_is_silent_failure() {
        let mut h = Harness::new(300.0);
        h.controller.element_mut().set_autoplay_allowed(false);
        assert_eq!(h.controller.play(), Err(MediaError::PlaybackDenied));
        assert!(h.pump().is_empty());
        assert!(!h.controller.state().is_playing);
        assert!(!h.controller.is_playing());
    }
}
