use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::{MediaElement, MediaError, MediaEvent};

/// Monotonic time source for [`SimulatedElement`]
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to
#[derive(Clone, Default)]
pub struct ManualClock {
    elapsed: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        *self.elapsed.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.elapsed.lock()
    }
}

/// Headless media element that plays a virtual video of fixed length.
///
/// Position advances with the clock while unpaused and stops at the end of
/// the buffered range, where the element reports `waiting` until more data
/// is made available with [`SimulatedElement::set_buffered`].
pub struct SimulatedElement {
    clock: Arc<dyn Clock>,
    events: mpsc::UnboundedSender<MediaEvent>,
    media_duration: f64,
    loaded: bool,
    // Position captured at `anchor`
    position: f64,
    anchor: Duration,
    playing: bool,
    stalled: bool,
    ended: bool,
    volume: f64,
    muted: bool,
    fullscreen: bool,
    buffered: f64,
    autoplay_allowed: bool,
}

impl SimulatedElement {
    pub fn new(
        clock: Arc<dyn Clock>,
        media_duration: f64,
    ) -> (Self, mpsc::UnboundedReceiver<MediaEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let element = Self {
            anchor: clock.now(),
            clock,
            events,
            media_duration: media_duration.max(0.0),
            loaded: false,
            position: 0.0,
            playing: false,
            stalled: false,
            ended: false,
            volume: 1.0,
            muted: false,
            fullscreen: false,
            buffered: 1.0,
            autoplay_allowed: true,
        };
        (element, rx)
    }

    /// Make `play()` fail the way a browser autoplay policy does
    pub fn set_autoplay_allowed(&mut self, allowed: bool) {
        self.autoplay_allowed = allowed;
    }

    pub fn set_buffered(&mut self, fraction: f64) {
        self.capture();
        self.buffered = fraction.clamp(0.0, 1.0);
        self.emit(MediaEvent::Progress {
            buffered: self.buffered,
        });
        if self.stalled && self.playable_end() > self.position {
            self.stalled = false;
            self.anchor = self.clock.now();
            self.emit(MediaEvent::CanPlay);
        }
    }

    /// Simulate a fatal decode error
    pub fn fail(&mut self, message: &str) {
        self.capture();
        self.playing = false;
        self.emit(MediaEvent::Error {
            message: message.to_string(),
        });
    }

    fn playable_end(&self) -> f64 {
        self.media_duration * self.buffered
    }

    fn running(&self) -> bool {
        self.loaded && self.playing && !self.stalled
    }

    fn capture(&mut self) {
        self.position = self.current_time();
        self.anchor = self.clock.now();
    }

    fn emit(&self, event: MediaEvent) {
        let _ = self.events.send(event);
    }
}

impl MediaElement for SimulatedElement {
    fn load(&mut self, _source: &str) -> Result<(), MediaError> {
        self.loaded = true;
        self.playing = false;
        self.stalled = false;
        self.ended = false;
        self.position = 0.0;
        self.anchor = self.clock.now();
        self.emit(MediaEvent::LoadStart);
        self.emit(MediaEvent::LoadedMetadata {
            duration: self.media_duration,
        });
        self.emit(MediaEvent::Progress {
            buffered: self.buffered,
        });
        self.emit(MediaEvent::CanPlay);
        Ok(())
    }

    fn play(&mut self) -> Result<(), MediaError> {
        if !self.loaded {
            return Err(MediaError::NotLoaded);
        }
        if !self.autoplay_allowed {
            return Err(MediaError::PlaybackDenied);
        }
        if self.playing {
            return Ok(());
        }
        if self.ended {
            self.ended = false;
            self.position = 0.0;
        }
        self.anchor = self.clock.now();
        self.playing = true;
        self.emit(MediaEvent::Play {
            time: self.position,
        });
        Ok(())
    }

    fn pause(&mut self) {
        if !self.playing {
            return;
        }
        self.capture();
        self.playing = false;
        self.emit(MediaEvent::Pause {
            time: self.position,
        });
    }

    fn paused(&self) -> bool {
        !self.playing
    }

    fn current_time(&self) -> f64 {
        if !self.running() {
            return self.position;
        }
        let elapsed = self.clock.now().saturating_sub(self.anchor).as_secs_f64();
        (self.position + elapsed).min(self.playable_end())
    }

    fn set_current_time(&mut self, time: f64) {
        let target = time.clamp(0.0, self.media_duration);
        self.position = target;
        self.anchor = self.clock.now();
        self.ended = false;
        let was_stalled = self.stalled;
        self.stalled = self.playing && target >= self.playable_end() && self.buffered < 1.0;
        self.emit(MediaEvent::Seeked { time: target });
        if self.stalled && !was_stalled {
            self.emit(MediaEvent::Waiting);
        } else if was_stalled && !self.stalled {
            self.emit(MediaEvent::CanPlay);
        }
    }

    fn duration(&self) -> f64 {
        if self.loaded {
            self.media_duration
        } else {
            0.0
        }
    }

    fn volume(&self) -> f64 {
        self.volume
    }

    fn set_volume(&mut self, volume: f64) {
        self.volume = volume.clamp(0.0, 1.0);
        self.emit(MediaEvent::VolumeChange {
            volume: self.volume,
            muted: self.muted,
        });
    }

    fn muted(&self) -> bool {
        self.muted
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        self.emit(MediaEvent::VolumeChange {
            volume: self.volume,
            muted,
        });
    }

    fn fullscreen(&self) -> bool {
        self.fullscreen
    }

    fn set_fullscreen(&mut self, fullscreen: bool) {
        self.fullscreen = fullscreen;
        self.emit(MediaEvent::FullscreenChange { fullscreen });
    }

    fn buffered_fraction(&self) -> f64 {
        self.buffered
    }

    fn poll(&mut self) {
        if !self.running() {
            return;
        }
        let now = self.current_time();
        if now >= self.media_duration {
            self.position = self.media_duration;
            self.anchor = self.clock.now();
            self.playing = false;
            self.ended = true;
            self.emit(MediaEvent::TimeUpdate { time: now });
            self.emit(MediaEvent::Ended);
        } else if now >= self.playable_end() {
            self.capture();
            self.stalled = true;
            self.emit(MediaEvent::TimeUpdate { time: now });
            self.emit(MediaEvent::Waiting);
        } else {
            self.emit(MediaEvent::TimeUpdate { time: now });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<MediaEvent>) -> Vec<MediaEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn loaded(duration: f64) -> (SimulatedElement, mpsc::UnboundedReceiver<MediaEvent>, ManualClock) {
        let clock = ManualClock::default();
        let (mut element, mut rx) = SimulatedElement::new(Arc::new(clock.clone()), duration);
        element.load("test://video").unwrap();
        drain(&mut rx);
        (element, rx, clock)
    }

    #[test]
    fn advances_only_while_playing() {
        let (mut element, mut rx, clock) = loaded(60.0);
        clock.advance(Duration::from_secs(5));
        assert_eq!(element.current_time(), 0.0);

        element.play().unwrap();
        clock.advance(Duration::from_millis(2500));
        assert_eq!(element.current_time(), 2.5);

        element.pause();
        clock.advance(Duration::from_secs(10));
        assert_eq!(element.current_time(), 2.5);
        assert_eq!(
            drain(&mut rx),
            vec![MediaEvent::Play { time: 0.0 }, MediaEvent::Pause { time: 2.5 }]
        );
    }

    #[test]
    fn redundant_calls_emit_nothing() {
        let (mut element, mut rx, _clock) = loaded(60.0);
        element.pause();
        element.play().unwrap();
        element.play().unwrap();
        assert_eq!(drain(&mut rx), vec![MediaEvent::Play { time: 0.0 }]);
    }

    #[test]
    fn denied_autoplay_keeps_paused() {
        let (mut element, mut rx, _clock) = loaded(60.0);
        element.set_autoplay_allowed(false);
        assert_eq!(element.play(), Err(MediaError::PlaybackDenied));
        assert!(element.paused());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn stalls_at_buffered_end_and_recovers() {
        let (mut element, mut rx, clock) = loaded(100.0);
        element.set_buffered(0.1);
        element.play().unwrap();
        drain(&mut rx);

        clock.advance(Duration::from_secs(15));
        element.poll();
        assert_eq!(element.current_time(), 10.0);
        assert_eq!(
            drain(&mut rx),
            vec![MediaEvent::TimeUpdate { time: 10.0 }, MediaEvent::Waiting]
        );

        clock.advance(Duration::from_secs(3));
        assert_eq!(element.current_time(), 10.0);
        element.set_buffered(1.0);
        assert_eq!(
            drain(&mut rx),
            vec![MediaEvent::Progress { buffered: 1.0 }, MediaEvent::CanPlay]
        );
        clock.advance(Duration::from_secs(1));
        assert_eq!(element.current_time(), 11.0);
    }

    #[test]
    fn seeking_past_buffered_end_reports_waiting() {
        let (mut element, mut rx, clock) = loaded(100.0);
        element.set_buffered(0.2);
        element.play().unwrap();
        drain(&mut rx);

        element.set_current_time(50.0);
        assert_eq!(
            drain(&mut rx),
            vec![MediaEvent::Seeked { time: 50.0 }, MediaEvent::Waiting]
        );
        clock.advance(Duration::from_secs(4));
        assert_eq!(element.current_time(), 50.0);

        element.set_current_time(5.0);
        assert_eq!(
            drain(&mut rx),
            vec![MediaEvent::Seeked { time: 5.0 }, MediaEvent::CanPlay]
        );
        clock.advance(Duration::from_secs(1));
        assert_eq!(element.current_time(), 6.0);
    }

    #[test]
    fn reaching_the_end_emits_ended() {
        let (mut element, mut rx, clock) = loaded(10.0);
        element.play().unwrap();
        clock.advance(Duration::from_secs(12));
        element.poll();
        assert!(element.paused());
        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&MediaEvent::Ended));
        assert_eq!(element.current_time(), 10.0);
    }
}
