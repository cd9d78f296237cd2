use crate::constants::{DRIFT_WARN_STREAK, SYNC_TOLERANCE_SECS};
use crate::media::{MediaController, MediaElement, MediaEvent};
use crate::protocol::{Envelope, SyncAction, SyncMessage, VIDEO_SYNC};
use crate::utils::current_unix_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Viewer,
}

/// What applying one remote update did to the local player
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncOutcome {
    pub action: SyncAction,
    pub drift: f64,
    /// Local time was forced to the host position
    pub corrected: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SyncStats {
    pub sent: u64,
    pub applied: u64,
    pub corrections: u64,
    pub correction_streak: u32,
    pub max_drift: f64,
    pub last_drift: Option<f64>,
}

/// Bridges local playback events and the room's `video_sync` traffic.
///
/// Hosts turn `play`, `pause` and `seeked` into outbound messages; viewers
/// apply inbound messages last-write-wins, correcting position only when the
/// drift exceeds the tolerance.
pub struct Synchronizer {
    role: Role,
    room_id: Option<String>,
    tolerance: f64,
    stats: SyncStats,
}

impl Synchronizer {
    pub fn new(role: Role) -> Self {
        Self::with_tolerance(role, SYNC_TOLERANCE_SECS)
    }

    pub fn with_tolerance(role: Role, tolerance: f64) -> Self {
        Self {
            role,
            room_id: None,
            tolerance,
            stats: SyncStats::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn set_role(&mut self, role: Role) {
        if self.role != role {
            tracing::info!("Sync role {:?} -> {:?}", self.role, role);
            self.role = role;
            self.stats.correction_streak = 0;
        }
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn set_room(&mut self, room_id: Option<String>) {
        self.room_id = room_id;
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Host path: the message to broadcast for a local media event, if any.
    ///
    /// The message carries the position the event was emitted with, not the
    /// element's position now.
    pub fn on_local_event(&mut self, event: &MediaEvent) -> Option<SyncMessage> {
        if self.role != Role::Host {
            return None;
        }
        let (action, current_time) = match *event {
            MediaEvent::Play { time } => (SyncAction::Play, time),
            MediaEvent::Pause { time } => (SyncAction::Pause, time),
            MediaEvent::Seeked { time } => (SyncAction::Seek, time),
            _ => return None,
        };
        if self.room_id.is_none() {
            tracing::debug!("Not in a room; {:?} stays local", action);
            return None;
        }
        self.stats.sent += 1;
        Some(SyncMessage {
            action,
            current_time,
            timestamp: current_unix_millis(),
        })
    }

    /// Viewer path for any inbound channel message; everything except
    /// `video_sync` for the current room is ignored.
    pub fn on_message<E: MediaElement>(
        &mut self,
        envelope: &Envelope,
        controller: &mut MediaController<E>,
    ) -> Option<SyncOutcome> {
        if envelope.kind != VIDEO_SYNC {
            return None;
        }
        if let (Some(ours), Some(theirs)) = (self.room_id.as_deref(), envelope.room_id.as_deref()) {
            if ours != theirs {
                tracing::debug!("Ignoring video_sync for room {}", theirs);
                return None;
            }
        }
        match serde_json::from_value::<SyncMessage>(envelope.data.clone()) {
            Ok(message) => self.apply_remote(&message, controller),
            Err(e) => {
                tracing::warn!("Malformed video_sync payload: {}", e);
                None
            }
        }
    }

    pub fn apply_remote<E: MediaElement>(
        &mut self,
        message: &SyncMessage,
        controller: &mut MediaController<E>,
    ) -> Option<SyncOutcome> {
        if self.role != Role::Viewer {
            return None;
        }

        let drift = (controller.current_time() - message.current_time).abs();
        let corrected = drift > self.tolerance;

        match message.action {
            SyncAction::Seek => {
                controller.seek(message.current_time);
            }
            SyncAction::Play => {
                if corrected {
                    controller.seek(message.current_time);
                }
                if let Err(e) = controller.play() {
                    tracing::warn!("Could not follow host play at {:.3}s: {}", message.current_time, e);
                }
            }
            SyncAction::Pause => {
                if corrected {
                    controller.seek(message.current_time);
                }
                controller.pause();
            }
        }

        self.record_drift(drift, corrected);
        tracing::debug!(
            action = ?message.action,
            remote = message.current_time,
            drift,
            corrected,
            "Applied video_sync"
        );

        Some(SyncOutcome {
            action: message.action,
            drift,
            corrected,
        })
    }

    fn record_drift(&mut self, drift: f64, corrected: bool) {
        let stats = &mut self.stats;
        stats.applied += 1;
        stats.last_drift = Some(drift);
        stats.max_drift = stats.max_drift.max(drift);
        if !corrected {
            stats.correction_streak = 0;
            return;
        }
        stats.corrections += 1;
        stats.correction_streak += 1;
        if stats.correction_streak >= DRIFT_WARN_STREAK {
            tracing::warn!(
                room = self.room_id.as_deref().unwrap_or("-"),
                drift,
                streak = stats.correction_streak,
                "Playback keeps drifting past tolerance"
            );
        }
    }
}
