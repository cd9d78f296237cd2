use crate::media::{MediaController, MediaElement, MediaError};
use crate::playback::PlaybackState;
use crate::synchronizer::Role;

/// User-facing player commands
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    TogglePlay,
    Play,
    Pause,
    Seek(f64),
    Skip(f64),
    SetVolume(f64),
    ToggleMute,
    ToggleFullscreen,
}

impl ControlCommand {
    /// Commands that move the shared playback clock
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::TogglePlay | Self::Play | Self::Pause | Self::Seek(_) | Self::Skip(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlOutcome {
    Applied,
    /// Transport is read-only for viewers
    Disabled,
}

/// What a control bar should render
#[derive(Debug, Clone, PartialEq)]
pub struct ControlsView {
    pub transport_disabled: bool,
    pub playback: PlaybackState,
}

/// Transport controls gated by the local role.
///
/// Viewers only follow the host, so every transport command is a no-op for
/// them; volume, mute and fullscreen stay local and always work.
#[derive(Debug, Clone, Copy)]
pub struct PlayerControls {
    role: Role,
}

impl PlayerControls {
    pub fn new(role: Role) -> Self {
        Self { role }
    }

    pub fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    pub fn transport_disabled(&self) -> bool {
        self.role != Role::Host
    }

    pub fn view<E: MediaElement>(&self, controller: &MediaController<E>) -> ControlsView {
        ControlsView {
            transport_disabled: self.transport_disabled(),
            playback: controller.snapshot(),
        }
    }

    pub fn dispatch<E: MediaElement>(
        &self,
        command: ControlCommand,
        controller: &mut MediaController<E>,
    ) -> Result<ControlOutcome, MediaError> {
        if command.is_transport() && self.transport_disabled() {
            tracing::debug!("Ignoring {:?}: transport is disabled for viewers", command);
            return Ok(ControlOutcome::Disabled);
        }

        match command {
            ControlCommand::TogglePlay if controller.is_playing() => controller.pause(),
            ControlCommand::TogglePlay | ControlCommand::Play => controller.play()?,
            ControlCommand::Pause => controller.pause(),
            ControlCommand::Seek(time) => {
                controller.seek(time);
            }
            ControlCommand::Skip(delta) => {
                controller.skip(delta);
            }
            ControlCommand::SetVolume(volume) => controller.set_volume(volume),
            ControlCommand::ToggleMute => {
                controller.toggle_mute();
            }
            ControlCommand::ToggleFullscreen => {
                controller.toggle_fullscreen();
            }
        }
        Ok(ControlOutcome::Applied)
    }
}
