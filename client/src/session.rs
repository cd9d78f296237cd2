//! One client's membership in a watch party.
//!
//! [`WatchSession`] is the only owner of the media controller and the
//! synchronizer. Media events, inbound envelopes, connection changes and user
//! commands all reach it over channels and are handled one at a time.

use anyhow::Result;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use crate::channel::SyncChannel;
use crate::connection::ConnectionStatus;
use crate::constants::MEDIA_POLL_INTERVAL_MS;
use crate::controls::{ControlCommand, ControlOutcome, PlayerControls};
use crate::media::{MediaController, MediaElement, MediaError, MediaEvent};
use crate::playback::PlaybackState;
use crate::protocol::{ClientRequest, Envelope, MemberSummary, RoomJoined, ServerEvent};
use crate::storage::{PersistedSession, SessionStore};
use crate::synchronizer::{Role, SyncOutcome, SyncStats, Synchronizer};

/// Room to enter whenever the socket (re)connects and there is nothing to resume
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinTarget {
    Create {
        passcode: Option<String>,
        capacity: Option<usize>,
    },
    Join {
        room_id: String,
        passcode: Option<String>,
    },
    /// Only resume the saved session
    Resume,
}

#[derive(Debug)]
pub enum SessionCommand {
    Control(ControlCommand),
    RequestSync,
    Leave,
    Report(oneshot::Sender<SessionReport>),
    Shutdown,
}

/// Things the user should hear about
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Joined {
        room_id: String,
        role: Role,
        passcode_enabled: bool,
    },
    Left,
    Rejected(String),
    Members(Vec<MemberSummary>),
    RoleChanged(Role),
    Synced(SyncOutcome),
    ControlDisabled(ControlCommand),
    MediaFailed(MediaError),
    ServerError(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub room_id: Option<String>,
    pub client_id: Option<Uuid>,
    pub role: Role,
    pub passcode_enabled: bool,
    pub members: Vec<MemberSummary>,
    pub playback: PlaybackState,
    pub sync: SyncStats,
    pub connection: ConnectionStatus,
}

/// The caller's side of a running session
pub struct SessionHandle {
    pub commands: mpsc::UnboundedSender<SessionCommand>,
    pub updates: mpsc::UnboundedReceiver<SessionUpdate>,
}

impl SessionHandle {
    pub fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub async fn report(&self) -> Option<SessionReport> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(SessionCommand::Report(tx)).ok()?;
        rx.await.ok()
    }
}

pub struct WatchSession<E: MediaElement> {
    controller: MediaController<E>,
    media_events: mpsc::UnboundedReceiver<MediaEvent>,
    synchronizer: Synchronizer,
    controls: PlayerControls,
    channel: SyncChannel,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    status_rx: watch::Receiver<ConnectionStatus>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    store: SessionStore,
    target: JoinTarget,
    display_name: Option<String>,
    client_id: Option<Uuid>,
    passcode_enabled: bool,
    members: Vec<MemberSummary>,
    resuming: bool,
}

impl<E: MediaElement> WatchSession<E> {
    pub fn new(
        controller: MediaController<E>,
        media_events: mpsc::UnboundedReceiver<MediaEvent>,
        channel: SyncChannel,
        status_rx: watch::Receiver<ConnectionStatus>,
        store: SessionStore,
        target: JoinTarget,
        display_name: Option<String>,
    ) -> (Self, SessionHandle) {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        channel.on_message(move |envelope| {
            let _ = inbound_tx.send(envelope);
        });
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (updates, updates_rx) = mpsc::unbounded_channel();

        let session = Self {
            controller,
            media_events,
            synchronizer: Synchronizer::new(Role::Viewer),
            controls: PlayerControls::new(Role::Viewer),
            channel,
            inbound,
            status_rx,
            commands,
            updates,
            store,
            target,
            display_name,
            client_id: None,
            passcode_enabled: false,
            members: Vec::new(),
            resuming: false,
        };
        let handle = SessionHandle {
            commands: commands_tx,
            updates: updates_rx,
        };
        (session, handle)
    }

    pub async fn run(mut self) -> Result<()> {
        let mut ticker = interval(Duration::from_millis(MEDIA_POLL_INTERVAL_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        if self.status_rx.borrow_and_update().is_connected() {
            self.enter_room();
        }

        loop {
            tokio::select! {
                Some(event) = self.media_events.recv() => self.on_media_event(event),
                Some(envelope) = self.inbound.recv() => self.on_envelope(envelope),
                changed = self.status_rx.changed() => {
                    if changed.is_err() {
                        tracing::info!("Connection loop stopped; ending session");
                        break;
                    }
                    let connected = self.status_rx.borrow_and_update().is_connected();
                    if connected {
                        self.enter_room();
                    }
                }
                command = self.commands.recv() => match command {
                    None | Some(SessionCommand::Shutdown) => break,
                    Some(command) => self.on_command(command),
                },
                _ = ticker.tick() => self.controller.poll(),
            }
        }
        Ok(())
    }

    fn on_media_event(&mut self, event: MediaEvent) {
        self.controller.handle_event(&event);
        if let MediaEvent::Error { message } = &event {
            self.notify(SessionUpdate::MediaFailed(MediaError::Decode(message.clone())));
        }

        let Some(message) = self.synchronizer.on_local_event(&event) else {
            return;
        };
        if let Some(room_id) = self.synchronizer.room_id() {
            if let Err(e) = self.channel.send_sync(room_id, &message) {
                tracing::warn!("Failed to send video_sync: {:#}", e);
            }
        }
    }

    fn on_envelope(&mut self, envelope: Envelope) {
        let event = match ServerEvent::from_envelope(&envelope) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!("Ignoring server message: {}", e);
                return;
            }
        };

        match event {
            ServerEvent::RoomJoined(joined) => self.on_joined(joined),
            ServerEvent::RoomLeft => {
                self.forget_room();
                self.notify(SessionUpdate::Left);
            }
            ServerEvent::RoomNotFound => self.on_rejected("room not found".to_string()),
            ServerEvent::RoomFull { capacity } => {
                self.on_rejected(format!("room is full ({capacity} members)"))
            }
            ServerEvent::Error { message } => {
                if self.resuming {
                    self.on_rejected(message);
                } else {
                    tracing::warn!("Server error: {}", message);
                    self.notify(SessionUpdate::ServerError(message));
                }
            }
            ServerEvent::MemberUpdate { members, .. } => {
                self.members = members.clone();
                self.notify(SessionUpdate::Members(members));
            }
            ServerEvent::HostChanged { host_id, .. } => {
                let role = if Some(host_id) == self.client_id {
                    Role::Host
                } else {
                    Role::Viewer
                };
                if role != self.synchronizer.role() {
                    self.set_role(role);
                    self.persist(|saved| saved.is_host = role == Role::Host);
                    self.notify(SessionUpdate::RoleChanged(role));
                }
            }
            ServerEvent::VideoSync { .. } => {
                if let Some(outcome) = self.synchronizer.on_message(&envelope, &mut self.controller)
                {
                    self.notify(SessionUpdate::Synced(outcome));
                }
            }
        }
    }

    fn on_joined(&mut self, joined: RoomJoined) {
        let role = if joined.is_host {
            Role::Host
        } else {
            Role::Viewer
        };
        tracing::info!(
            room = %joined.room_id,
            client = %joined.client_id,
            ?role,
            "Joined room"
        );
        self.resuming = false;
        self.client_id = Some(joined.client_id);
        self.passcode_enabled = joined.passcode_enabled;
        self.synchronizer.set_room(Some(joined.room_id.clone()));
        self.set_role(role);

        let saved = PersistedSession {
            room_id: joined.room_id.clone(),
            resume_token: joined.resume_token,
            is_host: joined.is_host,
        };
        if let Err(e) = self.store.save(&saved) {
            tracing::warn!("Failed to persist session: {:#}", e);
        }

        self.notify(SessionUpdate::Joined {
            room_id: joined.room_id,
            role,
            passcode_enabled: joined.passcode_enabled,
        });
    }

    fn on_rejected(&mut self, reason: String) {
        if self.resuming {
            self.resuming = false;
            tracing::info!("Could not resume saved session: {}", reason);
            self.store.clear();
            if self.target != JoinTarget::Resume {
                self.send_join_target();
                return;
            }
        }
        self.notify(SessionUpdate::Rejected(reason));
    }

    /// Resume the saved session if there is one, otherwise head for the target room
    fn enter_room(&mut self) {
        if let Some(saved) = self.store.load() {
            tracing::info!("Resuming session in room {}", saved.room_id);
            self.resuming = true;
            self.send(ClientRequest::ResumeSession {
                token: saved.resume_token,
                display_name: self.display_name.clone(),
            });
            return;
        }
        self.send_join_target();
    }

    fn send_join_target(&mut self) {
        let request = match &self.target {
            JoinTarget::Create { passcode, capacity } => ClientRequest::CreateRoom {
                passcode: passcode.clone(),
                display_name: self.display_name.clone(),
                capacity: *capacity,
            },
            JoinTarget::Join { room_id, passcode } => ClientRequest::JoinRoom {
                room_id: room_id.clone(),
                passcode: passcode.clone(),
                display_name: self.display_name.clone(),
            },
            JoinTarget::Resume => {
                self.notify(SessionUpdate::Rejected("no saved session to resume".into()));
                return;
            }
        };
        self.send(request);
    }

    fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Control(control) => {
                match self.controls.dispatch(control, &mut self.controller) {
                    Ok(ControlOutcome::Applied) => {}
                    Ok(ControlOutcome::Disabled) => {
                        self.notify(SessionUpdate::ControlDisabled(control))
                    }
                    Err(e) => self.notify(SessionUpdate::MediaFailed(e)),
                }
            }
            SessionCommand::RequestSync => self.send(ClientRequest::RequestSync {}),
            SessionCommand::Leave => {
                self.send(ClientRequest::LeaveRoom {});
                self.store.clear();
            }
            SessionCommand::Report(reply) => {
                let _ = reply.send(self.report());
            }
            SessionCommand::Shutdown => {}
        }
    }

    fn report(&self) -> SessionReport {
        SessionReport {
            room_id: self.synchronizer.room_id().map(str::to_string),
            client_id: self.client_id,
            role: self.synchronizer.role(),
            passcode_enabled: self.passcode_enabled,
            members: self.members.clone(),
            playback: self.controller.snapshot(),
            sync: self.synchronizer.stats(),
            connection: self.status_rx.borrow().clone(),
        }
    }

    fn set_role(&mut self, role: Role) {
        self.synchronizer.set_role(role);
        self.controls.set_role(role);
    }

    fn forget_room(&mut self) {
        self.store.clear();
        self.synchronizer.set_room(None);
        self.set_role(Role::Viewer);
        self.client_id = None;
        self.members.clear();
    }

    fn persist(&self, update: impl FnOnce(&mut PersistedSession)) {
        let Some(mut saved) = self.store.load() else {
            return;
        };
        update(&mut saved);
        if let Err(e) = self.store.save(&saved) {
            tracing::warn!("Failed to persist session: {:#}", e);
        }
    }

    fn send(&self, request: ClientRequest) {
        if let Err(e) = self.channel.send_request(&request) {
            tracing::warn!("Failed to send {}: {:#}", request.kind(), e);
        }
    }

    fn notify(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }
}
