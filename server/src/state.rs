use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::{MemberSummary, SyncAction, SyncMessage};

const LOG_TAG: &str = "[Party Server]";
const DEFAULT_CAPACITY: usize = 12;
const MIN_CAPACITY: usize = 2;
const MAX_CAPACITY: usize = 32;

/// Room tracked by the relay
#[derive(Debug, Clone)]
pub struct Room {
    pub host_id: Option<Uuid>,
    pub passcode_hash: Option<String>,
    pub capacity: usize,
    pub last_sync: Option<RecordedSync>,
}

/// Last playback state the host broadcast, with the wall clock it was recorded at
#[derive(Debug, Clone, Copy)]
pub struct RecordedSync {
    pub message: SyncMessage,
    pub recorded_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub room_id: Option<String>,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("Room not found")]
    NotFound,
    #[error("Room is full")]
    Full { capacity: usize },
    #[error("Passcode required")]
    PasscodeRequired,
    #[error("Invalid passcode")]
    InvalidPasscode,
    #[error("Session token invalid or expired")]
    InvalidToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncRejected {
    #[error("Join a room before sending playback updates")]
    NotInRoom,
    #[error("Only the host may control playback")]
    NotHost,
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub room_id: String,
    pub is_host: bool,
    pub passcode_enabled: bool,
    pub capacity: usize,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub room_id: String,
    pub room_closed: bool,
    /// Set when the departing client was host and someone else took over
    pub promoted_host: Option<Uuid>,
}

#[derive(Clone)]
pub struct ResumeRecord {
    pub client_id: Uuid,
    pub room_id: String,
    pub display_name: Option<String>,
}

/// Shared server state
#[derive(Clone, Default)]
pub struct ServerState {
    /// All active rooms: room_id -> Room
    pub rooms: Arc<DashMap<String, Room>>,
    /// All connected clients: client_id -> ClientInfo
    pub clients: Arc<DashMap<Uuid, ClientInfo>>,
    /// Room membership in join order: room_id -> Vec<client_id>
    pub room_members: Arc<DashMap<String, Arc<RwLock<Vec<Uuid>>>>>,
    /// Resume tokens issued for reconnect support
    resume_tokens: Arc<DashMap<String, ResumeRecord>>,
    /// Mapping of client id to the last token we issued
    client_tokens: Arc<DashMap<Uuid, String>>,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_room(
        &self,
        host_id: Uuid,
        passcode: Option<String>,
        display_name: Option<String>,
        capacity: Option<usize>,
    ) -> JoinOutcome {
        let room_id = self.generate_room_code();
        let passcode_hash = passcode
            .filter(|code| !code.is_empty())
            .map(|code| Self::hash_passcode(&code, &room_id));
        let assigned_name = self.apply_display_name(host_id, display_name);
        let room_capacity = Self::normalize_capacity(capacity);
        let passcode_enabled = passcode_hash.is_some();

        self.rooms.insert(
            room_id.clone(),
            Room {
                host_id: Some(host_id),
                passcode_hash,
                capacity: room_capacity,
                last_sync: None,
            },
        );
        self.room_members
            .insert(room_id.clone(), Arc::new(RwLock::new(vec![host_id])));

        if let Some(mut client) = self.clients.get_mut(&host_id) {
            client.room_id = Some(room_id.clone());
        }

        tracing::info!("{LOG_TAG} Room {} created by client {}", room_id, host_id);
        JoinOutcome {
            room_id,
            is_host: true,
            passcode_enabled,
            capacity: room_capacity,
            display_name: assigned_name,
        }
    }

    pub async fn join_room(
        &self,
        client_id: Uuid,
        room_id: &str,
        passcode: Option<String>,
        display_name: Option<String>,
    ) -> Result<JoinOutcome, JoinError> {
        let (capacity, passcode_enabled) = {
            let room = self.rooms.get(room_id).ok_or(JoinError::NotFound)?;
            if let Some(expected) = &room.passcode_hash {
                let provided = passcode
                    .as_ref()
                    .filter(|code| !code.is_empty())
                    .ok_or(JoinError::PasscodeRequired)?;
                if &Self::hash_passcode(provided, room_id) != expected {
                    return Err(JoinError::InvalidPasscode);
                }
            }
            (room.capacity, room.passcode_hash.is_some())
        };

        self.add_member(client_id, room_id, Some(capacity)).await?;
        let is_host = self.claim_host_if_vacant(room_id, client_id);
        let assigned_name = self.apply_display_name(client_id, display_name);

        tracing::info!("{LOG_TAG} Client {} joined room {}", client_id, room_id);
        Ok(JoinOutcome {
            room_id: room_id.to_string(),
            is_host,
            passcode_enabled,
            capacity,
            display_name: assigned_name,
        })
    }

    /// Remove the client from its room, promoting the longest-present member if the host left.
    pub async fn leave_room(&self, client_id: Uuid) -> Option<LeaveOutcome> {
        let room_id = self.clients.get(&client_id).and_then(|c| c.room_id.clone())?;

        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.room_id = None;
        }

        let remaining = match self.room_members.get(&room_id) {
            Some(members_ref) => {
                let members_lock = Arc::clone(&*members_ref);
                drop(members_ref);
                let mut members = members_lock.write().await;
                members.retain(|id| *id != client_id);
                members.clone()
            }
            None => Vec::new(),
        };

        if remaining.is_empty() {
            self.room_members.remove(&room_id);
            self.rooms.remove(&room_id);
            self.clear_tokens_for_room(&room_id);
            tracing::info!("{LOG_TAG} Room {} deleted (empty)", room_id);
            return Some(LeaveOutcome {
                room_id,
                room_closed: true,
                promoted_host: None,
            });
        }

        let mut promoted_host = None;
        if let Some(mut room) = self.rooms.get_mut(&room_id) {
            if room.host_id == Some(client_id) {
                room.host_id = remaining.first().copied();
                promoted_host = room.host_id;
            }
        }

        if let Some(new_host) = promoted_host {
            tracing::info!(
                "{LOG_TAG} Host {} left room {}; promoted {}",
                client_id,
                room_id,
                new_host
            );
        } else {
            tracing::info!("{LOG_TAG} Client {} left room {}", client_id, room_id);
        }

        Some(LeaveOutcome {
            room_id,
            room_closed: false,
            promoted_host,
        })
    }

    pub async fn get_room_members(&self, room_id: &str) -> Vec<Uuid> {
        if let Some(members_ref) = self.room_members.get(room_id) {
            let members_lock = Arc::clone(&*members_ref);
            drop(members_ref);
            let members = members_lock.read().await;
            members.clone()
        } else {
            Vec::new()
        }
    }

    pub fn add_client(&self, client_id: Uuid, display_name: Option<String>) {
        let display_name = display_name
            .and_then(|name| Self::sanitize_display_name(&name))
            .unwrap_or_else(|| Self::default_display_name(client_id));
        self.clients.insert(
            client_id,
            ClientInfo {
                room_id: None,
                display_name,
            },
        );
        tracing::info!("{LOG_TAG} Client {} connected", client_id);
    }

    pub async fn remove_client(&self, client_id: Uuid) -> Option<LeaveOutcome> {
        let outcome = self.leave_room(client_id).await;
        self.clients.remove(&client_id);
        tracing::info!("{LOG_TAG} Client {} disconnected", client_id);
        outcome
    }

    pub fn room_of(&self, client_id: Uuid) -> Option<String> {
        self.clients.get(&client_id).and_then(|c| c.room_id.clone())
    }

    pub fn host_of(&self, room_id: &str) -> Option<Uuid> {
        self.rooms.get(room_id).and_then(|room| room.host_id)
    }

    /// Accept a playback update from the room's host and remember it for catch-up.
    pub fn record_sync(&self, client_id: Uuid, message: SyncMessage) -> Result<String, SyncRejected> {
        self.record_sync_at(client_id, message, current_unix_millis())
    }

    fn record_sync_at(
        &self,
        client_id: Uuid,
        message: SyncMessage,
        now_ms: u64,
    ) -> Result<String, SyncRejected> {
        let room_id = self.room_of(client_id).ok_or(SyncRejected::NotInRoom)?;
        let mut room = self.rooms.get_mut(&room_id).ok_or(SyncRejected::NotInRoom)?;
        if room.host_id != Some(client_id) {
            return Err(SyncRejected::NotHost);
        }
        room.last_sync = Some(RecordedSync {
            message,
            recorded_at_ms: now_ms,
        });
        Ok(room_id)
    }

    /// Current playback state of the room, projected forward if the host is playing.
    pub fn catch_up(&self, room_id: &str) -> Option<SyncMessage> {
        self.catch_up_at(room_id, current_unix_millis())
    }

    fn catch_up_at(&self, room_id: &str, now_ms: u64) -> Option<SyncMessage> {
        let recorded = self.rooms.get(room_id)?.last_sync?;
        let mut message = recorded.message;
        if message.action == SyncAction::Play {
            let elapsed_ms = now_ms.saturating_sub(recorded.recorded_at_ms);
            message.current_time += elapsed_ms as f64 / 1000.0;
        }
        message.timestamp = now_ms;
        Some(message)
    }

    pub fn remember_session(&self, client_id: Uuid, room_id: &str) -> String {
        let token = Uuid::new_v4().to_string();
        if let Some(previous) = self.client_tokens.insert(client_id, token.clone()) {
            self.resume_tokens.remove(&previous);
        }

        let display_name = self.clients.get(&client_id).map(|c| c.display_name.clone());

        self.resume_tokens.insert(
            token.clone(),
            ResumeRecord {
                client_id,
                room_id: room_id.to_string(),
                display_name,
            },
        );

        token
    }

    pub fn clear_session(&self, client_id: Uuid) {
        if let Some((_, token)) = self.client_tokens.remove(&client_id) {
            self.resume_tokens.remove(&token);
        }
    }

    fn clear_tokens_for_room(&self, room_id: &str) {
        let tokens: Vec<String> = self
            .resume_tokens
            .iter()
            .filter(|entry| entry.value().room_id == room_id)
            .map(|entry| entry.key().clone())
            .collect();

        for token in tokens {
            if let Some((_, record)) = self.resume_tokens.remove(&token) {
                self.client_tokens.remove(&record.client_id);
            }
        }
    }

    /// Rejoin a room with a token from a previous connection.
    ///
    /// The former host only gets the role back if nobody holds it now.
    pub async fn resume_session(
        &self,
        client_id: Uuid,
        token: &str,
        display_name: Option<String>,
    ) -> Result<JoinOutcome, JoinError> {
        let record = self
            .resume_tokens
            .remove(token)
            .map(|(_, rec)| rec)
            .ok_or(JoinError::InvalidToken)?;
        self.client_tokens.remove(&record.client_id);

        let (capacity, passcode_enabled) = self
            .rooms
            .get(&record.room_id)
            .map(|room| (room.capacity, room.passcode_hash.is_some()))
            .ok_or(JoinError::NotFound)?;

        // Resuming never counts against capacity; the slot was ours before the drop.
        self.add_member(client_id, &record.room_id, None).await?;
        let is_host = self.claim_host_if_vacant(&record.room_id, client_id);
        let resolved_name = self.apply_display_name(client_id, display_name.or(record.display_name));

        tracing::info!(
            "{LOG_TAG} Client {} resumed session in room {} (previously {})",
            client_id,
            record.room_id,
            record.client_id
        );
        Ok(JoinOutcome {
            room_id: record.room_id,
            is_host,
            passcode_enabled,
            capacity,
            display_name: resolved_name,
        })
    }

    async fn add_member(
        &self,
        client_id: Uuid,
        room_id: &str,
        capacity: Option<usize>,
    ) -> Result<(), JoinError> {
        let members_lock = self
            .room_members
            .get(room_id)
            .map(|members| Arc::clone(&*members))
            .ok_or(JoinError::NotFound)?;
        let mut members = members_lock.write().await;
        if !members.contains(&client_id) {
            if let Some(capacity) = capacity {
                if members.len() >= capacity {
                    return Err(JoinError::Full { capacity });
                }
            }
            members.push(client_id);
        }
        drop(members);

        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.room_id = Some(room_id.to_string());
        }
        Ok(())
    }

    fn claim_host_if_vacant(&self, room_id: &str, client_id: Uuid) -> bool {
        match self.rooms.get_mut(room_id) {
            Some(mut room) => {
                if room.host_id.is_none() {
                    room.host_id = Some(client_id);
                }
                room.host_id == Some(client_id)
            }
            None => false,
        }
    }

    fn generate_room_code(&self) -> String {
        loop {
            let raw = (Uuid::new_v4().as_u128() % 1_000_000) as u32;
            let code = format!("{:03}-{:03}", raw / 1000, raw % 1000);
            if !self.rooms.contains_key(&code) {
                break code;
            }
        }
    }

    fn hash_passcode(passcode: &str, room_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(room_id.as_bytes());
        hasher.update(passcode.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn apply_display_name(&self, client_id: Uuid, provided: Option<String>) -> String {
        let sanitized = provided.and_then(|value| Self::sanitize_display_name(&value));
        let resolved = sanitized
            .or_else(|| {
                self.clients
                    .get(&client_id)
                    .map(|info| info.display_name.clone())
            })
            .unwrap_or_else(|| Self::default_display_name(client_id));

        self.clients
            .entry(client_id)
            .and_modify(|client| client.display_name = resolved.clone())
            .or_insert_with(|| ClientInfo {
                room_id: None,
                display_name: resolved.clone(),
            });

        resolved
    }

    pub fn sanitize_display_name(raw: &str) -> Option<String> {
        let cleaned: String = raw
            .trim()
            .chars()
            .filter(|ch| !ch.is_control())
            .take(32)
            .collect();
        if cleaned.is_empty() {
            None
        } else {
            Some(cleaned)
        }
    }

    fn default_display_name(client_id: Uuid) -> String {
        let short = &client_id.to_string()[..8];
        format!("Guest {short}")
    }

    fn normalize_capacity(requested: Option<usize>) -> usize {
        requested
            .map(|value| value.clamp(MIN_CAPACITY, MAX_CAPACITY))
            .unwrap_or(DEFAULT_CAPACITY)
    }

    pub async fn room_snapshot(&self, room_id: &str) -> Option<(Vec<MemberSummary>, usize)> {
        let (host_id, capacity) = self
            .rooms
            .get(room_id)
            .map(|room| (room.host_id, room.capacity))?;
        let members = self.get_room_members(room_id).await;
        let roster = members
            .into_iter()
            .map(|member_id| MemberSummary {
                client_id: member_id,
                display_name: self
                    .clients
                    .get(&member_id)
                    .map(|info| info.display_name.clone())
                    .unwrap_or_else(|| Self::default_display_name(member_id)),
                is_host: Some(member_id) == host_id,
            })
            .collect();
        Some((roster, capacity))
    }
}

pub fn current_unix_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or(0)
}
