//! In-memory session registry
//!
//! Maps a six-digit code to the session's file metadata and its two
//! participant slots. Every mutation of one session goes through the map's
//! per-entry lock, so concurrent joins on the same code are linearized.
//! Expiry is checked on every access; an expired record is evicted the first
//! time anyone looks at it.

use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use shared_protocol::{FileMeta, ParticipantId, ParticipantRole, SessionCode};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{RegistryError, RegistryResult};

/// Attempts at drawing a free code before giving up
pub const MAX_CODE_ATTEMPTS: usize = 32;

/// Stored session state. Never holds file bytes or key material.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub file_meta: FileMeta,
    pub sender: Option<ParticipantId>,
    pub receiver: Option<ParticipantId>,
    pub created_at: Instant,
    /// Both participants have been present at once
    pub ready: bool,
}

impl SessionRecord {
    fn new(file_meta: FileMeta) -> Self {
        Self {
            file_meta,
            sender: None,
            receiver: None,
            created_at: Instant::now(),
            ready: false,
        }
    }

    pub fn slot(&self, role: ParticipantRole) -> Option<ParticipantId> {
        match role {
            ParticipantRole::Sender => self.sender,
            ParticipantRole::Receiver => self.receiver,
        }
    }

    fn slot_mut(&mut self, role: ParticipantRole) -> &mut Option<ParticipantId> {
        match role {
            ParticipantRole::Sender => &mut self.sender,
            ParticipantRole::Receiver => &mut self.receiver,
        }
    }

    fn role_of(&self, participant: ParticipantId) -> Option<ParticipantRole> {
        if self.sender == Some(participant) {
            Some(ParticipantRole::Sender)
        } else if self.receiver == Some(participant) {
            Some(ParticipantRole::Receiver)
        } else {
            None
        }
    }
}

/// Result of a join attempt on a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Bound; still waiting for the other participant
    Waiting,
    /// This join completed the room
    Ready {
        file_meta: FileMeta,
        sender: ParticipantId,
        receiver: ParticipantId,
    },
    /// The participant already holds this role
    AlreadyJoined,
    /// The role is taken or the room already started
    RoomFull,
}

/// Session registry, shared by the HTTP handlers and the relay
pub struct SessionRegistry {
    sessions: DashMap<SessionCode, SessionRecord>,
    lifetime: Duration,
    max_file_size: u64,
}

impl SessionRegistry {
    pub fn new(lifetime: Duration, max_file_size: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            lifetime,
            max_file_size,
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    fn is_expired(&self, record: &SessionRecord) -> bool {
        record.created_at.elapsed() > self.lifetime
    }

    /// Create a session under a fresh code
    pub fn create(&self, file_meta: FileMeta) -> RegistryResult<SessionCode> {
        file_meta.validate(self.max_file_size)?;
        let size = file_meta.size;

        let mut rng = rand::thread_rng();
        for _ in 0..MAX_CODE_ATTEMPTS {
            let Some(code) =
                SessionCode::from_number(rng.gen_range(SessionCode::MIN..=SessionCode::MAX))
            else {
                continue;
            };

            match self.sessions.entry(code) {
                Entry::Vacant(entry) => {
                    entry.insert(SessionRecord::new(file_meta));
                }
                Entry::Occupied(mut entry) if self.is_expired(entry.get()) => {
                    debug!("Reusing expired code {}", code);
                    entry.insert(SessionRecord::new(file_meta));
                }
                Entry::Occupied(_) => continue,
            }

            info!("Session {} created ({} bytes)", code, size);
            return Ok(code);
        }

        Err(RegistryError::CodeSpaceExhausted(MAX_CODE_ATTEMPTS))
    }

    /// Run `f` on a live record, evicting it if it has expired
    fn with_live<T>(
        &self,
        code: SessionCode,
        f: impl FnOnce(&mut SessionRecord) -> T,
    ) -> RegistryResult<T> {
        {
            let mut record = self.sessions.get_mut(&code).ok_or(RegistryError::NotFound)?;
            if !self.is_expired(&record) {
                return Ok(f(&mut record));
            }
        }

        self.sessions.remove_if(&code, |_, record| self.is_expired(record));
        debug!("Session {} expired, evicted", code);
        Err(RegistryError::Expired)
    }

    /// Snapshot of a live session
    pub fn get(&self, code: SessionCode) -> RegistryResult<SessionRecord> {
        self.with_live(code, |record| record.clone())
    }

    /// Time left before the session expires
    pub fn remaining(&self, code: SessionCode) -> RegistryResult<Duration> {
        self.with_live(code, |record| {
            self.lifetime.saturating_sub(record.created_at.elapsed())
        })
    }

    /// Remove a session. Idempotent; returns whether anything was removed.
    pub fn delete(&self, code: SessionCode) -> bool {
        let removed = self.sessions.remove(&code).is_some();
        if removed {
            info!("Session {} deleted", code);
        }
        removed
    }

    /// Bind `participant` to `role`, atomically with respect to other joins
    pub fn join(
        &self,
        code: SessionCode,
        role: ParticipantRole,
        participant: ParticipantId,
    ) -> RegistryResult<JoinOutcome> {
        self.with_live(code, |record| {
            if record.slot(role) == Some(participant) {
                return JoinOutcome::AlreadyJoined;
            }
            if record.ready || record.role_of(participant).is_some() {
                return JoinOutcome::RoomFull;
            }
            if record.slot(role).is_some() {
                return JoinOutcome::RoomFull;
            }

            *record.slot_mut(role) = Some(participant);

            match (record.sender, record.receiver) {
                (Some(sender), Some(receiver)) => {
                    record.ready = true;
                    JoinOutcome::Ready {
                        file_meta: record.file_meta.clone(),
                        sender,
                        receiver,
                    }
                }
                _ => JoinOutcome::Waiting,
            }
        })
    }

    /// The other participant of a session `participant` belongs to
    pub fn counterpart(
        &self,
        code: SessionCode,
        participant: ParticipantId,
    ) -> RegistryResult<Option<ParticipantId>> {
        self.with_live(code, |record| {
            record
                .role_of(participant)
                .map(|role| record.slot(role.counterpart()))
        })?
        .ok_or(RegistryError::NotParticipant)
    }

    /// Drop a disconnected participant from every session it joined
    ///
    /// Slots are freed only in rooms that never became ready. Returns the
    /// codes it was in, each with the participant left behind.
    pub fn release(&self, participant: ParticipantId) -> Vec<(SessionCode, Option<ParticipantId>)> {
        let mut affected = Vec::new();

        for mut entry in self.sessions.iter_mut() {
            let code = *entry.key();
            let record = entry.value_mut();
            let Some(role) = record.role_of(participant) else {
                continue;
            };

            let other = record.slot(role.counterpart());
            if !record.ready {
                *record.slot_mut(role) = None;
            }
            affected.push((code, other));
        }

        affected
    }

    /// Remove every expired session; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, record| !self.is_expired(record));
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIFETIME: Duration = Duration::from_secs(180);

    fn registry() -> SessionRegistry {
        SessionRegistry::new(LIFETIME, 1 << 30)
    }

    fn meta() -> FileMeta {
        FileMeta::new("notes.txt", 10, "text/plain")
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_lives_for_its_lifetime() {
        let registry = registry();
        let code = registry.create(meta()).unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        let record = registry.get(code).unwrap();
        assert_eq!(record.file_meta, meta());
        assert_eq!(registry.remaining(code).unwrap(), Duration::from_secs(179));

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        assert!(matches!(registry.get(code), Err(RegistryError::Expired)));
        // Evicted on the access above
        assert!(matches!(registry.get(code), Err(RegistryError::NotFound)));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_lifetime_is_still_valid() {
        let registry = registry();
        let code = registry.create(meta()).unwrap();

        tokio::time::advance(LIFETIME).await;
        assert!(registry.get(code).is_ok());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(registry.get(code).is_err());
    }

    #[test]
    fn test_unknown_code_is_not_found() {
        let registry = registry();
        let code = SessionCode::parse("123456").unwrap();
        assert!(matches!(registry.get(code), Err(RegistryError::NotFound)));
    }

    #[test]
    fn test_codes_are_six_digits_and_distinct() {
        let registry = registry();
        let mut codes = std::collections::HashSet::new();
        for _ in 0..200 {
            let code = registry.create(meta()).unwrap();
            assert_eq!(code.to_string().len(), 6);
            assert!(codes.insert(code));
        }
        assert_eq!(registry.len(), 200);
    }

    #[test]
    fn test_create_rejects_bad_meta() {
        let registry = SessionRegistry::new(LIFETIME, 100);
        assert!(matches!(
            registry.create(FileMeta::new("big.iso", 101, "")),
            Err(RegistryError::InvalidFileMeta(_))
        ));
        assert!(registry.create(FileMeta::new("", 1, "")).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let registry = registry();
        let code = registry.create(meta()).unwrap();
        assert!(registry.delete(code));
        assert!(!registry.delete(code));
        assert!(matches!(registry.get(code), Err(RegistryError::NotFound)));
    }

    #[test]
    fn test_join_reports_ready_once() {
        let registry = registry();
        let code = registry.create(meta()).unwrap();
        let sender = ParticipantId::new();
        let receiver = ParticipantId::new();

        assert_eq!(
            registry.join(code, ParticipantRole::Sender, sender).unwrap(),
            JoinOutcome::Waiting
        );
        assert_eq!(
            registry.join(code, ParticipantRole::Receiver, receiver).unwrap(),
            JoinOutcome::Ready {
                file_meta: meta(),
                sender,
                receiver,
            }
        );

        // Re-joins are no-ops, not a second readiness
        assert_eq!(
            registry.join(code, ParticipantRole::Receiver, receiver).unwrap(),
            JoinOutcome::AlreadyJoined
        );
        assert_eq!(
            registry.join(code, ParticipantRole::Sender, sender).unwrap(),
            JoinOutcome::AlreadyJoined
        );
    }

    #[test]
    fn test_rejoin_same_role_creates_no_second_slot() {
        let registry = registry();
        let code = registry.create(meta()).unwrap();
        let sender = ParticipantId::new();

        registry.join(code, ParticipantRole::Sender, sender).unwrap();
        assert_eq!(
            registry.join(code, ParticipantRole::Sender, sender).unwrap(),
            JoinOutcome::AlreadyJoined
        );

        let record = registry.get(code).unwrap();
        assert_eq!(record.sender, Some(sender));
        assert_eq!(record.receiver, None);
        assert!(!record.ready);
    }

    #[test]
    fn test_third_participant_gets_room_full() {
        let registry = registry();
        let code = registry.create(meta()).unwrap();
        registry.join(code, ParticipantRole::Sender, ParticipantId::new()).unwrap();

        // Occupied role
        assert_eq!(
            registry.join(code, ParticipantRole::Sender, ParticipantId::new()).unwrap(),
            JoinOutcome::RoomFull
        );

        registry.join(code, ParticipantRole::Receiver, ParticipantId::new()).unwrap();
        for role in [ParticipantRole::Sender, ParticipantRole::Receiver] {
            assert_eq!(
                registry.join(code, role, ParticipantId::new()).unwrap(),
                JoinOutcome::RoomFull
            );
        }
    }

    #[test]
    fn test_one_participant_cannot_hold_both_roles() {
        let registry = registry();
        let code = registry.create(meta()).unwrap();
        let participant = ParticipantId::new();

        registry.join(code, ParticipantRole::Sender, participant).unwrap();
        assert_eq!(
            registry.join(code, ParticipantRole::Receiver, participant).unwrap(),
            JoinOutcome::RoomFull
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_on_expired_session() {
        let registry = registry();
        let code = registry.create(meta()).unwrap();
        tokio::time::advance(Duration::from_secs(181)).await;

        assert!(matches!(
            registry.join(code, ParticipantRole::Receiver, ParticipantId::new()),
            Err(RegistryError::Expired)
        ));
    }

    #[test]
    fn test_counterpart_requires_membership() {
        let registry = registry();
        let code = registry.create(meta()).unwrap();
        let sender = ParticipantId::new();
        let receiver = ParticipantId::new();

        registry.join(code, ParticipantRole::Sender, sender).unwrap();
        assert_eq!(registry.counterpart(code, sender).unwrap(), None);

        registry.join(code, ParticipantRole::Receiver, receiver).unwrap();
        assert_eq!(registry.counterpart(code, sender).unwrap(), Some(receiver));
        assert_eq!(registry.counterpart(code, receiver).unwrap(), Some(sender));

        assert!(matches!(
            registry.counterpart(code, ParticipantId::new()),
            Err(RegistryError::NotParticipant)
        ));
    }

    #[test]
    fn test_release_frees_slot_before_ready() {
        let registry = registry();
        let code = registry.create(meta()).unwrap();
        let first = ParticipantId::new();

        registry.join(code, ParticipantRole::Receiver, first).unwrap();
        assert_eq!(registry.release(first), vec![(code, None)]);

        // The slot can be bound again
        let second = ParticipantId::new();
        assert_eq!(
            registry.join(code, ParticipantRole::Receiver, second).unwrap(),
            JoinOutcome::Waiting
        );
    }

    #[test]
    fn test_release_after_ready_keeps_room_closed() {
        let registry = registry();
        let code = registry.create(meta()).unwrap();
        let sender = ParticipantId::new();
        let receiver = ParticipantId::new();
        registry.join(code, ParticipantRole::Sender, sender).unwrap();
        registry.join(code, ParticipantRole::Receiver, receiver).unwrap();

        assert_eq!(registry.release(receiver), vec![(code, Some(sender))]);
        assert_eq!(
            registry.join(code, ParticipantRole::Receiver, ParticipantId::new()).unwrap(),
            JoinOutcome::RoomFull
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let registry = registry();
        registry.create(meta()).unwrap();
        tokio::time::advance(Duration::from_secs(100)).await;
        let young = registry.create(meta()).unwrap();
        tokio::time::advance(Duration::from_secs(100)).await;

        assert_eq!(registry.purge_expired(), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(young).is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_joins_yield_single_ready() {
        let registry = std::sync::Arc::new(registry());
        let code = registry.create(meta()).unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            let role = if i % 2 == 0 {
                ParticipantRole::Sender
            } else {
                ParticipantRole::Receiver
            };
            handles.push(tokio::spawn(async move {
                registry.join(code, role, ParticipantId::new()).unwrap()
            }));
        }

        let mut ready = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), JoinOutcome::Ready { .. }) {
                ready += 1;
            }
        }
        assert_eq!(ready, 1);
    }
}
