//! Bounded session registry
//!
//! Slots are allocated on demand up to a fixed maximum and recycled on
//! reset, never removed. Callers keep a [`SessionHandle`]; a handle taken
//! before a reset no longer resolves afterwards.
//!
//! Lock order is always registry, then session.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;

use super::{Session, SessionRole, SessionState, SessionStatus};
use crate::error::SessionError;

/// Checked reference to a registry slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    index: usize,
    generation: u64,
}

impl SessionHandle {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Fields for a new session
#[derive(Debug, Clone)]
pub struct Registration {
    /// Peer ssrc; None for an outbound invitation not yet answered
    pub ssrc: Option<u32>,
    pub initiator: u32,
    pub addr: IpAddr,
    pub control_port: u16,
    pub data_port: u16,
    pub name: String,
    pub role: SessionRole,
}

/// Session table
pub struct Registry {
    slots: Mutex<Vec<Arc<Session>>>,
    max_sessions: usize,
}

impl Registry {
    /// Create an empty registry holding at most `max_sessions` sessions
    pub fn new(max_sessions: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(max_sessions)),
            max_sessions,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Number of sessions not Unused
    pub fn active_count(&self) -> usize {
        let slots = self.slots.lock();
        slots
            .iter()
            .filter(|s| s.lock().status != SessionStatus::Unused)
            .count()
    }

    /// Register a session, reusing a free slot when possible
    pub fn register(&self, registration: Registration) -> Result<SessionHandle, SessionError> {
        let mut slots = self.slots.lock();

        if let Some(ssrc) = registration.ssrc {
            let duplicate = slots.iter().any(|s| {
                let state = s.lock();
                state.status != SessionStatus::Unused && state.ssrc == Some(ssrc)
            });
            if duplicate {
                tracing::warn!(ssrc = format_args!("{:#010x}", ssrc), "Session already registered");
                return Err(SessionError::DuplicateSsrc(ssrc));
            }
        }

        let free = slots
            .iter()
            .position(|s| s.lock().status == SessionStatus::Unused);
        let index = match free {
            Some(index) => index,
            None if slots.len() < self.max_sessions => {
                let index = slots.len();
                slots.push(Arc::new(Session::new(index)));
                index
            }
            None => {
                tracing::warn!(max = self.max_sessions, "No free session slot");
                return Err(SessionError::RegistryFull(self.max_sessions));
            }
        };

        let send_ssrc = unique_send_ssrc(&slots);

        let mut state = slots[index].lock();
        let generation = state.generation.wrapping_add(1);
        *state = SessionState {
            status: SessionStatus::Idle,
            role: registration.role,
            generation,
            ssrc: registration.ssrc,
            send_ssrc,
            initiator: registration.initiator,
            addr: registration.addr,
            control_port: registration.control_port,
            data_port: registration.data_port,
            name: registration.name,
            seq: 1,
            start: Instant::now(),
            journal: Default::default(),
            offset_estimate: None,
        };

        tracing::info!(
            slot = index,
            name = %state.name,
            peer = %state.control_addr(),
            send_ssrc = format_args!("{:#010x}", send_ssrc),
            "Session registered"
        );

        Ok(SessionHandle { index, generation })
    }

    /// Session behind a handle, if the handle is still current
    pub fn get(&self, handle: SessionHandle) -> Result<Arc<Session>, SessionError> {
        let session = {
            let slots = self.slots.lock();
            slots.get(handle.index).cloned()
        };
        match session {
            Some(session) if session.lock().generation == handle.generation => Ok(session),
            _ => Err(SessionError::StaleHandle),
        }
    }

    /// Run `f` on the session fields while holding only that session's lock
    pub fn with_session<R>(
        &self,
        handle: SessionHandle,
        f: impl FnOnce(&mut SessionState) -> R,
    ) -> Result<R, SessionError> {
        let session = {
            let slots = self.slots.lock();
            slots.get(handle.index).cloned()
        }
        .ok_or(SessionError::StaleHandle)?;

        let mut state = session.lock();
        if state.generation != handle.generation || state.status == SessionStatus::Unused {
            return Err(SessionError::StaleHandle);
        }
        Ok(f(&mut state))
    }

    fn find(&self, pred: impl Fn(&SessionState) -> bool) -> Option<SessionHandle> {
        let slots = self.slots.lock();
        slots.iter().enumerate().find_map(|(index, session)| {
            let state = session.lock();
            (state.status != SessionStatus::Unused && pred(&state)).then(|| SessionHandle {
                index,
                generation: state.generation,
            })
        })
    }

    pub fn find_by_ssrc(&self, ssrc: u32) -> Option<SessionHandle> {
        self.find(|s| s.ssrc == Some(ssrc))
    }

    pub fn find_by_initiator(&self, initiator: u32) -> Option<SessionHandle> {
        self.find(|s| s.initiator == initiator)
    }

    pub fn find_by_name(&self, name: &str) -> Option<SessionHandle> {
        self.find(|s| s.name == name)
    }

    /// Handles of every session matching `pred`
    pub fn handles_where(&self, pred: impl Fn(&SessionState) -> bool) -> Vec<SessionHandle> {
        let slots = self.slots.lock();
        slots
            .iter()
            .enumerate()
            .filter_map(|(index, session)| {
                let state = session.lock();
                (state.status != SessionStatus::Unused && pred(&state)).then(|| SessionHandle {
                    index,
                    generation: state.generation,
                })
            })
            .collect()
    }

    /// Handles of every registered session
    pub fn handles(&self) -> Vec<SessionHandle> {
        self.handles_where(|_| true)
    }

    /// Clear the journal, restart sequencing and free the slot
    pub fn reset(&self, handle: SessionHandle) -> Result<(), SessionError> {
        let slots = self.slots.lock();
        let session = slots.get(handle.index).ok_or(SessionError::StaleHandle)?;

        let mut state = session.lock();
        if state.generation != handle.generation || state.status == SessionStatus::Unused {
            return Err(SessionError::StaleHandle);
        }
        tracing::info!(slot = handle.index, name = %state.name, "Session reset");
        state.clear();
        Ok(())
    }

    /// Reset every registered session
    pub fn reset_all(&self) {
        let slots = self.slots.lock();
        for session in slots.iter() {
            let mut state = session.lock();
            if state.status != SessionStatus::Unused {
                state.clear();
            }
        }
    }
}

/// Random nonzero ssrc not used by any live session on either side
fn unique_send_ssrc(slots: &[Arc<Session>]) -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let candidate: u32 = rng.gen();
        if candidate == 0 {
            continue;
        }
        let taken = slots.iter().any(|s| {
            let state = s.lock();
            state.status != SessionStatus::Unused
                && (state.send_ssrc == candidate || state.ssrc == Some(candidate))
        });
        if !taken {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn registration(ssrc: u32, name: &str) -> Registration {
        Registration {
            ssrc: Some(ssrc),
            initiator: ssrc ^ 0xffff,
            addr: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            control_port: 5004,
            data_port: 0,
            name: name.to_string(),
            role: SessionRole::Responder,
        }
    }

    #[test]
    fn test_register_and_find() {
        let registry = Registry::new(4);
        let handle = registry.register(registration(0x6633_4873, "Test")).unwrap();

        assert_eq!(registry.find_by_ssrc(0x6633_4873), Some(handle));
        assert_eq!(registry.find_by_initiator(0x6633_4873 ^ 0xffff), Some(handle));
        assert_eq!(registry.find_by_name("Test"), Some(handle));
        assert_eq!(registry.find_by_name("Other"), None);

        let (status, seq, send_ssrc) = registry
            .with_session(handle, |s| (s.status, s.seq, s.send_ssrc))
            .unwrap();
        assert_eq!(status, SessionStatus::Idle);
        assert_eq!(seq, 1);
        assert_ne!(send_ssrc, 0);
    }

    #[test]
    fn test_duplicate_ssrc_rejected() {
        let registry = Registry::new(4);
        registry.register(registration(1, "a")).unwrap();
        assert_eq!(
            registry.register(registration(1, "b")),
            Err(SessionError::DuplicateSsrc(1))
        );
        assert_eq!(registry.active_count(), 1);
        assert!(registry.find_by_name("b").is_none());
    }

    #[test]
    fn test_capacity_and_slot_reuse() {
        let registry = Registry::new(2);
        let first = registry.register(registration(1, "a")).unwrap();
        registry.register(registration(2, "b")).unwrap();
        assert_eq!(
            registry.register(registration(3, "c")),
            Err(SessionError::RegistryFull(2))
        );

        registry.reset(first).unwrap();
        let reused = registry.register(registration(3, "c")).unwrap();
        assert_eq!(reused.index(), first.index());
        assert_ne!(reused, first);
    }

    #[test]
    fn test_reset_invalidates_handle() {
        let registry = Registry::new(2);
        let handle = registry.register(registration(7, "a")).unwrap();
        registry
            .with_session(handle, |s| {
                s.add_note_on(0, 60, 100);
                s.advance_seq();
            })
            .unwrap();

        registry.reset(handle).unwrap();
        assert!(registry.find_by_ssrc(7).is_none());
        assert_eq!(registry.with_session(handle, |_| ()), Err(SessionError::StaleHandle));
        assert_eq!(registry.reset(handle), Err(SessionError::StaleHandle));
        assert!(registry.get(handle).is_err());

        let session = registry.get(registry.register(registration(8, "b")).unwrap()).unwrap();
        let state = session.lock();
        assert_eq!(state.seq, 1);
        assert!(state.journal.is_empty());
    }

    #[test]
    fn test_send_ssrcs_are_unique() {
        let registry = Registry::new(8);
        let mut seen = std::collections::HashSet::new();
        for i in 0..8 {
            let handle = registry.register(registration(100 + i, "x")).unwrap();
            let send_ssrc = registry.with_session(handle, |s| s.send_ssrc).unwrap();
            assert!(seen.insert(send_ssrc));
        }
    }

    #[test]
    fn test_pending_initiator_has_no_ssrc() {
        let registry = Registry::new(2);
        let mut reg = registration(0, "remote");
        reg.ssrc = None;
        reg.role = SessionRole::Initiator;
        let handle = registry.register(reg.clone()).unwrap();
        // Two pending invitations never collide on ssrc
        registry.register(reg).unwrap();

        assert!(registry.find_by_ssrc(0).is_none());
        assert_eq!(registry.find_by_initiator(0xffff), Some(handle));
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(Registry::new(16));
        let threads: Vec<_> = (0..4u32)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..4 {
                        registry.register(registration(t * 100 + i, "p")).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(registry.active_count(), 16);
        assert_eq!(registry.handles().len(), 16);
    }
}
