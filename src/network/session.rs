//! Hub-side sessions and the membership table
//!
//! Every accepted connection starts in the pending set. A successful
//! authentication moves it into membership, keyed by identity. Both tables
//! are concurrent maps; broadcasts iterate over a snapshot.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use thiserror::Error;

use super::Transmitter;
use crate::protocol::{Frame, Identity, IdentityKey};

/// Per-connection lifecycle; moves forward only
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SessionState {
    #[default]
    Unauthenticated,
    Authenticated(Identity),
    Closed,
}

impl SessionState {
    /// Returns false unless the session was still unauthenticated
    pub fn authenticate(&mut self, identity: Identity) -> bool {
        if !matches!(self, SessionState::Unauthenticated) {
            return false;
        }
        *self = SessionState::Authenticated(identity);
        true
    }

    /// Move to closed, yielding the identity if there was one
    pub fn close(&mut self) -> Option<Identity> {
        match std::mem::replace(self, SessionState::Closed) {
            SessionState::Authenticated(identity) => Some(identity),
            SessionState::Unauthenticated | SessionState::Closed => None,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        match self {
            SessionState::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }
}

/// An authenticated peer
#[derive(Debug, Clone)]
pub struct Session {
    pub identity: Identity,
    pub remote_addr: SocketAddr,
    pub transmitter: Transmitter,
}

#[derive(Error, Debug, PartialEq)]
pub enum AdmitError {
    #[error("identity {0} is incomplete")]
    Incomplete(Identity),

    #[error("identity {0} is already a member")]
    AlreadyMember(Identity),
}

#[derive(Debug, Default)]
pub struct Membership {
    pending: DashMap<SocketAddr, Transmitter>,
    sessions: DashMap<IdentityKey, Session>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pending(&self, addr: SocketAddr, transmitter: Transmitter) {
        self.pending.insert(addr, transmitter);
    }

    pub fn remove_pending(&self, addr: &SocketAddr) -> Option<Transmitter> {
        self.pending.remove(addr).map(|(_, transmitter)| transmitter)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Connections that have not authenticated yet
    pub fn pending_transmitters(&self) -> Vec<Transmitter> {
        self.pending
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Promote a pending connection to an authenticated session.
    ///
    /// On error the connection stays pending.
    pub fn admit(
        &self,
        addr: SocketAddr,
        identity: Identity,
        transmitter: Transmitter,
    ) -> Result<Session, AdmitError> {
        if !identity.is_complete() {
            return Err(AdmitError::Incomplete(identity));
        }

        match self.sessions.entry(identity.key()) {
            Entry::Occupied(_) => Err(AdmitError::AlreadyMember(identity)),
            Entry::Vacant(slot) => {
                let session = Session {
                    identity,
                    remote_addr: addr,
                    transmitter,
                };
                slot.insert(session.clone());
                self.pending.remove(&addr);
                Ok(session)
            }
        }
    }

    /// Find the session for a complete identity
    pub fn lookup(&self, identity: &Identity) -> Option<Session> {
        if !identity.is_complete() {
            return None;
        }
        self.sessions
            .get(&identity.key())
            .map(|session| session.value().clone())
    }

    pub fn remove(&self, identity: &Identity) -> Option<Session> {
        self.sessions
            .remove(&identity.key())
            .map(|(_, session)| session)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        identity.is_complete() && self.sessions.contains_key(&identity.key())
    }

    /// Point-in-time copy of every session
    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Every member except `identity`
    pub fn others(&self, identity: &Identity) -> Vec<Session> {
        let key = identity.key();
        self.sessions
            .iter()
            .filter(|entry| *entry.key() != key)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.sessions
            .iter()
            .map(|entry| entry.value().identity.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Queue `frame` to each of `sessions`; returns how many accepted it
    pub fn broadcast(sessions: &[Session], frame: &Frame) -> usize {
        sessions
            .iter()
            .filter(|session| session.transmitter.send_serial(frame.clone()))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_session_state_moves_forward_only() {
        let identity = Identity::generate("alpha");
        let mut state = SessionState::default();

        assert!(state.authenticate(identity.clone()));
        assert!(!state.authenticate(Identity::generate("beta")));
        assert_eq!(state.identity(), Some(&identity));

        assert_eq!(state.close(), Some(identity.clone()));
        assert_eq!(state, SessionState::Closed);
        assert!(!state.authenticate(identity));
        assert_eq!(state.close(), None);
    }

    #[test]
    fn test_admit_moves_out_of_pending() {
        let membership = Membership::new();
        membership.add_pending(addr(1), Transmitter::detached());
        assert_eq!(membership.pending_count(), 1);

        let identity = Identity::generate("alpha");
        assert_eq!(membership.pending_transmitters().len(), 1);

        let session = membership
            .admit(addr(1), identity.clone(), Transmitter::detached())
            .unwrap();

        assert_eq!(session.identity, identity);
        assert_eq!(membership.pending_count(), 0);
        assert!(membership.pending_transmitters().is_empty());
        assert!(membership.contains(&identity));
    }

    #[test]
    fn test_duplicate_and_incomplete_are_rejected() {
        let membership = Membership::new();
        let identity = Identity::generate("alpha");
        membership
            .admit(addr(1), identity.clone(), Transmitter::detached())
            .unwrap();

        // Same identity, different namespace case
        let shouting = Identity::new("ALPHA", identity.id);
        membership.add_pending(addr(2), Transmitter::detached());
        let err = membership
            .admit(addr(2), shouting.clone(), Transmitter::detached())
            .unwrap_err();
        assert_eq!(err, AdmitError::AlreadyMember(shouting));
        assert_eq!(membership.pending_count(), 1);

        let placeholder = Identity::new("", Uuid::new_v4());
        assert!(matches!(
            membership.admit(addr(2), placeholder, Transmitter::detached()),
            Err(AdmitError::Incomplete(_))
        ));
        assert_eq!(membership.len(), 1);
    }

    #[test]
    fn test_lookup_ignores_placeholders() {
        let membership = Membership::new();
        let identity = Identity::generate("alpha");
        membership
            .admit(addr(1), identity.clone(), Transmitter::detached())
            .unwrap();

        assert!(membership.lookup(&identity).is_some());
        assert!(membership.lookup(&Identity::new("alpha", Uuid::nil())).is_none());
        assert!(membership.lookup(&Identity::generate("alpha")).is_none());
    }

    #[test]
    fn test_others_excludes_self() {
        let membership = Membership::new();
        let a = Identity::generate("a");
        let b = Identity::generate("b");
        membership.admit(addr(1), a.clone(), Transmitter::detached()).unwrap();
        membership.admit(addr(2), b.clone(), Transmitter::detached()).unwrap();

        let others = membership.others(&a);
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].identity, b);

        membership.remove(&b);
        assert!(membership.others(&a).is_empty());
    }
}
