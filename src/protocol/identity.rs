//! Peer identities
//!
//! An [`Identity`] names a connected peer by a namespace and a unique id.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::wire;
use super::CodecError;

/// A peer's stable name.
///
/// Equality ignores namespace case. An empty namespace or a nil id is a
/// placeholder that matches anything in that position; placeholders are
/// never routable, see [`Identity::is_complete`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub namespace: String,
    pub id: Uuid,
}

/// Hashable, case-folded key for complete identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    namespace: String,
    id: Uuid,
}

impl Identity {
    pub fn new(namespace: impl Into<String>, id: Uuid) -> Self {
        Self {
            namespace: namespace.into(),
            id,
        }
    }

    /// Identity with a fresh random id
    pub fn generate(namespace: impl Into<String>) -> Self {
        Self::new(namespace, Uuid::new_v4())
    }

    /// Fill in missing parts: a random 8 character namespace, a fresh v4 id.
    pub fn normalized(self) -> Self {
        let namespace = if self.namespace.is_empty() {
            Uuid::new_v4().simple().to_string()[..8].to_string()
        } else {
            self.namespace
        };
        let id = if self.id.is_nil() { Uuid::new_v4() } else { self.id };
        Self { namespace, id }
    }

    pub fn is_complete(&self) -> bool {
        !self.namespace.is_empty() && !self.id.is_nil()
    }

    pub fn key(&self) -> IdentityKey {
        IdentityKey {
            namespace: self.namespace.to_ascii_lowercase(),
            id: self.id,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        wire::put_string(buf, &self.namespace);
        wire::put_uuid(buf, &self.id);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let namespace = wire::get_string(buf)?;
        let id = wire::get_uuid(buf)?;
        Ok(Self { namespace, id })
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        let namespace_matches = self.namespace.is_empty()
            || other.namespace.is_empty()
            || self.namespace.eq_ignore_ascii_case(&other.namespace);
        let id_matches = self.id.is_nil() || other.id.is_nil() || self.id == other.id;
        namespace_matches && id_matches
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.namespace, self.id)
    }
}
