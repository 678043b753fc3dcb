//! Cluster member identity.

use std::collections::BTreeSet;
use std::fmt;

use uuid::Uuid;

/// The globally unique identity of a cluster member.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MemberId(Uuid);

/// A set of cluster members.
pub type MemberSet = BTreeSet<MemberId>;

impl MemberId {
    /// Creates a new random member id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parses a member id from its 16 raw bytes, returning `None` if `bytes` is not 16 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Uuid::from_slice(bytes).ok().map(Self)
    }

    pub fn uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl From<Uuid> for MemberId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        write!(fmt, "Member({})", &simple[..8])
    }
}

/// Computes the minimum number of members out of `member_count` voting members which constitutes a quorum.
pub fn quorum_size(member_count: usize) -> usize {
    member_count / 2 + 1
}

/// Returns whether `count` members constitute a quorum of `member_count` voting members.
pub fn is_quorum(member_count: usize, count: usize) -> bool {
    count >= quorum_size(member_count)
}
