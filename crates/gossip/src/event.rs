//! Membership events emitted by the gossip layer

use std::fmt;

use crate::Member;

/// A change to one member as observed by the local gossip layer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MemberEvent {
    /// The member became known.
    Joined(Member),

    /// The member's tags or address changed.
    Updated(Member),

    /// The member announced a graceful leave.
    Left(Member),

    /// The failure detector declared the member dead.
    Failed(Member),
}

/// Discriminant of a [`MemberEvent`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MemberEventKind {
    /// See [`MemberEvent::Joined`].
    Joined,
    /// See [`MemberEvent::Updated`].
    Updated,
    /// See [`MemberEvent::Left`].
    Left,
    /// See [`MemberEvent::Failed`].
    Failed,
}

impl MemberEvent {
    /// The member the event is about.
    #[must_use]
    pub fn member(&self) -> &Member {
        match self {
            Self::Joined(m) | Self::Updated(m) | Self::Left(m) | Self::Failed(m) => m,
        }
    }

    /// Consume the event, returning its member.
    #[must_use]
    pub fn into_member(self) -> Member {
        match self {
            Self::Joined(m) | Self::Updated(m) | Self::Left(m) | Self::Failed(m) => m,
        }
    }

    /// The kind of event.
    #[must_use]
    pub const fn kind(&self) -> MemberEventKind {
        match self {
            Self::Joined(_) => MemberEventKind::Joined,
            Self::Updated(_) => MemberEventKind::Updated,
            Self::Left(_) => MemberEventKind::Left,
            Self::Failed(_) => MemberEventKind::Failed,
        }
    }

    /// Whether the event removes the member from the live set.
    #[must_use]
    pub const fn is_departure(&self) -> bool {
        matches!(self, Self::Left(_) | Self::Failed(_))
    }
}

impl fmt::Display for MemberEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Joined => "joined",
            Self::Updated => "updated",
            Self::Left => "left",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl fmt::Display for MemberEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let member = self.member();
        write!(f, "{} {} ({})", self.kind(), member.id, member.addr)
    }
}
