use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-assigned user identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Server-assigned group identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct GroupId(pub i64);

/// Locally-unique sentinel carried by an optimistic message until it settles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PendingId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message identity: authoritative once the server assigned an id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageId {
    /// Server-assigned id.
    Authoritative(i64),
    /// Optimistic sentinel, replaced on promotion.
    Pending(PendingId),
}

impl MessageId {
    /// Whether this is an optimistic sentinel.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// Server id, if assigned.
    pub fn authoritative(&self) -> Option<i64> {
        match self {
            Self::Authoritative(id) => Some(*id),
            Self::Pending(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authoritative(id) => write!(f, "{id}"),
            Self::Pending(PendingId(id)) => write!(f, "pending-{id}"),
        }
    }
}

/// Chat user. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

/// Group metadata. The message window is held separately by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    /// Members in server order, without repeats.
    pub users: Vec<UserId>,
}

/// A chat message, optimistic or authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub from: UserId,
    pub to: GroupId,
    pub inserted_at: DateTime<Utc>,
    pub text: String,
}

impl Message {
    /// Whether the message is still optimistic.
    pub fn is_pending(&self) -> bool {
        self.id.is_pending()
    }
}

/// Validated group response: metadata, members and the messages it carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSnapshot {
    pub group: Group,
    pub members: Vec<User>,
    /// Most-recent-first.
    pub messages: Vec<Message>,
    /// Senders referenced by `messages`.
    pub senders: Vec<User>,
}

/// Validated initial-load response for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSnapshot {
    pub user: User,
    pub groups: Vec<GroupSnapshot>,
}

/// Input for `create_message`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateMessageInput {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub text: String,
}

/// Input for `create_group`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateGroupInput {
    pub name: String,
    pub user_ids: Vec<UserId>,
    pub creator_id: UserId,
}

/// Input for `update_group`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateGroupInput {
    pub group_id: GroupId,
    pub name: String,
}

/// Mutation flavours tracked by the coordinator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MutationKind {
    CreateMessage,
    CreateGroup,
    UpdateGroup,
}

/// Per-mutation lifecycle. `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MutationState {
    Pending,
    Committed,
    RolledBack,
}

impl MutationState {
    /// Whether the mutation has settled.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Handle returned by `begin_*`; required to settle the mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingHandle {
    /// Client transaction id echoed in settle events.
    pub txn_id: Uuid,
    pub kind: MutationKind,
    /// Group the mutation targets, when known up front.
    pub group_id: Option<GroupId>,
    /// Sentinel inserted for optimistic messages.
    pub sentinel: Option<MessageId>,
}
