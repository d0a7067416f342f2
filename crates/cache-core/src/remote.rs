//! Remote API boundary and its wire payloads.
//!
//! Payload fields are all optional on the wire; the `into_*` conversions turn a
//! missing or unusable field into a `Malformed` error naming it.

use std::future::Future;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::CacheError,
    types::{
        CreateGroupInput, CreateMessageInput, Group, GroupId, GroupSnapshot, Message, MessageId,
        UpdateGroupInput, User, UserId, UserSnapshot,
    },
};

/// Asynchronous request/response surface the cache talks to.
pub trait RemoteApi: Send + Sync {
    /// User with its groups, each carrying its most recent message.
    fn fetch_user(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<UserPayload, CacheError>> + Send;

    /// Up to `limit` messages of `group_id`, most recent first, skipping the `offset` newest.
    fn fetch_group_page(
        &self,
        group_id: GroupId,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<MessagePayload>, CacheError>> + Send;

    fn create_message(
        &self,
        input: CreateMessageInput,
    ) -> impl Future<Output = Result<MessagePayload, CacheError>> + Send;

    fn create_group(
        &self,
        input: CreateGroupInput,
    ) -> impl Future<Output = Result<GroupPayload, CacheError>> + Send;

    /// Fails with `NotFound` when the group is unknown server-side.
    fn update_group(
        &self,
        input: UpdateGroupInput,
    ) -> impl Future<Output = Result<GroupPayload, CacheError>> + Send;
}

/// `{ id username }` selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub id: Option<i64>,
    pub username: Option<String>,
}

/// `{ id }` selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupRef {
    pub id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: Option<i64>,
    pub to: Option<GroupRef>,
    pub from: Option<UserRef>,
    /// RFC 3339 timestamp.
    pub inserted_at: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupPayload {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub users: Option<Vec<UserRef>>,
    pub messages: Option<Vec<MessagePayload>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserPayload {
    pub id: Option<i64>,
    pub username: Option<String>,
    pub groups: Option<Vec<GroupPayload>>,
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, CacheError> {
    value.ok_or_else(|| CacheError::malformed(field, "missing"))
}

impl UserRef {
    /// Wire form of `user`.
    pub fn from_user(user: &User) -> Self {
        Self {
            id: Some(user.id.0),
            username: Some(user.username.clone()),
        }
    }

    /// Convert to a `User`, naming `field` when a part is missing.
    pub fn into_user(self, field: &str) -> Result<User, CacheError> {
        Ok(User {
            id: UserId(required(self.id, &format!("{field}.id"))?),
            username: required(self.username, &format!("{field}.username"))?,
        })
    }
}

impl MessagePayload {
    /// Wire form of `message`, embedding the sender when known.
    pub fn from_message(message: &Message, sender: Option<&User>) -> Self {
        Self {
            id: message.id.authoritative(),
            to: Some(GroupRef {
                id: Some(message.to.0),
            }),
            from: Some(UserRef {
                id: Some(message.from.0),
                username: sender.map(|user| user.username.clone()),
            }),
            inserted_at: Some(
                message
                    .inserted_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            text: Some(message.text.clone()),
        }
    }

    /// Sender embedded in the `from` selection, when the username was selected.
    pub fn sender(&self) -> Option<User> {
        let from = self.from.as_ref()?;
        Some(User {
            id: UserId(from.id?),
            username: from.username.clone()?,
        })
    }

    /// Convert to a `Message`. Missing or unparsable fields are malformed.
    pub fn into_message(self) -> Result<Message, CacheError> {
        let id = required(self.id, "message.id")?;
        let to = required(self.to.and_then(|group| group.id), "message.to.id")?;
        let from = required(self.from.and_then(|user| user.id), "message.from.id")?;
        let raw = required(self.inserted_at, "message.insertedAt")?;
        let inserted_at = DateTime::parse_from_rfc3339(&raw)
            .map_err(|err| CacheError::malformed("message.insertedAt", format!("'{raw}': {err}")))?
            .with_timezone(&Utc);
        Ok(Message {
            id: MessageId::Authoritative(id),
            from: UserId(from),
            to: GroupId(to),
            inserted_at,
            text: required(self.text, "message.text")?,
        })
    }
}

/// Convert a fetched page, keeping server order.
pub fn page_into_messages(page: Vec<MessagePayload>) -> Result<Vec<Message>, CacheError> {
    page.into_iter().map(MessagePayload::into_message).collect()
}

impl GroupPayload {
    /// Wire form of a group with its members and messages.
    pub fn from_parts(group: &Group, members: &[User], messages: &[(Message, Option<User>)]) -> Self {
        Self {
            id: Some(group.id.0),
            name: Some(group.name.clone()),
            users: Some(members.iter().map(UserRef::from_user).collect()),
            messages: Some(
                messages
                    .iter()
                    .map(|(message, sender)| MessagePayload::from_message(message, sender.as_ref()))
                    .collect(),
            ),
        }
    }

    /// Validate into a snapshot. A missing `messages` selection is an empty window.
    pub fn into_snapshot(self) -> Result<GroupSnapshot, CacheError> {
        let id = GroupId(required(self.id, "group.id")?);
        let name = required(self.name, "group.name")?;
        let members = required(self.users, "group.users")?
            .into_iter()
            .map(|user| user.into_user("group.users"))
            .collect::<Result<Vec<_>, _>>()?;

        let mut senders = Vec::new();
        let mut messages = Vec::new();
        for payload in self.messages.unwrap_or_default() {
            if let Some(sender) = payload.sender()
                && !senders.contains(&sender)
            {
                senders.push(sender);
            }
            let message = payload.into_message()?;
            if message.to != id {
                return Err(CacheError::malformed(
                    "group.messages.to",
                    format!("message {} belongs to group {}", message.id, message.to),
                ));
            }
            messages.push(message);
        }

        let mut users = Vec::with_capacity(members.len());
        for member in &members {
            if !users.contains(&member.id) {
                users.push(member.id);
            }
        }

        Ok(GroupSnapshot {
            group: Group { id, name, users },
            members,
            messages,
            senders,
        })
    }
}

impl UserPayload {
    /// Convert to a user snapshot; `groups` must be selected.
    pub fn into_snapshot(self) -> Result<UserSnapshot, CacheError> {
        let user = User {
            id: UserId(required(self.id, "user.id")?),
            username: required(self.username, "user.username")?,
        };
        let groups = required(self.groups, "user.groups")?
            .into_iter()
            .map(GroupPayload::into_snapshot)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(UserSnapshot { user, groups })
    }
}
