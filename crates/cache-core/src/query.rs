//! Read-only projections of the store, and the bindings that keep them current.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::trace;

use crate::{
    error::{CacheError, CacheErrorCategory},
    store::{EntityKey, EntityStore},
    types::{GroupId, Message, MessageId, User, UserId},
};

/// Parameterized query shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    /// Group metadata, members and the loaded message window.
    GroupWindow { group_id: GroupId },
    /// A user's group list with the latest message of each group.
    UserGroups { user_id: UserId },
}

/// Message row ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: MessageId,
    pub from: UserId,
    /// Sender username when the user is loaded.
    pub sender_name: Option<String>,
    pub to: GroupId,
    pub inserted_at: DateTime<Utc>,
    pub text: String,
    pub is_pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupWindowView {
    pub id: GroupId,
    pub name: String,
    pub members: Vec<User>,
    /// Most recent first.
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSummaryView {
    pub id: GroupId,
    pub name: String,
    pub latest_message: Option<MessageView>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserGroupsView {
    pub user: User,
    pub groups: Vec<GroupSummaryView>,
}

/// Snapshot assembled for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewModel {
    GroupWindow(GroupWindowView),
    UserGroups(UserGroupsView),
    /// The root entity is not loaded (yet).
    Missing,
}

impl ViewModel {
    /// Group window view, if this is one.
    pub fn as_group_window(&self) -> Option<&GroupWindowView> {
        match self {
            Self::GroupWindow(view) => Some(view),
            _ => None,
        }
    }

    /// Group list view, if this is one.
    pub fn as_user_groups(&self) -> Option<&UserGroupsView> {
        match self {
            Self::UserGroups(view) => Some(view),
            _ => None,
        }
    }

    /// Whether the query root is not loaded.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

/// Value published to a binding after each recomputation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    /// Store revision the view was computed at.
    pub revision: u64,
    /// How many times this binding has been computed, including the initial one.
    pub computations: u64,
    pub view: ViewModel,
}

/// Live subscription to one query. Dropping it unsubscribes.
#[derive(Debug, Clone)]
pub struct QueryBinding {
    query: Query,
    rx: watch::Receiver<Projection>,
}

impl QueryBinding {
    pub(crate) fn new(query: Query, rx: watch::Receiver<Projection>) -> Self {
        Self { query, rx }
    }

    /// Bound query.
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Latest projection without marking it seen.
    pub fn current(&self) -> Projection {
        self.rx.borrow().clone()
    }

    /// Latest view model.
    pub fn view(&self) -> ViewModel {
        self.rx.borrow().view.clone()
    }

    /// Whether a recomputation happened since the last `changed`/`mark_seen`.
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    /// Mark the current projection as observed.
    pub fn mark_seen(&mut self) {
        self.rx.borrow_and_update();
    }

    /// Wait for the next recomputation and return it.
    pub async fn changed(&mut self) -> Result<Projection, CacheError> {
        self.rx.changed().await.map_err(|_| {
            CacheError::new(
                CacheErrorCategory::Internal,
                "binding_closed",
                "store dropped while a binding was waiting",
            )
        })?;
        Ok(self.rx.borrow_and_update().clone())
    }
}

/// Compute `query` against `store`, returning the view and the keys it read.
pub(crate) fn project(store: &EntityStore, query: &Query) -> (ViewModel, HashSet<EntityKey>) {
    let mut deps = HashSet::new();
    let view = match query {
        Query::GroupWindow { group_id } => project_group_window(store, *group_id, &mut deps),
        Query::UserGroups { user_id } => project_user_groups(store, *user_id, &mut deps),
    };
    trace!(?query, dep_count = deps.len(), "query projected");
    (view, deps)
}

fn project_group_window(
    store: &EntityStore,
    group_id: GroupId,
    deps: &mut HashSet<EntityKey>,
) -> ViewModel {
    deps.insert(EntityKey::Group(group_id));
    let Some(group) = store.group(group_id) else {
        return ViewModel::Missing;
    };

    let members = group
        .users
        .iter()
        .filter_map(|id| {
            deps.insert(EntityKey::User(*id));
            store.user(*id).cloned()
        })
        .collect();
    let messages = store
        .window_messages(group_id)
        .into_iter()
        .map(|message| message_view(store, message, deps))
        .collect();

    ViewModel::GroupWindow(GroupWindowView {
        id: group.id,
        name: group.name.clone(),
        members,
        messages,
    })
}

fn project_user_groups(
    store: &EntityStore,
    user_id: UserId,
    deps: &mut HashSet<EntityKey>,
) -> ViewModel {
    deps.insert(EntityKey::User(user_id));
    deps.insert(EntityKey::UserGroups(user_id));
    let Some(user) = store.user(user_id) else {
        return ViewModel::Missing;
    };

    let groups = store
        .user_groups(user_id)
        .unwrap_or_default()
        .iter()
        .filter_map(|group_id| {
            deps.insert(EntityKey::Group(*group_id));
            let group = store.group(*group_id)?;
            let latest_message = store
                .window_messages(*group_id)
                .first()
                .map(|message| message_view(store, message, deps));
            Some(GroupSummaryView {
                id: group.id,
                name: group.name.clone(),
                latest_message,
            })
        })
        .collect();

    ViewModel::UserGroups(UserGroupsView {
        user: user.clone(),
        groups,
    })
}

fn message_view(store: &EntityStore, message: &Message, deps: &mut HashSet<EntityKey>) -> MessageView {
    deps.insert(EntityKey::Message(message.id));
    deps.insert(EntityKey::User(message.from));
    MessageView {
        id: message.id,
        from: message.from,
        sender_name: store.user(message.from).map(|user| user.username.clone()),
        to: message.to,
        inserted_at: message.inserted_at,
        text: message.text.clone(),
        is_pending: message.is_pending(),
    }
}
