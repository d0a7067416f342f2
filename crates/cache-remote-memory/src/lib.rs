//! In-process chat API.
//!
//! Assigns ids and timestamps server-side, pages messages newest first and
//! supports scripted failures and held responses for tests.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use cache_core::{
    CacheError, CacheErrorCategory, CreateGroupInput, CreateMessageInput, Group, GroupId,
    GroupPayload, Message, MessageId, MessagePayload, RemoteApi, UpdateGroupInput, User,
    UserId, UserPayload, classify_transport_error,
};
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::debug;

/// Remote operation selector for fault injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    FetchUser,
    FetchGroupPage,
    CreateMessage,
    CreateGroup,
    UpdateGroup,
}

/// Releases one held call. Dropping the gate releases it too.
#[derive(Debug)]
pub struct RemoteGate {
    tx: oneshot::Sender<()>,
}

impl RemoteGate {
    /// Let the held call proceed.
    pub fn release(self) {
        let _ = self.tx.send(());
    }
}

#[derive(Debug, Default)]
struct ServerState {
    users: BTreeMap<UserId, User>,
    groups: BTreeMap<GroupId, Group>,
    messages: Vec<Message>,
    next_user_id: i64,
    next_group_id: i64,
    next_message_id: i64,
    last_timestamp_ms: Option<i64>,
    faults: HashMap<RemoteOp, VecDeque<CacheError>>,
    gates: HashMap<RemoteOp, VecDeque<oneshot::Receiver<()>>>,
    calls: HashMap<RemoteOp, usize>,
}

impl ServerState {
    /// Wall clock at millisecond precision, nudged forward so consecutive writes
    /// never share a timestamp.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_millis();
        let next = match self.last_timestamp_ms {
            Some(last) if now <= last => last + 1,
            _ => now,
        };
        self.last_timestamp_ms = Some(next);
        DateTime::from_timestamp_millis(next).unwrap_or_default()
    }

    fn insert_message(&mut self, group_id: GroupId, from: UserId, text: String) -> Message {
        self.next_message_id += 1;
        let message = Message {
            id: MessageId::Authoritative(self.next_message_id),
            from,
            to: group_id,
            inserted_at: self.tick(),
            text,
        };
        self.messages.push(message.clone());
        message
    }

    /// Messages of `group_id`, most recent first.
    fn group_messages(&self, group_id: GroupId) -> Vec<&Message> {
        let mut messages: Vec<&Message> = self
            .messages
            .iter()
            .filter(|message| message.to == group_id)
            .collect();
        messages.sort_by(|a, b| {
            b.inserted_at
                .cmp(&a.inserted_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        messages
    }

    fn message_payload(&self, message: &Message) -> MessagePayload {
        MessagePayload::from_message(message, self.users.get(&message.from))
    }

    fn group_payload(&self, group: &Group, message_limit: usize) -> GroupPayload {
        let members: Vec<User> = group
            .users
            .iter()
            .filter_map(|id| self.users.get(id).cloned())
            .collect();
        let messages: Vec<(Message, Option<User>)> = self
            .group_messages(group.id)
            .into_iter()
            .take(message_limit)
            .map(|message| (message.clone(), self.users.get(&message.from).cloned()))
            .collect();
        GroupPayload::from_parts(group, &members, &messages)
    }

    fn take_fault(&mut self, op: RemoteOp) -> Option<CacheError> {
        *self.calls.entry(op).or_default() += 1;
        self.faults.get_mut(&op).and_then(VecDeque::pop_front)
    }
}

/// Shared handle to one in-memory server.
#[derive(Clone, Default)]
pub struct InMemoryRemote {
    state: Arc<Mutex<ServerState>>,
}

impl InMemoryRemote {
    /// Empty server with no users or groups.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, ServerState>, CacheError> {
        self.state.lock().map_err(|_| {
            CacheError::new(
                CacheErrorCategory::Internal,
                "poisoned_lock",
                "in-memory remote state lock poisoned",
            )
        })
    }

    /// Register a user and return it.
    pub fn add_user(&self, username: &str) -> Result<User, CacheError> {
        let mut state = self.lock()?;
        state.next_user_id += 1;
        let user = User {
            id: UserId(state.next_user_id),
            username: username.to_owned(),
        };
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    /// Create a group directly, bypassing the mutation path.
    pub fn add_group(&self, name: &str, members: &[UserId]) -> Result<Group, CacheError> {
        let mut state = self.lock()?;
        state.next_group_id += 1;
        let mut users = Vec::with_capacity(members.len());
        for member in members {
            if !users.contains(member) {
                users.push(*member);
            }
        }
        let group = Group {
            id: GroupId(state.next_group_id),
            name: name.to_owned(),
            users,
        };
        state.groups.insert(group.id, group.clone());
        Ok(group)
    }

    /// Post a message directly, as if another client had sent it.
    pub fn post_message(
        &self,
        group_id: GroupId,
        from: UserId,
        text: &str,
    ) -> Result<Message, CacheError> {
        let mut state = self.lock()?;
        if !state.groups.contains_key(&group_id) {
            return Err(CacheError::not_found("group", group_id));
        }
        Ok(state.insert_message(group_id, from, text.to_owned()))
    }

    /// Server copy of `group_id`, if it exists.
    pub fn group(&self, group_id: GroupId) -> Result<Option<Group>, CacheError> {
        Ok(self.lock()?.groups.get(&group_id).cloned())
    }

    /// Number of messages the server holds for `group_id`.
    pub fn message_count(&self, group_id: GroupId) -> Result<usize, CacheError> {
        Ok(self
            .lock()?
            .messages
            .iter()
            .filter(|message| message.to == group_id)
            .count())
    }

    /// Fail the next call of `op` with `error`. Queued faults apply in order.
    pub fn fail_next(&self, op: RemoteOp, error: CacheError) -> Result<(), CacheError> {
        self.lock()?.faults.entry(op).or_default().push_back(error);
        Ok(())
    }

    /// Fail the next call of `op` as if the connection dropped mid-request.
    pub fn disconnect_next(&self, op: RemoteOp) -> Result<(), CacheError> {
        self.fail_next(op, classify_transport_error(format!("{op:?}: connection reset")))
    }

    /// Hold the next call of `op` until the returned gate is released.
    pub fn hold_next(&self, op: RemoteOp) -> Result<RemoteGate, CacheError> {
        let (tx, rx) = oneshot::channel();
        self.lock()?.gates.entry(op).or_default().push_back(rx);
        Ok(RemoteGate { tx })
    }

    /// Calls of `op` that reached the server (held calls count once released).
    pub fn call_count(&self, op: RemoteOp) -> Result<usize, CacheError> {
        Ok(self.lock()?.calls.get(&op).copied().unwrap_or(0))
    }

    async fn pass_gate(&self, op: RemoteOp) -> Result<(), CacheError> {
        let gate = self.lock()?.gates.get_mut(&op).and_then(VecDeque::pop_front);
        if let Some(rx) = gate {
            debug!(?op, "holding remote call");
            let _ = rx.await;
        }
        Ok(())
    }
}

impl RemoteApi for InMemoryRemote {
    async fn fetch_user(&self, user_id: UserId) -> Result<UserPayload, CacheError> {
        self.pass_gate(RemoteOp::FetchUser).await?;
        let mut state = self.lock()?;
        if let Some(err) = state.take_fault(RemoteOp::FetchUser) {
            return Err(err);
        }
        let user = state
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| CacheError::not_found("user", user_id))?;
        let groups = state
            .groups
            .values()
            .filter(|group| group.users.contains(&user_id))
            .map(|group| state.group_payload(group, 1))
            .collect();
        Ok(UserPayload {
            id: Some(user.id.0),
            username: Some(user.username),
            groups: Some(groups),
        })
    }

    async fn fetch_group_page(
        &self,
        group_id: GroupId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MessagePayload>, CacheError> {
        self.pass_gate(RemoteOp::FetchGroupPage).await?;
        let mut state = self.lock()?;
        if let Some(err) = state.take_fault(RemoteOp::FetchGroupPage) {
            return Err(err);
        }
        if !state.groups.contains_key(&group_id) {
            return Err(CacheError::not_found("group", group_id));
        }
        let page: Vec<MessagePayload> = state
            .group_messages(group_id)
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|message| state.message_payload(message))
            .collect();
        debug!(group_id = %group_id, offset, limit, returned = page.len(), "page served");
        Ok(page)
    }

    async fn create_message(&self, input: CreateMessageInput) -> Result<MessagePayload, CacheError> {
        self.pass_gate(RemoteOp::CreateMessage).await?;
        let mut state = self.lock()?;
        if let Some(err) = state.take_fault(RemoteOp::CreateMessage) {
            return Err(err);
        }
        if !state.groups.contains_key(&input.group_id) {
            return Err(CacheError::not_found("group", input.group_id));
        }
        if !state.users.contains_key(&input.user_id) {
            return Err(CacheError::not_found("user", input.user_id));
        }
        let message = state.insert_message(input.group_id, input.user_id, input.text);
        Ok(state.message_payload(&message))
    }

    async fn create_group(&self, input: CreateGroupInput) -> Result<GroupPayload, CacheError> {
        self.pass_gate(RemoteOp::CreateGroup).await?;
        let mut state = self.lock()?;
        if let Some(err) = state.take_fault(RemoteOp::CreateGroup) {
            return Err(err);
        }
        let mut users = Vec::with_capacity(input.user_ids.len() + 1);
        for id in std::iter::once(input.creator_id).chain(input.user_ids) {
            if !state.users.contains_key(&id) {
                return Err(CacheError::not_found("user", id));
            }
            if !users.contains(&id) {
                users.push(id);
            }
        }
        state.next_group_id += 1;
        let group = Group {
            id: GroupId(state.next_group_id),
            name: input.name,
            users,
        };
        state.groups.insert(group.id, group.clone());
        Ok(state.group_payload(&group, 1))
    }

    async fn update_group(&self, input: UpdateGroupInput) -> Result<GroupPayload, CacheError> {
        self.pass_gate(RemoteOp::UpdateGroup).await?;
        let mut state = self.lock()?;
        if let Some(err) = state.take_fault(RemoteOp::UpdateGroup) {
            return Err(err);
        }
        let group = {
            let group = state
                .groups
                .get_mut(&input.group_id)
                .ok_or_else(|| CacheError::not_found("group", input.group_id))?;
            group.name = input.name;
            group.clone()
        };
        Ok(state.group_payload(&group, 1))
    }
}
