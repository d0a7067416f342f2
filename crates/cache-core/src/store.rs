use std::collections::{BTreeSet, HashMap, HashSet};

use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::{
    dedup::DedupFilter,
    error::CacheError,
    query::{self, Projection, Query, QueryBinding, ViewModel},
    types::{Group, GroupId, Message, MessageId, User, UserId},
    window::{MessageWindow, Placement},
};

/// Dependency key recorded by query bindings and reported by writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKey {
    User(UserId),
    /// Group metadata or its message window.
    Group(GroupId),
    /// Ordered group list owned by a user.
    UserGroups(UserId),
    Message(MessageId),
}

/// One structural update. A patch is an ordered list of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert a user unless already known (users are immutable).
    UpsertUser(User),
    /// Create a group with an empty window, or refresh name/members of a known one.
    UpsertGroup(Group),
    RenameGroup { group_id: GroupId, name: String },
    SetUserGroups { user_id: UserId, group_ids: Vec<GroupId> },
    /// Append to a user's group list; no-op if already listed.
    AppendUserGroup { user_id: UserId, group_id: GroupId },
    /// Sorted insert into the window of `message.to`, skipped when already present.
    InsertMessage { message: Message, placement: Placement },
    RemoveMessage { group_id: GroupId, id: MessageId },
    /// Authoritative reload of a group's head page.
    ///
    /// Pending entries survive unless the page already holds their authoritative copy.
    ReplaceWindow { group_id: GroupId, messages: Vec<Message> },
}

/// Ordered batch of write operations applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WritePatch {
    ops: Vec<WriteOp>,
}

impl WritePatch {
    /// Empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style push.
    pub fn with(mut self, op: WriteOp) -> Self {
        self.ops.push(op);
        self
    }

    /// Append one op.
    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    /// Move every op of `other` to the end of this patch.
    pub fn append(&mut self, other: WritePatch) {
        self.ops.extend(other.ops);
    }

    /// Ops in application order.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Number of ops.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the patch carries no ops.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl From<Vec<WriteOp>> for WritePatch {
    fn from(ops: Vec<WriteOp>) -> Self {
        Self { ops }
    }
}

impl FromIterator<WriteOp> for WritePatch {
    fn from_iter<T: IntoIterator<Item = WriteOp>>(iter: T) -> Self {
        Self {
            ops: iter.into_iter().collect(),
        }
    }
}

/// Summary of an applied patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Store revision after the patch.
    pub revision: u64,
    /// Entities whose observable state changed.
    pub touched: BTreeSet<EntityKey>,
    /// Messages added to windows.
    pub inserted: usize,
    /// Messages skipped because the window already held them.
    pub skipped_duplicates: usize,
    /// Messages removed from windows.
    pub removed: usize,
    /// Bindings recomputed because of this patch.
    pub recomputed: usize,
}

#[derive(Debug, Clone)]
struct GroupRecord {
    group: Group,
    window: MessageWindow,
}

#[derive(Debug)]
struct Subscription {
    query: Query,
    deps: HashSet<EntityKey>,
    computations: u64,
    tx: watch::Sender<Projection>,
}

/// Normalized in-memory table of users, groups and messages. The session's single source of truth.
#[derive(Debug, Default)]
pub struct EntityStore {
    users: HashMap<UserId, User>,
    groups: HashMap<GroupId, GroupRecord>,
    messages: HashMap<MessageId, Message>,
    user_groups: HashMap<UserId, Vec<GroupId>>,
    dedup: DedupFilter,
    subscriptions: Vec<Subscription>,
    revision: u64,
}

impl EntityStore {
    /// Empty store using `dedup` for message identity.
    pub fn new(dedup: DedupFilter) -> Self {
        Self {
            dedup,
            ..Self::default()
        }
    }

    /// Identity filter in use.
    pub fn dedup(&self) -> &DedupFilter {
        &self.dedup
    }

    /// Incremented once per applied patch that changed something.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Stored user, if loaded.
    pub fn user(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }

    /// Stored group, if loaded.
    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id).map(|record| &record.group)
    }

    /// Message window of a loaded group.
    pub fn window(&self, id: GroupId) -> Option<&MessageWindow> {
        self.groups.get(&id).map(|record| &record.window)
    }

    /// Stored message by id.
    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.get(&id)
    }

    /// Window messages of `group_id` in display order. Empty when the group is unknown.
    pub fn window_messages(&self, group_id: GroupId) -> Vec<&Message> {
        self.groups
            .get(&group_id)
            .map(|record| window_messages(&record.window, &self.messages).collect())
            .unwrap_or_default()
    }

    /// Group list of a loaded user.
    pub fn user_groups(&self, user_id: UserId) -> Option<&[GroupId]> {
        self.user_groups.get(&user_id).map(Vec::as_slice)
    }

    /// Project `query` against current contents.
    pub fn read(&self, query: &Query) -> ViewModel {
        query::project(self, query).0
    }

    /// Register a binding that is recomputed whenever one of its dependencies changes.
    pub fn subscribe(&mut self, query: Query) -> QueryBinding {
        let (view, deps) = query::project(self, &query);
        let (tx, rx) = watch::channel(Projection {
            revision: self.revision,
            computations: 1,
            view,
        });
        trace!(?query, dep_count = deps.len(), "binding subscribed");
        self.subscriptions.push(Subscription {
            query: query.clone(),
            deps,
            computations: 1,
            tx,
        });
        QueryBinding::new(query, rx)
    }

    /// Number of live bindings.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .iter()
            .filter(|subscription| !subscription.tx.is_closed())
            .count()
    }

    /// Apply `patch` fully or not at all.
    ///
    /// A patch naming a group or user that does not exist is rejected with `NotFound`
    /// and leaves the store untouched.
    pub fn write(&mut self, patch: WritePatch) -> Result<WriteReport, CacheError> {
        if let Err(err) = self.validate(&patch) {
            warn!(code = %err.code, message = %err.message, "store write rejected");
            return Err(err);
        }

        let mut report = WriteReport::default();
        for op in patch.ops {
            self.apply_op(op, &mut report);
        }

        if !report.touched.is_empty() {
            self.revision += 1;
            report.recomputed = self.notify(&report.touched);
        }
        report.revision = self.revision;
        debug!(
            revision = report.revision,
            touched = report.touched.len(),
            inserted = report.inserted,
            skipped_duplicates = report.skipped_duplicates,
            removed = report.removed,
            recomputed = report.recomputed,
            "store patch applied"
        );
        Ok(report)
    }

    fn validate(&self, patch: &WritePatch) -> Result<(), CacheError> {
        let mut created_users = HashSet::new();
        let mut created_groups = HashSet::new();
        let user_known = |id: &UserId, created: &HashSet<UserId>| {
            self.users.contains_key(id) || created.contains(id)
        };
        let group_known = |id: &GroupId, created: &HashSet<GroupId>| {
            self.groups.contains_key(id) || created.contains(id)
        };

        for op in &patch.ops {
            match op {
                WriteOp::UpsertUser(user) => {
                    created_users.insert(user.id);
                }
                WriteOp::UpsertGroup(group) => {
                    created_groups.insert(group.id);
                }
                WriteOp::RenameGroup { group_id, .. } | WriteOp::RemoveMessage { group_id, .. } => {
                    if !group_known(group_id, &created_groups) {
                        return Err(CacheError::not_found("group", group_id));
                    }
                }
                WriteOp::SetUserGroups { user_id, group_ids } => {
                    if !user_known(user_id, &created_users) {
                        return Err(CacheError::not_found("user", user_id));
                    }
                    if let Some(missing) = group_ids
                        .iter()
                        .find(|id| !group_known(*id, &created_groups))
                    {
                        return Err(CacheError::not_found("group", missing));
                    }
                }
                WriteOp::AppendUserGroup { user_id, group_id } => {
                    if !user_known(user_id, &created_users) {
                        return Err(CacheError::not_found("user", user_id));
                    }
                    if !group_known(group_id, &created_groups) {
                        return Err(CacheError::not_found("group", group_id));
                    }
                }
                WriteOp::InsertMessage { message, .. } => {
                    if !group_known(&message.to, &created_groups) {
                        return Err(CacheError::not_found("group", message.to));
                    }
                }
                WriteOp::ReplaceWindow { group_id, messages } => {
                    if !group_known(group_id, &created_groups) {
                        return Err(CacheError::not_found("group", group_id));
                    }
                    if let Some(stray) = messages.iter().find(|m| m.to != *group_id) {
                        return Err(CacheError::malformed(
                            "messages.to",
                            format!("message {} targets group {}", stray.id, stray.to),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_op(&mut self, op: WriteOp, report: &mut WriteReport) {
        match op {
            WriteOp::UpsertUser(user) => {
                if let Some(existing) = self.users.get(&user.id) {
                    if existing != &user {
                        trace!(user_id = %user.id, "ignoring change to immutable user");
                    }
                    return;
                }
                report.touched.insert(EntityKey::User(user.id));
                self.users.insert(user.id, user);
            }
            WriteOp::UpsertGroup(group) => {
                let key = EntityKey::Group(group.id);
                match self.groups.get_mut(&group.id) {
                    Some(record) => {
                        if record.group != group {
                            record.group = group;
                            report.touched.insert(key);
                        }
                    }
                    None => {
                        self.groups.insert(
                            group.id,
                            GroupRecord {
                                group,
                                window: MessageWindow::new(),
                            },
                        );
                        report.touched.insert(key);
                    }
                }
            }
            WriteOp::RenameGroup { group_id, name } => {
                if let Some(record) = self.groups.get_mut(&group_id)
                    && record.group.name != name
                {
                    record.group.name = name;
                    report.touched.insert(EntityKey::Group(group_id));
                }
            }
            WriteOp::SetUserGroups { user_id, group_ids } => {
                let mut seen = HashSet::new();
                let group_ids: Vec<GroupId> =
                    group_ids.into_iter().filter(|id| seen.insert(*id)).collect();
                if self.user_groups.get(&user_id) != Some(&group_ids) {
                    self.user_groups.insert(user_id, group_ids);
                    report.touched.insert(EntityKey::UserGroups(user_id));
                }
            }
            WriteOp::AppendUserGroup { user_id, group_id } => {
                let list = self.user_groups.entry(user_id).or_default();
                if !list.contains(&group_id) {
                    list.push(group_id);
                    report.touched.insert(EntityKey::UserGroups(user_id));
                }
            }
            WriteOp::InsertMessage { message, placement } => {
                self.insert_message(message, placement, report);
            }
            WriteOp::RemoveMessage { group_id, id } => {
                let Some(record) = self.groups.get_mut(&group_id) else {
                    return;
                };
                if record.window.remove(id).is_some() {
                    self.messages.remove(&id);
                    report.removed += 1;
                    report.touched.insert(EntityKey::Group(group_id));
                    report.touched.insert(EntityKey::Message(id));
                }
            }
            WriteOp::ReplaceWindow { group_id, messages } => {
                self.replace_window(group_id, messages, report);
            }
        }
    }

    fn insert_message(&mut self, message: Message, placement: Placement, report: &mut WriteReport) {
        let group_id = message.to;
        let Some(record) = self.groups.get_mut(&group_id) else {
            return;
        };

        let already_present = record.window.contains(message.id)
            || self
                .dedup
                .is_duplicate(&message, window_messages(&record.window, &self.messages));
        if already_present {
            trace!(message_id = %message.id, group_id = %group_id, "duplicate message skipped");
            report.skipped_duplicates += 1;
            return;
        }

        record
            .window
            .insert(message.id, message.inserted_at, placement);
        report.inserted += 1;
        report.touched.insert(EntityKey::Group(group_id));
        report.touched.insert(EntityKey::Message(message.id));
        self.messages.insert(message.id, message);
    }

    fn replace_window(&mut self, group_id: GroupId, page: Vec<Message>, report: &mut WriteReport) {
        let Some(record) = self.groups.get_mut(&group_id) else {
            return;
        };

        let previous: Vec<MessageId> = record.window.ids().collect();
        let surviving_pending: Vec<Message> = previous
            .iter()
            .filter_map(|id| self.messages.get(id))
            .filter(|message| message.is_pending())
            .filter(|message| self.dedup.find_counterpart(message, &page).is_none())
            .cloned()
            .collect();

        record.window.clear();
        let mut kept: HashMap<MessageId, Message> = HashMap::with_capacity(page.len());
        for message in page {
            if kept.contains_key(&message.id) {
                report.skipped_duplicates += 1;
                continue;
            }
            record
                .window
                .insert(message.id, message.inserted_at, Placement::Oldest);
            kept.insert(message.id, message);
        }
        for message in surviving_pending {
            record
                .window
                .insert(message.id, message.inserted_at, Placement::Newest);
            kept.insert(message.id, message);
        }

        let mut changed = !record.window.ids().eq(previous.iter().copied());
        for id in &previous {
            if !kept.contains_key(id) {
                self.messages.remove(id);
                report.removed += 1;
                report.touched.insert(EntityKey::Message(*id));
                changed = true;
            }
        }
        for (id, message) in kept {
            if !previous.contains(&id) {
                report.inserted += 1;
            }
            if self.messages.get(&id) != Some(&message) {
                report.touched.insert(EntityKey::Message(id));
                changed = true;
            }
            self.messages.insert(id, message);
        }

        if changed {
            report.touched.insert(EntityKey::Group(group_id));
        }
    }

    fn notify(&mut self, touched: &BTreeSet<EntityKey>) -> usize {
        let mut subscriptions = std::mem::take(&mut self.subscriptions);
        subscriptions.retain(|subscription| !subscription.tx.is_closed());

        let mut recomputed = 0;
        for subscription in &mut subscriptions {
            if !touched.iter().any(|key| subscription.deps.contains(key)) {
                continue;
            }
            let (view, deps) = query::project(self, &subscription.query);
            subscription.deps = deps;
            subscription.computations += 1;
            subscription.tx.send_replace(Projection {
                revision: self.revision,
                computations: subscription.computations,
                view,
            });
            recomputed += 1;
        }

        self.subscriptions = subscriptions;
        recomputed
    }
}

fn window_messages<'a>(
    window: &'a MessageWindow,
    messages: &'a HashMap<MessageId, Message>,
) -> impl Iterator<Item = &'a Message> + 'a {
    window.ids().filter_map(move |id| messages.get(&id))
}
