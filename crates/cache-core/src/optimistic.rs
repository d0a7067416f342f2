use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::CacheError,
    store::{EntityStore, WriteOp, WritePatch},
    types::{
        CreateGroupInput, CreateMessageInput, Group, GroupId, GroupSnapshot, Message, MessageId,
        MutationKind, MutationState, PendingHandle, PendingId, UpdateGroupInput, UserId,
    },
    window::Placement,
};

#[derive(Debug, Clone)]
struct MutationRecord {
    kind: MutationKind,
    state: MutationState,
}

/// Applies speculative writes and reconciles them once the remote call settles.
///
/// Every tracked mutation moves `Pending -> Committed` or `Pending -> RolledBack`
/// exactly once. Settling twice is rejected without touching the store.
#[derive(Debug, Default)]
pub struct OptimisticWriteCoordinator {
    next_pending: u64,
    mutations: HashMap<Uuid, MutationRecord>,
}

impl OptimisticWriteCoordinator {
    /// Coordinator with no tracked mutations.
    pub fn new() -> Self {
        Self::default()
    }

    /// State of `txn_id`, if tracked.
    pub fn state(&self, txn_id: Uuid) -> Option<MutationState> {
        self.mutations.get(&txn_id).map(|record| record.state)
    }

    /// Mutations still waiting for their remote call.
    pub fn pending_count(&self) -> usize {
        self.mutations
            .values()
            .filter(|record| record.state == MutationState::Pending)
            .count()
    }

    /// Insert a sentinel message for `input` and start tracking the mutation.
    pub fn begin_create_message(
        &mut self,
        store: &mut EntityStore,
        input: &CreateMessageInput,
        now: DateTime<Utc>,
    ) -> Result<PendingHandle, CacheError> {
        self.next_pending += 1;
        let sentinel = MessageId::Pending(PendingId(self.next_pending));
        store.write(WritePatch::new().with(WriteOp::InsertMessage {
            message: Message {
                id: sentinel,
                from: input.user_id,
                to: input.group_id,
                inserted_at: now,
                text: input.text.clone(),
            },
            placement: Placement::Newest,
        }))?;

        let handle = self.track(MutationKind::CreateMessage, Some(input.group_id), Some(sentinel));
        debug!(
            txn_id = %handle.txn_id,
            group_id = %input.group_id,
            sentinel = %sentinel,
            "optimistic message inserted"
        );
        Ok(handle)
    }

    /// Promote the sentinel to `outcome`'s message, or remove it when the call failed.
    pub fn settle_create_message(
        &mut self,
        store: &mut EntityStore,
        handle: &PendingHandle,
        outcome: Result<Message, CacheError>,
    ) -> Result<Message, CacheError> {
        self.ensure_pending(handle, MutationKind::CreateMessage, "settle_create_message")?;
        let (Some(group_id), Some(sentinel)) = (handle.group_id, handle.sentinel) else {
            return Err(CacheError::invalid_transition(
                Some(MutationState::Pending),
                "settle_create_message without sentinel",
            ));
        };

        let outcome = outcome.and_then(|message| {
            if message.is_pending() || message.to != group_id {
                Err(CacheError::malformed(
                    "createMessage",
                    format!(
                        "expected an authoritative message for group {group_id}, got {} for group {}",
                        message.id, message.to
                    ),
                ))
            } else {
                Ok(message)
            }
        });

        let message = match outcome {
            Ok(message) => message,
            Err(err) => {
                self.rollback_sentinel(store, group_id, sentinel);
                self.finish(handle, MutationState::RolledBack);
                warn!(
                    txn_id = %handle.txn_id,
                    group_id = %group_id,
                    code = %err.code,
                    "create_message rolled back"
                );
                return Err(err);
            }
        };

        if store.group(group_id).is_none() {
            warn!(txn_id = %handle.txn_id, group_id = %group_id, "group gone before promotion; discarding");
            self.finish(handle, MutationState::Committed);
            return Ok(message);
        }

        let report = match store.write(WritePatch::from(vec![
            WriteOp::RemoveMessage {
                group_id,
                id: sentinel,
            },
            WriteOp::InsertMessage {
                message: message.clone(),
                placement: Placement::Newest,
            },
        ])) {
            Ok(report) => report,
            Err(err) => {
                self.finish(handle, MutationState::RolledBack);
                return Err(err);
            }
        };
        self.finish(handle, MutationState::Committed);
        debug!(
            txn_id = %handle.txn_id,
            message_id = %message.id,
            sentinel_present = report.removed > 0,
            deduped = report.skipped_duplicates > 0,
            "optimistic message promoted"
        );
        Ok(message)
    }

    /// Track a group creation. Nothing is written until the call succeeds.
    pub fn begin_create_group(&mut self, input: &CreateGroupInput) -> PendingHandle {
        let handle = self.track(MutationKind::CreateGroup, None, None);
        debug!(txn_id = %handle.txn_id, name = %input.name, "create_group started");
        handle
    }

    /// Store the created group and append it to the creator's group list.
    pub fn settle_create_group(
        &mut self,
        store: &mut EntityStore,
        handle: &PendingHandle,
        creator_id: UserId,
        outcome: Result<GroupSnapshot, CacheError>,
    ) -> Result<Group, CacheError> {
        self.ensure_pending(handle, MutationKind::CreateGroup, "settle_create_group")?;
        let snapshot = match outcome {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.finish(handle, MutationState::RolledBack);
                warn!(txn_id = %handle.txn_id, code = %err.code, "create_group failed");
                return Err(err);
            }
        };

        let group_id = snapshot.group.id;
        let mut patch = snapshot_patch(&snapshot);
        if store.user(creator_id).is_some() {
            patch.push(WriteOp::AppendUserGroup {
                user_id: creator_id,
                group_id,
            });
        } else {
            warn!(
                txn_id = %handle.txn_id,
                user_id = %creator_id,
                group_id = %group_id,
                "creator not loaded; group list left unchanged"
            );
        }

        if let Err(err) = store.write(patch) {
            self.finish(handle, MutationState::RolledBack);
            return Err(err);
        }
        self.finish(handle, MutationState::Committed);
        debug!(txn_id = %handle.txn_id, group_id = %group_id, "create_group committed");
        Ok(snapshot.group)
    }

    /// Track a group rename. Applied on success only.
    pub fn begin_update_group(&mut self, input: &UpdateGroupInput) -> PendingHandle {
        let handle = self.track(MutationKind::UpdateGroup, Some(input.group_id), None);
        debug!(txn_id = %handle.txn_id, group_id = %input.group_id, "update_group started");
        handle
    }

    /// Apply the returned name and members. Messages carried by the response are ignored.
    pub fn settle_update_group(
        &mut self,
        store: &mut EntityStore,
        handle: &PendingHandle,
        outcome: Result<GroupSnapshot, CacheError>,
    ) -> Result<Group, CacheError> {
        self.ensure_pending(handle, MutationKind::UpdateGroup, "settle_update_group")?;
        let snapshot = match outcome {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.finish(handle, MutationState::RolledBack);
                warn!(txn_id = %handle.txn_id, code = %err.code, "update_group failed");
                return Err(err);
            }
        };

        let group_id = snapshot.group.id;
        if handle.group_id.is_some_and(|expected| expected != group_id) {
            self.finish(handle, MutationState::RolledBack);
            return Err(CacheError::malformed(
                "updateGroup.id",
                format!("response carried group {group_id}"),
            ));
        }

        if store.group(group_id).is_none() {
            warn!(txn_id = %handle.txn_id, group_id = %group_id, "group not loaded; update discarded");
            self.finish(handle, MutationState::Committed);
            return Ok(snapshot.group);
        }

        let mut patch: WritePatch = snapshot
            .members
            .iter()
            .cloned()
            .map(WriteOp::UpsertUser)
            .collect();
        patch.push(WriteOp::UpsertGroup(snapshot.group.clone()));
        if let Err(err) = store.write(patch) {
            self.finish(handle, MutationState::RolledBack);
            return Err(err);
        }
        self.finish(handle, MutationState::Committed);
        debug!(txn_id = %handle.txn_id, group_id = %group_id, "update_group committed");
        Ok(snapshot.group)
    }

    fn track(
        &mut self,
        kind: MutationKind,
        group_id: Option<GroupId>,
        sentinel: Option<MessageId>,
    ) -> PendingHandle {
        let txn_id = Uuid::new_v4();
        self.mutations.insert(
            txn_id,
            MutationRecord {
                kind,
                state: MutationState::Pending,
            },
        );
        PendingHandle {
            txn_id,
            kind,
            group_id,
            sentinel,
        }
    }

    fn ensure_pending(
        &self,
        handle: &PendingHandle,
        kind: MutationKind,
        action: &str,
    ) -> Result<(), CacheError> {
        match self.mutations.get(&handle.txn_id) {
            Some(record) if record.state == MutationState::Pending && record.kind == kind => Ok(()),
            other => Err(CacheError::invalid_transition(
                other.map(|record| record.state),
                action,
            )),
        }
    }

    fn finish(&mut self, handle: &PendingHandle, next: MutationState) {
        if let Some(record) = self.mutations.get_mut(&handle.txn_id) {
            record.state = next;
        }
    }

    fn rollback_sentinel(&self, store: &mut EntityStore, group_id: GroupId, sentinel: MessageId) {
        if store.group(group_id).is_none() {
            return;
        }
        if let Err(err) = store.write(WritePatch::new().with(WriteOp::RemoveMessage {
            group_id,
            id: sentinel,
        })) {
            warn!(group_id = %group_id, code = %err.code, "sentinel removal failed");
        }
    }
}

/// Write ops storing a group snapshot: members, senders, metadata and seed messages.
pub fn snapshot_patch(snapshot: &GroupSnapshot) -> WritePatch {
    let mut patch: WritePatch = snapshot
        .members
        .iter()
        .chain(snapshot.senders.iter())
        .cloned()
        .map(WriteOp::UpsertUser)
        .collect();
    patch.push(WriteOp::UpsertGroup(snapshot.group.clone()));
    for message in &snapshot.messages {
        patch.push(WriteOp::InsertMessage {
            message: message.clone(),
            placement: Placement::Oldest,
        });
    }
    patch
}
