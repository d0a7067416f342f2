//! Async session facade over the chat cache.
//!
//! `ChatCache` owns the session's single `EntityStore` and drives the
//! optimistic coordinator and the pagination merger against a `RemoteApi`.
//! The store lock is never held across a remote call, so resolutions apply in
//! the order they complete.

use std::sync::{Mutex, MutexGuard};

use cache_core::{
    CacheConfig, CacheError, CacheErrorCategory, CreateGroupInput, CreateMessageInput,
    EntityStore, EventHub, EventStream, Group, GroupId, MergeResult, Message, MutationState,
    OptimisticWriteCoordinator, PageTicket, PaginationMerger, PendingHandle, Query,
    QueryBinding, RemoteApi, SyncEvent, UpdateGroupInput, UserId, UserSnapshot, ViewModel,
    WriteOp, WritePatch, normalize_settlement, page_into_messages, snapshot_patch,
};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug)]
struct CacheState {
    store: EntityStore,
    coordinator: OptimisticWriteCoordinator,
    pagination: PaginationMerger,
}

/// One cache session bound to a remote API.
pub struct ChatCache<R: RemoteApi> {
    remote: R,
    config: CacheConfig,
    state: Mutex<CacheState>,
    events: EventHub,
}

impl<R: RemoteApi> ChatCache<R> {
    /// Build a cache over `remote` with an empty store.
    pub fn new(remote: R, config: CacheConfig) -> Self {
        Self {
            remote,
            state: Mutex::new(CacheState {
                store: EntityStore::new(config.dedup_filter()),
                coordinator: OptimisticWriteCoordinator::new(),
                pagination: PaginationMerger::new(config.page_size),
            }),
            events: EventHub::new(config.event_buffer),
            config,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Underlying remote API.
    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Subscribe to settle and pagination events.
    pub fn events(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Project `query` against the store once.
    pub fn read(&self, query: &Query) -> Result<ViewModel, CacheError> {
        Ok(self.lock()?.store.read(query))
    }

    /// Bind `query` to the store; the binding follows every relevant write.
    pub fn subscribe(&self, query: Query) -> Result<QueryBinding, CacheError> {
        Ok(self.lock()?.store.subscribe(query))
    }

    /// State of a tracked mutation.
    pub fn mutation_state(&self, txn_id: Uuid) -> Result<Option<MutationState>, CacheError> {
        Ok(self.lock()?.coordinator.state(txn_id))
    }

    /// Mutations still awaiting their remote result.
    pub fn pending_mutations(&self) -> Result<usize, CacheError> {
        Ok(self.lock()?.coordinator.pending_count())
    }

    /// Fetch `user_id` with its groups and store them in one patch.
    pub async fn load_user(&self, user_id: UserId) -> Result<UserSnapshot, CacheError> {
        let snapshot = self.remote.fetch_user(user_id).await?.into_snapshot()?;

        let mut patch = WritePatch::new().with(WriteOp::UpsertUser(snapshot.user.clone()));
        for group in &snapshot.groups {
            patch.append(snapshot_patch(group));
        }
        patch.push(WriteOp::SetUserGroups {
            user_id: snapshot.user.id,
            group_ids: snapshot.groups.iter().map(|group| group.group.id).collect(),
        });

        let report = self.lock()?.store.write(patch)?;
        info!(
            user_id = %snapshot.user.id,
            groups = snapshot.groups.len(),
            revision = report.revision,
            "user loaded"
        );
        Ok(snapshot)
    }

    /// Reload the head page of `group_id`, replacing its window.
    pub async fn open_group(&self, group_id: GroupId) -> Result<MergeResult, CacheError> {
        let request = {
            let mut state = self.lock()?;
            let CacheState {
                store, pagination, ..
            } = &mut *state;
            pagination.begin_reload(store, group_id)?
        };

        let response = self
            .remote
            .fetch_group_page(group_id, request.offset, request.limit)
            .await
            .and_then(page_into_messages);

        let result = {
            let mut state = self.lock()?;
            let CacheState {
                store, pagination, ..
            } = &mut *state;
            pagination.complete_reload(store, request, response)?
        };
        self.events.emit(SyncEvent::WindowReloaded {
            group_id,
            len: result.window_len,
            exhausted: result.exhausted,
        });
        Ok(result)
    }

    /// Extend the window of `group_id` backward by one page.
    ///
    /// Rejected with `Busy` while another page for the group is outstanding;
    /// once exhausted, returns the unchanged window without a remote call.
    pub async fn load_more_messages(&self, group_id: GroupId) -> Result<MergeResult, CacheError> {
        let ticket = {
            let mut state = self.lock()?;
            let CacheState {
                store, pagination, ..
            } = &mut *state;
            pagination.begin(store, group_id)?
        };
        let request = match ticket {
            PageTicket::Fetch(request) => request,
            PageTicket::Exhausted(result) => {
                debug!(group_id = %group_id, "pagination exhausted; skipping fetch");
                return Ok(result);
            }
        };

        let response = self
            .remote
            .fetch_group_page(group_id, request.offset, request.limit)
            .await
            .and_then(page_into_messages);

        let result = {
            let mut state = self.lock()?;
            let CacheState {
                store, pagination, ..
            } = &mut *state;
            pagination.complete(store, request, response)?
        };
        self.events.emit(SyncEvent::PageMerged(result));
        Ok(result)
    }

    /// Send a message optimistically and reconcile it with the server's copy.
    pub async fn create_message(&self, input: CreateMessageInput) -> Result<Message, CacheError> {
        let handle = {
            let mut state = self.lock()?;
            let CacheState {
                store, coordinator, ..
            } = &mut *state;
            coordinator.begin_create_message(store, &input, Utc::now())?
        };

        let outcome = self
            .remote
            .create_message(input)
            .await
            .and_then(|payload| payload.into_message());

        let settled = {
            let mut state = self.lock()?;
            let CacheState {
                store, coordinator, ..
            } = &mut *state;
            coordinator.settle_create_message(store, &handle, outcome)
        };
        self.emit_settlement(&handle, &settled);
        settled
    }

    /// Create a group; it is stored and listed for the creator only once the server confirms.
    pub async fn create_group(&self, input: CreateGroupInput) -> Result<Group, CacheError> {
        let creator_id = input.creator_id;
        let handle = self.lock()?.coordinator.begin_create_group(&input);

        let outcome = self
            .remote
            .create_group(input)
            .await
            .and_then(|payload| payload.into_snapshot());

        let settled = {
            let mut state = self.lock()?;
            let CacheState {
                store, coordinator, ..
            } = &mut *state;
            coordinator.settle_create_group(store, &handle, creator_id, outcome)
        };
        self.emit_settlement(&handle, &settled);
        settled
    }

    /// Rename a group once the server confirms.
    pub async fn update_group(&self, input: UpdateGroupInput) -> Result<Group, CacheError> {
        let handle = self.lock()?.coordinator.begin_update_group(&input);

        let outcome = self
            .remote
            .update_group(input)
            .await
            .and_then(|payload| payload.into_snapshot());

        let settled = {
            let mut state = self.lock()?;
            let CacheState {
                store, coordinator, ..
            } = &mut *state;
            coordinator.settle_update_group(store, &handle, outcome)
        };
        self.emit_settlement(&handle, &settled);
        settled
    }

    fn emit_settlement<T>(&self, handle: &PendingHandle, settled: &Result<T, CacheError>) {
        if let Err(err) = settled {
            warn!(
                txn_id = %handle.txn_id,
                kind = ?handle.kind,
                code = %err.code,
                "mutation settled with failure"
            );
        }
        self.events.emit(normalize_settlement(handle, settled));
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>, CacheError> {
        self.state.lock().map_err(|_| {
            CacheError::new(
                CacheErrorCategory::Internal,
                "poisoned_lock",
                "cache state lock poisoned",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cache_core::{
        GroupPayload, MessageId, MessagePayload, MutationKind, UserPayload,
    };
    use cache_remote_memory::{InMemoryRemote, RemoteOp};
    use tokio::time::timeout;

    use super::*;

    struct Session {
        remote: InMemoryRemote,
        cache: ChatCache<InMemoryRemote>,
        alice: UserId,
        group: GroupId,
    }

    async fn session(messages: usize, config: CacheConfig) -> Session {
        let remote = InMemoryRemote::new();
        let alice = remote.add_user("alice").expect("add alice");
        let bob = remote.add_user("bob").expect("add bob");
        let group = remote
            .add_group("crew", &[alice.id, bob.id])
            .expect("add group");
        for n in 1..=messages {
            remote
                .post_message(group.id, bob.id, &format!("m{n}"))
                .expect("post message");
        }

        let cache = ChatCache::new(remote.clone(), config);
        cache.load_user(alice.id).await.expect("load user");
        Session {
            remote,
            cache,
            alice: alice.id,
            group: group.id,
        }
    }

    fn window(cache: &ChatCache<impl RemoteApi>, group: GroupId) -> Vec<(MessageId, String, bool)> {
        cache
            .read(&Query::GroupWindow { group_id: group })
            .expect("read")
            .as_group_window()
            .map(|view| {
                view.messages
                    .iter()
                    .map(|m| (m.id, m.text.clone(), m.is_pending))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn input(session: &Session, text: &str) -> CreateMessageInput {
        CreateMessageInput {
            group_id: session.group,
            user_id: session.alice,
            text: text.to_owned(),
        }
    }

    #[tokio::test]
    async fn load_user_lists_groups_with_latest_message() {
        let s = session(3, CacheConfig::default()).await;
        let view = s
            .cache
            .read(&Query::UserGroups { user_id: s.alice })
            .expect("read");
        let view = view.as_user_groups().expect("user groups view");

        assert_eq!(view.user.username, "alice");
        assert_eq!(view.groups.len(), 1);
        let latest = view.groups[0]
            .latest_message
            .as_ref()
            .expect("latest message");
        assert_eq!(latest.text, "m3");
        assert_eq!(latest.sender_name.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn paginates_until_exhausted() {
        let s = session(25, CacheConfig::default()).await;

        let opened = s.cache.open_group(s.group).await.expect("open group");
        assert_eq!(opened.window_len, 10);
        assert!(!opened.exhausted);

        let second = s.cache.load_more_messages(s.group).await.expect("page 2");
        assert_eq!((second.offset, second.appended), (10, 10));
        let third = s.cache.load_more_messages(s.group).await.expect("page 3");
        assert_eq!((third.offset, third.appended), (20, 5));
        assert!(third.exhausted);

        let calls = s.remote.call_count(RemoteOp::FetchGroupPage).expect("count");
        let again = s.cache.load_more_messages(s.group).await.expect("no-op");
        assert!(again.exhausted);
        assert_eq!(again.window_len, 25);
        assert_eq!(
            s.remote.call_count(RemoteOp::FetchGroupPage).expect("count"),
            calls
        );

        let texts: Vec<String> = window(&s.cache, s.group).into_iter().map(|m| m.1).collect();
        let expected: Vec<String> = (1..=25).rev().map(|n| format!("m{n}")).collect();
        assert_eq!(texts, expected);
    }

    #[tokio::test]
    async fn create_message_promotes_server_copy() {
        let s = session(2, CacheConfig::default()).await;
        s.cache.open_group(s.group).await.expect("open group");
        let mut events = s.cache.events();

        let message = s
            .cache
            .create_message(input(&s, "hi"))
            .await
            .expect("create message");

        let window = window(&s.cache, s.group);
        assert_eq!(window.len(), 3);
        assert_eq!(window[0], (message.id, "hi".to_owned(), false));
        assert!(window.iter().all(|(_, _, pending)| !pending));

        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("settle event should arrive")
            .expect("event stream open");
        match event {
            SyncEvent::MutationSettled(ack) => {
                assert_eq!(ack.kind, MutationKind::CreateMessage);
                assert_eq!(ack.state, MutationState::Committed);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_create_message_rolls_back() {
        let s = session(2, CacheConfig::default()).await;
        s.cache.open_group(s.group).await.expect("open group");
        let before = window(&s.cache, s.group);
        let binding = s
            .cache
            .subscribe(Query::GroupWindow { group_id: s.group })
            .expect("subscribe");
        s.remote
            .fail_next(
                RemoteOp::CreateMessage,
                CacheError::remote("server_error", "500"),
            )
            .expect("queue fault");

        let err = s
            .cache
            .create_message(input(&s, "lost"))
            .await
            .expect_err("failure should surface");

        assert_eq!(err.code, "server_error");
        assert_eq!(window(&s.cache, s.group), before);
        assert_eq!(binding.current().computations, 3);
        assert_eq!(s.cache.pending_mutations().expect("count"), 0);
    }

    #[tokio::test]
    async fn sentinel_is_visible_while_call_is_outstanding() {
        let s = session(1, CacheConfig::default()).await;
        s.cache.open_group(s.group).await.expect("open group");
        let gate = s.remote.hold_next(RemoteOp::CreateMessage).expect("hold");

        let (sent, observed) = tokio::join!(s.cache.create_message(input(&s, "hi")), async {
            let observed = window(&s.cache, s.group);
            gate.release();
            observed
        });

        let sent = sent.expect("create message");
        assert_eq!(observed.len(), 2);
        assert!(observed[0].2, "head should be the pending sentinel");
        assert_eq!(observed[0].1, "hi");
        assert_eq!(window(&s.cache, s.group)[0].0, sent.id);
    }

    #[tokio::test]
    async fn resolutions_apply_in_completion_order() {
        let s = session(0, CacheConfig::default()).await;
        s.cache.open_group(s.group).await.expect("open group");
        let gate = s.remote.hold_next(RemoteOp::CreateMessage).expect("hold");

        let (first, (second, mid_flight)) = tokio::join!(
            s.cache.create_message(input(&s, "first")),
            async {
                let second = s.cache.create_message(input(&s, "second")).await;
                let mid_flight = window(&s.cache, s.group);
                gate.release();
                (second, mid_flight)
            }
        );

        let first = first.expect("first message");
        let second = second.expect("second message");
        assert!(second.id < first.id, "later-issued call resolved first");
        assert_eq!(mid_flight.len(), 2);
        assert_eq!(mid_flight.iter().filter(|m| m.2).count(), 1);

        let ids: Vec<MessageId> = window(&s.cache, s.group).into_iter().map(|m| m.0).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn second_page_request_is_busy() {
        let s = session(15, CacheConfig::default()).await;
        s.cache.open_group(s.group).await.expect("open group");
        let before = window(&s.cache, s.group);
        let gate = s.remote.hold_next(RemoteOp::FetchGroupPage).expect("hold");

        let (first, (second, unchanged)) =
            tokio::join!(s.cache.load_more_messages(s.group), async {
                let second = s.cache.load_more_messages(s.group).await;
                let unchanged = window(&s.cache, s.group);
                gate.release();
                (second, unchanged)
            });

        let err = second.expect_err("concurrent pagination should be rejected");
        assert_eq!(err.category, CacheErrorCategory::Busy);
        assert_eq!(unchanged, before);
        assert_eq!(first.expect("first page").appended, 5);
    }

    #[tokio::test]
    async fn failed_page_fetch_keeps_window() {
        let s = session(15, CacheConfig::default()).await;
        s.cache.open_group(s.group).await.expect("open group");
        let before = window(&s.cache, s.group);
        s.remote
            .disconnect_next(RemoteOp::FetchGroupPage)
            .expect("queue disconnect");

        let err = s
            .cache
            .load_more_messages(s.group)
            .await
            .expect_err("failure should surface");
        assert_eq!(err.code, "transport_failed");
        assert_eq!(window(&s.cache, s.group), before);

        let retry = s.cache.load_more_messages(s.group).await.expect("retry");
        assert_eq!(retry.appended, 5);
    }

    #[tokio::test]
    async fn create_group_appends_to_creator_list() {
        let s = session(0, CacheConfig::default()).await;
        let bob = UserId(2);

        let group = s
            .cache
            .create_group(CreateGroupInput {
                name: "lunch".into(),
                user_ids: vec![bob],
                creator_id: s.alice,
            })
            .await
            .expect("create group");

        let view = s
            .cache
            .read(&Query::UserGroups { user_id: s.alice })
            .expect("read");
        let names: Vec<&str> = view
            .as_user_groups()
            .expect("user groups view")
            .groups
            .iter()
            .map(|g| g.name.as_str())
            .collect();
        assert_eq!(names, vec!["crew", "lunch"]);
        assert_eq!(group.users, vec![s.alice, bob]);
    }

    #[tokio::test]
    async fn update_group_applies_on_success_only() {
        let s = session(0, CacheConfig::default()).await;
        let name = |cache: &ChatCache<InMemoryRemote>| {
            cache
                .read(&Query::GroupWindow { group_id: s.group })
                .expect("read")
                .as_group_window()
                .map(|view| view.name.clone())
        };

        s.remote
            .fail_next(
                RemoteOp::UpdateGroup,
                CacheError::remote("server_error", "500"),
            )
            .expect("queue fault");
        s.cache
            .update_group(UpdateGroupInput {
                group_id: s.group,
                name: "renamed".into(),
            })
            .await
            .expect_err("failure should surface");
        assert_eq!(name(&s.cache).as_deref(), Some("crew"));

        s.cache
            .update_group(UpdateGroupInput {
                group_id: s.group,
                name: "renamed".into(),
            })
            .await
            .expect("update");
        assert_eq!(name(&s.cache).as_deref(), Some("renamed"));

        let err = s
            .cache
            .update_group(UpdateGroupInput {
                group_id: GroupId(404),
                name: "ghost".into(),
            })
            .await
            .expect_err("unknown group");
        assert_eq!(err.category, CacheErrorCategory::NotFound);
    }

    /// Drops `insertedAt` from created messages.
    struct TruncatingRemote(InMemoryRemote);

    impl RemoteApi for TruncatingRemote {
        async fn fetch_user(&self, user_id: UserId) -> Result<UserPayload, CacheError> {
            self.0.fetch_user(user_id).await
        }

        async fn fetch_group_page(
            &self,
            group_id: GroupId,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<MessagePayload>, CacheError> {
            self.0.fetch_group_page(group_id, offset, limit).await
        }

        async fn create_message(
            &self,
            input: CreateMessageInput,
        ) -> Result<MessagePayload, CacheError> {
            let mut payload = self.0.create_message(input).await?;
            payload.inserted_at = None;
            Ok(payload)
        }

        async fn create_group(&self, input: CreateGroupInput) -> Result<GroupPayload, CacheError> {
            self.0.create_group(input).await
        }

        async fn update_group(&self, input: UpdateGroupInput) -> Result<GroupPayload, CacheError> {
            self.0.update_group(input).await
        }
    }

    #[tokio::test]
    async fn malformed_response_rolls_back_like_remote_failure() {
        let s = session(1, CacheConfig::default()).await;
        let cache = ChatCache::new(TruncatingRemote(s.remote.clone()), CacheConfig::default());
        cache.load_user(s.alice).await.expect("load user");
        cache.open_group(s.group).await.expect("open group");
        let before = window(&cache, s.group);
        let mut events = cache.events();

        let err = cache
            .create_message(input(&s, "hi"))
            .await
            .expect_err("malformed response");

        assert_eq!(err.category, CacheErrorCategory::Malformed);
        assert!(err.is_remote_failure());
        assert_eq!(window(&cache, s.group), before);
        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("settle event should arrive")
            .expect("event stream open");
        assert!(matches!(
            event,
            SyncEvent::MutationSettled(ack)
                if ack.state == MutationState::RolledBack
                    && ack.error_code.as_deref() == Some("malformed_response")
        ));
    }

    #[tokio::test]
    async fn reload_keeps_sentinel_of_outstanding_send() {
        let s = session(1, CacheConfig::default()).await;
        s.cache.open_group(s.group).await.expect("open group");
        let gate = s.remote.hold_next(RemoteOp::CreateMessage).expect("hold");

        let (sent, reloaded) = tokio::join!(s.cache.create_message(input(&s, "hi")), async {
            let reloaded = s.cache.open_group(s.group).await;
            let during = window(&s.cache, s.group);
            gate.release();
            (reloaded, during)
        });

        let (reloaded, during) = reloaded;
        assert_eq!(reloaded.expect("reload").window_len, 2);
        assert!(during[0].2, "sentinel should survive the reload");

        let sent = sent.expect("create message");
        let after = window(&s.cache, s.group);
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].0, sent.id);
        assert!(after.iter().all(|m| !m.2));
    }

    #[tokio::test]
    async fn older_page_during_outstanding_send_leaves_no_gap() {
        let s = session(15, CacheConfig::default()).await;
        s.cache.open_group(s.group).await.expect("open group");
        let gate = s.remote.hold_next(RemoteOp::CreateMessage).expect("hold");

        let (sent, merged) = tokio::join!(s.cache.create_message(input(&s, "hi")), async {
            let merged = s.cache.load_more_messages(s.group).await;
            gate.release();
            merged
        });

        let merged = merged.expect("older page");
        assert_eq!(merged.offset, 10);
        assert_eq!(merged.appended, 5);
        sent.expect("create message");

        let texts: Vec<String> = window(&s.cache, s.group).into_iter().map(|m| m.1).collect();
        let mut expected = vec!["hi".to_owned()];
        expected.extend((1..=15).rev().map(|n| format!("m{n}")));
        assert_eq!(texts, expected);
    }
}
