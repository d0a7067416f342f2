//! Client-side chat cache core.
//!
//! This crate defines the normalized entity store, optimistic mutation
//! reconciliation, backward pagination merging, and the query bindings that
//! observe the store. Remote access is abstracted behind `RemoteApi`.

/// Environment-backed cache configuration.
pub mod config;
/// Identity checks between optimistic and authoritative messages.
pub mod dedup;
/// Stable cache error types.
pub mod error;
/// Settle and pagination notifications.
pub mod events;
/// Event normalization helpers (for example mutation acknowledgements).
pub mod normalization;
/// Optimistic write coordinator and its mutation state machine.
pub mod optimistic;
/// Per-group backward pagination.
pub mod pagination;
/// Query projections and live bindings.
pub mod query;
/// Remote API trait and wire payloads.
pub mod remote;
/// Normalized entity store and write patches.
pub mod store;
/// Entities, identifiers and mutation inputs.
pub mod types;
/// Ordered per-group message window.
pub mod window;

pub use config::{CacheConfig, ConfigError};
pub use dedup::{DEFAULT_PROXIMITY_MS, DedupFilter};
pub use error::{CacheError, CacheErrorCategory};
pub use events::{EventHub, EventStream, MutationAck, SyncEvent};
pub use normalization::{classify_transport_error, normalize_settlement};
pub use optimistic::{OptimisticWriteCoordinator, snapshot_patch};
pub use pagination::{MAX_PAGE_LIMIT, MergeResult, PageRequest, PageTicket, PaginationMerger};
pub use query::{
    GroupSummaryView, GroupWindowView, MessageView, Projection, Query, QueryBinding,
    UserGroupsView, ViewModel,
};
pub use remote::{
    GroupPayload, GroupRef, MessagePayload, RemoteApi, UserPayload, UserRef, page_into_messages,
};
pub use store::{EntityKey, EntityStore, WriteOp, WritePatch, WriteReport};
pub use types::{
    CreateGroupInput, CreateMessageInput, Group, GroupId, GroupSnapshot, Message, MessageId,
    MutationKind, MutationState, PendingHandle, PendingId, UpdateGroupInput, User, UserId,
    UserSnapshot,
};
pub use window::{MessageWindow, Placement, WindowEntry};
