use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::CacheError,
    store::{EntityStore, WriteOp, WritePatch},
    types::{GroupId, Message},
    window::Placement,
};

/// Hard cap on a single page request.
pub const MAX_PAGE_LIMIT: usize = 100;

/// Outcome of merging one page into a group's window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeResult {
    pub group_id: GroupId,
    /// Offset the page was requested at (window length before the merge).
    pub offset: usize,
    pub appended: usize,
    pub skipped_duplicates: usize,
    /// No older messages remain on the server.
    pub exhausted: bool,
    pub window_len: usize,
}

/// Remote fetch the caller must perform before calling `complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub group_id: GroupId,
    pub offset: usize,
    pub limit: usize,
}

/// What `begin` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTicket {
    /// Fetch this page, then hand the response to `complete`.
    Fetch(PageRequest),
    /// Pagination already exhausted; the window is unchanged and nothing should be fetched.
    Exhausted(MergeResult),
}

/// Serializes per-group backward pagination and merges fetched pages.
#[derive(Debug, Clone)]
pub struct PaginationMerger {
    page_size: usize,
    in_flight: HashSet<GroupId>,
    exhausted: HashSet<GroupId>,
}

impl PaginationMerger {
    /// Merger requesting `page_size` messages per page, clamped to the server cap.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: Self::bounded_limit(page_size),
            in_flight: HashSet::new(),
            exhausted: HashSet::new(),
        }
    }

    /// Clamp a requested page size into `1..=MAX_PAGE_LIMIT`.
    pub fn bounded_limit(requested: usize) -> usize {
        requested.clamp(1, MAX_PAGE_LIMIT)
    }

    /// Configured page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether a fetch for `group_id` is outstanding.
    pub fn is_in_flight(&self, group_id: GroupId) -> bool {
        self.in_flight.contains(&group_id)
    }

    /// Whether the group's history is fully loaded.
    pub fn is_exhausted(&self, group_id: GroupId) -> bool {
        self.exhausted.contains(&group_id)
    }

    /// Reserve the next page for `group_id`.
    ///
    /// Rejects with `Busy` while another request for the group is outstanding.
    pub fn begin(&mut self, store: &EntityStore, group_id: GroupId) -> Result<PageTicket, CacheError> {
        let Some(window) = store.window(group_id) else {
            warn!(group_id = %group_id, "pagination requested for unknown group");
            return Err(CacheError::not_found("group", group_id));
        };
        if self.in_flight.contains(&group_id) {
            debug!(group_id = %group_id, "pagination rejected while in flight");
            return Err(CacheError::busy(group_id));
        }

        // Sentinels are not on the server yet, so they must not advance the offset.
        let offset = window.authoritative_len();
        if self.exhausted.contains(&group_id) {
            return Ok(PageTicket::Exhausted(MergeResult {
                group_id,
                offset,
                appended: 0,
                skipped_duplicates: 0,
                exhausted: true,
                window_len: window.len(),
            }));
        }

        self.in_flight.insert(group_id);
        Ok(PageTicket::Fetch(PageRequest {
            group_id,
            offset,
            limit: self.page_size,
        }))
    }

    /// Reserve a head reload (offset 0) for `group_id`. Shares the in-flight slot with `begin`.
    pub fn begin_reload(&mut self, store: &EntityStore, group_id: GroupId) -> Result<PageRequest, CacheError> {
        if store.group(group_id).is_none() {
            return Err(CacheError::not_found("group", group_id));
        }
        if !self.in_flight.insert(group_id) {
            return Err(CacheError::busy(group_id));
        }
        Ok(PageRequest {
            group_id,
            offset: 0,
            limit: self.page_size,
        })
    }

    /// Merge the response to a `Fetch` ticket. Always releases the in-flight slot.
    ///
    /// A failed fetch leaves the window unchanged and returns the error.
    pub fn complete(
        &mut self,
        store: &mut EntityStore,
        request: PageRequest,
        response: Result<Vec<Message>, CacheError>,
    ) -> Result<MergeResult, CacheError> {
        self.in_flight.remove(&request.group_id);
        let page = response.inspect_err(|err| {
            warn!(
                group_id = %request.group_id,
                code = %err.code,
                "page fetch failed; window unchanged"
            );
        })?;
        self.merge_page(store, request, page)
    }

    /// Replace the window with a reloaded head page. Always releases the in-flight slot.
    pub fn complete_reload(
        &mut self,
        store: &mut EntityStore,
        request: PageRequest,
        response: Result<Vec<Message>, CacheError>,
    ) -> Result<MergeResult, CacheError> {
        self.in_flight.remove(&request.group_id);
        let page = response.inspect_err(|err| {
            warn!(
                group_id = %request.group_id,
                code = %err.code,
                "head reload failed; window unchanged"
            );
        })?;
        let fetched = page.len();
        let report = store.write(WritePatch::new().with(WriteOp::ReplaceWindow {
            group_id: request.group_id,
            messages: page,
        }))?;

        let exhausted = fetched < request.limit;
        self.set_exhausted(request.group_id, exhausted);
        let window_len = store.window(request.group_id).map_or(0, |w| w.len());
        debug!(
            group_id = %request.group_id,
            fetched,
            window_len,
            exhausted,
            "group window reloaded"
        );
        Ok(MergeResult {
            group_id: request.group_id,
            offset: 0,
            appended: report.inserted,
            skipped_duplicates: report.skipped_duplicates,
            exhausted,
            window_len,
        })
    }

    /// Append an older page to the window tail, skipping messages the window already holds.
    pub fn merge_page(
        &mut self,
        store: &mut EntityStore,
        request: PageRequest,
        page: Vec<Message>,
    ) -> Result<MergeResult, CacheError> {
        let group_id = request.group_id;
        if let Some(stray) = page.iter().find(|message| message.to != group_id) {
            return Err(CacheError::malformed(
                "messages.to",
                format!("page for group {group_id} carried message {} for group {}", stray.id, stray.to),
            ));
        }

        let fetched = page.len();
        let patch: WritePatch = page
            .into_iter()
            .map(|message| WriteOp::InsertMessage {
                message,
                placement: Placement::Oldest,
            })
            .collect();
        let report = if patch.is_empty() {
            None
        } else {
            Some(store.write(patch)?)
        };

        let exhausted = fetched < request.limit;
        if exhausted {
            self.exhausted.insert(group_id);
        }
        let window_len = store.window(group_id).map_or(0, |w| w.len());
        let result = MergeResult {
            group_id,
            offset: request.offset,
            appended: report.as_ref().map_or(0, |r| r.inserted),
            skipped_duplicates: report.as_ref().map_or(0, |r| r.skipped_duplicates),
            exhausted,
            window_len,
        };
        debug!(
            group_id = %group_id,
            offset = result.offset,
            fetched,
            appended = result.appended,
            skipped = result.skipped_duplicates,
            exhausted,
            "page merged"
        );
        Ok(result)
    }

    fn set_exhausted(&mut self, group_id: GroupId, exhausted: bool) {
        if exhausted {
            self.exhausted.insert(group_id);
        } else {
            self.exhausted.remove(&group_id);
        }
    }
}
