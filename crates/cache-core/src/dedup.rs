use crate::types::Message;

/// Default time-adjacency tolerance between an optimistic message and its authoritative copy.
pub const DEFAULT_PROXIMITY_MS: u64 = 30_000;

/// Identity checks shared by reconciliation and pagination merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupFilter {
    proximity_ms: u64,
}

impl Default for DedupFilter {
    fn default() -> Self {
        Self::new(DEFAULT_PROXIMITY_MS)
    }
}

impl DedupFilter {
    /// Filter matching pending copies within `proximity_ms`.
    pub fn new(proximity_ms: u64) -> Self {
        Self { proximity_ms }
    }

    /// Matching window in milliseconds.
    pub fn proximity_ms(&self) -> u64 {
        self.proximity_ms
    }

    /// Whether `candidate` is already present in `existing`.
    ///
    /// Only authoritative ids are compared. A pending candidate is new by construction.
    pub fn is_duplicate<'a, I>(&self, candidate: &Message, existing: I) -> bool
    where
        I: IntoIterator<Item = &'a Message>,
    {
        let Some(id) = candidate.id.authoritative() else {
            return false;
        };
        existing
            .into_iter()
            .any(|message| message.id.authoritative() == Some(id))
    }

    /// Position of the authoritative entry that is the same logical message as a pending `candidate`.
    ///
    /// The server id is unknown to the client, so matching falls back to an identical
    /// `(from, to, text)` tuple with timestamps inside the proximity tolerance.
    pub fn find_counterpart<'a, I>(&self, candidate: &Message, existing: I) -> Option<usize>
    where
        I: IntoIterator<Item = &'a Message>,
    {
        if !candidate.is_pending() {
            return None;
        }
        existing.into_iter().position(|message| {
            !message.is_pending() && self.same_logical_message(candidate, message)
        })
    }

    fn same_logical_message(&self, a: &Message, b: &Message) -> bool {
        a.from == b.from
            && a.to == b.to
            && a.text == b.text
            && (a.inserted_at - b.inserted_at)
                .num_milliseconds()
                .unsigned_abs()
                <= self.proximity_ms
    }
}
