use chrono::{DateTime, Utc};

use crate::types::MessageId;

/// Tie-break used when an inserted message shares its timestamp with entries already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Land before equal timestamps (live and optimistic writes).
    Newest,
    /// Land after equal timestamps (older pages appended at the tail).
    Oldest,
}

/// One window slot. The timestamp is kept here so ordering never needs a table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    pub id: MessageId,
    pub inserted_at: DateTime<Utc>,
}

/// Ordered message ids of one group, most recent first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageWindow {
    entries: Vec<WindowEntry>,
}

impl MessageWindow {
    /// Empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current entries in display order (descending `inserted_at`).
    pub fn entries(&self) -> &[WindowEntry] {
        &self.entries
    }

    /// Number of entries, sentinels included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Number of entries the server already knows about.
    pub fn authoritative_len(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.id.is_pending()).count()
    }

    /// Whether the window has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry ids in display order.
    pub fn ids(&self) -> impl Iterator<Item = MessageId> + '_ {
        self.entries.iter().map(|entry| entry.id)
    }

    /// Whether `id` is in the window.
    pub fn contains(&self, id: MessageId) -> bool {
        self.position(id).is_some()
    }

    /// Index of `id`, if present.
    pub fn position(&self, id: MessageId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == id)
    }

    /// Most recent entry.
    pub fn head(&self) -> Option<&WindowEntry> {
        self.entries.first()
    }

    /// Oldest loaded entry.
    pub fn tail(&self) -> Option<&WindowEntry> {
        self.entries.last()
    }

    /// Index a message with `inserted_at` would occupy under `placement`.
    pub fn insertion_index(&self, inserted_at: DateTime<Utc>, placement: Placement) -> usize {
        match placement {
            Placement::Newest => self
                .entries
                .partition_point(|entry| entry.inserted_at > inserted_at),
            Placement::Oldest => self
                .entries
                .partition_point(|entry| entry.inserted_at >= inserted_at),
        }
    }

    /// Insert at the sorted position and return the index used.
    ///
    /// Does not check identity; callers dedup first.
    pub fn insert(
        &mut self,
        id: MessageId,
        inserted_at: DateTime<Utc>,
        placement: Placement,
    ) -> usize {
        let index = self.insertion_index(inserted_at, placement);
        self.entries.insert(index, WindowEntry { id, inserted_at });
        index
    }

    /// Remove `id`, returning its former index.
    pub fn remove(&mut self, id: MessageId) -> Option<usize> {
        let index = self.position(id)?;
        self.entries.remove(index);
        Some(index)
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Whether entries are ordered newest first.
    pub fn is_sorted_descending(&self) -> bool {
        self.entries
            .windows(2)
            .all(|pair| pair[0].inserted_at >= pair[1].inserted_at)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::types::PendingId;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0)
            .single()
            .expect("valid timestamp")
    }

    fn window(stamps: &[(i64, i64)]) -> MessageWindow {
        let mut window = MessageWindow::new();
        for (id, secs) in stamps {
            window.insert(MessageId::Authoritative(*id), at(*secs), Placement::Oldest);
        }
        window
    }

    fn ids(window: &MessageWindow) -> Vec<MessageId> {
        window.ids().collect()
    }

    #[test]
    fn newer_message_lands_at_head() {
        let mut w = window(&[(3, 30), (2, 20), (1, 10)]);
        let index = w.insert(MessageId::Pending(PendingId(1)), at(40), Placement::Newest);
        assert_eq!(index, 0);
        assert!(w.is_sorted_descending());
    }

    #[test]
    fn later_authoritative_message_keeps_head() {
        let mut w = window(&[(3, 50), (2, 20)]);
        let index = w.insert(MessageId::Pending(PendingId(1)), at(40), Placement::Newest);
        assert_eq!(index, 1);
        assert_eq!(
            ids(&w),
            vec![
                MessageId::Authoritative(3),
                MessageId::Pending(PendingId(1)),
                MessageId::Authoritative(2),
            ]
        );
    }

    #[test]
    fn placement_breaks_timestamp_ties() {
        let mut w = window(&[(2, 20), (1, 10)]);
        assert_eq!(w.insert(MessageId::Authoritative(5), at(20), Placement::Newest), 0);
        assert_eq!(w.insert(MessageId::Authoritative(6), at(20), Placement::Oldest), 2);
        assert_eq!(
            ids(&w),
            vec![
                MessageId::Authoritative(5),
                MessageId::Authoritative(2),
                MessageId::Authoritative(6),
                MessageId::Authoritative(1),
            ]
        );
    }

    #[test]
    fn older_entries_append_at_tail() {
        let mut w = window(&[(2, 20), (1, 10)]);
        assert_eq!(w.insert(MessageId::Authoritative(0), at(5), Placement::Oldest), 2);
        assert_eq!(w.tail().map(|e| e.id), Some(MessageId::Authoritative(0)));
    }

    #[test]
    fn remove_reports_former_index() {
        let mut w = window(&[(3, 30), (2, 20), (1, 10)]);
        assert_eq!(w.remove(MessageId::Authoritative(2)), Some(1));
        assert_eq!(w.remove(MessageId::Authoritative(2)), None);
        assert_eq!(w.len(), 2);
    }

    #[test]
    fn authoritative_len_skips_sentinels() {
        let mut w = window(&[(2, 20), (1, 10)]);
        w.insert(MessageId::Pending(PendingId(1)), at(30), Placement::Newest);
        assert_eq!(w.len(), 3);
        assert_eq!(w.authoritative_len(), 2);
    }
}
