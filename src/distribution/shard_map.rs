//! The live shard-to-team assignment.
//!
//! [`ShardTeamMap`] is the authoritative in-memory mapping from key ranges to
//! their owning teams. It maintains two invariants the rest of the core
//! relies on:
//!
//! - **Partition**: the registered ranges exactly tile the full keyspace,
//!   with no gaps and no overlaps. The map is a boundary map — an entry at
//!   key `k` owns `[k, next_boundary)` — so the invariant holds by
//!   construction.
//! - **Unique ownership**: each range has at most one primary team and, in
//!   multi-region mode, at most one remote team.
//!
//! The map also carries the restart-tracker channel: when a preserved data
//! move re-registers a range, the external shard tracker is told to restart
//! its per-shard tracking there.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::types::{Key, KeyRange, Team};

/// Teams owning one range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardTeams {
    teams: Vec<Team>,
}

impl ShardTeams {
    pub fn teams(&self) -> &[Team] {
        &self.teams
    }

    pub fn primary(&self) -> Option<&Team> {
        self.teams.iter().find(|t| t.is_primary())
    }

    pub fn remote(&self) -> Option<&Team> {
        self.teams.iter().find(|t| !t.is_primary())
    }
}

/// Live mapping: shard range → (primary team, remote team).
pub struct ShardTeamMap {
    /// Boundary map covering the whole keyspace. The entry at the empty key
    /// always exists; an entry's value owns keys up to the next boundary.
    boundaries: BTreeMap<Key, ShardTeams>,
    restart_tx: mpsc::UnboundedSender<KeyRange>,
    restart_rx: Mutex<Option<mpsc::UnboundedReceiver<KeyRange>>>,
}

impl Default for ShardTeamMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardTeamMap {
    pub fn new() -> Self {
        let mut boundaries = BTreeMap::new();
        boundaries.insert(Key::new(), ShardTeams::default());
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        Self {
            boundaries,
            restart_tx,
            restart_rx: Mutex::new(Some(restart_rx)),
        }
    }

    /// Introduce boundaries at `range.begin` and `range.end`, splitting any
    /// ranges they fall inside. Team assignments of the split pieces are
    /// inherited.
    pub fn define_shard(&mut self, range: &KeyRange) {
        if range.is_empty() {
            return;
        }
        self.ensure_boundary(&range.begin);
        if range.end < crate::types::max_key() {
            self.ensure_boundary(&range.end);
        }
    }

    fn ensure_boundary(&mut self, key: &Key) {
        if self.boundaries.contains_key(key) {
            return;
        }
        let inherited = self
            .boundaries
            .range(..=key.clone())
            .next_back()
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        self.boundaries.insert(key.clone(), inherited);
    }

    /// Assign teams to every piece inside `range`. Boundaries must already
    /// exist at the range edges (via [`Self::define_shard`]).
    pub fn move_shard(&mut self, range: &KeyRange, teams: Vec<Team>) {
        debug_assert!(
            teams.iter().filter(|t| t.is_primary()).count() <= 1
                && teams.iter().filter(|t| !t.is_primary()).count() <= 1,
            "a shard has at most one team per region role"
        );
        self.define_shard(range);
        let assignment = ShardTeams { teams };
        let inside: Vec<Key> = self
            .boundaries
            .range(range.begin.clone()..range.end.clone())
            .map(|(k, _)| k.clone())
            .collect();
        for key in inside {
            self.boundaries.insert(key, assignment.clone());
        }
    }

    /// The teams owning the range containing `key`.
    pub fn teams_for(&self, key: &Key) -> &ShardTeams {
        self.boundaries
            .range(..=key.clone())
            .next_back()
            .map(|(_, v)| v)
            .expect("boundary map always has an entry at the empty key")
    }

    /// Every registered range with its teams, in key order. The ranges tile
    /// the full keyspace.
    pub fn ranges(&self) -> Vec<(KeyRange, ShardTeams)> {
        let mut out = Vec::with_capacity(self.boundaries.len());
        let mut iter = self.boundaries.iter().peekable();
        while let Some((begin, teams)) = iter.next() {
            let end = iter
                .peek()
                .map(|(k, _)| (*k).clone())
                .unwrap_or_else(crate::types::max_key);
            out.push((
                KeyRange {
                    begin: begin.clone(),
                    end,
                },
                teams.clone(),
            ));
        }
        out
    }

    /// Ask the external shard tracker to restart tracking on `range`.
    pub fn restart_shard_tracker(&self, range: KeyRange) {
        let _ = self.restart_tx.send(range);
    }

    /// Take the restart-notification receiver. The shard tracker calls this
    /// once when it starts.
    pub fn take_restart_notifications(&self) -> Option<mpsc::UnboundedReceiver<KeyRange>> {
        self.restart_rx
            .lock()
            .expect("restart receiver lock poisoned")
            .take()
    }

    /// Drop all shard state synchronously. Used on cancellation, where
    /// deferred cleanup would let tasks observe a dead incarnation's map.
    pub fn clear(&mut self) {
        self.boundaries.clear();
        self.boundaries.insert(Key::new(), ShardTeams::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use uuid::Uuid;

    fn key(s: &str) -> Key {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn range(a: &str, b: &str) -> KeyRange {
        KeyRange::new(key(a), key(b))
    }

    fn team(primary: bool) -> Team {
        Team::new(vec![Uuid::new_v4()], primary)
    }

    fn assert_tiles(map: &ShardTeamMap) {
        let ranges = map.ranges();
        assert!(!ranges.is_empty());
        assert!(ranges[0].0.begin.is_empty());
        assert_eq!(ranges.last().unwrap().0.end, crate::types::max_key());
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].0.end, pair[1].0.begin, "gap or overlap in tiling");
        }
    }

    #[test]
    fn test_empty_map_tiles_all_keys() {
        let map = ShardTeamMap::new();
        assert_tiles(&map);
        assert_eq!(map.ranges().len(), 1);
    }

    #[test]
    fn test_define_and_move_preserves_tiling() {
        let mut map = ShardTeamMap::new();
        map.define_shard(&range("b", "d"));
        map.define_shard(&range("d", "f"));
        assert_tiles(&map);

        let t = team(true);
        map.move_shard(&range("b", "d"), vec![t.clone()]);
        assert_tiles(&map);
        assert_eq!(map.teams_for(&key("c")).primary(), Some(&t));
        assert_eq!(map.teams_for(&key("a")).primary(), None);
        assert_eq!(map.teams_for(&key("e")).primary(), None);
    }

    #[test]
    fn test_move_overwrites_inner_pieces() {
        let mut map = ShardTeamMap::new();
        let t1 = team(true);
        let t2 = team(true);
        map.move_shard(&range("b", "f"), vec![t1]);
        map.move_shard(&range("c", "d"), vec![t2.clone()]);
        assert_tiles(&map);
        assert_eq!(map.teams_for(&key("c")).primary(), Some(&t2));
        assert_ne!(map.teams_for(&key("e")).primary(), Some(&t2));
    }

    #[test]
    fn test_unique_ownership_per_role() {
        let mut map = ShardTeamMap::new();
        let primary = team(true);
        let remote = team(false);
        map.move_shard(&range("a", "m"), vec![primary.clone(), remote.clone()]);
        let owners = map.teams_for(&key("b"));
        assert_eq!(owners.primary(), Some(&primary));
        assert_eq!(owners.remote(), Some(&remote));
        assert_eq!(owners.teams().len(), 2);
    }

    #[test]
    fn test_split_inherits_teams() {
        let mut map = ShardTeamMap::new();
        let t = team(true);
        map.move_shard(&range("a", "z"), vec![t.clone()]);
        map.define_shard(&range("f", "k"));
        assert_tiles(&map);
        assert_eq!(map.teams_for(&key("g")).primary(), Some(&t));
        assert_eq!(map.teams_for(&key("m")).primary(), Some(&t));
    }

    #[test]
    fn test_restart_notifications() {
        let map = ShardTeamMap::new();
        let mut rx = map.take_restart_notifications().unwrap();
        assert!(map.take_restart_notifications().is_none());
        map.restart_shard_tracker(range("a", "b"));
        assert_eq!(rx.try_recv().unwrap(), range("a", "b"));
    }

    #[test]
    fn test_clear_resets_to_single_range() {
        let mut map = ShardTeamMap::new();
        map.move_shard(&range("a", "b"), vec![team(true)]);
        map.clear();
        assert_tiles(&map);
        assert_eq!(map.ranges().len(), 1);
        assert_eq!(map.teams_for(&key("a")).teams().len(), 0);
    }
}
