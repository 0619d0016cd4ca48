//! Distributor enablement state for snapshot and blob-restore gating.
//!
//! At most one exclusive operation — a cluster snapshot or a blob-restore
//! preparation — may suspend data movement at a time. This module provides a
//! type-safe wrapper around the state machine that tracks which operation, if
//! any, currently holds that slot.
//!
//! # Safety Properties
//!
//! 1. **Exclusive transitions**: `try_set_snapshot` and
//!    `try_set_blob_restore_preparing` succeed only from the enabled state.
//! 2. **Owner-checked release**: `try_set_enabled` releases the slot only
//!    when the caller presents the id that acquired it, so a stale snapshot
//!    cannot re-enable movement under a newer operation.
//! 3. **Duplicate detection**: `same_id` lets at-least-once senders detect
//!    their own in-flight request and avoid double-acquisition.

use std::sync::Mutex;

use uuid::Uuid;

/// Which exclusive operation currently suspends data movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Enabled,
    Snapshotting(Uuid),
    BlobRestorePreparing(Uuid),
}

/// Tracks whether data movement is enabled or suspended by an exclusive
/// operation.
#[derive(Debug)]
pub struct DdEnabledState {
    slot: Mutex<Slot>,
}

impl Default for DdEnabledState {
    fn default() -> Self {
        Self::new()
    }
}

impl DdEnabledState {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Enabled),
        }
    }

    /// True when no exclusive operation holds the slot.
    pub fn is_enabled(&self) -> bool {
        *self.slot.lock().expect("enabled state lock poisoned") == Slot::Enabled
    }

    /// True when a blob-restore preparation holds the slot.
    pub fn is_blob_restore_preparing(&self) -> bool {
        matches!(
            *self.slot.lock().expect("enabled state lock poisoned"),
            Slot::BlobRestorePreparing(_)
        )
    }

    /// True when the given id is the one currently holding the slot.
    pub fn same_id(&self, id: Uuid) -> bool {
        match *self.slot.lock().expect("enabled state lock poisoned") {
            Slot::Snapshotting(held) | Slot::BlobRestorePreparing(held) => held == id,
            Slot::Enabled => false,
        }
    }

    /// Acquire the slot for a snapshot. Fails if any exclusive operation is
    /// already in flight.
    pub fn try_set_snapshot(&self, snap_id: Uuid) -> bool {
        let mut slot = self.slot.lock().expect("enabled state lock poisoned");
        if *slot == Slot::Enabled {
            *slot = Slot::Snapshotting(snap_id);
            true
        } else {
            false
        }
    }

    /// Acquire the slot for a blob-restore preparation. Fails if any
    /// exclusive operation is already in flight.
    pub fn try_set_blob_restore_preparing(&self, requester: Uuid) -> bool {
        let mut slot = self.slot.lock().expect("enabled state lock poisoned");
        if *slot == Slot::Enabled {
            *slot = Slot::BlobRestorePreparing(requester);
            true
        } else {
            false
        }
    }

    /// Release the slot. Succeeds when already enabled or when `id` matches
    /// the holder.
    pub fn try_set_enabled(&self, id: Uuid) -> bool {
        let mut slot = self.slot.lock().expect("enabled state lock poisoned");
        match *slot {
            Slot::Enabled => true,
            Slot::Snapshotting(held) | Slot::BlobRestorePreparing(held) if held == id => {
                *slot = Slot::Enabled;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_enabled() {
        let state = DdEnabledState::new();
        assert!(state.is_enabled());
        assert!(!state.is_blob_restore_preparing());
    }

    #[test]
    fn test_snapshot_acquire_release() {
        let state = DdEnabledState::new();
        let snap = Uuid::new_v4();
        assert!(state.try_set_snapshot(snap));
        assert!(!state.is_enabled());
        assert!(state.same_id(snap));

        // A second exclusive operation is rejected.
        assert!(!state.try_set_snapshot(Uuid::new_v4()));
        assert!(!state.try_set_blob_restore_preparing(Uuid::new_v4()));

        // Wrong id cannot release.
        assert!(!state.try_set_enabled(Uuid::new_v4()));
        assert!(state.try_set_enabled(snap));
        assert!(state.is_enabled());
    }

    #[test]
    fn test_blob_restore_acquire() {
        let state = DdEnabledState::new();
        let requester = Uuid::new_v4();
        assert!(state.try_set_blob_restore_preparing(requester));
        assert!(state.is_blob_restore_preparing());
        assert!(state.same_id(requester));
        assert!(!state.try_set_snapshot(Uuid::new_v4()));
        assert!(state.try_set_enabled(requester));
        assert!(state.is_enabled());
    }

    #[test]
    fn test_enable_is_idempotent() {
        let state = DdEnabledState::new();
        assert!(state.try_set_enabled(Uuid::new_v4()));
        assert!(state.is_enabled());
    }
}
