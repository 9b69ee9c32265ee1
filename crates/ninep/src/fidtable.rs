//! Fixed-capacity fid table.
//!
//! Each session owns exactly one `FidTable`, sized at construction and
//! never reallocated: a fid slot is a linearly-scanned array entry, not a
//! `HashMap` bucket, so a session's worst-case fid memory is bounded and
//! known up front (spec §4.3, Design Note 1).

use crate::error::{string, Error};
use crate::fcall::QId;

/// Per-fid state the storage gateway attaches to an open handle.
#[derive(Clone, Debug)]
pub struct FidState {
    /// Opaque handle the storage gateway uses to identify this open
    /// object; meaningless to the session/handler layer.
    pub handle: u64,
    pub qid: QId,
    /// Path (relative to the export root) this fid currently names,
    /// kept only for diagnostics and `Twalk` from `..`-style lookups.
    pub path: String,
    pub opened: bool,
}

impl FidState {
    pub fn new(handle: u64, qid: QId, path: String) -> Self {
        FidState {
            handle,
            qid,
            path,
            opened: false,
        }
    }
}

#[derive(Clone, Debug)]
struct Slot {
    fid: u32,
    state: FidState,
}

/// Array-backed fid table with a fixed number of slots.
///
/// Allocation, lookup, and free are all O(n) in the number of live fids,
/// which is bounded by `capacity` and expected to be small (tens, not
/// thousands) per spec §4.3.
pub struct FidTable {
    slots: Vec<Option<Slot>>,
    next_qid_path: u64,
}

impl FidTable {
    pub fn new(capacity: usize) -> Self {
        FidTable {
            slots: (0..capacity).map(|_| None).collect(),
            // path 1 is reserved for the root (see QId::ROOT_PATH)
            next_qid_path: QId::ROOT_PATH + 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand out the next unique qid path for a newly-created filesystem
    /// object. Monotonically increasing for the lifetime of the session.
    pub fn next_qid_path(&mut self) -> u64 {
        let path = self.next_qid_path;
        self.next_qid_path += 1;
        path
    }

    fn find(&self, fid: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, Some(slot) if slot.fid == fid))
    }

    /// True if `fid` already names a live slot.
    pub fn contains(&self, fid: u32) -> bool {
        self.find(fid).is_some()
    }

    /// Insert a new fid. Fails if `fid` is already in use or the table is
    /// full (spec §4.3 edge cases).
    pub fn insert(&mut self, fid: u32, state: FidState) -> Result<(), Error> {
        if self.contains(fid) {
            return Err(Error::proto(string::FID_IN_USE));
        }
        let free = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or_else(|| Error::proto(string::OUT_OF_FIDS))?;
        self.slots[free] = Some(Slot { fid, state });
        Ok(())
    }

    pub fn get(&self, fid: u32) -> Option<&FidState> {
        self.find(fid).map(|i| &self.slots[i].as_ref().unwrap().state)
    }

    pub fn get_mut(&mut self, fid: u32) -> Option<&mut FidState> {
        let i = self.find(fid)?;
        Some(&mut self.slots[i].as_mut().unwrap().state)
    }

    /// Remove a fid and return its state, per `Tclunk`/`Tremove` (spec
    /// §4.6). Clunking an unknown fid is an edge case, not a fatal error.
    pub fn remove(&mut self, fid: u32) -> Option<FidState> {
        let i = self.find(fid)?;
        self.slots[i].take().map(|s| s.state)
    }

    /// Release every slot. Called on session teardown (spec §4.4); must
    /// be idempotent since teardown can be triggered more than once.
    ///
    /// This does not close any open storage handle the released fids
    /// held — the table has no access to the storage gateway, so that is
    /// the caller's responsibility (see `Session::close_open_handles`,
    /// which runs before every call to this method).
    pub fn clear(&mut self) {
        for s in self.slots.iter_mut() {
            *s = None;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &FidState)> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref().map(|slot| (slot.fid, &slot.state)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::QIdType;

    fn qid(path: u64) -> QId {
        QId {
            typ: QIdType::FILE,
            version: 0,
            path,
        }
    }

    #[test]
    fn insert_and_lookup() {
        let mut table = FidTable::new(4);
        table
            .insert(1, FidState::new(10, qid(2), "a".into()))
            .unwrap();
        assert!(table.contains(1));
        assert_eq!(table.get(1).unwrap().handle, 10);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn duplicate_fid_rejected() {
        let mut table = FidTable::new(4);
        table
            .insert(1, FidState::new(10, qid(2), "a".into()))
            .unwrap();
        let err = table
            .insert(1, FidState::new(11, qid(3), "b".into()))
            .unwrap_err();
        assert_eq!(err.as_reply_string(), string::FID_IN_USE);
    }

    #[test]
    fn table_rejects_insert_past_capacity() {
        let mut table = FidTable::new(2);
        table.insert(1, FidState::new(1, qid(2), "a".into())).unwrap();
        table.insert(2, FidState::new(2, qid(3), "b".into())).unwrap();
        let err = table
            .insert(3, FidState::new(3, qid(4), "c".into()))
            .unwrap_err();
        assert_eq!(err.as_reply_string(), string::OUT_OF_FIDS);
    }

    #[test]
    fn remove_frees_the_slot_for_reuse() {
        let mut table = FidTable::new(1);
        table.insert(5, FidState::new(1, qid(2), "a".into())).unwrap();
        assert!(table.remove(5).is_some());
        assert!(table.remove(5).is_none());
        table.insert(6, FidState::new(2, qid(3), "b".into())).unwrap();
        assert!(table.contains(6));
    }

    #[test]
    fn qid_paths_increase_monotonically_and_skip_root() {
        let mut table = FidTable::new(1);
        let a = table.next_qid_path();
        let b = table.next_qid_path();
        assert!(a > QId::ROOT_PATH);
        assert!(b > a);
    }

    #[test]
    fn clear_is_idempotent() {
        let mut table = FidTable::new(2);
        table.insert(1, FidState::new(1, qid(2), "a".into())).unwrap();
        table.clear();
        table.clear();
        assert!(table.is_empty());
    }
}
