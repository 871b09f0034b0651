//! Arena ownership for CacheChanges.
//!
//! Every sample a participant holds lives in one `ChangePool` slot, and the
//! writer/reader histories refer to it only through `ChangeRef` handles.
//! Slots are reused, and each handle is generation-checked: a handle that
//! outlived its sample dereferences to `None` instead of someone else's
//! data.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use slotmap::{new_key_type, SlotMap};

use crate::structure::cache_change::CacheChange;

new_key_type! {
  /// Handle into a `ChangePool`. Stale handles (slot released or reused)
  /// are detected by the generation counter inside the key.
  pub struct ChangeRef;
}

pub struct ChangePool {
  slots: SlotMap<ChangeRef, CacheChange>,
}

impl ChangePool {
  pub fn new() -> Self {
    Self::with_capacity(0)
  }

  /// Preallocates `allocated_samples` slots up front.
  pub fn with_capacity(allocated_samples: usize) -> Self {
    Self {
      slots: SlotMap::with_capacity_and_key(allocated_samples),
    }
  }

  pub fn insert(&mut self, change: CacheChange) -> ChangeRef {
    self.slots.insert(change)
  }

  pub fn get(&self, r: ChangeRef) -> Option<&CacheChange> {
    self.slots.get(r)
  }

  pub fn get_mut(&mut self, r: ChangeRef) -> Option<&mut CacheChange> {
    self.slots.get_mut(r)
  }

  /// Releases the slot and returns the sample. `None` means the handle was
  /// stale, which indicates a history bookkeeping bug.
  pub fn release(&mut self, r: ChangeRef) -> Option<CacheChange> {
    let released = self.slots.remove(r);
    if released.is_none() {
      error!("release of stale ChangeRef {r:?}");
    }
    released
  }

  pub fn len(&self) -> usize {
    self.slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }
}

impl Default for ChangePool {
  fn default() -> Self {
    Self::new()
  }
}
