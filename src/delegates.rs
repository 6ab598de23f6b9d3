use crate::types::{Height, RegId};
use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

/// Active delegate sets as stored by the delegate cache.
///
/// A set rotation computed at `update_height` only takes effect for blocks
/// strictly above it. Blocks at or below keep the previous set, so votes for
/// recent blocks are judged against a stable set across the changeover.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActiveDelegates {
    pub current: Vec<RegId>,
    pub previous: Vec<RegId>,
    pub update_height: Height,
}

impl ActiveDelegates {
    /// Set in effect for a fixed delegate list that never rotated.
    pub fn fixed(delegates: Vec<RegId>) -> Self {
        Self {
            current: delegates,
            previous: vec![],
            update_height: 0,
        }
    }

    pub fn list_at(&self, height: Height) -> &[RegId] {
        if height > self.update_height || self.previous.is_empty() {
            &self.current
        } else {
            &self.previous
        }
    }

    pub fn set_at(&self, height: Height) -> BTreeSet<RegId> {
        self.list_at(height).iter().copied().collect()
    }

    pub fn contains_at(&self, height: Height, delegate: &RegId) -> bool {
        self.list_at(height).contains(delegate)
    }
}

/// Delegate cache collaborator. `None` means the snapshot is unavailable.
pub trait DelegateCache: Send + Sync {
    fn active_delegates(&self) -> Option<ActiveDelegates>;
}

/// In-memory delegate cache. Rotations replace the snapshot atomically.
#[derive(Debug, Default)]
pub struct StaticDelegates {
    snapshot: RwLock<Option<ActiveDelegates>>,
}

impl StaticDelegates {
    pub fn new(snapshot: ActiveDelegates) -> Self {
        Self {
            snapshot: RwLock::new(Some(snapshot)),
        }
    }

    /// Cache that has not loaded yet.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Installs a new current set computed at `update_height`; the old
    /// current set becomes the previous one.
    pub fn rotate(&self, next: Vec<RegId>, update_height: Height) {
        let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        let previous = guard.take().map(|s| s.current).unwrap_or_default();
        log::info!(
            target: "pbft",
            "delegate set rotated at height {}: {} -> {} delegates",
            update_height,
            previous.len(),
            next.len()
        );
        *guard = Some(ActiveDelegates {
            current: next,
            previous,
            update_height,
        });
    }

    pub fn set(&self, snapshot: Option<ActiveDelegates>) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
}

impl DelegateCache for StaticDelegates {
    fn active_delegates(&self) -> Option<ActiveDelegates> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
