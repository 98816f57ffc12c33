//! Resolves a hotkey slot (or a profile id) to the stored profile

use std::sync::Arc;

use super::{DisplayProfile, ProfileId, ProfileStore};
use crate::hotkey::{KeyCombination, SlotId, SlotLookup};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no hotkey is registered in slot {0}")]
    UnknownSlot(SlotId),
    #[error("profile {0} no longer exists")]
    ProfileNotFound(ProfileId),
    #[error("profile store unavailable: {0}")]
    StoreUnavailable(String),
}

#[derive(Clone)]
pub struct ProfileResolver {
    slots: Arc<dyn SlotLookup>,
    store: Arc<dyn ProfileStore>,
}

impl ProfileResolver {
    pub fn new(slots: Arc<dyn SlotLookup>, store: Arc<dyn ProfileStore>) -> Self {
        Self { slots, store }
    }

    /// Find the profile bound to `slot`. Issues at most one store read.
    pub fn resolve_by_slot(&self, slot: SlotId) -> Result<DisplayProfile, ResolveError> {
        let profile_id = self
            .slots
            .lookup(slot)
            .ok_or(ResolveError::UnknownSlot(slot))?;
        self.resolve_by_id(profile_id)
    }

    /// Resolve a hotkey press. The press must match the combination that is
    /// registered in `slot` now; a slot released and reassigned after the
    /// press was queued resolves as unknown.
    pub fn resolve_press(
        &self,
        slot: SlotId,
        pressed: &KeyCombination,
    ) -> Result<DisplayProfile, ResolveError> {
        let registration = self
            .slots
            .registration(slot)
            .filter(|r| r.combination.same_keys(pressed))
            .ok_or(ResolveError::UnknownSlot(slot))?;
        self.resolve_by_id(registration.profile_id)
    }

    pub fn resolve_by_id(&self, id: ProfileId) -> Result<DisplayProfile, ResolveError> {
        self.store
            .find_by_id(id)
            .map_err(|e| ResolveError::StoreUnavailable(e.to_string()))?
            .ok_or(ResolveError::ProfileNotFound(id))
    }
}
