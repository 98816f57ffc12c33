//! Table of live hotkey registrations
//!
//! The registry is the only owner of native hotkey slots. It lives on the
//! listener thread; other contexts see it through [`RegistryView`] snapshots.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::time::Duration;

use serde::Serialize;

use super::backend::{HotkeyBackend, NativeMessage, SlotId, MAX_SLOT_ID};
use super::KeyCombination;
use crate::native::OsError;
use crate::profile::ProfileId;

/// One active OS-level hotkey binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HotKeyRegistration {
    pub slot: SlotId,
    pub combination: KeyCombination,
    pub profile_id: ProfileId,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("{combination} is already bound to profile {existing}")]
    AlreadyBound {
        combination: KeyCombination,
        existing: ProfileId,
    },
    #[error("the OS refused {combination}: {reason}")]
    OsRejected {
        combination: KeyCombination,
        reason: String,
    },
    #[error("{0} has no primary key")]
    InvalidCombination(KeyCombination),
    #[error("profiles could not be listed: {0}")]
    ProfilesUnavailable(String),
    #[error("the hotkey listener is not running")]
    ListenerGone,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnregisterError {
    #[error("slot {0} is not registered")]
    NotRegistered(SlotId),
    #[error("the hotkey listener is not running")]
    ListenerGone,
}

/// Read-only copy of the registration table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryView {
    entries: Vec<HotKeyRegistration>,
}

impl RegistryView {
    pub fn entries(&self) -> &[HotKeyRegistration] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Slot → registration lookup used by the resolver.
pub trait SlotLookup: Send + Sync {
    fn registration(&self, slot: SlotId) -> Option<HotKeyRegistration>;

    fn lookup(&self, slot: SlotId) -> Option<ProfileId> {
        self.registration(slot).map(|r| r.profile_id)
    }
}

impl SlotLookup for RegistryView {
    fn registration(&self, slot: SlotId) -> Option<HotKeyRegistration> {
        self.entries.iter().find(|r| r.slot == slot).cloned()
    }
}

pub struct Registry<B: HotkeyBackend> {
    backend: B,
    entries: BTreeMap<SlotId, HotKeyRegistration>,
    slots: RangeInclusive<i32>,
    /// Next identifier to try. Released ids are only reused after the
    /// cursor wraps, so a press still queued for a released slot cannot
    /// land on a new binding.
    cursor: i32,
}

impl<B: HotkeyBackend> Registry<B> {
    pub fn new(backend: B) -> Self {
        Self::with_slot_range(backend, 1..=MAX_SLOT_ID)
    }

    /// Restrict the identifiers handed to the OS to `slots`.
    pub fn with_slot_range(backend: B, slots: RangeInclusive<i32>) -> Self {
        Self {
            backend,
            entries: BTreeMap::new(),
            cursor: *slots.start(),
            slots,
        }
    }

    /// Bind `combination` to `profile_id`.
    ///
    /// Binding a combination again to the profile that already owns it is a
    /// no-op that returns the existing slot.
    pub fn register(
        &mut self,
        combination: KeyCombination,
        profile_id: ProfileId,
    ) -> Result<SlotId, RegisterError> {
        if !combination.has_key() {
            return Err(RegisterError::InvalidCombination(combination));
        }

        if let Some(existing) = self
            .entries
            .values()
            .find(|r| r.combination == combination)
        {
            if existing.profile_id == profile_id {
                log::debug!(
                    "Hotkey {} already registered for profile {} in slot {}",
                    combination,
                    profile_id,
                    existing.slot
                );
                return Ok(existing.slot);
            }
            return Err(RegisterError::AlreadyBound {
                combination,
                existing: existing.profile_id,
            });
        }

        let slot = self.free_slot().ok_or_else(|| RegisterError::OsRejected {
            combination,
            reason: "no free hotkey identifiers remain".to_string(),
        })?;

        self.backend
            .register(slot, &combination)
            .map_err(|e| RegisterError::OsRejected {
                combination,
                reason: e.to_string(),
            })?;

        self.cursor = if slot.0 >= *self.slots.end() {
            *self.slots.start()
        } else {
            slot.0 + 1
        };
        self.entries.insert(
            slot,
            HotKeyRegistration {
                slot,
                combination,
                profile_id,
            },
        );
        log::info!(
            "Registered hotkey {} for profile {} in slot {}",
            combination,
            profile_id,
            slot
        );
        Ok(slot)
    }

    pub fn unregister(&mut self, slot: SlotId) -> Result<(), UnregisterError> {
        let registration = self
            .entries
            .remove(&slot)
            .ok_or(UnregisterError::NotRegistered(slot))?;

        // The table entry is gone either way; a native failure means the OS
        // had already dropped the hotkey.
        if let Err(e) = self.backend.unregister(slot) {
            log::warn!(
                "Native unregister of {} (slot {}) failed: {}",
                registration.combination,
                slot,
                e
            );
        } else {
            log::info!(
                "Unregistered hotkey {} (slot {})",
                registration.combination,
                slot
            );
        }
        Ok(())
    }

    /// Release every slot. Native failures are logged and returned, never raised.
    pub fn unregister_all(&mut self) -> Vec<(SlotId, OsError)> {
        let mut failures = Vec::new();
        for (slot, registration) in std::mem::take(&mut self.entries) {
            if let Err(e) = self.backend.unregister(slot) {
                log::warn!(
                    "Hotkey {} (slot {}) was already gone at shutdown: {}",
                    registration.combination,
                    slot,
                    e
                );
                failures.push((slot, e));
            }
        }
        failures
    }

    pub fn lookup(&self, slot: SlotId) -> Option<ProfileId> {
        self.entries.get(&slot).map(|r| r.profile_id)
    }

    pub fn view(&self) -> RegistryView {
        RegistryView {
            entries: self.entries.values().cloned().collect(),
        }
    }

    /// Pump the backend's native message queue.
    pub fn pump(&mut self, timeout: Duration) -> Vec<NativeMessage> {
        self.backend.pump(timeout)
    }

    /// First unused id at or after the cursor, wrapping around the range.
    fn free_slot(&self) -> Option<SlotId> {
        let (start, end) = (*self.slots.start(), *self.slots.end());
        if start > end {
            return None;
        }
        let cursor = self.cursor.clamp(start, end);
        (cursor..=end)
            .chain(start..cursor)
            .map(SlotId)
            .find(|slot| !self.entries.contains_key(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedHotkeys;

    fn ctrl_alt(key: u8) -> KeyCombination {
        KeyCombination::new(key as u16).ctrl().alt()
    }

    #[test]
    fn register_unregister_register_succeeds() {
        let os = SimulatedHotkeys::new();
        let mut registry = Registry::new(os.clone());

        let slot = registry.register(ctrl_alt(b'1'), ProfileId(1)).unwrap();
        assert_eq!(registry.lookup(slot), Some(ProfileId(1)));
        registry.unregister(slot).unwrap();
        assert!(os.registered().is_empty());

        let again = registry.register(ctrl_alt(b'1'), ProfileId(1)).unwrap();
        assert_eq!(registry.lookup(again), Some(ProfileId(1)));
        assert_eq!(os.registered(), vec![(again, ctrl_alt(b'1'))]);
    }

    #[test]
    fn combination_bound_to_other_profile_is_rejected() {
        let mut registry = Registry::new(SimulatedHotkeys::new());
        registry.register(ctrl_alt(b'1'), ProfileId(1)).unwrap();
        assert_eq!(
            registry.register(ctrl_alt(b'1'), ProfileId(2)),
            Err(RegisterError::AlreadyBound {
                combination: ctrl_alt(b'1'),
                existing: ProfileId(1),
            })
        );
    }

    #[test]
    fn rebinding_same_profile_is_a_noop() {
        let os = SimulatedHotkeys::new();
        let mut registry = Registry::new(os.clone());
        let first = registry.register(ctrl_alt(b'1'), ProfileId(1)).unwrap();
        let second = registry.register(ctrl_alt(b'1'), ProfileId(1)).unwrap();
        assert_eq!(first, second);
        assert_eq!(os.registered().len(), 1);
    }

    #[test]
    fn keyless_combination_is_invalid() {
        let mut registry = Registry::new(SimulatedHotkeys::new());
        let modifiers_only = KeyCombination::default().ctrl();
        assert_eq!(
            registry.register(modifiers_only, ProfileId(1)),
            Err(RegisterError::InvalidCombination(modifiers_only))
        );
    }

    #[test]
    fn os_refusal_leaves_table_untouched() {
        let os = SimulatedHotkeys::new();
        os.claim_elsewhere(ctrl_alt(b'9'));
        let mut registry = Registry::new(os);
        assert!(matches!(
            registry.register(ctrl_alt(b'9'), ProfileId(1)),
            Err(RegisterError::OsRejected { .. })
        ));
        assert!(registry.view().is_empty());
    }

    #[test]
    fn exhausted_slots_are_rejected() {
        let mut registry = Registry::with_slot_range(SimulatedHotkeys::new(), 1..=2);
        registry.register(ctrl_alt(b'1'), ProfileId(1)).unwrap();
        registry.register(ctrl_alt(b'2'), ProfileId(2)).unwrap();
        assert!(matches!(
            registry.register(ctrl_alt(b'3'), ProfileId(3)),
            Err(RegisterError::OsRejected { reason, .. }) if reason.contains("no free")
        ));
    }

    #[test]
    fn live_slots_are_never_shared() {
        let mut registry = Registry::with_slot_range(SimulatedHotkeys::new(), 1..=3);
        let a = registry.register(ctrl_alt(b'1'), ProfileId(1)).unwrap();
        let b = registry.register(ctrl_alt(b'2'), ProfileId(2)).unwrap();
        registry.unregister(a).unwrap();
        let c = registry.register(ctrl_alt(b'3'), ProfileId(3)).unwrap();
        assert_ne!(b, c);
        assert_eq!(registry.view().len(), 2);
    }

    #[test]
    fn released_slot_is_not_reused_right_away() {
        let mut registry = Registry::new(SimulatedHotkeys::new());
        let old = registry.register(ctrl_alt(b'1'), ProfileId(1)).unwrap();
        registry.unregister(old).unwrap();

        let new = registry.register(ctrl_alt(b'2'), ProfileId(2)).unwrap();
        assert_ne!(old, new);
        assert_eq!(registry.lookup(old), None);
    }

    #[test]
    fn slot_cursor_wraps_past_live_ids() {
        let mut registry = Registry::with_slot_range(SimulatedHotkeys::new(), 1..=3);
        let a = registry.register(ctrl_alt(b'1'), ProfileId(1)).unwrap();
        let b = registry.register(ctrl_alt(b'2'), ProfileId(2)).unwrap();
        let c = registry.register(ctrl_alt(b'3'), ProfileId(3)).unwrap();
        assert_eq!((a, b, c), (SlotId(1), SlotId(2), SlotId(3)));

        registry.unregister(b).unwrap();
        // Cursor wraps to 1, which is live, so 2 is the next free id.
        assert_eq!(
            registry.register(ctrl_alt(b'4'), ProfileId(4)).unwrap(),
            SlotId(2)
        );
    }

    #[test]
    fn second_unregister_fails_cleanly() {
        let mut registry = Registry::new(SimulatedHotkeys::new());
        let slot = registry.register(ctrl_alt(b'1'), ProfileId(1)).unwrap();
        registry.register(ctrl_alt(b'2'), ProfileId(2)).unwrap();
        registry.unregister(slot).unwrap();
        assert_eq!(
            registry.unregister(slot),
            Err(UnregisterError::NotRegistered(slot))
        );
        assert_eq!(registry.view().len(), 1);
    }

    #[test]
    fn unregister_all_collects_already_gone_slots() {
        let os = SimulatedHotkeys::new();
        let mut registry = Registry::new(os.clone());
        let a = registry.register(ctrl_alt(b'1'), ProfileId(1)).unwrap();
        registry.register(ctrl_alt(b'2'), ProfileId(2)).unwrap();
        os.revoke(a);

        let failures = registry.unregister_all();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, a);
        assert!(registry.view().is_empty());
        assert!(os.registered().is_empty());
    }

    #[test]
    fn view_answers_lookups() {
        let mut registry = Registry::new(SimulatedHotkeys::new());
        let slot = registry.register(ctrl_alt(b'5'), ProfileId(5)).unwrap();
        let view = registry.view();
        assert_eq!(view.lookup(slot), Some(ProfileId(5)));
        assert_eq!(view.lookup(SlotId(999)), None);
    }
}
