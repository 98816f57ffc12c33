//! OS seam for global hotkey registration

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::KeyCombination;
use crate::native::OsError;

/// Native message identifier of a hotkey notification.
pub const WM_HOTKEY: u32 = 0x0312;

/// Highest identifier an application may use for a hotkey registration.
pub const MAX_SLOT_ID: i32 = 0xBFFF;

/// Identifier of one live global-hotkey registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub i32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A message dequeued from the native message queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeMessage {
    pub message: u32,
    pub wparam: usize,
    pub lparam: isize,
}

/// Native hotkey registration surface.
///
/// Implementations are created on, and only ever used from, the listener
/// thread, so they need not be `Send`.
pub trait HotkeyBackend {
    /// Claim `combination` under `slot`. Fails if the OS refuses it.
    fn register(&mut self, slot: SlotId, combination: &KeyCombination) -> Result<(), OsError>;

    /// Release the registration held under `slot`.
    fn unregister(&mut self, slot: SlotId) -> Result<(), OsError>;

    /// Wait up to `timeout` for native messages, run their default processing
    /// and return every message that was dequeued.
    fn pump(&mut self, timeout: Duration) -> Vec<NativeMessage>;
}
