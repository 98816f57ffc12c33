//! Decoding of native hotkey notification payloads
//!
//! The notification's packed parameter carries the modifier flags in the low
//! word and the virtual key code in the high word.

use super::{KeyCombination, MOD_ALT, MOD_CONTROL, MOD_NOREPEAT, MOD_SHIFT, MOD_WIN};

/// Decode the two halves of a hotkey payload into a [`KeyCombination`].
///
/// Total over all inputs: unknown modifier bits are ignored and the key code is
/// passed through unchanged, so an unmapped key fails later at resolution.
pub fn decode(low: u16, high: u16) -> KeyCombination {
    KeyCombination {
        ctrl: low & MOD_CONTROL != 0,
        alt: low & MOD_ALT != 0,
        shift: low & MOD_SHIFT != 0,
        meta: low & MOD_WIN != 0,
        no_repeat: low & MOD_NOREPEAT != 0,
        key: high,
    }
}

/// Decode a packed 32-bit payload (key in the upper 16 bits, modifiers in the lower 16).
pub fn decode_packed(packed: u32) -> KeyCombination {
    decode((packed & 0xFFFF) as u16, (packed >> 16) as u16)
}

/// Inverse of [`decode_packed`], used to synthesize notifications.
pub fn encode_packed(combination: &KeyCombination) -> u32 {
    ((combination.key as u32) << 16) | combination.modifier_bits() as u32
}
