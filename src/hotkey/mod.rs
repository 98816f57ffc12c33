//! Global hotkey handling
//!
//! Hotkeys are registered with the OS on a dedicated listener thread (the OS
//! delivers hotkey notifications to the thread that registered them). The
//! listener decodes notifications into [`HotkeyEvent`]s and forwards them to
//! the activation pipeline through a bounded channel.

pub mod backend;
pub mod codec;
pub mod manager;
pub mod registry;
#[cfg(windows)]
pub mod win32;

pub use backend::{HotkeyBackend, NativeMessage, SlotId, WM_HOTKEY};
pub use manager::{
    failed_status, HotkeyEvent, HotkeyEvents, HotkeyManager, HotkeyStatus, ListenerOptions,
    RegistryWatch,
};
pub use registry::{
    HotKeyRegistration, RegisterError, Registry, RegistryView, SlotLookup, UnregisterError,
};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Modifier bits of the native hotkey payload (`MOD_*` values).
pub const MOD_ALT: u16 = 0x0001;
pub const MOD_CONTROL: u16 = 0x0002;
pub const MOD_SHIFT: u16 = 0x0004;
pub const MOD_WIN: u16 = 0x0008;
pub const MOD_NOREPEAT: u16 = 0x4000;

/// A hotkey combination (modifiers + virtual key code)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyCombination {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub meta: bool,
    pub no_repeat: bool,
    /// Virtual key code. Zero means "no primary key".
    pub key: u16,
}

impl KeyCombination {
    pub fn new(key: u16) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }

    pub fn ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn alt(mut self) -> Self {
        self.alt = true;
        self
    }

    pub fn shift(mut self) -> Self {
        self.shift = true;
        self
    }

    pub fn meta(mut self) -> Self {
        self.meta = true;
        self
    }

    pub fn no_repeat(mut self) -> Self {
        self.no_repeat = true;
        self
    }

    /// Whether a primary (non-modifier) key is present.
    pub fn has_key(&self) -> bool {
        self.key != 0
    }

    /// Same modifiers and key, ignoring the no-repeat flag the OS does not echo.
    pub fn same_keys(&self, other: &KeyCombination) -> bool {
        let strip = |c: &KeyCombination| KeyCombination {
            no_repeat: false,
            ..*c
        };
        strip(self) == strip(other)
    }

    /// Modifier flags in the native `MOD_*` bit layout.
    pub fn modifier_bits(&self) -> u16 {
        let mut bits = 0;
        if self.alt {
            bits |= MOD_ALT;
        }
        if self.ctrl {
            bits |= MOD_CONTROL;
        }
        if self.shift {
            bits |= MOD_SHIFT;
        }
        if self.meta {
            bits |= MOD_WIN;
        }
        if self.no_repeat {
            bits |= MOD_NOREPEAT;
        }
        bits
    }
}

impl fmt::Display for KeyCombination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if self.ctrl {
            parts.push("Ctrl".into());
        }
        if self.alt {
            parts.push("Alt".into());
        }
        if self.shift {
            parts.push("Shift".into());
        }
        if self.meta {
            parts.push("Win".into());
        }
        if self.no_repeat {
            parts.push("NoRepeat".into());
        }
        parts.push(key_name(self.key));
        write!(f, "{}", parts.join("+"))
    }
}

/// Error parsing the textual form of a [`KeyCombination`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseKeyError {
    #[error("hotkey is empty")]
    Empty,
    #[error("unknown key `{0}`")]
    UnknownKey(String),
    #[error("hotkey `{0}` names more than one primary key")]
    MultipleKeys(String),
    #[error("hotkey `{0}` has no primary key")]
    MissingKey(String),
}

impl FromStr for KeyCombination {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ParseKeyError::Empty);
        }

        let mut combination = KeyCombination::default();
        for part in trimmed.split('+').map(str::trim) {
            match part.to_ascii_lowercase().as_str() {
                "ctrl" | "control" => combination.ctrl = true,
                "alt" => combination.alt = true,
                "shift" => combination.shift = true,
                "win" | "meta" | "super" => combination.meta = true,
                "norepeat" => combination.no_repeat = true,
                _ => {
                    if combination.has_key() {
                        return Err(ParseKeyError::MultipleKeys(trimmed.to_string()));
                    }
                    combination.key = key_code(part)
                        .ok_or_else(|| ParseKeyError::UnknownKey(part.to_string()))?;
                }
            }
        }

        if !combination.has_key() {
            return Err(ParseKeyError::MissingKey(trimmed.to_string()));
        }
        Ok(combination)
    }
}

impl TryFrom<String> for KeyCombination {
    type Error = ParseKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeyCombination> for String {
    fn from(value: KeyCombination) -> Self {
        value.to_string()
    }
}

const NAMED_KEYS: &[(&str, u16)] = &[
    ("Backspace", 0x08),
    ("Tab", 0x09),
    ("Enter", 0x0D),
    ("Pause", 0x13),
    ("Escape", 0x1B),
    ("Space", 0x20),
    ("PageUp", 0x21),
    ("PageDown", 0x22),
    ("End", 0x23),
    ("Home", 0x24),
    ("Left", 0x25),
    ("Up", 0x26),
    ("Right", 0x27),
    ("Down", 0x28),
    ("PrintScreen", 0x2C),
    ("Insert", 0x2D),
    ("Delete", 0x2E),
];

/// Human-readable name for a virtual key code.
pub fn key_name(code: u16) -> String {
    match code {
        0x30..=0x39 | 0x41..=0x5A => char::from(code as u8).to_string(),
        0x60..=0x69 => format!("Num{}", code - 0x60),
        0x70..=0x87 => format!("F{}", code - 0x70 + 1),
        _ => NAMED_KEYS
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(name, _)| (*name).to_string())
            .unwrap_or_else(|| format!("0x{:02X}", code)),
    }
}

/// Virtual key code for a key name, accepting the forms produced by [`key_name`].
pub fn key_code(name: &str) -> Option<u16> {
    if let Some(hex) = name
        .strip_prefix("0x")
        .or_else(|| name.strip_prefix("0X"))
    {
        return u16::from_str_radix(hex, 16).ok().filter(|c| *c != 0);
    }

    let mut chars = name.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        let upper = c.to_ascii_uppercase();
        if upper.is_ascii_digit() || upper.is_ascii_uppercase() {
            return Some(upper as u16);
        }
        return None;
    }

    let lower = name.to_ascii_lowercase();
    if let Some(n) = lower.strip_prefix("num").and_then(|d| d.parse::<u16>().ok()) {
        return (n <= 9).then_some(0x60 + n);
    }
    if let Some(n) = lower.strip_prefix('f').and_then(|d| d.parse::<u16>().ok()) {
        return (1..=24).contains(&n).then_some(0x70 + n - 1);
    }

    NAMED_KEYS
        .iter()
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
        .map(|(_, code)| *code)
        .or(match lower.as_str() {
            "esc" => Some(0x1B),
            "return" => Some(0x0D),
            "del" => Some(0x2E),
            _ => None,
        })
}
