//! Display profiles and their per-display settings diffs

pub mod resolver;
pub mod store;

pub use resolver::{ProfileResolver, ResolveError};
pub use store::{JsonProfileStore, MemoryProfileStore, ProfileStore, StoreError};

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::display::DisplayId;
use crate::hotkey::KeyCombination;

/// Identifier of a stored profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(pub u64);

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A requested override for one display property.
///
/// `Unspecified` means "leave the current value alone". Serialized as `null`
/// (or an absent field) for `Unspecified` and as the bare value otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Setting<T> {
    #[default]
    Unspecified,
    SetTo(T),
}

impl<T> Setting<T> {
    pub fn is_unspecified(&self) -> bool {
        matches!(self, Setting::Unspecified)
    }

    pub fn as_option(&self) -> Option<&T> {
        match self {
            Setting::Unspecified => None,
            Setting::SetTo(value) => Some(value),
        }
    }
}

impl<T: PartialEq> Setting<T> {
    /// The requested value when it differs from `current`.
    pub fn change_from(&self, current: &T) -> Option<&T> {
        self.as_option().filter(|requested| *requested != current)
    }
}

impl<T> From<Option<T>> for Setting<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Setting::SetTo(v),
            None => Setting::Unspecified,
        }
    }
}

impl<T: Serialize> Serialize for Setting<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_option().serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Setting<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<T>::deserialize(deserializer).map(Setting::from)
    }
}

/// Requested changes for one physical display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplaySettings {
    pub display_id: DisplayId,
    #[serde(default, skip_serializing_if = "Setting::is_unspecified")]
    pub primary: Setting<bool>,
    #[serde(default, skip_serializing_if = "Setting::is_unspecified")]
    pub enable_hdr: Setting<bool>,
    #[serde(default, skip_serializing_if = "Setting::is_unspecified")]
    pub refresh_rate: Setting<u32>,
}

impl DisplaySettings {
    pub fn new(display_id: impl Into<DisplayId>) -> Self {
        Self {
            display_id: display_id.into(),
            primary: Setting::Unspecified,
            enable_hdr: Setting::Unspecified,
            refresh_rate: Setting::Unspecified,
        }
    }

    pub fn primary(mut self, primary: bool) -> Self {
        self.primary = Setting::SetTo(primary);
        self
    }

    pub fn hdr(mut self, enabled: bool) -> Self {
        self.enable_hdr = Setting::SetTo(enabled);
        self
    }

    pub fn refresh_rate(mut self, hz: u32) -> Self {
        self.refresh_rate = Setting::SetTo(hz);
        self
    }
}

/// A named multi-monitor configuration, optionally bound to a hotkey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayProfile {
    pub id: ProfileId,
    pub name: String,
    #[serde(default)]
    pub hotkey: Option<KeyCombination>,
    #[serde(default)]
    pub displays: Vec<DisplaySettings>,
}

impl DisplayProfile {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id: ProfileId(id),
            name: name.into(),
            hotkey: None,
            displays: Vec::new(),
        }
    }

    pub fn with_hotkey(mut self, hotkey: KeyCombination) -> Self {
        self.hotkey = Some(hotkey);
        self
    }

    pub fn with_display(mut self, settings: DisplaySettings) -> Self {
        self.displays.push(settings);
        self
    }
}
