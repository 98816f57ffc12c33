//! Live display topology
//!
//! Displays are always keyed by their OS-stable [`DisplayId`] (the monitor's
//! device interface path on Windows), never by enumeration order.

pub mod applier;
#[cfg(windows)]
pub mod win32;

pub use applier::{
    apply, ActivationOutcome, ApplyError, DisplayOutcome, DisplayStatus, OutcomeStatus,
};

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::native::OsError;

/// Stable identity of a physical display.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisplayId(pub String);

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DisplayId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DisplayId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Current mode of an active display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
    pub position_x: i32,
    pub position_y: i32,
}

/// Adapter LUID as reported by the display configuration API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AdapterLuid {
    pub low: u32,
    pub high: i32,
}

/// Identifiers needed to issue configuration changes for a display.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHandle {
    /// GDI device name of the source, e.g. `\\.\DISPLAY1`.
    pub gdi_name: String,
    pub adapter: AdapterLuid,
    pub source_id: u32,
    pub target_id: u32,
}

/// One connected display as seen in a topology snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayState {
    pub id: DisplayId,
    pub friendly_name: String,
    pub mode: DisplayMode,
    pub is_primary: bool,
    pub hdr_supported: bool,
    pub hdr_enabled: bool,
    /// Refresh rates available at the current resolution. Empty when unknown.
    #[serde(default)]
    pub supported_refresh_rates: Vec<u32>,
    pub device: DeviceHandle,
}

/// A complete read of every active display, captured fresh per activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayTopologySnapshot {
    pub displays: Vec<DisplayState>,
    pub captured_at: DateTime<Utc>,
}

impl DisplayTopologySnapshot {
    pub fn get(&self, id: &DisplayId) -> Option<&DisplayState> {
        self.displays.iter().find(|d| &d.id == id)
    }

    pub fn primary(&self) -> Option<&DisplayState> {
        self.displays.iter().find(|d| d.is_primary)
    }
}

/// Native display configuration surface.
pub trait DisplayBackend: Send {
    /// Enumerate every active display. Must fail rather than return a partial list.
    fn enumerate(&mut self) -> Result<Vec<DisplayState>, OsError>;

    /// Make `display` the primary display; `topology` supplies the other
    /// displays, which may need repositioning.
    fn set_primary(
        &mut self,
        display: &DisplayState,
        topology: &DisplayTopologySnapshot,
    ) -> Result<(), OsError>;

    /// Switch `display` to `hz` at its current resolution.
    fn set_refresh_rate(&mut self, display: &DisplayState, hz: u32) -> Result<(), OsError>;

    fn set_hdr(&mut self, display: &DisplayState, enabled: bool) -> Result<(), OsError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("display enumeration failed: {0}")]
    EnumerationFailed(String),
}

/// Capture the live topology.
///
/// Any inconsistency in the enumeration fails the whole capture, since the
/// applier's diffing assumes the snapshot is complete.
pub fn capture(backend: &mut dyn DisplayBackend) -> Result<DisplayTopologySnapshot, SnapshotError> {
    let displays = backend
        .enumerate()
        .map_err(|e| SnapshotError::EnumerationFailed(e.to_string()))?;

    if displays.is_empty() {
        return Err(SnapshotError::EnumerationFailed(
            "no active displays reported".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for display in &displays {
        if !seen.insert(&display.id) {
            return Err(SnapshotError::EnumerationFailed(format!(
                "display {} reported twice",
                display.id
            )));
        }
    }

    let primaries = displays.iter().filter(|d| d.is_primary).count();
    if primaries > 1 {
        return Err(SnapshotError::EnumerationFailed(format!(
            "{} displays reported as primary",
            primaries
        )));
    }

    log::debug!("Captured topology with {} display(s)", displays.len());

    Ok(DisplayTopologySnapshot {
        displays,
        captured_at: Utc::now(),
    })
}
