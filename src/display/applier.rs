//! Applies a profile's per-display diffs against a topology snapshot
//!
//! Changes run in three phases across all displays: primary designation first,
//! then refresh rate, then HDR. Each display is its own unit of atomicity: a
//! failed call marks that display `Failed` and skips its remaining phases but
//! never aborts other displays. Already-applied displays are not rolled back.
//!
//! The first `primary: true` entry that passes planning holds the primary
//! claim; later ones report `ConflictingPrimary`.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{DisplayBackend, DisplayId, DisplayState, DisplayTopologySnapshot};
use crate::profile::{DisplayProfile, Setting};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ApplyError {
    #[error("display is not connected")]
    DisplayNotFound,
    #[error("another display in the profile is already designated primary")]
    ConflictingPrimary,
    #[error("the OS rejected the change: {0}")]
    OsConfigRejected(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("activation was cancelled before this display was configured")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplayStatus {
    Unchanged,
    Changed,
    Failed(ApplyError),
}

impl DisplayStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, DisplayStatus::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayOutcome {
    pub display_id: DisplayId,
    pub status: DisplayStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    Applied,
    PartiallyApplied,
    Failed,
}

/// Result of applying one profile, one entry per display setting in profile order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationOutcome {
    pub status: OutcomeStatus,
    pub displays: Vec<DisplayOutcome>,
}

impl ActivationOutcome {
    pub(crate) fn from_displays(displays: Vec<DisplayOutcome>) -> Self {
        let succeeded = displays.iter().filter(|d| d.status.is_success()).count();
        let failed = displays.len() - succeeded;
        let status = match (succeeded, failed) {
            (_, 0) => OutcomeStatus::Applied,
            (0, _) => OutcomeStatus::Failed,
            _ => OutcomeStatus::PartiallyApplied,
        };
        Self { status, displays }
    }

    pub fn status_of(&self, id: &DisplayId) -> Option<&DisplayStatus> {
        self.displays
            .iter()
            .find(|d| &d.display_id == id)
            .map(|d| &d.status)
    }
}

/// Pending work for one display that passed planning.
#[derive(Debug)]
struct Pending {
    index: usize,
    target: DisplayState,
    promote: bool,
    /// Requested `primary: false` on the current primary; satisfied only by
    /// promoting another display.
    demote: bool,
    refresh_rate: Option<u32>,
    hdr: Option<bool>,
    failed: Option<ApplyError>,
}

impl Pending {
    fn alive(&self) -> bool {
        self.failed.is_none()
    }
}

/// Diff `profile` against `snapshot` and apply the resulting changes.
///
/// Cancellation is checked before each native call: a call already in flight
/// completes, later calls are not started and their displays report
/// [`ApplyError::Cancelled`].
pub fn apply(
    profile: &DisplayProfile,
    snapshot: &DisplayTopologySnapshot,
    backend: &mut dyn DisplayBackend,
    cancel: &CancellationToken,
) -> ActivationOutcome {
    let mut statuses: Vec<DisplayOutcome> = profile
        .displays
        .iter()
        .map(|s| DisplayOutcome {
            display_id: s.display_id.clone(),
            status: DisplayStatus::Unchanged,
        })
        .collect();

    let mut pending = plan(profile, snapshot, &mut statuses);

    // Phase 1: primary designation
    let promotion = pending.iter().position(|p| p.promote);
    let mut promoted = false;
    if let Some(i) = promotion {
        promoted = run_call(&mut pending[i], cancel, |target| {
            log::info!("Making {} the primary display", target.id);
            backend.set_primary(target, snapshot)
        });
    }
    let promotion_failure = promotion.and_then(|i| pending[i].failed.clone());
    for p in pending.iter_mut().filter(|p| p.demote && p.alive()) {
        if promotion.is_none() {
            p.failed = Some(ApplyError::Unsupported(
                "the primary display can only be released by promoting another display"
                    .to_string(),
            ));
        } else if !promoted {
            p.failed = Some(match &promotion_failure {
                Some(ApplyError::Cancelled) => ApplyError::Cancelled,
                _ => ApplyError::OsConfigRejected(
                    "promotion of the replacement primary display failed".to_string(),
                ),
            });
        }
    }

    // Phase 2: refresh rate
    for p in pending.iter_mut().filter(|p| p.alive()) {
        if let Some(hz) = p.refresh_rate {
            run_call(p, cancel, |target| {
                log::info!(
                    "Setting {} refresh rate {} Hz -> {} Hz",
                    target.id,
                    target.mode.refresh_rate,
                    hz
                );
                backend.set_refresh_rate(target, hz)
            });
        }
    }

    // Phase 3: HDR
    for p in pending.iter_mut().filter(|p| p.alive()) {
        if let Some(enabled) = p.hdr {
            run_call(p, cancel, |target| {
                log::info!(
                    "Turning HDR {} on {}",
                    if enabled { "on" } else { "off" },
                    target.id
                );
                backend.set_hdr(target, enabled)
            });
        }
    }

    for p in pending {
        statuses[p.index].status = match p.failed {
            Some(err) => {
                log::warn!("Display {} failed: {}", p.target.id, err);
                DisplayStatus::Failed(err)
            }
            None => DisplayStatus::Changed,
        };
    }

    ActivationOutcome::from_displays(statuses)
}

/// Run one native call for `pending` unless cancelled. Returns whether it succeeded.
fn run_call<F>(pending: &mut Pending, cancel: &CancellationToken, call: F) -> bool
where
    F: FnOnce(&DisplayState) -> Result<(), crate::native::OsError>,
{
    if cancel.is_cancelled() {
        pending.failed = Some(ApplyError::Cancelled);
        return false;
    }
    match call(&pending.target) {
        Ok(()) => true,
        Err(e) => {
            pending.failed = Some(ApplyError::OsConfigRejected(e.to_string()));
            false
        }
    }
}

/// Compute per-display work. Displays that need nothing keep `Unchanged`;
/// displays that cannot be changed are marked `Failed` in `statuses` directly.
fn plan(
    profile: &DisplayProfile,
    snapshot: &DisplayTopologySnapshot,
    statuses: &mut [DisplayOutcome],
) -> Vec<Pending> {
    let mut pending = Vec::new();
    let mut primary_claimed = false;

    for (index, settings) in profile.displays.iter().enumerate() {
        let Some(current) = snapshot.get(&settings.display_id) else {
            statuses[index].status = DisplayStatus::Failed(ApplyError::DisplayNotFound);
            continue;
        };

        let claims_primary = settings.primary == Setting::SetTo(true);
        if claims_primary && primary_claimed {
            statuses[index].status = DisplayStatus::Failed(ApplyError::ConflictingPrimary);
            continue;
        }

        let promote = settings.primary == Setting::SetTo(true) && !current.is_primary;
        let demote = settings.primary == Setting::SetTo(false) && current.is_primary;
        let refresh_rate = settings.refresh_rate.change_from(&current.mode.refresh_rate).copied();
        let hdr = settings.enable_hdr.change_from(&current.hdr_enabled).copied();

        if let Err(err) = check_supported(current, refresh_rate, hdr) {
            statuses[index].status = DisplayStatus::Failed(err);
            continue;
        }
        // Only an entry that survives planning holds the primary claim.
        primary_claimed |= claims_primary;

        if promote || demote || refresh_rate.is_some() || hdr.is_some() {
            pending.push(Pending {
                index,
                target: current.clone(),
                promote,
                demote,
                refresh_rate,
                hdr,
                failed: None,
            });
        }
    }

    pending
}

fn check_supported(
    display: &DisplayState,
    refresh_rate: Option<u32>,
    hdr: Option<bool>,
) -> Result<(), ApplyError> {
    if let Some(hz) = refresh_rate {
        if hz == 0 {
            return Err(ApplyError::Unsupported("refresh rate must be positive".to_string()));
        }
        if !display.supported_refresh_rates.is_empty()
            && !display.supported_refresh_rates.contains(&hz)
        {
            return Err(ApplyError::Unsupported(format!(
                "{} Hz is not available at {}x{} (available: {:?})",
                hz, display.mode.width, display.mode.height, display.supported_refresh_rates
            )));
        }
    }
    if hdr == Some(true) && !display.hdr_supported {
        return Err(ApplyError::Unsupported("display is not HDR capable".to_string()));
    }
    Ok(())
}
