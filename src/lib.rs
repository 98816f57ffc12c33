//! Global hotkeys that switch multi-monitor display profiles.
//!
//! [`Engine`] wires the pieces together: a hotkey listener thread owning the
//! OS registrations, a profile store, and a single activation worker that
//! resolves, snapshots and applies one profile at a time.

pub mod display;
pub mod history;
pub mod hotkey;
pub mod logging;
pub mod native;
pub mod orchestrator;
pub mod profile;
pub mod settings;
pub mod simulated;
pub mod state_machine;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use display::{ActivationOutcome, DisplayBackend, DisplayTopologySnapshot, SnapshotError};
use history::{ActivationRecord, HistorySummary};
use hotkey::{
    failed_status, HotkeyBackend, HotkeyManager, HotkeyStatus, KeyCombination, RegisterError,
    RegistryView, SlotLookup,
};
use native::OsError;
use orchestrator::{
    capture_shared, shared_backend, ActivationReport, ActivationRunner, Orchestrator,
    PipelineClosed, SharedDisplayBackend,
};
use profile::{DisplayProfile, ProfileId, ProfileResolver, ProfileStore, StoreError};
use settings::AppSettings;
use state_machine::ActivationFailure;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActivateError {
    #[error(transparent)]
    Failed(#[from] ActivationFailure),
    #[error(transparent)]
    Closed(#[from] PipelineClosed),
}

/// Running hotkey dispatch and profile activation engine
pub struct Engine {
    hotkeys: Option<HotkeyManager>,
    hotkey_error: Option<String>,
    store: Arc<dyn ProfileStore>,
    displays: SharedDisplayBackend,
    orchestrator: Orchestrator,
    cancel: CancellationToken,
}

impl Engine {
    /// Start the listener thread and the activation worker.
    ///
    /// Must be called from within a tokio runtime. If the hotkey backend
    /// cannot be created the engine still starts; direct activation keeps
    /// working and [`Engine::hotkey_status`] reports the error.
    ///
    /// Blocks the calling thread until the listener thread has created its
    /// native backend (a message-only window on Windows). On a
    /// current-thread runtime nothing else runs during that wait.
    pub fn start<B, F>(
        make_hotkeys: F,
        displays: impl DisplayBackend + 'static,
        store: Arc<dyn ProfileStore>,
        settings: &AppSettings,
    ) -> Self
    where
        B: HotkeyBackend + 'static,
        F: FnOnce() -> Result<B, OsError> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let displays = shared_backend(displays);

        let (hotkeys, events, hotkey_error) =
            match HotkeyManager::start(make_hotkeys, settings.listener_options()) {
                Ok((manager, events)) => (Some(manager), Some(events), None),
                Err(e) => {
                    log::error!("Failed to start hotkey listener: {}", e);
                    (None, None, Some(e))
                }
            };

        let slots: Arc<dyn SlotLookup> = match &hotkeys {
            Some(manager) => Arc::new(manager.registry()),
            None => Arc::new(RegistryView::default()),
        };
        let runner = ActivationRunner::new(
            ProfileResolver::new(slots, store.clone()),
            displays.clone(),
        );
        let orchestrator = Orchestrator::start(
            runner,
            events,
            settings.orchestrator_options(),
            cancel.clone(),
        );

        Self {
            hotkeys,
            hotkey_error,
            store,
            displays,
            orchestrator,
            cancel,
        }
    }

    /// Bring the OS registrations in line with the profile store.
    ///
    /// Registrations whose profile is gone or now has a different hotkey are
    /// released first, then every bound profile not yet live is registered.
    /// Best effort: every failure is returned, none stops the others.
    pub async fn register_all_bound_hotkeys(&self) -> Vec<RegisterError> {
        let Some(hotkeys) = &self.hotkeys else {
            return vec![RegisterError::ListenerGone];
        };

        let profiles = match self.store.list_all() {
            Ok(profiles) => profiles,
            Err(e) => {
                log::error!("Cannot register hotkeys: {}", e);
                return vec![RegisterError::ProfilesUnavailable(e.to_string())];
            }
        };

        let wanted: HashMap<ProfileId, KeyCombination> = profiles
            .iter()
            .filter_map(|p| p.hotkey.map(|hotkey| (p.id, hotkey)))
            .collect();

        let live = hotkeys.registry().current();
        for entry in live.entries() {
            if wanted.get(&entry.profile_id) == Some(&entry.combination) {
                continue;
            }
            match hotkeys.unregister(entry.slot).await {
                Ok(()) => log::info!(
                    "Released hotkey {} (slot {}) from profile {}",
                    entry.combination,
                    entry.slot,
                    entry.profile_id
                ),
                Err(e) => log::warn!("Failed to release slot {}: {}", entry.slot, e),
            }
        }

        let mut errors = Vec::new();
        for profile in &profiles {
            let Some(hotkey) = profile.hotkey else {
                continue;
            };
            let already_live = live
                .entries()
                .iter()
                .any(|e| e.profile_id == profile.id && e.combination == hotkey);
            if already_live {
                continue;
            }
            match hotkeys.register(hotkey, profile.id).await {
                Ok(slot) => log::info!(
                    "Registered hotkey {} (slot {}) for profile {} '{}'",
                    hotkey,
                    slot,
                    profile.id,
                    profile.name
                ),
                Err(e) => {
                    log::warn!("Profile {} '{}': {}", profile.id, profile.name, e);
                    errors.push(e);
                }
            }
        }
        errors
    }

    /// Activate a profile directly, bypassing hotkeys. Queued behind any
    /// activation already in flight.
    pub async fn activate_profile(
        &self,
        id: ProfileId,
    ) -> Result<ActivationOutcome, ActivateError> {
        let report = self.orchestrator.activate(id).await?;
        Ok(report.into_result()?)
    }

    /// Reports of every finished activation, hotkey-triggered or direct.
    pub fn on_activation(&self) -> broadcast::Receiver<ActivationReport> {
        self.orchestrator.subscribe()
    }

    pub fn hotkey_status(&self) -> HotkeyStatus {
        match (&self.hotkeys, &self.hotkey_error) {
            (Some(manager), _) => manager.status(),
            (None, Some(error)) => failed_status(error.clone()),
            (None, None) => failed_status("hotkey listener stopped".to_string()),
        }
    }

    /// Live hotkey registrations.
    pub fn registrations(&self) -> Arc<RegistryView> {
        match &self.hotkeys {
            Some(manager) => manager.registry().current(),
            None => Arc::new(RegistryView::default()),
        }
    }

    pub fn profiles(&self) -> Result<Vec<DisplayProfile>, StoreError> {
        self.store.list_all()
    }

    pub fn history_summary(&self) -> HistorySummary {
        self.orchestrator
            .history()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .summary()
    }

    /// Recent activations, newest first.
    pub fn recent_activations(&self) -> Vec<ActivationRecord> {
        self.orchestrator
            .history()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .recent()
    }

    /// Read the live display topology. Waits for any configuration call in flight.
    pub async fn capture_snapshot(&self) -> Result<DisplayTopologySnapshot, SnapshotError> {
        capture_shared(&self.displays).await
    }

    /// Cancel the pipeline, let the current activation finish, and release
    /// every hotkey on the listener thread.
    pub async fn shutdown(mut self) {
        log::info!("Shutting down");
        self.cancel.cancel();
        self.orchestrator.shutdown().await;

        if let Some(manager) = self.hotkeys.take() {
            // Joining the listener thread blocks for up to one poll interval.
            if let Err(e) = tokio::task::spawn_blocking(move || drop(manager)).await {
                log::error!("Hotkey listener shutdown failed: {}", e);
            }
        }
        log::info!("Shutdown complete");
    }
}
