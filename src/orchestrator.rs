//! Profile activation pipeline
//!
//! Hotkey presses and direct requests share one queue and are handled strictly
//! one at a time, in arrival order, by a single worker task. Each activation
//! is driven through [`state_machine::reduce`]; the worker executes the
//! effects it returns and feeds the results back in.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::display::{
    self, ActivationOutcome, ApplyError, DisplayBackend, DisplayOutcome, DisplayStatus,
    DisplayTopologySnapshot, SnapshotError,
};
use crate::history::ActivationHistory;
use crate::hotkey::{HotkeyEvent, HotkeyEvents};
use crate::profile::{DisplayProfile, ProfileId, ProfileResolver, ResolveError};
use crate::state_machine::{
    reduce, ActivationFailure, Effect, Event, FailureReason, Stage, State, Trigger,
};

/// The display configuration surface, shared between activations but used by
/// one call at a time.
pub type SharedDisplayBackend = Arc<Mutex<Box<dyn DisplayBackend>>>;

pub fn shared_backend(backend: impl DisplayBackend + 'static) -> SharedDisplayBackend {
    Arc::new(Mutex::new(Box::new(backend)))
}

fn lock_backend(
    backend: &SharedDisplayBackend,
) -> MutexGuard<'_, Box<dyn DisplayBackend>> {
    // A panic inside a backend call leaves no state we rely on.
    backend.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Capture the topology on the blocking pool.
pub async fn capture_shared(
    displays: &SharedDisplayBackend,
) -> Result<DisplayTopologySnapshot, SnapshotError> {
    let displays = displays.clone();
    tokio::task::spawn_blocking(move || display::capture(lock_backend(&displays).as_mut()))
        .await
        .unwrap_or_else(|e| {
            Err(SnapshotError::EnumerationFailed(format!(
                "display worker failed: {}",
                e
            )))
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationResult {
    Done(ActivationOutcome),
    Failed(ActivationFailure),
}

/// Everything known about one finished activation.
#[derive(Debug, Clone)]
pub struct ActivationReport {
    pub activation_id: Uuid,
    pub trigger: Trigger,
    pub profile_id: Option<ProfileId>,
    pub profile_name: Option<String>,
    pub result: ActivationResult,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ActivationReport {
    pub fn outcome(&self) -> Option<&ActivationOutcome> {
        match &self.result {
            ActivationResult::Done(outcome) => Some(outcome),
            ActivationResult::Failed(_) => None,
        }
    }

    pub fn into_result(self) -> Result<ActivationOutcome, ActivationFailure> {
        match self.result {
            ActivationResult::Done(outcome) => Ok(outcome),
            ActivationResult::Failed(failure) => Err(failure),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("activation pipeline has shut down")]
pub struct PipelineClosed;

pub enum ActivationRequest {
    Hotkey(HotkeyEvent),
    Direct {
        profile_id: ProfileId,
        reply: oneshot::Sender<ActivationReport>,
    },
}

/// Executes the side effects requested by the state machine.
#[derive(Clone)]
pub struct ActivationRunner {
    resolver: ProfileResolver,
    displays: SharedDisplayBackend,
}

impl ActivationRunner {
    pub fn new(resolver: ProfileResolver, displays: SharedDisplayBackend) -> Self {
        Self { resolver, displays }
    }

    fn resolve(&self, trigger: &Trigger) -> Result<DisplayProfile, ResolveError> {
        match trigger {
            Trigger::HotKey { slot, combination } => {
                self.resolver.resolve_press(*slot, combination)
            }
            Trigger::Direct { profile_id } => self.resolver.resolve_by_id(*profile_id),
        }
    }

    async fn capture(&self) -> Result<DisplayTopologySnapshot, SnapshotError> {
        capture_shared(&self.displays).await
    }

    async fn apply(
        &self,
        profile: DisplayProfile,
        snapshot: DisplayTopologySnapshot,
        cancel: &CancellationToken,
    ) -> ActivationOutcome {
        let displays = self.displays.clone();
        let cancel = cancel.clone();
        let targets: Vec<_> = profile.displays.iter().map(|d| d.display_id.clone()).collect();

        let result = tokio::task::spawn_blocking(move || {
            display::apply(&profile, &snapshot, lock_backend(&displays).as_mut(), &cancel)
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Display worker failed while applying: {}", e);
                let reason = ApplyError::OsConfigRejected(format!("display worker failed: {}", e));
                ActivationOutcome::from_displays(
                    targets
                        .into_iter()
                        .map(|display_id| DisplayOutcome {
                            display_id,
                            status: DisplayStatus::Failed(reason.clone()),
                        })
                        .collect(),
                )
            }
        }
    }
}

/// Queue sizing for the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorOptions {
    pub queue_capacity: usize,
    pub history_limit: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 32,
            history_limit: 50,
        }
    }
}

/// Handle to the activation worker.
pub struct Orchestrator {
    requests: mpsc::Sender<ActivationRequest>,
    outcomes: broadcast::Sender<ActivationReport>,
    history: Arc<Mutex<ActivationHistory>>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
}

impl Orchestrator {
    /// Spawn the worker (and, when a listener is running, the task that feeds
    /// hotkey presses into the queue). Must be called inside a tokio runtime.
    pub fn start(
        runner: ActivationRunner,
        hotkeys: Option<HotkeyEvents>,
        options: OrchestratorOptions,
        cancel: CancellationToken,
    ) -> Self {
        let (requests, rx) = mpsc::channel(options.queue_capacity.max(1));
        let (outcomes, _) = broadcast::channel(options.queue_capacity.max(1));
        let history = Arc::new(Mutex::new(ActivationHistory::new(options.history_limit)));

        let worker = tokio::spawn(run_activation_loop(
            rx,
            runner,
            outcomes.clone(),
            history.clone(),
            cancel.clone(),
        ));

        let forwarder = hotkeys
            .map(|events| tokio::spawn(forward_hotkeys(events, requests.clone(), cancel.clone())));

        Self {
            requests,
            outcomes,
            history,
            cancel,
            worker: Some(worker),
            forwarder,
        }
    }

    /// Queue a direct activation and wait for its report.
    pub async fn activate(
        &self,
        profile_id: ProfileId,
    ) -> Result<ActivationReport, PipelineClosed> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(ActivationRequest::Direct { profile_id, reply })
            .await
            .map_err(|_| PipelineClosed)?;
        rx.await.map_err(|_| PipelineClosed)
    }

    /// Queue a hotkey press as if it came from the listener.
    pub async fn submit(&self, event: HotkeyEvent) -> Result<(), PipelineClosed> {
        self.requests
            .send(ActivationRequest::Hotkey(event))
            .await
            .map_err(|_| PipelineClosed)
    }

    /// Subscribe to the report of every activation, hotkey or direct.
    pub fn subscribe(&self) -> broadcast::Receiver<ActivationReport> {
        self.outcomes.subscribe()
    }

    pub fn history(&self) -> Arc<Mutex<ActivationHistory>> {
        self.history.clone()
    }

    /// Cancel the pipeline and wait for the worker to finish its current activation.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(forwarder) = self.forwarder.take() {
            if let Err(e) = forwarder.await {
                log::error!("Hotkey forwarder task failed: {}", e);
            }
        }
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                log::error!("Activation worker task failed: {}", e);
            }
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn forward_hotkeys(
    mut events: HotkeyEvents,
    requests: mpsc::Sender<ActivationRequest>,
    cancel: CancellationToken,
) {
    while let Some(event) = events.next_event(&cancel).await {
        log::debug!("Hotkey {} pressed (slot {})", event.combination, event.slot);
        if requests.send(ActivationRequest::Hotkey(event)).await.is_err() {
            break;
        }
    }
    log::debug!("Hotkey forwarder exiting");
}

async fn run_activation_loop(
    mut rx: mpsc::Receiver<ActivationRequest>,
    runner: ActivationRunner,
    outcomes: broadcast::Sender<ActivationReport>,
    history: Arc<Mutex<ActivationHistory>>,
    cancel: CancellationToken,
) {
    log::info!("Activation worker started");
    let mut state = State::Idle;

    loop {
        let request = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let (trigger, reply) = match request {
            ActivationRequest::Hotkey(event) => (
                Trigger::HotKey {
                    slot: event.slot,
                    combination: event.combination,
                },
                None,
            ),
            ActivationRequest::Direct { profile_id, reply } => {
                (Trigger::Direct { profile_id }, Some(reply))
            }
        };

        let report = run_activation(&runner, &mut state, trigger, &cancel).await;

        history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record(&report);
        // No subscribers is fine.
        let _ = outcomes.send(report.clone());
        if let Some(reply) = reply {
            let _ = reply.send(report);
        }
    }

    log::info!("Activation worker stopped");
}

/// Drive one activation from trigger to a terminal state.
async fn run_activation(
    runner: &ActivationRunner,
    state: &mut State,
    trigger: Trigger,
    cancel: &CancellationToken,
) -> ActivationReport {
    let activation_id = Uuid::new_v4();
    let started_at = Utc::now();
    let clock = Instant::now();
    let mut resolved: Option<(ProfileId, String)> = None;

    log::info!("Activation {}: triggered by {}", activation_id, trigger);

    let mut pending = VecDeque::from([Event::Triggered {
        id: activation_id,
        trigger: trigger.clone(),
    }]);

    while let Some(event) = pending.pop_front() {
        let (next, effects) = reduce(state, event);

        if std::mem::discriminant(state) != std::mem::discriminant(&next) {
            log::info!(
                "Activation {}: {} -> {}",
                activation_id,
                state.name(),
                next.name()
            );
        } else {
            log::debug!("Activation {}: staying in {}", activation_id, next.name());
        }
        *state = next;

        for effect in effects {
            match effect {
                Effect::Resolve { id, trigger } => {
                    if cancel.is_cancelled() {
                        pending.push_back(Event::Cancel);
                        continue;
                    }
                    pending.push_back(match runner.resolve(&trigger) {
                        Ok(profile) => {
                            resolved = Some((profile.id, profile.name.clone()));
                            Event::ProfileResolved { id, profile }
                        }
                        Err(err) => Event::ResolveFailed { id, err },
                    });
                }
                Effect::CaptureSnapshot { id } => {
                    if cancel.is_cancelled() {
                        pending.push_back(Event::Cancel);
                        continue;
                    }
                    pending.push_back(match runner.capture().await {
                        Ok(snapshot) => Event::SnapshotCaptured { id, snapshot },
                        Err(err) => Event::SnapshotFailed { id, err },
                    });
                }
                Effect::Apply {
                    id,
                    profile,
                    snapshot,
                } => {
                    // The applier stops issuing native calls itself once cancelled.
                    let outcome = runner.apply(profile, snapshot, cancel).await;
                    pending.push_back(Event::ApplyFinished { id, outcome });
                }
                Effect::EmitOutcome => {}
            }
        }
    }

    let result = match state {
        State::Done { outcome, .. } => {
            log::info!(
                "Activation {}: {:?} ({} display(s))",
                activation_id,
                outcome.status,
                outcome.displays.len()
            );
            for display in &outcome.displays {
                if let DisplayStatus::Failed(reason) = &display.status {
                    log::warn!(
                        "Activation {}: display {} failed: {}",
                        activation_id,
                        display.display_id,
                        reason
                    );
                }
            }
            ActivationResult::Done(outcome.clone())
        }
        State::Failed { failure, .. } => {
            log::warn!("Activation {}: {}", activation_id, failure);
            ActivationResult::Failed(failure.clone())
        }
        other => {
            log::error!(
                "Activation {}: pipeline stalled in {}",
                activation_id,
                other.name()
            );
            ActivationResult::Failed(ActivationFailure {
                stage: Stage::Resolve,
                reason: FailureReason::Cancelled,
            })
        }
    };

    let (profile_id, profile_name) = match (resolved, &trigger) {
        (Some((id, name)), _) => (Some(id), Some(name)),
        (None, Trigger::Direct { profile_id }) => (Some(*profile_id), None),
        (None, Trigger::HotKey { .. }) => (None, None),
    };

    ActivationReport {
        activation_id,
        trigger,
        profile_id,
        profile_name,
        result,
        started_at,
        duration_ms: clock.elapsed().as_millis() as u64,
    }
}
