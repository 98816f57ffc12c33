//! Hotkey manager - owns the listener thread and the hotkey event stream
//!
//! The OS binds hotkey delivery to the thread that registered the hotkey, so a
//! single dedicated thread creates the native backend, owns the [`Registry`]
//! and pumps native messages. Register/unregister requests from other
//! contexts are marshalled onto that thread as commands; hotkey notifications
//! flow out through a bounded channel consumed via [`HotkeyEvents`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::backend::{HotkeyBackend, NativeMessage, SlotId, WM_HOTKEY};
use super::codec;
use super::registry::{
    HotKeyRegistration, RegisterError, Registry, RegistryView, SlotLookup, UnregisterError,
};
use super::KeyCombination;
use crate::native::OsError;
use crate::profile::ProfileId;

/// A decoded hotkey press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotkeyEvent {
    pub slot: SlotId,
    pub combination: KeyCombination,
    pub received_at: Instant,
}

/// Turn a native message into a hotkey event, if it is a hotkey notification.
pub fn hotkey_event(message: &NativeMessage) -> Option<HotkeyEvent> {
    if message.message != WM_HOTKEY {
        return None;
    }
    Some(HotkeyEvent {
        slot: SlotId(message.wparam as i32),
        combination: codec::decode_packed(message.lparam as u32),
        received_at: Instant::now(),
    })
}

/// Single-consumer stream of hotkey presses.
pub struct HotkeyEvents {
    rx: mpsc::Receiver<HotkeyEvent>,
}

impl HotkeyEvents {
    /// Wait for the next hotkey press.
    ///
    /// Returns `None` when `cancel` fires or the listener has shut down.
    pub async fn next_event(&mut self, cancel: &CancellationToken) -> Option<HotkeyEvent> {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }
}

/// Live registry snapshot published by the listener thread.
#[derive(Clone)]
pub struct RegistryWatch {
    rx: watch::Receiver<Arc<RegistryView>>,
}

impl RegistryWatch {
    pub fn current(&self) -> Arc<RegistryView> {
        self.rx.borrow().clone()
    }
}

impl SlotLookup for RegistryWatch {
    fn registration(&self, slot: SlotId) -> Option<HotKeyRegistration> {
        self.rx.borrow().registration(slot)
    }
}

/// Status information about the hotkey manager
#[derive(Debug, Clone)]
pub struct HotkeyStatus {
    pub active: bool,
    pub registered: usize,
    pub error: Option<String>,
}

enum Command {
    Register {
        combination: KeyCombination,
        profile_id: ProfileId,
        reply: oneshot::Sender<Result<SlotId, RegisterError>>,
    },
    Unregister {
        slot: SlotId,
        reply: oneshot::Sender<Result<(), UnregisterError>>,
    },
    UnregisterAll {
        reply: oneshot::Sender<Vec<(SlotId, OsError)>>,
    },
}

/// Tuning for the listener thread.
#[derive(Debug, Clone, Copy)]
pub struct ListenerOptions {
    /// Longest time the thread waits on the native queue before checking for commands.
    pub poll_interval: Duration,
    pub event_capacity: usize,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            event_capacity: 64,
        }
    }
}

/// Handle to the hotkey listener thread
pub struct HotkeyManager {
    commands: std_mpsc::Sender<Command>,
    view: RegistryWatch,
    running: Arc<AtomicBool>,
    cancel_token: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl HotkeyManager {
    /// Start the listener thread.
    ///
    /// `make_backend` runs on the new thread, since native hotkey handles are
    /// bound to the thread that creates them. Blocks until it has returned.
    /// Fails if the backend cannot be created.
    pub fn start<B, F>(
        make_backend: F,
        options: ListenerOptions,
    ) -> Result<(Self, HotkeyEvents), String>
    where
        B: HotkeyBackend + 'static,
        F: FnOnce() -> Result<B, OsError> + Send + 'static,
    {
        let (command_tx, command_rx) = std_mpsc::channel::<Command>();
        let (event_tx, event_rx) = mpsc::channel::<HotkeyEvent>(options.event_capacity.max(1));
        let (view_tx, view_rx) = watch::channel(Arc::new(RegistryView::default()));
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), String>>(1);
        let cancel_token = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(false));

        let thread = {
            let cancel = cancel_token.clone();
            let running = running.clone();
            std::thread::Builder::new()
                .name("hotkey-listener".into())
                .spawn(move || {
                    let backend = match make_backend() {
                        Ok(backend) => backend,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e.to_string()));
                            return;
                        }
                    };
                    running.store(true, Ordering::SeqCst);
                    let _ = ready_tx.send(Ok(()));

                    let listener = Listener {
                        registry: Registry::new(backend),
                        commands: command_rx,
                        events: event_tx,
                        view: view_tx,
                        cancel,
                        poll_interval: options.poll_interval,
                    };
                    listener.run();
                    running.store(false, Ordering::SeqCst);
                })
                .map_err(|e| format!("Failed to spawn hotkey listener thread: {}", e))?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(format!("Failed to initialize hotkey backend: {}", e));
            }
            Err(_) => {
                let _ = thread.join();
                return Err("Hotkey listener exited during startup".to_string());
            }
        }

        log::info!(
            "Hotkey listener started (poll interval {:?})",
            options.poll_interval
        );

        Ok((
            Self {
                commands: command_tx,
                view: RegistryWatch { rx: view_rx },
                running,
                cancel_token,
                thread: Some(thread),
            },
            HotkeyEvents { rx: event_rx },
        ))
    }

    pub async fn register(
        &self,
        combination: KeyCombination,
        profile_id: ProfileId,
    ) -> Result<SlotId, RegisterError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Register {
                combination,
                profile_id,
                reply,
            })
            .map_err(|_| RegisterError::ListenerGone)?;
        rx.await.map_err(|_| RegisterError::ListenerGone)?
    }

    pub async fn unregister(&self, slot: SlotId) -> Result<(), UnregisterError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Unregister { slot, reply })
            .map_err(|_| UnregisterError::ListenerGone)?;
        rx.await.map_err(|_| UnregisterError::ListenerGone)?
    }

    /// Release every registration. Returns slots whose native release failed.
    pub async fn unregister_all(&self) -> Vec<(SlotId, OsError)> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::UnregisterAll { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn registry(&self) -> RegistryWatch {
        self.view.clone()
    }

    /// Get the current status of the hotkey manager
    pub fn status(&self) -> HotkeyStatus {
        HotkeyStatus {
            active: self.running.load(Ordering::SeqCst),
            registered: self.view.current().len(),
            error: None,
        }
    }

    /// Stop the listener. Registrations are released on the listener thread.
    pub fn stop(&mut self) {
        self.cancel_token.cancel();
        if let Some(thread) = self.thread.take() {
            log::info!("Stopping hotkey listener");
            if thread.join().is_err() {
                log::error!("Hotkey listener thread panicked");
            }
        }
    }
}

impl Drop for HotkeyManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Create a "failed" status for when the listener could not start
pub fn failed_status(error: String) -> HotkeyStatus {
    HotkeyStatus {
        active: false,
        registered: 0,
        error: Some(error),
    }
}

struct Listener<B: HotkeyBackend> {
    registry: Registry<B>,
    commands: std_mpsc::Receiver<Command>,
    events: mpsc::Sender<HotkeyEvent>,
    view: watch::Sender<Arc<RegistryView>>,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl<B: HotkeyBackend> Listener<B> {
    fn run(mut self) {
        // Commands are only handled between pumps, never from inside native
        // dispatch, so the table cannot be mutated re-entrantly.
        'outer: while !self.cancel.is_cancelled() {
            loop {
                match self.commands.try_recv() {
                    Ok(command) => self.handle(command),
                    Err(std_mpsc::TryRecvError::Empty) => break,
                    Err(std_mpsc::TryRecvError::Disconnected) => break 'outer,
                }
            }

            for message in self.registry.pump(self.poll_interval) {
                if let Some(event) = hotkey_event(&message) {
                    self.forward(event);
                }
            }
        }

        let failures = self.registry.unregister_all();
        if !failures.is_empty() {
            log::warn!(
                "{} hotkey(s) could not be released at shutdown",
                failures.len()
            );
        }
        self.publish();
        log::info!("Hotkey listener stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register {
                combination,
                profile_id,
                reply,
            } => {
                let result = self.registry.register(combination, profile_id);
                self.publish();
                let _ = reply.send(result);
            }
            Command::Unregister { slot, reply } => {
                let result = self.registry.unregister(slot);
                self.publish();
                let _ = reply.send(result);
            }
            Command::UnregisterAll { reply } => {
                let failures = self.registry.unregister_all();
                self.publish();
                let _ = reply.send(failures);
            }
        }
    }

    fn publish(&self) {
        self.view.send_replace(Arc::new(self.registry.view()));
    }

    fn forward(&self, event: HotkeyEvent) {
        log::info!("Hotkey {} pressed (slot {})", event.combination, event.slot);
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                // Never drop a press; wait for the consumer to catch up.
                log::warn!("Hotkey event channel full, waiting for consumer");
                if self.events.blocking_send(event).is_err() {
                    log::debug!("Hotkey event consumer is gone");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Hotkey event consumer is gone, dropping press");
            }
        }
    }
}
