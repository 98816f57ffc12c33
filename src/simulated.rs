//! In-process stand-ins for the native hotkey and display backends
//!
//! Used by the test suite and by `--dry-run`. Both backends are cheap handles
//! over shared state, so a test can keep a clone for scripting and inspection
//! while the engine owns another.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::display::{
    DeviceHandle, DisplayBackend, DisplayId, DisplayMode, DisplayState, DisplayTopologySnapshot,
};
use crate::hotkey::codec::encode_packed;
use crate::hotkey::{HotkeyBackend, KeyCombination, NativeMessage, SlotId, WM_HOTKEY};
use crate::native::OsError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Displays
// ============================================================================

/// A simulated display with a 1:1 id/name and no HDR.
pub fn monitor(id: &str, width: u32, height: u32, refresh_rate: u32) -> DisplayState {
    DisplayState {
        id: DisplayId::from(id),
        friendly_name: format!("Simulated {}", id),
        mode: DisplayMode {
            width,
            height,
            refresh_rate,
            position_x: 0,
            position_y: 0,
        },
        is_primary: false,
        hdr_supported: false,
        hdr_enabled: false,
        supported_refresh_rates: Vec::new(),
        device: DeviceHandle {
            gdi_name: format!("\\\\.\\SIM-{}", id),
            ..DeviceHandle::default()
        },
    }
}

impl DisplayState {
    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    pub fn at(mut self, x: i32, y: i32) -> Self {
        self.mode.position_x = x;
        self.mode.position_y = y;
        self
    }

    pub fn with_refresh_rates(mut self, rates: Vec<u32>) -> Self {
        self.supported_refresh_rates = rates;
        self
    }

    pub fn with_hdr(mut self, supported: bool, enabled: bool) -> Self {
        self.hdr_supported = supported;
        self.hdr_enabled = enabled;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    SetPrimary,
    SetRefreshRate,
    SetHdr,
}

/// One configuration call observed by [`SimulatedDisplays`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCall {
    pub op: SimOp,
    pub display: DisplayId,
}

#[derive(Default)]
struct DisplayWorld {
    displays: Vec<DisplayState>,
    failures: HashMap<(DisplayId, SimOp), String>,
    enumeration_failure: Option<String>,
    latency: Duration,
    calls: Vec<SimCall>,
}

#[derive(Clone, Default)]
pub struct SimulatedDisplays {
    world: Arc<Mutex<DisplayWorld>>,
}

impl SimulatedDisplays {
    pub fn new(displays: Vec<DisplayState>) -> Self {
        Self {
            world: Arc::new(Mutex::new(DisplayWorld {
                displays,
                ..DisplayWorld::default()
            })),
        }
    }

    /// Make every subsequent `op` on `id` fail with `message`.
    pub fn fail_on(&self, id: &str, op: SimOp, message: &str) {
        lock(&self.world)
            .failures
            .insert((DisplayId::from(id), op), message.to_string());
    }

    pub fn fail_enumeration(&self, message: &str) {
        lock(&self.world).enumeration_failure = Some(message.to_string());
    }

    pub fn restore_enumeration(&self) {
        lock(&self.world).enumeration_failure = None;
    }

    /// Delay applied to every configuration call.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.world).latency = latency;
    }

    pub fn connect(&self, display: DisplayState) {
        lock(&self.world).displays.push(display);
    }

    pub fn disconnect(&self, id: &str) {
        lock(&self.world).displays.retain(|d| d.id.0 != id);
    }

    pub fn display(&self, id: &str) -> Option<DisplayState> {
        lock(&self.world)
            .displays
            .iter()
            .find(|d| d.id.0 == id)
            .cloned()
    }

    pub fn calls(&self) -> Vec<SimCall> {
        lock(&self.world).calls.clone()
    }

    fn configure<F>(&self, op: SimOp, id: &DisplayId, change: F) -> Result<(), OsError>
    where
        F: FnOnce(&mut Vec<DisplayState>) -> Result<(), OsError>,
    {
        let latency = lock(&self.world).latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let mut world = lock(&self.world);
        world.calls.push(SimCall {
            op,
            display: id.clone(),
        });
        if let Some(message) = world.failures.get(&(id.clone(), op)) {
            return Err(OsError::new(op_name(op), message.clone()));
        }
        if !world.displays.iter().any(|d| &d.id == id) {
            return Err(OsError::new(op_name(op), format!("{} is not attached", id)));
        }
        change(&mut world.displays)
    }
}

fn op_name(op: SimOp) -> &'static str {
    match op {
        SimOp::SetPrimary => "SetPrimary",
        SimOp::SetRefreshRate => "SetRefreshRate",
        SimOp::SetHdr => "SetHdr",
    }
}

impl DisplayBackend for SimulatedDisplays {
    fn enumerate(&mut self) -> Result<Vec<DisplayState>, OsError> {
        let world = lock(&self.world);
        match &world.enumeration_failure {
            Some(message) => Err(OsError::new("Enumerate", message.clone())),
            None => Ok(world.displays.clone()),
        }
    }

    fn set_primary(
        &mut self,
        display: &DisplayState,
        _topology: &DisplayTopologySnapshot,
    ) -> Result<(), OsError> {
        self.configure(SimOp::SetPrimary, &display.id, |displays| {
            let origin = displays
                .iter()
                .find(|d| d.id == display.id)
                .map(|d| (d.mode.position_x, d.mode.position_y))
                .unwrap_or_default();
            for d in displays.iter_mut() {
                d.is_primary = d.id == display.id;
                d.mode.position_x -= origin.0;
                d.mode.position_y -= origin.1;
            }
            Ok(())
        })
    }

    fn set_refresh_rate(&mut self, display: &DisplayState, hz: u32) -> Result<(), OsError> {
        self.configure(SimOp::SetRefreshRate, &display.id, |displays| {
            if let Some(d) = displays.iter_mut().find(|d| d.id == display.id) {
                d.mode.refresh_rate = hz;
            }
            Ok(())
        })
    }

    fn set_hdr(&mut self, display: &DisplayState, enabled: bool) -> Result<(), OsError> {
        self.configure(SimOp::SetHdr, &display.id, |displays| {
            match displays.iter_mut().find(|d| d.id == display.id) {
                Some(d) if !d.hdr_supported && enabled => {
                    Err(OsError::new("SetHdr", "advanced color not supported"))
                }
                Some(d) => {
                    d.hdr_enabled = enabled;
                    Ok(())
                }
                None => Ok(()),
            }
        })
    }
}

// ============================================================================
// Hotkeys
// ============================================================================

#[derive(Default)]
struct HotkeyWorld {
    registered: BTreeMap<SlotId, KeyCombination>,
    claimed_elsewhere: HashSet<KeyCombination>,
    queue: VecDeque<NativeMessage>,
}

#[derive(Clone, Default)]
pub struct SimulatedHotkeys {
    world: Arc<(Mutex<HotkeyWorld>, Condvar)>,
}

impl SimulatedHotkeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend another process already owns `combination`.
    pub fn claim_elsewhere(&self, combination: KeyCombination) {
        lock(&self.world.0).claimed_elsewhere.insert(combination);
    }

    /// Drop a registration on the OS side only, as if it had been revoked.
    pub fn revoke(&self, slot: SlotId) {
        lock(&self.world.0).registered.remove(&slot);
    }

    pub fn registered(&self) -> Vec<(SlotId, KeyCombination)> {
        lock(&self.world.0)
            .registered
            .iter()
            .map(|(slot, combination)| (*slot, *combination))
            .collect()
    }

    /// Simulate the user pressing `combination`. Returns false when nothing
    /// is registered for it, in which case no notification is queued.
    pub fn press(&self, combination: KeyCombination) -> bool {
        let slot = {
            let world = lock(&self.world.0);
            world
                .registered
                .iter()
                .find(|(_, registered)| **registered == combination)
                .map(|(slot, _)| *slot)
        };
        match slot {
            Some(slot) => {
                // The OS reports the pressed modifiers; the no-repeat flag is not echoed.
                let mut reported = combination;
                reported.no_repeat = false;
                self.post(NativeMessage {
                    message: WM_HOTKEY,
                    wparam: slot.0 as usize,
                    lparam: encode_packed(&reported) as isize,
                });
                true
            }
            None => false,
        }
    }

    /// Queue an arbitrary native message.
    pub fn post(&self, message: NativeMessage) {
        let (world, ready) = &*self.world;
        lock(world).queue.push_back(message);
        ready.notify_all();
    }
}

impl HotkeyBackend for SimulatedHotkeys {
    fn register(&mut self, slot: SlotId, combination: &KeyCombination) -> Result<(), OsError> {
        let mut world = lock(&self.world.0);
        if world.claimed_elsewhere.contains(combination) {
            return Err(OsError::new(
                "RegisterHotKey",
                "hot key is already registered by another application",
            ));
        }
        if world.registered.values().any(|c| c == combination) {
            return Err(OsError::new("RegisterHotKey", "hot key is already registered"));
        }
        if world.registered.contains_key(&slot) {
            return Err(OsError::new("RegisterHotKey", format!("id {} in use", slot.0)));
        }
        world.registered.insert(slot, *combination);
        Ok(())
    }

    fn unregister(&mut self, slot: SlotId) -> Result<(), OsError> {
        match lock(&self.world.0).registered.remove(&slot) {
            Some(_) => Ok(()),
            None => Err(OsError::new(
                "UnregisterHotKey",
                format!("hot key {} is not registered", slot.0),
            )),
        }
    }

    fn pump(&mut self, timeout: Duration) -> Vec<NativeMessage> {
        let (world, ready) = &*self.world;
        let guard = lock(world);
        let (mut guard, _) = ready
            .wait_timeout_while(guard, timeout, |w| w.queue.is_empty())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.queue.drain(..).collect()
    }
}
