//! End-to-end tests for the hotkey dispatch and activation engine
//!
//! Everything runs against the simulated hotkey and display backends, so the
//! suite is deterministic and runs on any host:
//!
//! ```bash
//! cargo test --test engine_integration
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use display_hotkeys::display::{ApplyError, DisplayStatus, OutcomeStatus};
use display_hotkeys::hotkey::codec::encode_packed;
use display_hotkeys::hotkey::{KeyCombination, NativeMessage, RegisterError, WM_HOTKEY};
use display_hotkeys::native::OsError;
use display_hotkeys::orchestrator::{ActivationReport, ActivationResult};
use display_hotkeys::profile::{
    DisplayProfile, DisplaySettings, MemoryProfileStore, ProfileId, ResolveError,
};
use display_hotkeys::settings::AppSettings;
use display_hotkeys::simulated::{monitor, SimOp, SimulatedDisplays, SimulatedHotkeys};
use display_hotkeys::state_machine::{FailureReason, Stage, Trigger};
use display_hotkeys::{ActivateError, Engine};

const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

fn ctrl_alt(key: u8) -> KeyCombination {
    KeyCombination::new(key as u16).ctrl().alt()
}

fn settings() -> AppSettings {
    AppSettings {
        listener_poll_ms: 5,
        ..AppSettings::default()
    }
}

/// D0 primary at the origin, D1 to its right at 1920x1080@60.
fn two_displays() -> SimulatedDisplays {
    SimulatedDisplays::new(vec![
        monitor("D0", 2560, 1440, 60)
            .primary()
            .with_refresh_rates(vec![60, 120]),
        monitor("D1", 1920, 1080, 60)
            .at(2560, 0)
            .with_refresh_rates(vec![60, 144])
            .with_hdr(true, false),
    ])
}

fn p1() -> DisplayProfile {
    DisplayProfile::new(1, "P1")
        .with_hotkey(ctrl_alt(b'1'))
        .with_display(DisplaySettings::new("D1").primary(true).refresh_rate(144))
}

struct Harness {
    engine: Engine,
    hotkeys: SimulatedHotkeys,
    displays: SimulatedDisplays,
    store: Arc<MemoryProfileStore>,
}

fn start(profiles: Vec<DisplayProfile>, displays: SimulatedDisplays) -> Harness {
    let hotkeys = SimulatedHotkeys::new();
    let store = Arc::new(MemoryProfileStore::new(profiles).unwrap());
    let backend = hotkeys.clone();
    let engine = Engine::start(
        move || Ok(backend),
        displays.clone(),
        store.clone(),
        &settings(),
    );
    Harness {
        engine,
        hotkeys,
        displays,
        store,
    }
}

async fn next_report(rx: &mut broadcast::Receiver<ActivationReport>) -> ActivationReport {
    tokio::time::timeout(REPORT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for an activation report")
        .expect("activation stream closed")
}

#[tokio::test(flavor = "multi_thread")]
async fn hotkey_press_applies_bound_profile() {
    let h = start(vec![p1()], two_displays());
    assert!(h.engine.register_all_bound_hotkeys().await.is_empty());
    assert_eq!(h.engine.hotkey_status().registered, 1);

    let mut reports = h.engine.on_activation();
    assert!(h.hotkeys.press(ctrl_alt(b'1')));

    let report = next_report(&mut reports).await;
    assert!(matches!(report.trigger, Trigger::HotKey { .. }));
    assert_eq!(report.profile_id, Some(ProfileId(1)));

    let outcome = report.outcome().expect("activation should reach the applier");
    assert_eq!(outcome.status, OutcomeStatus::Applied);
    assert_eq!(outcome.status_of(&"D1".into()), Some(&DisplayStatus::Changed));

    let d1 = h.displays.display("D1").unwrap();
    assert!(d1.is_primary);
    assert_eq!(d1.mode.refresh_rate, 144);
    assert!(!h.displays.display("D0").unwrap().is_primary);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn back_to_back_presses_run_in_arrival_order() {
    let profiles = vec![
        DisplayProfile::new(1, "Fast D1")
            .with_hotkey(ctrl_alt(b'1'))
            .with_display(DisplaySettings::new("D1").refresh_rate(144)),
        DisplayProfile::new(2, "Fast D0")
            .with_hotkey(ctrl_alt(b'2'))
            .with_display(DisplaySettings::new("D0").refresh_rate(120)),
    ];
    let h = start(profiles, two_displays());
    h.displays.set_latency(Duration::from_millis(100));
    assert!(h.engine.register_all_bound_hotkeys().await.is_empty());

    let mut reports = h.engine.on_activation();
    assert!(h.hotkeys.press(ctrl_alt(b'1')));
    assert!(h.hotkeys.press(ctrl_alt(b'2')));

    let first = next_report(&mut reports).await;
    let second = next_report(&mut reports).await;
    assert_eq!(first.profile_id, Some(ProfileId(1)));
    assert_eq!(second.profile_id, Some(ProfileId(2)));
    assert_eq!(first.outcome().unwrap().status, OutcomeStatus::Applied);
    assert_eq!(second.outcome().unwrap().status, OutcomeStatus::Applied);

    // The second activation only started after the first one finished.
    let first_done =
        first.started_at + chrono::Duration::milliseconds(first.duration_ms as i64);
    assert!(second.started_at >= first_done);

    let calls: Vec<_> = h.displays.calls().into_iter().map(|c| c.display.0).collect();
    assert_eq!(calls, vec!["D1".to_string(), "D0".to_string()]);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn press_for_released_slot_fails_with_unknown_slot() {
    let h = start(vec![p1()], two_displays());
    assert!(h.engine.register_all_bound_hotkeys().await.is_empty());
    let slot = h.engine.registrations().entries()[0].slot;

    // Unbind the hotkey; rebinding releases the slot.
    h.store
        .upsert(DisplayProfile {
            hotkey: None,
            ..p1()
        })
        .unwrap();
    assert!(h.engine.register_all_bound_hotkeys().await.is_empty());
    assert!(h.engine.registrations().is_empty());

    // A notification already queued for the old slot arrives late.
    let mut reports = h.engine.on_activation();
    h.hotkeys.post(NativeMessage {
        message: WM_HOTKEY,
        wparam: slot.0 as usize,
        lparam: encode_packed(&ctrl_alt(b'1')) as isize,
    });

    let report = next_report(&mut reports).await;
    match report.result {
        ActivationResult::Failed(failure) => {
            assert_eq!(failure.stage, Stage::Resolve);
            assert_eq!(
                failure.reason,
                FailureReason::Resolve(ResolveError::UnknownSlot(slot))
            );
        }
        other => panic!("expected a resolve failure, got {:?}", other),
    }
    assert!(h.displays.calls().is_empty());

    // The engine keeps serving activations afterwards.
    let outcome = h.engine.activate_profile(ProfileId(1)).await.unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Applied);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn late_press_after_rebind_does_not_apply_the_new_profile() {
    let h = start(vec![p1()], two_displays());
    assert!(h.engine.register_all_bound_hotkeys().await.is_empty());
    let old_slot = h.engine.registrations().entries()[0].slot;

    // P1 goes away and P2 takes a different hotkey.
    assert!(h.store.remove(ProfileId(1)));
    h.store
        .upsert(
            DisplayProfile::new(2, "P2")
                .with_hotkey(ctrl_alt(b'2'))
                .with_display(DisplaySettings::new("D0").refresh_rate(120)),
        )
        .unwrap();
    assert!(h.engine.register_all_bound_hotkeys().await.is_empty());
    let new_slot = h.engine.registrations().entries()[0].slot;
    assert_ne!(old_slot, new_slot);

    // A Ctrl+Alt+1 notification for the old slot arrives after the rebind.
    let mut reports = h.engine.on_activation();
    h.hotkeys.post(NativeMessage {
        message: WM_HOTKEY,
        wparam: old_slot.0 as usize,
        lparam: encode_packed(&ctrl_alt(b'1')) as isize,
    });

    let report = next_report(&mut reports).await;
    assert_eq!(report.profile_id, None);
    match report.result {
        ActivationResult::Failed(failure) => assert_eq!(
            failure.reason,
            FailureReason::Resolve(ResolveError::UnknownSlot(old_slot))
        ),
        other => panic!("expected a resolve failure, got {:?}", other),
    }
    assert!(h.displays.calls().is_empty());
    assert_eq!(h.displays.display("D0").unwrap().mode.refresh_rate, 60);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rebinding_moves_hotkey_to_new_combination() {
    let h = start(vec![p1()], two_displays());
    assert!(h.engine.register_all_bound_hotkeys().await.is_empty());

    h.store.upsert(p1().with_hotkey(ctrl_alt(b'2'))).unwrap();
    assert!(h.engine.register_all_bound_hotkeys().await.is_empty());

    let live: Vec<_> = h.hotkeys.registered().into_iter().map(|(_, c)| c).collect();
    assert_eq!(live, vec![ctrl_alt(b'2')]);
    assert!(!h.hotkeys.press(ctrl_alt(b'1')));

    let mut reports = h.engine.on_activation();
    assert!(h.hotkeys.press(ctrl_alt(b'2')));
    let report = next_report(&mut reports).await;
    assert_eq!(report.outcome().unwrap().status, OutcomeStatus::Applied);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn registration_errors_are_collected_not_fatal() {
    let profiles = vec![
        p1(),
        DisplayProfile::new(2, "Taken")
            .with_hotkey(ctrl_alt(b'3'))
            .with_display(DisplaySettings::new("D0").refresh_rate(120)),
        DisplayProfile::new(3, "No key").with_hotkey(KeyCombination::default().ctrl()),
    ];
    let h = start(profiles, two_displays());
    h.hotkeys.claim_elsewhere(ctrl_alt(b'3'));

    let errors = h.engine.register_all_bound_hotkeys().await;
    assert_eq!(errors.len(), 2);
    assert!(errors
        .iter()
        .any(|e| matches!(e, RegisterError::OsRejected { .. })));
    assert!(errors
        .iter()
        .any(|e| matches!(e, RegisterError::InvalidCombination(_))));

    // The profile that could be bound still works.
    assert_eq!(h.engine.registrations().len(), 1);
    let mut reports = h.engine.on_activation();
    assert!(h.hotkeys.press(ctrl_alt(b'1')));
    assert_eq!(
        next_report(&mut reports).await.outcome().unwrap().status,
        OutcomeStatus::Applied
    );

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_activation_reports_partial_failure() {
    let profile = DisplayProfile::new(5, "Desk")
        .with_display(DisplaySettings::new("D1").refresh_rate(144))
        .with_display(DisplaySettings::new("D9").primary(true));
    let h = start(vec![profile], two_displays());

    let outcome = h.engine.activate_profile(ProfileId(5)).await.unwrap();
    assert_eq!(outcome.status, OutcomeStatus::PartiallyApplied);
    assert_eq!(outcome.status_of(&"D1".into()), Some(&DisplayStatus::Changed));
    assert_eq!(
        outcome.status_of(&"D9".into()),
        Some(&DisplayStatus::Failed(ApplyError::DisplayNotFound))
    );

    let summary = h.engine.history_summary();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.partially_applied, 1);
    assert!(summary.last_failure.is_some());

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_profile_and_snapshot_failures_surface_as_errors() {
    let h = start(vec![p1()], two_displays());

    let err = h.engine.activate_profile(ProfileId(42)).await.unwrap_err();
    match err {
        ActivateError::Failed(failure) => {
            assert_eq!(failure.stage, Stage::Resolve);
            assert_eq!(
                failure.reason,
                FailureReason::Resolve(ResolveError::ProfileNotFound(ProfileId(42)))
            );
        }
        other => panic!("unexpected error {:?}", other),
    }

    h.displays.fail_enumeration("driver reset");
    let err = h.engine.activate_profile(ProfileId(1)).await.unwrap_err();
    assert!(matches!(
        err,
        ActivateError::Failed(ref f) if f.stage == Stage::Snapshot
    ));

    h.displays.restore_enumeration();
    h.displays.fail_on("D1", SimOp::SetPrimary, "topology locked");
    let outcome = h.engine.activate_profile(ProfileId(1)).await.unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Failed);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_without_hotkeys_still_activates_directly() {
    let displays = two_displays();
    let store = Arc::new(MemoryProfileStore::new(vec![p1()]).unwrap());
    let engine = Engine::start(
        || Err::<SimulatedHotkeys, _>(OsError::new("CreateWindowExW", "access denied")),
        displays.clone(),
        store,
        &settings(),
    );

    let status = engine.hotkey_status();
    assert!(!status.active);
    assert!(status.error.unwrap().contains("access denied"));
    assert_eq!(
        engine.register_all_bound_hotkeys().await,
        vec![RegisterError::ListenerGone]
    );

    let outcome = engine.activate_profile(ProfileId(1)).await.unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Applied);
    assert!(displays.display("D1").unwrap().is_primary);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_releases_every_hotkey() {
    let h = start(vec![p1()], two_displays());
    assert!(h.engine.register_all_bound_hotkeys().await.is_empty());
    assert_eq!(h.hotkeys.registered().len(), 1);

    h.engine.shutdown().await;
    assert!(h.hotkeys.registered().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_is_read_fresh_each_time() {
    let h = start(vec![p1()], two_displays());
    assert_eq!(h.engine.capture_snapshot().await.unwrap().displays.len(), 2);

    h.displays.connect(monitor("D2", 1280, 1024, 75).at(-1280, 0));
    let snapshot = h.engine.capture_snapshot().await.unwrap();
    assert_eq!(snapshot.displays.len(), 3);
    assert_eq!(snapshot.primary().map(|d| d.id.0.as_str()), Some("D0"));

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnected_display_is_not_found_on_next_activation() {
    let h = start(vec![p1()], two_displays());
    let first = h.engine.activate_profile(ProfileId(1)).await.unwrap();
    assert_eq!(first.status, OutcomeStatus::Applied);
    let calls_before = h.displays.calls().len();

    h.displays.disconnect("D1");
    let second = h.engine.activate_profile(ProfileId(1)).await.unwrap();
    assert_eq!(second.status, OutcomeStatus::Failed);
    assert_eq!(
        second.status_of(&"D1".into()),
        Some(&DisplayStatus::Failed(ApplyError::DisplayNotFound))
    );
    assert_eq!(h.displays.calls().len(), calls_before);

    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_mid_apply_finishes_the_running_call_only() {
    let profile = DisplayProfile::new(7, "Both rates")
        .with_hotkey(ctrl_alt(b'7'))
        .with_display(DisplaySettings::new("D0").refresh_rate(120))
        .with_display(DisplaySettings::new("D1").refresh_rate(144));
    let h = start(vec![profile], two_displays());
    assert!(h.engine.register_all_bound_hotkeys().await.is_empty());
    h.displays.set_latency(Duration::from_millis(300));

    let mut reports = h.engine.on_activation();
    assert!(h.hotkeys.press(ctrl_alt(b'7')));
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.engine.shutdown().await;

    let report = next_report(&mut reports).await;
    let outcome = report.outcome().expect("cancelled while applying");
    assert_eq!(outcome.status, OutcomeStatus::PartiallyApplied);
    assert_eq!(outcome.status_of(&"D0".into()), Some(&DisplayStatus::Changed));
    assert_eq!(
        outcome.status_of(&"D1".into()),
        Some(&DisplayStatus::Failed(ApplyError::Cancelled))
    );
    assert_eq!(h.displays.calls().len(), 1);
    assert_eq!(h.displays.display("D1").unwrap().mode.refresh_rate, 60);
}
