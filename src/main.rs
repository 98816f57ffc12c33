//! display-hotkeys command line
//!
//! ```bash
//! # Listen for the hotkeys bound in profiles.json until Ctrl+C
//! display-hotkeys run
//!
//! # Apply profile 2 once
//! display-hotkeys activate 2
//!
//! # Try a profile file against simulated displays
//! display-hotkeys --dry-run --profiles ./profiles.json activate 1
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;

use display_hotkeys::display::{DisplayId, DisplayStatus};
use display_hotkeys::orchestrator::ActivationResult;
use display_hotkeys::profile::{DisplayProfile, JsonProfileStore, ProfileId, ProfileStore};
use display_hotkeys::settings::{self, AppSettings};
use display_hotkeys::simulated::{monitor, SimulatedDisplays, SimulatedHotkeys};
use display_hotkeys::{logging, Engine};

/// Switch display profiles with global hotkeys
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Profile file to use instead of the one configured in settings.json
    #[arg(long, global = true)]
    profiles: Option<PathBuf>,

    /// Use simulated hotkeys and displays; nothing is changed on this machine
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register every bound hotkey and apply profiles as they are pressed (default)
    Run,
    /// Apply one profile immediately
    Activate {
        /// Profile id
        id: u64,
    },
    /// List profiles and their hotkeys
    List,
    /// Print the live display topology as JSON
    Snapshot,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Development overrides such as RUST_LOG
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config_dir = settings::config_dir().map_err(anyhow::Error::msg)?;
    let app_settings = settings::load_settings(&settings::settings_path(&config_dir));
    let _log_guard = logging::init(&app_settings.log_level, settings::log_dir().as_deref());

    let profiles_path = cli
        .profiles
        .clone()
        .unwrap_or_else(|| app_settings.profiles_file(&config_dir));
    let store = Arc::new(
        JsonProfileStore::open(profiles_path.clone())
            .with_context(|| format!("Failed to load profiles from {}", profiles_path.display()))?,
    );
    log::info!(
        "Using {} profile(s) from {}",
        store.list_all()?.len(),
        store.path().display()
    );

    match cli.command.unwrap_or(Command::Run) {
        Command::List => list_profiles(&store.list_all()?),
        Command::Snapshot => {
            let engine = start_engine(cli.dry_run, store, &app_settings)?;
            let snapshot = engine.capture_snapshot().await;
            engine.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&snapshot?)?);
            Ok(())
        }
        Command::Activate { id } => {
            let engine = start_engine(cli.dry_run, store, &app_settings)?;
            let result = engine.activate_profile(ProfileId(id)).await;
            engine.shutdown().await;
            let outcome = result.with_context(|| format!("Profile {} was not applied", id))?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Command::Run => {
            let engine = start_engine(cli.dry_run, store, &app_settings)?;
            run(engine).await
        }
    }
}

fn start_engine(
    dry_run: bool,
    store: Arc<JsonProfileStore>,
    settings: &AppSettings,
) -> anyhow::Result<Engine> {
    if dry_run {
        let displays = simulated_topology(&store.list_all()?);
        log::info!("Dry run: using simulated hotkeys and displays");
        return Ok(Engine::start(
            || Ok(SimulatedHotkeys::new()),
            displays,
            store,
            settings,
        ));
    }
    native_engine(store, settings)
}

#[cfg(windows)]
fn native_engine(store: Arc<JsonProfileStore>, settings: &AppSettings) -> anyhow::Result<Engine> {
    use display_hotkeys::display::win32::Win32Displays;
    use display_hotkeys::hotkey::win32::Win32Hotkeys;

    Ok(Engine::start(
        Win32Hotkeys::new,
        Win32Displays::new(),
        store,
        settings,
    ))
}

#[cfg(not(windows))]
fn native_engine(
    _store: Arc<JsonProfileStore>,
    _settings: &AppSettings,
) -> anyhow::Result<Engine> {
    anyhow::bail!("display configuration is only supported on Windows; use --dry-run")
}

/// One simulated 1080p display per display id mentioned in any profile,
/// laid out left to right with the first one primary.
fn simulated_topology(profiles: &[DisplayProfile]) -> SimulatedDisplays {
    let mut seen = HashSet::new();
    let ids: Vec<DisplayId> = profiles
        .iter()
        .flat_map(|p| p.displays.iter().map(|d| d.display_id.clone()))
        .filter(|id| seen.insert(id.clone()))
        .collect();

    let displays = ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let display = monitor(&id.0, 1920, 1080, 60)
                .at(1920 * i as i32, 0)
                .with_refresh_rates(vec![60, 120, 144])
                .with_hdr(true, false);
            if i == 0 {
                display.primary()
            } else {
                display
            }
        })
        .collect();
    SimulatedDisplays::new(displays)
}

fn list_profiles(profiles: &[DisplayProfile]) -> anyhow::Result<()> {
    if profiles.is_empty() {
        println!("No profiles defined");
        return Ok(());
    }
    for profile in profiles {
        let hotkey = profile
            .hotkey
            .map(|h| h.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>4}  {:<24} {:<20} {} display(s)",
            profile.id,
            profile.name,
            hotkey,
            profile.displays.len()
        );
    }
    Ok(())
}

async fn run(engine: Engine) -> anyhow::Result<()> {
    let status = engine.hotkey_status();
    if let Some(error) = &status.error {
        log::error!("Hotkeys are unavailable: {}", error);
    }

    for error in engine.register_all_bound_hotkeys().await {
        log::warn!("Hotkey not registered: {}", error);
    }
    log::info!(
        "Listening for {} hotkey(s); press Ctrl+C to exit",
        engine.registrations().len()
    );

    let mut activations = engine.on_activation();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl+C received");
                break;
            }
            report = activations.recv() => match report {
                Ok(report) => match &report.result {
                    ActivationResult::Done(outcome) => {
                        log::info!(
                            "Profile {} applied: {:?} in {}ms",
                            report.profile_name.as_deref().unwrap_or("?"),
                            outcome.status,
                            report.duration_ms
                        );
                        for display in &outcome.displays {
                            if let DisplayStatus::Failed(reason) = &display.status {
                                log::warn!("  {}: {}", display.display_id, reason);
                            }
                        }
                    }
                    ActivationResult::Failed(failure) => {
                        log::warn!("{} ({})", failure, report.trigger);
                    }
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("Missed {} activation report(s)", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    let summary = engine.history_summary();
    log::info!(
        "Session: {} activation(s), {} applied, {} partial, {} failed",
        summary.total,
        summary.applied,
        summary.partially_applied,
        summary.failed
    );
    engine.shutdown().await;
    Ok(())
}
