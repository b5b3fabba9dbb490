//! Preflight gate and heater watchdog (spec §4.7).
//!
//! Grounded on `shipper/src/engine.rs`'s `run_preflight`: a sequential list
//! of checks, first failure wins, each step explains itself rather than
//! just returning `false`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use kiln_adapter::{PrinterAdapter, TemperatureTargets};
use kiln_events::{EventBus, EventDraft};
use kiln_types::{EventKind, ErrorKind, KilnError, KilnResult, Material, PrinterId, PrinterStatus, SafetyProfile, material_temp_ranges};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Runs the five ordered preflight checks (spec §4.7). Returns the
/// specific failing check and observed value on the first failure.
pub fn preflight(
    adapter: &dyn PrinterAdapter,
    filename: &str,
    targets: TemperatureTargets,
    material: Option<Material>,
    profile: &SafetyProfile,
) -> KilnResult<()> {
    let state = adapter.get_status();

    if state.status == PrinterStatus::Offline {
        return Err(failure("printer_reachable", serde_json::json!({"status": "OFFLINE"})));
    }

    if state.status != PrinterStatus::Idle {
        return Err(failure("printer_idle", serde_json::json!({"status": state.status})));
    }

    let files = adapter.list_files()?;
    if !files.iter().any(|f| f.name == filename) {
        return Err(failure("file_exists", serde_json::json!({"filename": filename})));
    }

    if let Some(hotend) = targets.hotend
        && hotend > profile.max_hotend_c
    {
        return Err(failure(
            "targets_within_profile",
            serde_json::json!({"field": "hotend", "requested": hotend, "max": profile.max_hotend_c}),
        ));
    }
    if let Some(bed) = targets.bed
        && bed > profile.max_bed_c
    {
        return Err(failure(
            "targets_within_profile",
            serde_json::json!({"field": "bed", "requested": bed, "max": profile.max_bed_c}),
        ));
    }
    if let Some(chamber) = targets.chamber
        && let Some(max_chamber) = profile.max_chamber_c
        && chamber > max_chamber
    {
        return Err(failure(
            "targets_within_profile",
            serde_json::json!({"field": "chamber", "requested": chamber, "max": max_chamber}),
        ));
    }

    if let Some(material) = material {
        let ((hotend_min, hotend_max), (bed_min, bed_max)) = material_temp_ranges(material);
        if let Some(hotend) = targets.hotend
            && !(hotend_min..=hotend_max).contains(&hotend)
        {
            return Err(failure(
                "material_temperature_range",
                serde_json::json!({"field": "hotend", "requested": hotend, "expected_range": [hotend_min, hotend_max]}),
            ));
        }
        if let Some(bed) = targets.bed
            && !(bed_min..=bed_max).contains(&bed)
        {
            return Err(failure(
                "material_temperature_range",
                serde_json::json!({"field": "bed", "requested": bed, "expected_range": [bed_min, bed_max]}),
            ));
        }
    }

    Ok(())
}

fn failure(check: &'static str, observed: serde_json::Value) -> KilnError {
    KilnError::new(ErrorKind::PreflightFailed, format!("preflight check failed: {check}"))
        .with_details(serde_json::json!({"check": check, "observed": observed}))
}

/// Configuration for [`spawn_heater_watchdog`]. `idle_heater_timeout ==
/// Duration::ZERO` disables the watchdog entirely.
#[derive(Debug, Clone, Copy)]
pub struct HeaterWatchdogConfig {
    pub idle_heater_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for HeaterWatchdogConfig {
    fn default() -> Self {
        Self { idle_heater_timeout: Duration::from_secs(30 * 60), poll_interval: DEFAULT_POLL_INTERVAL }
    }
}

/// One registered printer the watchdog polls.
pub type WatchedPrinter = (PrinterId, Arc<dyn PrinterAdapter>);

fn heaters_are_on(targets: &kiln_types::PrinterState) -> bool {
    targets.tool_temps.iter().any(|t| t.target.unwrap_or(0.0) > 0.0) || targets.bed_temp.target.unwrap_or(0.0) > 0.0
}

/// Spawns the background task that polls every registered printer at
/// `poll_interval` and cools any printer idle with a nonzero heater target
/// for longer than `idle_heater_timeout`.
pub fn spawn_heater_watchdog(
    printers: Arc<Mutex<Vec<WatchedPrinter>>>,
    event_bus: Arc<EventBus>,
    config: HeaterWatchdogConfig,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("kiln-heater-watchdog".into())
        .spawn(move || {
            if config.idle_heater_timeout.is_zero() {
                return;
            }
            let mut idle_since: HashMap<PrinterId, Instant> = HashMap::new();
            loop {
                thread::sleep(config.poll_interval);
                let snapshot: Vec<WatchedPrinter> = printers.lock().expect("printers lock poisoned").clone();
                for (id, adapter) in snapshot {
                    let state = adapter.get_status();
                    if state.status == PrinterStatus::Idle && heaters_are_on(&state) {
                        let now = Instant::now();
                        let first_seen = *idle_since.entry(id.clone()).or_insert(now);
                        if now.duration_since(first_seen) >= config.idle_heater_timeout {
                            if adapter.set_temperature(TemperatureTargets { hotend: Some(0.0), bed: Some(0.0), chamber: None }).is_ok() {
                                let draft = EventDraft::new(EventKind::HeatersAutoCooled)
                                    .with_printer(id.clone())
                                    .with_payload(serde_json::json!({"idle_for_seconds": now.duration_since(first_seen).as_secs()}));
                                let _ = event_bus.publish(draft);
                            }
                            idle_since.remove(&id);
                        }
                    } else {
                        idle_since.remove(&id);
                    }
                }
            }
        })
        .expect("failed to spawn heater watchdog thread")
}
