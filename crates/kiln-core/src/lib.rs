//! The `Core` facade (spec §4, §6.1): the single injected handle that
//! wires persistence, the event bus, the printer registry/scheduler,
//! webhook delivery, and preflight/the heater watchdog into one object.
//!
//! Grounded on `crates/shipper/src/lib.rs`'s module-facade organization and
//! `crates/shipper/src/engine.rs`'s `Reporter`-narrated orchestration of
//! leaf modules into `run_preflight`/`run_publish`/`run_resume`. Where the
//! teacher's engine is a set of top-level functions taking a plan and a
//! reporter, Kiln's `Core` is a long-lived handle — the scheduler and
//! webhook pool are themselves long-lived background tasks, not one-shot
//! pipelines.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

use anyhow::Context;
use kiln_adapter::{
    AdapterConfig, BambuConfig, ElegooConfig, KlipperConfig, OctoPrintConfig, PrinterAdapter,
    Snapshot, TemperatureTargets, build_adapter,
};
use kiln_config::KilnConfig;
use kiln_events::{EventBus, EventDraft, SubscriberCallback, SubscriptionId, WebhookDispatch};
use kiln_persistence::{JobFilter, Store};
use kiln_preflight::{HeaterWatchdogConfig, WatchedPrinter, spawn_heater_watchdog};
use kiln_safety::{GcodeContext, SafetyProfileStore, ValidationMode, validate_gcode};
use kiln_scheduler::{Scheduler, SchedulerConfig};
use kiln_types::{
    AdapterBackend, CancellationToken, Clock, ErrorKind, Event, EventKind, Job, JobOutcome,
    KilnError, KilnResult, Material, MaterialsTracker, OutcomeResult, PrinterCapabilities,
    PrinterId, PrinterState, SafetyProfile, WebhookSubscription,
};
use ulid::Ulid;

/// Credentials supplied per printer at registration time (spec §6.2). The
/// core never persists these in plaintext; it hands them straight to
/// `kiln_adapter::build_adapter` and drops them.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub access_code: Option<String>,
    pub serial: Option<String>,
}

/// External secret source (spec §6.2). Implementations typically wrap a
/// keychain, vault, or `.env` file; the core only ever reads.
pub trait CredentialProvider: Send + Sync {
    fn get_credentials(&self, printer_id: &PrinterId) -> Credentials;
}

/// A `CredentialProvider` for backends that genuinely need none (Klipper,
/// Elegoo) or for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn get_credentials(&self, _printer_id: &PrinterId) -> Credentials {
        Credentials::default()
    }
}

/// Human-facing narration, mirroring the teacher's `Reporter` trait
/// (`engine::Reporter`). `&self` rather than `&mut self` because the core
/// is shared across dispatcher, poller, and watchdog threads behind an
/// `Arc`.
pub trait KilnObserver: Send + Sync {
    fn info(&self, msg: &str);
    fn warn(&self, msg: &str);
    fn error(&self, msg: &str);
}

/// An observer that discards everything. The default for callers that
/// don't want narration.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl KilnObserver for NullObserver {
    fn info(&self, _msg: &str) {}
    fn warn(&self, _msg: &str) {}
    fn error(&self, _msg: &str) {}
}

/// Connection details for a backend family, with credentials carved out
/// into [`CredentialProvider`]. Mirrors `kiln_adapter::AdapterConfig`
/// minus the secret fields.
pub enum PrinterConnection {
    OctoPrint { base_url: String, snapshot_url: Option<String> },
    Klipper { base_url: String },
    Bambu { host: String },
    Elegoo { advertise_host: String, printer_host: String },
}

impl PrinterConnection {
    fn backend(&self) -> AdapterBackend {
        match self {
            PrinterConnection::OctoPrint { .. } => AdapterBackend::OctoPrintHttp,
            PrinterConnection::Klipper { .. } => AdapterBackend::KlipperHttp,
            PrinterConnection::Bambu { .. } => AdapterBackend::BambuMqtt,
            PrinterConnection::Elegoo { .. } => AdapterBackend::ElegooSdcp,
        }
    }
}

/// Everything [`Core::new`] needs to construct the facade. `db_path` may
/// be `":memory:"`-style only in the sense `kiln_persistence::Store`
/// supports; normally a real file path.
pub struct CoreParams {
    pub db_path: PathBuf,
    pub audit_key: Vec<u8>,
    pub webhook_passphrase: Option<String>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub materials: Option<Arc<dyn MaterialsTracker>>,
    pub clock: Arc<dyn Clock>,
    pub config: KilnConfig,
    pub observer: Arc<dyn KilnObserver>,
}

/// The single injected handle (spec §4, §9). Cloning is not supported —
/// share one `Arc<Core>` across callers instead, the same way the
/// scheduler and webhook pool are shared.
pub struct Core {
    store: Store,
    event_bus: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    webhook: Arc<kiln_webhook::WebhookDeliveryService>,
    credentials: Arc<dyn CredentialProvider>,
    safety_profiles: SafetyProfileStore,
    observer: Arc<dyn KilnObserver>,
    watchdog_printers: Arc<Mutex<Vec<WatchedPrinter>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    profiles_by_printer: Mutex<HashMap<PrinterId, SafetyProfile>>,
}

fn persistence_err(e: anyhow::Error) -> KilnError {
    KilnError::new(ErrorKind::PersistenceFailure, e.to_string())
}

impl Core {
    /// Builds the facade and starts its background tasks (dispatcher,
    /// heater watchdog). Printer status pollers start per-printer as each
    /// printer is registered.
    pub fn new(params: CoreParams) -> anyhow::Result<Arc<Self>> {
        let store = Store::open(&params.db_path, params.audit_key, params.webhook_passphrase)
            .context("failed to open Kiln store")?;

        let overflow_bus: Arc<OnceLock<Arc<EventBus>>> = Arc::new(OnceLock::new());
        let overflow_bus_for_cb = Arc::clone(&overflow_bus);
        let webhook_config = kiln_webhook::WebhookConfig {
            worker_count: params.config.webhook.worker_count,
            max_redirects: params.config.webhook.max_redirects,
            ..kiln_webhook::WebhookConfig::default()
        };
        let webhook = Arc::new(kiln_webhook::WebhookDeliveryService::new(
            webhook_config,
            Some(Arc::new(move || {
                if let Some(bus) = overflow_bus_for_cb.get() {
                    let _ = bus.publish(EventDraft::new(EventKind::WebhookOverflow));
                }
            })),
        ));
        webhook.set_subscriptions(store.list_webhooks().context("failed to load webhook subscriptions")?);

        let event_bus = Arc::new(EventBus::new(Arc::new(store.clone()), webhook.clone() as Arc<dyn WebhookDispatch>));
        let _ = overflow_bus.set(Arc::clone(&event_bus));

        let scheduler_config = SchedulerConfig { retry_base: params.config.scheduler.retry_base, ..SchedulerConfig::default() };
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            Arc::clone(&event_bus),
            Arc::clone(&params.clock),
            params.materials.clone(),
            scheduler_config,
        ));

        let mut background = vec![scheduler.spawn_dispatcher()];
        let watchdog_printers = Arc::new(Mutex::new(Vec::new()));
        let watchdog_config =
            HeaterWatchdogConfig { idle_heater_timeout: params.config.heater.idle_timeout, ..HeaterWatchdogConfig::default() };
        background.push(spawn_heater_watchdog(Arc::clone(&watchdog_printers), Arc::clone(&event_bus), watchdog_config));

        Ok(Arc::new(Self {
            store,
            event_bus,
            scheduler,
            webhook,
            credentials: params.credentials,
            safety_profiles: SafetyProfileStore::new(),
            observer: params.observer,
            watchdog_printers,
            background: Mutex::new(background),
            profiles_by_printer: Mutex::new(HashMap::new()),
        }))
    }

    /// Stops the dispatcher and every status poller. The heater watchdog
    /// thread is left detached (it has no shutdown signal of its own and
    /// only ever wakes once per poll interval, so blocking on it here
    /// would stall shutdown for no benefit).
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut self.background.lock().expect("background lock poisoned"));
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn audit(&self, actor_id: Option<String>, tool_name: &str, params: &serde_json::Value, result_kind: &str) {
        let actor_id = actor_id.unwrap_or_else(|| "unknown".to_string());
        if let Err(e) = self.store.record_action(actor_id, tool_name.to_string(), params, result_kind.to_string()) {
            self.observer.error(&format!("failed to append audit record for {tool_name}: {e}"));
        }
    }

    // ---- fleet ------------------------------------------------------------

    pub fn register_printer(
        &self,
        name: impl Into<String>,
        connection: PrinterConnection,
        profile_id: &str,
        capabilities: PrinterCapabilities,
        actor_id: Option<String>,
    ) -> KilnResult<PrinterId> {
        let name = name.into();
        let id = PrinterId { name, backend: connection.backend() };
        let creds = self.credentials.get_credentials(&id);

        let adapter_config = match connection {
            PrinterConnection::OctoPrint { base_url, snapshot_url } => {
                let api_key = creds.api_key.ok_or_else(|| KilnError::new(ErrorKind::Auth, "missing OctoPrint API key"))?;
                AdapterConfig::OctoPrint(OctoPrintConfig { base_url, api_key, snapshot_url, capabilities })
            }
            PrinterConnection::Klipper { base_url } => AdapterConfig::Klipper(KlipperConfig { base_url, capabilities }),
            PrinterConnection::Bambu { host } => {
                let access_code = creds.access_code.ok_or_else(|| KilnError::new(ErrorKind::Auth, "missing Bambu access code"))?;
                let serial = creds.serial.ok_or_else(|| KilnError::new(ErrorKind::Auth, "missing Bambu serial"))?;
                AdapterConfig::Bambu(BambuConfig { host, access_code, serial, capabilities })
            }
            PrinterConnection::Elegoo { advertise_host, printer_host } => {
                AdapterConfig::Elegoo(ElegooConfig { advertise_host, printer_host, capabilities })
            }
        };

        let adapter: Arc<dyn PrinterAdapter> =
            Arc::from(build_adapter(adapter_config).map_err(|e| KilnError::new(ErrorKind::Transport, e.to_string()))?);
        let profile = self.safety_profiles.get(profile_id);

        self.scheduler.register_printer(id.clone(), Arc::clone(&adapter), profile.clone());
        self.profiles_by_printer.lock().expect("profiles lock poisoned").insert(id.clone(), profile);
        self.watchdog_printers.lock().expect("watchdog printers lock poisoned").push((id.clone(), adapter));
        self.background.lock().expect("background lock poisoned").push(self.scheduler.spawn_status_poller(id.clone()));

        self.audit(actor_id, "register_printer", &serde_json::json!({"printer_id": id.to_string(), "profile_id": profile_id}), "ok");
        self.observer.info(&format!("registered printer {id}"));
        Ok(id)
    }

    pub fn list_printers(&self) -> Vec<PrinterId> {
        self.scheduler.list_printers()
    }

    pub fn get_state(&self, printer_id: &PrinterId) -> KilnResult<PrinterState> {
        self.scheduler.get_state(printer_id)
    }

    fn profile_for(&self, printer_id: &PrinterId) -> KilnResult<SafetyProfile> {
        self.profiles_by_printer
            .lock()
            .expect("profiles lock poisoned")
            .get(printer_id)
            .cloned()
            .ok_or_else(|| KilnError::new(ErrorKind::InvalidState, "printer not registered"))
    }

    // ---- queue --------------------------------------------------------------

    pub fn submit_job(
        &self,
        filename: impl Into<String>,
        target_printer: Option<PrinterId>,
        priority: i64,
        material: Option<Material>,
        file_hash: impl Into<String>,
        actor_id: Option<String>,
    ) -> KilnResult<String> {
        let filename = filename.into();
        let file_hash = file_hash.into();
        let id = self.scheduler.submit_job(filename.clone(), target_printer, priority, material, file_hash)?;
        self.audit(actor_id, "submit_job", &serde_json::json!({"job_id": id, "filename": filename}), "ok");
        Ok(id)
    }

    pub fn get_job(&self, id: &str) -> KilnResult<Option<Job>> {
        self.scheduler.get_job(id)
    }

    pub fn list_jobs(&self, filter: JobFilter) -> KilnResult<Vec<Job>> {
        self.scheduler.list_jobs(filter)
    }

    pub fn cancel_job(&self, job_id: &str, actor_id: Option<String>) -> KilnResult<()> {
        self.scheduler.cancel_job(job_id)?;
        self.audit(actor_id, "cancel_job", &serde_json::json!({"job_id": job_id}), "ok");
        Ok(())
    }

    // ---- direct printer (bypasses the queue) --------------------------------

    pub fn start_print(
        &self,
        printer_id: &PrinterId,
        remote_filename: &str,
        cancellation_token: Option<CancellationToken>,
        actor_id: Option<String>,
    ) -> KilnResult<()> {
        let adapter = self.scheduler.printer_adapter(printer_id)?;
        let profile = self.profile_for(printer_id)?;
        kiln_preflight::preflight(adapter.as_ref(), remote_filename, TemperatureTargets::default(), None, &profile)?;
        let cancel = cancellation_token.unwrap_or_default();
        let result = adapter.start_print(remote_filename, &cancel);
        self.audit(
            actor_id,
            "start_print",
            &serde_json::json!({"printer_id": printer_id.to_string(), "filename": remote_filename}),
            if result.is_ok() { "ok" } else { "error" },
        );
        result
    }

    pub fn cancel_print(&self, printer_id: &PrinterId, actor_id: Option<String>) -> KilnResult<()> {
        let adapter = self.scheduler.printer_adapter(printer_id)?;
        let result = adapter.cancel_print();
        self.audit(actor_id, "cancel_print", &serde_json::json!({"printer_id": printer_id.to_string()}), if result.is_ok() { "ok" } else { "error" });
        result
    }

    pub fn pause(&self, printer_id: &PrinterId, actor_id: Option<String>) -> KilnResult<()> {
        let adapter = self.scheduler.printer_adapter(printer_id)?;
        let result = adapter.pause_print();
        self.audit(actor_id, "pause", &serde_json::json!({"printer_id": printer_id.to_string()}), if result.is_ok() { "ok" } else { "error" });
        result
    }

    pub fn resume(&self, printer_id: &PrinterId, actor_id: Option<String>) -> KilnResult<()> {
        let adapter = self.scheduler.printer_adapter(printer_id)?;
        let result = adapter.resume_print();
        self.audit(actor_id, "resume", &serde_json::json!({"printer_id": printer_id.to_string()}), if result.is_ok() { "ok" } else { "error" });
        result
    }

    pub fn set_temperature(&self, printer_id: &PrinterId, targets: TemperatureTargets, actor_id: Option<String>) -> KilnResult<()> {
        let adapter = self.scheduler.printer_adapter(printer_id)?;
        let profile = self.profile_for(printer_id)?;
        if let Some(hotend) = targets.hotend
            && hotend > profile.max_hotend_c
        {
            let err = KilnError::new(ErrorKind::SafetyViolation, "requested hotend target exceeds profile ceiling")
                .with_details(serde_json::json!({"requested": hotend, "max": profile.max_hotend_c}));
            self.audit(actor_id, "set_temperature", &serde_json::json!({"printer_id": printer_id.to_string()}), "error");
            return Err(err);
        }
        if let Some(bed) = targets.bed
            && bed > profile.max_bed_c
        {
            let err = KilnError::new(ErrorKind::SafetyViolation, "requested bed target exceeds profile ceiling")
                .with_details(serde_json::json!({"requested": bed, "max": profile.max_bed_c}));
            self.audit(actor_id, "set_temperature", &serde_json::json!({"printer_id": printer_id.to_string()}), "error");
            return Err(err);
        }
        if let Some(chamber) = targets.chamber
            && let Some(max_chamber) = profile.max_chamber_c
            && chamber > max_chamber
        {
            let err = KilnError::new(ErrorKind::SafetyViolation, "requested chamber target exceeds profile ceiling")
                .with_details(serde_json::json!({"requested": chamber, "max": max_chamber}));
            self.audit(actor_id, "set_temperature", &serde_json::json!({"printer_id": printer_id.to_string()}), "error");
            return Err(err);
        }
        let result = adapter.set_temperature(targets);
        self.audit(
            actor_id,
            "set_temperature",
            &serde_json::json!({"printer_id": printer_id.to_string(), "hotend": targets.hotend, "bed": targets.bed, "chamber": targets.chamber}),
            if result.is_ok() { "ok" } else { "error" },
        );
        result
    }

    pub fn send_gcode(&self, printer_id: &PrinterId, lines: &[String], actor_id: Option<String>) -> KilnResult<Vec<String>> {
        let adapter = self.scheduler.printer_adapter(printer_id)?;
        let profile = self.profile_for(printer_id)?;
        let report = validate_gcode(lines, &profile, ValidationMode::Strict, GcodeContext::Interactive)?;
        if !report.is_clean() {
            let err = KilnError::new(ErrorKind::SafetyViolation, "G-code batch contains rejected commands")
                .with_details(serde_json::json!({"rejections": report.rejections}));
            self.audit(actor_id, "send_gcode", &serde_json::json!({"printer_id": printer_id.to_string(), "line_count": lines.len()}), "error");
            return Err(err);
        }
        let result = adapter.send_gcode(&report.accepted);
        self.audit(
            actor_id,
            "send_gcode",
            &serde_json::json!({"printer_id": printer_id.to_string(), "line_count": lines.len()}),
            if result.is_ok() { "ok" } else { "error" },
        );
        result
    }

    pub fn snapshot(&self, printer_id: &PrinterId) -> KilnResult<Snapshot> {
        let adapter = self.scheduler.printer_adapter(printer_id)?;
        adapter.get_snapshot()
    }

    pub fn preflight(&self, printer_id: &PrinterId, filename: &str, material: Option<Material>) -> KilnResult<()> {
        let adapter = self.scheduler.printer_adapter(printer_id)?;
        let profile = self.profile_for(printer_id)?;
        kiln_preflight::preflight(adapter.as_ref(), filename, TemperatureTargets::default(), material, &profile)
    }

    // ---- event stream -------------------------------------------------------

    pub fn subscribe(&self, kinds: Vec<EventKind>, callback: SubscriberCallback) -> Option<SubscriptionId> {
        self.event_bus.subscribe(kinds, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.event_bus.unsubscribe(id);
    }

    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        self.event_bus.recent_events(limit)
    }

    // ---- webhooks ------------------------------------------------------------

    pub fn register_webhook(
        &self,
        url: impl Into<String>,
        event_kinds: Vec<EventKind>,
        secret: Option<String>,
        actor_id: Option<String>,
    ) -> KilnResult<String> {
        let url = url.into();
        kiln_webhook::validate_subscription_url(&url)?;
        let subscription = WebhookSubscription {
            id: Ulid::new().to_string(),
            url,
            event_kinds,
            secret,
            created_at: chrono::Utc::now(),
        };
        self.store.register_webhook(subscription.clone()).map_err(persistence_err)?;
        self.refresh_webhook_subscriptions()?;
        self.audit(actor_id, "register_webhook", &serde_json::json!({"webhook_id": subscription.id}), "ok");
        Ok(subscription.id)
    }

    pub fn list_webhooks(&self) -> KilnResult<Vec<WebhookSubscription>> {
        self.store.list_webhooks().map_err(persistence_err)
    }

    pub fn delete_webhook(&self, id: &str, actor_id: Option<String>) -> KilnResult<()> {
        self.store.delete_webhook(id).map_err(persistence_err)?;
        self.refresh_webhook_subscriptions()?;
        self.audit(actor_id, "delete_webhook", &serde_json::json!({"webhook_id": id}), "ok");
        Ok(())
    }

    fn refresh_webhook_subscriptions(&self) -> KilnResult<()> {
        let subs = self.store.list_webhooks().map_err(persistence_err)?;
        self.webhook.set_subscriptions(subs);
        Ok(())
    }

    // ---- outcomes & audit -----------------------------------------------------

    pub fn record_outcome(&self, outcome: JobOutcome, actor_id: Option<String>) -> KilnResult<()> {
        let is_violation_risk = outcome.result == OutcomeResult::Failed;
        let result = self.store.record_outcome(outcome.clone());
        let result_kind = match &result {
            Ok(()) => "ok",
            Err(kiln_persistence::PersistenceError::SafetyViolation(_)) => "safety_violation",
            Err(_) => "error",
        };
        if is_violation_risk || result_kind == "safety_violation" {
            self.audit(actor_id, "record_outcome", &serde_json::json!({"job_id": outcome.job_id}), result_kind);
        }
        result.map_err(|e| match e {
            kiln_persistence::PersistenceError::SafetyViolation(msg) => KilnError::new(ErrorKind::SafetyViolation, msg),
            kiln_persistence::PersistenceError::Conflict(msg) => KilnError::new(ErrorKind::InvalidState, msg),
            kiln_persistence::PersistenceError::Other(e) => persistence_err(e),
        })
    }

    pub fn verify_audit(&self) -> KilnResult<kiln_audit::VerifyResult> {
        self.store.verify_audit().map_err(persistence_err)
    }
}

// Re-exported so `kiln-core` callers don't need a direct `kiln-audit` or
// `kiln-webhook` dependency just to see these types in `Core`'s signatures.
pub use kiln_audit;
pub use kiln_webhook;

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_adapter::MockAdapter;
    use kiln_types::{PrinterState, SystemClock};

    fn test_capabilities() -> PrinterCapabilities {
        PrinterCapabilities { can_set_temp: true, can_send_gcode: true, can_snapshot: false, can_update_firmware: false, device_type: "mock".into() }
    }

    fn test_core() -> (Arc<Core>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let core = Core::new(CoreParams {
            db_path: dir.path().join("kiln.db"),
            audit_key: vec![7u8; 32],
            webhook_passphrase: None,
            credentials: Arc::new(NoCredentials),
            materials: None,
            clock: Arc::new(SystemClock),
            config: KilnConfig::default(),
            observer: Arc::new(NullObserver),
        })
        .unwrap();
        (core, dir)
    }

    #[test]
    fn register_printer_without_api_key_fails_for_octoprint() {
        let (core, _dir) = test_core();
        let err = core
            .register_printer(
                "printer-1",
                PrinterConnection::OctoPrint { base_url: "http://127.0.0.1:9".into(), snapshot_url: None },
                "generic",
                test_capabilities(),
                None,
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Auth);
    }

    #[test]
    fn register_printer_klipper_needs_no_credentials() {
        let (core, _dir) = test_core();
        let id = core
            .register_printer(
                "printer-1",
                PrinterConnection::Klipper { base_url: "http://127.0.0.1:9".into() },
                "generic",
                test_capabilities(),
                None,
            )
            .unwrap();
        assert!(core.list_printers().contains(&id));
        core.shutdown();
    }

    #[test]
    fn submit_and_cancel_job_round_trip() {
        let (core, _dir) = test_core();
        let job_id = core.submit_job("a.gcode", None, 0, None, "hash-a", Some("tester".into())).unwrap();
        let job = core.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.state, kiln_types::JobState::Queued);
        core.cancel_job(&job_id, None).unwrap();
        let job = core.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.state, kiln_types::JobState::Cancelled);
        core.shutdown();
    }

    #[test]
    fn set_temperature_rejects_targets_above_profile_ceiling() {
        let (core, _dir) = test_core();
        let id = core
            .register_printer(
                "printer-1",
                PrinterConnection::Klipper { base_url: "http://127.0.0.1:9".into() },
                "generic",
                test_capabilities(),
                None,
            )
            .unwrap();
        let err = core
            .set_temperature(&id, TemperatureTargets { hotend: Some(999.0), bed: None, chamber: None }, None)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SafetyViolation);
        core.shutdown();
    }

    #[test]
    fn send_gcode_rejects_blocked_command() {
        let (core, _dir) = test_core();
        let id = core
            .register_printer(
                "printer-1",
                PrinterConnection::Klipper { base_url: "http://127.0.0.1:9".into() },
                "generic",
                test_capabilities(),
                None,
            )
            .unwrap();
        let err = core.send_gcode(&id, &["M997".to_string()], None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SafetyViolation);
        core.shutdown();
    }

    #[test]
    fn register_webhook_rejects_non_ssrf_safe_url() {
        let (core, _dir) = test_core();
        let err = core.register_webhook("http://127.0.0.1:8080/hook", vec![EventKind::JobCompleted], None, None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SsrfBlocked);
        core.shutdown();
    }

    #[test]
    fn verify_audit_reports_clean_chain_after_registrations() {
        let (core, _dir) = test_core();
        core.register_printer(
            "printer-1",
            PrinterConnection::Klipper { base_url: "http://127.0.0.1:9".into() },
            "generic",
            test_capabilities(),
            Some("tester".into()),
        )
        .unwrap();
        let report = core.verify_audit().unwrap();
        assert!(report.ok);
        core.shutdown();
    }

    #[test]
    fn mock_adapter_compiles_against_printer_adapter_trait_object() {
        let adapter: Arc<dyn PrinterAdapter> = Arc::new(MockAdapter::new(test_capabilities(), PrinterState::offline()));
        assert_eq!(adapter.get_status().status, kiln_types::PrinterStatus::Offline);
    }
}
