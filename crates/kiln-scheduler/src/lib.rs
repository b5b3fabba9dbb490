//! Job queue, history-aware routing, and the dispatch loop (spec §4.6).
//!
//! Grounded on `shipper/src/engine_parallel.rs`'s dispatch shape: a small
//! number of long-lived threads sharing state behind `Arc<Mutex<_>>`, a
//! `Reporter`-narrated retry loop per unit of work, and a locked
//! `update_state_locked`-style CAS generalized here into persistence's
//! `mark_job`. Unlike the teacher, which hands out work in waves and
//! waits on a barrier, Kiln's dispatcher is a single recurring task that
//! re-reads the queue from persistence every tick — closer to the
//! teacher's status-polling shape than its wave-parallel one.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_adapter::{PrinterAdapter, TemperatureTargets};
use kiln_events::{EventBus, EventDraft};
use kiln_persistence::{JobFilter, JobTransition, MarkOutcome, PersistenceError, RoutingStats, Store};
use kiln_types::{
    Clock, ErrorKind, EventKind, Job, JobOutcome, JobState, KilnError, KilnResult, Material,
    MaterialsTracker, OutcomeResult, PrinterId, PrinterStatus, SafetyProfile,
};
use ulid::Ulid;

/// Tunable knobs for the dispatch/routing/polling loops.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Laplace-smoothing α for routing scores. Spec ships α = 1.
    pub routing_alpha: f64,
    pub retry_base: Duration,
    pub max_retries: u32,
    /// A printer's `IDLE` reading must be this fresh to be a routing
    /// candidate.
    pub candidate_freshness: Duration,
    pub status_poll_interval: Duration,
    /// `OFFLINE` for at least this long is treated as a job failure.
    pub offline_grace: Duration,
    pub dispatch_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            routing_alpha: 1.0,
            retry_base: Duration::from_secs(30),
            max_retries: 3,
            candidate_freshness: Duration::from_secs(15),
            status_poll_interval: Duration::from_secs(5),
            offline_grace: Duration::from_secs(30),
            dispatch_interval: Duration::from_secs(1),
        }
    }
}

struct PrinterEntry {
    adapter: Arc<dyn PrinterAdapter>,
    profile: SafetyProfile,
    last_status: Mutex<(PrinterStatus, DateTime<Utc>)>,
    assigned_job: Mutex<Option<String>>,
    offline_since: Mutex<Option<DateTime<Utc>>>,
}

fn persistence_err(e: anyhow::Error) -> KilnError {
    KilnError::new(ErrorKind::PersistenceFailure, e.to_string())
}

fn persistence_err2(e: PersistenceError) -> KilnError {
    match e {
        PersistenceError::SafetyViolation(msg) => KilnError::new(ErrorKind::SafetyViolation, msg),
        PersistenceError::Conflict(msg) => KilnError::new(ErrorKind::InvalidState, msg),
        PersistenceError::Other(e) => persistence_err(e),
    }
}

/// The queue ordering from spec §4.6: priority descending, then
/// submission time ascending, then job id lexicographic (deterministic
/// tie-break).
pub fn queue_order(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.submitted_at.cmp(&b.submitted_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Laplace-smoothed success score: `(successes + α) / (total + 2α)`.
/// Zero-history candidates naturally score `0.5`.
pub fn routing_score(stats: RoutingStats, alpha: f64) -> f64 {
    (stats.successes as f64 + alpha) / (stats.total as f64 + 2.0 * alpha)
}

/// Job queue, router, and dispatch/poll/watchdog task owner. Cloning is
/// cheap ([`Scheduler::new`] returns an owned value, share it behind an
/// `Arc` across the spawned tasks).
pub struct Scheduler {
    store: Store,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    materials: Option<Arc<dyn MaterialsTracker>>,
    config: SchedulerConfig,
    printers: Mutex<HashMap<PrinterId, Arc<PrinterEntry>>>,
    shutdown: AtomicBool,
}

impl Scheduler {
    pub fn new(
        store: Store,
        event_bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        materials: Option<Arc<dyn MaterialsTracker>>,
        config: SchedulerConfig,
    ) -> Self {
        Self { store, event_bus, clock, materials, config, printers: Mutex::new(HashMap::new()), shutdown: AtomicBool::new(false) }
    }

    pub fn register_printer(&self, id: PrinterId, adapter: Arc<dyn PrinterAdapter>, profile: SafetyProfile) {
        let entry = Arc::new(PrinterEntry {
            adapter,
            profile,
            last_status: Mutex::new((PrinterStatus::Offline, self.clock.now())),
            assigned_job: Mutex::new(None),
            offline_since: Mutex::new(None),
        });
        self.printers.lock().expect("printers lock poisoned").insert(id, entry);
    }

    pub fn unregister_printer(&self, id: &PrinterId) {
        self.printers.lock().expect("printers lock poisoned").remove(id);
    }

    pub fn list_printers(&self) -> Vec<PrinterId> {
        self.printers.lock().expect("printers lock poisoned").keys().cloned().collect()
    }

    /// Live-queries the adapter rather than the dispatcher's cached status,
    /// so callers (e.g. a `get_state` API call) always see a fresh read.
    pub fn get_state(&self, id: &PrinterId) -> KilnResult<kiln_types::PrinterState> {
        let entry = self.printers.lock().expect("printers lock poisoned").get(id).cloned();
        match entry {
            Some(entry) => Ok(entry.adapter.get_status()),
            None => Err(KilnError::new(ErrorKind::InvalidState, "printer not registered")),
        }
    }

    /// Direct-printer-bypass handle (spec §6.1): the adapter behind an id,
    /// for callers that want `start_print`/`cancel_print`/etc. without
    /// going through the job queue.
    pub fn printer_adapter(&self, id: &PrinterId) -> KilnResult<Arc<dyn PrinterAdapter>> {
        self.printers
            .lock()
            .expect("printers lock poisoned")
            .get(id)
            .map(|entry| Arc::clone(&entry.adapter))
            .ok_or_else(|| KilnError::new(ErrorKind::InvalidState, "printer not registered"))
    }

    /// The registered safety profile for a printer, for callers that run
    /// their own preflight check outside the dispatch loop.
    pub fn printer_profile(&self, id: &PrinterId) -> KilnResult<SafetyProfile> {
        self.printers
            .lock()
            .expect("printers lock poisoned")
            .get(id)
            .map(|entry| entry.profile.clone())
            .ok_or_else(|| KilnError::new(ErrorKind::InvalidState, "printer not registered"))
    }

    fn publish_event(&self, kind: EventKind, printer_id: Option<PrinterId>, job_id: Option<String>, payload: serde_json::Value) {
        let mut draft = EventDraft::new(kind).with_payload(payload);
        if let Some(p) = printer_id {
            draft = draft.with_printer(p);
        }
        if let Some(j) = job_id {
            draft = draft.with_job(j);
        }
        let _ = self.event_bus.publish(draft);
    }

    /// Queues a new job (`SUBMITTED` then immediately `QUEUED`, per the
    /// diagram in spec §4.6 — there is no externally observable gap
    /// between the two).
    pub fn submit_job(
        &self,
        filename: impl Into<String>,
        target_printer: Option<PrinterId>,
        priority: i64,
        material: Option<Material>,
        file_hash: impl Into<String>,
    ) -> KilnResult<String> {
        let id = Ulid::new().to_string();
        let job = Job {
            id: id.clone(),
            filename: filename.into(),
            target_printer,
            priority,
            material,
            file_hash: file_hash.into(),
            submitted_at: self.clock.now(),
            state: JobState::Submitted,
            retries_remaining: self.config.max_retries,
            retry_not_before: None,
            assigned_printer: None,
            outcome: None,
            generation: 0,
        };
        self.store.enqueue_job(job).map_err(persistence_err2)?;
        self.publish_event(EventKind::JobSubmitted, None, Some(id.clone()), serde_json::json!({}));
        self.store
            .mark_job(&id, 0, JobTransition { new_state: JobState::Queued, ..Default::default() })
            .map_err(persistence_err2)?;
        Ok(id)
    }

    pub fn get_job(&self, id: &str) -> KilnResult<Option<Job>> {
        self.store.get_job(id).map_err(persistence_err)
    }

    pub fn list_jobs(&self, filter: JobFilter) -> KilnResult<Vec<Job>> {
        self.store.read_jobs(filter).map_err(persistence_err)
    }

    /// Cancels a job from any non-terminal state. Signals the adapter's
    /// cancellation and, if the print had already started, calls
    /// `cancel_print`.
    pub fn cancel_job(&self, job_id: &str) -> KilnResult<()> {
        let job = self
            .store
            .get_job(job_id)
            .map_err(persistence_err)?
            .ok_or_else(|| KilnError::new(ErrorKind::InvalidState, "job not found"))?;
        if job.state.is_terminal() {
            // Cancellation is idempotent (spec P8): a job already in a
            // terminal state — including one already cancelled — is a
            // no-op, not an error.
            return Ok(());
        }

        let was_running = job.state == JobState::Running;
        let printer = job.assigned_printer.clone();
        let outcome = self
            .store
            .mark_job(job_id, job.generation, JobTransition { new_state: JobState::Cancelled, ..Default::default() })
            .map_err(persistence_err2)?;
        if matches!(outcome, MarkOutcome::Conflict) {
            return Err(KilnError::new(ErrorKind::InvalidState, "job changed concurrently, retry cancellation"));
        }

        if let Some(printer_id) = &printer {
            let entry = self.printers.lock().expect("printers lock poisoned").get(printer_id).cloned();
            if let Some(entry) = entry {
                *entry.assigned_job.lock().expect("assigned_job lock poisoned") = None;
                if was_running {
                    let _ = entry.adapter.cancel_print();
                }
            }
        }

        self.publish_event(EventKind::JobCancelled, printer, Some(job_id.to_string()), serde_json::json!({}));
        Ok(())
    }

    /// Candidate printers eligible for dispatch: idle, freshly observed,
    /// and not already claimed this cycle.
    fn idle_candidates(&self) -> Vec<(PrinterId, Arc<PrinterEntry>)> {
        let now = self.clock.now();
        let printers = self.printers.lock().expect("printers lock poisoned");
        printers
            .iter()
            .filter(|(_, entry)| {
                let (status, seen_at) = *entry.last_status.lock().expect("last_status lock poisoned");
                let fresh = now.signed_duration_since(seen_at).to_std().unwrap_or(Duration::MAX) <= self.config.candidate_freshness;
                let unclaimed = entry.assigned_job.lock().expect("assigned_job lock poisoned").is_none();
                status == PrinterStatus::Idle && fresh && unclaimed
            })
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect()
    }

    /// History-aware routing (spec §4.6 step 2-4), restricted to
    /// `candidates`.
    fn route(&self, job: &Job, candidates: &[PrinterId]) -> anyhow::Result<Option<PrinterId>> {
        let eligible: Vec<&PrinterId> = candidates
            .iter()
            .filter(|id| match job.material {
                Some(material) => self.materials.as_ref().map(|t| t.is_loaded(id, material)).unwrap_or(true),
                None => true,
            })
            .collect();

        let mut best: Option<(f64, &PrinterId)> = None;
        for id in eligible {
            let stats = self.store.routing_stats(id, Some(&job.file_hash), job.material)?;
            let score = routing_score(stats, self.config.routing_alpha);
            best = match best {
                Some((best_score, best_id)) => {
                    match score.partial_cmp(&best_score).unwrap_or(CmpOrdering::Equal) {
                        CmpOrdering::Greater => Some((score, id)),
                        CmpOrdering::Equal if id < best_id => Some((score, id)),
                        _ => Some((best_score, best_id)),
                    }
                }
                None => Some((score, id)),
            };
        }
        Ok(best.map(|(_, id)| id.clone()))
    }

    /// One dispatch cycle: matches idle printers to eligible queued (or
    /// due-for-retry) jobs and drives each match through preflight and
    /// `start_print`.
    pub fn dispatch_once(&self) -> anyhow::Result<()> {
        let mut candidates = self.idle_candidates();
        if candidates.is_empty() {
            return Ok(());
        }

        let now = self.clock.now();
        let mut jobs = self.store.read_jobs(JobFilter::all())?;
        jobs.retain(|j| {
            j.state == JobState::Queued
                || (j.state == JobState::FailedRetryable && j.retry_not_before.map(|t| t <= now).unwrap_or(true))
        });
        queue_order(&mut jobs);

        for job in jobs {
            if candidates.is_empty() {
                break;
            }
            let candidate_ids: Vec<PrinterId> = candidates.iter().map(|(id, _)| id.clone()).collect();
            let target = match &job.target_printer {
                Some(id) => candidates.iter().find(|(cid, _)| cid == id).map(|(id, _)| id.clone()),
                None => self.route(&job, &candidate_ids)?,
            };
            let Some(printer_id) = target else { continue };
            let idx = candidates.iter().position(|(id, _)| *id == printer_id).expect("routed candidate must be present");
            let (printer_id, entry) = candidates.remove(idx);

            *entry.assigned_job.lock().expect("assigned_job lock poisoned") = Some(job.id.clone());
            self.dispatch_job(job, printer_id, entry);
        }
        Ok(())
    }

    fn dispatch_job(&self, job: Job, printer_id: PrinterId, entry: Arc<PrinterEntry>) {
        let release = || *entry.assigned_job.lock().expect("assigned_job lock poisoned") = None;

        let generation = match self.store.mark_job(
            &job.id,
            job.generation,
            JobTransition { new_state: JobState::Dispatched, assigned_printer: Some(printer_id.clone()), ..Default::default() },
        ) {
            Ok(MarkOutcome::Applied { new_generation }) => new_generation,
            Ok(MarkOutcome::Conflict) | Err(_) => {
                release();
                return;
            }
        };
        self.publish_event(EventKind::JobDispatched, Some(printer_id.clone()), Some(job.id.clone()), serde_json::json!({}));

        if let Err(e) = kiln_preflight::preflight(entry.adapter.as_ref(), &job.filename, TemperatureTargets::default(), job.material, &entry.profile) {
            self.fail_job(&job, generation, &e, false);
            release();
            return;
        }

        let token = kiln_types::CancellationToken::new();
        match entry.adapter.start_print(&job.filename, &token) {
            Ok(()) => {
                let _ = self.store.mark_job(
                    &job.id,
                    generation,
                    JobTransition { new_state: JobState::Running, assigned_printer: Some(printer_id.clone()), ..Default::default() },
                );
                self.publish_event(EventKind::PrintStarted, Some(printer_id), Some(job.id.clone()), serde_json::json!({}));
            }
            Err(e) => {
                let retryable = e.kind.is_retryable();
                self.fail_job(&job, generation, &e, retryable);
                release();
            }
        }
    }

    /// Transitions a dispatched-but-failed job to `FAILED_RETRYABLE`
    /// (re-queued with `retry_not_before` set) or terminal `FAILED`,
    /// per spec §4.6's retry table.
    fn fail_job(&self, job: &Job, generation: u64, err: &KilnError, retryable_hint: bool) {
        let now = self.clock.now();
        let retryable = retryable_hint && job.retries_remaining > 0;
        if retryable {
            let backoff = kiln_retry::scheduler_backoff(self.config.retry_base, self.config.max_retries, job.retries_remaining);
            let retry_not_before = now + chrono::Duration::from_std(backoff).unwrap_or_default();
            let _ = self.store.mark_job(
                &job.id,
                generation,
                JobTransition {
                    new_state: JobState::FailedRetryable,
                    assigned_printer: None,
                    retry_not_before: Some(retry_not_before),
                    retries_remaining: Some(job.retries_remaining - 1),
                },
            );
        } else {
            let _ = self.store.mark_job(&job.id, generation, JobTransition { new_state: JobState::Failed, ..Default::default() });
            let duration = (now - job.submitted_at).num_seconds().max(0) as u64;
            if let Some(printer_id) = &job.assigned_printer {
                let _ = self.store.record_outcome(JobOutcome {
                    job_id: job.id.clone(),
                    printer_id: printer_id.clone(),
                    result: OutcomeResult::Failed,
                    quality_grade: None,
                    failure_mode: Some(err.kind.to_string_lossy()),
                    duration_seconds: duration,
                    file_hash: job.file_hash.clone(),
                    material: job.material,
                    recorded_at: now,
                    settings: Default::default(),
                });
            }
        }
        self.publish_event(
            EventKind::JobFailed,
            job.assigned_printer.clone(),
            Some(job.id.clone()),
            serde_json::json!({"retryable": retryable, "error": err.message}),
        );
    }

    /// One status-poll tick for a single registered printer. Advances
    /// its assigned job's state on completion, error, or sustained
    /// offline, per spec §4.6 step 5.
    pub fn poll_once(&self, printer_id: &PrinterId) {
        let entry = { self.printers.lock().expect("printers lock poisoned").get(printer_id).cloned() };
        let Some(entry) = entry else { return };

        let state = entry.adapter.get_status();
        let now = self.clock.now();
        for warning in entry.adapter.drain_unmapped_warnings() {
            self.publish_event(EventKind::AdapterUnmappedState, Some(printer_id.clone()), None, serde_json::json!({"raw": warning}));
        }
        *entry.last_status.lock().expect("last_status lock poisoned") = (state.status, now);

        if state.status != PrinterStatus::Offline {
            *entry.offline_since.lock().expect("offline_since lock poisoned") = None;
        }

        let job_id = entry.assigned_job.lock().expect("assigned_job lock poisoned").clone();
        let Some(job_id) = job_id else { return };
        let Ok(Some(job)) = self.store.get_job(&job_id) else { return };
        if job.state != JobState::Running {
            return;
        }

        match state.status {
            PrinterStatus::Idle if state.job_progress.unwrap_or(0.0) >= 0.99 => {
                self.complete_job(&job, printer_id.clone());
                *entry.assigned_job.lock().expect("assigned_job lock poisoned") = None;
            }
            PrinterStatus::Error => {
                self.handle_terminal_error(&job, printer_id.clone());
                *entry.assigned_job.lock().expect("assigned_job lock poisoned") = None;
            }
            PrinterStatus::Offline => {
                let mut since = entry.offline_since.lock().expect("offline_since lock poisoned");
                let first_seen = *since.get_or_insert(now);
                if now.signed_duration_since(first_seen).to_std().unwrap_or_default() >= self.config.offline_grace {
                    drop(since);
                    self.handle_terminal_error(&job, printer_id.clone());
                    *entry.assigned_job.lock().expect("assigned_job lock poisoned") = None;
                    *entry.offline_since.lock().expect("offline_since lock poisoned") = None;
                }
            }
            _ => {}
        }
    }

    fn complete_job(&self, job: &Job, printer_id: PrinterId) {
        let now = self.clock.now();
        let _ = self.store.mark_job(
            &job.id,
            job.generation,
            JobTransition { new_state: JobState::Completed, assigned_printer: Some(printer_id.clone()), ..Default::default() },
        );
        let duration = (now - job.submitted_at).num_seconds().max(0) as u64;
        let _ = self.store.record_outcome(JobOutcome {
            job_id: job.id.clone(),
            printer_id: printer_id.clone(),
            result: OutcomeResult::Success,
            quality_grade: None,
            failure_mode: None,
            duration_seconds: duration,
            file_hash: job.file_hash.clone(),
            material: job.material,
            recorded_at: now,
            settings: Default::default(),
        });
        self.publish_event(EventKind::JobCompleted, Some(printer_id), Some(job.id.clone()), serde_json::json!({}));
    }

    fn handle_terminal_error(&self, job: &Job, printer_id: PrinterId) {
        let err = KilnError::new(ErrorKind::Transport, "printer reported an error or went offline mid-print");
        let retryable = job.retries_remaining > 0;
        let mut job = job.clone();
        job.assigned_printer = Some(printer_id);
        self.fail_job(&job, job.generation, &err, retryable);
    }

    pub fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        thread::Builder::new()
            .name("kiln-dispatcher".into())
            .spawn(move || {
                while !this.shutdown.load(AtomicOrdering::SeqCst) {
                    let _ = this.dispatch_once();
                    thread::sleep(this.config.dispatch_interval);
                }
            })
            .expect("failed to spawn dispatcher thread")
    }

    pub fn spawn_status_poller(self: &Arc<Self>, printer_id: PrinterId) -> JoinHandle<()> {
        let this = Arc::clone(self);
        thread::Builder::new()
            .name(format!("kiln-poller-{printer_id}"))
            .spawn(move || {
                while !this.shutdown.load(AtomicOrdering::SeqCst) {
                    this.poll_once(&printer_id);
                    thread::sleep(this.config.status_poll_interval);
                }
            })
            .expect("failed to spawn status poller thread")
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, AtomicOrdering::SeqCst);
    }
}

trait ErrorKindExt {
    fn to_string_lossy(self) -> String;
}

impl ErrorKindExt for ErrorKind {
    fn to_string_lossy(self) -> String {
        format!("{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_adapter::MockAdapter;
    use kiln_events::WebhookDispatch;
    use kiln_types::{AdapterBackend, Event, PrinterCapabilities, PrinterState};

    #[test]
    fn queue_order_sorts_priority_then_time_then_id() {
        let base = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let mut jobs = vec![
            sample_job("b", 1, base),
            sample_job("a", 1, base),
            sample_job("c", 5, base),
            sample_job("d", 1, base + chrono::Duration::seconds(1)),
        ];
        queue_order(&mut jobs);
        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b", "d"]);
    }

    #[test]
    fn routing_score_is_one_half_for_zero_history() {
        let stats = RoutingStats::default();
        assert!((routing_score(stats, 1.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn routing_score_favors_more_successes() {
        let good = RoutingStats { successes: 9, failures: 1, total: 10 };
        let bad = RoutingStats { successes: 1, failures: 9, total: 10 };
        assert!(routing_score(good, 1.0) > routing_score(bad, 1.0));
    }

    fn sample_job(id: &str, priority: i64, submitted_at: DateTime<Utc>) -> Job {
        Job {
            id: id.to_string(),
            filename: "a.gcode".into(),
            target_printer: None,
            priority,
            material: None,
            file_hash: "deadbeef".into(),
            submitted_at,
            state: JobState::Queued,
            retries_remaining: 3,
            retry_not_before: None,
            assigned_printer: None,
            outcome: None,
            generation: 0,
        }
    }

    struct NullWebhook;
    impl WebhookDispatch for NullWebhook {
        fn dispatch(&self, _event: &Event) {}
    }

    struct FixedClock(DateTime<Utc>);
    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn test_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("kiln.db");
        let store = Store::open(db_path, vec![0u8; 32], None).unwrap();
        (store, dir)
    }

    fn test_scheduler(store: Store, now: DateTime<Utc>) -> Scheduler {
        let bus = Arc::new(EventBus::new(Arc::new(store.clone()), Arc::new(NullWebhook)));
        Scheduler::new(store, bus, Arc::new(FixedClock(now)), None, SchedulerConfig::default())
    }

    fn printer_capabilities() -> PrinterCapabilities {
        PrinterCapabilities { can_set_temp: true, can_send_gcode: true, can_snapshot: false, can_update_firmware: false, device_type: "mock".into() }
    }

    #[test]
    fn dispatch_once_starts_a_queued_job_on_an_idle_printer() {
        let (store, _dir) = test_store();
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let scheduler = test_scheduler(store, now);

        let adapter = Arc::new(MockAdapter::new(printer_capabilities(), PrinterState { status: PrinterStatus::Idle, ..PrinterState::offline() }));
        adapter.seed_file("a.gcode");
        let printer_id = PrinterId::new("press-1", AdapterBackend::OctoPrintHttp);
        scheduler.register_printer(printer_id.clone(), adapter.clone(), SafetyProfile::conservative_default("press-1"));
        scheduler.poll_once(&printer_id);

        let job_id = scheduler.submit_job("a.gcode", None, 0, None, "hash-a").unwrap();
        scheduler.dispatch_once().unwrap();

        let job = scheduler.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(adapter.start_print_calls(), vec!["a.gcode".to_string()]);
    }

    #[test]
    fn dispatch_once_fails_job_when_preflight_file_is_missing() {
        let (store, _dir) = test_store();
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let scheduler = test_scheduler(store, now);

        let adapter = Arc::new(MockAdapter::new(printer_capabilities(), PrinterState { status: PrinterStatus::Idle, ..PrinterState::offline() }));
        let printer_id = PrinterId::new("press-1", AdapterBackend::OctoPrintHttp);
        scheduler.register_printer(printer_id.clone(), adapter.clone(), SafetyProfile::conservative_default("press-1"));
        scheduler.poll_once(&printer_id);

        let job_id = scheduler.submit_job("missing.gcode", None, 0, None, "hash-b").unwrap();
        scheduler.dispatch_once().unwrap();

        let job = scheduler.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(adapter.start_print_calls().is_empty());
    }

    #[test]
    fn cancel_job_is_idempotent_on_terminal_jobs() {
        let (store, _dir) = test_store();
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let scheduler = test_scheduler(store, now);
        let job_id = scheduler.submit_job("a.gcode", None, 0, None, "hash-c").unwrap();
        scheduler.cancel_job(&job_id).unwrap();
        scheduler.cancel_job(&job_id).unwrap();
        let job = scheduler.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Cancelled);
    }

    #[test]
    fn poll_once_completes_a_running_job_at_full_progress() {
        let (store, _dir) = test_store();
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let scheduler = test_scheduler(store, now);

        let adapter = Arc::new(MockAdapter::new(printer_capabilities(), PrinterState { status: PrinterStatus::Idle, ..PrinterState::offline() }));
        adapter.seed_file("a.gcode");
        let printer_id = PrinterId::new("press-1", AdapterBackend::OctoPrintHttp);
        scheduler.register_printer(printer_id.clone(), adapter.clone(), SafetyProfile::conservative_default("press-1"));
        scheduler.poll_once(&printer_id);

        let job_id = scheduler.submit_job("a.gcode", None, 0, None, "hash-d").unwrap();
        scheduler.dispatch_once().unwrap();

        let mut finished = PrinterState { status: PrinterStatus::Idle, job_progress: Some(1.0), ..PrinterState::offline() };
        finished.file_name = Some("a.gcode".into());
        adapter.set_state(finished);
        scheduler.poll_once(&printer_id);

        let job = scheduler.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
    }
}
