//! SQLite-backed transactional store (spec §4.3): jobs, events, outcomes,
//! audit log, and webhook subscriptions.
//!
//! All writes funnel through a single writer thread that owns the one
//! `rusqlite::Connection` opened in read-write mode and drains an
//! `mpsc::Receiver` of write closures — the literal mechanism spec §9
//! prescribes for honoring SQLite's single-writer model. Reads open their
//! own connection (WAL mode keeps them lock-free against the writer) and
//! never touch the writer channel.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use kiln_audit::{AuditSealer, GENESIS_HMAC};
use kiln_types::{
    AdapterBackend, AuditRecord, Event, EventKind, Job, JobOutcome, JobState, Material,
    OutcomeResult, PrinterId, WebhookSubscription,
};
use rusqlite::{Connection, OptionalExtension, params};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("safety violation: {0}")]
    SafetyViolation(String),
    #[error("optimistic concurrency conflict on job {0}")]
    Conflict(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(e: rusqlite::Error) -> Self {
        PersistenceError::Other(e.into())
    }
}

type WriteFn = Box<dyn FnOnce(&mut Connection) -> anyhow::Result<Box<dyn std::any::Any + Send>> + Send>;

struct WriteRequest {
    run: WriteFn,
    reply: Sender<anyhow::Result<Box<dyn std::any::Any + Send>>>,
}

/// The persistence handle. Cheap to clone; every clone shares the same
/// writer thread and channel.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    db_path: PathBuf,
    writer_tx: Mutex<Option<Sender<WriteRequest>>>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    audit_sealer: AuditSealer,
    webhook_passphrase: Option<String>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    filename TEXT NOT NULL,
    target_printer_name TEXT,
    target_printer_backend TEXT,
    priority INTEGER NOT NULL,
    material TEXT,
    file_hash TEXT NOT NULL,
    submitted_at TEXT NOT NULL,
    state TEXT NOT NULL,
    retries_remaining INTEGER NOT NULL,
    retry_not_before TEXT,
    assigned_printer_name TEXT,
    assigned_printer_backend TEXT,
    outcome_json TEXT,
    generation INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    printer_name TEXT,
    printer_backend TEXT,
    job_id TEXT,
    payload_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS outcomes (
    job_id TEXT NOT NULL,
    printer_name TEXT NOT NULL,
    printer_backend TEXT NOT NULL,
    result TEXT NOT NULL,
    quality_grade TEXT,
    failure_mode TEXT,
    duration_seconds INTEGER NOT NULL,
    file_hash TEXT NOT NULL,
    material TEXT,
    recorded_at TEXT NOT NULL,
    settings_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS audit_log (
    seq INTEGER PRIMARY KEY,
    timestamp TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    parameters_digest TEXT NOT NULL,
    result_kind TEXT NOT NULL,
    hmac TEXT NOT NULL,
    prev_hmac TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS webhook_subscriptions (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    event_kinds_json TEXT NOT NULL,
    secret_encrypted TEXT,
    created_at TEXT NOT NULL
);
";

/// Outcome-safety ceilings (spec §4.3): rows describing settings beyond
/// these are rejected with `SAFETY_VIOLATION` and never written.
const MAX_SAFE_HOTEND_C: f64 = 320.0;
const MAX_SAFE_BED_C: f64 = 140.0;
const MAX_SAFE_SPEED_MM_S: f64 = 500.0;

impl Store {
    /// Opens (creating if absent) the SQLite file at `db_path`, runs the
    /// schema, and starts the single writer thread. `audit_key` must be
    /// at least 32 bytes; `webhook_passphrase` is used to encrypt webhook
    /// subscription secrets at rest when present.
    pub fn open(
        db_path: impl AsRef<Path>,
        audit_key: impl Into<Vec<u8>>,
        webhook_passphrase: Option<String>,
    ) -> anyhow::Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let mut conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;

        let audit_sealer =
            AuditSealer::new(audit_key).map_err(|e| anyhow::anyhow!("{e}"))?;

        let (tx, rx) = mpsc::channel::<WriteRequest>();
        let handle = thread::Builder::new()
            .name("kiln-persistence-writer".into())
            .spawn(move || {
                while let Ok(req) = rx.recv() {
                    let result = (req.run)(&mut conn);
                    let _ = req.reply.send(result);
                }
            })?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                db_path,
                writer_tx: Mutex::new(Some(tx)),
                writer_handle: Mutex::new(Some(handle)),
                audit_sealer,
                webhook_passphrase,
            }),
        })
    }

    /// Opens a fresh read-only-by-convention connection for a query. Each
    /// reader gets its own connection so reads never contend with the
    /// writer thread or with each other.
    fn reader(&self) -> anyhow::Result<Connection> {
        let conn = Connection::open(&self.inner.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(conn)
    }

    fn run_write<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::channel();
        let wrapped: WriteFn = Box::new(move |conn| {
            f(conn).map(|v| Box::new(v) as Box<dyn std::any::Any + Send>)
        });
        let tx = {
            let guard = self.inner.writer_tx.lock().expect("writer_tx lock poisoned");
            guard.clone_ref()
        };
        tx.send(WriteRequest { run: wrapped, reply: reply_tx })
            .map_err(|_| anyhow::anyhow!("persistence writer thread is not running"))?;
        let boxed = reply_rx
            .recv()
            .map_err(|_| anyhow::anyhow!("persistence writer thread dropped the reply channel"))??;
        Ok(*boxed.downcast::<T>().expect("write reply type mismatch"))
    }

    /// Shuts down the writer thread cleanly. Safe to call multiple times.
    pub fn shutdown(&self) {
        self.inner.writer_tx.lock().expect("writer_tx lock poisoned").take();
        if let Some(handle) = self.inner.writer_handle.lock().expect("writer_handle lock poisoned").take() {
            let _ = handle.join();
        }
    }

    // ---- jobs -----------------------------------------------------------

    pub fn enqueue_job(&self, job: Job) -> Result<(), PersistenceError> {
        self.run_write(move |conn| {
            conn.execute(
                "INSERT INTO jobs (id, filename, target_printer_name, target_printer_backend,
                    priority, material, file_hash, submitted_at, state, retries_remaining,
                    retry_not_before, assigned_printer_name, assigned_printer_backend,
                    outcome_json, generation)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                params![
                    job.id,
                    job.filename,
                    job.target_printer.as_ref().map(|p| p.name.clone()),
                    job.target_printer.as_ref().map(backend_str),
                    job.priority,
                    job.material.map(material_str),
                    job.file_hash,
                    job.submitted_at.to_rfc3339(),
                    state_str(job.state),
                    job.retries_remaining,
                    job.retry_not_before.map(|t| t.to_rfc3339()),
                    job.assigned_printer.as_ref().map(|p| p.name.clone()),
                    job.assigned_printer.as_ref().map(backend_str),
                    job.outcome.as_ref().map(|o| serde_json::to_string(o)).transpose()?,
                    job.generation as i64,
                ],
            )?;
            Ok(())
        })
        .map_err(PersistenceError::from)
    }

    pub fn get_job(&self, id: &str) -> anyhow::Result<Option<Job>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
        stmt.query_row(params![id], row_to_job).optional().map_err(Into::into)
    }

    /// Lists jobs, optionally filtered by state and/or assigned printer.
    pub fn read_jobs(&self, filter: JobFilter) -> anyhow::Result<Vec<Job>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT * FROM jobs")?;
        let rows = stmt.query_map([], row_to_job)?;
        let mut out = Vec::new();
        for row in rows {
            let job = row?;
            if let Some(state) = filter.state {
                if job.state != state {
                    continue;
                }
            }
            if let Some(printer) = &filter.assigned_printer {
                if job.assigned_printer.as_ref() != Some(printer) {
                    continue;
                }
            }
            out.push(job);
        }
        Ok(out)
    }

    /// Optimistically transitions a job's state, compare-and-swapping
    /// `generation`. A mismatch returns `Conflict` without applying any
    /// change — the caller (scheduler) lost the dispatch race.
    pub fn mark_job(
        &self,
        id: &str,
        expected_generation: u64,
        transition: JobTransition,
    ) -> Result<MarkOutcome, PersistenceError> {
        let id = id.to_string();
        self.run_write(move |conn| {
            let tx = conn.transaction()?;
            let current_generation: Option<i64> = tx
                .query_row("SELECT generation FROM jobs WHERE id = ?1", params![id], |r| r.get(0))
                .optional()?;
            let Some(current_generation) = current_generation else {
                return Ok(MarkOutcome::Conflict);
            };
            if current_generation as u64 != expected_generation {
                return Ok(MarkOutcome::Conflict);
            }
            let new_generation = current_generation + 1;
            tx.execute(
                "UPDATE jobs SET state = ?1, retries_remaining = COALESCE(?2, retries_remaining),
                    retry_not_before = ?3, assigned_printer_name = ?4, assigned_printer_backend = ?5,
                    generation = ?6
                 WHERE id = ?7",
                params![
                    state_str(transition.new_state),
                    transition.retries_remaining.map(|r| r as i64),
                    transition.retry_not_before.map(|t| t.to_rfc3339()),
                    transition.assigned_printer.as_ref().map(|p| p.name.clone()),
                    transition.assigned_printer.as_ref().map(backend_str),
                    new_generation,
                    id,
                ],
            )?;
            tx.commit()?;
            Ok(MarkOutcome::Applied { new_generation: new_generation as u64 })
        })
        .map_err(PersistenceError::from)
    }

    // ---- events -----------------------------------------------------------

    pub fn append_event(
        &self,
        kind: EventKind,
        timestamp: DateTime<Utc>,
        printer_id: Option<PrinterId>,
        job_id: Option<String>,
        payload: serde_json::Value,
    ) -> anyhow::Result<u64> {
        self.run_write(move |conn| {
            conn.execute(
                "INSERT INTO events (kind, timestamp, printer_name, printer_backend, job_id, payload_json)
                 VALUES (?1,?2,?3,?4,?5,?6)",
                params![
                    serde_json::to_string(&kind)?,
                    timestamp.to_rfc3339(),
                    printer_id.as_ref().map(|p| p.name.clone()),
                    printer_id.as_ref().map(backend_str),
                    job_id,
                    payload.to_string(),
                ],
            )?;
            Ok(conn.last_insert_rowid() as u64)
        })
    }

    pub fn recent_events(&self, limit: usize) -> anyhow::Result<Vec<Event>> {
        let conn = self.reader()?;
        let mut stmt =
            conn.prepare("SELECT * FROM events ORDER BY seq DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], row_to_event)?;
        let mut out: Vec<Event> = rows.collect::<Result<_, _>>()?;
        out.reverse();
        Ok(out)
    }

    // ---- outcomes -----------------------------------------------------------

    /// Writes an outcome row after validating `settings` against the
    /// absolute safety ceilings; fails with `SafetyViolation` (row not
    /// written) if any exceeds its ceiling.
    pub fn record_outcome(&self, outcome: JobOutcome) -> Result<(), PersistenceError> {
        for (key, value) in &outcome.settings {
            let key_lower = key.to_ascii_lowercase();
            if key_lower.contains("hotend") && *value > MAX_SAFE_HOTEND_C {
                return Err(PersistenceError::SafetyViolation(format!(
                    "{key}={value} exceeds absolute hotend ceiling {MAX_SAFE_HOTEND_C}"
                )));
            }
            if key_lower.contains("bed") && *value > MAX_SAFE_BED_C {
                return Err(PersistenceError::SafetyViolation(format!(
                    "{key}={value} exceeds absolute bed ceiling {MAX_SAFE_BED_C}"
                )));
            }
            if (key_lower.contains("speed") || key_lower.contains("feedrate"))
                && *value > MAX_SAFE_SPEED_MM_S
            {
                return Err(PersistenceError::SafetyViolation(format!(
                    "{key}={value} exceeds absolute speed ceiling {MAX_SAFE_SPEED_MM_S}"
                )));
            }
        }

        self.run_write(move |conn| {
            conn.execute(
                "INSERT INTO outcomes (job_id, printer_name, printer_backend, result, quality_grade,
                    failure_mode, duration_seconds, file_hash, material, recorded_at, settings_json)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                params![
                    outcome.job_id,
                    outcome.printer_id.name,
                    backend_str(&outcome.printer_id),
                    outcome_result_str(outcome.result),
                    outcome.quality_grade,
                    outcome.failure_mode,
                    outcome.duration_seconds as i64,
                    outcome.file_hash,
                    outcome.material.map(material_str),
                    outcome.recorded_at.to_rfc3339(),
                    serde_json::to_string(&outcome.settings)?,
                ],
            )?;
            Ok(())
        })
        .map_err(PersistenceError::from)
    }

    /// Aggregates success/failure counts for `printer_id`, optionally
    /// narrowed to a specific `file_hash` and/or `material`, for the
    /// router's Laplace-smoothed scoring.
    pub fn routing_stats(
        &self,
        printer_id: &PrinterId,
        file_hash: Option<&str>,
        material: Option<Material>,
    ) -> anyhow::Result<RoutingStats> {
        let conn = self.reader()?;
        let mut sql = String::from(
            "SELECT result, COUNT(*) FROM outcomes WHERE printer_name = ?1 AND printer_backend = ?2",
        );
        let mut idx = 3;
        let mut owned_params: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(printer_id.name.clone()), Box::new(backend_str(printer_id))];
        if let Some(hash) = file_hash {
            sql.push_str(&format!(" AND file_hash = ?{idx}"));
            owned_params.push(Box::new(hash.to_string()));
            idx += 1;
        }
        if let Some(m) = material {
            sql.push_str(&format!(" AND material = ?{idx}"));
            owned_params.push(Box::new(material_str(m)));
        }
        sql.push_str(" GROUP BY result");

        let refs: Vec<&dyn rusqlite::ToSql> = owned_params.iter().map(|b| b.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let mut stats = RoutingStats::default();
        let rows = stmt.query_map(refs.as_slice(), |r| {
            let result: String = r.get(0)?;
            let count: i64 = r.get(1)?;
            Ok((result, count))
        })?;
        for row in rows {
            let (result, count) = row?;
            match result.as_str() {
                "SUCCESS" => stats.successes += count as u64,
                _ => stats.failures += count as u64,
            }
            stats.total += count as u64;
        }
        Ok(stats)
    }

    // ---- audit -----------------------------------------------------------

    /// Digests `params` the same way [`Store::append_audit`]'s caller
    /// should before sealing a record, so callers never have to reach into
    /// the sealer directly.
    pub fn digest_audit_params(&self, params: &serde_json::Value) -> String {
        self.inner.audit_sealer.digest_params(params)
    }

    /// Convenience wrapper: digests `params` and seals one audit record in
    /// a single call.
    pub fn record_action(
        &self,
        actor_id: String,
        tool_name: String,
        params: &serde_json::Value,
        result_kind: String,
    ) -> anyhow::Result<AuditRecord> {
        let digest = self.digest_audit_params(params);
        self.append_audit(actor_id, tool_name, digest, result_kind)
    }

    pub fn append_audit(
        &self,
        actor_id: String,
        tool_name: String,
        parameters_digest: String,
        result_kind: String,
    ) -> anyhow::Result<AuditRecord> {
        let sealer = self.inner.audit_sealer.clone();
        self.run_write(move |conn| {
            let tx = conn.transaction()?;
            let (prev_seq, prev_hmac): (Option<i64>, Option<String>) = tx
                .query_row(
                    "SELECT seq, hmac FROM audit_log ORDER BY seq DESC LIMIT 1",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?
                .unwrap_or((None, None));
            let seq = prev_seq.map(|s| s as u64 + 1).unwrap_or(0);
            let prev_hmac = prev_hmac.unwrap_or_else(|| GENESIS_HMAC.to_string());
            let record = sealer.seal(
                seq,
                &prev_hmac,
                Utc::now(),
                &actor_id,
                &tool_name,
                &parameters_digest,
                &result_kind,
            );
            tx.execute(
                "INSERT INTO audit_log (seq, timestamp, actor_id, tool_name, parameters_digest,
                    result_kind, hmac, prev_hmac) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                params![
                    record.seq,
                    record.timestamp.to_rfc3339(),
                    record.actor_id,
                    record.tool_name,
                    record.parameters_digest,
                    record.result_kind,
                    record.hmac,
                    record.prev_hmac,
                ],
            )?;
            tx.commit()?;
            Ok(record)
        })
    }

    pub fn verify_audit(&self) -> anyhow::Result<kiln_audit::VerifyResult> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT * FROM audit_log ORDER BY seq ASC")?;
        let rows = stmt.query_map([], row_to_audit_record)?;
        let records: Vec<AuditRecord> = rows.collect::<Result<_, _>>()?;
        Ok(kiln_audit::verify_chain(&self.inner.audit_sealer, &records))
    }

    // ---- webhook subscriptions --------------------------------------------

    pub fn register_webhook(&self, subscription: WebhookSubscription) -> anyhow::Result<()> {
        let secret_encrypted = match (&subscription.secret, &self.inner.webhook_passphrase) {
            (Some(secret), Some(passphrase)) => {
                Some(kiln_encrypt::encrypt(secret, passphrase)?)
            }
            (Some(secret), None) => Some(secret.clone()),
            (None, _) => None,
        };
        self.run_write(move |conn| {
            conn.execute(
                "INSERT INTO webhook_subscriptions (id, url, event_kinds_json, secret_encrypted, created_at)
                 VALUES (?1,?2,?3,?4,?5)",
                params![
                    subscription.id,
                    subscription.url,
                    serde_json::to_string(&subscription.event_kinds)?,
                    secret_encrypted,
                    subscription.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn list_webhooks(&self) -> anyhow::Result<Vec<WebhookSubscription>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT * FROM webhook_subscriptions")?;
        let passphrase = self.inner.webhook_passphrase.clone();
        let rows = stmt.query_map([], move |row| {
            let id: String = row.get("id")?;
            let url: String = row.get("url")?;
            let kinds_json: String = row.get("event_kinds_json")?;
            let secret_encrypted: Option<String> = row.get("secret_encrypted")?;
            let created_at: String = row.get("created_at")?;
            Ok((id, url, kinds_json, secret_encrypted, created_at))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, url, kinds_json, secret_encrypted, created_at) = row?;
            let secret = match (secret_encrypted, &passphrase) {
                (Some(enc), Some(pw)) => Some(kiln_encrypt::decrypt(&enc, pw)?),
                (Some(enc), None) => Some(enc),
                (None, _) => None,
            };
            out.push(WebhookSubscription {
                id,
                url,
                event_kinds: serde_json::from_str(&kinds_json)?,
                secret,
                created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
            });
        }
        Ok(out)
    }

    pub fn delete_webhook(&self, id: &str) -> anyhow::Result<()> {
        let id = id.to_string();
        self.run_write(move |conn| {
            conn.execute("DELETE FROM webhook_subscriptions WHERE id = ?1", params![id])?;
            Ok(())
        })
    }
}

impl kiln_events::EventPersister for Store {
    fn append(&self, draft: &kiln_events::EventDraft) -> anyhow::Result<u64> {
        self.append_event(
            draft.kind.clone(),
            draft.timestamp,
            draft.printer_id.clone(),
            draft.job_id.clone(),
            draft.payload.clone(),
        )
    }
}

/// Small helper: `Option<Sender<_>>` clone-or-error, used to give
/// `run_write` a live sender without holding the mutex across the send.
trait CloneRefOrPanic {
    fn clone_ref(&self) -> Sender<WriteRequest>;
}

impl CloneRefOrPanic for Option<Sender<WriteRequest>> {
    fn clone_ref(&self) -> Sender<WriteRequest> {
        self.as_ref().expect("persistence writer already shut down").clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub assigned_printer: Option<PrinterId>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobTransition {
    pub new_state: JobState,
    pub assigned_printer: Option<PrinterId>,
    pub retry_not_before: Option<DateTime<Utc>>,
    pub retries_remaining: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Applied { new_generation: u64 },
    Conflict,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingStats {
    pub successes: u64,
    pub failures: u64,
    pub total: u64,
}

fn backend_str(id: &PrinterId) -> String {
    match id.backend {
        AdapterBackend::OctoPrintHttp => "octoprint_http",
        AdapterBackend::KlipperHttp => "klipper_http",
        AdapterBackend::BambuMqtt => "bambu_mqtt",
        AdapterBackend::ElegooSdcp => "elegoo_sdcp",
    }
    .to_string()
}

fn backend_from_str(s: &str) -> anyhow::Result<AdapterBackend> {
    Ok(match s {
        "octoprint_http" => AdapterBackend::OctoPrintHttp,
        "klipper_http" => AdapterBackend::KlipperHttp,
        "bambu_mqtt" => AdapterBackend::BambuMqtt,
        "elegoo_sdcp" => AdapterBackend::ElegooSdcp,
        other => anyhow::bail!("unknown adapter backend {other}"),
    })
}

fn state_str(state: JobState) -> &'static str {
    match state {
        JobState::Submitted => "submitted",
        JobState::Queued => "queued",
        JobState::Dispatched => "dispatched",
        JobState::Running => "running",
        JobState::Completed => "completed",
        JobState::Failed => "failed",
        JobState::FailedRetryable => "failed_retryable",
        JobState::Cancelled => "cancelled",
    }
}

fn state_from_str(s: &str) -> anyhow::Result<JobState> {
    Ok(match s {
        "submitted" => JobState::Submitted,
        "queued" => JobState::Queued,
        "dispatched" => JobState::Dispatched,
        "running" => JobState::Running,
        "completed" => JobState::Completed,
        "failed" => JobState::Failed,
        "failed_retryable" => JobState::FailedRetryable,
        "cancelled" => JobState::Cancelled,
        other => anyhow::bail!("unknown job state {other}"),
    })
}

fn material_str(m: Material) -> &'static str {
    match m {
        Material::Pla => "PLA",
        Material::Petg => "PETG",
        Material::Abs => "ABS",
        Material::Tpu => "TPU",
        Material::Asa => "ASA",
        Material::Nylon => "NYLON",
        Material::Pc => "PC",
    }
}

fn material_from_str(s: &str) -> anyhow::Result<Material> {
    Ok(match s {
        "PLA" => Material::Pla,
        "PETG" => Material::Petg,
        "ABS" => Material::Abs,
        "TPU" => Material::Tpu,
        "ASA" => Material::Asa,
        "NYLON" => Material::Nylon,
        "PC" => Material::Pc,
        other => anyhow::bail!("unknown material {other}"),
    })
}

fn outcome_result_str(r: OutcomeResult) -> &'static str {
    match r {
        OutcomeResult::Success => "SUCCESS",
        OutcomeResult::Failed => "FAILED",
        OutcomeResult::Cancelled => "CANCELLED",
        OutcomeResult::Partial => "PARTIAL",
    }
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let target_name: Option<String> = row.get("target_printer_name")?;
    let target_backend: Option<String> = row.get("target_printer_backend")?;
    let assigned_name: Option<String> = row.get("assigned_printer_name")?;
    let assigned_backend: Option<String> = row.get("assigned_printer_backend")?;
    let material: Option<String> = row.get("material")?;
    let outcome_json: Option<String> = row.get("outcome_json")?;
    let submitted_at: String = row.get("submitted_at")?;
    let retry_not_before: Option<String> = row.get("retry_not_before")?;
    let state: String = row.get("state")?;

    let to_rusqlite_err = |e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    };

    Ok(Job {
        id: row.get("id")?,
        filename: row.get("filename")?,
        target_printer: match (target_name, target_backend) {
            (Some(n), Some(b)) => {
                Some(PrinterId::new(n, backend_from_str(&b).map_err(to_rusqlite_err)?))
            }
            _ => None,
        },
        priority: row.get("priority")?,
        material: material.map(|m| material_from_str(&m)).transpose().map_err(to_rusqlite_err)?,
        file_hash: row.get("file_hash")?,
        submitted_at: DateTime::parse_from_rfc3339(&submitted_at)
            .map_err(|e| to_rusqlite_err(e.into()))?
            .with_timezone(&Utc),
        state: state_from_str(&state).map_err(to_rusqlite_err)?,
        retries_remaining: row.get("retries_remaining")?,
        retry_not_before: retry_not_before
            .map(|t| DateTime::parse_from_rfc3339(&t).map(|d| d.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| to_rusqlite_err(e.into()))?,
        assigned_printer: match (assigned_name, assigned_backend) {
            (Some(n), Some(b)) => {
                Some(PrinterId::new(n, backend_from_str(&b).map_err(to_rusqlite_err)?))
            }
            _ => None,
        },
        outcome: outcome_json
            .map(|j| serde_json::from_str(&j))
            .transpose()
            .map_err(|e| to_rusqlite_err(e.into()))?,
        generation: {
            let g: i64 = row.get("generation")?;
            g as u64
        },
    })
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    let kind_json: String = row.get("kind")?;
    let timestamp: String = row.get("timestamp")?;
    let printer_name: Option<String> = row.get("printer_name")?;
    let printer_backend: Option<String> = row.get("printer_backend")?;
    let payload_json: String = row.get("payload_json")?;
    let to_rusqlite_err = |e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    };
    Ok(Event {
        id: {
            let s: i64 = row.get("seq")?;
            s as u64
        },
        kind: serde_json::from_str::<EventKind>(&kind_json).map_err(|e| to_rusqlite_err(e.into()))?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| to_rusqlite_err(e.into()))?
            .with_timezone(&Utc),
        printer_id: match (printer_name, printer_backend) {
            (Some(n), Some(b)) => {
                Some(PrinterId::new(n, backend_from_str(&b).map_err(to_rusqlite_err)?))
            }
            _ => None,
        },
        job_id: row.get("job_id")?,
        payload: serde_json::from_str(&payload_json).map_err(|e| to_rusqlite_err(e.into()))?,
    })
}

fn row_to_audit_record(row: &rusqlite::Row) -> rusqlite::Result<AuditRecord> {
    let timestamp: String = row.get("timestamp")?;
    let to_rusqlite_err = |e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    };
    Ok(AuditRecord {
        seq: {
            let s: i64 = row.get("seq")?;
            s as u64
        },
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| to_rusqlite_err(e.into()))?
            .with_timezone(&Utc),
        actor_id: row.get("actor_id")?,
        tool_name: row.get("tool_name")?,
        parameters_digest: row.get("parameters_digest")?,
        result_kind: row.get("result_kind")?,
        hmac: row.get("hmac")?,
        prev_hmac: row.get("prev_hmac")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("kiln.sqlite"), vec![9u8; 32], None).unwrap();
        (dir, store)
    }

    fn sample_job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            filename: "benchy.gcode".to_string(),
            target_printer: None,
            priority: 0,
            material: Some(Material::Pla),
            file_hash: "abc123".to_string(),
            submitted_at: Utc::now(),
            state: JobState::Submitted,
            retries_remaining: 3,
            retry_not_before: None,
            assigned_printer: None,
            outcome: None,
            generation: 0,
        }
    }

    #[test]
    #[serial]
    fn enqueue_and_get_job_roundtrips() {
        let (_dir, store) = open_store();
        store.enqueue_job(sample_job("job-1")).unwrap();
        let job = store.get_job("job-1").unwrap().unwrap();
        assert_eq!(job.filename, "benchy.gcode");
        assert_eq!(job.state, JobState::Submitted);
        assert_eq!(job.generation, 0);
    }

    #[test]
    #[serial]
    fn mark_job_cas_succeeds_on_matching_generation() {
        let (_dir, store) = open_store();
        store.enqueue_job(sample_job("job-1")).unwrap();
        let outcome = store
            .mark_job(
                "job-1",
                0,
                JobTransition { new_state: JobState::Dispatched, ..Default::default() },
            )
            .unwrap();
        assert_eq!(outcome, MarkOutcome::Applied { new_generation: 1 });
        let job = store.get_job("job-1").unwrap().unwrap();
        assert_eq!(job.state, JobState::Dispatched);
    }

    #[test]
    #[serial]
    fn mark_job_cas_conflicts_on_stale_generation() {
        let (_dir, store) = open_store();
        store.enqueue_job(sample_job("job-1")).unwrap();
        store
            .mark_job("job-1", 0, JobTransition { new_state: JobState::Dispatched, ..Default::default() })
            .unwrap();
        // second dispatcher racing with the stale generation 0 loses
        let conflict = store
            .mark_job("job-1", 0, JobTransition { new_state: JobState::Running, ..Default::default() })
            .unwrap();
        assert_eq!(conflict, MarkOutcome::Conflict);
    }

    #[test]
    #[serial]
    fn append_event_assigns_increasing_seq() {
        let (_dir, store) = open_store();
        let s0 = store
            .append_event(EventKind::JobSubmitted, Utc::now(), None, Some("job-1".into()), serde_json::Value::Null)
            .unwrap();
        let s1 = store
            .append_event(EventKind::JobDispatched, Utc::now(), None, Some("job-1".into()), serde_json::Value::Null)
            .unwrap();
        assert!(s1 > s0);
    }

    #[test]
    #[serial]
    fn record_outcome_rejects_unsafe_hotend_setting() {
        let (_dir, store) = open_store();
        let mut settings = std::collections::BTreeMap::new();
        settings.insert("hotend_c".to_string(), 350.0);
        let outcome = JobOutcome {
            job_id: "job-1".into(),
            printer_id: PrinterId::new("p1", AdapterBackend::OctoPrintHttp),
            result: OutcomeResult::Success,
            quality_grade: None,
            failure_mode: None,
            duration_seconds: 100,
            file_hash: "abc".into(),
            material: None,
            recorded_at: Utc::now(),
            settings,
        };
        let err = store.record_outcome(outcome).unwrap_err();
        assert!(matches!(err, PersistenceError::SafetyViolation(_)));
    }

    #[test]
    #[serial]
    fn record_outcome_accepts_safe_settings_and_feeds_routing_stats() {
        let (_dir, store) = open_store();
        let printer = PrinterId::new("p1", AdapterBackend::OctoPrintHttp);
        let outcome = JobOutcome {
            job_id: "job-1".into(),
            printer_id: printer.clone(),
            result: OutcomeResult::Success,
            quality_grade: Some("A".into()),
            failure_mode: None,
            duration_seconds: 100,
            file_hash: "abc".into(),
            material: Some(Material::Pla),
            recorded_at: Utc::now(),
            settings: Default::default(),
        };
        store.record_outcome(outcome).unwrap();
        let stats = store.routing_stats(&printer, Some("abc"), Some(Material::Pla)).unwrap();
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.total, 1);
    }

    #[test]
    #[serial]
    fn audit_chain_verifies_clean() {
        let (_dir, store) = open_store();
        store.append_audit("agent-1".into(), "start_print".into(), "d1".into(), "OK".into()).unwrap();
        store.append_audit("agent-1".into(), "cancel_print".into(), "d2".into(), "OK".into()).unwrap();
        let result = store.verify_audit().unwrap();
        assert!(result.ok);
    }

    #[test]
    #[serial]
    fn webhook_secret_is_encrypted_at_rest_when_passphrase_configured() {
        let dir = tempdir().unwrap();
        let store =
            Store::open(dir.path().join("kiln.sqlite"), vec![1u8; 32], Some("pw".into())).unwrap();
        store
            .register_webhook(WebhookSubscription {
                id: "wh-1".into(),
                url: "https://example.test/hook".into(),
                event_kinds: vec![EventKind::JobCompleted],
                secret: Some("super-secret".into()),
                created_at: Utc::now(),
            })
            .unwrap();
        let conn = Connection::open(dir.path().join("kiln.sqlite")).unwrap();
        let raw: String = conn
            .query_row("SELECT secret_encrypted FROM webhook_subscriptions WHERE id = 'wh-1'", [], |r| r.get(0))
            .unwrap();
        assert_ne!(raw, "super-secret");

        let listed = store.list_webhooks().unwrap();
        assert_eq!(listed[0].secret.as_deref(), Some("super-secret"));
    }
}
