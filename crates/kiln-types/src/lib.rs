//! Shared domain types for the Kiln fleet control plane.
//!
//! This crate defines the normalized data model every other `kiln-*` crate
//! builds on: printer identity and capabilities, the normalized status
//! enum every backend maps into, jobs and their state machine, outcomes,
//! events, audit records, webhook subscriptions, and the `KilnError` kind
//! hierarchy that every public operation returns.
//!
//! Nothing in this crate performs I/O; it is pure data plus the small
//! amount of logic (state-machine predicates, error classification) that
//! belongs next to the types it operates on.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Printer backend family, fixed at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterBackend {
    /// OctoPrint-style HTTP/REST.
    OctoPrintHttp,
    /// Klipper/Moonraker-style HTTP/REST.
    KlipperHttp,
    /// Bambu-style MQTT + FTPS over TLS.
    BambuMqtt,
    /// Elegoo-style WebSocket/SDCP.
    ElegooSdcp,
}

impl fmt::Display for AdapterBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdapterBackend::OctoPrintHttp => "octoprint_http",
            AdapterBackend::KlipperHttp => "klipper_http",
            AdapterBackend::BambuMqtt => "bambu_mqtt",
            AdapterBackend::ElegooSdcp => "elegoo_sdcp",
        };
        f.write_str(s)
    }
}

/// Opaque printer identifier: name plus backend kind. Immutable after
/// registration — nothing in this crate or its callers may mutate either
/// field once a `PrinterId` has been handed out by the registry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrinterId {
    pub name: String,
    pub backend: AdapterBackend,
}

impl PrinterId {
    pub fn new(name: impl Into<String>, backend: AdapterBackend) -> Self {
        Self { name: name.into(), backend }
    }
}

impl fmt::Display for PrinterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.backend)
    }
}

/// Capability record declared by an adapter at construction. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterCapabilities {
    pub can_set_temp: bool,
    pub can_send_gcode: bool,
    pub can_snapshot: bool,
    pub can_update_firmware: bool,
    pub device_type: String,
}

/// Normalized printer status. Every backend state maps to exactly one of
/// these; `Unknown` is reserved for genuinely unmapped backend states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrinterStatus {
    Idle,
    Printing,
    Paused,
    Error,
    Offline,
    Busy,
    Unknown,
}

/// A temperature reading. `None` means unknown — never a `0.0` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct TempReading {
    pub actual: Option<f64>,
    pub target: Option<f64>,
}

impl TempReading {
    pub const fn unknown() -> Self {
        Self { actual: None, target: None }
    }
}

/// Snapshot returned by an adapter status poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterState {
    pub status: PrinterStatus,
    #[serde(default)]
    pub tool_temps: Vec<TempReading>,
    pub bed_temp: TempReading,
    #[serde(default)]
    pub chamber_temp: Option<TempReading>,
    #[serde(default)]
    pub job_progress: Option<f64>,
    #[serde(default)]
    pub elapsed_seconds: Option<u64>,
    #[serde(default)]
    pub remaining_seconds: Option<u64>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl PrinterState {
    /// The state an adapter reports when the printer is unreachable.
    /// `get_status` must return this instead of raising — see `kiln-adapter`.
    pub fn offline() -> Self {
        Self {
            status: PrinterStatus::Offline,
            tool_temps: Vec::new(),
            bed_temp: TempReading::unknown(),
            chamber_temp: None,
            job_progress: None,
            elapsed_seconds: None,
            remaining_seconds: None,
            file_name: None,
            error_message: None,
        }
    }
}

/// Per-printer-model physical limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyProfile {
    pub id: String,
    pub max_hotend_c: f64,
    pub max_bed_c: f64,
    #[serde(default)]
    pub max_chamber_c: Option<f64>,
    pub max_feedrate_mm_min: f64,
    pub max_volumetric_flow_mm3_s: f64,
    #[serde(default)]
    pub build_volume_mm3: Option<f64>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl SafetyProfile {
    /// Conservative default used when a profile id has no bundled entry.
    pub fn conservative_default(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            max_hotend_c: 300.0,
            max_bed_c: 130.0,
            max_chamber_c: None,
            max_feedrate_mm_min: 300.0 * 60.0,
            max_volumetric_flow_mm3_s: 25.0,
            build_volume_mm3: None,
            notes: vec!["conservative default profile; no bundled entry for this id".into()],
        }
    }
}

/// Filament material, used for preflight temperature-range checks and
/// routing eligibility filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Material {
    Pla,
    Petg,
    Abs,
    Tpu,
    Asa,
    Nylon,
    Pc,
}

/// Expected `(hotend_c, bed_c)` ranges per material, from spec §4.7.
pub fn material_temp_ranges(material: Material) -> ((f64, f64), (f64, f64)) {
    match material {
        Material::Pla => ((180.0, 220.0), (40.0, 70.0)),
        Material::Petg => ((220.0, 260.0), (60.0, 90.0)),
        Material::Abs => ((230.0, 270.0), (90.0, 110.0)),
        Material::Tpu => ((200.0, 235.0), (40.0, 60.0)),
        Material::Asa => ((240.0, 270.0), (90.0, 110.0)),
        Material::Nylon => ((240.0, 270.0), (70.0, 90.0)),
        Material::Pc => ((260.0, 300.0), (100.0, 120.0)),
    }
}

/// Job lifecycle state. See spec §4.6 for the full transition diagram.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Submitted,
    Queued,
    Dispatched,
    Running,
    Completed,
    Failed,
    FailedRetryable,
    Cancelled,
}

impl JobState {
    /// `Completed`, `Cancelled`, or `Failed` are terminal. `Failed` with
    /// retries remaining is handled by the caller — this predicate only
    /// knows the state, not the retry counter.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled | JobState::Failed)
    }

    /// Whether a `Cancelled` transition is reachable from this state.
    /// Per spec, cancellation is always allowed from any non-terminal state.
    pub fn cancellable(self) -> bool {
        !self.is_terminal()
    }
}

/// A queued or in-flight print job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub target_printer: Option<PrinterId>,
    pub priority: i64,
    #[serde(default)]
    pub material: Option<Material>,
    pub file_hash: String,
    pub submitted_at: DateTime<Utc>,
    pub state: JobState,
    pub retries_remaining: u32,
    #[serde(default)]
    pub retry_not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assigned_printer: Option<PrinterId>,
    #[serde(default)]
    pub outcome: Option<JobOutcome>,
    /// Optimistic-concurrency generation, bumped on every persisted state
    /// transition. Compared-and-swapped by the scheduler to guarantee
    /// at-most-once `start_print` (spec §4.6).
    #[serde(default)]
    pub generation: u64,
}

/// Terminal result of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeResult {
    Success,
    Failed,
    Cancelled,
    Partial,
}

/// Durable record of how a job finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub printer_id: PrinterId,
    pub result: OutcomeResult,
    #[serde(default)]
    pub quality_grade: Option<String>,
    #[serde(default)]
    pub failure_mode: Option<String>,
    pub duration_seconds: u64,
    pub file_hash: String,
    #[serde(default)]
    pub material: Option<Material>,
    pub recorded_at: DateTime<Utc>,
    /// Free-form settings (e.g. reported hotend/bed temps, feedrate) that
    /// persistence safety-validates before the row is written (spec §4.3).
    #[serde(default)]
    pub settings: BTreeMap<String, f64>,
}

/// Event kind. Named variants cover everything spec.md names explicitly;
/// `Other` is the escape hatch for collaborator-defined kinds (spec §6.1
/// callers may subscribe to kinds the core itself never publishes).
///
/// Serializes as a single SCREAMING_SNAKE_CASE JSON string (including
/// `Other`, whose payload string passes through verbatim) — a derived
/// externally-tagged enum can't do this once a newtype variant is mixed
/// in with unit variants, so `Serialize`/`Deserialize` are hand-written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    JobSubmitted,
    JobDispatched,
    PrintStarted,
    JobCompleted,
    JobFailed,
    JobCancelled,
    AdapterUnmappedState,
    HeatersAutoCooled,
    WebhookOverflow,
    WebhookDelivered,
    WebhookFailed,
    SafetyViolation,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::JobSubmitted => "JOB_SUBMITTED",
            EventKind::JobDispatched => "JOB_DISPATCHED",
            EventKind::PrintStarted => "PRINT_STARTED",
            EventKind::JobCompleted => "JOB_COMPLETED",
            EventKind::JobFailed => "JOB_FAILED",
            EventKind::JobCancelled => "JOB_CANCELLED",
            EventKind::AdapterUnmappedState => "ADAPTER_UNMAPPED_STATE",
            EventKind::HeatersAutoCooled => "HEATERS_AUTO_COOLED",
            EventKind::WebhookOverflow => "WEBHOOK_OVERFLOW",
            EventKind::WebhookDelivered => "WEBHOOK_DELIVERED",
            EventKind::WebhookFailed => "WEBHOOK_FAILED",
            EventKind::SafetyViolation => "SAFETY_VIOLATION",
            EventKind::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "JOB_SUBMITTED" => EventKind::JobSubmitted,
            "JOB_DISPATCHED" => EventKind::JobDispatched,
            "PRINT_STARTED" => EventKind::PrintStarted,
            "JOB_COMPLETED" => EventKind::JobCompleted,
            "JOB_FAILED" => EventKind::JobFailed,
            "JOB_CANCELLED" => EventKind::JobCancelled,
            "ADAPTER_UNMAPPED_STATE" => EventKind::AdapterUnmappedState,
            "HEATERS_AUTO_COOLED" => EventKind::HeatersAutoCooled,
            "WEBHOOK_OVERFLOW" => EventKind::WebhookOverflow,
            "WEBHOOK_DELIVERED" => EventKind::WebhookDelivered,
            "WEBHOOK_FAILED" => EventKind::WebhookFailed,
            "SAFETY_VIOLATION" => EventKind::SafetyViolation,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EventKind::parse(&s))
    }
}

/// Append-only event. Persisted durably before any subscriber runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub printer_id: Option<PrinterId>,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// One row of the tamper-evident audit log (spec §4.9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    pub tool_name: String,
    pub parameters_digest: String,
    pub result_kind: String,
    pub hmac: String,
    pub prev_hmac: String,
}

/// An outbound webhook registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: String,
    pub url: String,
    pub event_kinds: Vec<EventKind>,
    #[serde(default)]
    pub secret: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Stable, machine-readable failure classification (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Transport,
    Timeout,
    Auth,
    LimitExceeded,
    ValidationRejected,
    PreflightFailed,
    NotIdle,
    InvalidState,
    FileMissing,
    SafetyViolation,
    StartUnconfirmed,
    SsrfBlocked,
    PersistenceFailure,
    Unsupported,
    NotActive,
    TooLarge,
    PathEscape,
    BatchTooLarge,
}

impl ErrorKind {
    /// Whether this kind is retryable per spec §4.6 / §7.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::StartUnconfirmed)
    }
}

/// Every caller-facing error: a stable `kind`, a human-readable message,
/// and optional structured details. Mirrors the teacher's split between
/// `anyhow::Result` internally and a typed enum at the public boundary.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct KilnError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl KilnError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), details: serde_json::Value::Null }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

pub type KilnResult<T> = Result<T, KilnError>;

/// A file as reported by an adapter's `list_files` (spec §4.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterFile {
    pub name: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub uploaded_at: Option<DateTime<Utc>>,
}

/// Cooperative cancellation handed into in-flight adapter calls (spec
/// §6.1, §4.6). Cloning shares the same underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// External view the scheduler's routing filter queries to answer "does
/// this printer currently have material M loaded?" (spec §6.2). The core
/// never writes through this interface.
pub trait MaterialsTracker: Send + Sync {
    fn is_loaded(&self, printer_id: &PrinterId, material: Material) -> bool;
}

/// A single injectable `now()` (spec §6.2), so scheduler/watchdog timing
/// logic is deterministic under test.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real-time `Clock` used outside tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_terminal_predicate() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::FailedRetryable.is_terminal());
    }

    #[test]
    fn cancellable_from_any_nonterminal_state() {
        for s in [
            JobState::Submitted,
            JobState::Queued,
            JobState::Dispatched,
            JobState::Running,
            JobState::FailedRetryable,
        ] {
            assert!(s.cancellable());
        }
        for s in [JobState::Completed, JobState::Cancelled, JobState::Failed] {
            assert!(!s.cancellable());
        }
    }

    #[test]
    fn error_kind_retryable_set() {
        assert!(ErrorKind::Transport.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::StartUnconfirmed.is_retryable());
        assert!(!ErrorKind::PreflightFailed.is_retryable());
        assert!(!ErrorKind::ValidationRejected.is_retryable());
        assert!(!ErrorKind::LimitExceeded.is_retryable());
        assert!(!ErrorKind::FileMissing.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
    }

    #[test]
    fn printer_id_display() {
        let id = PrinterId::new("bench1", AdapterBackend::OctoPrintHttp);
        assert_eq!(id.to_string(), "bench1[octoprint_http]");
    }

    #[test]
    fn temp_reading_unknown_is_none_not_zero() {
        let t = TempReading::unknown();
        assert_eq!(t.actual, None);
        assert_eq!(t.target, None);
    }

    #[test]
    fn material_ranges_cover_all_variants() {
        for m in [
            Material::Pla,
            Material::Petg,
            Material::Abs,
            Material::Tpu,
            Material::Asa,
            Material::Nylon,
            Material::Pc,
        ] {
            let (hotend, bed) = material_temp_ranges(m);
            assert!(hotend.0 < hotend.1);
            assert!(bed.0 < bed.1);
        }
    }

    #[test]
    fn event_kind_roundtrip() {
        let k = EventKind::JobDispatched;
        let json = serde_json::to_string(&k).unwrap();
        assert_eq!(json, "\"JOB_DISPATCHED\"");
        let back: EventKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, k);
    }

    #[test]
    fn kiln_error_carries_kind_and_message() {
        let e = KilnError::new(ErrorKind::LimitExceeded, "hotend over profile max");
        assert_eq!(e.kind, ErrorKind::LimitExceeded);
        assert!(e.to_string().contains("hotend over profile max"));
    }

    #[test]
    fn cancellation_token_clone_shares_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    proptest::proptest! {
        #[test]
        fn event_serde_roundtrip_is_identity(seq in 0u64..10_000) {
            let ev = Event {
                id: seq,
                kind: EventKind::JobCompleted,
                timestamp: Utc::now(),
                printer_id: None,
                job_id: Some(format!("job-{seq}")),
                payload: serde_json::json!({"n": seq}),
            };
            let json = serde_json::to_string(&ev).unwrap();
            let back: Event = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back.id, ev.id);
            prop_assert_eq!(back.job_id, ev.job_id);
        }
    }
}
