//! Printer adapters (spec §4.5): one [`PrinterAdapter`] implementation per
//! backend family, normalizing each backend's native state into a single
//! `PrinterState`. Mirrors the teacher's `StorageBackend` trait + factory
//! shape (`shipper-storage`), generalized from storage providers to
//! printer backends.

mod bambu;
mod elegoo;
mod klipper;
mod mock;
mod octoprint;

use std::path::Path;
use std::thread;

use kiln_retry::{RetryStrategy, calculate_delay};
use kiln_types::{CancellationToken, ErrorKind, KilnError, KilnResult, PrinterCapabilities, PrinterFile, PrinterState};

pub use bambu::{BambuAdapter, BambuConfig};
pub use elegoo::{ElegooAdapter, ElegooConfig, discover_elegoo_printers};
pub use klipper::{KlipperAdapter, KlipperConfig};
pub use mock::MockAdapter;
pub use octoprint::{OctoPrintAdapter, OctoPrintConfig};

/// Target temperatures for `set_temperature`. `None` fields are left alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemperatureTargets {
    pub hotend: Option<f64>,
    pub bed: Option<f64>,
    pub chamber: Option<f64>,
}

/// Snapshot image bytes with their MIME type.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// The uniform operation set every backend implements (spec §4.5 table).
///
/// `get_status` never raises — connection failures return
/// `PrinterState { status: OFFLINE, .. }` so the scheduler always has a
/// routing decision to make. Every other method surfaces transport errors
/// as typed `KilnError`s.
pub trait PrinterAdapter: Send + Sync {
    fn capabilities(&self) -> &PrinterCapabilities;
    fn get_status(&self) -> PrinterState;
    fn list_files(&self) -> KilnResult<Vec<PrinterFile>>;
    fn upload_file(&self, local_path: &Path, remote_name: &str) -> KilnResult<()>;
    fn start_print(&self, remote_filename: &str, cancel: &CancellationToken) -> KilnResult<()>;
    fn cancel_print(&self) -> KilnResult<()>;
    fn pause_print(&self) -> KilnResult<()>;
    fn resume_print(&self) -> KilnResult<()>;
    fn set_temperature(&self, targets: TemperatureTargets) -> KilnResult<()>;
    fn send_gcode(&self, lines: &[String]) -> KilnResult<Vec<String>>;
    fn get_snapshot(&self) -> KilnResult<Snapshot>;
    fn get_stream_url(&self) -> KilnResult<String>;

    /// Raw backend values `get_status` couldn't map to a `PrinterStatus`,
    /// drained by the caller (`kiln-core`'s status poller) and turned into
    /// `ADAPTER_UNMAPPED_STATE` events. Empty by default.
    fn drain_unmapped_warnings(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Per-backend connection configuration, tagged the same way
/// `kiln_types::AdapterBackend` tags a `PrinterId`.
pub enum AdapterConfig {
    OctoPrint(OctoPrintConfig),
    Klipper(KlipperConfig),
    Bambu(BambuConfig),
    Elegoo(ElegooConfig),
}

/// Builds the adapter for a backend config. Mirrors
/// `shipper_storage::build_storage_backend`.
pub fn build_adapter(config: AdapterConfig) -> anyhow::Result<Box<dyn PrinterAdapter>> {
    match config {
        AdapterConfig::OctoPrint(c) => Ok(Box::new(OctoPrintAdapter::new(c)?)),
        AdapterConfig::Klipper(c) => Ok(Box::new(KlipperAdapter::new(c)?)),
        AdapterConfig::Bambu(c) => Ok(Box::new(BambuAdapter::new(c)?)),
        AdapterConfig::Elegoo(c) => Ok(Box::new(ElegooAdapter::new(c)?)),
    }
}

/// Retries an idempotent adapter call up to 3 times with 200/400/800 ms
/// backoff (spec §4.5.2). `start_print`, `cancel_print`, and `upload_file`
/// are non-idempotent and must not be wrapped with this — their retries
/// are the scheduler's responsibility.
pub fn retry_idempotent<T>(mut op: impl FnMut() -> KilnResult<T>) -> KilnResult<T> {
    let strategy = RetryStrategy::adapter_sequence();
    let max_attempts = strategy.max_attempts().unwrap_or(1);
    let mut last_err: Option<KilnError> = None;
    for attempt in 0..max_attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.kind.is_retryable() => {
                last_err = Some(e);
                if attempt + 1 < max_attempts {
                    thread::sleep(calculate_delay(&strategy, attempt as u32));
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| KilnError::new(ErrorKind::Transport, "adapter call exhausted retries")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn retry_idempotent_gives_up_after_three_attempts() {
        let attempts = RefCell::new(0);
        let result: KilnResult<()> = retry_idempotent(|| {
            *attempts.borrow_mut() += 1;
            Err(KilnError::new(ErrorKind::Transport, "connection reset"))
        });
        assert!(result.is_err());
        assert_eq!(*attempts.borrow(), 3);
    }

    #[test]
    fn retry_idempotent_stops_immediately_on_non_retryable_kind() {
        let attempts = RefCell::new(0);
        let result: KilnResult<()> = retry_idempotent(|| {
            *attempts.borrow_mut() += 1;
            Err(KilnError::new(ErrorKind::Auth, "invalid api key"))
        });
        assert!(result.is_err());
        assert_eq!(*attempts.borrow(), 1);
    }

    #[test]
    fn retry_idempotent_returns_first_success() {
        let attempts = RefCell::new(0);
        let result = retry_idempotent(|| {
            *attempts.borrow_mut() += 1;
            if *attempts.borrow() < 2 {
                Err(KilnError::new(ErrorKind::Timeout, "timed out"))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(*attempts.borrow(), 2);
    }
}
