//! In-memory adapter double for scheduler/preflight/core tests — no
//! network I/O, fully scriptable.

use std::path::Path;
use std::sync::Mutex;

use kiln_types::{CancellationToken, ErrorKind, KilnError, KilnResult, PrinterCapabilities, PrinterFile, PrinterState, PrinterStatus};

use crate::{PrinterAdapter, Snapshot, TemperatureTargets};

pub struct MockAdapter {
    capabilities: PrinterCapabilities,
    state: Mutex<PrinterState>,
    files: Mutex<Vec<PrinterFile>>,
    start_print_calls: Mutex<Vec<String>>,
    cancel_calls: Mutex<u32>,
    fail_start_print: Mutex<Option<KilnError>>,
}

impl MockAdapter {
    pub fn new(capabilities: PrinterCapabilities, initial_state: PrinterState) -> Self {
        Self {
            capabilities,
            state: Mutex::new(initial_state),
            files: Mutex::new(Vec::new()),
            start_print_calls: Mutex::new(Vec::new()),
            cancel_calls: Mutex::new(0),
            fail_start_print: Mutex::new(None),
        }
    }

    pub fn set_state(&self, state: PrinterState) {
        *self.state.lock().expect("mock state lock poisoned") = state;
    }

    pub fn seed_file(&self, name: impl Into<String>) {
        self.files.lock().expect("mock files lock poisoned").push(PrinterFile { name: name.into(), size_bytes: None, uploaded_at: None });
    }

    pub fn fail_next_start_print(&self, err: KilnError) {
        *self.fail_start_print.lock().expect("mock fail lock poisoned") = Some(err);
    }

    pub fn start_print_calls(&self) -> Vec<String> {
        self.start_print_calls.lock().expect("mock calls lock poisoned").clone()
    }

    pub fn cancel_call_count(&self) -> u32 {
        *self.cancel_calls.lock().expect("mock cancel lock poisoned")
    }
}

impl PrinterAdapter for MockAdapter {
    fn capabilities(&self) -> &PrinterCapabilities {
        &self.capabilities
    }

    fn get_status(&self) -> PrinterState {
        self.state.lock().expect("mock state lock poisoned").clone()
    }

    fn list_files(&self) -> KilnResult<Vec<PrinterFile>> {
        Ok(self.files.lock().expect("mock files lock poisoned").clone())
    }

    fn upload_file(&self, _local_path: &Path, remote_name: &str) -> KilnResult<()> {
        self.seed_file(remote_name);
        Ok(())
    }

    fn start_print(&self, remote_filename: &str, _cancel: &CancellationToken) -> KilnResult<()> {
        self.start_print_calls.lock().expect("mock calls lock poisoned").push(remote_filename.to_string());
        if let Some(err) = self.fail_start_print.lock().expect("mock fail lock poisoned").take() {
            return Err(err);
        }
        let mut state = self.state.lock().expect("mock state lock poisoned");
        state.status = PrinterStatus::Printing;
        state.file_name = Some(remote_filename.to_string());
        Ok(())
    }

    fn cancel_print(&self) -> KilnResult<()> {
        *self.cancel_calls.lock().expect("mock cancel lock poisoned") += 1;
        self.state.lock().expect("mock state lock poisoned").status = PrinterStatus::Idle;
        Ok(())
    }

    fn pause_print(&self) -> KilnResult<()> {
        self.state.lock().expect("mock state lock poisoned").status = PrinterStatus::Paused;
        Ok(())
    }

    fn resume_print(&self) -> KilnResult<()> {
        self.state.lock().expect("mock state lock poisoned").status = PrinterStatus::Printing;
        Ok(())
    }

    fn set_temperature(&self, targets: TemperatureTargets) -> KilnResult<()> {
        if !self.capabilities.can_set_temp {
            return Err(KilnError::new(ErrorKind::Unsupported, "mock adapter configured without temperature control"));
        }
        let mut state = self.state.lock().expect("mock state lock poisoned");
        if let Some(hotend) = targets.hotend {
            if let Some(reading) = state.tool_temps.first_mut() {
                reading.target = Some(hotend);
            }
        }
        if let Some(bed) = targets.bed {
            state.bed_temp.target = Some(bed);
        }
        Ok(())
    }

    fn send_gcode(&self, lines: &[String]) -> KilnResult<Vec<String>> {
        if !self.capabilities.can_send_gcode {
            return Err(KilnError::new(ErrorKind::Unsupported, "mock adapter configured without gcode passthrough"));
        }
        Ok(lines.iter().map(|l| format!("ok {l}")).collect())
    }

    fn get_snapshot(&self) -> KilnResult<Snapshot> {
        if !self.capabilities.can_snapshot {
            return Err(KilnError::new(ErrorKind::Unsupported, "mock adapter configured without a camera"));
        }
        Ok(Snapshot { bytes: vec![0xFF, 0xD8, 0xFF], mime_type: "image/jpeg".into() })
    }

    fn get_stream_url(&self) -> KilnResult<String> {
        if !self.capabilities.can_snapshot {
            return Err(KilnError::new(ErrorKind::Unsupported, "mock adapter configured without a camera"));
        }
        Ok("mock://stream".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_types::TempReading;

    fn capabilities() -> PrinterCapabilities {
        PrinterCapabilities { can_set_temp: true, can_send_gcode: true, can_snapshot: true, can_update_firmware: false, device_type: "mock".into() }
    }

    #[test]
    fn start_print_transitions_to_printing_and_records_call() {
        let adapter = MockAdapter::new(capabilities(), PrinterState::offline());
        adapter.set_state(PrinterState { status: PrinterStatus::Idle, ..PrinterState::offline() });
        let token = CancellationToken::new();
        adapter.start_print("benchy.gcode", &token).unwrap();
        assert_eq!(adapter.get_status().status, PrinterStatus::Printing);
        assert_eq!(adapter.start_print_calls(), vec!["benchy.gcode".to_string()]);
    }

    #[test]
    fn fail_next_start_print_is_consumed_once() {
        let adapter = MockAdapter::new(capabilities(), PrinterState::offline());
        adapter.fail_next_start_print(KilnError::new(ErrorKind::NotIdle, "printer busy"));
        let token = CancellationToken::new();
        assert!(adapter.start_print("a.gcode", &token).is_err());
        assert!(adapter.start_print("b.gcode", &token).is_ok());
    }

    #[test]
    fn set_temperature_updates_target_reading() {
        let mut state = PrinterState::offline();
        state.tool_temps.push(TempReading::unknown());
        let adapter = MockAdapter::new(capabilities(), state);
        adapter.set_temperature(TemperatureTargets { hotend: Some(210.0), bed: Some(60.0), chamber: None }).unwrap();
        let state = adapter.get_status();
        assert_eq!(state.tool_temps[0].target, Some(210.0));
        assert_eq!(state.bed_temp.target, Some(60.0));
    }

    #[test]
    fn cancel_print_increments_count_and_sets_idle() {
        let adapter = MockAdapter::new(capabilities(), PrinterState::offline());
        adapter.cancel_print().unwrap();
        adapter.cancel_print().unwrap();
        assert_eq!(adapter.cancel_call_count(), 2);
        assert_eq!(adapter.get_status().status, PrinterStatus::Idle);
    }
}
