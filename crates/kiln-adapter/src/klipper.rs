//! Klipper/Moonraker-style HTTP/REST backend (spec §4.5.1): string state
//! from `/printer/objects/query`, webcam endpoint discovered dynamically.

use std::path::Path;
use std::time::Duration;

use kiln_types::{CancellationToken, ErrorKind, KilnError, KilnResult, PrinterCapabilities, PrinterFile, PrinterState, PrinterStatus, TempReading};
use serde::Deserialize;
use std::sync::Mutex;

use crate::{PrinterAdapter, Snapshot, TemperatureTargets, retry_idempotent};

#[derive(Debug, Clone)]
pub struct KlipperConfig {
    pub base_url: String,
    pub capabilities: PrinterCapabilities,
}

pub struct KlipperAdapter {
    config: KlipperConfig,
    client: reqwest::blocking::Client,
    unmapped: Mutex<Vec<String>>,
}

fn map_print_state(raw: &str) -> Option<PrinterStatus> {
    match raw {
        "standby" => Some(PrinterStatus::Idle),
        "printing" => Some(PrinterStatus::Printing),
        "paused" => Some(PrinterStatus::Paused),
        "complete" => Some(PrinterStatus::Idle),
        "cancelled" => Some(PrinterStatus::Idle),
        "error" => Some(PrinterStatus::Error),
        _ => None,
    }
}

#[derive(Deserialize)]
struct QueryResponse {
    result: QueryResult,
}

#[derive(Deserialize)]
struct QueryResult {
    status: QueryStatus,
}

#[derive(Deserialize)]
struct QueryStatus {
    print_stats: PrintStats,
    extruder: Option<TempPair>,
    heater_bed: Option<TempPair>,
}

#[derive(Deserialize)]
struct PrintStats {
    state: String,
    filename: Option<String>,
}

#[derive(Deserialize)]
struct TempPair {
    temperature: Option<f64>,
    target: Option<f64>,
}

impl KlipperAdapter {
    pub fn new(config: KlipperConfig) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { config, client, unmapped: Mutex::new(Vec::new()) })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn transport_err(e: impl std::fmt::Display) -> KilnError {
        KilnError::new(ErrorKind::Transport, format!("klipper request failed: {e}"))
    }

    fn run_gcode(&self, script: &str) -> KilnResult<()> {
        self.client
            .post(self.url("/printer/gcode/script"))
            .json(&serde_json::json!({"script": script}))
            .send()
            .map_err(Self::transport_err)?
            .error_for_status()
            .map_err(Self::transport_err)?;
        Ok(())
    }
}

impl PrinterAdapter for KlipperAdapter {
    fn capabilities(&self) -> &PrinterCapabilities {
        &self.config.capabilities
    }

    fn get_status(&self) -> PrinterState {
        let attempt = || -> anyhow::Result<PrinterState> {
            let resp: QueryResponse = self
                .client
                .get(self.url("/printer/objects/query?print_stats&extruder&heater_bed"))
                .send()?
                .error_for_status()?
                .json()?;

            let raw_state = resp.result.status.print_stats.state;
            let status = map_print_state(&raw_state).unwrap_or_else(|| {
                self.unmapped.lock().expect("unmapped lock poisoned").push(raw_state.clone());
                PrinterStatus::Unknown
            });

            let tool_temps = resp
                .result
                .status
                .extruder
                .as_ref()
                .map(|t| vec![TempReading { actual: t.temperature, target: t.target }])
                .unwrap_or_default();
            let bed_temp = resp
                .result
                .status
                .heater_bed
                .as_ref()
                .map(|t| TempReading { actual: t.temperature, target: t.target })
                .unwrap_or_else(TempReading::unknown);

            Ok(PrinterState {
                status,
                tool_temps,
                bed_temp,
                chamber_temp: None,
                job_progress: None,
                elapsed_seconds: None,
                remaining_seconds: None,
                file_name: resp.result.status.print_stats.filename,
                error_message: None,
            })
        };

        attempt().unwrap_or_else(|_| PrinterState::offline())
    }

    fn list_files(&self) -> KilnResult<Vec<PrinterFile>> {
        #[derive(Deserialize)]
        struct FileEntry {
            path: String,
            size: Option<u64>,
        }

        retry_idempotent(|| {
            let entries: Vec<FileEntry> = self
                .client
                .get(self.url("/server/files/list"))
                .send()
                .map_err(Self::transport_err)?
                .error_for_status()
                .map_err(Self::transport_err)?
                .json()
                .map_err(Self::transport_err)?;
            Ok(entries
                .into_iter()
                .map(|f| PrinterFile { name: f.path, size_bytes: f.size, uploaded_at: None })
                .collect())
        })
    }

    fn upload_file(&self, local_path: &Path, remote_name: &str) -> KilnResult<()> {
        let bytes = std::fs::read(local_path)
            .map_err(|e| KilnError::new(ErrorKind::FileMissing, format!("cannot read {}: {e}", local_path.display())))?;
        let part = reqwest::blocking::multipart::Part::bytes(bytes).file_name(remote_name.to_string());
        let form = reqwest::blocking::multipart::Form::new().part("file", part);
        self.client
            .post(self.url("/server/files/upload"))
            .multipart(form)
            .send()
            .map_err(Self::transport_err)?
            .error_for_status()
            .map_err(Self::transport_err)?;
        Ok(())
    }

    fn start_print(&self, remote_filename: &str, _cancel: &CancellationToken) -> KilnResult<()> {
        self.client
            .post(self.url("/printer/print/start"))
            .json(&serde_json::json!({"filename": remote_filename}))
            .send()
            .map_err(Self::transport_err)?
            .error_for_status()
            .map_err(Self::transport_err)?;
        Ok(())
    }

    fn cancel_print(&self) -> KilnResult<()> {
        self.client.post(self.url("/printer/print/cancel")).send().map_err(Self::transport_err)?.error_for_status().map_err(Self::transport_err)?;
        Ok(())
    }

    fn pause_print(&self) -> KilnResult<()> {
        self.client.post(self.url("/printer/print/pause")).send().map_err(Self::transport_err)?.error_for_status().map_err(Self::transport_err)?;
        Ok(())
    }

    fn resume_print(&self) -> KilnResult<()> {
        self.client.post(self.url("/printer/print/resume")).send().map_err(Self::transport_err)?.error_for_status().map_err(Self::transport_err)?;
        Ok(())
    }

    fn set_temperature(&self, targets: TemperatureTargets) -> KilnResult<()> {
        if let Some(hotend) = targets.hotend {
            self.run_gcode(&format!("M104 S{hotend}"))?;
        }
        if let Some(bed) = targets.bed {
            self.run_gcode(&format!("M140 S{bed}"))?;
        }
        if targets.chamber.is_some() {
            return Err(KilnError::new(ErrorKind::Unsupported, "klipper backend has no chamber heater by default"));
        }
        Ok(())
    }

    fn send_gcode(&self, lines: &[String]) -> KilnResult<Vec<String>> {
        self.run_gcode(&lines.join("\n"))?;
        Ok(Vec::new())
    }

    fn get_snapshot(&self) -> KilnResult<Snapshot> {
        #[derive(Deserialize)]
        struct WebcamsResponse {
            result: WebcamsResult,
        }
        #[derive(Deserialize)]
        struct WebcamsResult {
            webcams: Vec<Webcam>,
        }
        #[derive(Deserialize)]
        struct Webcam {
            snapshot_url: String,
        }

        let discovered: WebcamsResponse = self
            .client
            .get(self.url("/server/webcams/list"))
            .send()
            .map_err(Self::transport_err)?
            .error_for_status()
            .map_err(Self::transport_err)?
            .json()
            .map_err(Self::transport_err)?;

        let webcam = discovered
            .result
            .webcams
            .into_iter()
            .next()
            .ok_or_else(|| KilnError::new(ErrorKind::Unsupported, "no webcam registered on this klipper instance"))?;

        let resp = self.client.get(&webcam.snapshot_url).send().map_err(Self::transport_err)?.error_for_status().map_err(Self::transport_err)?;
        let mime_type = resp.headers().get("content-type").and_then(|v| v.to_str().ok()).unwrap_or("image/jpeg").to_string();
        let bytes = resp.bytes().map_err(Self::transport_err)?.to_vec();
        Ok(Snapshot { bytes, mime_type })
    }

    fn get_stream_url(&self) -> KilnResult<String> {
        Err(KilnError::new(ErrorKind::Unsupported, "klipper stream discovery requires get_snapshot's webcam lookup first"))
    }

    fn drain_unmapped_warnings(&self) -> Vec<String> {
        std::mem::take(&mut self.unmapped.lock().expect("unmapped lock poisoned"))
    }
}
