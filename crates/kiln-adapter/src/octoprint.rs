//! OctoPrint-style HTTP/REST backend (spec §4.5.1): boolean flag-set
//! state, multipart upload, opaque `X-Api-Key` header auth.

use std::io::Read;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use kiln_types::{ErrorKind, KilnError, KilnResult, PrinterCapabilities, PrinterFile, PrinterState, PrinterStatus, TempReading};
use serde::Deserialize;

use crate::{PrinterAdapter, Snapshot, TemperatureTargets, retry_idempotent};

#[derive(Debug, Clone)]
pub struct OctoPrintConfig {
    pub base_url: String,
    pub api_key: String,
    pub snapshot_url: Option<String>,
    pub capabilities: PrinterCapabilities,
}

pub struct OctoPrintAdapter {
    config: OctoPrintConfig,
    client: reqwest::blocking::Client,
    unmapped: Mutex<Vec<String>>,
}

#[derive(Deserialize)]
struct JobFlags {
    printing: bool,
    paused: bool,
    error: bool,
    ready: bool,
    cancelling: bool,
}

#[derive(Deserialize)]
struct PrinterStateResponse {
    state: JobStateWrapper,
    temperature: Option<TemperatureMap>,
}

#[derive(Deserialize)]
struct JobStateWrapper {
    flags: JobFlags,
}

#[derive(Deserialize)]
struct TemperatureMap {
    tool0: Option<TempPair>,
    bed: Option<TempPair>,
}

#[derive(Deserialize)]
struct TempPair {
    actual: Option<f64>,
    target: Option<f64>,
}

impl OctoPrintAdapter {
    pub fn new(config: OctoPrintConfig) -> anyhow::Result<Self> {
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
        KilnError::new(ErrorKind::Transport, format!("octoprint request failed: {e}"))
    }
}

impl PrinterAdapter for OctoPrintAdapter {
    fn capabilities(&self) -> &PrinterCapabilities {
        &self.config.capabilities
    }

    fn get_status(&self) -> PrinterState {
        let attempt = || -> anyhow::Result<PrinterState> {
            let resp: PrinterStateResponse = self
                .client
                .get(self.url("/api/printer"))
                .header("X-Api-Key", &self.config.api_key)
                .send()?
                .error_for_status()?
                .json()?;

            let flags = &resp.state.flags;
            let status = if flags.error {
                PrinterStatus::Error
            } else if flags.cancelling || flags.printing {
                PrinterStatus::Printing
            } else if flags.paused {
                PrinterStatus::Paused
            } else if flags.ready {
                PrinterStatus::Idle
            } else {
                let raw = format!(
                    "printing={} paused={} error={} ready={} cancelling={}",
                    flags.printing, flags.paused, flags.error, flags.ready, flags.cancelling
                );
                self.unmapped.lock().expect("unmapped lock poisoned").push(raw);
                PrinterStatus::Unknown
            };

            let tool_temps = resp
                .temperature
                .as_ref()
                .and_then(|t| t.tool0.as_ref())
                .map(|t| vec![TempReading { actual: t.actual, target: t.target }])
                .unwrap_or_default();
            let bed_temp = resp
                .temperature
                .as_ref()
                .and_then(|t| t.bed.as_ref())
                .map(|t| TempReading { actual: t.actual, target: t.target })
                .unwrap_or_else(TempReading::unknown);

            Ok(PrinterState {
                status,
                tool_temps,
                bed_temp,
                chamber_temp: None,
                job_progress: None,
                elapsed_seconds: None,
                remaining_seconds: None,
                file_name: None,
                error_message: None,
            })
        };

        attempt().unwrap_or_else(|_| PrinterState::offline())
    }

    fn list_files(&self) -> KilnResult<Vec<PrinterFile>> {
        #[derive(Deserialize)]
        struct FilesResponse {
            files: Vec<FileEntry>,
        }
        #[derive(Deserialize)]
        struct FileEntry {
            name: String,
            size: Option<u64>,
        }

        retry_idempotent(|| {
            let resp: FilesResponse = self
                .client
                .get(self.url("/api/files/local"))
                .header("X-Api-Key", &self.config.api_key)
                .send()
                .map_err(Self::transport_err)?
                .error_for_status()
                .map_err(Self::transport_err)?
                .json()
                .map_err(Self::transport_err)?;
            Ok(resp
                .files
                .into_iter()
                .map(|f| PrinterFile { name: f.name, size_bytes: f.size, uploaded_at: None })
                .collect())
        })
    }

    fn upload_file(&self, local_path: &Path, remote_name: &str) -> KilnResult<()> {
        let mut file = std::fs::File::open(local_path)
            .map_err(|e| KilnError::new(ErrorKind::FileMissing, format!("cannot open {}: {e}", local_path.display())))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| KilnError::new(ErrorKind::FileMissing, format!("cannot read {}: {e}", local_path.display())))?;

        let part = reqwest::blocking::multipart::Part::bytes(bytes).file_name(remote_name.to_string());
        let form = reqwest::blocking::multipart::Form::new().part("file", part);

        self.client
            .post(self.url("/api/files/local"))
            .header("X-Api-Key", &self.config.api_key)
            .multipart(form)
            .send()
            .map_err(Self::transport_err)?
            .error_for_status()
            .map_err(Self::transport_err)?;
        Ok(())
    }

    fn start_print(&self, remote_filename: &str, _cancel: &kiln_types::CancellationToken) -> KilnResult<()> {
        self.client
            .post(self.url(&format!("/api/files/local/{remote_filename}")))
            .header("X-Api-Key", &self.config.api_key)
            .json(&serde_json::json!({"command": "select", "print": true}))
            .send()
            .map_err(Self::transport_err)?
            .error_for_status()
            .map_err(Self::transport_err)?;
        Ok(())
    }

    fn cancel_print(&self) -> KilnResult<()> {
        self.post_job_command("cancel")
    }

    fn pause_print(&self) -> KilnResult<()> {
        self.post_job_command("pause")
    }

    fn resume_print(&self) -> KilnResult<()> {
        self.post_job_command("resume")
    }

    fn set_temperature(&self, targets: TemperatureTargets) -> KilnResult<()> {
        if let Some(hotend) = targets.hotend {
            self.client
                .post(self.url("/api/printer/tool"))
                .header("X-Api-Key", &self.config.api_key)
                .json(&serde_json::json!({"command": "target", "targets": {"tool0": hotend}}))
                .send()
                .map_err(Self::transport_err)?
                .error_for_status()
                .map_err(Self::transport_err)?;
        }
        if let Some(bed) = targets.bed {
            self.client
                .post(self.url("/api/printer/bed"))
                .header("X-Api-Key", &self.config.api_key)
                .json(&serde_json::json!({"command": "target", "target": bed}))
                .send()
                .map_err(Self::transport_err)?
                .error_for_status()
                .map_err(Self::transport_err)?;
        }
        if targets.chamber.is_some() {
            return Err(KilnError::new(ErrorKind::Unsupported, "octoprint backend has no chamber heater endpoint"));
        }
        Ok(())
    }

    fn send_gcode(&self, lines: &[String]) -> KilnResult<Vec<String>> {
        self.client
            .post(self.url("/api/printer/command"))
            .header("X-Api-Key", &self.config.api_key)
            .json(&serde_json::json!({"commands": lines}))
            .send()
            .map_err(Self::transport_err)?
            .error_for_status()
            .map_err(Self::transport_err)?;
        Ok(Vec::new())
    }

    fn get_snapshot(&self) -> KilnResult<Snapshot> {
        let url = self
            .config
            .snapshot_url
            .clone()
            .unwrap_or_else(|| self.url("/webcam/?action=snapshot"));
        let resp = self.client.get(url).send().map_err(Self::transport_err)?.error_for_status().map_err(Self::transport_err)?;
        let mime_type = resp.headers().get("content-type").and_then(|v| v.to_str().ok()).unwrap_or("image/jpeg").to_string();
        let bytes = resp.bytes().map_err(Self::transport_err)?.to_vec();
        Ok(Snapshot { bytes, mime_type })
    }

    fn get_stream_url(&self) -> KilnResult<String> {
        Ok(self.url("/webcam/?action=stream"))
    }

    fn drain_unmapped_warnings(&self) -> Vec<String> {
        std::mem::take(&mut self.unmapped.lock().expect("unmapped lock poisoned"))
    }
}

impl OctoPrintAdapter {
    fn post_job_command(&self, command: &str) -> KilnResult<()> {
        self.client
            .post(self.url("/api/job"))
            .header("X-Api-Key", &self.config.api_key)
            .json(&serde_json::json!({"command": command}))
            .send()
            .map_err(Self::transport_err)?
            .error_for_status()
            .map_err(Self::transport_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiny_http::{Response, Server};

    fn spawn_printer_server(body: &'static str) -> (String, std::thread::JoinHandle<()>) {
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr();
        let handle = std::thread::spawn(move || {
            if let Ok(request) = server.recv() {
                let _ = request.respond(Response::from_string(body).with_header(
                    "Content-Type: application/json".parse::<tiny_http::Header>().unwrap(),
                ));
            }
        });
        (format!("http://{addr}"), handle)
    }

    #[test]
    fn maps_printing_flag_to_printing_status() {
        let body = r#"{"state":{"flags":{"printing":true,"paused":false,"error":false,"ready":false,"cancelling":false}},"temperature":{"tool0":{"actual":210.0,"target":210.0},"bed":{"actual":60.0,"target":60.0}}}"#;
        let (base_url, handle) = spawn_printer_server(body);
        let adapter = OctoPrintAdapter::new(OctoPrintConfig {
            base_url,
            api_key: "key".into(),
            snapshot_url: None,
            capabilities: PrinterCapabilities {
                can_set_temp: true,
                can_send_gcode: true,
                can_snapshot: true,
                can_update_firmware: false,
                device_type: "octoprint".into(),
            },
        })
        .unwrap();

        let state = adapter.get_status();
        assert_eq!(state.status, PrinterStatus::Printing);
        assert_eq!(state.tool_temps[0].actual, Some(210.0));
        handle.join().unwrap();
    }

    #[test]
    fn unreachable_host_returns_offline_not_error() {
        let adapter = OctoPrintAdapter::new(OctoPrintConfig {
            base_url: "http://127.0.0.1:1".into(),
            api_key: "key".into(),
            snapshot_url: None,
            capabilities: PrinterCapabilities {
                can_set_temp: true,
                can_send_gcode: true,
                can_snapshot: true,
                can_update_firmware: false,
                device_type: "octoprint".into(),
            },
        })
        .unwrap();

        let state = adapter.get_status();
        assert_eq!(state.status, PrinterStatus::Offline);
    }
}
