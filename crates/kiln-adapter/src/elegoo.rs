//! Elegoo-style WebSocket/SDCP backend (spec §4.5.1): persistent
//! WebSocket on port 3030, UDP broadcast discovery on port 3000, and
//! pull-based file upload — the adapter serves the file over a
//! short-lived local HTTP server and tells the printer to fetch it.

use std::io::Read;
use std::net::{TcpStream, UdpSocket};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kiln_types::{CancellationToken, ErrorKind, KilnError, KilnResult, PrinterCapabilities, PrinterFile, PrinterState, PrinterStatus, TempReading};
use serde::Deserialize;
use serde_json::{Value, json};
use tungstenite::{Message, WebSocket};

use crate::{PrinterAdapter, Snapshot, TemperatureTargets};

const STATUS_STALE_AFTER: Duration = Duration::from_secs(10);
const SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ElegooConfig {
    /// Host/IP callers can reach this process on, advertised to the
    /// printer for pull-based file fetches.
    pub advertise_host: String,
    pub printer_host: String,
    pub capabilities: PrinterCapabilities,
}

/// Numeric SDCP status codes observed on Elegoo resin printers. Anything
/// outside this table falls through to `Unknown` + an unmapped-state
/// warning (spec §4.5 normalization contract).
fn map_status_code(code: i64) -> Option<PrinterStatus> {
    match code {
        0 => Some(PrinterStatus::Idle),
        1 => Some(PrinterStatus::Printing),
        2 => Some(PrinterStatus::Paused),
        3 => Some(PrinterStatus::Error),
        4 => Some(PrinterStatus::Busy),
        _ => None,
    }
}

#[derive(Deserialize, Default)]
struct StatusReport {
    #[serde(default)]
    status_code: Option<i64>,
    #[serde(default)]
    temp_of_uvled: Option<f64>,
    #[serde(default)]
    current_layer: Option<u64>,
    #[serde(default)]
    total_layer: Option<u64>,
    #[serde(default)]
    file_name: Option<String>,
}

pub struct ElegooAdapter {
    config: ElegooConfig,
    socket: Mutex<WebSocket<TcpStream>>,
    last_status: Arc<Mutex<Option<(Instant, StatusReport)>>>,
    unmapped: Mutex<Vec<String>>,
}

impl ElegooAdapter {
    /// Establishes the plain-TCP WebSocket connection every instance uses
    /// — SDCP does not run over TLS.
    pub fn new(config: ElegooConfig) -> anyhow::Result<Self> {
        let url = format!("ws://{}:3030/websocket", config.printer_host);
        let stream = TcpStream::connect((config.printer_host.as_str(), 3030))?;
        stream.set_read_timeout(Some(SOCKET_READ_TIMEOUT))?;
        let (socket, _response) = tungstenite::client(url, stream)?;

        Ok(Self {
            config,
            socket: Mutex::new(socket),
            last_status: Arc::new(Mutex::new(None)),
            unmapped: Mutex::new(Vec::new()),
        })
    }

    fn transport_err(e: impl std::fmt::Display) -> KilnError {
        KilnError::new(ErrorKind::Transport, format!("elegoo websocket request failed: {e}"))
    }

    fn send_command(&self, command: Value) -> KilnResult<Value> {
        let mut socket = self.socket.lock().expect("elegoo socket lock poisoned");
        socket.send(Message::Text(command.to_string().into())).map_err(Self::transport_err)?;

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match socket.read() {
                Ok(Message::Text(text)) => {
                    return serde_json::from_str(&text).map_err(Self::transport_err);
                }
                Ok(_) => continue,
                Err(tungstenite::Error::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Self::transport_err(e)),
            }
        }
        Err(KilnError::new(ErrorKind::Timeout, "no response from printer within 5s"))
    }

    fn refresh_status(&self) {
        if let Ok(reply) = self.send_command(json!({"cmd": "status"}))
            && let Ok(report) = serde_json::from_value::<StatusReport>(reply)
        {
            *self.last_status.lock().expect("last_status lock poisoned") = Some((Instant::now(), report));
        }
    }
}

/// Broadcasts an SDCP discovery packet on UDP port 3000 and collects
/// responses for `listen_for`.
pub fn discover_elegoo_printers(listen_for: Duration) -> anyhow::Result<Vec<String>> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(Duration::from_millis(200)))?;
    socket.send_to(b"M99999", ("255.255.255.255", 3000))?;

    let mut found = Vec::new();
    let deadline = Instant::now() + listen_for;
    let mut buf = [0u8; 1024];
    while Instant::now() < deadline {
        match socket.recv_from(&mut buf) {
            Ok((_, addr)) => found.push(addr.ip().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(e.into()),
        }
    }
    found.sort();
    found.dedup();
    Ok(found)
}

impl PrinterAdapter for ElegooAdapter {
    fn capabilities(&self) -> &PrinterCapabilities {
        &self.config.capabilities
    }

    fn get_status(&self) -> PrinterState {
        self.refresh_status();
        let guard = self.last_status.lock().expect("last_status lock poisoned");
        let Some((seen_at, report)) = guard.as_ref() else {
            return PrinterState::offline();
        };
        if seen_at.elapsed() > STATUS_STALE_AFTER {
            return PrinterState::offline();
        }

        let status = match report.status_code {
            Some(code) => map_status_code(code).unwrap_or_else(|| {
                self.unmapped.lock().expect("unmapped lock poisoned").push(code.to_string());
                PrinterStatus::Unknown
            }),
            None => PrinterStatus::Unknown,
        };

        let progress = match (report.current_layer, report.total_layer) {
            (Some(cur), Some(total)) if total > 0 => Some(cur as f64 / total as f64),
            _ => None,
        };

        PrinterState {
            status,
            tool_temps: vec![TempReading { actual: report.temp_of_uvled, target: None }],
            bed_temp: TempReading::unknown(),
            chamber_temp: None,
            job_progress: progress,
            elapsed_seconds: None,
            remaining_seconds: None,
            file_name: report.file_name.clone(),
            error_message: None,
        }
    }

    fn list_files(&self) -> KilnResult<Vec<PrinterFile>> {
        let reply = self.send_command(json!({"cmd": "list_files"}))?;
        let names: Vec<String> = reply
            .get("files")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        Ok(names.into_iter().map(|name| PrinterFile { name, size_bytes: None, uploaded_at: None }).collect())
    }

    fn upload_file(&self, local_path: &Path, remote_name: &str) -> KilnResult<()> {
        let mut file = std::fs::File::open(local_path)
            .map_err(|e| KilnError::new(ErrorKind::FileMissing, format!("cannot open {}: {e}", local_path.display())))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| KilnError::new(ErrorKind::FileMissing, format!("cannot read {}: {e}", local_path.display())))?;

        let server = tiny_http::Server::http("0.0.0.0:0")
            .map_err(|e| KilnError::new(ErrorKind::Transport, format!("cannot open pull-upload server: {e}")))?;
        let port = server.server_addr().to_ip().map(|a| a.port()).unwrap_or(0);
        let fetch_url = format!("http://{}:{}/{}", self.config.advertise_host, port, remote_name);
        let remote_name_owned = remote_name.to_string();

        let handle = std::thread::spawn(move || {
            if let Ok(request) = server.recv() {
                let _ = request.respond(tiny_http::Response::from_data(bytes));
            }
        });

        self.send_command(json!({"cmd": "fetch_file", "url": fetch_url, "name": remote_name_owned}))?;
        handle
            .join()
            .map_err(|_| KilnError::new(ErrorKind::Transport, "pull-upload server thread panicked"))?;
        Ok(())
    }

    fn start_print(&self, remote_filename: &str, _cancel: &CancellationToken) -> KilnResult<()> {
        self.send_command(json!({"cmd": "start_print", "file_name": remote_filename})).map(|_| ())
    }

    fn cancel_print(&self) -> KilnResult<()> {
        self.send_command(json!({"cmd": "stop_print"})).map(|_| ())
    }

    fn pause_print(&self) -> KilnResult<()> {
        self.send_command(json!({"cmd": "pause_print"})).map(|_| ())
    }

    fn resume_print(&self) -> KilnResult<()> {
        self.send_command(json!({"cmd": "resume_print"})).map(|_| ())
    }

    fn set_temperature(&self, _targets: TemperatureTargets) -> KilnResult<()> {
        Err(KilnError::new(ErrorKind::Unsupported, "elegoo resin printers have no user-settable heater targets"))
    }

    fn send_gcode(&self, _lines: &[String]) -> KilnResult<Vec<String>> {
        Err(KilnError::new(ErrorKind::Unsupported, "elegoo SDCP firmware has no raw gcode channel"))
    }

    fn get_snapshot(&self) -> KilnResult<Snapshot> {
        Err(KilnError::new(ErrorKind::Unsupported, "elegoo resin printers in this fleet have no camera module"))
    }

    fn get_stream_url(&self) -> KilnResult<String> {
        Err(KilnError::new(ErrorKind::Unsupported, "elegoo resin printers in this fleet have no camera module"))
    }

    fn drain_unmapped_warnings(&self) -> Vec<String> {
        std::mem::take(&mut self.unmapped.lock().expect("unmapped lock poisoned"))
    }
}
