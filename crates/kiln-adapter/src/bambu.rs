//! Bambu-style MQTT+FTPS backend (spec §4.5.1): persistent MQTT session
//! over TLS on port 8883, file transfer over implicit FTPS on port 990.
//! Bambu printers present a self-signed certificate, so the MQTT and FTPS
//! transports both skip chain verification — grounded on the same
//! accept-all `ServerCertVerifier` pattern used for Bambu connections in
//! the wider ecosystem (PulsePrint's `mqtt.rs`).

use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kiln_types::{CancellationToken, ErrorKind, KilnError, KilnResult, PrinterCapabilities, PrinterFile, PrinterState, PrinterStatus, TempReading};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS, Transport};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use serde::Deserialize;
use suppaftp::RustlsConnector;

use crate::{PrinterAdapter, Snapshot, TemperatureTargets};

const REPORT_STALE_AFTER: Duration = Duration::from_secs(15);
const START_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);
const ALLOWED_REMOTE_PREFIXES: [&str; 2] = ["model/", "cache/"];

#[derive(Debug, Clone)]
pub struct BambuConfig {
    pub host: String,
    pub access_code: String,
    pub serial: String,
    pub capabilities: PrinterCapabilities,
}

#[derive(Debug)]
struct AcceptAllCerts;

impl ServerCertVerifier for AcceptAllCerts {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer,
        _intermediates: &[rustls::pki_types::CertificateDer],
        _server_name: &rustls::pki_types::ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}

/// Maps Bambu's `gcode_state` (reported uppercase on some firmware
/// versions, lowercased here before matching).
fn map_gcode_state(raw: &str) -> Option<PrinterStatus> {
    match raw.to_ascii_lowercase().as_str() {
        "idle" => Some(PrinterStatus::Idle),
        "running" | "prepare" | "slicing" => Some(PrinterStatus::Printing),
        "pause" => Some(PrinterStatus::Paused),
        "finish" => Some(PrinterStatus::Idle),
        "failed" => Some(PrinterStatus::Error),
        _ => None,
    }
}

fn validate_remote_path(path: &str) -> KilnResult<()> {
    if path.contains("..") {
        return Err(KilnError::new(ErrorKind::PathEscape, format!("remote path {path} contains a traversal segment")));
    }
    if !ALLOWED_REMOTE_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return Err(KilnError::new(
            ErrorKind::PathEscape,
            format!("remote path {path} is outside the allowed prefixes {ALLOWED_REMOTE_PREFIXES:?}"),
        ));
    }
    Ok(())
}

#[derive(Deserialize, Default)]
struct PrintReport {
    gcode_state: Option<String>,
    nozzle_temper: Option<f64>,
    nozzle_target_temper: Option<f64>,
    bed_temper: Option<f64>,
    bed_target_temper: Option<f64>,
    chamber_temper: Option<f64>,
    mc_percent: Option<f64>,
    mc_remaining_time: Option<u64>,
    gcode_file: Option<String>,
}

#[derive(Deserialize, Default)]
struct ReportEnvelope {
    print: Option<PrintReport>,
}

pub struct BambuAdapter {
    config: BambuConfig,
    client: Client,
    last_report: Arc<Mutex<Option<(Instant, PrintReport)>>>,
    unmapped: Mutex<Vec<String>>,
}

impl BambuAdapter {
    pub fn new(config: BambuConfig) -> anyhow::Result<Self> {
        let tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAllCerts))
            .with_no_client_auth();

        let mut mqtt_options = MqttOptions::new(format!("kiln-{}", config.serial), config.host.clone(), 8883);
        mqtt_options.set_credentials("bblp", config.access_code.clone());
        mqtt_options.set_keep_alive(Duration::from_secs(5));
        mqtt_options.set_transport(Transport::tls_with_config(rumqttc::TlsConfiguration::Rustls(Arc::new(tls_config))));

        let (client, mut connection) = Client::new(mqtt_options, 16);
        client.subscribe(format!("device/{}/report", config.serial), QoS::AtMostOnce)?;

        let last_report = Arc::new(Mutex::new(None));
        let last_report_bg = last_report.clone();
        std::thread::Builder::new().name("kiln-bambu-mqtt".into()).spawn(move || {
            for notification in connection.iter() {
                if let Ok(Event::Incoming(Packet::Publish(publish))) = notification
                    && let Ok(envelope) = serde_json::from_slice::<ReportEnvelope>(&publish.payload)
                    && let Some(print) = envelope.print
                {
                    *last_report_bg.lock().expect("last_report lock poisoned") = Some((Instant::now(), print));
                }
            }
        })?;

        Ok(Self { config, client, last_report, unmapped: Mutex::new(Vec::new()) })
    }

    fn publish_command(&self, payload: serde_json::Value) -> KilnResult<()> {
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| KilnError::new(ErrorKind::Transport, format!("failed to encode bambu command: {e}")))?;
        self.client
            .publish(format!("device/{}/request", self.config.serial), QoS::AtLeastOnce, false, bytes)
            .map_err(|e| KilnError::new(ErrorKind::Transport, format!("mqtt publish failed: {e}")))
    }

    fn ftps_connect(&self) -> KilnResult<suppaftp::RustlsFtpStream> {
        let tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAllCerts))
            .with_no_client_auth();
        let stream = suppaftp::RustlsFtpStream::connect((self.config.host.as_str(), 990))
            .map_err(|e| KilnError::new(ErrorKind::Transport, format!("ftps connect failed: {e}")))?;
        let mut stream = stream
            .into_secure(RustlsConnector::from(Arc::new(tls_config)), &self.config.host)
            .map_err(|e| KilnError::new(ErrorKind::Transport, format!("ftps tls upgrade failed: {e}")))?;
        stream
            .login("bblp", &self.config.access_code)
            .map_err(|e| KilnError::new(ErrorKind::Auth, format!("ftps login failed: {e}")))?;
        Ok(stream)
    }
}

impl PrinterAdapter for BambuAdapter {
    fn capabilities(&self) -> &PrinterCapabilities {
        &self.config.capabilities
    }

    fn get_status(&self) -> PrinterState {
        let guard = self.last_report.lock().expect("last_report lock poisoned");
        let Some((seen_at, report)) = guard.as_ref() else {
            return PrinterState::offline();
        };
        if seen_at.elapsed() > REPORT_STALE_AFTER {
            return PrinterState::offline();
        }

        let status = match &report.gcode_state {
            Some(raw) => map_gcode_state(raw).unwrap_or_else(|| {
                self.unmapped.lock().expect("unmapped lock poisoned").push(raw.clone());
                PrinterStatus::Unknown
            }),
            None => PrinterStatus::Unknown,
        };

        PrinterState {
            status,
            tool_temps: vec![TempReading { actual: report.nozzle_temper, target: report.nozzle_target_temper }],
            bed_temp: TempReading { actual: report.bed_temper, target: report.bed_target_temper },
            chamber_temp: report.chamber_temper.map(|c| TempReading { actual: Some(c), target: None }),
            job_progress: report.mc_percent.map(|p| p / 100.0),
            elapsed_seconds: None,
            remaining_seconds: report.mc_remaining_time.map(|m| m * 60),
            file_name: report.gcode_file.clone(),
            error_message: None,
        }
    }

    fn list_files(&self) -> KilnResult<Vec<PrinterFile>> {
        let mut ftp = self.ftps_connect()?;
        let mut files = Vec::new();
        for prefix in ALLOWED_REMOTE_PREFIXES {
            let trimmed = prefix.trim_end_matches('/');
            if let Ok(names) = ftp.nlst(Some(trimmed)) {
                files.extend(names.into_iter().map(|name| PrinterFile { name, size_bytes: None, uploaded_at: None }));
            }
        }
        Ok(files)
    }

    fn upload_file(&self, local_path: &Path, remote_name: &str) -> KilnResult<()> {
        validate_remote_path(remote_name)?;
        let bytes = std::fs::read(local_path)
            .map_err(|e| KilnError::new(ErrorKind::FileMissing, format!("cannot read {}: {e}", local_path.display())))?;
        let mut ftp = self.ftps_connect()?;
        let mut cursor = Cursor::new(bytes);
        ftp.put_file(remote_name, &mut cursor)
            .map_err(|e| KilnError::new(ErrorKind::Transport, format!("ftps upload failed: {e}")))?;
        Ok(())
    }

    fn start_print(&self, remote_filename: &str, cancel: &CancellationToken) -> KilnResult<()> {
        validate_remote_path(remote_filename)?;
        self.publish_command(serde_json::json!({
            "print": {"command": "project_file", "param": remote_filename, "sequence_id": "0"}
        }))?;

        let deadline = Instant::now() + START_CONFIRM_TIMEOUT;
        while Instant::now() < deadline {
            if cancel.is_cancelled() {
                return Err(KilnError::new(ErrorKind::Transport, "start_print cancelled before confirmation"));
            }
            if self.get_status().status == PrinterStatus::Printing {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(500));
        }
        Err(KilnError::new(ErrorKind::StartUnconfirmed, "printer did not report RUNNING within 30s of project_file command"))
    }

    fn cancel_print(&self) -> KilnResult<()> {
        self.publish_command(serde_json::json!({"print": {"command": "stop", "sequence_id": "0"}}))
    }

    fn pause_print(&self) -> KilnResult<()> {
        self.publish_command(serde_json::json!({"print": {"command": "pause", "sequence_id": "0"}}))
    }

    fn resume_print(&self) -> KilnResult<()> {
        self.publish_command(serde_json::json!({"print": {"command": "resume", "sequence_id": "0"}}))
    }

    fn set_temperature(&self, targets: TemperatureTargets) -> KilnResult<()> {
        let mut gcode = String::new();
        if let Some(hotend) = targets.hotend {
            gcode.push_str(&format!("M104 S{hotend}\n"));
        }
        if let Some(bed) = targets.bed {
            gcode.push_str(&format!("M140 S{bed}\n"));
        }
        if targets.chamber.is_some() {
            return Err(KilnError::new(ErrorKind::Unsupported, "bambu chamber heater is firmware-controlled, not directly settable"));
        }
        if gcode.is_empty() {
            return Ok(());
        }
        self.publish_command(serde_json::json!({"print": {"command": "gcode_line", "param": gcode, "sequence_id": "0"}}))
    }

    fn send_gcode(&self, _lines: &[String]) -> KilnResult<Vec<String>> {
        Err(KilnError::new(ErrorKind::Unsupported, "bambu firmware rejects arbitrary gcode outside of development mode"))
    }

    fn get_snapshot(&self) -> KilnResult<Snapshot> {
        Err(KilnError::new(ErrorKind::Unsupported, "bambu snapshot requires a local rtsp relay, not exposed by this adapter"))
    }

    fn get_stream_url(&self) -> KilnResult<String> {
        Ok(format!("rtsps://bblp:{}@{}:322/streaming/live/1", self.config.access_code, self.config.host))
    }

    fn drain_unmapped_warnings(&self) -> Vec<String> {
        std::mem::take(&mut self.unmapped.lock().expect("unmapped lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_gcode_states_case_insensitively() {
        assert_eq!(map_gcode_state("IDLE"), Some(PrinterStatus::Idle));
        assert_eq!(map_gcode_state("RUNNING"), Some(PrinterStatus::Printing));
        assert_eq!(map_gcode_state("PAUSE"), Some(PrinterStatus::Paused));
        assert_eq!(map_gcode_state("FAILED"), Some(PrinterStatus::Error));
    }

    #[test]
    fn unknown_gcode_state_maps_to_none() {
        assert_eq!(map_gcode_state("SOME_NEW_STATE"), None);
    }

    #[test]
    fn rejects_path_traversal() {
        let err = validate_remote_path("model/../../etc/passwd").unwrap_err();
        assert_eq!(err.kind, ErrorKind::PathEscape);
    }

    #[test]
    fn rejects_path_outside_allowed_prefixes() {
        let err = validate_remote_path("system/firmware.bin").unwrap_err();
        assert_eq!(err.kind, ErrorKind::PathEscape);
    }

    #[test]
    fn accepts_allowed_prefix() {
        assert!(validate_remote_path("model/benchy.3mf").is_ok());
        assert!(validate_remote_path("cache/benchy.3mf").is_ok());
    }
}
