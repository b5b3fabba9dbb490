//! Printer safety-profile catalog (§4.1) and G-code validator (§4.2).
//!
//! Both halves of this crate are pure: the store is a read-only, O(1)
//! lookup over a dataset embedded at build time, and the validator is a
//! function from `(lines, profile, mode)` to a classification report. No
//! I/O, no mutation, no retries — nothing here talks to a printer.

use std::collections::HashMap;
use std::sync::OnceLock;

use kiln_types::SafetyProfile;
use serde::Deserialize;

const BUNDLED_PROFILES_TOML: &str = include_str!("profiles.toml");

#[derive(Deserialize)]
struct ProfileTable {
    #[serde(rename = "profile", default)]
    profiles: Vec<SafetyProfile>,
}

fn bundled() -> &'static HashMap<String, SafetyProfile> {
    static TABLE: OnceLock<HashMap<String, SafetyProfile>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let table: ProfileTable =
            toml::from_str(BUNDLED_PROFILES_TOML).expect("bundled profiles.toml must parse");
        table.profiles.into_iter().map(|p| (p.id.clone(), p)).collect()
    })
}

/// Read-only catalog of printer-model safety limits.
#[derive(Debug, Default, Clone, Copy)]
pub struct SafetyProfileStore;

impl SafetyProfileStore {
    pub fn new() -> Self {
        Self
    }

    /// Returns the profile for `profile_id`, or a conservative default if
    /// no bundled entry exists. Never fails.
    pub fn get(&self, profile_id: &str) -> SafetyProfile {
        bundled()
            .get(profile_id)
            .cloned()
            .unwrap_or_else(|| SafetyProfile::conservative_default(profile_id))
    }

    /// Enumerates all bundled profiles.
    pub fn list(&self) -> Vec<SafetyProfile> {
        let mut all: Vec<_> = bundled().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

/// Interactive `send_gcode` calls enforce the 100-command batch cap;
/// file-upload validation does not (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcodeContext {
    Interactive,
    FileUpload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Strict,
    DryRun,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub line_no: usize,
    pub command: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Warning {
    pub line_no: usize,
    pub command: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidationReport {
    pub accepted: Vec<String>,
    pub rejections: Vec<Rejection>,
    pub warnings: Vec<Warning>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.rejections.is_empty()
    }
}

const MAX_INTERACTIVE_BATCH: usize = 100;

const KNOWN_CODES: &[&str] = &[
    "G0", "G1", "G4", "G28", "G29", "G90", "G91", "G92",
    "M82", "M83", "M84", "M104", "M105", "M106", "M107", "M109", "M114", "M115",
    "M140", "M141", "M190", "M191", "M400", "M500", "M501", "M502", "M503",
    "M552", "M553", "M554", "M997",
];

const BLOCKED_ALWAYS: &[&str] = &["M502", "M997", "M552", "M553", "M554"];
const NEGATIVE_ARG_BLOCKED: &[&str] = &["M104", "M109", "M140", "M190"];

struct ParsedLine<'a> {
    command: &'a str,
    args: HashMap<char, f64>,
}

fn parse_line(raw: &str) -> Option<ParsedLine<'_>> {
    let without_comment = match raw.find(';') {
        Some(idx) => &raw[..idx],
        None => raw,
    };
    let trimmed = without_comment.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut tokens = trimmed.split_whitespace();
    let command = tokens.next()?;
    let mut args = HashMap::new();
    for tok in tokens {
        let mut chars = tok.chars();
        if let Some(letter) = chars.next() {
            if let Ok(value) = chars.as_str().parse::<f64>() {
                args.insert(letter.to_ascii_uppercase(), value);
            }
        }
    }
    Some(ParsedLine { command, args })
}

/// Screens a G-code stream for hardware-damaging or limit-escaping
/// commands. Returns `Err` only for the batch-level `BATCH_TOO_LARGE`
/// rejection; every per-line problem is classified into the report
/// instead of short-circuiting the call.
pub fn validate_gcode(
    lines: &[impl AsRef<str>],
    profile: &SafetyProfile,
    mode: ValidationMode,
    context: GcodeContext,
) -> Result<ValidationReport, kiln_types::KilnError> {
    if context == GcodeContext::Interactive && lines.len() > MAX_INTERACTIVE_BATCH {
        return Err(kiln_types::KilnError::new(
            kiln_types::ErrorKind::BatchTooLarge,
            format!(
                "interactive send_gcode batch of {} exceeds the {}-command cap",
                lines.len(),
                MAX_INTERACTIVE_BATCH
            ),
        ));
    }

    let mut report = ValidationReport::default();
    let mut has_prior_m500 = false;
    let mut has_homed = false;
    let mut pending_cold_extrusion_warning = false;

    for (idx, raw) in lines.iter().enumerate() {
        let line_no = idx;
        let raw = raw.as_ref();
        let Some(parsed) = parse_line(raw) else { continue };
        let command = parsed.command.to_ascii_uppercase();

        if command == "M500" {
            has_prior_m500 = true;
        }

        if BLOCKED_ALWAYS.contains(&command.as_str()) {
            report.rejections.push(Rejection {
                line_no,
                command: command.clone(),
                reason: format!("{command} is blocked unconditionally"),
            });
            continue;
        }

        if command == "M501" && !has_prior_m500 {
            report.rejections.push(Rejection {
                line_no,
                command: command.clone(),
                reason: "M501 (restore EEPROM) without a prior M500 write in this batch".into(),
            });
            continue;
        }

        if NEGATIVE_ARG_BLOCKED.contains(&command.as_str()) {
            if let Some(&s) = parsed.args.get('S') {
                if s < 0.0 {
                    report.rejections.push(Rejection {
                        line_no,
                        command: command.clone(),
                        reason: format!("{command} with negative S argument ({s})"),
                    });
                    continue;
                }
            }
        }

        let mut blocked = false;
        match command.as_str() {
            "M104" | "M109" => {
                if let Some(&s) = parsed.args.get('S') {
                    if s > profile.max_hotend_c {
                        report.rejections.push(Rejection {
                            line_no,
                            command: command.clone(),
                            reason: format!("exceeds max hotend ({})", profile.max_hotend_c),
                        });
                        blocked = true;
                    } else if s < 150.0 {
                        pending_cold_extrusion_warning = true;
                    }
                }
            }
            "M140" | "M190" => {
                if let Some(&s) = parsed.args.get('S') {
                    if s > profile.max_bed_c {
                        report.rejections.push(Rejection {
                            line_no,
                            command: command.clone(),
                            reason: format!(
                                "bed target {s} exceeds profile max {}",
                                profile.max_bed_c
                            ),
                        });
                        blocked = true;
                    }
                }
            }
            "G28" => {
                has_homed = true;
            }
            "G0" | "G1" => {
                if let Some(&z) = parsed.args.get('Z') {
                    if z != 0.0 && !has_homed {
                        report.warnings.push(Warning {
                            line_no,
                            command: command.clone(),
                            reason: "non-zero Z move before any G28 homing".into(),
                        });
                    }
                }
                if let Some(&f) = parsed.args.get('F') {
                    if f > profile.max_feedrate_mm_min {
                        report.warnings.push(Warning {
                            line_no,
                            command: command.clone(),
                            reason: format!(
                                "feedrate {f} exceeds profile max {}",
                                profile.max_feedrate_mm_min
                            ),
                        });
                    }
                }
                if pending_cold_extrusion_warning && parsed.args.contains_key('E') {
                    report.warnings.push(Warning {
                        line_no,
                        command: command.clone(),
                        reason: "extrusion after a hotend target below 150C (cold extrusion risk)"
                            .into(),
                    });
                    pending_cold_extrusion_warning = false;
                }
            }
            _ => {}
        }
        if blocked {
            continue;
        }

        if !KNOWN_CODES.contains(&command.as_str()) {
            match mode {
                ValidationMode::Strict => {
                    report.rejections.push(Rejection {
                        line_no,
                        command: command.clone(),
                        reason: format!("unknown G/M code {command}"),
                    });
                    continue;
                }
                ValidationMode::DryRun => {
                    report.warnings.push(Warning {
                        line_no,
                        command: command.clone(),
                        reason: format!("unknown G/M code {command}"),
                    });
                }
            }
        }

        report.accepted.push(raw.to_string());
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_types::ErrorKind;

    fn profile() -> SafetyProfile {
        SafetyProfileStore::new().get("generic_fdm_pla")
    }

    #[test]
    fn bundled_lookup_hits_known_id() {
        let store = SafetyProfileStore::new();
        let p = store.get("bambu_x1c");
        assert_eq!(p.id, "bambu_x1c");
        assert_eq!(p.max_hotend_c, 300.0);
    }

    #[test]
    fn unknown_id_falls_back_to_conservative_default() {
        let store = SafetyProfileStore::new();
        let p = store.get("nonexistent_model_xyz");
        assert_eq!(p.max_hotend_c, 300.0);
        assert_eq!(p.max_bed_c, 130.0);
    }

    #[test]
    fn list_is_nonempty_and_sorted() {
        let store = SafetyProfileStore::new();
        let all = store.list();
        assert!(all.len() >= 5);
        assert!(all.windows(2).all(|w| w[0].id <= w[1].id));
    }

    #[test]
    fn blocks_m502_unconditionally() {
        let lines = vec!["M502".to_string()];
        let report =
            validate_gcode(&lines, &profile(), ValidationMode::Strict, GcodeContext::FileUpload)
                .unwrap();
        assert_eq!(report.rejections.len(), 1);
        assert_eq!(report.rejections[0].command, "M502");
    }

    #[test]
    fn m501_without_prior_m500_is_blocked() {
        let lines = vec!["M501".to_string()];
        let report =
            validate_gcode(&lines, &profile(), ValidationMode::Strict, GcodeContext::FileUpload)
                .unwrap();
        assert_eq!(report.rejections.len(), 1);
    }

    #[test]
    fn m501_after_m500_is_accepted() {
        let lines = vec!["M500".to_string(), "M501".to_string()];
        let report =
            validate_gcode(&lines, &profile(), ValidationMode::Strict, GcodeContext::FileUpload)
                .unwrap();
        assert!(report.rejections.is_empty());
        assert_eq!(report.accepted.len(), 2);
    }

    #[test]
    fn blocks_over_limit_hotend_temp() {
        let lines = vec!["M104 S999".to_string()];
        let report =
            validate_gcode(&lines, &profile(), ValidationMode::Strict, GcodeContext::FileUpload)
                .unwrap();
        assert_eq!(report.rejections.len(), 1);
        assert!(report.rejections[0].reason.contains("exceeds max hotend"));
    }

    #[test]
    fn blocks_negative_temperature_argument() {
        let lines = vec!["M140 S-10".to_string()];
        let report =
            validate_gcode(&lines, &profile(), ValidationMode::Strict, GcodeContext::FileUpload)
                .unwrap();
        assert_eq!(report.rejections.len(), 1);
        assert!(report.rejections[0].reason.contains("negative"));
    }

    #[test]
    fn warns_on_cold_extrusion() {
        let lines = vec![
            "M104 S140".to_string(),
            "G28".to_string(),
            "G1 X10 E5".to_string(),
        ];
        let report =
            validate_gcode(&lines, &profile(), ValidationMode::Strict, GcodeContext::FileUpload)
                .unwrap();
        assert!(report.warnings.iter().any(|w| w.reason.contains("cold extrusion")));
    }

    #[test]
    fn warns_on_z_move_before_homing() {
        let lines = vec!["G1 Z5".to_string()];
        let report =
            validate_gcode(&lines, &profile(), ValidationMode::Strict, GcodeContext::FileUpload)
                .unwrap();
        assert!(report.warnings.iter().any(|w| w.reason.contains("homing")));
    }

    #[test]
    fn warns_on_excess_feedrate() {
        let lines = vec!["G1 X10 F99999".to_string()];
        let report =
            validate_gcode(&lines, &profile(), ValidationMode::Strict, GcodeContext::FileUpload)
                .unwrap();
        assert!(report.warnings.iter().any(|w| w.reason.contains("feedrate")));
    }

    #[test]
    fn unknown_code_rejected_in_strict_warned_in_dry_run() {
        let lines = vec!["G5000 X1".to_string()];
        let strict =
            validate_gcode(&lines, &profile(), ValidationMode::Strict, GcodeContext::FileUpload)
                .unwrap();
        assert_eq!(strict.rejections.len(), 1);

        let dry_run =
            validate_gcode(&lines, &profile(), ValidationMode::DryRun, GcodeContext::FileUpload)
                .unwrap();
        assert!(dry_run.rejections.is_empty());
        assert_eq!(dry_run.warnings.len(), 1);
    }

    #[test]
    fn batch_cap_enforced_only_for_interactive() {
        let lines: Vec<String> = (0..150).map(|_| "G28".to_string()).collect();
        let interactive = validate_gcode(
            &lines,
            &profile(),
            ValidationMode::Strict,
            GcodeContext::Interactive,
        );
        let err = interactive.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BatchTooLarge);

        let upload =
            validate_gcode(&lines, &profile(), ValidationMode::Strict, GcodeContext::FileUpload);
        assert!(upload.is_ok());
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let lines = vec![
            "; full comment line".to_string(),
            "".to_string(),
            "G28 ; home all axes".to_string(),
        ];
        let report =
            validate_gcode(&lines, &profile(), ValidationMode::Strict, GcodeContext::FileUpload)
                .unwrap();
        assert_eq!(report.accepted.len(), 1);
        assert!(report.accepted[0].starts_with("G28"));
    }

    proptest::proptest! {
        #[test]
        fn validator_never_panics_on_arbitrary_ascii_lines(body in "[A-Za-z0-9 ;.\\-]{0,40}") {
            let lines = vec![body];
            let _ = validate_gcode(&lines, &profile(), ValidationMode::DryRun, GcodeContext::FileUpload);
        }
    }
}
