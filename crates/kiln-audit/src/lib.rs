//! Tamper-evident audit log sealing and verification (spec §4.9).
//!
//! Every "guarded" operation (start print, cancel print, set temperature,
//! send G-code, firmware update, payment charge, a safety-violating
//! outcome record) is sealed into a hash-chained record:
//! `H_n = HMAC(k, seq_n || H_{n-1} || fields)`. The key is supplied by the
//! caller at startup — this crate never generates or stores it.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use kiln_types::AuditRecord;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC for the chain's non-existent predecessor (seq 0).
pub const GENESIS_HMAC: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Keys whose values are replaced with a fixed placeholder before the
/// parameters digest is computed, regardless of nesting.
const DEFAULT_REDACT_KEYS: &[&str] =
    &["secret", "password", "token", "api_key", "passphrase", "authorization"];

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit HMAC key must be at least 32 bytes, got {0}")]
    KeyTooShort(usize),
}

/// Seals and verifies audit records using a fixed HMAC-SHA256 key.
#[derive(Clone)]
pub struct AuditSealer {
    key: Vec<u8>,
}

impl AuditSealer {
    /// `key` must be at least 32 bytes. The core panics at startup if no
    /// key is configured (spec §9) — this constructor only enforces
    /// length, since the caller already guaranteed presence.
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self, AuditError> {
        let key = key.into();
        if key.len() < 32 {
            return Err(AuditError::KeyTooShort(key.len()));
        }
        Ok(Self { key })
    }

    /// SHA-256 of the canonical (key-sorted) JSON of `params`, with any
    /// object key in `DEFAULT_REDACT_KEYS` replaced by a placeholder
    /// before hashing, returned as lowercase hex.
    pub fn digest_params(&self, params: &serde_json::Value) -> String {
        let redacted = redact(params.clone());
        let canonical = serde_json::to_string(&redacted).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn mac_over(&self, seq: u64, prev_hmac: &str, fields: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(seq.to_be_bytes().as_slice());
        mac.update(prev_hmac.as_bytes());
        mac.update(fields.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn fields_string(
        timestamp: DateTime<Utc>,
        actor_id: &str,
        tool_name: &str,
        parameters_digest: &str,
        result_kind: &str,
    ) -> String {
        format!(
            "{}|{actor_id}|{tool_name}|{parameters_digest}|{result_kind}",
            timestamp.to_rfc3339()
        )
    }

    /// Seals a new record at position `seq`, chained to `prev_hmac` (use
    /// [`GENESIS_HMAC`] for `seq == 0`).
    #[allow(clippy::too_many_arguments)]
    pub fn seal(
        &self,
        seq: u64,
        prev_hmac: &str,
        timestamp: DateTime<Utc>,
        actor_id: &str,
        tool_name: &str,
        parameters_digest: &str,
        result_kind: &str,
    ) -> AuditRecord {
        let fields =
            Self::fields_string(timestamp, actor_id, tool_name, parameters_digest, result_kind);
        let hmac = self.mac_over(seq, prev_hmac, &fields);
        AuditRecord {
            seq,
            timestamp,
            actor_id: actor_id.to_string(),
            tool_name: tool_name.to_string(),
            parameters_digest: parameters_digest.to_string(),
            result_kind: result_kind.to_string(),
            hmac,
            prev_hmac: prev_hmac.to_string(),
        }
    }

    /// Recomputes `record.hmac` from its own fields and compares.
    pub fn verify_record(&self, record: &AuditRecord) -> bool {
        let fields = Self::fields_string(
            record.timestamp,
            &record.actor_id,
            &record.tool_name,
            &record.parameters_digest,
            &record.result_kind,
        );
        let expected = self.mac_over(record.seq, &record.prev_hmac, &fields);
        expected == record.hmac
    }
}

/// Result of replaying the full chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    pub ok: bool,
    pub broken_at: Option<u64>,
}

/// Replays `records` (assumed ordered by `seq` ascending) and reports the
/// `seq` of the first broken link, including a chain-linkage break (a
/// record's `prev_hmac` not matching its predecessor's `hmac`).
pub fn verify_chain(sealer: &AuditSealer, records: &[AuditRecord]) -> VerifyResult {
    let mut expected_prev = GENESIS_HMAC.to_string();
    for record in records {
        if record.prev_hmac != expected_prev || !sealer.verify_record(record) {
            return VerifyResult { ok: false, broken_at: Some(record.seq) };
        }
        expected_prev = record.hmac.clone();
    }
    VerifyResult { ok: true, broken_at: None }
}

fn redact(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let redacted = map
                .into_iter()
                .map(|(k, v)| {
                    if DEFAULT_REDACT_KEYS.contains(&k.to_ascii_lowercase().as_str()) {
                        (k, serde_json::Value::String("[REDACTED]".to_string()))
                    } else {
                        (k, redact(v))
                    }
                })
                .collect();
            serde_json::Value::Object(redacted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(redact).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sealer() -> AuditSealer {
        AuditSealer::new(vec![7u8; 32]).unwrap()
    }

    #[test]
    fn rejects_short_keys() {
        let err = AuditSealer::new(vec![1u8; 16]).unwrap_err();
        assert!(matches!(err, AuditError::KeyTooShort(16)));
    }

    #[test]
    fn digest_redacts_secret_fields_recursively() {
        let s = sealer();
        let a = s.digest_params(&json!({"url": "https://x", "secret": "abc123"}));
        let b = s.digest_params(&json!({"url": "https://x", "secret": "def456"}));
        assert_eq!(a, b, "digest must be identical once secrets are redacted");

        let nested = s.digest_params(&json!({"auth": {"token": "t1"}}));
        let nested2 = s.digest_params(&json!({"auth": {"token": "t2"}}));
        assert_eq!(nested, nested2);
    }

    #[test]
    fn digest_differs_for_non_secret_changes() {
        let s = sealer();
        let a = s.digest_params(&json!({"hotend_c": 200}));
        let b = s.digest_params(&json!({"hotend_c": 210}));
        assert_ne!(a, b);
    }

    #[test]
    fn seal_then_verify_single_record() {
        let s = sealer();
        let rec = s.seal(
            0,
            GENESIS_HMAC,
            Utc::now(),
            "agent-1",
            "start_print",
            "deadbeef",
            "ACCEPTED",
        );
        assert!(s.verify_record(&rec));
    }

    #[test]
    fn chain_of_three_verifies_clean() {
        let s = sealer();
        let r0 = s.seal(0, GENESIS_HMAC, Utc::now(), "a", "t1", "d1", "OK");
        let r1 = s.seal(1, &r0.hmac, Utc::now(), "a", "t2", "d2", "OK");
        let r2 = s.seal(2, &r1.hmac, Utc::now(), "a", "t3", "d3", "OK");
        let result = verify_chain(&s, &[r0, r1, r2]);
        assert_eq!(result, VerifyResult { ok: true, broken_at: None });
    }

    #[test]
    fn tampering_with_a_field_breaks_the_chain_from_that_point() {
        let s = sealer();
        let r0 = s.seal(0, GENESIS_HMAC, Utc::now(), "a", "t1", "d1", "OK");
        let r1 = s.seal(1, &r0.hmac, Utc::now(), "a", "t2", "d2", "OK");
        let mut tampered_r1 = r1.clone();
        tampered_r1.result_kind = "TAMPERED".to_string();
        let r2 = s.seal(2, &r1.hmac, Utc::now(), "a", "t3", "d3", "OK");

        let result = verify_chain(&s, &[r0, tampered_r1, r2]);
        assert!(!result.ok);
        assert_eq!(result.broken_at, Some(1));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let s1 = AuditSealer::new(vec![1u8; 32]).unwrap();
        let s2 = AuditSealer::new(vec![2u8; 32]).unwrap();
        let rec = s1.seal(0, GENESIS_HMAC, Utc::now(), "a", "t", "d", "OK");
        assert!(!s2.verify_record(&rec));
    }
}
