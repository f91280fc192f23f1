//! Append-only compliance audit stream. Writes JSON Lines (one record per
//! line), canonicalized so a byte-level diff of two logs is meaningful.
//!
//! Every request state transition (start, complete, fail, retry), every
//! arbiter acquire/release, and every side-effect writer step is recorded
//! here. Optional hash chain: each record can carry hash_prev + hash_self so
//! tampering with history is detectable via [`verify_hash_chain`].
//!
//! Retention of the log file itself is an operator concern; the writer never
//! prunes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ComplianceStatus
// ---------------------------------------------------------------------------

/// Regulatory disposition of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComplianceStatus {
    #[serde(rename = "COMPLIANT")]
    Compliant,
    #[serde(rename = "NON_COMPLIANT")]
    NonCompliant,
    #[serde(rename = "REVIEW_REQUIRED")]
    ReviewRequired,
}

// ---------------------------------------------------------------------------
// AuditRecord
// ---------------------------------------------------------------------------

/// One audited action. `details` is free-form structured context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub record_id: Uuid,
    pub ts_utc: DateTime<Utc>,
    pub action: String,
    pub user_id: String,
    pub request_id: String,
    pub compliance_status: ComplianceStatus,
    pub details: Value,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

/// Append-only audit writer. Creates parent directories on construction.
pub struct AuditLog {
    path: PathBuf,
    hash_chain: bool,
    last_hash: Option<String>,
}

impl AuditLog {
    pub fn new(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {:?}", parent))?;
        }

        Ok(Self {
            path,
            hash_chain,
            last_hash: None,
        })
    }

    /// Restore chain state after reopening an existing log (e.g. on worker
    /// restart, set this to the last line's hash_self).
    pub fn set_last_hash(&mut self, last_hash: Option<String>) {
        self.last_hash = last_hash;
    }

    pub fn last_hash(&self) -> Option<String> {
        self.last_hash.clone()
    }

    /// Append one record.
    pub fn append(
        &mut self,
        action: &str,
        user_id: &str,
        request_id: &str,
        compliance_status: ComplianceStatus,
        details: Value,
    ) -> Result<AuditRecord> {
        let mut rec = AuditRecord {
            record_id: Uuid::new_v4(),
            ts_utc: Utc::now(),
            action: action.to_string(),
            user_id: user_id.to_string(),
            request_id: request_id.to_string(),
            compliance_status,
            details,
            hash_prev: None,
            hash_self: None,
        };

        if self.hash_chain {
            rec.hash_prev = self.last_hash.clone();
            let self_hash = compute_record_hash(&rec)?;
            rec.hash_self = Some(self_hash.clone());
            self.last_hash = Some(self_hash);
        }

        let line = canonical_json_line(&rec)?;
        append_line(&self.path, &line)?;

        Ok(rec)
    }
}

/// Write a single line to file (with trailing newline).
fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open audit log {:?}", path))?;
    f.write_all(line.as_bytes())
        .context("write audit line failed")?;
    f.write_all(b"\n").context("write newline failed")?;
    Ok(())
}

/// Canonicalize by sorting keys recursively and emitting compact JSON.
/// One record == one JSON line.
fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize audit record failed")?;
    let sorted = sort_keys(&raw);
    serde_json::to_string(&sorted).context("json stringify failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// The chain hash covers the canonical record WITHOUT hash_self (to avoid
/// self-reference).
pub fn compute_record_hash(rec: &AuditRecord) -> Result<String> {
    let mut clone = rec.clone();
    clone.hash_self = None;

    let canonical = canonical_json_line(&clone)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Result of hash chain verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { lines: usize },
    Broken { line: usize, reason: String },
}

/// Verify the hash chain integrity of an audit log file.
pub fn verify_hash_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read audit log {:?}", path.as_ref()))?;
    verify_hash_chain_str(&content)
}

/// Same as [`verify_hash_chain`] but over in-memory JSONL content.
pub fn verify_hash_chain_str(content: &str) -> Result<VerifyResult> {
    let mut prev_hash: Option<String> = None;
    let mut line_count = 0usize;

    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let rec: AuditRecord = serde_json::from_str(trimmed)
            .with_context(|| format!("parse audit record at line {}", i + 1))?;

        line_count += 1;

        if rec.hash_prev != prev_hash {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!(
                    "hash_prev mismatch: expected {:?}, got {:?}",
                    prev_hash, rec.hash_prev
                ),
            });
        }

        if let Some(ref claimed) = rec.hash_self {
            let recomputed = compute_record_hash(&rec)?;
            if *claimed != recomputed {
                return Ok(VerifyResult::Broken {
                    line: i + 1,
                    reason: format!("hash_self mismatch: claimed {}, recomputed {}", claimed, recomputed),
                });
            }
        }

        prev_hash = rec.hash_self.clone();
    }

    Ok(VerifyResult::Valid { lines: line_count })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chain_survives_a_clean_append_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let mut log = AuditLog::new(&path, true).unwrap();
        log.append(
            "inference_request_start",
            "user-1",
            "req-1",
            ComplianceStatus::Compliant,
            json!({"priority": 5}),
        )
        .unwrap();
        log.append(
            "inference_request_complete",
            "user-1",
            "req-1",
            ComplianceStatus::ReviewRequired,
            json!({"confidence_score": 0.6}),
        )
        .unwrap();

        match verify_hash_chain(&path).unwrap() {
            VerifyResult::Valid { lines } => assert_eq!(lines, 2),
            VerifyResult::Broken { line, reason } => {
                panic!("chain broken at line {line}: {reason}")
            }
        }
    }

    #[test]
    fn tampered_line_breaks_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let mut log = AuditLog::new(&path, true).unwrap();
        for i in 0..3 {
            log.append(
                "gpu_acquired",
                "system",
                &format!("req-{i}"),
                ComplianceStatus::Compliant,
                json!({}),
            )
            .unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let tampered = content.replacen("req-1", "req-X", 1);

        match verify_hash_chain_str(&tampered).unwrap() {
            VerifyResult::Broken { line, .. } => assert_eq!(line, 2),
            VerifyResult::Valid { .. } => panic!("tampering must break the chain"),
        }
    }

    #[test]
    fn unchained_log_verifies_as_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let mut log = AuditLog::new(&path, false).unwrap();
        log.append(
            "worker_start",
            "system",
            "worker_startup",
            ComplianceStatus::Compliant,
            json!({"poll_interval": 2}),
        )
        .unwrap();

        assert_eq!(
            verify_hash_chain(&path).unwrap(),
            VerifyResult::Valid { lines: 1 }
        );
    }

    #[test]
    fn status_serializes_to_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&ComplianceStatus::ReviewRequired).unwrap(),
            "\"REVIEW_REQUIRED\""
        );
    }
}
