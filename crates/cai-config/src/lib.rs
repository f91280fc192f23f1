//! Worker and daemon configuration.
//!
//! Config is layered YAML: files are deep-merged in order (later overrides
//! earlier), canonicalized to key-sorted compact JSON, and hashed so a boot
//! can log exactly which configuration it runs under. The typed
//! [`WorkerConfig`] is extracted from the merged tree; every key has the
//! documented default, so an empty file set is a valid configuration.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

// ---------------------------------------------------------------------------
// Layered load
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Load and merge YAML files in order, then canonicalize and hash.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        merge_value(&mut merged, json_val);
    }

    let canonical = canonical_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

/// Deep-merge: objects merge recursively; arrays and scalars are replaced.
fn merge_value(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(slot) => merge_value(slot, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

/// Compact JSON with all object keys sorted recursively. Stable across
/// serde_json's insertion-ordered maps, so the hash is load-order free.
pub fn canonical_json(v: &Value) -> String {
    fn sorted(v: &Value) -> Value {
        match v {
            Value::Object(map) => {
                let mut keys: Vec<_> = map.keys().cloned().collect();
                keys.sort();
                let mut out = serde_json::Map::new();
                for k in keys {
                    out.insert(k.clone(), sorted(&map[&k]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            _ => v.clone(),
        }
    }
    serde_json::to_string(&sorted(v)).expect("json serialization must not fail")
}

// ---------------------------------------------------------------------------
// LogLevel
// ---------------------------------------------------------------------------

/// Operator-facing log level. The names follow the five conventional
/// severities; `as_env_filter` maps them onto tracing's directive syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            other => Err(anyhow!("invalid log level: {}", other)),
        }
    }

    /// tracing has no CRITICAL; it collapses onto ERROR.
    pub fn as_env_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerConfig
// ---------------------------------------------------------------------------

/// Backend (LLM service) settings, passed verbatim to the inference adapter.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// OpenAI-compatible base URL of the local model server.
    pub base_url: String,
    pub chat_model: String,
    pub vision_model: String,
    /// Hard per-call timeout in seconds.
    pub timeout_secs: u64,
}

/// The worker's operational knobs. Field-per-key of the documented
/// configuration surface; defaults are the documented defaults.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between empty polls, seconds.
    pub poll_interval_secs: u64,
    /// Bounded retry count per request (attempts = retries + 1).
    pub max_queue_retries: u32,
    /// Arbiter acquisition deadline, seconds.
    pub gpu_timeout_secs: u64,
    /// Max wait for the in-flight request on shutdown, seconds.
    pub graceful_shutdown_timeout_secs: u64,
    /// Age above which terminal queue rows are purged, days.
    pub retention_days: i64,
    /// Compliance audit JSONL destination.
    pub audit_log_path: String,
    pub backend: BackendConfig,
    pub log_level: LogLevel,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            max_queue_retries: 3,
            gpu_timeout_secs: 300,
            graceful_shutdown_timeout_secs: 30,
            retention_days: 7,
            audit_log_path: "./artifacts/compliance_audit.jsonl".to_string(),
            backend: BackendConfig {
                base_url: "http://localhost:11434/v1".to_string(),
                chat_model: "gpt-oss".to_string(),
                vision_model: "llama3.2-vision:11b".to_string(),
                timeout_secs: 180,
            },
            log_level: LogLevel::Info,
        }
    }
}

fn cfg_u64(v: &Value, ptr: &str) -> Option<u64> {
    v.pointer(ptr).and_then(|x| x.as_u64())
}

fn cfg_i64(v: &Value, ptr: &str) -> Option<i64> {
    v.pointer(ptr).and_then(|x| x.as_i64())
}

fn cfg_str<'a>(v: &'a Value, ptr: &str) -> Option<&'a str> {
    v.pointer(ptr).and_then(|x| x.as_str())
}

impl WorkerConfig {
    /// Extract the typed config from a merged tree. Missing keys take their
    /// defaults; present-but-malformed keys are an error, not a fallback.
    pub fn from_value(v: &Value) -> Result<Self> {
        let d = WorkerConfig::default();

        let log_level = match cfg_str(v, "/service/log_level") {
            Some(s) => LogLevel::parse(s)?,
            None => d.log_level,
        };

        let retention_days = cfg_i64(v, "/service/retention_days").unwrap_or(d.retention_days);
        if retention_days <= 0 {
            return Err(anyhow!(
                "service.retention_days must be > 0, got {retention_days}"
            ));
        }

        Ok(Self {
            poll_interval_secs: cfg_u64(v, "/service/poll_interval").unwrap_or(d.poll_interval_secs),
            max_queue_retries: cfg_u64(v, "/service/max_queue_retries")
                .map(|n| n as u32)
                .unwrap_or(d.max_queue_retries),
            gpu_timeout_secs: cfg_u64(v, "/service/gpu_timeout").unwrap_or(d.gpu_timeout_secs),
            graceful_shutdown_timeout_secs: cfg_u64(v, "/service/graceful_shutdown_timeout")
                .unwrap_or(d.graceful_shutdown_timeout_secs),
            retention_days,
            audit_log_path: cfg_str(v, "/service/audit_log_path")
                .unwrap_or(&d.audit_log_path)
                .to_string(),
            backend: BackendConfig {
                base_url: cfg_str(v, "/backend/base_url")
                    .unwrap_or(&d.backend.base_url)
                    .to_string(),
                chat_model: cfg_str(v, "/backend/chat_model")
                    .unwrap_or(&d.backend.chat_model)
                    .to_string(),
                vision_model: cfg_str(v, "/backend/vision_model")
                    .unwrap_or(&d.backend.vision_model)
                    .to_string(),
                timeout_secs: cfg_u64(v, "/backend/backend_timeout")
                    .unwrap_or(d.backend.timeout_secs),
            },
            log_level,
        })
    }

    /// Load layered YAML files and extract the typed worker config.
    pub fn load(paths: &[&str]) -> Result<(Self, LoadedConfig)> {
        let loaded = load_layered_yaml(paths)?;
        let cfg = Self::from_value(&loaded.config_json)?;
        Ok((cfg, loaded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_tree_yields_documented_defaults() {
        let cfg = WorkerConfig::from_value(&serde_json::json!({})).unwrap();
        assert_eq!(cfg.poll_interval_secs, 2);
        assert_eq!(cfg.max_queue_retries, 3);
        assert_eq!(cfg.gpu_timeout_secs, 300);
        assert_eq!(cfg.graceful_shutdown_timeout_secs, 30);
        assert_eq!(cfg.retention_days, 7);
        assert_eq!(cfg.backend.timeout_secs, 180);
        assert_eq!(cfg.log_level, LogLevel::Info);
    }

    #[test]
    fn later_layer_overrides_earlier_scalar() {
        let mut base = tempfile::NamedTempFile::new().unwrap();
        writeln!(base, "service:\n  poll_interval: 5\n  max_queue_retries: 1").unwrap();
        let mut over = tempfile::NamedTempFile::new().unwrap();
        writeln!(over, "service:\n  poll_interval: 9").unwrap();

        let base_path = base.path().to_str().unwrap().to_string();
        let over_path = over.path().to_str().unwrap().to_string();
        let (cfg, _) = WorkerConfig::load(&[&base_path, &over_path]).unwrap();

        // Override wins for the touched key; sibling keys survive the merge.
        assert_eq!(cfg.poll_interval_secs, 9);
        assert_eq!(cfg.max_queue_retries, 1);
    }

    #[test]
    fn config_hash_is_stable_under_key_order() {
        let a = serde_json::json!({"service": {"poll_interval": 2, "gpu_timeout": 300}});
        let b = serde_json::json!({"service": {"gpu_timeout": 300, "poll_interval": 2}});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn bad_log_level_is_an_error_not_a_fallback() {
        let v = serde_json::json!({"service": {"log_level": "VERBOSE"}});
        assert!(WorkerConfig::from_value(&v).is_err());
    }

    #[test]
    fn critical_maps_onto_tracing_error() {
        assert_eq!(LogLevel::parse("critical").unwrap(), LogLevel::Critical);
        assert_eq!(LogLevel::Critical.as_env_filter(), "error");
    }

    #[test]
    fn zero_retention_is_rejected() {
        let v = serde_json::json!({"service": {"retention_days": 0}});
        assert!(WorkerConfig::from_value(&v).is_err());
    }
}
