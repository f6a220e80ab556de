//! API request authentication via timestamp and hash validation
//!
//! Every protected request carries a `timestamp` (Unix epoch ms) and a
//! `hash` (SHA-256 over the canonical JSON body with the hash field zeroed,
//! concatenated with the shared secret). The shared secret lives in the
//! settings table; the special value 0 disables auth checking entirely,
//! which the test suites rely on.
//!
//! The timestamp window is asymmetric: generous toward the past (processing
//! delay) and tight toward the future (clock drift only).

use crate::{Error, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum request age in milliseconds
const MAX_PAST_MS: i64 = 1000;

/// Maximum tolerated clock drift into the future in milliseconds
const MAX_FUTURE_MS: i64 = 1;

/// Placeholder substituted for the hash field before hashing
const DUMMY_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Load the shared secret from the settings table, generating a non-zero
/// random one on first run.
pub async fn load_shared_secret(db: &SqlitePool) -> Result<i64> {
    let existing: Option<(String,)> =
        sqlx::query_as("SELECT value FROM settings WHERE key = 'api_shared_secret'")
            .fetch_optional(db)
            .await?;

    match existing {
        Some((value,)) => value
            .parse::<i64>()
            .map_err(|e| Error::Config(format!("api_shared_secret is not an i64: {}", e))),
        None => initialize_shared_secret(db).await,
    }
}

/// Generate and store a new non-zero shared secret.
pub async fn initialize_shared_secret(db: &SqlitePool) -> Result<i64> {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let secret: i64 = loop {
        let val = rng.gen::<i64>();
        if val != 0 {
            break val;
        }
    };

    sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES ('api_shared_secret', ?)")
        .bind(secret.to_string())
        .execute(db)
        .await?;

    Ok(secret)
}

/// Validate a request timestamp against the asymmetric window.
pub fn validate_timestamp(timestamp: i64) -> Result<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Internal(format!("system clock before epoch: {}", e)))?
        .as_millis() as i64;

    let diff = now - timestamp;
    if diff > MAX_PAST_MS {
        return Err(Error::PermissionDenied(format!(
            "timestamp {}ms too old (max {}ms past)",
            diff, MAX_PAST_MS
        )));
    }
    if diff < -MAX_FUTURE_MS {
        return Err(Error::PermissionDenied(format!(
            "timestamp {}ms in future (max {}ms future)",
            diff.abs(),
            MAX_FUTURE_MS
        )));
    }
    Ok(())
}

/// Calculate the request hash: SHA-256 of canonical JSON (hash field zeroed)
/// with the shared secret appended as a decimal string.
pub fn calculate_hash(json_value: &Value, shared_secret: i64) -> String {
    let mut value = json_value.clone();
    if let Some(obj) = value.as_object_mut() {
        obj.insert("hash".to_string(), Value::String(DUMMY_HASH.to_string()));
    }

    let canonical = to_canonical_json(&value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.update(shared_secret.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Canonical JSON: keys sorted alphabetically, no whitespace.
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let items: Vec<String> = pairs
                .into_iter()
                .map(|(k, v)| format!("\"{}\":{}", k, to_canonical_json(v)))
                .collect();
            format!("{{{}}}", items.join(","))
        }
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(to_canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::String(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
    }
}

/// Validate a provided request hash.
pub fn validate_hash(provided: &str, json_value: &Value, shared_secret: i64) -> Result<()> {
    let calculated = calculate_hash(json_value, shared_secret);
    if provided != calculated {
        return Err(Error::PermissionDenied("request hash mismatch".to_string()));
    }
    Ok(())
}
