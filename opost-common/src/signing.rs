//! Delivery-code token generation and anti-forgery signing
//!
//! Every delivery code carries an out-of-band signature computed as
//! HMAC-SHA256 over `code ∥ issued_at_ms` keyed with a server-side secret.
//! The secret never leaves the server, so clients cannot mint codes that
//! verify. HMAC-SHA256 (rather than a bare digest over secret-concatenated
//! input) closes length-extension forgeries.
//!
//! Two token shapes exist:
//! - random 12-character alphanumeric tokens for on-demand issuance;
//! - structured `OPP-<ZONE>-<SEQ>-<CHK>` tokens for bulk-printed stock,
//!   where `<CHK>` is a mod-36 checksum catching transcription errors at
//!   print shops before any server round-trip.

use crate::{Error, Result};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use sqlx::SqlitePool;

type HmacSha256 = Hmac<Sha256>;

/// Length of randomly generated delivery-code tokens
pub const TOKEN_LEN: usize = 12;

/// Alphabet for tokens and checksums (A-Z, 0-9)
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Signs and verifies delivery codes with a server-held secret
#[derive(Clone)]
pub struct CodeSigner {
    secret: Vec<u8>,
}

impl CodeSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Generate a random fixed-length token
    pub fn generate_token(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..TOKEN_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect()
    }

    /// Sign `code` issued at `issued_at_ms` (Unix epoch milliseconds).
    /// Returns the signature as 64 lowercase hex characters.
    pub fn sign(&self, code: &str, issued_at_ms: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(code.as_bytes());
        mac.update(issued_at_ms.to_string().as_bytes());
        let bytes = mac.finalize().into_bytes();
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Verify a presented hex signature in constant time.
    ///
    /// Any malformed hex or length mismatch is a plain failure, not an error:
    /// the caller treats every non-verifying signature identically.
    pub fn verify(&self, code: &str, issued_at_ms: i64, presented: &str) -> bool {
        let Some(presented_bytes) = decode_hex(presented) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(code.as_bytes());
        mac.update(issued_at_ms.to_string().as_bytes());
        mac.verify_slice(&presented_bytes).is_ok()
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    // Byte-wise so non-ASCII input fails cleanly instead of hitting a char
    // boundary when slicing
    let bytes = s.as_bytes();
    if bytes.is_empty() || bytes.len() % 2 != 0 {
        return None;
    }
    bytes
        .chunks(2)
        .map(|pair| Some((hex_val(pair[0])? << 4) | hex_val(pair[1])?))
        .collect()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Build a structured bulk-stock token `OPP-<ZONE>-<SEQ>-<CHK>`.
///
/// `zone` may itself contain dashes (it is an OP code prefix); `seq` is
/// zero-padded to six digits.
pub fn format_structured(zone: &str, seq: u32) -> String {
    let payload = format!("OPP-{}-{:06}", zone, seq);
    let chk = checksum_char(&payload);
    format!("{}-{}", payload, chk)
}

/// Validate a structured token and return `(zone, seq)`.
pub fn parse_structured(token: &str) -> Result<(String, u32)> {
    let (payload, chk) = token
        .rsplit_once('-')
        .ok_or_else(|| Error::InvalidInput(format!("malformed structured code: {}", token)))?;
    if chk.len() != 1 || chk.chars().next() != Some(checksum_char(payload)) {
        return Err(Error::InvalidInput(format!("checksum mismatch: {}", token)));
    }
    let rest = payload
        .strip_prefix("OPP-")
        .ok_or_else(|| Error::InvalidInput(format!("missing OPP prefix: {}", token)))?;
    let (zone, seq_str) = rest
        .rsplit_once('-')
        .ok_or_else(|| Error::InvalidInput(format!("malformed structured code: {}", token)))?;
    let seq = seq_str
        .parse::<u32>()
        .map_err(|_| Error::InvalidInput(format!("bad sequence in structured code: {}", token)))?;
    Ok((zone.to_string(), seq))
}

/// Mod-36 checksum over the token alphabet
fn checksum_char(payload: &str) -> char {
    let sum: u32 = payload
        .bytes()
        .filter(|b| b.is_ascii_alphanumeric())
        .map(|b| match b {
            b'0'..=b'9' => (b - b'0') as u32,
            b'A'..=b'Z' => (b - b'A') as u32 + 10,
            _ => 0,
        })
        .sum();
    ALPHABET[(sum % 36) as usize] as char
}

/// Load the code-signing secret from the settings table, generating and
/// storing a new one on first run.
pub async fn load_signing_secret(db: &SqlitePool) -> Result<String> {
    let existing: Option<(String,)> =
        sqlx::query_as("SELECT value FROM settings WHERE key = 'code_signing_secret'")
            .fetch_optional(db)
            .await?;

    if let Some((secret,)) = existing {
        return Ok(secret);
    }

    let mut rng = rand::thread_rng();
    let secret: String = (0..64)
        .map(|_| format!("{:x}", rng.gen_range(0..16u8)))
        .collect();

    sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES ('code_signing_secret', ?)")
        .bind(&secret)
        .execute(db)
        .await?;

    Ok(secret)
}
