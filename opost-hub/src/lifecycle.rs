//! Code Lifecycle Manager
//!
//! Generates, signs, binds and advances delivery codes:
//!
//! ```text
//! unbound --bind--> bound --pickup scan--> in_transit --delivery scan--> delivered
//! unbound/bound/in_transit --TTL elapsed--> expired
//! non-terminal --signature mismatch--> invalid
//! ```
//!
//! Binding is one-time, enforced by a conditional UPDATE on status. Expiry
//! happens in a periodic sweep, never on a read path.

use chrono::{Duration, Utc};
use opost_common::db::models::DeliveryCode;
use opost_common::events::{EventBus, OpostEvent};
use opost_common::opcode::OpCodeAuthority;
use opost_common::signing::{format_structured, CodeSigner};
use opost_common::{Error, Result};
use sqlx::SqlitePool;
use tracing::warn;
use uuid::Uuid;

/// Attempts before giving up on random-token uniqueness collisions
const TOKEN_RETRIES: usize = 3;

#[derive(Clone)]
pub struct CodeLifecycle {
    db: SqlitePool,
    signer: CodeSigner,
    authority: OpCodeAuthority,
    events: EventBus,
    ttl_hours: i64,
}

/// A freshly issued code as handed to the Letter Service: the only place
/// the signature crosses the API boundary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IssuedCode {
    pub code: String,
    pub signature: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl CodeLifecycle {
    pub fn new(
        db: SqlitePool,
        signer: CodeSigner,
        authority: OpCodeAuthority,
        events: EventBus,
        ttl_hours: i64,
    ) -> Self {
        Self { db, signer, authority, events, ttl_hours }
    }

    pub async fn get_by_code(&self, code: &str) -> Result<DeliveryCode> {
        sqlx::query_as::<_, DeliveryCode>("SELECT * FROM delivery_codes WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| Error::CodeNotFound(code.to_string()))
    }

    pub async fn get_by_id(&self, id: &str) -> Result<DeliveryCode> {
        sqlx::query_as::<_, DeliveryCode>("SELECT * FROM delivery_codes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| Error::CodeNotFound(id.to_string()))
    }

    /// Issue a single signed code with a random token.
    pub async fn generate_code(
        &self,
        issuer_id: Option<&str>,
        letter_id: Option<&str>,
    ) -> Result<IssuedCode> {
        for _ in 0..TOKEN_RETRIES {
            let token = self.signer.generate_token();
            match self.insert_code(&token, issuer_id, letter_id).await {
                Ok(issued) => return Ok(issued),
                Err(Error::Database(e)) if is_unique_violation(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Internal("token space collision after retries".to_string()))
    }

    /// Issue a batch of structured `OPP-<ZONE>-<SEQ>-<CHK>` codes for
    /// bulk-printed stock. The caller gates authority over `zone`.
    pub async fn generate_batch(
        &self,
        issuer_id: &str,
        zone: &str,
        count: u32,
    ) -> Result<Vec<IssuedCode>> {
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let seq = self.next_sequence(zone).await?;
            let token = format_structured(zone, seq);
            out.push(self.insert_code(&token, Some(issuer_id), None).await?);
        }
        Ok(out)
    }

    /// Per-zone monotonically increasing sequence, allocated atomically in
    /// the settings table.
    async fn next_sequence(&self, zone: &str) -> Result<u32> {
        let key = format!("code_seq_{}", zone);
        let value: i64 = sqlx::query_scalar(
            "INSERT INTO settings (key, value) VALUES (?, '1')
             ON CONFLICT(key) DO UPDATE SET value = CAST(value AS INTEGER) + 1
             RETURNING CAST(value AS INTEGER)",
        )
        .bind(&key)
        .fetch_one(&self.db)
        .await?;
        Ok(value as u32)
    }

    async fn insert_code(
        &self,
        token: &str,
        issuer_id: Option<&str>,
        letter_id: Option<&str>,
    ) -> Result<IssuedCode> {
        let now = Utc::now();
        let issued_at_ms = now.timestamp_millis();
        let signature = self.signer.sign(token, issued_at_ms);
        let expires_at = now + Duration::hours(self.ttl_hours);
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO delivery_codes
                (id, code, signature, status, issuer_id, letter_id, issued_at_ms, expires_at)
             VALUES (?, ?, ?, 'unbound', ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(token)
        .bind(&signature)
        .bind(issuer_id)
        .bind(letter_id)
        .bind(issued_at_ms)
        .bind(expires_at)
        .execute(&self.db)
        .await?;

        self.events.emit_lossy(OpostEvent::CodeIssued {
            code_id: id,
            issuer_id: issuer_id.map(str::to_string),
            timestamp: now,
        });

        Ok(IssuedCode { code: token.to_string(), signature, expires_at })
    }

    /// Bind a code to its route. One-time: the conditional UPDATE guards on
    /// `status = 'unbound'`, so among N concurrent binders exactly one wins
    /// and the rest observe `AlreadyBound`.
    pub async fn bind(
        &self,
        code: &str,
        recipient_op_code: &str,
        sender_op_code: &str,
        letter_id: Option<&str>,
    ) -> Result<DeliveryCode> {
        let recipient = self.authority.resolve(recipient_op_code).await?;
        let sender = self.authority.resolve(sender_op_code).await?;

        let result = sqlx::query(
            "UPDATE delivery_codes
             SET status = 'bound', recipient_op_code = ?, sender_op_code = ?,
                 letter_id = COALESCE(?, letter_id), bound_at = ?
             WHERE code = ? AND status = 'unbound'",
        )
        .bind(recipient.as_str())
        .bind(sender.as_str())
        .bind(letter_id)
        .bind(Utc::now())
        .bind(code)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            // Lost the CAS or the code never existed; disambiguate for the caller
            return match self.get_by_code(code).await {
                Ok(_) => Err(Error::AlreadyBound(code.to_string())),
                Err(e) => Err(e),
            };
        }

        let bound = self.get_by_code(code).await?;
        self.events.emit_lossy(OpostEvent::CodeBound {
            code_id: bound.id.clone(),
            recipient_op_code: recipient.as_str().to_string(),
            sender_op_code: sender.as_str().to_string(),
            timestamp: Utc::now(),
        });
        Ok(bound)
    }

    /// Verify a presented signature against the server secret. Pure check;
    /// the caller decides what a failure means.
    pub fn verify_signature(&self, code: &DeliveryCode, presented: &str) -> bool {
        self.signer.verify(&code.code, code.issued_at_ms, presented)
    }

    /// Mark a code permanently invalid after a signature failure and raise
    /// the security alert. Terminal states are left untouched so status
    /// never regresses, but the alert is always emitted.
    pub async fn mark_invalid(&self, code_id: &str, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE delivery_codes SET status = 'invalid'
             WHERE id = ? AND status IN ('unbound', 'bound', 'in_transit')",
        )
        .bind(code_id)
        .execute(&self.db)
        .await?;

        warn!(code_id, reason, "security alert: delivery code invalidated");
        self.events.emit_lossy(OpostEvent::SecurityAlert {
            code_id: code_id.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Periodic expiry sweep: retire codes past their TTL that never reached
    /// a terminal state. Runs off the read paths so reads stay pure.
    pub async fn expiry_sweep(&self) -> Result<usize> {
        let expired: Vec<(String,)> = sqlx::query_as(
            "UPDATE delivery_codes SET status = 'expired'
             WHERE expires_at < ? AND status IN ('unbound', 'bound', 'in_transit')
             RETURNING id",
        )
        .bind(Utc::now())
        .fetch_all(&self.db)
        .await?;

        for (code_id,) in &expired {
            self.events.emit_lossy(OpostEvent::CodeExpired {
                code_id: code_id.clone(),
                timestamp: Utc::now(),
            });
        }
        Ok(expired.len())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opost_common::db::init_schema;
    use opost_common::db::models::CodeStatus;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn lifecycle() -> CodeLifecycle {
        // Single connection: a pooled :memory: database is per-connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        CodeLifecycle::new(
            pool,
            CodeSigner::new("test-secret"),
            OpCodeAuthority::Permissive,
            EventBus::new(64),
            72,
        )
    }

    #[tokio::test]
    async fn test_generate_and_fetch() {
        let lc = lifecycle().await;
        let issued = lc.generate_code(Some("issuer-1"), Some("letter-1")).await.unwrap();

        let row = lc.get_by_code(&issued.code).await.unwrap();
        assert_eq!(row.status, CodeStatus::Unbound);
        assert_eq!(row.signature, issued.signature);
        assert_eq!(row.scan_count, 0);
        assert!(lc.verify_signature(&row, &issued.signature));
    }

    #[tokio::test]
    async fn test_bind_is_one_time() {
        let lc = lifecycle().await;
        let issued = lc.generate_code(None, None).await.unwrap();

        let bound = lc.bind(&issued.code, "PKU-A1-03", "PKU-B2-01", None).await.unwrap();
        assert_eq!(bound.status, CodeStatus::Bound);
        assert_eq!(bound.recipient_op_code.as_deref(), Some("PKU-A1-03"));
        assert!(bound.bound_at.is_some());

        let second = lc.bind(&issued.code, "PKU-A1-04", "PKU-B2-01", None).await;
        assert!(matches!(second, Err(Error::AlreadyBound(_))));

        // First binding untouched
        let row = lc.get_by_code(&issued.code).await.unwrap();
        assert_eq!(row.recipient_op_code.as_deref(), Some("PKU-A1-03"));
    }

    #[tokio::test]
    async fn test_bind_unknown_code() {
        let lc = lifecycle().await;
        let missing = lc.bind("NOSUCHCODE1", "PKU-A1", "PKU-B2", None).await;
        assert!(matches!(missing, Err(Error::CodeNotFound(_))));
    }

    #[tokio::test]
    async fn test_bind_rejects_malformed_op_code() {
        let lc = lifecycle().await;
        let issued = lc.generate_code(None, None).await.unwrap();
        let bad = lc.bind(&issued.code, "not an opcode", "PKU-B2", None).await;
        assert!(matches!(bad, Err(Error::InvalidOpCode(_))));
    }

    #[tokio::test]
    async fn test_concurrent_bind_exactly_one_winner() {
        let lc = lifecycle().await;
        let issued = lc.generate_code(None, None).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let lc = lc.clone();
            let code = issued.code.clone();
            handles.push(tokio::spawn(async move {
                lc.bind(&code, &format!("PKU-A1-{:02}", i), "PKU-B2", None).await
            }));
        }

        let mut wins = 0;
        let mut already = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => wins += 1,
                Err(Error::AlreadyBound(_)) => already += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(already, 7);
    }

    #[tokio::test]
    async fn test_mark_invalid_never_regresses_terminal() {
        let lc = lifecycle().await;
        let issued = lc.generate_code(None, None).await.unwrap();
        let row = lc.get_by_code(&issued.code).await.unwrap();

        // Force delivered, then attempt invalidation
        sqlx::query("UPDATE delivery_codes SET status = 'delivered' WHERE id = ?")
            .bind(&row.id)
            .execute(&lc.db)
            .await
            .unwrap();

        lc.mark_invalid(&row.id, "tamper test").await.unwrap();
        let after = lc.get_by_id(&row.id).await.unwrap();
        assert_eq!(after.status, CodeStatus::Delivered);
    }

    #[tokio::test]
    async fn test_expiry_sweep_retires_overdue_codes_once() {
        let lc = lifecycle().await;
        let issued = lc.generate_code(None, None).await.unwrap();

        sqlx::query("UPDATE delivery_codes SET expires_at = ? WHERE code = ?")
            .bind(Utc::now() - Duration::hours(1))
            .bind(&issued.code)
            .execute(&lc.db)
            .await
            .unwrap();

        assert_eq!(lc.expiry_sweep().await.unwrap(), 1);
        let row = lc.get_by_code(&issued.code).await.unwrap();
        assert_eq!(row.status, CodeStatus::Expired);

        // Second sweep finds nothing; expired is terminal
        assert_eq!(lc.expiry_sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expiry_sweep_skips_delivered() {
        let lc = lifecycle().await;
        let issued = lc.generate_code(None, None).await.unwrap();

        sqlx::query(
            "UPDATE delivery_codes SET expires_at = ?, status = 'delivered' WHERE code = ?",
        )
        .bind(Utc::now() - Duration::hours(1))
        .bind(&issued.code)
        .execute(&lc.db)
        .await
        .unwrap();

        assert_eq!(lc.expiry_sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_generate_batch_structured_tokens() {
        let lc = lifecycle().await;
        let batch = lc.generate_batch("issuer-1", "PKU-A1", 3).await.unwrap();
        assert_eq!(batch.len(), 3);

        for (i, issued) in batch.iter().enumerate() {
            let (zone, seq) = opost_common::signing::parse_structured(&issued.code).unwrap();
            assert_eq!(zone, "PKU-A1");
            assert_eq!(seq as usize, i + 1);

            let row = lc.get_by_code(&issued.code).await.unwrap();
            assert!(lc.verify_signature(&row, &issued.signature));
        }
    }
}
