//! Hierarchy Registry
//!
//! Owns courier identities, tiers, zone assignments and parent/child
//! authority links. Every privileged operation elsewhere in the hub gates
//! through [`HierarchyRegistry::authorize`] or the pure [`can_manage`]
//! predicate.

use chrono::Utc;
use opost_common::db::models::{CourierProfile, CourierStatus, CourierTier};
use opost_common::events::{EventBus, OpostEvent};
use opost_common::opcode::{zone_covers, OpCode};
use opost_common::{Error, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Authority predicate: may an actor at (`actor_tier`, `actor_zone`) perform
/// an operation requiring `required_tier` over `target_zone`?
///
/// Authority is tier-at-or-above plus zone coverage. No string-keyed role
/// lookup; this function and the tier enum are the entire permission model.
pub fn can_manage(
    actor_tier: CourierTier,
    actor_zone: &str,
    required_tier: CourierTier,
    target_zone: &str,
) -> bool {
    actor_tier >= required_tier && zone_covers(actor_zone, target_zone)
}

#[derive(Clone)]
pub struct HierarchyRegistry {
    db: SqlitePool,
    events: EventBus,
}

impl HierarchyRegistry {
    pub fn new(db: SqlitePool, events: EventBus) -> Self {
        Self { db, events }
    }

    pub async fn get(&self, courier_id: &str) -> Result<CourierProfile> {
        sqlx::query_as::<_, CourierProfile>("SELECT * FROM couriers WHERE id = ?")
            .bind(courier_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| Error::CourierNotFound(courier_id.to_string()))
    }

    /// Appoint a subordinate courier.
    ///
    /// Fails unless the actor is active, strictly higher-tier than the
    /// target, and the target zone sits inside the actor's own zone.
    pub async fn create_subordinate(
        &self,
        actor_id: &str,
        target_tier: CourierTier,
        zone_code: &str,
    ) -> Result<CourierProfile> {
        let actor = self.get(actor_id).await?;

        if actor.status != CourierStatus::Active {
            return Err(Error::PermissionDenied(format!(
                "courier {} is not active",
                actor_id
            )));
        }
        if actor.tier <= target_tier {
            return Err(Error::PermissionDenied(format!(
                "tier {:?} cannot appoint tier {:?}",
                actor.tier, target_tier
            )));
        }

        let zone = OpCode::parse(zone_code)?;
        if !zone_covers(&actor.zone_code, zone.as_str()) {
            return Err(Error::PermissionDenied(format!(
                "zone {} is outside actor zone {}",
                zone_code, actor.zone_code
            )));
        }

        let now = Utc::now();
        let profile = CourierProfile {
            id: Uuid::new_v4().to_string(),
            tier: target_tier,
            zone_code: zone.as_str().to_string(),
            parent_id: Some(actor.id.clone()),
            status: CourierStatus::Active,
            points: 0,
            created_at: now,
            updated_at: now,
        };
        self.insert(&profile).await?;

        self.events.emit_lossy(OpostEvent::CourierAppointed {
            courier_id: profile.id.clone(),
            appointed_by: actor.id,
            tier: profile.tier,
            zone_code: profile.zone_code.clone(),
            timestamp: now,
        });

        Ok(profile)
    }

    /// Bootstrap a top-tier (City) courier. Admin path only; not reachable
    /// from courier-facing routes.
    pub async fn create_root(&self, zone_code: &str) -> Result<CourierProfile> {
        let zone = OpCode::parse(zone_code)?;
        let now = Utc::now();
        let profile = CourierProfile {
            id: Uuid::new_v4().to_string(),
            tier: CourierTier::City,
            zone_code: zone.as_str().to_string(),
            parent_id: None,
            status: CourierStatus::Active,
            points: 0,
            created_at: now,
            updated_at: now,
        };
        self.insert(&profile).await?;
        Ok(profile)
    }

    async fn insert(&self, p: &CourierProfile) -> Result<()> {
        sqlx::query(
            "INSERT INTO couriers (id, tier, zone_code, parent_id, status, points, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&p.id)
        .bind(p.tier)
        .bind(&p.zone_code)
        .bind(&p.parent_id)
        .bind(p.status)
        .bind(p.points)
        .bind(p.created_at)
        .bind(p.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// The single authority predicate used by the dispatcher, lifecycle and
    /// scan processor to gate privileged operations.
    pub async fn authorize(
        &self,
        actor_id: &str,
        required_tier: CourierTier,
        zone_prefix: &str,
    ) -> Result<bool> {
        let actor = self.get(actor_id).await?;
        Ok(actor.status == CourierStatus::Active
            && can_manage(actor.tier, &actor.zone_code, required_tier, zone_prefix))
    }

    /// Narrowest active courier responsible for a location
    /// (longest-prefix-wins, ties broken toward the lower tier).
    pub async fn find_responsible(&self, op_code: &str) -> Result<Option<CourierProfile>> {
        let found = sqlx::query_as::<_, CourierProfile>(
            "SELECT * FROM couriers
             WHERE status = 'active'
               AND (? = zone_code OR ? LIKE zone_code || '-%')
             ORDER BY length(zone_code) DESC, tier ASC, created_at ASC
             LIMIT 1",
        )
        .bind(op_code)
        .bind(op_code)
        .fetch_optional(&self.db)
        .await?;
        Ok(found)
    }

    /// Narrowest active courier at exactly `tier` covering `op_code`.
    /// The dispatcher walks tiers upward through this during escalation.
    pub async fn find_at_tier(
        &self,
        op_code: &str,
        tier: CourierTier,
    ) -> Result<Option<CourierProfile>> {
        let found = sqlx::query_as::<_, CourierProfile>(
            "SELECT * FROM couriers
             WHERE status = 'active' AND tier = ?
               AND (? = zone_code OR ? LIKE zone_code || '-%')
             ORDER BY length(zone_code) DESC, created_at ASC
             LIMIT 1",
        )
        .bind(tier)
        .bind(op_code)
        .bind(op_code)
        .fetch_optional(&self.db)
        .await?;
        Ok(found)
    }

    /// Direct subordinates of a courier, authority-gated on the actor.
    pub async fn list_subordinates(&self, actor_id: &str) -> Result<Vec<CourierProfile>> {
        // Existence and activity check doubles as the permission gate:
        // couriers may always list their own children
        let actor = self.get(actor_id).await?;
        if actor.status != CourierStatus::Active {
            return Err(Error::PermissionDenied(format!(
                "courier {} is not active",
                actor_id
            )));
        }

        let children = sqlx::query_as::<_, CourierProfile>(
            "SELECT * FROM couriers WHERE parent_id = ? ORDER BY created_at ASC",
        )
        .bind(actor_id)
        .fetch_all(&self.db)
        .await?;
        Ok(children)
    }

    /// Soft-freeze a courier. Never a hard delete: historical task and audit
    /// rows keep resolving. In-flight tasks are untouched here; the
    /// escalation sweep observes the frozen status on its next tick.
    pub async fn freeze(&self, actor_id: &str, target_id: &str) -> Result<()> {
        let actor = self.get(actor_id).await?;
        let target = self.get(target_id).await?;

        if actor.status != CourierStatus::Active
            || actor.tier <= target.tier
            || !zone_covers(&actor.zone_code, &target.zone_code)
        {
            return Err(Error::PermissionDenied(format!(
                "courier {} may not freeze {}",
                actor_id, target_id
            )));
        }

        let result = sqlx::query(
            "UPDATE couriers SET status = 'frozen', updated_at = ?
             WHERE id = ? AND status != 'frozen'",
        )
        .bind(Utc::now())
        .bind(target_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() > 0 {
            self.events.emit_lossy(OpostEvent::CourierFrozen {
                courier_id: target_id.to_string(),
                frozen_by: actor_id.to_string(),
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opost_common::db::init_schema;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn registry() -> HierarchyRegistry {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        HierarchyRegistry::new(pool, EventBus::new(16))
    }

    #[test]
    fn test_can_manage_predicate() {
        use CourierTier::*;
        assert!(can_manage(City, "PKU", Zone, "PKU-A1"));
        assert!(can_manage(Zone, "PKU-A1", Zone, "PKU-A1-03"));
        assert!(!can_manage(Building, "PKU-A1-03", Zone, "PKU-A1"));
        assert!(!can_manage(City, "THU", Zone, "PKU-A1"));
    }

    #[tokio::test]
    async fn test_create_subordinate_happy_path() {
        let reg = registry().await;
        let city = reg.create_root("PKU").await.unwrap();

        let school = reg
            .create_subordinate(&city.id, CourierTier::School, "PKU")
            .await
            .unwrap();
        assert_eq!(school.tier, CourierTier::School);
        assert_eq!(school.parent_id.as_deref(), Some(city.id.as_str()));

        let zone = reg
            .create_subordinate(&school.id, CourierTier::Zone, "PKU-A1")
            .await
            .unwrap();
        assert_eq!(zone.zone_code, "PKU-A1");
    }

    #[tokio::test]
    async fn test_create_subordinate_rejects_equal_or_higher_tier() {
        let reg = registry().await;
        let city = reg.create_root("PKU").await.unwrap();
        let school = reg
            .create_subordinate(&city.id, CourierTier::School, "PKU")
            .await
            .unwrap();

        let same = reg
            .create_subordinate(&school.id, CourierTier::School, "PKU-A1")
            .await;
        assert!(matches!(same, Err(Error::PermissionDenied(_))));

        let higher = reg
            .create_subordinate(&school.id, CourierTier::City, "PKU-A1")
            .await;
        assert!(matches!(higher, Err(Error::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_create_subordinate_rejects_foreign_zone() {
        let reg = registry().await;
        let city = reg.create_root("PKU").await.unwrap();

        let outside = reg
            .create_subordinate(&city.id, CourierTier::School, "THU")
            .await;
        assert!(matches!(outside, Err(Error::PermissionDenied(_))));

        // Segment-wise: PKU does not cover PKUX
        let lookalike = reg
            .create_subordinate(&city.id, CourierTier::School, "PKUX")
            .await;
        assert!(matches!(lookalike, Err(Error::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_find_responsible_longest_prefix_wins() {
        let reg = registry().await;
        let city = reg.create_root("PKU").await.unwrap();
        let school = reg
            .create_subordinate(&city.id, CourierTier::School, "PKU")
            .await
            .unwrap();
        let zone = reg
            .create_subordinate(&school.id, CourierTier::Zone, "PKU-A1")
            .await
            .unwrap();
        let building = reg
            .create_subordinate(&zone.id, CourierTier::Building, "PKU-A1-03")
            .await
            .unwrap();

        let found = reg.find_responsible("PKU-A1-03").await.unwrap().unwrap();
        assert_eq!(found.id, building.id);

        let found = reg.find_responsible("PKU-A1-07").await.unwrap().unwrap();
        assert_eq!(found.id, zone.id);

        let found = reg.find_responsible("PKU-B9-01").await.unwrap().unwrap();
        assert_eq!(found.id, school.id);

        assert!(reg.find_responsible("THU-C1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_freeze_is_soft_and_gated() {
        let reg = registry().await;
        let city = reg.create_root("PKU").await.unwrap();
        let zone = reg
            .create_subordinate(&city.id, CourierTier::Zone, "PKU-A1")
            .await
            .unwrap();

        // Lower tier cannot freeze higher
        assert!(matches!(
            reg.freeze(&zone.id, &city.id).await,
            Err(Error::PermissionDenied(_))
        ));

        reg.freeze(&city.id, &zone.id).await.unwrap();
        let frozen = reg.get(&zone.id).await.unwrap();
        assert_eq!(frozen.status, CourierStatus::Frozen);

        // Frozen couriers stop resolving as responsible
        assert!(reg.find_responsible("PKU-A1-03").await.unwrap().map(|c| c.id) != Some(zone.id));
    }

    #[tokio::test]
    async fn test_frozen_actor_cannot_appoint() {
        let reg = registry().await;
        let city = reg.create_root("PKU").await.unwrap();
        let school = reg
            .create_subordinate(&city.id, CourierTier::School, "PKU")
            .await
            .unwrap();
        reg.freeze(&city.id, &school.id).await.unwrap();

        let denied = reg
            .create_subordinate(&school.id, CourierTier::Zone, "PKU-A1")
            .await;
        assert!(matches!(denied, Err(Error::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_authorize_checks_tier_and_zone() {
        let reg = registry().await;
        let city = reg.create_root("PKU").await.unwrap();
        let school = reg
            .create_subordinate(&city.id, CourierTier::School, "PKU")
            .await
            .unwrap();

        assert!(reg.authorize(&school.id, CourierTier::Zone, "PKU-A1").await.unwrap());
        assert!(reg.authorize(&school.id, CourierTier::School, "PKU").await.unwrap());
        assert!(!reg.authorize(&school.id, CourierTier::City, "PKU").await.unwrap());
        assert!(!reg.authorize(&school.id, CourierTier::Zone, "THU-B1").await.unwrap());
    }
}
