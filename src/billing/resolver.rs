use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use super::errors::ConsumptionError;
use super::ledger::order_eligible;
use super::models::Consumable;

/// key: billing-resolver -> picks the consumable a charge should hit

/// Injected at construction instead of read from global state, so tests and
/// the API layer can flip it per instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolverSettings {
    /// Operational escape hatch: treat every request as funded without
    /// touching the ledger.
    pub bypass_consumption: bool,
}

#[derive(Debug)]
pub enum Resolution {
    /// Consumption is switched off; the caller proceeds without a charge.
    Bypass,
    /// Candidates in charge order: seat/team paths first, then direct
    /// subscriptions, then plan financings, each bucket expiring-soonest
    /// first.
    Eligible(Vec<Consumable>),
}

#[derive(Clone)]
pub struct EntitlementResolver {
    pool: PgPool,
    settings: ResolverSettings,
}

impl EntitlementResolver {
    pub fn new(pool: PgPool, settings: ResolverSettings) -> Self {
        Self { pool, settings }
    }

    /// Resolve which consumables may fund one unit of `service_slug` for
    /// `user_id`. An empty result is the normal out-of-credits condition and
    /// surfaces as `NoEligibleBalance`.
    pub async fn resolve(
        &self,
        user_id: i32,
        service_slug: &str,
        now: DateTime<Utc>,
    ) -> Result<Resolution, ConsumptionError> {
        if self.settings.bypass_consumption {
            debug!(user_id, service_slug, "consumption bypass active");
            return Ok(Resolution::Bypass);
        }

        let mut candidates = Vec::new();
        for bucket in [
            self.team_pool_rows(user_id, service_slug, now).await?,
            self.per_seat_rows(user_id, service_slug, now).await?,
            self.direct_subscription_rows(user_id, service_slug, now)
                .await?,
            self.plan_financing_rows(user_id, service_slug, now).await?,
        ] {
            let mut bucket = bucket;
            order_eligible(&mut bucket);
            candidates.extend(bucket);
        }

        if candidates.is_empty() {
            return Err(ConsumptionError::NoEligibleBalance);
        }
        Ok(Resolution::Eligible(candidates))
    }

    /// Shared pool rows, visible only through an active seat on a team that
    /// consumes PER_TEAM.
    async fn team_pool_rows(
        &self,
        user_id: i32,
        service_slug: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Consumable>, ConsumptionError> {
        let rows = sqlx::query_as::<_, Consumable>(
            r#"
            SELECT c.*
            FROM consumables c
            JOIN subscription_billing_teams team ON team.id = c.subscription_billing_team_id
            JOIN subscription_seats seat ON seat.team_id = team.id
            JOIN subscriptions sub ON sub.id = team.subscription_id
            JOIN service_items si ON si.id = c.service_item_id
            JOIN services s ON s.id = si.service_id
            WHERE seat.user_id = $1
              AND seat.is_active
              AND team.consumption_strategy = 'PER_TEAM'
              AND c.user_id IS NULL
              AND sub.status IN ('ACTIVE', 'FREE_TRIAL')
              AND s.slug = $2
              AND c.how_many <> 0
              AND (c.valid_until IS NULL OR c.valid_until >= $3)
            "#,
        )
        .bind(user_id)
        .bind(service_slug)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// The seat's own rows under a PER_SEAT team.
    async fn per_seat_rows(
        &self,
        user_id: i32,
        service_slug: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Consumable>, ConsumptionError> {
        let rows = sqlx::query_as::<_, Consumable>(
            r#"
            SELECT c.*
            FROM consumables c
            JOIN subscription_seats seat ON seat.id = c.subscription_seat_id
            JOIN subscription_billing_teams team ON team.id = seat.team_id
            JOIN subscriptions sub ON sub.id = team.subscription_id
            JOIN service_items si ON si.id = c.service_item_id
            JOIN services s ON s.id = si.service_id
            WHERE seat.user_id = $1
              AND seat.is_active
              AND team.consumption_strategy = 'PER_SEAT'
              AND sub.status IN ('ACTIVE', 'FREE_TRIAL')
              AND s.slug = $2
              AND c.how_many <> 0
              AND (c.valid_until IS NULL OR c.valid_until >= $3)
            "#,
        )
        .bind(user_id)
        .bind(service_slug)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Rows funded by a subscription the user holds directly. "Pay monthly"
    /// outranks "pay in installments", so these come before financing rows.
    async fn direct_subscription_rows(
        &self,
        user_id: i32,
        service_slug: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Consumable>, ConsumptionError> {
        let rows = sqlx::query_as::<_, Consumable>(
            r#"
            SELECT c.*
            FROM consumables c
            JOIN subscriptions sub ON sub.id = c.subscription_id
            JOIN service_items si ON si.id = c.service_item_id
            JOIN services s ON s.id = si.service_id
            WHERE c.user_id = $1
              AND sub.status IN ('ACTIVE', 'FREE_TRIAL')
              AND (sub.valid_until IS NULL OR sub.valid_until >= $3)
              AND s.slug = $2
              AND c.how_many <> 0
              AND (c.valid_until IS NULL OR c.valid_until >= $3)
            "#,
        )
        .bind(user_id)
        .bind(service_slug)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn plan_financing_rows(
        &self,
        user_id: i32,
        service_slug: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Consumable>, ConsumptionError> {
        let rows = sqlx::query_as::<_, Consumable>(
            r#"
            SELECT c.*
            FROM consumables c
            JOIN plan_financings pf ON pf.id = c.plan_financing_id
            JOIN service_items si ON si.id = c.service_item_id
            JOIN services s ON s.id = si.service_id
            WHERE c.user_id = $1
              AND pf.status IN ('ACTIVE', 'FREE_TRIAL')
              AND pf.plan_expires_at >= $3
              AND s.slug = $2
              AND c.how_many <> 0
              AND (c.valid_until IS NULL OR c.valid_until >= $3)
            "#,
        )
        .bind(user_id)
        .bind(service_slug)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
