use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Months, Utc};
use sqlx::{FromRow, PgPool};
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config;

use super::events::{BillingEvent, BillingEventBus};
use super::models::{
    ConsumptionStrategy, FundingRef, PlanFinancing, Subscription, SubscriptionBillingTeam,
    SubscriptionSeat,
};
use super::recharge::period_start;

/// key: billing-stock-scheduler -> keep stock in step with billing cycles
pub fn spawn(pool: PgPool) {
    let interval = TokioDuration::from_secs(*config::STOCK_SCAN_INTERVAL_SECS);
    let horizon = Duration::hours(*config::STOCK_KEEPALIVE_HOURS);

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if let Err(err) = process_tick(&pool, now, horizon).await {
                warn!(?err, "stock replenishment tick failed");
            }
        }
    });
}

#[derive(Debug, FromRow)]
struct KeepAliveCandidate {
    id: Uuid,
    valid_until: Option<DateTime<Utc>>,
    next_payment_at: DateTime<Utc>,
}

/// key: billing-stock-scheduler -> tick handler
///
/// Stock is issued with `valid_until == next_payment_at`, so a lapsed window
/// normally means the renewal job is running late and the due date itself is
/// already behind us. Sources no more than `horizon` past their due date get
/// a short keep-alive so the late renewal never interrupts service; anything
/// longer overdue is left to lapse. Running twice in the same window is a
/// no-op after the first extension.
pub async fn process_tick(pool: &PgPool, now: DateTime<Utc>, horizon: Duration) -> Result<()> {
    let overdue_cutoff = now - horizon;
    let candidates = sqlx::query_as::<_, KeepAliveCandidate>(
        r#"
        SELECT sched.id, sched.valid_until, sub.next_payment_at
        FROM service_stock_schedulers sched
        JOIN subscriptions sub ON sub.id = sched.subscription_id
        WHERE sched.valid_until IS NOT NULL
          AND sched.valid_until < $1
          AND sub.next_payment_at > $2
          AND sub.status NOT IN ('CANCELLED', 'DEPRECATED', 'PAYMENT_ISSUE')
        "#,
    )
    .bind(now)
    .bind(overdue_cutoff)
    .fetch_all(pool)
    .await?;

    let financing_candidates = sqlx::query_as::<_, KeepAliveCandidate>(
        r#"
        SELECT sched.id, sched.valid_until, pf.next_payment_at
        FROM service_stock_schedulers sched
        JOIN plan_financings pf ON pf.id = sched.plan_financing_id
        WHERE sched.valid_until IS NOT NULL
          AND sched.valid_until < $1
          AND pf.next_payment_at > $2
          AND pf.plan_expires_at > $1
          AND pf.status NOT IN ('CANCELLED', 'DEPRECATED', 'PAYMENT_ISSUE')
        "#,
    )
    .bind(now)
    .bind(overdue_cutoff)
    .fetch_all(pool)
    .await?;

    for candidate in candidates.into_iter().chain(financing_candidates) {
        extend_scheduler(pool, &candidate, now, horizon).await?;
    }

    Ok(())
}

async fn extend_scheduler(
    pool: &PgPool,
    candidate: &KeepAliveCandidate,
    now: DateTime<Utc>,
    horizon: Duration,
) -> Result<()> {
    // A due date still ahead caps the extension; one already behind is the
    // late-renewal case the keep-alive exists for.
    let new_until = if candidate.next_payment_at > now {
        (now + horizon).min(candidate.next_payment_at)
    } else {
        now + horizon
    };

    // Safety invariant: the scheduler's window and its consumables' windows
    // move together. A drifted row points at a bug elsewhere.
    let drifted: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM consumables \
         WHERE stock_scheduler_id = $1 AND valid_until IS DISTINCT FROM $2",
    )
    .bind(candidate.id)
    .bind(candidate.valid_until)
    .fetch_one(pool)
    .await?;
    if drifted > 0 {
        warn!(
            scheduler = %candidate.id,
            drifted,
            "consumable windows drifted from their stock scheduler"
        );
    }

    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE service_stock_schedulers SET valid_until = $2 WHERE id = $1")
        .bind(candidate.id)
        .bind(new_until)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE consumables SET valid_until = $2 WHERE stock_scheduler_id = $1")
        .bind(candidate.id)
        .bind(new_until)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    info!(
        scheduler = %candidate.id,
        %new_until,
        "extended stock ahead of renewal"
    );
    Ok(())
}

#[derive(Debug, FromRow)]
struct PlanCatalogEntry {
    service_item_id: Uuid,
    unit_type: String,
    how_many: i64,
    is_team_allowed: bool,
    max_team_members: Option<i32>,
}

async fn plan_catalog(pool: &PgPool, plan_id: Uuid) -> Result<Vec<PlanCatalogEntry>> {
    let entries = sqlx::query_as::<_, PlanCatalogEntry>(
        r#"
        SELECT si.id AS service_item_id, si.unit_type, si.how_many,
               s.is_team_allowed, s.max_team_members
        FROM plan_service_items psi
        JOIN service_items si ON si.id = psi.service_item_id
        JOIN services s ON s.id = si.service_id
        WHERE psi.plan_id = $1
        "#,
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await?;
    Ok(entries)
}

/// key: billing-stock-build -> one consumable per catalog entry
///
/// Runs at purchase and again at every renewal retry, so each step looks up
/// the existing link before inserting.
pub async fn build_from_subscription(
    pool: &PgPool,
    bus: &BillingEventBus,
    subscription_id: Uuid,
    now: DateTime<Utc>,
) -> Result<()> {
    let sub = sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
        .bind(subscription_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| anyhow!("subscription {subscription_id} not found"))?;
    if !sub.is_usable(now) {
        warn!(%subscription_id, status = %sub.status, "skipping stock build for unusable subscription");
        return Ok(());
    }

    let team = sqlx::query_as::<_, SubscriptionBillingTeam>(
        "SELECT * FROM subscription_billing_teams WHERE subscription_id = $1",
    )
    .bind(subscription_id)
    .fetch_optional(pool)
    .await?;

    let valid_until = sub.next_payment_at;
    for entry in plan_catalog(pool, sub.plan_id).await? {
        match (&team, entry.is_team_allowed) {
            (Some(team), true) => match team.strategy() {
                ConsumptionStrategy::PerTeam => {
                    let scheduler_id = ensure_scheduler(
                        pool,
                        Some(subscription_id),
                        None,
                        entry.service_item_id,
                        None,
                        valid_until,
                    )
                    .await?;
                    ensure_consumable(
                        pool,
                        bus,
                        scheduler_id,
                        &entry,
                        None,
                        FundingRef::TeamPool(team.id),
                        valid_until,
                    )
                    .await?;
                }
                ConsumptionStrategy::PerSeat => {
                    let mut seats = claimed_seats(pool, team.id).await?;
                    if let Some(limit) = entry.max_team_members {
                        seats.truncate(limit as usize);
                    }
                    for seat in seats {
                        let scheduler_id = ensure_scheduler(
                            pool,
                            Some(subscription_id),
                            None,
                            entry.service_item_id,
                            Some(seat.id),
                            valid_until,
                        )
                        .await?;
                        ensure_consumable(
                            pool,
                            bus,
                            scheduler_id,
                            &entry,
                            seat.user_id,
                            FundingRef::Seat(seat.id),
                            valid_until,
                        )
                        .await?;
                    }
                }
            },
            _ => {
                let scheduler_id = ensure_scheduler(
                    pool,
                    Some(subscription_id),
                    None,
                    entry.service_item_id,
                    None,
                    valid_until,
                )
                .await?;
                ensure_consumable(
                    pool,
                    bus,
                    scheduler_id,
                    &entry,
                    Some(sub.user_id),
                    FundingRef::Subscription(subscription_id),
                    valid_until,
                )
                .await?;
            }
        }
    }
    Ok(())
}

pub async fn build_from_plan_financing(
    pool: &PgPool,
    bus: &BillingEventBus,
    plan_financing_id: Uuid,
    now: DateTime<Utc>,
) -> Result<()> {
    let pf = sqlx::query_as::<_, PlanFinancing>("SELECT * FROM plan_financings WHERE id = $1")
        .bind(plan_financing_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| anyhow!("plan financing {plan_financing_id} not found"))?;
    if !pf.is_usable(now) {
        warn!(%plan_financing_id, status = %pf.status, "skipping stock build for unusable plan financing");
        return Ok(());
    }

    // Installment plans never carry billing teams; stock is always personal.
    let valid_until = pf.next_payment_at.min(pf.plan_expires_at);
    for entry in plan_catalog(pool, pf.plan_id).await? {
        let scheduler_id = ensure_scheduler(
            pool,
            None,
            Some(plan_financing_id),
            entry.service_item_id,
            None,
            valid_until,
        )
        .await?;
        ensure_consumable(
            pool,
            bus,
            scheduler_id,
            &entry,
            Some(pf.user_id),
            FundingRef::PlanFinancing(plan_financing_id),
            valid_until,
        )
        .await?;
    }
    Ok(())
}

/// key: billing-renewal -> advance the cycle and reissue stock
pub async fn renew_subscription(
    pool: &PgPool,
    bus: &BillingEventBus,
    subscription_id: Uuid,
    now: DateTime<Utc>,
) -> Result<()> {
    let sub = sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
        .bind(subscription_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| anyhow!("subscription {subscription_id} not found"))?;
    if !sub.is_usable(now) {
        warn!(%subscription_id, status = %sub.status, "not renewing unusable subscription");
        return Ok(());
    }

    if sub.next_payment_at <= now {
        let next = period_start(sub.paid_at, now)
            .checked_add_months(Months::new(1))
            .unwrap_or(sub.next_payment_at);
        sqlx::query(
            "UPDATE subscriptions SET next_payment_at = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(subscription_id)
        .bind(next)
        .execute(pool)
        .await?;
        debug!(%subscription_id, %next, "advanced subscription billing anchor");
    }

    build_from_subscription(pool, bus, subscription_id, now).await
}

async fn claimed_seats(pool: &PgPool, team_id: Uuid) -> Result<Vec<SubscriptionSeat>> {
    let seats = sqlx::query_as::<_, SubscriptionSeat>(
        "SELECT * FROM subscription_seats \
         WHERE team_id = $1 AND is_active AND user_id IS NOT NULL ORDER BY email",
    )
    .bind(team_id)
    .fetch_all(pool)
    .await?;
    Ok(seats)
}

async fn ensure_scheduler(
    pool: &PgPool,
    subscription_id: Option<Uuid>,
    plan_financing_id: Option<Uuid>,
    service_item_id: Uuid,
    seat_id: Option<Uuid>,
    valid_until: DateTime<Utc>,
) -> Result<Uuid> {
    let existing: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT id FROM service_stock_schedulers
        WHERE subscription_id IS NOT DISTINCT FROM $1
          AND plan_financing_id IS NOT DISTINCT FROM $2
          AND service_item_id = $3
          AND seat_id IS NOT DISTINCT FROM $4
        "#,
    )
    .bind(subscription_id)
    .bind(plan_financing_id)
    .bind(service_item_id)
    .bind(seat_id)
    .fetch_optional(pool)
    .await?;

    if let Some(id) = existing {
        return Ok(id);
    }

    let id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO service_stock_schedulers (
            id, subscription_id, plan_financing_id, service_item_id, seat_id, valid_until
        ) VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(subscription_id)
    .bind(plan_financing_id)
    .bind(service_item_id)
    .bind(seat_id)
    .bind(valid_until)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

async fn ensure_consumable(
    pool: &PgPool,
    bus: &BillingEventBus,
    scheduler_id: Uuid,
    entry: &PlanCatalogEntry,
    user_id: Option<i32>,
    funding: FundingRef,
    valid_until: DateTime<Utc>,
) -> Result<()> {
    let live: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM consumables \
         WHERE stock_scheduler_id = $1 AND how_many <> 0 \
           AND (valid_until IS NULL OR valid_until >= NOW())",
    )
    .bind(scheduler_id)
    .fetch_optional(pool)
    .await?;
    if live.is_some() {
        return Ok(());
    }

    let (subscription_id, plan_financing_id, seat_id, team_id) = funding.columns();
    let consumable_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO consumables (
            id, user_id, service_item_id, how_many, unit_type, valid_until,
            subscription_id, plan_financing_id, subscription_seat_id,
            subscription_billing_team_id, stock_scheduler_id
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(entry.service_item_id)
    .bind(entry.how_many)
    .bind(&entry.unit_type)
    .bind(valid_until)
    .bind(subscription_id)
    .bind(plan_financing_id)
    .bind(seat_id)
    .bind(team_id)
    .bind(scheduler_id)
    .fetch_one(pool)
    .await?;

    // The scheduler mirrors the youngest consumable it manages.
    sqlx::query("UPDATE service_stock_schedulers SET valid_until = $2 WHERE id = $1")
        .bind(scheduler_id)
        .bind(valid_until)
        .execute(pool)
        .await?;

    info!(
        %consumable_id,
        owner = funding.kind(),
        units = entry.how_many,
        "issued stock for catalog entry"
    );
    bus.publish(BillingEvent::BalanceReplenished { consumable_id })
        .await;
    Ok(())
}
