use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::errors::ConsumptionError;
use super::events::{BillingEvent, BillingEventBus};
use super::models::Consumable;

/// key: billing-ledger -> balance arithmetic over consumable rows

/// Timed credits burn before perpetual ones: a `valid_until` sorts ahead of
/// `NULL`, and sooner ahead of later.
pub fn expiry_order(a: &Consumable, b: &Consumable) -> Ordering {
    match (a.valid_until, b.valid_until) {
        (Some(left), Some(right)) => left.cmp(&right),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.created_at.cmp(&b.created_at),
    }
}

pub fn order_eligible(rows: &mut [Consumable]) {
    rows.sort_by(expiry_order);
}

/// All non-exhausted, non-expired rows reachable by `user_id` for the
/// service: rows they own directly, rows held by their active seats, and a
/// team's shared pool when the team consumes PER_TEAM.
pub async fn list_eligible(
    pool: &PgPool,
    user_id: i32,
    service_slug: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Consumable>, ConsumptionError> {
    let rows = sqlx::query_as::<_, Consumable>(
        r#"
        SELECT c.*
        FROM consumables c
        JOIN service_items si ON si.id = c.service_item_id
        JOIN services s ON s.id = si.service_id
        WHERE s.slug = $2
          AND c.how_many <> 0
          AND (c.valid_until IS NULL OR c.valid_until >= $3)
          AND (
            c.user_id = $1
            OR c.subscription_seat_id IN (
                SELECT seat.id FROM subscription_seats seat
                WHERE seat.user_id = $1 AND seat.is_active
            )
            OR (c.user_id IS NULL AND c.subscription_billing_team_id IN (
                SELECT team.id
                FROM subscription_billing_teams team
                JOIN subscription_seats seat ON seat.team_id = team.id
                WHERE seat.user_id = $1
                  AND seat.is_active
                  AND team.consumption_strategy = 'PER_TEAM'
            ))
          )
        ORDER BY c.valid_until ASC NULLS LAST, c.created_at ASC
        "#,
    )
    .bind(user_id)
    .bind(service_slug)
    .bind(now)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

#[derive(Debug, Clone, Copy)]
pub struct ChargeOutcome {
    pub consumable_id: Uuid,
    pub new_balance: i64,
    pub exhausted: bool,
}

pub(super) struct LockedCharge {
    pub new_balance: i64,
    pub user_id: Option<i32>,
}

/// Decrement `how_many` under a row lock. `-1` (unlimited) is a no-op
/// decrement; the balance never goes below zero. Leaves commit and event
/// publication to the caller so session finalization can share the
/// transaction.
pub(super) async fn charge_locked(
    tx: &mut Transaction<'_, Postgres>,
    consumable_id: Uuid,
    amount: i64,
) -> Result<LockedCharge, ConsumptionError> {
    if amount < 1 {
        return Err(ConsumptionError::InvalidAmount);
    }

    let row = sqlx::query("SELECT how_many, user_id FROM consumables WHERE id = $1 FOR UPDATE")
        .bind(consumable_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ConsumptionError::NotFound)?;

    let how_many: i64 = row.get("how_many");
    let user_id: Option<i32> = row.get("user_id");

    if how_many == -1 {
        return Ok(LockedCharge {
            new_balance: -1,
            user_id,
        });
    }
    if amount > how_many {
        return Err(ConsumptionError::InsufficientBalance);
    }

    let new_balance: i64 = sqlx::query_scalar(
        "UPDATE consumables SET how_many = how_many - $2 WHERE id = $1 RETURNING how_many",
    )
    .bind(consumable_id)
    .bind(amount)
    .fetch_one(&mut *tx)
    .await?;

    Ok(LockedCharge {
        new_balance,
        user_id,
    })
}

/// Direct charge outside a consumption session.
pub async fn charge(
    pool: &PgPool,
    bus: &BillingEventBus,
    consumable_id: Uuid,
    amount: i64,
) -> Result<ChargeOutcome, ConsumptionError> {
    let mut tx = pool.begin().await?;
    let locked = charge_locked(&mut tx, consumable_id, amount).await?;
    tx.commit().await?;

    let outcome = ChargeOutcome {
        consumable_id,
        new_balance: locked.new_balance,
        exhausted: locked.new_balance == 0,
    };
    publish_charge(bus, &outcome, locked.user_id, amount).await;
    Ok(outcome)
}

pub(super) async fn publish_charge(
    bus: &BillingEventBus,
    outcome: &ChargeOutcome,
    user_id: Option<i32>,
    amount: i64,
) {
    bus.publish(BillingEvent::ServiceConsumed {
        consumable_id: outcome.consumable_id,
        user_id,
        how_many: amount,
    })
    .await;
    if outcome.exhausted {
        bus.publish(BillingEvent::BalanceExhausted {
            consumable_id: outcome.consumable_id,
        })
        .await;
    }
}
