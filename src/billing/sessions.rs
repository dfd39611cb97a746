use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config;

use super::errors::ConsumptionError;
use super::events::BillingEventBus;
use super::ledger::{self, ChargeOutcome};
use super::models::ConsumptionSession;

/// key: billing-sessions -> at-most-once charge via time-boxed reservations

/// Deterministic reservation key: a retried request lands on the same
/// PENDING session instead of opening a second reservation.
pub fn reservation_key(secret: &[u8], user_id: i32, resource: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("HMAC can use any key length");
    mac.update(user_id.to_be_bytes().as_slice());
    mac.update(b"\x00");
    mac.update(resource.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Open (or rejoin) the reservation for `(user, resource)` against one
/// consumable. The consumable row is locked while the apparent balance is
/// computed, so two concurrent opens cannot both claim the last unit.
pub async fn open_session(
    pool: &PgPool,
    user_id: i32,
    consumable_id: Uuid,
    how_many: i64,
    resource: &str,
    related_info: Value,
    now: DateTime<Utc>,
) -> Result<ConsumptionSession, ConsumptionError> {
    if how_many < 1 {
        return Err(ConsumptionError::InvalidAmount);
    }

    let key = reservation_key(config::SESSION_KEY_SECRET.as_bytes(), user_id, resource);
    let lifetime = Duration::seconds(*config::SESSION_LIFETIME_SECS as i64);

    let mut tx = pool.begin().await?;

    // Lazily void a reservation that outlived its window so the partial
    // unique index does not pin a dead key forever.
    sqlx::query(
        "UPDATE consumption_sessions SET status = 'CANCELLED' \
         WHERE session_key = $1 AND status = 'PENDING' AND expires_at <= $2",
    )
    .bind(&key)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let row = sqlx::query("SELECT how_many FROM consumables WHERE id = $1 FOR UPDATE")
        .bind(consumable_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ConsumptionError::NotFound)?;
    let balance: i64 = row.get("how_many");

    if balance != -1 {
        let reserved = reserved_by_others(&mut *tx, consumable_id, &key, now).await?;
        if balance - reserved < how_many {
            return Err(ConsumptionError::InsufficientBalance);
        }
    }

    let inserted = sqlx::query_as::<_, ConsumptionSession>(
        r#"
        INSERT INTO consumption_sessions (
            id, consumable_id, user_id, session_key, how_many, status,
            expires_at, related_info
        ) VALUES ($1, $2, $3, $4, $5, 'PENDING', $6, $7)
        ON CONFLICT (session_key) WHERE status = 'PENDING' DO NOTHING
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(consumable_id)
    .bind(user_id)
    .bind(&key)
    .bind(how_many)
    .bind(now + lifetime)
    .bind(related_info)
    .fetch_optional(&mut *tx)
    .await?;

    let session = match inserted {
        Some(session) => session,
        // Lost the insert race or the retry rejoined its own reservation.
        None => sqlx::query_as::<_, ConsumptionSession>(
            "SELECT * FROM consumption_sessions WHERE session_key = $1 AND status = 'PENDING'",
        )
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ConsumptionError::OperationNotRetriable)?,
    };

    tx.commit().await?;
    Ok(session)
}

/// Balance as other sessions see it: the stored quantity minus everything
/// still claimed by live PENDING reservations.
pub async fn available_balance(
    pool: &PgPool,
    consumable_id: Uuid,
    now: DateTime<Utc>,
) -> Result<i64, ConsumptionError> {
    let balance: i64 = sqlx::query_scalar("SELECT how_many FROM consumables WHERE id = $1")
        .bind(consumable_id)
        .fetch_optional(pool)
        .await?
        .ok_or(ConsumptionError::NotFound)?;
    if balance == -1 {
        return Ok(-1);
    }
    let reserved = reserved_by_others(pool, consumable_id, "", now).await?;
    Ok((balance - reserved).max(0))
}

async fn reserved_by_others<'e, E>(
    executor: E,
    consumable_id: Uuid,
    exclude_key: &str,
    now: DateTime<Utc>,
) -> Result<i64, ConsumptionError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let reserved: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT SUM(how_many)::BIGINT
        FROM consumption_sessions
        WHERE consumable_id = $1
          AND status = 'PENDING'
          AND expires_at > $2
          AND session_key <> $3
        "#,
    )
    .bind(consumable_id)
    .bind(now)
    .bind(exclude_key)
    .fetch_one(executor)
    .await?;
    Ok(reserved.unwrap_or(0))
}

/// Finalize the reservation and perform the ledger decrement in one
/// transaction. The final amount may differ from the reserved one; the
/// ledger still refuses to go below zero.
pub async fn will_consume(
    pool: &PgPool,
    bus: &BillingEventBus,
    session_id: Uuid,
    amount: i64,
    now: DateTime<Utc>,
) -> Result<ChargeOutcome, ConsumptionError> {
    let mut tx = pool.begin().await?;

    let session = sqlx::query_as::<_, ConsumptionSession>(
        "SELECT * FROM consumption_sessions WHERE id = $1 FOR UPDATE",
    )
    .bind(session_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(ConsumptionError::NotFound)?;

    if !session.is_pending(now) {
        return Err(ConsumptionError::OperationNotRetriable);
    }

    let locked = ledger::charge_locked(&mut tx, session.consumable_id, amount).await?;

    sqlx::query("UPDATE consumption_sessions SET status = 'DONE', how_many = $2 WHERE id = $1")
        .bind(session_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    let outcome = ChargeOutcome {
        consumable_id: session.consumable_id,
        new_balance: locked.new_balance,
        exhausted: locked.new_balance == 0,
    };
    ledger::publish_charge(bus, &outcome, locked.user_id, amount).await;
    Ok(outcome)
}

/// Release the reservation without charging.
pub async fn cancel(
    pool: &PgPool,
    session_id: Uuid,
) -> Result<ConsumptionSession, ConsumptionError> {
    let cancelled = sqlx::query_as::<_, ConsumptionSession>(
        "UPDATE consumption_sessions SET status = 'CANCELLED' \
         WHERE id = $1 AND status = 'PENDING' RETURNING *",
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await?;

    match cancelled {
        Some(session) => Ok(session),
        None => {
            let exists: Option<String> =
                sqlx::query_scalar("SELECT status FROM consumption_sessions WHERE id = $1")
                    .bind(session_id)
                    .fetch_optional(pool)
                    .await?;
            match exists {
                Some(_) => Err(ConsumptionError::OperationNotRetriable),
                None => Err(ConsumptionError::NotFound),
            }
        }
    }
}
