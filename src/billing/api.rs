use axum::{
    extract::{Extension, Path},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use tokio::sync::mpsc::Sender;

use crate::error::{AppError, AppResult};
use crate::job_queue::Job;

use super::errors::ConsumptionError;
use super::events::BillingEventBus;
use super::models::ConsumptionSession;
use super::resolver::{EntitlementResolver, Resolution};
use super::sessions;

/// key: billing-api -> read-only balances and session endpoints

#[derive(Debug, FromRow)]
struct BalanceRow {
    category: String,
    slug: String,
    unit_type: String,
    consumable_id: Uuid,
    how_many: i64,
    valid_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct BalanceItem {
    pub consumable_id: Uuid,
    pub how_many: i64,
    pub valid_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ServiceBalance {
    pub service_slug: String,
    pub unit_type: String,
    /// Summed units; `-1` when any backing row is unlimited.
    pub balance: i64,
    pub items: Vec<BalanceItem>,
}

/// Grouped by capability category, for display only.
#[derive(Debug, Default, Serialize)]
pub struct BalanceSummary {
    pub cohorts: Vec<ServiceBalance>,
    pub mentorships: Vec<ServiceBalance>,
    pub events: Vec<ServiceBalance>,
    pub voids: Vec<ServiceBalance>,
}

pub async fn get_user_balance(
    Extension(pool): Extension<PgPool>,
    Path(user_id): Path<i32>,
) -> AppResult<Json<BalanceSummary>> {
    let now = Utc::now();
    let rows = sqlx::query_as::<_, BalanceRow>(
        r#"
        SELECT s.category, s.slug, si.unit_type,
               c.id AS consumable_id, c.how_many, c.valid_until
        FROM consumables c
        JOIN service_items si ON si.id = c.service_item_id
        JOIN services s ON s.id = si.service_id
        WHERE c.how_many <> 0
          AND (c.valid_until IS NULL OR c.valid_until >= $2)
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
        ORDER BY s.slug, c.valid_until ASC NULLS LAST
        "#,
    )
    .bind(user_id)
    .bind(now)
    .fetch_all(&pool)
    .await?;

    let mut summary = BalanceSummary::default();
    for row in rows {
        let bucket = match row.category.as_str() {
            "COHORT" => &mut summary.cohorts,
            "MENTORSHIP" => &mut summary.mentorships,
            "EVENT" => &mut summary.events,
            _ => &mut summary.voids,
        };
        let entry = match bucket.iter_mut().find(|b| b.service_slug == row.slug) {
            Some(entry) => entry,
            None => {
                bucket.push(ServiceBalance {
                    service_slug: row.slug.clone(),
                    unit_type: row.unit_type.clone(),
                    balance: 0,
                    items: Vec::new(),
                });
                bucket.last_mut().expect("just pushed")
            }
        };
        if row.how_many == -1 || entry.balance == -1 {
            entry.balance = -1;
        } else {
            entry.balance += row.how_many;
        }
        entry.items.push(BalanceItem {
            consumable_id: row.consumable_id,
            how_many: row.how_many,
            valid_until: row.valid_until,
        });
    }

    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct OpenSessionRequest {
    #[serde(default)]
    pub how_many: Option<i64>,
    /// Operation signature for the reservation key; retried requests must
    /// send the same value. Defaults to the service slug.
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub related_info: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct SessionEnvelope {
    pub bypass: bool,
    pub session: Option<ConsumptionSession>,
}

pub async fn open_consumption_session(
    Extension(pool): Extension<PgPool>,
    Extension(resolver): Extension<EntitlementResolver>,
    Path((user_id, service_slug)): Path<(i32, String)>,
    Json(payload): Json<OpenSessionRequest>,
) -> AppResult<Json<SessionEnvelope>> {
    let now = Utc::now();
    let how_many = payload.how_many.unwrap_or(1);
    let resource = payload.resource.unwrap_or_else(|| service_slug.clone());
    let related_info = payload
        .related_info
        .unwrap_or_else(|| serde_json::json!({}));

    let candidates = match resolver.resolve(user_id, &service_slug, now).await? {
        Resolution::Bypass => {
            return Ok(Json(SessionEnvelope {
                bypass: true,
                session: None,
            }))
        }
        Resolution::Eligible(candidates) => candidates,
    };

    // Walk candidates in charge order; a consumable fully claimed by other
    // pending reservations is skipped, not an error.
    for candidate in &candidates {
        match sessions::open_session(
            &pool,
            user_id,
            candidate.id,
            how_many,
            &resource,
            related_info.clone(),
            now,
        )
        .await
        {
            Ok(session) => {
                return Ok(Json(SessionEnvelope {
                    bypass: false,
                    session: Some(session),
                }))
            }
            Err(ConsumptionError::InsufficientBalance) => continue,
            Err(err) => return Err(AppError::from(err)),
        }
    }

    Err(AppError::from(ConsumptionError::InsufficientBalance))
}

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    #[serde(default)]
    pub how_many: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ConsumeResponse {
    pub consumable_id: Uuid,
    pub new_balance: i64,
    pub exhausted: bool,
}

pub async fn consume_session(
    Extension(pool): Extension<PgPool>,
    Extension(bus): Extension<BillingEventBus>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<ConsumeRequest>,
) -> AppResult<Json<ConsumeResponse>> {
    let amount = payload.how_many.unwrap_or(1);
    let outcome = sessions::will_consume(&pool, &bus, session_id, amount, Utc::now()).await?;
    Ok(Json(ConsumeResponse {
        consumable_id: outcome.consumable_id,
        new_balance: outcome.new_balance,
        exhausted: outcome.exhausted,
    }))
}

pub async fn cancel_session(
    Extension(pool): Extension<PgPool>,
    Path(session_id): Path<Uuid>,
) -> AppResult<Json<ConsumptionSession>> {
    let session = sessions::cancel(&pool, session_id).await?;
    Ok(Json(session))
}

#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub scheduled: bool,
}

/// Admin trigger: issue stock for a freshly paid subscription without
/// waiting for the scheduler.
pub async fn trigger_stock_build(
    Extension(pool): Extension<PgPool>,
    Extension(job_tx): Extension<Sender<Job>>,
    Path(subscription_id): Path<Uuid>,
) -> AppResult<Json<JobAccepted>> {
    let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM subscriptions WHERE id = $1")
        .bind(subscription_id)
        .fetch_optional(&pool)
        .await?;
    if exists.is_none() {
        return Err(AppError::NotFound);
    }

    let accepted = job_tx
        .send(Job::BuildStockFromSubscription { subscription_id })
        .await
        .is_ok();
    Ok(Json(JobAccepted {
        scheduled: accepted,
    }))
}

pub async fn trigger_renewal(
    Extension(pool): Extension<PgPool>,
    Extension(job_tx): Extension<Sender<Job>>,
    Path(subscription_id): Path<Uuid>,
) -> AppResult<Json<JobAccepted>> {
    let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM subscriptions WHERE id = $1")
        .bind(subscription_id)
        .fetch_optional(&pool)
        .await?;
    if exists.is_none() {
        return Err(AppError::NotFound);
    }

    let accepted = job_tx
        .send(Job::RenewSubscription { subscription_id })
        .await
        .is_ok();
    Ok(Json(JobAccepted {
        scheduled: accepted,
    }))
}
