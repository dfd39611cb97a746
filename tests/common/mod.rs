#![allow(dead_code)]

use academy_billing::billing::FundingRef;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

pub async fn seed_user(pool: &PgPool, email: &str) -> i32 {
    sqlx::query_scalar("INSERT INTO users (email) VALUES ($1) RETURNING id")
        .bind(email)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn seed_academy(pool: &PgPool, slug: &str, currency: Option<&str>) -> i32 {
    let currency_id: Option<i32> = match currency {
        Some(code) => Some(
            sqlx::query_scalar("INSERT INTO currencies (code, name) VALUES ($1, $1) RETURNING id")
                .bind(code)
                .fetch_one(pool)
                .await
                .unwrap(),
        ),
        None => None,
    };
    sqlx::query_scalar(
        "INSERT INTO academies (slug, name, main_currency_id) VALUES ($1, $1, $2) RETURNING id",
    )
    .bind(slug)
    .bind(currency_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

pub async fn seed_service(
    pool: &PgPool,
    slug: &str,
    category: &str,
    group_slug: Option<&str>,
    is_team_allowed: bool,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO services (id, slug, title, category, group_slug, is_team_allowed) \
         VALUES ($1, $2, $2, $3, $4, $5)",
    )
    .bind(id)
    .bind(slug)
    .bind(category)
    .bind(group_slug)
    .bind(is_team_allowed)
    .execute(pool)
    .await
    .unwrap();
    id
}

pub async fn seed_service_item(pool: &PgPool, service_id: Uuid, how_many: i64) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO service_items (id, service_id, unit_type, how_many) \
         VALUES ($1, $2, 'UNIT', $3)",
    )
    .bind(id)
    .bind(service_id)
    .bind(how_many)
    .execute(pool)
    .await
    .unwrap();
    id
}

pub async fn seed_academy_service(
    pool: &PgPool,
    academy_id: i32,
    service_id: Uuid,
    price_per_unit_cents: i64,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO academy_services (id, academy_id, service_id, price_per_unit_cents) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(id)
    .bind(academy_id)
    .bind(service_id)
    .bind(price_per_unit_cents)
    .execute(pool)
    .await
    .unwrap();
    id
}

pub async fn seed_plan(pool: &PgPool, academy_id: i32, service_item_id: Uuid) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO plans (id, slug, academy_id) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(format!("plan-{id}"))
        .bind(academy_id)
        .execute(pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO plan_service_items (plan_id, service_item_id) VALUES ($1, $2)")
        .bind(id)
        .bind(service_item_id)
        .execute(pool)
        .await
        .unwrap();
    id
}

pub struct SubscriptionSpec {
    pub status: &'static str,
    pub paid_at: DateTime<Utc>,
    pub next_payment_at: DateTime<Utc>,
    pub auto_recharge_enabled: bool,
    pub recharge_threshold_cents: i64,
    pub recharge_amount_cents: i64,
    pub max_period_spend_cents: Option<i64>,
}

impl Default for SubscriptionSpec {
    fn default() -> Self {
        let now = Utc::now();
        SubscriptionSpec {
            status: "ACTIVE",
            paid_at: now - Duration::days(10),
            next_payment_at: now + Duration::days(20),
            auto_recharge_enabled: false,
            recharge_threshold_cents: 2500,
            recharge_amount_cents: 2500,
            max_period_spend_cents: None,
        }
    }
}

pub async fn seed_subscription(
    pool: &PgPool,
    user_id: i32,
    academy_id: i32,
    plan_id: Uuid,
    spec: SubscriptionSpec,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO subscriptions (
            id, user_id, academy_id, plan_id, status, paid_at, next_payment_at,
            auto_recharge_enabled, recharge_threshold_cents, recharge_amount_cents,
            max_period_spend_cents
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(id)
    .bind(user_id)
    .bind(academy_id)
    .bind(plan_id)
    .bind(spec.status)
    .bind(spec.paid_at)
    .bind(spec.next_payment_at)
    .bind(spec.auto_recharge_enabled)
    .bind(spec.recharge_threshold_cents)
    .bind(spec.recharge_amount_cents)
    .bind(spec.max_period_spend_cents)
    .execute(pool)
    .await
    .unwrap();
    id
}

pub async fn seed_plan_financing(
    pool: &PgPool,
    user_id: i32,
    academy_id: i32,
    plan_id: Uuid,
) -> Uuid {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO plan_financings (
            id, user_id, academy_id, plan_id, status, monthly_price_cents,
            plan_expires_at, paid_at, next_payment_at
        ) VALUES ($1, $2, $3, $4, 'ACTIVE', 5000, $5, $6, $7)
        "#,
    )
    .bind(id)
    .bind(user_id)
    .bind(academy_id)
    .bind(plan_id)
    .bind(now + Duration::days(365))
    .bind(now - Duration::days(10))
    .bind(now + Duration::days(20))
    .execute(pool)
    .await
    .unwrap();
    id
}

pub async fn seed_team(pool: &PgPool, subscription_id: Uuid, strategy: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO subscription_billing_teams (id, subscription_id, name, consumption_strategy) \
         VALUES ($1, $2, 'Team', $3)",
    )
    .bind(id)
    .bind(subscription_id)
    .bind(strategy)
    .execute(pool)
    .await
    .unwrap();
    id
}

pub async fn seed_seat(pool: &PgPool, team_id: Uuid, user_id: Option<i32>, email: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO subscription_seats (id, team_id, user_id, email, is_active) \
         VALUES ($1, $2, $3, $4, TRUE)",
    )
    .bind(id)
    .bind(team_id)
    .bind(user_id)
    .bind(email)
    .execute(pool)
    .await
    .unwrap();
    id
}

pub async fn seed_consumable(
    pool: &PgPool,
    user_id: Option<i32>,
    service_item_id: Uuid,
    how_many: i64,
    valid_until: Option<DateTime<Utc>>,
    funding: FundingRef,
) -> Uuid {
    let id = Uuid::new_v4();
    let (subscription_id, plan_financing_id, seat_id, team_id) = funding.columns();
    sqlx::query(
        r#"
        INSERT INTO consumables (
            id, user_id, service_item_id, how_many, unit_type, valid_until,
            subscription_id, plan_financing_id, subscription_seat_id,
            subscription_billing_team_id
        ) VALUES ($1, $2, $3, $4, 'UNIT', $5, $6, $7, $8, $9)
        "#,
    )
    .bind(id)
    .bind(user_id)
    .bind(service_item_id)
    .bind(how_many)
    .bind(valid_until)
    .bind(subscription_id)
    .bind(plan_financing_id)
    .bind(seat_id)
    .bind(team_id)
    .execute(pool)
    .await
    .unwrap();
    id
}

pub async fn consumable_balance(pool: &PgPool, consumable_id: Uuid) -> i64 {
    sqlx::query_scalar("SELECT how_many FROM consumables WHERE id = $1")
        .bind(consumable_id)
        .fetch_one(pool)
        .await
        .unwrap()
}
