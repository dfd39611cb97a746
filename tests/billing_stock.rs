mod common;

use academy_billing::billing::{start_event_worker, stock, PermissionCache};
use chrono::{DateTime, Duration, DurationRound, Utc};
use common::*;
use sqlx::PgPool;
use uuid::Uuid;

// key: billing-stock-tests -> build steps, keep-alive and renewal

async fn subscription_consumables(pool: &PgPool, sub_id: Uuid) -> Vec<(Option<i32>, i64)> {
    sqlx::query_as(
        "SELECT user_id, how_many FROM consumables \
         WHERE subscription_id = $1 ORDER BY created_at",
    )
    .bind(sub_id)
    .fetch_all(pool)
    .await
    .unwrap()
}

async fn scheduler_count(pool: &PgPool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM service_stock_schedulers")
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn backdate_schedulers(pool: &PgPool, to: DateTime<Utc>) {
    sqlx::query("UPDATE service_stock_schedulers SET valid_until = $1")
        .bind(to)
        .execute(pool)
        .await
        .unwrap();
    sqlx::query("UPDATE consumables SET valid_until = $1")
        .bind(to)
        .execute(pool)
        .await
        .unwrap();
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn build_from_subscription_is_idempotent(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let bus = start_event_worker(pool.clone(), PermissionCache::new());
    let now = Utc::now();

    let user_id = seed_user(&pool, "build@example.com").await;
    let academy_id = seed_academy(&pool, "build-academy", Some("USD")).await;
    let service_id = seed_service(&pool, "mentorship", "MENTORSHIP", None, false).await;
    let item_id = seed_service_item(&pool, service_id, 10).await;
    let plan_id = seed_plan(&pool, academy_id, item_id).await;
    let sub_id = seed_subscription(
        &pool,
        user_id,
        academy_id,
        plan_id,
        SubscriptionSpec::default(),
    )
    .await;

    stock::build_from_subscription(&pool, &bus, sub_id, now)
        .await
        .unwrap();
    stock::build_from_subscription(&pool, &bus, sub_id, now)
        .await
        .unwrap();

    assert_eq!(scheduler_count(&pool).await, 1);
    let rows = subscription_consumables(&pool, sub_id).await;
    assert_eq!(rows, vec![(Some(user_id), 10)]);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn per_team_strategy_issues_one_shared_pool(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let bus = start_event_worker(pool.clone(), PermissionCache::new());
    let now = Utc::now();

    let owner_id = seed_user(&pool, "pool-owner@example.com").await;
    let member_id = seed_user(&pool, "pool-member@example.com").await;
    let academy_id = seed_academy(&pool, "pool-academy", Some("USD")).await;
    let service_id = seed_service(&pool, "mentorship", "MENTORSHIP", None, true).await;
    let item_id = seed_service_item(&pool, service_id, 20).await;
    let plan_id = seed_plan(&pool, academy_id, item_id).await;
    let sub_id = seed_subscription(
        &pool,
        owner_id,
        academy_id,
        plan_id,
        SubscriptionSpec::default(),
    )
    .await;
    let team_id = seed_team(&pool, sub_id, "PER_TEAM").await;
    seed_seat(&pool, team_id, Some(member_id), "pool-member@example.com").await;

    stock::build_from_subscription(&pool, &bus, sub_id, now)
        .await
        .unwrap();

    let rows: Vec<(Option<i32>, i64)> = sqlx::query_as(
        "SELECT user_id, how_many FROM consumables WHERE subscription_billing_team_id = $1",
    )
    .bind(team_id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(rows, vec![(None, 20)], "one anonymous shared pool");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn per_seat_strategy_issues_stock_per_claimed_seat(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let bus = start_event_worker(pool.clone(), PermissionCache::new());
    let now = Utc::now();

    let owner_id = seed_user(&pool, "seat-owner@example.com").await;
    let claimed_id = seed_user(&pool, "seat-claimed@example.com").await;
    let academy_id = seed_academy(&pool, "seat-academy", Some("USD")).await;
    let service_id = seed_service(&pool, "mentorship", "MENTORSHIP", None, true).await;
    let item_id = seed_service_item(&pool, service_id, 5).await;
    let plan_id = seed_plan(&pool, academy_id, item_id).await;
    let sub_id = seed_subscription(
        &pool,
        owner_id,
        academy_id,
        plan_id,
        SubscriptionSpec::default(),
    )
    .await;
    let team_id = seed_team(&pool, sub_id, "PER_SEAT").await;
    let claimed_seat =
        seed_seat(&pool, team_id, Some(claimed_id), "seat-claimed@example.com").await;
    // Pending invite: no stock until someone claims the seat.
    seed_seat(&pool, team_id, None, "seat-invited@example.com").await;

    stock::build_from_subscription(&pool, &bus, sub_id, now)
        .await
        .unwrap();

    let rows: Vec<(Option<i32>, Uuid)> = sqlx::query_as(
        "SELECT user_id, subscription_seat_id FROM consumables \
         WHERE subscription_seat_id IS NOT NULL",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(rows, vec![(Some(claimed_id), claimed_seat)]);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn keep_alive_extends_lapsed_stock_up_to_the_due_date(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let bus = start_event_worker(pool.clone(), PermissionCache::new());
    // Postgres timestamptz keeps microseconds; truncate so DB round-trips compare equal.
    let now = Utc::now().duration_trunc(Duration::microseconds(1)).unwrap();
    let horizon = Duration::hours(2);

    let user_id = seed_user(&pool, "keepalive@example.com").await;
    let academy_id = seed_academy(&pool, "keepalive-academy", Some("USD")).await;
    let service_id = seed_service(&pool, "mentorship", "MENTORSHIP", None, false).await;
    let item_id = seed_service_item(&pool, service_id, 10).await;
    let plan_id = seed_plan(&pool, academy_id, item_id).await;
    let next_payment_at = now + Duration::hours(1);
    let sub_id = seed_subscription(
        &pool,
        user_id,
        academy_id,
        plan_id,
        SubscriptionSpec {
            next_payment_at,
            ..SubscriptionSpec::default()
        },
    )
    .await;

    stock::build_from_subscription(&pool, &bus, sub_id, now)
        .await
        .unwrap();
    // Simulate a renewal job running late: the window has already lapsed.
    backdate_schedulers(&pool, now - Duration::minutes(10)).await;

    stock::process_tick(&pool, now, horizon).await.unwrap();

    // The due date is closer than the horizon, so the window is capped there.
    let extended: DateTime<Utc> =
        sqlx::query_scalar("SELECT valid_until FROM service_stock_schedulers")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(extended, next_payment_at);
    let consumable_until: DateTime<Utc> =
        sqlx::query_scalar("SELECT valid_until FROM consumables")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(consumable_until, next_payment_at);

    // Already extended: the next tick finds nothing to do.
    stock::process_tick(&pool, now, horizon).await.unwrap();
    let unchanged: DateTime<Utc> =
        sqlx::query_scalar("SELECT valid_until FROM service_stock_schedulers")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(unchanged, next_payment_at);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn slightly_late_renewal_is_bridged_on_the_normal_lifecycle(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let bus = start_event_worker(pool.clone(), PermissionCache::new());
    let horizon = Duration::hours(2);

    let user_id = seed_user(&pool, "late@example.com").await;
    let academy_id = seed_academy(&pool, "late-academy", Some("USD")).await;
    let service_id = seed_service(&pool, "mentorship", "MENTORSHIP", None, false).await;
    let item_id = seed_service_item(&pool, service_id, 10).await;
    let plan_id = seed_plan(&pool, academy_id, item_id).await;
    // The due date just passed and the renewal job has not landed yet.
    // (microsecond-truncated so the timestamptz round-trip compares equal)
    let next_payment_at = (Utc::now() - Duration::minutes(5))
        .duration_trunc(Duration::microseconds(1))
        .unwrap();
    let sub_id = seed_subscription(
        &pool,
        user_id,
        academy_id,
        plan_id,
        SubscriptionSpec {
            next_payment_at,
            ..SubscriptionSpec::default()
        },
    )
    .await;

    // Stock from the previous cycle carries the due date as its window, so
    // it has lapsed on its own, with no test-side tampering.
    stock::build_from_subscription(&pool, &bus, sub_id, next_payment_at - Duration::days(30))
        .await
        .unwrap();
    let lapsed: DateTime<Utc> =
        sqlx::query_scalar("SELECT valid_until FROM service_stock_schedulers")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(lapsed, next_payment_at);

    let now = Utc::now().duration_trunc(Duration::microseconds(1)).unwrap();
    stock::process_tick(&pool, now, horizon).await.unwrap();

    let extended: DateTime<Utc> =
        sqlx::query_scalar("SELECT valid_until FROM service_stock_schedulers")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(extended, now + horizon);
    let consumable_until: DateTime<Utc> =
        sqlx::query_scalar("SELECT valid_until FROM consumables")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(consumable_until, now + horizon);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn sources_long_overdue_are_left_to_lapse(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let bus = start_event_worker(pool.clone(), PermissionCache::new());
    let horizon = Duration::hours(2);

    let user_id = seed_user(&pool, "overdue@example.com").await;
    let academy_id = seed_academy(&pool, "overdue-academy", Some("USD")).await;
    let service_id = seed_service(&pool, "mentorship", "MENTORSHIP", None, false).await;
    let item_id = seed_service_item(&pool, service_id, 10).await;
    let plan_id = seed_plan(&pool, academy_id, item_id).await;
    // Overdue beyond the keep-alive horizon: this is a payment problem, not
    // a late job.
    // (microsecond-truncated so the timestamptz round-trip compares equal)
    let next_payment_at = (Utc::now() - Duration::hours(3))
        .duration_trunc(Duration::microseconds(1))
        .unwrap();
    let sub_id = seed_subscription(
        &pool,
        user_id,
        academy_id,
        plan_id,
        SubscriptionSpec {
            next_payment_at,
            ..SubscriptionSpec::default()
        },
    )
    .await;

    stock::build_from_subscription(&pool, &bus, sub_id, next_payment_at - Duration::days(30))
        .await
        .unwrap();
    stock::process_tick(&pool, Utc::now(), horizon).await.unwrap();

    let unchanged: DateTime<Utc> =
        sqlx::query_scalar("SELECT valid_until FROM service_stock_schedulers")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(unchanged, next_payment_at);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn dead_subscriptions_are_not_kept_alive(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let bus = start_event_worker(pool.clone(), PermissionCache::new());
    // Postgres timestamptz keeps microseconds; truncate so DB round-trips compare equal.
    let now = Utc::now().duration_trunc(Duration::microseconds(1)).unwrap();

    let user_id = seed_user(&pool, "dead@example.com").await;
    let academy_id = seed_academy(&pool, "dead-academy", Some("USD")).await;
    let service_id = seed_service(&pool, "mentorship", "MENTORSHIP", None, false).await;
    let item_id = seed_service_item(&pool, service_id, 10).await;
    let plan_id = seed_plan(&pool, academy_id, item_id).await;
    let sub_id = seed_subscription(
        &pool,
        user_id,
        academy_id,
        plan_id,
        SubscriptionSpec::default(),
    )
    .await;

    stock::build_from_subscription(&pool, &bus, sub_id, now)
        .await
        .unwrap();
    let lapsed = now - Duration::minutes(10);
    backdate_schedulers(&pool, lapsed).await;
    sqlx::query("UPDATE subscriptions SET status = 'PAYMENT_ISSUE' WHERE id = $1")
        .bind(sub_id)
        .execute(&pool)
        .await
        .unwrap();

    stock::process_tick(&pool, now, Duration::hours(2))
        .await
        .unwrap();

    let unchanged: DateTime<Utc> =
        sqlx::query_scalar("SELECT valid_until FROM service_stock_schedulers")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(unchanged, lapsed, "no keep-alive for dead funding");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn renew_subscription_advances_the_anchor_and_reissues_stock(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let bus = start_event_worker(pool.clone(), PermissionCache::new());
    let now = Utc::now();

    let user_id = seed_user(&pool, "renew@example.com").await;
    let academy_id = seed_academy(&pool, "renew-academy", Some("USD")).await;
    let service_id = seed_service(&pool, "mentorship", "MENTORSHIP", None, false).await;
    let item_id = seed_service_item(&pool, service_id, 10).await;
    let plan_id = seed_plan(&pool, academy_id, item_id).await;
    let sub_id = seed_subscription(
        &pool,
        user_id,
        academy_id,
        plan_id,
        SubscriptionSpec {
            paid_at: now - Duration::days(40),
            next_payment_at: now - Duration::hours(1),
            ..SubscriptionSpec::default()
        },
    )
    .await;

    stock::build_from_subscription(&pool, &bus, sub_id, now)
        .await
        .unwrap();
    // The previous cycle's stock was fully spent.
    sqlx::query("UPDATE consumables SET how_many = 0 WHERE subscription_id = $1")
        .bind(sub_id)
        .execute(&pool)
        .await
        .unwrap();

    stock::renew_subscription(&pool, &bus, sub_id, now)
        .await
        .unwrap();

    let next: DateTime<Utc> =
        sqlx::query_scalar("SELECT next_payment_at FROM subscriptions WHERE id = $1")
            .bind(sub_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(next > now, "billing anchor moved into the next cycle");

    let rows = subscription_consumables(&pool, sub_id).await;
    assert_eq!(rows, vec![(Some(user_id), 0), (Some(user_id), 10)]);
    // Still only one scheduler: the build step reuses the existing link.
    assert_eq!(scheduler_count(&pool).await, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn plan_financing_stock_is_capped_by_plan_expiry(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let bus = start_event_worker(pool.clone(), PermissionCache::new());
    // Postgres timestamptz keeps microseconds; truncate so DB round-trips compare equal.
    let now = Utc::now().duration_trunc(Duration::microseconds(1)).unwrap();

    let user_id = seed_user(&pool, "financing@example.com").await;
    let academy_id = seed_academy(&pool, "financing-academy", Some("USD")).await;
    let service_id = seed_service(&pool, "cohort-access", "COHORT", None, false).await;
    let item_id = seed_service_item(&pool, service_id, 1).await;
    let plan_id = seed_plan(&pool, academy_id, item_id).await;
    let pf_id = seed_plan_financing(&pool, user_id, academy_id, plan_id).await;
    // Expiry falls before the next installment.
    let expires = now + Duration::days(5);
    sqlx::query("UPDATE plan_financings SET plan_expires_at = $2 WHERE id = $1")
        .bind(pf_id)
        .bind(expires)
        .execute(&pool)
        .await
        .unwrap();

    stock::build_from_plan_financing(&pool, &bus, pf_id, now)
        .await
        .unwrap();

    let (owner, until): (Option<i32>, DateTime<Utc>) = sqlx::query_as(
        "SELECT user_id, valid_until FROM consumables WHERE plan_financing_id = $1",
    )
    .bind(pf_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(owner, Some(user_id));
    assert_eq!(until, expires);
}
