use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use super::ledger;
use super::models::{Consumable, FundingRef};

/// key: billing-permissions -> coarse access flags derived from the ledger

/// Read cache over `user_service_groups` so hot-path authorization checks
/// skip the database. Values are refreshed whenever the projection writes.
#[derive(Clone, Default)]
pub struct PermissionCache {
    inner: Arc<DashMap<(i32, String), bool>>,
}

impl PermissionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: i32, group_slug: &str) -> Option<bool> {
        self.inner
            .get(&(user_id, group_slug.to_string()))
            .map(|entry| *entry)
    }

    fn set(&self, user_id: i32, group_slug: &str, granted: bool) {
        self.inner
            .insert((user_id, group_slug.to_string()), granted);
    }
}

struct ServiceGroup {
    slug: String,
    group_slug: Option<String>,
}

async fn service_group(pool: &PgPool, service_item_id: Uuid) -> Result<Option<ServiceGroup>> {
    let row = sqlx::query(
        r#"
        SELECT s.slug, s.group_slug
        FROM service_items si
        JOIN services s ON s.id = si.service_id
        WHERE si.id = $1
        "#,
    )
    .bind(service_item_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| ServiceGroup {
        slug: row.get("slug"),
        group_slug: row.get("group_slug"),
    }))
}

/// Users whose access a change to this consumable can affect: the owner for
/// personal and per-seat rows, every active seat holder for a shared pool.
async fn affected_users(pool: &PgPool, consumable: &Consumable) -> Result<Vec<i32>> {
    if let Some(user_id) = consumable.user_id {
        return Ok(vec![user_id]);
    }
    match consumable.funding {
        FundingRef::TeamPool(team_id) => {
            let users: Vec<i32> = sqlx::query_scalar(
                "SELECT user_id FROM subscription_seats \
                 WHERE team_id = $1 AND is_active AND user_id IS NOT NULL",
            )
            .bind(team_id)
            .fetch_all(pool)
            .await?;
            Ok(users)
        }
        FundingRef::Seat(seat_id) => {
            let user: Option<i32> = sqlx::query_scalar(
                "SELECT user_id FROM subscription_seats WHERE id = $1 AND is_active",
            )
            .bind(seat_id)
            .fetch_optional(pool)
            .await?
            .flatten();
            Ok(user.into_iter().collect())
        }
        _ => Ok(Vec::new()),
    }
}

/// GRANTED -> REVOKED only when no alternate funding path still has usable
/// balance. The eligibility query already walks sibling rows, the shared
/// pool (PER_TEAM only) and the user's other funding sources, so one empty
/// result means everything is dry.
pub async fn review_user_access(
    pool: &PgPool,
    cache: &PermissionCache,
    consumable: &Consumable,
) -> Result<()> {
    let Some(service) = service_group(pool, consumable.service_item_id).await? else {
        return Ok(());
    };
    let Some(group_slug) = service.group_slug else {
        return Ok(());
    };

    let now = Utc::now();
    for user_id in affected_users(pool, consumable).await? {
        let remaining = ledger::list_eligible(pool, user_id, &service.slug, now).await?;
        if remaining.is_empty() {
            revoke(pool, cache, user_id, &group_slug).await?;
            info!(
                user_id,
                group = %group_slug,
                service = %service.slug,
                "revoked service access after exhaustion"
            );
        } else {
            grant(pool, cache, user_id, &group_slug).await?;
        }
    }
    Ok(())
}

/// REVOKED -> GRANTED as soon as any usable balance exists again.
pub async fn grant_for_consumable(
    pool: &PgPool,
    cache: &PermissionCache,
    consumable: &Consumable,
) -> Result<()> {
    if !consumable.is_valid(Utc::now()) {
        return Ok(());
    }
    let Some(service) = service_group(pool, consumable.service_item_id).await? else {
        return Ok(());
    };
    let Some(group_slug) = service.group_slug else {
        return Ok(());
    };

    for user_id in affected_users(pool, consumable).await? {
        grant(pool, cache, user_id, &group_slug).await?;
    }
    Ok(())
}

async fn grant(
    pool: &PgPool,
    cache: &PermissionCache,
    user_id: i32,
    group_slug: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO user_service_groups (user_id, group_slug) VALUES ($1, $2) \
         ON CONFLICT (user_id, group_slug) DO NOTHING",
    )
    .bind(user_id)
    .bind(group_slug)
    .execute(pool)
    .await?;
    cache.set(user_id, group_slug, true);
    Ok(())
}

async fn revoke(
    pool: &PgPool,
    cache: &PermissionCache,
    user_id: i32,
    group_slug: &str,
) -> Result<()> {
    sqlx::query("DELETE FROM user_service_groups WHERE user_id = $1 AND group_slug = $2")
        .bind(user_id)
        .bind(group_slug)
        .execute(pool)
        .await?;
    cache.set(user_id, group_slug, false);
    Ok(())
}

/// DB-backed check for callers that missed the cache.
pub async fn is_granted(pool: &PgPool, user_id: i32, group_slug: &str) -> Result<bool> {
    let found: Option<i32> = sqlx::query_scalar(
        "SELECT 1 FROM user_service_groups WHERE user_id = $1 AND group_slug = $2",
    )
    .bind(user_id)
    .bind(group_slug)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}
