use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

/// Funding-source statuses that still entitle their owner to stock.
pub const USABLE_FUNDING_STATUSES: &[&str] = &["ACTIVE", "FREE_TRIAL"];

/// Statuses the replenishment keep-alive must never resurrect.
pub const DEAD_FUNDING_STATUSES: &[&str] = &["CANCELLED", "DEPRECATED", "PAYMENT_ISSUE"];

/// key: billing-models -> catalog entries
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub slug: String,
    pub title: String,
    pub category: String,
    pub group_slug: Option<String>,
    pub is_team_allowed: bool,
    pub max_team_members: Option<i32>,
}

/// key: billing-models -> per-period allotment of a service
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ServiceItem {
    pub id: Uuid,
    pub service_id: Uuid,
    pub unit_type: String,
    pub how_many: i64,
}

/// key: billing-models -> per-academy unit pricing
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AcademyService {
    pub id: Uuid,
    pub academy_id: i32,
    pub service_id: Uuid,
    pub price_per_unit_cents: i64,
}

/// key: billing-subscription-model -> monthly funding source
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: i32,
    pub academy_id: i32,
    pub plan_id: Uuid,
    pub status: String,
    pub paid_at: DateTime<Utc>,
    pub next_payment_at: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub auto_recharge_enabled: bool,
    pub recharge_threshold_cents: i64,
    pub recharge_amount_cents: i64,
    pub max_period_spend_cents: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        if !USABLE_FUNDING_STATUSES.contains(&self.status.as_str()) {
            return false;
        }
        match self.valid_until {
            Some(end) => end >= now,
            None => true,
        }
    }
}

/// key: billing-plan-financing-model -> installment funding source
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PlanFinancing {
    pub id: Uuid,
    pub user_id: i32,
    pub academy_id: i32,
    pub plan_id: Uuid,
    pub status: String,
    pub monthly_price_cents: i64,
    pub plan_expires_at: DateTime<Utc>,
    pub paid_at: DateTime<Utc>,
    pub next_payment_at: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub auto_recharge_enabled: bool,
    pub recharge_threshold_cents: i64,
    pub recharge_amount_cents: i64,
    pub max_period_spend_cents: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlanFinancing {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        USABLE_FUNDING_STATUSES.contains(&self.status.as_str()) && self.plan_expires_at >= now
    }
}

/// How a billing team's seats draw from stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumptionStrategy {
    PerSeat,
    PerTeam,
}

impl ConsumptionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumptionStrategy::PerSeat => "PER_SEAT",
            ConsumptionStrategy::PerTeam => "PER_TEAM",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PER_SEAT" => Some(ConsumptionStrategy::PerSeat),
            "PER_TEAM" => Some(ConsumptionStrategy::PerTeam),
            _ => None,
        }
    }
}

/// key: billing-team-model -> seats under one subscription
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SubscriptionBillingTeam {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub name: String,
    pub consumption_strategy: String,
    pub seats_limit: Option<i32>,
}

impl SubscriptionBillingTeam {
    pub fn strategy(&self) -> ConsumptionStrategy {
        ConsumptionStrategy::parse(&self.consumption_strategy)
            .unwrap_or(ConsumptionStrategy::PerSeat)
    }
}

/// key: billing-seat-model -> team membership (user or pending invite)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SubscriptionSeat {
    pub id: Uuid,
    pub team_id: Uuid,
    pub user_id: Option<i32>,
    pub email: String,
    pub is_active: bool,
}

/// The single owner of a consumable. The table stores four nullable
/// references with an exactly-one CHECK; in-process the owner is this
/// sum type so an impossible combination cannot be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FundingRef {
    Subscription(Uuid),
    PlanFinancing(Uuid),
    Seat(Uuid),
    TeamPool(Uuid),
}

impl FundingRef {
    pub fn from_columns(
        subscription_id: Option<Uuid>,
        plan_financing_id: Option<Uuid>,
        seat_id: Option<Uuid>,
        team_id: Option<Uuid>,
    ) -> anyhow::Result<Self> {
        match (subscription_id, plan_financing_id, seat_id, team_id) {
            (Some(id), None, None, None) => Ok(FundingRef::Subscription(id)),
            (None, Some(id), None, None) => Ok(FundingRef::PlanFinancing(id)),
            (None, None, Some(id), None) => Ok(FundingRef::Seat(id)),
            (None, None, None, Some(id)) => Ok(FundingRef::TeamPool(id)),
            _ => Err(anyhow::anyhow!(
                "consumable row must reference exactly one funding owner"
            )),
        }
    }

    /// Column values in table order, for inserts.
    pub fn columns(&self) -> (Option<Uuid>, Option<Uuid>, Option<Uuid>, Option<Uuid>) {
        match *self {
            FundingRef::Subscription(id) => (Some(id), None, None, None),
            FundingRef::PlanFinancing(id) => (None, Some(id), None, None),
            FundingRef::Seat(id) => (None, None, Some(id), None),
            FundingRef::TeamPool(id) => (None, None, None, Some(id)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FundingRef::Subscription(_) => "subscription",
            FundingRef::PlanFinancing(_) => "plan_financing",
            FundingRef::Seat(_) => "seat",
            FundingRef::TeamPool(_) => "team_pool",
        }
    }

    pub fn id(&self) -> Uuid {
        match *self {
            FundingRef::Subscription(id)
            | FundingRef::PlanFinancing(id)
            | FundingRef::Seat(id)
            | FundingRef::TeamPool(id) => id,
        }
    }
}

/// key: billing-ledger-model -> remaining units of a service for one owner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consumable {
    pub id: Uuid,
    pub user_id: Option<i32>,
    pub service_item_id: Uuid,
    pub how_many: i64,
    pub unit_type: String,
    pub valid_until: Option<DateTime<Utc>>,
    pub funding: FundingRef,
    pub stock_scheduler_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Consumable {
    pub fn is_unlimited(&self) -> bool {
        self.how_many == -1
    }

    pub fn is_exhausted(&self) -> bool {
        self.how_many == 0
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if self.is_exhausted() {
            return false;
        }
        match self.valid_until {
            Some(end) => end >= now,
            None => true,
        }
    }
}

impl FromRow<'_, PgRow> for Consumable {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let funding = FundingRef::from_columns(
            row.try_get("subscription_id")?,
            row.try_get("plan_financing_id")?,
            row.try_get("subscription_seat_id")?,
            row.try_get("subscription_billing_team_id")?,
        )
        .map_err(|err| sqlx::Error::Decode(err.into()))?;

        Ok(Consumable {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            service_item_id: row.try_get("service_item_id")?,
            how_many: row.try_get("how_many")?,
            unit_type: row.try_get("unit_type")?,
            valid_until: row.try_get("valid_until")?,
            funding,
            stock_scheduler_id: row.try_get("stock_scheduler_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// key: billing-stock-scheduler-model -> links period allocation to rows
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ServiceStockScheduler {
    pub id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub plan_financing_id: Option<Uuid>,
    pub service_item_id: Uuid,
    pub seat_id: Option<Uuid>,
    pub valid_until: Option<DateTime<Utc>>,
}

/// key: billing-session-model -> time-boxed reservation on one consumable
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ConsumptionSession {
    pub id: Uuid,
    pub consumable_id: Uuid,
    pub user_id: i32,
    pub session_key: String,
    pub how_many: i64,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub related_info: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ConsumptionSession {
    pub fn is_pending(&self, now: DateTime<Utc>) -> bool {
        self.status == "PENDING" && self.expires_at > now
    }
}

/// key: billing-recharge-audit -> one auto-recharge purchase
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RechargePurchase {
    pub id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub plan_financing_id: Option<Uuid>,
    pub service_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
