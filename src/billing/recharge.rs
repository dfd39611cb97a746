use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, Months, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::adapters::{ChargeStatus, PaymentGatewayAdapter};
use super::errors::RechargeError;
use super::events::{BillingEvent, BillingEventBus};
use super::models::{Consumable, FundingRef, PlanFinancing, Subscription};

/// key: billing-recharge -> buy more units when a balance runs dry

/// Recharge only when meaningfully depleted: more than this share of the
/// nominal allotment left means no purchase.
pub const DEPLETION_RATIO: f64 = 0.2;

/// Snapshot of everything the decision needs, so the gate chain is a pure
/// function.
#[derive(Debug, Clone)]
pub struct RechargeInputs {
    pub auto_recharge_enabled: bool,
    /// Academy main currency code; `None` means not configured.
    pub currency: Option<String>,
    /// `None` means no catalog row for (academy, service).
    pub price_per_unit_cents: Option<i64>,
    pub recharge_amount_cents: i64,
    pub recharge_threshold_cents: i64,
    pub max_period_spend_cents: Option<i64>,
    /// Units still available across the funding source's rows for the service.
    pub available_units: i64,
    /// The service item's nominal per-period allotment.
    pub allotment_units: i64,
    pub has_unlimited: bool,
    /// Auto-recharge money already spent in the current billing period.
    pub period_spend_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RechargeDecision {
    pub price_per_unit_cents: i64,
    pub units_to_buy: i64,
    pub currency: String,
    /// Set when the engine declines without error; purely observability.
    pub declined: Option<&'static str>,
}

impl RechargeDecision {
    fn declined(reason: &'static str) -> Self {
        RechargeDecision {
            price_per_unit_cents: 0,
            units_to_buy: 0,
            currency: String::new(),
            declined: Some(reason),
        }
    }
}

/// The gate chain of the decision engine. Declinations come back as a
/// zero-unit decision; errors are stops the operator (configuration) or the
/// customer's guardrails (threshold/cap) asked for. The money-based and
/// count-based gates are independent: either alone blocks the purchase.
pub fn decide(inputs: &RechargeInputs) -> Result<RechargeDecision, RechargeError> {
    if !inputs.auto_recharge_enabled {
        return Ok(RechargeDecision::declined("auto-recharge disabled"));
    }

    let currency = inputs
        .currency
        .clone()
        .ok_or(RechargeError::MainCurrencyNotFound)?;

    let price = inputs
        .price_per_unit_cents
        .ok_or(RechargeError::AcademyServiceNotFound)?;
    if price <= 0 {
        return Err(RechargeError::PricePerUnitNotFound);
    }
    if price > inputs.recharge_amount_cents {
        return Err(RechargeError::PricePerUnitExceeded);
    }

    if inputs.allotment_units > 0 {
        let ratio = inputs.available_units as f64 / inputs.allotment_units as f64;
        if ratio > DEPLETION_RATIO {
            return Ok(RechargeDecision::declined("balance not depleted enough"));
        }
    }

    if inputs.has_unlimited {
        return Ok(RechargeDecision::declined("unlimited balance present"));
    }

    if inputs.available_units * price > inputs.recharge_threshold_cents {
        return Ok(RechargeDecision::declined(
            "remaining balance value above threshold",
        ));
    }

    if inputs.period_spend_cents >= inputs.recharge_threshold_cents {
        return Err(RechargeError::AutoRechargeThresholdReached);
    }
    if let Some(cap) = inputs.max_period_spend_cents {
        if inputs.period_spend_cents >= cap {
            return Err(RechargeError::MaxPeriodSpendReached);
        }
    }

    Ok(RechargeDecision {
        units_to_buy: inputs.recharge_amount_cents / price,
        price_per_unit_cents: price,
        currency,
        declined: None,
    })
}

/// Start of the monthly billing period containing `now`, anchored at the
/// funding source's `paid_at`.
pub fn period_start(paid_at: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now <= paid_at {
        return paid_at;
    }
    let months = (now.year() - paid_at.year()) * 12 + now.month() as i32 - paid_at.month() as i32;
    let months = months.max(0);

    let candidate = paid_at
        .checked_add_months(Months::new(months as u32))
        .unwrap_or(paid_at);
    if candidate <= now {
        candidate
    } else {
        paid_at
            .checked_add_months(Months::new((months - 1).max(0) as u32))
            .unwrap_or(paid_at)
    }
}

/// What a `ProcessAutoRecharge` job ended up doing.
#[derive(Debug)]
pub enum RechargeAttempt {
    Purchased { units: i64, amount_cents: i64 },
    Declined(&'static str),
    Stopped(RechargeError),
}

/// The funding source behind a consumable, whichever of the four owner
/// shapes it is reached through.
struct FundingAccount {
    subscription_id: Option<Uuid>,
    plan_financing_id: Option<Uuid>,
    academy_id: i32,
    paid_at: DateTime<Utc>,
    auto_recharge_enabled: bool,
    recharge_threshold_cents: i64,
    recharge_amount_cents: i64,
    max_period_spend_cents: Option<i64>,
}

impl From<Subscription> for FundingAccount {
    fn from(sub: Subscription) -> Self {
        FundingAccount {
            subscription_id: Some(sub.id),
            plan_financing_id: None,
            academy_id: sub.academy_id,
            paid_at: sub.paid_at,
            auto_recharge_enabled: sub.auto_recharge_enabled,
            recharge_threshold_cents: sub.recharge_threshold_cents,
            recharge_amount_cents: sub.recharge_amount_cents,
            max_period_spend_cents: sub.max_period_spend_cents,
        }
    }
}

impl From<PlanFinancing> for FundingAccount {
    fn from(pf: PlanFinancing) -> Self {
        FundingAccount {
            subscription_id: None,
            plan_financing_id: Some(pf.id),
            academy_id: pf.academy_id,
            paid_at: pf.paid_at,
            auto_recharge_enabled: pf.auto_recharge_enabled,
            recharge_threshold_cents: pf.recharge_threshold_cents,
            recharge_amount_cents: pf.recharge_amount_cents,
            max_period_spend_cents: pf.max_period_spend_cents,
        }
    }
}

async fn load_account(pool: &PgPool, funding: FundingRef) -> Result<FundingAccount> {
    match funding {
        FundingRef::Subscription(id) => {
            let sub = sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
                .bind(id)
                .fetch_optional(pool)
                .await?
                .ok_or_else(|| anyhow!("subscription {id} not found"))?;
            Ok(sub.into())
        }
        FundingRef::PlanFinancing(id) => {
            let pf =
                sqlx::query_as::<_, PlanFinancing>("SELECT * FROM plan_financings WHERE id = $1")
                    .bind(id)
                    .fetch_optional(pool)
                    .await?
                    .ok_or_else(|| anyhow!("plan financing {id} not found"))?;
            Ok(pf.into())
        }
        FundingRef::Seat(id) => {
            let sub = sqlx::query_as::<_, Subscription>(
                r#"
                SELECT sub.*
                FROM subscriptions sub
                JOIN subscription_billing_teams team ON team.subscription_id = sub.id
                JOIN subscription_seats seat ON seat.team_id = team.id
                WHERE seat.id = $1
                "#,
            )
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| anyhow!("seat {id} has no backing subscription"))?;
            Ok(sub.into())
        }
        FundingRef::TeamPool(id) => {
            let sub = sqlx::query_as::<_, Subscription>(
                r#"
                SELECT sub.*
                FROM subscriptions sub
                JOIN subscription_billing_teams team ON team.subscription_id = sub.id
                WHERE team.id = $1
                "#,
            )
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| anyhow!("billing team {id} has no backing subscription"))?;
            Ok(sub.into())
        }
    }
}

struct ServiceInfo {
    service_id: Uuid,
    slug: String,
    allotment_units: i64,
}

async fn load_service_info(pool: &PgPool, service_item_id: Uuid) -> Result<ServiceInfo> {
    let row = sqlx::query(
        r#"
        SELECT s.id AS service_id, s.slug, si.how_many
        FROM service_items si
        JOIN services s ON s.id = si.service_id
        WHERE si.id = $1
        "#,
    )
    .bind(service_item_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| anyhow!("service item {service_item_id} not found"))?;

    Ok(ServiceInfo {
        service_id: row.get("service_id"),
        slug: row.get("slug"),
        allotment_units: row.get("how_many"),
    })
}

async fn load_inputs(
    pool: &PgPool,
    account: &FundingAccount,
    service: &ServiceInfo,
    now: DateTime<Utc>,
) -> Result<RechargeInputs> {
    let currency: Option<String> = sqlx::query_scalar(
        r#"
        SELECT cur.code
        FROM academies a
        LEFT JOIN currencies cur ON cur.id = a.main_currency_id
        WHERE a.id = $1
        "#,
    )
    .bind(account.academy_id)
    .fetch_optional(pool)
    .await?
    .flatten();

    let price_per_unit_cents: Option<i64> = sqlx::query_scalar(
        "SELECT price_per_unit_cents FROM academy_services WHERE academy_id = $1 AND service_id = $2",
    )
    .bind(account.academy_id)
    .bind(service.service_id)
    .fetch_optional(pool)
    .await?;

    let balance_sql = if account.subscription_id.is_some() {
        r#"
        SELECT
            COALESCE(SUM(c.how_many) FILTER (WHERE c.how_many > 0), 0)::BIGINT AS available,
            COALESCE(BOOL_OR(c.how_many = -1), FALSE) AS has_unlimited
        FROM consumables c
        JOIN service_items si ON si.id = c.service_item_id
        WHERE si.service_id = $1
          AND (c.valid_until IS NULL OR c.valid_until >= $2)
          AND (
            c.subscription_id = $3
            OR c.subscription_billing_team_id IN (
                SELECT id FROM subscription_billing_teams WHERE subscription_id = $3
            )
            OR c.subscription_seat_id IN (
                SELECT seat.id
                FROM subscription_seats seat
                JOIN subscription_billing_teams team ON team.id = seat.team_id
                WHERE team.subscription_id = $3
            )
          )
        "#
    } else {
        r#"
        SELECT
            COALESCE(SUM(c.how_many) FILTER (WHERE c.how_many > 0), 0)::BIGINT AS available,
            COALESCE(BOOL_OR(c.how_many = -1), FALSE) AS has_unlimited
        FROM consumables c
        JOIN service_items si ON si.id = c.service_item_id
        WHERE si.service_id = $1
          AND (c.valid_until IS NULL OR c.valid_until >= $2)
          AND c.plan_financing_id = $3
        "#
    };
    let owner_id = account
        .subscription_id
        .or(account.plan_financing_id)
        .ok_or_else(|| anyhow!("funding account has no owner id"))?;
    let balance_row = sqlx::query(balance_sql)
        .bind(service.service_id)
        .bind(now)
        .bind(owner_id)
        .fetch_one(pool)
        .await?;

    let period_spend_cents: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(amount_cents), 0)::BIGINT
        FROM recharge_purchases
        WHERE (subscription_id = $1 OR plan_financing_id = $2)
          AND created_at >= $3
        "#,
    )
    .bind(account.subscription_id)
    .bind(account.plan_financing_id)
    .bind(period_start(account.paid_at, now))
    .fetch_one(pool)
    .await?;

    Ok(RechargeInputs {
        auto_recharge_enabled: account.auto_recharge_enabled,
        currency,
        price_per_unit_cents,
        recharge_amount_cents: account.recharge_amount_cents,
        recharge_threshold_cents: account.recharge_threshold_cents,
        max_period_spend_cents: account.max_period_spend_cents,
        available_units: balance_row.get("available"),
        allotment_units: service.allotment_units,
        has_unlimited: balance_row.get("has_unlimited"),
        period_spend_cents,
    })
}

/// Job body behind `ProcessAutoRecharge`. Evaluates the gate chain, charges
/// the payment method and tops the consumable up. Stops and declinations
/// are logged, never surfaced to the consuming user.
pub async fn process_auto_recharge(
    pool: &PgPool,
    bus: &BillingEventBus,
    gateway: &dyn PaymentGatewayAdapter,
    consumable_id: Uuid,
    now: DateTime<Utc>,
) -> Result<RechargeAttempt> {
    let consumable =
        sqlx::query_as::<_, Consumable>("SELECT * FROM consumables WHERE id = $1")
            .bind(consumable_id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| anyhow!("consumable {consumable_id} not found"))?;

    let account = load_account(pool, consumable.funding).await?;
    let service = load_service_info(pool, consumable.service_item_id).await?;
    let inputs = load_inputs(pool, &account, &service, now).await?;

    let decision = match decide(&inputs) {
        Ok(decision) => decision,
        Err(err) if err.is_guardrail() => {
            warn!(
                %consumable_id,
                service = %service.slug,
                %err,
                "auto-recharge stopped by spend guardrail"
            );
            return Ok(RechargeAttempt::Stopped(err));
        }
        Err(err) => {
            error!(
                %consumable_id,
                service = %service.slug,
                academy_id = account.academy_id,
                %err,
                "auto-recharge blocked by missing academy setup"
            );
            return Ok(RechargeAttempt::Stopped(err));
        }
    };

    if let Some(reason) = decision.declined {
        debug!(%consumable_id, service = %service.slug, reason, "auto-recharge declined");
        return Ok(RechargeAttempt::Declined(reason));
    }

    let amount_cents = decision.units_to_buy * decision.price_per_unit_cents;
    let reference = format!("auto-recharge:{consumable_id}");
    let charge = gateway
        .charge(amount_cents, &decision.currency, &reference)
        .await?;

    match charge.status {
        ChargeStatus::Succeeded => {}
        ChargeStatus::Pending => {
            info!(
                %consumable_id,
                amount_cents,
                "auto-recharge charge pending at the gateway; units withheld"
            );
            return Ok(RechargeAttempt::Declined("gateway charge pending"));
        }
        ChargeStatus::Failed => {
            warn!(%consumable_id, amount_cents, "auto-recharge charge failed at the gateway");
            return Ok(RechargeAttempt::Declined("gateway charge failed"));
        }
    }

    sqlx::query(
        r#"
        INSERT INTO recharge_purchases (
            id, subscription_id, plan_financing_id, service_id,
            amount_cents, currency, external_id
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(account.subscription_id)
    .bind(account.plan_financing_id)
    .bind(service.service_id)
    .bind(amount_cents)
    .bind(&decision.currency)
    .bind(charge.external_id)
    .execute(pool)
    .await?;

    // Unlimited rows never get here (the gate declines), so the guard only
    // protects against a concurrent flip.
    sqlx::query("UPDATE consumables SET how_many = how_many + $2 WHERE id = $1 AND how_many >= 0")
        .bind(consumable_id)
        .bind(decision.units_to_buy)
        .execute(pool)
        .await?;

    bus.publish(BillingEvent::BalanceReplenished { consumable_id })
        .await;

    info!(
        %consumable_id,
        service = %service.slug,
        units = decision.units_to_buy,
        amount_cents,
        "auto-recharge purchased units"
    );
    Ok(RechargeAttempt::Purchased {
        units: decision.units_to_buy,
        amount_cents,
    })
}
