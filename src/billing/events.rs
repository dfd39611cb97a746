use sqlx::PgPool;
use tokio::sync::mpsc::{channel, Sender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::job_queue::{self, Job};

use super::models::Consumable;
use super::permissions::{self, PermissionCache};

/// key: billing-events -> explicit replacement for implicit signal dispatch
///
/// Every ledger mutation announces itself here; the worker below runs the
/// permission projection and schedules auto-recharge evaluation. Ordering is
/// the channel order, so an exhaustion is always reviewed before the
/// recharge that may refill it is enqueued.
#[derive(Debug, Clone)]
pub enum BillingEvent {
    /// A charge succeeded. Consumed by analytics/notifications downstream.
    ServiceConsumed {
        consumable_id: Uuid,
        user_id: Option<i32>,
        how_many: i64,
    },
    /// A consumable hit zero.
    BalanceExhausted { consumable_id: Uuid },
    /// New stock appeared for an owner (build, renewal or recharge).
    BalanceReplenished { consumable_id: Uuid },
}

/// key: billing-events-handle -> publish interface
#[derive(Clone)]
pub struct BillingEventBus {
    sender: Sender<BillingEvent>,
}

impl BillingEventBus {
    /// Publishing is best-effort: a full or closed bus must never fail the
    /// charge that triggered the event.
    pub async fn publish(&self, event: BillingEvent) {
        if let Err(err) = self.sender.send(event).await {
            warn!(?err, "billing event bus dropped an event");
        }
    }
}

pub fn start_event_worker(pool: PgPool, cache: PermissionCache) -> BillingEventBus {
    let (tx, mut rx) = channel(128);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                BillingEvent::ServiceConsumed {
                    consumable_id,
                    user_id,
                    how_many,
                } => {
                    info!(
                        %consumable_id,
                        ?user_id,
                        how_many,
                        "service consumed"
                    );
                }
                BillingEvent::BalanceExhausted { consumable_id } => {
                    let Some(consumable) = load_consumable(&pool, consumable_id).await else {
                        continue;
                    };
                    if let Err(err) =
                        permissions::review_user_access(&pool, &cache, &consumable).await
                    {
                        error!(
                            ?err,
                            %consumable_id,
                            "permission review after exhaustion failed"
                        );
                    }
                    job_queue::enqueue_job(&pool, &Job::ProcessAutoRecharge { consumable_id })
                        .await;
                }
                BillingEvent::BalanceReplenished { consumable_id } => {
                    let Some(consumable) = load_consumable(&pool, consumable_id).await else {
                        continue;
                    };
                    if let Err(err) =
                        permissions::grant_for_consumable(&pool, &cache, &consumable).await
                    {
                        error!(
                            ?err,
                            %consumable_id,
                            "permission grant after replenishment failed"
                        );
                    } else {
                        debug!(%consumable_id, "permissions refreshed after replenishment");
                    }
                }
            }
        }
    });

    BillingEventBus { sender: tx }
}

async fn load_consumable(pool: &PgPool, consumable_id: Uuid) -> Option<Consumable> {
    match sqlx::query_as::<_, Consumable>("SELECT * FROM consumables WHERE id = $1")
        .bind(consumable_id)
        .fetch_optional(pool)
        .await
    {
        Ok(Some(consumable)) => Some(consumable),
        Ok(None) => {
            warn!(%consumable_id, "billing event referenced a missing consumable");
            None
        }
        Err(err) => {
            error!(?err, %consumable_id, "failed to load consumable for event");
            None
        }
    }
}
