use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::billing::adapters::PaymentGatewayAdapter;
use crate::billing::events::BillingEventBus;
use crate::billing::{recharge, stock};

/// Task-queue entry points of the billing core. The transport is a plain
/// DB-backed queue; the jobs themselves are the pure logic in `billing`.
#[derive(Debug, Serialize, Deserialize)]
pub enum Job {
    ProcessAutoRecharge { consumable_id: Uuid },
    BuildStockFromSubscription { subscription_id: Uuid },
    BuildStockFromPlanFinancing { plan_financing_id: Uuid },
    RenewSubscription { subscription_id: Uuid },
}

pub async fn enqueue_job(pool: &PgPool, job: &Job) {
    let payload = match serde_json::to_value(job) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(?err, ?job, "failed to serialize billing job");
            return;
        }
    };
    if let Err(err) = sqlx::query("INSERT INTO job_queue (payload) VALUES ($1)")
        .bind(payload)
        .execute(pool)
        .await
    {
        tracing::warn!(?err, ?job, "failed to enqueue billing job");
    }
}

async fn run_job(
    pool: PgPool,
    bus: BillingEventBus,
    gateway: Arc<dyn PaymentGatewayAdapter>,
    job: Job,
) {
    match job {
        Job::ProcessAutoRecharge { consumable_id } => {
            match recharge::process_auto_recharge(
                &pool,
                &bus,
                gateway.as_ref(),
                consumable_id,
                Utc::now(),
            )
            .await
            {
                Ok(attempt) => {
                    tracing::debug!(%consumable_id, ?attempt, "auto-recharge job finished");
                }
                Err(err) => {
                    tracing::warn!(?err, %consumable_id, "auto-recharge job failed");
                }
            }
        }
        Job::BuildStockFromSubscription { subscription_id } => {
            if let Err(err) =
                stock::build_from_subscription(&pool, &bus, subscription_id, Utc::now()).await
            {
                tracing::warn!(?err, %subscription_id, "stock build job failed");
            }
        }
        Job::BuildStockFromPlanFinancing { plan_financing_id } => {
            if let Err(err) =
                stock::build_from_plan_financing(&pool, &bus, plan_financing_id, Utc::now()).await
            {
                tracing::warn!(?err, %plan_financing_id, "stock build job failed");
            }
        }
        Job::RenewSubscription { subscription_id } => {
            if let Err(err) =
                stock::renew_subscription(&pool, &bus, subscription_id, Utc::now()).await
            {
                tracing::warn!(?err, %subscription_id, "subscription renewal job failed");
            } else {
                tracing::info!(%subscription_id, "subscription renewal job completed");
            }
        }
    }
}

pub fn start_worker(
    pool: PgPool,
    bus: BillingEventBus,
    gateway: Arc<dyn PaymentGatewayAdapter>,
) -> Sender<Job> {
    let (tx, mut rx): (Sender<Job>, Receiver<Job>) = channel(32);

    // Drain the persisted queue. A row is deleted only once its job body has
    // run, so a crash mid-job leaves it in 'processing' for the restart
    // sweep below and nothing queued is ever lost.
    let db_pool = pool.clone();
    let replay_bus = bus.clone();
    let replay_gateway = gateway.clone();
    tokio::spawn(async move {
        // Jobs a previous run marked but never finished go back in line.
        if let Err(err) =
            sqlx::query("UPDATE job_queue SET status = 'queued' WHERE status = 'processing'")
                .execute(&db_pool)
                .await
        {
            tracing::warn!(?err, "failed to requeue stranded billing jobs");
        }

        loop {
            let rows = sqlx::query(
                "SELECT id, payload FROM job_queue WHERE status = 'queued' ORDER BY id",
            )
            .fetch_all(&db_pool)
            .await
            .unwrap_or_default();
            for row in rows {
                let id: i32 = row.get("id");
                let payload: Value = row.get("payload");
                match serde_json::from_value::<Job>(payload) {
                    Ok(job) => {
                        let _ = sqlx::query(
                            "UPDATE job_queue SET status = 'processing' WHERE id = $1",
                        )
                        .bind(id)
                        .execute(&db_pool)
                        .await;
                        run_job(
                            db_pool.clone(),
                            replay_bus.clone(),
                            replay_gateway.clone(),
                            job,
                        )
                        .await;
                        let _ = sqlx::query("DELETE FROM job_queue WHERE id = $1")
                            .bind(id)
                            .execute(&db_pool)
                            .await;
                    }
                    Err(err) => {
                        // An unparseable payload would otherwise be retried
                        // forever.
                        tracing::warn!(?err, id, "dropping undecodable billing job");
                        let _ = sqlx::query("DELETE FROM job_queue WHERE id = $1")
                            .bind(id)
                            .execute(&db_pool)
                            .await;
                    }
                }
            }
            sleep(Duration::from_secs(5)).await;
        }
    });

    // In-process sends (admin triggers) bypass the table entirely.
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            tokio::spawn(run_job(
                pool.clone(),
                bus.clone(),
                gateway.clone(),
                job,
            ));
        }
    });
    tx
}
