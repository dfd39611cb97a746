pub mod adapters;
pub mod api;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod models;
pub mod permissions;
pub mod recharge;
pub mod resolver;
pub mod sessions;
pub mod stock;

pub use adapters::{
    ChargeStatus, GatewayCharge, HttpGatewayAdapter, PaymentGatewayAdapter, StubGatewayAdapter,
};
pub use errors::{ConsumptionError, RechargeError};
pub use events::{start_event_worker, BillingEvent, BillingEventBus};
pub use ledger::{charge as ledger_charge, list_eligible, ChargeOutcome};
pub use models::{
    Consumable, ConsumptionSession, ConsumptionStrategy, FundingRef, PlanFinancing, Service,
    ServiceItem, ServiceStockScheduler, Subscription, SubscriptionBillingTeam, SubscriptionSeat,
};
pub use permissions::PermissionCache;
pub use recharge::{decide as evaluate_recharge, RechargeDecision, RechargeInputs};
pub use resolver::{EntitlementResolver, Resolution, ResolverSettings};
pub use stock::{process_tick as run_stock_replenishment_tick, spawn as spawn_stock_scheduler};
