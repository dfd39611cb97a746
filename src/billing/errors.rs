use thiserror::Error;

/// Errors on the consumption path. `NoEligibleBalance` and
/// `InsufficientBalance` are ordinary out-of-credits conditions the API
/// layer turns into a 402, not server faults.
#[derive(Debug, Error)]
pub enum ConsumptionError {
    #[error("no eligible balance")]
    NoEligibleBalance,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("session can no longer be consumed")]
    OperationNotRetriable,
    #[error("charge amount must be positive")]
    InvalidAmount,
    #[error("consumable not found")]
    NotFound,
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Auto-recharge stoppers. Configuration variants point at missing academy
/// setup; the threshold/cap variants are guardrails protecting the customer
/// from runaway spend. None of these ever reach the consuming user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RechargeError {
    #[error("academy has no main currency configured")]
    MainCurrencyNotFound,
    #[error("service is not priced for this academy")]
    AcademyServiceNotFound,
    #[error("price per unit is missing or non-positive")]
    PricePerUnitNotFound,
    #[error("a single unit costs more than the recharge amount")]
    PricePerUnitExceeded,
    #[error("period spend reached the recharge threshold")]
    AutoRechargeThresholdReached,
    #[error("period spend reached the max period spend cap")]
    MaxPeriodSpendReached,
}

impl RechargeError {
    /// Guardrails are intentional stops; everything else is missing setup
    /// an operator has to fix.
    pub fn is_guardrail(&self) -> bool {
        matches!(
            self,
            RechargeError::AutoRechargeThresholdReached | RechargeError::MaxPeriodSpendReached
        )
    }
}
