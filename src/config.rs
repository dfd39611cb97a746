use once_cell::sync::Lazy;

/// Secret used to derive deterministic consumption-session reservation keys.
/// Must be set via the `SESSION_KEY_SECRET` env variable.
pub static SESSION_KEY_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("SESSION_KEY_SECRET").expect("SESSION_KEY_SECRET must be set"));

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| truthy(&value))
        .unwrap_or(false)
});

/// key: billing-config -> how long a consumption session reservation lives
pub static SESSION_LIFETIME_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("SESSION_LIFETIME_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(3600)
});

/// key: billing-config -> replenishment scan cadence
pub static STOCK_SCAN_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("STOCK_SCAN_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(300)
});

/// key: billing-config -> keep-alive horizon ahead of a late renewal
pub static STOCK_KEEPALIVE_HOURS: Lazy<i64> = Lazy::new(|| {
    std::env::var("STOCK_KEEPALIVE_HOURS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(2)
});

/// key: billing-config -> operational switch to serve without charging
pub static BYPASS_CONSUMPTION: Lazy<bool> = Lazy::new(|| {
    std::env::var("BYPASS_CONSUMPTION")
        .ok()
        .map(|value| truthy(&value))
        .unwrap_or(false)
});

/// Base URL of the payment gateway service handling actual charges.
pub static PAYMENT_GATEWAY_ENDPOINT: Lazy<String> = Lazy::new(|| {
    std::env::var("PAYMENT_GATEWAY_ENDPOINT")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "http://127.0.0.1:8787".to_string())
});

/// Optional bearer token presented to the payment gateway.
pub static PAYMENT_GATEWAY_TOKEN: Lazy<Option<String>> = Lazy::new(|| {
    std::env::var("PAYMENT_GATEWAY_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
});

fn truthy(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes")
}
