use academy_billing::billing::{ChargeStatus, HttpGatewayAdapter, PaymentGatewayAdapter};
use httpmock::prelude::*;
use serde_json::json;

// key: billing-gateway-tests -> wire format against a mock provider

#[tokio::test]
async fn posts_the_charge_and_parses_a_success() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/charges")
                .header("authorization", "Bearer gw-token")
                .json_body(json!({
                    "amount_cents": 2000,
                    "currency": "USD",
                    "reference": "auto-recharge:abc",
                }));
            then.status(200).json_body(json!({
                "status": "succeeded",
                "external_id": "ch_123",
            }));
        })
        .await;

    let adapter = HttpGatewayAdapter::new(server.base_url(), Some("gw-token".into()));
    let charge = adapter
        .charge(2000, "USD", "auto-recharge:abc")
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(charge.status, ChargeStatus::Succeeded);
    assert_eq!(charge.external_id.as_deref(), Some("ch_123"));
}

#[tokio::test]
async fn maps_pending_and_failed_statuses() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/charges");
            then.status(200).json_body(json!({ "status": "pending" }));
        })
        .await;

    let adapter = HttpGatewayAdapter::new(server.base_url(), None);
    let charge = adapter.charge(500, "EUR", "ref-1").await.unwrap();
    assert_eq!(charge.status, ChargeStatus::Pending);
    assert!(charge.external_id.is_none());
}

#[tokio::test]
async fn non_2xx_responses_become_errors() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/charges");
            then.status(502);
        })
        .await;

    let adapter = HttpGatewayAdapter::new(server.base_url(), None);
    let err = adapter.charge(500, "USD", "ref-2").await.unwrap_err();
    assert!(err.to_string().contains("502"));
}

#[tokio::test]
async fn unknown_statuses_are_rejected() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/charges");
            then.status(200).json_body(json!({ "status": "maybe" }));
        })
        .await;

    let adapter = HttpGatewayAdapter::new(server.base_url(), None);
    let err = adapter.charge(500, "USD", "ref-3").await.unwrap_err();
    assert!(err.to_string().contains("unknown status"));
}
