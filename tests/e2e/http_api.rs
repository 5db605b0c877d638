//! HTTP surface: routing, headers, and error bodies.

#![allow(clippy::expect_used)]

use super::harness::{allocate_body, paid_body, TestGateway, BASE_PRICE_UNITS, PAYER};
use allocation_gate::allocation::{PaymentProofBody, IDEMPOTENCY_KEY_HEADER, PAYMENT_HEADER};
use allocation_gate::devnet::DEV_TRANSFER_PATH;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;

#[tokio::test]
async fn test_healthz() {
    let gate = TestGateway::setup().await;
    let (status, body) = gate.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_metrics_endpoint_counts_quotes() {
    let gate = TestGateway::setup().await;
    gate.post("/allocate", allocate_body("job-met001")).await;
    gate.post("/allocate", allocate_body("job-met001")).await;

    let (status, metrics) = gate.get("/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["quotesIssued"], 2);
    assert_eq!(metrics["admissions"], 0);
}

#[tokio::test]
async fn test_requoting_keeps_the_live_quote() {
    let gate = TestGateway::setup().await;
    let (_, _, first) = gate.post("/allocate", allocate_body("job-twice1")).await;
    let (_, _, second) = gate.post("/allocate", allocate_body("job-twice1")).await;
    assert_eq!(first["quoteExpiresAt"], second["quoteExpiresAt"]);
}

#[tokio::test]
async fn test_idempotency_header_aliases_decision_id() {
    let gate = TestGateway::setup().await;
    let mut body = allocate_body("unused");
    body.as_object_mut().expect("object").remove("decisionId");

    let (status, _, quote) = gate
        .post_with_headers(
            "/allocate",
            body.clone(),
            &[(IDEMPOTENCY_KEY_HEADER, "job-hdr001")],
        )
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(quote["decisionId"], "job-hdr001");

    let (status, _, error) = gate
        .post_with_headers(
            "/allocate",
            allocate_body("job-hdr001"),
            &[(IDEMPOTENCY_KEY_HEADER, "job-hdr999")],
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "validation_error");
}

#[tokio::test]
async fn test_validation_errors() {
    let gate = TestGateway::setup().await;

    let (status, _, error) = gate
        .post(
            "/allocate",
            json!({ "riskTolerance": "Balanced", "timeframe": "1-3_years" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "validation_error");

    let (status, _, _) = gate.post("/allocate", allocate_body("job aaa111")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut unknown_enum = allocate_body("job-enum01");
    unknown_enum["timeframe"] = json!("forever");
    let (status, _, error) = gate.post("/allocate", unknown_enum).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "validation_error");

    let request = Request::builder()
        .method("POST")
        .uri("/allocate")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .expect("request");
    let (status, _, error) = super::harness::call(gate.app(), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "validation_error");
}

#[tokio::test]
async fn test_payment_header_carries_proof() {
    let gate = TestGateway::setup().await;
    let tx = gate.pay(PAYER, BASE_PRICE_UNITS);
    let proof = PaymentProofBody {
        from_address: PAYER.to_string(),
        transaction_id: Some(tx.to_string()),
    }
    .to_header();

    let (status, _, accepted) = gate
        .post_with_headers(
            "/allocate",
            allocate_body("job-xpay01"),
            &[(PAYMENT_HEADER, proof.as_str())],
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["payment"]["transactionId"], tx.to_string());
}

#[tokio::test]
async fn test_malformed_proof_is_payment_required() {
    let gate = TestGateway::setup().await;
    let mut body = allocate_body("job-badp01");
    body["payment"] = json!({ "fromAddress": "0x123" });

    let (status, _, quote) = gate.post("/allocate", body).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(quote["error"], "invalid_payment_proof");
    assert_eq!(quote["amountUsdc"], "19");
}

#[tokio::test]
async fn test_unknown_resources_are_404() {
    let gate = TestGateway::setup().await;
    let (status, body) = gate.get("/jobs/job-nothing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, _) = gate.get("/decisions/job-nothing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_devnet_transfer_route() {
    let gate = TestGateway::setup().await;
    let (status, _, transfer) = gate
        .post(
            DEV_TRANSFER_PATH,
            json!({ "fromAddress": PAYER.to_string(), "amountUnits": "19000000" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let tx = transfer["transactionId"]
        .as_str()
        .expect("transaction id")
        .parse()
        .expect("tx hash");

    let (status, _, _) = gate
        .post("/allocate", paid_body("job-devt01", PAYER, Some(tx)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}
