//! Full admission flows against the devnet.

#![allow(clippy::expect_used)]

use super::harness::{
    allocate_body, call, paid_body, post_request, TestGateway, BASE_PRICE_UNITS, OTHER_PAYER,
    PAYER,
};
use allocation_gate::payment::EvmAddress;
use axum::http::StatusCode;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;

/// Quote, pay, admit, complete, replay.
#[tokio::test]
async fn test_end_to_end_job_aaa111() {
    let gate = TestGateway::setup().await;

    // No proof: priced 402
    let (status, _, quote) = gate.post("/allocate", allocate_body("job-aaa111")).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(quote["error"], "payment_required");
    assert_eq!(quote["amountUsdc"], "19");
    assert_eq!(quote["asset"], "USDC");
    assert_eq!(quote["decisionId"], "job-aaa111");
    assert_eq!(quote["payTo"], gate.pay_to().to_string());
    assert_eq!(quote["accepts"][0]["minAmountUnits"], "19000000");

    // Pay and resubmit
    let tx = gate.pay(PAYER, BASE_PRICE_UNITS);
    let (status, _, accepted) = gate
        .post("/allocate", paid_body("job-aaa111", PAYER, Some(tx)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["status"], "accepted");
    assert_eq!(accepted["decisionId"], "job-aaa111");
    assert_eq!(accepted["payment"]["required"], true);
    assert_eq!(accepted["payment"]["verified"], true);
    assert_eq!(accepted["payment"]["chargedAmount"], "19");
    assert_eq!(accepted["payment"]["fromAddress"], PAYER.to_string());
    assert_eq!(accepted["payment"]["transactionId"], tx.to_string());
    assert_eq!(accepted["inputs"]["riskTolerance"], "Balanced");
    assert_eq!(accepted["inputs"]["timeframe"], "1-3_years");

    let job_id = accepted["jobId"].as_str().expect("job id").to_string();
    let status_path = accepted["statusPath"].as_str().expect("status path").to_string();
    assert_eq!(status_path, format!("/jobs/{job_id}"));

    // Poll until the pipeline is done
    let progress = gate.wait_for_job(&job_id).await;
    assert_eq!(progress.phases_completed, 4);
    let (status, job) = gate.get(&status_path).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["state"], "complete");
    assert_eq!(
        gate.pipeline
            .started_phases(&allocation_gate::JobId::new(job_id.clone())),
        vec![1, 2, 3, 4]
    );

    // Any further identical POST replays with 200
    let (status, _, replay) = gate
        .post("/allocate", paid_body("job-aaa111", PAYER, Some(tx)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay["status"], "already_complete");
    assert_eq!(replay["jobId"], job_id.as_str());

    let (status, _, replay) = gate.post("/allocate", allocate_body("job-aaa111")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay["status"], "already_complete");
    assert_eq!(gate.pipeline.job_count(), 1);
}

/// A proof without a transaction id is matched by scanning.
#[tokio::test]
async fn test_scan_finds_payment_without_transaction_id() {
    let gate = TestGateway::setup().await;
    let tx = gate.pay(PAYER, BASE_PRICE_UNITS);

    let (status, _, accepted) = gate
        .post("/allocate", paid_body("job-scan01", PAYER, None))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["payment"]["transactionId"], tx.to_string());
}

/// An underpayment is never accepted.
#[tokio::test]
async fn test_underpayment_is_not_confirmed() {
    let gate = TestGateway::setup_with(|c| c.payment.verify_timeout_secs = 1).await;
    let tx = gate.pay(PAYER, BASE_PRICE_UNITS - 1);

    let (status, _, body) = gate
        .post("/allocate", paid_body("job-short1", PAYER, Some(tx)))
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "payment_not_confirmed");
    assert_eq!(body["amountUsdc"], "19");
}

/// A phase failure ends the job; the decision stays accepted.
#[tokio::test]
async fn test_partial_failure_at_phase_3() {
    let gate = TestGateway::setup().await;
    gate.pipeline.fail_phase(3, "rate source unavailable");

    let tx = gate.pay(PAYER, BASE_PRICE_UNITS);
    let (status, _, accepted) = gate
        .post("/allocate", paid_body("job-fail03", PAYER, Some(tx)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = accepted["jobId"].as_str().expect("job id").to_string();

    let progress = gate.wait_for_job(&job_id).await;
    assert_eq!(progress.state, allocation_gate::JobState::Failed);
    assert_eq!(progress.phases_completed, 2);
    assert_eq!(progress.current_phase, 3);
    assert!(progress
        .error
        .as_deref()
        .is_some_and(|e| e.contains("rate source unavailable")));
    assert_eq!(
        gate.pipeline
            .started_phases(&allocation_gate::JobId::new(job_id.clone())),
        vec![1, 2, 3]
    );

    let (_, job) = gate.get(&format!("/jobs/{job_id}")).await;
    assert_eq!(job["state"], "failed");
    assert_eq!(job["errorCode"], "pipeline_phase_failed");

    // Not complete, so never a 200; and no second job
    let (status, _, replay) = gate
        .post("/allocate", paid_body("job-fail03", PAYER, Some(tx)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(replay["status"], "already_accepted");
    assert_eq!(gate.pipeline.job_count(), 1);
}

/// Concurrent identical submissions start exactly one job.
#[tokio::test]
async fn test_concurrent_submissions_start_one_job() {
    let gate = TestGateway::setup().await;
    let tx = gate.pay(PAYER, BASE_PRICE_UNITS);
    let body = paid_body("job-race01", PAYER, Some(tx));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let app = gate.app();
        let request = post_request("/allocate", &body, &[]);
        handles.push(tokio::spawn(call(app, request)));
    }

    let mut job_ids = HashSet::new();
    let mut fresh = 0;
    for handle in handles {
        let (status, _, response) = handle.await.expect("join");
        assert!(
            status == StatusCode::ACCEPTED || status == StatusCode::OK,
            "unexpected {status}: {response}"
        );
        if response["status"] == "accepted" {
            fresh += 1;
        }
        job_ids.insert(response["jobId"].as_str().expect("job id").to_string());
    }

    assert_eq!(fresh, 1);
    assert_eq!(job_ids.len(), 1);
    assert_eq!(gate.pipeline.job_count(), 1);
    assert_eq!(gate.handler().metrics().snapshot().admissions, 1);
}

/// One transaction cannot fund two decisions.
#[tokio::test]
async fn test_double_spend_rejected() {
    let gate = TestGateway::setup().await;
    let tx = gate.pay(PAYER, BASE_PRICE_UNITS);

    let (status, _, _) = gate
        .post("/allocate", paid_body("job-aaa111", PAYER, Some(tx)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _, body) = gate
        .post("/allocate", paid_body("job-bbb222", PAYER, Some(tx)))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "transaction_already_claimed");

    let (status, record) = gate.get("/decisions/job-bbb222").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["state"], "quoted");
    assert!(record["payment"].is_null());
    assert_eq!(gate.pipeline.job_count(), 1);
}

/// A transfer emitted by some other token contract is not a payment.
#[tokio::test]
async fn test_transfer_of_another_token_is_not_payment() {
    let gate = TestGateway::setup_with(|c| c.payment.verify_timeout_secs = 1).await;
    let worthless = EvmAddress::new([0x66; 20]);
    let tx = gate
        .chain
        .transfer_token(worthless, PAYER, gate.pay_to(), BASE_PRICE_UNITS);

    let (status, _, body) = gate
        .post("/allocate", paid_body("job-fake01", PAYER, Some(tx)))
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "payment_not_confirmed");
    assert_eq!(gate.pipeline.job_count(), 0);
}

/// Scanning never re-matches a transfer that already funds another decision.
#[tokio::test]
async fn test_scan_skips_claimed_transfer() {
    let gate = TestGateway::setup_with(|c| c.payment.verify_timeout_secs = 1).await;
    let first = gate.pay(PAYER, BASE_PRICE_UNITS);

    let (status, _, accepted) = gate
        .post("/allocate", paid_body("job-aaa111", PAYER, None))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["payment"]["transactionId"], first.to_string());

    let (status, _, body) = gate
        .post("/allocate", paid_body("job-bbb222", PAYER, None))
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "payment_not_confirmed");

    let second = gate.pay(PAYER, BASE_PRICE_UNITS);
    let (status, _, accepted) = gate
        .post("/allocate", paid_body("job-bbb222", PAYER, None))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["payment"]["transactionId"], second.to_string());
}

/// Changed inputs under the same identifier are a conflict and change nothing.
#[tokio::test]
async fn test_fingerprint_conflict_leaves_record_untouched() {
    let gate = TestGateway::setup().await;
    let (status, _, _) = gate.post("/allocate", allocate_body("job-aaa111")).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    let (_, before) = gate.get("/decisions/job-aaa111").await;

    let mut changed = allocate_body("job-aaa111");
    changed["riskTolerance"] = json!("Aggressive");
    let (status, _, body) = gate.post("/allocate", changed.clone()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "fingerprint_conflict");

    let (_, after) = gate.get("/decisions/job-aaa111").await;
    assert_eq!(before, after);
    assert_eq!(after["inputs"]["riskTolerance"], "Balanced");

    // Still a conflict once accepted, even with a valid payment attached
    let tx = gate.pay(PAYER, BASE_PRICE_UNITS);
    let (status, _, _) = gate
        .post("/allocate", paid_body("job-aaa111", PAYER, Some(tx)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    changed["payment"] = json!({ "fromAddress": PAYER.to_string() });
    let (status, _, _) = gate.post("/allocate", changed).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(gate.handler().metrics().snapshot().conflicts, 2);
}

/// A proof against a lapsed quote gets a refreshed quote first.
#[tokio::test]
async fn test_quote_expiry_requotes_before_payment() {
    let gate = TestGateway::setup().await;
    let (_, _, first) = gate.post("/allocate", allocate_body("job-late01")).await;

    gate.clock.advance(Duration::from_secs(16 * 60));
    let tx = gate.pay(PAYER, BASE_PRICE_UNITS);

    let (status, _, body) = gate
        .post("/allocate", paid_body("job-late01", PAYER, Some(tx)))
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "quote_expired");
    assert_ne!(body["quoteExpiresAt"], first["quoteExpiresAt"]);

    let (status, _, accepted) = gate
        .post("/allocate", paid_body("job-late01", PAYER, Some(tx)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["status"], "accepted");
}

/// A payment that has not landed yet can be retried with the same proof.
#[tokio::test]
async fn test_unconfirmed_payment_can_be_retried() {
    let gate = TestGateway::setup_with(|c| c.payment.verify_timeout_secs = 1).await;

    let (status, _, body) = gate
        .post("/allocate", paid_body("job-wait01", OTHER_PAYER, None))
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "payment_not_confirmed");

    gate.pay(OTHER_PAYER, BASE_PRICE_UNITS);
    let (status, _, _) = gate
        .post("/allocate", paid_body("job-wait01", OTHER_PAYER, None))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(gate.handler().metrics().snapshot().payment_failures, 1);
}

/// The report route prices the add-on and refuses a contradicting flag.
#[tokio::test]
async fn test_report_route() {
    let gate = TestGateway::setup().await;
    let body = json!({
        "decisionId": "job-rep001",
        "riskTolerance": "Conservative",
        "timeframe": "3+_years",
    });

    let (status, _, quote) = gate.post("/allocate/report", body.clone()).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(quote["amountUsdc"], "29");

    let mut contradicting = body;
    contradicting["decisionId"] = json!("job-rep002");
    contradicting["withReport"] = json!(false);
    let (status, _, error) = gate.post("/allocate/report", contradicting).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "validation_error");
}

/// A zero price admits without payment.
#[tokio::test]
async fn test_zero_price_admits_without_payment() {
    let gate = TestGateway::setup_with(|c| {
        c.pricing.base_price = "0".to_string();
        c.pricing.report_add_on = "0".to_string();
    })
    .await;

    let (status, _, accepted) = gate.post("/allocate", allocate_body("job-free01")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["payment"]["required"], false);
    assert_eq!(accepted["payment"]["verified"], false);
    assert_eq!(gate.pipeline.job_count(), 1);
}
