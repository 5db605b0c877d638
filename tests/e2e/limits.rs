//! Rate-limit axes seen through the HTTP surface.

#![allow(clippy::expect_used, clippy::panic)]

use super::harness::{
    allocate_body, call, paid_body, post_request, TestGateway, BASE_PRICE_UNITS, PAYER,
};
use axum::http::{header, StatusCode};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// The burst limit is per client address.
#[tokio::test]
async fn test_ip_burst_limit() {
    let gate = TestGateway::setup_with(|c| c.limits.ip_burst_limit = 2).await;

    for id in ["job-ip0001", "job-ip0002"] {
        let (status, _, _) = gate.post("/allocate", allocate_body(id)).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    }

    let (status, headers, body) = gate.post("/allocate", allocate_body("job-ip0003")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "ip_burst_limit");
    assert_eq!(body["retryAfterSecs"], 60);
    assert_eq!(headers.get(header::RETRY_AFTER).expect("retry-after"), "60");

    // Rejections create no record
    let (status, _) = gate.get("/decisions/job-ip0003").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let elsewhere = SocketAddr::from((Ipv4Addr::new(192, 0, 2, 10), 50_000));
    let (status, _, _) = call(
        gate.app_from(elsewhere),
        post_request("/allocate", &allocate_body("job-ip0003"), &[]),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(gate.handler().metrics().snapshot().rate_limited, 1);
}

/// A trusted proxy's `X-Forwarded-For` identifies the client.
#[tokio::test]
async fn test_forwarded_for_keys_the_burst_limit() {
    let gate = TestGateway::setup_with(|c| {
        c.limits.ip_burst_limit = 1;
        c.server.trust_forwarded_for = true;
    })
    .await;

    let (status, _, _) = gate
        .post_with_headers(
            "/allocate",
            allocate_body("job-xff001"),
            &[("x-forwarded-for", "198.51.100.1")],
        )
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

    let (status, _, _) = gate
        .post_with_headers(
            "/allocate",
            allocate_body("job-xff002"),
            &[("x-forwarded-for", "198.51.100.2")],
        )
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

    let (status, _, _) = gate
        .post_with_headers(
            "/allocate",
            allocate_body("job-xff003"),
            &[("x-forwarded-for", "198.51.100.1, 10.0.0.1")],
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

/// The payer cap applies after verification and resets at UTC midnight.
/// The rejected payment stays usable.
#[tokio::test]
async fn test_payer_daily_cap() {
    let gate = TestGateway::setup_with(|c| c.limits.payer_daily_cap = 1).await;

    let first = gate.pay(PAYER, BASE_PRICE_UNITS);
    let (status, _, _) = gate
        .post("/allocate", paid_body("job-cap001", PAYER, Some(first)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let second = gate.pay(PAYER, BASE_PRICE_UNITS);
    let (status, headers, body) = gate
        .post("/allocate", paid_body("job-cap002", PAYER, Some(second)))
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "from_address_daily_cap");
    // 12:00 UTC: twelve hours until the counter resets
    assert_eq!(
        headers.get(header::RETRY_AFTER).expect("retry-after"),
        "43200"
    );

    gate.clock.advance(Duration::from_secs(24 * 60 * 60));

    // The day-old quote is refreshed first, then the same transfer is accepted
    let (status, _, body) = gate
        .post("/allocate", paid_body("job-cap002", PAYER, Some(second)))
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "quote_expired");

    let (status, _, accepted) = gate
        .post("/allocate", paid_body("job-cap002", PAYER, Some(second)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["payment"]["transactionId"], second.to_string());
}

/// Concurrent decisions from one payer cannot overshoot the daily cap,
/// even while job creation is slow.
#[tokio::test]
async fn test_payer_daily_cap_holds_under_concurrency() {
    let gate = TestGateway::setup_with(|c| c.limits.payer_daily_cap = 1).await;
    gate.pipeline.set_create_delay(Duration::from_millis(50));

    let mut handles = Vec::new();
    for n in 0..4 {
        let tx = gate.pay(PAYER, BASE_PRICE_UNITS);
        let body = paid_body(&format!("job-cap10{n}"), PAYER, Some(tx));
        let request = post_request("/allocate", &body, &[]);
        handles.push(tokio::spawn(call(gate.app(), request)));
    }

    let mut accepted = 0;
    let mut capped = 0;
    for handle in handles {
        let (status, _, body) = handle.await.expect("join");
        match status {
            StatusCode::ACCEPTED => accepted += 1,
            StatusCode::TOO_MANY_REQUESTS => {
                assert_eq!(body["error"], "from_address_daily_cap");
                capped += 1;
            }
            other => panic!("unexpected {other}: {body}"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(capped, 3);
    assert_eq!(gate.pipeline.job_count(), 1);
}

/// A failed job creation gives the payer's quota unit back.
#[tokio::test]
async fn test_payer_quota_returned_when_job_creation_fails() {
    let gate = TestGateway::setup_with(|c| c.limits.payer_daily_cap = 1).await;
    let tx = gate.pay(PAYER, BASE_PRICE_UNITS);

    gate.pipeline.fail_next_calls(100);
    let (status, _, body) = gate
        .post("/allocate", paid_body("job-cap201", PAYER, Some(tx)))
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY, "{body}");

    gate.pipeline.fail_next_calls(0);
    let (status, _, body) = gate
        .post("/allocate", paid_body("job-cap201", PAYER, Some(tx)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
}

/// A double-spend rejection does not use up the payer's quota.
#[tokio::test]
async fn test_payer_quota_returned_on_transaction_conflict() {
    let gate = TestGateway::setup_with(|c| c.limits.payer_daily_cap = 2).await;

    let first = gate.pay(PAYER, BASE_PRICE_UNITS);
    let (status, _, _) = gate
        .post("/allocate", paid_body("job-cap301", PAYER, Some(first)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _, _) = gate
        .post("/allocate", paid_body("job-cap302", PAYER, Some(first)))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let second = gate.pay(PAYER, BASE_PRICE_UNITS);
    let (status, _, body) = gate
        .post("/allocate", paid_body("job-cap302", PAYER, Some(second)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
}

/// The global cap counts running orchestrations.
#[tokio::test]
async fn test_global_concurrency_cap() {
    let gate = TestGateway::setup_with(|c| c.limits.global_concurrency_cap = 1).await;
    gate.pipeline.set_polls_per_phase(1_000_000);

    let first = gate.pay(PAYER, BASE_PRICE_UNITS);
    let (status, _, accepted) = gate
        .post("/allocate", paid_body("job-busy01", PAYER, Some(first)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let running_job = accepted["jobId"].as_str().expect("job id").to_string();

    let second = gate.pay(PAYER, BASE_PRICE_UNITS);
    let (status, headers, body) = gate
        .post("/allocate", paid_body("job-busy02", PAYER, Some(second)))
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "global_concurrency_cap");
    assert_eq!(headers.get(header::RETRY_AFTER).expect("retry-after"), "30");

    // Once the running job drains, the same proof is admitted
    gate.pipeline.set_polls_per_phase(1);
    gate.wait_for_job(&running_job).await;
    let (status, _, _) = gate
        .post("/allocate", paid_body("job-busy02", PAYER, Some(second)))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}
