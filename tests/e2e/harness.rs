//! Test gateway harness.

#![allow(clippy::expect_used, dead_code)]

use allocation_gate::devnet::{DevChain, DevPipeline};
use allocation_gate::payment::{EvmAddress, TxHash};
use allocation_gate::pipeline::{JobProgress, JobState};
use allocation_gate::{
    AdmissionHandler, Clock, GatewayBuilder, GatewayConfig, JobId, ManualClock, RunningGateway,
};
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// Payer used by most tests.
pub const PAYER: EvmAddress = EvmAddress::new([0xab; 20]);

/// A second, unrelated payer.
pub const OTHER_PAYER: EvmAddress = EvmAddress::new([0xcd; 20]);

/// Units of the default 19 USDC price.
pub const BASE_PRICE_UNITS: u128 = 19_000_000;

/// How long to wait for an orchestration to finish.
const JOB_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// A gateway on the devnet with a manual clock.
pub struct TestGateway {
    gateway: RunningGateway,
    /// Devnet chain.
    pub chain: Arc<DevChain>,
    /// Devnet pipeline.
    pub pipeline: Arc<DevPipeline>,
    /// Gateway clock.
    pub clock: Arc<ManualClock>,
}

impl TestGateway {
    /// Gateway with fast devnet timings.
    pub async fn setup() -> Self {
        Self::setup_with(|_| {}).await
    }

    /// Gateway with fast devnet timings, then `configure` applied.
    pub async fn setup_with(configure: impl FnOnce(&mut GatewayConfig)) -> Self {
        let mut config = GatewayConfig::development();
        config.pipeline.poll_interval_ms = 10;
        config.payment.scan_poll_interval_ms = 20;
        config.payment.verify_timeout_secs = 2;
        config.payment.upstream_backoff_ms = 10;
        config.pipeline.upstream_backoff_ms = 10;
        configure(&mut config);

        let chain = Arc::new(DevChain::new());
        let pipeline = Arc::new(DevPipeline::new());
        let start = Utc
            .with_ymd_and_hms(2026, 3, 2, 12, 0, 0)
            .single()
            .expect("valid start time");
        let clock = Arc::new(ManualClock::new(start));

        let gateway = GatewayBuilder::new(config)
            .with_devnet(Arc::clone(&chain), Arc::clone(&pipeline))
            .with_clock(Arc::clone(&clock) as Arc<dyn Clock>)
            .build()
            .await
            .expect("gateway builds");

        Self {
            gateway,
            chain,
            pipeline,
            clock,
        }
    }

    /// The admission handler.
    pub fn handler(&self) -> &Arc<AdmissionHandler> {
        self.gateway.handler()
    }

    /// Router whose requests appear to come from 127.0.0.1.
    pub fn app(&self) -> Router {
        self.app_from(SocketAddr::from((Ipv4Addr::LOCALHOST, 50_000)))
    }

    /// Router whose requests appear to come from `peer`.
    pub fn app_from(&self, peer: SocketAddr) -> Router {
        self.gateway.router().layer(MockConnectInfo(peer))
    }

    /// Receiving address.
    pub fn pay_to(&self) -> EvmAddress {
        self.handler().pay_to()
    }

    /// Transfer `units` from `from` to the gateway and mine it.
    pub fn pay(&self, from: EvmAddress, units: u128) -> TxHash {
        self.chain.transfer(from, self.pay_to(), units)
    }

    /// POST a JSON body.
    pub async fn post(&self, path: &str, body: Value) -> (StatusCode, HeaderMap, Value) {
        call(self.app(), post_request(path, &body, &[])).await
    }

    /// POST a JSON body with extra headers.
    pub async fn post_with_headers(
        &self,
        path: &str,
        body: Value,
        headers: &[(&str, &str)],
    ) -> (StatusCode, HeaderMap, Value) {
        call(self.app(), post_request(path, &body, headers)).await
    }

    /// GET a path.
    pub async fn get(&self, path: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .expect("request");
        let (status, _, body) = call(self.app(), request).await;
        (status, body)
    }

    /// Wait until `job` leaves the running state.
    pub async fn wait_for_job(&self, job: &str) -> JobProgress {
        let job = JobId::new(job);
        tokio::time::timeout(JOB_WAIT_TIMEOUT, async {
            loop {
                if let Some(progress) = self.handler().job(&job) {
                    if progress.state != JobState::Running {
                        return progress;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job finishes in time")
    }
}

/// The canonical balanced request for `decision_id`.
pub fn allocate_body(decision_id: &str) -> Value {
    json!({
        "decisionId": decision_id,
        "riskTolerance": "Balanced",
        "timeframe": "1-3_years",
        "withReport": false,
    })
}

/// `allocate_body` with a payment proof attached.
pub fn paid_body(decision_id: &str, from: EvmAddress, tx: Option<TxHash>) -> Value {
    let mut body = allocate_body(decision_id);
    let mut payment = json!({ "fromAddress": from.to_string() });
    if let Some(tx) = tx {
        payment["transactionId"] = json!(tx.to_string());
    }
    body["payment"] = payment;
    body
}

/// Build a JSON POST request.
pub fn post_request(path: &str, body: &Value, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("request")
}

/// Send one request through `app` and decode the JSON response.
pub async fn call(app: Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = app.oneshot(request).await.expect("infallible router");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| json!(String::from_utf8_lossy(&bytes)))
    };
    (status, headers, body)
}
