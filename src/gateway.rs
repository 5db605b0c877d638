//! Gateway process wiring: collaborators, handler, HTTP server, shutdown.

use crate::admission::AdmissionHandler;
use crate::clock::{Clock, SystemClock};
use crate::config::GatewayConfig;
use crate::devnet::{self, DevChain, DevPipeline};
use crate::error::{Error, Result};
use crate::limits::{RateLimiter, RunningJobSet};
use crate::payment::{
    AdmissionMetrics, ChainClient, JsonRpcChain, PaymentVerifier, QuotePricer, ReceivingWallet,
    StaticWallet, VerifierSettings,
};
use crate::pipeline::{HttpPipeline, JobOrchestrator, OrchestratorSettings, PipelineClient};
use crate::server;
use crate::store::Stores;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// File name of the persisted metrics snapshot inside the data directory.
pub const METRICS_FILE: &str = "metrics.json";

/// How often idle rate-limit state is dropped and metrics are flushed.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Builder for a gateway.
///
/// Collaborators not supplied explicitly are built from configuration.
pub struct GatewayBuilder {
    config: GatewayConfig,
    chain: Option<Arc<dyn ChainClient>>,
    pipeline: Option<Arc<dyn PipelineClient>>,
    wallet: Option<Arc<dyn ReceivingWallet>>,
    clock: Option<Arc<dyn Clock>>,
    stores: Option<Stores>,
    dev_chain: Option<Arc<DevChain>>,
}

impl GatewayBuilder {
    /// Create a builder with the given configuration.
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            chain: None,
            pipeline: None,
            wallet: None,
            clock: None,
            stores: None,
            dev_chain: None,
        }
    }

    /// Verify payments against `chain`.
    #[must_use]
    pub fn with_chain(mut self, chain: Arc<dyn ChainClient>) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Run admitted jobs on `pipeline`.
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: Arc<dyn PipelineClient>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Resolve the receiving address from `wallet`.
    #[must_use]
    pub fn with_wallet(mut self, wallet: Arc<dyn ReceivingWallet>) -> Self {
        self.wallet = Some(wallet);
        self
    }

    /// Read time from `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Keep admission state in `stores`.
    #[must_use]
    pub fn with_stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Run against the in-process devnet and mount its transfer route.
    #[must_use]
    pub fn with_devnet(mut self, chain: Arc<DevChain>, pipeline: Arc<DevPipeline>) -> Self {
        self.chain = Some(Arc::clone(&chain) as Arc<dyn ChainClient>);
        self.pipeline = Some(pipeline as Arc<dyn PipelineClient>);
        self.dev_chain = Some(chain);
        self
    }

    /// Wire the gateway.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, a collaborator
    /// cannot be built, or the receiving address cannot be resolved.
    pub async fn build(self) -> Result<RunningGateway> {
        let config = self.config;
        info!("Building allocation-gate for network {}", config.payment.network);

        let pricer = QuotePricer::new(&config.pricing)?;
        let verifier_settings = VerifierSettings::from_config(&config.payment)?;
        if self.dev_chain.is_none() && verifier_settings.token.is_none() {
            return Err(Error::Config(
                "payment.token_contract is not set (use --dev for a local devnet)".to_string(),
            ));
        }

        // Step 1: Collaborators
        let chain = match self.chain {
            Some(chain) => chain,
            None => Self::build_chain(&config)?,
        };
        let pipeline = match self.pipeline {
            Some(pipeline) => pipeline,
            None => Self::build_pipeline(&config)?,
        };
        let wallet: Arc<dyn ReceivingWallet> = match self.wallet {
            Some(wallet) => wallet,
            None => Arc::new(StaticWallet::from_config(
                config.payment.payee_address.as_deref(),
            )?),
        };
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let stores = self.stores.unwrap_or_else(Stores::in_memory);

        // Step 2: Receiving address, resolved once per process
        let pay_to = wallet
            .receiving_address()
            .await
            .map_err(|e| Error::Startup(format!("failed to resolve receiving address: {e}")))?;
        info!("Receiving payments at {}", pay_to);

        // Step 3: Metrics
        let metrics = Arc::new(Self::build_metrics(&config)?);

        // Step 4: Limits and orchestration share one running set
        let running = RunningJobSet::new(config.limits.global_concurrency_cap);
        let limiter = RateLimiter::new(&config.limits, running.clone(), Arc::clone(&stores.usage));
        let orchestrator = JobOrchestrator::new(
            pipeline,
            running,
            Arc::clone(&metrics),
            Arc::clone(&clock),
            OrchestratorSettings::from_config(&config.pipeline, &config.limits),
        );

        let handler = AdmissionHandler::new(
            stores,
            pricer,
            limiter,
            PaymentVerifier::new(chain, verifier_settings),
            orchestrator,
            metrics,
            clock,
            pay_to,
            config.quote.window(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(RunningGateway {
            config,
            handler: Arc::new(handler),
            dev_chain: self.dev_chain,
            shutdown_tx,
            shutdown_rx,
        })
    }

    fn build_chain(config: &GatewayConfig) -> Result<Arc<dyn ChainClient>> {
        let url = config.payment.rpc_url.as_deref().ok_or_else(|| {
            Error::Config("payment.rpc_url is not set (use --dev for a local devnet)".to_string())
        })?;
        let chain = JsonRpcChain::new(
            url,
            Duration::from_secs(config.payment.request_timeout_secs),
            Duration::from_millis(config.payment.confirmation_poll_interval_ms),
        )?;
        debug!("Using JSON-RPC chain at {}", url);
        Ok(Arc::new(chain))
    }

    fn build_pipeline(config: &GatewayConfig) -> Result<Arc<dyn PipelineClient>> {
        let url = config.pipeline.base_url.as_deref().ok_or_else(|| {
            Error::Config("pipeline.base_url is not set (use --dev for a local devnet)".to_string())
        })?;
        let pipeline = HttpPipeline::new(
            url,
            Duration::from_secs(config.pipeline.request_timeout_secs),
        )?;
        debug!("Using pipeline service at {}", url);
        Ok(Arc::new(pipeline))
    }

    fn build_metrics(config: &GatewayConfig) -> Result<AdmissionMetrics> {
        if !config.metrics.persist {
            return Ok(AdmissionMetrics::new());
        }
        std::fs::create_dir_all(&config.metrics.data_dir)?;
        let path = config.metrics.data_dir.join(METRICS_FILE);
        info!("Persisting metrics to {}", path.display());
        Ok(AdmissionMetrics::with_persistence(&path))
    }
}

/// A wired gateway.
pub struct RunningGateway {
    config: GatewayConfig,
    handler: Arc<AdmissionHandler>,
    dev_chain: Option<Arc<DevChain>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RunningGateway {
    /// The admission handler.
    #[must_use]
    pub fn handler(&self) -> &Arc<AdmissionHandler> {
        &self.handler
    }

    /// The HTTP router, including devnet routes when running on the devnet.
    #[must_use]
    pub fn router(&self) -> Router {
        let router = server::router(
            Arc::clone(&self.handler),
            self.config.server.trust_forwarded_for,
        );
        match self.dev_chain {
            Some(ref chain) => {
                router.merge(devnet::routes(Arc::clone(chain), self.handler.pay_to()))
            }
            None => router,
        }
    }

    /// Bind the configured listen address and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound or the server fails.
    pub async fn run(&mut self) -> Result<()> {
        let listener = TcpListener::bind(self.config.server.listen_addr)
            .await
            .map_err(|e| {
                Error::Startup(format!(
                    "failed to bind {}: {e}",
                    self.config.server.listen_addr
                ))
            })?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails.
    pub async fn serve(&mut self, listener: TcpListener) -> Result<()> {
        info!("allocation-gate listening on {}", listener.local_addr()?);

        let sweeper = self.spawn_sweeper();
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let stop = Self::wait_for_shutdown(self.shutdown_tx.clone(), self.shutdown_rx.clone());

        axum::serve(listener, app)
            .with_graceful_shutdown(stop)
            .await?;

        self.shutdown();
        if let Err(e) = sweeper.await {
            warn!("Sweeper task ended abnormally: {e}");
        }
        self.handler.metrics().persist();
        info!("Gateway shutdown complete");
        Ok(())
    }

    /// Request the gateway to shut down.
    pub fn shutdown(&self) {
        if let Err(e) = self.shutdown_tx.send(true) {
            warn!("Failed to send shutdown signal: {e}");
        }
    }

    /// A sender that can stop the gateway from another task.
    #[must_use]
    pub fn shutdown_sender(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let handler = Arc::clone(&self.handler);
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        handler.sweep();
                        handler.metrics().persist();
                    }
                }
            }
        })
    }

    /// Resolve when shutdown is requested or a termination signal arrives.
    #[cfg(unix)]
    async fn wait_for_shutdown(
        shutdown_tx: watch::Sender<bool>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => Some(sigterm),
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                None
            }
        };
        let sigterm_recv = async {
            match sigterm.as_mut() {
                Some(sigterm) => {
                    sigterm.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = Self::requested(&mut shutdown_rx) => {
                info!("Shutdown signal received");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl-C), initiating shutdown");
            }
            () = sigterm_recv => {
                info!("Received SIGTERM, initiating shutdown");
            }
        }
        let _ = shutdown_tx.send(true);
    }

    /// Resolve when shutdown is requested or Ctrl-C arrives (non-Unix version).
    #[cfg(not(unix))]
    async fn wait_for_shutdown(
        shutdown_tx: watch::Sender<bool>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        tokio::select! {
            _ = Self::requested(&mut shutdown_rx) => {
                info!("Shutdown signal received");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, initiating shutdown");
            }
        }
        let _ = shutdown_tx.send(true);
    }

    async fn requested(shutdown_rx: &mut watch::Receiver<bool>) {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
