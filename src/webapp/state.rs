use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::config::GlobalConfig;
use crate::eth::EthRpc;
use crate::ledger::{EvmWorkLedger, MemoryLedger, WorkLedger, WorkProofRecorder};
use crate::mcp::sources::EstablishReport;
use crate::mcp::{ConnectionRegistry, ConnectionSource, ProtocolRouter};
use crate::x402::{
    ChainVerifier, MeteredGateway, PaymentVerifier, RegistryExecutor, TrustVerifier, VerificationMode,
};

#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub router: ProtocolRouter,
    pub gateway: Arc<MeteredGateway>,
    pub recorder: WorkProofRecorder,
    /// Connection records known at startup
    pub source: Arc<ConnectionSource>,
    /// Bound on remote calls, also used for proxy sessions
    pub upstream_timeout: Duration,
    /// When the server was started (for uptime tracking)
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        registry: ConnectionRegistry,
        gateway: Arc<MeteredGateway>,
        recorder: WorkProofRecorder,
        source: Arc<ConnectionSource>,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            router: ProtocolRouter::new(registry.clone()),
            registry,
            gateway,
            recorder,
            source,
            upstream_timeout,
            started_at: Instant::now(),
        }
    }

    /// Wire up every component from configuration
    ///
    /// Returns the state and the settlement worker's handle. Direct connections
    /// are not established here; see [`AppState::establish_connections`].
    pub async fn from_config(config: &GlobalConfig) -> Result<(Self, JoinHandle<()>)> {
        let tokens = config.token_registry();
        let catalog = Arc::new(config.pricing_catalog(&tokens).context("Failed to load pricing catalog")?);
        let challenges = config.challenge_config(tokens.clone())?;

        let verifier: Arc<dyn PaymentVerifier> = match config.payment_verification {
            VerificationMode::Trust => Arc::new(TrustVerifier::new()),
            VerificationMode::Chain => Arc::new(ChainVerifier::new(
                EthRpc::new(config.verification_rpc_url()?),
                challenges.pay_to,
                tokens,
                config.min_confirmations,
            )
            .with_max_age_blocks(config.payment_max_age_blocks)),
        };

        let ledger: Arc<dyn WorkLedger> = match config.ledger()? {
            Some(ledger) => {
                let evm = EvmWorkLedger::new(EthRpc::new(ledger.rpc_url), ledger.signer, ledger.settings);
                if let Err(e) = evm.check_chain().await {
                    tracing::warn!(error = %e, "Ledger endpoint check failed, submissions may not settle");
                }
                Arc::new(evm)
            }
            None => {
                tracing::warn!("No ledger configured, work proofs are recorded in memory only");
                Arc::new(MemoryLedger::new())
            }
        };

        let (recorder, worker) = WorkProofRecorder::start(ledger, config.recorder_settings());

        let registry = ConnectionRegistry::new();
        let source = Arc::new(config.connection_source()?);
        let gateway = Arc::new(MeteredGateway::new(
            catalog,
            challenges,
            verifier,
            Arc::new(RegistryExecutor::new(registry.clone())),
            recorder.clone(),
        ));

        let state = Self::new(registry, gateway, recorder, source, config.upstream_timeout());
        Ok((state, worker))
    }

    /// Connect every direct record; failures are logged, not fatal
    pub async fn establish_connections(&self) -> EstablishReport {
        self.source.establish(&self.registry, self.upstream_timeout).await
    }
}
