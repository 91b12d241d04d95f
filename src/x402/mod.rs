//! x402 payment gating for tool invocation
//!
//! - Pricing catalog: which tools cost what, and where they are served from
//! - Payment challenges returned with HTTP 402
//! - Payment proof verification (trust or on-chain)
//! - The metered gateway tying pricing, payment, execution and work proofs together

pub mod gateway;
pub mod pricing;
pub mod types;
pub mod verify;

pub use gateway::{ExecutionReceipt, InvokeOutcome, InvokeRequest, MeteredGateway, RegistryExecutor, ToolExecutor};
pub use pricing::{PricingCatalog, PricingPolicy, ToolPricingPolicy};
pub use types::{ChallengeConfig, PaymentChallenge, PaymentProof};
pub use verify::{
    ChainVerifier, PaymentVerifier, Redemption, TrustVerifier, VerificationMode, VerifiedPayment, VerifyError,
    DEFAULT_MAX_PAYMENT_AGE_BLOCKS,
};
