//! Work proofs and their settlement on the ledger contract

pub mod contract;
pub mod proof;
pub mod recorder;

pub use contract::{EvmLedgerSettings, EvmWorkLedger, LedgerError, LedgerReceipt, MemoryLedger, UserWorkload, WorkLedger};
pub use proof::WorkProof;
pub use recorder::{CallerTally, RecorderError, RecorderSettings, SettlementStatus, WorkProofRecorder};
