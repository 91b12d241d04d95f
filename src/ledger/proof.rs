//! Work proofs: immutable evidence of one completed tool execution

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

use crate::sha256_namespaced;

/// Domain tag for proof hashes
const PROOF_DOMAIN: &[u8] = b"mcp402.work-proof.v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkProof {
    pub task_id: String,
    pub tool_name: String,
    /// Bytes of the serialized tool input
    pub input_size: u64,
    /// Bytes of the serialized tool output
    pub output_size: u64,
    pub execution_time_ms: u64,
    pub timestamp_ms: u64,
    #[schema(value_type = String, example = "0x5f2c...")]
    pub proof_hash: B256,
}

impl WorkProof {
    /// Build a proof from the exact bytes that went in and came out
    pub fn build(
        task_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: &[u8],
        output: &[u8],
        execution_time_ms: u64,
        timestamp_ms: u64,
    ) -> Self {
        let task_id = task_id.into();
        let tool_name = tool_name.into();
        let input_size = input.len() as u64;
        let output_size = output.len() as u64;
        let input_digest = Sha256::digest(input);
        let output_digest = Sha256::digest(output);

        let proof_hash = B256::from_slice(&sha256_namespaced!(
            PROOF_DOMAIN,
            (task_id.len() as u64).to_be_bytes(),
            task_id.as_bytes(),
            (tool_name.len() as u64).to_be_bytes(),
            tool_name.as_bytes(),
            input_size.to_be_bytes(),
            output_size.to_be_bytes(),
            execution_time_ms.to_be_bytes(),
            timestamp_ms.to_be_bytes(),
            input_digest,
            output_digest,
        ));

        Self {
            task_id,
            tool_name,
            input_size,
            output_size,
            execution_time_ms,
            timestamp_ms,
            proof_hash,
        }
    }

    /// Fresh random task id
    pub fn new_task_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_and_hash() {
        let proof = WorkProof::build("t1", "search", b"{\"q\":1}", b"[]", 12, 1_700_000_000_000);
        assert_eq!(proof.input_size, 7);
        assert_eq!(proof.output_size, 2);
        assert_ne!(proof.proof_hash, B256::ZERO);

        let again = WorkProof::build("t1", "search", b"{\"q\":1}", b"[]", 12, 1_700_000_000_000);
        assert_eq!(proof, again);
    }

    #[test]
    fn test_hash_binds_output_content() {
        let a = WorkProof::build("t1", "search", b"in", b"out-a", 1, 1);
        let b = WorkProof::build("t1", "search", b"in", b"out-b", 1, 1);
        assert_eq!(a.output_size, b.output_size);
        assert_ne!(a.proof_hash, b.proof_hash);
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        let a = WorkProof::build("ab", "c", b"", b"", 0, 0);
        let b = WorkProof::build("a", "bc", b"", b"", 0, 0);
        assert_ne!(a.proof_hash, b.proof_hash);
    }

    #[test]
    fn test_task_ids_unique() {
        assert_ne!(WorkProof::new_task_id(), WorkProof::new_task_id());
    }

    #[test]
    fn test_serializes_camel_case() {
        let proof = WorkProof::build("t1", "search", b"", b"", 0, 0);
        let json = serde_json::to_value(&proof).unwrap();
        assert!(json.get("taskId").is_some());
        assert!(json.get("executionTimeMs").is_some());
        assert!(json["proofHash"].as_str().unwrap().starts_with("0x"));
    }
}
