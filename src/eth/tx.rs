//! EIP-1559 (type 2) transaction encoding and signing

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_rlp::{BufMut, Encodable, Header};

use super::signer::{RecoverableSignature, Signer, SignerError};

/// EIP-2718 envelope type byte for dynamic-fee transactions
pub const EIP1559_TX_TYPE: u8 = 0x02;

/// Unsigned dynamic-fee transaction with an empty access list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eip1559Tx {
    pub chain_id: u64,
    pub nonce: u64,
    pub max_priority_fee_per_gas: u128,
    pub max_fee_per_gas: u128,
    pub gas_limit: u64,
    pub to: Address,
    pub value: U256,
    pub input: Bytes,
}

/// Empty access list encodes as a bare list header
const EMPTY_ACCESS_LIST: Header = Header { list: true, payload_length: 0 };

impl Eip1559Tx {
    fn fields_len(&self) -> usize {
        self.chain_id.length()
            + self.nonce.length()
            + self.max_priority_fee_per_gas.length()
            + self.max_fee_per_gas.length()
            + self.gas_limit.length()
            + self.to.length()
            + self.value.length()
            + self.input.length()
            + EMPTY_ACCESS_LIST.length()
    }

    fn encode_fields(&self, out: &mut dyn BufMut) {
        self.chain_id.encode(out);
        self.nonce.encode(out);
        self.max_priority_fee_per_gas.encode(out);
        self.max_fee_per_gas.encode(out);
        self.gas_limit.encode(out);
        self.to.encode(out);
        self.value.encode(out);
        self.input.encode(out);
        EMPTY_ACCESS_LIST.encode(out);
    }

    /// `keccak256(0x02 || rlp([chain_id, nonce, ..., access_list]))`
    pub fn signing_hash(&self) -> B256 {
        let mut buf = Vec::with_capacity(self.fields_len() + 8);
        buf.push(EIP1559_TX_TYPE);
        Header { list: true, payload_length: self.fields_len() }.encode(&mut buf);
        self.encode_fields(&mut buf);
        keccak256(&buf)
    }

    /// Raw signed envelope ready for `eth_sendRawTransaction`
    pub fn encode_signed(&self, signature: &RecoverableSignature) -> Vec<u8> {
        let r = U256::from_be_bytes(signature.r);
        let s = U256::from_be_bytes(signature.s);
        let payload_length = self.fields_len() + signature.y_parity.length() + r.length() + s.length();

        let mut buf = Vec::with_capacity(payload_length + 8);
        buf.push(EIP1559_TX_TYPE);
        Header { list: true, payload_length }.encode(&mut buf);
        self.encode_fields(&mut buf);
        signature.y_parity.encode(&mut buf);
        r.encode(&mut buf);
        s.encode(&mut buf);
        buf
    }

    /// Sign and encode; returns the raw bytes and the transaction hash
    pub async fn sign(&self, signer: &dyn Signer) -> Result<(Vec<u8>, B256), SignerError> {
        let signature = signer.sign_hash(&self.signing_hash()).await?;
        let raw = self.encode_signed(&signature);
        let hash = keccak256(&raw);
        Ok((raw, hash))
    }
}
