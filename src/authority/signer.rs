//! Key derivation and signing.
//!
//! The authority only talks to [`KeySigner`]; the seed phrase is handed over
//! per call and never cached here.

use alloy_consensus::{SignableTransaction, TxEip1559, TxEnvelope, TxLegacy};
use alloy_dyn_abi::TypedData;
use alloy_network::eip2718::Encodable2718;
use alloy_network::TxSignerSync;
use alloy_primitives::{hex, Address, Bytes, TxKind, B256, U256};
use alloy_signer::SignerSync;
use alloy_signer_local::{coins_bip39::English, MnemonicBuilder, PrivateKeySigner};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("Key derivation failed: {0}")]
    Derivation(String),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Transaction fields as a dapp submits them to `eth_sendTransaction`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
    #[serde(default, alias = "input", skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<U256>,
}

/// Gas limit for a plain value transfer, used when the dapp gives none.
pub const DEFAULT_GAS_LIMIT: u64 = 21_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub hash: B256,
    /// EIP-2718 encoded envelope, ready for `eth_sendRawTransaction`.
    pub raw: Bytes,
}

pub trait KeySigner: Send + Sync {
    fn derive_address(&self, seed: &str, path: &str) -> Result<Address, SignerError>;

    fn sign_transaction(
        &self,
        seed: &str,
        path: &str,
        tx: &TransactionRequest,
        chain_id: u64,
    ) -> Result<SignedTransaction, SignerError>;

    /// 65-byte `r || s || v` signature over the EIP-712 digest.
    fn sign_typed_data(
        &self,
        seed: &str,
        path: &str,
        typed_data: &TypedData,
    ) -> Result<Vec<u8>, SignerError>;
}

/// Derives keys from a BIP-39 mnemonic in process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalKeySigner;

impl LocalKeySigner {
    fn wallet(seed: &str, path: &str) -> Result<PrivateKeySigner, SignerError> {
        MnemonicBuilder::<English>::default()
            .phrase(seed)
            .derivation_path(path)
            .map_err(|e| SignerError::Derivation(e.to_string()))?
            .build()
            .map_err(|e| SignerError::Derivation(e.to_string()))
    }
}

fn narrow<T: TryFrom<U256>>(field: &str, value: Option<U256>, default: T) -> Result<T, SignerError> {
    match value {
        None => Ok(default),
        Some(v) => T::try_from(v)
            .map_err(|_| SignerError::InvalidTransaction(format!("{field} out of range"))),
    }
}

impl KeySigner for LocalKeySigner {
    fn derive_address(&self, seed: &str, path: &str) -> Result<Address, SignerError> {
        Ok(Self::wallet(seed, path)?.address())
    }

    fn sign_transaction(
        &self,
        seed: &str,
        path: &str,
        tx: &TransactionRequest,
        chain_id: u64,
    ) -> Result<SignedTransaction, SignerError> {
        let wallet = Self::wallet(seed, path)?;

        let to = tx.to.map(TxKind::Call).unwrap_or(TxKind::Create);
        let value = tx.value.unwrap_or_default();
        let input = tx.data.clone().unwrap_or_default();
        let nonce: u64 = narrow("nonce", tx.nonce, 0)?;
        let gas_limit: u64 = narrow("gas", tx.gas, DEFAULT_GAS_LIMIT)?;

        let envelope: TxEnvelope = if tx.gas_price.is_some() {
            let mut legacy = TxLegacy {
                chain_id: Some(chain_id),
                nonce,
                gas_price: narrow("gasPrice", tx.gas_price, 0)?,
                gas_limit,
                to,
                value,
                input,
            };
            let sig = wallet
                .sign_transaction_sync(&mut legacy)
                .map_err(|e| SignerError::Signing(e.to_string()))?;
            legacy.into_signed(sig).into()
        } else {
            let mut eip1559 = TxEip1559 {
                chain_id,
                nonce,
                gas_limit,
                max_fee_per_gas: narrow("maxFeePerGas", tx.max_fee_per_gas, 0)?,
                max_priority_fee_per_gas: narrow(
                    "maxPriorityFeePerGas",
                    tx.max_priority_fee_per_gas,
                    0,
                )?,
                to,
                value,
                input,
                ..Default::default()
            };
            let sig = wallet
                .sign_transaction_sync(&mut eip1559)
                .map_err(|e| SignerError::Signing(e.to_string()))?;
            eip1559.into_signed(sig).into()
        };

        Ok(SignedTransaction {
            hash: *envelope.tx_hash(),
            raw: envelope.encoded_2718().into(),
        })
    }

    fn sign_typed_data(
        &self,
        seed: &str,
        path: &str,
        typed_data: &TypedData,
    ) -> Result<Vec<u8>, SignerError> {
        let wallet = Self::wallet(seed, path)?;
        let sig = wallet
            .sign_dynamic_typed_data_sync(typed_data)
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        Ok(sig.as_bytes().to_vec())
    }
}

/// `0x`-prefixed lowercase hex, the form signatures travel in.
pub fn encode_signature(bytes: &[u8]) -> String {
    hex::encode_prefixed(bytes)
}
