//! Capability surface of the parent chain this crate talks to.

mod provider;
pub use provider::ProviderBackend;

use crate::{
    error::BackendResult,
    primitives::{
        Address,
        Bytes,
        TxHash,
        B256,
        U256,
    },
};

use alloy_rpc_types::{
    BlockId,
    BlockNumberOrTag,
    Filter,
    Log,
    TransactionRequest,
};
use async_trait::async_trait;

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub mix_hash: B256,
    pub difficulty: U256,
}

impl BlockHeader {
    /// L1 block number carried by an Arbitrum header, `None` for any other chain.
    ///
    /// Arbitrum headers have difficulty one and pack the send count, the L1 block number and
    /// the ArbOS version as big endian `u64`s at the start of the mix hash.
    pub fn l1_block_number(&self) -> Option<u64> {
        if self.difficulty != U256::from(1) {
            return None;
        }
        let word = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&self.mix_hash[at..at + 8]);
            u64::from_be_bytes(bytes)
        };
        let arbos_version = word(16);
        (arbos_version > 0).then(|| word(8))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub transaction_hash: TxHash,
    pub block_hash: B256,
    pub block_number: u64,
    /// True when execution succeeded.
    pub status: bool,
    pub logs: Vec<Log>,
}

/// Calls the crate makes against the parent chain.
///
/// Transactions are signed by the backend: `send_transaction` receives an unsigned request
/// whose `from` is the staker and returns the hash it was broadcast under.
#[async_trait]
pub trait ChainBackend: Send + Sync + 'static {
    async fn chain_id(&self) -> BackendResult<u64>;

    async fn header_by_number(&self, number: BlockNumberOrTag) -> BackendResult<Option<BlockHeader>>;

    async fn transaction_receipt(&self, tx_hash: TxHash) -> BackendResult<Option<TxReceipt>>;

    async fn estimate_gas(&self, tx: &TransactionRequest) -> BackendResult<u64>;

    async fn call(&self, tx: &TransactionRequest, block: BlockId) -> BackendResult<Bytes>;

    async fn code_at(&self, address: Address) -> BackendResult<Bytes>;

    async fn logs(&self, filter: &Filter) -> BackendResult<Vec<Log>>;

    async fn send_transaction(&self, tx: TransactionRequest) -> BackendResult<TxHash>;

    /// Produces a block on backends that mine on demand. Returns whether a block was produced.
    async fn commit(&self) -> BackendResult<bool> {
        Ok(false)
    }
}

#[async_trait]
impl<B: ChainBackend + ?Sized> ChainBackend for Arc<B> {
    async fn chain_id(&self) -> BackendResult<u64> {
        (**self).chain_id().await
    }

    async fn header_by_number(&self, number: BlockNumberOrTag) -> BackendResult<Option<BlockHeader>> {
        (**self).header_by_number(number).await
    }

    async fn transaction_receipt(&self, tx_hash: TxHash) -> BackendResult<Option<TxReceipt>> {
        (**self).transaction_receipt(tx_hash).await
    }

    async fn estimate_gas(&self, tx: &TransactionRequest) -> BackendResult<u64> {
        (**self).estimate_gas(tx).await
    }

    async fn call(&self, tx: &TransactionRequest, block: BlockId) -> BackendResult<Bytes> {
        (**self).call(tx, block).await
    }

    async fn code_at(&self, address: Address) -> BackendResult<Bytes> {
        (**self).code_at(address).await
    }

    async fn logs(&self, filter: &Filter) -> BackendResult<Vec<Log>> {
        (**self).logs(filter).await
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> BackendResult<TxHash> {
        (**self).send_transaction(tx).await
    }

    async fn commit(&self) -> BackendResult<bool> {
        (**self).commit().await
    }
}
