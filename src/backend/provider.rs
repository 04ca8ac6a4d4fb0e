use super::{
    BlockHeader,
    ChainBackend,
    TxReceipt,
};
use crate::{
    error::BackendResult,
    primitives::{
        Address,
        Bytes,
        TxHash,
    },
};

use alloy_network::Ethereum;
use alloy_provider::{
    Provider,
    RootProvider,
};
use alloy_rpc_types::{
    BlockId,
    BlockNumberOrTag,
    BlockTransactionsKind,
    Filter,
    Log,
    TransactionRequest,
};
use async_trait::async_trait;
use tracing::trace;
use url::Url;

/// [`ChainBackend`] over an alloy [`Provider`].
///
/// Signing happens in the provider, so it should be built with a wallet filler for the
/// staker's key. A bare [`RootProvider`] relies on the node managing the staker account.
#[derive(Debug, Clone)]
pub struct ProviderBackend<P> {
    provider: P,
}

impl<P> ProviderBackend<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }
}

impl ProviderBackend<RootProvider<Ethereum>> {
    pub fn new_http(url: Url) -> Self {
        Self::new(RootProvider::new_http(url))
    }
}

#[async_trait]
impl<P> ChainBackend for ProviderBackend<P>
where
    P: Provider<Ethereum> + 'static,
{
    async fn chain_id(&self) -> BackendResult<u64> {
        Ok(self.provider.get_chain_id().await?)
    }

    async fn header_by_number(&self, number: BlockNumberOrTag) -> BackendResult<Option<BlockHeader>> {
        let block = self
            .provider
            .get_block_by_number(number, BlockTransactionsKind::Hashes)
            .await?;
        Ok(block.map(|block| {
            BlockHeader {
                number: block.header.number,
                hash: block.header.hash,
                parent_hash: block.header.parent_hash,
                mix_hash: block.header.mix_hash,
                difficulty: block.header.difficulty,
            }
        }))
    }

    async fn transaction_receipt(&self, tx_hash: TxHash) -> BackendResult<Option<TxReceipt>> {
        let Some(receipt) = self.provider.get_transaction_receipt(tx_hash).await? else {
            return Ok(None);
        };
        // Pending receipts carry no block yet.
        let (Some(block_hash), Some(block_number)) = (receipt.block_hash, receipt.block_number)
        else {
            return Ok(None);
        };
        Ok(Some(TxReceipt {
            transaction_hash: receipt.transaction_hash,
            block_hash,
            block_number,
            status: receipt.status(),
            logs: receipt.inner.logs().to_vec(),
        }))
    }

    async fn estimate_gas(&self, tx: &TransactionRequest) -> BackendResult<u64> {
        Ok(self.provider.estimate_gas(tx).await?)
    }

    async fn call(&self, tx: &TransactionRequest, block: BlockId) -> BackendResult<Bytes> {
        Ok(self.provider.call(tx).block(block).await?)
    }

    async fn code_at(&self, address: Address) -> BackendResult<Bytes> {
        Ok(self.provider.get_code_at(address).await?)
    }

    async fn logs(&self, filter: &Filter) -> BackendResult<Vec<Log>> {
        Ok(self.provider.get_logs(filter).await?)
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> BackendResult<TxHash> {
        let pending = self.provider.send_transaction(tx).await?;
        let tx_hash = *pending.tx_hash();
        trace!(target: "assertion_chain::backend", ?tx_hash, "Broadcast transaction");
        Ok(tx_hash)
    }
}
