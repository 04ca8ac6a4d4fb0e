//! Gas aware transaction submission.
//!
//! Every write goes through [`transact`]: the call is simulated first, broadcast through the
//! serialized submitter with a gas buffer, then followed until it is mined and, under a
//! non-latest head policy, until its block is considered safe.

mod fifo;
pub use fifo::{
    ChainBackendTransactor,
    Fifo,
    FIFO_POLL_INTERVAL,
};

use crate::{
    backend::{
        ChainBackend,
        TxReceipt,
    },
    config::{
        ChainConfig,
        HeadBlockPolicy,
    },
    error::{
        ChainError,
        ChainResult,
    },
    primitives::{
        Address,
        TxHash,
        U256,
    },
    utils::sleep_or_cancelled,
};

use alloy_rpc_types::{
    BlockId,
    TransactionRequest,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    instrument,
    warn,
};

use std::time::Duration;

/// Parameters shared by every transaction sent by one staker.
#[derive(Debug, Clone)]
pub struct TxOpts {
    pub from: Address,
    pub gas_buffer: u64,
    pub head_block: HeadBlockPolicy,
    pub mined_timeout: Duration,
    pub poll_interval: Duration,
}

impl TxOpts {
    pub fn from_config(from: Address, config: &ChainConfig) -> Self {
        Self {
            from,
            gas_buffer: config.gas_buffer,
            head_block: config.rpc_head_block,
            mined_timeout: config.tx_mined_timeout(),
            poll_interval: config.receipt_poll_interval(),
        }
    }
}

/// Simulates, submits and follows `tx` to inclusion.
///
/// Estimation failures abort before anything is broadcast. A receipt with a failed status is
/// turned into [`ChainError::TxReverted`] carrying the reason obtained by replaying the call.
#[instrument(skip_all, fields(to = ?tx.to), target = "assertion_chain::transact")]
pub async fn transact<B: ChainBackend>(
    backend: &ChainBackendTransactor<B>,
    opts: &TxOpts,
    cancel: &CancellationToken,
    tx: TransactionRequest,
) -> ChainResult<TxReceipt> {
    let tx = tx.from(opts.from);
    let tx = match tx.value {
        Some(_) => tx,
        None => tx.value(U256::ZERO),
    };

    let estimate = backend
        .estimate_gas(&tx)
        .await
        .map_err(ChainError::SimulationFailed)?;
    let tx = tx.gas_limit(estimate.saturating_add(opts.gas_buffer));

    let tx_hash = backend.send_transaction(tx.clone()).await?;
    debug!(target: "assertion_chain::transact", %tx_hash, gas_estimate = estimate, "Submitted transaction");

    // Simulated backends produce blocks on demand.
    backend.commit().await?;

    let mut receipt = wait_mined(backend, opts, cancel, tx_hash).await?;
    if opts.head_block != HeadBlockPolicy::Latest {
        receipt = wait_safe(backend, opts, cancel, receipt).await?;
    }

    if !receipt.status {
        let reason = match backend.call(&tx, BlockId::latest()).await {
            Err(err) => {
                err.revert_reason()
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string())
            }
            Ok(_) => "unknown reason".to_string(),
        };
        warn!(target: "assertion_chain::transact", %tx_hash, %reason, "Transaction reverted");
        return Err(ChainError::TxReverted { tx_hash, reason });
    }
    Ok(receipt)
}

/// Polls for the receipt of `tx_hash` until it exists, bounded by the mining timeout.
pub async fn wait_mined<B: ChainBackend>(
    backend: &B,
    opts: &TxOpts,
    cancel: &CancellationToken,
    tx_hash: TxHash,
) -> ChainResult<TxReceipt> {
    let poll = async {
        loop {
            match backend.transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(err) if err.is_transient() => {
                    debug!(target: "assertion_chain::transact", %tx_hash, %err, "Receipt poll failed");
                }
                Err(err) => return Err(ChainError::from(err)),
            }
            if !sleep_or_cancelled(cancel, opts.poll_interval).await {
                return Err(ChainError::Cancelled);
            }
        }
    };
    tokio::time::timeout(opts.mined_timeout, poll)
        .await
        .map_err(|_| ChainError::MiningTimeout(tx_hash))?
}

/// Waits until the block including the transaction is at or below the configured head.
///
/// The receipt is fetched again on every iteration. If the transaction moved to a different
/// block, the wait continues against the new receipt.
pub async fn wait_safe<B: ChainBackend>(
    backend: &B,
    opts: &TxOpts,
    cancel: &CancellationToken,
    mut receipt: TxReceipt,
) -> ChainResult<TxReceipt> {
    let tag = opts.head_block.block_tag();
    loop {
        let fresh = wait_mined(backend, opts, cancel, receipt.transaction_hash).await?;
        if fresh.block_hash != receipt.block_hash {
            warn!(
                target: "assertion_chain::transact",
                tx_hash = %receipt.transaction_hash,
                old_block = receipt.block_number,
                new_block = fresh.block_number,
                "Transaction reorged, restarting safe wait"
            );
        }
        receipt = fresh;

        if let Some(head) = backend.header_by_number(tag).await? {
            if head.number >= receipt.block_number {
                return Ok(receipt);
            }
            debug!(
                target: "assertion_chain::transact",
                head = head.number,
                block = receipt.block_number,
                "Waiting for transaction block to become safe"
            );
        }
        if !sleep_or_cancelled(cancel, opts.poll_interval).await {
            return Err(ChainError::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bindings::IStakeToken,
        test_utils::{
            MockBackend,
            STAKE_TOKEN_ADDRESS,
        },
    };

    use alloy_rpc_types::TransactionInput;
    use alloy_sol_types::SolCall;
    use std::sync::Arc;

    fn opts(from: Address, head_block: HeadBlockPolicy) -> TxOpts {
        TxOpts {
            from,
            gas_buffer: 500_000,
            head_block,
            mined_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn approve_tx(spender: Address) -> TransactionRequest {
        let call = IStakeToken::approveCall {
            spender,
            amount: U256::MAX,
        };
        TransactionRequest::default()
            .to(STAKE_TOKEN_ADDRESS)
            .input(TransactionInput::new(call.abi_encode().into()))
    }

    fn setup() -> (Arc<MockBackend>, ChainBackendTransactor<MockBackend>) {
        let mock = Arc::new(MockBackend::new());
        let backend = ChainBackendTransactor::new(mock.clone(), 10, CancellationToken::new());
        (mock, backend)
    }

    #[tokio::test]
    async fn test_transact_applies_gas_buffer() {
        let (mock, backend) = setup();
        let from = Address::with_last_byte(1);
        let receipt = transact(
            &backend,
            &opts(from, HeadBlockPolicy::Latest),
            &CancellationToken::new(),
            approve_tx(Address::with_last_byte(2)),
        )
        .await
        .unwrap();

        assert!(receipt.status);
        let sent = mock.sent_transactions();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].gas, Some(MockBackend::GAS_ESTIMATE + 500_000));
        assert_eq!(sent[0].from, Some(from));
    }

    #[tokio::test]
    async fn test_estimate_failure_does_not_broadcast() {
        let (mock, backend) = setup();
        let head_before = mock.block_number();
        // Deposits without value are rejected by the mock token.
        let call = IStakeToken::depositCall {};
        let tx = TransactionRequest::default()
            .to(STAKE_TOKEN_ADDRESS)
            .input(TransactionInput::new(call.abi_encode().into()));

        let err = transact(
            &backend,
            &opts(Address::with_last_byte(1), HeadBlockPolicy::Latest),
            &CancellationToken::new(),
            tx,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ChainError::SimulationFailed(_)));
        assert!(mock.sent_transactions().is_empty());
        assert_eq!(mock.block_number(), head_before);
    }

    #[tokio::test]
    async fn test_injected_estimate_failure() {
        let (mock, backend) = setup();
        mock.fail_next_estimate("out of gas");
        let err = transact(
            &backend,
            &opts(Address::with_last_byte(1), HeadBlockPolicy::Latest),
            &CancellationToken::new(),
            approve_tx(Address::with_last_byte(2)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.revert_reason(), Some("out of gas"));
        assert!(mock.sent_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_reverted_receipt_carries_reason() {
        let (mock, backend) = setup();
        // Passes simulation, then fails once mined.
        mock.revert_next_mined("NOT_STAKED");
        let err = transact(
            &backend,
            &opts(Address::with_last_byte(1), HeadBlockPolicy::Latest),
            &CancellationToken::new(),
            approve_tx(Address::with_last_byte(2)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChainError::TxReverted { .. }));
        assert_eq!(mock.sent_transactions().len(), 1);
    }

    #[tokio::test]
    async fn test_safe_wait_waits_for_lagging_head() {
        let (mock, backend) = setup();
        mock.set_safe_lag(3);
        mock.set_mine_on_safe_query(true);
        let receipt = transact(
            &backend,
            &opts(Address::with_last_byte(1), HeadBlockPolicy::Safe),
            &CancellationToken::new(),
            approve_tx(Address::with_last_byte(2)),
        )
        .await
        .unwrap();
        assert!(mock.block_number() >= receipt.block_number + 3);
    }

    #[tokio::test]
    async fn test_safe_wait_follows_reorg() {
        let (mock, backend) = setup();
        mock.set_safe_lag(3);
        mock.set_mine_on_safe_query(true);
        // The first safe head query moves the transaction one block later.
        mock.reorg_on_safe_query(1);

        let receipt = transact(
            &backend,
            &opts(Address::with_last_byte(1), HeadBlockPolicy::Safe),
            &CancellationToken::new(),
            approve_tx(Address::with_last_byte(2)),
        )
        .await
        .unwrap();

        let original = mock.reorged_receipts();
        assert_eq!(original.len(), 1);
        assert_eq!(receipt.transaction_hash, original[0].transaction_hash);
        assert_eq!(receipt.block_number, original[0].block_number + 1);
        assert_ne!(receipt.block_hash, original[0].block_hash);
    }

    #[tokio::test]
    async fn test_safe_wait_cancelled() {
        let (mock, backend) = setup();
        mock.set_safe_lag(3);
        let cancel = CancellationToken::new();
        let waiter_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            waiter_cancel.cancel();
        });
        let err = transact(
            &backend,
            &opts(Address::with_last_byte(1), HeadBlockPolicy::Safe),
            &cancel,
            approve_tx(Address::with_last_byte(2)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChainError::Cancelled));
    }
}
