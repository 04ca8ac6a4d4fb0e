use crate::{
    backend::{
        BlockHeader,
        ChainBackend,
        TxReceipt,
    },
    error::{
        BackendError,
        BackendResult,
    },
    primitives::{
        Address,
        Bytes,
        TxHash,
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
use tokio::sync::{
    Semaphore,
    SemaphorePermit,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use std::{
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

/// Interval at which a waiting submitter polls the gate.
pub const FIFO_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Single slot gate with a bounded number of waiters.
#[derive(Debug)]
pub struct Fifo {
    gate: Semaphore,
    waiting: AtomicUsize,
    capacity: usize,
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Fifo {
    pub fn new(capacity: usize) -> Self {
        Self {
            gate: Semaphore::new(1),
            waiting: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn try_lock(&self) -> Option<SemaphorePermit<'_>> {
        self.gate.try_acquire().ok()
    }

    /// Acquires the gate, polling every [`FIFO_POLL_INTERVAL`] until it frees up or `cancel`
    /// fires.
    pub async fn lock(&self, cancel: &CancellationToken) -> BackendResult<SemaphorePermit<'_>> {
        if let Some(permit) = self.try_lock() {
            return Ok(permit);
        }
        if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.capacity {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(BackendError::QueueFull {
                capacity: self.capacity,
            });
        }
        let _waiter = WaiterGuard(&self.waiting);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                _ = tokio::time::sleep(FIFO_POLL_INTERVAL) => {}
            }
            if let Some(permit) = self.try_lock() {
                return Ok(permit);
            }
        }
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

/// Backend that lets a single transaction from this account be broadcast at a time.
///
/// The gate is held only while the transaction is handed to the inner backend. Reads,
/// simulations and receipt polling pass straight through.
#[derive(Debug)]
pub struct ChainBackendTransactor<B> {
    inner: Arc<B>,
    fifo: Arc<Fifo>,
    cancel: CancellationToken,
}

impl<B> Clone for ChainBackendTransactor<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            fifo: self.fifo.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<B: ChainBackend> ChainBackendTransactor<B> {
    pub fn new(inner: Arc<B>, capacity: usize, cancel: CancellationToken) -> Self {
        Self {
            inner,
            fifo: Arc::new(Fifo::new(capacity)),
            cancel,
        }
    }

    pub fn inner(&self) -> &Arc<B> {
        &self.inner
    }

    pub fn fifo(&self) -> &Fifo {
        &self.fifo
    }
}

#[async_trait]
impl<B: ChainBackend> ChainBackend for ChainBackendTransactor<B> {
    async fn chain_id(&self) -> BackendResult<u64> {
        self.inner.chain_id().await
    }

    async fn header_by_number(&self, number: BlockNumberOrTag) -> BackendResult<Option<BlockHeader>> {
        self.inner.header_by_number(number).await
    }

    async fn transaction_receipt(&self, tx_hash: TxHash) -> BackendResult<Option<TxReceipt>> {
        self.inner.transaction_receipt(tx_hash).await
    }

    async fn estimate_gas(&self, tx: &TransactionRequest) -> BackendResult<u64> {
        self.inner.estimate_gas(tx).await
    }

    async fn call(&self, tx: &TransactionRequest, block: BlockId) -> BackendResult<Bytes> {
        self.inner.call(tx, block).await
    }

    async fn code_at(&self, address: Address) -> BackendResult<Bytes> {
        self.inner.code_at(address).await
    }

    async fn logs(&self, filter: &Filter) -> BackendResult<Vec<Log>> {
        self.inner.logs(filter).await
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> BackendResult<TxHash> {
        let _permit = self.fifo.lock(&self.cancel).await?;
        debug!(target: "assertion_chain::transact", to = ?tx.to, "Acquired submission gate");
        self.inner.send_transaction(tx).await
    }

    async fn commit(&self) -> BackendResult<bool> {
        self.inner.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_released_on_drop() {
        let fifo = Fifo::new(10);
        let permit = fifo.lock(&CancellationToken::new()).await.unwrap();
        assert!(fifo.try_lock().is_none());
        drop(permit);
        assert!(fifo.try_lock().is_some());
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let fifo = Arc::new(Fifo::new(10));
        let permit = fifo.try_lock().unwrap();

        let waiter_fifo = fifo.clone();
        let waiter = tokio::spawn(async move {
            let _permit = waiter_fifo.lock(&CancellationToken::new()).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fifo.waiting(), 1);

        drop(permit);
        waiter.await.unwrap();
        assert_eq!(fifo.waiting(), 0);
    }

    #[tokio::test]
    async fn test_queue_bound() {
        let fifo = Fifo::new(0);
        let _permit = fifo.try_lock().unwrap();
        assert!(matches!(
            fifo.lock(&CancellationToken::new()).await,
            Err(BackendError::QueueFull { capacity: 0 })
        ));
        assert_eq!(fifo.waiting(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter() {
        let fifo = Fifo::new(10);
        let _permit = fifo.try_lock().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(fifo.lock(&cancel).await, Err(BackendError::Cancelled)));
        assert_eq!(fifo.waiting(), 0);
    }
}
