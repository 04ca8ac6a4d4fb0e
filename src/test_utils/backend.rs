use super::ledger::{
    Env,
    Ledger,
    RollupParams,
};
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
        keccak256,
        Address,
        Bytes,
        TxHash,
        B256,
        U256,
    },
};

use alloy_primitives::TxKind;
use alloy_rpc_types::{
    BlockId,
    BlockNumberOrTag,
    Filter,
    Log,
    TransactionRequest,
};
use async_trait::async_trait;
use parking_lot::Mutex;

use std::collections::HashMap;

#[derive(Debug, Default)]
struct Hooks {
    safe_lag: u64,
    mine_on_safe_query: bool,
    reorg_at_safe_query: Option<u64>,
    safe_queries: u64,
    reorged: Vec<TxReceipt>,
    fail_next_estimate: Option<String>,
    revert_next_mined: Option<String>,
    /// Transactions failed through `revert_next_mined`, replayed with the same reason.
    forced_reverts: Vec<(TxHash, TransactionRequest, String)>,
    transient_call_failures: u64,
    /// Present when the parent chain is Arbitrum: its blocks report `number + offset` as L1 block.
    l1_block_offset: Option<u64>,
    drop_next_mined_logs: bool,
}

#[derive(Debug)]
struct MockState {
    ledger: Ledger,
    blocks: Vec<BlockHeader>,
    pending: Vec<(TxHash, TransactionRequest)>,
    receipts: HashMap<TxHash, TxReceipt>,
    sent: Vec<TransactionRequest>,
    nonce: u64,
    hooks: Hooks,
}

/// In-memory parent chain running the rollup contracts of [`Ledger`].
///
/// Transactions sit in a pending pool until [`ChainBackend::commit`] mines them into a new
/// block. Calls execute against the latest state, gas estimates against the next block.
#[derive(Debug)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

const ARBOS_VERSION: u64 = 31;

fn block_hash(number: u64, salt: u64) -> B256 {
    let mut preimage = number.to_be_bytes().to_vec();
    preimage.extend_from_slice(&salt.to_be_bytes());
    keccak256(preimage)
}

fn call_target(tx: &TransactionRequest) -> Result<Address, String> {
    match tx.to {
        Some(TxKind::Call(to)) => Ok(to),
        _ => Err("contract creation is not supported".to_string()),
    }
}

fn reverted(reason: String) -> BackendError {
    BackendError::Reverted { reason }
}

impl MockState {
    fn head(&self) -> &BlockHeader {
        // Genesis is pushed at construction.
        &self.blocks[self.blocks.len() - 1]
    }

    fn l1_block_number(&self, number: u64) -> u64 {
        number + self.hooks.l1_block_offset.unwrap_or(0)
    }

    fn new_block(&mut self) -> BlockHeader {
        let parent = *self.head();
        let number = parent.number + 1;
        let hash = block_hash(number, self.nonce);
        let (mix_hash, difficulty) = match self.hooks.l1_block_offset {
            Some(offset) => {
                let mut mix = [0u8; 32];
                mix[8..16].copy_from_slice(&(number + offset).to_be_bytes());
                mix[16..24].copy_from_slice(&ARBOS_VERSION.to_be_bytes());
                (B256::from(mix), U256::from(1))
            }
            // Stands in for post merge randomness.
            None => (keccak256(hash), U256::ZERO),
        };
        let header = BlockHeader {
            number,
            hash,
            parent_hash: parent.hash,
            mix_hash,
            difficulty,
        };
        self.blocks.push(header);
        header
    }

    fn execute(
        &self,
        tx: &TransactionRequest,
        block_number: u64,
    ) -> Result<(Ledger, Vec<u8>), String> {
        let to = call_target(tx)?;
        let env = Env {
            block_number: self.l1_block_number(block_number),
            parent_block_number: block_number,
            from: tx.from.unwrap_or_default(),
            value: tx.value.unwrap_or_default(),
        };
        let mut ledger = self.ledger.clone();
        ledger.logs.clear();
        let input = tx.input.input().cloned().unwrap_or_default();
        let output = ledger.execute(env, to, &input)?;
        Ok((ledger, output))
    }

    fn logs_of(
        &self,
        header: &BlockHeader,
        tx_hash: TxHash,
        tx_index: u64,
        first_index: u64,
        ledger: &Ledger,
    ) -> Vec<Log> {
        ledger
            .logs
            .iter()
            .enumerate()
            .map(|(i, (address, data))| {
                Log {
                    inner: alloy_primitives::Log {
                        address: *address,
                        data: data.clone(),
                    },
                    block_hash: Some(header.hash),
                    block_number: Some(header.number),
                    block_timestamp: None,
                    transaction_hash: Some(tx_hash),
                    transaction_index: Some(tx_index),
                    log_index: Some(first_index + i as u64),
                    removed: false,
                }
            })
            .collect()
    }

    /// Mines every pending transaction into a new block.
    fn mine(&mut self) -> BlockHeader {
        let header = self.new_block();
        let pending = std::mem::take(&mut self.pending);
        let drop_logs = !pending.is_empty() && std::mem::take(&mut self.hooks.drop_next_mined_logs);
        let mut log_index = 0;
        for (tx_index, (tx_hash, tx)) in pending.into_iter().enumerate() {
            let forced = self
                .hooks
                .forced_reverts
                .iter()
                .any(|(hash, _, _)| *hash == tx_hash);
            let (status, logs) = match self.execute(&tx, header.number) {
                Ok((ledger, _)) if !forced => {
                    let logs = self.logs_of(&header, tx_hash, tx_index as u64, log_index, &ledger);
                    log_index += logs.len() as u64;
                    self.ledger = Ledger {
                        logs: Vec::new(),
                        ..ledger
                    };
                    (true, if drop_logs { Vec::new() } else { logs })
                }
                _ => (false, Vec::new()),
            };
            self.receipts.insert(
                tx_hash,
                TxReceipt {
                    transaction_hash: tx_hash,
                    block_hash: header.hash,
                    block_number: header.number,
                    status,
                    logs,
                },
            );
        }
        header
    }

    /// Moves the most recently mined transaction into a fresh block.
    fn reorg_last_transaction(&mut self) {
        let Some(original) = self
            .receipts
            .values()
            .max_by_key(|receipt| receipt.block_number)
            .cloned()
        else {
            return;
        };
        self.nonce += 1;
        let header = self.new_block();
        let logs = original
            .logs
            .iter()
            .cloned()
            .map(|mut log| {
                log.block_hash = Some(header.hash);
                log.block_number = Some(header.number);
                log
            })
            .collect();
        self.receipts.insert(
            original.transaction_hash,
            TxReceipt {
                block_hash: header.hash,
                block_number: header.number,
                logs,
                ..original.clone()
            },
        );
        self.hooks.reorged.push(original);
    }
}

impl MockBackend {
    /// Gas every successful estimate reports.
    pub const GAS_ESTIMATE: u64 = 100_000;
    /// Block the rollup is deployed at.
    pub const DEPLOYMENT_BLOCK: u64 = 1;

    pub fn new() -> Self {
        let genesis = BlockHeader {
            number: 0,
            hash: block_hash(0, 0),
            parent_hash: B256::ZERO,
            mix_hash: B256::ZERO,
            difficulty: U256::ZERO,
        };
        let mut state = MockState {
            ledger: Ledger::new(Self::DEPLOYMENT_BLOCK),
            blocks: vec![genesis],
            pending: Vec::new(),
            receipts: HashMap::new(),
            sent: Vec::new(),
            nonce: 0,
            hooks: Hooks::default(),
        };
        // Deployment block carrying the genesis assertion event.
        let header = state.new_block();
        let deploy_tx = keccak256("deploy");
        let logs = state.logs_of(&header, deploy_tx, 0, 0, &state.ledger);
        state.ledger.logs.clear();
        state.receipts.insert(
            deploy_tx,
            TxReceipt {
                transaction_hash: deploy_tx,
                block_hash: header.hash,
                block_number: header.number,
                status: true,
                logs,
            },
        );
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn block_number(&self) -> u64 {
        self.state.lock().head().number
    }

    /// Mines `count` empty blocks.
    pub fn advance_blocks(&self, count: u64) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.mine();
        }
    }

    pub fn sent_transactions(&self) -> Vec<TransactionRequest> {
        self.state.lock().sent.clone()
    }

    pub fn fail_next_estimate(&self, reason: &str) {
        self.state.lock().hooks.fail_next_estimate = Some(reason.to_string());
    }

    /// Lets the next transaction pass simulation and fail once mined with `reason`.
    pub fn revert_next_mined(&self, reason: &str) {
        self.state.lock().hooks.revert_next_mined = Some(reason.to_string());
    }

    /// Mines the next batch of transactions successfully but without any logs in their
    /// receipts.
    pub fn drop_next_mined_logs(&self) {
        self.state.lock().hooks.drop_next_mined_logs = true;
    }

    /// Makes this an Arbitrum parent chain from the next block on. Its headers and the
    /// contracts' `block.number` report L1 blocks `offset` ahead of the parent chain.
    pub fn set_l1_block_offset(&self, offset: u64) {
        self.state.lock().hooks.l1_block_offset = Some(offset);
    }

    /// Fails the next `count` calls with a transport error.
    pub fn fail_next_calls(&self, count: u64) {
        self.state.lock().hooks.transient_call_failures = count;
    }

    pub fn set_safe_lag(&self, lag: u64) {
        self.state.lock().hooks.safe_lag = lag;
    }

    pub fn set_mine_on_safe_query(&self, enabled: bool) {
        self.state.lock().hooks.mine_on_safe_query = enabled;
    }

    /// On the `nth` safe or finalized head query, moves the last mined transaction one block
    /// later.
    pub fn reorg_on_safe_query(&self, nth: u64) {
        self.state.lock().hooks.reorg_at_safe_query = Some(nth);
    }

    /// Receipts as they were before being reorged.
    pub fn reorged_receipts(&self) -> Vec<TxReceipt> {
        self.state.lock().hooks.reorged.clone()
    }

    pub fn mint(&self, owner: Address, amount: U256) {
        *self.state.lock().ledger.balances.entry(owner).or_default() += amount;
    }

    pub fn balance_of(&self, owner: Address) -> U256 {
        self.state
            .lock()
            .ledger
            .balances
            .get(&owner)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_token_has_code(&self, has_code: bool) {
        self.state.lock().ledger.token_has_code = has_code;
    }

    pub fn set_fast_confirmer(&self, confirmer: Address) {
        self.state.lock().ledger.fast_confirmer = confirmer;
    }

    pub fn set_safe(&self, owners: Vec<Address>, threshold: u64) {
        let mut state = self.state.lock();
        state.ledger.safe_owners = owners;
        state.ledger.safe_threshold = threshold;
    }

    /// Records an approval of `hash` by a multisig owner other than the staker.
    pub fn approve_safe_hash(&self, owner: Address, hash: B256) {
        self.state.lock().ledger.approved_hashes.insert((owner, hash));
    }

    pub fn safe_nonce(&self) -> U256 {
        self.state.lock().ledger.safe_nonce
    }

    /// Overwrites the child creation blocks the rollup reports for `assertion`.
    pub fn set_child_blocks(&self, assertion: B256, first: u64, second: u64) {
        if let Some(assertion) = self.state.lock().ledger.assertions.get_mut(&assertion) {
            assertion.node.firstChildBlock = first;
            assertion.node.secondChildBlock = second;
        }
    }

    /// Changes the parameters new assertions are created under.
    pub fn update_rollup_params(&self, update: impl FnOnce(&mut RollupParams)) {
        update(&mut self.state.lock().ledger.params);
    }

    pub fn rollup_params(&self) -> RollupParams {
        self.state.lock().ledger.params.clone()
    }

    pub fn set_minimum_assertion_period(&self, blocks: u64) {
        self.state.lock().ledger.params.minimum_assertion_period = blocks;
    }

    pub fn inbox_acc(&self, batch: u64) -> B256 {
        let state = self.state.lock();
        batch
            .checked_sub(1)
            .and_then(|index| state.ledger.inbox_accs.get(index as usize))
            .copied()
            .unwrap_or_default()
    }

    pub fn latest_confirmed(&self) -> B256 {
        self.state.lock().ledger.latest_confirmed
    }

    pub fn genesis_hash(&self) -> B256 {
        self.state.lock().ledger.genesis
    }
}

#[async_trait]
impl ChainBackend for MockBackend {
    async fn chain_id(&self) -> BackendResult<u64> {
        Ok(1337)
    }

    async fn header_by_number(&self, number: BlockNumberOrTag) -> BackendResult<Option<BlockHeader>> {
        let mut state = self.state.lock();
        let head = state.head().number;
        let target = match number {
            BlockNumberOrTag::Number(number) => number,
            BlockNumberOrTag::Safe | BlockNumberOrTag::Finalized => {
                state.hooks.safe_queries += 1;
                if state.hooks.reorg_at_safe_query == Some(state.hooks.safe_queries) {
                    state.reorg_last_transaction();
                }
                if state.hooks.mine_on_safe_query {
                    state.mine();
                }
                state.head().number.saturating_sub(state.hooks.safe_lag)
            }
            BlockNumberOrTag::Earliest => 0,
            _ => head,
        };
        Ok(state
            .blocks
            .iter()
            .find(|header| header.number == target)
            .copied())
    }

    async fn transaction_receipt(&self, tx_hash: TxHash) -> BackendResult<Option<TxReceipt>> {
        Ok(self.state.lock().receipts.get(&tx_hash).cloned())
    }

    async fn estimate_gas(&self, tx: &TransactionRequest) -> BackendResult<u64> {
        let mut state = self.state.lock();
        if let Some(reason) = state.hooks.fail_next_estimate.take() {
            return Err(reverted(reason));
        }
        let next = state.head().number + 1;
        state
            .execute(tx, next)
            .map(|_| Self::GAS_ESTIMATE)
            .map_err(reverted)
    }

    async fn call(&self, tx: &TransactionRequest, _block: BlockId) -> BackendResult<Bytes> {
        let mut state = self.state.lock();
        if state.hooks.transient_call_failures > 0 {
            state.hooks.transient_call_failures -= 1;
            return Err(BackendError::Transport("connection reset by peer".to_string()));
        }
        let forced = state
            .hooks
            .forced_reverts
            .iter()
            .find(|(_, request, _)| request == tx)
            .map(|(_, _, reason)| reason.clone());
        if let Some(reason) = forced {
            return Err(reverted(reason));
        }
        let head = state.head().number;
        state
            .execute(tx, head)
            .map(|(_, output)| Bytes::from(output))
            .map_err(reverted)
    }

    async fn code_at(&self, address: Address) -> BackendResult<Bytes> {
        let state = self.state.lock();
        if state.ledger.has_code(address) {
            Ok(Bytes::from_static(&[0x60, 0x80, 0x60, 0x40]))
        } else {
            Ok(Bytes::new())
        }
    }

    async fn logs(&self, filter: &Filter) -> BackendResult<Vec<Log>> {
        let state = self.state.lock();
        let from = filter.get_from_block().unwrap_or(0);
        let to = filter.get_to_block().unwrap_or(state.head().number);
        let canonical: Vec<B256> = state.blocks.iter().map(|header| header.hash).collect();
        let mut logs: Vec<Log> = state
            .receipts
            .values()
            .filter(|receipt| receipt.block_number >= from && receipt.block_number <= to)
            .filter(|receipt| canonical.contains(&receipt.block_hash))
            .flat_map(|receipt| receipt.logs.iter().cloned())
            .filter(|log| filter.address.matches(&log.inner.address))
            .filter(|log| {
                filter.topics.iter().enumerate().all(|(i, topic)| {
                    match log.inner.data.topics().get(i) {
                        Some(value) => topic.matches(value),
                        None => topic.is_empty(),
                    }
                })
            })
            .collect();
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        Ok(logs)
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> BackendResult<TxHash> {
        let mut state = self.state.lock();
        state.nonce += 1;
        let mut preimage = tx.from.unwrap_or_default().to_vec();
        preimage.extend_from_slice(&state.nonce.to_be_bytes());
        let tx_hash = keccak256(preimage);
        if let Some(reason) = state.hooks.revert_next_mined.take() {
            state.hooks.forced_reverts.push((tx_hash, tx.clone(), reason));
        }
        state.sent.push(tx.clone());
        state.pending.push((tx_hash, tx));
        Ok(tx_hash)
    }

    async fn commit(&self) -> BackendResult<bool> {
        self.state.lock().mine();
        Ok(true)
    }
}
