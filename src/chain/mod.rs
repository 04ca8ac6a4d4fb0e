//! Orchestration of the rollup's assertion tree for a single staker.
//!
//! [`AssertionChain`] is a cheap to clone handle. Reads are retried through transient backend
//! failures, writes go through [`transact`] behind the staker's serialized submitter.

mod confirmation;
mod creation_info;
mod staking;

use crate::{
    assertion::Assertion,
    backend::{
        BlockHeader,
        ChainBackend,
        TxReceipt,
    },
    bindings::{
        AssertionNode,
        IRollupCore,
    },
    challenge::{
        ChallengeConstants,
        SpecChallengeManager,
    },
    config::ChainConfig,
    error::{
        ChainError,
        ChainResult,
    },
    fast_confirm::FastConfirmSafe,
    primitives::{
        Address,
        AssertionHash,
        AssertionStatus,
        EdgeId,
        OriginHeights,
        U256,
    },
    transact::{
        transact,
        ChainBackendTransactor,
        TxOpts,
    },
    utils::until_succeeds,
};

use alloy_rpc_types::{
    BlockId,
    TransactionInput,
    TransactionRequest,
};
use alloy_sol_types::SolCall;
use moka::sync::Cache;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
    instrument,
};

use std::{
    sync::Arc,
    time::Duration,
};

/// Read-only contract access used before a chain handle exists.
pub(crate) struct ContractCaller<'a, B> {
    pub backend: &'a B,
    pub from: Address,
    pub block: BlockId,
    pub cancel: &'a CancellationToken,
    pub retry_interval: Duration,
}

impl<B: ChainBackend> ContractCaller<'_, B> {
    pub async fn call<C: SolCall>(&self, to: Address, call: &C) -> ChainResult<C::Return> {
        let tx = TransactionRequest::default()
            .from(self.from)
            .to(to)
            .input(TransactionInput::new(call.abi_encode().into()));
        let tx = &tx;
        let backend = self.backend;
        let block = self.block;
        let output = until_succeeds(self.cancel, self.retry_interval, || {
            async move { backend.call(tx, block).await.map_err(ChainError::from) }
        })
        .await?;
        Ok(C::abi_decode_returns(&output, true)?)
    }
}

/// How this staker fast confirms assertions.
#[derive(Debug, Clone)]
pub enum FastConfirmer {
    Disabled,
    /// The staker is the rollup's fast confirmer.
    Direct,
    /// The rollup's fast confirmer is a multisig the staker is an owner of.
    Safe(FastConfirmSafe),
}

struct ChainInner<B> {
    backend: ChainBackendTransactor<B>,
    rollup: Address,
    challenge_manager: Address,
    stake_token: Address,
    bridge: Address,
    staker: Address,
    config: ChainConfig,
    tx_opts: TxOpts,
    cancel: CancellationToken,
    min_assertion_period_blocks: u64,
    challenge_constants: ChallengeConstants,
    fast_confirmer: FastConfirmer,
    /// Parents of challenges known to be complete.
    confirmed_challenges: Cache<AssertionHash, ()>,
}

/// Handle over the rollup and challenge manager contracts, acting as `staker`.
pub struct AssertionChain<B> {
    inner: Arc<ChainInner<B>>,
}

impl<B> Clone for AssertionChain<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B> std::fmt::Debug for AssertionChain<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssertionChain")
            .field("rollup", &self.inner.rollup)
            .field("staker", &self.inner.staker)
            .finish_non_exhaustive()
    }
}

impl<B: ChainBackend> AssertionChain<B> {
    /// Connects to the rollup at `rollup`.
    ///
    /// Reads the stake token, bridge and challenge manager constants once. Fails with
    /// [`ChainError::Config`] if the stake token has no code, or if fast confirmation is enabled
    /// and the staker is not allowed to fast confirm.
    #[instrument(skip(backend, config, cancel), target = "assertion_chain::chain")]
    pub async fn new(
        backend: Arc<B>,
        rollup: Address,
        challenge_manager: Address,
        staker: Address,
        config: ChainConfig,
        cancel: CancellationToken,
    ) -> ChainResult<Self> {
        let caller = ContractCaller {
            backend: backend.as_ref(),
            from: staker,
            block: config.rpc_head_block.block_id(),
            cancel: &cancel,
            retry_interval: config.retry_interval(),
        };

        let stake_token = caller
            .call(rollup, &IRollupCore::stakeTokenCall {})
            .await?
            ._0;
        let code = backend.code_at(stake_token).await?;
        if code.is_empty() {
            return Err(ChainError::Config(format!(
                "stake token {stake_token} has no code"
            )));
        }
        let bridge = caller.call(rollup, &IRollupCore::bridgeCall {}).await?._0;

        let min_period = caller
            .call(rollup, &IRollupCore::minimumAssertionPeriodCall {})
            .await?
            ._0;
        let min_assertion_period_blocks = match min_period.saturating_to::<u64>() {
            0 => 1,
            period => period,
        };

        let challenge_constants = ChallengeConstants::load(&caller, challenge_manager).await?;

        let fast_confirmer = if config.enable_fast_confirmation {
            let confirmer = caller
                .call(rollup, &IRollupCore::anyTrustFastConfirmerCall {})
                .await?
                ._0;
            if confirmer.is_zero() {
                return Err(ChainError::Config(
                    "fast confirmation enabled but the rollup has no fast confirmer".into(),
                ));
            }
            if confirmer == staker {
                FastConfirmer::Direct
            } else {
                FastConfirmer::Safe(FastConfirmSafe::load(&caller, confirmer, staker).await?)
            }
        } else {
            FastConfirmer::Disabled
        };

        info!(
            target: "assertion_chain::chain",
            %stake_token,
            %bridge,
            min_assertion_period_blocks,
            "Connected to rollup"
        );

        let inner = ChainInner {
            backend: ChainBackendTransactor::new(backend, config.tx_queue_capacity, cancel.clone()),
            rollup,
            challenge_manager,
            stake_token,
            bridge,
            staker,
            tx_opts: TxOpts::from_config(staker, &config),
            confirmed_challenges: Cache::new(config.confirmed_challenge_cache_size),
            config,
            cancel,
            min_assertion_period_blocks,
            challenge_constants,
            fast_confirmer,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn rollup_address(&self) -> Address {
        self.inner.rollup
    }

    pub fn challenge_manager_address(&self) -> Address {
        self.inner.challenge_manager
    }

    pub fn stake_token_address(&self) -> Address {
        self.inner.stake_token
    }

    pub fn bridge_address(&self) -> Address {
        self.inner.bridge
    }

    pub fn staker(&self) -> Address {
        self.inner.staker
    }

    pub fn config(&self) -> &ChainConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &ChainBackendTransactor<B> {
        &self.inner.backend
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn fast_confirmer(&self) -> &FastConfirmer {
        &self.inner.fast_confirmer
    }

    pub(crate) fn challenge_constants(&self) -> &ChallengeConstants {
        &self.inner.challenge_constants
    }

    /// Address stake is returned to. Defaults to the staker.
    pub fn withdrawal_address(&self) -> Address {
        self.inner
            .config
            .withdrawal_address
            .unwrap_or(self.inner.staker)
    }

    pub fn spec_challenge_manager(&self) -> SpecChallengeManager<B> {
        SpecChallengeManager::new(self.clone())
    }

    /// Minimum number of blocks between two assertions by the same staker. Never zero.
    pub fn min_assertion_period_blocks(&self) -> u64 {
        self.inner.min_assertion_period_blocks
    }

    /// Maximum number of assertions that may need processing within one challenge period.
    pub fn max_assertions_per_challenge_period(&self) -> u64 {
        self.inner.challenge_constants.challenge_period_blocks / self.inner.min_assertion_period_blocks
    }

    fn caller(&self) -> ContractCaller<'_, ChainBackendTransactor<B>> {
        ContractCaller {
            backend: &self.inner.backend,
            from: self.inner.staker,
            block: self.inner.config.rpc_head_block.block_id(),
            cancel: &self.inner.cancel,
            retry_interval: self.inner.config.retry_interval(),
        }
    }

    /// Calls a view function at the configured head block.
    pub(crate) async fn call<C: SolCall>(&self, to: Address, call: &C) -> ChainResult<C::Return> {
        self.caller().call(to, call).await
    }

    /// Submits `call` to `to` as the staker.
    pub(crate) async fn send<C: SolCall>(&self, to: Address, call: &C) -> ChainResult<TxReceipt> {
        self.send_with_value(to, call, U256::ZERO).await
    }

    pub(crate) async fn send_with_value<C: SolCall>(
        &self,
        to: Address,
        call: &C,
        value: U256,
    ) -> ChainResult<TxReceipt> {
        let tx = TransactionRequest::default()
            .to(to)
            .value(value)
            .input(TransactionInput::new(call.abi_encode().into()));
        transact(&self.inner.backend, &self.inner.tx_opts, &self.inner.cancel, tx).await
    }

    async fn desired_header(&self) -> ChainResult<BlockHeader> {
        let tag = self.inner.config.rpc_head_block.block_tag();
        let backend = &self.inner.backend;
        let header = until_succeeds(&self.inner.cancel, self.inner.config.retry_interval(), || {
            async move { backend.header_by_number(tag).await.map_err(ChainError::from) }
        })
        .await?;
        header.ok_or_else(|| ChainError::NotFound(format!("{tag} block header")))
    }

    /// Number of the block at the configured head policy.
    pub async fn desired_header_number(&self) -> ChainResult<u64> {
        Ok(self.desired_header().await?.number)
    }

    /// L1 block number of the block at the configured head policy.
    ///
    /// Rollup contracts on an Arbitrum parent chain measure periods in L1 blocks, so this is
    /// the clock for confirmation deadlines and unrivaled time. Elsewhere it is the block
    /// number itself.
    pub async fn desired_l1_header_number(&self) -> ChainResult<u64> {
        let header = self.desired_header().await?;
        Ok(header.l1_block_number().unwrap_or(header.number))
    }

    pub(crate) async fn assertion_node(&self, assertion_hash: AssertionHash) -> ChainResult<AssertionNode> {
        Ok(self
            .call(
                self.inner.rollup,
                &IRollupCore::getAssertionCall {
                    assertionHash: assertion_hash.0,
                },
            )
            .await?
            ._0)
    }

    /// Fetches an assertion, failing with [`ChainError::NotFound`] if the rollup has no record
    /// of it.
    pub async fn get_assertion(&self, assertion_hash: AssertionHash) -> ChainResult<Assertion<B>> {
        let node = self.assertion_node(assertion_hash).await?;
        if node.status == 0 {
            return Err(ChainError::NotFound(format!("assertion with id {assertion_hash}")));
        }
        Ok(Assertion::from_node(self.clone(), assertion_hash, &node))
    }

    pub async fn assertion_status(&self, assertion_hash: AssertionHash) -> ChainResult<AssertionStatus> {
        let node = self.assertion_node(assertion_hash).await?;
        AssertionStatus::from_u8(node.status).ok_or_else(|| {
            ChainError::Internal(format!(
                "unknown status {} for assertion {assertion_hash}",
                node.status
            ))
        })
    }

    pub async fn latest_confirmed_hash(&self) -> ChainResult<AssertionHash> {
        let latest = self
            .call(self.inner.rollup, &IRollupCore::latestConfirmedCall {})
            .await?
            ._0;
        Ok(AssertionHash(latest))
    }

    pub async fn latest_confirmed(&self) -> ChainResult<Assertion<B>> {
        let latest = self.latest_confirmed_hash().await?;
        self.get_assertion(latest).await
    }

    /// Whether the staker currently has stake in the rollup.
    pub async fn is_staked(&self) -> ChainResult<bool> {
        Ok(self
            .call(
                self.inner.rollup,
                &IRollupCore::isStakedCall {
                    staker: self.inner.staker,
                },
            )
            .await?
            ._0)
    }

    pub async fn genesis_assertion_hash(&self) -> ChainResult<AssertionHash> {
        let genesis = self
            .call(self.inner.rollup, &IRollupCore::genesisAssertionHashCall {})
            .await?
            ._0;
        Ok(AssertionHash(genesis))
    }

    /// Parent chain block the assertion's creation event was emitted in.
    pub async fn get_assertion_creation_parent_block(
        &self,
        assertion_hash: AssertionHash,
    ) -> ChainResult<u64> {
        let block = self
            .call(
                self.inner.rollup,
                &IRollupCore::getAssertionCreationBlockForLogLookupCall {
                    assertionHash: assertion_hash.0,
                },
            )
            .await?
            ._0;
        u64::try_from(block).map_err(|_| {
            ChainError::Internal(format!(
                "creation block {block} of assertion {assertion_hash} is not a u64"
            ))
        })
    }

    /// A challenge rooted at `parent` is complete once `parent` is confirmed and some child of
    /// it was confirmed after it.
    #[instrument(skip(self), target = "assertion_chain::chain")]
    pub async fn is_challenge_complete(&self, parent: AssertionHash) -> ChainResult<bool> {
        if self.inner.confirmed_challenges.contains_key(&parent) {
            return Ok(true);
        }
        if self.assertion_status(parent).await? != AssertionStatus::Confirmed {
            return Ok(false);
        }
        let latest_confirmed = self.latest_confirmed_hash().await?;
        let complete = latest_confirmed != parent;
        if complete {
            debug!(target: "assertion_chain::chain", %parent, "Challenge complete");
            self.inner.confirmed_challenges.insert(parent, ());
        }
        Ok(complete)
    }

    /// Parent assertion of the fork decided by the challenge `edge_id` belongs to.
    pub async fn top_level_assertion(&self, edge_id: EdgeId) -> ChainResult<AssertionHash> {
        let edge = self
            .spec_challenge_manager()
            .get_edge(edge_id)
            .await?
            .ok_or_else(|| ChainError::NotFound(format!("edge {edge_id}")))?;
        edge.assertion_hash().await
    }

    /// Start heights of the one step forks the challenge of `edge_id` descends from.
    pub async fn top_level_claim_heights(&self, edge_id: EdgeId) -> ChainResult<OriginHeights> {
        let edge = self
            .spec_challenge_manager()
            .get_edge(edge_id)
            .await?
            .ok_or_else(|| ChainError::NotFound(format!("edge {edge_id}")))?;
        edge.top_level_claim_heights().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[tokio::test]
    async fn test_new_reads_rollup_config() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        assert_eq!(chain.stake_token_address(), STAKE_TOKEN_ADDRESS);
        assert_eq!(chain.rollup_address(), ROLLUP_ADDRESS);
        assert_eq!(chain.withdrawal_address(), HONEST_STAKER);
        // A zero minimum assertion period is treated as one block.
        assert_eq!(chain.min_assertion_period_blocks(), 1);
        assert_eq!(
            chain.max_assertions_per_challenge_period(),
            CHALLENGE_PERIOD_BLOCKS
        );
        assert!(matches!(chain.fast_confirmer(), FastConfirmer::Disabled));
    }

    #[tokio::test]
    async fn test_min_assertion_period_from_rollup() {
        let mock = Arc::new(MockBackend::new());
        mock.set_minimum_assertion_period(10);
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        assert_eq!(chain.min_assertion_period_blocks(), 10);
        assert_eq!(
            chain.max_assertions_per_challenge_period(),
            CHALLENGE_PERIOD_BLOCKS / 10
        );
    }

    #[tokio::test]
    async fn test_new_rejects_token_without_code() {
        let mock = Arc::new(MockBackend::new());
        mock.set_token_has_code(false);
        let err = AssertionChain::new(
            mock,
            ROLLUP_ADDRESS,
            CHALLENGE_MANAGER_ADDRESS,
            HONEST_STAKER,
            test_config(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChainError::Config(_)));
    }

    #[tokio::test]
    async fn test_reads_retry_transient_failures() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        mock.fail_next_calls(3);
        let latest = chain.latest_confirmed_hash().await.unwrap();
        assert_eq!(latest, AssertionHash(mock.genesis_hash()));
    }

    #[tokio::test]
    async fn test_get_assertion_not_found() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        let err = chain
            .get_assertion(AssertionHash(random_bytes::<32>()))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_genesis_reads() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        let genesis = chain.genesis_assertion_hash().await.unwrap();
        assert_eq!(genesis, AssertionHash(mock.genesis_hash()));
        assert_eq!(
            chain.assertion_status(genesis).await.unwrap(),
            AssertionStatus::Confirmed
        );
        assert_eq!(chain.latest_confirmed().await.unwrap().id(), genesis);
        assert!(!chain.is_staked().await.unwrap());
    }

    #[tokio::test]
    async fn test_is_challenge_complete() {
        let fork = setup_fork().await;
        let genesis = fork.honest.genesis_assertion_hash().await.unwrap();
        let unknown = AssertionHash(random_bytes::<32>());

        // Parent is confirmed and still the latest confirmed assertion.
        assert!(!fork.honest.is_challenge_complete(genesis).await.unwrap());
        assert!(!fork.honest.is_challenge_complete(unknown).await.unwrap());

        fork.mock.advance_blocks(CONFIRM_PERIOD_BLOCKS);
        // Confirming without a winning edge is rejected while the fork is live, so the test
        // confirms the honest branch through its level zero edge instead.
        let manager = fork.honest.spec_challenge_manager();
        let edge = manager
            .add_block_challenge_level_zero_edge(
                &fork.honest_assertion,
                &crate::primitives::History {
                    height: 0,
                    merkle: history_root(HONEST_STAKER, 0, 0, 0),
                    ..Default::default()
                },
                &crate::primitives::History {
                    height: LAYER_ZERO_BLOCK_EDGE_HEIGHT,
                    merkle: history_root(HONEST_STAKER, 0, LAYER_ZERO_BLOCK_EDGE_HEIGHT, 0),
                    ..Default::default()
                },
                prefix_proof(history_root(HONEST_STAKER, 0, 0, 0)),
            )
            .await
            .unwrap();
        fork.mock.advance_blocks(CHALLENGE_PERIOD_BLOCKS);
        edge.confirm_by_timer(fork.honest_assertion.id()).await.unwrap();
        fork.mock.advance_blocks(CHALLENGE_GRACE_PERIOD_BLOCKS);
        fork.honest
            .confirm_assertion_by_challenge_winner(fork.honest_assertion.id(), edge.id())
            .await
            .unwrap();

        assert!(fork.honest.is_challenge_complete(genesis).await.unwrap());
        // Served from the cache.
        fork.mock.fail_next_calls(u64::MAX);
        assert!(fork.honest.is_challenge_complete(genesis).await.unwrap());
    }
}
