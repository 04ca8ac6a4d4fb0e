//! Stake management and assertion creation.

use super::AssertionChain;
use crate::{
    assertion::Assertion,
    backend::ChainBackend,
    bindings::{
        AssertionInputs,
        BeforeStateData,
        IBridge,
        IRollupCore::{
            self,
            AssertionCreated,
        },
        IStakeToken,
    },
    error::{
        classify_create_assertion_error,
        ChainError,
        ChainResult,
    },
    primitives::{
        AssertionCreatedInfo,
        AssertionHash,
        ExecutionState,
        U256,
    },
};

use alloy_sol_types::SolEvent;
use tracing::{
    debug,
    info,
    instrument,
};

impl<B: ChainBackend> AssertionChain<B> {
    /// Lets the rollup and the challenge manager spend the staker's stake token.
    pub async fn approve_allowances(&self) -> ChainResult<()> {
        for spender in [self.inner.rollup, self.inner.challenge_manager] {
            let allowance = self
                .call(
                    self.inner.stake_token,
                    &IStakeToken::allowanceCall {
                        owner: self.inner.staker,
                        spender,
                    },
                )
                .await?
                ._0;
            if allowance == U256::MAX {
                continue;
            }
            self.send(
                self.inner.stake_token,
                &IStakeToken::approveCall {
                    spender,
                    amount: U256::MAX,
                },
            )
            .await?;
            debug!(target: "assertion_chain::staking", %spender, "Approved stake token allowance");
        }
        Ok(())
    }

    /// Wraps native currency into the stake token so the staker holds at least `amount`.
    ///
    /// Does nothing if auto deposit is disabled or the staker is already staked.
    pub async fn auto_deposit_token_for_staking(&self, amount: U256) -> ChainResult<()> {
        if !self.inner.config.auto_deposit || self.is_staked().await? {
            return Ok(());
        }
        let balance = self
            .call(
                self.inner.stake_token,
                &IStakeToken::balanceOfCall {
                    owner: self.inner.staker,
                },
            )
            .await?
            ._0;
        if balance >= amount {
            return Ok(());
        }
        let shortfall = amount - balance;
        info!(target: "assertion_chain::staking", %balance, %shortfall, "Depositing into stake token");
        self.send_with_value(self.inner.stake_token, &IStakeToken::depositCall {}, shortfall)
            .await?;
        Ok(())
    }

    /// Stakes without backing a new assertion. No-op if already staked.
    pub async fn new_stake(&self) -> ChainResult<()> {
        if self.is_staked().await? {
            return Ok(());
        }
        self.send(
            self.inner.rollup,
            &IRollupCore::newStakeCall {
                tokenAmount: U256::ZERO,
                withdrawalAddress: self.withdrawal_address(),
            },
        )
        .await?;
        Ok(())
    }

    /// Creates an assertion on top of `parent` with a fresh stake.
    pub async fn new_stake_on_new_assertion(
        &self,
        parent: &AssertionCreatedInfo,
        post_state: &ExecutionState,
    ) -> ChainResult<Assertion<B>> {
        self.create_and_stake_on_assertion(parent, post_state, true)
            .await
    }

    /// Creates an assertion on top of `parent`, moving the staker's existing stake.
    pub async fn stake_on_new_assertion(
        &self,
        parent: &AssertionCreatedInfo,
        post_state: &ExecutionState,
    ) -> ChainResult<Assertion<B>> {
        self.create_and_stake_on_assertion(parent, post_state, false)
            .await
    }

    /// Idempotent: if the assertion these inputs hash to exists, it is returned as is.
    #[instrument(
        skip_all,
        fields(parent = %parent.assertion_hash, batch = post_state.global_state.batch),
        target = "assertion_chain::staking"
    )]
    async fn create_and_stake_on_assertion(
        &self,
        parent: &AssertionCreatedInfo,
        post_state: &ExecutionState,
        new_stake: bool,
    ) -> ChainResult<Assertion<B>> {
        let next_inbox_position = u64::try_from(parent.inbox_max_count).map_err(|_| {
            ChainError::InvalidArgument(format!(
                "parent inbox max count {} is not a u64",
                parent.inbox_max_count
            ))
        })?;
        let batch = post_state.global_state.batch;
        if batch == 0 {
            return Err(ChainError::InvalidArgument(
                "only genesis may have a post state batch of 0".into(),
            ));
        }

        let inbox_acc = match self
            .call(
                self.inner.bridge,
                &IBridge::sequencerInboxAccsCall {
                    index: U256::from(batch - 1),
                },
            )
            .await
        {
            Ok(acc) => acc._0,
            Err(err) if err.revert_reason().is_some() => {
                debug!(target: "assertion_chain::staking", batch, %err, "Batch accumulator not available");
                return Err(ChainError::BatchNotYetFound);
            }
            Err(err) => return Err(err),
        };

        let assertion_hash = AssertionHash(
            self.call(
                self.inner.rollup,
                &IRollupCore::computeAssertionHashCall {
                    prevAssertionHash: parent.assertion_hash.0,
                    state: post_state.to_sol(),
                    inboxAcc: inbox_acc,
                },
            )
            .await?
            ._0,
        );
        match self.get_assertion(assertion_hash).await {
            Ok(existing) => {
                info!(target: "assertion_chain::staking", %assertion_hash, "Assertion already exists");
                return Ok(existing);
            }
            Err(ChainError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        let inputs = AssertionInputs {
            beforeStateData: BeforeStateData {
                prevPrevAssertionHash: parent.parent_assertion_hash.0,
                sequencerBatchAcc: parent.after_inbox_batch_acc,
                configData: parent.config_data(next_inbox_position),
            },
            beforeState: parent.after_state.clone(),
            afterState: post_state.to_sol(),
        };
        let sent = if new_stake {
            self.auto_deposit_token_for_staking(parent.required_stake)
                .await?;
            self.send(
                self.inner.rollup,
                &IRollupCore::newStakeOnNewAssertionCall {
                    tokenAmount: parent.required_stake,
                    assertion: inputs,
                    expectedAssertionHash: assertion_hash.0,
                    withdrawalAddress: self.withdrawal_address(),
                },
            )
            .await
        } else {
            self.send(
                self.inner.rollup,
                &IRollupCore::stakeOnNewAssertionCall {
                    assertion: inputs,
                    expectedAssertionHash: assertion_hash.0,
                },
            )
            .await
        };

        let receipt = match sent {
            Ok(receipt) => receipt,
            Err(err) => {
                match classify_create_assertion_error(err, post_state.global_state.block_hash) {
                    ChainError::AlreadyExists(reason) => {
                        debug!(target: "assertion_chain::staking", %assertion_hash, %reason, "Assertion created concurrently");
                        return self.get_assertion(assertion_hash).await;
                    }
                    err => return Err(err),
                }
            }
        };
        if receipt.logs.is_empty() {
            return Err(ChainError::Internal(
                "no logs observed from assertion creation".into(),
            ));
        }
        let created = receipt
            .logs
            .iter()
            .filter(|log| log.inner.address == self.inner.rollup)
            .find_map(|log| AssertionCreated::decode_log_data(&log.inner.data, true).ok())
            .ok_or_else(|| {
                ChainError::Internal("no assertion created event in creation receipt".into())
            })?;

        info!(
            target: "assertion_chain::staking",
            assertion_hash = %created.assertionHash,
            tx_hash = %receipt.transaction_hash,
            "Created assertion"
        );
        self.get_assertion(AssertionHash(created.assertionHash))
            .await
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        error::ChainError,
        primitives::{
            AssertionHash,
            U256,
        },
        test_utils::*,
    };

    use std::sync::Arc;

    #[tokio::test]
    async fn test_approve_allowances_skips_when_max() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        let sent = mock.sent_transactions().len();
        assert_eq!(sent, 2);
        chain.approve_allowances().await.unwrap();
        assert_eq!(mock.sent_transactions().len(), sent);
    }

    #[tokio::test]
    async fn test_new_stake_is_idempotent() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        assert!(!chain.is_staked().await.unwrap());
        chain.new_stake().await.unwrap();
        assert!(chain.is_staked().await.unwrap());

        let sent = mock.sent_transactions().len();
        chain.new_stake().await.unwrap();
        assert_eq!(mock.sent_transactions().len(), sent);
    }

    #[tokio::test]
    async fn test_auto_deposit_covers_shortfall() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        mock.mint(HONEST_STAKER, U256::from(30));
        chain
            .auto_deposit_token_for_staking(U256::from(100))
            .await
            .unwrap();
        assert_eq!(mock.balance_of(HONEST_STAKER), U256::from(100));

        // Balance already suffices.
        let sent = mock.sent_transactions().len();
        chain
            .auto_deposit_token_for_staking(U256::from(100))
            .await
            .unwrap();
        assert_eq!(mock.sent_transactions().len(), sent);
    }

    #[tokio::test]
    async fn test_auto_deposit_disabled() {
        let mock = Arc::new(MockBackend::new());
        let config = crate::config::ChainConfig {
            auto_deposit: false,
            ..test_config()
        };
        let chain = setup_chain_with_config(&mock, HONEST_STAKER, config).await;
        let genesis = chain
            .read_assertion_creation_info(AssertionHash::ZERO)
            .await
            .unwrap();
        let err = chain
            .new_stake_on_new_assertion(&genesis, &post_state(1, 0x11))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::SimulationFailed(_)));
        assert_eq!(mock.balance_of(HONEST_STAKER), U256::ZERO);
    }

    #[tokio::test]
    async fn test_create_assertion_is_idempotent() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        let genesis = chain
            .read_assertion_creation_info(AssertionHash::ZERO)
            .await
            .unwrap();

        let first = chain
            .new_stake_on_new_assertion(&genesis, &post_state(1, 0x11))
            .await
            .unwrap();
        let sent = mock.sent_transactions().len();
        let second = chain
            .new_stake_on_new_assertion(&genesis, &post_state(1, 0x11))
            .await
            .unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(first.created_at_block(), second.created_at_block());
        assert_eq!(mock.sent_transactions().len(), sent);
        assert!(chain.is_staked().await.unwrap());
        assert_eq!(
            first.id(),
            AssertionHash(compute_assertion_hash(
                mock.genesis_hash(),
                &post_state(1, 0x11).to_sol(),
                mock.inbox_acc(1),
            ))
        );
    }

    #[tokio::test]
    async fn test_concurrent_creation_converges() {
        let mock = Arc::new(MockBackend::new());
        let honest = setup_chain(&mock, HONEST_STAKER).await;
        let other = setup_chain(&mock, EVIL_STAKER).await;
        let genesis = honest
            .read_assertion_creation_info(AssertionHash::ZERO)
            .await
            .unwrap();
        let honest_post = post_state(1, 0x11);
        let other_post = post_state(1, 0x11);
        let (a, b) = tokio::join!(
            honest.new_stake_on_new_assertion(&genesis, &honest_post),
            other.new_stake_on_new_assertion(&genesis, &other_post),
        );
        assert_eq!(a.unwrap().id(), b.unwrap().id());
    }

    #[tokio::test]
    async fn test_batch_zero_rejected() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        let genesis = chain
            .read_assertion_creation_info(AssertionHash::ZERO)
            .await
            .unwrap();
        let err = chain
            .new_stake_on_new_assertion(&genesis, &post_state(0, 0x11))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_unknown_batch() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        let genesis = chain
            .read_assertion_creation_info(AssertionHash::ZERO)
            .await
            .unwrap();
        let err = chain
            .new_stake_on_new_assertion(&genesis, &post_state(INITIAL_INBOX_BATCHES + 1, 0x11))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::BatchNotYetFound));
        // Only the allowance approvals were sent.
        assert_eq!(mock.sent_transactions().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_parent() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        let mut parent = chain
            .read_assertion_creation_info(AssertionHash::ZERO)
            .await
            .unwrap();
        // The rollup derives the parent hash from the before state.
        parent.after_state.endHistoryRoot = random_bytes::<32>();
        let err = chain
            .new_stake_on_new_assertion(&parent, &post_state(1, 0x11))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::PrevDoesNotExist));
    }

    #[tokio::test]
    async fn test_sibling_too_late() {
        let fork = setup_fork().await;
        let genesis = fork
            .honest
            .read_assertion_creation_info(AssertionHash::ZERO)
            .await
            .unwrap();
        fork.mock.advance_blocks(CONFIRM_PERIOD_BLOCKS);
        let late = setup_chain(&fork.mock, crate::primitives::Address::with_last_byte(0x77)).await;
        let err = late
            .new_stake_on_new_assertion(&genesis, &post_state(1, 0x33))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::TooLate));
    }
}
