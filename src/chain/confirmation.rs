//! Assertion confirmation: by time, by challenge winner, and fast confirmation.

use super::{
    AssertionChain,
    FastConfirmer,
};
use crate::{
    backend::ChainBackend,
    bindings::IRollupCore,
    error::{
        ChainError,
        ChainResult,
    },
    primitives::{
        AssertionCreatedInfo,
        AssertionHash,
        AssertionStatus,
        EdgeId,
    },
    utils::sleep_or_cancelled,
};

use tracing::{
    debug,
    info,
    instrument,
};

impl<B: ChainBackend> AssertionChain<B> {
    /// Confirms an assertion that was never challenged.
    pub async fn confirm_assertion_by_time(&self, assertion_hash: AssertionHash) -> ChainResult<()> {
        self.confirm_assertion_by_challenge_winner(assertion_hash, EdgeId::ZERO)
            .await
    }

    /// Confirms an assertion whose level zero block edge `winning_edge` won its challenge.
    ///
    /// The confirmation carries the parent's config as recorded when the parent was created.
    /// Fails with [`ChainError::NotLatestConfirmed`] unless the parent is the latest confirmed
    /// assertion.
    #[instrument(skip(self), target = "assertion_chain::confirmation")]
    pub async fn confirm_assertion_by_challenge_winner(
        &self,
        assertion_hash: AssertionHash,
        winning_edge: EdgeId,
    ) -> ChainResult<()> {
        match self.assertion_status(assertion_hash).await? {
            AssertionStatus::Confirmed => return Ok(()),
            AssertionStatus::NoAssertion => {
                return Err(ChainError::NotFound(format!(
                    "assertion with id {assertion_hash}"
                )))
            }
            AssertionStatus::Pending => {}
        }

        let info = self.read_assertion_creation_info(assertion_hash).await?;
        if info.parent_assertion_hash.is_zero() {
            // Genesis.
            return Ok(());
        }
        let parent_info = self
            .read_assertion_creation_info(info.parent_assertion_hash)
            .await?;
        let latest_confirmed = self.latest_confirmed_hash().await?;
        if info.parent_assertion_hash != latest_confirmed {
            return Err(ChainError::NotLatestConfirmed {
                parent: info.parent_assertion_hash,
                latest_confirmed,
            });
        }
        let next_inbox_position = u64::try_from(parent_info.inbox_max_count).map_err(|_| {
            ChainError::Internal(format!(
                "inbox max count {} of {} is not a u64",
                parent_info.inbox_max_count, parent_info.assertion_hash
            ))
        })?;

        let receipt = self
            .send(
                self.inner.rollup,
                &IRollupCore::confirmAssertionCall {
                    assertionHash: assertion_hash.0,
                    prevAssertionHash: info.parent_assertion_hash.0,
                    confirmState: info.after_state.clone(),
                    winningEdgeId: winning_edge.0,
                    prevConfig: parent_info.config_data(next_inbox_position),
                    inboxAcc: info.after_inbox_batch_acc,
                },
            )
            .await
            .map_err(ChainError::classified)?;
        if receipt.logs.is_empty() {
            return Err(ChainError::Internal(
                "no logs observed from assertion confirmation".into(),
            ));
        }
        info!(
            target: "assertion_chain::confirmation",
            %assertion_hash,
            %winning_edge,
            tx_hash = %receipt.transaction_hash,
            "Confirmed assertion"
        );
        Ok(())
    }

    /// Waits until the head passes `confirmable_after_block`, then attempts to confirm.
    ///
    /// Returns `Ok(false)` when the attempt failed only because confirmation is not possible
    /// yet, so callers can poll again later.
    #[instrument(skip(self), target = "assertion_chain::confirmation")]
    pub async fn try_confirming_assertion(
        &self,
        assertion_hash: AssertionHash,
        confirmable_after_block: u64,
        winning_edge: Option<EdgeId>,
    ) -> ChainResult<bool> {
        match self.assertion_status(assertion_hash).await? {
            AssertionStatus::Confirmed => return Ok(true),
            AssertionStatus::NoAssertion => {
                return Err(ChainError::NotFound(format!(
                    "assertion with id {assertion_hash}"
                )))
            }
            AssertionStatus::Pending => {}
        }

        loop {
            let head = self.desired_l1_header_number().await?;
            if head >= confirmable_after_block {
                break;
            }
            let blocks_left = confirmable_after_block - head;
            let wait = self
                .inner
                .config
                .parent_chain_block_time()
                .saturating_mul(u32::try_from(blocks_left).unwrap_or(u32::MAX));
            debug!(
                target: "assertion_chain::confirmation",
                head,
                blocks_left,
                ?wait,
                "Waiting to confirm assertion"
            );
            if !sleep_or_cancelled(&self.inner.cancel, wait).await {
                return Err(ChainError::Cancelled);
            }
        }

        let attempt = match winning_edge {
            Some(edge) => {
                self.confirm_assertion_by_challenge_winner(assertion_hash, edge)
                    .await
            }
            None => self.confirm_assertion_by_time(assertion_hash).await,
        };
        match attempt {
            Ok(()) => Ok(true),
            Err(err) if err.is_confirmation_not_ready() => {
                debug!(target: "assertion_chain::confirmation", %err, "Assertion not confirmable yet");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Number of blocks an assertion went without a sibling.
    ///
    /// Zero for anything but a first child. While no sibling exists this grows with the head;
    /// afterwards it is fixed to the gap between the first and second child.
    pub async fn assertion_unrivaled_blocks(&self, assertion_hash: AssertionHash) -> ChainResult<u64> {
        let assertion = self.get_assertion(assertion_hash).await?;
        if !assertion.is_first_child().await? {
            return Ok(0);
        }
        let parent = self.get_assertion(assertion.prev_id().await?).await?;
        let first_child_block = parent.first_child_creation_block().await?;
        let second_child_block = parent.second_child_creation_block().await?;
        if second_child_block == 0 {
            let head = self.desired_l1_header_number().await?;
            let created = assertion.created_at_block();
            return head.checked_sub(created).ok_or_else(|| {
                ChainError::Internal(format!(
                    "assertion {assertion_hash} created at {created}, after head {head}"
                ))
            });
        }
        second_child_block
            .checked_sub(first_child_block)
            .ok_or_else(|| {
                ChainError::Internal(format!(
                    "first child of {} created at {first_child_block}, after the second child at {second_child_block}",
                    parent.id()
                ))
            })
    }

    /// Fast confirms an assertion through the rollup's fast confirmer.
    ///
    /// Returns `Ok(false)` when a multisig fast confirmer does not have enough approvals yet.
    #[instrument(skip_all, fields(assertion = %info.assertion_hash), target = "assertion_chain::confirmation")]
    pub async fn fast_confirm_assertion(&self, info: &AssertionCreatedInfo) -> ChainResult<bool> {
        if self.assertion_status(info.assertion_hash).await? == AssertionStatus::Confirmed {
            return Ok(true);
        }
        match &self.inner.fast_confirmer {
            FastConfirmer::Disabled => {
                Err(ChainError::Config("fast confirmation is not enabled".into()))
            }
            FastConfirmer::Direct => {
                let receipt = self
                    .send(
                        self.inner.rollup,
                        &IRollupCore::fastConfirmAssertionCall {
                            assertionHash: info.assertion_hash.0,
                            parentAssertionHash: info.parent_assertion_hash.0,
                            confirmState: info.after_state.clone(),
                            inboxAcc: info.after_inbox_batch_acc,
                        },
                    )
                    .await?;
                if receipt.logs.is_empty() {
                    return Err(ChainError::Internal(
                        "no logs observed from assertion confirmation".into(),
                    ));
                }
                info!(
                    target: "assertion_chain::confirmation",
                    tx_hash = %receipt.transaction_hash,
                    "Fast confirmed assertion"
                );
                Ok(true)
            }
            FastConfirmer::Safe(safe) => safe.fast_confirm(self, info).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        error::ChainError,
        primitives::{
            AssertionHash,
            AssertionStatus,
            EdgeId,
        },
        test_utils::*,
    };

    use std::{
        sync::Arc,
        time::Duration,
    };

    #[tokio::test]
    async fn test_genesis_confirmation_is_trivial() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        let genesis = chain.genesis_assertion_hash().await.unwrap();
        let sent = mock.sent_transactions().len();
        chain.confirm_assertion_by_time(genesis).await.unwrap();
        assert!(chain
            .try_confirming_assertion(genesis, 0, None)
            .await
            .unwrap());
        assert_eq!(mock.sent_transactions().len(), sent);
    }

    #[tokio::test]
    async fn test_confirm_by_time_and_repeat_is_noop() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        let genesis = chain
            .read_assertion_creation_info(AssertionHash::ZERO)
            .await
            .unwrap();
        let assertion = chain
            .new_stake_on_new_assertion(&genesis, &post_state(1, 0x11))
            .await
            .unwrap();

        // Confirmation period not over yet.
        let err = chain
            .confirm_assertion_by_time(assertion.id())
            .await
            .unwrap_err();
        assert!(err.is_confirmation_not_ready());

        mock.advance_blocks(CONFIRM_PERIOD_BLOCKS);
        chain.confirm_assertion_by_time(assertion.id()).await.unwrap();
        assert_eq!(
            chain.assertion_status(assertion.id()).await.unwrap(),
            AssertionStatus::Confirmed
        );
        assert_eq!(chain.latest_confirmed_hash().await.unwrap(), assertion.id());

        let sent = mock.sent_transactions().len();
        let head = mock.block_number();
        chain.confirm_assertion_by_time(assertion.id()).await.unwrap();
        assert_eq!(mock.sent_transactions().len(), sent);
        assert_eq!(mock.block_number(), head);
    }

    #[tokio::test]
    async fn test_try_confirming_before_deadline_returns_false() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        let genesis = chain
            .read_assertion_creation_info(AssertionHash::ZERO)
            .await
            .unwrap();
        let assertion = chain
            .new_stake_on_new_assertion(&genesis, &post_state(1, 0x11))
            .await
            .unwrap();
        // The caller's notion of confirmability is ahead of the rollup's.
        let confirmed = chain
            .try_confirming_assertion(assertion.id(), mock.block_number(), None)
            .await
            .unwrap();
        assert!(!confirmed);
        assert_eq!(
            chain.assertion_status(assertion.id()).await.unwrap(),
            AssertionStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_try_confirming_waits_for_head() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        let genesis = chain
            .read_assertion_creation_info(AssertionHash::ZERO)
            .await
            .unwrap();
        let assertion = chain
            .new_stake_on_new_assertion(&genesis, &post_state(1, 0x11))
            .await
            .unwrap();
        let confirmable_after = assertion.created_at_block() + CONFIRM_PERIOD_BLOCKS;

        let miner = mock.clone();
        let handle = tokio::spawn(async move {
            for _ in 0..CONFIRM_PERIOD_BLOCKS {
                tokio::time::sleep(Duration::from_millis(5)).await;
                miner.advance_blocks(1);
            }
        });
        let confirmed = chain
            .try_confirming_assertion(assertion.id(), confirmable_after, None)
            .await
            .unwrap();
        handle.await.unwrap();

        assert!(confirmed);
        assert!(mock.block_number() >= confirmable_after);
        assert_eq!(
            chain.assertion_status(assertion.id()).await.unwrap(),
            AssertionStatus::Confirmed
        );
    }

    #[tokio::test]
    async fn test_try_confirming_cancelled() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        let genesis = chain
            .read_assertion_creation_info(AssertionHash::ZERO)
            .await
            .unwrap();
        let assertion = chain
            .new_stake_on_new_assertion(&genesis, &post_state(1, 0x11))
            .await
            .unwrap();
        let cancel = chain.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = chain
            .try_confirming_assertion(assertion.id(), u64::MAX, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Cancelled));
    }

    #[tokio::test]
    async fn test_confirm_rivaled_without_confirmed_edge() {
        let fork = setup_fork().await;
        fork.mock.advance_blocks(CONFIRM_PERIOD_BLOCKS);

        let err = fork
            .honest
            .confirm_assertion_by_time(fork.honest_assertion.id())
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::EdgeNotConfirmed(_)));

        let err = fork
            .honest
            .confirm_assertion_by_challenge_winner(
                fork.honest_assertion.id(),
                EdgeId(random_bytes::<32>()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::EdgeNotConfirmed(_)));
    }

    #[tokio::test]
    async fn test_confirm_requires_latest_confirmed_parent() {
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
        let first_info = chain.read_assertion_creation_info(first.id()).await.unwrap();
        let second = chain
            .stake_on_new_assertion(&first_info, &post_state(2, 0x12))
            .await
            .unwrap();
        mock.advance_blocks(CONFIRM_PERIOD_BLOCKS);

        let err = chain
            .confirm_assertion_by_time(second.id())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChainError::NotLatestConfirmed { parent, latest_confirmed }
                if parent == first.id() && latest_confirmed == AssertionHash(mock.genesis_hash())
        ));
        assert!(!chain
            .try_confirming_assertion(second.id(), 0, None)
            .await
            .unwrap());

        chain.confirm_assertion_by_time(first.id()).await.unwrap();
        assert!(chain
            .try_confirming_assertion(second.id(), 0, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_confirmation_uses_recorded_parent_config() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        let genesis = chain
            .read_assertion_creation_info(AssertionHash::ZERO)
            .await
            .unwrap();
        let assertion = chain
            .new_stake_on_new_assertion(&genesis, &post_state(1, 0x11))
            .await
            .unwrap();
        // Upgrading the rollup does not affect assertions created before the upgrade.
        mock.update_rollup_params(|params| {
            params.confirm_period_blocks = CONFIRM_PERIOD_BLOCKS * 10;
            params.wasm_module_root = random_bytes::<32>();
        });
        mock.advance_blocks(CONFIRM_PERIOD_BLOCKS);
        chain.confirm_assertion_by_time(assertion.id()).await.unwrap();
        assert_eq!(
            chain.assertion_status(assertion.id()).await.unwrap(),
            AssertionStatus::Confirmed
        );
    }

    #[tokio::test]
    async fn test_unrivaled_blocks() {
        let mock = Arc::new(MockBackend::new());
        let honest = setup_chain(&mock, HONEST_STAKER).await;
        let evil = setup_chain(&mock, EVIL_STAKER).await;
        let genesis = honest
            .read_assertion_creation_info(AssertionHash::ZERO)
            .await
            .unwrap();
        let first = honest
            .new_stake_on_new_assertion(&genesis, &post_state(1, 0x11))
            .await
            .unwrap();

        let head = mock.block_number();
        let unrivaled = honest.assertion_unrivaled_blocks(first.id()).await.unwrap();
        assert_eq!(unrivaled, head - first.created_at_block());

        mock.advance_blocks(3);
        let grown = honest.assertion_unrivaled_blocks(first.id()).await.unwrap();
        assert_eq!(grown, unrivaled + 3);

        let second = evil
            .new_stake_on_new_assertion(&genesis, &post_state(1, 0x22))
            .await
            .unwrap();
        assert_eq!(honest.assertion_unrivaled_blocks(second.id()).await.unwrap(), 0);

        let fixed = second.created_at_block() - first.created_at_block();
        assert_eq!(honest.assertion_unrivaled_blocks(first.id()).await.unwrap(), fixed);
        mock.advance_blocks(10);
        assert_eq!(honest.assertion_unrivaled_blocks(first.id()).await.unwrap(), fixed);
    }

    #[tokio::test]
    async fn test_unrivaled_blocks_rejects_unordered_children() {
        let mock = Arc::new(MockBackend::new());
        let honest = setup_chain(&mock, HONEST_STAKER).await;
        let evil = setup_chain(&mock, EVIL_STAKER).await;
        let genesis = honest
            .read_assertion_creation_info(AssertionHash::ZERO)
            .await
            .unwrap();
        let first = honest
            .new_stake_on_new_assertion(&genesis, &post_state(1, 0x11))
            .await
            .unwrap();
        let second = evil
            .new_stake_on_new_assertion(&genesis, &post_state(1, 0x22))
            .await
            .unwrap();

        mock.set_child_blocks(
            mock.genesis_hash(),
            second.created_at_block() + 1,
            second.created_at_block(),
        );
        let err = honest
            .assertion_unrivaled_blocks(first.id())
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Internal(_)));
    }

    #[tokio::test]
    async fn test_unrivaled_blocks_on_arbitrum_parent() {
        const L1_OFFSET: u64 = 1_000;
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        mock.set_l1_block_offset(L1_OFFSET);
        mock.advance_blocks(1);
        let genesis = chain
            .read_assertion_creation_info(AssertionHash::ZERO)
            .await
            .unwrap();
        let assertion = chain
            .new_stake_on_new_assertion(&genesis, &post_state(1, 0x11))
            .await
            .unwrap();
        assert_eq!(assertion.created_at_block(), mock.block_number() + L1_OFFSET);
        assert_eq!(chain.desired_header_number().await.unwrap(), mock.block_number());
        assert_eq!(
            chain.desired_l1_header_number().await.unwrap(),
            mock.block_number() + L1_OFFSET
        );

        mock.advance_blocks(4);
        assert_eq!(chain.assertion_unrivaled_blocks(assertion.id()).await.unwrap(), 4);

        // Deadlines are in L1 blocks as well.
        let confirmable_after = assertion.created_at_block() + CONFIRM_PERIOD_BLOCKS;
        mock.advance_blocks(CONFIRM_PERIOD_BLOCKS);
        assert!(chain
            .try_confirming_assertion(assertion.id(), confirmable_after, None)
            .await
            .unwrap());
        let info = chain.read_assertion_creation_info(assertion.id()).await.unwrap();
        assert_eq!(info.creation_l1_block, assertion.created_at_block());
        assert_eq!(info.creation_parent_block + L1_OFFSET, info.creation_l1_block);
    }

    #[tokio::test]
    async fn test_fast_confirm_disabled() {
        let mock = Arc::new(MockBackend::new());
        let chain = setup_chain(&mock, HONEST_STAKER).await;
        let genesis = chain
            .read_assertion_creation_info(AssertionHash::ZERO)
            .await
            .unwrap();
        let assertion = chain
            .new_stake_on_new_assertion(&genesis, &post_state(1, 0x11))
            .await
            .unwrap();
        let info = chain.read_assertion_creation_info(assertion.id()).await.unwrap();
        let err = chain.fast_confirm_assertion(&info).await.unwrap_err();
        assert!(matches!(err, ChainError::Config(_)));
    }

    #[tokio::test]
    async fn test_fast_confirm_direct() {
        let mock = Arc::new(MockBackend::new());
        mock.set_fast_confirmer(HONEST_STAKER);
        let config = crate::config::ChainConfig {
            enable_fast_confirmation: true,
            ..test_config()
        };
        let chain = setup_chain_with_config(&mock, HONEST_STAKER, config).await;
        assert!(matches!(
            chain.fast_confirmer(),
            crate::chain::FastConfirmer::Direct
        ));
        let genesis = chain
            .read_assertion_creation_info(AssertionHash::ZERO)
            .await
            .unwrap();
        let assertion = chain
            .new_stake_on_new_assertion(&genesis, &post_state(1, 0x11))
            .await
            .unwrap();
        let info = chain.read_assertion_creation_info(assertion.id()).await.unwrap();

        // No need to wait out the confirmation period.
        assert!(chain.fast_confirm_assertion(&info).await.unwrap());
        assert_eq!(
            chain.assertion_status(assertion.id()).await.unwrap(),
            AssertionStatus::Confirmed
        );
        let sent = mock.sent_transactions().len();
        assert!(chain.fast_confirm_assertion(&info).await.unwrap());
        assert_eq!(mock.sent_transactions().len(), sent);
    }

    #[tokio::test]
    async fn test_fast_confirm_direct_without_logs() {
        let mock = Arc::new(MockBackend::new());
        mock.set_fast_confirmer(HONEST_STAKER);
        let config = crate::config::ChainConfig {
            enable_fast_confirmation: true,
            ..test_config()
        };
        let chain = setup_chain_with_config(&mock, HONEST_STAKER, config).await;
        let genesis = chain
            .read_assertion_creation_info(AssertionHash::ZERO)
            .await
            .unwrap();
        let assertion = chain
            .new_stake_on_new_assertion(&genesis, &post_state(1, 0x11))
            .await
            .unwrap();
        let info = chain.read_assertion_creation_info(assertion.id()).await.unwrap();

        mock.drop_next_mined_logs();
        let err = chain.fast_confirm_assertion(&info).await.unwrap_err();
        assert!(matches!(err, ChainError::Internal(_)));
    }
}
