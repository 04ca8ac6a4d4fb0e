//! Reconstruction of assertion data from the rollup's creation events.

use super::AssertionChain;
use crate::{
    assertion::Assertion,
    backend::ChainBackend,
    bindings::IRollupCore::{
        self,
        AssertionCreated,
    },
    error::{
        ChainError,
        ChainResult,
    },
    primitives::{
        AssertionCreatedInfo,
        AssertionHash,
    },
    utils::until_succeeds,
};

use alloy_rpc_types::{
    Filter,
    Log,
};
use alloy_sol_types::SolEvent;
use tracing::{
    debug,
    instrument,
};

impl<B: ChainBackend> AssertionChain<B> {
    async fn filter_logs(&self, filter: Filter) -> ChainResult<Vec<Log>> {
        let backend = &self.inner.backend;
        let filter = &filter;
        until_succeeds(&self.inner.cancel, self.inner.config.retry_interval(), || {
            async move { backend.logs(filter).await.map_err(ChainError::from) }
        })
        .await
    }

    fn decode_created(&self, log: &Log) -> ChainResult<AssertionCreated> {
        Ok(AssertionCreated::decode_log_data(&log.inner.data, true)?)
    }

    /// Rebuilds the creation record of an assertion. The zero hash stands for genesis.
    ///
    /// Exactly one creation event must exist in the creation block, anything else is reported
    /// as [`ChainError::Internal`].
    #[instrument(skip(self), target = "assertion_chain::chain")]
    pub async fn read_assertion_creation_info(
        &self,
        assertion_hash: AssertionHash,
    ) -> ChainResult<AssertionCreatedInfo> {
        let mut filter = Filter::new()
            .address(self.inner.rollup)
            .event_signature(AssertionCreated::SIGNATURE_HASH);

        let (creation_parent_block, creation_l1_block) = if assertion_hash.is_zero() {
            let deployment = self
                .call(self.inner.rollup, &IRollupCore::rollupDeploymentBlockCall {})
                .await?
                ._0;
            let deployment = u64::try_from(deployment).map_err(|_| {
                ChainError::Internal(format!("rollup deployment block {deployment} is not a u64"))
            })?;
            (deployment, deployment)
        } else {
            let node = self.assertion_node(assertion_hash).await?;
            if node.status == 0 {
                return Err(ChainError::NotFound(format!(
                    "assertion with id {assertion_hash}"
                )));
            }
            filter = filter.topic1(assertion_hash.0);
            (
                self.get_assertion_creation_parent_block(assertion_hash)
                    .await?,
                node.createdAtBlock,
            )
        };
        let filter = filter
            .from_block(creation_parent_block)
            .to_block(creation_parent_block);

        let logs: Vec<Log> = self
            .filter_logs(filter)
            .await?
            .into_iter()
            .filter(|log| !log.removed)
            .collect();
        let log = match logs.as_slice() {
            [log] => log,
            [] => {
                return Err(ChainError::Internal(format!(
                    "no assertion creation logs found for {assertion_hash} in block {creation_parent_block}"
                )))
            }
            _ => {
                return Err(ChainError::Internal(format!(
                    "found {} assertion creation logs for {assertion_hash} in block {creation_parent_block}",
                    logs.len()
                )))
            }
        };

        let event = self.decode_created(log)?;
        let transaction_hash = log.transaction_hash.ok_or_else(|| {
            ChainError::Internal("assertion creation log has no transaction hash".into())
        })?;
        Ok(AssertionCreatedInfo {
            confirm_period_blocks: event.confirmPeriodBlocks,
            required_stake: event.requiredStake,
            parent_assertion_hash: AssertionHash(event.parentAssertionHash),
            before_state: event.assertion.beforeState,
            after_state: event.assertion.afterState,
            inbox_max_count: event.inboxMaxCount,
            after_inbox_batch_acc: event.afterInboxBatchAcc,
            assertion_hash: AssertionHash(event.assertionHash),
            wasm_module_root: event.wasmModuleRoot,
            challenge_manager: event.challengeManager,
            transaction_hash,
            creation_parent_block: log.block_number.unwrap_or(creation_parent_block),
            creation_l1_block,
        })
    }

    /// Hashes of every assertion created since the latest confirmed one, in creation order.
    pub async fn latest_created_assertion_hashes(&self) -> ChainResult<Vec<AssertionHash>> {
        let logs = self.created_since_latest_confirmed().await?;
        Ok(logs
            .iter()
            .filter_map(|log| log.inner.data.topics().get(1).copied())
            .map(AssertionHash)
            .collect())
    }

    /// The most recently created assertion, or the latest confirmed one if none was created
    /// after it.
    pub async fn latest_created_assertion(&self) -> ChainResult<Assertion<B>> {
        let logs = self.created_since_latest_confirmed().await?;
        let Some(latest) = logs.last() else {
            return self.latest_confirmed().await;
        };
        let event = self.decode_created(latest)?;
        self.get_assertion(AssertionHash(event.assertionHash)).await
    }

    /// Creation events from the latest confirmed assertion's block up to the head, ordered by
    /// block and log index.
    async fn created_since_latest_confirmed(&self) -> ChainResult<Vec<Log>> {
        let latest_confirmed = self.latest_confirmed_hash().await?;
        let from_block = self
            .get_assertion_creation_parent_block(latest_confirmed)
            .await?;
        let head = self.desired_header_number().await?;
        let filter = Filter::new()
            .address(self.inner.rollup)
            .event_signature(AssertionCreated::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(head);

        let mut logs: Vec<Log> = self
            .filter_logs(filter)
            .await?
            .into_iter()
            .filter(|log| !log.removed)
            .collect();
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        debug!(
            target: "assertion_chain::chain",
            from_block,
            head,
            count = logs.len(),
            "Scanned assertion creation logs"
        );
        Ok(logs)
    }
}
