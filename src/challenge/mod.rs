//! Edge challenge manager: level zero edge creation, one step proofs and timer caches.

mod edge;
pub use edge::SpecEdge;

use crate::{
    assertion::Assertion,
    backend::{
        ChainBackend,
        TxReceipt,
    },
    bindings::{
        ChallengeEdge,
        CreateEdgeArgs,
        ExecutionContext,
        IEdgeChallengeManager::{
            self,
            EdgeAdded,
        },
        IOneStepProofEntry,
        OneStepData as SolOneStepData,
    },
    chain::{
        AssertionChain,
        ContractCaller,
    },
    error::{
        ChainError,
        ChainResult,
    },
    primitives::{
        Address,
        ChallengeLevel,
        EdgeId,
        EdgeStatus,
        Height,
        History,
        LayerZeroHeights,
        MutualId,
        OneStepData,
        OriginId,
        B256,
        U256,
    },
    utils::trunc,
};

use alloy_primitives::Bytes;
use alloy_sol_types::{
    SolEvent,
    SolValue,
};
use tracing::{
    debug,
    info,
    instrument,
};

/// Challenge manager values that are fixed at deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengeConstants {
    pub layer_zero_heights: LayerZeroHeights,
    pub num_big_step_levels: u8,
    pub challenge_period_blocks: u64,
    pub one_step_proof_entry: Address,
}

fn height(value: U256, name: &str) -> ChainResult<Height> {
    u64::try_from(value).map_err(|_| ChainError::Internal(format!("{name} {value} is not a u64")))
}

impl ChallengeConstants {
    pub(crate) async fn load<B: ChainBackend>(
        caller: &ContractCaller<'_, B>,
        challenge_manager: Address,
    ) -> ChainResult<Self> {
        use IEdgeChallengeManager::*;

        let block = caller
            .call(challenge_manager, &LAYERZERO_BLOCKEDGE_HEIGHTCall {})
            .await?
            ._0;
        let big_step = caller
            .call(challenge_manager, &LAYERZERO_BIGSTEPEDGE_HEIGHTCall {})
            .await?
            ._0;
        let small_step = caller
            .call(challenge_manager, &LAYERZERO_SMALLSTEPEDGE_HEIGHTCall {})
            .await?
            ._0;
        Ok(Self {
            layer_zero_heights: LayerZeroHeights {
                block_challenge_height: height(block, "block edge height")?,
                big_step_challenge_height: height(big_step, "big step edge height")?,
                small_step_challenge_height: height(small_step, "small step edge height")?,
            },
            num_big_step_levels: caller
                .call(challenge_manager, &NUM_BIGSTEP_LEVELCall {})
                .await?
                ._0,
            challenge_period_blocks: caller
                .call(challenge_manager, &challengePeriodBlocksCall {})
                .await?
                ._0,
            one_step_proof_entry: caller
                .call(challenge_manager, &oneStepProofEntryCall {})
                .await?
                ._0,
        })
    }

    /// Block level, every big step level and the small step level.
    pub fn total_levels(&self) -> u8 {
        self.num_big_step_levels + 2
    }
}

/// Handle over the edge challenge manager, sharing the staker and submitter of the
/// [`AssertionChain`] it was obtained from.
pub struct SpecChallengeManager<B> {
    chain: AssertionChain<B>,
}

impl<B> Clone for SpecChallengeManager<B> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
        }
    }
}

impl<B> std::fmt::Debug for SpecChallengeManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecChallengeManager")
            .field("chain", &self.chain)
            .finish()
    }
}

impl<B: ChainBackend> SpecChallengeManager<B> {
    pub(crate) fn new(chain: AssertionChain<B>) -> Self {
        Self { chain }
    }

    pub fn address(&self) -> Address {
        self.chain.challenge_manager_address()
    }

    pub(crate) fn chain(&self) -> &AssertionChain<B> {
        &self.chain
    }

    pub fn constants(&self) -> &ChallengeConstants {
        self.chain.challenge_constants()
    }

    pub fn layer_zero_heights(&self) -> LayerZeroHeights {
        self.constants().layer_zero_heights
    }

    pub fn num_big_step_levels(&self) -> u8 {
        self.constants().num_big_step_levels
    }

    pub fn challenge_period_blocks(&self) -> u64 {
        self.constants().challenge_period_blocks
    }

    /// Layer zero height of edges at `level`.
    pub fn level_zero_height(&self, level: ChallengeLevel) -> Height {
        let heights = self.layer_zero_heights();
        if level.is_block_challenge_level() {
            heights.block_challenge_height
        } else if level.0 <= self.num_big_step_levels() {
            heights.big_step_challenge_height
        } else {
            heights.small_step_challenge_height
        }
    }

    pub(crate) async fn call<C: alloy_sol_types::SolCall>(&self, call: &C) -> ChainResult<C::Return> {
        self.chain.call(self.address(), call).await
    }

    pub(crate) async fn send<C: alloy_sol_types::SolCall>(&self, call: &C) -> ChainResult<TxReceipt> {
        self.chain.send(self.address(), call).await
    }

    /// Raw edge record. Fails with [`ChainError::NotFound`] if the edge does not exist.
    pub(crate) async fn read_edge(&self, edge_id: EdgeId) -> ChainResult<ChallengeEdge> {
        match self
            .call(&IEdgeChallengeManager::getEdgeCall { edgeId: edge_id.0 })
            .await
        {
            Ok(edge) => Ok(edge._0),
            Err(err) if err.revert_reason().is_some_and(|r| r.contains("does not exist")) => {
                Err(ChainError::NotFound(format!("edge {edge_id}")))
            }
            Err(err) => Err(err),
        }
    }

    /// Fetches an edge, `None` if the challenge manager does not know it.
    pub async fn get_edge(&self, edge_id: EdgeId) -> ChainResult<Option<SpecEdge<B>>> {
        let inner = match self.read_edge(edge_id).await {
            Ok(inner) => inner,
            Err(ChainError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let mutual_id = self
            .call(&IEdgeChallengeManager::calculateMutualIdCall {
                level: inner.level,
                originId: inner.originId,
                startHeight: inner.startHeight,
                startHistoryRoot: inner.startHistoryRoot,
                endHeight: inner.endHeight,
            })
            .await?
            ._0;
        SpecEdge::new(self.clone(), edge_id, MutualId(mutual_id), inner).map(Some)
    }

    pub async fn calculate_edge_id(
        &self,
        level: ChallengeLevel,
        origin_id: OriginId,
        start_height: Height,
        start_history_root: B256,
        end_height: Height,
        end_history_root: B256,
    ) -> ChainResult<EdgeId> {
        let id = self
            .call(&IEdgeChallengeManager::calculateEdgeIdCall {
                level: level.0,
                originId: origin_id.0,
                startHeight: U256::from(start_height),
                startHistoryRoot: start_history_root,
                endHeight: U256::from(end_height),
                endHistoryRoot: end_history_root,
            })
            .await?
            ._0;
        Ok(EdgeId(id))
    }

    /// Submits a layer zero edge and returns it as stored by the challenge manager.
    async fn create_layer_zero_edge(&self, args: CreateEdgeArgs) -> ChainResult<SpecEdge<B>> {
        let level = args.level;
        let receipt = self
            .send(&IEdgeChallengeManager::createLayerZeroEdgeCall { args })
            .await?;
        if receipt.logs.is_empty() {
            return Err(ChainError::Internal(format!(
                "no logs observed from level {level} layer zero edge creation"
            )));
        }
        let added = receipt
            .logs
            .iter()
            .filter(|log| log.inner.address == self.address())
            .find_map(|log| EdgeAdded::decode_log_data(&log.inner.data, true).ok())
            .ok_or_else(|| ChainError::Internal("no edge added event in receipt".into()))?;
        info!(
            target: "assertion_chain::challenge",
            edge_id = %trunc(&added.edgeId),
            level,
            has_rival = added.hasRival,
            "Created layer zero edge"
        );
        self.get_edge(EdgeId(added.edgeId))
            .await?
            .ok_or_else(|| ChainError::NotFound(format!("created edge {}", added.edgeId)))
    }

    /// Opens the block challenge for `assertion`. Returns the existing edge if one with the
    /// same commitments was already created.
    #[instrument(skip_all, fields(assertion = %assertion.id()), target = "assertion_chain::challenge")]
    pub async fn add_block_challenge_level_zero_edge(
        &self,
        assertion: &Assertion<B>,
        start: &History,
        end: &History,
        prefix_proof: Bytes,
    ) -> ChainResult<SpecEdge<B>> {
        let expected_height = self.layer_zero_heights().block_challenge_height;
        if end.height != expected_height {
            return Err(ChainError::InvalidArgument(format!(
                "end commitment height {} differs from the layer zero block edge height {expected_height}",
                end.height
            )));
        }
        let info = self
            .chain
            .read_assertion_creation_info(assertion.id())
            .await?;
        let parent_info = self
            .chain
            .read_assertion_creation_info(assertion.prev_id().await?)
            .await?;

        let edge_id = self
            .calculate_edge_id(
                ChallengeLevel::BLOCK,
                OriginId(info.parent_assertion_hash.0),
                start.height,
                start.merkle,
                end.height,
                end.merkle,
            )
            .await?;
        if let Some(existing) = self.get_edge(edge_id).await? {
            debug!(target: "assertion_chain::challenge", %edge_id, "Block level zero edge already exists");
            return Ok(existing);
        }

        let proof = (
            end.last_leaf_proof.clone(),
            parent_info.execution_state_data(),
            info.execution_state_data(),
        )
            .abi_encode_params();
        self.create_layer_zero_edge(CreateEdgeArgs {
            level: ChallengeLevel::BLOCK.0,
            endHistoryRoot: end.merkle,
            endHeight: U256::from(end.height),
            claimId: info.assertion_hash.0,
            prefixProof: prefix_proof,
            proof: proof.into(),
        })
        .await
    }

    /// Opens a subchallenge one level below `challenged`, which must have a length one rival.
    #[instrument(skip_all, fields(challenged = %challenged.id()), target = "assertion_chain::challenge")]
    pub async fn add_sub_challenge_level_zero_edge(
        &self,
        challenged: &SpecEdge<B>,
        start: &History,
        end: &History,
        start_parent_proof: Vec<B256>,
        end_parent_proof: Vec<B256>,
        prefix_proof: Bytes,
    ) -> ChainResult<SpecEdge<B>> {
        let level = challenged.level().next();
        if level.0 >= self.constants().total_levels() {
            return Err(ChainError::InvalidArgument(format!(
                "{} is already at the last challenge level",
                challenged.id()
            )));
        }
        let expected_height = self.level_zero_height(level);
        if end.height != expected_height {
            return Err(ChainError::InvalidArgument(format!(
                "end commitment height {} differs from the layer zero height {expected_height} of {level}",
                end.height
            )));
        }

        let edge_id = self
            .calculate_edge_id(
                level,
                OriginId(challenged.mutual_id().0),
                start.height,
                start.merkle,
                end.height,
                end.merkle,
            )
            .await?;
        if let Some(existing) = self.get_edge(edge_id).await? {
            debug!(target: "assertion_chain::challenge", %edge_id, "Subchallenge level zero edge already exists");
            return Ok(existing);
        }

        let proof = (
            start.first_leaf,
            end.last_leaf,
            start_parent_proof,
            end_parent_proof,
            end.last_leaf_proof.clone(),
        )
            .abi_encode_params();
        self.create_layer_zero_edge(CreateEdgeArgs {
            level: level.0,
            endHistoryRoot: end.merkle,
            endHeight: U256::from(end.height),
            claimId: challenged.id().0,
            prefixProof: prefix_proof,
            proof: proof.into(),
        })
        .await
    }

    /// Confirms a small step edge of length one by executing the disputed step.
    ///
    /// The proof is checked against the one step proof entry before anything is submitted.
    #[instrument(skip(self, one_step, pre_proof, post_proof), target = "assertion_chain::challenge")]
    pub async fn confirm_edge_by_one_step_proof(
        &self,
        edge_id: EdgeId,
        one_step: &OneStepData,
        pre_proof: Vec<B256>,
        post_proof: Vec<B256>,
    ) -> ChainResult<()> {
        let edge = self
            .get_edge(edge_id)
            .await?
            .ok_or_else(|| ChainError::NotFound(format!("edge {edge_id}")))?;
        if edge.status().await? == EdgeStatus::Confirmed {
            return Ok(());
        }

        let info = self
            .chain
            .read_assertion_creation_info(edge.assertion_hash().await?)
            .await?;
        let next_inbox_position = u64::try_from(info.inbox_max_count).map_err(|_| {
            ChainError::Internal(format!(
                "inbox max count {} is not a u64",
                info.inbox_max_count
            ))
        })?;

        let (machine_step, _) = edge.start_commitment();
        let computed = self
            .chain
            .call(
                self.constants().one_step_proof_entry,
                &IOneStepProofEntry::proveOneStepCall {
                    execCtx: ExecutionContext {
                        maxInboxMessagesRead: info.inbox_max_count,
                        bridge: self.chain.bridge_address(),
                        initialWasmModuleRoot: info.wasm_module_root,
                    },
                    machineStep: U256::from(machine_step),
                    beforeHash: one_step.before_hash,
                    proof: one_step.proof.clone(),
                },
            )
            .await?
            ._0;
        if computed != one_step.after_hash {
            return Err(ChainError::InvalidArgument(format!(
                "one step proof at machine step {machine_step} computes after hash {computed:#x}, expected {:#x}",
                one_step.after_hash
            )));
        }

        self.send(&IEdgeChallengeManager::confirmEdgeByOneStepProofCall {
            edgeId: edge_id.0,
            oneStepData: SolOneStepData {
                beforeHash: one_step.before_hash,
                proof: one_step.proof.clone(),
            },
            prevConfig: info.config_data(next_inbox_position),
            beforeHistoryInclusionProof: pre_proof,
            afterHistoryInclusionProof: post_proof,
        })
        .await?;
        info!(target: "assertion_chain::challenge", %edge_id, machine_step, "Confirmed edge by one step proof");
        Ok(())
    }

    /// Pushes inherited timers up `branch`, ordered from the deepest edge to the highest.
    ///
    /// Returns `Ok(false)` when the highest edge's cached timer already reaches
    /// `maximum_cached_time`.
    #[instrument(skip(self, branch), fields(edges = branch.len()), target = "assertion_chain::challenge")]
    pub async fn multi_update_inherited_timers(
        &self,
        branch: &[EdgeId],
        maximum_cached_time: u64,
    ) -> ChainResult<bool> {
        if branch.is_empty() {
            return Err(ChainError::InvalidArgument(
                "no edges to update timers for".into(),
            ));
        }
        let call = IEdgeChallengeManager::multiUpdateTimeCacheByChildrenCall {
            edgeIds: branch.iter().map(|id| id.0).collect(),
            maximumCachedTime: U256::from(maximum_cached_time),
        };
        match self.send(&call).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_cached_time_sufficient() => {
                debug!(target: "assertion_chain::challenge", "Cached timer already sufficient");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        primitives::{
            keccak256,
            AssertionHash,
        },
        test_utils::*,
    };

    fn commitment(side: Address, level: u8, height: u64, agree_until: u64) -> History {
        History {
            height,
            merkle: history_root(side, level, height, agree_until),
            ..Default::default()
        }
    }

    fn level_zero_height(level: u8) -> u64 {
        match level {
            0 => LAYER_ZERO_BLOCK_EDGE_HEIGHT,
            l if l <= NUM_BIG_STEP_LEVELS => LAYER_ZERO_BIG_STEP_EDGE_HEIGHT,
            _ => LAYER_ZERO_SMALL_STEP_EDGE_HEIGHT,
        }
    }

    /// Bisects both rivals down to their one step fork right after `agree_until`.
    async fn bisect_to_one_step_fork<B: ChainBackend>(
        mut honest: SpecEdge<B>,
        mut evil: SpecEdge<B>,
        agree_until: u64,
    ) -> (SpecEdge<B>, SpecEdge<B>) {
        let level = honest.level().0;
        loop {
            let (start, _) = honest.start_commitment();
            let (end, _) = honest.end_commitment();
            if end - start == 1 {
                return (honest, evil);
            }
            let middle = mandatory_bisection_height(start, end);
            let honest_root = history_root(HONEST_STAKER, level, middle, agree_until);
            let evil_root = history_root(EVIL_STAKER, level, middle, agree_until);
            let (honest_lower, honest_upper) = honest
                .bisect(honest_root, prefix_proof(honest_root))
                .await
                .unwrap();
            let (evil_lower, evil_upper) =
                evil.bisect(evil_root, prefix_proof(evil_root)).await.unwrap();
            if middle <= agree_until {
                assert_eq!(honest_lower.id(), evil_lower.id());
                (honest, evil) = (honest_upper, evil_upper);
            } else {
                assert_ne!(honest_lower.id(), evil_lower.id());
                (honest, evil) = (honest_lower, evil_lower);
            }
        }
    }

    /// Opens rival subchallenges on a one step fork and bisects them to the next fork.
    async fn descend(
        fork: &ForkSetup,
        honest_claim: &SpecEdge<MockBackend>,
        evil_claim: &SpecEdge<MockBackend>,
        agree_until: u64,
    ) -> (SpecEdge<MockBackend>, SpecEdge<MockBackend>) {
        let level = honest_claim.level().0 + 1;
        let height = level_zero_height(level);
        let start_root = history_root(HONEST_STAKER, level, 0, agree_until);
        let mut edges = Vec::new();
        for (side, chain, claim) in [
            (HONEST_STAKER, &fork.honest, honest_claim),
            (EVIL_STAKER, &fork.evil, evil_claim),
        ] {
            let edge = chain
                .spec_challenge_manager()
                .add_sub_challenge_level_zero_edge(
                    claim,
                    &commitment(side, level, 0, agree_until),
                    &commitment(side, level, height, agree_until),
                    vec![],
                    vec![],
                    prefix_proof(start_root),
                )
                .await
                .unwrap();
            assert_eq!(edge.level(), ChallengeLevel(level));
            assert_eq!(edge.claim_id().map(|id| id.0), Some(claim.id().0));
            assert!(edge.mini_staker().is_none());
            edges.push(edge);
        }
        let evil = edges.pop().unwrap();
        let honest = edges.pop().unwrap();
        assert_eq!(honest.mutual_id(), evil.mutual_id());
        assert_eq!(honest.origin_id().0, honest_claim.mutual_id().0);
        bisect_to_one_step_fork(honest, evil, agree_until).await
    }

    async fn block_level_zero_edges(
        fork: &ForkSetup,
        agree_until: u64,
    ) -> (SpecEdge<MockBackend>, SpecEdge<MockBackend>) {
        let start_root = history_root(HONEST_STAKER, 0, 0, agree_until);
        let honest = fork
            .honest
            .spec_challenge_manager()
            .add_block_challenge_level_zero_edge(
                &fork.honest_assertion,
                &commitment(HONEST_STAKER, 0, 0, agree_until),
                &commitment(HONEST_STAKER, 0, LAYER_ZERO_BLOCK_EDGE_HEIGHT, agree_until),
                prefix_proof(start_root),
            )
            .await
            .unwrap();
        let evil = fork
            .evil
            .spec_challenge_manager()
            .add_block_challenge_level_zero_edge(
                &fork.evil_assertion,
                &commitment(EVIL_STAKER, 0, 0, agree_until),
                &commitment(EVIL_STAKER, 0, LAYER_ZERO_BLOCK_EDGE_HEIGHT, agree_until),
                prefix_proof(start_root),
            )
            .await
            .unwrap();
        (honest, evil)
    }

    #[tokio::test]
    async fn test_constants_read_once() {
        let fork = setup_fork().await;
        let manager = fork.honest.spec_challenge_manager();
        assert_eq!(manager.address(), CHALLENGE_MANAGER_ADDRESS);
        assert_eq!(
            manager.layer_zero_heights(),
            LayerZeroHeights {
                block_challenge_height: LAYER_ZERO_BLOCK_EDGE_HEIGHT,
                big_step_challenge_height: LAYER_ZERO_BIG_STEP_EDGE_HEIGHT,
                small_step_challenge_height: LAYER_ZERO_SMALL_STEP_EDGE_HEIGHT,
            }
        );
        assert_eq!(manager.num_big_step_levels(), NUM_BIG_STEP_LEVELS);
        assert_eq!(manager.constants().total_levels(), NUM_BIG_STEP_LEVELS + 2);
        assert_eq!(manager.challenge_period_blocks(), CHALLENGE_PERIOD_BLOCKS);
        assert_eq!(manager.constants().one_step_proof_entry, OSP_ADDRESS);
        assert_eq!(
            manager.level_zero_height(ChallengeLevel(NUM_BIG_STEP_LEVELS + 1)),
            LAYER_ZERO_SMALL_STEP_EDGE_HEIGHT
        );
    }

    #[tokio::test]
    async fn test_get_unknown_edge() {
        let fork = setup_fork().await;
        let manager = fork.honest.spec_challenge_manager();
        assert!(manager
            .get_edge(EdgeId(random_bytes::<32>()))
            .await
            .unwrap()
            .is_none());
        let err = fork
            .honest
            .top_level_assertion(EdgeId(random_bytes::<32>()))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_block_level_zero_edge_is_idempotent() {
        let fork = setup_fork().await;
        let manager = fork.honest.spec_challenge_manager();
        let start = commitment(HONEST_STAKER, 0, 0, 0);
        let end = commitment(HONEST_STAKER, 0, LAYER_ZERO_BLOCK_EDGE_HEIGHT, 0);

        let edge = manager
            .add_block_challenge_level_zero_edge(
                &fork.honest_assertion,
                &start,
                &end,
                prefix_proof(start.merkle),
            )
            .await
            .unwrap();
        let expected = manager
            .calculate_edge_id(
                ChallengeLevel::BLOCK,
                OriginId(fork.mock.genesis_hash()),
                0,
                start.merkle,
                end.height,
                end.merkle,
            )
            .await
            .unwrap();
        assert_eq!(edge.id(), expected);
        assert_eq!(
            fork.honest.top_level_assertion(edge.id()).await.unwrap(),
            AssertionHash(fork.mock.genesis_hash())
        );

        let sent = fork.mock.sent_transactions().len();
        let again = manager
            .add_block_challenge_level_zero_edge(
                &fork.honest_assertion,
                &start,
                &end,
                prefix_proof(start.merkle),
            )
            .await
            .unwrap();
        assert_eq!(again.id(), edge.id());
        assert_eq!(fork.mock.sent_transactions().len(), sent);
    }

    #[tokio::test]
    async fn test_block_level_zero_edge_height_checked() {
        let fork = setup_fork().await;
        let sent = fork.mock.sent_transactions().len();
        let err = fork
            .honest
            .spec_challenge_manager()
            .add_block_challenge_level_zero_edge(
                &fork.honest_assertion,
                &commitment(HONEST_STAKER, 0, 0, 0),
                &commitment(HONEST_STAKER, 0, LAYER_ZERO_BLOCK_EDGE_HEIGHT - 1, 0),
                prefix_proof(history_root(HONEST_STAKER, 0, 0, 0)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidArgument(_)));
        assert_eq!(fork.mock.sent_transactions().len(), sent);
    }

    #[tokio::test]
    async fn test_sub_challenge_requires_layer_zero_height() {
        let fork = setup_fork().await;
        let (honest, evil) = block_level_zero_edges(&fork, 6).await;
        let (honest_fork, _) = bisect_to_one_step_fork(honest, evil, 6).await;
        let err = fork
            .honest
            .spec_challenge_manager()
            .add_sub_challenge_level_zero_edge(
                &honest_fork,
                &commitment(HONEST_STAKER, 1, 0, 2),
                &commitment(HONEST_STAKER, 1, LAYER_ZERO_BIG_STEP_EDGE_HEIGHT + 1, 2),
                vec![],
                vec![],
                prefix_proof(history_root(HONEST_STAKER, 1, 0, 2)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_challenge_down_to_one_step_proof() {
        let fork = setup_fork().await;
        let (honest, evil) = block_level_zero_edges(&fork, 6).await;
        assert!(honest.has_rival().await.unwrap());
        assert!(!honest.has_length_one_rival().await.unwrap());

        let (honest_block, evil_block) = bisect_to_one_step_fork(honest, evil, 6).await;
        assert_eq!(honest_block.start_commitment().0, 6);
        assert!(honest_block.has_length_one_rival().await.unwrap());
        assert!(evil_block.has_length_one_rival().await.unwrap());

        let (honest_big, evil_big) = descend(&fork, &honest_block, &evil_block, 2).await;
        assert_eq!(honest_big.start_commitment().0, 2);
        assert!(honest_big.has_length_one_rival().await.unwrap());

        let (honest_small, evil_small) = descend(&fork, &honest_big, &evil_big, 2).await;
        assert_eq!(honest_small.level(), ChallengeLevel(NUM_BIG_STEP_LEVELS + 1));
        assert_eq!(honest_small.reversed_level(), ChallengeLevel(0));
        assert_eq!(
            honest_small
                .top_level_claim_heights()
                .await
                .unwrap()
                .challenge_origin_heights,
            vec![6, 2]
        );
        assert_eq!(
            fork.honest
                .top_level_claim_heights(honest_small.id())
                .await
                .unwrap()
                .challenge_origin_heights,
            vec![6, 2]
        );
        assert_eq!(
            honest_small.assertion_hash().await.unwrap(),
            AssertionHash(fork.mock.genesis_hash())
        );

        let manager = fork.honest.spec_challenge_manager();
        let before_hash = random_bytes::<32>();
        let proof = crate::primitives::Bytes::from(vec![0xab; 16]);
        let mut preimage = before_hash.to_vec();
        preimage.extend_from_slice(&proof);

        // Proofs that do not reach the claimed after hash are never submitted.
        let sent = fork.mock.sent_transactions().len();
        let wrong = OneStepData {
            before_hash,
            after_hash: random_bytes::<32>(),
            proof: proof.clone(),
        };
        let err = manager
            .confirm_edge_by_one_step_proof(evil_small.id(), &wrong, vec![], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidArgument(_)));
        assert_eq!(fork.mock.sent_transactions().len(), sent);

        let one_step = OneStepData {
            before_hash,
            after_hash: keccak256(&preimage),
            proof,
        };
        manager
            .confirm_edge_by_one_step_proof(honest_small.id(), &one_step, vec![], vec![])
            .await
            .unwrap();
        assert_eq!(honest_small.status().await.unwrap(), EdgeStatus::Confirmed);
        assert!(evil_small.has_confirmed_rival().await.unwrap());
        assert_eq!(evil_small.status().await.unwrap(), EdgeStatus::Pending);

        // Already confirmed.
        let sent = fork.mock.sent_transactions().len();
        manager
            .confirm_edge_by_one_step_proof(honest_small.id(), &one_step, vec![], vec![])
            .await
            .unwrap();
        assert_eq!(fork.mock.sent_transactions().len(), sent);
    }

    #[tokio::test]
    async fn test_multi_update_inherited_timers() {
        let fork = setup_fork().await;
        let manager = fork.honest.spec_challenge_manager();
        let edge = manager
            .add_block_challenge_level_zero_edge(
                &fork.honest_assertion,
                &commitment(HONEST_STAKER, 0, 0, 0),
                &commitment(HONEST_STAKER, 0, LAYER_ZERO_BLOCK_EDGE_HEIGHT, 0),
                prefix_proof(history_root(HONEST_STAKER, 0, 0, 0)),
            )
            .await
            .unwrap();
        assert_eq!(edge.latest_inherited_timer().await.unwrap(), 0);

        fork.mock.advance_blocks(5);
        assert!(manager
            .multi_update_inherited_timers(&[edge.id()], 3)
            .await
            .unwrap());
        assert_eq!(edge.latest_inherited_timer().await.unwrap(), 3);

        // The cache already reaches the maximum.
        assert!(!manager
            .multi_update_inherited_timers(&[edge.id()], 3)
            .await
            .unwrap());
        assert!(matches!(
            manager.multi_update_inherited_timers(&[], 3).await,
            Err(ChainError::InvalidArgument(_))
        ));
    }
}
