//! Edge challenge manager half of the in-memory ledger.

use super::{
    ledger::{
        compute_assertion_hash,
        config_hash,
        revert,
        Env,
        ExecResult,
        Ledger,
    },
    CHALLENGE_MANAGER_ADDRESS,
    OSP_ADDRESS,
};
use crate::bindings::{
    ChallengeEdge,
    CreateEdgeArgs,
    ExecutionStateData,
    IEdgeChallengeManager::{
        self,
        IEdgeChallengeManagerCalls,
    },
};
use crate::primitives::{
    keccak256,
    Address,
    B256,
    U256,
};

use alloy_sol_types::{
    SolCall,
    SolEvent,
    SolInterface,
    SolValue,
};

/// Marker stored for a mutual id with a single edge.
pub fn no_rival() -> B256 {
    keccak256("NO_RIVAL")
}

pub fn edge_id(
    level: u8,
    origin: B256,
    start_height: U256,
    start_root: B256,
    end_height: U256,
    end_root: B256,
) -> B256 {
    keccak256(<(
        alloy_sol_types::sol_data::Uint<8>,
        alloy_sol_types::sol_data::FixedBytes<32>,
        alloy_sol_types::sol_data::Uint<256>,
        alloy_sol_types::sol_data::FixedBytes<32>,
        alloy_sol_types::sol_data::Uint<256>,
        alloy_sol_types::sol_data::FixedBytes<32>,
    ) as alloy_sol_types::SolType>::abi_encode(&(
        level, origin, start_height, start_root, end_height, end_root,
    )))
}

pub fn mutual_id(
    level: u8,
    origin: B256,
    start_height: U256,
    start_root: B256,
    end_height: U256,
) -> B256 {
    keccak256(<(
        alloy_sol_types::sol_data::Uint<8>,
        alloy_sol_types::sol_data::FixedBytes<32>,
        alloy_sol_types::sol_data::Uint<256>,
        alloy_sol_types::sol_data::FixedBytes<32>,
        alloy_sol_types::sol_data::Uint<256>,
    ) as alloy_sol_types::SolType>::abi_encode(&(
        level, origin, start_height, start_root, end_height,
    )))
}

fn edge_mutual_id(edge: &ChallengeEdge) -> B256 {
    mutual_id(
        edge.level,
        edge.originId,
        edge.startHeight,
        edge.startHistoryRoot,
        edge.endHeight,
    )
}

/// Height both children of a bisected edge share.
pub fn mandatory_bisection_height(start: u64, end: u64) -> u64 {
    if end - start == 2 {
        return start + 1;
    }
    let diff = (end - 1) ^ start;
    let msb = 63 - diff.leading_zeros();
    (end - 1) & (u64::MAX << msb)
}

impl Ledger {
    pub(crate) fn total_levels(&self) -> u8 {
        self.num_big_step_levels + 2
    }

    fn layer_zero_height(&self, level: u8) -> u64 {
        if level == 0 {
            self.layer_zero_heights[0]
        } else if level <= self.num_big_step_levels {
            self.layer_zero_heights[1]
        } else {
            self.layer_zero_heights[2]
        }
    }

    fn edge(&self, id: &B256) -> Result<&ChallengeEdge, String> {
        self.edges
            .get(id)
            .ok_or_else(|| format!("Edge does not exist: {id:#x}"))
    }

    fn has_rival(&self, edge: &ChallengeEdge) -> bool {
        self.first_rivals
            .get(&edge_mutual_id(edge))
            .is_some_and(|rival| *rival != no_rival())
    }

    pub(crate) fn time_unrivaled(&self, id: B256, block_number: u64) -> Result<u64, String> {
        let edge = self.edge(&id)?;
        match self.first_rivals.get(&edge_mutual_id(edge)) {
            Some(rival) if *rival == no_rival() => {
                Ok(block_number.saturating_sub(edge.createdAtBlock))
            }
            Some(rival) if *rival == id => Ok(0),
            Some(rival) => {
                let rival = self.edge(rival)?;
                Ok(rival.createdAtBlock.saturating_sub(edge.createdAtBlock))
            }
            None => Ok(0),
        }
    }

    /// Inserts the edge if it is new, returning its id and whether it has a rival.
    fn add_edge(&mut self, env: Env, edge: ChallengeEdge, layer_zero: bool) -> (B256, bool) {
        let id = edge_id(
            edge.level,
            edge.originId,
            edge.startHeight,
            edge.startHistoryRoot,
            edge.endHeight,
            edge.endHistoryRoot,
        );
        let mutual = edge_mutual_id(&edge);
        if let Some(existing) = self.edges.get(&id) {
            return (id, self.has_rival(existing));
        }
        let has_rival = match self.first_rivals.get(&mutual) {
            None => {
                self.first_rivals.insert(mutual, no_rival());
                false
            }
            Some(rival) if *rival == no_rival() => {
                self.first_rivals.insert(mutual, id);
                true
            }
            Some(_) => true,
        };
        let length = edge.endHeight - edge.startHeight;
        let event = IEdgeChallengeManager::EdgeAdded {
            edgeId: id,
            mutualId: mutual,
            originId: edge.originId,
            claimId: edge.claimId,
            length,
            level: edge.level,
            hasRival: has_rival,
            isLayerZero: layer_zero,
        };
        self.edges.insert(
            id,
            ChallengeEdge {
                createdAtBlock: env.block_number,
                ..edge
            },
        );
        self.emit(CHALLENGE_MANAGER_ADDRESS, event.encode_log_data());
        (id, has_rival)
    }

    fn create_layer_zero_edge(&mut self, env: Env, args: CreateEdgeArgs) -> ExecResult {
        let level = args.level;
        if level >= self.total_levels() {
            return revert("Invalid level");
        }
        if args.endHeight != U256::from(self.layer_zero_height(level)) {
            return revert("Invalid edge size");
        }
        let origin = if level == 0 {
            let Some(claim) = self.assertions.get(&args.claimId) else {
                return revert("Claim assertion not found");
            };
            if claim.node.status != 1 {
                return revert("Claim assertion is not pending");
            }
            let parent_hash = claim.parent;
            let in_fork = self
                .assertions
                .get(&parent_hash)
                .is_some_and(|parent| parent.node.secondChildBlock > 0);
            if !in_fork {
                return revert("Assertion is not in a fork");
            }
            let (_, predecessor, claimed) =
                <(Vec<B256>, ExecutionStateData, ExecutionStateData)>::abi_decode_params(
                    &args.proof,
                    true,
                )
                .map_err(|err| format!("Invalid block edge proof: {err}"))?;
            let claim_hash = compute_assertion_hash(
                claimed.prevAssertionHash,
                &claimed.executionState,
                claimed.inboxAcc,
            );
            if claim_hash != args.claimId {
                return revert("Invalid claim state");
            }
            let predecessor_hash = compute_assertion_hash(
                predecessor.prevAssertionHash,
                &predecessor.executionState,
                predecessor.inboxAcc,
            );
            if predecessor_hash != parent_hash {
                return revert("Invalid predecessor state");
            }
            parent_hash
        } else {
            let claim = self.edge(&args.claimId)?.clone();
            if claim.level + 1 != level {
                return revert("Claim is not at the previous level");
            }
            if claim.endHeight - claim.startHeight != U256::from(1) || !self.has_rival(&claim) {
                return revert("Claim does not have length 1 rival");
            }
            <(B256, B256, Vec<B256>, Vec<B256>, Vec<B256>)>::abi_decode_params(&args.proof, true)
                .map_err(|err| format!("Invalid subchallenge proof: {err}"))?;
            edge_mutual_id(&claim)
        };
        if args.prefixProof.len() < 32 {
            return revert("Invalid prefix proof");
        }
        let start_root = B256::from_slice(&args.prefixProof[..32]);

        let edge = ChallengeEdge {
            originId: origin,
            startHistoryRoot: start_root,
            startHeight: U256::ZERO,
            endHistoryRoot: args.endHistoryRoot,
            endHeight: args.endHeight,
            claimId: args.claimId,
            staker: if level == 0 { env.from } else { Address::ZERO },
            level,
            ..Default::default()
        };
        let id = edge_id(
            level,
            origin,
            U256::ZERO,
            start_root,
            args.endHeight,
            args.endHistoryRoot,
        );
        if self.edges.contains_key(&id) {
            return revert("Edge already exists");
        }
        let (id, _) = self.add_edge(env, edge, true);
        Ok(IEdgeChallengeManager::createLayerZeroEdgeCall::abi_encode_returns(&(id,)))
    }

    fn bisect_edge(&mut self, env: Env, id: B256, bisection_root: B256) -> ExecResult {
        let edge = self.edge(&id)?.clone();
        if edge.status != 0 {
            return revert("Edge not pending");
        }
        if !self.has_rival(&edge) {
            return revert("Cannot bisect an unrivaled edge");
        }
        if edge.lowerChildId != B256::ZERO {
            return revert("Edge already has children");
        }
        let start = edge.startHeight.saturating_to::<u64>();
        let end = edge.endHeight.saturating_to::<u64>();
        if end - start < 2 {
            return revert("Edge length too small");
        }
        let middle = U256::from(mandatory_bisection_height(start, end));
        let lower_id = edge_id(
            edge.level,
            edge.originId,
            edge.startHeight,
            edge.startHistoryRoot,
            middle,
            bisection_root,
        );
        let lower_exists = self.edges.contains_key(&lower_id);
        let (lower_id, _) = self.add_edge(
            env,
            ChallengeEdge {
                originId: edge.originId,
                startHistoryRoot: edge.startHistoryRoot,
                startHeight: edge.startHeight,
                endHistoryRoot: bisection_root,
                endHeight: middle,
                level: edge.level,
                ..Default::default()
            },
            false,
        );
        let (upper_id, _) = self.add_edge(
            env,
            ChallengeEdge {
                originId: edge.originId,
                startHistoryRoot: bisection_root,
                startHeight: middle,
                endHistoryRoot: edge.endHistoryRoot,
                endHeight: edge.endHeight,
                level: edge.level,
                ..Default::default()
            },
            false,
        );
        if let Some(parent) = self.edges.get_mut(&id) {
            parent.lowerChildId = lower_id;
            parent.upperChildId = upper_id;
        }
        self.emit(
            CHALLENGE_MANAGER_ADDRESS,
            IEdgeChallengeManager::EdgeBisected {
                edgeId: id,
                lowerChildId: lower_id,
                upperChildId: upper_id,
                lowerChildAlreadyExists: lower_exists,
            }
            .encode_log_data(),
        );
        Ok(IEdgeChallengeManager::bisectEdgeCall::abi_encode_returns(&(
            lower_id, upper_id,
        )))
    }

    fn mark_edge_confirmed(&mut self, env: Env, id: B256) -> Result<B256, String> {
        let mutual = edge_mutual_id(self.edge(&id)?);
        if self
            .confirmed_rivals
            .get(&mutual)
            .is_some_and(|rival| *rival != B256::ZERO)
        {
            return revert("Rival edge confirmed");
        }
        if let Some(edge) = self.edges.get_mut(&id) {
            edge.status = 1;
            edge.confirmedAtBlock = env.block_number;
        }
        self.confirmed_rivals.insert(mutual, id);
        Ok(mutual)
    }

    fn confirm_edge_by_time(
        &mut self,
        env: Env,
        id: B256,
        claim_state: ExecutionStateData,
    ) -> ExecResult {
        let edge = self.edge(&id)?.clone();
        if edge.status != 0 {
            return revert("Edge not pending");
        }
        if edge.level == 0 && edge.claimId != B256::ZERO {
            let claim_hash = compute_assertion_hash(
                claim_state.prevAssertionHash,
                &claim_state.executionState,
                claim_state.inboxAcc,
            );
            if claim_hash != edge.claimId {
                return revert("Invalid claim state data");
            }
        }
        let total = self
            .time_unrivaled(id, env.block_number)?
            .max(edge.totalTimeUnrivaledCache);
        if total < self.challenge_period_blocks {
            return revert("Insufficient unrivaled time");
        }
        let mutual = self.mark_edge_confirmed(env, id)?;
        self.emit(
            CHALLENGE_MANAGER_ADDRESS,
            IEdgeChallengeManager::EdgeConfirmedByTime {
                edgeId: id,
                mutualId: mutual,
                totalTimeUnrivaled: U256::from(total),
            }
            .encode_log_data(),
        );
        Ok(Vec::new())
    }

    /// Assertion hash the challenge containing `id` was opened against.
    pub(crate) fn prev_assertion_hash(&self, id: B256) -> Result<B256, String> {
        let mut edge = self.edge(&id)?;
        while edge.level > 0 {
            let rival = self.first_rivals.get(&edge.originId).copied().unwrap_or_default();
            if rival == B256::ZERO || rival == no_rival() {
                return revert("Origin edge not found");
            }
            edge = self.edge(&rival)?;
        }
        Ok(edge.originId)
    }

    fn confirm_edge_by_one_step_proof(
        &mut self,
        env: Env,
        call: IEdgeChallengeManager::confirmEdgeByOneStepProofCall,
    ) -> ExecResult {
        let edge = self.edge(&call.edgeId)?.clone();
        if edge.status != 0 {
            return revert("Edge not pending");
        }
        if edge.level + 1 != self.total_levels() {
            return revert("Edge is not a small step");
        }
        if edge.endHeight - edge.startHeight != U256::from(1) {
            return revert("Edge does not have single step");
        }
        let prev = self.prev_assertion_hash(call.edgeId)?;
        let expected_config = self
            .assertions
            .get(&prev)
            .map(|assertion| assertion.node.configHash)
            .unwrap_or_default();
        if config_hash(&call.prevConfig) != expected_config {
            return revert("CONFIG_HASH_MISMATCH");
        }
        if call.oneStepData.proof.is_empty() {
            return revert("Invalid one step proof");
        }
        let mutual = self.mark_edge_confirmed(env, call.edgeId)?;
        self.emit(
            CHALLENGE_MANAGER_ADDRESS,
            IEdgeChallengeManager::EdgeConfirmedByOneStepProof {
                edgeId: call.edgeId,
                mutualId: mutual,
            }
            .encode_log_data(),
        );
        Ok(Vec::new())
    }

    /// Highest timer cache among the edges claiming `id` one level down.
    fn claimant_cache(&self, id: B256) -> u64 {
        self.edges
            .values()
            .filter(|edge| edge.claimId == id && edge.level > 0)
            .map(|edge| edge.totalTimeUnrivaledCache)
            .max()
            .unwrap_or_default()
    }

    /// Updates timer caches bottom up. `ids` runs from the deepest edge to the highest one.
    fn multi_update_time_cache(&mut self, env: Env, ids: Vec<B256>, maximum: u64) -> ExecResult {
        let Some(last) = ids.last() else {
            return revert("Empty edge list");
        };
        if self.edge(last)?.totalTimeUnrivaledCache >= maximum {
            return revert("CachedTimeSufficient");
        }
        for id in ids {
            let edge = self.edge(&id)?.clone();
            let inherited = if edge.lowerChildId != B256::ZERO {
                let lower = self.edge(&edge.lowerChildId)?.totalTimeUnrivaledCache;
                let upper = self.edge(&edge.upperChildId)?.totalTimeUnrivaledCache;
                lower.min(upper)
            } else {
                self.claimant_cache(id)
            };
            let own = self.time_unrivaled(id, env.block_number)?;
            let updated = own.saturating_add(inherited).min(maximum);
            if updated <= edge.totalTimeUnrivaledCache {
                continue;
            }
            if let Some(edge) = self.edges.get_mut(&id) {
                edge.totalTimeUnrivaledCache = updated;
            }
            self.emit(
                CHALLENGE_MANAGER_ADDRESS,
                IEdgeChallengeManager::TimerCacheUpdated {
                    edgeId: id,
                    newValue: U256::from(updated),
                }
                .encode_log_data(),
            );
        }
        Ok(Vec::new())
    }

    pub(crate) fn challenge_manager(&mut self, env: Env, input: &[u8]) -> ExecResult {
        use IEdgeChallengeManager::*;
        let call = IEdgeChallengeManagerCalls::abi_decode(input, true)
            .map_err(|err| format!("invalid calldata: {err}"))?;
        match call {
            IEdgeChallengeManagerCalls::LAYERZERO_BLOCKEDGE_HEIGHT(_) => {
                Ok(LAYERZERO_BLOCKEDGE_HEIGHTCall::abi_encode_returns(&(U256::from(
                    self.layer_zero_heights[0],
                ),)))
            }
            IEdgeChallengeManagerCalls::LAYERZERO_BIGSTEPEDGE_HEIGHT(_) => {
                Ok(LAYERZERO_BIGSTEPEDGE_HEIGHTCall::abi_encode_returns(&(U256::from(
                    self.layer_zero_heights[1],
                ),)))
            }
            IEdgeChallengeManagerCalls::LAYERZERO_SMALLSTEPEDGE_HEIGHT(_) => {
                Ok(LAYERZERO_SMALLSTEPEDGE_HEIGHTCall::abi_encode_returns(&(U256::from(
                    self.layer_zero_heights[2],
                ),)))
            }
            IEdgeChallengeManagerCalls::NUM_BIGSTEP_LEVEL(_) => {
                Ok(NUM_BIGSTEP_LEVELCall::abi_encode_returns(&(self.num_big_step_levels,)))
            }
            IEdgeChallengeManagerCalls::challengePeriodBlocks(_) => {
                Ok(challengePeriodBlocksCall::abi_encode_returns(&(self.challenge_period_blocks,)))
            }
            IEdgeChallengeManagerCalls::oneStepProofEntry(_) => {
                Ok(oneStepProofEntryCall::abi_encode_returns(&(OSP_ADDRESS,)))
            }
            IEdgeChallengeManagerCalls::getEdge(call) => {
                let edge = self.edge(&call.edgeId)?.clone();
                Ok(getEdgeCall::abi_encode_returns(&(edge,)))
            }
            IEdgeChallengeManagerCalls::calculateEdgeId(call) => {
                Ok(calculateEdgeIdCall::abi_encode_returns(&(edge_id(
                    call.level,
                    call.originId,
                    call.startHeight,
                    call.startHistoryRoot,
                    call.endHeight,
                    call.endHistoryRoot,
                ),)))
            }
            IEdgeChallengeManagerCalls::calculateMutualId(call) => {
                Ok(calculateMutualIdCall::abi_encode_returns(&(mutual_id(
                    call.level,
                    call.originId,
                    call.startHeight,
                    call.startHistoryRoot,
                    call.endHeight,
                ),)))
            }
            IEdgeChallengeManagerCalls::confirmedRival(call) => {
                let rival = self.confirmed_rivals.get(&call.mutualId).copied().unwrap_or_default();
                Ok(confirmedRivalCall::abi_encode_returns(&(rival,)))
            }
            IEdgeChallengeManagerCalls::firstRival(call) => {
                let rival = self.first_rivals.get(&call.mutualId).copied().unwrap_or_default();
                Ok(firstRivalCall::abi_encode_returns(&(rival,)))
            }
            IEdgeChallengeManagerCalls::hasRival(call) => {
                let edge = self.edge(&call.edgeId)?;
                Ok(hasRivalCall::abi_encode_returns(&(self.has_rival(edge),)))
            }
            IEdgeChallengeManagerCalls::hasLengthOneRival(call) => {
                let edge = self.edge(&call.edgeId)?;
                if edge.endHeight - edge.startHeight != U256::from(1) {
                    return revert("Edge is not length 1");
                }
                if !self.has_rival(edge) {
                    return revert("Edge is unrivaled");
                }
                Ok(hasLengthOneRivalCall::abi_encode_returns(&(true,)))
            }
            IEdgeChallengeManagerCalls::timeUnrivaled(call) => {
                let time = self.time_unrivaled(call.edgeId, env.block_number)?;
                Ok(timeUnrivaledCall::abi_encode_returns(&(U256::from(time),)))
            }
            IEdgeChallengeManagerCalls::getPrevAssertionHash(call) => {
                Ok(getPrevAssertionHashCall::abi_encode_returns(&(self
                    .prev_assertion_hash(call.edgeId)?,)))
            }
            IEdgeChallengeManagerCalls::createLayerZeroEdge(call) => {
                self.create_layer_zero_edge(env, call.args)
            }
            IEdgeChallengeManagerCalls::bisectEdge(call) => {
                self.bisect_edge(env, call.edgeId, call.bisectionHistoryRoot)
            }
            IEdgeChallengeManagerCalls::confirmEdgeByTime(call) => {
                self.confirm_edge_by_time(env, call.edgeId, call.claimStateData)
            }
            IEdgeChallengeManagerCalls::confirmEdgeByOneStepProof(call) => {
                self.confirm_edge_by_one_step_proof(env, call)
            }
            IEdgeChallengeManagerCalls::multiUpdateTimeCacheByChildren(call) => {
                self.multi_update_time_cache(
                    env,
                    call.edgeIds,
                    call.maximumCachedTime.saturating_to::<u64>(),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mandatory_bisection_height() {
        assert_eq!(mandatory_bisection_height(0, 32), 16);
        assert_eq!(mandatory_bisection_height(0, 16), 8);
        assert_eq!(mandatory_bisection_height(8, 16), 12);
        assert_eq!(mandatory_bisection_height(4, 6), 5);
        assert_eq!(mandatory_bisection_height(5, 11), 8);
    }
}
