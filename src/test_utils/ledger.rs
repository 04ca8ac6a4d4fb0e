//! In-memory model of the rollup contracts, executing calldata against plain maps.

use super::*;
use crate::bindings::{
    AssertionInputs,
    AssertionNode,
    AssertionState,
    ChallengeEdge,
    ConfigData,
    IBridge::IBridgeCalls,
    IOneStepProofEntry::IOneStepProofEntryCalls,
    IRollupCore::{
        self,
        IRollupCoreCalls,
    },
    ISafe::{
        self,
        ISafeCalls,
    },
    IStakeToken::{
        self,
        IStakeTokenCalls,
    },
};
use crate::primitives::{
    keccak256,
    Address,
    Bytes,
    B256,
    U256,
};

use alloy_primitives::LogData;
use alloy_sol_types::{
    SolCall,
    SolEvent,
    SolInterface,
    SolValue,
};

use std::collections::{
    HashMap,
    HashSet,
};

pub(crate) type ExecResult = Result<Vec<u8>, String>;

/// Caller context of one execution.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Env {
    /// `block.number` as seen by the contracts, the L1 block when the parent chain is Arbitrum.
    pub block_number: u64,
    pub parent_block_number: u64,
    pub from: Address,
    pub value: U256,
}

/// Rollup parameters applied to newly created assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupParams {
    pub wasm_module_root: B256,
    pub confirm_period_blocks: u64,
    pub base_stake: U256,
    pub challenge_manager: Address,
    pub challenge_grace_period_blocks: u64,
    pub minimum_assertion_period: u64,
}

impl Default for RollupParams {
    fn default() -> Self {
        Self {
            wasm_module_root: B256::repeat_byte(0x77),
            confirm_period_blocks: CONFIRM_PERIOD_BLOCKS,
            base_stake: U256::from(100),
            challenge_manager: CHALLENGE_MANAGER_ADDRESS,
            challenge_grace_period_blocks: CHALLENGE_GRACE_PERIOD_BLOCKS,
            minimum_assertion_period: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockAssertion {
    pub node: AssertionNode,
    pub parent: B256,
    pub after_state: AssertionState,
    pub creation_parent_block: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct Ledger {
    // rollup
    pub params: RollupParams,
    pub assertions: HashMap<B256, MockAssertion>,
    pub latest_confirmed: B256,
    pub genesis: B256,
    pub stakers: HashMap<Address, U256>,
    pub withdrawal_addresses: HashMap<Address, Address>,
    pub deployment_block: u64,
    pub fast_confirmer: Address,
    // bridge
    pub inbox_accs: Vec<B256>,
    // stake token
    pub token_has_code: bool,
    pub balances: HashMap<Address, U256>,
    pub allowances: HashMap<(Address, Address), U256>,
    // challenge manager
    pub edges: HashMap<B256, ChallengeEdge>,
    pub first_rivals: HashMap<B256, B256>,
    pub confirmed_rivals: HashMap<B256, B256>,
    pub layer_zero_heights: [u64; 3],
    pub num_big_step_levels: u8,
    pub challenge_period_blocks: u64,
    // safe
    pub safe_owners: Vec<Address>,
    pub safe_threshold: u64,
    pub safe_nonce: U256,
    pub approved_hashes: HashSet<(Address, B256)>,
    /// Logs emitted by the running execution.
    pub logs: Vec<(Address, LogData)>,
}

pub(crate) fn revert<T>(reason: &str) -> Result<T, String> {
    Err(reason.to_string())
}

fn bad_calldata(err: alloy_sol_types::Error) -> String {
    format!("invalid calldata: {err}")
}

pub fn compute_assertion_hash(prev: B256, state: &AssertionState, inbox_acc: B256) -> B256 {
    let state_hash = keccak256(state.abi_encode());
    keccak256((prev, state_hash, inbox_acc).abi_encode())
}

pub fn config_hash(config: &ConfigData) -> B256 {
    keccak256(config.abi_encode())
}

pub fn genesis_state() -> AssertionState {
    AssertionState {
        machineStatus: 1,
        ..Default::default()
    }
}

impl Ledger {
    pub fn new(deployment_block: u64) -> Self {
        let genesis_state = genesis_state();
        let genesis = compute_assertion_hash(B256::ZERO, &genesis_state, B256::ZERO);
        let params = RollupParams::default();

        let mut inbox_accs = Vec::new();
        for i in 0..INITIAL_INBOX_BATCHES {
            inbox_accs.push(keccak256((i as u64).to_be_bytes()));
        }

        let mut ledger = Self {
            params,
            assertions: HashMap::new(),
            latest_confirmed: genesis,
            genesis,
            stakers: HashMap::new(),
            withdrawal_addresses: HashMap::new(),
            deployment_block,
            fast_confirmer: Address::ZERO,
            inbox_accs,
            token_has_code: true,
            balances: HashMap::new(),
            allowances: HashMap::new(),
            edges: HashMap::new(),
            first_rivals: HashMap::new(),
            confirmed_rivals: HashMap::new(),
            layer_zero_heights: [
                LAYER_ZERO_BLOCK_EDGE_HEIGHT,
                LAYER_ZERO_BIG_STEP_EDGE_HEIGHT,
                LAYER_ZERO_SMALL_STEP_EDGE_HEIGHT,
            ],
            num_big_step_levels: NUM_BIG_STEP_LEVELS,
            challenge_period_blocks: CHALLENGE_PERIOD_BLOCKS,
            safe_owners: Vec::new(),
            safe_threshold: 1,
            safe_nonce: U256::ZERO,
            approved_hashes: HashSet::new(),
            logs: Vec::new(),
        };

        let config = ledger.current_config(1);
        ledger.assertions.insert(
            genesis,
            MockAssertion {
                node: AssertionNode {
                    createdAtBlock: deployment_block,
                    status: 2,
                    configHash: config_hash(&config),
                    ..Default::default()
                },
                parent: B256::ZERO,
                after_state: genesis_state.clone(),
                creation_parent_block: deployment_block,
            },
        );
        ledger.emit(
            ROLLUP_ADDRESS,
            IRollupCore::AssertionCreated {
                assertionHash: genesis,
                parentAssertionHash: B256::ZERO,
                assertion: AssertionInputs {
                    afterState: genesis_state,
                    ..Default::default()
                },
                afterInboxBatchAcc: B256::ZERO,
                inboxMaxCount: U256::from(1),
                wasmModuleRoot: config.wasmModuleRoot,
                requiredStake: config.requiredStake,
                challengeManager: config.challengeManager,
                confirmPeriodBlocks: config.confirmPeriodBlocks,
            }
            .encode_log_data(),
        );
        ledger
    }

    pub fn emit(&mut self, address: Address, data: LogData) {
        self.logs.push((address, data));
    }

    fn current_config(&self, next_inbox_position: u64) -> ConfigData {
        ConfigData {
            wasmModuleRoot: self.params.wasm_module_root,
            requiredStake: self.params.base_stake,
            challengeManager: self.params.challenge_manager,
            confirmPeriodBlocks: self.params.confirm_period_blocks,
            nextInboxPosition: next_inbox_position,
        }
    }

    pub fn has_code(&self, address: Address) -> bool {
        if address == STAKE_TOKEN_ADDRESS {
            return self.token_has_code;
        }
        [
            ROLLUP_ADDRESS,
            BRIDGE_ADDRESS,
            CHALLENGE_MANAGER_ADDRESS,
            OSP_ADDRESS,
            SAFE_ADDRESS,
        ]
        .contains(&address)
    }

    pub fn execute(&mut self, env: Env, to: Address, input: &[u8]) -> ExecResult {
        if to == ROLLUP_ADDRESS {
            self.rollup(env, input)
        } else if to == BRIDGE_ADDRESS {
            self.bridge(input)
        } else if to == STAKE_TOKEN_ADDRESS && self.token_has_code {
            self.token(env, input)
        } else if to == CHALLENGE_MANAGER_ADDRESS {
            self.challenge_manager(env, input)
        } else if to == OSP_ADDRESS {
            self.one_step_proof(input)
        } else if to == SAFE_ADDRESS {
            self.safe(env, input)
        } else {
            revert("call to non-contract")
        }
    }

    fn rollup(&mut self, env: Env, input: &[u8]) -> ExecResult {
        use IRollupCore::*;
        match IRollupCoreCalls::abi_decode(input, true).map_err(bad_calldata)? {
            IRollupCoreCalls::getAssertion(call) => {
                let node = self
                    .assertions
                    .get(&call.assertionHash)
                    .map(|a| a.node.clone())
                    .unwrap_or_default();
                Ok(getAssertionCall::abi_encode_returns(&(node,)))
            }
            IRollupCoreCalls::getAssertionCreationBlockForLogLookup(call) => {
                let Some(assertion) = self.assertions.get(&call.assertionHash) else {
                    return revert("ASSERTION_NOT_EXIST");
                };
                Ok(getAssertionCreationBlockForLogLookupCall::abi_encode_returns(&(
                    U256::from(assertion.creation_parent_block),
                )))
            }
            IRollupCoreCalls::latestConfirmed(_) => {
                Ok(latestConfirmedCall::abi_encode_returns(&(self.latest_confirmed,)))
            }
            IRollupCoreCalls::isStaked(call) => {
                Ok(isStakedCall::abi_encode_returns(&(self
                    .stakers
                    .contains_key(&call.staker),)))
            }
            IRollupCoreCalls::stakeToken(_) => {
                Ok(stakeTokenCall::abi_encode_returns(&(STAKE_TOKEN_ADDRESS,)))
            }
            IRollupCoreCalls::bridge(_) => Ok(bridgeCall::abi_encode_returns(&(BRIDGE_ADDRESS,))),
            IRollupCoreCalls::minimumAssertionPeriod(_) => {
                Ok(minimumAssertionPeriodCall::abi_encode_returns(&(U256::from(
                    self.params.minimum_assertion_period,
                ),)))
            }
            IRollupCoreCalls::genesisAssertionHash(_) => {
                Ok(genesisAssertionHashCall::abi_encode_returns(&(self.genesis,)))
            }
            IRollupCoreCalls::rollupDeploymentBlock(_) => {
                Ok(rollupDeploymentBlockCall::abi_encode_returns(&(U256::from(
                    self.deployment_block,
                ),)))
            }
            IRollupCoreCalls::anyTrustFastConfirmer(_) => {
                Ok(anyTrustFastConfirmerCall::abi_encode_returns(&(self.fast_confirmer,)))
            }
            IRollupCoreCalls::computeAssertionHash(call) => {
                Ok(computeAssertionHashCall::abi_encode_returns(&(
                    compute_assertion_hash(call.prevAssertionHash, &call.state, call.inboxAcc),
                )))
            }
            IRollupCoreCalls::newStake(call) => {
                self.add_stake(env, call.tokenAmount, call.withdrawalAddress)?;
                Ok(Vec::new())
            }
            IRollupCoreCalls::newStakeOnNewAssertion(call) => {
                if call.tokenAmount < call.assertion.beforeStateData.configData.requiredStake {
                    return revert("INSUFFICIENT_STAKE");
                }
                self.add_stake(env, call.tokenAmount, call.withdrawalAddress)?;
                self.create_assertion(env, &call.assertion, call.expectedAssertionHash)?;
                Ok(Vec::new())
            }
            IRollupCoreCalls::stakeOnNewAssertion(call) => {
                if !self.stakers.contains_key(&env.from) {
                    return revert("NOT_STAKED");
                }
                self.create_assertion(env, &call.assertion, call.expectedAssertionHash)?;
                Ok(Vec::new())
            }
            IRollupCoreCalls::confirmAssertion(call) => {
                self.confirm_assertion(env, call)?;
                Ok(Vec::new())
            }
            IRollupCoreCalls::fastConfirmAssertion(call) => {
                if env.from != self.fast_confirmer {
                    return revert("NOT_FAST_CONFIRMER");
                }
                let Some(assertion) = self.assertions.get(&call.assertionHash) else {
                    return revert("NOT_PENDING");
                };
                if assertion.node.status != 1 {
                    return revert("NOT_PENDING");
                }
                if call.parentAssertionHash != self.latest_confirmed {
                    return revert("PREV_NOT_LATEST_CONFIRMED");
                }
                if compute_assertion_hash(call.parentAssertionHash, &call.confirmState, call.inboxAcc)
                    != call.assertionHash
                {
                    return revert("CONFIRM_DATA");
                }
                self.mark_confirmed(call.assertionHash, &call.confirmState);
                Ok(Vec::new())
            }
        }
    }

    fn add_stake(&mut self, env: Env, amount: U256, withdrawal: Address) -> Result<(), String> {
        if self.stakers.contains_key(&env.from) {
            return revert("ALREADY_STAKED");
        }
        self.transfer_from(env.from, ROLLUP_ADDRESS, ROLLUP_ADDRESS, amount)?;
        self.stakers.insert(env.from, amount);
        self.withdrawal_addresses.insert(env.from, withdrawal);
        Ok(())
    }

    fn create_assertion(
        &mut self,
        env: Env,
        inputs: &AssertionInputs,
        expected: B256,
    ) -> Result<B256, String> {
        let before = &inputs.beforeStateData;
        let prev_hash = compute_assertion_hash(
            before.prevPrevAssertionHash,
            &inputs.beforeState,
            before.sequencerBatchAcc,
        );
        let Some(prev) = self.assertions.get(&prev_hash).cloned() else {
            return revert("Assertion does not exist");
        };
        if config_hash(&before.configData) != prev.node.configHash {
            return revert("CONFIG_HASH_MISMATCH");
        }
        let batch = inputs.afterState.globalState.u64Vals[0];
        let Some(inbox_acc) = batch
            .checked_sub(1)
            .and_then(|index| self.inbox_accs.get(index as usize))
            .copied()
        else {
            return revert("INBOX_PAST_END");
        };
        let assertion_hash = compute_assertion_hash(prev_hash, &inputs.afterState, inbox_acc);
        if assertion_hash != expected {
            return revert("UNEXPECTED_ASSERTION_HASH");
        }
        if self.assertions.contains_key(&assertion_hash) {
            return revert("Assertion already exists");
        }

        let is_first_child = prev.node.firstChildBlock == 0;
        if !is_first_child
            && env.block_number >= prev.node.firstChildBlock + before.configData.confirmPeriodBlocks
        {
            return revert("Too late to create sibling");
        }
        if let Some(parent) = self.assertions.get_mut(&prev_hash) {
            if is_first_child {
                parent.node.firstChildBlock = env.block_number;
            } else if parent.node.secondChildBlock == 0 {
                parent.node.secondChildBlock = env.block_number;
            }
        }

        let inbox_max_count = self.inbox_accs.len() as u64;
        let config = self.current_config(inbox_max_count);
        self.assertions.insert(
            assertion_hash,
            MockAssertion {
                node: AssertionNode {
                    createdAtBlock: env.block_number,
                    isFirstChild: is_first_child,
                    status: 1,
                    configHash: config_hash(&config),
                    ..Default::default()
                },
                parent: prev_hash,
                after_state: inputs.afterState.clone(),
                creation_parent_block: env.parent_block_number,
            },
        );
        self.emit(
            ROLLUP_ADDRESS,
            IRollupCore::AssertionCreated {
                assertionHash: assertion_hash,
                parentAssertionHash: prev_hash,
                assertion: inputs.clone(),
                afterInboxBatchAcc: inbox_acc,
                inboxMaxCount: U256::from(inbox_max_count),
                wasmModuleRoot: config.wasmModuleRoot,
                requiredStake: config.requiredStake,
                challengeManager: config.challengeManager,
                confirmPeriodBlocks: config.confirmPeriodBlocks,
            }
            .encode_log_data(),
        );
        Ok(assertion_hash)
    }

    fn confirm_assertion(
        &mut self,
        env: Env,
        call: IRollupCore::confirmAssertionCall,
    ) -> Result<(), String> {
        let Some(assertion) = self.assertions.get(&call.assertionHash).cloned() else {
            return revert("NOT_PENDING");
        };
        if assertion.node.status != 1 {
            return revert("NOT_PENDING");
        }
        if call.prevAssertionHash != self.latest_confirmed {
            return revert("PREV_NOT_LATEST_CONFIRMED");
        }
        if compute_assertion_hash(call.prevAssertionHash, &call.confirmState, call.inboxAcc)
            != call.assertionHash
        {
            return revert("CONFIRM_DATA");
        }
        let Some(prev) = self.assertions.get(&call.prevAssertionHash).cloned() else {
            return revert("Assertion does not exist");
        };
        if config_hash(&call.prevConfig) != prev.node.configHash {
            return revert("CONFIG_HASH_MISMATCH");
        }
        if env.block_number < assertion.node.createdAtBlock + call.prevConfig.confirmPeriodBlocks {
            return revert("BEFORE_DEADLINE");
        }
        if prev.node.secondChildBlock > 0 {
            let Some(edge) = self.edges.get(&call.winningEdgeId) else {
                return revert("EdgeNotConfirmed: edge does not exist");
            };
            if edge.status != 1 {
                return revert("EdgeNotConfirmed");
            }
            if edge.level != 0 {
                return revert("EDGE_NOT_BLOCK_TYPE");
            }
            if edge.claimId != call.assertionHash {
                return revert("NOT_WINNER");
            }
            if env.block_number < edge.confirmedAtBlock + self.params.challenge_grace_period_blocks {
                return revert("CHALLENGE_GRACE_PERIOD_NOT_PASSED");
            }
        }
        self.mark_confirmed(call.assertionHash, &call.confirmState);
        Ok(())
    }

    fn mark_confirmed(&mut self, assertion_hash: B256, state: &AssertionState) {
        if let Some(assertion) = self.assertions.get_mut(&assertion_hash) {
            assertion.node.status = 2;
        }
        self.latest_confirmed = assertion_hash;
        self.emit(
            ROLLUP_ADDRESS,
            IRollupCore::AssertionConfirmed {
                assertionHash: assertion_hash,
                blockHash: state.globalState.bytes32Vals[0],
                sendRoot: state.globalState.bytes32Vals[1],
            }
            .encode_log_data(),
        );
    }

    fn bridge(&mut self, input: &[u8]) -> ExecResult {
        match IBridgeCalls::abi_decode(input, true).map_err(bad_calldata)? {
            IBridgeCalls::sequencerInboxAccs(call) => {
                let index: u64 = call.index.try_into().map_err(|_| "index overflow".to_string())?;
                match self.inbox_accs.get(index as usize) {
                    Some(acc) => {
                        Ok(crate::bindings::IBridge::sequencerInboxAccsCall::abi_encode_returns(&(
                            *acc,
                        )))
                    }
                    None => revert("array out-of-bounds access"),
                }
            }
        }
    }

    fn transfer_from(
        &mut self,
        owner: Address,
        to: Address,
        spender: Address,
        amount: U256,
    ) -> Result<(), String> {
        if amount.is_zero() {
            return Ok(());
        }
        let allowance = self
            .allowances
            .get(&(owner, spender))
            .copied()
            .unwrap_or_default();
        if allowance < amount {
            return revert("ERC20: insufficient allowance");
        }
        let balance = self.balances.get(&owner).copied().unwrap_or_default();
        if balance < amount {
            return revert("ERC20: transfer amount exceeds balance");
        }
        if allowance != U256::MAX {
            self.allowances.insert((owner, spender), allowance - amount);
        }
        self.balances.insert(owner, balance - amount);
        *self.balances.entry(to).or_default() += amount;
        Ok(())
    }

    fn token(&mut self, env: Env, input: &[u8]) -> ExecResult {
        use IStakeToken::*;
        match IStakeTokenCalls::abi_decode(input, true).map_err(bad_calldata)? {
            IStakeTokenCalls::balanceOf(call) => {
                let balance = self.balances.get(&call.owner).copied().unwrap_or_default();
                Ok(balanceOfCall::abi_encode_returns(&(balance,)))
            }
            IStakeTokenCalls::allowance(call) => {
                let allowance = self
                    .allowances
                    .get(&(call.owner, call.spender))
                    .copied()
                    .unwrap_or_default();
                Ok(allowanceCall::abi_encode_returns(&(allowance,)))
            }
            IStakeTokenCalls::approve(call) => {
                self.allowances.insert((env.from, call.spender), call.amount);
                Ok(approveCall::abi_encode_returns(&(true,)))
            }
            IStakeTokenCalls::deposit(_) => {
                if env.value.is_zero() {
                    return revert("zero deposit");
                }
                *self.balances.entry(env.from).or_default() += env.value;
                Ok(Vec::new())
            }
        }
    }

    fn one_step_proof(&mut self, input: &[u8]) -> ExecResult {
        match IOneStepProofEntryCalls::abi_decode(input, true).map_err(bad_calldata)? {
            IOneStepProofEntryCalls::proveOneStep(call) => {
                if call.proof.is_empty() {
                    return revert("Invalid one step proof");
                }
                let mut preimage = call.beforeHash.to_vec();
                preimage.extend_from_slice(&call.proof);
                Ok(
                    crate::bindings::IOneStepProofEntry::proveOneStepCall::abi_encode_returns(&(
                        keccak256(preimage),
                    )),
                )
            }
        }
    }

    pub fn safe_tx_hash(&self, to: Address, value: U256, data: &Bytes, nonce: U256) -> B256 {
        keccak256(
            <(
                alloy_sol_types::sol_data::Address,
                alloy_sol_types::sol_data::Uint<256>,
                alloy_sol_types::sol_data::FixedBytes<32>,
                alloy_sol_types::sol_data::Uint<8>,
                alloy_sol_types::sol_data::Uint<256>,
                alloy_sol_types::sol_data::Uint<256>,
                alloy_sol_types::sol_data::Uint<256>,
                alloy_sol_types::sol_data::Address,
                alloy_sol_types::sol_data::Address,
                alloy_sol_types::sol_data::Uint<256>,
            ) as alloy_sol_types::SolType>::abi_encode(&(
                to,
                value,
                keccak256(data),
                0u8,
                U256::ZERO,
                U256::ZERO,
                U256::ZERO,
                Address::ZERO,
                Address::ZERO,
                nonce,
            )),
        )
    }

    fn safe(&mut self, env: Env, input: &[u8]) -> ExecResult {
        use ISafe::*;
        match ISafeCalls::abi_decode(input, true).map_err(bad_calldata)? {
            ISafeCalls::getOwners(_) => Ok(getOwnersCall::abi_encode_returns(&(self.safe_owners.clone(),))),
            ISafeCalls::getThreshold(_) => {
                Ok(getThresholdCall::abi_encode_returns(&(U256::from(self.safe_threshold),)))
            }
            ISafeCalls::nonce(_) => Ok(nonceCall::abi_encode_returns(&(self.safe_nonce,))),
            ISafeCalls::isOwner(call) => {
                Ok(isOwnerCall::abi_encode_returns(&(self.safe_owners.contains(&call.owner),)))
            }
            ISafeCalls::approvedHashes(call) => {
                let approved = self.approved_hashes.contains(&(call.owner, call.hash));
                Ok(approvedHashesCall::abi_encode_returns(&(U256::from(approved as u8),)))
            }
            ISafeCalls::approveHash(call) => {
                if !self.safe_owners.contains(&env.from) {
                    return revert("GS030");
                }
                self.approved_hashes.insert((env.from, call.hashToApprove));
                Ok(Vec::new())
            }
            ISafeCalls::getTransactionHash(call) => {
                Ok(getTransactionHashCall::abi_encode_returns(&(self.safe_tx_hash(
                    call.to,
                    call.value,
                    &call.data,
                    call.safeNonce,
                ),)))
            }
            ISafeCalls::execTransaction(call) => {
                let hash = self.safe_tx_hash(call.to, call.value, &call.data, self.safe_nonce);
                if call.signatures.len() % 65 != 0 {
                    return revert("GS020");
                }
                let mut approvals = 0u64;
                let mut last_owner = Address::ZERO;
                for signature in call.signatures.chunks(65) {
                    let owner = Address::from_slice(&signature[12..32]);
                    if owner <= last_owner {
                        return revert("GS026");
                    }
                    last_owner = owner;
                    let v = signature[64];
                    let approved =
                        owner == env.from || self.approved_hashes.contains(&(owner, hash));
                    if v != 1 || !self.safe_owners.contains(&owner) || !approved {
                        return revert("GS025");
                    }
                    approvals += 1;
                }
                if approvals < self.safe_threshold {
                    return revert("GS020");
                }
                self.safe_nonce += U256::from(1);
                let inner = Env {
                    from: SAFE_ADDRESS,
                    value: call.value,
                    ..env
                };
                self.execute(inner, call.to, &call.data)?;
                Ok(execTransactionCall::abi_encode_returns(&(true,)))
            }
        }
    }
}
